mod alter;
pub mod ddl;
mod table;
mod translate;

pub use alter::{AlterOperation, AlterTable, SchemaDelta};
pub use table::*;
pub use translate::RowTranslator;
pub(crate) use translate::conforms;
