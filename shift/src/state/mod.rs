mod record;
mod status;
mod writer;

pub use record::{MigrationProgress, MigrationRecord};
pub use status::MigrationStatus;
pub use writer::RecordWriter;
