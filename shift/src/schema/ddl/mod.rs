//! Parsing of the MySQL flavoured `ALTER TABLE` and `CREATE TABLE` statements accepted by the
//! engine.

mod lexer;
mod parser;

pub use parser::{parse_alter_table, parse_create_table};
