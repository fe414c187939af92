pub mod connection;
pub mod db_schema;

pub use connection::{default_database_path, is_constraint_violation, Database};
