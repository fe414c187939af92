pub mod domains;
pub mod infrastructure;
