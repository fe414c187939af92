pub mod db_projects;
pub mod entity;

pub use db_projects::ProjectMethods;
pub use entity::{Project, DEFAULT_BASE_BRANCH};
