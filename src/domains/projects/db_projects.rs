use crate::domains::projects::entity::Project;
use crate::infrastructure::database::Database;
use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::path::{Path, PathBuf};

pub trait ProjectMethods {
    fn create_project(&self, project: &Project) -> Result<()>;
    fn get_project(&self, id: &str) -> Result<Option<Project>>;
    fn get_project_by_path(&self, path: &Path) -> Result<Option<Project>>;
    fn list_projects(&self) -> Result<Vec<Project>>;
    fn get_or_create_project(&self, path: &Path, base_branch: Option<&str>) -> Result<Project>;
}

const PROJECT_COLUMNS: &str = "id, name, path, base_branch, created_at, updated_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        base_branch: row.get(3)?,
        created_at: Utc
            .timestamp_opt(row.get(4)?, 0)
            .single()
            .unwrap_or_default(),
        updated_at: Utc
            .timestamp_opt(row.get(5)?, 0)
            .single()
            .unwrap_or_default(),
    })
}

impl ProjectMethods for Database {
    fn create_project(&self, project: &Project) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO projects (id, name, path, base_branch, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project.id,
                project.name,
                project.path.to_string_lossy(),
                project.base_branch,
                project.created_at.timestamp(),
                project.updated_at.timestamp(),
            ],
        )
        .with_context(|| format!("failed to insert project {}", project.path.display()))?;
        Ok(())
    }

    fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.get_conn()?;
        let project = conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    fn get_project_by_path(&self, path: &Path) -> Result<Option<Project>> {
        let conn = self.get_conn()?;
        let project = conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE path = ?1"),
                params![path.to_string_lossy()],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name"))?;
        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    fn get_or_create_project(&self, path: &Path, base_branch: Option<&str>) -> Result<Project> {
        if let Some(existing) = self.get_project_by_path(path)? {
            return Ok(existing);
        }

        let project = Project::new(path.to_path_buf(), base_branch);
        match self.create_project(&project) {
            Ok(()) => {
                log::info!(
                    "Registered project '{}' at {}",
                    project.name,
                    project.path.display()
                );
                Ok(project)
            }
            // Lost a registration race; the winner's row is authoritative
            Err(err) => self
                .get_project_by_path(path)?
                .ok_or_else(|| anyhow!("failed to register project: {err}")),
        }
    }
}
