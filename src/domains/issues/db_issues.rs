use crate::domains::issues::entity::{Issue, IssueStatus};
use crate::infrastructure::database::Database;
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

pub trait IssueMethods {
    fn create_issue(&self, issue: &Issue) -> Result<()>;
    fn get_issue(&self, id: &str) -> Result<Option<Issue>>;
    fn list_issues(&self, project_id: &str) -> Result<Vec<Issue>>;
    fn update_issue_status(&self, id: &str, status: IssueStatus) -> Result<()>;
}

fn issue_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issue> {
    Ok(Issue {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        status: row
            .get::<_, String>(3)?
            .parse()
            .unwrap_or(IssueStatus::Open),
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

impl IssueMethods for Database {
    fn create_issue(&self, issue: &Issue) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO issues (id, project_id, title, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                issue.id,
                issue.project_id,
                issue.title,
                issue.status.as_str(),
                issue.created_at.timestamp(),
                issue.updated_at.timestamp(),
            ],
        )
        .with_context(|| format!("failed to insert issue {}", issue.id))?;
        Ok(())
    }

    fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        let conn = self.get_conn()?;
        let issue = conn
            .query_row(
                "SELECT id, project_id, title, status, created_at, updated_at
                 FROM issues WHERE id = ?1",
                params![id],
                issue_from_row,
            )
            .optional()?;
        Ok(issue)
    }

    fn list_issues(&self, project_id: &str) -> Result<Vec<Issue>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, title, status, created_at, updated_at
             FROM issues WHERE project_id = ?1 ORDER BY created_at",
        )?;
        let issues = stmt
            .query_map(params![project_id], issue_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(issues)
    }

    fn update_issue_status(&self, id: &str, status: IssueStatus) -> Result<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE issues SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().timestamp(), id],
        )?;
        if updated == 0 {
            anyhow::bail!("issue {id} not found");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::projects::ProjectMethods;
    use std::path::Path;

    #[test]
    fn issue_status_updates_persist() {
        let db = Database::new_in_memory().unwrap();
        let project = db
            .get_or_create_project(Path::new("/work/widgets"), None)
            .unwrap();
        let issue = Issue::new(&project.id, "Add login");
        db.create_issue(&issue).unwrap();

        db.update_issue_status(&issue.id, IssueStatus::InProgress)
            .unwrap();

        let stored = db.get_issue(&issue.id).unwrap().unwrap();
        assert_eq!(stored.status, IssueStatus::InProgress);
        assert_eq!(db.list_issues(&project.id).unwrap().len(), 1);
    }

    #[test]
    fn updating_unknown_issue_fails() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.update_issue_status("ghost", IssueStatus::Done).is_err());
    }
}
