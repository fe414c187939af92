use crate::domains::sessions::entity::{
    ConflictState, GitSnapshot, Session, SessionFilter, SessionStatus,
};
use crate::infrastructure::database::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, ToSql};
use std::path::PathBuf;

/// A status change applied only when the current status is one of the expected values.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub status: SessionStatus,
    // Written verbatim; `None` clears the column
    pub ended_at: Option<DateTime<Utc>>,
    // Left untouched when `None`
    pub last_active_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

impl StatusChange {
    pub fn to(status: SessionStatus) -> Self {
        Self {
            status,
            ended_at: None,
            last_active_at: None,
            outcome: None,
        }
    }

    pub fn ended(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(at);
        self
    }

    pub fn touched(mut self, at: DateTime<Utc>) -> Self {
        self.last_active_at = Some(at);
        self
    }

    pub fn with_outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }
}

pub trait SessionMethods {
    fn create_session(&self, session: &Session) -> Result<()>;
    fn get_session(&self, id: &str) -> Result<Option<Session>>;
    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>>;
    fn find_live_session(&self, project_id: &str, branch: &str) -> Result<Option<Session>>;
    fn list_sessions_by_worktree_paths(&self, paths: &[PathBuf]) -> Result<Vec<Session>>;
    fn transition_session(
        &self,
        id: &str,
        expected: &[SessionStatus],
        change: &StatusChange,
    ) -> Result<bool>;
    fn update_conflict_state(
        &self,
        id: &str,
        state: ConflictState,
        files: &[String],
        last_error: &str,
    ) -> Result<()>;
    fn record_sync(
        &self,
        id: &str,
        ahead: u32,
        behind: u32,
        synced_at: DateTime<Utc>,
    ) -> Result<()>;
    fn update_git_snapshot(&self, id: &str, snapshot: &GitSnapshot) -> Result<()>;
    fn clear_worktree_path(&self, id: &str) -> Result<()>;
    fn delete_stale_sessions(
        &self,
        project_id: Option<&str>,
        branch: Option<&str>,
        max_lifetime_secs: i64,
    ) -> Result<usize>;
}

const SESSION_COLUMNS: &str = "id, project_id, issue_id, branch, worktree_path, status, outcome,
    conflict_state, conflict_files, last_commit_hash, last_commit_message, commit_count,
    is_dirty, ahead_count, behind_count, last_error, discovered,
    started_at, ended_at, last_active_at, last_sync_at, updated_at";

fn timestamp(value: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(value, 0).single().unwrap_or_default()
}

fn optional_timestamp(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let conflict_files: String = row.get(8)?;
    Ok(Session {
        id: row.get(0)?,
        project_id: row.get(1)?,
        issue_id: row
            .get::<_, Option<String>>(2)?
            .filter(|id| !id.is_empty()),
        branch: row.get(3)?,
        worktree_path: PathBuf::from(row.get::<_, String>(4)?),
        status: row
            .get::<_, String>(5)?
            .parse()
            .unwrap_or(SessionStatus::Abandoned),
        outcome: row.get(6)?,
        conflict_state: row
            .get::<_, String>(7)?
            .parse()
            .unwrap_or_default(),
        conflict_files: serde_json::from_str(&conflict_files).unwrap_or_default(),
        last_commit_hash: row.get(9)?,
        last_commit_message: row.get(10)?,
        commit_count: row.get(11)?,
        is_dirty: row.get(12)?,
        ahead_count: row.get(13)?,
        behind_count: row.get(14)?,
        last_error: row.get(15)?,
        discovered: row.get(16)?,
        started_at: timestamp(row.get(17)?),
        ended_at: optional_timestamp(row.get(18)?),
        last_active_at: optional_timestamp(row.get(19)?),
        last_sync_at: optional_timestamp(row.get(20)?),
        updated_at: timestamp(row.get(21)?),
    })
}

fn status_placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SessionMethods for Database {
    fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.get_conn()?;
        let conflict_files = serde_json::to_string(&session.conflict_files)?;

        conn.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
            ),
            params![
                session.id,
                session.project_id,
                session.issue_id,
                session.branch,
                session.worktree_path.to_string_lossy(),
                session.status.as_str(),
                session.outcome,
                session.conflict_state.as_str(),
                conflict_files,
                session.last_commit_hash,
                session.last_commit_message,
                session.commit_count,
                session.is_dirty,
                session.ahead_count,
                session.behind_count,
                session.last_error,
                session.discovered,
                session.started_at.timestamp(),
                session.ended_at.map(|ts| ts.timestamp()),
                session.last_active_at.map(|ts| ts.timestamp()),
                session.last_sync_at.map(|ts| ts.timestamp()),
                session.updated_at.timestamp(),
            ],
        )
        .with_context(|| {
            format!(
                "failed to insert session for branch '{}' in project {}",
                session.branch, session.project_id
            )
        })?;

        Ok(())
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.get_conn()?;
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let conn = self.get_conn()?;

        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(project_id) = &filter.project_id {
            values.push(project_id.clone());
            clauses.push(format!("project_id = ?{}", values.len()));
        }

        if let Some(statuses) = &filter.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            let start = values.len() + 1;
            values.extend(statuses.iter().map(|s| s.as_str().to_string()));
            clauses.push(format!(
                "status IN ({})",
                status_placeholders(start, statuses.len())
            ));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions {where_clause} ORDER BY started_at DESC, id DESC"
        ))?;
        let sessions = stmt
            .query_map(params_from_iter(values.iter()), session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(sessions)
    }

    fn find_live_session(&self, project_id: &str, branch: &str) -> Result<Option<Session>> {
        let conn = self.get_conn()?;
        let session = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE project_id = ?1 AND branch = ?2 AND status IN ('active', 'idle')"
                ),
                params![project_id, branch],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn list_sessions_by_worktree_paths(&self, paths: &[PathBuf]) -> Result<Vec<Session>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.get_conn()?;
        let values: Vec<String> = paths
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE worktree_path IN ({})",
            status_placeholders(1, values.len())
        ))?;
        let sessions = stmt
            .query_map(params_from_iter(values.iter()), session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    fn transition_session(
        &self,
        id: &str,
        expected: &[SessionStatus],
        change: &StatusChange,
    ) -> Result<bool> {
        if expected.is_empty() {
            return Ok(false);
        }

        let conn = self.get_conn()?;
        let status = change.status.as_str();
        let ended_at = change.ended_at.map(|ts| ts.timestamp());
        let last_active_at = change.last_active_at.map(|ts| ts.timestamp());
        let now = Utc::now().timestamp();
        let expected_values: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();

        let outcome = change.outcome.as_deref();
        let mut bound: Vec<&dyn ToSql> =
            vec![&status, &ended_at, &last_active_at, &now, &id, &outcome];
        for value in &expected_values {
            bound.push(value);
        }

        let updated = conn
            .execute(
                &format!(
                    "UPDATE sessions
                     SET status = ?1, ended_at = ?2,
                         last_active_at = COALESCE(?3, last_active_at), updated_at = ?4,
                         outcome = COALESCE(?6, outcome)
                     WHERE id = ?5 AND status IN ({})",
                    status_placeholders(7, expected_values.len())
                ),
                bound.as_slice(),
            )
            .with_context(|| format!("failed to move session {id} to {status}"))?;

        Ok(updated > 0)
    }

    fn update_conflict_state(
        &self,
        id: &str,
        state: ConflictState,
        files: &[String],
        last_error: &str,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions
             SET conflict_state = ?1, conflict_files = ?2, last_error = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                state.as_str(),
                serde_json::to_string(files)?,
                last_error,
                Utc::now().timestamp(),
                id
            ],
        )?;
        Ok(())
    }

    fn record_sync(
        &self,
        id: &str,
        ahead: u32,
        behind: u32,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions
             SET ahead_count = ?1, behind_count = ?2, last_sync_at = ?3, updated_at = ?3
             WHERE id = ?4",
            params![ahead, behind, synced_at.timestamp(), id],
        )?;
        Ok(())
    }

    fn update_git_snapshot(&self, id: &str, snapshot: &GitSnapshot) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions
             SET last_commit_hash = ?1, last_commit_message = ?2, commit_count = ?3,
                 is_dirty = ?4, ahead_count = ?5, behind_count = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                snapshot.last_commit_hash,
                snapshot.last_commit_message,
                snapshot.commit_count,
                snapshot.is_dirty,
                snapshot.ahead_count,
                snapshot.behind_count,
                Utc::now().timestamp(),
                id
            ],
        )?;
        Ok(())
    }

    fn clear_worktree_path(&self, id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions SET worktree_path = '', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().timestamp(), id],
        )?;
        Ok(())
    }

    fn delete_stale_sessions(
        &self,
        project_id: Option<&str>,
        branch: Option<&str>,
        max_lifetime_secs: i64,
    ) -> Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM sessions
             WHERE status IN ('completed', 'abandoned')
               AND commit_count = 0
               AND ended_at IS NOT NULL
               AND (ended_at - started_at) < ?1
               AND (?2 IS NULL OR project_id = ?2)
               AND (?3 IS NULL OR branch = ?3)",
            params![max_lifetime_secs, project_id, branch],
        )?;

        if deleted > 0 {
            log::info!(
                "Purged {deleted} stale session(s) (project={project_id:?}, branch={branch:?})"
            );
        }

        Ok(deleted)
    }
}
