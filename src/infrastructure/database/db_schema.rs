use super::connection::Database;
use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn initialize_schema(db: &Database) -> Result<()> {
    let conn = db.get_conn()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            path TEXT NOT NULL UNIQUE,
            base_branch TEXT NOT NULL DEFAULT 'main',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS issues (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',  -- 'open', 'in_progress', 'done', 'closed'
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY(project_id) REFERENCES projects(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_issues_project ON issues(project_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            issue_id TEXT,
            branch TEXT NOT NULL,
            worktree_path TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,  -- 'active', 'idle', 'completed', 'abandoned'
            outcome TEXT NOT NULL DEFAULT '',
            conflict_state TEXT NOT NULL DEFAULT 'none',
            conflict_files TEXT NOT NULL DEFAULT '[]',
            last_commit_hash TEXT NOT NULL DEFAULT '',
            last_commit_message TEXT NOT NULL DEFAULT '',
            commit_count INTEGER NOT NULL DEFAULT 0,
            is_dirty BOOLEAN NOT NULL DEFAULT FALSE,
            ahead_count INTEGER NOT NULL DEFAULT 0,
            behind_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT NOT NULL DEFAULT '',
            discovered BOOLEAN NOT NULL DEFAULT FALSE,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            last_active_at INTEGER,
            last_sync_at INTEGER,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY(project_id) REFERENCES projects(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_project_branch ON sessions(project_id, branch)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_worktree ON sessions(worktree_path)",
        [],
    )?;

    apply_sessions_migrations(&conn)?;

    // At most one live session per (project, branch); concurrent launches race on this index.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_live_branch
         ON sessions(project_id, branch)
         WHERE status IN ('active', 'idle')",
        [],
    )
    .context("failed to create live session uniqueness index")?;

    Ok(())
}

fn apply_sessions_migrations(conn: &Connection) -> Result<()> {
    // Columns added after the first release of the sessions table
    let additions = [
        ("outcome", "TEXT NOT NULL DEFAULT ''"),
        ("last_error", "TEXT NOT NULL DEFAULT ''"),
        ("discovered", "BOOLEAN NOT NULL DEFAULT FALSE"),
    ];

    for (column, definition) in additions {
        if !column_exists(conn, "sessions", column)? {
            log::info!("Migrating sessions table: adding column {column}");
            conn.execute(
                &format!("ALTER TABLE sessions ADD COLUMN {column} {definition}"),
                [],
            )?;
        }
    }

    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}
