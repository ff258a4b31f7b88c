//! SQLite storage for trace runs, behind an r2d2 connection pool.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Result as SqliteResult;
use std::path::Path;

pub type DbConn = PooledConnection<SqliteConnectionManager>;

pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn new(database_url: &str) -> Result<Self, String> {
        let (manager, max_size) = if database_url == ":memory:" {
            // One shared connection; a bigger pool would hand out separate
            // empty in-memory databases.
            (SqliteConnectionManager::memory(), 1)
        } else {
            if let Some(parent) = Path::new(database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| format!("Failed to create database directory: {}", e))?;
                }
            }
            (SqliteConnectionManager::file(database_url), 8)
        };

        let manager = manager.with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });

        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| format!("Failed to create connection pool: {}", e))?;

        let db = Self { pool };
        db.create_tables()
            .map_err(|e| format!("Failed to create tables: {}", e))?;
        Ok(db)
    }

    pub fn conn(&self) -> DbConn {
        self.pool.get().expect("Failed to get database connection")
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pipeline_runs (
                run_id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                pipeline_version TEXT NOT NULL DEFAULT '1.0.0',
                success INTEGER NOT NULL DEFAULT 1,
                error TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                total_duration_ms REAL,
                context TEXT NOT NULL DEFAULT '{}',
                tags TEXT NOT NULL DEFAULT '[]',
                final_output TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS step_traces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                step_name TEXT NOT NULL,
                step_type TEXT NOT NULL,
                duration_ms REAL,
                timestamp TEXT NOT NULL,
                input_count INTEGER NOT NULL DEFAULT 0,
                output_count INTEGER NOT NULL DEFAULT 0,
                reduction_rate REAL NOT NULL DEFAULT 0.0,
                inputs TEXT NOT NULL DEFAULT '{}',
                outputs TEXT NOT NULL DEFAULT '{}',
                input_candidates TEXT NOT NULL DEFAULT '[]',
                output_candidates TEXT NOT NULL DEFAULT '[]',
                decisions TEXT NOT NULL DEFAULT '[]',
                step_metadata TEXT NOT NULL DEFAULT '{}',
                sample_rate REAL NOT NULL DEFAULT 1.0,
                FOREIGN KEY (run_id) REFERENCES pipeline_runs(run_id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_pipeline_created
             ON pipeline_runs(pipeline_name, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_pipeline_success
             ON pipeline_runs(pipeline_name, success)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_created ON pipeline_runs(created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_steps_run ON step_traces(run_id, seq)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_steps_type_reduction
             ON step_traces(step_type, reduction_rate)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_steps_name_duration
             ON step_traces(step_name, duration_ms)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_steps_timestamp ON step_traces(timestamp DESC)",
            [],
        )?;

        Ok(())
    }
}
