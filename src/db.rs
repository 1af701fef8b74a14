use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Result, Row};

use crate::settings::{Settings, SETTINGS};
use crate::tasks::{SortDir, Task, TaskField, TaskState};

const TASK_COLUMNS: &str = "id, name, state, error, worker, execution_time, queued_at, started_at, finished_at, args, kwargs, return_value";

/// Filter/sort/pagination for the task list query. Sort keys combine in
/// runtime → startedAt → queuedAt order; with none given, most recently
/// queued first.
#[derive(Debug, Default)]
pub struct TaskListQuery {
    pub name: Option<String>,
    pub state: Option<TaskState>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub sort_by_runtime: Option<SortDir>,
    pub sort_by_started_at: Option<SortDir>,
    pub sort_by_queued_at: Option<SortDir>,
    pub limit: i64,
    pub offset: i64,
}

pub struct Database {
    conn: Connection,
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn task_from_row(row: &Row) -> Result<Task> {
    let state_str: String = row.get(2)?;
    let state = TaskState::parse(&state_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(2, "state".to_string(), rusqlite::types::Type::Text)
    })?;
    let args: String = row.get(9)?;
    let kwargs: String = row.get(10)?;
    let return_value: Option<String> = row.get(11)?;

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        state,
        error: row.get(3)?,
        worker: row.get(4)?,
        execution_time: row.get(5)?,
        queued_at: from_millis(row.get(6)?),
        started_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        finished_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
        args: serde_json::from_str(&args).unwrap_or_default(),
        kwargs: serde_json::from_str(&kwargs).unwrap_or_default(),
        return_value: return_value.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

impl Database {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                error TEXT,
                worker TEXT,
                execution_time REAL,
                queued_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                args TEXT NOT NULL,
                kwargs TEXT NOT NULL,
                return_value TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
            CREATE INDEX IF NOT EXISTS idx_tasks_queued_at ON tasks(queued_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_started_at ON tasks(started_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_finished_at ON tasks(finished_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_execution_time ON tasks(execution_time);
            CREATE INDEX IF NOT EXISTS idx_tasks_name ON tasks(name COLLATE NOCASE);
            CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(worker COLLATE NOCASE);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value INTEGER
            );
        "#)?;

        let db = Database { conn };
        db.seed_default_settings()?;
        Ok(db)
    }

    /// Insert the candidate row, or if a row with this id already exists,
    /// overwrite only the columns listed in `on_conflict`. An empty list means
    /// the insert is a no-op on conflict. A duplicate id racing with a
    /// concurrent first-seen event resolves inside SQLite, not here.
    pub fn upsert_task(&self, task: &Task, on_conflict: &[TaskField]) -> Result<()> {
        let conflict_clause = if on_conflict.is_empty() {
            "ON CONFLICT(id) DO NOTHING".to_string()
        } else {
            let sets: Vec<String> = on_conflict
                .iter()
                .map(|f| format!("{col} = excluded.{col}", col = f.column()))
                .collect();
            format!("ON CONFLICT(id) DO UPDATE SET {}", sets.join(", "))
        };

        let sql = format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) {conflict_clause}"
        );

        self.conn.execute(
            &sql,
            params![
                task.id,
                task.name,
                task.state.as_str(),
                task.error,
                task.worker,
                task.execution_time,
                to_millis(task.queued_at),
                task.started_at.map(to_millis),
                task.finished_at.map(to_millis),
                serde_json::to_string(&task.args).unwrap_or_default(),
                serde_json::to_string(&task.kwargs).unwrap_or_default(),
                task.return_value
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
            ],
        )?;
        Ok(())
    }

    /// Compare-and-swap: queued → running. Zero rows affected when the task is
    /// already past `queued` (a late start notification must not regress a
    /// terminal state).
    pub fn promote_to_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<usize> {
        self.conn.execute(
            "UPDATE tasks SET state = 'running', started_at = ?1 WHERE id = ?2 AND state = 'queued'",
            params![to_millis(started_at), id],
        )
    }

    /// Bulk CAS used at shutdown: every task still `running` becomes
    /// `abandoned`. Returns how many rows transitioned.
    pub fn set_abandoned(&self) -> Result<usize> {
        self.conn.execute(
            "UPDATE tasks SET state = 'abandoned' WHERE state = 'running'",
            [],
        )
    }

    /// Delete tasks queued at or before `now - ttl_minutes`. The caller must
    /// pass a positive TTL; a null/unset TTL means retain everything.
    pub fn delete_old(&self, ttl_minutes: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::minutes(ttl_minutes);
        self.conn.execute(
            "DELETE FROM tasks WHERE queued_at <= ?1",
            params![to_millis(cutoff)],
        )
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(task_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_tasks(&self, q: &TaskListQuery) -> Result<(Vec<Task>, i64)> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(name) = &q.name {
            // SQLite LIKE is already case-insensitive for ASCII
            conditions.push("name LIKE ?");
            values.push(SqlValue::Text(format!("%{}%", name)));
        }
        if let Some(state) = q.state {
            conditions.push("state = ?");
            values.push(SqlValue::Text(state.as_str().to_string()));
        }
        if let Some(t) = q.started_after {
            conditions.push("started_at >= ?");
            values.push(SqlValue::Integer(to_millis(t)));
        }
        if let Some(t) = q.started_before {
            conditions.push("started_at <= ?");
            values.push(SqlValue::Integer(to_millis(t)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM tasks{where_clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut order: Vec<String> = Vec::new();
        if let Some(dir) = q.sort_by_runtime {
            order.push(format!("execution_time {}", dir.sql()));
        }
        if let Some(dir) = q.sort_by_started_at {
            order.push(format!("started_at {}", dir.sql()));
        }
        if let Some(dir) = q.sort_by_queued_at {
            order.push(format!("queued_at {}", dir.sql()));
        }
        if order.is_empty() {
            order.push("queued_at DESC".to_string());
        }

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks{where_clause} ORDER BY {} LIMIT ? OFFSET ?",
            order.join(", ")
        );
        values.push(SqlValue::Integer(q.limit));
        values.push(SqlValue::Integer(q.offset));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), task_from_row)?;

        let mut tasks = Vec::new();
        for task in rows {
            tasks.push(task?);
        }
        Ok((tasks, count))
    }

    // ========== Settings ==========

    /// Idempotent: only inserts keys that are not present yet.
    pub fn seed_default_settings(&self) -> Result<()> {
        for spec in SETTINGS {
            self.conn.execute(
                "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
                params![spec.key.as_str(), spec.default],
            )?;
        }
        Ok(())
    }

    pub fn get_settings(&self) -> Result<Settings> {
        let mut out = Settings::default();
        let mut stmt = self.conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            if let Some(spec) = SETTINGS.iter().find(|s| s.key.as_str() == key) {
                out.set(spec.key, value);
            }
        }
        Ok(out)
    }

    pub fn set_settings(&self, settings: &Settings) -> Result<()> {
        for spec in SETTINGS {
            self.conn.execute(
                "UPDATE settings SET value = ?1 WHERE key = ?2",
                params![settings.get(spec.key), spec.key.as_str()],
            )?;
        }
        Ok(())
    }

    // ========== Maintenance ==========

    /// Consistent full snapshot for the backup endpoint.
    pub fn backup_to(&self, path: &str) -> Result<()> {
        let mut dst = Connection::open(path)?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dst)?;
        backup.run_to_completion(64, std::time::Duration::from_millis(5), None)?;
        Ok(())
    }
}
