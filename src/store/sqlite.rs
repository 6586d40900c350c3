//! SQLite-backed resource store.
//!
//! Tables:
//! - `todo_lists`: id, owner_id, name, is_system, created_at, deleted_at
//! - `tasks`: id, owner_id, todo_list_id, description, completed, created_at, deleted_at
//! - `steps`: id, task_id, description, completed, position, created_at, deleted_at
//! - `shares`: (kind, resource_id, shared_with_id) primary key, role, created_at
//!
//! All access goes through one connection behind a mutex, so a share lookup
//! never interleaves with a share write.

use super::{
    Resource, ResourceKind, ResourceStore, Share, SharedResource, Step, Task, TodoList,
};
use crate::access::ShareRole;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS todo_lists (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        name TEXT NOT NULL,
        is_system INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        deleted_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_lists_owner ON todo_lists(owner_id);

    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        todo_list_id TEXT REFERENCES todo_lists(id) ON DELETE CASCADE,
        description TEXT NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        deleted_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_list ON tasks(todo_list_id);

    CREATE TABLE IF NOT EXISTS steps (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        description TEXT NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0,
        position INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        deleted_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_steps_task ON steps(task_id, position);

    CREATE TABLE IF NOT EXISTS shares (
        kind TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        shared_with_id TEXT NOT NULL,
        role TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (kind, resource_id, shared_with_id)
    );
    CREATE INDEX IF NOT EXISTS idx_shares_grantee ON shares(shared_with_id);";

const LIST_COLUMNS: &str = "l.id, l.owner_id, l.name, l.is_system, l.created_at, l.deleted_at";

const TASK_COLUMNS: &str =
    "t.id, t.owner_id, t.todo_list_id, t.description, t.completed, t.created_at, t.deleted_at";

const STEP_COLUMNS: &str =
    "st.id, st.task_id, st.description, st.completed, st.position, st.created_at, st.deleted_at";

const SHARE_COLUMNS: &str = "s.kind, s.resource_id, s.shared_with_id, s.role, s.created_at";

/// SQLite-backed [`ResourceStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        Self::init(conn)
    }

    /// Throwaway in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialise resource schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn find_live(&self, kind: ResourceKind, id: &str) -> Result<Option<Resource>> {
        let conn = self.conn.lock();
        let found = match kind {
            ResourceKind::List => conn
                .query_row(
                    &format!(
                        "SELECT {LIST_COLUMNS} FROM todo_lists l
                         WHERE l.id = ?1 AND l.deleted_at IS NULL"
                    ),
                    params![id],
                    list_from_row,
                )
                .optional()?
                .map(Resource::List),
            ResourceKind::Task => conn
                .query_row(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks t
                         WHERE t.id = ?1 AND t.deleted_at IS NULL"
                    ),
                    params![id],
                    task_from_row,
                )
                .optional()?
                .map(Resource::Task),
        };
        Ok(found)
    }

    async fn find_deleted_owned(
        &self,
        kind: ResourceKind,
        id: &str,
        owner_id: &str,
    ) -> Result<Option<Resource>> {
        let conn = self.conn.lock();
        let found = match kind {
            ResourceKind::List => conn
                .query_row(
                    &format!(
                        "SELECT {LIST_COLUMNS} FROM todo_lists l
                         WHERE l.id = ?1 AND l.owner_id = ?2 AND l.deleted_at IS NOT NULL"
                    ),
                    params![id, owner_id],
                    list_from_row,
                )
                .optional()?
                .map(Resource::List),
            ResourceKind::Task => conn
                .query_row(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks t
                         WHERE t.id = ?1 AND t.deleted_at IS NOT NULL
                           AND COALESCE(
                               (SELECT l.owner_id FROM todo_lists l WHERE l.id = t.todo_list_id),
                               t.owner_id
                           ) = ?2"
                    ),
                    params![id, owner_id],
                    task_from_row,
                )
                .optional()?
                .map(Resource::Task),
        };
        Ok(found)
    }

    async fn list_owner(&self, list_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let owner = conn
            .query_row(
                "SELECT owner_id FROM todo_lists WHERE id = ?1",
                params![list_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    async fn find_share(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        principal_id: &str,
    ) -> Result<Option<Share>> {
        let conn = self.conn.lock();
        let share = conn
            .query_row(
                &format!(
                    "SELECT {SHARE_COLUMNS} FROM shares s
                     WHERE s.kind = ?1 AND s.resource_id = ?2 AND s.shared_with_id = ?3
                       AND EXISTS (
                           SELECT 1 FROM {table} r
                           WHERE r.id = s.resource_id AND r.deleted_at IS NULL
                       )",
                    table = table_for(kind),
                ),
                params![kind.as_str(), resource_id, principal_id],
                share_from_row,
            )
            .optional()?;
        Ok(share)
    }

    async fn create_share(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        grantee_id: &str,
        role: ShareRole,
    ) -> Result<Option<Share>> {
        let now = epoch_millis();
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO shares (kind, resource_id, shared_with_id, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![kind.as_str(), resource_id, grantee_id, role.as_str(), now],
        );

        match result {
            Ok(_) => Ok(Some(Share {
                kind,
                resource_id: resource_id.to_string(),
                shared_with_id: grantee_id.to_string(),
                role,
                created_at: from_millis(now),
            })),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_share(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        grantee_id: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM shares WHERE kind = ?1 AND resource_id = ?2 AND shared_with_id = ?3",
            params![kind.as_str(), resource_id, grantee_id],
        )?;
        Ok(deleted > 0)
    }

    async fn update_share_role(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        grantee_id: &str,
        role: ShareRole,
    ) -> Result<Option<Share>> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE shares SET role = ?4
             WHERE kind = ?1 AND resource_id = ?2 AND shared_with_id = ?3",
            params![kind.as_str(), resource_id, grantee_id, role.as_str()],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let share = conn
            .query_row(
                &format!(
                    "SELECT {SHARE_COLUMNS} FROM shares s
                     WHERE s.kind = ?1 AND s.resource_id = ?2 AND s.shared_with_id = ?3"
                ),
                params![kind.as_str(), resource_id, grantee_id],
                share_from_row,
            )
            .optional()?;
        Ok(share)
    }

    async fn list_shares(&self, kind: ResourceKind, resource_id: &str) -> Result<Vec<Share>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SHARE_COLUMNS} FROM shares s
             WHERE s.kind = ?1 AND s.resource_id = ?2
             ORDER BY s.created_at ASC, s.shared_with_id ASC"
        ))?;
        let shares = stmt
            .query_map(params![kind.as_str(), resource_id], share_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(shares)
    }

    async fn shared_with(&self, principal_id: &str) -> Result<Vec<SharedResource>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {LIST_COLUMNS}, s.role FROM shares s
             JOIN todo_lists l ON l.id = s.resource_id
             WHERE s.kind = 'list' AND s.shared_with_id = ?1 AND l.deleted_at IS NULL
             ORDER BY s.created_at ASC"
        ))?;
        let mut shared = stmt
            .query_map(params![principal_id], |row| {
                Ok(SharedResource {
                    resource: Resource::List(list_from_row(row)?),
                    role: role_at(row, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS}, s.role FROM shares s
             JOIN tasks t ON t.id = s.resource_id
             WHERE s.kind = 'task' AND s.shared_with_id = ?1 AND t.deleted_at IS NULL
             ORDER BY s.created_at ASC"
        ))?;
        let tasks = stmt
            .query_map(params![principal_id], |row| {
                Ok(SharedResource {
                    resource: Resource::Task(task_from_row(row)?),
                    role: role_at(row, 7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        shared.extend(tasks);
        Ok(shared)
    }

    async fn insert_list(&self, owner_id: &str, name: &str, is_system: bool) -> Result<TodoList> {
        let list = TodoList {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            is_system,
            created_at: from_millis(epoch_millis()),
            deleted_at: None,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO todo_lists (id, owner_id, name, is_system, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                list.id,
                list.owner_id,
                list.name,
                list.is_system,
                list.created_at.timestamp_millis(),
            ],
        )?;
        Ok(list)
    }

    async fn insert_task(
        &self,
        owner_id: &str,
        todo_list_id: Option<&str>,
        description: &str,
    ) -> Result<Task> {
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            todo_list_id: todo_list_id.map(str::to_string),
            description: description.to_string(),
            completed: false,
            created_at: from_millis(epoch_millis()),
            deleted_at: None,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks (id, owner_id, todo_list_id, description, completed, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                task.id,
                task.owner_id,
                task.todo_list_id,
                task.description,
                task.created_at.timestamp_millis(),
            ],
        )?;
        Ok(task)
    }

    async fn rename_list(&self, id: &str, name: &str) -> Result<Option<TodoList>> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE todo_lists SET name = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, name],
        )?;
        let list = conn
            .query_row(
                &format!(
                    "SELECT {LIST_COLUMNS} FROM todo_lists l
                     WHERE l.id = ?1 AND l.deleted_at IS NULL"
                ),
                params![id],
                list_from_row,
            )
            .optional()?;
        Ok(list)
    }

    async fn update_task(
        &self,
        id: &str,
        description: Option<&str>,
        completed: Option<bool>,
    ) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks
             SET description = COALESCE(?2, description),
                 completed = COALESCE(?3, completed)
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id, description, completed],
        )?;
        let task = conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t
                     WHERE t.id = ?1 AND t.deleted_at IS NULL"
                ),
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    async fn lists_owned_by(&self, owner_id: &str) -> Result<Vec<TodoList>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LIST_COLUMNS} FROM todo_lists l
             WHERE l.owner_id = ?1 AND l.deleted_at IS NULL
             ORDER BY l.created_at ASC"
        ))?;
        let lists = stmt
            .query_map(params![owner_id], list_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lists)
    }

    async fn tasks_in_list(&self, list_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t
             WHERE t.todo_list_id = ?1 AND t.deleted_at IS NULL
             ORDER BY t.created_at ASC"
        ))?;
        let tasks = stmt
            .query_map(params![list_id], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    async fn find_system_list(&self, owner_id: &str) -> Result<Option<TodoList>> {
        let conn = self.conn.lock();
        let list = conn
            .query_row(
                &format!(
                    "SELECT {LIST_COLUMNS} FROM todo_lists l
                     WHERE l.owner_id = ?1 AND l.is_system = 1 AND l.deleted_at IS NULL
                     ORDER BY l.created_at ASC LIMIT 1"
                ),
                params![owner_id],
                list_from_row,
            )
            .optional()?;
        Ok(list)
    }

    async fn soft_delete(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                table_for(kind)
            ),
            params![id, epoch_millis()],
        )?;
        Ok(changed > 0)
    }

    async fn restore(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET deleted_at = NULL WHERE id = ?1 AND deleted_at IS NOT NULL",
                table_for(kind)
            ),
            params![id],
        )?;
        Ok(changed > 0)
    }

    async fn purge(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if kind == ResourceKind::List {
            tx.execute(
                "DELETE FROM steps
                 WHERE task_id IN (SELECT id FROM tasks WHERE todo_list_id = ?1)",
                params![id],
            )?;
            tx.execute(
                "DELETE FROM shares
                 WHERE kind = 'task'
                   AND resource_id IN (SELECT id FROM tasks WHERE todo_list_id = ?1)",
                params![id],
            )?;
            tx.execute("DELETE FROM tasks WHERE todo_list_id = ?1", params![id])?;
        } else {
            tx.execute("DELETE FROM steps WHERE task_id = ?1", params![id])?;
        }

        tx.execute(
            "DELETE FROM shares WHERE kind = ?1 AND resource_id = ?2",
            params![kind.as_str(), id],
        )?;
        let deleted = tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", table_for(kind)),
            params![id],
        )?;

        tx.commit()?;
        Ok(deleted > 0)
    }

    async fn insert_step(
        &self,
        task_id: &str,
        description: &str,
        completed: bool,
    ) -> Result<Step> {
        let conn = self.conn.lock();
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM steps
             WHERE task_id = ?1 AND deleted_at IS NULL",
            params![task_id],
            |row| row.get(0),
        )?;

        let step = Step {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            description: description.to_string(),
            completed,
            position,
            created_at: from_millis(epoch_millis()),
            deleted_at: None,
        };
        conn.execute(
            "INSERT INTO steps (id, task_id, description, completed, position, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                step.id,
                step.task_id,
                step.description,
                step.completed,
                step.position,
                step.created_at.timestamp_millis(),
            ],
        )?;
        Ok(step)
    }

    async fn find_step(&self, id: &str) -> Result<Option<Step>> {
        let conn = self.conn.lock();
        let step = conn
            .query_row(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM steps st
                     WHERE st.id = ?1 AND st.deleted_at IS NULL"
                ),
                params![id],
                step_from_row,
            )
            .optional()?;
        Ok(step)
    }

    async fn steps_of_task(&self, task_id: &str) -> Result<Vec<Step>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps st
             WHERE st.task_id = ?1 AND st.deleted_at IS NULL
             ORDER BY st.position ASC, st.created_at ASC"
        ))?;
        let steps = stmt
            .query_map(params![task_id], step_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    async fn update_step(
        &self,
        id: &str,
        description: Option<&str>,
        completed: Option<bool>,
    ) -> Result<Option<Step>> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE steps
             SET description = COALESCE(?2, description),
                 completed = COALESCE(?3, completed)
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id, description, completed],
        )?;
        let step = conn
            .query_row(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM steps st
                     WHERE st.id = ?1 AND st.deleted_at IS NULL"
                ),
                params![id],
                step_from_row,
            )
            .optional()?;
        Ok(step)
    }

    async fn soft_delete_step(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE steps SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, epoch_millis()],
        )?;
        Ok(changed > 0)
    }

    async fn reorder_steps(&self, task_id: &str, step_ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE steps SET position = ?3
                 WHERE id = ?1 AND task_id = ?2 AND deleted_at IS NULL",
            )?;
            for (position, step_id) in step_ids.iter().enumerate() {
                stmt.execute(params![step_id, task_id, position as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

fn table_for(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::List => "todo_lists",
        ResourceKind::Task => "tasks",
    }
}

fn list_from_row(row: &Row<'_>) -> rusqlite::Result<TodoList> {
    Ok(TodoList {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        is_system: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        deleted_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        todo_list_id: row.get(2)?,
        description: row.get(3)?,
        completed: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        deleted_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: row.get(0)?,
        task_id: row.get(1)?,
        description: row.get(2)?,
        completed: row.get(3)?,
        position: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        deleted_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
    })
}

fn share_from_row(row: &Row<'_>) -> rusqlite::Result<Share> {
    let kind: String = row.get(0)?;
    Ok(Share {
        kind: ResourceKind::from_str_lossy(&kind).ok_or_else(|| invalid_text(0, &kind))?,
        resource_id: row.get(1)?,
        shared_with_id: row.get(2)?,
        role: role_at(row, 3)?,
        created_at: from_millis(row.get(4)?),
    })
}

fn role_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<ShareRole> {
    let role: String = row.get(idx)?;
    ShareRole::parse(&role).ok_or_else(|| invalid_text(idx, &role))
}

fn invalid_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Tests ───────────────────────────────────────────────────────────
