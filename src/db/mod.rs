use std::{
    path::Path,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

mod error;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

use migrations::run_migrations;

pub use error::{StoreError, StoreResult};
pub use models::{ItemDescriptor, LogRecord, Value, ValueKind};
pub use repositories::logs::{AppendOutcome, LogFilter, LogScan};

/// Location literal selecting a transient store.
pub const MEMORY_DATABASE: &str = ":memory:";

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

/// Handle to the embedded store.
///
/// A single worker thread owns the only SQLite connection and runs submitted
/// tasks one at a time, in arrival order. That thread is the write
/// serialisation point for every item, and each task (including a whole range
/// scan) observes one consistent snapshot. `:memory:` stores only exist
/// inside that one connection, so it is never pooled.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    location: Arc<String>,
    op_timeout: Duration,
}

impl Database {
    pub fn open(location: &str, op_timeout: Duration) -> Result<Self> {
        let in_memory = location == MEMORY_DATABASE;
        if !in_memory {
            if let Some(parent) = Path::new(location).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create database directory {}", parent.display())
                    })?;
                }
            }
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let location_for_thread = location.to_string();

        let worker = thread::Builder::new()
            .name("itemlog-db".into())
            .spawn(move || {
                let opened = if in_memory {
                    Connection::open_in_memory()
                } else {
                    Connection::open(&location_for_thread)
                };
                let mut conn = match opened {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if !in_memory {
                    if let Err(err) = conn.pragma_update_and_check(
                        None,
                        "journal_mode",
                        "WAL",
                        |row| row.get::<_, String>(0),
                    ) {
                        error!("Failed to enable WAL mode: {err}");
                    }
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }
                if let Err(err) = conn.busy_timeout(op_timeout) {
                    error!("Failed to set busy timeout: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {location}");

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            location: Arc::new(location.to_string()),
            op_timeout,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(MEMORY_DATABASE, DEFAULT_OPERATION_TIMEOUT)
    }

    pub fn location(&self) -> &str {
        self.location.as_str()
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Runs `task` on the worker and waits for its result, at most
    /// `op_timeout`. A timed-out task still runs; its reply is discarded.
    pub async fn execute<F, T>(&self, task: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.dispatch(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }))?;

        match tokio::time::timeout(self.op_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StoreError::Closed),
            Err(_) => Err(StoreError::StoreTimeout(self.op_timeout)),
        }
    }

    /// Queues `task` without waiting for it.
    fn dispatch(&self, task: DbTask) -> StoreResult<()> {
        self.inner
            .sender
            .send(DbCommand::Execute(task))
            .map_err(|err| {
                error!("failed to send command to DB thread: {err}");
                StoreError::Closed
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_file_database_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("itemlog.sqlite3");
        let location = path.to_string_lossy().to_string();

        let db = Database::open(&location, DEFAULT_OPERATION_TIMEOUT).unwrap();
        assert_eq!(db.location(), location);
        assert!(path.exists());

        let tables: i64 = db
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('item', 'log')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[tokio::test]
    async fn test_file_database_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let location = dir.path().join("itemlog.sqlite3").to_string_lossy().to_string();

        let first_id = {
            let db = Database::open(&location, DEFAULT_OPERATION_TIMEOUT).unwrap();
            db.id("main.num", true).await.unwrap()
        };

        let db = Database::open(&location, DEFAULT_OPERATION_TIMEOUT).unwrap();
        assert_eq!(db.id("main.num", false).await.unwrap(), first_id);
    }

    #[tokio::test]
    async fn test_slow_task_times_out() {
        let db = Database::open(MEMORY_DATABASE, Duration::from_millis(20)).unwrap();
        let result = db
            .execute(|_conn| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::StoreTimeout(_))));
    }
}
