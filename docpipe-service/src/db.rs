//! Database module for SQLite operations.
//!
//! Database work runs through [`Database::run`], which opens a [`Session`]
//! (one connection) on the blocking thread pool and hands it to a closure
//! that performs its writes inside [`UnitOfWork`]s. An exclusive unit of work starts with
//! `BEGIN IMMEDIATE`, so SQLite hands it the writer lock up front and holds
//! it until commit or rollback. That lock is the lease behind the
//! `lease_*` accessors: a row read through a lease cannot be modified by any
//! other unit of work until this one ends.

mod chunks;
mod documents;
mod images;
mod jobs;
mod migrations;
pub mod models;
mod projects;

pub(crate) use chunks::new_chunk;
pub use jobs::{JobRecord, JobStatus};
pub use models::{
    Chunk, ChunkStatus, ContentKinds, Document, DocumentStatus, Image, Project, ProjectStatus,
};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DatabaseError, ServiceError, ServiceResult};

/// Database handle. Holds only the location; connections are per session.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open(path: &Path, busy_timeout: Duration) -> ServiceResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Database(DatabaseError::Connection(
                    rusqlite::Error::ToSqlConversionFailure(Box::new(e)),
                ))
            })?;
        }

        let db = Self {
            path: path.to_path_buf(),
            busy_timeout,
        };

        // Run all migrations
        let session = db.session()?;
        migrations::run_migrations(&session.conn)?;

        Ok(db)
    }

    /// Open a fresh connection for one job or request.
    pub fn session(&self) -> ServiceResult<Session> {
        let conn = Connection::open(&self.path).map_err(DatabaseError::Connection)?;

        conn.busy_timeout(self.busy_timeout)
            .map_err(DatabaseError::Connection)?;
        // WAL lets snapshots read while a unit of work holds the writer lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(DatabaseError::Query)?;

        Ok(Session { conn })
    }

    /// Run database work on the blocking thread pool with a fresh session.
    ///
    /// A unit of work may wait up to the busy timeout for the writer lock, and
    /// that wait must not stall the async worker threads.
    pub async fn run<T, F>(&self, work: F) -> ServiceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> ServiceResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = db.session()?;
            work(&mut session)
        })
        .await
        .map_err(|e| ServiceError::Internal {
            message: format!("Database task failed: {e}"),
        })?
    }
}

/// A connection scoped to a single job. Dropped (and closed) when the job ends.
pub struct Session {
    conn: Connection,
}

impl Session {
    /// Begin an exclusive unit of work. Blocks up to the busy timeout while
    /// another unit of work holds the writer lock.
    pub fn unit_of_work(&mut self) -> ServiceResult<UnitOfWork<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;
        Ok(UnitOfWork {
            tx,
            exclusive: true,
        })
    }

    /// Begin a read-only snapshot. Never waits for writers and grants no leases.
    pub fn snapshot(&mut self) -> ServiceResult<UnitOfWork<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(DatabaseError::Query)?;
        Ok(UnitOfWork {
            tx,
            exclusive: false,
        })
    }
}

/// One transaction. Rolled back on drop unless [`UnitOfWork::commit`] is called.
pub struct UnitOfWork<'s> {
    tx: Transaction<'s>,
    exclusive: bool,
}

impl UnitOfWork<'_> {
    pub fn commit(self) -> ServiceResult<()> {
        self.tx.commit().map_err(DatabaseError::Query)?;
        Ok(())
    }

    fn require_lease(&self) -> ServiceResult<()> {
        if self.exclusive {
            Ok(())
        } else {
            Err(DatabaseError::LeaseOutsideUnitOfWork.into())
        }
    }
}

impl Deref for UnitOfWork<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
