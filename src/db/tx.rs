//! Ambient transaction context.
//!
//! `TransactionManager::run` opens a transaction and places it in a
//! task-local for the duration of the closure; repositories resolve the
//! current executor via `Exec::current()` instead of taking one as a
//! parameter. Nesting is logical-only: a nested `run` call reuses the
//! outer transaction and neither commits nor rolls back itself — only the
//! outermost call controls the commit/rollback boundary. There is no
//! savepoint support.

use crate::error::{DbError, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

tokio::task_local! {
    static CURRENT_TX: Arc<Mutex<Transaction<'static, Sqlite>>>;
}

#[derive(Clone)]
pub struct TransactionManager {
    pool: SqlitePool,
}

impl TransactionManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `body` with an active transaction bound to the current task.
    /// Commits on `Ok`, rolls back on `Err` or panic, at the outermost call
    /// only.
    pub async fn run<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if CURRENT_TX.try_with(|_| ()).is_ok() {
            // Already inside a transaction on this task: reuse it.
            return body().await;
        }

        let tx = self
            .pool
            .begin()
            .await
            .map_err(DbError::Connect)?;
        let tx = Arc::new(Mutex::new(tx));

        let result = CURRENT_TX.scope(tx.clone(), body()).await;

        let tx = Arc::try_unwrap(tx)
            .map_err(|_| DbError::Other(anyhow::anyhow!("transaction still borrowed at commit")))?
            .into_inner();

        match result {
            Ok(value) => {
                tx.commit().await.map_err(DbError::Connect)?;
                Ok(value)
            }
            Err(error) => {
                let _ = tx.rollback().await;
                Err(error)
            }
        }
    }
}

/// The executor a repository method should run against: either the bare
/// pool (auto-committing single statement) or the ambient transaction.
pub enum Exec {
    Pool(SqlitePool),
    Tx(Arc<Mutex<Transaction<'static, Sqlite>>>),
}

impl Exec {
    /// Resolve the current executor: the ambient transaction if `run` is on
    /// the call stack, otherwise the bare pool.
    pub fn current(pool: &SqlitePool) -> Self {
        match CURRENT_TX.try_with(|tx| tx.clone()) {
            Ok(tx) => Exec::Tx(tx),
            Err(_) => Exec::Pool(pool.clone()),
        }
    }
}

/// Resolve the current executor for `$self.pool` and bind it as `$ex` for
/// the duration of `$body`. Avoids repeating the pool-vs-transaction match
/// in every repository method.
#[macro_export]
macro_rules! with_exec {
    ($self:expr, |$ex:ident| $body:expr) => {{
        match $crate::db::tx::Exec::current(&$self.pool) {
            $crate::db::tx::Exec::Pool(pool) => {
                let $ex = &pool;
                $body
            }
            $crate::db::tx::Exec::Tx(tx) => {
                let mut guard = tx.lock().await;
                let $ex = &mut *guard;
                $body
            }
        }
    }};
}
