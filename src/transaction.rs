//! Ambient transaction manager.
//!
//! [`with_transaction`] gives one logical unit of work a dedicated SQLite
//! connection under `BEGIN IMMEDIATE`, bound to a tokio task-local for the
//! duration of the wrapped future. Nested calls join the ambient transaction
//! instead of opening a second one. Side effects that must only happen once
//! the work is durable go through [`after_transaction`]; they are drained in
//! registration order after COMMIT and discarded untouched on abort.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;

use crate::config::TxConfig;
use crate::database::{Database, DbHandle, SharedConn};
use crate::error::{Result, TicketdError};

/// A deferred post-commit effect. Best-effort: failures are logged, never
/// re-raised, and there is no retry.
type AfterCommit = BoxFuture<'static, Result<()>>;

/// Ambient state of one open transaction.
#[derive(Clone)]
struct TxScope {
    conn: SharedConn,
    after_commit: Arc<StdMutex<Vec<AfterCommit>>>,
}

tokio::task_local! {
    static TX_SCOPE: TxScope;
}

/// Whether a transaction is ambient on the current task.
pub fn in_transaction() -> bool {
    TX_SCOPE.try_with(|_| ()).is_ok()
}

/// The ambient transactional executor, or the plain pool when no transaction
/// is active.
pub fn use_transaction(db: &Database) -> DbHandle {
    TX_SCOPE
        .try_with(|scope| DbHandle::Tx(scope.conn.clone()))
        .unwrap_or_else(|_| DbHandle::Pool(db.pool().clone()))
}

/// Run `effect` once the enclosing transaction commits, or immediately when no
/// transaction is ambient.
pub async fn after_transaction<F>(effect: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    match TX_SCOPE.try_with(TxScope::clone) {
        Ok(scope) => {
            let mut queue = scope
                .after_commit
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.push(Box::pin(effect));
        }
        Err(_) => {
            // Nothing to wait for.
            if let Err(err) = effect.await {
                tracing::warn!(error = %err, "post-commit effect failed");
            }
        }
    }
}

/// Execute `f` inside a transaction.
///
/// If a transaction is already ambient the closure joins it: no new
/// transaction, no separate commit, and its after-commit effects drain with
/// the outer unit of work. Otherwise a connection is acquired (bounded by the
/// pool's acquire timeout), `BEGIN IMMEDIATE` issued, and the whole closure is
/// capped by `cfg.total_timeout`. On success the transaction commits and the
/// queued effects run, each independently. On failure or timeout the
/// transaction rolls back and the queue is discarded.
pub async fn with_transaction<T, F, Fut>(db: &Database, cfg: &TxConfig, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if in_transaction() {
        return f().await;
    }

    let mut conn = db
        .pool()
        .acquire()
        .await
        .map_err(|e| TicketdError::Transaction(format!("failed to acquire connection: {}", e)))?;

    sqlx::query("BEGIN IMMEDIATE")
        .execute(conn.as_mut())
        .await
        .map_err(|e| TicketdError::Transaction(format!("failed to begin transaction: {}", e)))?;

    let scope = TxScope {
        conn: Arc::new(tokio::sync::Mutex::new(conn)),
        after_commit: Arc::new(StdMutex::new(Vec::new())),
    };

    let outcome =
        tokio::time::timeout(cfg.total_timeout, TX_SCOPE.scope(scope.clone(), f())).await;

    match outcome {
        Ok(Ok(value)) => {
            commit(&scope).await?;

            let callbacks = std::mem::take(
                &mut *scope
                    .after_commit
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
            // Release the connection before running effects; they may need the
            // pool themselves.
            drop(scope);

            for effect in callbacks {
                if let Err(err) = effect.await {
                    tracing::warn!(error = %err, "after-commit callback failed");
                }
            }
            Ok(value)
        }
        Ok(Err(err)) => {
            rollback(&scope).await;
            Err(err)
        }
        Err(_elapsed) => {
            rollback(&scope).await;
            Err(TicketdError::Transaction(format!(
                "transaction exceeded {}ms",
                cfg.total_timeout.as_millis()
            )))
        }
    }
}

async fn commit(scope: &TxScope) -> Result<()> {
    let mut conn = scope.conn.lock().await;
    if let Err(err) = sqlx::query("COMMIT").execute(conn.as_mut()).await {
        // The transaction may still be open; make sure it does not leak into
        // the pooled connection's next user.
        let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
        return Err(TicketdError::Transaction(format!(
            "failed to commit: {}",
            err
        )));
    }
    Ok(())
}

async fn rollback(scope: &TxScope) {
    let mut conn = scope.conn.lock().await;
    if let Err(err) = sqlx::query("ROLLBACK").execute(conn.as_mut()).await {
        tracing::error!(error = %err, "failed to roll back transaction");
    }
}
