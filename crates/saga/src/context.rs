//! Transaction context threaded through every transactional saga step.
//!
//! A saga opens a [`SagaExecutionContext`] through its [`TransactionManager`]
//! and hands `&mut` access to each collaborator write that must be atomic.
//! Database-backed collaborators run their statements on the context's
//! Postgres transaction; in-memory collaborators register undo actions and
//! row locks on it. Either way, the writes become visible together on
//! [`commit`](SagaExecutionContext::commit) or are discarded together on
//! [`rollback`](SagaExecutionContext::rollback).

use async_trait::async_trait;
use sqlx::{PgConnection, Postgres, Transaction};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::{Result, SagaError};

type UndoAction = Box<dyn FnOnce() + Send>;

/// Unit of work shared by the collaborator calls of one saga step.
///
/// Dropping a context without committing rolls it back.
pub struct SagaExecutionContext {
    id: Uuid,
    undo: Vec<UndoAction>,
    locks: Vec<OwnedMutexGuard<()>>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl SagaExecutionContext {
    /// A context with no database transaction.
    pub fn in_memory() -> Self {
        Self {
            id: Uuid::new_v4(),
            undo: Vec::new(),
            locks: Vec::new(),
            tx: None,
        }
    }

    /// A context wrapping an open Postgres transaction.
    pub fn postgres(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            id: Uuid::new_v4(),
            undo: Vec::new(),
            locks: Vec::new(),
            tx: Some(tx),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn has_database_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// The database connection of this unit of work.
    pub fn connection(&mut self) -> Result<&mut PgConnection> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(SagaError::Transaction(
                "context has no database transaction".to_string(),
            )),
        }
    }

    /// Registers an action that reverts an in-memory write on rollback.
    ///
    /// Actions run in reverse registration order.
    pub fn on_rollback(&mut self, undo: impl FnOnce() + Send + 'static) {
        self.undo.push(Box::new(undo));
    }

    /// Keeps a row lock until the context ends.
    pub fn hold_lock(&mut self, guard: OwnedMutexGuard<()>) {
        self.locks.push(guard);
    }

    pub fn pending_undo_count(&self) -> usize {
        self.undo.len()
    }

    #[tracing::instrument(skip(self), fields(context_id = %self.id))]
    pub async fn commit(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take()
            && let Err(e) = tx.commit().await
        {
            // the database discarded the writes; undo the in-memory ones too
            tracing::error!(error = %e, "Commit failed");
            return Err(e.into());
        }
        self.undo.clear();
        tracing::debug!("Committed");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(context_id = %self.id))]
    pub async fn rollback(mut self) -> Result<()> {
        let undo_count = self.undo.len();
        let result = match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(SagaError::from),
            None => Ok(()),
        };
        tracing::debug!(undo_count, "Rolled back");
        result
    }
}

impl Drop for SagaExecutionContext {
    fn drop(&mut self) {
        while let Some(undo) = self.undo.pop() {
            undo();
        }
        // locks release after the undo actions ran
        self.locks.clear();
    }
}

impl std::fmt::Debug for SagaExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaExecutionContext")
            .field("id", &self.id)
            .field("undo", &self.undo.len())
            .field("locks", &self.locks.len())
            .field("database", &self.tx.is_some())
            .finish()
    }
}

/// Opens units of work for saga steps.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<SagaExecutionContext>;
}

/// Transaction manager for deployments without a database.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryTransactionManager;

impl InMemoryTransactionManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransactionManager for InMemoryTransactionManager {
    async fn begin(&self) -> Result<SagaExecutionContext> {
        Ok(SagaExecutionContext::in_memory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |n: u32| {
            let sink = sink.clone();
            Box::new(move || sink.lock().unwrap().push(n)) as Box<dyn FnOnce() + Send>
        };
        (log, make)
    }

    #[tokio::test]
    async fn rollback_runs_undo_in_reverse() {
        let (log, undo) = recorder();
        let mut ctx = InMemoryTransactionManager.begin().await.unwrap();
        ctx.on_rollback(undo(1));
        ctx.on_rollback(undo(2));
        ctx.on_rollback(undo(3));

        ctx.rollback().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn commit_discards_undo() {
        let (log, undo) = recorder();
        let mut ctx = SagaExecutionContext::in_memory();
        ctx.on_rollback(undo(1));

        ctx.commit().await.unwrap();

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_uncommitted_context_rolls_back() {
        let (log, undo) = recorder();
        {
            let mut ctx = SagaExecutionContext::in_memory();
            ctx.on_rollback(undo(7));
        }
        assert_eq!(*log.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn locks_are_released_when_context_ends() {
        let row = Arc::new(tokio::sync::Mutex::new(()));
        let mut ctx = SagaExecutionContext::in_memory();
        ctx.hold_lock(row.clone().lock_owned().await);
        assert!(row.try_lock().is_err());

        ctx.commit().await.unwrap();
        assert!(row.try_lock().is_ok());
    }

    #[test]
    fn memory_context_has_no_connection() {
        let mut ctx = SagaExecutionContext::in_memory();
        assert!(!ctx.has_database_transaction());
        assert!(matches!(ctx.connection(), Err(SagaError::Transaction(_))));
    }
}
