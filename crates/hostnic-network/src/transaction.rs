//! Revert-capable sequences of host operations.
//!
//! A [`Transaction`] records a rollback for every step that succeeded. If it
//! is dropped or aborted before [`Transaction::commit`], the rollbacks run in
//! reverse order. A failing rollback is logged and the rest still run.

use hostnic_common::{HostnicError, HostnicResult};

type Rollback<'a> = Box<dyn FnOnce() -> HostnicResult<()> + 'a>;

/// An all-or-nothing group of host operations.
#[must_use = "dropping a transaction rolls it back"]
pub struct Transaction<'a> {
    rollbacks: Vec<(String, Rollback<'a>)>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field(
                "pending",
                &self.rollbacks.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for Transaction<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Transaction<'a> {
    /// Open an empty transaction.
    pub const fn new() -> Self {
        Self {
            rollbacks: Vec::new(),
        }
    }

    /// Register a rollback for an operation that already succeeded.
    pub fn on_rollback<F>(&mut self, name: impl Into<String>, rollback: F)
    where
        F: FnOnce() -> HostnicResult<()> + 'a,
    {
        self.rollbacks.push((name.into(), Box::new(rollback)));
    }

    /// Run `action`; on success register `rollback` to undo it.
    ///
    /// # Errors
    ///
    /// Returns the action's error wrapped as a provisioning failure of
    /// `name`. Nothing is registered in that case.
    pub fn step<T, A, R>(&mut self, name: &str, action: A, rollback: R) -> HostnicResult<T>
    where
        A: FnOnce() -> HostnicResult<T>,
        R: FnOnce() -> HostnicResult<()> + 'a,
    {
        let value = action().map_err(|e| HostnicError::provisioning(name, e))?;
        self.on_rollback(name, rollback);
        Ok(value)
    }

    /// Run `action` without anything to undo.
    ///
    /// # Errors
    ///
    /// Returns the action's error wrapped as a provisioning failure of `name`.
    pub fn run<T, A>(&mut self, name: &str, action: A) -> HostnicResult<T>
    where
        A: FnOnce() -> HostnicResult<T>,
    {
        action().map_err(|e| HostnicError::provisioning(name, e))
    }

    /// Number of registered rollbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rollbacks.len()
    }

    /// Whether no rollback is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rollbacks.is_empty()
    }

    /// Keep every completed step; nothing will be rolled back.
    pub fn commit(mut self) {
        tracing::trace!(steps = self.rollbacks.len(), "Transaction committed");
        self.rollbacks.clear();
    }

    /// Roll back now, returning the rollbacks that failed.
    pub fn abort(mut self) -> Vec<HostnicError> {
        self.unwind()
    }

    fn unwind(&mut self) -> Vec<HostnicError> {
        let mut errors = Vec::new();

        while let Some((name, rollback)) = self.rollbacks.pop() {
            tracing::debug!(step = %name, "Rolling back");
            if let Err(e) = rollback() {
                tracing::warn!(step = %name, error = %e, "Rollback failed");
                errors.push(e);
            }
        }

        errors
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.rollbacks.is_empty() {
            let failed = self.unwind();
            if !failed.is_empty() {
                tracing::warn!(failed = failed.len(), "Transaction rolled back with errors");
            }
        }
    }
}
