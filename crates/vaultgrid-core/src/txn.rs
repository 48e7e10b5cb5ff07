//! Compensating actions for multi-step filesystem/catalog sequences.
//!
//! Neither the filesystem nor the catalog offers a transaction spanning
//! both, so every step that changes one of them registers its inverse in an
//! [`UndoLog`]. On failure the inverses run newest-first; a failing inverse
//! escalates to [`GridError::RollbackFailed`] rather than being swallowed.

use tracing::{error, warn};

use crate::GridError;

type Undo<'a> = Box<dyn FnOnce() -> Result<(), GridError> + 'a>;

/// Stack of compensating actions.
///
/// Dropping a log that was neither committed nor rolled back runs the
/// remaining actions and logs their failures.
pub struct UndoLog<'a> {
    actions: Vec<(&'static str, Undo<'a>)>,
}

impl<'a> UndoLog<'a> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Registers the inverse of a step that just succeeded.
    pub fn push(&mut self, label: &'static str, undo: impl FnOnce() -> Result<(), GridError> + 'a) {
        self.actions.push((label, Box::new(undo)));
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Moves `other`'s actions on top of this log.
    pub fn absorb(&mut self, mut other: UndoLog<'a>) {
        self.actions.append(&mut other.actions);
    }

    /// Keeps every step; nothing will be undone.
    pub fn commit(mut self) {
        self.actions.clear();
    }

    /// Undoes every registered step after `cause` and returns the error to
    /// report: `cause` itself, or `RollbackFailed` if an inverse failed.
    pub fn rollback(mut self, cause: GridError) -> GridError {
        let mut failure: Option<GridError> = None;
        while let Some((label, undo)) = self.actions.pop() {
            if let Err(err) = undo() {
                error!(step = label, error = %err, cause = %cause, "rollback step failed");
                failure.get_or_insert(err);
            }
        }
        match failure {
            None => cause,
            Some(rollback) => GridError::RollbackFailed {
                cause: Box::new(cause),
                rollback: Box::new(rollback),
            },
        }
    }
}

impl Default for UndoLog<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UndoLog<'_> {
    fn drop(&mut self) {
        while let Some((label, undo)) = self.actions.pop() {
            warn!(step = label, "undoing step of an abandoned sequence");
            if let Err(err) = undo() {
                error!(step = label, error = %err, "rollback step failed");
            }
        }
    }
}
