//! Per-store resource acquisition for a commit.
//!
//! A commit talks to every physical store through an [`Acquisition`]
//! obtained from the surrounding [`TransactionContext`]. The
//! [`AcquisitionSet`] makes sure each store is acquired at most once per
//! commit, that a failed commit marks every acquisition errored exactly
//! once, and that every acquisition is released even when an earlier
//! release fails.

use objcache_core::{AcquisitionError, Error, Result};

use crate::surface::CommandSurface;

/// A store's command surface held for the duration of one commit.
pub trait Acquisition: Send {
    type Commands: CommandSurface;

    fn commands(&self) -> &Self::Commands;

    /// Flag the acquisition so that releasing it rolls the work back.
    fn set_errored(&mut self);

    /// Give the acquisition back to its owner.
    fn release(self) -> Result<()>;
}

/// The ambient transaction a commit runs in.
pub trait TransactionContext {
    type Acquisition: Acquisition;

    /// Acquire the command surface of the named store.
    fn acquire(&mut self, store: &str) -> Result<Self::Acquisition>;
}

/// Acquisitions taken during one commit, in acquisition order.
pub struct AcquisitionSet<A: Acquisition> {
    held: Vec<(String, A)>,
    errored: bool,
}

impl<A: Acquisition> Default for AcquisitionSet<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Acquisition> AcquisitionSet<A> {
    pub fn new() -> Self {
        Self {
            held: Vec::new(),
            errored: false,
        }
    }

    /// The command surface for `store`, acquiring it on first use.
    pub fn commands<T>(&mut self, transaction: &mut T, store: &str) -> Result<&A::Commands>
    where
        T: TransactionContext<Acquisition = A>,
    {
        let index = match self.held.iter().position(|(name, _)| name == store) {
            Some(index) => index,
            None => {
                tracing::debug!(store = store, "Acquiring store");
                let acquisition = transaction.acquire(store)?;
                self.held.push((store.to_string(), acquisition));
                self.held.len() - 1
            }
        };
        Ok(self.held[index].1.commands())
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Store names in acquisition order.
    pub fn stores(&self) -> impl Iterator<Item = &str> {
        self.held.iter().map(|(name, _)| name.as_str())
    }

    /// Mark every acquisition errored. Later calls do nothing.
    pub fn set_errored(&mut self) {
        if self.errored {
            return;
        }
        self.errored = true;
        for (store, acquisition) in &mut self.held {
            tracing::warn!(store = %store, "Marking acquisition errored");
            acquisition.set_errored();
        }
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    /// Release every acquisition.
    ///
    /// All releases run even when some fail; the failures are reported
    /// together, in acquisition order.
    pub fn release_all(self) -> Result<()> {
        let mut failures = Vec::new();
        for (store, acquisition) in self.held {
            if let Err(e) = acquisition.release() {
                tracing::error!(store = %store, error = %e, "Release failed");
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Acquisition(AcquisitionError {
                failures,
                cause: None,
            }))
        }
    }

    /// Mark every acquisition errored and release them all.
    ///
    /// Returns `cause` when every release succeeded, otherwise the release
    /// failures with `cause` attached.
    pub fn abort(mut self, cause: Error) -> Error {
        self.set_errored();
        match self.release_all() {
            Ok(()) => cause,
            Err(Error::Acquisition(mut failed)) => {
                failed.cause = Some(Box::new(cause));
                Error::Acquisition(failed)
            }
            Err(other) => other,
        }
    }
}
