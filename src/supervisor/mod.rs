//! Supervisor engine: job registry, reconciliation, process control, and the
//! loop that drives them.

pub mod backoff;
pub mod clock;
pub mod manager;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod signals;

#[cfg(test)]
pub(crate) mod testing;
