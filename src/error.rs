//! # Errors
//!
//! Every fallible scheduler operation reports one of these. Nothing is
//! retried: the embedding application decides what a failure means.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FiberError {
    /// An operation was attempted before `scheduler_init`.
    #[error("fiber scheduler is not initialised")]
    NotInitialized,

    /// `scheduler_init` was called a second time.
    #[error("fiber scheduler is already initialised")]
    AlreadyInitialized,

    /// Every slot of the control-block table is in use.
    #[error("no free fiber control block")]
    NoFreeFiber,

    /// The heap could not provide a stack buffer of the given size.
    #[error("unable to allocate a {0} byte fiber stack")]
    OutOfMemory(usize),

    /// An allocating or suspending operation was called from an ISR.
    #[error("operation not permitted in interrupt context")]
    InterruptContext,

    /// The fiber is already back in the free pool.
    #[error("fiber has already been released")]
    AlreadyReleased,

    /// The current fiber has no pending entry point to launch.
    #[error("fiber has no entry point to launch")]
    NoEntry,
}

pub type Result<T> = core::result::Result<T, FiberError>;
