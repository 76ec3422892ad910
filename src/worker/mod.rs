//! Fake test execution for dry runs.
//!
//! [`DryRunExecutor`] plays the part of the lab's DUTs against an
//! [`InMemoryLab`](crate::backend::InMemoryLab): every runnable job gets a
//! scripted test status and a SERVER_JOB status, which completes it.

pub mod executor;

pub use executor::{DryRunExecutor, ExecutionResult, OutcomeScript};
