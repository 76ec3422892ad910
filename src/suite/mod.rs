//! Suite definition and dispatch.
//!
//! A [`SuiteSpec`] names the boards, builds and policy of one run; the
//! [`SuiteDispatcher`] expands it into one child job per `(test, board)`,
//! collects results through the result waiter and retries failures in place.

pub mod dispatcher;
pub mod spec;

pub use dispatcher::{SuiteDispatcher, SuiteOutcome, SuiteTest, TestOutcome};
pub use spec::{Priority, SuiteSpec, SuiteSpecBuilder, MAX_TIMEOUT_MINS};
