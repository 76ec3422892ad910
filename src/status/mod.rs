pub mod aggregator;
pub mod waiter;

pub use aggregator::{JobResults, StatusAggregator};
pub use waiter::{JobResultWaiter, ResultStream};
