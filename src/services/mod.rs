pub mod aggregator;
pub mod dispatcher;
pub mod inference;
pub mod processor;
pub mod queue;
pub mod retention;
pub mod severity;
pub mod storage;
