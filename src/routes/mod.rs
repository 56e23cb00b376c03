pub mod batches;
pub mod detect;
pub mod health;
pub mod metrics;
