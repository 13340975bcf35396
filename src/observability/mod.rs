//! Run inspection support

pub mod run_log;

pub use run_log::{RunLog, RunLogStore};
