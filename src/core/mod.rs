//! Core infrastructure: configuration, errors, and time.

pub mod config;
pub mod error;
pub mod time;

pub use config::Config;
pub use error::{IdemError, IdemResult, OperationError};
pub use time::{Clock, ManualClock, SharedClock, SystemClock};
