pub mod assembly;
pub mod config;
pub mod core;
mod errors;
pub mod fan;
pub mod jockey;
pub mod orchestrator;
pub mod partition;
pub mod storage;

#[cfg(test)]
mod tests;

pub use crate::config::RelayConfig;
pub use crate::core::{Backoff, SlotBuffer, SlotEntry};
pub use crate::errors::{RelayError, Result};
