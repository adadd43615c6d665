//! Command handlers for the annapurna CLI.

pub mod logging;
pub mod retrieve;
pub mod serve;

pub use logging::*;
pub use retrieve::*;
pub use serve::*;
