//! csvpipe Common Library
//!
//! Ambient process concerns shared by the csvpipe workspace members.
//!
//! # Overview
//!
//! - **Logging**: `tracing` subscriber setup driven by environment variables
//! - **Signals**: SIGINT/SIGTERM handling for graceful shutdown
//! - **Errors**: the error type for invalid ambient settings
//!
//! # Example
//!
//! ```no_run
//! use csvpipe_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> csvpipe_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod signal;

pub use error::{CommonError, Result};
