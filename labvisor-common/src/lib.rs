//! # Labvisor Common
//!
//! Shared utilities for the Labvisor components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use labvisor_common::{init_logging, TimedOperation};
//!
//! init_logging("info")?;
//!
//! let op = TimedOperation::start("deploy");
//! // ...
//! op.finish();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, parse_filter, TimedOperation};
