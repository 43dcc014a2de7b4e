//! # ftl-core
//!
//! Core abstractions for the FTL controller.
//!
//! This crate provides the foundational types shared across controller
//! components:
//!
//! - **References**: Strongly-typed `module.name` references to verbs,
//!   topics, FSMs, and subscriptions
//! - **Retry Policy**: The declarative retry/backoff/catch parameters
//!   attached to async work
//! - **Observability**: Structured logging initialization
//! - **Error Types**: Shared error definitions for parsing and validation
//!
//! ## Crate Boundary
//!
//! `ftl-core` is the **only** crate allowed to define shared primitives.
//! Cross-component interaction happens via the types defined here.
//!
//! ## Example
//!
//! ```rust
//! use ftl_core::Ref;
//!
//! let verb: Ref = "echo.hello".parse().unwrap();
//! assert_eq!(verb.module, "echo");
//! assert_eq!(verb.to_string(), "echo.hello");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod observability;
pub mod ref_key;
pub mod retry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::ref_key::Ref;
    pub use crate::retry::RetryPolicy;
}

pub use error::{Error, Result};
pub use observability::{init_logging, LogFormat};
pub use ref_key::{is_identifier, Ref};
pub use retry::RetryPolicy;
