//! # ftl-controller
//!
//! The asynchronous execution core of the FTL controller.
//!
//! Components, bottom up:
//!
//! - **Storage**: Serializable in-memory transactions with nested
//!   savepoints
//! - **Crypto**: Subkey-derived AES-256-GCM column encryption,
//!   bootstrapped from a KMS master key
//! - **Leases**: Heartbeat-renewed exclusive ownership of structured
//!   keys
//! - **Async queue**: Durable, schedule-ordered verb invocations with
//!   retry, catch, and backoff
//! - **FSM**: Event-driven state machine instances executing their
//!   transitions as async calls
//! - **Pub/sub**: Ordered, at-least-once topic subscriptions fanning
//!   events out as async calls
//! - **Deployments**: The deployment catalog and its change watcher
//! - **Runtime**: The assembled [`Controller`](runtime::Controller)
//!   surface workers drive
//!
//! ## Example
//!
//! ```rust,no_run
//! use ftl_controller::config::ControllerConfig;
//! use ftl_controller::runtime::Controller;
//!
//! # async fn run() -> ftl_controller::Result<()> {
//! let controller = Controller::new(ControllerConfig::from_env()?).await?;
//! let acquired = controller.acquire_async_call().await?;
//! println!("executing {}", acquired.call.verb);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod asyncqueue;
pub mod config;
pub mod crypto;
pub mod deployments;
pub mod error;
pub mod fsm;
pub mod leases;
pub mod metrics;
pub mod pubsub;
pub mod runtime;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::asyncqueue::{AcquiredCall, AsyncCall, AsyncOrigin, CallRequest, CallResult};
    pub use crate::config::ControllerConfig;
    pub use crate::error::{Error, Result};
    pub use crate::fsm::FsmSchema;
    pub use crate::runtime::Controller;
}

pub use error::{Error, Result};
pub use runtime::Controller;
