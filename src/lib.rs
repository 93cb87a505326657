//! pinflow - workflow runtime bootstrap
//!
//! pinflow takes a workflow script plus the integration code it depends on
//! and runs them inside an isolated worker process. The worker exposes:
//!
//! - **Webhooks**: a namespaced HTTP route table served on one listener
//! - **Templates**: cached `{{ expr }}` templates coerced to a pin type
//! - **Execution telemetry**: `running` / `completed` / `failed` events
//!   streamed back to the launcher
//!
//! ## Example
//!
//! ```text
//! pinflow start --workflow workflow.rhai --dependencies deps.json
//! ```

pub mod config;
pub mod dependencies;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod shutdown;
pub mod template;
pub mod webhook;

pub use error::{Error, Result};
