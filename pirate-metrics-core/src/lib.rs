//! # pirate-metrics-core
//!
//! Client agent for PirateMetrics, the AARRR business metrics service.
//!
//! This library provides:
//! - The five business metrics (acquisition, activation, retention,
//!   revenue, referral) plus custom kinds
//! - A background agent that never fails its host: metrics are queued and
//!   shipped by one worker thread
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use pirate_metrics_core::{Agent, Config};
//! use serde_json::json;
//!
//! let config = Config::load().expect("failed to load config");
//! let agent = Agent::new(config.agent);
//!
//! agent.acquisition(json!({"email": "test@example.com", "level": "Double Uranium"}));
//! agent.revenue(json!({"email": "test@example.com", "amount_in_cents": 1000}));
//!
//! // Wait for everything queued so far, without retrying failures.
//! agent.flush(false);
//! ```

// Re-export commonly used items at the crate root
pub use agent::{Agent, AgentBuilder, DeliveryStats};
pub use config::{AgentConfig, Config};
pub use error::{Error, Result};
pub use metric::{IntoPayload, MetricKind, Payload, Record};

// Public modules
pub mod agent;
pub mod config;
pub mod error;
pub mod logging;
pub mod metric;
