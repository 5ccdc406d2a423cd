//! Scheduler configuration.
//!
//! Node identity, which jobs a node may pick up, and loop timings. Everything
//! has a default, so configs can be loaded from any serde format with only the
//! fields that matter set:
//!
//! ```rust
//! use tickwork::SchedulerConfig;
//!
//! let config: SchedulerConfig = serde_json::from_str(
//!     r#"{ "node_id": "worker-1", "designated_node": "worker-1" }"#,
//! )?;
//!
//! assert!(config.is_designated_node());
//! assert!(config.serves_queue_class("anything"));
//! # Ok::<_, serde_json::Error>(())
//! ```

use std::time::Duration as StdDuration;

use jiff::{Span, ToSpan};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Configuration for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// This node's identity. Defaults to a fresh ULID.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// The only node allowed to run dedicated jobs.
    ///
    /// With no designated node, dedicated jobs don't run anywhere.
    #[serde(default)]
    pub designated_node: Option<String>,

    /// Queue classes this node serves. Empty means all of them.
    #[serde(default)]
    pub queue_classes: Vec<String>,

    /// How often triggers are evaluated. Defaults to one second.
    #[serde(default = "default_tick")]
    pub tick: Span,

    /// How long shutdown waits for in-flight runs after cancelling them.
    /// Defaults to 30 seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: Span,
}

fn default_node_id() -> String {
    Ulid::new().to_string()
}

fn default_tick() -> Span {
    1.second()
}

fn default_shutdown_grace() -> Span {
    30.seconds()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            designated_node: None,
            queue_classes: Vec::new(),
            tick: default_tick(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a default config for the named node.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Returns `true` if this node is the designated node.
    pub fn is_designated_node(&self) -> bool {
        self.designated_node.as_deref() == Some(self.node_id.as_str())
    }

    /// Returns `true` if this node picks up jobs of `queue_class`.
    pub fn serves_queue_class(&self, queue_class: &str) -> bool {
        self.queue_classes.is_empty() || self.queue_classes.iter().any(|c| c == queue_class)
    }

    /// The tick as a standard duration.
    pub fn tick_duration(&self) -> Result<StdDuration, jiff::Error> {
        StdDuration::try_from(self.tick)
    }

    /// The shutdown grace as a standard duration.
    pub fn shutdown_grace_duration(&self) -> Result<StdDuration, jiff::Error> {
        StdDuration::try_from(self.shutdown_grace)
    }
}
