//! # alphie-core
//!
//! Foundation types shared by every alphie crate: branded ids, the tier
//! enum, token metering with model pricing, and the parsed runner event.

pub mod ids;
pub mod pricing;
pub mod stream;
pub mod tier;
pub mod tokens;
pub mod usage;

pub use ids::{AgentId, TaskId};
pub use pricing::ModelPricing;
pub use stream::{StreamEvent, StreamEventKind};
pub use tier::Tier;
pub use tokens::{AggregateTracker, TokenTracker, TokenUsage};
