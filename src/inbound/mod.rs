//! Inbound dispatch pipeline (§4.7-§4.10): dedup, debounce, history
//! aggregation, mention/command gating, and the end-to-end dispatcher that
//! routes a message to the ACP session manager or a fallback resolver.

pub mod debounce;
pub mod dedup;
pub mod dispatch;
pub mod history;
pub mod mention_gate;

pub use debounce::Debouncer;
pub use dedup::Dedup;
pub use dispatch::{FallbackResolver, Hooks, InboundDispatcher, RoutingContext, SystemEventsSink};
pub use history::HistoryAggregator;
