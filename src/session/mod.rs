//! Session control plane: the actor queue, runtime handle cache, and
//! identity reconciliation that the ACP session manager is built from.

pub mod actor_queue;
pub mod handle_cache;
pub mod identity;
pub mod manager;

pub use actor_queue::ActorQueue;
pub use handle_cache::{IdleCandidate, RuntimeHandle, RuntimeHandleCache};
pub use manager::AcpSessionManager;
