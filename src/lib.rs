#![forbid(unsafe_code)]

//! Session control plane and inbound dispatch pipeline for the OpenClaw
//! chat-to-agent bridge.
//!
//! See the module-level docs on [`session::manager`] and [`inbound::dispatch`]
//! for the two halves of the core: the ACP session manager (admission,
//! identity reconciliation, turn execution) and the inbound pipeline
//! (access control, dedup, debounce, history, mention gating, routing).

pub use errors::{AppError, Result};

pub mod access_control;
pub mod acp;
pub mod config;
pub mod config_watcher;
pub mod errors;
pub mod inbound;
pub mod model;
pub mod persistence;
pub mod reply_dispatcher;
pub mod session;
pub mod ssrf;
