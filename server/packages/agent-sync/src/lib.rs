//! Control-plane side of the agent host sync protocol.

pub mod accumulator;
pub mod cli;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod mapping;
pub mod model;
pub mod patch;
pub mod prompt_queue;
pub mod protocol;
pub mod publisher;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod store;
mod ws;

pub use engine::{HostSession, NewSession, SyncEngine};
