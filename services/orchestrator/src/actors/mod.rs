//! Durable actors.
//!
//! Each actor owns one key (a task or a node), processes its mailbox and
//! alarm firings one at a time, and persists its state through an
//! [`ActorStateStore`](crate::db::ActorStateStore).

mod framework;
mod registry;

pub mod node_lifecycle;
pub mod task_runner;

pub use framework::{run_actor_loop, Actor, ActorContext, ActorError, ActorHandle, Message};
pub use registry::ActorRegistry;
