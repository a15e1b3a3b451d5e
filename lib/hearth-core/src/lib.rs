//! Worker-side building blocks for supervised process pools.
//!
//! A worker process runs an [`EventLoop`](event_loop::EventLoop) hosting application hooks and services, reports its
//! liveness and traffic to the master over the [`ipc`] channel, and decides by itself when it should gracefully restart,
//! based on its [reload strategies](reload).
#![deny(missing_docs)]

pub mod error;
pub mod event_loop;
pub mod ipc;
pub mod memory;
pub mod message;
pub mod platform;
pub mod privileges;
pub mod reload;
pub mod traffic;
pub mod worker;

pub use self::worker::WorkerProcess;
