//! Master-side supervision of worker process pools.
//!
//! A [`Server`] is the entry point: it runs either as the [`Master`](master::Master), spawning and supervising the worker
//! processes of every configured pool, or as one of those worker processes.
#![deny(missing_docs)]

pub mod config;
pub mod master;
pub mod restart;
pub mod spawn;
pub mod status;

mod server;
pub use self::server::{Server, ServerError};
