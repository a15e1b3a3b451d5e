//! Application bootstrap primitives.
//!
//! This crate provides what a `hearth` binary needs before the master or a worker starts running: logging,
//! configuration loading, and PID file management.
#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod logging;

