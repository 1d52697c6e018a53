//! relaunch - a supervisor and reverse proxy for hitless HTTP worker restarts.
//!
//! Manages a fleet of short-lived worker instances per configured
//! application, each bound to a distinct internal port, and fronts them
//! with an externally-visible HTTP listener. Restarts bring up a fresh
//! instance, wait for it to pass a health check, atomically swap new
//! traffic to it, and retire the previous instance once its in-flight
//! requests have drained.

pub mod admin;
pub mod app;
pub mod config;
pub mod conn_pool;
pub mod error;
pub mod health;
pub mod instance;
pub mod port_pool;
pub mod supervisor;
