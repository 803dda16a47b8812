//! # loopctl-host
//!
//! A host process that owns a GUI-like state on a dedicated thread and
//! exposes it over the loopctl control protocol.
//!
//! - **config**: TOML configuration with per-section defaults
//! - **headless**: the reference "window" state and its named API
//! - **service**: wires the control server, the GUI thread and shutdown

pub mod config;
pub mod headless;
pub mod service;
