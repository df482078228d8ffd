//! Spinnerr - An idle-aware reverse proxy for Docker and Proxmox LXC backends
//!
//! This library provides a host-routed reverse proxy that:
//! - Routes HTTP and WebSocket traffic to backends by Host header
//! - Starts stopped backends on first request and serves a waiting page meanwhile
//! - Stops backends, alone or as groups, after a configurable idle timeout
//! - Applies weekly start/stop schedules
//! - Hot-reloads backends, groups and schedules from a watched JSON document

pub mod admin;
pub mod config;
pub mod docker;
pub mod document;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod groups;
pub mod lifecycle;
pub mod pool;
pub mod proxmox;
pub mod reactor;
pub mod reaper;
pub mod registry;
pub mod scheduler;
