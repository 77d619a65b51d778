//! devgate - a local development orchestrator
//!
//! This library starts a set of interdependent services for local development:
//! - Validates service definitions and their dependency graph
//! - Launches services in dependency waves, gating each wave on health probes
//! - Supervises processes in their own process groups and applies restart policies
//! - Routes HTTP traffic by path prefix to healthy services through one reverse proxy
//! - Stops everything in reverse dependency order

pub mod admin;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod instance;
pub mod lockfile;
pub mod logs;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod supervisor;
