//! hyde deployment engine.
//!
//! Provisions compute nodes across cloud providers and installs a chain of
//! products (orchestrator, storage, databases, services) onto the result.
//!
//! Layers, leaf to root:
//!
//! - [`provider`]: one compute node at a time against a cloud API.
//! - [`orchestrator`]: concurrent fan-out of nodes and infrastructures.
//! - [`provision`]: the product registry and its installers.
//! - [`controller`]: the use cases exposed over [`api`].

pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod provision;
pub mod secrets;
pub mod state;
