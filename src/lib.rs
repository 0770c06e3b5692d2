//! Runner - ephemeral challenge instances on Portainer-managed Docker hosts.

pub mod backend;
pub mod balancer;
pub mod compose;
pub mod config;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod http_server;
pub mod models;
pub mod ports;
pub mod state;
pub mod store;
pub mod tasks;
pub mod workers;
