//! Shared wire types and configuration for the provisioning orchestrator:
//! the [`Config`](config::Config) schema, the in-memory
//! [`NodeRecord`](node::NodeRecord), the helper subprocess JSON protocol,
//! the node-agent RPC payload shapes, and the error taxonomy all of those
//! share.

pub mod config;
pub mod error;
pub mod helper;
pub mod node;
pub mod rpc;

pub use config::{Config, Features};
pub use node::{Csr, NodeRecord};
