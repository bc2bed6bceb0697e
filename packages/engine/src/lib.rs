//! # Ingress Engine
//!
//! The engine ties a repository document to its live network ingress:
//!
//! - [`Engine`] is the facade a host application drives. It starts paused,
//!   is started once, and is shut down exactly once.
//! - [`EngineEnvironment`] owns the nodes, the firewall and the network
//!   context, and publishes the engine-wide pause flag.
//! - [`Node`]s are the persisted building blocks. Each node kind is
//!   registered in a [`NodeRegistry`] under a portable type tag.
//! - [`EngineConfig`] mirrors what the next save writes; [`EngineSnapshot`]
//!   is an encoded copy of it that knows how to write a package.
//!
//! ## Package layout
//!
//! ```text
//! <package>/
//!   manifest.json          { "repoId": …, "nodeIndex": [ … ] }
//!   nodes/<uuid>.json      { "typeId": …, "dynamoId": …, …config }
//! ```
//!
//! Saving twice without changes leaves every node file untouched.

pub mod config;
pub mod engine;
pub mod environment;
pub mod node;
pub mod settings;
pub mod snapshot;

pub use config::{EngineConfig, NodeSnapshot};
pub use engine::Engine;
pub use environment::EngineEnvironment;
pub use node::{HttpTriggerConfig, HttpTriggerNode, HttpTriggerRuntime, Node, NodeRegistry};
pub use settings::EngineSettings;
pub use snapshot::{load_config, EngineSnapshot, MANIFEST_FILE, NODE_DIR};

pub use ingress_dynamo::{Identifier, IngressError, OperatingStatus, Result, ShutdownResult};
