//! # Ingress Dynamo
//!
//! A **dynamo** is the unit of processing every stateful entity in the
//! ingress engine is built from. It pairs two halves:
//!
//! ```text
//!        model side                         background side
//!  ┌──────────────────────┐  Apply(config)  ┌──────────────────────┐
//!  │ Dynamo               │ ──────────────▶ │ Runtime              │
//!  │  id, config, status  │  engine pause   │  RuntimeCore         │
//!  │  config observers    │ ──────────────▶ │   paused, config     │
//!  │                      │ ◀────────────── │   Option<State>      │
//!  └──────────────────────┘  state changed  └──────────────────────┘
//! ```
//!
//! - The model side owns the identifier, the configuration and the operating
//!   status. Replacing the configuration with an equal value is a no-op.
//! - Configuration and pause changes travel to the runtime as commands on a
//!   channel; a driver task applies them one at a time.
//! - The runtime guards a typed state that only exists while it is running.
//!   Every mutation bumps a change notifier that observers can watch.
//! - Shutdown is terminal. It releases the runtime state exactly once, and is
//!   still attempted when a dynamo is dropped without being shut down.
//!
//! Persisted dynamos are encoded as tagged JSON objects and decoded through
//! an explicit [`CodableRegistry`].

pub mod atomic;
pub mod capability;
pub mod codable;
pub mod dynamo;
pub mod error;
pub mod identifier;
pub mod notify;
pub mod runtime;
pub mod status;
pub mod version;

pub use atomic::Atomic;
pub use capability::{Configurable, Reconcilable, Shutdownable};
pub use codable::{Codable, CodableRecord, CodableRegistry, Decoder, DynamoSnapshot};
pub use dynamo::{ConfigObserver, Dynamo};
pub use error::{IngressError, Result, ShutdownResult, ShutdownResultExt};
pub use identifier::Identifier;
pub use notify::ChangeNotifier;
pub use runtime::{Runtime, RuntimeCore, RuntimeExt};
pub use status::OperatingStatus;
pub use version::Version;
