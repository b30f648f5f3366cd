//! cadence-core: lifecycle consistency for hierarchical work items.
//!
//! Decides which state transitions an item may take ([`transition`]) and,
//! after every create or update, propagates the corrective writes that keep
//! the item, its iteration, and its inclusion hierarchy consistent
//! ([`cascade`]).
//!
//! # Conventions
//!
//! - **Errors**: typed errors from [`error`]; `anyhow` at collaborator
//!   boundaries only.
//! - **Logging**: `tracing` macros; hosts may call [`logging::init_tracing`].

pub mod audit;
pub mod cache;
pub mod cascade;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod schedule;
pub mod store;
pub mod transition;

pub use cascade::{
    CascadeEngine, ChildCascadeJob, CreateRequest, LifecycleService, UpdateRequest,
};
pub use config::{EngineConfig, load_engine_config};
pub use error::{EngineError, ErrorCategory, ErrorCode};
pub use transition::{AuthContext, Authorizer, Button, Identity};
