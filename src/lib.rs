//! ```text
//! FlowController ─┬─► ProcessGroup tree ─► Connectables ─► Connections/Queues
//!                 │                          │
//!                 │                          └─► Processor plug-ins (registry)
//!                 │
//!                 ├─► ProcessScheduler ─► agents (timer / cron / event / primary)
//!                 │                       │
//!                 │                       └─► FlowEngine pools ─► ProcessSession
//!                 │
//!                 ├─► status aggregation ─► ComponentStatusRepository
//!                 └─► heartbeat subsystem ─► NodeProtocolSender
//! ```
//!
//! Floweave is an in-process dataflow execution engine: a controller owning
//! a live graph of components, scheduling agents driving their triggers
//! under bounded concurrency with back-pressure and prioritised queueing,
//! and — when clustered — a heartbeat subsystem publishing liveness and
//! aggregated status. Durability (flow files, content, provenance) is
//! delegated to injected repositories; see [`repository`] for the
//! contracts.

pub mod controller;
pub mod model;
pub mod plugin;
pub mod repository;
pub mod scheduling;
pub mod settings;
pub mod types;

pub use controller::{
    ControllerError, FlowController, FlowControllerBuilder, ShutdownReport, UpdateConnection,
    UpdateProcessor,
};
pub use settings::{EngineSettings, TlsContext};
