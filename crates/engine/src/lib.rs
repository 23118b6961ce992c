//! Murmur job orchestration engine.
//!
//! Owns the runtime half of the system:
//!
//! - [`registry`]: the [`JobRegistry`] trait and its in-memory default.
//! - [`storage`] and [`cleanup`]: isolated per-job transient storage and its
//!   idempotent removal.
//! - [`results`]: the durable result store, keyed by job id.
//! - [`queue`] and [`dispatcher`]: FIFO intake and the capacity-bounded
//!   dispatcher loop.
//! - [`supervisor`] and [`process`]: one external process per job.
//! - [`orchestrator`]: the facade transports talk to.

pub mod active;
pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod orchestrator;
pub mod process;
pub mod queue;
pub mod registry;
pub mod results;
pub mod storage;
pub mod supervisor;

pub use config::EngineConfig;
pub use orchestrator::{CancelOutcome, EngineStats, Orchestrator, Upload};
pub use registry::{InMemoryRegistry, JobRegistry, RegistryError};
