//! Domain types and pure logic for the Murmur transcription orchestrator.
//!
//! Nothing in this crate performs I/O. The engine crate drives these types
//! from its supervisor and registry; the API crate maps them onto HTTP.

pub mod error;
pub mod job;
pub mod stages;
pub mod transcript;
pub mod types;
pub mod upload;
