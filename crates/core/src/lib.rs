//! Core domain logic for the harvest job coordinator.
//!
//! Pure types and policies with no I/O: the job model, the in-memory
//! job registry, the adaptive backoff policy, configuration, and the
//! shared error types. Everything network-facing lives in
//! `harvest-remote`; the scheduling loop lives in `harvest-coordinator`.

pub mod backoff;
pub mod config;
pub mod error;
pub mod registry;
pub mod types;
