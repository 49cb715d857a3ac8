//! vcon-pipe: a horizontally-scalable processing pipeline for vCon
//! conversation records.
//!
//! This crate is the CORE described by the accompanying design document: a
//! multi-process, queue-driven worker runtime, its interaction with a
//! Redis-resident work queue and vCon cache, the chain execution engine,
//! the dead-letter queue policy, and the cache lifecycle. Concrete link
//! implementations (transcription, AI analysis, webhooks), concrete
//! storage backend internals, and the full HTTP API surface are treated as
//! external collaborators; only their contracts are implemented here.

pub mod auth;
pub mod cache;
pub mod config;
pub mod dlq;
pub mod error;
pub mod executor;
pub mod http;
pub mod queue;
pub mod registry;
pub mod stages;
pub mod storage;
pub mod supervisor;
pub mod vcon;
pub mod worker;
