//! Core library for an arkio preservation node.
//!
//! An arkio node keeps dark-archive copies of member content across a small
//! federation of peers. This crate holds the shared pieces every binary
//! builds on: the registry data model and clients, the work queue and
//! staging/cold storage boundaries, bag packaging and validation, and the
//! replication, ingest, and restore pipelines.

pub mod audit;
pub mod bagit;
pub mod copier;
pub mod error;
pub mod manifest;
pub mod model;
pub mod operations;
pub mod queue;
pub mod registry;
pub mod storage;

pub use error::{ArkError, Result};
