//! Dalec - declarative package builds
//!
//! Builds packages from a YAML spec: sources are materialized and patched,
//! go module dependencies are fetched with per-host git authentication,
//! build caches are resolved into distro-namespaced keys, and package
//! dependencies are translated into each distro's constraint syntax.
//! Graphs are described with [`llb`] and executed by an [`engine`].

pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod gomod;
pub mod llb;
pub mod repo;
pub mod session;
pub mod source;
pub mod spec;

pub use error::{DalecError, DalecResult};
