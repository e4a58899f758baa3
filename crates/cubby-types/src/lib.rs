//! Shared foundational types for the Cubby storage core.
//!
//! This crate provides the record identifier used by every entity in
//! the store, plus its generator. No other Cubby crate depends on
//! anything except `cubby-types` for cross-cutting definitions, which
//! keeps the workspace dependency graph acyclic.

mod id;

pub use id::{IdGenerator, ParseIdError, RecordId};
