//! Core domain types and traits for infrakit.
//!
//! This crate contains:
//! - Identifiers (run ids, construct paths, provider logical ids)
//! - The construct tree (App, Stage, Stack) and resource declarations
//! - Asset, artifact and secret types
//! - Pipeline definitions and run state
//! - Executor and deployer traits

pub mod artifact;
pub mod asset;
pub mod construct;
pub mod deployer;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod resource;
pub mod secret;

pub use construct::{ConstructKind, ConstructNode, ConstructTree, NodeId};
pub use error::{Error, Result};
pub use id::{ConstructPath, ResourceId, logical_id};
pub use resource::{PropertyValue, Resource, ResourceKind};
