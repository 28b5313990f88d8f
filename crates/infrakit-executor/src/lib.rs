//! Job execution backends for infrakit.
//!
//! Provides executor implementations for pipeline actions and asset bundling:
//! - Host processes (default)
//! - Local Docker

pub mod docker;
pub mod process;

pub use docker::LocalDockerExecutor;
pub use infrakit_core::executor::{
    Executor, JobResult, JobSpec, JobStatus, LogLine, LogStream, VolumeMount,
};
pub use process::LocalProcessExecutor;
