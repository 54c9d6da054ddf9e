//! Lathe Runner
//!
//! Worker-node agent of the Lathe ML job platform. A node polls the job
//! backend, picks a job its hardware can run, executes it in a container
//! and reports the outcome together with its log and outputs.
//!
//! Architecture:
//! - Configuration: TOML file with environment overrides
//! - Backend: trait seam over the HTTP client, plus an in-memory backend
//! - Hardware: snapshot of memory, GPUs, driver and CUDA, and the
//!   capability matcher deciding what this node can run
//! - Scheduler: node registration, polling and the sequential job loop
//! - Executor: per-job state machine, runners, containers and artifacts

pub mod artifact;
pub mod backend;
pub mod backoff;
pub mod cancellation;
pub mod config;
pub mod container;
pub mod context;
pub mod executor;
pub mod hardware;
pub mod matcher;
pub mod node;
pub mod progress;
pub mod scheduler;
