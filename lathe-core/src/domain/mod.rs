//! Core domain types
//!
//! These types mirror the records the backend stores. The node agent reads
//! them, and only the backend mutates them.

pub mod docker;
pub mod hardware;
pub mod job;
pub mod log;
pub mod node;
pub mod template;
pub mod version;
