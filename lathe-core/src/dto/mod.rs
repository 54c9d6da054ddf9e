//! Data Transfer Objects for node/backend communication
//!
//! Request bodies sent by the node agent, plus the filter expressions used
//! to restrict list endpoints on the server side.

pub mod filter;
pub mod job;
pub mod node;
