//! Lathe Core
//!
//! Core types shared by the Lathe backend client and the node agent.
//!
//! This crate contains:
//! - Domain types: jobs, templates, docker images, hardware, nodes and logs
//! - DTOs: request bodies and the structured filter language used for listings

pub mod domain;
pub mod dto;
