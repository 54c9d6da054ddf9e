//! Scheduler layer for the runner
//!
//! The [`JobPoller`] finds the next job this node can run and the
//! [`Launcher`] drives the node's life around it: registration, orphaned
//! job recovery and the strictly sequential poll/execute loop.

pub mod launcher;
pub mod poller;

pub use launcher::Launcher;
pub use poller::{JobPoller, PollSettings};
