//! Node identity and registration
//!
//! A node is one GPU of one host, keyed by the host's IPv4 address and the
//! GPU index. On startup the agent creates or refreshes its node record and
//! cleans up a job left behind by a previous run of the agent.

use std::net::UdpSocket;

use anyhow::{Context as AnyhowContext, Result};
use lathe_core::domain::hardware::HardwareSnapshot;
use lathe_core::dto::filter::{FilterExpression, FilterSpec};
use lathe_core::dto::node::NodeUpdate;
use tracing::{info, warn};

use crate::backend::{Backend, NOTIFICATION};

/// Error reason of a job that was running when the agent stopped
pub const NODE_RESTARTED: &str = "Node restarted during job execution.";

const FALLBACK_IP: &str = "127.0.0.1";
const MIB: u64 = 1024 * 1024;

/// This agent's node as registered with the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub pk: i64,
    pub ip: String,
    pub gpu_id: u32,
}

/// Primary IPv4 address of this host
///
/// Connecting a UDP socket sends nothing but makes the OS pick the
/// outgoing interface. Falls back to `127.0.0.1`.
pub fn primary_ipv4() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("10.255.255.255:1")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| FALLBACK_IP.to_string())
}

/// Node fields derived from the hardware snapshot
pub fn node_update(snapshot: &HardwareSnapshot, ip: &str, gpu_id: u32) -> NodeUpdate {
    let gpu = snapshot.gpus.as_ref().and_then(|gpus| gpus.get(&gpu_id));

    NodeUpdate {
        ip: ip.to_string(),
        index: gpu_id,
        driver_version: snapshot.driver.clone(),
        hardware_generation: gpu.and_then(|gpu| gpu.generation.as_ref()).map(|g| g.pk),
        gpu_mem: gpu.and_then(|gpu| gpu.memory.total).map(|bytes| bytes / MIB),
        cpu_mem: snapshot
            .memory
            .as_ref()
            .and_then(|memory| memory.total)
            .map(|bytes| bytes / MIB),
    }
}

/// Creates or refreshes this node's record
///
/// A job the backend still assigns to this node is recovered before
/// returning.
///
/// # Arguments
/// * `backend` - The job backend
/// * `snapshot` - Hardware reported with the node
/// * `ip` - This host's IPv4 address
/// * `gpu_id` - GPU index this agent drives
pub async fn register(
    backend: &dyn Backend,
    snapshot: &HardwareSnapshot,
    ip: &str,
    gpu_id: u32,
) -> Result<NodeIdentity> {
    let update = node_update(snapshot, ip, gpu_id);
    let filter = FilterSpec::new(vec![
        FilterExpression::exact("ip", ip),
        FilterExpression::exact("index", gpu_id),
    ]);

    let existing = backend
        .list_nodes(&filter)
        .await
        .context("Failed to list nodes")?;

    let node = match existing.first() {
        Some(node) => backend
            .update_node(node.pk, &update)
            .await
            .with_context(|| format!("Failed to update node {}", node.pk))?,
        None => backend
            .create_node(&update)
            .await
            .context("Failed to create node")?,
    };
    info!("Registered as node {} ({} GPU {})", node.pk, ip, gpu_id);

    if let Some(job) = node.current_job {
        recover_orphaned_job(backend, job).await;
    }

    Ok(NodeIdentity {
        pk: node.pk,
        ip: ip.to_string(),
        gpu_id,
    })
}

/// Fails a job left running by a previous agent run and puts it back in
/// the queue
///
/// The job is only reset and released if the backend accepted the
/// failure. Errors are logged and otherwise ignored.
pub async fn recover_orphaned_job(backend: &dyn Backend, pk: i64) {
    warn!("Node was running job {} when it stopped, recovering", pk);

    let job = match backend
        .finish_job(pk, false, NOTIFICATION, Some(NODE_RESTARTED))
        .await
    {
        Ok(job) => job,
        Err(e) => {
            warn!("Failed to finish orphaned job {}: {:#}", pk, e);
            return;
        }
    };

    if job.error_reason.as_deref() != Some(NODE_RESTARTED) {
        info!("Orphaned job {} was already finished", pk);
        return;
    }

    if let Err(e) = backend.reset_job(pk).await {
        warn!("Failed to reset orphaned job {}: {:#}", pk, e);
        return;
    }
    match backend.release_job(pk).await {
        Ok(_) => info!("Orphaned job {} is back in the queue", pk),
        Err(e) => warn!("Failed to release orphaned job {}: {:#}", pk, e),
    }
}
