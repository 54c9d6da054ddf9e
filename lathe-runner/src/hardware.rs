//! Hardware discovery
//!
//! Collects the node's [`HardwareSnapshot`] once at startup: system memory
//! through `sysinfo`, GPUs, driver and CUDA version through `nvidia-smi`.
//! A host without `nvidia-smi` gets `gpus: None` and only accepts CPU-only
//! images.

use std::collections::BTreeMap;
use std::time::Duration;

use lathe_core::domain::hardware::{Gpu, HardwareGeneration, HardwareSnapshot, Memory};
use sysinfo::System;
use tokio::process::Command;
use tracing::{debug, info, warn};

const NVIDIA_SMI: &str = "nvidia-smi";
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const MIB: u64 = 1024 * 1024;

/// Queried fields, in output order
const GPU_FIELDS: &[&str] = &[
    "index",
    "name",
    "uuid",
    "pci.bus_id",
    "memory.total",
    "memory.used",
    "memory.free",
    "driver_version",
    "compute_cap",
];

/// Collects the hardware snapshot of this host
///
/// # Arguments
/// * `generations` - Known GPU generations, used to classify each GPU
pub async fn collect(generations: &[HardwareGeneration]) -> HardwareSnapshot {
    let mut snapshot = HardwareSnapshot {
        memory: system_memory(),
        ..Default::default()
    };

    let query = match query_gpus().await {
        Some(query) => query,
        None => {
            info!("No NVIDIA tooling found, running as a CPU-only node");
            return snapshot;
        }
    };

    let (gpus, driver) = parse_gpu_query(&query, generations);
    snapshot.driver = driver;
    snapshot.gpus = Some(gpus);
    snapshot.cuda = run_nvidia_smi(&[])
        .await
        .as_deref()
        .and_then(parse_cuda_version);

    info!(
        "Found {} GPU(s), driver {:?}, CUDA {:?}",
        snapshot.gpus.as_ref().map_or(0, BTreeMap::len),
        snapshot.driver,
        snapshot.cuda
    );
    snapshot
}

fn system_memory() -> Option<Memory> {
    let mut system = System::new();
    system.refresh_memory();

    let total = system.total_memory();
    if total == 0 {
        return None;
    }
    Some(Memory {
        total: Some(total),
        used: Some(system.used_memory()),
        free: Some(system.available_memory()),
    })
}

/// Runs the GPU query, dropping `compute_cap` for drivers that predate it
async fn query_gpus() -> Option<String> {
    let full = format!("--query-gpu={}", GPU_FIELDS.join(","));
    if let Some(output) = run_nvidia_smi(&[&full, "--format=csv,noheader,nounits"]).await {
        return Some(output);
    }

    let legacy = format!("--query-gpu={}", GPU_FIELDS[..GPU_FIELDS.len() - 1].join(","));
    run_nvidia_smi(&[&legacy, "--format=csv,noheader,nounits"]).await
}

async fn run_nvidia_smi(args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(
        QUERY_TIMEOUT,
        Command::new(NVIDIA_SMI).args(args).kill_on_drop(true).output(),
    )
    .await;

    match output {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            debug!("{} {:?} exited with {}", NVIDIA_SMI, args, output.status);
            None
        }
        Ok(Err(e)) => {
            debug!("Failed to run {}: {}", NVIDIA_SMI, e);
            None
        }
        Err(_) => {
            warn!("{} timed out", NVIDIA_SMI);
            None
        }
    }
}

/// Parses `--query-gpu` CSV output (no header, no units)
///
/// Returns the GPUs by index and the driver version of the first one.
/// Memory is reported in MiB and converted to bytes.
pub fn parse_gpu_query(
    text: &str,
    generations: &[HardwareGeneration],
) -> (BTreeMap<u32, Gpu>, Option<String>) {
    let mut gpus = BTreeMap::new();
    let mut driver = None;

    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let fields: Vec<Option<&str>> = line.split(',').map(field).collect();
        let get = |i: usize| fields.get(i).copied().flatten();

        let Some(index) = get(0).and_then(|v| v.parse::<u32>().ok()) else {
            warn!("Ignoring unexpected {} line: {}", NVIDIA_SMI, line);
            continue;
        };
        let mib = |i: usize| get(i).and_then(|v| v.parse::<u64>().ok()).map(|v| v * MIB);
        let compute = get(8).and_then(|v| v.parse::<f64>().ok());

        if driver.is_none() {
            driver = get(7).map(str::to_string);
        }

        gpus.insert(
            index,
            Gpu {
                model: get(1).map(str::to_string),
                brand: None,
                uuid: get(2).map(str::to_string),
                bus: get(3).map(str::to_string),
                compute,
                generation: compute
                    .and_then(|c| HardwareGeneration::classify(generations, c))
                    .cloned(),
                memory: Memory {
                    total: mib(4),
                    used: mib(5),
                    free: mib(6),
                },
            },
        );
    }

    (gpus, driver)
}

fn field(raw: &str) -> Option<&str> {
    let value = raw.trim();
    if value.is_empty() || value.starts_with('[') || value == "N/A" {
        None
    } else {
        Some(value)
    }
}

/// Extracts the CUDA version from the `nvidia-smi` banner
pub fn parse_cuda_version(text: &str) -> Option<String> {
    let (_, rest) = text.split_once("CUDA Version:")?;
    rest.split_whitespace()
        .next()
        .filter(|version| version.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(str::to_string)
}
