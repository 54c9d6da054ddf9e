//! Capability matching
//!
//! Decides whether this node can run a docker image. The first failing
//! rule wins and its message is returned as the reason; `None` means the
//! image is runnable. Only the GPU at index 0 is considered.

use lathe_core::domain::docker::DockerImageSpec;
use lathe_core::domain::hardware::HardwareSnapshot;
use lathe_core::domain::version::Version;

/// Checks an image's requirements against the node's hardware
///
/// # Arguments
/// * `image` - The docker image the job would run in
/// * `snapshot` - Hardware collected at startup
///
/// # Returns
/// `None` if the image can run here, otherwise why not
pub fn can_run(image: &DockerImageSpec, snapshot: &HardwareSnapshot) -> Option<String> {
    if let Some(missing) = missing_gpu_support(snapshot) {
        return if image.cpu {
            None
        } else {
            Some(format!("{} and Docker image is not CPU-only", missing))
        };
    }

    // A GPU-capable node also runs CPU-only images, but their CUDA
    // requirements still have to hold when they are declared
    if let Some(cuda) = &image.cuda_version {
        let node_cuda = snapshot.cuda.as_deref().unwrap_or_default();
        if let Some(reason) = require_version("CUDA", node_cuda, &cuda.version) {
            return Some(reason);
        }

        let node_driver = snapshot.driver.as_deref().unwrap_or_default();
        if let Some(reason) = require_version("driver", node_driver, &cuda.min_driver_version) {
            return Some(reason);
        }
    }

    if let (Some(generation), Some(compute)) =
        (&image.min_hardware_generation, snapshot.primary_compute())
    {
        if generation.min_compute_capability > compute {
            return Some(format!(
                "Node's GPU compute capability ({}) is too low for Docker image (requires >= {})",
                compute, generation.min_compute_capability
            ));
        }
    }

    None
}

fn missing_gpu_support(snapshot: &HardwareSnapshot) -> Option<&'static str> {
    if !snapshot.has_gpus() {
        Some("Node has no GPUs")
    } else if snapshot.driver.is_none() {
        Some("Node has no GPU driver")
    } else if snapshot.cuda.is_none() {
        Some("Node has no CUDA version")
    } else if snapshot.primary_compute().is_none() {
        Some("Node GPU has no compute capability")
    } else {
        None
    }
}

fn require_version(what: &str, node: &str, required: &str) -> Option<String> {
    match (node.parse::<Version>(), required.parse::<Version>()) {
        (Ok(have), Ok(need)) if have >= need => None,
        (Ok(_), Ok(_)) => Some(format!(
            "Node's {} version ({}) is too low for Docker image (requires >= {})",
            what, node, required
        )),
        _ => Some(format!(
            "Node's {} version ({}) cannot be compared with the version required by the Docker image ({})",
            what, node, required
        )),
    }
}
