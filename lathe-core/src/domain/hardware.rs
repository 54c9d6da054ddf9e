//! Hardware domain types
//!
//! A [`HardwareSnapshot`] is collected once when the agent starts and is
//! then shared read-only. `gpus` is `None` when no GPU tooling is present
//! at all, and an empty map when the tooling reports zero devices. The
//! capability matcher treats both as "no GPU".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A GPU generation with the compute capability range it covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareGeneration {
    pub pk: i64,
    pub generation: String,
    pub min_compute_capability: f64,
    pub max_compute_capability: f64,
}

impl HardwareGeneration {
    /// Range check, inclusive at the bottom and exclusive at the top
    pub fn contains(&self, compute: f64) -> bool {
        self.min_compute_capability <= compute && compute < self.max_compute_capability
    }

    /// Finds the generation a compute capability belongs to
    pub fn classify(generations: &[HardwareGeneration], compute: f64) -> Option<&HardwareGeneration> {
        generations.iter().find(|generation| generation.contains(compute))
    }
}

/// Memory figures in bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub free: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    pub model: Option<String>,
    pub brand: Option<String>,
    pub uuid: Option<String>,
    pub bus: Option<String>,
    pub compute: Option<f64>,
    pub generation: Option<HardwareGeneration>,
    pub memory: Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub memory: Option<Memory>,
    pub driver: Option<String>,
    pub cuda: Option<String>,
    pub gpus: Option<BTreeMap<u32, Gpu>>,
}

impl HardwareSnapshot {
    /// The GPU the capability checks are made against
    pub fn primary_gpu(&self) -> Option<&Gpu> {
        self.gpus.as_ref()?.get(&0)
    }

    pub fn has_gpus(&self) -> bool {
        self.gpus.as_ref().is_some_and(|gpus| !gpus.is_empty())
    }

    /// Compute capability of the primary GPU
    pub fn primary_compute(&self) -> Option<f64> {
        self.primary_gpu()?.compute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation(name: &str, min: f64, max: f64) -> HardwareGeneration {
        HardwareGeneration {
            pk: 1,
            generation: name.to_string(),
            min_compute_capability: min,
            max_compute_capability: max,
        }
    }

    #[test]
    fn test_classify_range_bounds() {
        let generations = vec![generation("Pascal", 6.0, 7.0), generation("Volta", 7.0, 7.5)];
        assert_eq!(
            HardwareGeneration::classify(&generations, 6.0).map(|g| g.generation.as_str()),
            Some("Pascal")
        );
        assert_eq!(
            HardwareGeneration::classify(&generations, 7.0).map(|g| g.generation.as_str()),
            Some("Volta")
        );
        assert!(HardwareGeneration::classify(&generations, 7.5).is_none());
    }

    #[test]
    fn test_absent_and_empty_gpus() {
        let mut snapshot = HardwareSnapshot::default();
        assert!(!snapshot.has_gpus());
        snapshot.gpus = Some(BTreeMap::new());
        assert!(!snapshot.has_gpus());
        assert!(snapshot.primary_compute().is_none());
    }
}
