//! Dotted numeric versions
//!
//! CUDA and driver versions arrive as strings such as `"10.1"` or
//! `"440.100"`. Comparing them as text gets `"9.0" > "10.0"` wrong, so they
//! are parsed into components and compared numerically. Missing trailing
//! components count as zero, so `"10"` equals `"10.0"`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    pub fn new(components: Vec<u64>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Keeps only the first `count` components (`"19.03.8"` -> `"19.03"`)
    pub fn truncated(&self, count: usize) -> Self {
        Self::new(self.components.iter().copied().take(count).collect())
    }

    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError {
    input: String,
}

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid version string: '{}'", self.input)
    }
}

impl std::error::Error for ParseVersionError {}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let error = || ParseVersionError {
            input: s.to_string(),
        };

        if trimmed.is_empty() {
            return Err(error());
        }

        let components = trimmed
            .split('.')
            .map(|part| part.parse::<u64>().map_err(|_| error()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(components))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}
