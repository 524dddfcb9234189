//! Device capability profiles and task requirements.
//!
//! A node advertises a [`DeviceProfile`] when it registers; a task carries
//! [`TaskRequirements`]. The capability half of eligibility is decided here,
//! the liveness half (online, free slot, reliability) lives in the registry.

use crate::error::{SwarmError, SwarmResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kind of work a task performs (e.g. `render`, `inference`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskType(String);

impl TaskType {
    /// Create a task type
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Coarse geographic location
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeoLocation {
    /// ISO country code
    pub country: String,
    /// City name
    pub city: String,
}

impl GeoLocation {
    /// Create a location
    #[must_use]
    pub fn new(country: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            city: city.into(),
        }
    }

    /// Coarse distance: 0 same city, 1 same country, 2 different country
    #[must_use]
    pub fn distance(&self, other: &GeoLocation) -> u8 {
        if !self.country.eq_ignore_ascii_case(&other.country) {
            2
        } else if !self.city.eq_ignore_ascii_case(&other.city) {
            1
        } else {
            0
        }
    }
}

/// Capability profile advertised by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Stable device fingerprint supplied by the client
    pub fingerprint: String,
    /// CPU cores
    pub cpu_cores: u32,
    /// Memory in megabytes
    pub memory_mb: u64,
    /// Bandwidth in megabits per second
    pub bandwidth_mbps: u32,
    /// Whether a GPU is present
    pub gpu: bool,
    /// Task types this device can run
    pub task_types: BTreeSet<TaskType>,
    /// Where the device is
    pub location: Option<GeoLocation>,
}

impl DeviceProfile {
    /// Create a profile with the given fingerprint and no capacity
    #[must_use]
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            cpu_cores: 0,
            memory_mb: 0,
            bandwidth_mbps: 0,
            gpu: false,
            task_types: BTreeSet::new(),
            location: None,
        }
    }

    /// Set CPU cores
    #[must_use]
    pub fn with_cpu_cores(mut self, cores: u32) -> Self {
        self.cpu_cores = cores;
        self
    }

    /// Set memory
    #[must_use]
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Set bandwidth
    #[must_use]
    pub fn with_bandwidth_mbps(mut self, mbps: u32) -> Self {
        self.bandwidth_mbps = mbps;
        self
    }

    /// Set GPU presence
    #[must_use]
    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    /// Add a supported task type
    #[must_use]
    pub fn with_task_type(mut self, task_type: impl Into<TaskType>) -> Self {
        self.task_types.insert(task_type.into());
        self
    }

    /// Set location
    #[must_use]
    pub fn with_location(mut self, location: GeoLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Check whether this device can run a task of `task_type` with `req`
    ///
    /// Only hardware and task-type support are checked here.
    #[must_use]
    pub fn satisfies(&self, task_type: &TaskType, req: &TaskRequirements) -> bool {
        self.cpu_cores >= req.min_cpu_cores
            && self.memory_mb >= req.min_memory_mb
            && self.bandwidth_mbps >= req.min_bandwidth_mbps
            && (!req.gpu || self.gpu)
            && self.task_types.contains(task_type)
    }
}

/// Requirements a task places on the node that executes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    /// Minimum CPU cores
    pub min_cpu_cores: u32,
    /// Minimum memory in megabytes
    pub min_memory_mb: u64,
    /// Minimum bandwidth in megabits per second
    pub min_bandwidth_mbps: u32,
    /// GPU required
    pub gpu: bool,
    /// Minimum reliability score of the executing node
    pub min_reliability: f64,
    /// Requester location, used by locality-aware selection
    pub origin: Option<GeoLocation>,
}

impl TaskRequirements {
    /// Requirements that any online node satisfies
    #[must_use]
    pub fn none() -> Self {
        Self {
            min_cpu_cores: 0,
            min_memory_mb: 0,
            min_bandwidth_mbps: 0,
            gpu: false,
            min_reliability: 0.0,
            origin: None,
        }
    }

    /// Set minimum CPU cores
    #[must_use]
    pub fn with_cpu_cores(mut self, cores: u32) -> Self {
        self.min_cpu_cores = cores;
        self
    }

    /// Set minimum memory
    #[must_use]
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.min_memory_mb = memory_mb;
        self
    }

    /// Set minimum bandwidth
    #[must_use]
    pub fn with_bandwidth_mbps(mut self, mbps: u32) -> Self {
        self.min_bandwidth_mbps = mbps;
        self
    }

    /// Require a GPU
    #[must_use]
    pub fn with_gpu(mut self) -> Self {
        self.gpu = true;
        self
    }

    /// Set the reliability floor
    #[must_use]
    pub fn with_min_reliability(mut self, reliability: f64) -> Self {
        self.min_reliability = reliability;
        self
    }

    /// Set requester origin
    #[must_use]
    pub fn with_origin(mut self, origin: GeoLocation) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Validate value ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidTask` if the reliability floor is outside `[0, 1]`
    pub fn validate(&self) -> SwarmResult<()> {
        if !(0.0..=1.0).contains(&self.min_reliability) {
            return Err(SwarmError::InvalidTask {
                reason: format!("min_reliability {} outside [0, 1]", self.min_reliability),
            });
        }
        Ok(())
    }
}

impl Default for TaskRequirements {
    fn default() -> Self {
        Self::none()
    }
}

/// Task priority levels, served in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Served first
    Critical = 0,
    /// High priority
    High = 1,
    /// Default
    #[default]
    Normal = 2,
    /// Opportunistic
    Low = 3,
}
