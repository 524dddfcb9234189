//! SWARM.GRID Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Everything here is shared by the scheduler, the transport layer and
//! the daemon binary.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod digest;
pub mod error;
pub mod id;
pub mod profile;
pub mod time;

// Re-exports
pub use digest::{DigestError, ResultDigest};
pub use error::{SwarmError, SwarmResult};
pub use id::{NodeId, TaskId};
pub use profile::{DeviceProfile, GeoLocation, Priority, TaskRequirements, TaskType};
pub use time::{Timestamp, MILLIS_PER_HOUR, MILLIS_PER_SEC};
