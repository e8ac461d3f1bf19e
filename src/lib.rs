//! Emulation of slower memory on DRAM.
//!
//! Targets are pinned to dedicated cores and periodically stopped. Their
//! LLC misses and memory stall cycles over each epoch are converted into
//! the extra time the same accesses would have taken on the emulated
//! memory, and the target is held stopped for that long.

pub mod error;
pub mod events;
pub mod util;
pub mod topology;
pub mod snapshot;
pub mod pmu;
pub mod pebs;
pub mod monitor;
pub mod delay;
pub mod protocol;
pub mod emulator;
pub mod launch;

pub use crate::error::{EmulError, ProtocolError, RegistryError};
pub use crate::emulator::{Emulator, EmulatorArgs, EmulatorConfig};
pub use crate::topology::Topology;
pub use crate::util::HostEnv;
