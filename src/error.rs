//! Error types.

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised while setting up or driving the emulator.
#[derive(Debug, Error)]
pub enum EmulError {
    #[error("unsupported cpu: {0}")]
    UnsupportedCpu(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("couldn't read {path}: {source}")]
    Probe {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {path}: {reason}")]
    ProbeFormat { path: String, reason: String },

    #[error("perf_event_open failed for '{name}': {source}")]
    PerfOpen {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("counter '{name}': {source}")]
    Counter {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sampling ring for tid {tid}: {source}")]
    Ring {
        tid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't pin tid {tid} to core {core}: {errno}")]
    Affinity { tid: i32, core: usize, errno: Errno },

    #[error("signal setup: {0}")]
    Signal(Errno),

    #[error("nanosleep failed: {0}")]
    Sleep(Errno),

    #[error("transport: {0}")]
    Transport(#[source] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("couldn't launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced while decoding a lifecycle notification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message too short ({len} bytes, need at least {min})")]
    TooShort { len: usize, min: usize },

    #[error("message too long ({len} bytes, at most {max})")]
    TooLong { len: usize, max: usize },

    #[error("region trailer is {got} bytes, expected {expected} for {count} regions")]
    RegionLength { count: u32, expected: usize, got: usize },
}

/// Errors returned by [`crate::monitor::MonitorRegistry`] operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("({tgid}, {tid}) is already attached to slot {slot}")]
    AlreadyAttached { tgid: i32, tid: i32, slot: usize },

    #[error("no free monitor slot")]
    NoFreeSlot,

    #[error("tid {tid} is gone")]
    TargetGone { tid: i32 },

    #[error("({tgid}, {tid}) is not attached")]
    NotFound { tgid: i32, tid: i32 },

    #[error("slot {slot} declared {expected} regions, got {got}")]
    RegionMismatch { slot: usize, expected: u32, got: usize },

    #[error("slot {slot} is not active")]
    NotActive { slot: usize },

    #[error("slot {slot} out of range")]
    InvalidSlot { slot: usize },

    #[error("slot setup failed: {0}")]
    Setup(Box<EmulError>),
}

impl From<EmulError> for RegistryError {
    fn from(e: EmulError) -> Self {
        RegistryError::Setup(Box::new(e))
    }
}
