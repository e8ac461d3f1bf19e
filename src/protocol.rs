//! Lifecycle notifications sent by instrumented targets.
//!
//! A notification is a single datagram, native-endian:
//!
//! ```text
//! | tgid: u32 | tid: u32 | opcode: u32 | region_count: u32 |
//! [ | addr: u64 | size: u64 | ] * region_count
//! ```
//!
//! Region descriptors are only meaningful (and only checked) when a
//! create notification declares two or more regions.

use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use crate::error::{EmulError, ProtocolError};
use crate::monitor::Region;

pub const HEADER_LEN: usize = 16;
pub const REGION_LEN: usize = 16;

/// Default path of the notification socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/mesmeric_socket";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    ProcessCreate,
    ThreadCreate,
    ThreadExit,
    Unknown(u32),
}

impl From<u32> for Opcode {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Self::ProcessCreate,
            1 => Self::ThreadCreate,
            2 => Self::ThreadExit,
            x => Self::Unknown(x),
        }
    }
}

impl From<Opcode> for u32 {
    fn from(op: Opcode) -> u32 {
        match op {
            Opcode::ProcessCreate => 0,
            Opcode::ThreadCreate => 1,
            Opcode::ThreadExit => 2,
            Opcode::Unknown(x) => x,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleMsg {
    pub tgid: i32,
    pub tid: i32,
    pub opcode: Opcode,
    pub region_count: u32,
    pub regions: Vec<Region>,
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(b)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(b)
}

/// Largest valid message when `tiers` memory tiers are configured.
pub fn max_message_len(tiers: usize) -> usize {
    HEADER_LEN + REGION_LEN * tiers
}

impl LifecycleMsg {
    /// Decode a datagram. `tiers` bounds the number of regions.
    pub fn decode(buf: &[u8], tiers: usize) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort { len: buf.len(), min: HEADER_LEN });
        }
        let max = max_message_len(tiers);
        if buf.len() > max {
            return Err(ProtocolError::TooLong { len: buf.len(), max });
        }

        let opcode = Opcode::from(read_u32(buf, 8));
        let region_count = read_u32(buf, 12);
        let creates = matches!(opcode, Opcode::ProcessCreate | Opcode::ThreadCreate);

        let mut regions = Vec::new();
        if creates && region_count >= 2 {
            let trailer = &buf[HEADER_LEN..];
            let expected = REGION_LEN * region_count as usize;
            if trailer.len() != expected {
                return Err(ProtocolError::RegionLength {
                    count: region_count, expected, got: trailer.len(),
                });
            }
            regions = trailer.chunks_exact(REGION_LEN)
                .map(|c| Region::new(read_u64(c, 0), read_u64(c, 8)))
                .collect();
        }

        Ok(Self {
            tgid: read_u32(buf, 0) as i32,
            tid: read_u32(buf, 4) as i32,
            opcode,
            region_count,
            regions,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + REGION_LEN * self.regions.len());
        buf.extend_from_slice(&(self.tgid as u32).to_ne_bytes());
        buf.extend_from_slice(&(self.tid as u32).to_ne_bytes());
        buf.extend_from_slice(&u32::from(self.opcode).to_ne_bytes());
        buf.extend_from_slice(&self.region_count.to_ne_bytes());
        for r in self.regions.iter() {
            buf.extend_from_slice(&r.addr.to_ne_bytes());
            buf.extend_from_slice(&r.size.to_ne_bytes());
        }
        buf
    }
}

/// Result of a non-blocking receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recv {
    /// A datagram of this many bytes was written into the buffer.
    Datagram(usize),

    /// Nothing pending.
    Empty,
}

/// Source of lifecycle datagrams.
pub trait Transport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<Recv, EmulError>;
}

/// A non-blocking Unix datagram socket bound to a filesystem path.
/// The path is removed again when the transport is dropped.
pub struct SocketTransport {
    sock: UnixDatagram,
    path: PathBuf,
}

impl SocketTransport {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, EmulError> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => return Err(EmulError::Transport(e)),
        }
        let sock = UnixDatagram::bind(&path).map_err(EmulError::Transport)?;
        sock.set_nonblocking(true).map_err(EmulError::Transport)?;
        tracing::info!(path = %path.display(), "listening for lifecycle notifications");
        Ok(Self { sock, path })
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl Transport for SocketTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<Recv, EmulError> {
        match self.sock.recv(buf) {
            Ok(n) => Ok(Recv::Datagram(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Recv::Empty),
            Err(e) => Err(EmulError::Transport(e)),
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
