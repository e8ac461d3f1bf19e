//! Decoding of records written by the kernel into a sampling ring.
//!
//! Records are read by explicit field extraction at fixed offsets; every
//! read is checked against the record length first.

use thiserror::Error;

pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_LOST_SAMPLES: u32 = 13;

/// Size of `struct perf_event_header`.
pub const HEADER_SIZE: usize = 8;

/// Size of a sample record with `TID | ADDR | READ | PHYS_ADDR` and the
/// `TOTAL_TIME_ENABLED` read format, header included.
pub const SAMPLE_SIZE: usize = 48;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("record too short: {size} bytes, need {need}")]
    Truncated { size: usize, need: usize },

    #[error("record header declares zero size")]
    ZeroSize,

    #[error("record of {size} bytes runs past the {avail} readable bytes")]
    Overrun { size: usize, avail: u64 },
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[off..off + 4]);
    u32::from_ne_bytes(b)
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    u64::from_ne_bytes(b)
}

/// Record kinds the decoder distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Sample,
    Lost,
    Throttle,
    Unthrottle,
    LostSamples,
    Other(u32),
}

impl From<u32> for RecordKind {
    fn from(raw: u32) -> Self {
        match raw {
            PERF_RECORD_SAMPLE => Self::Sample,
            PERF_RECORD_LOST => Self::Lost,
            PERF_RECORD_THROTTLE => Self::Throttle,
            PERF_RECORD_UNTHROTTLE => Self::Unthrottle,
            PERF_RECORD_LOST_SAMPLES => Self::LostSamples,
            x => Self::Other(x),
        }
    }
}

/// `struct perf_event_header`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: RecordKind,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    pub fn parse(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < HEADER_SIZE {
            return Err(RecordError::Truncated { size: data.len(), need: HEADER_SIZE });
        }
        let hdr = Self {
            kind: RecordKind::from(read_u32(data, 0)),
            misc: read_u16(data, 4),
            size: read_u16(data, 6),
        };
        if hdr.size == 0 {
            return Err(RecordError::ZeroSize);
        }
        if (hdr.size as usize) < HEADER_SIZE {
            return Err(RecordError::Truncated { size: hdr.size as usize, need: HEADER_SIZE });
        }
        Ok(hdr)
    }

    /// Check that a record starting at ring position `pos` ends at or
    /// before `head` and fits in a data region of `data_size` bytes.
    pub fn check_span(&self, pos: u64, head: u64, data_size: u64) -> Result<(), RecordError> {
        let size = self.size as u64;
        let avail = head.saturating_sub(pos).min(data_size);
        if size > avail {
            return Err(RecordError::Overrun { size: self.size as usize, avail });
        }
        Ok(())
    }
}

/// A decoded `PERF_RECORD_SAMPLE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleRecord {
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,

    /// Value of the sampled counter.
    pub value: u64,

    pub time_enabled: u64,
    pub phys_addr: u64,
}

impl SampleRecord {
    /// Parse a whole sample record (header included).
    pub fn parse(rec: &[u8]) -> Result<Self, RecordError> {
        if rec.len() < SAMPLE_SIZE {
            return Err(RecordError::Truncated { size: rec.len(), need: SAMPLE_SIZE });
        }
        Ok(Self {
            pid: read_u32(rec, 8),
            tid: read_u32(rec, 12),
            addr: read_u64(rec, 16),
            value: read_u64(rec, 24),
            time_enabled: read_u64(rec, 32),
            phys_addr: read_u64(rec, 40),
        })
    }

    /// Encode into the kernel layout.
    pub fn to_bytes(&self) -> [u8; SAMPLE_SIZE] {
        let mut b = [0u8; SAMPLE_SIZE];
        b[0..4].copy_from_slice(&PERF_RECORD_SAMPLE.to_ne_bytes());
        b[6..8].copy_from_slice(&(SAMPLE_SIZE as u16).to_ne_bytes());
        b[8..12].copy_from_slice(&self.pid.to_ne_bytes());
        b[12..16].copy_from_slice(&self.tid.to_ne_bytes());
        b[16..24].copy_from_slice(&self.addr.to_ne_bytes());
        b[24..32].copy_from_slice(&self.value.to_ne_bytes());
        b[32..40].copy_from_slice(&self.time_enabled.to_ne_bytes());
        b[40..48].copy_from_slice(&self.phys_addr.to_ne_bytes());
        b
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_kinds() {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&13u32.to_ne_bytes());
        b[6..8].copy_from_slice(&16u16.to_ne_bytes());
        let hdr = RecordHeader::parse(&b).unwrap();
        assert_eq!(hdr.kind, RecordKind::LostSamples);
        assert_eq!(hdr.size, 16);

        b[0..4].copy_from_slice(&42u32.to_ne_bytes());
        assert_eq!(RecordHeader::parse(&b).unwrap().kind, RecordKind::Other(42));
    }

    #[test]
    fn header_rejects_zero_size() {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&PERF_RECORD_SAMPLE.to_ne_bytes());
        assert_eq!(RecordHeader::parse(&b), Err(RecordError::ZeroSize));
        assert!(matches!(RecordHeader::parse(&b[..4]),
            Err(RecordError::Truncated { size: 4, .. })));
    }

    #[test]
    fn header_rejects_short_size() {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&PERF_RECORD_LOST.to_ne_bytes());
        b[6..8].copy_from_slice(&4u16.to_ne_bytes());
        assert_eq!(RecordHeader::parse(&b),
            Err(RecordError::Truncated { size: 4, need: HEADER_SIZE }));
    }

    #[test]
    fn span_bounds() {
        let hdr = RecordHeader { kind: RecordKind::Sample, misc: 0, size: 48 };
        assert!(hdr.check_span(100, 148, 4096).is_ok());
        assert_eq!(hdr.check_span(100, 140, 4096),
            Err(RecordError::Overrun { size: 48, avail: 40 }));
        assert_eq!(hdr.check_span(0, 4096, 32),
            Err(RecordError::Overrun { size: 48, avail: 32 }));
    }

    #[test]
    fn sample_fields() {
        let s = SampleRecord {
            pid: 10, tid: 11, addr: 0x7f00_1000, value: 1234,
            time_enabled: 99, phys_addr: 0x1_2000,
        };
        let b = s.to_bytes();
        let hdr = RecordHeader::parse(&b).unwrap();
        assert_eq!(hdr.kind, RecordKind::Sample);
        assert_eq!(hdr.size as usize, SAMPLE_SIZE);
        assert_eq!(SampleRecord::parse(&b), Ok(s));
        assert!(SampleRecord::parse(&b[..40]).is_err());
    }
}
