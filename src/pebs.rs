//! Precise sampling of LLC misses, used to attribute memory traffic of a
//! hybrid-memory target to its address regions.

pub mod record;

use std::sync::atomic::{fence, Ordering};

use memmap2::{MmapOptions, MmapRaw};
use perf_event::hooks::sys::bindings::{self, perf_event_attr, perf_event_mmap_page};

use crate::error::EmulError;
use crate::events::PEBS_LLC_MISS;
use crate::monitor::Region;
use crate::pmu::RawCounter;
use crate::snapshot::SampleCounts;
use record::{RecordHeader, RecordKind, SampleRecord, HEADER_SIZE};

/// Outcome of a single pass over a sampling ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Every record up to the observed head was applied.
    Complete,

    /// The kernel updated the header while we were reading. Records that
    /// were applied stand; the pass is not retried.
    Torn,

    /// A malformed record header stopped the pass early.
    Corrupt,
}

/// Access to a kernel-shared ring: a header page followed by a
/// power-of-two data region.
pub trait RingBuffer {
    /// The header's sequence lock.
    fn seq(&self) -> u32;
    fn head(&self) -> u64;
    fn tail(&self) -> u64;
    fn set_tail(&mut self, tail: u64);
    fn data_size(&self) -> u64;

    /// Copy `out.len()` bytes from `offset` in the data region. The range
    /// never crosses the end of the region.
    fn copy_data(&self, offset: usize, out: &mut [u8]);
}

/// Something that can attribute new samples to regions.
pub trait SampleRing {
    fn drain(&mut self, tid: i32, regions: &[Region], counts: &mut SampleCounts)
        -> DecodeStatus;
}

/// Decodes records from a [`RingBuffer`].
pub struct RingDecoder<B: RingBuffer> {
    buf: B,
    scratch: Vec<u8>,
}

impl<B: RingBuffer> RingDecoder<B> {
    pub fn new(buf: B) -> Self {
        Self { buf, scratch: Vec::new() }
    }

    pub fn buffer(&self) -> &B { &self.buf }

    /// Copy `len` bytes at ring position `pos` into the scratch buffer,
    /// reassembling records that wrap around the end of the data region.
    fn fetch(&mut self, pos: u64, len: usize) {
        let size = self.buf.data_size();
        let off = (pos % size) as usize;
        self.scratch.resize(len, 0);
        let first = len.min(size as usize - off);
        self.buf.copy_data(off, &mut self.scratch[..first]);
        if first < len {
            self.buf.copy_data(0, &mut self.scratch[first..]);
        }
    }

    /// Apply every record between the published tail and the current head.
    pub fn decode(&mut self, tid: i32, regions: &[Region], counts: &mut SampleCounts)
        -> DecodeStatus
    {
        let seq = self.buf.seq();
        let head = self.buf.head();
        fence(Ordering::Acquire);

        let mut status = DecodeStatus::Complete;
        let mut pos = self.buf.tail();
        let (mut hits, mut ignored) = (0usize, 0usize);
        while pos < head {
            self.fetch(pos, HEADER_SIZE);
            let data_size = self.buf.data_size();
            let hdr = match RecordHeader::parse(&self.scratch)
                .and_then(|hdr| hdr.check_span(pos, head, data_size).map(|_| hdr))
            {
                Ok(hdr) => hdr,
                Err(e) => {
                    tracing::warn!(tid, pos, error = %e, "bad record in sampling ring");
                    status = DecodeStatus::Corrupt;
                    pos = head;
                    break;
                },
            };
            self.fetch(pos, hdr.size as usize);

            match hdr.kind {
                RecordKind::Sample => match SampleRecord::parse(&self.scratch) {
                    Ok(s) if s.tid == tid as u32 => {
                        if let Some(j) = regions.iter().position(|r| r.contains(s.addr)) {
                            if let Some(c) = counts.per_region.get_mut(j) {
                                *c += 1;
                                hits += 1;
                            }
                        }
                        counts.llc_miss = s.value;
                    },
                    Ok(_) => ignored += 1,
                    Err(e) => {
                        tracing::debug!(tid, error = %e, "short sample record");
                        ignored += 1;
                    },
                },
                kind => {
                    tracing::debug!(tid, ?kind, "ignoring record");
                    ignored += 1;
                },
            }
            pos += hdr.size as u64;
        }

        fence(Ordering::Release);
        self.buf.set_tail(pos.min(head));
        if self.buf.seq() != seq && status == DecodeStatus::Complete {
            tracing::debug!(tid, "sampling ring header changed during read");
            status = DecodeStatus::Torn;
        }

        counts.total = counts.per_region.iter().sum();
        tracing::trace!(tid, hits, ignored, total = counts.total, "decoded samples");
        status
    }
}

impl<B: RingBuffer> SampleRing for RingDecoder<B> {
    fn drain(&mut self, tid: i32, regions: &[Region], counts: &mut SampleCounts)
        -> DecodeStatus
    {
        self.decode(tid, regions, counts)
    }
}

/// A sampling counter on one thread, with its ring mapped into our
/// address space.
pub struct PebsRing {
    counter: RawCounter,
    map: MmapRaw,
}

impl PebsRing {
    const PAGE_SIZE: usize = 4096;

    /// Number of data pages following the header page.
    const DATA_PAGES: usize = 1;

    /// Open and enable a sampling counter on `tid`, sampling one in
    /// every `period` LLC misses.
    pub fn open(tid: i32, period: u64) -> Result<Self, EmulError> {
        let mut attrs = perf_event_attr {
            type_: bindings::PERF_TYPE_RAW,
            config: PEBS_LLC_MISS.config(),
            sample_type: (bindings::PERF_SAMPLE_TID
                | bindings::PERF_SAMPLE_ADDR
                | bindings::PERF_SAMPLE_READ
                | bindings::PERF_SAMPLE_PHYS_ADDR) as u64,
            read_format: bindings::PERF_FORMAT_TOTAL_TIME_ENABLED as u64,
            ..Default::default()
        };
        attrs.__bindgen_anon_1.sample_period = period;
        attrs.__bindgen_anon_3.config1 = PEBS_LLC_MISS.config1();
        attrs.set_disabled(1);
        attrs.set_precise_ip(1);
        attrs.set_exclude_kernel(1);

        let mut counter = RawCounter::open(&mut attrs, tid, -1,
            format!("tid{}/{}", tid, PEBS_LLC_MISS.name()))?;
        let map = MmapOptions::new()
            .len(Self::PAGE_SIZE * (1 + Self::DATA_PAGES))
            .map_raw(counter.file())
            .map_err(|source| EmulError::Ring { tid, source })?;

        counter.reset()?;
        counter.enable()?;
        tracing::debug!(tid, period, "opened sampling ring");
        Ok(Self { counter, map })
    }

    fn page(&self) -> *mut perf_event_mmap_page {
        self.map.as_mut_ptr() as *mut perf_event_mmap_page
    }
}

impl RingBuffer for PebsRing {
    fn seq(&self) -> u32 {
        unsafe { std::ptr::addr_of!((*self.page()).lock).read_volatile() }
    }
    fn head(&self) -> u64 {
        unsafe { std::ptr::addr_of!((*self.page()).data_head).read_volatile() }
    }
    fn tail(&self) -> u64 {
        unsafe { std::ptr::addr_of!((*self.page()).data_tail).read_volatile() }
    }
    fn set_tail(&mut self, tail: u64) {
        unsafe { std::ptr::addr_of_mut!((*self.page()).data_tail).write_volatile(tail) }
    }
    fn data_size(&self) -> u64 {
        (Self::PAGE_SIZE * Self::DATA_PAGES) as u64
    }
    fn copy_data(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= Self::PAGE_SIZE * Self::DATA_PAGES);
        unsafe {
            let src = self.map.as_ptr().add(Self::PAGE_SIZE + offset);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
    }
}

impl Drop for PebsRing {
    fn drop(&mut self) {
        if let Err(e) = self.counter.disable() {
            tracing::warn!(error = %e, "couldn't disable sampling counter");
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use record::{SAMPLE_SIZE, PERF_RECORD_LOST};
    use std::cell::Cell;

    /// An in-memory ring. `bump_seq` makes the sequence lock change
    /// between the first and second read.
    pub(crate) struct VecRing {
        pub data: Vec<u8>,
        pub head: u64,
        pub tail: u64,
        pub bump_seq: bool,
        seq_reads: Cell<u32>,
    }

    impl VecRing {
        pub fn new(size: usize) -> Self {
            Self { data: vec![0; size], head: 0, tail: 0, bump_seq: false,
                seq_reads: Cell::new(0) }
        }

        /// Write a record at the current head.
        pub fn push(&mut self, rec: &[u8]) {
            let size = self.data.len() as u64;
            for (i, b) in rec.iter().enumerate() {
                let off = ((self.head + i as u64) % size) as usize;
                self.data[off] = *b;
            }
            self.head += rec.len() as u64;
        }

        pub fn push_sample(&mut self, tid: u32, addr: u64, value: u64) {
            let s = SampleRecord { pid: tid, tid, addr, value, time_enabled: 0,
                phys_addr: 0 };
            self.push(&s.to_bytes());
        }
    }

    impl RingBuffer for VecRing {
        fn seq(&self) -> u32 {
            let n = self.seq_reads.get();
            self.seq_reads.set(n + 1);
            if self.bump_seq { n } else { 0 }
        }
        fn head(&self) -> u64 { self.head }
        fn tail(&self) -> u64 { self.tail }
        fn set_tail(&mut self, tail: u64) { self.tail = tail; }
        fn data_size(&self) -> u64 { self.data.len() as u64 }
        fn copy_data(&self, offset: usize, out: &mut [u8]) {
            out.copy_from_slice(&self.data[offset..offset + out.len()]);
        }
    }

    fn regions() -> Vec<Region> {
        vec![Region::new(0x1000, 0x1000), Region::new(0x8000, 0x2000)]
    }

    #[test]
    fn sample_lands_in_one_region() {
        let mut ring = VecRing::new(4096);
        ring.push_sample(7, 0x8800, 500);
        let mut dec = RingDecoder::new(ring);
        let mut counts = SampleCounts::new(2);
        assert_eq!(dec.decode(7, &regions(), &mut counts), DecodeStatus::Complete);
        assert_eq!(counts.per_region, vec![0, 1]);
        assert_eq!(counts.total, 1);
        assert_eq!(counts.llc_miss, 500);
        assert_eq!(dec.buffer().tail, SAMPLE_SIZE as u64);
    }

    #[test]
    fn sample_outside_regions() {
        let mut ring = VecRing::new(4096);
        ring.push_sample(7, 0x4000, 3);
        ring.push_sample(7, 0xa000, 4);
        let mut dec = RingDecoder::new(ring);
        let mut counts = SampleCounts::new(2);
        dec.decode(7, &regions(), &mut counts);
        assert_eq!(counts.per_region, vec![0, 0]);
        assert_eq!(counts.total, 0);
        assert_eq!(counts.llc_miss, 4);
    }

    #[test]
    fn other_thread_ignored() {
        let mut ring = VecRing::new(4096);
        ring.push_sample(8, 0x1800, 3);
        let mut dec = RingDecoder::new(ring);
        let mut counts = SampleCounts::new(2);
        dec.decode(7, &regions(), &mut counts);
        assert_eq!(counts.total, 0);
        assert_eq!(counts.llc_miss, 0);
    }

    #[test]
    fn lost_records_skipped() {
        let mut ring = VecRing::new(4096);
        let mut lost = [0u8; 24];
        lost[0..4].copy_from_slice(&PERF_RECORD_LOST.to_ne_bytes());
        lost[6..8].copy_from_slice(&24u16.to_ne_bytes());
        ring.push(&lost);
        ring.push_sample(7, 0x1000, 9);
        let mut dec = RingDecoder::new(ring);
        let mut counts = SampleCounts::new(2);
        assert_eq!(dec.decode(7, &regions(), &mut counts), DecodeStatus::Complete);
        assert_eq!(counts.per_region, vec![1, 0]);
        assert_eq!(dec.buffer().tail, 24 + SAMPLE_SIZE as u64);
    }

    #[test]
    fn record_wraps_around() {
        // 128-byte ring: the third sample starts at offset 96 and wraps.
        let mut ring = VecRing::new(128);
        ring.push_sample(7, 0x1000, 1);
        ring.push_sample(7, 0x1000, 2);
        ring.tail = ring.head;
        ring.push_sample(7, 0x9000, 3);
        let mut dec = RingDecoder::new(ring);
        let mut counts = SampleCounts::new(2);
        assert_eq!(dec.decode(7, &regions(), &mut counts), DecodeStatus::Complete);
        assert_eq!(counts.per_region, vec![0, 1]);
        assert_eq!(counts.llc_miss, 3);
    }

    #[test]
    fn counts_accumulate_across_passes() {
        let mut dec = RingDecoder::new(VecRing::new(4096));
        let mut counts = SampleCounts::new(2);
        dec.buf.push_sample(7, 0x1000, 1);
        dec.decode(7, &regions(), &mut counts);
        dec.buf.push_sample(7, 0x1100, 2);
        dec.buf.push_sample(7, 0x9000, 3);
        dec.decode(7, &regions(), &mut counts);
        assert_eq!(counts.per_region, vec![2, 1]);
        assert_eq!(counts.total, 3);
    }

    #[test]
    fn torn_pass_keeps_applied_records() {
        let mut ring = VecRing::new(4096);
        ring.bump_seq = true;
        ring.push_sample(7, 0x1000, 1);
        let mut dec = RingDecoder::new(ring);
        let mut counts = SampleCounts::new(2);
        assert_eq!(dec.decode(7, &regions(), &mut counts), DecodeStatus::Torn);
        assert_eq!(counts.per_region, vec![1, 0]);
        assert_eq!(dec.buffer().tail, SAMPLE_SIZE as u64);
    }

    fn lost_header(size: u16) -> [u8; 8] {
        let mut hdr = [0u8; 8];
        hdr[0..4].copy_from_slice(&PERF_RECORD_LOST.to_ne_bytes());
        hdr[6..8].copy_from_slice(&size.to_ne_bytes());
        hdr
    }

    #[test]
    fn oversized_record_is_corrupt() {
        let mut ring = VecRing::new(4096);
        ring.push(&lost_header(u16::MAX));
        // A full ring: everything up to the head is readable, but the
        // record is still larger than the data region.
        ring.head = 4096;
        let mut dec = RingDecoder::new(ring);
        let mut counts = SampleCounts::new(2);
        assert_eq!(dec.decode(7, &regions(), &mut counts), DecodeStatus::Corrupt);
        assert_eq!(dec.buffer().tail, 4096);
        assert_eq!(counts.total, 0);
    }

    #[test]
    fn record_past_head_is_corrupt() {
        let mut ring = VecRing::new(4096);
        ring.push_sample(7, 0x1000, 1);
        ring.push(&lost_header(8000));
        let mut dec = RingDecoder::new(ring);
        let mut counts = SampleCounts::new(2);
        assert_eq!(dec.decode(7, &regions(), &mut counts), DecodeStatus::Corrupt);
        // The sample before the bad header still counts; the tail never
        // moves beyond the head.
        assert_eq!(counts.per_region, vec![1, 0]);
        assert_eq!(dec.buffer().tail, dec.buffer().head);
        assert_eq!(dec.buffer().head, SAMPLE_SIZE as u64 + 8);
    }

    #[test]
    fn zero_size_header_is_corrupt() {
        let mut ring = VecRing::new(4096);
        ring.push(&[9, 0, 0, 0, 0, 0, 0, 0]);
        let mut dec = RingDecoder::new(ring);
        let mut counts = SampleCounts::new(2);
        assert_eq!(dec.decode(7, &regions(), &mut counts), DecodeStatus::Corrupt);
        assert_eq!(dec.buffer().tail, 8);
    }
}
