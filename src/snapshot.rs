//! Counter snapshots, double-buffered per monitored target.

/// In-core counter values for a single CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreCounts {
    pub dram_reads: u64,
    pub l2_stall: u64,
    pub llc_hits: u64,
    pub llc_miss: u64,
}

/// Cumulative values decoded from a target's sampling ring.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleCounts {
    /// Sum of `per_region`.
    pub total: u64,

    /// Most recent value of the sampled LLC-miss counter.
    pub llc_miss: u64,

    /// Samples attributed to each region.
    pub per_region: Vec<u64>,
}

impl SampleCounts {
    pub fn new(regions: usize) -> Self {
        Self { total: 0, llc_miss: 0, per_region: vec![0; regions] }
    }
}

/// One side (before/after) of a target's counter state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// LLC writebacks, one value per cache agent.
    pub writeback: Vec<u64>,

    /// In-core counters, one entry per online CPU.
    pub cores: Vec<CoreCounts>,

    pub samples: SampleCounts,
}

impl Snapshot {
    pub fn new(cbo_count: usize, cpu_count: usize) -> Self {
        Self {
            writeback: vec![0; cbo_count],
            cores: vec![CoreCounts::default(); cpu_count],
            samples: SampleCounts::default(),
        }
    }

    /// Zero all values, keeping the shape.
    pub fn clear(&mut self) {
        self.writeback.iter_mut().for_each(|v| *v = 0);
        self.cores.iter_mut().for_each(|c| *c = CoreCounts::default());
        self.samples = SampleCounts::new(self.samples.per_region.len());
    }
}

/// The "before" and "after" snapshots of a target.
///
/// The two buffers are swapped after each measurement, never copied.
#[derive(Clone, Debug)]
pub struct SnapshotPair {
    bufs: [Snapshot; 2],
    after: usize,
}

impl SnapshotPair {
    pub fn new(cbo_count: usize, cpu_count: usize) -> Self {
        Self {
            bufs: [
                Snapshot::new(cbo_count, cpu_count),
                Snapshot::new(cbo_count, cpu_count),
            ],
            after: 1,
        }
    }

    pub fn before(&self) -> &Snapshot { &self.bufs[self.after ^ 1] }
    pub fn after(&self) -> &Snapshot { &self.bufs[self.after] }
    pub fn before_mut(&mut self) -> &mut Snapshot { &mut self.bufs[self.after ^ 1] }
    pub fn after_mut(&mut self) -> &mut Snapshot { &mut self.bufs[self.after] }

    /// Make "after" the new "before".
    pub fn swap(&mut self) {
        self.after ^= 1;
    }

    /// Copy the cumulative sample counters from "after" into "before".
    ///
    /// Sample counts are accumulated in place by the ring decoder, so once
    /// a measurement has consumed them both sides must agree before the
    /// buffers are swapped.
    pub fn carry_samples(&mut self) {
        let (lo, hi) = self.bufs.split_at_mut(1);
        let (before, after) = if self.after == 1 {
            (&mut lo[0], &hi[0])
        } else {
            (&mut hi[0], &lo[0])
        };
        before.samples.clone_from(&after.samples);
    }

    /// Zero both sides and size the sample counters for `regions`.
    pub fn reset(&mut self, regions: usize) {
        for buf in self.bufs.iter_mut() {
            buf.clear();
            buf.samples = SampleCounts::new(regions);
        }
        self.after = 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn swap_exchanges_sides() {
        let mut pair = SnapshotPair::new(2, 4);
        pair.after_mut().writeback[0] = 10;
        pair.before_mut().writeback[0] = 3;
        pair.swap();
        assert_eq!(pair.before().writeback[0], 10);
        assert_eq!(pair.after().writeback[0], 3);
        pair.swap();
        assert_eq!(pair.before().writeback[0], 3);
    }

    #[test]
    fn carry_samples_both_directions() {
        let mut pair = SnapshotPair::new(1, 1);
        pair.reset(2);
        pair.after_mut().samples.per_region[1] = 7;
        pair.after_mut().samples.total = 7;
        pair.after_mut().samples.llc_miss = 99;
        pair.carry_samples();
        assert_eq!(pair.before().samples, pair.after().samples);

        pair.swap();
        pair.after_mut().samples.per_region[0] = 1;
        pair.carry_samples();
        assert_eq!(pair.before().samples.per_region, vec![1, 7]);
    }

    #[test]
    fn reset_sizes_samples() {
        let mut pair = SnapshotPair::new(3, 2);
        pair.after_mut().cores[1].llc_miss = 5;
        pair.reset(4);
        assert_eq!(pair.after().cores[1].llc_miss, 0);
        assert_eq!(pair.before().samples.per_region.len(), 4);
        assert_eq!(pair.after().writeback.len(), 3);
    }
}
