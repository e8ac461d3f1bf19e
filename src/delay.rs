//! Mapping counter deltas to an emulated delay.
//!
//! Each epoch the LLC misses of a target are split into misses that
//! involved a writeback and read-only misses. The cycles stalled on those
//! misses are converted into a number of memory accesses, and each access
//! is charged the difference between the emulated and DRAM latency.
//!
//! The writeback share, the stall estimates, the access counts and the
//! delay (ns) are truncated to whole numbers as they are computed.

use std::time::Duration;

use crate::snapshot::{SampleCounts, Snapshot, SnapshotPair};

/// Emulated read/write latency (ns) of one memory tier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NvmLatency {
    pub read: f64,
    pub write: f64,
}

impl NvmLatency {
    pub const fn new(read: f64, write: f64) -> Self {
        Self { read, write }
    }
}

/// Counter deltas for one target over one epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EpochCounters {
    /// LLC writebacks, summed over all cache agents.
    pub wb: u64,

    /// DRAM reads, summed over all CPUs.
    pub dram_rds: u64,

    /// LLC misses of the target.
    pub miss: u64,

    /// L2-miss stall cycles of the target's core.
    pub stall: u64,

    /// LLC hits of the target's core.
    pub hits: u64,
}

impl EpochCounters {
    /// Take the deltas between `before` and `after`. For hybrid targets the
    /// LLC misses come from the sampled counter instead of the core.
    pub fn measure(before: &Snapshot, after: &Snapshot, core: usize, hybrid: bool) -> Self {
        let wb = after.writeback.iter().zip(before.writeback.iter())
            .map(|(a, b)| a.saturating_sub(*b))
            .sum();
        let dram_rds = after.cores.iter().zip(before.cores.iter())
            .map(|(a, b)| a.dram_reads.saturating_sub(b.dram_reads))
            .sum();
        let (a, b) = (after.cores[core], before.cores[core]);
        let miss = if hybrid {
            after.samples.llc_miss.saturating_sub(before.samples.llc_miss)
        } else {
            a.llc_miss.saturating_sub(b.llc_miss)
        };
        Self {
            wb,
            dram_rds,
            miss,
            stall: a.l2_stall.saturating_sub(b.l2_stall),
            hits: a.llc_hits.saturating_sub(b.llc_hits),
        }
    }
}

/// LLC misses split by whether they involved a writeback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MissSplit {
    pub wb: u64,
    pub ro: u64,

    /// False if the counters didn't allow a proportional split and every
    /// miss was charged as a writeback miss.
    pub consistent: bool,
}

impl MissSplit {
    pub fn from_counters(c: &EpochCounters) -> Self {
        let consistent = c.wb <= c.dram_rds && c.miss <= c.dram_rds && c.dram_rds > 0;
        let mut wb = if consistent {
            (c.wb as f64 * (c.miss as f64 / c.dram_rds as f64)) as u64
        } else {
            c.miss
        };
        let ro = if c.miss < wb {
            wb = c.miss;
            0
        } else {
            c.miss - wb
        };
        Self { wb, ro, consistent }
    }
}

/// Intermediate values of one delay computation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelayEstimate {
    pub counters: EpochCounters,
    pub split: MissSplit,
    pub stall_wb: u64,
    pub stall_ro: u64,
    pub ma_wb: u64,
    pub ma_ro: u64,
    pub delay_ns: u64,
}

/// Parameters of the delay model.
#[derive(Clone, Debug, PartialEq)]
pub struct DelayModel {
    /// DRAM access latency (ns).
    pub dram_latency: f64,

    /// Relative cost of an LLC miss versus an LLC hit.
    pub weight: f64,

    pub cpu_mhz: f64,

    /// One entry per memory tier; only the first is used for targets
    /// without regions.
    pub tiers: Vec<NvmLatency>,
}

impl DelayModel {
    /// Stall time (ns) attributable to `miss_x` of the epoch's misses.
    pub fn stall_ns(&self, c: &EpochCounters, miss_x: u64) -> u64 {
        if c.hits == 0 && c.miss == 0 {
            return 0;
        }
        let share = (self.weight * miss_x as f64)
            / (c.hits as f64 + self.weight * c.miss as f64);
        ((c.stall as f64 / self.cpu_mhz) * share * 1000.0) as u64
    }

    /// Number of memory accesses that fit in `stall_ns`.
    pub fn accesses(&self, stall_ns: u64) -> u64 {
        (stall_ns as f64 / self.dram_latency) as u64
    }

    /// Share of the epoch's samples that landed in each region; equal
    /// shares when there were none.
    pub fn region_weights(before: &SampleCounts, after: &SampleCounts) -> Vec<f64> {
        let n = after.per_region.len();
        let total = after.total.saturating_sub(before.total);
        if total == 0 {
            return vec![1.0 / n as f64; n];
        }
        after.per_region.iter().zip(before.per_region.iter())
            .map(|(a, b)| a.saturating_sub(*b) as f64 / total as f64)
            .collect()
    }

    /// Compute the delay for a single epoch. `weights` is `Some` for
    /// hybrid-memory targets.
    pub fn estimate(&self, counters: EpochCounters, weights: Option<&[f64]>) -> DelayEstimate {
        let split = MissSplit::from_counters(&counters);
        if !split.consistent {
            tracing::warn!(wb = counters.wb, miss = counters.miss,
                dram_rds = counters.dram_rds,
                "inconsistent counters; charging all misses as writebacks");
        }
        let stall_wb = self.stall_ns(&counters, split.wb);
        let stall_ro = self.stall_ns(&counters, split.ro);
        let ma_wb = self.accesses(stall_wb);
        let ma_ro = self.accesses(stall_ro);

        let dram = self.dram_latency;
        let delay_ns = match weights {
            None => {
                let tier = self.tiers[0];
                (ma_ro as f64 * (tier.read - dram) + ma_wb as f64 * (tier.write - dram)) as u64
            },
            Some(weights) => {
                let mut delay: u64 = 0;
                for (tier, w) in self.tiers.iter().zip(weights.iter()) {
                    delay = (delay as f64
                        + ma_ro as f64 * w * (tier.read - dram)
                        + ma_wb as f64 * w * (tier.write - dram)) as u64;
                }
                delay
            },
        };

        DelayEstimate { counters, split, stall_wb, stall_ro, ma_wb, ma_ro, delay_ns }
    }

    /// Compute the delay of the target bound to `core` from its snapshots.
    pub fn compute(&self, pair: &SnapshotPair, core: usize, hybrid: bool) -> DelayEstimate {
        let (before, after) = (pair.before(), pair.after());
        let counters = EpochCounters::measure(before, after, core, hybrid);
        if hybrid {
            let weights = Self::region_weights(&before.samples, &after.samples);
            self.estimate(counters, Some(weights.as_slice()))
        } else {
            self.estimate(counters, None)
        }
    }
}

/// Subtract the time spent measuring and signalling from a delay.
pub fn calibrate(delay_ns: u64, overhead: Duration) -> u64 {
    let overhead = u64::try_from(overhead.as_nanos()).unwrap_or(u64::MAX);
    delay_ns.saturating_sub(overhead)
}
