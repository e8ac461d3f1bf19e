//! Raw hardware event encodings for the supported Intel server parts.

/// Representation of an event mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaskDesc {
    mask: u8,
    name: &'static str,
}
impl MaskDesc {
    pub const fn new(mask: u8, name: &'static str) -> Self {
        Self { mask, name }
    }
}

/// Representation of a raw event, used for formatting output and for
/// building the `config`/`config1` values passed to `perf_event_open()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventDesc {
    id: u8,
    mask: MaskDesc,
    cmask: u8,
    offcore_rsp: u64,
    name: &'static str,
}
impl EventDesc {
    pub const fn new(id: u8, name: &'static str, mask: MaskDesc) -> Self {
        Self { id, mask, cmask: 0, offcore_rsp: 0, name }
    }

    /// Count cycles where at least `cmask` events occurred.
    pub const fn cmask(mut self, cmask: u8) -> Self {
        self.cmask = cmask;
        self
    }

    /// Attach an offcore response selector (passed through `config1`).
    pub const fn offcore(mut self, rsp: u64) -> Self {
        self.offcore_rsp = rsp;
        self
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.name, self.mask.name)
    }
    pub fn id(&self) -> u8 { self.id }
    pub fn mask(&self) -> u8 { self.mask.mask }
    pub fn config1(&self) -> u64 { self.offcore_rsp }

    /// Generate the config bits for the raw perf_event.
    pub fn config(&self) -> u64 {
        make_perf_cfg_intel(self.id, self.mask.mask, self.cmask)
    }
}

/// Intel raw event layout: `cmask[31:24] | umask[15:8] | event[7:0]`.
pub const fn make_perf_cfg_intel(event: u8, mask: u8, cmask: u8) -> u64 {
    ((cmask as u64) << 24) | ((mask as u64) << 8) | event as u64
}

/// Supported CPU models (family 6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuModel {
    BroadwellX = 79,
    SkylakeX = 85,
}

/// The set of events needed to drive the delay model on a particular part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelEvents {
    pub model: CpuModel,

    /// Prefix of the uncore cache-agent PMUs under
    /// `/sys/bus/event_source/devices`.
    pub uncore_prefix: &'static str,

    /// LLC writebacks, counted per cache agent.
    pub cbo_writeback: EventDesc,

    /// All DRAM reads (demand + prefetch) via the offcore response counter.
    pub dram_reads: EventDesc,

    /// Cycles stalled with an outstanding L2 miss.
    pub l2_stall: EventDesc,

    pub llc_hits: EventDesc,
    pub llc_miss: EventDesc,
}

const L2_STALL: EventDesc = EventDesc::new(0xa3, "cycle_activity",
    MaskDesc::new(0x05, "stalls_l2_miss")).cmask(5);
const LLC_HITS: EventDesc = EventDesc::new(0xd2, "mem_load_l3_hit_retired",
    MaskDesc::new(0x08, "xsnp_none"));
const LLC_MISS: EventDesc = EventDesc::new(0xd3, "mem_load_l3_miss_retired",
    MaskDesc::new(0x01, "local_dram"));

static MODEL_TABLE: [ModelEvents; 2] = [
    ModelEvents {
        model: CpuModel::BroadwellX,
        uncore_prefix: "uncore_cbox_",
        cbo_writeback: EventDesc::new(0x37, "llc_victims",
            MaskDesc::new(0x01, "m_state")),
        dram_reads: EventDesc::new(0xb7, "offcore_response",
            MaskDesc::new(0x01, "all_reads_llc_miss_dram"))
            .offcore(0x6_0400_07f7),
        l2_stall: L2_STALL,
        llc_hits: LLC_HITS,
        llc_miss: LLC_MISS,
    },
    ModelEvents {
        model: CpuModel::SkylakeX,
        uncore_prefix: "uncore_cha_",
        cbo_writeback: EventDesc::new(0x37, "llc_victims",
            MaskDesc::new(0x21, "total_m")),
        dram_reads: EventDesc::new(0xb7, "offcore_response",
            MaskDesc::new(0x01, "all_reads_l3_miss_local_dram"))
            .offcore(0xbc00_07f7),
        l2_stall: L2_STALL,
        llc_hits: LLC_HITS,
        llc_miss: LLC_MISS,
    },
];

impl ModelEvents {
    /// Look up the event table for a family 6 model number.
    pub fn for_model(model: u32) -> Option<&'static ModelEvents> {
        MODEL_TABLE.iter().find(|e| e.model as u32 == model)
    }

    pub fn supported_models() -> impl Iterator<Item = CpuModel> {
        MODEL_TABLE.iter().map(|e| e.model)
    }
}

/// Precise sampling event used to attribute LLC misses to address regions.
pub const PEBS_LLC_MISS: EventDesc = EventDesc::new(0xd1, "mem_load_retired",
    MaskDesc::new(0x20, "l3_miss")).offcore(3);
