//! Emulator configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use itertools::Itertools;

use crate::delay::{DelayModel, NvmLatency};
use crate::error::EmulError;
use crate::protocol::DEFAULT_SOCKET_PATH;
use crate::util::parse_core_mask;

/// A set of cores given as a hexadecimal mask (ie. `0xf0`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreMask(pub Vec<usize>);

fn parse_mask(s: &str) -> Result<CoreMask, String> {
    parse_core_mask(s).map(CoreMask)
        .ok_or_else(|| format!("'{}' is not a hexadecimal cpu mask", s))
}

/// Emulate the access latency of slower memory tiers on DRAM.
#[derive(Parser, Debug)]
#[command(name = "mes", version)]
pub struct EmulatorArgs {
    /// Emulated latencies in ns: READ WRITE [READ WRITE ...], one pair per
    /// memory tier.
    #[arg(required = true, value_name = "LATENCY_NS")]
    pub latencies: Vec<f64>,

    /// Epoch length in milliseconds.
    #[arg(short = 'i', long, default_value_t = 20)]
    pub interval: u64,

    /// Cores usable for monitored targets, as a hexadecimal mask.
    #[arg(short = 'c', long = "cpuset", value_parser = parse_mask)]
    pub cpuset: Option<CoreMask>,

    /// Sampling period for hybrid-memory targets.
    #[arg(short = 'p', long = "pebsperiod", default_value_t = 1)]
    pub pebs_period: u64,

    /// DRAM access latency in ns.
    #[arg(short = 'l', long = "latency", default_value_t = 85.7)]
    pub dram_latency: f64,

    /// Relative cost of an LLC miss versus an LLC hit.
    #[arg(short = 'w', long, default_value_t = 4.2)]
    pub weight: f64,

    /// CPU frequency in MHz (default: from /proc/cpuinfo).
    #[arg(short = 'f', long = "cpufreq")]
    pub cpu_freq: Option<f64>,

    /// Exit once every target has terminated (requires --target).
    #[arg(short = 'o', long)]
    pub oneshot: bool,

    /// Program to launch and monitor.
    #[arg(short = 't', long)]
    pub target: Option<PathBuf>,

    /// Argument passed to the target; repeat for more.
    #[arg(short = 'a', long = "targetargs", allow_hyphen_values = true)]
    pub target_args: Vec<String>,

    /// Path of the lifecycle notification socket.
    #[arg(short = 's', long, default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,

    /// Log filter (ie. "info", "mesmeric=debug").
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Validated emulator settings.
#[derive(Clone, Debug, PartialEq)]
pub struct EmulatorConfig {
    /// Length of one epoch.
    pub interval: Duration,

    /// Cores usable for monitored targets; `None` means every online CPU.
    pub cores: Option<Vec<usize>>,

    pub pebs_period: u64,
    pub dram_latency: f64,
    pub weight: f64,

    /// Overrides the frequency reported by the host.
    pub cpu_freq: Option<f64>,

    pub oneshot: bool,

    /// Emulated latency of each memory tier.
    pub tiers: Vec<NvmLatency>,

    pub target: Option<PathBuf>,
    pub target_args: Vec<String>,
    pub socket_path: PathBuf,
}

impl EmulatorConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(20);
    pub const DEFAULT_DRAM_LATENCY: f64 = 85.7;
    pub const DEFAULT_WEIGHT: f64 = 4.2;

    pub fn new(tiers: Vec<NvmLatency>) -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            cores: None,
            pebs_period: 1,
            dram_latency: Self::DEFAULT_DRAM_LATENCY,
            weight: Self::DEFAULT_WEIGHT,
            cpu_freq: None,
            oneshot: false,
            tiers,
            target: None,
            target_args: Vec::new(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }

    pub fn interval(mut self, x: Duration) -> Self {
        self.interval = x;
        self
    }
    pub fn cores(mut self, x: Vec<usize>) -> Self {
        self.cores = Some(x);
        self
    }
    pub fn pebs_period(mut self, x: u64) -> Self {
        self.pebs_period = x;
        self
    }
    pub fn dram_latency(mut self, x: f64) -> Self {
        self.dram_latency = x;
        self
    }
    pub fn weight(mut self, x: f64) -> Self {
        self.weight = x;
        self
    }
    pub fn cpu_freq(mut self, x: f64) -> Self {
        self.cpu_freq = Some(x);
        self
    }
    pub fn oneshot(mut self, x: bool) -> Self {
        self.oneshot = x;
        self
    }
    pub fn target(mut self, program: PathBuf, args: Vec<String>) -> Self {
        self.target = Some(program);
        self.target_args = args;
        self
    }
    pub fn socket_path(mut self, x: PathBuf) -> Self {
        self.socket_path = x;
        self
    }

    /// Accumulated sub-epoch residue is forgiven until it reaches this.
    pub fn squabble_limit(&self) -> Duration {
        self.interval
    }
}

impl EmulatorConfig {
    pub fn from_cmdline_args(args: &EmulatorArgs) -> Result<Self, EmulError> {
        if args.latencies.len() % 2 != 0 {
            return Err(EmulError::Config(
                "latencies must be given as READ WRITE pairs".to_string()
            ));
        }
        let tiers = args.latencies.iter()
            .tuples()
            .map(|(r, w)| NvmLatency::new(*r, *w))
            .collect();

        let mut cfg = Self::new(tiers)
            .interval(Duration::from_millis(args.interval))
            .pebs_period(args.pebs_period)
            .dram_latency(args.dram_latency)
            .weight(args.weight)
            .socket_path(args.socket.clone());
        // An all-zero mask selects every core.
        if let Some(CoreMask(cores)) = &args.cpuset {
            if !cores.is_empty() {
                cfg = cfg.cores(cores.clone());
            }
        }
        if let Some(f) = args.cpu_freq {
            cfg = cfg.cpu_freq(f);
        }
        if let Some(t) = &args.target {
            cfg = cfg.target(t.clone(), args.target_args.clone());
        }
        if args.oneshot && cfg.target.is_none() {
            tracing::warn!("--oneshot has no effect without --target");
        }
        let oneshot = args.oneshot && cfg.target.is_some();
        cfg = cfg.oneshot(oneshot);

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the delay model can't work with.
    pub fn validate(&self) -> Result<(), EmulError> {
        let fail = |msg: String| Err(EmulError::Config(msg));
        if self.interval.is_zero() {
            return fail("interval must be non-zero".to_string());
        }
        if self.pebs_period == 0 {
            return fail("sampling period must be non-zero".to_string());
        }
        if !(self.dram_latency > 0.0) {
            return fail(format!("DRAM latency {} must be positive", self.dram_latency));
        }
        if !(self.weight >= 0.0) {
            return fail(format!("weight {} must not be negative", self.weight));
        }
        if let Some(f) = self.cpu_freq {
            if !(f > 0.0) {
                return fail(format!("cpu frequency {} must be positive", f));
            }
        }
        if self.tiers.is_empty() {
            return fail("at least one READ WRITE latency pair is required".to_string());
        }
        for (j, t) in self.tiers.iter().enumerate() {
            if t.read <= self.dram_latency || t.write <= self.dram_latency {
                return fail(format!(
                    "tier {} latency ({}, {}) must exceed the DRAM latency {}",
                    j, t.read, t.write, self.dram_latency
                ));
            }
        }
        if let Some(cores) = &self.cores {
            if cores.is_empty() {
                return fail("cpu mask selects no cores".to_string());
            }
        }
        Ok(())
    }

    /// The cores monitor slots are bound to, given `online` CPUs.
    pub fn select_cores(&self, online: usize) -> Result<Vec<usize>, EmulError> {
        let cores: Vec<usize> = match &self.cores {
            None => (0..online).collect(),
            Some(mask) => mask.iter().copied()
                .filter(|&c| c < online)
                .sorted()
                .dedup()
                .collect(),
        };
        if cores.is_empty() {
            return Err(EmulError::Config(
                format!("no usable cores among {} online CPUs", online)
            ));
        }
        Ok(cores)
    }

    pub fn delay_model(&self, cpu_mhz: f64) -> DelayModel {
        DelayModel {
            dram_latency: self.dram_latency,
            weight: self.weight,
            cpu_mhz: self.cpu_freq.unwrap_or(cpu_mhz),
            tiers: self.tiers.clone(),
        }
    }

    /// Print the settings in effect.
    pub fn emit(&self) {
        println!("[*] emulator configuration:");
        println!("  {:<40}: {:?}", "epoch", self.interval);
        println!("  {:<40}: {}", "DRAM latency (ns)", self.dram_latency);
        println!("  {:<40}: {}", "weight", self.weight);
        println!("  {:<40}: {}", "sampling period", self.pebs_period);
        for (j, t) in self.tiers.iter().enumerate() {
            println!("  {:<40}: read={} write={}", format!("tier {} latency (ns)", j),
                t.read, t.write);
        }
        if let Some(t) = &self.target {
            println!("  {:<40}: {} {}", "target", t.display(), self.target_args.join(" "));
        }
        println!("  {:<40}: {}", "oneshot", self.oneshot);
    }
}
