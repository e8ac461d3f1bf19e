use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mesmeric::launch::{reap_children_automatically, spawn_target};
use mesmeric::monitor::OsOps;
use mesmeric::pmu::Pmu;
use mesmeric::protocol::SocketTransport;
use mesmeric::{Emulator, EmulatorArgs, EmulatorConfig, Topology};

fn main() -> anyhow::Result<()> {
    let args = EmulatorArgs::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level)
            .with_context(|| format!("invalid log filter '{}'", args.log_level))?)
        .init();

    let cfg = EmulatorConfig::from_cmdline_args(&args)?;
    let topo = Topology::detect(cfg.cpu_freq).context("host detection failed")?;
    let transport = SocketTransport::bind(&cfg.socket_path)
        .with_context(|| format!("couldn't bind {}", cfg.socket_path.display()))?;

    let mut pmu = Pmu::open(&topo).context("couldn't open counters")?;
    pmu.enable().context("couldn't enable counters")?;

    let mut emu = Emulator::new(cfg.clone(), &topo, OsOps, pmu, transport)?;
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, emu.shutdown_flag())
            .context("couldn't install signal handlers")?;
    }

    cfg.emit();
    if let Some(program) = &cfg.target {
        reap_children_automatically()?;
        let pid = spawn_target(program, &cfg.target_args)?;
        if emu.attach_target(pid, pid, true, 0, &[])?.is_none() {
            tracing::debug!(pid, "target exited before it could be attached");
        }
    }
    println!("[*] emulation running on {} slot(s)", emu.registry().capacity());

    let res = emu.run();
    if let Err(e) = emu.counters_mut().disable() {
        tracing::warn!(error = %e, "couldn't stop counters");
    }
    res.context("emulation failed")?;
    Ok(())
}
