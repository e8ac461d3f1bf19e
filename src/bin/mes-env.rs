
use mesmeric::events::ModelEvents;
use mesmeric::util::cpuid::CpuInfo;
use mesmeric::HostEnv;

fn main() {
    let online = match HostEnv::online_cpus() {
        Ok(n) => n.to_string(),
        Err(e) => format!("<{}>", e),
    };
    let cbos = match HostEnv::sysfs_uncore_count() {
        Ok(0) => "none found [!!]".to_string(),
        Ok(n) => n.to_string(),
        Err(e) => format!("<{}>", e),
    };
    let mhz = match HostEnv::procfs_cpu_mhz() {
        Ok(f) => format!("{:.3}", f),
        Err(e) => format!("<{}>", e),
    };
    let paranoid = match HostEnv::procfs_perf_paranoid() {
        Ok(x) if x > 0 => format!("{} [!!]", x),
        Ok(x) => x.to_string(),
        Err(e) => format!("<{}>", e),
    };
    let watchdog = match HostEnv::procfs_nmi_watchdog_enabled() {
        Ok(true) => "enabled [!!]".to_string(),
        Ok(false) => "disabled".to_string(),
        Err(e) => format!("<{}>", e),
    };

    println!("[*] 'mesmeric' environment summary:");
    println!("  {:<40}: {}", "online cores", online);
    println!("  {:<40}: {}", "uncore cache agents", cbos);
    match CpuInfo::detect() {
        Ok(cpu) => {
            let supported = match (cpu.check_supported(), ModelEvents::for_model(cpu.model)) {
                (Ok(()), Some(ev)) => format!("yes ({:?})", ev.model),
                (Err(e), _) => format!("no, {} [!!]", e),
                (Ok(()), None) => "no, unknown model [!!]".to_string(),
            };
            println!("  {:<40}: {}", "cpu vendor", cpu.vendor);
            println!("  {:<40}: family {} model {} stepping {}", "cpu signature",
                cpu.family, cpu.model, cpu.stepping);
            println!("  {:<40}: {}", "hypervisor",
                if cpu.hypervisor { "present [!!]" } else { "none" });
            println!("  {:<40}: {}", "supported model", supported);
        },
        Err(e) => println!("  {:<40}: <{}>", "cpu", e),
    }
    println!("  {:<40}: {}", "cpu MHz", mhz);
    println!("  {:<40}: {}", "kernel.perf_event_paranoid", paranoid);
    println!("  {:<40}: {}", "kernel.nmi_watchdog", watchdog);
}
