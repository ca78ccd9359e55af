use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    apply::{apply_config, ApplyReport, StepStatus},
    battery::{self, ChargeProbe},
    boot::{apply_on_boot, wait_for_boot},
    config_watch,
    cpu,
    cpu_lock::{self, ClusterLock, LockPolicy, LockRequest},
    device::Device,
    fmt::{fmt_c, fmt_kb, fmt_mhz, fmt_opt},
    gamemode::clear_ram,
    gpu::{self, GpuRenderer},
    mem::{read_meminfo, read_vmrss_kb},
    monitor,
    notify::post_notification,
    profile_io::{export_to_dir, import_file, list_saved},
    ram::{self, RamConfig},
    shell::{RecordingShell, RootShell, Shell, ShellKind},
    soc::SocInfo,
    state::{self, write_state},
    sysfs::Sysfs,
    thermal::{self, ThermalPreset, ZoneSet},
    tuning::TuningConfig,
    tweaks::{self, AdditionalConfig, PerfMode},
    user_config::{load_or_init, read_config, write_config_atomic, UserConfig, CONFIG_PATH},
    web,
};

/// Kernel tuning for rooted Android devices.
#[derive(Parser, Debug)]
#[command(name = "kern-tuner", version)]
#[command(about = "CPU, GPU, thermal and memory tuning for rooted Android")]
pub struct Cli {
    /// User config (JSON)
    #[arg(long, global = true, default_value = CONFIG_PATH)]
    pub config: PathBuf,

    /// Prefix for /sys and /proc paths
    #[arg(long, global = true, default_value = "/")]
    pub root: PathBuf,

    /// Log filter directive, e.g. `debug` or `kern_tuner=trace`
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Log shell commands instead of running them; config is left untouched
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Escalate with `su -c` instead of the configured shell
    #[arg(long, global = true)]
    pub su: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the background service: boot restore, polling, app watcher, HTTP API
    Daemon,
    /// Show detected hardware and current settings
    Info,
    /// Apply a TOML profile
    Apply(ProfileArgs),
    /// Import a TOML profile, printing the compatibility report, then apply it
    Import(ProfileArgs),
    /// Export current settings to a TOML profile
    Export {
        /// Target directory (defaults to the configured export dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List exported profiles
    Profiles {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    #[command(subcommand)]
    Cpu(CpuCommand),
    #[command(subcommand)]
    Gpu(GpuCommand),
    /// Set the thermal preset
    Thermal {
        preset: ThermalPreset,
        /// Restore this preset at boot
        #[arg(long)]
        on_boot: bool,
    },
    #[command(subcommand)]
    Ram(RamCommand),
    /// I/O scheduler and TCP congestion control
    Tweaks {
        #[arg(long)]
        io_scheduler: Option<String>,
        #[arg(long)]
        tcp: Option<String>,
    },
    /// Performance, balance or battery
    Perf { mode: PerfMode },
    /// Restore stored settings (run from the module's service script)
    Boot {
        #[arg(long)]
        no_wait: bool,
    },
    /// Bypass charging and charge limit; shows the current state without flags
    Charging {
        #[arg(long)]
        bypass: Option<OnOff>,
        /// Percent or mA, depending on the kernel node
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Drop caches and kill background apps
    ClearRam,
    Reboot,
}

#[derive(Args, Debug)]
pub struct ProfileArgs {
    pub file: PathBuf,
    /// Apply even when the profile comes from another SoC
    #[arg(long, short)]
    pub yes: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OnOff {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
pub enum CpuCommand {
    /// Frequency window of a cluster, MHz
    Freq { cluster: usize, min: u64, max: u64 },
    /// Governor for one cluster, or all when --cluster is omitted
    Governor {
        governor: String,
        #[arg(long)]
        cluster: Option<usize>,
    },
    /// Hotplug a core
    Core { core: usize, state: OnOff },
    /// Pin a cluster's frequency window, MHz; the previous window is kept
    /// for `cpu unlock`
    Lock {
        cluster: usize,
        min: u64,
        max: u64,
        /// Let the daemon release the lock when the CPU runs hot
        #[arg(long)]
        smart: bool,
        /// Thermal limits for a smart lock
        #[arg(long, default_value = "balanced")]
        policy: LockPolicy,
    },
    /// Put back every locked cluster's previous window and governor
    Unlock,
}

#[derive(Subcommand, Debug)]
pub enum GpuCommand {
    /// Frequency window, MHz
    Freq { min: u64, max: u64 },
    PowerLevel { level: u32 },
    /// Takes effect after a reboot
    Renderer { renderer: GpuRenderer },
}

#[derive(Subcommand, Debug)]
pub enum RamCommand {
    Status,
    /// Change any subset of the memory settings
    Set {
        #[arg(long)]
        swappiness: Option<u32>,
        #[arg(long)]
        zram_size: Option<u64>,
        #[arg(long)]
        zram_algorithm: Option<String>,
        #[arg(long)]
        dirty_ratio: Option<u32>,
        #[arg(long)]
        min_free: Option<u64>,
        #[arg(long)]
        swap_size: Option<u64>,
    },
}

struct Session {
    cfg_path: PathBuf,
    cfg: UserConfig,
    dev: Device,
    dry_run: bool,
}

impl Session {
    fn new(cli: &Cli) -> Self {
        let cfg = if cli.dry_run {
            read_config(&cli.config).unwrap_or_default()
        } else {
            load_or_init(&cli.config)
        };
        let shell: Arc<dyn Shell> = if cli.dry_run {
            Arc::new(RecordingShell::new())
        } else if cli.su {
            Arc::new(RootShell::new(ShellKind::Su))
        } else {
            Arc::new(RootShell::new(cfg.shell))
        };
        let dev = cfg.device(Sysfs::new(&cli.root), shell);
        Self { cfg_path: cli.config.clone(), cfg, dev, dry_run: cli.dry_run }
    }

    fn save(&mut self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        self.cfg
            .validate_and_normalize()
            .map_err(|e| anyhow::anyhow!(e))?;
        write_config_atomic(&self.cfg_path, &self.cfg)
            .with_context(|| format!("writing {}", self.cfg_path.display()))
    }

    /// Folds a one-off change into the stored tuning so boot restore and
    /// exports see it.
    fn remember(&mut self, f: impl FnOnce(&mut TuningConfig)) -> Result<()> {
        let dev = &self.dev;
        f(self.cfg.tuning.get_or_insert_with(|| TuningConfig::capture(dev)));
        self.save()
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let mut ctx = Session::new(&cli);
    match cli.command {
        Command::Daemon => daemon(ctx),
        Command::Info => {
            info(&ctx.dev);
            Ok(())
        }
        Command::Apply(args) => apply_file(&mut ctx, &args, false),
        Command::Import(args) => apply_file(&mut ctx, &args, true),
        Command::Export { out } => {
            let dir = out.unwrap_or_else(|| ctx.cfg.export_dir.clone());
            let mut cfg = TuningConfig::capture(&ctx.dev);
            cfg.thermal.set_on_boot = ctx.cfg.tuning.as_ref().is_some_and(|t| t.thermal.set_on_boot);
            let info = SocInfo::detect(ctx.dev.shell.as_ref());
            let path = export_to_dir(&cfg, &info, &dir)?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Profiles { dir } => {
            for p in list_saved(&dir.unwrap_or_else(|| ctx.cfg.export_dir.clone()))? {
                println!("{}", p.display());
            }
            Ok(())
        }
        Command::Cpu(cmd) => run_cpu(&mut ctx, cmd),
        Command::Gpu(cmd) => run_gpu(&mut ctx, cmd),
        Command::Thermal { preset, on_boot } => {
            let applied = thermal::apply_thermal_preset(&ctx.dev, preset)?;
            println!("thermal: {}{}", preset, if applied { "" } else { " (nothing written)" });
            ctx.remember(|t| {
                t.thermal.preset = preset;
                t.thermal.set_on_boot = on_boot;
            })
        }
        Command::Ram(RamCommand::Status) => {
            ram_status(&ctx.dev);
            Ok(())
        }
        Command::Ram(RamCommand::Set { swappiness, zram_size, zram_algorithm, dirty_ratio, min_free, swap_size }) => {
            let mut cfg = ctx
                .cfg
                .tuning
                .as_ref()
                .map(|t| t.ram.clone())
                .unwrap_or_else(|| RamConfig::read(&ctx.dev));
            cfg.swappiness = swappiness.unwrap_or(cfg.swappiness);
            cfg.zram_size = zram_size.unwrap_or(cfg.zram_size);
            cfg.zram_algorithm = zram_algorithm.unwrap_or(cfg.zram_algorithm);
            cfg.dirty_ratio = dirty_ratio.unwrap_or(cfg.dirty_ratio);
            cfg.min_free_mem = min_free.unwrap_or(cfg.min_free_mem);
            cfg.swap_size = swap_size.unwrap_or(cfg.swap_size);
            cfg.validate()?;
            let report = ApplyReport { steps: ram::apply_ram_config(&ctx.dev, &cfg), reboot_required: false };
            print_report(&report);
            ctx.remember(|t| t.ram = cfg)?;
            finish(&report)
        }
        Command::Tweaks { io_scheduler, tcp } => {
            let cfg = AdditionalConfig {
                io_scheduler: io_scheduler.unwrap_or_default(),
                tcp_congestion: tcp.unwrap_or_default(),
                perf_mode: None,
            };
            let report = ApplyReport { steps: tweaks::apply_additional(&ctx.dev, &cfg), reboot_required: false };
            print_report(&report);
            ctx.remember(|t| {
                if !cfg.io_scheduler.is_empty() {
                    t.additional.io_scheduler = cfg.io_scheduler;
                }
                if !cfg.tcp_congestion.is_empty() {
                    t.additional.tcp_congestion = cfg.tcp_congestion;
                }
            })?;
            finish(&report)
        }
        Command::Perf { mode } => {
            tweaks::apply_perf_mode(&ctx.dev, mode)?;
            println!("perf mode: {}", mode);
            ctx.cfg.perf_mode = Some(mode);
            ctx.save()
        }
        Command::Boot { no_wait } => {
            if !no_wait {
                wait_for_boot(&ctx.dev, Duration::from_secs(180));
            }
            let report = apply_on_boot(&ctx.dev, &ctx.cfg);
            print_report(&report);
            if !report.ok() && ctx.cfg.notifications.enabled {
                post_notification(ctx.dev.shell.as_ref(), &format!("Boot: {}", report.summary()));
            }
            Ok(())
        }
        Command::Charging { bypass, limit } => {
            if let Some(b) = bypass {
                battery::set_bypass_charging(&ctx.dev, matches!(b, OnOff::On))?;
            }
            if let Some(l) = limit {
                battery::set_charge_limit(&ctx.dev, l)?;
            }
            let c = battery::charging_controls(&ctx.dev.sysfs);
            println!(
                "bypass   {} ({})",
                fmt_opt(c.bypass, |b| if b { "on".to_string() } else { "off".to_string() }),
                c.bypass_node.unwrap_or_else(|| "no node".to_string())
            );
            println!(
                "limit    {} ({})",
                fmt_opt(c.limit, |l| l.to_string()),
                c.limit_node.unwrap_or_else(|| "no node".to_string())
            );
            Ok(())
        }
        Command::ClearRam => {
            let r = clear_ram(&ctx.dev)?;
            println!("freed {} MB", r.freed_mb);
            Ok(())
        }
        Command::Reboot => Ok(ctx.dev.reboot()?),
    }
}

fn run_cpu(ctx: &mut Session, cmd: CpuCommand) -> Result<()> {
    match cmd {
        CpuCommand::Freq { cluster, min, max } => {
            let (min, max) = cpu::set_cluster_frequency(&ctx.dev, cluster, min, max)?;
            println!("cluster{}: {} - {}", cluster, fmt_mhz(min), fmt_mhz(max));
            ctx.remember(|t| {
                if let Some(c) = t.cpu_clusters.get_mut(cluster) {
                    c.min_freq = min;
                    c.max_freq = max;
                }
            })
        }
        CpuCommand::Governor { governor, cluster } => {
            match cluster {
                Some(i) => cpu::set_cluster_governor(&ctx.dev, i, &governor)?,
                None => {
                    let n = cpu::set_governor_all(&ctx.dev, &governor)?;
                    println!("{} clusters -> {}", n, governor);
                }
            }
            ctx.remember(|t| {
                for (i, c) in t.cpu_clusters.iter_mut().enumerate() {
                    if cluster.map_or(true, |want| want == i) {
                        c.governor = governor.clone();
                    }
                }
            })
        }
        CpuCommand::Core { core, state } => {
            cpu::set_core_online(&ctx.dev, core, matches!(state, OnOff::On))?;
            let fresh = TuningConfig::capture(&ctx.dev);
            ctx.remember(|t| {
                for (c, f) in t.cpu_clusters.iter_mut().zip(&fresh.cpu_clusters) {
                    c.disabled_cores = f.disabled_cores.clone();
                }
            })
        }
        CpuCommand::Lock { cluster, min, max, smart, policy } => {
            let req = LockRequest {
                clusters: vec![ClusterLock { cluster, min_freq: min, max_freq: max }],
                smart,
                policy,
            };
            let temps = thermal::read_temps(&ctx.dev.sysfs, &ZoneSet::detect(&ctx.dev.sysfs));
            let out = cpu_lock::lock(&ctx.dev, &req, ctx.cfg.cpu_lock.as_ref(), cpu_lock::cpu_temp_mc(&temps))?;
            for c in &out.lock.clusters {
                println!("cluster{}: locked {} - {}", c.cluster, fmt_mhz(c.min_freq), fmt_mhz(c.max_freq));
            }
            if smart {
                println!("thermal guard ({}) runs in the daemon", policy);
            }
            ctx.cfg.cpu_lock = Some(out.lock);
            ctx.save()
        }
        CpuCommand::Unlock => {
            cpu_lock::unlock(&ctx.dev, ctx.cfg.cpu_lock.as_ref())?;
            ctx.cfg.cpu_lock = None;
            println!("cpu frequencies unlocked");
            ctx.save()
        }
    }
}

fn run_gpu(ctx: &mut Session, cmd: GpuCommand) -> Result<()> {
    match cmd {
        GpuCommand::Freq { min, max } => {
            let (min, max) = gpu::set_gpu_frequency(&ctx.dev, min, max)?;
            println!("gpu: {} - {}", fmt_mhz(min), fmt_mhz(max));
            ctx.remember(|t| {
                if let Some(g) = t.gpu.as_mut() {
                    g.min_freq = min;
                    g.max_freq = max;
                }
            })
        }
        GpuCommand::PowerLevel { level } => {
            gpu::set_power_level(&ctx.dev, level)?;
            ctx.remember(|t| {
                if let Some(g) = t.gpu.as_mut() {
                    g.power_level = Some(level);
                }
            })
        }
        GpuCommand::Renderer { renderer } => {
            if gpu::set_renderer(&ctx.dev, renderer)? {
                println!("renderer {} stored, reboot to apply", renderer);
            }
            ctx.remember(|t| {
                if let Some(g) = t.gpu.as_mut() {
                    g.renderer = renderer;
                }
            })
        }
    }
}

fn apply_file(ctx: &mut Session, args: &ProfileArgs, verbose: bool) -> Result<()> {
    let current = SocInfo::detect(ctx.dev.shell.as_ref());
    let report = import_file(&args.file, &current)
        .with_context(|| format!("reading profile {}", args.file.display()))?;

    if verbose {
        let f = &report.file_soc;
        println!("profile: {} ({}) SoC {} platform {}", f.model, f.device, f.soc, f.platform);
        println!(
            "clusters: {}, gpu: {}, thermal: {}",
            report.config.cpu_clusters.len(),
            if report.config.gpu.is_some() { "yes" } else { "no" },
            report.config.thermal.preset
        );
    }
    if let Some(w) = &report.warning {
        eprintln!("{}", w);
        if !args.yes {
            bail!("profile is for different hardware; pass --yes to apply anyway");
        }
    }
    // Nothing is written for a profile the config would refuse to store.
    report
        .config
        .ram
        .validate()
        .with_context(|| format!("profile {} rejected", args.file.display()))?;

    let applied = apply_config(&ctx.dev, &report.config);
    print_report(&applied);
    ctx.cfg.tuning = Some(report.config);
    ctx.save()?;
    if !applied.ok() && ctx.cfg.notifications.enabled {
        post_notification(ctx.dev.shell.as_ref(), &format!("Apply: {}", applied.summary()));
    }
    finish(&applied)
}

fn print_report(report: &ApplyReport) {
    for s in &report.steps {
        match &s.status {
            StepStatus::Ok => println!("  ok      {}", s.name),
            StepStatus::Skipped(why) => println!("  skipped {} ({})", s.name, why),
            StepStatus::Failed(e) => println!("  FAILED  {}: {}", s.name, e),
        }
    }
    println!("{}", report.summary());
}

fn finish(report: &ApplyReport) -> Result<()> {
    if report.ok() {
        Ok(())
    } else {
        bail!("{} step(s) failed", report.failures().count())
    }
}

fn info(dev: &Device) {
    let sys = &dev.sysfs;
    let soc = SocInfo::detect(dev.shell.as_ref());
    println!("device   {} ({}), SoC {} / {} / {}", soc.model, soc.device, soc.soc, soc.platform, soc.hardware);

    for c in cpu::detect_clusters(sys) {
        println!(
            "cluster{} cores {:?}: {} - {} (hw {} - {}), now {}, {}",
            c.index,
            c.cores,
            fmt_mhz(c.cur_min),
            fmt_mhz(c.cur_max),
            fmt_mhz(c.hw_min),
            fmt_mhz(c.hw_max),
            fmt_mhz(c.cur_freq),
            c.governor
        );
    }
    let offline = cpu::offline_cores(sys);
    if !offline.is_empty() {
        println!("offline  {:?}", offline);
    }

    match gpu::detect_gpu(dev) {
        Some(g) => println!(
            "gpu      {} - {}, now {}, level {}, renderer {}",
            fmt_mhz(g.min_freq),
            fmt_mhz(g.max_freq),
            fmt_mhz(g.cur_freq),
            fmt_opt(g.power_level, |l| l.to_string()),
            g.renderer
        ),
        None => println!("gpu      not found"),
    }

    let temps = thermal::read_temps(sys, &ZoneSet::detect(sys));
    println!(
        "thermal  preset {}, cpu {}, gpu {}, battery {}",
        fmt_opt(thermal::current_preset(sys), |p| p.to_string()),
        fmt_opt(temps.cpu_mc, |v| fmt_c(v as i64)),
        fmt_opt(temps.gpu_mc, |v| fmt_c(v as i64)),
        fmt_opt(temps.battery_mc, |v| fmt_c(v as i64)),
    );

    if let Some(b) = ChargeProbe::detect(sys).map(|p| p.read(sys)) {
        println!(
            "battery  {}% {}{}",
            fmt_opt(b.level, |l| l.to_string()),
            b.status,
            b.temperature.map(|t| format!(", {:.1}C", t)).unwrap_or_default()
        );
    }
    ram_status(dev);

    let (_, io) = tweaks::io_schedulers(sys);
    let (_, tcp) = tweaks::tcp_congestion(sys);
    println!("io       {}, tcp {}", io.unwrap_or_else(|| "-".to_string()), tcp.unwrap_or_else(|| "-".to_string()));
}

fn ram_status(dev: &Device) {
    let sys = &dev.sysfs;
    if let Some(m) = read_meminfo(sys) {
        println!(
            "memory   {} / {} used, swap {} / {}",
            fmt_kb(m.used_kb()),
            fmt_kb(m.total_kb),
            fmt_kb(m.swap_used_kb()),
            fmt_kb(m.swap_total_kb)
        );
    }
    let cfg = RamConfig::read(dev);
    println!(
        "vm       swappiness {}, dirty_ratio {}, min_free {}",
        cfg.swappiness,
        cfg.dirty_ratio,
        fmt_kb(cfg.min_free_mem)
    );
    match ram::zram_status(sys) {
        Some(z) => println!(
            "zram     {} MB {} ({})",
            z.size_mb,
            z.algorithm.unwrap_or_else(|| "-".to_string()),
            if z.active { "active" } else { "inactive" }
        ),
        None => println!("zram     not available"),
    }
}

fn daemon(ctx: Session) -> Result<()> {
    tracing::info!("kern-tuner {} starting", env!("CARGO_PKG_VERSION"));
    let Session { cfg_path, cfg, dev, .. } = ctx;

    if !wait_for_boot(&dev, Duration::from_secs(180)) {
        tracing::warn!("BOOT: continuing without boot_completed");
    }
    let report = apply_on_boot(&dev, &cfg);
    if !report.ok() && cfg.notifications.enabled {
        post_notification(dev.shell.as_ref(), &format!("Boot: {}", report.summary()));
    }

    let shared = state::shared(cfg);
    write_state(&shared).runtime.last_apply = Some(report);

    config_watch::spawn(shared.clone(), cfg_path.clone());
    monitor::spawn_poller(shared.clone(), dev.clone());
    monitor::spawn_foreground_watch(shared.clone(), dev.clone());
    web::spawn(web::Api::new(shared, dev.clone(), cfg_path));

    loop {
        thread::sleep(Duration::from_secs(600));
        tracing::debug!("MEM: VmRSS {}", fmt_opt(read_vmrss_kb(&dev.sysfs), fmt_kb));
    }
}

/// Parses `std::env::args`-style input; exposed for tests.
pub fn parse_from<I, T>(args: I) -> std::result::Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::testutil::{fake_cpu, node};

    #[test]
    fn parses_subcommands_and_globals() {
        let cli = parse_from(["kern-tuner", "--root", "/tmp/x", "cpu", "freq", "1", "710", "2419"]).unwrap();
        assert_eq!(cli.root, PathBuf::from("/tmp/x"));
        assert!(matches!(cli.command, Command::Cpu(CpuCommand::Freq { cluster: 1, min: 710, max: 2419 })));

        let cli = parse_from(["kern-tuner", "thermal", "class0", "--on-boot"]).unwrap();
        assert!(matches!(cli.command, Command::Thermal { preset: ThermalPreset::Class0, on_boot: true }));

        let cli = parse_from(["kern-tuner", "gpu", "renderer", "skiavk"]).unwrap();
        assert!(matches!(cli.command, Command::Gpu(GpuCommand::Renderer { renderer: GpuRenderer::SkiaVulkan })));

        let cli = parse_from(["kern-tuner", "perf", "balanced", "--dry-run"]).unwrap();
        assert!(cli.dry_run);
        assert!(matches!(cli.command, Command::Perf { mode: PerfMode::Balance }));

        assert!(parse_from(["kern-tuner", "thermal", "lava"]).is_err());
    }

    #[test]
    fn cpu_command_updates_stored_tuning() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fake_cpu(&root, 0, &[300000, 1000000, 1800000], "schedutil");
        let cfg_path = dir.path().join("config.json");

        let root_s = root.to_string_lossy().to_string();
        let cfg_s = cfg_path.to_string_lossy().to_string();
        let cli = parse_from(["kern-tuner", "--root", &root_s, "--config", &cfg_s, "cpu", "governor", "powersave"]).unwrap();
        // RootShell is never reached: governor writes are plain file writes.
        run(cli).unwrap();

        let stored = load_or_init(&cfg_path).tuning.unwrap();
        assert_eq!(stored.cpu_clusters[0].governor, "powersave");
        assert_eq!(stored.cpu_clusters[0].max_freq, 1800);
    }

    #[test]
    fn cpu_lock_and_unlock_round_trip_through_the_config() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fake_cpu(&root, 0, &[300000, 1000000, 1800000], "schedutil");
        let cfg_path = dir.path().join("config.json");
        let root_s = root.to_string_lossy().to_string();
        let cfg_s = cfg_path.to_string_lossy().to_string();
        let sys = Sysfs::new(&root);
        let max = || sys.read_u64("/sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq");

        let cli = parse_from(["kern-tuner", "--root", &root_s, "--config", &cfg_s, "cpu", "lock", "0", "300", "1000", "--smart", "--policy", "gaming"]).unwrap();
        run(cli).unwrap();
        assert_eq!(max(), Some(1000000));
        let stored = load_or_init(&cfg_path).cpu_lock.unwrap();
        assert!(stored.smart);
        assert_eq!(stored.policy, LockPolicy::Gaming);
        assert_eq!(stored.originals[&0].max_freq, 1800);

        let cli = parse_from(["kern-tuner", "--root", &root_s, "--config", &cfg_s, "cpu", "unlock"]).unwrap();
        run(cli).unwrap();
        assert_eq!(max(), Some(1800000));
        assert!(load_or_init(&cfg_path).cpu_lock.is_none());

        let cli = parse_from(["kern-tuner", "--root", &root_s, "--config", &cfg_s, "cpu", "unlock"]).unwrap();
        assert!(run(cli).is_err());
        assert!(parse_from(["kern-tuner", "cpu", "lock", "0", "300", "1000", "--policy", "lava"]).is_err());
    }

    #[test]
    fn invalid_profile_is_rejected_before_any_write() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fake_cpu(&root, 0, &[300000, 1000000, 1800000], "schedutil");
        node(&root, "/proc/sys/vm/dirty_ratio", "20");
        let (dev, _sh) = crate::testutil::fake_device(&root);
        let file = dir.path().join("p.toml");
        std::fs::write(
            &file,
            "[cpu.cluster0]\nmin_freq = 300\nmax_freq = 1000\ngovernor = \"powersave\"\n\n[ram]\nswappiness = 500\ndirty_ratio = 50\n",
        )
        .unwrap();

        let mut ctx = Session {
            cfg_path: dir.path().join("config.json"),
            cfg: UserConfig::default(),
            dev,
            dry_run: false,
        };
        let err = apply_file(&mut ctx, &ProfileArgs { file, yes: true }, false).unwrap_err();
        assert!(format!("{:#}", err).contains("swappiness"));

        let sys = Sysfs::new(&root);
        assert_eq!(
            sys.read_string("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor").as_deref(),
            Some("schedutil")
        );
        assert_eq!(sys.read_u64("/proc/sys/vm/dirty_ratio"), Some(20));
        assert!(ctx.cfg.tuning.is_none());
        assert!(!ctx.cfg_path.exists());
    }

    #[test]
    fn dry_run_leaves_config_alone() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fake_cpu(&root, 0, &[300000, 1800000], "schedutil");
        node(&root, thermal::SCONFIG, "0");
        let cfg_path = dir.path().join("config.json");

        let root_s = root.to_string_lossy().to_string();
        let cfg_s = cfg_path.to_string_lossy().to_string();
        let cli = parse_from(["kern-tuner", "--dry-run", "--root", &root_s, "--config", &cfg_s, "thermal", "extreme"]).unwrap();
        run(cli).unwrap();
        assert!(!cfg_path.exists());
        assert_eq!(Sysfs::new(&root).read_u64(thermal::SCONFIG), Some(2));
    }
}
