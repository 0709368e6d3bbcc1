use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use orin_flash::config::{self, FlashProfile, PipelineConfig, PipelineRequest};
use orin_flash::executor::{self, ExecCtx, StdoutSink};
use orin_flash::modules;
use orin_flash::Result;

/// Fetches an L4T release, prepares its rootfs, and flashes a Jetson Orin
/// Nano's NVMe over recovery-mode USB.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Download and prepare the BSP and rootfs
    #[arg(short = 'g')]
    get_bsp: bool,

    /// Flash a board waiting in recovery mode
    #[arg(short = 'f')]
    flash: bool,

    /// Overlay tarball applied on top of the sample rootfs (with -g)
    #[arg(short = 'o', value_name = "TARBALL")]
    overlay: Option<PathBuf>,

    /// L4T release to fetch, e.g. 36.4.4 (required with -g)
    #[arg(short = 'v', value_name = "MAJOR.MINOR.PATCH")]
    version: Option<String>,

    /// Run apply_binaries.sh in a container even if the native run would work
    #[arg(short = 'C')]
    force_container: bool,

    /// Site profile TOML overriding download/flash defaults
    #[arg(long, value_name = "FILE")]
    profile: Option<PathBuf>,

    /// Print what would run without executing anything
    #[arg(long)]
    dry_run: bool,

    /// Print the computed task plan and exit
    #[arg(long)]
    print_plan: bool,

    /// With --print-plan, emit GraphViz dot instead of a linear plan
    #[arg(long)]
    dot: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("orinflash: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let profile = match args.profile.as_deref() {
        Some(path) => config::load_profile(path)?,
        None => FlashProfile::default(),
    };
    let cfg = PipelineConfig::new(
        PipelineRequest {
            fetch: args.get_bsp,
            flash: args.flash,
            force_container: args.force_container,
            overlay: args.overlay,
            version: args.version,
        },
        profile,
    )?;

    let plan = modules::plan_pipeline(&cfg)?;

    if args.print_plan {
        if args.dot {
            print!("{}", plan.to_dot()?);
            return Ok(());
        }
        for (i, task) in plan.ordered()?.iter().enumerate() {
            println!(
                "{:>2}. {:<18}  {:<8} {:<10}  {}",
                i + 1,
                task.id,
                task.module,
                task.phase,
                task.label
            );
        }
        return Ok(());
    }

    let reg = executor::builtin_registry()?;
    let mut ctx = ExecCtx::new(args.dry_run, Arc::new(StdoutSink::default()));
    executor::execute_plan(&cfg, &plan, &reg, &mut ctx)
}
