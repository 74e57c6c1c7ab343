//! Backprop Training Harness CLI
//!
//! Runs a training script under admission control and a timebox, and
//! inspects the recorded runs.

use std::{path::PathBuf, time::Duration};

use backprop_harness::{
    config::HarnessConfig,
    governor::{Governor, GovernorPolicy, HostSampler, ResourceSampler},
    probe::{DeviceProbeChain, ProbeMode},
    store::{RunRecord, RunStore},
    supervisor::{Framework, RunSettings, Supervisor},
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "backprop", about = "Resource-aware training run harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args)]
struct Common {
    /// Path to a backprop.toml config file (defaults apply without one)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding experiments.json (overrides [store] dir)
    #[arg(long)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a training script under the governor and timebox
    Run {
        /// Training script to run
        script: Option<String>,

        #[command(flatten)]
        common: Common,

        /// Stable run id (reuse to resume)
        #[arg(long)]
        run_id: Option<String>,

        /// Human-readable run name
        #[arg(long)]
        name: Option<String>,

        /// Framework hint: pytorch, tensorflow or auto
        #[arg(long)]
        framework: Option<Framework>,

        /// Timebox in minutes
        #[arg(long)]
        max_minutes: Option<f64>,

        /// Ask the script to checkpoint every N minutes
        #[arg(long)]
        checkpoint_every: Option<f64>,

        /// Resume from this checkpoint instead of the latest recorded one
        #[arg(long)]
        resume_from: Option<String>,

        /// Interpreter used to launch the script
        #[arg(long)]
        interpreter: Option<String>,

        /// GPU probe: auto, nvidia-smi, rocm-smi or none
        #[arg(long)]
        probe: Option<ProbeMode>,

        /// Minimum free VRAM in MB
        #[arg(long)]
        min_free_vram: Option<u64>,

        /// Intended parallel runs (1 allows running with degraded monitoring)
        #[arg(long)]
        max_parallel: Option<u32>,
    },

    /// Show current host resources and GPU readings
    Status {
        #[command(flatten)]
        common: Common,
    },

    /// List recorded experiments, newest first
    List {
        #[command(flatten)]
        common: Common,
    },

    /// Compare two recorded runs
    Compare {
        a: String,
        b: String,

        #[command(flatten)]
        common: Common,
    },
}

impl Common {
    fn load(&self) -> Result<HarnessConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)?,
            None => HarnessConfig::default(),
        };
        if let Some(dir) = &self.store {
            config.store.dir.clone_from(dir);
        }
        Ok(config)
    }

    fn open_store(&self) -> Result<RunStore, Box<dyn std::error::Error>> {
        let config = self.load()?;
        let mut store = RunStore::new(&config.store.dir);
        store.init()?;
        Ok(store)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber the spinner
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            common,
            run_id,
            name,
            framework,
            max_minutes,
            checkpoint_every,
            resume_from,
            interpreter,
            probe,
            min_free_vram,
            max_parallel,
        } => {
            let mut config = common.load()?;

            // Flags override the file
            let run = &mut config.run;
            if let Some(script) = script {
                run.script = script;
            }
            if run_id.is_some() {
                run.run_id = run_id;
            }
            if name.is_some() {
                run.name = name;
            }
            if let Some(framework) = framework {
                run.framework = framework;
            }
            if let Some(minutes) = max_minutes {
                run.max_run_minutes = minutes;
            }
            if checkpoint_every.is_some() {
                run.checkpoint_every_minutes = checkpoint_every;
            }
            if resume_from.is_some() {
                run.resume_from = resume_from;
            }
            if let Some(interpreter) = interpreter {
                run.interpreter = interpreter;
            }
            if let Some(probe) = probe {
                config.gpu.probe = probe;
            }
            if let Some(mb) = min_free_vram {
                config.gpu.min_free_vram_mb = mb;
            }
            if let Some(n) = max_parallel {
                config.governor.max_parallel = n;
            }
            config.validate()?;

            run_script(&config).await?;
        }

        Commands::Status { common } => {
            let config = common.load()?;
            let state = HostSampler::new().sample();
            let device = DeviceProbeChain::new(config.gpu.probe).probe().await;

            println!("=== Host ===");
            if state.monitoring_failed {
                println!("Resource monitoring unavailable (conservative mode)");
            } else {
                println!("Free RAM: {:.2} GB", state.ram_free_gb);
                println!("CPU load: {:.2}", state.cpu_load);
            }
            println!();
            println!("=== GPU ({}) ===", config.gpu.probe);
            if device.is_unknown() {
                println!("No GPU reading available");
            } else {
                println!("Free VRAM: {}", fmt_opt(device.vram_free_mb, " MB"));
                println!("Temperature: {}", fmt_opt(device.temperature_c, "°C"));
                println!("Utilization: {}", fmt_opt(device.utilization_percent, "%"));
            }
        }

        Commands::List { common } => {
            let store = common.open_store()?;
            let runs = store.list_experiments();

            if runs.is_empty() {
                println!("No experiments recorded in {}", store.path().display());
                return Ok(());
            }

            println!("=== Experiments ===");
            println!();
            for run in runs {
                print!("{}: {}", run.id, run.status.as_str().to_uppercase());
                if let Some(name) = &run.name {
                    print!(" ({name})");
                }
                print!(" started {}", fmt_time(run.start_time));
                if let Some(step) = run.last_step {
                    print!(" [step {step}]");
                }
                if let Some(checkpoint) = run.latest_checkpoint() {
                    print!(" [checkpoint: {checkpoint}]");
                }
                println!();
            }
        }

        Commands::Compare { a, b, common } => {
            let store = common.open_store()?;
            let Some((a, b)) = store.compare(&a, &b) else {
                let missing = if store.get_run(&a).is_none() { a } else { b };
                return Err(format!("unknown run id: {missing}").into());
            };

            let rows: [(&str, fn(&RunRecord) -> String); 8] = [
                ("name", |r| r.name.clone().unwrap_or_else(|| "-".into())),
                ("script", |r| r.script_path.clone()),
                ("status", |r| r.status.to_string()),
                ("started", |r| fmt_time(r.start_time)),
                ("duration", |r| {
                    r.duration_ms()
                        .map_or_else(|| "-".into(), |ms| format!("{:.1}s", ms as f64 / 1000.0))
                }),
                ("last step", |r| fmt_opt(r.last_step, "")),
                ("last loss", |r| fmt_opt(r.last_loss, "")),
                ("checkpoints", |r| r.checkpoints.len().to_string()),
            ];

            println!("{:12} {:>24} {:>24}", "", a.id, b.id);
            for (label, field) in rows {
                println!("{label:12} {:>24} {:>24}", field(a), field(b));
            }
        }
    }

    Ok(())
}

async fn run_script(config: &HarnessConfig) -> Result<(), Box<dyn std::error::Error>> {
    let settings = RunSettings::from_config(config);
    let run_id = settings.run_id.clone();

    let mut store = RunStore::new(&config.store.dir);
    store.init()?;

    let governor = Governor::new(
        GovernorPolicy::from_config(config),
        config.governor.token_bucket(),
        Box::new(HostSampler::new()),
        DeviceProbeChain::new(config.gpu.probe),
    );
    let mut supervisor = Supervisor::new(settings, governor, store);

    let stop = supervisor.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, stopping run");
            stop.stop();
        }
    });

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {msg}",
    )?);
    pb.set_message(format!("{run_id:15}: starting..."));
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut progress = supervisor.progress();
    let pb_clone = pb.clone();
    let name = run_id.clone();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            if let Some(p) = *progress.borrow() {
                pb_clone.set_message(format!("{name:15}: step {:>6}  loss {:.4}", p.step, p.loss));
            }
        }
    });

    let result = supervisor.run().await;
    pb.finish_with_message(format!("{run_id:15}: {}", result.reason));

    println!();
    println!("=== Run Complete ===");
    println!("Run: {}", result.run_id);
    println!("Outcome: {}", result.reason);
    println!("Duration: {:.1}s", result.duration.as_secs_f64());
    if let Some(code) = result.exit_code {
        println!("Exit code: {code}");
    }
    if let Some(p) = result.last_progress {
        println!("Last progress: step {} loss {:.4}", p.step, p.loss);
    }
    if let Some(checkpoint) = supervisor.store().get_latest_checkpoint(&result.run_id) {
        println!("Latest checkpoint: {checkpoint}");
    }

    match result.error {
        Some(error) if !result.success => {
            Err(format!("run {} failed: {error}", result.reason).into())
        }
        _ => Ok(()),
    }
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>, unit: &str) -> String {
    value.map_or_else(|| "unknown".into(), |v| format!("{v}{unit}"))
}

fn fmt_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis).map_or_else(
        || millis.to_string(),
        |t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        },
    )
}
