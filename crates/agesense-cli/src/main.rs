use agesense_core::preprocess::preview_image;
use agesense_core::{OrtSessionFactory, PreprocessOptions};
use agesense_hw::camera::Camera;
use agesense_hw::frame::draw_guide;
use agesense_hw::V4l2CameraProvider;
use agesense_models::{fetcher_for, ModelCache, Provisioner, SqliteModelCache};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod status;

use config::{Config, MODEL_KEY, MODEL_VERSION};
use controller::SessionController;
use status::AppStatus;

/// How long to wait for the first camera frame after startup.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "agesense", about = "Age and gender prediction from a live camera")]
struct Cli {
    /// V4L2 device (overrides AGESENSE_CAMERA_DEVICE)
    #[arg(long, global = true)]
    device: Option<String>,

    /// Model artifact URL or path (overrides AGESENSE_MODEL_URL)
    #[arg(long, global = true)]
    model_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start up, then predict each time Enter is pressed
    Run,
    /// Start up and run a single prediction
    Predict {
        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Save the current frame with the guide overlay and the model's view
    Snapshot {
        /// Output directory
        #[arg(short, long)]
        out: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
    /// Show the cached model record
    Cache,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(device) = cli.device {
        config.camera_device = device;
    }
    if let Some(url) = cli.model_url {
        config.model_url = url;
    }

    match cli.command {
        Commands::Run => run(&config).await,
        Commands::Predict { json } => predict_once(&config, json).await,
        Commands::Snapshot { out } => snapshot(&config, &out).await,
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::Cache => show_cache(&config).await,
    }
}

fn build_controller(config: &Config) -> Result<SessionController> {
    let spec = config.model_spec();
    let fetcher = fetcher_for(&spec.source)?;
    let cache = Arc::new(SqliteModelCache::new(config.cache_path.clone()));
    let provisioner = Provisioner::new(spec, cache, fetcher);

    let factory = Arc::new(OrtSessionFactory {
        intra_threads: config.intra_threads,
    });
    let camera = Arc::new(V4l2CameraProvider {
        device_path: config.camera_device.clone(),
        width: config.camera_width,
        height: config.camera_height,
    });

    tracing::info!(
        device = %config.camera_device,
        model = %config.model_url,
        cache = %config.cache_path.display(),
        "agesense starting"
    );

    Ok(SessionController::new(
        provisioner,
        factory,
        camera,
        PreprocessOptions {
            mirror: config.mirror,
        },
    ))
}

/// Echo status changes to stderr until the controller goes away.
fn spawn_status_printer(mut rx: watch::Receiver<AppStatus>) {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            eprintln!("[{:?}] {}", status.kind, status.message);
        }
    });
}

fn print_timings(status: &AppStatus) {
    eprintln!("Model load: {}  Inference: {}", status.load_time, status.latency);
}

async fn run(config: &Config) -> Result<()> {
    let mut ctl = build_controller(config)?;
    spawn_status_printer(ctl.subscribe());

    ctl.start().await?;
    if let Err(e) = ctl.wait_for_frame(FIRST_FRAME_TIMEOUT).await {
        tracing::warn!(error = %e, "no camera frame yet");
    }

    tracing::debug!(state = ?ctl.state(), "controller started");
    eprintln!("[{}] Press Enter to predict (Ctrl-D to quit).", ctl.trigger_label());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while lines.next_line().await?.is_some() {
        match ctl.predict().await {
            Ok(p) => {
                println!("Age: {}  Gender: {}", p.age, p.gender);
                print_timings(&ctl.status());
            }
            Err(e) => {
                eprintln!("Prediction failed: {e}");
                if !ctl.trigger_enabled() {
                    eprintln!("[{}] giving up", ctl.trigger_label());
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn predict_once(config: &Config, json: bool) -> Result<()> {
    let mut ctl = build_controller(config)?;

    let outcome = match ctl.start().await {
        Ok(()) => {
            ctl.wait_for_frame(FIRST_FRAME_TIMEOUT).await?;
            ctl.predict().await.map(|_| ())
        }
        Err(e) => Err(e),
    };

    let status = ctl.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else if let Some(p) = status.prediction {
        println!("Age: {}  Gender: {}", p.age, p.gender);
        print_timings(&status);
    } else {
        eprintln!("{}", status.message);
    }

    Ok(outcome?)
}

async fn snapshot(config: &Config, out: &Path) -> Result<()> {
    let camera = Camera::start(&config.camera_device, config.camera_width, config.camera_height)?;

    let deadline = std::time::Instant::now() + FIRST_FRAME_TIMEOUT;
    let frame = loop {
        match camera.current_frame() {
            Ok(frame) => break frame,
            Err(e) if std::time::Instant::now() >= deadline || !camera.is_active() => {
                return Err(e).context("no frame captured");
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };

    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

    let preview = preview_image(
        &frame.image,
        &PreprocessOptions {
            mirror: config.mirror,
        },
    )?;
    let preview_path = out.join("preview_224.png");
    preview.save(&preview_path)?;

    let mut overlay = frame.image.clone();
    draw_guide(&mut overlay, 3);
    let frame_path = out.join("frame.png");
    overlay.save(&frame_path)?;

    println!(
        "Saved {} ({}x{}, brightness {:.1}) and {}",
        frame_path.display(),
        frame.width(),
        frame.height(),
        frame.avg_brightness(),
        preview_path.display()
    );
    Ok(())
}

async fn show_cache(config: &Config) -> Result<()> {
    let cache = SqliteModelCache::new(config.cache_path.clone());
    println!("Cache: {}", cache.path().display());

    match cache.get(MODEL_KEY).await? {
        Some(record) => {
            let usable = record.version == MODEL_VERSION && record.data.is_some();
            println!("Key: {}", record.key);
            println!("Version: {} (required {MODEL_VERSION})", record.version);
            match &record.data {
                Some(data) => println!("Size: {:.2} MB", data.len() as f64 / (1024.0 * 1024.0)),
                None => println!("Size: - (malformed payload)"),
            }
            println!("Usable: {}", if usable { "yes" } else { "no" });
        }
        None => println!("No cached model"),
    }
    Ok(())
}
