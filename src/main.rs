//! CLI entry point, grounded on the teacher's `main.rs` (`clap` derive
//! `Cli`/`Command`, `tracing_subscriber::fmt()` init, `print_startup_info`)
//! reworked for this pipeline's three operator-facing actions instead of the
//! teacher's query/ask/narratives surface.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use caesar_pipeline::config::{load_config, AppConfig};
#[cfg(not(feature = "vision"))]
use caesar_pipeline::detector::MockDetector;
use caesar_pipeline::frame_source::MockFrameSource;
use caesar_pipeline::neural_actor::MockActionClassifier;
use caesar_pipeline::pipeline;
use caesar_pipeline::reid::CameraTopology;

#[derive(Parser)]
#[command(name = "caesar", about = "Multi-camera video-analytics reasoning pipeline")]
struct Cli {
    /// Path to the config file, without its .toml extension (default: caesar.toml in cwd).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the pipeline and run until interrupted.
    Run,
    /// Load and validate the configuration file, then exit.
    CheckConfig,
    /// Parse and validate a camera-topology file.
    Topology {
        #[arg(long)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Command::Run => run(cli.config.as_deref()).await,
        Command::CheckConfig => check_config(cli.config.as_deref()),
        Command::Topology { path } => check_topology(&path),
    }
}

fn init_tracing() -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(".", "pipeline_debug.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    Ok(guard)
}

fn print_startup_info(cfg: &AppConfig) {
    info!(cameras = cfg.cameras.len(), "caesar pipeline starting");
    for cam in &cfg.cameras {
        info!(cam_id = %cam.cam_id, url = %cam.url, "camera configured");
    }
    info!(
        track_labels = ?cfg.tracker.track_labels,
        appearance_thres = cfg.tracker.appearance_match_thres,
        "tracker configured"
    );
    info!(
        definitions = ?cfg.activity_composer.definitions_path,
        max_graph_cache = cfg.activity_composer.max_graph_cache_size,
        "activity composer configured"
    );
}

async fn run(config_path: Option<&str>) -> anyhow::Result<()> {
    let cfg = load_config(config_path)?;
    print_startup_info(&cfg);

    if cfg.cameras.is_empty() {
        anyhow::bail!("no cameras configured; add at least one [[cameras]] entry");
    }

    #[cfg(feature = "vision")]
    let (sources, detector) = build_vision_collaborators(&cfg)?;
    #[cfg(not(feature = "vision"))]
    let (sources, detector) = build_mock_collaborators(&cfg);

    #[cfg(not(feature = "vision"))]
    info!("running without the 'vision' feature: replaying mock frames, not live camera capture");

    let classifier = Arc::new(MockActionClassifier::new(Vec::new()));
    let handle = pipeline::spawn(cfg, sources, detector, classifier)?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining pipeline");
    handle.stop().await;
    Ok(())
}

#[cfg(not(feature = "vision"))]
fn build_mock_collaborators(
    cfg: &AppConfig,
) -> (Vec<Box<dyn caesar_pipeline::frame_source::FrameSource>>, Arc<MockDetector>) {
    let sources = cfg
        .cameras
        .iter()
        .map(|cam| {
            Box::new(MockFrameSource::blank_sequence(cam.cam_id.clone(), 0, 0, 640, 480))
                as Box<dyn caesar_pipeline::frame_source::FrameSource>
        })
        .collect();
    (sources, Arc::new(MockDetector::new(Vec::new())))
}

#[cfg(feature = "vision")]
fn build_vision_collaborators(
    cfg: &AppConfig,
) -> anyhow::Result<(
    Vec<Box<dyn caesar_pipeline::frame_source::FrameSource>>,
    Arc<caesar_pipeline::detector::ort_yolo::OrtYoloDetector>,
)> {
    use caesar_pipeline::detector::ort_yolo::OrtYoloDetector;

    let detector = Arc::new(OrtYoloDetector::new(
        &cfg.detector.model_path,
        cfg.detector.input_size,
        cfg.detector.confidence_threshold,
        cfg.detector.nms_threshold,
        cfg.detector.intra_threads,
        cfg.detector.use_openvino,
    )?);

    // Live RTSP/file capture is an external collaborator this crate does not
    // implement; operators wire a real FrameSource in before calling
    // pipeline::spawn in an embedding binary. Here we replay empty mock
    // sequences so `caesar run` remains a runnable smoke test even with the
    // vision feature enabled.
    let sources = cfg
        .cameras
        .iter()
        .map(|cam| {
            Box::new(MockFrameSource::blank_sequence(cam.cam_id.clone(), 0, 0, 640, 480))
                as Box<dyn caesar_pipeline::frame_source::FrameSource>
        })
        .collect();
    Ok((sources, detector))
}

fn check_config(config_path: Option<&str>) -> anyhow::Result<()> {
    let cfg = load_config(config_path)?;
    println!("configuration OK: {} camera(s) configured", cfg.cameras.len());
    for cam in &cfg.cameras {
        println!("  - {} ({})", cam.cam_id, cam.url);
    }
    Ok(())
}

fn check_topology(path: &str) -> anyhow::Result<()> {
    let topology = CameraTopology::load_file(path).map_err(|e| anyhow::anyhow!(e))?;
    println!("topology OK: {path}");
    let _ = topology;
    Ok(())
}
