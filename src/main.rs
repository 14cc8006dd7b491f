use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use keypoint_gauge::telemetry::{
    LogTransport, MqttTransport, PublisherOptions, TelemetryWorker, ThreadSleeper, Transport,
};
use keypoint_gauge::{ConnectionConfig, DetectionRecord, MeasurementPipeline, PipelineConfig, TelemetryPublisher};
use tracing_subscriber::EnvFilter;

/// Replay recorded detections through the measurement pipeline.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON lines file, one array of detection records per frame
    #[arg(long)]
    frames: PathBuf,

    /// Pipeline configuration (engines and payload rules)
    #[arg(long)]
    pipeline: Option<PathBuf>,

    /// Broker connection configuration
    #[arg(long)]
    connection: Option<PathBuf>,

    /// Replay rate; frames are processed as fast as possible when omitted
    #[arg(long)]
    fps: Option<f64>,
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let pipeline_config = match &args.pipeline {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let connection = match &args.connection {
        Some(path) => {
            let config = ConnectionConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
            config.validate().context("invalid connection config")?;
            config
        }
        None => ConnectionConfig::default(),
    };

    // Without a connection file payloads only go to the log.
    let mqtt = args.connection.is_some().then(|| Arc::new(MqttTransport::new()));
    let transport: Arc<dyn Transport> = match &mqtt {
        Some(mqtt) => Arc::clone(mqtt) as Arc<dyn Transport>,
        None => Arc::new(LogTransport::new()),
    };

    let publisher = TelemetryPublisher::with_options(
        connection,
        transport,
        PublisherOptions {
            payload: pipeline_config.payload.clone(),
            ..Default::default()
        },
        Arc::new(ThreadSleeper),
    );
    if let Some(mqtt) = &mqtt {
        mqtt.bind(publisher.handle());
    }
    publisher.start().context("starting telemetry publisher")?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let worker = TelemetryWorker::spawn(publisher.clone(), rx).context("spawning telemetry worker")?;
    let mut pipeline = MeasurementPipeline::new(pipeline_config, tx).context("building pipeline")?;

    let frame_interval = match args.fps {
        Some(fps) if fps > 0.0 => Some(Duration::from_secs_f64(1.0 / fps)),
        Some(fps) => anyhow::bail!("--fps must be positive, got {}", fps),
        None => None,
    };

    let file = File::open(&args.frames).with_context(|| format!("opening {}", args.frames.display()))?;
    let mut skipped = 0usize;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let started = Instant::now();
        let line = line.with_context(|| format!("reading line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }

        let detections: Vec<DetectionRecord> = match serde_json::from_str(&line) {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "skipping malformed frame");
                skipped += 1;
                continue;
            }
        };

        let distances = pipeline.process_frame(&detections);
        tracing::debug!(frame = index + 1, ?distances, "frame processed");

        if let Some(interval) = frame_interval {
            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }

    let diagnostics = pipeline.diagnostics();
    drop(pipeline);
    let worker_stats = worker.finish();
    let connection = publisher.status();
    publisher.shutdown();

    let report = serde_json::json!({
        "pipeline": diagnostics,
        "worker": worker_stats,
        "connection": connection,
        "skipped_lines": skipped,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
