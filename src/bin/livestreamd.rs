//! livestreamd - live stream pipeline daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment)
//! 2. Builds the pose-aware detector and the event transport
//! 3. Serves the control API over a `StreamManager`
//! 4. On Ctrl-C, stops the API and every running stream worker

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use livestream_kernel::{
    api::{ApiConfig, ApiServer},
    detect::{InferenceAdapter, StubDetector},
    publish::HttpTransport,
    EventPublisher, LiveStreamConfig, PipelineDeps, StandardSourceOpener, StreamManager,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Live stream analytics and HLS republishing daemon")]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "LIVESTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Control API bind address (overrides config).
    #[arg(long)]
    api_addr: Option<String>,

    /// Maximum number of pre-allocated slots; 0 creates slots on demand (overrides config).
    #[arg(long)]
    max_slots: Option<u32>,

    /// Use the built-in stub detector instead of the model service.
    #[arg(long)]
    stub_inference: bool,

    /// Seconds to wait for workers to exit on shutdown.
    #[arg(long, default_value_t = 10)]
    shutdown_timeout_secs: u64,
}

fn build_inference(cfg: &LiveStreamConfig, stub: bool) -> InferenceAdapter {
    #[cfg(feature = "backend-http")]
    {
        if !stub {
            use livestream_kernel::detect::HttpDetector;
            log::info!(
                "inference: model service at {}",
                cfg.inference.model_service_url
            );
            // One request per pass: the service classifies pose for every human.
            let detector = HttpDetector::new(&cfg.inference.model_service_url).with_pose();
            return InferenceAdapter::new(detector)
                .with_subject_class(cfg.inference.subject_class.clone());
        }
    }
    if !stub {
        log::warn!("inference: backend-http feature disabled, using stub detector");
    }
    InferenceAdapter::new(StubDetector::new()).with_subject_class(cfg.inference.subject_class.clone())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = LiveStreamConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.api_addr {
        cfg.api_addr = addr;
    }
    if let Some(max_slots) = args.max_slots {
        cfg.stream.max_slots = max_slots;
    }

    let transport = Arc::new(HttpTransport::new(
        &cfg.publisher.event_sink_url,
        cfg.publisher.timeout,
    ));
    log::info!("events: delivering to {}", transport.endpoint());
    let publisher = Arc::new(EventPublisher::start(
        transport,
        cfg.publisher.workers,
        cfg.publisher.capacity,
    )?);

    let settings = cfg.worker_settings();
    let deps = PipelineDeps {
        sources: Arc::new(StandardSourceOpener {
            target_fps: settings.default_fps.round() as u32,
            width: settings.default_width,
            height: settings.default_height,
        }),
        sinks: Arc::new(cfg.encoder_factory()),
        inference: build_inference(&cfg, args.stub_inference),
        publisher: Arc::clone(&publisher),
    };
    let manager = Arc::new(StreamManager::new(cfg.stream.max_slots, settings, deps));

    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, Arc::clone(&manager)).spawn()?;
    log::info!(
        "livestreamd running. api {} | segments {} | playback {}",
        api_handle.addr,
        cfg.stream.output_dir.display(),
        cfg.stream.base_url
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("livestreamd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    let stuck = manager.shutdown(Duration::from_secs(args.shutdown_timeout_secs))?;
    if stuck > 0 {
        log::warn!("{} stream workers still running at exit", stuck);
    }
    publisher.shutdown();
    let stats = publisher.stats();
    log::info!(
        "events: sent={} failed={} dropped={}",
        stats.sent,
        stats.failed,
        stats.dropped
    );
    Ok(())
}
