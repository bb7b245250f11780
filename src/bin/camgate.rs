//! camgate - token-gated webcam streaming and recording service
//!
//! This daemon:
//! 1. Opens the first available camera (retrying in the background if none)
//! 2. Serves the live MJPEG stream and recording controls over HTTP
//! 3. Finalizes any open recording on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use camgate::{
    api::{AccessToken, ApiConfig, ApiServer},
    clock::SystemClock,
    config::CamgateConfig,
    ingest::FrameSource,
    record,
    session::CameraSession,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream and record a webcam behind a shared token")]
struct Args {
    /// JSON config file.
    #[arg(long, env = "CAMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides config and CAMGATE_ADDR).
    #[arg(long)]
    addr: Option<String>,

    /// Directory for recording files.
    #[arg(long)]
    recordings_dir: Option<PathBuf>,

    /// Camera device prefix, e.g. /dev/video or stub://camera.
    #[arg(long)]
    device: Option<String>,

    /// ffmpeg executable used for recording (overrides CAMGATE_FFMPEG).
    #[arg(long)]
    ffmpeg: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = CamgateConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }
    if let Some(dir) = args.recordings_dir {
        config.recordings_dir = dir;
    }
    if let Some(device) = args.device {
        config.camera.device = device;
    }
    if let Some(program) = args.ffmpeg {
        config.ffmpeg_program = program;
    }
    config.validate()?;

    log::info!(
        "camgate starting: camera {} ({}x{} @ {} fps), recordings in {}",
        config.camera.device,
        config.camera.width,
        config.camera.height,
        config.camera.target_fps,
        config.recordings_dir.display()
    );

    let recorder = record::default_backend(&config.ffmpeg_program);
    log::info!("recording backend: {}", recorder.name());

    let source = FrameSource::from_config(config.capture_config())?;
    let session = Arc::new(CameraSession::new(
        source,
        recorder,
        config.session_config(),
        Arc::new(SystemClock),
    ));

    // One token for the life of the process.
    let token = AccessToken::generate();
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, session.clone(), token).spawn()?;
    log::info!("camera api listening on {}", api_handle.addr);
    log::warn!("access token (handle securely): {}", api_handle.token);
    log::info!(
        "local: http://localhost:{}/?token={}",
        api_handle.addr.port(),
        api_handle.token
    );
    if let Some(host) = &config.remote_host {
        log::info!(
            "remote: http://{}:{}/?token={}",
            host,
            api_handle.addr.port(),
            api_handle.token
        );
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("camgate waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    session.shutdown();

    Ok(())
}
