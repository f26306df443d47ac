// src/main.rs

use anyhow::{bail, Context, Result};
use resumable_downloader::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

// Demo driver: downloads a file, pauses once past a third, resumes, and waits for the end.
const DEFAULT_URL: &str = "http://212.183.159.230/50MB.zip";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| DEFAULT_URL.to_string());
    let save_directory = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("downloads"));

    let (info, ok) = probe_remote_file_info(&url, 5, Duration::from_secs(3)).await?;
    println!("[PROBE] ok={ok} {}", serde_json::to_string(&info)?);

    let session = DownloadSession::new()?;
    session.set_save_directory(&save_directory).await?;
    session.set_url(&url).await?;
    let mut events = session.subscribe();
    session.start().await.context("starting download")?;

    let mut paused_once = false;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => bail!("session went away"),
        };
        match event {
            SessionEvent::ProgressChanged(progress) => {
                let speed = session.speed().await;
                println!("[PROGRESS] {:.2}% at {speed}", progress * 100.0);
                if !paused_once && progress > 0.33 && session.breakpoint_supported().await {
                    paused_once = true;
                    println!("[ACTION] pausing for a second...");
                    session.pause().await?;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    println!("[ACTION] resuming");
                    session.resume().await?;
                }
            }
            SessionEvent::Finished(FinishReason::Completed { path }) => {
                println!("[DONE] saved to {}", path.display());
                break;
            }
            SessionEvent::Finished(reason) => bail!("download did not complete: {reason:?}"),
            _ => {}
        }
    }

    Ok(())
}
