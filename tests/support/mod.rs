//! In-memory transport whose response bodies are fed by the test, chunk by chunk.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use resumable_downloader::prelude::*;
use resumable_downloader::transport::{BodyStream, GetResponse, HeadResponse};
use tokio::sync::{broadcast, mpsc};
use url::Url;

pub const WAIT: Duration = Duration::from_secs(5);

/// One GET the session issued. Dropping it ends the response body.
pub struct Feed {
    pub url: String,
    pub range: Option<u64>,
    sender: mpsc::UnboundedSender<Result<Bytes, DownloadError>>,
}

impl Feed {
    pub fn send(&self, bytes: &[u8]) {
        self.sender
            .send(Ok(Bytes::copy_from_slice(bytes)))
            .expect("response body is gone");
    }

    pub fn fail(&self, message: &str) {
        self.sender
            .send(Err(DownloadError::Transfer(message.to_string())))
            .expect("response body is gone");
    }
}

#[derive(Default)]
struct Script {
    /// url -> (size, content type, content disposition)
    resources: HashMap<String, (u64, String, Option<String>)>,
    /// url -> redirect target
    redirects: HashMap<String, String>,
    heads: Vec<String>,
    gets: Vec<(String, Option<u64>)>,
}

pub struct ScriptedTransport {
    script: Mutex<Script>,
    feeds_tx: mpsc::UnboundedSender<Feed>,
    feeds_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Feed>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let (feeds_tx, feeds_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(Script::default()),
            feeds_tx,
            feeds_rx: tokio::sync::Mutex::new(feeds_rx),
        })
    }

    pub fn resource(&self, url: &str, size: u64, content_type: &str) {
        self.script.lock().unwrap().resources.insert(
            url.to_string(),
            (size, content_type.to_string(), None),
        );
    }

    pub fn redirect(&self, from: &str, to: &str) {
        self.script
            .lock()
            .unwrap()
            .redirects
            .insert(from.to_string(), to.to_string());
    }

    pub fn heads(&self) -> Vec<String> {
        self.script.lock().unwrap().heads.clone()
    }

    pub fn gets(&self) -> Vec<(String, Option<u64>)> {
        self.script.lock().unwrap().gets.clone()
    }

    /// The next GET issued by the session.
    pub async fn next_feed(&self) -> Feed {
        let mut feeds = self.feeds_rx.lock().await;
        tokio::time::timeout(WAIT, feeds.recv())
            .await
            .expect("no request issued in time")
            .expect("transport dropped")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn head(&self, url: &Url, _timeout: Duration) -> Result<HeadResponse, DownloadError> {
        let mut script = self.script.lock().unwrap();
        script.heads.push(url.to_string());
        let (size, content_type, disposition) = script
            .resources
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| DownloadError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })?;
        Ok(HeadResponse {
            status: 200,
            content_length: Some(size),
            content_type: Some(content_type),
            content_disposition: disposition,
        })
    }

    async fn get(&self, url: &Url, range_start: Option<u64>) -> Result<GetResponse, DownloadError> {
        let size = {
            let mut script = self.script.lock().unwrap();
            script.gets.push((url.to_string(), range_start));
            if let Some(target) = script.redirects.get(url.as_str()) {
                return Ok(GetResponse::Redirect(Url::parse(target).unwrap()));
            }
            script.resources.get(url.as_str()).map(|r| r.0).unwrap_or(0)
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let stream: BodyStream = futures_util::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        let _ = self.feeds_tx.send(Feed {
            url: url.to_string(),
            range: range_start,
            sender,
        });

        Ok(GetResponse::Body {
            content_length: Some(size - range_start.unwrap_or(0)),
            partial: range_start.is_some(),
            stream,
        })
    }
}

pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Waits for the first event matching `pred`, skipping the others.
pub async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session closed"),
            }
        }
    };
    tokio::time::timeout(WAIT, wait).await.expect("event did not arrive in time")
}

pub async fn wait_for_progress(events: &mut broadcast::Receiver<SessionEvent>, at_least: f64) {
    wait_for(events, |e| matches!(e, SessionEvent::ProgressChanged(p) if *p >= at_least - 1e-9)).await;
}

pub async fn wait_finished(events: &mut broadcast::Receiver<SessionEvent>) -> FinishReason {
    match wait_for(events, |e| matches!(e, SessionEvent::Finished(_))).await {
        SessionEvent::Finished(reason) => reason,
        _ => unreachable!(),
    }
}

pub fn dir_entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
