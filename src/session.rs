// src/session.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, debug_span, error, info, warn, Instrument};
use url::Url;

use crate::downloader::{
    TransferEngine, TransferEvent, TransferHandle, TransferOutcome, TransferRequest,
};
use crate::error::DownloadError;
use crate::models::{
    DownloadOptions, FinishReason, ProxyConfig, RemoteFileInfo, SessionEvent, SessionState, Speed,
    TransferProgress, MIN_PROBE_TIMEOUT,
};
use crate::naming::{has_working_suffix, strip_working_suffix, unique_file_name};
use crate::probe::MetadataProber;
use crate::speed::SpeedMeter;
use crate::transport::{HttpTransport, Transport};

const EVENT_CAPACITY: usize = 256;
/// Redirect chains longer than this fail the download.
const MAX_REDIRECTS: u32 = 10;

/// Whether a transfer from `url` can be resumed with a range request.
pub fn breakpoint_supported(url: &Url) -> bool {
    url.scheme().to_ascii_lowercase().starts_with("http")
}

/// A single resumable download.
///
/// Commands return as soon as the work is initiated; outcomes arrive through
/// [`subscribe`](Self::subscribe). All commands, setters and transfer callbacks are
/// serialized on one lock, so no two state transitions of a session ever overlap.
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct DownloadSession {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
}

struct Inner {
    options: DownloadOptions,
    transport: Arc<dyn Transport>,
    /// `false` for injected transports, which keep their own proxy handling.
    owns_transport: bool,
    events: broadcast::Sender<SessionEvent>,

    url: Option<Url>,
    state: SessionState,
    file_info: RemoteFileInfo,
    progress: f64,
    speed: Speed,
    speed_meter: SpeedMeter,
    received_this_run: u64,
    received_prior_runs: u64,
    total_this_run: u64,
    working_path: Option<PathBuf>,
    /// Suffix the current working file was named with.
    working_suffix: String,
    redirects: u32,
    active: Option<TransferHandle>,
    /// Bumped whenever pending probes and transfer callbacks become stale.
    generation: u64,
}

impl DownloadSession {
    /// A session with default options and the system proxy.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_options(DownloadOptions::default())
    }

    pub fn with_options(options: DownloadOptions) -> Result<Self, DownloadError> {
        let transport = Arc::new(HttpTransport::new(&options.proxy)?);
        Ok(Self::build(options, transport, true))
    }

    /// A session that talks to the network through `transport`.
    pub fn with_transport(options: DownloadOptions, transport: Arc<dyn Transport>) -> Self {
        Self::build(options, transport, false)
    }

    fn build(options: DownloadOptions, transport: Arc<dyn Transport>, owns_transport: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            options,
            transport,
            owns_transport,
            events: events.clone(),
            url: None,
            state: SessionState::Idle,
            file_info: RemoteFileInfo::default(),
            progress: 0.0,
            speed: Speed::default(),
            speed_meter: SpeedMeter::new(),
            received_this_run: 0,
            received_prior_runs: 0,
            total_this_run: 0,
            working_path: None,
            working_suffix: String::new(),
            redirects: 0,
            active: None,
            generation: 0,
        };
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                events,
            }),
        }
    }

    /// Change notifications and the terminal [`SessionEvent::Finished`].
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    // ---- commands ----

    /// Probes the URL and starts the transfer. Only valid while idle.
    pub async fn start(&self) -> Result<(), DownloadError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Idle {
            warn!(state = ?inner.state, "stop the current download before starting a new one");
            return Err(DownloadError::InvalidState {
                operation: "start",
                state: inner.state,
            });
        }
        let Some(url) = inner.url.clone() else {
            warn!("no URL set");
            return Err(DownloadError::invalid("no URL set"));
        };
        if inner.options.save_directory.as_os_str().is_empty() {
            warn!("save directory is not set");
            return Err(DownloadError::invalid("save directory is not set"));
        }
        if inner.options.probe_attempts < 1 || inner.options.probe_timeout < MIN_PROBE_TIMEOUT {
            warn!(
                attempts = inner.options.probe_attempts,
                timeout = ?inner.options.probe_timeout,
                "probe options out of range"
            );
            return Err(DownloadError::invalid("probe options out of range"));
        }

        info!(%url, "starting download");
        inner.generation += 1;
        let generation = inner.generation;
        inner.set_state(SessionState::Probing);
        drop(inner);

        tokio::spawn(launch(self.shared.clone(), generation, url, false));
        Ok(())
    }

    /// Suspends the transfer, keeping the bytes received so far in the working file.
    ///
    /// Without breakpoint support this is the same as [`stop`](Self::stop).
    pub async fn pause(&self) -> Result<(), DownloadError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Downloading {
            warn!(state = ?inner.state, "download already paused or stopped");
            return Err(DownloadError::InvalidState {
                operation: "pause",
                state: inner.state,
            });
        }
        if !inner.breakpoint_supported() {
            warn!("current download doesn't support breakpoint transfer, stopping it");
            inner.stop().await;
            return Ok(());
        }

        inner.generation += 1;
        if let Some(handle) = inner.active.take() {
            // Use what actually reached the disk, not the last reported progress.
            let summary = handle.abort().await;
            if summary.restarted {
                inner.received_prior_runs = 0;
            }
            inner.received_this_run = summary.written;
        }
        inner.received_prior_runs += inner.received_this_run;
        inner.received_this_run = 0;
        info!(received = inner.received_prior_runs, "download paused");
        inner.set_state(SessionState::Paused);
        Ok(())
    }

    /// Continues a paused transfer from the bytes already on disk.
    pub async fn resume(&self) -> Result<(), DownloadError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Paused {
            warn!(state = ?inner.state, "download is not paused");
            return Err(DownloadError::InvalidState {
                operation: "resume",
                state: inner.state,
            });
        }
        info!(from = inner.received_prior_runs, "resuming download");
        if let Err(e) = inner.begin_transfer(&self.shared).await {
            inner.fail(e).await;
        }
        Ok(())
    }

    /// Cancels whatever is in progress and deletes the incomplete file. Does nothing
    /// while idle.
    pub async fn stop(&self) -> Result<(), DownloadError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == SessionState::Idle {
            debug!("stop while idle");
            return Ok(());
        }
        inner.stop().await;
        Ok(())
    }

    // ---- properties ----

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn url(&self) -> Option<Url> {
        self.shared.inner.lock().await.url.clone()
    }

    /// Only accepted while idle.
    pub async fn set_url(&self, url: &str) -> Result<(), DownloadError> {
        let parsed = Url::parse(url).map_err(|e| {
            warn!(url, error = %e, "the given URL is not valid");
            DownloadError::invalid(format!("invalid URL {url:?}: {e}"))
        })?;
        let mut inner = self.shared.inner.lock().await;
        inner.require_idle("set the URL")?;
        inner.set_url(Some(parsed));
        Ok(())
    }

    pub async fn save_directory(&self) -> PathBuf {
        self.shared.inner.lock().await.options.save_directory.clone()
    }

    /// Only accepted while idle. The directory is created if missing.
    pub async fn set_save_directory(&self, directory: impl AsRef<Path>) -> Result<(), DownloadError> {
        let directory = directory.as_ref();
        if directory.as_os_str().is_empty() {
            warn!("the given path is empty");
            return Err(DownloadError::invalid("save directory is empty"));
        }
        let mut inner = self.shared.inner.lock().await;
        inner.require_idle("change the save directory")?;
        if inner.options.save_directory == directory {
            return Ok(());
        }
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(|e| DownloadError::io(directory, e))?;
        inner.options.save_directory = directory.to_path_buf();
        inner.emit(SessionEvent::SaveDirectoryChanged(directory.to_path_buf()));
        Ok(())
    }

    pub async fn timeout(&self) -> Duration {
        self.shared.inner.lock().await.options.timeout
    }

    /// Stall timeout for later attempts. Zero selects the default.
    pub async fn set_timeout(&self, timeout: Duration) {
        let mut inner = self.shared.inner.lock().await;
        if inner.options.timeout != timeout {
            inner.options.timeout = timeout;
            inner.emit(SessionEvent::TimeoutChanged(timeout));
        }
    }

    pub async fn downloading_suffix(&self) -> String {
        self.shared.inner.lock().await.options.downloading_suffix.clone()
    }

    /// A leading dot is dropped. Files already being written keep their suffix.
    pub async fn set_downloading_suffix(&self, suffix: &str) -> Result<(), DownloadError> {
        let suffix = suffix.strip_prefix('.').unwrap_or(suffix);
        if suffix.is_empty() {
            warn!("downloading suffix cannot be empty");
            return Err(DownloadError::invalid("downloading suffix is empty"));
        }
        let mut inner = self.shared.inner.lock().await;
        if inner.options.downloading_suffix != suffix {
            inner.options.downloading_suffix = suffix.to_string();
            inner.emit(SessionEvent::DownloadingSuffixChanged(suffix.to_string()));
        }
        Ok(())
    }

    pub async fn proxy(&self) -> ProxyConfig {
        self.shared.inner.lock().await.options.proxy.clone()
    }

    /// Applies to requests issued after the call.
    pub async fn set_proxy(&self, proxy: ProxyConfig) -> Result<(), DownloadError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.options.proxy == proxy {
            return Ok(());
        }
        if inner.owns_transport {
            inner.transport = Arc::new(HttpTransport::new(&proxy)?);
        } else {
            debug!("injected transport keeps its own proxy settings");
        }
        inner.options.proxy = proxy.clone();
        inner.emit(SessionEvent::ProxyChanged(proxy));
        Ok(())
    }

    /// Overall completion in `0.0..=1.0`.
    pub async fn progress(&self) -> f64 {
        self.shared.inner.lock().await.progress.clamp(0.0, 1.0)
    }

    pub async fn speed(&self) -> Speed {
        self.shared.inner.lock().await.speed
    }

    pub async fn file_info(&self) -> RemoteFileInfo {
        self.shared.inner.lock().await.file_info.clone()
    }

    pub async fn breakpoint_supported(&self) -> bool {
        self.shared.inner.lock().await.breakpoint_supported()
    }

    /// The incomplete file while a transfer is open or paused.
    pub async fn working_path(&self) -> Option<PathBuf> {
        self.shared.inner.lock().await.working_path.clone()
    }
}

/// Probes `url` and begins the transfer, unless the session moved on in the meantime.
/// After a redirect only the type and size of the file info are replaced.
///
/// Boxed because it is spawned again from the callbacks of the transfer it starts.
fn launch(shared: Arc<Shared>, generation: u64, url: Url, redirected: bool) -> BoxFuture<'static, ()> {
    let span = debug_span!("launch", url = %url, redirected);
    async move {
        let prober = {
            let inner = shared.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            MetadataProber::new(inner.transport.clone())
                .with_attempts(inner.options.probe_attempts)
                .with_attempt_timeout(inner.options.probe_timeout)
        };
        let probed = prober.probe_url(&url).await;

        let mut inner = shared.inner.lock().await;
        if inner.generation != generation || inner.state != SessionState::Probing {
            debug!("probe result is stale");
            return;
        }
        let (info, ok) = match probed {
            Ok(probed) => probed,
            Err(e) => {
                inner.fail(e).await;
                return;
            }
        };
        if !ok {
            warn!("could not query file information, continuing with the name from the URL");
        }
        if redirected {
            // The name chosen for the first URL stays, redirect targets often carry
            // generated names.
            inner.file_info.file_type = info.file_type;
            inner.file_info.file_size = info.file_size;
        } else {
            inner.file_info = info;
        }
        let file_info = inner.file_info.clone();
        inner.emit(SessionEvent::FileInfoChanged(file_info));
        let supported = inner.breakpoint_supported();
        inner.emit(SessionEvent::BreakpointSupportedChanged(supported));

        if let Err(e) = inner.begin_transfer(&shared).await {
            inner.fail(e).await;
        }
    }
    .instrument(span)
    .boxed()
}

/// `rename` that fails with `AlreadyExists` instead of replacing `to`.
async fn rename_no_clobber(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::try_exists(to).await? {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    tokio::fs::rename(from, to).await
}

/// Applies the callbacks of one attempt until it ends or becomes stale.
async fn drive(shared: Arc<Shared>, generation: u64, mut events: mpsc::UnboundedReceiver<TransferEvent>) {
    while let Some(event) = events.recv().await {
        let mut inner = shared.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        match event {
            TransferEvent::Progress { received, total } => inner.on_progress(received, total),
            TransferEvent::RangeIgnored => {
                info!("server restarted the body, discarding earlier progress");
                inner.received_prior_runs = 0;
            }
            TransferEvent::Finished(outcome) => {
                inner.on_finished(&shared, outcome).await;
                return;
            }
        }
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state change");
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn set_url(&mut self, url: Option<Url>) {
        if self.url == url {
            return;
        }
        let was_supported = self.breakpoint_supported();
        self.url = url;
        let url = self.url.as_ref().map(Url::to_string).unwrap_or_default();
        self.emit(SessionEvent::UrlChanged(url));
        let supported = self.breakpoint_supported();
        if supported != was_supported {
            self.emit(SessionEvent::BreakpointSupportedChanged(supported));
        }
    }

    fn require_idle(&self, operation: &'static str) -> Result<(), DownloadError> {
        if self.state == SessionState::Idle {
            Ok(())
        } else {
            warn!(state = ?self.state, "cannot {operation} during a download");
            Err(DownloadError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn breakpoint_supported(&self) -> bool {
        self.url.as_ref().is_some_and(breakpoint_supported)
    }

    /// Opens the working file and spawns the transfer. Appends when resuming, otherwise
    /// picks a fresh collision-free name and drops any stale file under it.
    async fn begin_transfer(&mut self, shared: &Arc<Shared>) -> Result<(), DownloadError> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| DownloadError::invalid("no URL set"))?;
        let append = self.breakpoint_supported() && self.received_prior_runs > 0;

        if !append {
            self.received_prior_runs = 0;
            let directory = self.options.save_directory.clone();
            let suffix = self.options.downloading_suffix.clone();
            let name = unique_file_name(&self.file_info.file_name, &directory, &suffix)?;
            let path = directory.join(name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!(path = %path.display(), "removing stale working file");
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| DownloadError::io(&path, e))?;
            }
            self.working_path = Some(path);
            self.working_suffix = suffix;
        }
        let path = self
            .working_path
            .clone()
            .ok_or_else(|| DownloadError::invalid("no working file to resume"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let request = TransferRequest {
            url,
            path,
            resume_from: if append { self.received_prior_runs } else { 0 },
            stall_timeout: self.options.effective_timeout(),
        };
        let handle = TransferEngine::begin(self.transport.clone(), request, tx).await?;

        self.generation += 1;
        self.active = Some(handle);
        self.received_this_run = 0;
        self.total_this_run = 0;
        self.speed_meter.start();
        self.set_state(SessionState::Downloading);
        tokio::spawn(drive(shared.clone(), self.generation, rx));
        Ok(())
    }

    fn on_progress(&mut self, received: u64, total: Option<u64>) {
        self.received_this_run = received;
        // Without a length from the response, fall back to what the probe reported.
        self.total_this_run = total.unwrap_or_else(|| {
            self.file_info
                .file_size
                .saturating_sub(self.received_prior_runs)
        });
        self.progress = TransferProgress::fraction(
            self.received_this_run,
            self.total_this_run,
            self.received_prior_runs,
        );
        self.speed = self.speed_meter.sample(received);
        self.emit(SessionEvent::ProgressChanged(self.progress));
        self.emit(SessionEvent::SpeedChanged(self.speed));
    }

    async fn on_finished(&mut self, shared: &Arc<Shared>, outcome: TransferOutcome) {
        if let Some(handle) = self.active.take() {
            handle.join().await;
        }
        match outcome {
            TransferOutcome::Completed => self.finalize().await,
            TransferOutcome::Redirect(target) => self.follow_redirect(shared, target).await,
            TransferOutcome::Failed(e) => self.fail(e).await,
        }
    }

    /// Strips the working suffix. A failed rename leaves the file under its working name
    /// but still counts as success. An existing file at the final name is never replaced.
    async fn finalize(&mut self) {
        self.set_state(SessionState::Finalizing);
        let mut path = self.working_path.clone().unwrap_or_default();
        match strip_working_suffix(&path, &self.working_suffix) {
            Some(final_path) => match rename_no_clobber(&path, &final_path).await {
                Ok(()) => path = final_path,
                Err(e) => error!(
                    path = %path.display(),
                    error = %e,
                    "failed to rename the downloaded file, check your anti-virus software"
                ),
            },
            None => warn!(path = %path.display(), "working file has no suffix to strip"),
        }
        info!(path = %path.display(), "download finished");

        // The completed transfer keeps reporting full progress until the next start.
        self.reset(1.0);
        self.set_state(SessionState::Idle);
        self.emit(SessionEvent::Finished(FinishReason::Completed { path }));
    }

    /// Discards the partial file and starts over against `target`, from byte 0.
    async fn follow_redirect(&mut self, shared: &Arc<Shared>, target: Url) {
        self.redirects += 1;
        if self.redirects > MAX_REDIRECTS {
            self.fail(DownloadError::Transfer(format!(
                "more than {MAX_REDIRECTS} redirects"
            )))
            .await;
            return;
        }
        info!(to = %target, "following redirect");
        self.remove_working_file().await;
        self.received_prior_runs = 0;
        self.received_this_run = 0;
        self.total_this_run = 0;
        self.set_url(Some(target.clone()));

        self.generation += 1;
        self.set_state(SessionState::Probing);
        tokio::spawn(launch(shared.clone(), self.generation, target, true));
    }

    async fn fail(&mut self, error: DownloadError) {
        if error.is_timeout() {
            warn!(error = %error, "download timed out");
        } else {
            warn!(error = %error, "download failed");
        }
        self.generation += 1;
        if let Some(handle) = self.active.take() {
            handle.abort().await;
        }
        self.remove_working_file().await;
        self.set_state(SessionState::Failed);
        self.reset(0.0);
        self.set_state(SessionState::Idle);
        self.emit(SessionEvent::Finished(FinishReason::Failed {
            reason: error.to_string(),
        }));
    }

    async fn stop(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.active.take() {
            handle.abort().await;
        }
        let incomplete = self
            .working_path
            .as_deref()
            .is_some_and(|path| has_working_suffix(path, &self.working_suffix));
        if incomplete {
            self.remove_working_file().await;
        }
        info!("download stopped");
        self.reset(0.0);
        self.set_state(SessionState::Idle);
        self.emit(SessionEvent::Finished(FinishReason::Stopped));
    }

    async fn remove_working_file(&mut self) {
        let Some(path) = self.working_path.take() else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed working file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove working file"),
        }
    }

    /// Back to the defaults of a fresh session, except for `progress`. Options (directory,
    /// suffix, timeout, proxy) are kept.
    fn reset(&mut self, progress: f64) {
        self.set_url(None);
        if self.file_info != RemoteFileInfo::default() {
            self.file_info = RemoteFileInfo::default();
            self.emit(SessionEvent::FileInfoChanged(RemoteFileInfo::default()));
        }
        if self.progress != progress {
            self.progress = progress;
            self.emit(SessionEvent::ProgressChanged(progress));
        }
        if self.speed != Speed::default() {
            self.speed = Speed::default();
            self.emit(SessionEvent::SpeedChanged(Speed::default()));
        }
        self.received_this_run = 0;
        self.received_prior_runs = 0;
        self.total_this_run = 0;
        self.working_path = None;
        self.working_suffix.clear();
        self.redirects = 0;
        self.active = None;
    }
}
