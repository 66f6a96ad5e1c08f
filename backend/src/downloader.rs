use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use photoscenery_shared::ChunkState;
use reqwest::StatusCode;
use reqwest::redirect::Policy;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::jobs::ChunkJob;
use crate::mapserver::MapServer;
use crate::png;
use crate::state::AppState;

/// Priority channel capacities. Producers block when full.
pub const HIGH_CAPACITY: usize = 512;
pub const LOW_CAPACITY: usize = 4096;

const USER_AGENT: &str = concat!("photoscenery/", env!("CARGO_PKG_VERSION"));

/// Which queue a chunk was first enqueued on. Retries preserve the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    High,
    Low,
}

/// Emitted to the fallback manager when a chunk can no longer be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermanentFailure {
    pub tile_id: u64,
    pub size_id: u8,
}

/// HTTP statuses that are never retried.
fn is_definitive(status: StatusCode) -> bool {
    matches!(status.as_u16(), 404 | 410 | 500)
}

/// Backoff before a retry: `base^attempt`, capped.
fn backoff_secs(cfg: &Config, attempt_idx: u32) -> f64 {
    cfg.retry_backoff_base
        .powi(attempt_idx as i32)
        .min(cfg.retry_max_sleep)
}

/// Escalating per-attempt HTTP timeout.
fn attempt_timeout(cfg: &Config, attempt_idx: u32) -> Duration {
    let secs = (cfg.timeout as f64 * cfg.retry_timeout_factor.powi(attempt_idx as i32))
        .min(cfg.retry_timeout_cap);
    Duration::from_secs_f64(secs)
}

/// Dual-queue download front end shared by the orchestrator, the fallback
/// manager and the worker pool.
pub struct Downloader {
    high_tx: async_channel::Sender<ChunkJob>,
    high_rx: async_channel::Receiver<ChunkJob>,
    low_tx: async_channel::Sender<ChunkJob>,
    low_rx: async_channel::Receiver<ChunkJob>,
    /// staging_path -> class, so retries re-enter the original queue.
    classes: Mutex<HashMap<PathBuf, PriorityClass>>,
    fail_tx: mpsc::Sender<PermanentFailure>,
    state: Arc<AppState>,
    client: reqwest::Client,
    server: MapServer,
    cfg: Arc<Config>,
}

impl Downloader {
    pub fn new(
        cfg: Arc<Config>,
        server: MapServer,
        state: Arc<AppState>,
        fail_tx: mpsc::Sender<PermanentFailure>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::none());
        if let Some(proxy) = server.proxy.as_deref().or(cfg.proxy.as_deref()) {
            builder = builder.proxy(reqwest::Proxy::all(format!("http://{proxy}"))?);
        }
        let client = builder.build()?;

        let (high_tx, high_rx) = async_channel::bounded(HIGH_CAPACITY);
        let (low_tx, low_rx) = async_channel::bounded(LOW_CAPACITY);
        Ok(Arc::new(Downloader {
            high_tx,
            high_rx,
            low_tx,
            low_rx,
            classes: Mutex::new(HashMap::new()),
            fail_tx,
            state,
            client,
            server,
            cfg,
        }))
    }

    pub fn queue_len(&self) -> usize {
        self.high_rx.len() + self.low_rx.len()
    }

    /// Enqueue a job on a queue. Registers its class so retries stay in the
    /// same queue, and bumps the pending counter.
    pub async fn enqueue(&self, job: ChunkJob, class: PriorityClass) {
        self.classes
            .lock()
            .unwrap()
            .insert(job.staging_path.clone(), class);
        self.state.inc_pending(1);
        self.state
            .set_chunk_state(job.tile_id, job.x, job.y_top, ChunkState::Pending);
        self.send(job, class).await;
    }

    async fn send(&self, job: ChunkJob, class: PriorityClass) {
        let result = match class {
            PriorityClass::High => self.high_tx.send(job).await,
            PriorityClass::Low => self.low_tx.send(job).await,
        };
        if result.is_err() {
            warn!("download queue closed, dropping job");
            self.state.dec_pending();
        }
    }

    fn class_of(&self, job: &ChunkJob) -> PriorityClass {
        self.classes
            .lock()
            .unwrap()
            .get(&job.staging_path)
            .copied()
            .unwrap_or(PriorityClass::Low)
    }

    fn forget_class(&self, job: &ChunkJob) {
        self.classes.lock().unwrap().remove(&job.staging_path);
    }

    /// Next job, preferring HIGH. HIGH is drained without waiting; only when
    /// it is empty do we wait on both queues at once.
    pub async fn next_job(&self) -> Option<ChunkJob> {
        if let Ok(job) = self.high_rx.try_recv() {
            return Some(job);
        }
        tokio::select! {
            biased;
            job = self.high_rx.recv() => job.ok(),
            job = self.low_rx.recv() => job.ok(),
        }
    }

    /// One worker loop. Runs until shutdown or queue closure.
    pub async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!(worker_id, "download worker started");
        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                job = self.next_job() => job,
            };
            let Some(job) = job else { break };
            self.process(job).await;
        }
        debug!(worker_id, "download worker stopped");
    }

    /// Handle one chunk job to completion, retry or permanent failure.
    pub async fn process(&self, job: ChunkJob) {
        // A staged file from an earlier run may already satisfy the job.
        if self.staged_file_ok(&job) {
            self.complete(&job, 0);
            return;
        }

        self.state
            .set_chunk_state(job.tile_id, job.x, job.y_top, ChunkState::InProgress);

        let attempt_idx = self.cfg.attempts.saturating_sub(job.retries_left);
        let url = self.server.render(&job.bbox, job.width_px, job.height_px);
        match self.fetch(&url, attempt_timeout(&self.cfg, attempt_idx)).await {
            FetchResult::Body(bytes) => match self.persist(&job, &bytes) {
                Ok(()) => self.complete(&job, bytes.len() as u64),
                Err(e) => {
                    debug!("chunk {} failed validation: {e}", job.staging_path.display());
                    self.retry_or_fail(job, attempt_idx).await;
                }
            },
            FetchResult::Definitive(status) => {
                info!(
                    "definitive {status} for tile {} chunk ({}, {})",
                    job.tile_id, job.x, job.y_top
                );
                self.permanent_failure(&job).await;
            }
            FetchResult::Transient(reason) => {
                debug!("transient failure for {}: {reason}", job.staging_path.display());
                self.retry_or_fail(job, attempt_idx).await;
            }
        }
    }

    fn staged_file_ok(&self, job: &ChunkJob) -> bool {
        let len = match fs::metadata(&job.staging_path) {
            Ok(m) => m.len(),
            Err(_) => return false,
        };
        len >= job.min_bytes && png::file_has_signature(&job.staging_path)
    }

    /// GET with manual 301/302 following, preserving the method.
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchResult {
        let mut target = url.to_string();
        for _ in 0..=self.cfg.max_redirects {
            let response = match self.client.get(&target).timeout(timeout).send().await {
                Ok(r) => r,
                Err(e) => return FetchResult::Transient(e.to_string()),
            };
            let status = response.status();
            if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
                match response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    Some(next) => {
                        target = next.to_string();
                        continue;
                    }
                    None => return FetchResult::Transient("redirect without location".into()),
                }
            }
            if status.is_success() {
                return match response.bytes().await {
                    Ok(bytes) => FetchResult::Body(bytes.to_vec()),
                    Err(e) => FetchResult::Transient(e.to_string()),
                };
            }
            if is_definitive(status) {
                return FetchResult::Definitive(status);
            }
            return FetchResult::Transient(format!("status {status}"));
        }
        FetchResult::Transient("too many redirects".into())
    }

    /// Validate the body as PNG, confirm decodability, then write
    /// atomically via `<staging>.tmp`.
    fn persist(&self, job: &ChunkJob, bytes: &[u8]) -> anyhow::Result<()> {
        if !png::validate_structure(bytes) {
            anyhow::bail!("response is not a structurally valid PNG");
        }
        image::load_from_memory_with_format(bytes, image::ImageFormat::Png)?;

        if let Some(parent) = job.staging_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = PathBuf::from(format!("{}.tmp", job.staging_path.display()));
        fs::write(&tmp, bytes)?;
        if let Err(e) = fs::rename(&tmp, &job.staging_path) {
            fs::remove_file(&tmp).ok();
            return Err(e.into());
        }
        Ok(())
    }

    fn complete(&self, job: &ChunkJob, bytes: u64) {
        if bytes > 0 {
            self.state.add_downloaded(bytes);
            self.state.add_tile_bytes(job.tile_id, bytes);
        }
        self.state
            .set_chunk_state(job.tile_id, job.x, job.y_top, ChunkState::Completed);
        self.state.mark_done();
        self.state.broadcast_totals();
        self.forget_class(job);
    }

    async fn retry_or_fail(&self, mut job: ChunkJob, attempt_idx: u32) {
        if job.retries_left == 0 {
            self.permanent_failure(&job).await;
            return;
        }
        job.retries_left -= 1;
        let class = self.class_of(&job);
        let sleep = backoff_secs(&self.cfg, attempt_idx);
        let tx = match class {
            PriorityClass::High => self.high_tx.clone(),
            PriorityClass::Low => self.low_tx.clone(),
        };
        // Back off outside the worker so the pool keeps draining.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(sleep)).await;
            let _ = tx.send(job).await;
        });
    }

    async fn permanent_failure(&self, job: &ChunkJob) {
        self.state
            .set_chunk_state(job.tile_id, job.x, job.y_top, ChunkState::Failed);
        self.state.mark_failed();
        self.state.broadcast_totals();
        self.state.log_line(format!(
            "chunk ({}, {}) of tile {} failed permanently",
            job.x, job.y_top, job.tile_id
        ));
        self.forget_class(job);
        let _ = self
            .fail_tx
            .send(PermanentFailure {
                tile_id: job.tile_id,
                size_id: job.size_id,
            })
            .await;
    }
}

enum FetchResult {
    Body(Vec<u8>),
    Definitive(StatusCode),
    Transient(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::TileMetadata;
    use crate::jobs;
    use crate::mapserver;
    use clap::Parser;

    fn test_downloader() -> (Arc<Downloader>, mpsc::Receiver<PermanentFailure>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let args = crate::config::Args::try_parse_from(["photoscenery"]).unwrap();
        let cfg = Arc::new(Config::from_args(&args).unwrap());
        let (state, _log) = AppState::new();
        let (fail_tx, fail_rx) = mpsc::channel(64);
        let dl = Downloader::new(
            cfg,
            mapserver::builtin_servers().remove(0),
            state,
            fail_tx,
        )
        .unwrap();
        (dl, fail_rx, dir)
    }

    fn job_in(dir: &std::path::Path, size_id: u8) -> ChunkJob {
        let meta = TileMetadata::new(47.25, 11.31, size_id);
        jobs::chunk_jobs(&meta, dir, 3).jobs.remove(0)
    }

    #[tokio::test]
    async fn high_queue_preempts_low() {
        let (dl, _fail, dir) = test_downloader();
        let mut low_job = job_in(dir.path(), 3);
        low_job.x = 99; // marker
        let high_job = job_in(dir.path(), 3);

        dl.enqueue(low_job, PriorityClass::Low).await;
        dl.enqueue(high_job, PriorityClass::High).await;

        let first = dl.next_job().await.unwrap();
        assert_ne!(first.x, 99, "HIGH job must be dispatched first");
        let second = dl.next_job().await.unwrap();
        assert_eq!(second.x, 99);
    }

    #[tokio::test]
    async fn retry_preserves_class() {
        let (dl, _fail, dir) = test_downloader();
        let job = job_in(dir.path(), 3);
        dl.enqueue(job.clone(), PriorityClass::High).await;
        let job = dl.next_job().await.unwrap();

        assert_eq!(dl.class_of(&job), PriorityClass::High);
        dl.retry_or_fail(job, 0).await;

        // The retried job lands back on HIGH.
        let retried = tokio::time::timeout(Duration::from_secs(5), dl.high_rx.recv())
            .await
            .expect("retry did not re-enqueue in time")
            .unwrap();
        assert_eq!(retried.retries_left, 2);
        assert!(dl.low_rx.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_emit_permanent_failure() {
        let (dl, mut fail_rx, dir) = test_downloader();
        let mut job = job_in(dir.path(), 3);
        job.retries_left = 0;
        dl.enqueue(job.clone(), PriorityClass::Low).await;
        let job = dl.next_job().await.unwrap();
        dl.retry_or_fail(job, 3).await;

        let event = fail_rx.recv().await.unwrap();
        assert_eq!(event.tile_id, TileMetadata::new(47.25, 11.31, 3).id);
        assert_eq!(event.size_id, 3);
        assert_eq!(dl.state.totals_snapshot().failed, 1);
    }

    #[tokio::test]
    async fn staged_file_short_circuits_download() {
        let (dl, _fail, dir) = test_downloader();
        let mut job = job_in(dir.path(), 3);
        job.min_bytes = 64;

        // Stage a plausible PNG bigger than the threshold.
        let img = image::RgbaImage::from_pixel(64, 64, image::Rgba([7, 7, 7, 255]));
        img.save(&job.staging_path).unwrap();
        assert!(fs::metadata(&job.staging_path).unwrap().len() >= job.min_bytes);

        dl.enqueue(job.clone(), PriorityClass::Low).await;
        let job = dl.next_job().await.unwrap();
        dl.process(job).await;

        let totals = dl.state.totals_snapshot();
        assert_eq!(totals.done, 1);
        assert_eq!(totals.pending, 0);
    }

    /// Serve `responses` to sequential connections on a fresh local port.
    async fn canned_server(responses: Vec<Vec<u8>>) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = socket.write_all(&response).await;
            }
        });
        port
    }

    fn http_response(status_line: &str, extra_headers: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {status_line}\r\n{extra_headers}Content-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    fn png_body() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(32, 32, image::Rgba([60, 90, 120, 255]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn downloader_for_port(
        port: u16,
    ) -> (Arc<Downloader>, mpsc::Receiver<PermanentFailure>) {
        let args = crate::config::Args::try_parse_from(["photoscenery"]).unwrap();
        let cfg = Arc::new(Config::from_args(&args).unwrap());
        let (state, _log) = AppState::new();
        let (fail_tx, fail_rx) = mpsc::channel(64);
        let server = MapServer {
            id: 1,
            name: "canned".to_string(),
            url_base: format!("http://127.0.0.1:{port}"),
            url_template: "/tile?b={lonLL},{latLL},{lonUR},{latUR}&s={szWidth}x{szHight}"
                .to_string(),
            proxy: None,
        };
        let dl = Downloader::new(cfg, server, state, fail_tx).unwrap();
        (dl, fail_rx)
    }

    #[tokio::test]
    async fn downloads_and_persists_a_chunk() {
        let port = canned_server(vec![http_response("200 OK", "", &png_body())]).await;
        let (dl, _fail) = downloader_for_port(port);
        let dir = tempfile::tempdir().unwrap();
        let mut job = job_in(dir.path(), 3);
        job.min_bytes = 64;

        dl.enqueue(job.clone(), PriorityClass::Low).await;
        let job = dl.next_job().await.unwrap();
        dl.process(job.clone()).await;

        assert!(job.staging_path.exists());
        assert!(png::file_has_signature(&job.staging_path));
        let totals = dl.state.totals_snapshot();
        assert_eq!(totals.done, 1);
        assert_eq!(totals.pending, 0);
        assert!(totals.bytes_downloaded > 0);
    }

    #[tokio::test]
    async fn follows_301_redirect_to_payload() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        // Bind first so the Location header can carry the real port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let redirect = http_response(
            "301 Moved Permanently",
            &format!("Location: http://127.0.0.1:{port}/elsewhere\r\n"),
            b"",
        );
        let payload = http_response("200 OK", "", &png_body());
        tokio::spawn(async move {
            for response in [redirect, payload] {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = socket.write_all(&response).await;
            }
        });

        let (dl, _fail) = downloader_for_port(port);
        let dir = tempfile::tempdir().unwrap();
        let mut job = job_in(dir.path(), 3);
        job.min_bytes = 64;

        dl.enqueue(job.clone(), PriorityClass::Low).await;
        let job = dl.next_job().await.unwrap();
        dl.process(job.clone()).await;

        assert!(job.staging_path.exists());
        assert_eq!(dl.state.totals_snapshot().done, 1);
        assert_eq!(dl.state.totals_snapshot().failed, 0);
    }

    #[tokio::test]
    async fn definitive_404_routes_to_fallback() {
        let port = canned_server(vec![http_response("404 Not Found", "", b"gone")]).await;
        let (dl, mut fail_rx) = downloader_for_port(port);
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), 3);

        dl.enqueue(job.clone(), PriorityClass::Low).await;
        let job = dl.next_job().await.unwrap();
        dl.process(job.clone()).await;

        let event = fail_rx.recv().await.unwrap();
        assert_eq!(event.tile_id, job.tile_id);
        assert_eq!(event.size_id, job.size_id);
        assert!(!job.staging_path.exists());
        assert_eq!(dl.state.totals_snapshot().failed, 1);
    }

    #[tokio::test]
    async fn invalid_body_is_retried_not_failed() {
        let port = canned_server(vec![http_response("200 OK", "", b"not a png at all")]).await;
        let (dl, _fail) = downloader_for_port(port);
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), 3);

        dl.enqueue(job.clone(), PriorityClass::Low).await;
        let job = dl.next_job().await.unwrap();
        dl.process(job.clone()).await;

        // Not failed; a retry was scheduled back onto LOW.
        assert_eq!(dl.state.totals_snapshot().failed, 0);
        let retried = tokio::time::timeout(Duration::from_secs(5), dl.low_rx.recv())
            .await
            .expect("retry did not re-enqueue in time")
            .unwrap();
        assert_eq!(retried.retries_left, job.retries_left - 1);
    }

    #[test]
    fn backoff_and_timeout_curves() {
        let args = crate::config::Args::try_parse_from(["photoscenery"]).unwrap();
        let cfg = Config::from_args(&args).unwrap();
        assert_eq!(backoff_secs(&cfg, 0), 1.0);
        assert_eq!(backoff_secs(&cfg, 1), 2.0);
        assert_eq!(backoff_secs(&cfg, 2), 4.0);
        // Capped by retry_max_sleep.
        assert_eq!(backoff_secs(&cfg, 20), cfg.retry_max_sleep);

        assert_eq!(attempt_timeout(&cfg, 0), Duration::from_secs(20));
        assert_eq!(attempt_timeout(&cfg, 1), Duration::from_secs(30));
        // Capped by retry_timeout_cap.
        assert_eq!(
            attempt_timeout(&cfg, 30),
            Duration::from_secs_f64(cfg.retry_timeout_cap)
        );
    }

    #[test]
    fn definitive_statuses() {
        assert!(is_definitive(StatusCode::NOT_FOUND));
        assert!(is_definitive(StatusCode::GONE));
        assert!(is_definitive(StatusCode::INTERNAL_SERVER_ERROR));
        // 403 is treated as transient.
        assert!(!is_definitive(StatusCode::FORBIDDEN));
        assert!(!is_definitive(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_definitive(StatusCode::SERVICE_UNAVAILABLE));
    }
}
