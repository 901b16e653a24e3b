//! Delegation of a transfer to an external `aria2c` process.
//!
//! Two ways of handing over a job are supported. The manifest mode writes a
//! temporary `--input-file` and waits for the process to exit. The RPC mode starts
//! aria2 with its JSON-RPC interface bound to a loopback port, submits the URI and
//! polls `aria2.tellStatus` until the job reaches a terminal state.
//!
//! Every child is started with `--stop-with-process=<our pid>` and
//! `kill_on_drop`, and is explicitly terminated when the job is cancelled.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DownloadJob;
use super::error::{DownloadError, DownloadResult};
use super::progress::{ProgressReporter, TransferProgress};
use super::settings::{DelegationMode, DownloadSettings};
use super::strategy::probe_executable;

/// Time allowed for a terminated child to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
/// Attempts to reach a freshly started RPC endpoint, one per poll interval.
const RPC_STARTUP_ATTEMPTS: u32 = 200;
const MIN_TLS_VERSION: &str = "TLSv1.2";

pub struct Aria2Client {
    program: PathBuf,
    settings: DownloadSettings,
}

impl Aria2Client {
    /// Probes `settings.program` on `PATH`.
    pub fn new(settings: &DownloadSettings) -> DownloadResult<Self> {
        let program = probe_executable(&settings.program).ok_or_else(|| {
            DownloadError::ExternalToolNotFound {
                program: settings.program.clone(),
            }
        })?;
        Ok(Self::with_program(program, settings))
    }

    /// Uses an already resolved executable.
    pub fn with_program(program: PathBuf, settings: &DownloadSettings) -> Self {
        Self {
            program,
            settings: settings.clone(),
        }
    }

    /// Downloads `job` into `job.destination_dir/out`.
    pub async fn download(
        &self,
        job: &DownloadJob,
        out: &str,
        reporter: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> DownloadResult<PathBuf> {
        let target = job.destination_dir.join(out);
        info!(
            "Delegating {} to {} ({:?} mode)",
            job.url,
            self.program.display(),
            self.settings.mode
        );

        match self.settings.mode {
            DelegationMode::Manifest => self.download_with_manifest(job, out, cancel).await?,
            DelegationMode::Rpc => self.download_with_rpc(job, out, reporter, cancel).await?,
        }

        Ok(target)
    }

    /// Flags every aria2 invocation carries, in a fixed order.
    pub fn base_args(&self) -> Vec<String> {
        let s = &self.settings;
        let mut args = vec![
            "--allow-overwrite=true".to_string(),
            "--auto-file-renaming=false".to_string(),
            "--continue=true".to_string(),
            format!("--retry-wait={}", s.retry_wait),
            format!("--split={}", s.split),
            format!("--max-connection-per-server={}", s.max_connection_per_server),
            format!("--min-split-size={}", s.min_split_size),
            format!("--min-tls-version={MIN_TLS_VERSION}"),
            format!("--stop-with-process={}", std::process::id()),
            "--console-log-level=warn".to_string(),
            "--summary-interval=0".to_string(),
        ];
        args.extend(s.extra_options.iter().cloned());
        args
    }

    async fn download_with_manifest(
        &self,
        job: &DownloadJob,
        out: &str,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        // removed when dropped, on every return path
        let manifest = write_manifest(job, out)?;

        let mut args = self.base_args();
        args.push(format!("--input-file={}", manifest.path().display()));

        let mut child = self.spawn(&args)?;
        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| DownloadError::io(&self.program, e))?,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(DownloadError::Cancelled);
            }
        };

        check_exit(status)
    }

    async fn download_with_rpc(
        &self,
        job: &DownloadJob,
        out: &str,
        reporter: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        let port = free_loopback_port().map_err(|e| DownloadError::io("127.0.0.1", e))?;
        let secret = uuid::Uuid::new_v4().simple().to_string();

        let mut args = self.base_args();
        args.extend([
            "--enable-rpc=true".to_string(),
            "--rpc-listen-all=false".to_string(),
            format!("--rpc-listen-port={port}"),
            format!("--rpc-secret={secret}"),
        ]);

        let mut child = self.spawn(&args)?;
        let rpc = RpcClient::new(format!("http://127.0.0.1:{port}/jsonrpc"), &secret)?;
        let interval = self.settings.poll_interval();

        let result = tokio::select! {
            result = async {
                rpc.wait_until_ready(interval).await?;
                let gid = rpc.add_uri(job, out).await?;
                debug!("aria2 accepted {} as gid {}", job.url, gid);
                poll_until_complete(&rpc, &gid, interval, reporter).await
            } => result,
            status = child.wait() => Err(match status {
                Ok(status) if !status.success() => DownloadError::ExternalToolFailed { exit_code: status.code() },
                Ok(status) => DownloadError::DelegationLost {
                    reason: format!("aria2 exited early ({status})"),
                },
                Err(e) => DownloadError::io(&self.program, e),
            }),
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        };

        if let Err(e) = rpc.shutdown().await {
            debug!("aria2.shutdown failed: {}", e);
        }
        terminate(&mut child).await;

        result
    }

    fn spawn(&self, args: &[String]) -> DownloadResult<Child> {
        debug!("Spawning {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DownloadError::ExternalToolNotFound {
                    program: self.program.display().to_string(),
                },
                _ => DownloadError::io(&self.program, e),
            })?;

        if let Some(stdout) = child.stdout.take() {
            relay_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            relay_output(stderr, "stderr");
        }

        Ok(child)
    }
}

/// Renders the aria2 input file for one job.
pub fn manifest_contents(job: &DownloadJob, out: &str) -> String {
    format!(
        "{}\n  referer={}\n  dir={}\n  out={}\n",
        job.url,
        job.referer.as_deref().unwrap_or("*"),
        job.destination_dir.display(),
        out
    )
}

fn write_manifest(job: &DownloadJob, out: &str) -> DownloadResult<NamedTempFile> {
    let mut manifest = tempfile::Builder::new()
        .prefix("mcst-aria2-")
        .suffix(".txt")
        .tempfile()
        .map_err(|e| DownloadError::io(std::env::temp_dir(), e))?;

    manifest
        .write_all(manifest_contents(job, out).as_bytes())
        .and_then(|_| manifest.flush())
        .map_err(|e| DownloadError::io(manifest.path(), e))?;

    Ok(manifest)
}

fn check_exit(status: ExitStatus) -> DownloadResult<()> {
    if status.success() {
        Ok(())
    } else {
        Err(DownloadError::ExternalToolFailed {
            exit_code: status.code(),
        })
    }
}

fn relay_output<R>(stream: R, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                debug!(target: "aria2", "[{}] {}", name, line);
            }
        }
    });
}

/// Asks the child to stop, then kills it if it does not exit in time.
///
/// Always reaps the child so no zombie is left behind.
pub(crate) async fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: signals a pid we spawned and have not reaped yet
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("aria2 ignored SIGTERM, killing it");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill aria2: {}", e);
            }
        }
    }
}

fn free_loopback_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Fields of `aria2.tellStatus` the poller needs. aria2 encodes numbers as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aria2Status {
    pub status: String,
    #[serde(default)]
    pub total_length: Option<String>,
    #[serde(default)]
    pub completed_length: Option<String>,
    #[serde(default)]
    pub connections: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Aria2Status {
    fn number(field: &Option<String>) -> Option<u64> {
        field.as_deref().and_then(|v| v.parse().ok())
    }

    /// Folds this status into `progress`.
    pub fn apply(&self, progress: &mut TransferProgress) {
        progress.set_total(Self::number(&self.total_length));
        if let Some(completed) = Self::number(&self.completed_length) {
            progress.observe(completed);
        }
        progress.active_connections = Self::number(&self.connections).unwrap_or(0) as u32;
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Minimal aria2 JSON-RPC client.
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(endpoint: impl Into<String>, secret: &str) -> DownloadResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .map_err(DownloadError::Client)?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            token: format!("token:{secret}"),
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> DownloadResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut all_params = vec![Value::String(self.token.clone())];
        all_params.extend(params);

        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": all_params,
        });

        let lost = |reason: String| DownloadError::DelegationLost { reason };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| lost(format!("{method}: {e}")))?;

        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| lost(format!("{method}: malformed response: {e}")))?;

        match (parsed.result, parsed.error) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) => Err(lost(format!(
                "{method}: aria2 error {}: {}",
                err.code, err.message
            ))),
            (None, None) => Err(lost(format!("{method}: empty response"))),
        }
    }

    /// Retries `aria2.getVersion` until the endpoint answers.
    pub async fn wait_until_ready(&self, interval: Duration) -> DownloadResult<()> {
        let mut last_error = None;
        for _ in 0..RPC_STARTUP_ATTEMPTS {
            match self.call::<Value>("aria2.getVersion", Vec::new()).await {
                Ok(_) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
            tokio::time::sleep(interval).await;
        }
        Err(last_error.unwrap_or_else(|| DownloadError::DelegationLost {
            reason: "RPC endpoint never came up".to_string(),
        }))
    }

    pub async fn add_uri(&self, job: &DownloadJob, out: &str) -> DownloadResult<String> {
        let mut options = json!({
            "dir": job.destination_dir.display().to_string(),
            "out": out,
        });
        if let Some(referer) = &job.referer {
            options["referer"] = Value::String(referer.clone());
        }
        self.call("aria2.addUri", vec![json!([job.url.as_str()]), options])
            .await
    }

    pub async fn tell_status(&self, gid: &str) -> DownloadResult<Aria2Status> {
        let keys = json!([
            "status",
            "totalLength",
            "completedLength",
            "connections",
            "errorCode",
            "errorMessage"
        ]);
        self.call("aria2.tellStatus", vec![json!(gid), keys]).await
    }

    pub async fn shutdown(&self) -> DownloadResult<()> {
        self.call::<Value>("aria2.shutdown", Vec::new()).await.map(|_| ())
    }
}

/// Polls `gid` every `interval` until it completes, relaying progress.
pub async fn poll_until_complete(
    rpc: &RpcClient,
    gid: &str,
    interval: Duration,
    reporter: &mut ProgressReporter,
) -> DownloadResult<()> {
    let mut progress = TransferProgress::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let status = rpc.tell_status(gid).await?;
        status.apply(&mut progress);

        match status.status.as_str() {
            "complete" => {
                if let Some(total) = progress.total_bytes {
                    progress.observe(total);
                }
                progress.active_connections = 0;
                reporter.flush(&progress);
                return Ok(());
            }
            "error" => {
                warn!(
                    "aria2 reported an error for {}: {}",
                    gid,
                    status.error_message.as_deref().unwrap_or("unknown")
                );
                return Err(DownloadError::ExternalToolFailed {
                    exit_code: status.error_code.as_deref().and_then(|c| c.parse().ok()),
                });
            }
            "removed" => return Err(DownloadError::Cancelled),
            _ => reporter.update(&progress),
        }
    }
}
