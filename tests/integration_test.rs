use mcst::download::{
    DelegationMode, DownloadError, DownloadJob, DownloadManager, DownloadProgress, DownloadSettings,
    Downloader, Strategy,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve(path_str: &str, template: ResponseTemplate, expected_requests: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(path_str))
        .respond_with(template)
        .expect(expected_requests)
        .mount(&server)
        .await;
    server
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn drain(mut rx: mpsc::UnboundedReceiver<DownloadProgress>) -> Vec<DownloadProgress> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_plain_download_writes_exact_bytes() {
    let content = body(1_000_000);
    let server = serve(
        "/files/app.bin",
        ResponseTemplate::new(200).set_body_bytes(content.clone()),
        1,
    )
    .await;
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(DownloadSettings::default()).unwrap();
    let job = DownloadJob::new(&format!("{}/files/app.bin", server.uri()), dir.path()).unwrap();
    let path = downloader.download(&job).await.unwrap();

    assert_eq!(path, dir.path().join("app.bin"));
    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), 1_000_000);
    assert_eq!(written, content);
}

#[tokio::test]
async fn test_second_download_of_same_job_sends_no_request() {
    let server = serve(
        "/download/Mohist/1.20.1/build524",
        ResponseTemplate::new(200).set_body_bytes(b"mohist core".to_vec()),
        1,
    )
    .await;
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(DownloadSettings::default()).unwrap();
    let job = DownloadJob::new(
        &format!("{}/download/Mohist/1.20.1/build524", server.uri()),
        dir.path(),
    )
    .unwrap();

    let first = downloader.download(&job).await.unwrap();
    let second = downloader.download(&job).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.file_name().unwrap(), "build524");
    // the mock's expect(1) is verified when the server drops
}

#[tokio::test]
async fn test_existing_file_is_not_overwritten() {
    let server = serve(
        "/paper.jar",
        ResponseTemplate::new(200).set_body_bytes(b"new bytes".to_vec()),
        1,
    )
    .await;
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("paper.jar"), b"old bytes").unwrap();

    let downloader = Downloader::new(DownloadSettings::default()).unwrap();
    let job = DownloadJob::new(&format!("{}/paper.jar", server.uri()), dir.path()).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let path = downloader
        .download_with_progress(&job, Some(tx), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"old bytes");
    let events = drain(rx);
    assert!(events.iter().any(|e| matches!(e, DownloadProgress::Skipped { .. })));
    assert!(!events.iter().any(|e| matches!(e, DownloadProgress::Started { .. })));
}

#[tokio::test]
async fn test_content_disposition_name_is_used() {
    let server = serve(
        "/v1/download/latest",
        ResponseTemplate::new(200)
            .insert_header("Content-Disposition", r#"attachment; filename="core.jar""#)
            .set_body_bytes(b"jar".to_vec()),
        1,
    )
    .await;
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(DownloadSettings::default()).unwrap();
    let job = DownloadJob::new(&format!("{}/v1/download/latest", server.uri()), dir.path()).unwrap();
    let path = downloader.download(&job).await.unwrap();

    assert_eq!(path, dir.path().join("core.jar"));
    assert_eq!(job.file_name(), Some("core.jar"));
}

#[tokio::test]
async fn test_traversal_in_header_stays_inside_directory() {
    let server = serve(
        "/evil",
        ResponseTemplate::new(200)
            .insert_header("Content-Disposition", r#"attachment; filename="../../escape.jar""#)
            .set_body_bytes(b"x".to_vec()),
        1,
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("cores");
    std::fs::create_dir(&dest).unwrap();

    let downloader = Downloader::new(DownloadSettings::default()).unwrap();
    let job = DownloadJob::new(&format!("{}/evil", server.uri()), &dest).unwrap();
    let path = downloader.download(&job).await.unwrap();

    assert_eq!(path, dest.join("escape.jar"));
    assert!(!dir.path().join("escape.jar").exists());
}

#[tokio::test]
async fn test_http_error_is_remote_failure() {
    let server = serve("/missing.jar", ResponseTemplate::new(404), 1).await;
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(DownloadSettings::default()).unwrap();
    let job = DownloadJob::new(&format!("{}/missing.jar", server.uri()), dir.path()).unwrap();
    let err = downloader.download(&job).await.unwrap_err();

    assert!(matches!(
        err,
        DownloadError::RemoteRequestFailed {
            status: Some(404),
            ..
        }
    ));
    assert!(!dir.path().join("missing.jar").exists());
}

#[tokio::test]
async fn test_trailing_slash_cannot_be_named() {
    let server = serve(
        "/download/",
        ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()),
        2,
    )
    .await;
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(DownloadSettings::default()).unwrap();
    let job = DownloadJob::new(&format!("{}/download/", server.uri()), dir.path()).unwrap();
    let err = downloader.download(&job).await.unwrap_err();
    assert!(matches!(err, DownloadError::UnresolvableFileName { .. }));

    // an explicit name resolves it
    let job = job.with_file_name("spigot.jar").unwrap();
    let path = downloader.download(&job).await.unwrap();
    assert_eq!(path, dir.path().join("spigot.jar"));
}

#[tokio::test]
async fn test_missing_destination_directory() {
    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(DownloadSettings::default()).unwrap();
    let job = DownloadJob::new("http://127.0.0.1:9/core.jar", dir.path().join("nope")).unwrap();

    let err = downloader.download(&job).await.unwrap_err();
    assert!(matches!(err, DownloadError::Io { .. }));
}

#[tokio::test]
async fn test_progress_is_monotonic_and_bounded() {
    let total = 1_000_000u64;
    let server = serve(
        "/big.jar",
        ResponseTemplate::new(200).set_body_bytes(body(total as usize)),
        1,
    )
    .await;
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(DownloadSettings::default()).unwrap();
    let job = DownloadJob::new(&format!("{}/big.jar", server.uri()), dir.path()).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    downloader
        .download_with_progress(&job, Some(tx), &CancellationToken::new())
        .await
        .unwrap();

    let events = drain(rx);
    assert!(matches!(
        events.first(),
        Some(DownloadProgress::Started {
            strategy: Strategy::Builtin,
            ..
        })
    ));
    assert!(matches!(
        events.last(),
        Some(DownloadProgress::Completed {
            bytes_downloaded: 1_000_000,
            ..
        })
    ));

    let mut last = 0;
    let mut updates = 0;
    for event in &events {
        if let DownloadProgress::Progress { progress, .. } = event {
            assert_eq!(progress.total_bytes, Some(total));
            assert!(progress.completed_bytes >= last);
            assert!(progress.completed_bytes <= total);
            last = progress.completed_bytes;
            updates += 1;
        }
    }
    assert_eq!(last, total);
    assert!(updates >= 2);
}

#[tokio::test]
async fn test_delegation_enabled_without_tool_falls_back() {
    let server = serve(
        "/core.jar",
        ResponseTemplate::new(200).set_body_bytes(b"builtin".to_vec()),
        1,
    )
    .await;
    let dir = TempDir::new().unwrap();

    let settings = DownloadSettings::default()
        .with_delegation(true)
        .with_program("mcst-missing-aria2c");
    let downloader = Downloader::new(settings).unwrap();
    assert_eq!(downloader.strategy(), Strategy::Builtin);

    let job = DownloadJob::new(&format!("{}/core.jar", server.uri()), dir.path()).unwrap();
    let path = downloader.download(&job).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"builtin");
}

#[tokio::test]
async fn test_manager_runs_jobs_concurrently() {
    let server = MockServer::start().await;
    for name in ["a.jar", "b.jar", "c.jar"] {
        Mock::given(method("GET"))
            .and(path(format!("/{name}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(name.as_bytes().to_vec())
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;
    }
    let dir = TempDir::new().unwrap();

    let (manager, rx) = DownloadManager::new(DownloadSettings::default(), 2).unwrap();
    let jobs = ["a.jar", "b.jar", "c.jar"]
        .iter()
        .map(|n| DownloadJob::new(&format!("{}/{n}", server.uri()), dir.path()).unwrap())
        .collect::<Vec<_>>();

    let results = manager.download_all(jobs).await;
    assert_eq!(results.len(), 3);
    for ((job, result), name) in results.iter().zip(["a.jar", "b.jar", "c.jar"]) {
        let path = result.as_ref().unwrap();
        assert_eq!(path, &dir.path().join(name));
        assert_eq!(job.file_name(), Some(name));
        assert_eq!(std::fs::read(path).unwrap(), name.as_bytes());
    }
    assert!(manager.get_active_downloads().await.is_empty());

    drop(manager);
    let completed = drain(rx)
        .into_iter()
        .filter(|e| matches!(e, DownloadProgress::Completed { .. }))
        .count();
    assert_eq!(completed, 3);
}

#[tokio::test]
async fn test_manager_shutdown_cancels_jobs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"slow".to_vec())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();

    let (manager, _rx) = DownloadManager::new(DownloadSettings::default(), 1).unwrap();
    let jobs = vec![
        DownloadJob::new(&format!("{}/one.jar", server.uri()), dir.path()).unwrap(),
        DownloadJob::new(&format!("{}/two.jar", server.uri()), dir.path()).unwrap(),
    ];

    let token = manager.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let results = tokio::time::timeout(Duration::from_secs(5), manager.download_all(jobs))
        .await
        .expect("cancellation should end both jobs quickly");
    for (_, result) in results {
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}

#[tokio::test]
async fn test_cancel_download_stops_only_that_job() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.jar"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"slow".to_vec())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fast.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fast".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();

    let (manager, _rx) = DownloadManager::new(DownloadSettings::default(), 2).unwrap();
    let slow = DownloadJob::new(&format!("{}/slow.jar", server.uri()), dir.path()).unwrap();
    let fast = DownloadJob::new(&format!("{}/fast.jar", server.uri()), dir.path()).unwrap();
    let slow_id = slow.id.clone();

    let canceller = async {
        for _ in 0..250 {
            if manager.get_active_downloads().await.contains(&slow_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // let the fast job finish while the slow one is still waiting on headers
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.cancel_download(&slow_id).await;
    };

    let (results, ()) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(manager.download_all(vec![slow, fast]), canceller) },
    )
    .await
    .expect("cancelling the slow job should end the batch quickly");

    assert!(matches!(results[0].1, Err(DownloadError::Cancelled)));
    let fast_path = results[1].1.as_ref().unwrap();
    assert_eq!(std::fs::read(fast_path).unwrap(), b"fast");
    assert!(!dir.path().join("slow.jar").exists());
    assert!(manager.get_active_downloads().await.is_empty());

    // unknown ids are ignored
    manager.cancel_download("nope").await;
}

#[cfg(unix)]
mod delegation {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Writes an executable `aria2c` stand-in into `dir`.
    fn fake_aria2c(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("aria2c");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const COMPLETING_SCRIPT: &str = r#"
here=$(dirname "$0")
echo "$@" > "$here/args"
for a in "$@"; do
  case "$a" in
    --input-file=*) manifest="${a#--input-file=}" ;;
  esac
done
cp "$manifest" "$here/manifest.copy"
echo "$manifest" > "$here/manifest.path"
dir=$(sed -n 's/^  dir=//p' "$manifest")
out=$(sed -n 's/^  out=//p' "$manifest")
printf 'delegated' > "$dir/$out"
"#;

    fn delegating_downloader(script: &str, mode: DelegationMode) -> (TempDir, PathBuf, Downloader) {
        let tools = TempDir::new().unwrap();
        let program = fake_aria2c(tools.path(), script);
        let settings = DownloadSettings::default()
            .with_delegation(true)
            .with_mode(mode)
            .with_program(program.to_string_lossy());
        let downloader = Downloader::new(settings).unwrap();
        (tools, program, downloader)
    }

    #[tokio::test]
    async fn test_disabled_delegation_never_runs_tool() {
        let server = serve(
            "/core.jar",
            ResponseTemplate::new(200).set_body_bytes(b"builtin".to_vec()),
            1,
        )
        .await;
        let tools = TempDir::new().unwrap();
        let program = fake_aria2c(tools.path(), COMPLETING_SCRIPT);
        let dest = TempDir::new().unwrap();

        let settings = DownloadSettings::default().with_program(program.to_string_lossy());
        let downloader = Downloader::new(settings).unwrap();
        let job = DownloadJob::new(&format!("{}/core.jar", server.uri()), dest.path()).unwrap();
        let path = downloader.download(&job).await.unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"builtin");
        assert!(!tools.path().join("args").exists());
    }

    #[tokio::test]
    async fn test_manifest_delegation_succeeds_and_cleans_up() {
        let server = serve(
            "/download/Paper/1.21/latest",
            ResponseTemplate::new(200)
                .insert_header("Content-Disposition", r#"attachment; filename="paper-1.21.jar""#)
                .set_body_bytes(b"unused".to_vec()),
            1,
        )
        .await;
        let (tools, program, downloader) =
            delegating_downloader(COMPLETING_SCRIPT, DelegationMode::Manifest);
        assert_eq!(downloader.strategy(), Strategy::Delegated { program });

        let dest = TempDir::new().unwrap();
        let url = format!("{}/download/Paper/1.21/latest", server.uri());
        let job = DownloadJob::new(&url, dest.path()).unwrap();
        let path = downloader.download(&job).await.unwrap();

        assert_eq!(path, dest.path().join("paper-1.21.jar"));
        assert_eq!(std::fs::read(&path).unwrap(), b"delegated");

        let manifest = std::fs::read_to_string(tools.path().join("manifest.copy")).unwrap();
        assert_eq!(
            manifest,
            format!(
                "{url}\n  referer=*\n  dir={}\n  out=paper-1.21.jar\n",
                dest.path().display()
            )
        );
        let manifest_path = std::fs::read_to_string(tools.path().join("manifest.path")).unwrap();
        assert!(!Path::new(manifest_path.trim()).exists());

        let args = std::fs::read_to_string(tools.path().join("args")).unwrap();
        assert!(args.contains(&format!("--stop-with-process={}", std::process::id())));
        assert!(args.contains("--auto-file-renaming=false"));
        assert!(args.contains("--continue=true"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failure() {
        let server = serve(
            "/core.jar",
            ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()),
            1,
        )
        .await;
        let (_tools, _program, downloader) =
            delegating_downloader("exit 7", DelegationMode::Manifest);
        let dest = TempDir::new().unwrap();

        let job = DownloadJob::new(&format!("{}/core.jar", server.uri()), dest.path()).unwrap();
        let err = downloader.download(&job).await.unwrap_err();
        assert!(matches!(err, DownloadError::ExternalToolFailed { exit_code: Some(7) }));
    }

    /// Starts a delegated job whose tool never finishes, cancels it once the tool
    /// has written its pid, and checks that the process is gone afterwards.
    async fn cancel_and_check_reaped(mode: DelegationMode) {
        let server = serve(
            "/core.jar",
            ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()),
            1,
        )
        .await;
        let script = r#"echo $$ > "$(dirname "$0")/pid"
exec sleep 30"#;
        let (tools, _program, downloader) = delegating_downloader(script, mode);
        let dest = TempDir::new().unwrap();
        let job = DownloadJob::new(&format!("{}/core.jar", server.uri()), dest.path()).unwrap();

        let cancel = CancellationToken::new();
        let pid_file = tools.path().join("pid");
        let watcher = {
            let cancel = cancel.clone();
            async move {
                let mut pid = None;
                for _ in 0..250 {
                    if let Some(p) = std::fs::read_to_string(&pid_file)
                        .ok()
                        .and_then(|s| s.trim().parse::<i32>().ok())
                    {
                        pid = Some(p);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                cancel.cancel();
                pid
            }
        };

        let (result, pid) = tokio::join!(
            downloader.download_with_progress(&job, None, &cancel),
            watcher
        );

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        let pid = pid.expect("fake aria2c never started");
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "aria2c stand-in {pid} outlived the job");
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_child_process() {
        cancel_and_check_reaped(DelegationMode::Manifest).await;
    }

    #[tokio::test]
    async fn test_rpc_cancellation_leaves_no_child_process() {
        cancel_and_check_reaped(DelegationMode::Rpc).await;
    }

    async fn rpc_job_with_script(script: &str) -> DownloadError {
        let server = serve(
            "/core.jar",
            ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()),
            1,
        )
        .await;
        let (tools, _program, downloader) = delegating_downloader(script, DelegationMode::Rpc);
        let dest = TempDir::new().unwrap();
        let job = DownloadJob::new(&format!("{}/core.jar", server.uri()), dest.path()).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(10), downloader.download(&job))
            .await
            .expect("an exited aria2c should fail the job promptly")
            .unwrap_err();

        let args = std::fs::read_to_string(tools.path().join("args")).unwrap();
        assert!(args.contains("--enable-rpc=true"));
        assert!(args.contains("--rpc-listen-all=false"));
        assert!(args.contains("--rpc-listen-port="));
        assert!(args.contains("--rpc-secret="));
        assert!(!args.contains("--input-file="));
        err
    }

    #[tokio::test]
    async fn test_rpc_tool_exit_code_is_tool_failure() {
        let err = rpc_job_with_script(r#"echo "$@" > "$(dirname "$0")/args"
exit 3"#)
        .await;
        assert!(matches!(err, DownloadError::ExternalToolFailed { exit_code: Some(3) }));
    }

    #[tokio::test]
    async fn test_rpc_tool_exiting_cleanly_is_delegation_lost() {
        let err = rpc_job_with_script(r#"echo "$@" > "$(dirname "$0")/args"
exit 0"#)
        .await;
        assert!(matches!(err, DownloadError::DelegationLost { .. }));
    }
}
