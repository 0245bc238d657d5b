//! Integration tests for the HTTP download path.
//!
//! These use wiremock to play the remote server: plain downloads,
//! resume with a Range request, servers that ignore Range, auth
//! challenges, and the transient/fatal failure split.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use poddl::{
    Daemon, DownloadEvent, DownloadKind, DownloadState, DownloaderId, EngineConfig,
    TransferStatus,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(temp_dir: &TempDir) -> EngineConfig {
    init_tracing();
    let movies = temp_dir.path().join("movies");
    std::fs::create_dir_all(&movies).unwrap();
    EngineConfig::new()
        .movies_dir(movies)
        .logs_dir(temp_dir.path().join("logs"))
        .preserve_disk_space(false)
}

fn test_daemon(temp_dir: &TempDir) -> Arc<Daemon> {
    Daemon::new(test_config(temp_dir)).expect("daemon")
}

async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<DownloadEvent>,
    predicate: F,
    timeout_duration: Duration,
) -> Option<DownloadEvent>
where
    F: Fn(&DownloadEvent) -> bool,
{
    timeout(timeout_duration, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

#[tokio::test]
async fn download_completes_and_moves_into_place() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = b"episode audio bytes".to_vec();

    Mock::given(method("GET"))
        .and(path("/feed/episode.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let daemon = test_daemon(&temp_dir);
    let mut events = daemon.subscribe();
    let id = DownloaderId::from_string("dltest01");
    daemon
        .start_new_download(
            format!("{}/feed/episode.mp3", server.uri()),
            id.clone(),
            None,
            None,
        )
        .await
        .unwrap();

    let finished = wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Finished { id: fid } if *fid == id),
        Duration::from_secs(10),
    )
    .await;
    assert!(finished.is_some(), "download did not finish");

    let status = daemon.status(&id).unwrap();
    assert_eq!(status.state, DownloadState::Finished);
    assert_eq!(status.total_size, body.len() as i64);
    assert_eq!(status.current_size, body.len() as u64);
    assert_eq!(status.retry_count, -1);

    let final_path = status.filename.expect("finished download has a path");
    assert_eq!(final_path.file_name().unwrap(), "episode.mp3");
    assert_eq!(tokio::fs::read(&final_path).await.unwrap(), body);
}

#[tokio::test]
async fn finished_file_lands_in_channel_folder() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ep.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
        .mount(&server)
        .await;

    let daemon = test_daemon(&temp_dir);
    let mut events = daemon.subscribe();
    let id = DownloaderId::from_string("dltest02");
    daemon
        .start_new_download(
            format!("{}/ep.mp3", server.uri()),
            id.clone(),
            None,
            Some("My Channel".to_string()),
        )
        .await
        .unwrap();

    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Finished { id: fid } if *fid == id),
        Duration::from_secs(10),
    )
    .await
    .expect("download did not finish");

    let status = daemon.status(&id).unwrap();
    let final_path = status.filename.unwrap();
    assert_eq!(
        final_path.parent().unwrap().file_name().unwrap(),
        "My Channel"
    );
}

#[tokio::test]
async fn resume_sends_range_and_appends_to_partial_file() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let full = b"0123456789abcdef".to_vec();
    let offset = 5usize;

    // Only a correct Range request gets an answer.
    Mock::given(method("GET"))
        .and(path("/ep.mp3"))
        .and(header("range", "bytes=5-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(full[offset..].to_vec()))
        .mount(&server)
        .await;

    let daemon = test_daemon(&temp_dir);
    let mut events = daemon.subscribe();

    let incomplete = daemon.config().incomplete_dir();
    tokio::fs::create_dir_all(&incomplete).await.unwrap();
    let part_path = incomplete.join("ep.mp3.part");
    tokio::fs::write(&part_path, &full[..offset]).await.unwrap();

    let id = DownloaderId::from_string("dltest03");
    let mut status = TransferStatus::new(
        id.clone(),
        &format!("{}/ep.mp3", server.uri()),
        DownloadKind::Http,
    );
    status.state = DownloadState::Downloading;
    status.short_filename = "ep.mp3".to_string();
    status.filename = Some(part_path);
    status.current_size = offset as u64;
    daemon.restore_downloader(status).await.unwrap();

    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Finished { id: fid } if *fid == id),
        Duration::from_secs(10),
    )
    .await
    .expect("resume did not finish");

    let status = daemon.status(&id).unwrap();
    assert_eq!(status.total_size, full.len() as i64);
    let final_path = status.filename.unwrap();
    assert_eq!(tokio::fs::read(&final_path).await.unwrap(), full);
}

#[tokio::test]
async fn ignored_range_restarts_from_zero() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let full = b"fresh full body".to_vec();

    // Server answers 200 with the whole file no matter what.
    Mock::given(method("GET"))
        .and(path("/ep.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(full.clone()))
        .mount(&server)
        .await;

    let daemon = test_daemon(&temp_dir);
    let mut events = daemon.subscribe();

    let incomplete = daemon.config().incomplete_dir();
    tokio::fs::create_dir_all(&incomplete).await.unwrap();
    let part_path = incomplete.join("ep.mp3.part");
    tokio::fs::write(&part_path, b"stale").await.unwrap();

    let id = DownloaderId::from_string("dltest04");
    let mut status = TransferStatus::new(
        id.clone(),
        &format!("{}/ep.mp3", server.uri()),
        DownloadKind::Http,
    );
    status.state = DownloadState::Downloading;
    status.short_filename = "ep.mp3".to_string();
    status.filename = Some(part_path);
    status.current_size = 5;
    daemon.restore_downloader(status).await.unwrap();

    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Finished { id: fid } if *fid == id),
        Duration::from_secs(10),
    )
    .await
    .expect("restart did not finish");

    // The stale prefix must not survive in the final file.
    let status = daemon.status(&id).unwrap();
    let final_path = status.filename.unwrap();
    assert_eq!(tokio::fs::read(&final_path).await.unwrap(), full);
}

struct FixedCredentials;

#[async_trait]
impl poddl::CredentialStore for FixedCredentials {
    async fn find_http_auth(
        &self,
        _url: &str,
        scheme: &str,
        realm: &str,
    ) -> Option<String> {
        assert_eq!(scheme, "Basic");
        assert_eq!(realm, "podcasts");
        Some("Basic dXNlcjpwYXNz".to_string())
    }
}

#[tokio::test]
async fn auth_challenge_is_answered_from_the_store() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = b"members only".to_vec();

    Mock::given(method("GET"))
        .and(path("/ep.mp3"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ep.mp3"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("www-authenticate", "Basic realm=\"podcasts\""),
        )
        .mount(&server)
        .await;

    let daemon =
        Daemon::with_credentials(test_config(&temp_dir), Arc::new(FixedCredentials)).unwrap();
    let mut events = daemon.subscribe();
    let id = DownloaderId::from_string("dltest05");
    daemon
        .start_new_download(format!("{}/ep.mp3", server.uri()), id.clone(), None, None)
        .await
        .unwrap();

    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Finished { id: fid } if *fid == id),
        Duration::from_secs(10),
    )
    .await
    .expect("authorized download did not finish");

    let status = daemon.status(&id).unwrap();
    let final_path = status.filename.unwrap();
    assert_eq!(tokio::fs::read(&final_path).await.unwrap(), body);
}

#[tokio::test]
async fn missing_credentials_fail_the_download() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ep.mp3"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("www-authenticate", "Basic realm=\"podcasts\""),
        )
        .mount(&server)
        .await;

    let daemon = test_daemon(&temp_dir);
    let mut events = daemon.subscribe();
    let id = DownloaderId::from_string("dltest06");
    daemon
        .start_new_download(format!("{}/ep.mp3", server.uri()), id.clone(), None, None)
        .await
        .unwrap();

    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Failed { id: fid, .. } if *fid == id),
        Duration::from_secs(10),
    )
    .await
    .expect("download did not fail");

    let status = daemon.status(&id).unwrap();
    assert_eq!(status.state, DownloadState::Failed);
    assert_eq!(
        status.short_reason_failed.as_deref(),
        Some("Authorization failed")
    );
}

#[tokio::test]
async fn client_error_status_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/gone.mp3"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let daemon = test_daemon(&temp_dir);
    let mut events = daemon.subscribe();
    let id = DownloaderId::from_string("dltest07");
    daemon
        .start_new_download(format!("{}/gone.mp3", server.uri()), id.clone(), None, None)
        .await
        .unwrap();

    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Failed { id: fid, .. } if *fid == id),
        Duration::from_secs(10),
    )
    .await
    .expect("download did not fail");

    let status = daemon.status(&id).unwrap();
    assert_eq!(status.state, DownloadState::Failed);
    assert!(status.retry_time.is_none());
}

#[tokio::test]
async fn zero_length_response_goes_offline_with_a_retry_time() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/empty.mp3"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let daemon = test_daemon(&temp_dir);
    let mut events = daemon.subscribe();
    let id = DownloaderId::from_string("dltest08");
    daemon
        .start_new_download(
            format!("{}/empty.mp3", server.uri()),
            id.clone(),
            None,
            None,
        )
        .await
        .unwrap();

    wait_for_event(
        &mut events,
        |e| {
            matches!(e, DownloadEvent::StateChanged { id: fid, state }
                if *fid == id && *state == DownloadState::Offline)
        },
        Duration::from_secs(10),
    )
    .await
    .expect("download did not go offline");

    let status = daemon.status(&id).unwrap();
    assert_eq!(status.state, DownloadState::Offline);
    assert!(status.retry_time.is_some());
    assert_eq!(status.retry_count, 0, "count moves when the retry fires");
    assert_eq!(
        status.short_reason_failed.as_deref(),
        Some("Temporary server error")
    );
}

#[tokio::test]
async fn transient_failures_walk_the_retry_schedule_and_reset() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = b"after the outage".to_vec();

    // Three outages, then the server recovers.
    Mock::given(method("GET"))
        .and(path("/flaky.mp3"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let config = test_config(&temp_dir).retry_schedule(vec![0]);
    let daemon = Daemon::new(config).unwrap();
    let mut events = daemon.subscribe();
    let id = DownloaderId::from_string("dltest11");
    daemon
        .start_new_download(
            format!("{}/flaky.mp3", server.uri()),
            id.clone(),
            None,
            None,
        )
        .await
        .unwrap();

    let mut offline_seen = 0u32;
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(DownloadEvent::StateChanged { id: eid, state })
                    if eid == id && state == DownloadState::Offline =>
                {
                    offline_seen += 1;
                }
                Ok(DownloadEvent::Finished { id: fid }) if fid == id => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("download never recovered");

    assert_eq!(offline_seen, 3, "one offline transition per outage");
    let status = daemon.status(&id).unwrap();
    assert_eq!(status.state, DownloadState::Finished);
    assert_eq!(status.retry_count, -1, "success clears the retry counter");
    let final_path = status.filename.unwrap();
    assert_eq!(tokio::fs::read(&final_path).await.unwrap(), body);
}

#[tokio::test]
async fn pause_parks_the_transfer_mid_request() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    // Slow body so pause lands mid-transfer.
    Mock::given(method("GET"))
        .and(path("/slow.mp3"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![7u8; 64 * 1024])
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let daemon = test_daemon(&temp_dir);
    let id = DownloaderId::from_string("dltest09");
    daemon
        .start_new_download(format!("{}/slow.mp3", server.uri()), id.clone(), None, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    daemon.pause_download(&id).unwrap();

    let status = daemon.status(&id).unwrap();
    assert_eq!(status.state, DownloadState::Paused);
    assert_eq!(status.rate, 0);
}

#[tokio::test]
async fn stop_with_delete_removes_the_partial_file() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow.mp3"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![7u8; 64 * 1024])
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let daemon = test_daemon(&temp_dir);
    let id = DownloaderId::from_string("dltest10");
    daemon
        .start_new_download(format!("{}/slow.mp3", server.uri()), id.clone(), None, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    daemon.stop_download(&id, true).await.unwrap();

    let status = daemon.status(&id).unwrap();
    assert_eq!(status.state, DownloadState::Stopped);
    assert_eq!(status.current_size, 0);
    assert!(status.filename.is_none());
}
