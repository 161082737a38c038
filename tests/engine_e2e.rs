//! End-to-end scenarios against a local origin server.

mod common;

use common::{Origin, OriginConfig, make_payload, sha256_hex, wait_for_event};
use http_dl::{AddOptions, Config, Event, HttpDownloader, Status};
use std::time::Duration;

const MIB: usize = 1024 * 1024;

fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("state.db");
    config.download.download_dir = dir.join("downloads");
    config
}

/// S1: fresh download from a range-supporting server completes, renames the
/// working file into place, and splits the transfer across range requests.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_download_completes_and_renames() {
    let payload = make_payload(10 * MIB);
    let origin = Origin::spawn(payload.clone(), OriginConfig::default()).await;

    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(test_config(dir.path())).await.unwrap();
    let mut events = downloader.subscribe();

    let id = downloader
        .add(
            &origin.url("foo.bin"),
            AddOptions {
                filename: Some("foo.bin".to_string()),
                ..AddOptions::default()
            },
        )
        .await
        .unwrap();

    wait_for_event(&mut events, Duration::from_secs(30), |e| {
        matches!(e, Event::Complete { id: done, .. } if *done == id)
    })
    .await;

    let dest = dir.path().join("downloads").join("foo.bin");
    let written = std::fs::read(&dest).unwrap();
    assert_eq!(written.len(), payload.len());
    assert_eq!(
        sha256_hex(&written),
        sha256_hex(&payload),
        "downloaded bytes must match the origin"
    );
    assert!(
        !dest.with_extension("bin.partial").exists(),
        "the working file must be renamed away"
    );
    assert!(
        origin.range_requests() >= 3,
        "a 10 MiB file is expected to split across at least 3 range requests, saw {}",
        origin.range_requests()
    );

    let info = downloader.get_status(id).await.unwrap();
    assert_eq!(info.status, Status::Complete);
    assert_eq!(info.downloaded, payload.len() as u64);
}

/// S2: pause mid-transfer persists `downloaded + remaining == total`; after
/// resume the final bytes match the origin exactly.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_persists_remaining_work_and_resume_finishes() {
    let payload = make_payload(20 * MIB);
    let origin = Origin::spawn(
        payload.clone(),
        OriginConfig {
            throttle: Some(Duration::from_millis(30)),
            ..OriginConfig::default()
        },
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(test_config(dir.path())).await.unwrap();
    let mut events = downloader.subscribe();

    let url = origin.url("big.bin");
    let id = downloader
        .add(
            &url,
            AddOptions {
                filename: Some("big.bin".to_string()),
                ..AddOptions::default()
            },
        )
        .await
        .unwrap();

    wait_for_event(&mut events, Duration::from_secs(10), |e| {
        matches!(e, Event::Started { id: started, .. } if *started == id)
    })
    .await;

    // Let some bytes land, then pause mid-flight
    tokio::time::sleep(Duration::from_millis(500)).await;
    downloader.pause(id).await.unwrap();

    wait_for_event(&mut events, Duration::from_secs(15), |e| {
        matches!(e, Event::Paused { id: paused, .. } if *paused == id)
    })
    .await;

    let info = downloader.get_status(id).await.unwrap();
    assert_eq!(info.status, Status::Paused);

    let state = downloader
        .db
        .load_state(&url, &info.dest_path)
        .await
        .unwrap()
        .expect("a paused download must leave a resume record");
    assert!(
        !state.tasks.is_empty(),
        "pausing mid-transfer must leave remaining tasks"
    );
    assert_eq!(
        state.downloaded + state.remaining_bytes(),
        payload.len() as u64,
        "resume fidelity: downloaded + remaining must equal the total"
    );
    assert!(state.downloaded > 0, "pause happened mid-flight");
    assert!(!state.chunk_bitmap.is_empty(), "the bitmap snapshot persists");
    assert!(state.chunk_size > 0);

    downloader.resume(id).await.unwrap();
    wait_for_event(&mut events, Duration::from_secs(60), |e| {
        matches!(e, Event::Complete { id: done, .. } if *done == id)
    })
    .await;

    let written = std::fs::read(&info.dest_path).unwrap();
    assert_eq!(
        sha256_hex(&written),
        sha256_hex(&payload),
        "bytes 0..{} must match the origin after resume",
        payload.len()
    );
}

/// S3: a server that ignores ranges gets the single-connection fallback and
/// still produces a byte-identical file.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_without_ranges_falls_back_to_single_connection() {
    let payload = make_payload(3 * MIB);
    let origin = Origin::spawn(
        payload.clone(),
        OriginConfig {
            ignore_ranges: true,
            ..OriginConfig::default()
        },
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(test_config(dir.path())).await.unwrap();
    let mut events = downloader.subscribe();

    let id = downloader
        .add(
            &origin.url("plain.bin"),
            AddOptions {
                filename: Some("plain.bin".to_string()),
                ..AddOptions::default()
            },
        )
        .await
        .unwrap();

    wait_for_event(&mut events, Duration::from_secs(30), |e| {
        matches!(e, Event::Complete { id: done, .. } if *done == id)
    })
    .await;

    assert_eq!(
        origin.range_requests(),
        0,
        "no partial-content replies exist on this origin"
    );
    let written = std::fs::read(dir.path().join("downloads").join("plain.bin")).unwrap();
    assert_eq!(sha256_hex(&written), sha256_hex(&payload));
}

/// S4: a mirror that fails probing is kept visible as `error = true` while
/// the surviving sources carry the download.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_mirror_is_flagged_and_unused() {
    let payload = make_payload(4 * MIB);
    let primary = Origin::spawn(
        payload.clone(),
        OriginConfig {
            throttle: Some(Duration::from_millis(30)),
            ..OriginConfig::default()
        },
    )
    .await;
    let good_mirror = Origin::spawn(
        payload.clone(),
        OriginConfig {
            throttle: Some(Duration::from_millis(30)),
            ..OriginConfig::default()
        },
    )
    .await;
    let bad_mirror = Origin::spawn(
        Vec::new(),
        OriginConfig {
            fail_status: Some(404),
            ..OriginConfig::default()
        },
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(test_config(dir.path())).await.unwrap();
    let mut events = downloader.subscribe();

    let bad_url = bad_mirror.url("file.bin");
    let id = downloader
        .add(
            &primary.url("file.bin"),
            AddOptions {
                filename: Some("file.bin".to_string()),
                mirrors: vec![good_mirror.url("file.bin"), bad_url.clone()],
                ..AddOptions::default()
            },
        )
        .await
        .unwrap();

    // The failed probe must be observable on the live status mid-download
    let mut saw_flagged_mirror = false;
    for _ in 0..100 {
        let info = downloader.get_status(id).await.unwrap();
        if let Some(status) = info.mirrors.iter().find(|m| m.url == bad_url) {
            if status.error && !status.active {
                saw_flagged_mirror = true;
                break;
            }
        }
        if info.status == Status::Complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(
        saw_flagged_mirror,
        "the failing mirror must be kept with active=false, error=true"
    );

    wait_for_event(&mut events, Duration::from_secs(30), |e| {
        matches!(e, Event::Complete { id: done, .. } if *done == id)
    })
    .await;

    assert_eq!(
        bad_mirror.range_requests(),
        0,
        "workers must never fetch ranges from the failed mirror"
    );
    let written = std::fs::read(dir.path().join("downloads").join("file.bin")).unwrap();
    assert_eq!(sha256_hex(&written), sha256_hex(&payload));
}

/// S5: a stalled connection is detected, its range re-enqueued, and the
/// download still completes correctly.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_worker_is_cancelled_and_download_completes() {
    let payload = make_payload(6 * MIB);
    let origin = Origin::spawn(
        payload.clone(),
        OriginConfig {
            stall_first_range: true,
            ..OriginConfig::default()
        },
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // Tight timings so the stall is detected quickly in tests
    config.runtime.stall_timeout = Duration::from_secs(2);
    config.runtime.health_check_interval = Duration::from_millis(200);
    let downloader = HttpDownloader::new(config).await.unwrap();
    let mut events = downloader.subscribe();

    let id = downloader
        .add(
            &origin.url("stalling.bin"),
            AddOptions {
                filename: Some("stalling.bin".to_string()),
                ..AddOptions::default()
            },
        )
        .await
        .unwrap();

    wait_for_event(&mut events, Duration::from_secs(30), |e| {
        matches!(e, Event::Complete { id: done, .. } if *done == id)
    })
    .await;

    let written = std::fs::read(dir.path().join("downloads").join("stalling.bin")).unwrap();
    assert_eq!(
        sha256_hex(&written),
        sha256_hex(&payload),
        "the re-enqueued range must land correctly"
    );
    assert!(
        origin.range_requests() >= 3,
        "the stalled range must have been re-requested, saw {} range requests",
        origin.range_requests()
    );
}

/// S6: adding the same url + destination while a download is active is
/// rejected with a conflict.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_add_while_active_conflicts() {
    let payload = make_payload(8 * MIB);
    let origin = Origin::spawn(
        payload.clone(),
        OriginConfig {
            throttle: Some(Duration::from_millis(30)),
            ..OriginConfig::default()
        },
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(test_config(dir.path())).await.unwrap();
    let mut events = downloader.subscribe();

    let url = origin.url("dup.bin");
    let id = downloader
        .add(
            &url,
            AddOptions {
                filename: Some("dup.bin".to_string()),
                ..AddOptions::default()
            },
        )
        .await
        .unwrap();

    wait_for_event(&mut events, Duration::from_secs(10), |e| {
        matches!(e, Event::Started { id: started, .. } if *started == id)
    })
    .await;

    let err = downloader
        .add(
            &url,
            AddOptions {
                filename: Some("dup.bin".to_string()),
                ..AddOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, http_dl::Error::Conflict(_)),
        "the engine must never start two downloads against the same working file, got {err:?}"
    );

    wait_for_event(&mut events, Duration::from_secs(60), |e| {
        matches!(e, Event::Complete { id: done, .. } if *done == id)
    })
    .await;
}

/// Colliding destination names resolve to `name(N).ext` without touching the
/// existing complete file.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn name_collision_appends_a_counter() {
    let payload = make_payload(MIB);
    let origin = Origin::spawn(payload.clone(), OriginConfig::default()).await;

    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(test_config(dir.path())).await.unwrap();
    let mut events = downloader.subscribe();

    // Pre-existing complete file occupies the natural name
    let downloads = dir.path().join("downloads");
    std::fs::create_dir_all(&downloads).unwrap();
    std::fs::write(downloads.join("file.bin"), b"occupied").unwrap();

    let id = downloader
        .add(
            &origin.url("file.bin"),
            AddOptions {
                filename: Some("file.bin".to_string()),
                ..AddOptions::default()
            },
        )
        .await
        .unwrap();

    wait_for_event(&mut events, Duration::from_secs(30), |e| {
        matches!(e, Event::Complete { id: done, .. } if *done == id)
    })
    .await;

    assert_eq!(
        std::fs::read(downloads.join("file.bin")).unwrap(),
        b"occupied",
        "the pre-existing file must be untouched"
    );
    let written = std::fs::read(downloads.join("file(1).bin")).unwrap();
    assert_eq!(sha256_hex(&written), sha256_hex(&payload));
}
