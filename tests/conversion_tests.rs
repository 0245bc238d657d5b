//! Integration tests for the conversion scheduler, using small shell
//! scripts in place of real converter binaries.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use poddl::conversion::{ConversionManager, ConverterInfo, ConverterRegistry, LibraryIngest};
use poddl::EngineConfig;

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
}

const FAKE_PROBE: &str = r#"#!/bin/sh
echo "Input #0, avi, from '$2':" 1>&2
echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 128 kb/s" 1>&2
echo "    Stream #0.0: Video: mpeg4, yuv420p, 640x480, 25 fps" 1>&2
exit 1
"#;

/// Copies the input to the output and prints ffmpeg-shaped progress.
const FAKE_CONV: &str = r#"#!/bin/sh
in="$2"
out="$3"
echo "  Duration: 00:00:10.00, start: 0.0, bitrate: 100 kb/s"
echo "frame= 10 time=00:00:05.00 bitrate= 100kbits/s"
cp "$in" "$out"
echo "video:1kB audio:0kB Lsize= 1kB time=00:00:10.00"
"#;

const FAKE_FAIL: &str = r#"#!/bin/sh
echo "Unknown encoder 'libfake'"
exit 1
"#;

const FAKE_SLOW: &str = r#"#!/bin/sh
sleep 0.5
cp "$2" "$3"
"#;

fn converter(identifier: &str, executable: &str) -> ConverterInfo {
    ConverterInfo {
        identifier: identifier.to_string(),
        name: identifier.to_string(),
        executable: executable.to_string(),
        parameters: "-i {input} {output}".to_string(),
        extension: Some("mp4".to_string()),
        screen_size: None,
        bitrate: None,
        media_type: Some("video".to_string()),
        only_on: None,
    }
}

struct Fixture {
    manager: Arc<ConversionManager>,
    config: Arc<EngineConfig>,
    input_dir: PathBuf,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fixture(temp_dir: &TempDir) -> Fixture {
    init_tracing();
    let movies = temp_dir.path().join("movies");
    let bin = temp_dir.path().join("bin");
    let inputs = temp_dir.path().join("inputs");
    std::fs::create_dir_all(&movies).unwrap();
    std::fs::create_dir_all(&bin).unwrap();
    std::fs::create_dir_all(&inputs).unwrap();

    write_script(&bin, "fakeprobe", FAKE_PROBE);
    write_script(&bin, "fakeconv", FAKE_CONV);
    write_script(&bin, "fakefail", FAKE_FAIL);
    write_script(&bin, "fakeslow", FAKE_SLOW);

    let mut config = EngineConfig::new()
        .movies_dir(movies)
        .logs_dir(temp_dir.path().join("logs"));
    config.conversion.executable_dirs = vec![bin];
    config.conversion.probe_executable = "fakeprobe".to_string();
    config.conversion.cycle_ms = 50;
    config.conversion.max_concurrent = 1;
    let config = Arc::new(config);

    let mut registry = ConverterRegistry::new();
    registry.add(converter("ipod", "fakeconv"));
    registry.add(converter("broken", "fakefail"));
    registry.add(converter("slow", "fakeslow"));

    let (events, _) = broadcast::channel(64);
    let manager = ConversionManager::new(Arc::clone(&config), registry, events);
    manager.start_cycle();
    Fixture {
        manager,
        config,
        input_dir: inputs,
    }
}

async fn wait_for_finished(manager: &ConversionManager, count: usize) {
    timeout(Duration::from_secs(10), async {
        loop {
            if manager.finished_tasks().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("conversions did not finish in time");
}

#[tokio::test]
async fn conversion_stages_output_and_drops_the_log() {
    let temp_dir = TempDir::new().unwrap();
    let fx = fixture(&temp_dir);

    let input = fx.input_dir.join("show.avi");
    tokio::fs::write(&input, b"source bytes").await.unwrap();
    fx.manager
        .convert("item-1", input, "ipod", None)
        .unwrap();

    wait_for_finished(&fx.manager, 1).await;
    let finished = fx.manager.finished_tasks();
    let staged = finished[0].result.as_ref().expect("conversion failed");
    assert_eq!(staged, &fx.config.converted_dir().join("show.ipod.mp4"));
    assert_eq!(
        tokio::fs::read(staged).await.unwrap(),
        b"source bytes".to_vec()
    );

    let log = fx
        .config
        .logs_dir
        .join("conversion-item-1-to-ipod.log");
    assert!(!log.exists(), "log should only survive failures");
    fx.manager.shutdown();
}

#[tokio::test]
async fn failed_conversion_keeps_its_log() {
    let temp_dir = TempDir::new().unwrap();
    let fx = fixture(&temp_dir);

    let input = fx.input_dir.join("show.avi");
    tokio::fs::write(&input, b"source").await.unwrap();
    fx.manager
        .convert("item-2", input, "broken", None)
        .unwrap();

    wait_for_finished(&fx.manager, 1).await;
    let finished = fx.manager.finished_tasks();
    assert!(finished[0].result.is_err());

    let log = fx
        .config
        .logs_dir
        .join("conversion-item-2-to-broken.log");
    let text = tokio::fs::read_to_string(&log).await.expect("log kept");
    assert!(text.contains("Unknown encoder"));
    fx.manager.shutdown();
}

#[tokio::test]
async fn concurrency_cap_holds_one_task_pending() {
    let temp_dir = TempDir::new().unwrap();
    let fx = fixture(&temp_dir);

    for n in 1..=2 {
        let input = fx.input_dir.join(format!("clip{n}.avi"));
        tokio::fs::write(&input, b"x").await.unwrap();
        fx.manager
            .convert(format!("item-{n}"), input, "slow", None)
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fx.manager.running_tasks().len(), 1);
    assert_eq!(fx.manager.pending_tasks().len(), 1);

    wait_for_finished(&fx.manager, 2).await;
    for task in fx.manager.finished_tasks() {
        assert!(task.result.is_ok(), "task failed: {:?}", task.result);
    }
    fx.manager.shutdown();
}

#[tokio::test]
async fn name_collisions_get_numbered_suffixes() {
    let temp_dir = TempDir::new().unwrap();
    let fx = fixture(&temp_dir);

    let converted = fx.config.converted_dir();
    tokio::fs::create_dir_all(&converted).await.unwrap();
    tokio::fs::write(converted.join("show.ipod.mp4"), b"old")
        .await
        .unwrap();

    let input = fx.input_dir.join("show.avi");
    tokio::fs::write(&input, b"new bytes").await.unwrap();
    fx.manager
        .convert("item-3", input, "ipod", None)
        .unwrap();

    wait_for_finished(&fx.manager, 1).await;
    let finished = fx.manager.finished_tasks();
    let staged = finished[0].result.as_ref().expect("conversion failed");
    assert_eq!(staged, &converted.join("show.ipod.1.mp4"));
    assert_eq!(
        tokio::fs::read(converted.join("show.ipod.mp4"))
            .await
            .unwrap(),
        b"old".to_vec()
    );
    fx.manager.shutdown();
}

#[derive(Default)]
struct RecordingIngest {
    calls: std::sync::Mutex<Vec<(String, PathBuf, String)>>,
}

impl LibraryIngest for RecordingIngest {
    fn ingest(&self, item_id: &str, path: &Path, display_name: &str) {
        self.calls.lock().unwrap().push((
            item_id.to_string(),
            path.to_path_buf(),
            display_name.to_string(),
        ));
    }
}

#[tokio::test]
async fn staged_files_are_handed_to_the_library_hook() {
    let temp_dir = TempDir::new().unwrap();
    let fx = fixture(&temp_dir);
    let ingest = Arc::new(RecordingIngest::default());
    fx.manager.set_ingest(Arc::clone(&ingest) as Arc<dyn LibraryIngest>);

    let input = fx.input_dir.join("show.avi");
    tokio::fs::write(&input, b"source bytes").await.unwrap();
    fx.manager.convert("item-5", input, "ipod", None).unwrap();
    wait_for_finished(&fx.manager, 1).await;

    let calls = ingest.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (item, path, name) = &calls[0];
    assert_eq!(item, "item-5");
    assert_eq!(path, &fx.config.converted_dir().join("show.ipod.mp4"));
    assert_eq!(name, "show.ipod");
    fx.manager.shutdown();
}

#[tokio::test]
async fn failed_conversions_skip_the_library_hook() {
    let temp_dir = TempDir::new().unwrap();
    let fx = fixture(&temp_dir);
    let ingest = Arc::new(RecordingIngest::default());
    fx.manager.set_ingest(Arc::clone(&ingest) as Arc<dyn LibraryIngest>);

    let input = fx.input_dir.join("show.avi");
    tokio::fs::write(&input, b"source").await.unwrap();
    fx.manager.convert("item-6", input, "broken", None).unwrap();
    wait_for_finished(&fx.manager, 1).await;

    assert!(ingest.calls.lock().unwrap().is_empty());
    fx.manager.shutdown();
}

#[tokio::test]
async fn clear_finished_empties_the_list() {
    let temp_dir = TempDir::new().unwrap();
    let fx = fixture(&temp_dir);

    let input = fx.input_dir.join("a.avi");
    tokio::fs::write(&input, b"x").await.unwrap();
    fx.manager.convert("item-4", input, "ipod", None).unwrap();
    wait_for_finished(&fx.manager, 1).await;

    fx.manager.clear_finished();
    assert!(fx.manager.finished_tasks().is_empty());
    fx.manager.shutdown();
}
