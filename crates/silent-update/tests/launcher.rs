use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use silent_update::{FileStore, HostSettings, LaunchError, Launched, Launcher, UpdateLeader};
use silent_update_core::{
    KeyValueStore, ReloadError, ReloadStrategy, UpdatePhase, UpdaterConfig, VersionDescriptor,
};
use silent_update_platform::AppPaths;

const DEPLOYED: &str =
    r#"{"version":"2.0.0","buildId":"b2","buildTime":"2026-10-01T12:00:00Z","cacheName":"app-b2"}"#;

/// Serves `body` as JSON to every request until the test process exits.
fn serve_version(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut reader = BufReader::new(stream.try_clone().expect("stream should clone"));
            let mut line = String::new();
            while reader.read_line(&mut line).is_ok_and(|read| read > 0) {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    format!("http://{addr}/version.json")
}

#[derive(Default)]
struct CountingReload {
    calls: AtomicUsize,
}

#[async_trait]
impl ReloadStrategy for CountingReload {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn reload(&self) -> Result<(), ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn settings_for(url: &str) -> HostSettings {
    HostSettings {
        leader_retry_ms: 20,
        updater: UpdaterConfig {
            activity_aware: false,
            immediate_apply_delay_ms: 10,
            poll_interval_secs: 3_600,
            jitter_ms: 0,
            ..UpdaterConfig::for_url(url)
        },
        ..HostSettings::default()
    }
}

#[tokio::test]
async fn launch_without_endpoint_is_rejected() {
    let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
    let launcher = Launcher::new(AppPaths::rooted_at(temp_dir.path()), HostSettings::default());

    assert!(matches!(
        launcher.launch(),
        Err(LaunchError::MissingEndpoint)
    ));
}

#[tokio::test]
async fn second_instance_runs_passive() {
    let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
    let paths = AppPaths::rooted_at(temp_dir.path());
    let _leader = UpdateLeader::acquire(&paths).expect("first claim should succeed");

    let launched = Launcher::new(paths, settings_for("http://127.0.0.1:9/version.json"))
        .launch()
        .expect("launch should succeed");

    let Launched::Passive(standby) = launched else {
        panic!("second instance should stand by");
    };
    standby.cancel();
    assert!(standby.promoted().await.is_none());
}

#[tokio::test]
async fn standby_takes_over_when_previous_leader_exits() {
    let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
    let paths = AppPaths::rooted_at(temp_dir.path());
    let previous = UpdateLeader::acquire(&paths).expect("first claim should succeed");

    let reload = Arc::new(CountingReload::default());
    let launched = Launcher::new(
        paths.clone(),
        settings_for("http://127.0.0.1:9/version.json"),
    )
    .with_reload_strategies(vec![reload.clone() as Arc<dyn ReloadStrategy>])
    .launch()
    .expect("launch should succeed");
    let Launched::Passive(standby) = launched else {
        panic!("relaunched instance should stand by while the lock is held");
    };

    drop(previous);
    let handle = tokio::time::timeout(Duration::from_secs(10), standby.promoted())
        .await
        .expect("standby should be promoted in time")
        .expect("standby should not be cancelled")
        .expect("promoted instance should start the updater");

    assert!(matches!(
        UpdateLeader::acquire(&paths),
        Err(silent_update::LeaderError::AlreadyRunning)
    ));
    handle.shutdown().await;
    assert_eq!(reload.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn leader_applies_deployed_build_end_to_end() {
    let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
    let paths = AppPaths::rooted_at(temp_dir.path());
    paths.ensure_dirs().expect("app directories should be created");

    let storage = FileStore::new(paths.storage_dir());
    let current = VersionDescriptor::new("1.0.0", "b1", "2026-09-01T12:00:00Z", "app-b1");
    let settings = settings_for(&serve_version(DEPLOYED));
    storage
        .set(
            &settings.updater.storage_keys.version,
            &serde_json::to_string(&current).expect("descriptor should serialize"),
        )
        .await
        .expect("seed version should be written");
    std::fs::create_dir_all(paths.cache_dir.join("app-b1/assets"))
        .expect("cache dir should be created");
    std::fs::write(paths.cache_dir.join("index.cache"), "x").expect("loose file should be written");

    let reload = Arc::new(CountingReload::default());
    let launched = Launcher::new(paths.clone(), settings.clone())
        .with_reload_strategies(vec![reload.clone() as Arc<dyn ReloadStrategy>])
        .launch()
        .expect("launch should succeed");
    let Launched::Leader(handle) = launched else {
        panic!("launch should claim leadership");
    };

    let mut state = handle.orchestrator().subscribe();
    tokio::time::timeout(
        Duration::from_secs(20),
        state.wait_for(|state| state.phase == UpdatePhase::Completed),
    )
    .await
    .expect("update should complete in time")
    .expect("state channel should stay open");

    let stored = storage
        .get(&settings.updater.storage_keys.version)
        .await
        .expect("version should be readable")
        .expect("version should be present");
    let stored = VersionDescriptor::parse(&stored).expect("stored version should parse");
    assert_eq!(stored.build_id, "b2");
    assert_eq!(reload.calls.load(Ordering::SeqCst), 1);
    assert!(!paths.cache_dir.join("app-b1").exists());
    assert!(!paths.cache_dir.join("index.cache").exists());

    handle.shutdown().await;
    UpdateLeader::acquire(&paths).expect("lock should be released after shutdown");
}
