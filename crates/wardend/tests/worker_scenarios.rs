//! End-to-end Worker behavior with scripted nodes and a fake Manager.

mod support;

use std::time::Duration;

use serde_json::json;
use warden_core::*;
use wardend::{Delivery, Worker};

use support::*;

#[test]
fn ready_node_is_created_and_silent_node_is_not() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    launcher.script("n2", [Behavior::Never, Behavior::Never]);
    let worker = worker("w", launcher.clone(), fast_config(2), tmp.path());

    assert!(worker.create_node(node("n1")));
    assert!(!worker.create_node(node("n2")));

    let state = worker.state();
    assert!(state.nodes["n1"].ready);
    assert!(!state.nodes["n2"].ready);
    // One launch for n1, both attempts for n2.
    assert_eq!(launcher.launches(), 3);
}

#[test]
fn creation_retries_until_the_node_becomes_ready() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    launcher.script("n1", [Behavior::Never, Behavior::InitOnly, Behavior::Ready]);
    let worker = worker("w", launcher.clone(), fast_config(3), tmp.path());

    assert!(worker.create_node(node("n1")));

    let n1 = worker.state().nodes["n1"].clone();
    assert!(n1.init && n1.ready);
    assert_eq!(n1.incarnation, 3);
    assert_eq!(launcher.launches(), 3);
}

#[test]
fn invalid_spec_is_rejected_without_launching() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    let worker = worker("w", launcher.clone(), fast_config(2), tmp.path());

    assert!(!worker.create_node(node("")));
    assert_eq!(launcher.launches(), 0);
}

#[test]
fn process_node_without_a_command_is_rejected_up_front() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = Worker::builder("w")
        .host("127.0.0.1")
        .config(fast_config(5))
        .temp_root(tmp.path())
        .build()
        .unwrap();

    assert!(!worker.create_node(NodeSpec::new("n1", "n1")));
    assert!(!worker.state().nodes.contains_key("n1"));
}

#[test]
fn gather_returns_the_node_payload() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    let worker = worker("w", launcher, fast_config(2), tmp.path());
    assert!(worker.create_node(node_with_gather("n1", json!({"x": 5}))));

    let result = worker.gather();

    assert_eq!(result.id, worker.id());
    assert_eq!(
        serde_json::to_value(&result.node_data).unwrap(),
        json!({"n1": {"x": 5}})
    );
}

#[test]
fn gather_fills_in_for_silent_nodes() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    launcher.script("n2", [Behavior::ReadySilent]);
    let worker = worker("w", launcher, fast_config(1), tmp.path());
    assert!(worker.create_node(node_with_gather("n1", json!({"x": 5}))));
    assert!(worker.create_node(node("n2")));

    let result = worker.gather();

    assert_eq!(result.node_data.len(), 2);
    assert_eq!(result.node_data["n1"], DataChunk::empty().with("x", json!(5)));
    assert_eq!(result.node_data["n2"], DataChunk::default());
}

#[test]
fn saving_marks_nodes_finished() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    let worker = worker("w", launcher, fast_config(2), tmp.path());
    assert!(worker.create_node(node("n1")));

    assert!(worker.request_saving());
    assert!(worker.state().nodes["n1"].finished);
}

#[test]
fn server_data_reaches_nodes() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    let worker = worker("w", launcher, fast_config(2), tmp.path());
    assert!(worker.create_node(node("n1")));

    let data = worker.state().server_data();
    assert!(data.nodes.contains_key("n1"));
    assert!(worker.distribute_server_data(data));
    assert!(worker.state().nodes["n1"].connected);
}

#[test]
fn unreachable_manager_leaves_worker_disconnected() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = worker("w", ScriptedLauncher::new(Behavior::Ready), fast_config(1), tmp.path());

    assert!(!worker.connect("127.0.0.1", closed_port(), Duration::from_secs(1)));
    assert!(!worker.is_connected());
}

#[test]
fn connect_applies_overrides_and_forwards_status() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = FakeManager::start(json!({
        "worker.allowed-failures": 4,
        "worker.timeout.node-shutdown": "250ms",
    }));
    let worker = worker("w", ScriptedLauncher::new(Behavior::Ready), fast_config(1), tmp.path());

    assert!(worker.connect("127.0.0.1", manager.port(), Duration::from_secs(2)));
    assert!(worker.is_connected());
    assert_eq!(worker.config().worker.allowed_failures, 4);
    assert_eq!(
        worker.config().worker.timeout.node_shutdown,
        Duration::from_millis(250)
    );
    assert_eq!(manager.log.lock().unwrap().registered[0].id, worker.id());

    assert!(worker.create_node(node("n1")));
    let forwarded = eventually(Duration::from_secs(3), || {
        manager
            .log
            .lock()
            .unwrap()
            .statuses
            .iter()
            .any(|s| s.worker_id == worker.id() && s.node.id == "n1" && s.node.ready)
    });
    assert!(forwarded);
}

#[test]
fn huge_timeout_overrides_leave_blocking_calls_working() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = FakeManager::start(json!({
        "worker.timeout.node-creation": 5e18,
        "worker.timeout.info-request": 5e18,
        "worker.timeout.node-shutdown": 5e18,
    }));
    let worker = worker("w", ScriptedLauncher::new(Behavior::Ready), fast_config(3), tmp.path());
    assert!(worker.connect("127.0.0.1", manager.port(), Duration::from_secs(2)));
    assert!(worker.config().worker.timeout.node_creation > Duration::from_secs(1 << 60));

    assert!(worker.create_node(node_with_gather("n1", json!({"x": 1}))));
    assert_eq!(worker.gather().node_data["n1"], DataChunk::empty().with("x", json!(1)));
    assert!(worker.request_saving());

    worker.shutdown();
    assert!(worker.has_shutdown());
}

#[test]
fn shutdown_kills_a_node_that_will_not_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    launcher.script("n2", [Behavior::Stubborn]);
    let worker = worker("w", launcher.clone(), fast_config(1), tmp.path());
    assert!(worker.create_node(node("n1")));
    assert!(worker.create_node(node("n2")));
    let temp_dir = worker.temp_dir().to_path_buf();

    worker.shutdown();

    assert!(worker.has_shutdown());
    assert_eq!(launcher.terminations(), 1);
    assert!(!temp_dir.exists());
}

#[test]
fn shutdown_twice_matches_shutdown_once() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = FakeManager::start(json!({}));
    let worker = worker("w", ScriptedLauncher::new(Behavior::Ready), fast_config(1), tmp.path());
    assert!(worker.connect("127.0.0.1", manager.port(), Duration::from_secs(2)));
    assert!(worker.create_node(node("n1")));
    let temp_dir = worker.temp_dir().to_path_buf();
    assert!(temp_dir.exists());

    worker.shutdown();
    worker.shutdown();

    assert!(worker.has_shutdown());
    assert!(!worker.is_connected());
    assert!(!temp_dir.exists());
    assert_eq!(manager.log.lock().unwrap().deregistered.len(), 1);
}

#[test]
fn keep_temp_survives_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = fast_config(1);
    config.delete_temp_on_shutdown = false;
    let worker = worker("w", ScriptedLauncher::new(Behavior::Ready), config, tmp.path());
    let temp_dir = worker.temp_dir().to_path_buf();

    worker.shutdown();
    assert!(temp_dir.exists());
}

#[test]
fn local_collect_merges_into_an_existing_folder() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = worker("w", ScriptedLauncher::new(Behavior::Ready), fast_config(1), tmp.path());
    std::fs::write(worker.data_dir().join("result.csv"), b"1,2,3").unwrap();

    let dest = tmp.path().join("collected");
    let target = dest.join(format!("w-{}", worker.id()));
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("earlier.csv"), b"0").unwrap();

    assert!(worker.collect(&dest).unwrap());
    assert!(target.join("result.csv").exists());
    assert!(target.join("earlier.csv").exists());

    // Nothing left to move; the earlier result stands.
    assert!(worker.collect(&dest).unwrap());
}

#[test]
fn co_located_manager_gets_a_local_move() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = FakeManager::start(json!({}));
    let worker = worker("w", ScriptedLauncher::new(Behavior::Ready), fast_config(1), tmp.path());
    assert!(worker.connect("127.0.0.1", manager.port(), Duration::from_secs(2)));
    std::fs::write(worker.data_dir().join("result.csv"), b"1").unwrap();

    let dest = tmp.path().join("collected");
    assert!(worker.collect(&dest).unwrap());

    let target = dest.join(format!("w-{}", worker.id()));
    assert!(target.join("result.csv").exists());
    assert!(manager.log.lock().unwrap().archive_paths.is_empty());
}

#[test]
fn remote_manager_receives_an_upload() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = FakeManager::start(json!({}));
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    let worker = worker_with_delivery("w", launcher, fast_config(1), tmp.path(), Delivery::Upload);
    assert!(worker.connect("127.0.0.1", manager.port(), Duration::from_secs(2)));
    std::fs::create_dir_all(worker.data_dir().join("n1")).unwrap();
    std::fs::write(worker.data_dir().join("n1/log.txt"), b"ok").unwrap();
    std::fs::write(worker.data_dir().join("result.csv"), b"1").unwrap();

    let dest = tmp.path().join("collected");
    assert!(worker.collect(&dest).unwrap());

    assert_eq!(
        manager.log.lock().unwrap().archive_paths,
        vec!["n1/log.txt".to_string(), "result.csv".to_string()]
    );
    assert!(!dest.exists());
    assert!(worker.config().delete_temp_on_shutdown);
}

#[test]
fn failed_upload_keeps_temporary_storage() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = FakeManager::start(json!({}));
    let launcher = ScriptedLauncher::new(Behavior::Ready);
    let worker = worker_with_delivery("w", launcher, fast_config(1), tmp.path(), Delivery::Upload);
    assert!(worker.connect("127.0.0.1", manager.port(), Duration::from_secs(2)));
    std::fs::write(worker.data_dir().join("result.csv"), b"1").unwrap();
    drop(manager);

    assert!(!worker.collect(tmp.path().join("collected")).unwrap());
    assert!(!worker.config().delete_temp_on_shutdown);

    let temp_dir = worker.temp_dir().to_path_buf();
    worker.shutdown();
    assert!(temp_dir.join("data/result.csv").exists());
}

#[test]
fn idle_returns_once_shut_down() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = worker("w", ScriptedLauncher::new(Behavior::Ready), fast_config(1), tmp.path());

    std::thread::scope(|s| {
        s.spawn(|| worker.shutdown());
        worker.idle();
    });
    assert!(worker.has_shutdown());
}
