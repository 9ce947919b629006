//! Lifecycle tests for the engine, run unprivileged against fake mounts,
//! cgroups, and network drivers with a shell script standing in for init.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use std::fs::File;
use std::sync::atomic::Ordering;

use capsule_common::error::CapsuleError;
use capsule_common::types::{ContainerRecord, ContainerStatus, PortMapping, VolumeBinding};
use capsule_core::signal;
use capsule_runtime::handoff;
use capsule_runtime::{Engine, RunOutcome, RunRequest};

use common::{eventually, harness};

/// Receives the command, prints, then stays up until killed.
const LONG_RUNNING: &str = "cat <&3 > received; echo hi; exec sleep 30";

fn request(name: &str, command: &[&str]) -> RunRequest {
    RunRequest {
        name: Some(name.to_string()),
        image: "base".into(),
        command: command.iter().map(ToString::to_string).collect(),
        detached: true,
        ..RunRequest::default()
    }
}

fn start(engine: &Engine, request: RunRequest) -> ContainerRecord {
    match engine.run(request).expect("run") {
        RunOutcome::Detached(record) => record,
        RunOutcome::Exited { name, .. } => panic!("{name} was not detached"),
    }
}

#[test]
fn detached_run_is_listed_and_logs_output() {
    let h = harness(LONG_RUNNING);
    let record = start(&h.engine, request("c1", &["echo", "hi"]));
    assert_eq!(record.status, ContainerStatus::Running);
    let pid = record.pid.expect("pid");
    assert!(signal::is_alive(pid));

    let listed = h.engine.list().expect("ps");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "c1");
    assert_eq!(listed[0].pid, Some(pid));

    assert!(eventually(|| h.engine.logs("c1").expect("logs") == "hi\n"));
    let received = h.layout.merge_dir("c1").join("received");
    assert!(eventually(|| received.metadata().is_ok_and(|m| m.len() > 0)));
    let mut frame = File::open(&received).expect("open");
    assert_eq!(handoff::read_command(&mut frame).expect("frame"), vec!["echo", "hi"]);

    let _ = h.engine.remove("c1", true).expect("cleanup");
}

#[test]
fn cgroup_enrollment_precedes_handoff() {
    let h = harness(LONG_RUNNING);
    *h.controller.watch.lock().expect("lock") = Some(h.layout.merge_dir("c1").join("received"));
    let record = start(&h.engine, request("c1", &["true"]));

    assert_eq!(*h.controller.handoff_seen_at_apply.lock().expect("lock"), Some(false));
    let procs = std::fs::read_to_string(record.cgroup.path().join("cgroup.procs")).expect("procs");
    assert_eq!(procs, record.pid.expect("pid").to_string());
    let events = h.events.all();
    let order: Vec<_> = events.iter().filter(|e| e.starts_with("cgroup")).collect();
    assert_eq!(order, vec!["cgroup create", "cgroup set", "cgroup apply"]);

    let _ = h.engine.remove("c1", true).expect("cleanup");
}

#[test]
fn limits_are_written_before_enrollment() {
    let h = harness(LONG_RUNNING);
    let mut req = request("c1", &["true"]);
    req.limits.memory_max = Some("64M".into());
    req.limits.cpu_weight = Some("50".into());
    let record = start(&h.engine, req);
    let read = |file: &str| std::fs::read_to_string(record.cgroup.path().join(file)).expect(file);
    assert_eq!(read("memory.max"), "64M");
    assert_eq!(read("cpu.weight"), "50");
    let _ = h.engine.remove("c1", true).expect("cleanup");
}

#[test]
fn concurrent_runs_with_one_name_conflict() {
    let h = harness(LONG_RUNNING);
    let results: Vec<_> = std::thread::scope(|s| {
        let runs: Vec<_> = (0..2)
            .map(|_| s.spawn(|| h.engine.run(request("dup", &["true"]))))
            .collect();
        runs.into_iter().map(|r| r.join().expect("thread")).collect()
    });

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for result in results {
        match result {
            Ok(RunOutcome::Detached(record)) => winners.push(record),
            Err(CapsuleError::NameConflict { name }) => {
                assert_eq!(name, "dup");
                conflicts += 1;
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!((winners.len(), conflicts), (1, 1));
    let stored = h.engine.inspect("dup").expect("winner survives");
    assert_eq!(stored, winners[0]);
    assert!(signal::is_alive(stored.pid.expect("pid")));

    let _ = h.engine.remove("dup", true).expect("cleanup");
}

#[test]
fn concurrent_runs_share_one_image_layer() {
    let h = harness(LONG_RUNNING);
    let records: Vec<_> = std::thread::scope(|s| {
        let runs: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let engine = &h.engine;
                s.spawn(move || start(engine, request(name, &["true"])))
            })
            .collect();
        runs.into_iter().map(|r| r.join().expect("thread")).collect()
    });
    assert_eq!(records.len(), 2);

    let lower = h.layout.image_lower_dir("base");
    let overlays: Vec<_> = h
        .events
        .all()
        .into_iter()
        .filter(|e| e.starts_with("overlay"))
        .collect();
    assert_eq!(overlays.len(), 2);
    assert!(overlays.iter().all(|e| e.ends_with(&format!("lower={}", lower.display()))));
    assert_eq!(
        std::fs::read_to_string(lower.join("etc/motd")).expect("cached layer"),
        "base image\n"
    );
    assert!(!h.layout.image_staging_dir("base").exists());

    assert_ne!(h.layout.upper_dir("a"), h.layout.upper_dir("b"));
    for name in ["a", "b"] {
        assert!(h.layout.upper_dir(name).is_dir());
        assert!(h.layout.worker_dir(name).is_dir());
        let _ = h.engine.remove(name, true).expect("cleanup");
    }
}

#[test]
fn removal_unmounts_volume_before_overlay() {
    let h = harness(LONG_RUNNING);
    let host = h.dir.path().join("data");
    let volume: VolumeBinding = format!("{}:/data", host.display()).parse().expect("volume");
    let mut req = request("v1", &["true"]);
    req.volumes = vec![volume.clone()];
    let _ = start(&h.engine, req);
    assert!(host.is_dir());

    let report = h.engine.remove("v1", true).expect("remove");
    assert!(report.is_clean(), "{:?}", report.failures());

    let merge = h.layout.merge_dir("v1");
    let volume_unmount = h
        .events
        .position(&format!("unmount {}", volume.target_in(&merge).display()))
        .expect("volume unmounted");
    let overlay_unmount = h
        .events
        .position(&format!("unmount {}", merge.display()))
        .expect("overlay unmounted");
    assert!(volume_unmount < overlay_unmount);
    assert!(host.is_dir(), "host side of a volume is never deleted");
}

#[test]
fn running_container_is_not_removed_without_force() {
    let h = harness(LONG_RUNNING);
    let record = start(&h.engine, request("c1", &["true"]));

    let err = h.engine.remove("c1", false).expect_err("refused");
    assert!(matches!(err, CapsuleError::InvalidState { action: "remove", .. }));
    assert_eq!(h.engine.inspect("c1").expect("record").status, ContainerStatus::Running);
    assert!(record.cgroup.path().is_dir());
    assert!(h.layout.merge_dir("c1").is_dir());
    assert_eq!(h.events.count_prefix("unmount"), 0);
    assert_eq!(h.events.count_prefix("cgroup clear"), 0);

    let _ = h.engine.remove("c1", true).expect("cleanup");
}

#[test]
fn forced_removal_kills_and_tears_everything_down() {
    let h = harness(LONG_RUNNING);
    let record = start(&h.engine, request("c1", &["true"]));
    let pid = record.pid.expect("pid");

    let report = h.engine.remove("c1", true).expect("remove");
    assert!(report.is_clean(), "{:?}", report.failures());
    assert!(!signal::is_alive(pid));
    assert!(!record.cgroup.path().exists());
    assert!(!h.layout.overlay_dir("c1").exists());
    assert!(h.engine.inspect("c1").expect_err("gone").is_not_found());
    assert!(h.layout.image_lower_dir("base").is_dir(), "image layer is kept");
}

#[test]
fn failed_teardown_keeps_record_until_a_later_remove_succeeds() {
    let h = harness(LONG_RUNNING);
    let record = start(&h.engine, request("c1", &["true"]));
    let pid = record.pid.expect("pid");
    h.controller.busy.store(true, Ordering::SeqCst);

    let report = h.engine.remove("c1", true).expect("remove");
    assert_eq!(report.failures().len(), 1, "{:?}", report.failures());
    assert!(report.failures()[0].starts_with("remove cgroup"));
    assert!(!signal::is_alive(pid));
    assert!(record.cgroup.path().is_dir());
    let kept = h.engine.inspect("c1").expect("record kept for retry");
    assert_eq!(kept.status, ContainerStatus::Exited);
    assert_eq!(kept.pid, None);
    assert!(matches!(
        h.engine.run(request("c1", &["true"])),
        Err(CapsuleError::NameConflict { .. })
    ));

    h.controller.busy.store(false, Ordering::SeqCst);
    let report = h.engine.remove("c1", false).expect("retry");
    assert!(report.is_clean(), "{:?}", report.failures());
    assert!(!record.cgroup.path().exists());
    assert!(h.engine.inspect("c1").expect_err("gone").is_not_found());
}

#[test]
fn stop_marks_stopped_and_clears_pid() {
    let h = harness(LONG_RUNNING);
    let pid = start(&h.engine, request("c1", &["true"])).pid.expect("pid");

    let stopped = h.engine.stop("c1", false).expect("stop");
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert_eq!(stopped.pid, None);
    assert!(eventually(|| !signal::is_alive(pid)));
    assert!(matches!(
        h.engine.stop("c1", false),
        Err(CapsuleError::InvalidState { action: "stop", .. })
    ));

    let report = h.engine.remove("c1", false).expect("stopped containers need no force");
    assert!(report.is_clean(), "{:?}", report.failures());
    assert!(h.engine.stop("c1", true).expect_err("removed").is_not_found());
}

#[test]
fn interactive_run_returns_exit_code_and_cleans_up() {
    let h = harness("cat <&3 >/dev/null; exit 3");
    let mut req = request("it", &["true"]);
    req.detached = false;
    match h.engine.run(req).expect("run") {
        RunOutcome::Exited { name, code, cleanup } => {
            assert_eq!(name, "it");
            assert_eq!(code, 3);
            assert!(cleanup.is_clean(), "{:?}", cleanup.failures());
        }
        RunOutcome::Detached(_) => panic!("interactive run detached"),
    }
    assert!(h.engine.inspect("it").expect_err("removed").is_not_found());
    assert!(!h.layout.overlay_dir("it").exists());
    assert_eq!(std::fs::read_dir(&h.cgroups).expect("cgroups").count(), 0);
}

#[test]
fn failed_setup_rolls_back_every_step() {
    let h = harness(LONG_RUNNING);
    let mut req = request("c1", &["true"]);
    req.limits.memory_max = Some("fail".into());
    let err = h.engine.run(req).expect_err("limit rejected");
    assert!(matches!(err, CapsuleError::ResourceSetup { .. }));

    assert!(h.engine.inspect("c1").expect_err("no record").is_not_found());
    assert!(!h.layout.container_dir("c1").exists());
    assert!(!h.layout.overlay_dir("c1").exists());
    assert_eq!(std::fs::read_dir(&h.cgroups).expect("cgroups").count(), 0);
    assert_eq!(h.events.count_prefix("cgroup clear"), 1);

    let record = start(&h.engine, request("c1", &["true"]));
    assert_eq!(record.name, "c1");
    let _ = h.engine.remove("c1", true).expect("cleanup");
}

#[test]
fn unknown_image_releases_the_name() {
    let h = harness(LONG_RUNNING);
    let mut req = request("c1", &["true"]);
    req.image = "ghost".into();
    assert!(h.engine.run(req).expect_err("no image").is_not_found());
    assert!(!h.layout.container_dir("c1").exists());
    assert!(h.engine.list().expect("ps").is_empty());
}

#[test]
fn invalid_input_is_rejected_before_any_resource() {
    let h = harness(LONG_RUNNING);
    let mut ports = request("c1", &["true"]);
    ports.ports = vec![PortMapping { host: 8080, container: 80 }];
    assert!(matches!(h.engine.run(ports), Err(CapsuleError::Config { .. })));

    assert!(matches!(
        h.engine.run(request("../escape", &["true"])),
        Err(CapsuleError::Config { .. })
    ));
    let mut net = request("c2", &["true"]);
    net.network = Some("missing".into());
    assert!(h.engine.run(net).expect_err("no network").is_not_found());

    assert!(h.events.all().is_empty());
    assert!(!h.layout.registry_dir().join("c1").exists());
    assert!(!h.layout.registry_dir().join("c2").exists());
}

#[test]
fn unnamed_container_is_named_after_its_id() {
    let h = harness(LONG_RUNNING);
    let mut req = request("x", &["true"]);
    req.name = None;
    let record = start(&h.engine, req);
    assert_eq!(record.name, record.id.as_str());
    let _ = h.engine.remove(&record.name, true).expect("cleanup");
}

#[test]
fn network_is_attached_after_record_and_detached_before_unmount() {
    let h = harness(LONG_RUNNING);
    let _ = h
        .engine
        .create_network("net0", "fake", "10.30.0.0/24".parse().expect("subnet"), None)
        .expect("network");
    let mut req = request("web", &["true"]);
    req.network = Some("net0".into());
    req.ports = vec![PortMapping { host: 8080, container: 80 }];
    let record = start(&h.engine, req);
    assert_eq!(record.ip_address.as_deref(), Some("10.30.0.2"));

    let stored = h.engine.inspect("web").expect("record");
    assert_eq!(stored.network.as_deref(), Some("net0"));
    assert_eq!(stored.ip_address.as_deref(), Some("10.30.0.2"));
    assert_eq!(stored.port_mappings, record.port_mappings);
    let enrolled = h.events.position("cgroup apply").expect("enrolled");
    let connected = h.events.position("net connect web 10.30.0.2").expect("connected");
    assert!(enrolled < connected);
    assert!(matches!(
        h.engine.remove_network("net0"),
        Err(CapsuleError::Config { .. })
    ));

    let report = h.engine.remove("web", true).expect("remove");
    assert!(report.is_clean(), "{:?}", report.failures());
    let detached = h.events.position("net disconnect web").expect("disconnected");
    let first_unmount = h
        .events
        .all()
        .iter()
        .position(|e| e.starts_with("unmount"))
        .expect("unmounted");
    assert!(detached < first_unmount);

    assert!(h.engine.networks().expect("networks")[0].endpoints.is_empty());
    h.engine.remove_network("net0").expect("remove network");
    assert!(h.engine.networks().expect("networks").is_empty());
}

#[test]
fn exited_container_is_reconciled_and_removable() {
    let h = harness("cat <&3 >/dev/null");
    let pid = start(&h.engine, request("short", &["true"])).pid.expect("pid");
    assert!(eventually(|| !signal::is_alive(pid)));

    let record = h.engine.inspect("short").expect("record");
    assert_eq!(record.status, ContainerStatus::Exited);
    assert_eq!(record.pid, None);
    assert!(matches!(
        h.engine.exec("short", &["ls".into()]),
        Err(CapsuleError::InvalidState { .. })
    ));
    let report = h.engine.remove("short", false).expect("remove");
    assert!(report.is_clean(), "{:?}", report.failures());
}

#[test]
fn exec_runs_helper_for_running_containers() {
    let h = harness(LONG_RUNNING);
    let _ = start(&h.engine, request("c1", &["true"]));
    assert_eq!(h.engine.exec("c1", &["ls".into()]).expect("exec"), 0);
    assert!(h.engine.exec("ghost", &["ls".into()]).expect_err("missing").is_not_found());
    let _ = h.engine.remove("c1", true).expect("cleanup");
}

#[test]
fn logs_of_unknown_container_are_not_found() {
    let h = harness(LONG_RUNNING);
    assert!(h.engine.logs("ghost").expect_err("missing").is_not_found());
}

#[test]
fn commit_packs_the_container_filesystem() {
    let h = harness(LONG_RUNNING);
    let _ = start(&h.engine, request("c1", &["true"]));
    let received = h.layout.merge_dir("c1").join("received");
    assert!(eventually(|| received.metadata().is_ok_and(|m| m.len() > 0)));

    let (info, digest) = h.engine.commit("c1", "snap").expect("commit");
    assert_eq!(info.name, "snap");
    assert!(digest.to_string().starts_with("sha256:"));
    let names: Vec<_> = h.engine.images().expect("images").into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["base", "snap"]);
    assert!(h.engine.commit("ghost", "other").expect_err("missing").is_not_found());

    let _ = h.engine.remove("c1", true).expect("cleanup");
}
