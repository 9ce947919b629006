//! Unprivileged stand-ins for mounts, cgroups, and network drivers.
//!
//! Every fake appends to one shared event log so tests can assert the
//! order in which the engine touches different resources.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use capsule_common::config::Layout;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::{CgroupHandle, ResourceLimits};
use capsule_core::cgroup::ResourceController;
use capsule_core::filesystem::{Mounter, OverlayConfig};
use capsule_core::namespace::NamespaceConfig;
use capsule_runtime::network::{DriverRegistry, Endpoint, Network, NetworkDriver};
use capsule_runtime::process::InitProgram;
use capsule_runtime::{Engine, EngineParts};

/// Shared, ordered record of side effects.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().expect("lock").push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().expect("lock").clone()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.all().iter().position(|e| e == needle)
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.all().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Tracks mounts in memory. Unmounting an overlay empties its merge
/// directory, as the real kernel view would.
pub struct FakeMounter {
    events: Events,
    mounted: Mutex<HashSet<PathBuf>>,
    overlays: Mutex<HashSet<PathBuf>>,
}

impl FakeMounter {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            mounted: Mutex::new(HashSet::new()),
            overlays: Mutex::new(HashSet::new()),
        }
    }
}

impl Mounter for FakeMounter {
    fn mount_overlay(&self, config: &OverlayConfig) -> Result<()> {
        let lowers: Vec<_> = config.lower_dirs.iter().map(|d| d.display().to_string()).collect();
        self.events.push(format!(
            "overlay {} lower={}",
            config.merged_dir.display(),
            lowers.join(":")
        ));
        let _ = self.mounted.lock().expect("lock").insert(config.merged_dir.clone());
        let _ = self.overlays.lock().expect("lock").insert(config.merged_dir.clone());
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        self.events
            .push(format!("bind {} {}", source.display(), target.display()));
        let _ = self.mounted.lock().expect("lock").insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.events.push(format!("unmount {}", target.display()));
        if !self.mounted.lock().expect("lock").remove(target) {
            return Err(CapsuleError::setup("unmount", "not mounted"));
        }
        if self.overlays.lock().expect("lock").remove(target) {
            std::fs::remove_dir_all(target).map_err(|e| CapsuleError::io(target, e))?;
            std::fs::create_dir(target).map_err(|e| CapsuleError::io(target, e))?;
        }
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.mounted.lock().expect("lock").contains(target))
    }
}

/// Keeps cgroups as plain directories. A limit of `"fail"` is rejected.
///
/// When `watch` is set, `apply` records whether that file already holds
/// data, which reveals whether the command was handed off too early.
pub struct FakeController {
    root: PathBuf,
    events: Events,
    pub watch: Mutex<Option<PathBuf>>,
    pub handoff_seen_at_apply: Mutex<Option<bool>>,
    /// While set, `clear` fails as if processes were still enrolled.
    pub busy: AtomicBool,
}

impl FakeController {
    pub fn new(root: PathBuf, events: Events) -> Self {
        Self {
            root,
            events,
            watch: Mutex::new(None),
            handoff_seen_at_apply: Mutex::new(None),
            busy: AtomicBool::new(false),
        }
    }
}

impl ResourceController for FakeController {
    fn create(&self, pid: u32) -> Result<CgroupHandle> {
        let path = self.root.join(format!("capsule-{pid}"));
        std::fs::create_dir_all(&path).map_err(|e| CapsuleError::io(&path, e))?;
        self.events.push("cgroup create");
        Ok(CgroupHandle::new(path))
    }

    fn set(&self, cgroup: &CgroupHandle, limits: &ResourceLimits) -> Result<()> {
        for (file, value) in [
            ("memory.max", &limits.memory_max),
            ("cpu.weight", &limits.cpu_weight),
            ("cpuset.cpus", &limits.cpuset_cpus),
        ] {
            if let Some(value) = value {
                if value == "fail" {
                    return Err(CapsuleError::setup("cgroup limit", format!("{file} rejected")));
                }
                let path = cgroup.path().join(file);
                std::fs::write(&path, value).map_err(|e| CapsuleError::io(path, e))?;
            }
        }
        self.events.push("cgroup set");
        Ok(())
    }

    fn apply(&self, cgroup: &CgroupHandle, pid: u32) -> Result<()> {
        let path = cgroup.path().join("cgroup.procs");
        std::fs::write(&path, pid.to_string()).map_err(|e| CapsuleError::io(path, e))?;
        if let Some(watch) = self.watch.lock().expect("lock").as_ref() {
            // Give an early writer time to show up.
            std::thread::sleep(Duration::from_millis(50));
            let seen = std::fs::metadata(watch).is_ok_and(|m| m.len() > 0);
            *self.handoff_seen_at_apply.lock().expect("lock") = Some(seen);
        }
        self.events.push("cgroup apply");
        Ok(())
    }

    fn clear(&self, cgroup: &CgroupHandle) -> Result<()> {
        self.events.push("cgroup clear");
        if self.busy.load(Ordering::SeqCst) {
            return Err(CapsuleError::setup("cgroup", "device or resource busy"));
        }
        match std::fs::remove_dir_all(cgroup.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::io(cgroup.path(), e)),
        }
    }
}

/// Network driver that only records what it is asked to do.
pub struct FakeDriver {
    events: Events,
}

impl NetworkDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn create(&self, network: &Network) -> Result<()> {
        self.events.push(format!("net create {}", network.name));
        Ok(())
    }

    fn delete(&self, network: &Network) -> Result<()> {
        self.events.push(format!("net delete {}", network.name));
        Ok(())
    }

    fn connect(&self, _network: &Network, endpoint: &Endpoint, _pid: u32) -> Result<()> {
        self.events
            .push(format!("net connect {} {}", endpoint.container, endpoint.address));
        Ok(())
    }

    fn disconnect(&self, _network: &Network, endpoint: &Endpoint) -> Result<()> {
        self.events.push(format!("net disconnect {}", endpoint.container));
        Ok(())
    }
}

/// An engine wired to fakes, with its scratch directory.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub layout: Layout,
    pub cgroups: PathBuf,
    pub events: Events,
    pub controller: Arc<FakeController>,
    pub engine: Engine,
}

/// Writes a one-file image archive named `name`.
pub fn write_image(layout: &Layout, name: &str) {
    std::fs::create_dir_all(layout.image_dir()).expect("mkdir");
    let file = std::fs::File::create(layout.image_archive(name)).expect("archive");
    let mut builder = tar::Builder::new(file);
    let data = b"base image\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder
        .append_data(&mut header, "etc/motd", &data[..])
        .expect("append");
    builder.finish().expect("finish");
}

/// Builds an engine whose containers run `init_script` with `sh -c` in
/// their merge directory, with image `base` available.
pub fn harness(init_script: &str) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path().join("root"));
    let cgroups = dir.path().join("cgroup");
    write_image(&layout, "base");

    let events = Events::default();
    let controller = Arc::new(FakeController::new(cgroups.clone(), events.clone()));
    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(FakeDriver {
        events: events.clone(),
    }));
    let parts = EngineParts {
        mounter: Arc::new(FakeMounter::new(events.clone())),
        controller: Arc::clone(&controller) as Arc<dyn ResourceController>,
        drivers,
        init: InitProgram::new("/bin/sh", ["-c", init_script]),
        exec_helper: InitProgram::new("/bin/sh", ["-c", "exit 0"]),
        namespaces: NamespaceConfig::none(),
    };
    Harness {
        engine: Engine::new(layout.clone(), parts),
        dir,
        layout,
        cgroups,
        events,
        controller,
    }
}

/// Polls `check` until it holds or five seconds pass.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}
