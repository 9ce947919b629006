//! Persistent container registry.
//!
//! One directory per container under `{root}/container/`, holding the
//! `info.json` record. The directory doubles as the name reservation:
//! `mkdir(2)` either creates it or fails because the name is taken, so two
//! concurrent runs with the same name cannot both proceed. Records are
//! always replaced whole, through a temporary file and a rename.

use std::path::Path;

use capsule_common::config::Layout;
use capsule_common::constants::INFO_FILE;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::{ContainerRecord, ContainerStatus};
use capsule_core::signal;

/// Container records on disk.
#[derive(Debug, Clone)]
pub struct Registry {
    layout: Layout,
}

impl Registry {
    /// Creates a registry over the container directory of `layout`.
    #[must_use]
    pub const fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Claims `name`, failing if any container already holds it.
    ///
    /// The claim is released by [`Registry::remove`].
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NameConflict`] if the name is taken, or an
    /// I/O error if the directory cannot be created.
    pub fn reserve(&self, name: &str) -> Result<()> {
        let parent = self.layout.registry_dir();
        std::fs::create_dir_all(&parent).map_err(|e| CapsuleError::io(&parent, e))?;
        let dir = self.layout.container_dir(name);
        match std::fs::create_dir(&dir) {
            Ok(()) => {
                tracing::debug!(name, "container name reserved");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CapsuleError::NameConflict {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(CapsuleError::io(dir, e)),
        }
    }

    /// Returns whether a container directory exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.layout.container_dir(name).is_dir()
    }

    /// Writes `record`, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let dir = self.layout.container_dir(&record.name);
        std::fs::create_dir_all(&dir).map_err(|e| CapsuleError::io(&dir, e))?;
        let path = self.layout.info_path(&record.name);
        let tmp = dir.join(format!(".{INFO_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, json).map_err(|e| CapsuleError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CapsuleError::io(&path, e))?;
        tracing::debug!(name = %record.name, status = %record.status, "record saved");
        Ok(())
    }

    /// Loads the record of `name`.
    ///
    /// A record claiming a process that no longer exists is rewritten as
    /// [`ContainerStatus::Exited`] before it is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if no record exists.
    pub fn get(&self, name: &str) -> Result<ContainerRecord> {
        let path = self.layout.info_path(name);
        let record = read_record(&path)?.ok_or_else(|| CapsuleError::NotFound {
            kind: "container",
            id: name.to_string(),
        })?;
        self.reconcile(record)
    }

    /// Loads every record, sorted by creation time.
    ///
    /// Directories without a record (names being claimed by a concurrent
    /// run) are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read or a record is
    /// corrupt.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let dir = self.layout.registry_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CapsuleError::io(&dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CapsuleError::io(&dir, e))?;
            if let Some(record) = read_record(&entry.path().join(INFO_FILE))? {
                records.push(self.reconcile(record)?);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Sets the status of `name`, clearing its pid unless running.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if no record exists.
    pub fn update_status(&self, name: &str, status: ContainerStatus) -> Result<ContainerRecord> {
        let mut record = self.get(name)?;
        record.mark(status);
        self.save(&record)?;
        Ok(record)
    }

    /// Deletes the record and its directory, including the container log.
    /// Deleting an absent record succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.layout.container_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(name, "record removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::io(dir, e)),
        }
    }

    fn reconcile(&self, mut record: ContainerRecord) -> Result<ContainerRecord> {
        if record.is_running() && !record.pid.is_some_and(signal::is_alive) {
            tracing::info!(name = %record.name, "container process gone, marking exited");
            record.mark(ContainerStatus::Exited);
            self.save(&record)?;
        }
        Ok(record)
    }
}

fn read_record(path: &Path) -> Result<Option<ContainerRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CapsuleError::io(path, e)),
    }
}
