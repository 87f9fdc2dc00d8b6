// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The group registry: owns every [`Group`], the cold-start reset policy,
//! and the process-local [`HealthTable`].
//!
//! Registry and health table are kept as two distinct instantiations
//! rather than one heterogeneous container, per the re-architecture
//! guidance this crate follows: a name→Group map and an endpoint→timestamp
//! map have no business sharing a key space.

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::group::{self, Group, ListenerId};
use crate::health::HealthTable;
use crate::index::KeyedIndex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const RESET_MARKER: &str = ".lasttime";

/// Owns all groups and the liveness table. Mutation is confined to the
/// reactor thread; see the crate-level concurrency notes.
pub struct GroupRegistry {
    state_dir: PathBuf,
    reset_window: Duration,
    groups: KeyedIndex<Group>,
    health: HealthTable,
}

impl GroupRegistry {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            state_dir: config.state_dir.clone(),
            reset_window: Duration::from_secs(config.reset_window_secs),
            groups: KeyedIndex::new(),
            health: HealthTable::new(),
        }
    }

    /// Creates the state directory if absent, otherwise applies the
    /// cold-start reset policy: if the `.lasttime` marker's last-access
    /// time is older than the reset window, every other file is unlinked
    /// and the registry starts empty; otherwise every surviving file is
    /// rehydrated as a group. Either way the marker is touched afterward.
    ///
    /// If the state directory already existed but its marker did not, that
    /// is fatal rather than silently adopting a fresh marker over whatever
    /// group files are sitting there: matches the original's
    /// `open_existing_groups`, which treats a failed `stat` on `.lasttime`
    /// in this situation as fatal and returns -1 rather than starting over
    /// orphaned state.
    pub fn initialize(&mut self) -> Result<()> {
        let dir_preexisted = self.state_dir.exists();
        if !dir_preexisted {
            fs::create_dir_all(&self.state_dir)?;
            set_permissions(&self.state_dir, 0o755)?;
        }

        let marker = self.state_dir.join(RESET_MARKER);
        if marker.exists() {
            let stale = marker_is_stale(&marker, self.reset_window)?;
            if stale {
                wipe_state_dir(&self.state_dir)?;
            } else {
                self.rehydrate_all()?;
            }
        } else if dir_preexisted {
            return Err(BrokerError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "state directory {} exists without its reset marker",
                    self.state_dir.display()
                ),
            )));
        } else {
            fs::write(&marker, b"")?;
        }

        touch(&marker)?;
        Ok(())
    }

    fn rehydrate_all(&mut self) -> Result<()> {
        for entry in fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name == RESET_MARKER {
                continue;
            }
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            let group = Group::rehydrate(name, path)?;
            self.groups.insert(name, group);
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.groups.contains(name)
    }

    /// Creates a new group, or adopts an existing backing file of the same
    /// name. Fails if the name is already registered or invalid.
    pub fn create(&mut self, name: &str) -> Result<()> {
        group::validate_group_name(name)?;
        if self.groups.contains(name) {
            return Err(BrokerError::AlreadyExists(name.to_string()));
        }
        let path = group::group_path(&self.state_dir, name);
        let g = Group::create(name, path)?;
        self.groups.insert(name, g);
        Ok(())
    }

    /// Removes the group from the index, unmaps and unlinks its backing
    /// file. Unlink failures are logged, not propagated: the in-memory
    /// state has already been torn down correctly.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let group = self
            .groups
            .remove(name)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))?;
        let path = group::group_path(&self.state_dir, name);
        drop(group);
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(group = name, error = %e, "failed to unlink group file");
        }
        Ok(())
    }

    /// Borrowed byte view of a group's member list, up to its first NUL.
    pub fn members(&self, name: &str) -> Result<&[u8]> {
        self.groups
            .get(name)
            .map(Group::members_view)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))
    }

    /// Joins `endpoint` to `name` and refreshes its health record.
    pub fn join(&mut self, name: &str, endpoint: &str) -> Result<()> {
        group::validate_endpoint(endpoint)?;
        let group = self
            .groups
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))?;
        group.join(endpoint)?;
        self.health.touch(endpoint);
        Ok(())
    }

    pub fn leave(&mut self, name: &str, endpoint: &str) -> Result<()> {
        let group = self
            .groups
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))?;
        group.leave(endpoint)
    }

    pub fn subscribe(&mut self, name: &str, listener: ListenerId) -> Result<()> {
        let group = self
            .groups
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))?;
        group.subscribe(listener);
        Ok(())
    }

    /// Returns `NotFound` if `listener` was not subscribed to `name`.
    pub fn unsubscribe(&mut self, name: &str, listener: ListenerId) -> Result<()> {
        let group = self
            .groups
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))?;
        if group.unsubscribe(listener) {
            Ok(())
        } else {
            Err(BrokerError::NotFound(format!("listener in {name}")))
        }
    }

    pub fn listeners_snapshot(&self, name: &str) -> Result<Vec<ListenerId>> {
        self.groups
            .get(name)
            .map(Group::listeners_snapshot)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))
    }

    /// HEALTHCHECK requires current membership; touches the health record
    /// only if `endpoint` is a member of `name`.
    pub fn healthcheck(&mut self, name: &str, endpoint: &str) -> Result<()> {
        let group = self
            .groups
            .get(name)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))?;
        if !group.is_member(endpoint) {
            return Err(BrokerError::NotMember {
                group: name.to_string(),
                endpoint: endpoint.to_string(),
            });
        }
        self.health.touch(endpoint);
        Ok(())
    }
}

fn marker_is_stale(marker: &Path, reset_window: Duration) -> Result<bool> {
    let metadata = fs::metadata(marker)?;
    let accessed = metadata.accessed()?;
    let age = SystemTime::now()
        .duration_since(accessed)
        .unwrap_or(Duration::ZERO);
    Ok(age > reset_window)
}

fn wipe_state_dir(state_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(state_dir)? {
        let entry = entry?;
        if entry.file_name() == RESET_MARKER {
            continue;
        }
        fs::remove_file(entry.path())?;
    }
    Ok(())
}

/// Sets the marker's access and modification time to now, the same way
/// the source's `utime()` call on the `.lasttime` file does.
fn touch(marker: &Path) -> Result<()> {
    let c_path = std::ffi::CString::new(marker.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| BrokerError::BadName(marker.display().to_string()))?;
    // SAFETY: c_path is a valid NUL-terminated path; a null `times`
    // argument tells utimes to set both atime and mtime to the current
    // time, which is valid for any existing, accessible file.
    let ret = unsafe { libc::utimes(c_path.as_ptr(), std::ptr::null()) };
    if ret < 0 {
        return Err(BrokerError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    /// Points `state_dir` at a not-yet-existing subdirectory of `dir` (the
    /// tempdir itself always already exists, which would otherwise trip the
    /// "directory exists without its marker" fail-fast path on the very
    /// first `initialize()` call).
    fn config_in(dir: &Path) -> BrokerConfig {
        BrokerConfig {
            state_dir: dir.join("state"),
            ..Default::default()
        }
    }

    #[test]
    fn create_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = GroupRegistry::new(&config_in(dir.path()));
        reg.initialize().unwrap();
        reg.create("g1").unwrap();
        assert!(reg.exists("g1"));
    }

    #[test]
    fn create_twice_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = GroupRegistry::new(&config_in(dir.path()));
        reg.initialize().unwrap();
        reg.create("g1").unwrap();
        assert!(matches!(reg.create("g1"), Err(BrokerError::AlreadyExists(_))));
    }

    #[test]
    fn join_ghost_group_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = GroupRegistry::new(&config_in(dir.path()));
        reg.initialize().unwrap();
        assert!(matches!(
            reg.join("ghost", "1.2.3.4:80"),
            Err(BrokerError::NotFound(_))
        ));
    }

    #[test]
    fn scenario_s1_create_join_listmembers() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = GroupRegistry::new(&config_in(dir.path()));
        reg.initialize().unwrap();
        reg.create("g1").unwrap();
        reg.join("g1", "1.2.3.4:80").unwrap();
        assert_eq!(reg.members("g1").unwrap(), b"1.2.3.4:80,");
    }

    #[test]
    fn scenario_s2_join_join_leave_listmembers() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = GroupRegistry::new(&config_in(dir.path()));
        reg.initialize().unwrap();
        reg.create("g1").unwrap();
        reg.join("g1", "1.2.3.4:80").unwrap();
        reg.join("g1", "5.6.7.8:90").unwrap();
        reg.leave("g1", "1.2.3.4:80").unwrap();
        assert_eq!(reg.members("g1").unwrap(), b"5.6.7.8:90,");
    }

    #[test]
    fn scenario_s6_healthcheck_requires_membership() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = GroupRegistry::new(&config_in(dir.path()));
        reg.initialize().unwrap();
        reg.create("g1").unwrap();
        reg.join("g1", "1.2.3.4:80").unwrap();
        reg.healthcheck("g1", "1.2.3.4:80").unwrap();
        assert!(matches!(
            reg.healthcheck("g1", "9.9.9.9:9"),
            Err(BrokerError::NotMember { .. })
        ));
    }

    #[test]
    fn delete_unlinks_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = GroupRegistry::new(&config_in(dir.path()));
        reg.initialize().unwrap();
        reg.create("g1").unwrap();
        let path = dir.path().join("state").join("g1");
        assert!(path.exists());
        reg.delete("g1").unwrap();
        assert!(!path.exists());
        assert!(!reg.exists("g1"));
    }

    #[test]
    fn delete_absent_group_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = GroupRegistry::new(&config_in(dir.path()));
        reg.initialize().unwrap();
        assert!(matches!(reg.delete("ghost"), Err(BrokerError::NotFound(_))));
    }

    #[test]
    fn restart_within_window_rehydrates_members() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut reg = GroupRegistry::new(&config_in(dir.path()));
            reg.initialize().unwrap();
            reg.create("g1").unwrap();
            reg.join("g1", "1.2.3.4:80").unwrap();
        }
        let mut reg2 = GroupRegistry::new(&config_in(dir.path()));
        reg2.initialize().unwrap();
        assert!(reg2.exists("g1"));
        assert_eq!(reg2.members("g1").unwrap(), b"1.2.3.4:80,");
    }

    #[test]
    fn restart_after_window_wipes_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut reg = GroupRegistry::new(&config_in(dir.path()));
            reg.initialize().unwrap();
            reg.create("g1").unwrap();
            reg.join("g1", "1.2.3.4:80").unwrap();
        }
        // Force the marker to look stale without sleeping 300 seconds.
        let mut cfg = config_in(dir.path());
        cfg.reset_window_secs = 0;
        std::thread::sleep(Duration::from_millis(10));
        let mut reg2 = GroupRegistry::new(&cfg);
        reg2.initialize().unwrap();
        assert!(!reg2.exists("g1"));
        assert!(!dir.path().join("state").join("g1").exists());
    }

    #[test]
    fn initialize_fails_if_state_dir_exists_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        fs::create_dir_all(&cfg.state_dir).unwrap();
        let mut reg = GroupRegistry::new(&cfg);
        assert!(matches!(reg.initialize(), Err(BrokerError::Io(_))));
    }

    #[test]
    fn state_dir_is_created_with_expected_mode() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("groups");
        let mut cfg = config_in(&state_dir);
        cfg.state_dir = state_dir.clone();
        let mut reg = GroupRegistry::new(&cfg);
        reg.initialize().unwrap();
        let mode = fs::metadata(&state_dir).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }
}
