// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A single group: its mmap-backed, comma-terminated member list and its
//! volatile listener set.
//!
//! The on-disk format is a string-concatenation of `endpoint,` entries
//! followed by a trailing NUL, chosen for durability and grep-friendliness
//! over a restart. Growth doubles the file (`ftruncate`) and remaps it;
//! the mapping's base address is allowed to move on every grow, so no
//! pointer derived from an old mapping may outlive a `join`/`leave` call.

use crate::codec::{MAX_ENDPOINT_LEN, MAX_GROUP_NAME_LEN};
use crate::error::{BrokerError, Result};
use std::collections::HashSet;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

/// Identifies a listener by its reactor connection id.
pub type ListenerId = usize;

fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE takes no pointer arguments and
    // always returns a valid positive value on Linux.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// One named group: persisted members plus the connections subscribed to
/// receive its broadcasts.
pub struct Group {
    name: String,
    path: PathBuf,
    fd: RawFd,
    ptr: *mut u8,
    capacity: usize,
    /// Bytes of member data currently in use, not counting the trailing NUL.
    len: usize,
    /// Reconstructed from the mapped region on create/rehydrate; lets
    /// `join`/`leave` check membership in O(1) instead of re-scanning the
    /// mapping on every call.
    members: HashSet<String>,
    listeners: Vec<ListenerId>,
}

impl Group {
    /// Creates a new one-page backing file for `name` at `path`, or adopts
    /// it if it already exists (matching `create`'s "adopt if present"
    /// rule in the registry).
    pub fn create(name: &str, path: PathBuf) -> Result<Self> {
        if path.exists() {
            return Self::rehydrate(name, path);
        }
        let page = page_size();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&path)?;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid, open file descriptor from the OpenOptions
        // call above; page is a small positive size well within off_t range.
        let ret = unsafe { libc::ftruncate(fd, page as libc::off_t) };
        if ret < 0 {
            return Err(BrokerError::Io(io::Error::last_os_error()));
        }
        let ptr = map_file(fd, page)?;
        std::mem::forget(file); // fd ownership moves to Group; Drop closes it.
        Ok(Self {
            name: name.to_string(),
            path,
            fd,
            ptr,
            capacity: page,
            len: 0,
            members: HashSet::new(),
            listeners: Vec::new(),
        })
    }

    /// Opens an existing backing file and reconstructs `members` and `len`
    /// by scanning the mapped region for the first NUL and splitting the
    /// comma-terminated entries before it.
    ///
    /// Listeners are never reconstructed: they are anchored to live TCP
    /// connections, which do not survive a process restart.
    pub fn rehydrate(name: &str, path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let fd = file.as_raw_fd();
        let meta = file.metadata()?;
        let capacity = meta.len() as usize;
        let ptr = map_file(fd, capacity)?;
        std::mem::forget(file);

        // SAFETY: ptr/capacity describe the mapping just established above.
        let region = unsafe { std::slice::from_raw_parts(ptr, capacity) };
        let len = region.iter().position(|&b| b == 0).unwrap_or(capacity);
        let members = scan_members(&region[..len]);

        Ok(Self {
            name: name.to_string(),
            path,
            fd,
            ptr,
            capacity,
            len,
            members,
            listeners: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrowed byte view of the member list up to (not including) the
    /// first NUL. Invalidated by any subsequent `join`/`leave` call, which
    /// may move the mapping.
    pub fn members_view(&self) -> &[u8] {
        // SAFETY: ptr/len are maintained by this Group; len never exceeds
        // capacity, and the region was zero-initialized by ftruncate.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn is_member(&self, endpoint: &str) -> bool {
        self.members.contains(endpoint)
    }

    /// Appends `<endpoint>,` if `endpoint` is not already a member.
    /// Idempotent: returns `Ok(())` without writing if already present.
    pub fn join(&mut self, endpoint: &str) -> Result<()> {
        if endpoint.len() > MAX_ENDPOINT_LEN {
            return Err(BrokerError::TooLong {
                what: "endpoint",
                len: endpoint.len(),
                max: MAX_ENDPOINT_LEN,
            });
        }
        if self.members.contains(endpoint) {
            return Ok(());
        }
        let entry = format!("{endpoint},");
        let entry_bytes = entry.as_bytes();
        self.ensure_capacity(self.len + entry_bytes.len() + 1)?;

        let start = self.len;
        {
            let buf = self.as_mut_slice();
            buf[start..start + entry_bytes.len()].copy_from_slice(entry_bytes);
        }
        self.len += entry_bytes.len();
        self.members.insert(endpoint.to_string());
        Ok(())
    }

    /// Excises `<endpoint>,` and shifts the suffix left, zeroing the freed
    /// tail so the region stays a valid NUL-terminated string (I2).
    /// No-op if `endpoint` is not currently a member.
    pub fn leave(&mut self, endpoint: &str) -> Result<()> {
        if !self.members.contains(endpoint) {
            return Ok(());
        }
        let entry = format!("{endpoint},");
        let entry_bytes = entry.as_bytes();
        let pos = self
            .find_entry(entry_bytes)
            .expect("member index and mapped region disagree");
        let tail_start = pos + entry_bytes.len();
        let tail_len = self.len - tail_start;
        let new_len = self.len - entry_bytes.len();
        {
            let buf = self.as_mut_slice();
            buf.copy_within(tail_start..tail_start + tail_len, pos);
            for b in &mut buf[new_len..self.len] {
                *b = 0;
            }
        }
        self.len = new_len;
        self.members.remove(endpoint);
        Ok(())
    }

    /// Adds `listener` if not already present. Idempotent.
    pub fn subscribe(&mut self, listener: ListenerId) -> bool {
        if self.listeners.contains(&listener) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    /// Removes `listener`, preserving the insertion order of the rest
    /// (I4). Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, listener: ListenerId) -> bool {
        if let Some(idx) = self.listeners.iter().position(|l| *l == listener) {
            self.listeners.remove(idx);
            true
        } else {
            false
        }
    }

    /// Snapshot of the current listener set, in subscribe order. Callers
    /// take this snapshot before writing so that a write-triggered
    /// unsubscribe (broken pipe) doesn't mutate the set mid-iteration.
    pub fn listeners_snapshot(&self) -> Vec<ListenerId> {
        self.listeners.clone()
    }

    fn find_entry(&self, entry: &[u8]) -> Option<usize> {
        let hay = self.members_view();
        if entry.is_empty() || entry.len() > hay.len() {
            return None;
        }
        hay.windows(entry.len()).position(|w| w == entry)
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/capacity describe the live mapping exclusively owned
        // by this Group; `&mut self` rules out any other live reference.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.capacity) }
    }

    /// Doubles the backing file and remaps it until at least `needed`
    /// bytes are available, always landing on a whole page multiple.
    fn ensure_capacity(&mut self, needed: usize) -> Result<()> {
        while needed > self.capacity {
            let new_capacity = self.capacity * 2;
            // SAFETY: fd is the open file descriptor for this group's
            // backing file; new_capacity is a positive multiple of the
            // current capacity and fits in off_t for any realistic group.
            let ret = unsafe { libc::ftruncate(self.fd, new_capacity as libc::off_t) };
            if ret < 0 {
                return Err(BrokerError::Io(io::Error::last_os_error()));
            }
            // SAFETY: self.ptr/self.capacity describe the mapping
            // established by a prior map_file call; munmap is valid for
            // any mapping obtained from mmap and not yet unmapped.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.capacity);
            }
            self.ptr = map_file(self.fd, new_capacity)?;
            self.capacity = new_capacity;
        }
        Ok(())
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.capacity describe the current mapping,
        // established by map_file and never unmapped since; Drop runs
        // exactly once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.capacity);
            libc::close(self.fd);
        }
    }
}

fn map_file(fd: RawFd, size: usize) -> Result<*mut u8> {
    // SAFETY: fd is a valid, open file descriptor with at least `size`
    // bytes (the caller ftruncates before calling); PROT_READ|PROT_WRITE
    // and MAP_SHARED are valid flags for a read-write file-backed mapping;
    // mmap returns MAP_FAILED on error, checked below.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(BrokerError::Io(io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

fn scan_members(data: &[u8]) -> HashSet<String> {
    let mut set = HashSet::new();
    let mut start = 0;
    for (i, &b) in data.iter().enumerate() {
        if b == b',' {
            if let Ok(s) = std::str::from_utf8(&data[start..i]) {
                if !s.is_empty() {
                    set.insert(s.to_string());
                }
            }
            start = i + 1;
        }
    }
    set
}

/// Validates a group name per I1/I5: 1..255 bytes, no `/`, no NUL, and not
/// the reserved reset-marker name.
pub fn validate_group_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_GROUP_NAME_LEN {
        return Err(BrokerError::BadName(name.to_string()));
    }
    if name == ".lasttime" {
        return Err(BrokerError::BadName(name.to_string()));
    }
    if name.contains('/') || name.as_bytes().contains(&0) {
        return Err(BrokerError::BadName(name.to_string()));
    }
    // Reject names that escape the state directory or collide with a
    // CString embedding NUL, mirroring validate_name in the mmap-segment
    // style this module is grounded on.
    if CString::new(name).is_err() {
        return Err(BrokerError::BadName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn group_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join(name)
}

/// Minimum length of an `A.B.C.D:port` endpoint (`0.0.0.0:0`).
const MIN_ENDPOINT_FORMAT_LEN: usize = 9;

/// Maximum length of an `A.B.C.D:port` endpoint (`255.255.255.255:65535`).
const MAX_ENDPOINT_FORMAT_LEN: usize = 21;

/// Validates endpoint shape per spec §6: `A.B.C.D:port` in decimal,
/// 9..21 characters, charset `[0-9.:]`.
///
/// This is what keeps substring membership matching sound: an endpoint
/// containing a literal comma would be written straight into the
/// comma-delimited member region, and `Group::rehydrate`'s comma scan would
/// split it into two members on the next restart.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let len = endpoint.len();
    if len < MIN_ENDPOINT_FORMAT_LEN || len > MAX_ENDPOINT_FORMAT_LEN {
        return Err(BrokerError::BadName(endpoint.to_string()));
    }
    if !endpoint.bytes().all(|b| b.is_ascii_digit() || b == b'.' || b == b':') {
        return Err(BrokerError::BadName(endpoint.to_string()));
    }
    Ok(())
}
