// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Liveness tracking for group members.
//!
//! A record is created on first JOIN and refreshed by JOIN and HEALTHCHECK.
//! Nothing in this module ever removes a record; reaping stale entries is
//! left to a future extension (see [`HealthTable::last_seen`] doc).

use crate::index::KeyedIndex;
use std::time::Instant;

/// Last-seen timestamp for one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct HealthRecord {
    last_seen: Instant,
}

impl HealthRecord {
    fn now() -> Self {
        Self {
            last_seen: Instant::now(),
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Endpoint → last-seen-timestamp table.
///
/// Process-local and never persisted: a restart loses all liveness state,
/// which is consistent with the member list itself being the durable
/// source of truth.
#[derive(Debug, Default)]
pub struct HealthTable {
    records: KeyedIndex<HealthRecord>,
}

impl HealthTable {
    pub fn new() -> Self {
        Self {
            records: KeyedIndex::new(),
        }
    }

    /// Sets `endpoint`'s timestamp to now, creating a record if absent.
    pub fn touch(&mut self, endpoint: &str) {
        if let Some(record) = self.records.get_mut(endpoint) {
            *record = HealthRecord::now();
        } else {
            self.records.insert(endpoint, HealthRecord::now());
        }
    }

    /// Looks up a record without mutating it.
    ///
    /// Absence is not an error: a member with no record yet is treated as
    /// "unknown, alive until first healthcheck" by the dispatcher.
    pub fn last_seen(&self, endpoint: &str) -> Option<Instant> {
        self.records.get(endpoint).map(HealthRecord::last_seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_creates_and_refreshes_record() {
        let mut table = HealthTable::new();
        assert!(table.last_seen("1.2.3.4:80").is_none());
        table.touch("1.2.3.4:80");
        let first = table.last_seen("1.2.3.4:80").unwrap();
        table.touch("1.2.3.4:80");
        let second = table.last_seen("1.2.3.4:80").unwrap();
        assert!(second >= first);
    }

    #[test]
    fn records_are_independent_per_endpoint() {
        let mut table = HealthTable::new();
        table.touch("1.2.3.4:80");
        assert!(table.last_seen("5.6.7.8:90").is_none());
    }
}
