// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routes a decoded [`Message`] to the matching registry/health operation
//! and performs the BROADCAST fan-out.
//!
//! All but `IoError` are protocol-level: they are logged and produce no
//! reply, per the error handling design. `BROADCAST`'s fan-out snapshots
//! the listener set before writing so a write-triggered disconnect cannot
//! mutate the set being iterated.

use crate::codec::{encode_frame, Message};
use crate::connection::Connection;
use crate::error::BrokerError;
use crate::group::ListenerId;
use crate::registry::GroupRegistry;
use std::collections::HashMap;
use std::io::{self, Write};

/// Dispatches one decoded message arriving on `from`.
///
/// `raw_frame` is the complete frame as received (length prefix included)
/// and is only used by BROADCAST, which retransmits it to listeners
/// byte-for-byte rather than re-encoding.
pub fn dispatch(
    registry: &mut GroupRegistry,
    connections: &mut HashMap<ListenerId, Connection>,
    from: ListenerId,
    raw_frame: &[u8],
    message: Message,
) {
    match message {
        Message::Join { group, endpoint } => {
            if let Err(e) = registry.join(&group, &endpoint) {
                tracing::warn!(%group, %endpoint, error = %e, "JOIN failed");
            }
        }
        Message::Leave { group, endpoint } => {
            if let Err(e) = registry.leave(&group, &endpoint) {
                tracing::warn!(%group, %endpoint, error = %e, "LEAVE failed");
            }
        }
        Message::Subscribe { group } => match registry.subscribe(&group, from) {
            Ok(()) => {
                if let Some(conn) = connections.get_mut(&from) {
                    conn.note_subscribed(&group);
                }
            }
            Err(e) => tracing::warn!(%group, error = %e, "SUBSCRIBE failed"),
        },
        Message::Healthcheck { group, endpoint } => {
            if let Err(e) = registry.healthcheck(&group, &endpoint) {
                tracing::warn!(%group, %endpoint, error = %e, "HEALTHCHECK failed");
            }
        }
        Message::ListMembers { group } => match registry.members(&group) {
            Ok(members) => {
                let frame = encode_frame(members);
                if let Some(conn) = connections.get_mut(&from) {
                    let _ = conn.stream.write_all(&frame);
                }
            }
            Err(e) => tracing::warn!(%group, error = %e, "LISTMEMBERS failed"),
        },
        Message::Broadcast { group, payload: _ } => {
            broadcast(registry, connections, &group, raw_frame);
        }
    }
}

/// Errors that come back from broadcasting are handled here rather than
/// through the normal `Result` path: per-listener failures never abort
/// the fan-out, so there is nothing for the caller to propagate.
fn broadcast(
    registry: &mut GroupRegistry,
    connections: &mut HashMap<ListenerId, Connection>,
    group: &str,
    raw_frame: &[u8],
) {
    let listeners = match registry.listeners_snapshot(group) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(%group, error = %e, "BROADCAST failed");
            return;
        }
    };

    let mut broken = Vec::new();
    for listener in listeners {
        let Some(conn) = connections.get_mut(&listener) else {
            continue;
        };
        match conn.stream.write(raw_frame) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => broken.push(listener),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Slow consumer: payload dropped for this listener, no
                // buffering, no retry (see dispatcher design notes).
            }
            Err(_) => {
                // Other transient write errors are also best-effort drops.
            }
        }
    }

    for listener in broken {
        let _ = registry.unsubscribe(group, listener);
        if let Some(conn) = connections.get_mut(&listener) {
            conn.note_unsubscribed(group);
        }
    }
}

/// Used by the reactor's connection-close path to tear down every group a
/// connection subscribed to, in O(groups-subscribed-to) rather than a full
/// registry scan.
pub fn unsubscribe_all(registry: &mut GroupRegistry, conn: &Connection) {
    for group in &conn.subscribed_groups {
        if let Err(BrokerError::NotFound(_)) = registry.unsubscribe(group, conn.id) {
            // Group may have been deleted already; nothing left to do.
        }
    }
}
