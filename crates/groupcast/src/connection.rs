// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection state.
//!
//! Each accepted socket owns its own [`FrameReader`] and a reverse index of
//! the groups it has subscribed to. The reverse index is what lets
//! teardown on connection close run in O(groups-subscribed-to) instead of
//! scanning every group in the registry — the source's global fd-keyed
//! side table did the latter and is explicitly not reproduced here.

use crate::codec::FrameReader;
use crate::group::ListenerId;
use mio::net::TcpStream;
use std::collections::HashSet;
use std::net::SocketAddr;

pub struct Connection {
    pub stream: TcpStream,
    pub id: ListenerId,
    pub remote_addr: SocketAddr,
    pub reader: FrameReader,
    /// Groups this connection is currently subscribed to as a listener.
    pub subscribed_groups: HashSet<String>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        id: ListenerId,
        remote_addr: SocketAddr,
        max_message_size: usize,
    ) -> Self {
        Self {
            stream,
            id,
            remote_addr,
            reader: FrameReader::new(max_message_size),
            subscribed_groups: HashSet::new(),
        }
    }

    pub fn note_subscribed(&mut self, group: &str) {
        self.subscribed_groups.insert(group.to_string());
    }

    pub fn note_unsubscribed(&mut self, group: &str) {
        self.subscribed_groups.remove(group);
    }
}
