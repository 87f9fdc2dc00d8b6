// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The single-threaded event reactor.
//!
//! One `mio::Poll` loop owns the listener, every connection, the group
//! registry and the dispatcher all on one thread: the registry and health
//! table may only be mutated from here, so there is no point splitting the
//! I/O loop onto its own thread behind a command/event channel the way a
//! multi-consumer transport would.

use crate::codec::parse_message;
use crate::config::BrokerConfig;
use crate::connection::Connection;
use crate::dispatcher;
use crate::error::{BrokerError, Result};
use crate::group::ListenerId;
use crate::registry::GroupRegistry;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
const CONNECTION_TOKEN_START: usize = 1;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_EVENTS: usize = 128;

/// Drives accept, read, and dispatch for the lifetime of the process.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<ListenerId, Connection>,
    next_token: usize,
    registry: GroupRegistry,
    max_message_size: usize,
    running: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let mut registry = GroupRegistry::new(config);
        registry.initialize()?;

        let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
            .parse()
            .expect("well-formed bind address");
        let mut listener = TcpListener::bind(addr)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            registry,
            max_message_size: config.max_message_size,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// A shared flag the caller can set from a signal handler to stop the
    /// loop at the next poll timeout.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Creates a group. There is no wire message for this: group creation
    /// is reached only through the out-of-scope external entry point (a
    /// CLI subcommand, an admin socket, whatever collaborator owns that
    /// surface), which calls through to here before or between `run()`
    /// calls.
    pub fn create_group(&mut self, name: &str) -> Result<()> {
        self.registry.create(name)
    }

    /// Runs the event loop until the shutdown flag is cleared.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BrokerError::Io(e)),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    token if event.is_readable() => self.handle_readable(token.0),
                    _ => {}
                }
            }
        }

        for (_, conn) in self.connections.drain() {
            dispatcher::unsubscribe_all(&mut self.registry, &conn);
        }
        Ok(())
    }

    /// The listener is level-triggered: drain every pending connection on
    /// each readiness notification, since a partially-drained backlog
    /// would otherwise not fire again.
    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote_addr)) => {
                    let id = self.next_token;
                    self.next_token += 1;
                    let token = Token(id);

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        tracing::warn!(error = %e, "failed to register accepted connection");
                        continue;
                    }

                    let _ = stream.set_nodelay(true);
                    // SAFETY: mio::net::TcpStream wraps a live, connected
                    // socket fd; SockRef::from borrows it without taking
                    // ownership, and set_keepalive issues a setsockopt
                    // call valid for any open stream socket.
                    let sock_ref = socket2::SockRef::from(&stream);
                    let _ = sock_ref.set_keepalive(true);

                    tracing::debug!(%remote_addr, id, "accepted connection");
                    self.connections.insert(
                        id,
                        Connection::new(stream, id, remote_addr, self.max_message_size),
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Client sockets are edge-triggered: drain every complete frame in a
    /// loop until a read would block, a clean close, or an error.
    fn handle_readable(&mut self, id: ListenerId) {
        loop {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };

            let decoded = {
                let Connection { reader, stream, .. } = conn;
                reader.decode(stream)
            };

            match decoded {
                Ok(Some(body)) => {
                    let raw_frame = crate::codec::encode_frame(&body);
                    match parse_message(&body) {
                        Ok(message) => dispatcher::dispatch(
                            &mut self.registry,
                            &mut self.connections,
                            id,
                            &raw_frame,
                            message,
                        ),
                        Err(e) => {
                            tracing::warn!(error = %e, id, "dropping malformed frame");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let reason = if e.kind() == io::ErrorKind::UnexpectedEof {
                        "connection closed by peer"
                    } else {
                        "read error"
                    };
                    tracing::debug!(id, reason, "closing connection");
                    self.close_connection(id);
                    return;
                }
            }
        }
    }

    fn close_connection(&mut self, id: ListenerId) {
        if let Some(mut conn) = self.connections.remove(&id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            dispatcher::unsubscribe_all(&mut self.registry, &conn);
        }
    }
}
