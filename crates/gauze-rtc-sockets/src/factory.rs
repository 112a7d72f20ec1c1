use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use gauze_rtc_protocol::{Event, Request, SocketOption, ERROR_CODE_TRANSPORT_FAILURE};

use crate::alloc::{IdAllocator, ResolverId, SocketId};
use crate::error::{ProviderError, ProxyError};
use crate::resolver::ProxyResolver;
use crate::socket::{ProxySocket, QueuedPacket, SocketKind};

/// Inclusive port range constraint for provider-side binding. `0..=0` means "any port".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub const ANY: PortRange = PortRange { min: 0, max: 0 };
}

impl Default for PortRange {
    fn default() -> Self {
        Self::ANY
    }
}

/// Per-send options carried to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Caller-supplied identifier echoed back in the `Sent` notification, correlating a
    /// send with its asynchronous completion.
    pub packet_id: u64,
    pub dscp: u8,
}

#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Maximum number of concurrent proxy sockets tracked by the factory.
    ///
    /// When exceeded, new creations fail locally with [`ProxyError::TableFull`] and no
    /// identifier is allocated.
    pub max_sockets: usize,

    /// Maximum payload size accepted by [`SocketFactory::send`].
    pub max_packet_len: usize,

    /// Maximum number of payload bytes queued per socket while the provider has not yet
    /// confirmed the open.
    ///
    /// When exceeded, further sends are rejected with [`ProxyError::QueueOverflow`] until
    /// the open confirmation drains the queue.
    pub max_queued_bytes_per_socket: usize,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_sockets: 1024,
            max_packet_len: 64 * 1024,
            max_queued_bytes_per_socket: 256 * 1024,
        }
    }
}

/// Best-effort counters, readable at any time from the owning context.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FactoryStats {
    pub sockets_created: u64,
    pub resolvers_created: u64,
    pub requests_emitted: u64,
    pub events_routed: u64,
    pub events_dropped: u64,
}

/// Something the factory's caller must do after a mutating call.
///
/// The factory performs no I/O itself; the embedding service forwards `SendRequest`
/// frames to the provider-bound channel and delivers `Notify` values to the proxy's
/// owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendRequest(Request),
    Notify(Notification),
}

/// Owner-facing notification produced by routing a provider event (or a synthesized
/// terminal failure) to its proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    SocketOpened {
        id: SocketId,
        local: SocketAddr,
    },
    SocketFailed {
        id: SocketId,
        error: ProviderError,
    },
    PacketSent {
        id: SocketId,
        packet_id: u64,
        send_time_ms: u64,
    },
    PacketReceived {
        id: SocketId,
        payload: Vec<u8>,
        source: SocketAddr,
        timestamp_ms: u64,
    },
    SocketClosed {
        id: SocketId,
    },
    Resolved {
        id: ResolverId,
        addresses: Vec<IpAddr>,
    },
    ResolutionFailed {
        id: ResolverId,
        error: ProviderError,
    },
}

/// Owner of the identifier tables: the sole entry point for creating proxies and the sole
/// dispatcher of inbound events to the correct proxy by identifier.
///
/// Not safe for concurrent mutation; the embedding service must confine it to one task.
#[derive(Debug)]
pub struct SocketFactory {
    cfg: FactoryConfig,
    alloc: IdAllocator,
    sockets: HashMap<SocketId, ProxySocket>,
    resolvers: HashMap<ResolverId, ProxyResolver>,
    stats: FactoryStats,
}

impl SocketFactory {
    pub fn new(cfg: FactoryConfig) -> Self {
        Self {
            cfg,
            alloc: IdAllocator::new(),
            sockets: HashMap::new(),
            resolvers: HashMap::new(),
            stats: FactoryStats::default(),
        }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.cfg
    }

    pub fn stats(&self) -> FactoryStats {
        self.stats
    }

    pub fn socket(&self, id: SocketId) -> Option<&ProxySocket> {
        self.sockets.get(&id)
    }

    pub fn resolver(&self, id: ResolverId) -> Option<&ProxyResolver> {
        self.resolvers.get(&id)
    }

    pub fn live_sockets(&self) -> usize {
        self.sockets.len()
    }

    pub fn live_resolvers(&self) -> usize {
        self.resolvers.len()
    }

    /// Create a datagram socket bound to `bind` (port possibly constrained by `ports`).
    ///
    /// The proxy is optimistically `ConnectedOrBound`; a provider-side bind failure
    /// arrives later as a terminal `SocketFailed` notification.
    pub fn create_datagram_socket(
        &mut self,
        bind: SocketAddr,
        ports: PortRange,
    ) -> Result<(SocketId, Vec<Action>), ProxyError> {
        self.check_creation(ports)?;
        let id = self.alloc.next_socket_id();
        self.sockets
            .insert(id, ProxySocket::new(id, SocketKind::Udp, bind, None));
        self.stats.sockets_created += 1;
        let req = self.request(Request::CreateUdpSocket {
            id: id.get(),
            bind,
            min_port: ports.min,
            max_port: ports.max,
        });
        Ok((id, vec![req]))
    }

    /// Create a listening TCP socket bound to `bind`.
    pub fn create_server_socket(
        &mut self,
        bind: SocketAddr,
        ports: PortRange,
        options: u32,
    ) -> Result<(SocketId, Vec<Action>), ProxyError> {
        self.check_creation(ports)?;
        let id = self.alloc.next_socket_id();
        self.sockets
            .insert(id, ProxySocket::new(id, SocketKind::ServerTcp, bind, None));
        self.stats.sockets_created += 1;
        let req = self.request(Request::CreateServerTcpSocket {
            id: id.get(),
            bind,
            min_port: ports.min,
            max_port: ports.max,
            options,
        });
        Ok((id, vec![req]))
    }

    /// Create an outbound TCP socket; the proxy stays `Connecting` (sends queued) until
    /// the provider reports `Opened`.
    pub fn create_client_socket(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        options: u32,
    ) -> Result<(SocketId, Vec<Action>), ProxyError> {
        self.check_creation(PortRange::ANY)?;
        let id = self.alloc.next_socket_id();
        self.sockets.insert(
            id,
            ProxySocket::new(id, SocketKind::ClientTcp, local, Some(remote)),
        );
        self.stats.sockets_created += 1;
        let req = self.request(Request::CreateClientTcpSocket {
            id: id.get(),
            local,
            remote,
            options,
        });
        Ok((id, vec![req]))
    }

    /// Queue or forward a packet. `accepted` here means enqueued for transmission; actual
    /// completion is reported asynchronously via a `PacketSent` notification carrying
    /// `opts.packet_id`.
    pub fn send(
        &mut self,
        id: SocketId,
        payload: Vec<u8>,
        dest: Option<SocketAddr>,
        opts: SendOptions,
    ) -> Result<Vec<Action>, ProxyError> {
        if payload.len() > self.cfg.max_packet_len {
            return Err(ProxyError::PacketTooLarge {
                len: payload.len(),
                max: self.cfg.max_packet_len,
            });
        }
        let max_queued = self.cfg.max_queued_bytes_per_socket;
        let socket = self.sockets.get_mut(&id).ok_or(ProxyError::AlreadyClosed)?;

        if !socket.is_open_confirmed() {
            if socket.queued_bytes + payload.len() > max_queued {
                return Err(ProxyError::QueueOverflow {
                    queued: socket.queued_bytes,
                    len: payload.len(),
                    max: max_queued,
                });
            }
            socket.queued_bytes += payload.len();
            socket.queued.push_back(QueuedPacket {
                dest,
                packet_id: opts.packet_id,
                dscp: opts.dscp,
                payload,
            });
            return Ok(Vec::new());
        }

        Ok(vec![self.request(Request::SendPacket {
            id: id.get(),
            dest,
            packet_id: opts.packet_id,
            dscp: opts.dscp,
            payload,
        })])
    }

    pub fn set_option(
        &mut self,
        id: SocketId,
        option: SocketOption,
        value: i32,
    ) -> Result<Vec<Action>, ProxyError> {
        if !self.sockets.contains_key(&id) {
            return Err(ProxyError::AlreadyClosed);
        }
        Ok(vec![self.request(Request::SetOption {
            id: id.get(),
            option,
            value,
        })])
    }

    /// Close a proxy socket: immediate and unconditional on the client side, eventual on
    /// the provider side. Idempotent; closing an absent identifier emits nothing.
    pub fn close(&mut self, id: SocketId) -> Vec<Action> {
        match self.sockets.remove(&id) {
            Some(mut socket) => {
                socket.mark_closed();
                vec![self.request(Request::Close { id: id.get() })]
            }
            None => Vec::new(),
        }
    }

    /// Register a pending resolution for `query` and request it from the provider.
    pub fn create_resolver(&mut self, query: impl Into<String>) -> (ResolverId, Vec<Action>) {
        let query = query.into();
        let id = self.alloc.next_resolver_id();
        self.resolvers
            .insert(id, ProxyResolver::new(id, query.clone()));
        self.stats.resolvers_created += 1;
        let req = self.request(Request::CreateResolver {
            id: id.get(),
            query,
        });
        (id, vec![req])
    }

    /// Route a provider event to the proxy it addresses.
    ///
    /// Events for identifiers no longer in the tables are dropped silently: close
    /// messages legitimately cross in flight with in-transit events, so a miss is an
    /// expected race, not an error.
    pub fn handle_event(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Opened { id, local } => {
                let sid = match self.socket_id(id, "Opened") {
                    Some(sid) => sid,
                    None => return Vec::new(),
                };
                let socket = match self.sockets.get_mut(&sid) {
                    Some(s) => s,
                    None => return Vec::new(),
                };
                socket.mark_opened(local);
                let flushed: Vec<QueuedPacket> = socket.queued.drain(..).collect();
                socket.queued_bytes = 0;
                self.stats.events_routed += 1;

                let mut out = vec![Action::Notify(Notification::SocketOpened {
                    id: sid,
                    local,
                })];
                for packet in flushed {
                    out.push(self.request(Request::SendPacket {
                        id: sid.get(),
                        dest: packet.dest,
                        packet_id: packet.packet_id,
                        dscp: packet.dscp,
                        payload: packet.payload,
                    }));
                }
                out
            }
            Event::ConnectionFailed { id, code, message } => {
                let sid = match self.socket_id(id, "ConnectionFailed") {
                    Some(sid) => sid,
                    None => return Vec::new(),
                };
                let Some(mut socket) = self.sockets.remove(&sid) else {
                    return Vec::new();
                };
                socket.mark_closed();
                self.stats.events_routed += 1;
                vec![Action::Notify(Notification::SocketFailed {
                    id: sid,
                    error: ProviderError { code, message },
                })]
            }
            Event::SentConfirmation {
                id,
                packet_id,
                send_time_ms,
            } => {
                let sid = match self.socket_id(id, "SentConfirmation") {
                    Some(sid) => sid,
                    None => return Vec::new(),
                };
                self.stats.events_routed += 1;
                vec![Action::Notify(Notification::PacketSent {
                    id: sid,
                    packet_id,
                    send_time_ms,
                })]
            }
            Event::DataReceived {
                id,
                source,
                timestamp_ms,
                payload,
            } => {
                let sid = match self.socket_id(id, "DataReceived") {
                    Some(sid) => sid,
                    None => return Vec::new(),
                };
                self.stats.events_routed += 1;
                vec![Action::Notify(Notification::PacketReceived {
                    id: sid,
                    payload,
                    source,
                    timestamp_ms,
                })]
            }
            Event::RemoteClosed { id } => {
                let sid = match self.socket_id(id, "RemoteClosed") {
                    Some(sid) => sid,
                    None => return Vec::new(),
                };
                let Some(mut socket) = self.sockets.remove(&sid) else {
                    return Vec::new();
                };
                socket.mark_closed();
                self.stats.events_routed += 1;
                vec![Action::Notify(Notification::SocketClosed { id: sid })]
            }
            Event::Resolved { id, addresses } => {
                let rid = match self.resolver_id(id, "Resolved") {
                    Some(rid) => rid,
                    None => return Vec::new(),
                };
                self.resolvers.remove(&rid);
                self.stats.events_routed += 1;
                vec![Action::Notify(Notification::Resolved { id: rid, addresses })]
            }
            Event::ResolutionFailed { id, code, message } => {
                let rid = match self.resolver_id(id, "ResolutionFailed") {
                    Some(rid) => rid,
                    None => return Vec::new(),
                };
                self.resolvers.remove(&rid);
                self.stats.events_routed += 1;
                vec![Action::Notify(Notification::ResolutionFailed {
                    id: rid,
                    error: ProviderError { code, message },
                })]
            }
        }
    }

    /// Fold a transport-level send failure back into the tables.
    ///
    /// The protocol has no synchronous error path: an undeliverable request is treated
    /// exactly like a terminal `ConnectionFailed`/`ResolutionFailed` event for the
    /// identifier the request addressed.
    pub fn handle_transport_failure(&mut self, request: &Request) -> Vec<Action> {
        let error = ProviderError {
            code: ERROR_CODE_TRANSPORT_FAILURE,
            message: "request could not be delivered".to_owned(),
        };

        if let Request::CreateResolver { id, .. } = request {
            let Some(rid) = self.resolver_id(*id, "transport failure") else {
                return Vec::new();
            };
            self.resolvers.remove(&rid);
            return vec![Action::Notify(Notification::ResolutionFailed {
                id: rid,
                error,
            })];
        }

        // A failed Close is moot: the entry is already gone and the provider-side leak is
        // the provider's concern.
        let Some(sid) = self.socket_id(request.id(), "transport failure") else {
            return Vec::new();
        };
        let Some(mut socket) = self.sockets.remove(&sid) else {
            return Vec::new();
        };
        socket.mark_closed();
        vec![Action::Notify(Notification::SocketFailed { id: sid, error })]
    }

    fn check_creation(&self, ports: PortRange) -> Result<(), ProxyError> {
        if ports.min > ports.max {
            return Err(ProxyError::InvalidPortRange {
                min: ports.min,
                max: ports.max,
            });
        }
        if self.sockets.len() >= self.cfg.max_sockets {
            return Err(ProxyError::TableFull {
                max: self.cfg.max_sockets,
            });
        }
        Ok(())
    }

    fn request(&mut self, request: Request) -> Action {
        self.stats.requests_emitted += 1;
        Action::SendRequest(request)
    }

    fn socket_id(&mut self, raw: u64, context: &'static str) -> Option<SocketId> {
        let sid = SocketId::from_raw(raw);
        if !self.sockets.contains_key(&sid) {
            self.stats.events_dropped += 1;
            tracing::debug!(id = raw, context, "dropping event for unknown socket");
            return None;
        }
        Some(sid)
    }

    fn resolver_id(&mut self, raw: u64, context: &'static str) -> Option<ResolverId> {
        let rid = ResolverId::from_raw(raw);
        if !self.resolvers.contains_key(&rid) {
            self.stats.events_dropped += 1;
            tracing::debug!(id = raw, context, "dropping event for unknown resolver");
            return None;
        }
        Some(rid)
    }
}
