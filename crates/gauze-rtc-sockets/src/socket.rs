use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::alloc::SocketId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Udp,
    ServerTcp,
    ClientTcp,
}

/// Client-side view of the real socket's lifecycle.
///
/// `ClientTcp` walks `Connecting → ConnectedOrBound → Closed`; `Udp` and `ServerTcp` are
/// created directly in `ConnectedOrBound` (the bind is asynchronous on the provider side;
/// a later failure arrives as a terminal event). `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Init,
    Connecting,
    ConnectedOrBound,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedPacket {
    pub dest: Option<SocketAddr>,
    pub packet_id: u64,
    pub dscp: u8,
    pub payload: Vec<u8>,
}

/// Client-side stand-in for a real socket owned by the provider.
///
/// Proxy sockets are owned exclusively by the factory's table; callers hold only the
/// [`SocketId`] and observe the proxy through notifications. Sends issued before the
/// provider's open confirmation are queued (bounded) and flushed in submission order.
#[derive(Debug)]
pub struct ProxySocket {
    id: SocketId,
    kind: SocketKind,
    state: SocketState,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,

    open_confirmed: bool,
    pub(crate) queued: VecDeque<QueuedPacket>,
    pub(crate) queued_bytes: usize,
}

impl ProxySocket {
    pub(crate) fn new(
        id: SocketId,
        kind: SocketKind,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        // The optimistic initial state is a deliberate latency trade-off: server and
        // datagram sockets are usable immediately, and a bind failure surfaces later as a
        // terminal event. Data is still held back until the open confirmation.
        let state = match kind {
            SocketKind::ClientTcp => SocketState::Connecting,
            SocketKind::Udp | SocketKind::ServerTcp => SocketState::ConnectedOrBound,
        };
        Self {
            id,
            kind,
            state,
            local_addr,
            remote_addr,
            open_confirmed: false,
            queued: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// True once the provider confirmed the socket is open/bound; sends before this point
    /// are queued.
    pub fn is_open_confirmed(&self) -> bool {
        self.open_confirmed
    }

    pub(crate) fn mark_opened(&mut self, confirmed_local: SocketAddr) {
        self.local_addr = confirmed_local;
        self.state = SocketState::ConnectedOrBound;
        self.open_confirmed = true;
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = SocketState::Closed;
        self.queued.clear();
        self.queued_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    #[test]
    fn client_tcp_starts_connecting_and_opens() {
        let mut socket = ProxySocket::new(
            crate::IdAllocator::new().next_socket_id(),
            SocketKind::ClientTcp,
            addr(0),
            Some(addr(443)),
        );
        assert_eq!(socket.state(), SocketState::Connecting);
        assert!(!socket.is_open_confirmed());

        socket.mark_opened(addr(50000));
        assert_eq!(socket.state(), SocketState::ConnectedOrBound);
        assert_eq!(socket.local_addr(), addr(50000));
        assert!(socket.is_open_confirmed());
    }

    #[test]
    fn datagram_socket_is_optimistically_bound_but_unconfirmed() {
        let socket = ProxySocket::new(
            crate::IdAllocator::new().next_socket_id(),
            SocketKind::Udp,
            addr(0),
            None,
        );
        assert_eq!(socket.state(), SocketState::ConnectedOrBound);
        assert!(!socket.is_open_confirmed());
    }
}
