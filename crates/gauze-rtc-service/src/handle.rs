use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use gauze_rtc_protocol::SocketOption;
use gauze_rtc_sockets::{PortRange, ProviderError, ProxyError, SendOptions, SocketId};

use crate::service::Command;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service task has shut down; no further operations are possible.
    #[error("socket service has shut down")]
    ServiceClosed,

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("socket service has shut down")]
    ServiceClosed,

    #[error(transparent)]
    Provider(ProviderError),
}

/// Events delivered to a socket owner, in the order the provider produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The provider confirmed the socket is open/bound at `local`.
    Opened { local: SocketAddr },
    /// Terminal: the provider could not bind/connect, or a request for this socket could
    /// not be delivered at all.
    Failed { error: ProviderError },
    /// A previously accepted packet left the provider, correlated by `packet_id`.
    Sent { packet_id: u64, send_time_ms: u64 },
    Data {
        payload: Vec<u8>,
        source: SocketAddr,
        timestamp_ms: u64,
    },
    /// Terminal: the remote end closed the connection.
    Closed,
    /// A send was rejected locally before reaching the provider (queue overflow,
    /// oversized packet, or a race with a close).
    SendRejected { packet_id: u64, error: ProxyError },
}

pub(crate) type CreateReply =
    oneshot::Sender<Result<(SocketId, mpsc::UnboundedReceiver<SocketEvent>), ProxyError>>;
pub(crate) type ResolveReply = oneshot::Sender<Result<Vec<IpAddr>, ProviderError>>;

/// Cloneable entry point to the service task.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ServiceHandle {
    pub async fn create_datagram_socket(
        &self,
        bind: SocketAddr,
        ports: PortRange,
    ) -> Result<SocketHandle, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CreateDatagram { bind, ports, reply })
            .map_err(|_| ServiceError::ServiceClosed)?;
        self.finish_create(rx).await
    }

    pub async fn create_server_socket(
        &self,
        bind: SocketAddr,
        ports: PortRange,
        options: u32,
    ) -> Result<SocketHandle, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CreateServer {
                bind,
                ports,
                options,
                reply,
            })
            .map_err(|_| ServiceError::ServiceClosed)?;
        self.finish_create(rx).await
    }

    pub async fn create_client_socket(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        options: u32,
    ) -> Result<SocketHandle, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CreateClient {
                local,
                remote,
                options,
                reply,
            })
            .map_err(|_| ServiceError::ServiceClosed)?;
        self.finish_create(rx).await
    }

    /// Resolve `query` via the provider. The result is delivered exactly once; dropping
    /// the returned future abandons the resolution (late provider events for it are
    /// dropped by the routing tables).
    pub async fn resolve(&self, query: impl Into<String>) -> Result<Vec<IpAddr>, ResolveError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Resolve {
                query: query.into(),
                reply,
            })
            .map_err(|_| ResolveError::ServiceClosed)?;
        match rx.await {
            Ok(Ok(addresses)) => Ok(addresses),
            Ok(Err(err)) => Err(ResolveError::Provider(err)),
            Err(_) => Err(ResolveError::ServiceClosed),
        }
    }

    async fn finish_create(
        &self,
        rx: oneshot::Receiver<Result<(SocketId, mpsc::UnboundedReceiver<SocketEvent>), ProxyError>>,
    ) -> Result<SocketHandle, ServiceError> {
        match rx.await {
            Ok(Ok((id, events))) => Ok(SocketHandle {
                id,
                cmd_tx: self.cmd_tx.clone(),
                events,
                closed: false,
            }),
            Ok(Err(err)) => Err(ServiceError::Proxy(err)),
            Err(_) => Err(ServiceError::ServiceClosed),
        }
    }
}

/// Owner-side handle to one proxy socket.
///
/// The handle is the only reference the owner gets; the proxy itself lives in the
/// factory's table. Dropping the handle closes the socket.
#[derive(Debug)]
pub struct SocketHandle {
    id: SocketId,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    closed: bool,
}

impl SocketHandle {
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Enqueue a packet for transmission. Acceptance is optimistic: completion is
    /// reported later as [`SocketEvent::Sent`], local rejection as
    /// [`SocketEvent::SendRejected`].
    pub fn send(
        &self,
        payload: Vec<u8>,
        dest: Option<SocketAddr>,
        opts: SendOptions,
    ) -> Result<(), ServiceError> {
        if self.closed {
            return Err(ServiceError::Proxy(ProxyError::AlreadyClosed));
        }
        self.cmd_tx
            .send(Command::Send {
                id: self.id,
                payload,
                dest,
                opts,
            })
            .map_err(|_| ServiceError::ServiceClosed)
    }

    pub fn set_option(&self, option: SocketOption, value: i32) -> Result<(), ServiceError> {
        if self.closed {
            return Err(ServiceError::Proxy(ProxyError::AlreadyClosed));
        }
        self.cmd_tx
            .send(Command::SetOption {
                id: self.id,
                option,
                value,
            })
            .map_err(|_| ServiceError::ServiceClosed)
    }

    /// Close the socket: immediate locally, eventual on the provider side. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.cmd_tx.send(Command::Close { id: self.id });
    }

    /// Receive the next event for this socket. Returns `None` once the socket reached a
    /// terminal state and all pending events were drained.
    pub async fn recv_event(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cmd_tx.send(Command::Close { id: self.id });
        }
    }
}
