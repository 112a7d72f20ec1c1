use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use gauze_rtc_protocol::{decode_frame_with_limits, Event, Limits, Request, SocketOption};
use gauze_rtc_sockets::{
    Action, FactoryConfig, Notification, PortRange, ResolverId, SendOptions, SocketFactory,
    SocketId,
};

use crate::handle::{CreateReply, ResolveReply, ServiceHandle, SocketEvent};
use crate::transport::RequestTransport;

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub factory: FactoryConfig,
    /// Frame limits for both directions of the provider channel.
    pub limits: Limits,
}

#[derive(Debug)]
pub(crate) enum Command {
    CreateDatagram {
        bind: SocketAddr,
        ports: PortRange,
        reply: CreateReply,
    },
    CreateServer {
        bind: SocketAddr,
        ports: PortRange,
        options: u32,
        reply: CreateReply,
    },
    CreateClient {
        local: SocketAddr,
        remote: SocketAddr,
        options: u32,
        reply: CreateReply,
    },
    Send {
        id: SocketId,
        payload: Vec<u8>,
        dest: Option<SocketAddr>,
        opts: SendOptions,
    },
    SetOption {
        id: SocketId,
        option: SocketOption,
        value: i32,
    },
    Close {
        id: SocketId,
    },
    Resolve {
        query: String,
        reply: ResolveReply,
    },
}

/// The running service task plus the means to stop it.
///
/// The spawned task is the designated execution context for the identifier tables; it is
/// the only code that ever touches the [`SocketFactory`].
pub struct RtcSocketService {
    handle: ServiceHandle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RtcSocketService {
    /// Spawn the service onto the current tokio runtime.
    ///
    /// `inbound` carries raw frames from the provider (one frame per message); frames
    /// that fail to decode are dropped with a warning.
    pub fn spawn(
        cfg: ServiceConfig,
        transport: impl RequestTransport,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let actor = Actor {
            factory: SocketFactory::new(cfg.factory),
            transport,
            limits: cfg.limits,
            socket_events: HashMap::new(),
            resolutions: HashMap::new(),
        };
        let task = tokio::spawn(actor.run(cmd_rx, inbound, shutdown_rx));

        Self {
            handle: ServiceHandle { cmd_tx },
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RtcSocketService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Actor<T: RequestTransport> {
    factory: SocketFactory,
    transport: T,
    limits: Limits,
    socket_events: HashMap<SocketId, mpsc::UnboundedSender<SocketEvent>>,
    resolutions: HashMap<ResolverId, ResolveReply>,
}

impl<T: RequestTransport> Actor<T> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut inbound_open = true;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // All handles dropped; nothing can reach the tables anymore.
                    None => break,
                },
                frame = inbound.recv(), if inbound_open => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => {
                        // The provider stopped talking. Local operations keep working;
                        // outbound failures surface per request.
                        tracing::debug!("inbound provider channel closed");
                        inbound_open = false;
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::CreateDatagram { bind, ports, reply } => {
                let created = self.factory.create_datagram_socket(bind, ports);
                self.finish_create(created, reply);
            }
            Command::CreateServer {
                bind,
                ports,
                options,
                reply,
            } => {
                let created = self.factory.create_server_socket(bind, ports, options);
                self.finish_create(created, reply);
            }
            Command::CreateClient {
                local,
                remote,
                options,
                reply,
            } => {
                let created = self.factory.create_client_socket(local, remote, options);
                self.finish_create(created, reply);
            }
            Command::Send {
                id,
                payload,
                dest,
                opts,
            } => match self.factory.send(id, payload, dest, opts) {
                Ok(actions) => self.process(actions),
                Err(err) => {
                    if let Some(tx) = self.socket_events.get(&id) {
                        let _ = tx.send(SocketEvent::SendRejected {
                            packet_id: opts.packet_id,
                            error: err,
                        });
                    } else {
                        tracing::debug!(%id, "send rejected: {err}");
                    }
                }
            },
            Command::SetOption { id, option, value } => {
                match self.factory.set_option(id, option, value) {
                    Ok(actions) => self.process(actions),
                    // A set_option racing with a close is expected; nothing to deliver.
                    Err(err) => tracing::debug!(%id, "set_option rejected: {err}"),
                }
            }
            Command::Close { id } => {
                self.socket_events.remove(&id);
                let actions = self.factory.close(id);
                self.process(actions);
            }
            Command::Resolve { query, reply } => {
                let (id, actions) = self.factory.create_resolver(query);
                // Register the waiter before processing so a synthesized transport
                // failure can still find it.
                self.resolutions.insert(id, reply);
                self.process(actions);
            }
        }
    }

    fn finish_create(
        &mut self,
        created: Result<(SocketId, Vec<Action>), gauze_rtc_sockets::ProxyError>,
        reply: CreateReply,
    ) {
        match created {
            Ok((id, actions)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.socket_events.insert(id, tx);
                self.process(actions);
                if reply.send(Ok((id, rx))).is_err() {
                    // The owner vanished before learning the identifier; reclaim the
                    // table entry so it cannot leak.
                    self.socket_events.remove(&id);
                    let actions = self.factory.close(id);
                    self.process(actions);
                }
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn handle_frame(&mut self, bytes: Vec<u8>) {
        let frame = match decode_frame_with_limits(&bytes, &self.limits) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("dropping malformed frame: {err}");
                return;
            }
        };
        let event = match Event::decode(&frame) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(
                    msg_type = frame.msg_type,
                    id = frame.id,
                    "dropping undecodable event: {err}"
                );
                return;
            }
        };
        let actions = self.factory.handle_event(event);
        self.process(actions);
    }

    fn process(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SendRequest(request) => self.forward(request),
                Action::Notify(notification) => self.notify(notification),
            }
        }
    }

    fn forward(&mut self, request: Request) {
        let frame = match request.encode_with_limits(&self.limits) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(id = request.id(), "failed to encode request: {err}");
                let actions = self.factory.handle_transport_failure(&request);
                self.process(actions);
                return;
            }
        };
        if let Err(err) = self.transport.send(frame) {
            tracing::warn!(id = request.id(), "transport send failed: {err}");
            let actions = self.factory.handle_transport_failure(&request);
            self.process(actions);
        }
    }

    fn notify(&mut self, notification: Notification) {
        match notification {
            Notification::SocketOpened { id, local } => {
                self.deliver(id, SocketEvent::Opened { local });
            }
            Notification::SocketFailed { id, error } => {
                self.deliver(id, SocketEvent::Failed { error });
                self.socket_events.remove(&id);
            }
            Notification::PacketSent {
                id,
                packet_id,
                send_time_ms,
            } => {
                self.deliver(
                    id,
                    SocketEvent::Sent {
                        packet_id,
                        send_time_ms,
                    },
                );
            }
            Notification::PacketReceived {
                id,
                payload,
                source,
                timestamp_ms,
            } => {
                self.deliver(
                    id,
                    SocketEvent::Data {
                        payload,
                        source,
                        timestamp_ms,
                    },
                );
            }
            Notification::SocketClosed { id } => {
                self.deliver(id, SocketEvent::Closed);
                self.socket_events.remove(&id);
            }
            Notification::Resolved { id, addresses } => {
                if let Some(reply) = self.resolutions.remove(&id) {
                    let _ = reply.send(Ok(addresses));
                }
            }
            Notification::ResolutionFailed { id, error } => {
                if let Some(reply) = self.resolutions.remove(&id) {
                    let _ = reply.send(Err(error));
                }
            }
        }
    }

    fn deliver(&self, id: SocketId, event: SocketEvent) {
        if let Some(tx) = self.socket_events.get(&id) {
            // A dead receiver means the handle is mid-drop; its Close command will
            // clean up the entry.
            let _ = tx.send(event);
        }
    }
}
