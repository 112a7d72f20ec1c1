#![forbid(unsafe_code)]

//! Tokio service wrapping the sans-IO [`SocketFactory`].
//!
//! The factory's identifier tables are not safe for concurrent mutation, so this crate
//! confines them to a single spawned task and turns every cross-context entry point into
//! a message send onto that task's queue. Callers hold cloneable [`ServiceHandle`]s and
//! per-socket [`SocketHandle`]s; the provider-bound channel is abstracted behind
//! [`RequestTransport`].
//!
//! [`SocketFactory`]: gauze_rtc_sockets::SocketFactory

mod handle;
mod service;
mod transport;

pub use handle::{ResolveError, ServiceError, ServiceHandle, SocketEvent, SocketHandle};
pub use service::{RtcSocketService, ServiceConfig};
pub use transport::{RequestTransport, TransportError};

// Everything a service consumer needs without depending on the lower crates directly.
pub use gauze_rtc_protocol::{Limits, SocketOption};
pub use gauze_rtc_sockets::{
    FactoryConfig, PortRange, ProviderError, ProxyError, ResolverId, SendOptions, SocketId,
};
