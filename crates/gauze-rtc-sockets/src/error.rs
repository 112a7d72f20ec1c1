use thiserror::Error;

/// A failure reported by the provider (or synthesized from a transport failure),
/// terminal for the affected proxy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    /// Stable protocol error code (see `gauze_rtc_protocol::ERROR_CODE_*`).
    pub code: u16,
    pub message: String,
}

/// Local misuse or resource-limit errors.
///
/// These are the only errors the factory surfaces synchronously; everything the provider
/// reports arrives as a terminal [`Notification`](crate::Notification) instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// The proxy was closed (locally or by a terminal provider event); the operation was
    /// not forwarded.
    #[error("socket is already closed")]
    AlreadyClosed,

    #[error("packet too large: {len} > {max}")]
    PacketTooLarge { len: usize, max: usize },

    /// The pre-open send queue is full. The send is rejected; the socket stays usable and
    /// the queue drains once the provider confirms the open.
    #[error("send queue overflow: {queued} queued + {len} new > {max}")]
    QueueOverflow {
        queued: usize,
        len: usize,
        max: usize,
    },

    /// The socket table reached `FactoryConfig::max_sockets`.
    #[error("socket table full: {max} live sockets")]
    TableFull { max: usize },

    #[error("invalid port range: {min} > {max}")]
    InvalidPortRange { min: u16, max: u16 },
}
