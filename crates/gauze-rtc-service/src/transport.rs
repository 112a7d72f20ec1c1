use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport send failed: {reason}")]
pub struct TransportError {
    pub reason: String,
}

/// Provider-bound half of the message channel.
///
/// Implementations (IPC pipes, WebSockets, in-process queues) must deliver frames
/// reliably and in the order sent; the routing protocol relies on a creation frame
/// reaching the provider before any operation frame for the same identifier.
///
/// A send failure has no synchronous error path at the call sites above: the service
/// folds it back into the tables as a terminal failure event for the identifier the
/// frame addressed.
pub trait RequestTransport: Send + 'static {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// In-process transport for tests and same-process providers.
impl RequestTransport for tokio::sync::mpsc::UnboundedSender<Vec<u8>> {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        tokio::sync::mpsc::UnboundedSender::send(self, frame).map_err(|_| TransportError {
            reason: "provider channel closed".to_owned(),
        })
    }
}
