use crate::alloc::ResolverId;

/// Client-side stand-in for an asynchronous name-resolution request.
///
/// A resolver has no operations beyond construction; it waits in the factory's table for
/// its single terminal event (`Resolved` or `ResolutionFailed`) and is removed when that
/// event is delivered.
#[derive(Debug)]
pub struct ProxyResolver {
    id: ResolverId,
    query: String,
}

impl ProxyResolver {
    pub(crate) fn new(id: ResolverId, query: String) -> Self {
        Self { id, query }
    }

    pub fn id(&self) -> ResolverId {
        self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}
