use core::fmt;

/// Identifier of a proxy socket, unique for the lifetime of the owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(u64);

impl SocketId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Identifier of a pending proxy resolver, unique for the lifetime of the owning process.
///
/// Socket and resolver identifiers are separate namespaces; the same numeric value may be
/// live in both tables at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResolverId(u64);

impl ResolverId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResolverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resolver#{}", self.0)
    }
}

/// Monotonic identifier allocator, one counter per object class.
///
/// Identifiers start at 1 (0 is the protocol's "no identifier" sentinel) and are never
/// reused, even after the owning object is destroyed; reuse would let a late event for a
/// dead object be misrouted to a new one. One allocator instance is owned by each
/// [`SocketFactory`](crate::SocketFactory); there is no global state, which also keeps
/// identifier sequences deterministic in tests.
#[derive(Debug)]
pub struct IdAllocator {
    next_socket: u64,
    next_resolver: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_socket: 1,
            next_resolver: 1,
        }
    }

    pub fn next_socket_id(&mut self) -> SocketId {
        let id = self.next_socket;
        // 2^64 identifiers outlive any realistic process; exhaustion is fatal, not
        // recoverable.
        self.next_socket = id.checked_add(1).expect("socket identifier space exhausted");
        SocketId(id)
    }

    pub fn next_resolver_id(&mut self) -> ResolverId {
        let id = self.next_resolver;
        self.next_resolver = id
            .checked_add(1)
            .expect("resolver identifier space exhausted");
        ResolverId(id)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
