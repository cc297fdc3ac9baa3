//! Seam between a connection and the host reactor.
//!
//! The reactor is whatever owns the process's poll loop. A connection only
//! needs two things from it: interest in read and write readiness for one
//! socket switched on and off, and a readiness callback when either fires.
//! [`IoWatcher`] records what was last asked of the reactor so that the
//! connection's view and the reactor's registration never drift apart.

use std::fmt;

use tracing::trace;

/// Opaque socket descriptor. `-1` means unset.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(i64);

impl SocketHandle {
    pub const INVALID: SocketHandle = SocketHandle(-1);

    pub const fn new(raw: i64) -> Self {
        SocketHandle(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "SocketHandle({})", self.0)
        } else {
            write!(f, "SocketHandle(INVALID)")
        }
    }
}

#[cfg(unix)]
impl From<std::os::unix::io::RawFd> for SocketHandle {
    fn from(fd: std::os::unix::io::RawFd) -> Self {
        SocketHandle(fd as i64)
    }
}

/// Direction of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Interest flags indicating what I/O events to monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b10);

    /// Returns interest in both readable and writable events.
    pub const fn both() -> Self {
        Interest(0b11)
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    pub fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }

    fn of(direction: Direction) -> Self {
        match direction {
            Direction::Read => Self::READABLE,
            Direction::Write => Self::WRITABLE,
        }
    }
}

/// What a readiness callback reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const READABLE: Readiness = Readiness(0b001);
    pub const WRITABLE: Readiness = Readiness(0b010);
    /// The reactor reported an error condition on the socket.
    pub const ERROR: Readiness = Readiness(0b100);

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

/// Host reactor as seen by one connection.
pub trait Reactor {
    /// Begin delivering `direction` readiness for `socket`.
    fn start(&mut self, socket: SocketHandle, direction: Direction);

    /// Stop delivering `direction` readiness for `socket`.
    fn stop(&mut self, socket: SocketHandle, direction: Direction);

    /// Forget `socket` entirely. Called with both directions stopped and
    /// before the socket is closed, so the descriptor is still the one
    /// that was registered.
    fn release(&mut self, _socket: SocketHandle) {}
}

impl<R: Reactor + ?Sized> Reactor for &mut R {
    fn start(&mut self, socket: SocketHandle, direction: Direction) {
        (**self).start(socket, direction)
    }

    fn stop(&mut self, socket: SocketHandle, direction: Direction) {
        (**self).stop(socket, direction)
    }

    fn release(&mut self, socket: SocketHandle) {
        (**self).release(socket)
    }
}

/// Read and write watchers for one socket.
///
/// Starting a started watcher or stopping a stopped one is a no-op, so the
/// reactor sees exactly one call per actual change.
#[derive(Debug)]
pub struct IoWatcher<R> {
    reactor: R,
    socket: SocketHandle,
    interest: Interest,
}

impl<R: Reactor> IoWatcher<R> {
    pub fn new(reactor: R) -> Self {
        Self {
            reactor,
            socket: SocketHandle::INVALID,
            interest: Interest::NONE,
        }
    }

    /// Point both watchers at `socket`. Any interest on a previous socket is dropped first.
    pub fn attach(&mut self, socket: SocketHandle) {
        if self.socket != socket {
            self.detach();
        }
        self.socket = socket;
    }

    /// Stop both watchers and release the socket from the reactor.
    ///
    /// Must run while the socket is still open.
    pub fn detach(&mut self) {
        self.stop_all();
        if self.socket.is_valid() {
            trace!(socket = ?self.socket, "released");
            self.reactor.release(self.socket);
        }
        self.socket = SocketHandle::INVALID;
    }

    pub fn socket(&self) -> SocketHandle {
        self.socket
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn start_read(&mut self) {
        self.set(Direction::Read, true);
    }

    pub fn stop_read(&mut self) {
        self.set(Direction::Read, false);
    }

    pub fn start_write(&mut self) {
        self.set(Direction::Write, true);
    }

    pub fn stop_write(&mut self) {
        self.set(Direction::Write, false);
    }

    pub fn stop_all(&mut self) {
        self.stop_read();
        self.stop_write();
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    fn set(&mut self, direction: Direction, on: bool) {
        let bit = Interest::of(direction);
        let active = self.interest.add(bit) == self.interest;
        if active == on {
            return;
        }
        if !self.socket.is_valid() {
            // Nothing can be watched without a socket; keep the flags clear.
            return;
        }
        trace!(socket = ?self.socket, ?direction, on, "watcher");
        if on {
            self.reactor.start(self.socket, direction);
            self.interest = self.interest.add(bit);
        } else {
            self.reactor.stop(self.socket, direction);
            self.interest = self.interest.remove(bit);
        }
    }
}

/// A reactor that only records the interest it was asked for.
///
/// This is the reactor for callers that run their own poll loop and query
/// [`InterestRegistry::interest`] before each wait; the tokio driver is one.
#[derive(Debug, Default)]
pub struct InterestRegistry {
    socket: Option<SocketHandle>,
    interest: Interest,
    changes: u64,
}

impl InterestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket(&self) -> Option<SocketHandle> {
        self.socket
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Number of start/stop calls received.
    pub fn changes(&self) -> u64 {
        self.changes
    }
}

impl Reactor for InterestRegistry {
    fn start(&mut self, socket: SocketHandle, direction: Direction) {
        self.socket = Some(socket);
        self.interest = self.interest.add(Interest::of(direction));
        self.changes += 1;
    }

    fn stop(&mut self, socket: SocketHandle, direction: Direction) {
        if self.socket == Some(socket) {
            self.interest = self.interest.remove(Interest::of(direction));
            if self.interest.is_empty() {
                self.socket = None;
            }
        }
        self.changes += 1;
    }

    fn release(&mut self, socket: SocketHandle) {
        if self.socket == Some(socket) {
            self.socket = None;
            self.interest = Interest::NONE;
        }
    }
}
