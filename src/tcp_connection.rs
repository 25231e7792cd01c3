//! Established-connection state machine.
//!
//! A `TcpConnection` owns a connected socket, a read buffer, a write buffer, and a [`Channel`]
//! registered with its owning loop. It knows nothing about HTTP; `http::server::HttpServer` layers
//! request parsing on top of the byte stream this type exposes via its message callback.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mio::Token;

use crate::buffer::Buffer;
use crate::channel::{Channel, SharedChannel};
use crate::event_loop::EventLoopHandle;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

type MessageCallback = Box<dyn FnMut(&mut TcpConnection, &mut Buffer, Instant) + Send>;
type WriteCompleteCallback = Box<dyn FnMut(&mut TcpConnection) + Send>;
type HighWaterMarkCallback = Box<dyn FnMut(&mut TcpConnection, usize) + Send>;
type CloseCallback = Box<dyn FnMut(&SharedTcpConnection) + Send>;
type ConnectionCallback = Box<dyn FnMut(&mut TcpConnection) + Send>;

/// Shared ownership of a connection, the form in which `TcpServer`/`TcpClient` hold it so its
/// close callback can remove it from their connection table.
pub type SharedTcpConnection = Arc<Mutex<TcpConnection>>;

struct Callbacks {
    on_connection: ConnectionCallback,
    on_message: MessageCallback,
    on_write_complete: WriteCompleteCallback,
    on_high_water_mark: HighWaterMarkCallback,
    on_close: CloseCallback,
}

/// One established TCP connection.
pub struct TcpConnection {
    name: String,
    stream: TcpStream,
    loop_handle: EventLoopHandle,
    channel: SharedChannel,
    token: Option<Token>,
    state: ConnectionState,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
    context: Option<Box<dyn std::any::Any + Send>>,
    callbacks: Callbacks,
    self_weak: std::sync::Weak<Mutex<TcpConnection>>,
}

impl TcpConnection {
    /// Wraps an already-connected, non-blocking `stream` under `name`, registering a channel with
    /// `loop_handle`'s loop. Callers still need to call [`TcpConnection::connect_established`]
    /// once the connection is registered in an owner's table, and supply callbacks before then.
    pub fn new(
        name: String,
        stream: TcpStream,
        loop_handle: EventLoopHandle,
        high_water_mark: usize,
    ) -> std::io::Result<SharedTcpConnection> {
        stream.set_nonblocking(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let fd = stream.as_raw_fd();

        let conn = TcpConnection {
            name,
            stream,
            loop_handle,
            channel: Arc::new(Mutex::new(Channel::new(fd))),
            token: None,
            state: ConnectionState::Connecting,
            local_addr,
            peer_addr,
            input: Buffer::new(),
            output: Buffer::new(),
            high_water_mark,
            context: None,
            callbacks: Callbacks {
                on_connection: Box::new(|_| {}),
                on_message: Box::new(|_, _, _| {}),
                on_write_complete: Box::new(|_| {}),
                on_high_water_mark: Box::new(|_, _| {}),
                on_close: Box::new(|_| {}),
            },
            self_weak: std::sync::Weak::new(),
        };

        let shared = Arc::new(Mutex::new(conn));
        shared.lock().unwrap().self_weak = Arc::downgrade(&shared);
        wire_channel(&shared);
        Ok(shared)
    }

    /// A shared handle to this connection, for a handler that needs to retain it past the scope
    /// of the callback it was invoked from (e.g. to complete a response asynchronously). Valid to
    /// call any time a `&TcpConnection`/`&mut TcpConnection` is reachable at all, since that can
    /// only happen while the owning `Arc` this was downgraded from is still alive.
    pub fn shared(&self) -> SharedTcpConnection {
        self.self_weak
            .upgrade()
            .expect("TcpConnection outlived its own Arc")
    }

    /// Connection name, of the form assigned by the owning `TcpServer`/`TcpClient`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local endpoint address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer endpoint address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once the connection has fully shut down.
    pub fn is_disconnected(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    /// The channel this connection owns, for registration with an `EventLoop`.
    pub fn channel(&self) -> SharedChannel {
        self.channel.clone()
    }

    /// Records the token this connection's channel was registered under. Must be called by the
    /// owner (`TcpServer`/`TcpClient`) immediately after registering `self.channel()`, before
    /// `connect_established` — subsequent interest changes (`send` buffering, `shutdown`) push
    /// updates to the loop via this token.
    pub fn set_token(&mut self, token: Token) {
        self.token = Some(token);
    }

    /// Installs the callback invoked once when the connection transitions to `Connected`, and
    /// again when it transitions to `Disconnected`.
    pub fn set_connection_callback(&mut self, cb: ConnectionCallback) {
        self.callbacks.on_connection = cb;
    }

    /// Installs the callback invoked with newly received bytes.
    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.callbacks.on_message = cb;
    }

    /// Installs the callback invoked once the output buffer has been fully flushed.
    pub fn set_write_complete_callback(&mut self, cb: WriteCompleteCallback) {
        self.callbacks.on_write_complete = cb;
    }

    /// Installs the callback invoked when the output buffer's length crosses `high_water_mark`
    /// going up.
    pub fn set_high_water_mark_callback(&mut self, cb: HighWaterMarkCallback) {
        self.callbacks.on_high_water_mark = cb;
    }

    /// Installs the callback invoked once, when the connection is about to be removed from its
    /// owner's table.
    pub fn set_close_callback(&mut self, cb: CloseCallback) {
        self.callbacks.on_close = cb;
    }

    /// Arbitrary per-connection state an application layer (e.g. `http::server::HttpServer`)
    /// stashes here, such as in-progress HTTP parser state.
    pub fn context(&self) -> Option<&(dyn std::any::Any + Send)> {
        self.context.as_deref()
    }

    /// Mutable access to the per-connection context slot.
    pub fn context_mut(&mut self) -> &mut Option<Box<dyn std::any::Any + Send>> {
        &mut self.context
    }

    /// Sets the per-connection context slot.
    pub fn set_context(&mut self, context: Box<dyn std::any::Any + Send>) {
        self.context = Some(context);
    }

    /// Queues `data` for sending. If the output buffer is currently empty and the socket accepts
    /// all of `data` in one non-blocking write, no buffering or write-readiness registration
    /// happens at all — the fast path muduo's `send` takes.
    pub fn send(&mut self, data: &[u8]) {
        if self.state != ConnectionState::Connected {
            return;
        }

        if self.output.readable_bytes() == 0 {
            match self.stream.write(data) {
                Ok(n) if n == data.len() => {
                    let mut cb = std::mem::replace(
                        &mut self.callbacks.on_write_complete,
                        Box::new(|_| {}),
                    );
                    cb(self);
                    self.callbacks.on_write_complete = cb;
                }
                Ok(n) => {
                    let old_len = self.output.readable_bytes();
                    self.output.append(&data[n..]);
                    self.start_writing();
                    self.check_high_water_mark(old_len);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    let old_len = self.output.readable_bytes();
                    self.output.append(data);
                    self.start_writing();
                    self.check_high_water_mark(old_len);
                }
                Err(e) => {
                    log::debug!("{}: write failed: {e}", self.name);
                }
            }
        } else {
            let old_len = self.output.readable_bytes();
            self.output.append(data);
            self.check_high_water_mark(old_len);
        }
    }

    fn start_writing(&self) {
        let changed = {
            let mut c = self.channel.lock().unwrap();
            if c.is_writing() {
                false
            } else {
                c.enable_writing();
                true
            }
        };
        if changed {
            self.request_channel_update();
        }
    }

    /// Fires `on_high_water_mark` only on the transition across `high_water_mark`, not on every
    /// `send` call that leaves the buffer at or above it. `old_len` is the output buffer's
    /// readable length before the data just appended.
    fn check_high_water_mark(&mut self, old_len: usize) {
        let len = self.output.readable_bytes();
        if old_len < self.high_water_mark && len >= self.high_water_mark {
            let mut cb = std::mem::replace(
                &mut self.callbacks.on_high_water_mark,
                Box::new(|_, _| {}),
            );
            cb(self, len);
            self.callbacks.on_high_water_mark = cb;
        }
    }

    fn request_channel_update(&self) {
        if let Some(token) = self.token {
            if let Err(e) = self.loop_handle.update_channel(token) {
                log::debug!("{}: failed to update channel interest: {e}", self.name);
            }
        }
    }

    /// Half-closes the connection for writing once the output buffer has drained. If the buffer
    /// is already empty, shuts down the write half immediately.
    pub fn shutdown(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.state = ConnectionState::Disconnecting;

        let c = self.channel.lock().unwrap();
        if !c.is_writing() {
            drop(c);
            let _ = self.stream.shutdown(Shutdown::Write);
        }
    }

    /// Closes the connection immediately, discarding any buffered but unsent output.
    pub fn force_close(&mut self) {
        if self.state == ConnectionState::Connected || self.state == ConnectionState::Disconnecting {
            self.handle_close();
        }
    }

    /// Called once by the owner after registering this connection's channel, to fire the
    /// connection-established callback and enable read interest.
    pub fn connect_established(this: &SharedTcpConnection) {
        let mut conn = this.lock().unwrap();
        assert_eq!(ConnectionState::Connecting, conn.state);
        conn.state = ConnectionState::Connected;

        {
            let mut c = conn.channel.lock().unwrap();
            c.tie(Arc::downgrade(this) as std::sync::Weak<dyn std::any::Any + Send + Sync>);
            c.enable_reading();
        }
        conn.request_channel_update();

        let mut cb = std::mem::replace(&mut conn.callbacks.on_connection, Box::new(|_| {}));
        cb(&mut conn);
        conn.callbacks.on_connection = cb;
    }

    fn handle_read(&mut self, now: Instant) {
        match self.input.read_fd(&mut self.stream) {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let mut cb =
                    std::mem::replace(&mut self.callbacks.on_message, Box::new(|_, _, _| {}));
                let mut buf = std::mem::take(&mut self.input);
                cb(self, &mut buf, now);
                self.input = buf;
                self.callbacks.on_message = cb;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                log::debug!("{}: read failed: {e}", self.name);
                self.handle_close();
            }
        }
    }

    fn handle_write(&mut self) {
        let writable = self.channel.lock().unwrap().is_writing();
        if !writable {
            return;
        }

        let pending = self.output.peek().to_vec();
        match self.stream.write(&pending) {
            Ok(n) => {
                self.output.retrieve(n);
                if self.output.readable_bytes() == 0 {
                    self.channel.lock().unwrap().disable_writing();
                    self.request_channel_update();
                    let mut cb =
                        std::mem::replace(&mut self.callbacks.on_write_complete, Box::new(|_| {}));
                    cb(self);
                    self.callbacks.on_write_complete = cb;

                    if self.state == ConnectionState::Disconnecting {
                        let _ = self.stream.shutdown(Shutdown::Write);
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                log::debug!("{}: write failed: {e}", self.name);
            }
        }
    }

    fn handle_close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        self.channel.lock().unwrap().disable_all();
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

fn wire_channel(shared: &SharedTcpConnection) {
    let weak: std::sync::Weak<Mutex<TcpConnection>> = Arc::downgrade(shared);

    let channel = shared.lock().unwrap().channel.clone();
    let mut c = channel.lock().unwrap();

    let w = weak.clone();
    c.set_read_callback(Box::new(move |now| {
        if let Some(conn) = w.upgrade() {
            conn.lock().unwrap().handle_read(now);
        }
    }));

    let w = weak.clone();
    c.set_write_callback(Box::new(move || {
        if let Some(conn) = w.upgrade() {
            conn.lock().unwrap().handle_write();
        }
    }));

    let w = weak.clone();
    c.set_close_callback(Box::new(move || {
        if let Some(conn) = w.upgrade() {
            let mut guard = conn.lock().unwrap();
            guard.handle_close();
            let mut cb = std::mem::replace(&mut guard.callbacks.on_close, Box::new(|_| {}));
            drop(guard);
            cb(&conn);
        }
    }));

    let w = weak.clone();
    c.set_error_callback(Box::new(move || {
        if let Some(conn) = w.upgrade() {
            log::debug!("{}: error event on channel", conn.lock().unwrap().name);
        }
    }));
}
