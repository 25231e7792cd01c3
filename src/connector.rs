//! Non-blocking outbound connection establishment with exponential-backoff retry.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::Token;

use crate::channel::Channel;
use crate::error::ConnectError;
use crate::event_loop::EventLoopHandle;
use crate::timer::TimerId;

/// A `Connector`'s lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    state: ConnectorState,
    retry_delay: Duration,
    /// Token and raw fd of an in-flight non-blocking connect's write-readiness channel, so `stop`
    /// and the channel's own write/error callback each deregister it exactly once.
    connecting: Option<(Token, RawFd)>,
    /// Id of a scheduled-but-not-yet-fired retry timer, so `stop` can cancel it.
    retry_timer: Option<TimerId>,
}

type ConnectCallback = Box<dyn FnMut(std::net::TcpStream) + Send>;
type ErrorCallback = Box<dyn FnMut(ConnectError) + Send>;

/// Establishes one outbound TCP connection to `server_addr`, retrying with exponential backoff
/// (bounded by `ServerConfig::connector_max_backoff`) when the connection is refused or the
/// connect target is otherwise unreachable.
///
/// The connect itself never blocks the loop thread: a non-blocking socket is created and `connect`
/// issued immediately, a [`Channel`] then watches the socket for write-readiness (the signal a
/// connecting socket gives once it has settled, successfully or not), and `SO_ERROR` is inspected
/// once that fires. Retries are scheduled on the owning loop's own timer facility rather than a
/// spawned OS thread, so a retry's eventual connect attempt runs on the loop thread exactly like
/// any other loop-posted task.
///
/// Cheaply cloneable: every clone shares the same underlying state, callbacks, and in-flight
/// bookkeeping, which is what lets `TcpClient::connect` post the whole setup-and-start sequence to
/// the loop via [`EventLoopHandle::run_in_loop`] while still operating on one logical connector.
#[derive(Clone)]
pub struct Connector {
    server_addr: SocketAddr,
    loop_handle: EventLoopHandle,
    inner: Arc<Mutex<Inner>>,
    retry_enabled: Arc<AtomicBool>,
    initial_backoff: Duration,
    max_backoff: Duration,
    on_connect: Arc<Mutex<ConnectCallback>>,
    on_error: Arc<Mutex<ErrorCallback>>,
}

impl Connector {
    /// Creates a connector bound to `loop_handle`, targeting `server_addr`. Does not connect until
    /// [`Connector::start`] is called.
    pub fn new(
        loop_handle: EventLoopHandle,
        server_addr: SocketAddr,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Connector {
            server_addr,
            loop_handle,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectorState::Disconnected,
                retry_delay: initial_backoff,
                connecting: None,
                retry_timer: None,
            })),
            retry_enabled: Arc::new(AtomicBool::new(true)),
            initial_backoff,
            max_backoff,
            on_connect: Arc::new(Mutex::new(Box::new(|_| {}))),
            on_error: Arc::new(Mutex::new(Box::new(|_| {}))),
        }
    }

    /// Installs the callback invoked with a connected, non-blocking `TcpStream` once a connect
    /// attempt succeeds. Mutates through the shared callback slot, so it takes effect on every
    /// clone of this connector, not just the one `set_connect_callback` was called on.
    pub fn set_connect_callback(&self, cb: ConnectCallback) {
        *self.on_connect.lock().unwrap() = cb;
    }

    /// Installs the callback invoked once a terminal (non-retryable) error occurs.
    pub fn set_error_callback(&self, cb: ErrorCallback) {
        *self.on_error.lock().unwrap() = cb;
    }

    /// Enables or disables automatic retry after a failed or dropped connection.
    pub fn set_retry(&self, enabled: bool) {
        self.retry_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Starts (or restarts) connecting.
    pub fn start(&self) {
        self.connect();
    }

    /// Cancels any in-flight connect attempt and any scheduled retry, and stops further automatic
    /// reconnection. A `stop` racing with a retry timer that is about to fire is safe: the timer
    /// callback re-checks the retry flag before attempting to connect.
    pub fn stop(&self) {
        self.retry_enabled.store(false, Ordering::SeqCst);

        let (connecting, retry_timer) = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ConnectorState::Disconnected;
            (inner.connecting.take(), inner.retry_timer.take())
        };

        if let Some(id) = retry_timer {
            self.loop_handle.cancel_timer(id);
        }
        if let Some((token, fd)) = connecting {
            let _ = self.loop_handle.remove_channel(token);
            // SAFETY: `fd` was handed to us by `into_raw_fd` in `connecting` and has not been
            // touched since; nothing else can reach it once it's out of `inner.connecting`.
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectorState {
        self.inner.lock().unwrap().state
    }

    fn connect(&self) {
        self.inner.lock().unwrap().state = ConnectorState::Connecting;

        match mio::net::TcpStream::connect(self.server_addr) {
            Ok(stream) => self.connecting(stream),
            Err(e) => self.handle_connect_error(e),
        }
    }

    /// Registers the connecting socket's fd for write-readiness. A connecting non-blocking socket
    /// becomes writable once the three-way handshake settles, whether it succeeded or failed.
    fn connecting(&self, stream: mio::net::TcpStream) {
        let fd = stream.as_raw_fd();
        let channel = Arc::new(Mutex::new(Channel::new(fd)));
        {
            let mut c = channel.lock().unwrap();
            c.enable_writing();
            let this = self.clone();
            c.set_write_callback(Box::new(move || this.handle_settled()));
            let this = self.clone();
            c.set_error_callback(Box::new(move || this.handle_settled()));
        }

        let token = self.loop_handle.register_channel(channel);
        if let Err(e) = self.loop_handle.update_channel(token) {
            log::warn!(
                "failed to register connecting socket for {:?}: {e}",
                self.server_addr
            );
            drop(stream);
            self.retry();
            return;
        }

        // The channel now owns the fd's readiness notifications; only the raw fd itself is kept,
        // so `stream`'s own `Drop` never runs on it and there is no double close.
        let raw = stream.into_raw_fd();
        self.inner.lock().unwrap().connecting = Some((token, raw));
    }

    /// Fires once the connecting socket becomes writable or errors. Inspects `SO_ERROR` to tell a
    /// settled connection apart from a failed one; a stale fire for an attempt `stop` already took
    /// (`connecting` already `None`) is a no-op.
    fn handle_settled(&self) {
        let Some((token, fd)) = self.inner.lock().unwrap().connecting.take() else {
            return;
        };
        let _ = self.loop_handle.remove_channel(token);

        // SAFETY: `fd` was produced by `into_raw_fd` in `connecting` and has not been touched
        // since; reclaiming it here is the only way back to an owned stream to call `take_error`
        // or hand it to the connect callback without a double close.
        let stream = unsafe { mio::net::TcpStream::from_raw_fd(fd) };

        match stream.take_error() {
            Ok(None) => self.handle_connect_success(stream),
            Ok(Some(e)) => {
                drop(stream);
                log::debug!(
                    "connect to {:?} failed (SO_ERROR = {e}); scheduling retry",
                    self.server_addr
                );
                self.retry();
            }
            Err(e) => {
                drop(stream);
                log::debug!("failed to read SO_ERROR for {:?}: {e}", self.server_addr);
                self.retry();
            }
        }
    }

    fn handle_connect_success(&self, stream: mio::net::TcpStream) {
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        if local.is_some() && local == peer {
            log::warn!("self-connect detected to {:?}, retrying", self.server_addr);
            drop(stream);
            self.retry();
            return;
        }

        self.inner.lock().unwrap().state = ConnectorState::Connected;
        self.reset_backoff();

        // The rest of this crate works in terms of `std::net::TcpStream`; `mio::net::TcpStream`
        // is a thin non-blocking wrapper around the same fd, so this costs only the raw fd round
        // trip, no new socket or syscall.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };

        let mut cb = self.on_connect.lock().unwrap();
        cb(std_stream);
    }

    fn handle_connect_error(&self, e: std::io::Error) {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::TimedOut
            | ErrorKind::NotFound
            | ErrorKind::NetworkUnreachable
            | ErrorKind::HostUnreachable
            | ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable
            | ErrorKind::WouldBlock => {
                log::debug!(
                    "connect to {:?} failed ({e}); scheduling retry",
                    self.server_addr
                );
                self.retry();
            }
            ErrorKind::PermissionDenied => {
                self.fail(ConnectError::Rejected(e));
            }
            _ => {
                self.fail(ConnectError::Unsupported(e));
            }
        }
    }

    fn fail(&self, err: ConnectError) {
        self.inner.lock().unwrap().state = ConnectorState::Disconnected;
        log::error!("connector to {:?} failed terminally: {err}", self.server_addr);
        let mut cb = self.on_error.lock().unwrap();
        cb(err);
    }

    fn retry(&self) {
        self.inner.lock().unwrap().state = ConnectorState::Disconnected;

        if !self.retry_enabled.load(Ordering::SeqCst) {
            return;
        }

        let delay = {
            let mut inner = self.inner.lock().unwrap();
            let delay = inner.retry_delay;
            inner.retry_delay = (inner.retry_delay * 2).min(self.max_backoff);
            delay
        };

        if delay >= Duration::from_secs(8) {
            log::warn!(
                "connector to {:?} backing off {delay:?} before next attempt",
                self.server_addr
            );
        } else {
            log::debug!("connector to {:?} retrying in {delay:?}", self.server_addr);
        }

        let this = self.clone();
        let retry_enabled = self.retry_enabled.clone();
        let id = self.loop_handle.run_after(delay, move || {
            this.inner.lock().unwrap().retry_timer = None;
            if retry_enabled.load(Ordering::SeqCst) {
                this.connect();
            }
        });
        self.inner.lock().unwrap().retry_timer = Some(id);
    }

    fn reset_backoff(&self) {
        self.inner.lock().unwrap().retry_delay = self.initial_backoff;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    /// Runs `event_loop` for `budget`, dispatching whatever channel events and timers come due,
    /// then quits. A single call, since `EventLoop::run` cannot be re-entered once its `quit` flag
    /// has been set.
    fn run_loop_for(event_loop: &mut crate::event_loop::EventLoop, budget: Duration) {
        let handle = event_loop.handle();
        let quit_handle = handle.clone();
        handle.run_after(budget, move || quit_handle.quit());
        event_loop.run();
    }

    #[test]
    fn successful_connect_invokes_connect_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = listener.accept();
        });

        let mut event_loop = crate::event_loop::EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let connector = Connector::new(
            handle,
            addr,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        let connected = Arc::new(AtomicBool::new(false));
        let c = connected.clone();
        connector.set_connect_callback(Box::new(move |_stream| {
            c.store(true, Ordering::SeqCst);
        }));

        connector.start();
        run_loop_for(&mut event_loop, Duration::from_millis(200));

        assert!(connected.load(Ordering::SeqCst));
        assert_eq!(ConnectorState::Connected, connector.state());
    }

    #[test]
    fn refused_connect_with_retry_disabled_leaves_state_disconnected() {
        // Bind then immediately drop, so the port refuses connections.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let event_loop = crate::event_loop::EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let connector = Connector::new(
            handle,
            addr,
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        connector.set_error_callback(Box::new(move |_err| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        connector.set_retry(false);
        // A refused loopback connect fails synchronously inside `start()` (no EINPROGRESS round
        // trip needed), so `state()` already reflects the outcome without running the loop at all.
        connector.start();

        assert_eq!(ConnectorState::Disconnected, connector.state());
        assert_eq!(0, errors.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_cancels_a_pending_retry_timer_before_it_connects() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let mut event_loop = crate::event_loop::EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let connector = Connector::new(
            handle,
            addr,
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        let connects = Arc::new(AtomicUsize::new(0));
        let c = connects.clone();
        connector.set_connect_callback(Box::new(move |_stream| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        // The refused connect fails synchronously and schedules a retry timer; stop immediately,
        // before the loop ever runs, so the cancel must reach the timer queue directly.
        connector.start();
        assert_eq!(ConnectorState::Disconnected, connector.state());
        connector.stop();

        // Run the loop well past the scheduled retry delay; the cancelled timer must not fire.
        run_loop_for(&mut event_loop, Duration::from_millis(100));

        assert_eq!(0, connects.load(Ordering::SeqCst));
    }
}
