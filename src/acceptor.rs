//! Listening-socket channel that accepts new connections and hands them to a callback.
//!
//! An `Acceptor` owns exactly one non-blocking `TcpListener` and one [`Channel`] registered for
//! read interest on that listener's fd. It does not itself own an `EventLoop`; callers register it
//! with one via [`Acceptor::channel`].

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

use crate::channel::{Channel, SharedChannel};

type NewConnectionCallback = Box<dyn FnMut(TcpListener, SocketAddr) + Send>;

/// Accepts inbound connections on a listening socket and forwards each one to a callback.
pub struct Acceptor {
    listener_fd: std::os::unix::io::RawFd,
    listener: Arc<Mutex<Option<TcpListener>>>,
    channel: SharedChannel,
    /// A held-open file kept solely as a spare descriptor to close and reopen when `accept()`
    /// fails with `EMFILE`/`ENFILE`, so the listener can still be drained and the fd pressure
    /// relieved rather than spinning on a level-triggered readable listener forever.
    scratch_fd: Option<std::fs::File>,
}

impl Acceptor {
    /// Binds a non-blocking listener at `addr`.
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();

        let scratch_fd = std::fs::File::open("/dev/null").ok();

        Ok(Acceptor {
            listener_fd: fd,
            listener: Arc::new(Mutex::new(Some(listener))),
            channel: Arc::new(Mutex::new(Channel::new(fd))),
            scratch_fd,
        })
    }

    /// The local address this acceptor is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener
            .lock()
            .unwrap()
            .as_ref()
            .expect("acceptor listener missing")
            .local_addr()
    }

    /// The channel to register with an owning `EventLoop`.
    pub fn channel(&self) -> SharedChannel {
        self.channel.clone()
    }

    /// Installs `on_new_connection`, invoked once per accepted connection with the accepted
    /// stream (still in blocking mode; callers hand it to a `TcpConnection`) and its peer address.
    /// Also wires up this acceptor's channel to call `accept_all` on readability.
    pub fn set_new_connection_callback(&mut self, on_new_connection: NewConnectionCallback) {
        let listener = self.listener.clone();
        let addr = self.local_addr().ok();
        let mut scratch_fd = self.scratch_fd.take();
        let on_new_connection = Arc::new(Mutex::new(on_new_connection));

        let mut channel = self.channel.lock().unwrap();
        channel.enable_reading();
        channel.set_read_callback(Box::new(move |_now| {
            let Some(ref l) = *listener.lock().unwrap() else {
                return;
            };
            loop {
                match l.accept() {
                    Ok((stream, peer)) => {
                        let mut cb = on_new_connection.lock().unwrap();
                        cb(stream, peer);
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(ref e) if is_fd_exhaustion(e) => {
                        log::warn!(
                            "accept on {:?} hit descriptor exhaustion ({e}); \
                             releasing scratch descriptor to drain the backlog",
                            addr
                        );
                        // Close the spare fd, accept-and-drop one connection to relieve the
                        // backlog, then reopen the spare so the next exhaustion can be handled
                        // the same way.
                        scratch_fd.take();
                        let _ = l.accept();
                        scratch_fd = std::fs::File::open("/dev/null").ok();
                        break;
                    }
                    Err(e) => {
                        log::warn!("accept on {:?} failed: {e}", addr);
                        break;
                    }
                }
            }
        }));
    }

    /// The listener's raw file descriptor.
    pub fn fd(&self) -> std::os::unix::io::RawFd {
        self.listener_fd
    }
}

fn is_fd_exhaustion(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE)
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn accepts_and_invokes_callback_for_each_connection() {
        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let a = accepted.clone();
        acceptor.set_new_connection_callback(Box::new(move |_stream, _peer| {
            a.fetch_add(1, Ordering::SeqCst);
        }));

        let _client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let channel = acceptor.channel();
        let mut c = channel.lock().unwrap();
        c.handle_event(
            std::time::Instant::now(),
            crate::interest::Interest::READABLE,
            false,
            false,
        );

        assert_eq!(1, accepted.load(Ordering::SeqCst));
    }
}
