//! Single-connection client wrapper around a `Connector`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connector::Connector;
use crate::event_loop::EventLoopHandle;
use crate::tcp_connection::{SharedTcpConnection, TcpConnection};

type ConnectionCallback = Arc<Mutex<Box<dyn FnMut(&mut TcpConnection) + Send>>>;
type MessageCallback = Arc<
    Mutex<Box<dyn FnMut(&mut TcpConnection, &mut crate::buffer::Buffer, std::time::Instant) + Send>>,
>;

/// Connects to one remote address and exposes the resulting connection through callbacks, the way
/// `TcpServer` exposes its accepted connections. Retries are enabled by default; call
/// `Connector::set_retry(false)` via [`TcpClient::connector`] to disable.
pub struct TcpClient {
    name: String,
    loop_handle: EventLoopHandle,
    connector: Connector,
    high_water_mark: usize,
    connection: Arc<Mutex<Option<SharedTcpConnection>>>,
    retry_enabled: Arc<AtomicBool>,
    on_connection: ConnectionCallback,
    on_message: MessageCallback,
}

impl TcpClient {
    /// Creates a client that will connect to `server_addr` once [`TcpClient::connect`] is called.
    pub fn new(
        name: impl Into<String>,
        loop_handle: EventLoopHandle,
        server_addr: SocketAddr,
        high_water_mark: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        let connector = Connector::new(loop_handle.clone(), server_addr, initial_backoff, max_backoff);
        TcpClient {
            name: name.into(),
            loop_handle,
            connector,
            high_water_mark,
            connection: Arc::new(Mutex::new(None)),
            retry_enabled: Arc::new(AtomicBool::new(true)),
            on_connection: Arc::new(Mutex::new(Box::new(|_| {}))),
            on_message: Arc::new(Mutex::new(Box::new(|_, _, _| {}))),
        }
    }

    /// Installs the callback invoked for this client's connection's established/closed
    /// transitions.
    pub fn set_connection_callback(&mut self, cb: impl FnMut(&mut TcpConnection) + Send + 'static) {
        self.on_connection = Arc::new(Mutex::new(Box::new(cb)));
    }

    /// Installs the callback invoked with newly received bytes.
    pub fn set_message_callback(
        &mut self,
        cb: impl FnMut(&mut TcpConnection, &mut crate::buffer::Buffer, std::time::Instant) + Send + 'static,
    ) {
        self.on_message = Arc::new(Mutex::new(Box::new(cb)));
    }

    /// Enables or disables the connector's automatic reconnect-with-backoff behavior.
    pub fn enable_retry(&self, enabled: bool) {
        self.retry_enabled.store(enabled, Ordering::SeqCst);
        self.connector.set_retry(enabled);
    }

    /// Starts connecting. Posts the whole setup-and-start sequence to the owning loop (inline if
    /// already called from it), so a foreign thread calling this never races the loop thread over
    /// the connector's callback slots.
    pub fn connect(&mut self) {
        let name = self.name.clone();
        let loop_handle = self.loop_handle.clone();
        let high_water_mark = self.high_water_mark;
        let connection = self.connection.clone();
        let on_connection = self.on_connection.clone();
        let on_message = self.on_message.clone();
        let connector = self.connector.clone();
        let retry_enabled = self.retry_enabled.clone();

        self.loop_handle.run_in_loop(move || {
            connector.set_retry(retry_enabled.load(Ordering::SeqCst));

            let loop_handle_for_cb = loop_handle.clone();
            connector.set_connect_callback(Box::new(move |stream| {
                let name = format!("{name}-client");
                let conn = match TcpConnection::new(
                    name.clone(),
                    stream,
                    loop_handle_for_cb.clone(),
                    high_water_mark,
                ) {
                    Ok(c) => c,
                    Err(e) => {
                        log::warn!("{name}: failed to wrap connected stream: {e}");
                        return;
                    }
                };

                let token = loop_handle_for_cb.register_channel(conn.lock().unwrap().channel());
                {
                    let mut c = conn.lock().unwrap();
                    c.set_token(token);

                    let cb_conn = on_connection.clone();
                    c.set_connection_callback(Box::new(move |conn| {
                        cb_conn.lock().unwrap()(conn);
                    }));

                    let cb_msg = on_message.clone();
                    c.set_message_callback(Box::new(move |conn, buf, now| {
                        cb_msg.lock().unwrap()(conn, buf, now);
                    }));

                    let connection_for_close = connection.clone();
                    c.set_close_callback(Box::new(move |_conn| {
                        *connection_for_close.lock().unwrap() = None;
                    }));
                }

                if let Err(e) = loop_handle_for_cb.update_channel(token) {
                    log::warn!("failed to register client connection's channel: {e}");
                    return;
                }

                *connection.lock().unwrap() = Some(conn.clone());
                TcpConnection::connect_established(&conn);
            }));

            connector.start();
        });
    }

    /// The current connection, if connected.
    pub fn connection(&self) -> Option<SharedTcpConnection> {
        self.connection.lock().unwrap().clone()
    }

    /// Direct access to the underlying connector, e.g. to install an error callback.
    pub fn connector(&mut self) -> &mut Connector {
        &mut self.connector
    }

    /// Disables retry and shuts down the current connection, if any.
    pub fn disconnect(&mut self) {
        self.enable_retry(false);
        if let Some(conn) = self.connection() {
            conn.lock().unwrap().shutdown();
        }
    }

    /// Cancels any in-flight connect attempt and any scheduled retry. Does not touch an already
    /// established connection; call [`TcpClient::disconnect`] for that.
    pub fn stop(&mut self) {
        self.retry_enabled.store(false, Ordering::SeqCst);
        self.connector.stop();
    }
}

impl Drop for TcpClient {
    /// Stops the connector so no further reconnect attempt is scheduled. If this client is the
    /// sole owner of its connection, force-closes it; otherwise leaves it alone and lets whoever
    /// else holds it manage its lifetime.
    fn drop(&mut self) {
        self.connector.stop();

        if let Some(conn) = self.connection.lock().unwrap().take() {
            if Arc::strong_count(&conn) == 1 {
                conn.lock().unwrap().force_close();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn connects_and_establishes_a_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = listener.accept();
        });

        let mut event_loop = crate::event_loop::EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let mut client = TcpClient::new(
            "test",
            handle.clone(),
            addr,
            64 * 1024 * 1024,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );

        let established = Arc::new(AtomicBool::new(false));
        let e = established.clone();
        client.set_connection_callback(move |conn| {
            if conn.state() == crate::tcp_connection::ConnectionState::Connected {
                e.store(true, Ordering::SeqCst);
            }
        });

        client.connect();

        // The connect itself is non-blocking and only settles once the loop dispatches the
        // connecting socket's write-readiness event, so the loop has to actually run.
        let quit_handle = handle.clone();
        handle.run_after(Duration::from_millis(200), move || quit_handle.quit());
        event_loop.run();

        assert!(established.load(Ordering::SeqCst));
        assert!(client.connection().is_some());
    }
}
