//! Listens on one address, fans accepted connections out across a `LoopPool`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::acceptor::Acceptor;
use crate::config::ServerConfig;
use crate::event_loop::EventLoopHandle;
use crate::loop_pool::{LoopPool, SharedLoopPool};
use crate::tcp_connection::{ConnectionState, SharedTcpConnection, TcpConnection};

type ConnectionCallback = Arc<Mutex<Box<dyn FnMut(&mut TcpConnection) + Send>>>;
type MessageCallback = Arc<
    Mutex<Box<dyn FnMut(&mut TcpConnection, &mut crate::buffer::Buffer, std::time::Instant) + Send>>,
>;

/// Owns an `Acceptor` and a `LoopPool`, assigning each newly accepted connection to the next IO
/// loop round-robin and naming it `"{name}-{local_addr}#{sequence}"`.
pub struct TcpServer {
    name: String,
    acceptor: Acceptor,
    acceptor_loop: EventLoopHandle,
    pool: SharedLoopPool,
    high_water_mark: usize,
    connections: Arc<Mutex<HashMap<String, SharedTcpConnection>>>,
    next_conn_id: Arc<Mutex<u64>>,
    on_connection: ConnectionCallback,
    on_message: MessageCallback,
}

impl TcpServer {
    /// Binds and configures a server per `config`, using `acceptor_loop` to run the acceptor
    /// itself. Does not start accepting connections until [`TcpServer::start`] is called.
    pub fn new(
        name: impl Into<String>,
        acceptor_loop: EventLoopHandle,
        config: &ServerConfig,
    ) -> std::io::Result<Self> {
        let acceptor = Acceptor::bind(config.bind_addr)?;
        let pool = Arc::new(LoopPool::start(acceptor_loop.clone(), config.io_threads)?);

        Ok(TcpServer {
            name: name.into(),
            acceptor,
            acceptor_loop,
            pool,
            high_water_mark: config.high_water_mark,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: Arc::new(Mutex::new(0)),
            on_connection: Arc::new(Mutex::new(Box::new(|_| {}))),
            on_message: Arc::new(Mutex::new(Box::new(|_, _, _| {}))),
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Installs the callback invoked for every connection's established/closed transitions.
    pub fn set_connection_callback(&mut self, cb: impl FnMut(&mut TcpConnection) + Send + 'static) {
        self.on_connection = Arc::new(Mutex::new(Box::new(cb)));
    }

    /// Installs the callback invoked with newly received bytes on any connection.
    pub fn set_message_callback(
        &mut self,
        cb: impl FnMut(&mut TcpConnection, &mut crate::buffer::Buffer, std::time::Instant) + Send + 'static,
    ) {
        self.on_message = Arc::new(Mutex::new(Box::new(cb)));
    }

    /// Starts accepting connections.
    pub fn start(&mut self) {
        let name = self.name.clone();
        let local_addr = self.acceptor.local_addr().ok();
        let pool = self.pool.clone();
        let connections = self.connections.clone();
        let next_conn_id = self.next_conn_id.clone();
        let high_water_mark = self.high_water_mark;
        let on_connection = self.on_connection.clone();
        let on_message = self.on_message.clone();
        let acceptor_loop = self.acceptor_loop.clone();

        self.acceptor
            .set_new_connection_callback(Box::new(move |stream, peer| {
                let conn_loop = pool.get_next_loop();
                let id = {
                    let mut n = next_conn_id.lock().unwrap();
                    *n += 1;
                    *n
                };
                let conn_name = format!(
                    "{}-{}#{}",
                    name,
                    local_addr.map(|a| a.to_string()).unwrap_or_default(),
                    id
                );

                log::info!("{conn_name} connected from {peer}");

                let connections = connections.clone();
                let on_connection = on_connection.clone();
                let on_message = on_message.clone();
                let conn_loop_for_task = conn_loop.clone();
                let acceptor_loop_for_close = acceptor_loop.clone();

                conn_loop.run_in_loop(move || {
                    let conn = match TcpConnection::new(
                        conn_name.clone(),
                        stream,
                        conn_loop_for_task.clone(),
                        high_water_mark,
                    ) {
                        Ok(c) => c,
                        Err(e) => {
                            log::warn!("{conn_name}: failed to wrap accepted stream: {e}");
                            return;
                        }
                    };

                    let token = conn_loop_for_task.register_channel(conn.lock().unwrap().channel());
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

                        let connections_for_close = connections.clone();
                        let acceptor_loop_for_close = acceptor_loop_for_close.clone();
                        c.set_close_callback(Box::new(move |conn| {
                            let name = conn.lock().unwrap().name().to_string();
                            let connections_for_close = connections_for_close.clone();
                            acceptor_loop_for_close.run_in_loop(move || {
                                connections_for_close.lock().unwrap().remove(&name);
                            });
                        }));
                    }

                    connections
                        .lock()
                        .unwrap()
                        .insert(conn.lock().unwrap().name().to_string(), conn.clone());

                    if let Err(e) = conn_loop_for_task.update_channel(token) {
                        log::warn!("failed to register new connection's channel: {e}");
                        return;
                    }

                    TcpConnection::connect_established(&conn);
                });
            }));

        let token = self.acceptor_loop.register_channel(self.acceptor.channel());
        if let Err(e) = self.acceptor_loop.update_channel(token) {
            log::error!("failed to register listening socket: {e}");
        }
    }

    /// Number of currently tracked connections.
    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Stops the IO loop pool and force-closes any connections still open. The acceptor loop
    /// itself is owned by the caller and not stopped here.
    pub fn stop(&mut self) {
        let conns: Vec<_> = self.connections.lock().unwrap().values().cloned().collect();
        for conn in conns {
            let mut c = conn.lock().unwrap();
            if c.state() == ConnectionState::Connected {
                c.force_close();
            }
        }
    }
}
