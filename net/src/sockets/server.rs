use std::{
    fmt,
    io::{self, ErrorKind},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{info, warn};

use crate::{config::BindOptions, data_types::ServerId};

use super::{buffer_pool::BufferPool, connection::prepare_tcp};

/// A listening endpoint. Accepting never blocks, call accept() whenever the
/// application wants to pick up pending connections.
pub struct Server {
    id: ServerId,
    listener: Option<TcpListener>,
    local_address: SocketAddr,
    pool: Arc<BufferPool>,
    accepted: usize,
}

impl Server {
    pub(crate) fn bind(id: ServerId, options: &BindOptions, pool: &Arc<BufferPool>) -> io::Result<Self> {
        let listener = TcpListener::bind(&options.address)?;
        listener.set_nonblocking(true)?;
        let local_address = listener.local_addr()?;
        info!("Server {id}: Listening on {local_address}");

        Ok(Self {
            id,
            listener: Some(listener),
            local_address,
            pool: pool.clone(),
            accepted: 0,
        })
    }

    pub fn id(self: &Self) -> ServerId {
        self.id
    }

    /// The bound address, useful when binding to port 0
    pub fn local_address(self: &Self) -> SocketAddr {
        self.local_address
    }

    /// Pool shared by every channel accepted on this server
    pub fn pool(self: &Self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn accepted_count(self: &Self) -> usize {
        self.accepted
    }

    pub fn is_closed(self: &Self) -> bool {
        self.listener.is_none()
    }

    /// Returns the next pending connection, or None when nobody is waiting
    pub(crate) fn accept(self: &mut Self) -> io::Result<Option<TcpStream>> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(io::Error::new(ErrorKind::NotConnected, format!("server {} is closed", self.id)));
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    prepare_tcp(&stream)?;
                    self.accepted += 1;
                    info!("Server {}: Accepted connection from {peer}", self.id);
                    return Ok(Some(stream));
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => return Ok(None),
                    ErrorKind::Interrupted => {}
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!("Server {}: Connection dropped before accept: {e}", self.id);
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    /// Stops listening. Channels already accepted are unaffected.
    pub fn close(self: &mut Self) {
        if self.listener.take().is_some() {
            info!("Server {}: Closed after accepting {} connections", self.id, self.accepted);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared reference to a server tracked by a protocol registry
#[derive(Clone)]
pub struct ServerHandle {
    id: ServerId,
    local_address: SocketAddr,
    server: Arc<Mutex<Server>>,
}

impl ServerHandle {
    pub(crate) fn new(server: Server) -> Self {
        Self {
            id: server.id(),
            local_address: server.local_address(),
            server: Arc::new(Mutex::new(server)),
        }
    }

    pub fn id(self: &Self) -> ServerId {
        self.id
    }

    pub fn local_address(self: &Self) -> SocketAddr {
        self.local_address
    }

    pub fn lock(self: &Self) -> MutexGuard<'_, Server> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pool(self: &Self) -> Arc<BufferPool> {
        self.lock().pool().clone()
    }

    pub fn close(self: &Self) {
        self.lock().close()
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("id", &self.id)
            .field("local_address", &self.local_address)
            .finish()
    }
}
