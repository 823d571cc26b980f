use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{info, warn};

use crate::{
    config::{AcceptOptions, BindOptions, ConnectOptions},
    data_types::{ChannelId, ServerId},
    error_codes::{TransportError, TransportResult},
    sockets::{
        buffer_pool::{BufferPool, PoolSpec},
        channel::{Channel, ChannelHandle},
        connection::{connect_tcp, SocketStream},
        server::{Server, ServerHandle},
    },
};

struct Registry {
    initialized: bool,
    next_channel_id: ChannelId,
    next_server_id: ServerId,
    channels: HashMap<ChannelId, ChannelHandle>,
    servers: HashMap<ServerId, ServerHandle>,
    pools: HashMap<PoolSpec, Arc<BufferPool>>,
}

impl Registry {
    fn ensure_initialized(self: &Self) -> TransportResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(TransportError::InvalidState("protocol has been uninitialized".to_owned()))
        }
    }

    fn pool(self: &mut Self, spec: PoolSpec) -> TransportResult<Arc<BufferPool>> {
        self.ensure_initialized()?;
        Ok(self.pools.entry(spec).or_insert_with(|| BufferPool::new(spec)).clone())
    }

    fn next_channel_id(self: &mut Self) -> ChannelId {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        id
    }
}

/// Creates channels and servers and keeps track of them along with the buffer pools
/// they share. Everything it created is torn down by uninitialize(), or when the
/// protocol is dropped.
pub struct Protocol {
    registry: Mutex<Registry>,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol {
    pub fn new() -> Self {
        info!("Protocol: Initialized");
        Self {
            registry: Mutex::new(Registry {
                initialized: true,
                next_channel_id: 1,
                next_server_id: 1,
                channels: HashMap::new(),
                servers: HashMap::new(),
                pools: HashMap::new(),
            }),
        }
    }

    pub fn is_initialized(self: &Self) -> bool {
        self.registry().initialized
    }

    /// Returns the shared pool for this spec, creating it on first use
    pub fn get_pool(self: &Self, spec: PoolSpec) -> TransportResult<Arc<BufferPool>> {
        self.registry().pool(spec)
    }

    /// Opens a TCP connection and wraps it in a client channel. The channel still
    /// has to complete its handshake through init().
    pub fn connect(self: &Self, options: &ConnectOptions) -> TransportResult<ChannelHandle> {
        self.registry().ensure_initialized()?;
        options.channel.validate()?;

        let timeout = Duration::from_millis(options.connect_timeout_ms);
        let stream = connect_tcp(&options.address, timeout)
            .map_err(|e| TransportError::socket(format!("connecting to {}", options.address), e))?;
        self.create_client_channel(options, Box::new(stream))
    }

    /// Creates a client channel over a stream that is already connected
    pub fn create_client_channel(
        self: &Self,
        options: &ConnectOptions,
        stream: Box<dyn SocketStream>,
    ) -> TransportResult<ChannelHandle> {
        let mut registry = self.registry();
        let pool = registry.pool(PoolSpec::unbounded(options.channel.max_message_size as usize))?;
        let id = registry.next_channel_id();

        let channel = Channel::client(id, &options.address, options.channel.clone(), stream, &pool)?;
        let handle = ChannelHandle::new(channel);
        registry.channels.insert(id, handle.clone());
        Ok(handle)
    }

    /// Starts listening. Channels accepted on the server share one pool sized by
    /// the bind options.
    pub fn create_server(self: &Self, options: &BindOptions) -> TransportResult<ServerHandle> {
        let mut registry = self.registry();
        let spec = PoolSpec::new(options.max_message_size as usize, options.shared_pool_size);
        let pool = registry.pool(spec)?;
        let id = registry.next_server_id;

        let server = Server::bind(id, options, &pool)
            .map_err(|e| TransportError::socket(format!("binding {}", options.address), e))?;
        registry.next_server_id += 1;

        let handle = ServerHandle::new(server);
        registry.servers.insert(id, handle.clone());
        Ok(handle)
    }

    /// Picks up one pending connection from the server. Returns None when nobody is
    /// waiting.
    pub fn accept(self: &Self, server: &ServerHandle, options: &AcceptOptions) -> TransportResult<Option<ChannelHandle>> {
        self.registry().ensure_initialized()?;
        let accepted = server
            .lock()
            .accept()
            .map_err(|e| TransportError::socket(format!("accepting on server {}", server.id()), e))?;
        match accepted {
            Some(stream) => self.create_accepted_channel(server, options, Box::new(stream)).map(Some),
            None => Ok(None),
        }
    }

    /// Creates a channel for a connection that arrived at the server
    pub fn create_accepted_channel(
        self: &Self,
        server: &ServerHandle,
        options: &AcceptOptions,
        stream: Box<dyn SocketStream>,
    ) -> TransportResult<ChannelHandle> {
        let pool = server.pool();
        let mut registry = self.registry();
        registry.ensure_initialized()?;
        let id = registry.next_channel_id();

        let channel = Channel::accepted(id, server.id(), options.channel.clone(), stream, &pool)?;
        let handle = ChannelHandle::new(channel);
        registry.channels.insert(id, handle.clone());
        Ok(handle)
    }

    pub fn channel(self: &Self, id: ChannelId) -> Option<ChannelHandle> {
        self.registry().channels.get(&id).cloned()
    }

    pub fn server(self: &Self, id: ServerId) -> Option<ServerHandle> {
        self.registry().servers.get(&id).cloned()
    }

    /// Closes a channel and stops tracking it
    pub fn close_channel(self: &Self, channel: &ChannelHandle) -> TransportResult<()> {
        self.registry().channels.remove(&channel.id());
        channel.close()
    }

    pub fn close_server(self: &Self, server: &ServerHandle) {
        self.registry().servers.remove(&server.id());
        server.close();
    }

    pub fn channel_count(self: &Self) -> usize {
        self.registry().channels.len()
    }

    pub fn server_count(self: &Self) -> usize {
        self.registry().servers.len()
    }

    pub fn pool_count(self: &Self) -> usize {
        self.registry().pools.len()
    }

    /// Closes every channel and server and releases every pool. Safe to call more
    /// than once, later calls do nothing.
    pub fn uninitialize(self: &Self) {
        let (channels, servers, pools) = {
            let mut registry = self.registry();
            if !registry.initialized {
                return;
            }
            registry.initialized = false;
            (
                registry.channels.drain().map(|(_, c)| c).collect::<Vec<_>>(),
                registry.servers.drain().map(|(_, s)| s).collect::<Vec<_>>(),
                registry.pools.drain().map(|(_, p)| p).collect::<Vec<_>>(),
            )
        };

        info!(
            "Protocol: Uninitializing {} channels, {} servers and {} pools",
            channels.len(),
            servers.len(),
            pools.len()
        );

        for channel in &channels {
            // Channels that already failed report ChannelNotActive here
            if let Err(e) = channel.close() {
                warn!("Protocol: Channel {} {e}", channel.id());
            }
        }
        for server in &servers {
            server.close();
        }
        for pool in &pools {
            pool.close();
        }
    }

    fn registry(self: &Self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        self.uninitialize();
    }
}
