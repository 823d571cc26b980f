use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{info, warn};

use super::write_flags::WriteFlags;

/// The byte stream underneath a channel. Implementations never block: a write that
/// cannot proceed returns Ok(0) and a read with nothing available returns WouldBlock.
pub trait SocketStream: Send {
    /// Writes as much of `bytes` as the stream accepts right now. `flags` are the
    /// effective write flags of the submission these bytes belong to.
    fn write(&mut self, bytes: &[u8], flags: WriteFlags) -> io::Result<usize>;

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    fn shutdown(&mut self) -> io::Result<()>;

    fn peer(&self) -> String;
}

/// Opens a non-blocking TCP stream with Nagle disabled. The address is a host name
/// or IP address with a port, every address it resolves to is tried in turn.
pub fn connect_tcp(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;
    for socket_address in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&socket_address, timeout) {
            Ok(stream) => {
                prepare_tcp(&stream)?;
                info!("Tcp: Connected to {address} at {socket_address}");
                return Ok(stream);
            }
            Err(e) => {
                warn!("Tcp: Unable to connect to {socket_address} for {address}: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(ErrorKind::AddrNotAvailable, format!("{address} did not resolve to any address"))
    }))
}

pub(crate) fn prepare_tcp(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)
}

impl SocketStream for TcpStream {
    fn write(&mut self, bytes: &[u8], _flags: WriteFlags) -> io::Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match Write::write(self, &bytes[written..]) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "Tcp: Stream accepted no bytes")),
                Ok(count) => written += count,
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => {}
                    ErrorKind::TimedOut => {
                        warn!("Tcp: Timeout writing to stream: {e}");
                        break;
                    }
                    _ => return Err(e),
                },
            }
        }
        Ok(written)
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match Read::read(self, buffer) {
            Ok(0) if !buffer.is_empty() => Err(io::Error::new(
                ErrorKind::ConnectionAborted,
                "Tcp: Stream closed by other party",
            )),
            result => result,
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }

    fn peer(&self) -> String {
        self.peer_addr().map_or_else(|_| "unknown".to_owned(), |a| a.to_string())
    }
}

/// In-memory streams for tests, a pair behaves like the two ends of a socket
#[cfg(test)]
pub(crate) mod memory {
    use std::{
        collections::VecDeque,
        io::{self, ErrorKind},
        sync::{Arc, Mutex},
    };

    use super::SocketStream;
    use crate::sockets::write_flags::WriteFlags;

    #[derive(Default)]
    pub(crate) struct Wire {
        pub bytes: VecDeque<u8>,
        pub closed: bool,
    }

    #[derive(Default)]
    pub(crate) struct Controls {
        /// Upper bound on bytes accepted per write call, None for unlimited
        pub write_limit: Option<usize>,
        pub fail_writes: bool,
        pub write_calls: usize,
        pub flags_seen: Vec<WriteFlags>,
    }

    pub(crate) struct MemoryStream {
        pub incoming: Arc<Mutex<Wire>>,
        pub outgoing: Arc<Mutex<Wire>>,
        pub controls: Arc<Mutex<Controls>>,
        pub shutdowns: Arc<Mutex<usize>>,
    }

    pub(crate) fn pair() -> (MemoryStream, MemoryStream) {
        let a_to_b = Arc::new(Mutex::new(Wire::default()));
        let b_to_a = Arc::new(Mutex::new(Wire::default()));
        let a = MemoryStream {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
            controls: Arc::new(Mutex::new(Controls::default())),
            shutdowns: Arc::new(Mutex::new(0)),
        };
        let b = MemoryStream {
            incoming: a_to_b,
            outgoing: b_to_a,
            controls: Arc::new(Mutex::new(Controls::default())),
            shutdowns: Arc::new(Mutex::new(0)),
        };
        (a, b)
    }

    impl SocketStream for MemoryStream {
        fn write(&mut self, bytes: &[u8], flags: WriteFlags) -> io::Result<usize> {
            let mut controls = self.controls.lock().unwrap();
            controls.write_calls += 1;
            controls.flags_seen.push(flags);
            if controls.fail_writes {
                return Err(io::Error::from(ErrorKind::ConnectionReset));
            }
            let mut wire = self.outgoing.lock().unwrap();
            if wire.closed {
                return Err(io::Error::from(ErrorKind::BrokenPipe));
            }
            let count = controls.write_limit.map_or(bytes.len(), |limit| limit.min(bytes.len()));
            wire.bytes.extend(&bytes[..count]);
            Ok(count)
        }

        fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
            let mut wire = self.incoming.lock().unwrap();
            if wire.bytes.is_empty() {
                return if wire.closed {
                    Err(io::Error::from(ErrorKind::ConnectionAborted))
                } else {
                    Err(io::Error::from(ErrorKind::WouldBlock))
                };
            }
            let count = buffer.len().min(wire.bytes.len());
            for (i, byte) in wire.bytes.drain(..count).enumerate() {
                buffer[i] = byte;
            }
            Ok(count)
        }

        fn shutdown(&mut self) -> io::Result<()> {
            *self.shutdowns.lock().unwrap() += 1;
            self.outgoing.lock().unwrap().closed = true;
            Ok(())
        }

        fn peer(&self) -> String {
            "memory".to_owned()
        }
    }
}
