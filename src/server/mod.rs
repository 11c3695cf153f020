use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{AppConfig, ServerConfig};

#[derive(Debug)]
pub enum ServerError {
    Bind { address: String, source: io::Error },
    SetNonBlocking { source: io::Error },
    Accept { source: io::Error },
    ConfigureAcceptedStream { source: io::Error },
    StreamClone { source: io::Error },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind client endpoint on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set client endpoint to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept client connection: {source}"),
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted client stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone client stream for full duplex IO: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

// One client socket. Reads block for at most `read_timeout` so reader threads can
// notice shutdown; writes always send whole frames.
pub struct PersistentConnection {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl PersistentConnection {
    fn new(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        read_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let configure = |result: io::Result<()>| {
            result.map_err(|source| ServerError::ConfigureAcceptedStream { source })
        };
        configure(stream.set_nonblocking(false))?;
        configure(stream.set_nodelay(true))?;
        configure(stream.set_read_timeout(Some(read_timeout.max(Duration::from_millis(1)))))?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    // `WouldBlock`/`TimedOut` mean the read timeout elapsed with nothing to read.
    pub fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.lock_reader().read(buffer)
    }

    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.lock_writer();
        writer.write_all(frame)?;
        writer.flush()
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.lock_writer().shutdown(Shutdown::Both)
    }

    fn lock_reader(&self) -> MutexGuard<'_, TcpStream> {
        self.reader.lock().expect("connection reader lock poisoned")
    }

    fn lock_writer(&self) -> MutexGuard<'_, TcpStream> {
        self.writer.lock().expect("connection writer lock poisoned")
    }
}

pub fn is_read_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

pub struct TcpServer {
    listener: TcpListener,
    read_timeout: Duration,
    next_connection_id: AtomicU64,
    active_connections: Mutex<HashMap<u64, Arc<PersistentConnection>>>,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig, read_timeout: Duration) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            read_timeout,
            next_connection_id: AtomicU64::new(1),
            active_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, ServerError> {
        Self::bind(
            &app_config.server,
            Duration::from_millis(app_config.broker.poll_interval_ms),
        )
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn try_accept_persistent(&self) -> Result<Option<Arc<PersistentConnection>>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let connection =
                    PersistentConnection::new(id, stream, peer_addr, self.read_timeout)?;
                let connection = Arc::new(connection);
                self.lock_connections().insert(id, Arc::clone(&connection));
                Ok(Some(connection))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::Accept { source }),
        }
    }

    pub fn connection(&self, id: u64) -> Option<Arc<PersistentConnection>> {
        self.lock_connections().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn drop_connection(&self, id: u64) {
        if let Some(connection) = self.lock_connections().remove(&id) {
            let _ = connection.shutdown();
        }
    }

    pub fn shutdown_all_connections(&self) {
        let mut connections = self.lock_connections();
        for connection in connections.values() {
            let _ = connection.shutdown();
        }
        connections.clear();
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<u64, Arc<PersistentConnection>>> {
        self.active_connections
            .lock()
            .expect("active connections lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    use super::{is_read_timeout, TcpServer};
    use crate::config::{AppConfig, ServerConfig};

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
        }
    }

    fn accept(server: &TcpServer) -> std::sync::Arc<super::PersistentConnection> {
        for _ in 0..100 {
            if let Some(connection) = server
                .try_accept_persistent()
                .expect("accept poll should not fail")
            {
                return connection;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("server did not accept connection");
    }

    #[test]
    fn accept_poll_returns_none_without_clients() {
        let server = TcpServer::bind(&local_config(), Duration::from_millis(20))
            .expect("server should bind");

        assert!(server
            .try_accept_persistent()
            .expect("accept poll should not fail")
            .is_none());
    }

    #[test]
    fn accepted_connection_is_full_duplex() {
        let server = TcpServer::bind(&local_config(), Duration::from_millis(20))
            .expect("server should bind");
        let addr = server.local_addr().expect("local addr should exist");
        let mut client = TcpStream::connect(addr).expect("client should connect");

        let connection = accept(&server);
        assert_eq!(server.connection_count(), 1);
        assert!(server.connection(connection.id()).is_some());

        client.write_all(b"ping").expect("client write");
        let mut buffer = [0_u8; 4];
        let mut read = 0;
        while read < buffer.len() {
            match connection.read(&mut buffer[read..]) {
                Ok(n) => read += n,
                Err(error) if is_read_timeout(&error) => continue,
                Err(error) => panic!("unexpected read error: {error}"),
            }
        }
        assert_eq!(&buffer, b"ping");

        connection.write_frame(b"pong").expect("server write");
        let mut reply = [0_u8; 4];
        client.read_exact(&mut reply).expect("client read");
        assert_eq!(&reply, b"pong");

        server.drop_connection(connection.id());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn idle_read_times_out() {
        let server = TcpServer::bind(&local_config(), Duration::from_millis(20))
            .expect("server should bind");
        let addr = server.local_addr().expect("local addr should exist");
        let _client = TcpStream::connect(addr).expect("client should connect");
        let connection = accept(&server);

        let mut buffer = [0_u8; 8];
        let error = connection
            .read(&mut buffer)
            .expect_err("idle read should time out");
        assert!(is_read_timeout(&error));
    }

    #[test]
    fn builds_server_from_app_config() {
        let mut app_config = AppConfig::default();
        app_config.server = local_config();

        let server =
            TcpServer::from_app_config(&app_config).expect("server should build from app config");
        let bound = server.local_addr().expect("bound address should be present");
        assert_eq!(bound.ip().to_string(), "127.0.0.1");
    }
}
