use crate::handshake::TransportKind;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

type Closer = Arc<dyn Fn() + Send + Sync>;

/// Both halves of a byte stream an RPC session runs over.
pub struct Connection {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
    closer: Option<Closer>,
}

impl Connection {
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(writer),
            closer: None,
        }
    }

    /// Uses an already buffered reader, e.g. the one the handshake line was
    /// read from.
    pub fn from_buffered(
        reader: impl BufRead + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            closer: None,
        }
    }

    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let _ = stream.set_nodelay(true);
        let reader = stream.try_clone()?;
        let closer_stream = stream.try_clone()?;
        Ok(Self {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(stream),
            closer: Some(Arc::new(move || {
                let _ = closer_stream.shutdown(Shutdown::Both);
            })),
        })
    }

    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let closer_stream = stream.try_clone()?;
        Ok(Self {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(stream),
            closer: Some(Arc::new(move || {
                let _ = closer_stream.shutdown(Shutdown::Both);
            })),
        })
    }

    /// Dials the endpoint announced in a handshake line.
    pub fn dial(kind: TransportKind, endpoint: &str, timeout: Duration) -> Result<Self, String> {
        let timeout = timeout.max(Duration::from_millis(1));
        match kind {
            TransportKind::Tcp => {
                let addrs: Vec<SocketAddr> = endpoint
                    .to_socket_addrs()
                    .map_err(|err| format!("resolve {endpoint} failed: {err}"))?
                    .collect();
                let mut last_err = format!("no address for {endpoint}");
                for addr in addrs {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(stream) => {
                            return Self::from_tcp(stream)
                                .map_err(|err| format!("prepare tcp stream failed: {err}"))
                        }
                        Err(err) => last_err = format!("connect {addr} failed: {err}"),
                    }
                }
                Err(last_err)
            }
            #[cfg(unix)]
            TransportKind::Unix => {
                let stream = std::os::unix::net::UnixStream::connect(endpoint)
                    .map_err(|err| format!("connect {endpoint} failed: {err}"))?;
                Self::from_unix(stream).map_err(|err| format!("prepare unix stream failed: {err}"))
            }
            #[cfg(not(unix))]
            TransportKind::Unix => Err("unix sockets are not available on this platform".to_string()),
            TransportKind::Stdio => {
                Err("stdio transport is attached to the process pipes, not dialed".to_string())
            }
        }
    }

    /// Closes the underlying stream so blocked readers wake up. No-op for
    /// pipes, which close when the process exits.
    pub fn closer(&self) -> Option<Arc<dyn Fn() + Send + Sync>> {
        self.closer.clone()
    }

    pub fn into_parts(self) -> (Box<dyn BufRead + Send>, Box<dyn Write + Send>) {
        (self.reader, self.writer)
    }
}

/// Plugin-side endpoint waiting for the host to dial in.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: std::os::unix::net::UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    pub fn bind(kind: TransportKind) -> io::Result<Self> {
        match kind {
            TransportKind::Tcp => Ok(Self::Tcp(TcpListener::bind("127.0.0.1:0")?)),
            #[cfg(unix)]
            TransportKind::Unix => {
                let path = std::env::temp_dir().join(format!(
                    "plughost-{}-{}.sock",
                    std::process::id(),
                    unique_suffix()
                ));
                let _ = std::fs::remove_file(&path);
                let listener = std::os::unix::net::UnixListener::bind(&path)?;
                Ok(Self::Unix { listener, path })
            }
            #[cfg(not(unix))]
            TransportKind::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
            TransportKind::Stdio => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stdio transport does not listen",
            )),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Tcp(_) => TransportKind::Tcp,
            #[cfg(unix)]
            Self::Unix { .. } => TransportKind::Unix,
        }
    }

    pub fn endpoint(&self) -> io::Result<String> {
        match self {
            Self::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            #[cfg(unix)]
            Self::Unix { path, .. } => Ok(path.display().to_string()),
        }
    }

    pub fn accept(&self) -> io::Result<Connection> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                Connection::from_tcp(stream)
            }
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept()?;
                Connection::from_unix(stream)
            }
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(unix)]
fn unique_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead as _;
    use std::thread;

    #[test]
    fn tcp_listener_round_trip() {
        let listener = Listener::bind(TransportKind::Tcp).expect("bind");
        let endpoint = listener.endpoint().expect("endpoint");
        let server = thread::spawn(move || {
            let conn = listener.accept().expect("accept");
            let (mut reader, mut writer) = conn.into_parts();
            let mut line = String::new();
            reader.read_line(&mut line).expect("read");
            writer.write_all(line.to_uppercase().as_bytes()).expect("write");
            writer.flush().expect("flush");
        });

        let conn = Connection::dial(TransportKind::Tcp, &endpoint, Duration::from_secs(2))
            .expect("dial");
        let (mut reader, mut writer) = conn.into_parts();
        writer.write_all(b"ping\n").expect("write");
        writer.flush().expect("flush");
        let mut line = String::new();
        reader.read_line(&mut line).expect("read");

        assert_eq!(line, "PING\n");
        server.join().expect("server thread");
    }

    #[test]
    fn dial_refuses_stdio_and_bad_endpoints() {
        assert!(Connection::dial(TransportKind::Stdio, "-", Duration::from_millis(10)).is_err());
        assert!(Connection::dial(TransportKind::Tcp, "not an address", Duration::from_millis(10)).is_err());
    }

    #[test]
    fn closer_wakes_blocked_reader() {
        let listener = Listener::bind(TransportKind::Tcp).expect("bind");
        let endpoint = listener.endpoint().expect("endpoint");
        let accept = thread::spawn(move || listener.accept().expect("accept"));

        let conn = Connection::dial(TransportKind::Tcp, &endpoint, Duration::from_secs(2))
            .expect("dial");
        let _server_side = accept.join().expect("accept thread");
        let closer = conn.closer().expect("tcp connections can be closed");
        let (mut reader, _writer) = conn.into_parts();

        let blocked = thread::spawn(move || {
            let mut line = String::new();
            reader.read_line(&mut line)
        });
        closer();
        let read = blocked.join().expect("reader thread");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[cfg(unix)]
    #[test]
    fn unix_listener_removes_socket_on_drop() {
        let listener = Listener::bind(TransportKind::Unix).expect("bind");
        let path = PathBuf::from(listener.endpoint().expect("endpoint"));
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
