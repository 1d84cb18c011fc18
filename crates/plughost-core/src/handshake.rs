use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    AwaitingHandshake,
    Ready,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Unix,
    Stdio,
}

impl TransportKind {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
            Self::Stdio => "stdio",
        }
    }

    pub fn from_tag(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "unix" => Some(Self::Unix),
            "stdio" => Some(Self::Stdio),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no handshake within {0:?}")]
    Timeout(Duration),
    #[error("process closed its output before the handshake")]
    Closed,
    #[error("read handshake failed: {0}")]
    Io(String),
    #[error("malformed handshake line: {0:?}")]
    Malformed(String),
    #[error("unsupported protocol version {offered} (host supports {supported:?})")]
    UnsupportedVersion { offered: u32, supported: Vec<u32> },
    #[error("unsupported transport: {0:?}")]
    UnsupportedTransport(String),
}

/// The `<protocol-version>|<transport-kind>|<endpoint>` line a plugin prints
/// before it starts serving.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeLine {
    pub protocol_version: u32,
    pub transport: TransportKind,
    pub endpoint: String,
}

impl HandshakeLine {
    pub fn format(&self) -> String {
        format!(
            "{}|{}|{}",
            self.protocol_version,
            self.transport.as_tag(),
            self.endpoint
        )
    }

    pub fn parse(line: &str, supported: &[u32]) -> Result<Self, HandshakeError> {
        let trimmed = line.trim();
        let parts = trimmed.split('|').collect::<Vec<_>>();
        let [version, transport, endpoint] = parts.as_slice() else {
            return Err(HandshakeError::Malformed(trimmed.to_string()));
        };

        let offered = version
            .trim()
            .parse::<u32>()
            .map_err(|_| HandshakeError::Malformed(trimmed.to_string()))?;
        let protocol_version =
            negotiate_protocol(supported, offered).ok_or_else(|| {
                HandshakeError::UnsupportedVersion {
                    offered,
                    supported: supported.to_vec(),
                }
            })?;

        let transport = TransportKind::from_tag(transport)
            .ok_or_else(|| HandshakeError::UnsupportedTransport(transport.to_string()))?;

        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(HandshakeError::Malformed(trimmed.to_string()));
        }

        Ok(Self {
            protocol_version,
            transport,
            endpoint: endpoint.to_string(),
        })
    }
}

pub fn negotiate_protocol(supported: &[u32], offered: u32) -> Option<u32> {
    if offered == 0 {
        return None;
    }
    supported.contains(&offered).then_some(offered)
}

/// Host side of the handshake for one process.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    supported: Vec<u32>,
}

impl Handshake {
    pub fn new(supported: Vec<u32>) -> Self {
        Self {
            state: HandshakeState::NotStarted,
            supported,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn process_spawned(&mut self) {
        if self.state == HandshakeState::NotStarted {
            self.state = HandshakeState::AwaitingHandshake;
        }
    }

    /// Reads the handshake line with a deadline. On success the reader is
    /// handed back so the stdio transport can keep using it.
    pub fn await_line<R>(
        &mut self,
        reader: BufReader<R>,
        timeout: Duration,
    ) -> Result<(HandshakeLine, BufReader<R>), HandshakeError>
    where
        R: Read + Send + 'static,
    {
        self.process_spawned();
        let result = read_first_line(reader, timeout).and_then(|(line, reader)| {
            HandshakeLine::parse(&line, &self.supported).map(|parsed| (parsed, reader))
        });
        self.state = match result {
            Ok(_) => HandshakeState::Ready,
            Err(_) => HandshakeState::Failed,
        };
        result
    }
}

/// Longest handshake line the host will buffer, newline included.
pub const MAX_HANDSHAKE_LINE: usize = 4096;

fn read_first_line<R>(
    mut reader: BufReader<R>,
    timeout: Duration,
) -> Result<(String, BufReader<R>), HandshakeError>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = loop {
            let mut line = String::new();
            match (&mut reader)
                .take(MAX_HANDSHAKE_LINE as u64)
                .read_line(&mut line)
            {
                Ok(0) => break Err(HandshakeError::Closed),
                Ok(n) if n == MAX_HANDSHAKE_LINE && !line.ends_with('\n') => {
                    break Err(HandshakeError::Malformed(format!(
                        "handshake line exceeds {MAX_HANDSHAKE_LINE} bytes"
                    )))
                }
                Ok(_) if line.trim().is_empty() => continue,
                Ok(_) => break Ok(line),
                Err(err) => break Err(HandshakeError::Io(err.to_string())),
            }
        };
        let _ = tx.send(result.map(|line| (line, reader)));
    });

    // The reader thread exits by itself once the caller kills the process.
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(HandshakeError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(HandshakeError::Closed),
    }
}
