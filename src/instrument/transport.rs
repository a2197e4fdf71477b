//! Line-oriented transport used by the text-protocol adapters.
//!
//! Adapters only need "write a command" and "write a command, read one
//! reply". Bus specifics (VISA, serial, raw sockets) live behind the
//! [`Transport`] trait. [`TcpTransport`] covers instruments reachable over a
//! plain TCP socket, such as Ethernet lock-in amplifiers.
//!
//! A query that times out or is cancelled leaves its reply on the wire. The
//! connection is then marked out of sync, and the next command first drains
//! whatever arrives until the line stays quiet for one timeout.

use super::capabilities::FaultResult;
use super::InstrumentId;
use crate::error::InstrumentFault;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Line-oriented command channel to one instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the instrument at the other end, used in fault reports.
    fn instrument(&self) -> &InstrumentId;

    /// Send a command without waiting for a reply.
    async fn write(&self, command: &str) -> FaultResult<()>;

    /// Send a command and read `count` reply lines (terminators stripped).
    async fn query_lines(&self, command: &str, count: usize) -> FaultResult<Vec<String>>;

    /// Send a command and read one reply line.
    async fn query(&self, command: &str) -> FaultResult<String> {
        self.query_lines(command, 1)
            .await?
            .pop()
            .ok_or_else(|| InstrumentFault::comm(self.instrument().clone(), "no reply"))
    }
}

struct TcpConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Set while a query's reply has not been read yet.
    awaiting_reply: bool,
}

/// TCP transport with per-command timeout.
pub struct TcpTransport {
    instrument: InstrumentId,
    address: String,
    timeout: Duration,
    line_terminator: String,
    connection: Mutex<TcpConnection>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("instrument", &self.instrument)
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TcpTransport {
    /// Connect to `address` (e.g. "192.168.0.20:50000").
    pub async fn connect(
        instrument: InstrumentId,
        address: impl Into<String>,
        timeout: Option<Duration>,
    ) -> FaultResult<Self> {
        let address = address.into();
        let timeout = timeout.unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS));

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| InstrumentFault::Timeout {
                instrument: instrument.clone(),
                timeout_ms: millis(timeout),
            })?
            .map_err(|e| InstrumentFault::comm(instrument.clone(), e.to_string()))?;
        debug!(instrument = %instrument, %address, "TCP transport connected");

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            instrument,
            address,
            timeout,
            line_terminator: "\n".to_string(),
            connection: Mutex::new(TcpConnection {
                reader: BufReader::new(read_half),
                writer: write_half,
                awaiting_reply: false,
            }),
        })
    }

    /// Set line terminator appended to commands.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    fn timeout_fault(&self) -> InstrumentFault {
        InstrumentFault::Timeout {
            instrument: self.instrument.clone(),
            timeout_ms: millis(self.timeout),
        }
    }

    /// Discard late replies left behind by an abandoned query.
    async fn resync(&self, connection: &mut TcpConnection) -> FaultResult<()> {
        if !connection.awaiting_reply {
            return Ok(());
        }
        let mut discarded = 0usize;
        loop {
            let mut stale = String::new();
            match tokio::time::timeout(self.timeout, connection.reader.read_line(&mut stale)).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    return Err(InstrumentFault::comm(
                        self.instrument.clone(),
                        "connection closed by instrument",
                    ))
                }
                Ok(Ok(_)) => {
                    discarded += 1;
                    trace!(instrument = %self.instrument, stale = stale.trim_end(), "discarded");
                }
                Ok(Err(e)) => return Err(InstrumentFault::comm(self.instrument.clone(), e.to_string())),
            }
        }
        warn!(instrument = %self.instrument, discarded, "transport resynchronised after missed reply");
        connection.awaiting_reply = false;
        Ok(())
    }

    async fn send(&self, connection: &mut TcpConnection, command: &str) -> FaultResult<()> {
        let line = format!("{}{}", command, self.line_terminator);
        trace!(instrument = %self.instrument, command, "write");
        tokio::time::timeout(self.timeout, connection.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| self.timeout_fault())?
            .map_err(|e| InstrumentFault::comm(self.instrument.clone(), e.to_string()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    async fn write(&self, command: &str) -> FaultResult<()> {
        let mut connection = self.connection.lock().await;
        self.resync(&mut connection).await?;
        self.send(&mut connection, command).await
    }

    async fn query_lines(&self, command: &str, count: usize) -> FaultResult<Vec<String>> {
        let mut connection = self.connection.lock().await;
        self.resync(&mut connection).await?;
        connection.awaiting_reply = true;
        self.send(&mut connection, command).await?;

        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            let mut reply = String::new();
            let read = tokio::time::timeout(self.timeout, connection.reader.read_line(&mut reply))
                .await
                .map_err(|_| self.timeout_fault())?
                .map_err(|e| InstrumentFault::comm(self.instrument.clone(), e.to_string()))?;
            if read == 0 {
                return Err(InstrumentFault::comm(
                    self.instrument.clone(),
                    "connection closed by instrument",
                ));
            }
            trace!(instrument = %self.instrument, reply = reply.trim_end(), "read");
            replies.push(reply.trim_end_matches(&['\r', '\n'][..]).to_string());
        }
        connection.awaiting_reply = false;
        Ok(replies)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport for adapter tests.

    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    pub struct ScriptedTransport {
        id: InstrumentId,
        pub replies: StdMutex<std::collections::VecDeque<FaultResult<String>>>,
        pub sent: StdMutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn new(id: &str, replies: Vec<FaultResult<String>>) -> Self {
            Self {
                id: InstrumentId::new(id),
                replies: StdMutex::new(replies.into()),
                sent: StdMutex::new(Vec::new()),
            }
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn instrument(&self) -> &InstrumentId {
            &self.id
        }

        async fn write(&self, command: &str) -> FaultResult<()> {
            self.sent.lock().unwrap().push(command.to_string());
            Ok(())
        }

        async fn query_lines(&self, command: &str, count: usize) -> FaultResult<Vec<String>> {
            self.sent.lock().unwrap().push(command.to_string());
            let mut replies = self.replies.lock().unwrap();
            (0..count)
                .map(|_| {
                    replies.pop_front().unwrap_or_else(|| {
                        Err(InstrumentFault::comm(self.id.clone(), "no scripted reply"))
                    })
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn query_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"X.\n");
            socket.write_all(b"1.5E-3\r\n").await.unwrap();
        });

        let transport = TcpTransport::connect(InstrumentId::new("lockin"), addr.to_string(), None)
            .await
            .unwrap();
        let reply = transport.query("X.").await.unwrap();
        assert_eq!(reply, "1.5E-3");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn silent_instrument_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let transport = TcpTransport::connect(
            InstrumentId::new("lockin"),
            addr.to_string(),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        let err = transport.query("X.").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CommTimeout);
    }

    /// Answers every `X.` line with the next reading, after the given delay.
    async fn serve_readings(listener: TcpListener, replies: Vec<(Duration, &'static str)>) {
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        for (delay, reply) in replies {
            let command = lines.next_line().await.unwrap().unwrap();
            assert_eq!(command, "X.");
            tokio::time::sleep(delay).await;
            write_half.write_all(reply.as_bytes()).await.unwrap();
        }
        // hold the socket open until the client is done
        let _ = lines.next_line().await;
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_by_next_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_readings(
            listener,
            vec![
                (Duration::from_millis(150), "111.0\n"),
                (Duration::ZERO, "222.0\n"),
            ],
        ));

        let transport = TcpTransport::connect(
            InstrumentId::new("lockin"),
            addr.to_string(),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap();
        let first = transport.query("X.").await.unwrap_err();
        assert_eq!(first.kind(), crate::error::ErrorKind::CommTimeout);

        let second = transport.query("X.").await.unwrap();
        assert_eq!(second, "222.0");
        drop(transport);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_query_is_drained_before_next_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_readings(
            listener,
            vec![
                (Duration::from_millis(80), "1.0\n"),
                (Duration::ZERO, "2.0\n"),
            ],
        ));

        let transport = TcpTransport::connect(
            InstrumentId::new("lockin"),
            addr.to_string(),
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        // caller gives up before the transport's own timeout
        let cancelled = tokio::time::timeout(Duration::from_millis(20), transport.query("X.")).await;
        assert!(cancelled.is_err());

        assert_eq!(transport.query("X.").await.unwrap(), "2.0");
        drop(transport);
        server.await.unwrap();
    }
}
