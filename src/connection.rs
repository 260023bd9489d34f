use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::bridge::Bridge;
use crate::codec::{ProtocolVersion, ReplyCodec};
use crate::config::EndpointAddr;
use crate::errors::{ConnectionFailureKind, Error, Result, TimeoutPhase};

/// Opens the transport stream for an endpoint, bounded by the connect
/// timeout.
pub(crate) async fn open(addr: &EndpointAddr, timeout: Duration) -> Result<TcpStream> {
    let connect = TcpStream::connect((addr.host.as_str(), addr.port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => {
            // Command/reply traffic is latency-bound small frames.
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(err)) => {
            debug!(endpoint = %addr, error = %err, "connect failed");
            Err(Error::connection(ConnectionFailureKind::UnableToConnect))
        }
        Err(_) => Err(Error::timeout(TimeoutPhase::Connect)),
    }
}

/// Write half of a live connection, owned by whichever task holds the
/// bridge's single-writer mutex. The bridge is authoritative for in-flight
/// state; this type only moves bytes and keeps transfer counters.
pub(crate) struct ConnectionWriter {
    stream: OwnedWriteHalf,
    pub(crate) generation: u64,
    bytes_out: u64,
}

impl ConnectionWriter {
    pub(crate) fn new(stream: OwnedWriteHalf, generation: u64) -> ConnectionWriter {
        ConnectionWriter {
            stream,
            generation,
            bytes_out: 0,
        }
    }

    pub(crate) async fn write_frames(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.bytes_out += bytes.len() as u64;
        Ok(())
    }

    pub(crate) fn bytes_out(&self) -> u64 {
        self.bytes_out
    }
}

/// Drives the inbound half: reads into the codec buffer, decodes complete
/// frames and hands each to the bridge. Exits on the first IO or protocol
/// failure, reporting the cause so the bridge can run its state machine.
pub(crate) fn spawn_read_loop(
    bridge: Arc<Bridge>,
    read_half: OwnedReadHalf,
    generation: u64,
    protocol: ProtocolVersion,
    max_frame: usize,
) {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(read_half, ReplyCodec::new(protocol, max_frame));
        loop {
            match frames.next().await {
                Some(Ok(reply)) => bridge.on_reply(generation, reply),
                Some(Err(err)) => {
                    let cause = match &err {
                        Error::Protocol(_) => ConnectionFailureKind::ProtocolFailure,
                        Error::ConnectionFailed { cause } => *cause,
                        _ => ConnectionFailureKind::SocketFailure,
                    };
                    debug!(error = %err, "read loop terminating");
                    bridge.connection_lost(generation, cause).await;
                    return;
                }
                None => {
                    bridge
                        .connection_lost(generation, ConnectionFailureKind::SocketClosed)
                        .await;
                    return;
                }
            }
        }
    });
}
