//! Per-connection I/O: handshake, reader task and writer task.
//!
//! The reader classifies every line, answers pings itself and hands
//! requests to the router. The writer drains the connection's outbound
//! queue. Either one stopping reports `LinkClosed` to the registry.

use std::time::Duration;

use tabgate_core::ConnectionId;
use tabgate_protocol::{encode_line, ControlMessage, Frame};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::commands::{CloseReason, ConnectionError, InboundRequest, RegistryCommand};
use super::transport::Link;

/// Maximum time a single write may take.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads one line. `Ok(None)` means the peer closed the transport.
///
/// Lines that are not valid UTF-8 are skipped.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ConnectionError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    loop {
        let mut buf = Vec::new();
        let bytes_read = reader.read_until(b'\n', &mut buf).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        match String::from_utf8(buf) {
            Ok(line) => return Ok(Some(line)),
            Err(e) => debug!(bytes = bytes_read, error = %e, "Skipping line that is not UTF-8"),
        }
    }
}

pub(crate) async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::Timeout("write")),
    }
}

/// Sends `hello` and waits for `helloAck`, returning the peer's instance id.
pub(crate) async fn handshake(link: &mut Link, limit: Duration) -> Result<String, ConnectionError> {
    let hello = encode_line(&ControlMessage::hello())?;
    write_line(&mut link.writer, &hello).await?;

    timeout(limit, await_hello_ack(link))
        .await
        .map_err(|_| ConnectionError::Timeout("handshake"))?
}

/// Pings received before the ack are answered; other frames are skipped.
async fn await_hello_ack(link: &mut Link) -> Result<String, ConnectionError> {
    loop {
        let Some(line) = read_line(&mut link.reader).await? else {
            return Err(ConnectionError::HandshakeRejected(
                "peer closed during handshake".to_string(),
            ));
        };

        match Frame::classify(&line) {
            Frame::Control(ControlMessage::HelloAck { instance_id }) => {
                if instance_id.trim().is_empty() {
                    return Err(ConnectionError::HandshakeRejected(
                        "empty instanceId".to_string(),
                    ));
                }
                return Ok(instance_id);
            }
            Frame::Control(ControlMessage::Ping) => {
                let pong = encode_line(&ControlMessage::pong_now())?;
                write_line(&mut link.writer, &pong).await?;
            }
            other => debug!(frame = ?other, "Ignoring frame before helloAck"),
        }
    }
}

/// Context shared by a connection's reader and writer tasks.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub id: ConnectionId,
    pub epoch: u64,
    pub registry: mpsc::WeakSender<RegistryCommand>,
}

impl LinkContext {
    async fn notify(&self, cmd: RegistryCommand) {
        if let Some(sender) = self.registry.upgrade() {
            let _ = sender.send(cmd).await;
        }
    }

    async fn report_closed(&self, reason: CloseReason) {
        self.notify(RegistryCommand::LinkClosed {
            id: self.id.clone(),
            epoch: self.epoch,
            reason,
        })
        .await;
    }
}

pub(crate) async fn run_reader(
    ctx: LinkContext,
    mut reader: Box<dyn AsyncBufRead + Send + Unpin>,
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::Sender<InboundRequest>,
) {
    loop {
        let line = match read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(connection_id = %ctx.id, epoch = ctx.epoch, "Peer closed connection");
                break;
            }
            Err(e) => {
                debug!(connection_id = %ctx.id, epoch = ctx.epoch, error = %e, "Read failed");
                break;
            }
        };

        ctx.notify(RegistryCommand::Touch {
            id: ctx.id.clone(),
            epoch: ctx.epoch,
        })
        .await;

        match Frame::classify(&line) {
            Frame::Control(ControlMessage::Ping) => match encode_line(&ControlMessage::pong_now()) {
                Ok(pong) => {
                    let _ = outbound.send(pong);
                }
                Err(e) => debug!(error = %e, "Failed to encode pong"),
            },
            Frame::Control(ControlMessage::Pong { .. }) => {}
            Frame::Control(ControlMessage::PortListResponse { ports }) => {
                ctx.notify(RegistryCommand::PortsDiscovered { ports }).await;
            }
            Frame::Control(other) => {
                debug!(connection_id = %ctx.id, frame = ?other, "Ignoring control frame");
            }
            Frame::Request(envelope) => {
                let request = InboundRequest {
                    connection: ctx.id.clone(),
                    epoch: ctx.epoch,
                    envelope,
                };
                if inbound.send(request).await.is_err() {
                    debug!(connection_id = %ctx.id, "Router gone, dropping request");
                }
            }
            Frame::Unrecognized(reason) => {
                debug!(connection_id = %ctx.id, reason = %reason, "Skipping unrecognized frame");
            }
        }
    }

    ctx.report_closed(CloseReason::PeerClosed).await;
}

pub(crate) async fn run_writer(
    ctx: LinkContext,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = outbound.recv().await {
        if let Err(e) = write_line(&mut writer, &line).await {
            debug!(connection_id = %ctx.id, epoch = ctx.epoch, error = %e, "Write failed");
            ctx.report_closed(CloseReason::WriteFailed).await;
            return;
        }
    }

    // Queue closed by the registry: the connection is going away.
    let _ = writer.shutdown().await;
}
