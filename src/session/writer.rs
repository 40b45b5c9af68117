use std::time::Duration;

use log::{trace, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{CommandReply, DeviceError};

/// Reply of a command sent without id, answered once its frame is on the
/// wire. Dropped unanswered it reports the connection as closed.
pub(crate) struct WriteAck(Option<CommandReply>);

impl WriteAck {
    pub(crate) fn new(reply: CommandReply) -> Self {
        WriteAck(Some(reply))
    }

    /// Answer without writing anything
    pub(crate) fn fail(self, error: DeviceError) {
        self.send(Err(error));
    }

    fn send(mut self, result: Result<(), DeviceError>) {
        if let Some(reply) = self.0.take() {
            let _ = reply.send(result.map(|_| None));
        }
    }
}

impl Drop for WriteAck {
    fn drop(&mut self) {
        if let Some(reply) = self.0.take() {
            let _ = reply.send(Err(DeviceError::ConnectionClosed));
        }
    }
}

struct Outbound {
    frame: Vec<u8>,
    ack: Option<WriteAck>,
}

/// Writes queued frames in order on a task of its own, so a peer that stops
/// reading never holds up the reactor.
///
/// The first failed or stalled write ends the task and is reported once
/// through the receiver handed out by [`FrameWriter::spawn`]. Dropping the
/// writer aborts the task.
pub(crate) struct FrameWriter {
    tx: mpsc::UnboundedSender<Outbound>,
    handle: JoinHandle<()>,
}

impl FrameWriter {
    pub(crate) fn spawn<W>(device_id: String, writer: W, stall_timeout: Duration) -> (Self, oneshot::Receiver<String>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (failed_tx, failed_rx) = oneshot::channel();
        let handle = tokio::spawn(write_loop(device_id, writer, rx, failed_tx, stall_timeout));
        (FrameWriter { tx, handle }, failed_rx)
    }

    pub(crate) fn queue(&self, frame: Vec<u8>, ack: Option<WriteAck>) -> Result<(), DeviceError> {
        self.tx.send(Outbound { frame, ack }).map_err(|_| DeviceError::ConnectionClosed)
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn write_loop<W>(
    device_id: String,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    failed: oneshot::Sender<String>,
    stall_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(out) = rx.recv().await {
        let result = match tokio::time::timeout(stall_timeout, writer.write_all(&out.frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("write stalled for {} ms", stall_timeout.as_millis())),
        };

        match result {
            Ok(()) => {
                trace!("[{device_id}] {} bytes written", out.frame.len());
                if let Some(ack) = out.ack {
                    ack.send(Ok(()));
                }
            }
            Err(reason) => {
                warn!("[{device_id}] Write failed: {reason}");
                if let Some(ack) = out.ack {
                    ack.send(Err(DeviceError::Socket(reason.clone())));
                }
                /* frames still queued are dropped with the receiver, their acks report closed */
                let _ = failed.send(reason);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn ack() -> (WriteAck, oneshot::Receiver<Result<Option<serde_json::Value>, DeviceError>>) {
        let (tx, rx) = oneshot::channel();
        (WriteAck::new(tx), rx)
    }

    #[tokio::test]
    async fn test_frames_written_in_order_and_acked() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (writer, _failed) = FrameWriter::spawn("D".to_string(), ours, Duration::from_secs(1));

        let (first, first_rx) = ack();
        writer.queue(b"one\r\n".to_vec(), Some(first)).unwrap();
        writer.queue(b"two\r\n".to_vec(), None).unwrap();

        assert_eq!(first_rx.await.unwrap(), Ok(None));
        let mut buf = vec![0u8; 10];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one\r\ntwo\r\n");
    }

    #[tokio::test]
    async fn test_stalled_peer_is_reported() {
        /* nobody reads the other end, the pipe fills after 16 bytes */
        let (ours, _theirs) = tokio::io::duplex(16);
        let (writer, failed) = FrameWriter::spawn("D".to_string(), ours, Duration::from_millis(50));

        let (big, big_rx) = ack();
        let (queued, queued_rx) = ack();
        writer.queue(vec![b'x'; 1024], Some(big)).unwrap();
        writer.queue(b"{}\r\n".to_vec(), Some(queued)).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(2), failed).await.unwrap().unwrap();
        assert!(reason.contains("stalled"));
        assert!(matches!(big_rx.await.unwrap(), Err(DeviceError::Socket(_))));
        assert_eq!(queued_rx.await.unwrap(), Err(DeviceError::ConnectionClosed));
        assert_eq!(writer.queue(b"late".to_vec(), None), Err(DeviceError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_dropping_writer_closes_pending_acks() {
        let (ours, _theirs) = tokio::io::duplex(16);
        let (writer, _failed) = FrameWriter::spawn("D".to_string(), ours, Duration::from_secs(10));

        let (big, big_rx) = ack();
        writer.queue(vec![b'x'; 1024], Some(big)).unwrap();
        drop(writer);
        assert_eq!(big_rx.await.unwrap(), Err(DeviceError::ConnectionClosed));
    }
}
