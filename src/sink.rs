//! Sink role: batches in, exactly one acknowledgement out per batch.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::codec;
use crate::error::{Result, RuntimeError};
use crate::session::{Session, SessionRegistry};

/// Outcome of writing one batch. A failed write is still an ack; the host
/// decides whether to retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Position of the batch in its write stream, starting at 0.
    pub seq: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WriteAck {
    pub fn ok(seq: u64) -> Self {
        Self { seq, success: true, error: None }
    }

    pub fn failed(seq: u64, error: impl Into<String>) -> Self {
        Self { seq, success: false, error: Some(error.into()) }
    }
}

pub struct SinkHandler {
    registry: Arc<SessionRegistry>,
}

impl SinkHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn create_session(&self, tenant_id: &str, config: Bytes) -> Result<String> {
        let session = self.registry.create(tenant_id, config).await?;
        Ok(session.id().to_string())
    }

    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.registry.close(session_id).await
    }

    /// Writes a single frame. A malformed frame or a missing session fails the
    /// call; a failing write is reported through the ack.
    pub async fn write(&self, session_id: &str, frame: Bytes) -> Result<WriteAck> {
        let session = self.registry.get(session_id)?;
        let batch = codec::decode(frame)?;
        write_batch(&session, 0, batch).await
    }

    /// Consumes frames from `frames` until it is closed or `cancel` fires and
    /// answers each with one ack on `acks`, in arrival order.
    ///
    /// Returns the number of acks sent. Ends with an error if the session goes
    /// away mid-stream.
    pub async fn write_stream(
        &self,
        session_id: &str,
        mut frames: mpsc::Receiver<Bytes>,
        acks: mpsc::UnboundedSender<WriteAck>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let session = self.registry.get(session_id)?;
        info!(session_id = %session_id, "write stream opened");

        let mut seq = 0u64;
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = session.token().cancelled() => {
                    return Err(RuntimeError::Closed(session_id.to_string()));
                }
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let ack = match codec::decode(frame) {
                Ok(batch) => write_batch(&session, seq, batch).await?,
                Err(err) => {
                    warn!(session_id = %session_id, seq, error = %err, "rejecting malformed frame");
                    WriteAck::failed(seq, RuntimeError::from(err).to_string())
                }
            };
            if acks.send(ack).is_err() {
                debug!(session_id = %session_id, "ack receiver gone, ending write stream");
                break;
            }
            seq += 1;
        }

        info!(session_id = %session_id, acked = seq, "write stream ended");
        Ok(seq)
    }
}

async fn write_batch(session: &Session, seq: u64, batch: Batch) -> Result<WriteAck> {
    let records = batch.len();
    let outcome = match session.with_sink(move |sink| sink.write_batch(batch)).await {
        Ok(outcome) => outcome,
        Err(RuntimeError::User(err)) => Err(err),
        Err(err) => return Err(err),
    };

    Ok(match outcome {
        Ok(()) => {
            debug!(session_id = %session.id(), seq, records, "batch written");
            WriteAck::ok(seq)
        }
        Err(err) => {
            warn!(session_id = %session.id(), seq, records, error = %err, "sink write failed");
            WriteAck::failed(seq, err.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::batch::Record;
    use crate::config::RuntimeConfig;
    use crate::plugin::{Lifecycle, PluginError, PluginFactory, Sink};

    /// Fails every batch whose first payload is `"bad"`.
    struct Picky {
        written: Arc<Mutex<Vec<Bytes>>>,
    }

    impl Lifecycle for Picky {}

    impl Sink for Picky {
        fn write_batch(&mut self, batch: Batch) -> Result<(), PluginError> {
            let first = batch.records.first().map(|r| r.payload.clone()).unwrap_or_default();
            if first.as_ref() == b"bad" {
                return Err(PluginError::Other("x".into()));
            }
            self.written.lock().unwrap().push(first);
            Ok(())
        }
    }

    fn handler() -> (SinkHandler, Arc<Mutex<Vec<Bytes>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let factory = {
            let written = written.clone();
            PluginFactory::sink(move || Picky { written: written.clone() })
        };
        let registry = Arc::new(SessionRegistry::new(factory, &RuntimeConfig::default()));
        (SinkHandler::new(registry), written)
    }

    fn frame(payload: &'static str) -> Bytes {
        codec::encode(&Batch::new(vec![Record::new(payload)])).unwrap()
    }

    #[tokio::test]
    async fn failed_write_is_negative_ack_and_stream_survives() {
        let (handler, written) = handler();
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();

        frame_tx.send(frame("good")).await.unwrap();
        frame_tx.send(frame("bad")).await.unwrap();
        frame_tx.send(frame("good2")).await.unwrap();
        drop(frame_tx);

        let acked = handler.write_stream(&id, frame_rx, ack_tx, CancellationToken::new()).await.unwrap();
        assert_eq!(acked, 3);

        assert_eq!(ack_rx.recv().await.unwrap(), WriteAck::ok(0));
        assert_eq!(ack_rx.recv().await.unwrap(), WriteAck::failed(1, "plugin error: x"));
        assert_eq!(ack_rx.recv().await.unwrap(), WriteAck::ok(2));
        assert!(ack_rx.recv().await.is_none());

        assert_eq!(*written.lock().unwrap(), vec![Bytes::from("good"), Bytes::from("good2")]);
        assert!(handler.registry().get(&id).is_ok());
    }

    #[tokio::test]
    async fn malformed_frame_in_stream_gets_negative_ack() {
        let (handler, _) = handler();
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();

        frame_tx.send(Bytes::from_static(b"garbage")).await.unwrap();
        frame_tx.send(frame("ok")).await.unwrap();
        drop(frame_tx);

        handler.write_stream(&id, frame_rx, ack_tx, CancellationToken::new()).await.unwrap();
        let first = ack_rx.recv().await.unwrap();
        assert!(!first.success);
        assert!(first.error.unwrap().contains("malformed frame"));
        assert_eq!(ack_rx.recv().await.unwrap(), WriteAck::ok(1));
    }

    #[tokio::test]
    async fn unary_write() {
        let (handler, _) = handler();
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();

        assert_eq!(handler.write(&id, frame("a")).await.unwrap(), WriteAck::ok(0));
        assert!(!handler.write(&id, frame("bad")).await.unwrap().success);

        let err = handler.write(&id, Bytes::from_static(b"short")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Format(_)));
        let err = handler.write("missing", frame("a")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn stream_ends_when_session_closes() {
        let (handler, _) = handler();
        let handler = Arc::new(handler);
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        let (_frame_tx, frame_rx) = mpsc::channel::<Bytes>(4);
        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();

        let task = {
            let handler = handler.clone();
            let id = id.clone();
            tokio::spawn(async move {
                handler.write_stream(&id, frame_rx, ack_tx, CancellationToken::new()).await
            })
        };
        tokio::task::yield_now().await;
        handler.close_session(&id).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_session_gone());
    }
}
