//! Source role: a long-lived stream of batches gated by the session window.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::session::{Session, SessionRegistry};

/// Why a source stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamEnd {
    /// The callback reported that its input is exhausted.
    EndOfInput,
    /// The host cancelled the stream or the transport went away.
    Cancelled,
    /// The session was closed while the stream was running.
    SessionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub reason: StreamEnd,
    pub batches: u64,
}

pub struct SourceHandler {
    registry: Arc<SessionRegistry>,
    default_window: u64,
    idle_backoff: Duration,
}

impl SourceHandler {
    pub fn new(registry: Arc<SessionRegistry>, config: &RuntimeConfig) -> Self {
        Self {
            registry,
            default_window: config.default_window,
            idle_backoff: config.idle_backoff(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn create_session(&self, tenant_id: &str, config: Bytes) -> Result<String> {
        let session = self.registry.create(tenant_id, config).await?;
        Ok(session.id().to_string())
    }

    /// Grants `window_delta` more batches to the session's streams.
    pub fn ack(&self, session_id: &str, window_delta: u64) -> Result<()> {
        let session = self.registry.get(session_id)?;
        session.window().release(window_delta);
        debug!(
            session_id = %session_id,
            window_delta,
            window = session.window().available(),
            "window extended"
        );
        Ok(())
    }

    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.registry.close(session_id).await
    }

    /// Runs the read loop for one stream and pushes encoded frames into `out`.
    ///
    /// Seeds the window with `initial_window` (or the configured default), then
    /// spends one credit per batch sent. Returns once the input is exhausted,
    /// `cancel` fires, `out` is dropped or the session is closed.
    pub async fn open_stream(
        &self,
        session_id: &str,
        initial_window: Option<u64>,
        cancel: CancellationToken,
        out: mpsc::Sender<Bytes>,
    ) -> Result<StreamSummary> {
        let session = self.registry.get(session_id)?;
        let initial = initial_window.unwrap_or(self.default_window);
        session.window().release(initial);
        info!(session_id = %session_id, window = initial, "source stream opened");

        let mut batches = 0u64;
        let mut holding_credit = false;
        let reason = self.pump(&session, &cancel, &out, &mut batches, &mut holding_credit).await?;
        if holding_credit && !session.is_closed() {
            // Unspent credit stays with the session for the next stream.
            session.window().release(1);
        }

        info!(session_id = %session_id, batches, reason = %reason, "source stream ended");
        Ok(StreamSummary { reason, batches })
    }

    async fn pump(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
        out: &mpsc::Sender<Bytes>,
        batches: &mut u64,
        holding_credit: &mut bool,
    ) -> Result<StreamEnd> {
        // One credit may be held across several reads until a batch is sent.
        loop {
            if let Some(end) = stopped(session, cancel) {
                return Ok(end);
            }

            if !*holding_credit {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                    granted = session.window().acquire(session.token()) => {
                        if granted.is_err() {
                            return Ok(StreamEnd::SessionClosed);
                        }
                    }
                }
                *holding_credit = true;
            }

            let read = session.with_source(|source| source.read_batch()).await;

            if let Some(end) = stopped(session, cancel) {
                return Ok(end);
            }

            let batch = match read {
                Ok(Ok(Some(batch))) if !batch.is_empty() => batch,
                Ok(Ok(Some(_))) => {
                    self.idle(session, cancel).await;
                    continue;
                }
                Ok(Ok(None)) => return Ok(StreamEnd::EndOfInput),
                Ok(Err(err)) => {
                    warn!(session_id = %session.id(), error = %err, "source read failed, retrying");
                    self.idle(session, cancel).await;
                    continue;
                }
                Err(err) if err.is_session_gone() => return Ok(StreamEnd::SessionClosed),
                Err(RuntimeError::User(err)) => {
                    warn!(session_id = %session.id(), error = %err, "source read failed, retrying");
                    self.idle(session, cancel).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let records = batch.len();
            let frame = match codec::encode(&batch) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(session_id = %session.id(), records, error = %err, "dropping unencodable batch");
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                _ = session.token().cancelled() => return Ok(StreamEnd::SessionClosed),
                sent = out.send(frame) => {
                    if sent.is_err() {
                        return Ok(StreamEnd::Cancelled);
                    }
                }
            }
            *holding_credit = false;
            *batches += 1;
            debug!(
                session_id = %session.id(),
                records,
                window = session.window().available(),
                "batch sent"
            );
        }
    }

    async fn idle(&self, session: &Session, cancel: &CancellationToken) {
        if self.idle_backoff.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.idle_backoff) => {}
            _ = cancel.cancelled() => {}
            _ = session.token().cancelled() => {}
        }
    }
}

fn stopped(session: &Session, cancel: &CancellationToken) -> Option<StreamEnd> {
    if session.token().is_cancelled() {
        Some(StreamEnd::SessionClosed)
    } else if cancel.is_cancelled() {
        Some(StreamEnd::Cancelled)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::batch::{Batch, Record};
    use crate::plugin::{Lifecycle, PluginError, PluginFactory, Source};

    /// Plays back a script of read results, then reports end of input.
    struct Scripted {
        script: Arc<Mutex<VecDeque<Result<Option<Batch>, PluginError>>>>,
        reads: Arc<AtomicUsize>,
        endless: bool,
    }

    impl Lifecycle for Scripted {}

    impl Source for Scripted {
        fn read_batch(&mut self) -> Result<Option<Batch>, PluginError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                return next;
            }
            if self.endless {
                return Ok(Some(Batch::new(vec![Record::new(format!("r{n}"))])));
            }
            Ok(None)
        }
    }

    fn one(payload: &'static str) -> Batch {
        Batch::new(vec![Record::new(payload)])
    }

    fn handler(
        script: Vec<Result<Option<Batch>, PluginError>>,
        endless: bool,
    ) -> (SourceHandler, Arc<AtomicUsize>) {
        let script = Arc::new(Mutex::new(VecDeque::from(script)));
        let reads = Arc::new(AtomicUsize::new(0));
        let config = RuntimeConfig { idle_backoff_ms: 1, ..RuntimeConfig::default() };
        let factory = {
            let reads = reads.clone();
            PluginFactory::source(move || Scripted {
                script: script.clone(),
                reads: reads.clone(),
                endless,
            })
        };
        let registry = Arc::new(SessionRegistry::new(factory, &config));
        (SourceHandler::new(registry, &config), reads)
    }

    #[tokio::test]
    async fn streams_until_end_of_input() {
        let (handler, _) = handler(
            vec![
                Ok(Some(one("a"))),
                Ok(Some(Batch::default())),
                Err(PluginError::Other("flaky".into())),
                Ok(Some(one("b"))),
            ],
            false,
        );
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let summary = handler.open_stream(&id, Some(10), CancellationToken::new(), tx).await.unwrap();
        assert_eq!(summary, StreamSummary { reason: StreamEnd::EndOfInput, batches: 2 });

        let first = codec::decode(rx.recv().await.unwrap()).unwrap();
        let second = codec::decode(rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.records[0].payload, Bytes::from_static(b"a"));
        assert_eq!(second.records[0].payload, Bytes::from_static(b"b"));
        assert!(rx.recv().await.is_none());

        // Empty reads, failures and the final read do not spend credit.
        let session = handler.registry().get(&id).unwrap();
        assert_eq!(session.window().available(), 8);
    }

    #[tokio::test]
    async fn window_bounds_emission_until_acked() {
        let (handler, _) = handler(vec![], true);
        let handler = Arc::new(handler);
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let task = {
            let handler = handler.clone();
            let id = id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handler.open_stream(&id, Some(2), cancel, tx).await })
        };

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "emitted past the window");

        handler.ack(&id, 3).unwrap();
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary, StreamSummary { reason: StreamEnd::Cancelled, batches: 5 });
    }

    #[tokio::test]
    async fn zero_window_reads_nothing_until_acked() {
        let (handler, reads) = handler(vec![], true);
        let handler = Arc::new(handler);
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let task = {
            let handler = handler.clone();
            let id = id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handler.open_stream(&id, Some(0), cancel, tx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        handler.ack(&id, 1).unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_wakes_parked_stream() {
        let (handler, reads) = handler(vec![], true);
        let handler = Arc::new(handler);
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);

        let task = {
            let handler = handler.clone();
            let id = id.clone();
            tokio::spawn(async move { handler.open_stream(&id, Some(1), CancellationToken::new(), tx).await })
        };
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handler.close_session(&id).await.unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
        assert_eq!(summary.reason, StreamEnd::SessionClosed);
        assert_eq!(summary.batches, 1);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_cancels_stream() {
        let (handler, _) = handler(vec![], true);
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let summary = handler.open_stream(&id, None, CancellationToken::new(), tx).await.unwrap();
        assert_eq!(summary.reason, StreamEnd::Cancelled);
        assert_eq!(summary.batches, 0);
    }

    #[tokio::test]
    async fn unknown_and_closed_sessions() {
        let (handler, _) = handler(vec![], false);
        let (tx, _rx) = mpsc::channel(1);
        let err = handler.open_stream("missing", None, CancellationToken::new(), tx.clone()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
        assert!(matches!(handler.ack("missing", 1), Err(RuntimeError::NotFound(_))));

        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        handler.close_session(&id).await.unwrap();
        handler.close_session(&id).await.unwrap();
        assert!(matches!(handler.ack(&id, 1), Err(RuntimeError::Closed(_))));
        let err = handler.open_stream(&id, None, CancellationToken::new(), tx).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Closed(_)));
    }

    #[tokio::test]
    async fn default_window_applies_when_omitted() {
        let (handler, _) = handler(vec![], true);
        let handler = Arc::new(handler);
        let id = handler.create_session("t1", Bytes::new()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let task = {
            let handler = handler.clone();
            let id = id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handler.open_stream(&id, None, cancel, tx).await })
        };
        for _ in 0..20 {
            rx.recv().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap().batches, 20);
    }
}
