//! Wires newline-delimited JSON‑RPC traffic on one connection to a role handler.
//!
//! ### Dispatch rules
//! * Unary calls run in their own task and answer with one response.
//! * `openStream` / `openWrite` register the stream under the request id
//!   before the next line is read, then run in their own task. Stream items
//!   go out as notifications; the final response closes the stream.
//! * `writeBatch`, `closeWrite` and `cancel` are handled on the reader task
//!   so they apply in arrival order. The reader never waits on a stream: a
//!   host that runs more than `write_queue_depth` batches ahead of its acks
//!   gets the write stream failed instead.
//! * At most `max_concurrent_streams` streams may be open per connection.
//!
//! Dropping the connection cancels every stream opened on it. Sessions
//! outlive connections; only `closeSession` or shutdown closes them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::{self, UnboundedSender, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{CODE_METHOD_NOT_FOUND, CODE_PARSE_ERROR, RuntimeError};
use crate::jsonrpc::{Id, Message, Method, Request, Response};
use crate::message::*;
use crate::plugin::{PluginFactory, Role};
use crate::processor::ProcessorHandler;
use crate::session::SessionRegistry;
use crate::sink::SinkHandler;
use crate::source::SourceHandler;

/// The protocol handler a plugin process serves, one per process.
pub enum RoleHandler {
    Source(SourceHandler),
    Sink(SinkHandler),
    Processor(ProcessorHandler),
}

impl RoleHandler {
    /// Builds the registry and the handler matching the factory's role.
    pub fn new(factory: PluginFactory, config: &RuntimeConfig) -> Self {
        let role = factory.role();
        let registry = Arc::new(SessionRegistry::new(factory, config));
        match role {
            Role::Source => RoleHandler::Source(SourceHandler::new(registry, config)),
            Role::Sink => RoleHandler::Sink(SinkHandler::new(registry)),
            Role::Processor => RoleHandler::Processor(ProcessorHandler::new(registry)),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            RoleHandler::Source(_) => Role::Source,
            RoleHandler::Sink(_) => Role::Sink,
            RoleHandler::Processor(_) => Role::Processor,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        match self {
            RoleHandler::Source(h) => h.registry(),
            RoleHandler::Sink(h) => h.registry(),
            RoleHandler::Processor(h) => h.registry(),
        }
    }

    fn source(&self) -> crate::error::Result<&SourceHandler> {
        match self {
            RoleHandler::Source(h) => Ok(h),
            other => Err(RuntimeError::RoleMismatch { expected: Role::Source, actual: other.role() }),
        }
    }

    fn sink(&self) -> crate::error::Result<&SinkHandler> {
        match self {
            RoleHandler::Sink(h) => Ok(h),
            other => Err(RuntimeError::RoleMismatch { expected: Role::Sink, actual: other.role() }),
        }
    }

    fn processor(&self) -> crate::error::Result<&ProcessorHandler> {
        match self {
            RoleHandler::Processor(h) => Ok(h),
            other => Err(RuntimeError::RoleMismatch { expected: Role::Processor, actual: other.role() }),
        }
    }
}

/// Serves any number of connections against one role handler.
pub struct PluginServer {
    handler: Arc<RoleHandler>,
    shutdown: CancellationToken,
    write_queue_depth: usize,
    max_streams: usize,
}

impl PluginServer {
    pub fn new(factory: PluginFactory, config: &RuntimeConfig) -> Self {
        Self {
            handler: Arc::new(RoleHandler::new(factory, config)),
            shutdown: CancellationToken::new(),
            write_queue_depth: config.write_queue_depth.max(1),
            max_streams: config.max_concurrent_streams.max(1),
        }
    }

    pub fn role(&self) -> Role {
        self.handler.role()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.handler.registry()
    }

    /// Cancelled by [`PluginServer::shutdown`]; every connection watches it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops all connections and closes every session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.handler.registry().close_all().await;
    }

    /// Runs the read loop for one connection until EOF, a read error or shutdown.
    pub async fn serve_connection<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut w = BufWriter::new(writer);
            while let Some(line) = rx.recv().await {
                if let Err(e) = w.write_all(line.as_bytes()).await {
                    warn!("connection write error: {e}");
                    break;
                }
                if let Err(e) = w.flush().await {
                    warn!("connection flush error: {e}");
                    break;
                }
            }
        });

        let conn = Connection {
            handler: self.handler.clone(),
            out: Outbox(tx),
            cancel: self.shutdown.child_token(),
            streams: Arc::new(DashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
            write_queue_depth: self.write_queue_depth,
            max_streams: self.max_streams,
        };
        debug!(role = %self.role(), "connection opened");

        let mut lines = BufReader::new(reader).lines();
        loop {
            let next = tokio::select! {
                _ = conn.cancel.cancelled() => break,
                next = lines.next_line() => next,
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("connection read error: {e}");
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<Message>(line) {
                Ok(Message::Request(req)) => conn.dispatch(req).await,
                Ok(Message::Response(_)) => { /* hosts never answer us; ignore */ }
                Err(e) => {
                    conn.out.respond(Response::fail(Id::Null, CODE_PARSE_ERROR, "Parse error", Some(json!(e.to_string()))));
                }
            }
        }

        conn.cancel.cancel();
        conn.streams.clear();
        debug!(role = %self.role(), "connection closed");
        Ok(())
    }
}

/// Serialises outgoing messages onto the connection's writer task.
#[derive(Clone)]
struct Outbox(UnboundedSender<String>);

impl Outbox {
    fn send<T: Serialize>(&self, msg: &T) {
        match serde_json::to_string(msg) {
            Ok(mut line) => {
                line.push('\n');
                let _ = self.0.send(line);
            }
            Err(e) => error!("failed to serialise outgoing message: {e}"),
        }
    }

    fn respond(&self, resp: Response) {
        self.send(&resp);
    }

    fn reply<T: Serialize>(&self, id: Id, result: crate::error::Result<T>) {
        let resp = match result.and_then(|v| serde_json::to_value(v).map_err(|e| RuntimeError::Transport(e.to_string()))) {
            Ok(value) => Response::success(id, value),
            Err(err) => Response::from_error(id, &err),
        };
        self.respond(resp);
    }

    fn notify<T: Serialize>(&self, method: Method, params: &T) {
        match serde_json::to_value(params) {
            Ok(value) => self.send(&Request::notification(method, Some(value))),
            Err(e) => error!("failed to serialise {method} notification: {e}"),
        }
    }
}

enum StreamSlot {
    Read { cancel: CancellationToken },
    Write { frames: mpsc::Sender<Bytes>, cancel: CancellationToken, overflowed: Arc<AtomicBool> },
}

impl StreamSlot {
    fn cancel(&self) {
        match self {
            StreamSlot::Read { cancel } | StreamSlot::Write { cancel, .. } => cancel.cancel(),
        }
    }
}

#[derive(Clone)]
struct Connection {
    handler: Arc<RoleHandler>,
    out: Outbox,
    cancel: CancellationToken,
    streams: Arc<DashMap<Id, StreamSlot>>,
    /// Stream tasks still running; a slot can be gone before its task ends.
    active: Arc<AtomicUsize>,
    write_queue_depth: usize,
    max_streams: usize,
}

impl Connection {
    async fn dispatch(&self, req: Request) {
        let method = match req.method.parse::<Method>() {
            Ok(method) => method,
            Err(_) => {
                if let Some(id) = req.id {
                    self.out.respond(Response::fail(id, CODE_METHOD_NOT_FOUND, "Method not found", Some(json!(req.method))));
                }
                return;
            }
        };

        match method {
            Method::WriteBatch => self.push_frame(req),
            Method::CloseWrite => self.close_write(req),
            Method::Cancel => self.cancel_stream(req),
            Method::OpenStream => self.open_read(req),
            Method::OpenWrite => self.open_write(req),
            Method::Batch | Method::WriteAck => {
                if let Some(id) = req.id {
                    self.out.respond(Response::fail(id, CODE_METHOD_NOT_FOUND, "Method not found", Some(json!(req.method))));
                }
            }
            Method::CreateSession | Method::Ack | Method::Write | Method::Process | Method::CloseSession => {
                let conn = self.clone();
                tokio::spawn(async move {
                    let id = req.id.clone();
                    let result = conn.call(method, req).await;
                    match id {
                        Some(id) => conn.out.reply(id, result),
                        None => {
                            if let Err(err) = result {
                                warn!(%method, error = %err, "notification failed");
                            }
                        }
                    }
                });
            }
        }
    }

    async fn call(&self, method: Method, req: Request) -> crate::error::Result<Value> {
        let value = match method {
            Method::CreateSession => {
                let p: CreateSessionParams = params(&req)?;
                let session = self.handler.registry().create(p.tenant_id, p.config).await?;
                serde_json::to_value(CreateSessionResult { session_id: session.id().to_string() })?
            }
            Method::CloseSession => {
                let p: CloseSessionParams = params(&req)?;
                self.handler.registry().close(&p.session_id).await?;
                Value::Null
            }
            Method::Ack => {
                let source = self.handler.source()?;
                let p: AckParams = params(&req)?;
                source.ack(&p.session_id, p.window_delta)?;
                serde_json::to_value(AckResult::ok())?
            }
            Method::Write => {
                let sink = self.handler.sink()?;
                let p: FrameParams = params(&req)?;
                let session_id = session_id(p.session_id, &req)?;
                let ack = sink.write(&session_id, p.frame).await?;
                serde_json::to_value(AckResult::from(ack))?
            }
            Method::Process => {
                let processor = self.handler.processor()?;
                let p: FrameParams = params(&req)?;
                let session_id = session_id(p.session_id, &req)?;
                let frame = processor.process(&session_id, p.frame).await?;
                serde_json::to_value(FrameResult { frame })?
            }
            other => return Err(RuntimeError::InvalidParams(format!("{other} is not a unary call"))),
        };
        Ok(value)
    }

    /// Claims `id` for a new stream; answers the request itself when it can't.
    fn claim(&self, req: &Request, slot: StreamSlot) -> Option<Id> {
        let Some(id) = req.id.clone() else {
            warn!(method = %req.method, "stream request without id ignored");
            return None;
        };
        if self.streams.contains_key(&id) {
            self.out.reply::<Value>(id, Err(RuntimeError::InvalidParams("stream id already in use".into())));
            return None;
        }
        // Only the reader task claims, so the check and the increment can't race.
        if self.active.load(Ordering::Acquire) >= self.max_streams {
            warn!(stream = %id, limit = self.max_streams, "stream limit reached");
            let err = RuntimeError::Transport(format!("too many concurrent streams (limit {})", self.max_streams));
            self.out.reply::<Value>(id, Err(err));
            return None;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        self.streams.insert(id.clone(), slot);
        Some(id)
    }

    fn release(&self, stream: &Id) {
        self.streams.remove(stream);
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    fn open_read(&self, req: Request) {
        let cancel = self.cancel.child_token();
        let Some(stream) = self.claim(&req, StreamSlot::Read { cancel: cancel.clone() }) else {
            return;
        };

        let conn = self.clone();
        tokio::spawn(async move {
            let result = conn.run_read(&stream, &req, cancel).await;
            conn.release(&stream);
            conn.out.reply(stream, result);
        });
    }

    async fn run_read(
        &self,
        stream: &Id,
        req: &Request,
        cancel: CancellationToken,
    ) -> crate::error::Result<crate::source::StreamSummary> {
        let source = self.handler.source()?;
        let p: OpenStreamParams = params(req)?;
        let session_id = session_id(p.session_id, req)?;

        let (tx, mut rx) = mpsc::channel::<Bytes>(1);
        let forward = {
            let out = self.out.clone();
            let stream = stream.clone();
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    out.notify(Method::Batch, &BatchNotification { stream: stream.clone(), frame });
                }
            })
        };

        let result = source.open_stream(&session_id, p.initial_window, cancel, tx).await;
        // Every batch notification is queued before the final response.
        let _ = forward.await;
        result
    }

    fn open_write(&self, req: Request) {
        let cancel = self.cancel.child_token();
        let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(self.write_queue_depth);
        let overflowed = Arc::new(AtomicBool::new(false));
        let slot = StreamSlot::Write { frames: frames_tx, cancel: cancel.clone(), overflowed: overflowed.clone() };
        let Some(stream) = self.claim(&req, slot) else {
            return;
        };

        let conn = self.clone();
        tokio::spawn(async move {
            let result = conn.run_write(&stream, &req, frames_rx, cancel).await;
            let result = if overflowed.load(Ordering::Acquire) {
                Err(RuntimeError::Transport(format!(
                    "write queue overflow: more than {} batches awaiting acks",
                    conn.write_queue_depth
                )))
            } else {
                result.map(|acked| WriteEndResult { acked })
            };
            conn.release(&stream);
            conn.out.reply(stream, result);
        });
    }

    async fn run_write(
        &self,
        stream: &Id,
        req: &Request,
        frames: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> crate::error::Result<u64> {
        let sink = self.handler.sink()?;
        let p: OpenWriteParams = params(req)?;
        let session_id = session_id(p.session_id, req)?;

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let forward = {
            let out = self.out.clone();
            let stream = stream.clone();
            tokio::spawn(async move {
                while let Some(ack) = ack_rx.recv().await {
                    out.notify(Method::WriteAck, &WriteAckNotification { stream: stream.clone(), ack });
                }
            })
        };

        let result = sink.write_stream(&session_id, frames, ack_tx, cancel).await;
        let _ = forward.await;
        result
    }

    fn push_frame(&self, req: Request) {
        let p: WriteBatchParams = match params(&req) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "invalid writeBatch dropped");
                return;
            }
        };
        let (frames, cancel, overflowed) = match self.streams.get(&p.stream).as_deref() {
            Some(StreamSlot::Write { frames, cancel, overflowed }) => (frames.clone(), cancel.clone(), overflowed.clone()),
            Some(StreamSlot::Read { .. }) => {
                warn!(stream = %p.stream, "writeBatch sent to a read stream");
                return;
            }
            None => {
                warn!(stream = %p.stream, "writeBatch for unknown stream");
                return;
            }
        };
        match frames.try_send(p.frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(stream = %p.stream, depth = self.write_queue_depth, "write queue full, failing stream");
                overflowed.store(true, Ordering::Release);
                self.streams.remove(&p.stream);
                cancel.cancel();
            }
            Err(TrySendError::Closed(_)) => debug!(stream = %p.stream, "write stream already finished"),
        }
    }

    fn close_write(&self, req: Request) {
        match params::<StreamParams>(&req) {
            // Dropping the sender lets the stream drain and finish.
            Ok(p) => {
                if self.streams.remove(&p.stream).is_none() {
                    debug!(stream = %p.stream, "closeWrite for unknown stream");
                }
            }
            Err(err) => warn!(error = %err, "invalid closeWrite dropped"),
        }
    }

    fn cancel_stream(&self, req: Request) {
        match params::<StreamParams>(&req) {
            Ok(p) => match self.streams.remove(&p.stream) {
                Some((_, slot)) => {
                    info!(stream = %p.stream, "stream cancelled by host");
                    slot.cancel();
                }
                None => debug!(stream = %p.stream, "cancel for unknown stream"),
            },
            Err(err) => warn!(error = %err, "invalid cancel dropped"),
        }
    }
}

fn params<T: DeserializeOwned>(req: &Request) -> crate::error::Result<T> {
    let value = req.params.clone().unwrap_or_else(|| json!({}));
    Ok(serde_json::from_value(value)?)
}

/// Explicit field first, `x-session-id` header second.
fn session_id(field: Option<String>, req: &Request) -> crate::error::Result<String> {
    field
        .or_else(|| req.session_header().map(str::to_owned))
        .ok_or_else(|| RuntimeError::InvalidParams("missing session_id".into()))
}
