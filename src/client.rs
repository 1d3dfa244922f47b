//! Host side of the plugin transport.
//!
//! A [`PluginClient`] owns one connection to a plugin process. Calls are
//! matched to responses by id; stream notifications are routed to the
//! [`SourceStream`] or [`WriteStream`] that opened them.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::codec::{self, FormatError};
use crate::jsonrpc::{Id, Message, Method, Request, Response, SESSION_HEADER};
use crate::message::*;
use crate::sink::WriteAck;
use crate::source::StreamSummary;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The plugin answered with a JSON‑RPC error.
    #[error("plugin error {code}: {message}")]
    Rpc { code: i64, message: String, kind: Option<String> },

    #[error("connection to plugin closed")]
    Disconnected,

    #[error("malformed frame from plugin: {0}")]
    Format(#[from] FormatError),

    #[error("unexpected message from plugin: {0}")]
    Protocol(String),
}

impl ClientError {
    /// The JSON‑RPC error code, when the plugin sent one.
    pub fn code(&self) -> Option<i64> {
        match self {
            ClientError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

enum StreamEvent {
    Item(Value),
    Done(Response),
}

type Pending = Arc<DashMap<Id, oneshot::Sender<Response>>>;
type Streams = Arc<DashMap<Id, UnboundedSender<StreamEvent>>>;

pub struct PluginClient {
    out: UnboundedSender<String>,
    pending: Pending,
    streams: Streams,
    next_id: AtomicI64,
}

impl PluginClient {
    /// Connects to the address a plugin announced in its handshake.
    pub async fn connect(handshake: &Handshake) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(&handshake.address).await?;
        stream.set_nodelay(true)?;
        let (rd, wr) = stream.into_split();
        Ok(Self::new(rd, wr))
    }

    /// Speaks the protocol over any byte stream pair.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut w = BufWriter::new(writer);
            while let Some(line) = rx.recv().await {
                if w.write_all(line.as_bytes()).await.is_err() || w.flush().await.is_err() {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(DashMap::new());
        let streams: Streams = Arc::new(DashMap::new());
        {
            let pending = pending.clone();
            let streams = streams.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(&line) {
                        Ok(Message::Response(rsp)) => route_response(&pending, &streams, rsp),
                        Ok(Message::Request(note)) => route_notification(&streams, note),
                        Err(e) => warn!("unreadable line from plugin: {e}"),
                    }
                }
                // Wake every waiter with a disconnect.
                pending.clear();
                streams.clear();
            });
        }

        Self { out, pending, streams, next_id: AtomicI64::new(1) }
    }

    pub async fn create_session(&self, tenant_id: &str, config: impl Into<Bytes>) -> ClientResult<String> {
        let params = CreateSessionParams { tenant_id: tenant_id.to_string(), config: config.into() };
        let result: CreateSessionResult = self.call(Method::CreateSession, &params).await?;
        Ok(result.session_id)
    }

    pub async fn close_session(&self, session_id: &str) -> ClientResult<()> {
        self.call(Method::CloseSession, &CloseSessionParams { session_id: session_id.to_string() }).await
    }

    /// Grants a source session `window_delta` more batches.
    pub async fn ack(&self, session_id: &str, window_delta: u64) -> ClientResult<AckResult> {
        self.call(Method::Ack, &AckParams { session_id: session_id.to_string(), window_delta }).await
    }

    pub async fn write(&self, session_id: &str, batch: &Batch) -> ClientResult<AckResult> {
        let params = FrameParams { session_id: Some(session_id.to_string()), frame: codec::encode(batch)? };
        self.call(Method::Write, &params).await
    }

    pub async fn process(&self, session_id: &str, batch: &Batch) -> ClientResult<Batch> {
        let params = FrameParams { session_id: Some(session_id.to_string()), frame: codec::encode(batch)? };
        let result: FrameResult = self.call(Method::Process, &params).await?;
        Ok(codec::decode(result.frame)?)
    }

    /// Starts a source stream. `None` lets the plugin apply its default window.
    pub fn open_stream(&self, session_id: &str, initial_window: Option<u64>) -> ClientResult<SourceStream> {
        let params = OpenStreamParams { session_id: Some(session_id.to_string()), initial_window };
        let (id, events) = self.open(Request::call(self.next_id(), Method::OpenStream, Some(serde_json::to_value(params)?)))?;
        Ok(SourceStream { id, events, out: self.out.clone(), finished: None })
    }

    /// Starts a sink write stream. The session travels in the `x-session-id` header.
    pub fn open_write(&self, session_id: &str) -> ClientResult<WriteStream> {
        let req = Request::call(self.next_id(), Method::OpenWrite, None).with_meta(SESSION_HEADER, session_id);
        let (id, events) = self.open(req)?;
        Ok(WriteStream { id, events, out: self.out.clone(), finished: None })
    }

    fn next_id(&self) -> Id {
        Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn open(&self, req: Request) -> ClientResult<(Id, UnboundedReceiver<StreamEvent>)> {
        let id = req.id.clone().unwrap_or(Id::Null);
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(id.clone(), tx);
        if let Err(err) = send(&self.out, &req) {
            self.streams.remove(&id);
            return Err(err);
        }
        Ok((id, rx))
    }

    async fn call<P: Serialize, T: DeserializeOwned>(&self, method: Method, params: &P) -> ClientResult<T> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let req = Request::call(id.clone(), method, Some(serde_json::to_value(params)?));
        if let Err(err) = send(&self.out, &req) {
            self.pending.remove(&id);
            return Err(err);
        }
        let rsp = rx.await.map_err(|_| ClientError::Disconnected)?;
        into_result(rsp)
    }
}

fn send<T: Serialize>(out: &UnboundedSender<String>, msg: &T) -> ClientResult<()> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    out.send(line).map_err(|_| ClientError::Disconnected)
}

fn into_result<T: DeserializeOwned>(rsp: Response) -> ClientResult<T> {
    if let Some(err) = rsp.error {
        return Err(ClientError::Rpc {
            code: err.code,
            message: err.message,
            kind: err.data.and_then(|d| d.as_str().map(str::to_owned)),
        });
    }
    Ok(serde_json::from_value(rsp.result.unwrap_or(Value::Null))?)
}

fn route_response(pending: &Pending, streams: &Streams, rsp: Response) {
    if let Some((_, tx)) = streams.remove(&rsp.id) {
        let _ = tx.send(StreamEvent::Done(rsp));
    } else if let Some((_, tx)) = pending.remove(&rsp.id) {
        let _ = tx.send(rsp);
    } else {
        debug!(id = %rsp.id, "response for unknown request");
    }
}

fn route_notification(streams: &Streams, note: Request) {
    let Some(params) = note.params else {
        return;
    };
    let stream = params.get("stream").cloned().and_then(|s| serde_json::from_value::<Id>(s).ok());
    match stream.and_then(|id| streams.get(&id).map(|tx| tx.value().clone())) {
        Some(tx) => {
            let _ = tx.send(StreamEvent::Item(params));
        }
        None => debug!(method = %note.method, "notification for unknown stream"),
    }
}

fn cancel(out: &UnboundedSender<String>, stream: &Id) -> ClientResult<()> {
    let params = serde_json::to_value(StreamParams { stream: stream.clone() })?;
    send(out, &Request::notification(Method::Cancel, Some(params)))
}

/// Batches arriving from a source stream.
pub struct SourceStream {
    id: Id,
    events: UnboundedReceiver<StreamEvent>,
    out: UnboundedSender<String>,
    finished: Option<ClientResult<StreamSummary>>,
}

impl SourceStream {
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Next batch, or `None` once the stream has ended.
    pub async fn next_batch(&mut self) -> Option<ClientResult<Batch>> {
        if self.finished.is_some() {
            return None;
        }
        match self.events.recv().await {
            Some(StreamEvent::Item(params)) => Some(
                serde_json::from_value::<BatchNotification>(params)
                    .map_err(ClientError::from)
                    .and_then(|note| Ok(codec::decode(note.frame)?)),
            ),
            Some(StreamEvent::Done(rsp)) => {
                self.finished = Some(into_result(rsp));
                None
            }
            None => {
                self.finished = Some(Err(ClientError::Disconnected));
                None
            }
        }
    }

    /// Asks the plugin to stop the stream; the final summary still arrives.
    pub fn cancel(&self) -> ClientResult<()> {
        cancel(&self.out, &self.id)
    }

    /// Drops any remaining batches and waits for the stream's summary.
    pub async fn finish(mut self) -> ClientResult<StreamSummary> {
        while self.next_batch().await.is_some() {}
        self.finished.unwrap_or(Err(ClientError::Disconnected))
    }
}

/// An open sink write stream.
pub struct WriteStream {
    id: Id,
    events: UnboundedReceiver<StreamEvent>,
    out: UnboundedSender<String>,
    finished: Option<ClientResult<WriteEndResult>>,
}

impl WriteStream {
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn send(&self, batch: &Batch) -> ClientResult<()> {
        let params = WriteBatchParams { stream: self.id.clone(), frame: codec::encode(batch)? };
        send(&self.out, &Request::notification(Method::WriteBatch, Some(serde_json::to_value(params)?)))
    }

    /// Sends a raw frame, valid or not.
    pub fn send_frame(&self, frame: Bytes) -> ClientResult<()> {
        let params = WriteBatchParams { stream: self.id.clone(), frame };
        send(&self.out, &Request::notification(Method::WriteBatch, Some(serde_json::to_value(params)?)))
    }

    /// No more batches; the plugin acks what it has and ends the stream.
    pub fn close(&self) -> ClientResult<()> {
        let params = serde_json::to_value(StreamParams { stream: self.id.clone() })?;
        send(&self.out, &Request::notification(Method::CloseWrite, Some(params)))
    }

    pub fn cancel(&self) -> ClientResult<()> {
        cancel(&self.out, &self.id)
    }

    /// Next acknowledgement, or `None` once the stream has ended.
    pub async fn next_ack(&mut self) -> Option<ClientResult<WriteAck>> {
        if self.finished.is_some() {
            return None;
        }
        match self.events.recv().await {
            Some(StreamEvent::Item(params)) => Some(
                serde_json::from_value::<WriteAckNotification>(params)
                    .map(|note| note.ack)
                    .map_err(ClientError::from),
            ),
            Some(StreamEvent::Done(rsp)) => {
                self.finished = Some(into_result(rsp));
                None
            }
            None => {
                self.finished = Some(Err(ClientError::Disconnected));
                None
            }
        }
    }

    /// Waits for the stream to end and returns how many batches were acked.
    pub async fn finish(mut self) -> ClientResult<u64> {
        while self.next_ack().await.is_some() {}
        self.finished.unwrap_or(Err(ClientError::Disconnected)).map(|end| end.acked)
    }
}
