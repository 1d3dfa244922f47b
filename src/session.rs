//! Per-tenant sessions and the registry that owns them.
//!
//! A [`Session`] binds exactly one callback instance, one flow-control
//! [`Window`] and one cancellation token. The [`SessionRegistry`] is the only
//! process-wide shared structure; every protocol handler gets it passed in.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use moka::sync::Cache;
use serde::de::DeserializeOwned;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::flow::Window;
use crate::plugin::{Callback, PluginError, PluginFactory, Processor, Role, Sink, Source};

/// Upper bound on remembered closed session ids.
const MAX_TOMBSTONES: u64 = 100_000;

/// Arbitrary values a plugin wants to keep alongside its session
/// (connection pools, caches, cursors, ...).
#[derive(Default)]
pub struct UserData {
    entries: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl UserData {
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Arc::new(value));
    }

    /// Returns the value under `key` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.entries.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("UserData").field("keys", &keys).finish()
    }
}

/// What a callback sees of its session when it is initialised.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: String,
    tenant_id: String,
    config: Bytes,
    data: Arc<UserData>,
    token: CancellationToken,
}

impl SessionContext {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The opaque configuration blob the host sent with `createSession`.
    pub fn config(&self) -> &[u8] {
        &self.config
    }

    /// Parses the configuration blob as JSON.
    pub fn config_json<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        serde_json::from_slice(&self.config).map_err(|err| PluginError::InvalidConfig(err.to_string()))
    }

    /// The session's user-data map. Keep the `Arc` to use it from later calls.
    pub fn data(&self) -> Arc<UserData> {
        self.data.clone()
    }

    /// Cancelled when the session closes. A callback whose reads or writes can
    /// block should keep a clone from `init` and give up once it fires.
    pub fn close_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

pub struct Session {
    id: String,
    tenant_id: String,
    config: Bytes,
    role: Role,
    window: Window,
    data: Arc<UserData>,
    token: CancellationToken,
    closed: AtomicBool,
    callback: Arc<Mutex<Option<Callback>>>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn config(&self) -> &Bytes {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn data(&self) -> &Arc<UserData> {
        &self.data
    }

    /// Cancelled once the session is closed.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flips the closed flag and cancels the lifecycle token.
    /// Returns `true` only for the call that actually closed the session.
    fn mark_closed(&self) -> bool {
        let first = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.token.cancel();
        }
        first
    }

    /// Runs `f` against the bound callback on the blocking pool.
    ///
    /// Invocations on one session are serialised by the callback lock. Fails
    /// with `Closed` once the callback has been torn down, and turns a panic in
    /// the callback into a `User` error.
    pub(crate) async fn invoke<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Callback) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_closed() {
            return Err(RuntimeError::Closed(self.id.clone()));
        }
        let callback = self.callback.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = callback.lock().unwrap_or_else(PoisonError::into_inner);
            guard.as_mut().map(f)
        })
        .await;

        match joined {
            Ok(Some(out)) => Ok(out),
            Ok(None) => Err(RuntimeError::Closed(self.id.clone())),
            Err(err) => Err(RuntimeError::User(PluginError::Panicked(panic_message(err)))),
        }
    }

    pub(crate) async fn with_source<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn Source) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.invoke(move |cb| match cb.as_source() {
            Some(source) => Ok(f(source)),
            None => Err(RuntimeError::RoleMismatch { expected: Role::Source, actual: cb.role() }),
        })
        .await?
    }

    pub(crate) async fn with_sink<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn Sink) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.invoke(move |cb| match cb.as_sink() {
            Some(sink) => Ok(f(sink)),
            None => Err(RuntimeError::RoleMismatch { expected: Role::Sink, actual: cb.role() }),
        })
        .await?
    }

    pub(crate) async fn with_processor<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn Processor) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.invoke(move |cb| match cb.as_processor() {
            Some(processor) => Ok(f(processor)),
            None => Err(RuntimeError::RoleMismatch { expected: Role::Processor, actual: cb.role() }),
        })
        .await?
    }

    /// Takes the callback out and runs its teardown hook.
    ///
    /// Waits at most `timeout` (the hook may be stuck behind a running data
    /// operation or hang on its own); failures and timeouts are logged only.
    async fn teardown(&self, timeout: Duration) {
        let callback = self.callback.clone();
        let task = tokio::task::spawn_blocking(move || {
            let taken = callback.lock().unwrap_or_else(PoisonError::into_inner).take();
            taken.map(|mut cb| cb.close())
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Some(Ok(())))) => debug!(session_id = %self.id, "teardown complete"),
            Ok(Ok(Some(Err(err)))) => warn!(session_id = %self.id, error = %err, "teardown failed"),
            Ok(Ok(None)) => debug!(session_id = %self.id, "callback already torn down"),
            Ok(Err(err)) => {
                warn!(session_id = %self.id, error = %panic_message(err), "teardown panicked")
            }
            Err(_) => warn!(
                session_id = %self.id,
                timeout_ms = timeout.as_millis() as u64,
                "teardown timed out, releasing session anyway"
            ),
        }
        self.data.clear();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("role", &self.role)
            .field("window", &self.window.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Creates, looks up and destroys sessions for one plugin role.
pub struct SessionRegistry {
    factory: PluginFactory,
    sessions: DashMap<String, Arc<Session>>,
    closed: Cache<String, ()>,
    teardown_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(factory: PluginFactory, config: &RuntimeConfig) -> Self {
        Self {
            factory,
            sessions: DashMap::new(),
            closed: Cache::builder()
                .max_capacity(MAX_TOMBSTONES)
                .time_to_live(config.closed_session_ttl())
                .build(),
            teardown_timeout: config.teardown_timeout(),
        }
    }

    pub fn role(&self) -> Role {
        self.factory.role()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Builds a callback through the factory, runs its init hook and only then
    /// registers the session. An init failure leaves no trace in the registry.
    pub async fn create(&self, tenant_id: impl Into<String>, config: Bytes) -> Result<Arc<Session>> {
        let id = Uuid::new_v4().to_string();
        let tenant_id = tenant_id.into();
        let data = Arc::new(UserData::default());
        let token = CancellationToken::new();
        let ctx = SessionContext {
            session_id: id.clone(),
            tenant_id: tenant_id.clone(),
            config: config.clone(),
            data: data.clone(),
            token: token.clone(),
        };

        let factory = self.factory.clone();
        let built = tokio::task::spawn_blocking(move || {
            let mut callback = factory.build();
            callback.init(&ctx).map(|_| callback)
        })
        .await;

        let callback = match built {
            Ok(Ok(callback)) => callback,
            Ok(Err(err)) => {
                warn!(tenant_id = %tenant_id, error = %err, "session init rejected");
                return Err(RuntimeError::Config(err));
            }
            Err(err) => {
                let msg = panic_message(err);
                warn!(tenant_id = %tenant_id, error = %msg, "session init panicked");
                return Err(RuntimeError::Config(PluginError::Panicked(msg)));
            }
        };

        let session = Arc::new(Session {
            id: id.clone(),
            tenant_id,
            config,
            role: callback.role(),
            window: Window::new(0),
            data,
            token,
            closed: AtomicBool::new(false),
            callback: Arc::new(Mutex::new(Some(callback))),
        });
        self.sessions.insert(id, session.clone());

        info!(
            session_id = %session.id,
            tenant_id = %session.tenant_id,
            role = %session.role,
            "session created"
        );
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        if let Some(entry) = self.sessions.get(id) {
            let session = entry.value().clone();
            if session.is_closed() {
                return Err(RuntimeError::Closed(id.to_string()));
            }
            return Ok(session);
        }
        if self.closed.contains_key(id) {
            return Err(RuntimeError::Closed(id.to_string()));
        }
        Err(RuntimeError::NotFound(id.to_string()))
    }

    /// Closes a session.
    ///
    /// Unknown ids are an error; closing an already-closed id is a no-op. The
    /// first close cancels the session token (waking anything parked on its
    /// window), frees the slot and runs the teardown hook exactly once.
    pub async fn close(&self, id: &str) -> Result<()> {
        let Some(session) = self.sessions.get(id).map(|e| e.value().clone()) else {
            if self.closed.contains_key(id) {
                debug!(session_id = %id, "session already closed");
                return Ok(());
            }
            return Err(RuntimeError::NotFound(id.to_string()));
        };

        if !session.mark_closed() {
            debug!(session_id = %id, "session already closing");
            return Ok(());
        }
        // Tombstone first so a concurrent close never sees neither entry.
        self.closed.insert(id.to_string(), ());
        self.sessions.remove(id);

        session.teardown(self.teardown_timeout).await;
        info!(session_id = %id, tenant_id = %session.tenant_id, "session closed");
        Ok(())
    }

    /// Closes every live session; used on process shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "closing all sessions");
        let closes = ids.iter().map(|id| self.close(id));
        for (id, res) in ids.iter().zip(futures::future::join_all(closes).await) {
            if let Err(err) = res {
                debug!(session_id = %id, error = %err, "session vanished during shutdown");
            }
        }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("role", &self.role())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
