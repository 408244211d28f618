//! One authenticated connection to one enclave, with strict FIFO request serialization.
//!
//! A caller takes a [`ChannelTurn`] with [`RequestChannel::acquire`] and keeps it until it has
//! finished handling the response, so the next queued request only reaches the wire after the
//! previous one was fully processed. The wire lock is a fair tokio mutex: turns are handed out
//! in submission order.
//!
//! The first transport failure kills the channel for good. Every turn that is still queued, or
//! that is requested afterwards, resolves with that same error without touching the connection.
//! When the queue has been empty for the idle grace period the channel closes itself and tells
//! its owner through the disconnect hook.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::enclave::EnclaveIdentity;
use crate::error::TransportError;
use crate::lifecycle::Lifecycle;
use crate::protocol::{Request, Response};
use crate::transport::EnclaveConnection;

/// Called once when a channel closes, with its enclave and channel id.
pub type DisconnectHook = Box<dyn Fn(&EnclaveIdentity, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    pub idle_grace: Duration,
    pub request_timeout: Duration,
}

#[derive(Clone)]
pub struct RequestChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: u64,
    enclave: EnclaveIdentity,
    connection: Box<dyn EnclaveConnection>,
    state: Mutex<ChannelState>,
    wire: Arc<tokio::sync::Mutex<()>>,
    settings: ChannelSettings,
    lifecycle: Lifecycle,
    on_disconnect: DisconnectHook,
}

#[derive(Default)]
struct ChannelState {
    closed: Option<TransportError>,
    pending: usize,
    // bumped on every acquire, so an idle timer can tell whether it is stale
    activity: u64,
}

impl RequestChannel {
    pub fn new(
        id: u64,
        enclave: EnclaveIdentity,
        connection: Box<dyn EnclaveConnection>,
        settings: ChannelSettings,
        lifecycle: Lifecycle,
        on_disconnect: DisconnectHook,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                enclave,
                connection,
                state: Mutex::new(ChannelState::default()),
                wire: Arc::new(tokio::sync::Mutex::new(())),
                settings,
                lifecycle,
                on_disconnect,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn enclave(&self) -> &EnclaveIdentity {
        &self.inner.enclave
    }

    pub fn is_open(&self) -> bool {
        self.inner.terminal_error().is_none()
    }

    /// Queues for the wire. Resolves in submission order, either with a turn or with the
    /// error that killed the channel.
    pub async fn acquire(&self) -> Result<ChannelTurn, TransportError> {
        let slot = PendingSlot::new(self.inner.clone())?;
        let guard = tokio::select! {
            guard = self.inner.wire.clone().lock_owned() => guard,
            _ = self.inner.lifecycle.terminated() => {
                self.inner.disconnect(Some(TransportError::Terminated));
                return Err(TransportError::Terminated);
            }
        };
        if let Some(err) = self.inner.terminal_error() {
            return Err(err);
        }
        Ok(ChannelTurn {
            inner: self.inner.clone(),
            _guard: guard,
            _slot: slot,
        })
    }

    /// Kills the channel, failing every queued turn with [`TransportError::Terminated`].
    pub fn terminate(&self) {
        self.inner.disconnect(Some(TransportError::Terminated));
    }
}

impl std::fmt::Debug for RequestChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestChannel")
            .field("id", &self.inner.id)
            .field("enclave", &self.inner.enclave)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ChannelInner {
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn terminal_error(&self) -> Option<TransportError> {
        self.state().closed.clone()
    }

    /// Closes the connection once. `None` is a normal closure.
    fn disconnect(&self, error: Option<TransportError>) {
        {
            let mut state = self.state();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(error.clone().unwrap_or(TransportError::Closed));
        }
        match &error {
            Some(err) => warn!(enclave = %self.enclave, id = self.id, %err, "Channel failed"),
            None => debug!(enclave = %self.enclave, id = self.id, "Channel closed"),
        }
        self.connection.close(error.as_ref());
        (self.on_disconnect)(&self.enclave, self.id);
    }

    fn schedule_idle_close(self: &Arc<Self>, activity: u64) {
        // without a runtime there is nothing to time the grace period with
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(inner.settings.idle_grace).await;
            let idle = {
                let state = inner.state();
                state.pending == 0 && state.activity == activity && state.closed.is_none()
            };
            if idle {
                inner.disconnect(None);
            }
        });
    }
}

/// Counts a caller as pending from the moment it queues until its turn is done.
struct PendingSlot {
    inner: Arc<ChannelInner>,
}

impl PendingSlot {
    fn new(inner: Arc<ChannelInner>) -> Result<Self, TransportError> {
        {
            let mut state = inner.state();
            if let Some(err) = &state.closed {
                return Err(err.clone());
            }
            state.pending += 1;
            state.activity += 1;
        }
        Ok(Self { inner })
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.inner.state();
            state.pending -= 1;
            (state.pending == 0 && state.closed.is_none()).then_some(state.activity)
        };
        if let Some(activity) = idle {
            self.inner.schedule_idle_close(activity);
        }
    }
}

/// Exclusive use of the channel's wire. Dropping it lets the next queued caller in.
pub struct ChannelTurn {
    inner: Arc<ChannelInner>,
    _guard: OwnedMutexGuard<()>,
    _slot: PendingSlot,
}

impl ChannelTurn {
    pub fn enclave(&self) -> &EnclaveIdentity {
        &self.inner.enclave
    }

    /// User the connection authenticated as; PIN material is bound to it.
    pub fn username(&self) -> &str {
        &self.inner.connection.credential().username
    }

    /// One round-trip. Any failure, including a timeout or engine teardown, kills the channel.
    pub async fn send(&mut self, request: Request) -> Result<Response, TransportError> {
        if let Some(err) = self.inner.terminal_error() {
            return Err(err);
        }
        let kind = request.kind();
        debug!(enclave = %self.inner.enclave, id = self.inner.id, ?kind, "Sending request");

        let result = tokio::select! {
            biased;
            _ = self.inner.lifecycle.terminated() => Err(TransportError::Terminated),
            result = tokio::time::timeout(
                self.inner.settings.request_timeout,
                self.inner.connection.send(request),
            ) => result.unwrap_or(Err(TransportError::Timeout)),
        };
        if let Err(err) = &result {
            self.inner.disconnect(Some(err.clone()));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::protocol::RequestKind;
    use crate::transport::AuthCredential;

    #[derive(Default)]
    struct Script {
        log: Mutex<Vec<String>>,
        fail_with: Mutex<Option<TransportError>>,
        sends: AtomicUsize,
        closed: Mutex<Option<Option<TransportError>>>,
    }

    impl Script {
        fn log(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    struct ScriptedConnection {
        credential: AuthCredential,
        script: Arc<Script>,
        latency: Duration,
    }

    #[async_trait]
    impl EnclaveConnection for ScriptedConnection {
        fn credential(&self) -> &AuthCredential {
            &self.credential
        }

        async fn send(&self, request: Request) -> Result<Response, TransportError> {
            let n = self.script.sends.fetch_add(1, Ordering::SeqCst);
            self.script.log(format!("start {n}"));
            tokio::time::sleep(self.latency).await;
            if let Some(err) = self.script.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            self.script.log(format!("end {n}"));
            assert_eq!(request.kind(), RequestKind::Delete);
            Ok(Response::Delete)
        }

        fn close(&self, error: Option<&TransportError>) {
            *self.script.closed.lock().unwrap() = Some(error.cloned());
        }
    }

    fn channel(
        script: &Arc<Script>,
        lifecycle: &Lifecycle,
        disconnects: &Arc<AtomicUsize>,
    ) -> RequestChannel {
        let connection = ScriptedConnection {
            credential: AuthCredential::new("alice", "pw"),
            script: script.clone(),
            latency: Duration::from_millis(10),
        };
        let disconnects = disconnects.clone();
        RequestChannel::new(
            7,
            EnclaveIdentity::new([1; 32]),
            Box::new(connection),
            ChannelSettings {
                idle_grace: Duration::from_millis(100),
                request_timeout: Duration::from_secs(5),
            },
            lifecycle.clone(),
            Box::new(move |_: &EnclaveIdentity, id: u64| {
                assert_eq!(id, 7);
                disconnects.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_serialized_through_response_handling() {
        let script = Arc::new(Script::default());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let channel = channel(&script, &Lifecycle::new(), &disconnects);

        let tasks: Vec<_> = (0..2)
            .map(|i| {
                let channel = channel.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let mut turn = channel.acquire().await.unwrap();
                    turn.send(Request::Delete).await.unwrap();
                    // handling the response still holds the turn
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    script.log(format!("handled {i}"));
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(
            script.entries(),
            vec!["start 0", "end 0", "handled 0", "start 1", "end 1", "handled 1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_resolves_queued_turns_in_order() {
        let script = Arc::new(Script::default());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let channel = channel(&script, &Lifecycle::new(), &disconnects);
        let resolved = Arc::new(Mutex::new(Vec::new()));

        let mut turn = channel.acquire().await.unwrap();
        let mut waiters = Vec::new();
        for i in 0..3 {
            let channel = channel.clone();
            let resolved = resolved.clone();
            waiters.push(tokio::spawn(async move {
                let result = channel.acquire().await.map(|_| ());
                resolved.lock().unwrap().push(i);
                result
            }));
            tokio::task::yield_now().await;
        }

        *script.fail_with.lock().unwrap() = Some(TransportError::Network("reset".into()));
        let err = turn.send(Request::Delete).await.unwrap_err();
        assert_eq!(err, TransportError::Network("reset".into()));
        drop(turn);

        for waiter in waiters {
            assert_eq!(
                waiter.await.unwrap(),
                Err(TransportError::Network("reset".into()))
            );
        }
        assert_eq!(*resolved.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(script.sends.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(
            *script.closed.lock().unwrap(),
            Some(Some(TransportError::Network("reset".into())))
        );

        // later submissions fail immediately as well
        assert!(channel.acquire().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_channel_closes_after_grace() {
        let script = Arc::new(Script::default());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let channel = channel(&script, &Lifecycle::new(), &disconnects);

        channel.acquire().await.unwrap().send(Request::Delete).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // activity inside the grace period restarts it
        channel.acquire().await.unwrap().send(Request::Delete).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(channel.is_open());
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!channel.is_open());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(*script.closed.lock().unwrap(), Some(None));
        assert_eq!(channel.acquire().await.err(), Some(TransportError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_fails_every_queued_turn() {
        let script = Arc::new(Script::default());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let lifecycle = Lifecycle::new();
        let channel = channel(&script, &lifecycle, &disconnects);

        let holder = channel.acquire().await.unwrap();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let channel = channel.clone();
                tokio::spawn(async move { channel.acquire().await.map(|_| ()) })
            })
            .collect();
        tokio::task::yield_now().await;

        lifecycle.terminate();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Err(TransportError::Terminated));
        }
        drop(holder);
        assert_eq!(script.sends.load(Ordering::SeqCst), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_kills_channel() {
        let script = Arc::new(Script::default());
        let connection = ScriptedConnection {
            credential: AuthCredential::new("alice", "pw"),
            script: script.clone(),
            latency: Duration::from_secs(60),
        };
        let channel = RequestChannel::new(
            1,
            EnclaveIdentity::new([2; 32]),
            Box::new(connection),
            ChannelSettings {
                idle_grace: Duration::from_millis(100),
                request_timeout: Duration::from_secs(1),
            },
            Lifecycle::new(),
            Box::new(|_: &EnclaveIdentity, _: u64| {}),
        );

        let mut turn = channel.acquire().await.unwrap();
        assert_eq!(
            turn.send(Request::Delete).await,
            Err(TransportError::Timeout)
        );
        assert!(!channel.is_open());
    }
}
