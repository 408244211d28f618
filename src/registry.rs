//! Live channels keyed by enclave identity.
//!
//! Opening is globally serialized: one handshake at a time for the whole engine. A caller that
//! queued behind another attempt for the same enclave gets the channel that attempt registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, instrument, warn};

use crate::account::AccountState;
use crate::channel::{ChannelSettings, RequestChannel};
use crate::enclave::EnclaveIdentity;
use crate::error::{Result, TransportError};
use crate::kv::RecoveryStateStore;
use crate::lifecycle::Lifecycle;
use crate::transport::{AuthCredential, AuthStrategy, EnclaveConnection, EnclaveConnector};

type ChannelMap = Arc<Mutex<HashMap<EnclaveIdentity, RequestChannel>>>;

pub struct ChannelRegistry {
    connector: Arc<dyn EnclaveConnector>,
    account: Arc<dyn AccountState>,
    store: RecoveryStateStore,
    settings: ChannelSettings,
    lifecycle: Lifecycle,
    open_lock: tokio::sync::Mutex<()>,
    channels: ChannelMap,
    next_id: AtomicU64,
}

fn lock_map(
    channels: &Mutex<HashMap<EnclaveIdentity, RequestChannel>>,
) -> MutexGuard<'_, HashMap<EnclaveIdentity, RequestChannel>> {
    channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChannelRegistry {
    pub fn new(
        connector: Arc<dyn EnclaveConnector>,
        account: Arc<dyn AccountState>,
        store: RecoveryStateStore,
        settings: ChannelSettings,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            connector,
            account,
            store,
            settings,
            lifecycle,
            open_lock: tokio::sync::Mutex::new(()),
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the live channel for `enclave`, opening one if needed.
    #[instrument(skip_all, fields(enclave = %enclave))]
    pub async fn open(&self, enclave: &EnclaveIdentity, auth: &AuthStrategy) -> Result<RequestChannel> {
        self.lifecycle.ensure_running()?;
        let _opening = tokio::select! {
            guard = self.open_lock.lock() => guard,
            _ = self.lifecycle.terminated() => return Err(TransportError::Terminated.into()),
        };

        if let Some(channel) = self.live(enclave) {
            debug!(id = channel.id(), "Reusing channel");
            return Ok(channel);
        }

        let strategy = self.resolve(auth)?;
        let connection = self.connect(enclave, strategy).await?;
        if let Err(err) = self
            .store
            .write(|tx| tx.store_credential(connection.credential()))
        {
            warn!(%err, "Failed to cache credential");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channels = self.channels.clone();
        let channel = RequestChannel::new(
            id,
            *enclave,
            connection,
            self.settings,
            self.lifecycle.clone(),
            Box::new(move |enclave: &EnclaveIdentity, id: u64| {
                let mut channels = lock_map(&channels);
                // a newer channel may already be registered under this enclave
                if channels.get(enclave).is_some_and(|c| c.id() == id) {
                    channels.remove(enclave);
                }
            }),
        );
        lock_map(&self.channels).insert(*enclave, channel.clone());
        debug!(id, "Opened channel");
        Ok(channel)
    }

    fn live(&self, enclave: &EnclaveIdentity) -> Option<RequestChannel> {
        lock_map(&self.channels)
            .get(enclave)
            .filter(|c| c.is_open())
            .cloned()
    }

    /// Implicit auth prefers the credential cached for the current user.
    fn resolve(&self, auth: &AuthStrategy) -> Result<AuthStrategy> {
        match auth {
            AuthStrategy::Implicit => {
                let cached = match self.account.username() {
                    Some(username) => self.store.read(|tx| tx.credential(&username))?,
                    None => None,
                };
                Ok(match cached {
                    Some(credential) => AuthStrategy::with_fallback(credential, AuthStrategy::Implicit),
                    None => AuthStrategy::Implicit,
                })
            }
            other => Ok(other.clone()),
        }
    }

    async fn connect(
        &self,
        enclave: &EnclaveIdentity,
        mut strategy: AuthStrategy,
    ) -> Result<Box<dyn EnclaveConnection>> {
        loop {
            match strategy {
                AuthStrategy::Implicit => return Ok(self.handshake(enclave, None).await?),
                AuthStrategy::Credential {
                    credential,
                    fallback,
                } => match self.handshake(enclave, Some(&credential)).await {
                    Ok(connection) => return Ok(connection),
                    Err(TransportError::Terminated) => return Err(TransportError::Terminated.into()),
                    Err(err) => {
                        warn!(%err, username = %credential.username, "Handshake failed, evicting credential");
                        self.store
                            .write(|tx| tx.delete_invalid_credential(&credential))?;
                        match fallback {
                            Some(next) => strategy = *next,
                            None => return Err(err.into()),
                        }
                    }
                },
            }
        }
    }

    async fn handshake(
        &self,
        enclave: &EnclaveIdentity,
        credential: Option<&AuthCredential>,
    ) -> std::result::Result<Box<dyn EnclaveConnection>, TransportError> {
        tokio::select! {
            _ = self.lifecycle.terminated() => Err(TransportError::Terminated),
            result = tokio::time::timeout(
                self.settings.request_timeout,
                self.connector.connect(enclave, credential),
            ) => result.unwrap_or(Err(TransportError::Timeout)),
        }
    }

    /// Fails every queued request on every channel and forgets them all.
    pub fn shutdown(&self) {
        let channels: Vec<_> = lock_map(&self.channels).drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.terminate();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock_map(&self.channels).len()
    }
}
