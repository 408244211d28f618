//! The recovery engine: public operations over the flows, run one at a time.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::account::{AccountState, NoStorageSync, StorageSync};
use crate::backup;
use crate::channel::ChannelSettings;
use crate::config::EngineConfig;
use crate::crypt::{Argon2PinHasher, PinDerivedMaterial, PinHasher, offload};
use crate::delete;
use crate::enclave::EnclaveIdentity;
use crate::error::{Error, Result};
use crate::kv::{KvStore, LocalData, RecoveryStateStore};
use crate::lifecycle::Lifecycle;
use crate::pin::{self, PinType};
use crate::registry::ChannelRegistry;
use crate::restore::{self, RestoreOutcome};
use crate::secret::MasterSecret;
use crate::transport::{AuthStrategy, EnclaveConnector};

/// Everything outside the engine it talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn EnclaveConnector>,
    pub hasher: Arc<dyn PinHasher>,
    pub account: Arc<dyn AccountState>,
    pub storage_sync: Arc<dyn StorageSync>,
}

impl Collaborators {
    /// Default argon2 hasher and no storage service.
    pub fn new(connector: Arc<dyn EnclaveConnector>, account: Arc<dyn AccountState>) -> Self {
        Self {
            connector,
            hasher: Arc::new(Argon2PinHasher::default()),
            account,
            storage_sync: Arc::new(NoStorageSync),
        }
    }
}

/// State shared by the flows.
pub(crate) struct EngineContext {
    pub(crate) config: EngineConfig,
    pub(crate) store: RecoveryStateStore,
    pub(crate) registry: ChannelRegistry,
    pub(crate) connector: Arc<dyn EnclaveConnector>,
    pub(crate) hasher: Arc<dyn PinHasher>,
    pub(crate) account: Arc<dyn AccountState>,
    pub(crate) storage_sync: Arc<dyn StorageSync>,
    pub(crate) lifecycle: Lifecycle,
}

impl EngineContext {
    /// Derives PIN material on the blocking pool.
    pub(crate) async fn derive(
        &self,
        normalized_pin: &str,
        enclave: &EnclaveIdentity,
        username: &str,
    ) -> Result<PinDerivedMaterial> {
        let hasher = self.hasher.clone();
        let pin = normalized_pin.to_string();
        let enclave = *enclave;
        let username = username.to_string();
        let material = offload(move || hasher.derive(&pin, &enclave, &username)).await?;
        self.lifecycle.ensure_running()?;
        Ok(material)
    }

    /// Follow-up for a write that replaced the master secret.
    pub(crate) fn secret_rotated(&self, auth: &AuthStrategy) {
        if self.account.is_registered_primary() {
            self.storage_sync.master_secret_rotated(auth);
        }
    }

    pub(crate) fn retired_enclaves(&self) -> Vec<EnclaveIdentity> {
        self.config.retired_enclaves().copied().collect()
    }
}

pub struct RecoveryEngine {
    ctx: EngineContext,
    // flows run end to end under this, one at a time
    worker: tokio::sync::Mutex<()>,
}

impl RecoveryEngine {
    pub fn new(
        config: EngineConfig,
        store: RecoveryStateStore,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let lifecycle = Lifecycle::new();
        let registry = ChannelRegistry::new(
            collaborators.connector.clone(),
            collaborators.account.clone(),
            store.clone(),
            ChannelSettings {
                idle_grace: config.idle_grace(),
                request_timeout: config.request_timeout(),
            },
            lifecycle.clone(),
        );
        Ok(Self {
            ctx: EngineContext {
                config,
                store,
                registry,
                connector: collaborators.connector,
                hasher: collaborators.hasher,
                account: collaborators.account,
                storage_sync: collaborators.storage_sync,
                lifecycle,
            },
            worker: tokio::sync::Mutex::new(()),
        })
    }

    /// Opens the sled database at `path` and builds an engine over it.
    pub fn open(
        config: EngineConfig,
        path: impl AsRef<Path>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let store = RecoveryStateStore::new(KvStore::open(path)?, config.collection.clone());
        Self::new(config, store, collaborators)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn store(&self) -> &RecoveryStateStore {
        &self.ctx.store
    }

    pub(crate) fn context(&self) -> &EngineContext {
        &self.ctx
    }

    async fn worker(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.ctx.lifecycle.ensure_running()?;
        tokio::select! {
            guard = self.worker.lock() => {
                self.ctx.lifecycle.ensure_running()?;
                Ok(guard)
            }
            _ = self.ctx.lifecycle.terminated() => Err(Error::LifecycleTerminated),
        }
    }

    pub fn has_secret(&self) -> Result<bool> {
        Ok(self.ctx.store.master_secret()?.is_some())
    }

    pub fn has_backed_up_secret(&self) -> Result<bool> {
        Ok(self.ctx.store.is_backed_up()?)
    }

    pub fn current_pin_type(&self) -> Result<Option<PinType>> {
        Ok(self.ctx.store.pin_type()?)
    }

    /// Checks `pin` against the stored verification string. Never touches the network.
    pub async fn verify_pin(&self, pin: &str) -> Result<bool> {
        let Some(verification) = self.ctx.store.pin_verification()? else {
            return Ok(false);
        };
        let pin = pin::normalize_pin(pin);
        Ok(offload(move || Ok(pin::verify_pin(&pin, &verification))).await?)
    }

    /// Backs the local master secret up under `pin`, generating the secret first if there is
    /// none. Returns the secret that is now backed up.
    #[instrument(skip_all)]
    pub async fn generate_and_backup(
        &self,
        pin: &str,
        auth: &AuthStrategy,
    ) -> Result<MasterSecret> {
        let _worker = self.worker().await?;
        let secret = match self.ctx.store.master_secret()? {
            Some(secret) => secret,
            None => {
                info!("Generating master secret");
                MasterSecret::generate()
            }
        };
        backup::backup_and_expose(&self.ctx, pin, &secret, auth).await
    }

    #[instrument(skip_all)]
    pub async fn restore(&self, pin: &str, auth: &AuthStrategy) -> RestoreOutcome {
        let _worker = match self.worker().await {
            Ok(worker) => worker,
            Err(err) => return RestoreOutcome::from_error(err),
        };
        restore::restore(&self.ctx, pin, auth).await
    }

    /// Restores, then backs the recovered secret up to the current enclave with a fresh guess
    /// budget. A backup found in a retired enclave is queued for deletion there.
    #[instrument(skip_all)]
    pub async fn restore_and_rebackup(&self, pin: &str, auth: &AuthStrategy) -> RestoreOutcome {
        let _worker = match self.worker().await {
            Ok(worker) => worker,
            Err(err) => return RestoreOutcome::from_error(err),
        };
        let outcome = restore::restore(&self.ctx, pin, auth).await;
        let RestoreOutcome::Success { secret, enclave } = &outcome else {
            return outcome;
        };

        if let Err(err) = backup::backup_and_expose(&self.ctx, pin, secret, auth).await {
            warn!(%err, "Backup after restore failed");
            return RestoreOutcome::from_error(err);
        }

        if *enclave != self.ctx.config.current_enclave {
            if self.ctx.config.is_retired(enclave) {
                let known = self.ctx.retired_enclaves();
                if let Err(err) = self
                    .ctx
                    .store
                    .write(|tx| tx.add_pending_deletion(enclave, &known))
                {
                    warn!(%err, "Failed to queue old enclave for deletion");
                }
            }
            delete::drain_pending_deletions(&self.ctx, auth).await;
        }
        outcome
    }

    /// Deletes the backup from the current enclave. Local keys are cleared whatever the
    /// server says.
    #[instrument(skip_all)]
    pub async fn delete(&self, auth: &AuthStrategy) -> Result<()> {
        let result = async {
            let _worker = self.worker().await?;
            delete::delete_from(&self.ctx, &self.ctx.config.current_enclave, auth).await
        }
        .await;
        self.clear_local()?;
        result
    }

    /// Wipes the master secret, its metadata and any in-progress backup.
    pub fn clear_local(&self) -> Result<()> {
        info!("Clearing local keys");
        self.ctx.store.write(|tx| tx.clear_keys())?;
        Ok(())
    }

    /// Switches to a random secret that is never escrowed and disables the PIN.
    pub fn use_device_local_secret(&self, auth: &AuthStrategy) -> Result<()> {
        info!("Using device local secret");
        let secret = MasterSecret::generate();
        let username = self.ctx.account.username();
        let changed = self.ctx.store.write(|tx| {
            let changed = tx.apply_local_data(&LocalData {
                master_secret: &secret,
                is_backed_up: false,
                pin_type: PinType::Alphanumeric,
                pin_verification: None,
                enclave: None,
            })?;
            if let Some(username) = &username {
                tx.remove_credentials(username)?;
            }
            // in-flight backups see no checkpoint and drop their results
            tx.clear_in_progress_backup()?;
            Ok(changed)
        })?;
        self.ctx.account.mark_pin_disabled();
        self.ctx.account.schedule_account_attributes_update();
        if changed {
            self.ctx.secret_rotated(auth);
        }
        Ok(())
    }

    /// Runs once at process start: local secret repair, migration, credential refresh, then
    /// deletion of backups in retired enclaves. Failures are logged.
    #[instrument(skip_all)]
    pub async fn warm_up(&self) {
        let Ok(_worker) = self.worker().await else {
            return;
        };
        if let Err(err) = self.set_local_secret_if_missing() {
            warn!(%err, "Failed to set local secret");
        }
        // migration queues deletions, so the drain waits for it
        if let Err(err) = delete::migrate_if_needed(&self.ctx).await {
            warn!(%err, "Enclave migration failed");
            return;
        }
        self.refresh_credential_if_needed().await;
        delete::drain_pending_deletions(&self.ctx, &AuthStrategy::Implicit).await;
    }

    fn set_local_secret_if_missing(&self) -> Result<()> {
        if !self.ctx.account.is_registered_primary() || self.has_secret()? {
            return Ok(());
        }
        if self.ctx.account.pin_code().is_some() {
            error!("Have PIN but no master secret");
        }
        self.use_device_local_secret(&AuthStrategy::Implicit)
    }

    async fn refresh_credential_if_needed(&self) {
        if !self.ctx.account.is_registered() {
            return;
        }
        let version = self.ctx.config.app_version.as_str();
        let needs_refresh = self.ctx.store.read(|tx| {
            Ok(tx.is_backed_up()?
                && tx.credential_refresh_app_version()?.as_deref() != Some(version))
        });
        match needs_refresh {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(%err, "Failed to read credential refresh state");
                return;
            }
        }

        info!("Refreshing credential for this app version");
        let fetched = tokio::select! {
            _ = self.ctx.lifecycle.terminated() => return,
            fetched = self.ctx.connector.fetch_credential() => fetched,
        };
        match fetched {
            Ok(credential) => {
                let stored = self.ctx.store.write(|tx| {
                    tx.store_credential(&credential)?;
                    tx.set_credential_refresh_app_version(version)
                });
                if let Err(err) = stored {
                    warn!(%err, "Failed to store refreshed credential");
                }
            }
            Err(err) => warn!(%err, "Unable to fetch credential"),
        }
    }

    /// Stores a secret received from the primary device.
    pub fn store_synced_secret(&self, bytes: &[u8], update_storage_service: bool) -> Result<()> {
        info!("Storing synced secret");
        let secret = MasterSecret::from_slice(bytes)?;
        let changed = self.ctx.store.write(|tx| {
            let changed = tx.master_secret()?.as_ref() != Some(&secret);
            tx.set_master_secret(Some(&secret))?;
            tx.clear_synced_storage_service_key()?;
            Ok(changed)
        })?;
        if changed && update_storage_service {
            self.ctx.storage_sync.restore_or_create_manifest();
        }
        Ok(())
    }

    /// Stores a storage-service key sent by a primary that does not sync its master secret.
    /// A master secret synced later supersedes it.
    pub fn store_synced_storage_service_key(&self, key: &[u8]) -> Result<()> {
        info!("Storing synced storage service key");
        self.ctx
            .store
            .write(|tx| tx.set_synced_storage_service_key(key))?;
        Ok(())
    }

    pub fn synced_storage_service_key(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.ctx.store.read(|tx| tx.synced_storage_service_key())?)
    }

    /// The secret to send to linked devices.
    pub fn secret_for_sync_message(&self) -> Result<Option<MasterSecret>> {
        Ok(self.ctx.store.master_secret()?)
    }

    pub fn clear_synced_storage_service_key(&self) -> Result<()> {
        info!("Clearing synced storage service key");
        self.ctx.store.write(|tx| {
            tx.clear_synced_storage_service_key()?;
            tx.set_master_secret(None)
        })?;
        Ok(())
    }

    /// Tears the engine down. Everything queued or in flight resolves with
    /// [`Error::LifecycleTerminated`].
    pub fn shutdown(&self) {
        if self.ctx.lifecycle.is_terminated() {
            return;
        }
        info!("Shutting down recovery engine");
        self.ctx.lifecycle.terminate();
        self.ctx.registry.shutdown();
    }
}

impl Drop for RecoveryEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
