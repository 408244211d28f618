//! Module for the engine's durable state.
//!
//! This module manages the on-disk kv store using sled. Every record lives under the
//! collection prefix, delimited by a slash:
//! `<collection>/in_progress_backup`
//! `<collection>/old_enclaves_to_delete`
//! `<collection>/master_secret`, `is_backed_up`, `pin_type`, `pin_verification`, `enclave`
//! `<collection>/credential/<username>`
//! `<collection>/credential_refresh_app_version`
//! `<collection>/synced_storage_service_key`
//!
//! Values are bincode-encoded. Mutations that touch more than one record go through
//! [`RecoveryStateStore::write`], which runs them in a single sled transaction.

use std::collections::BTreeSet;
use std::path::Path;

use bincode::{Decode, Encode};
use sled::Db;
use sled::transaction::{TransactionError, TransactionalTree, UnabortableTransactionError};
use thiserror::Error;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::enclave::EnclaveIdentity;
use crate::pin::{self, PinType};
use crate::secret::MasterSecret;
use crate::transport::AuthCredential;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("transaction: {0}")]
    Transaction(#[from] UnabortableTransactionError),

    #[error("encoding {key}: {source}")]
    Encode {
        key: String,
        source: bincode::error::EncodeError,
    },

    #[error("decoding {key}: {source}")]
    Decode {
        key: String,
        source: bincode::error::DecodeError,
    },

    #[error("corrupt record {0}")]
    Corrupt(String),
}

/// A backup the server accepted as pending but that has not been exposed yet.
///
/// Its presence means: only ever send `Expose` for this ciphertext until either the expose
/// succeeds, the user picks a different PIN, or escrow is wiped.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct InProgressBackup {
    master_secret: Vec<u8>,
    encrypted_master_secret: Vec<u8>,
    #[zeroize(skip)]
    pin_type: PinType,
    pin_verification: String,
    // a checkpoint for another enclave is safe to drop and redo against the current one
    enclave: String,
}

impl InProgressBackup {
    pub fn new(
        master_secret: &MasterSecret,
        encrypted_master_secret: Vec<u8>,
        pin_type: PinType,
        pin_verification: String,
        enclave: &EnclaveIdentity,
    ) -> Self {
        Self {
            master_secret: master_secret.expose().to_vec(),
            encrypted_master_secret,
            pin_type,
            pin_verification,
            enclave: enclave.to_hex(),
        }
    }

    /// Whether this checkpoint was made for `pin` against `enclave`. Runs argon2; call it
    /// off the async executor.
    pub fn matches_intent(&self, pin: &str, enclave: &EnclaveIdentity) -> bool {
        self.enclave == enclave.to_hex() && pin::verify_pin(pin, &self.pin_verification)
    }

    pub fn master_secret(&self) -> Result<MasterSecret, StoreError> {
        MasterSecret::from_slice(&self.master_secret)
            .map_err(|e| StoreError::Corrupt(format!("in progress backup: {e}")))
    }

    pub fn encrypted_master_secret(&self) -> &[u8] {
        &self.encrypted_master_secret
    }

    pub fn pin_type(&self) -> PinType {
        self.pin_type
    }

    pub fn pin_verification(&self) -> &str {
        &self.pin_verification
    }

    pub fn enclave(&self) -> &str {
        &self.enclave
    }
}

impl std::fmt::Debug for InProgressBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProgressBackup")
            .field("pin_type", &self.pin_type)
            .field("enclave", &self.enclave)
            .finish_non_exhaustive()
    }
}

/// Everything written when a backup is finalized or a restore succeeds.
pub struct LocalData<'a> {
    pub master_secret: &'a MasterSecret,
    pub is_backed_up: bool,
    pub pin_type: PinType,
    pub pin_verification: Option<&'a str>,
    pub enclave: Option<&'a str>,
}

/// A wrapper around sled's `Db` type.
#[derive(Clone)]
pub struct KvStore {
    db: Db,
}

impl KvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        Ok(Self { db })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

/// The engine's records inside a [`KvStore`].
#[derive(Clone)]
pub struct RecoveryStateStore {
    kv_store: KvStore,
    name: String,
}

impl RecoveryStateStore {
    pub fn new(kv_store: KvStore, name: impl Into<String>) -> Self {
        Self {
            kv_store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` in a read transaction for a consistent view across records.
    pub fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(&StateTx<'_>) -> Result<T, StoreError>,
    {
        self.transaction(f)
    }

    /// Runs `f` in a write transaction and flushes once it commits.
    ///
    /// `f` may run more than once if sled detects a conflict, so it must not have side
    /// effects outside the transaction.
    pub fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(&StateTx<'_>) -> Result<T, StoreError>,
    {
        let value = self.transaction(f)?;
        self.kv_store.db().flush()?;
        Ok(value)
    }

    fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(&StateTx<'_>) -> Result<T, StoreError>,
    {
        self.kv_store
            .db()
            .transaction(|tree| {
                let tx = StateTx { tree, prefix: &self.name };
                f(&tx).map_err(|e| match e {
                    StoreError::Transaction(inner) => inner.into(),
                    other => sled::transaction::ConflictableTransactionError::Abort(other),
                })
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => StoreError::Sled(e),
            })
    }

    pub fn master_secret(&self) -> Result<Option<MasterSecret>, StoreError> {
        self.read(|tx| tx.master_secret())
    }

    pub fn is_backed_up(&self) -> Result<bool, StoreError> {
        self.read(|tx| tx.is_backed_up())
    }

    pub fn pin_type(&self) -> Result<Option<PinType>, StoreError> {
        self.read(|tx| tx.pin_type())
    }

    pub fn pin_verification(&self) -> Result<Option<String>, StoreError> {
        self.read(|tx| tx.pin_verification())
    }

    pub fn enclave(&self) -> Result<Option<String>, StoreError> {
        self.read(|tx| tx.enclave())
    }

    /// The current checkpoint. A record that no longer decodes is treated like a reinstall:
    /// as if there were none.
    pub fn in_progress_backup(&self) -> Result<Option<InProgressBackup>, StoreError> {
        match self.read(|tx| tx.in_progress_backup()) {
            Err(StoreError::Decode { key, source }) => {
                warn!(%key, %source, "Failed to decode in progress backup state");
                Ok(None)
            }
            other => other,
        }
    }

    pub fn pending_deletions(
        &self,
        known: &[EnclaveIdentity],
    ) -> Result<Vec<EnclaveIdentity>, StoreError> {
        self.read(|tx| tx.pending_deletions(known))
    }
}

/// Typed access to the engine's records inside one sled transaction.
pub struct StateTx<'a> {
    tree: &'a TransactionalTree,
    prefix: &'a str,
}

impl StateTx<'_> {
    fn path(&self, record: &str) -> String {
        format!("{prefix}/{record}", prefix = self.prefix)
    }

    fn credential_path(&self, username: &str) -> String {
        self.path(&format!("credential/{username}"))
    }

    fn get<T: Decode<()>>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.tree.get(key.as_bytes())? {
            Some(value) => {
                let (decoded, _): (T, usize) =
                    bincode::decode_from_slice(&value, bincode::config::standard()).map_err(
                        |source| StoreError::Decode {
                            key: key.to_string(),
                            source,
                        },
                    )?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    fn put<T: Encode>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let mut encoded = bincode::encode_to_vec(value, bincode::config::standard()).map_err(
            |source| StoreError::Encode {
                key: key.to_string(),
                source,
            },
        )?;
        self.tree.insert(key.as_bytes(), encoded.as_slice())?;
        encoded.zeroize();
        Ok(())
    }

    fn put_opt<T: Encode>(&self, key: &str, value: Option<&T>) -> Result<(), StoreError> {
        match value {
            Some(value) => self.put(key, value),
            None => self.remove(key),
        }
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn in_progress_backup(&self) -> Result<Option<InProgressBackup>, StoreError> {
        self.get(&self.path("in_progress_backup"))
    }

    pub fn set_in_progress_backup(&self, backup: &InProgressBackup) -> Result<(), StoreError> {
        self.put(&self.path("in_progress_backup"), backup)
    }

    pub fn clear_in_progress_backup(&self) -> Result<(), StoreError> {
        self.remove(&self.path("in_progress_backup"))
    }

    pub fn master_secret(&self) -> Result<Option<MasterSecret>, StoreError> {
        let key = self.path("master_secret");
        match self.get::<Vec<u8>>(&key)? {
            Some(bytes) => MasterSecret::from_vec(bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    pub fn set_master_secret(&self, secret: Option<&MasterSecret>) -> Result<(), StoreError> {
        let key = self.path("master_secret");
        match secret {
            Some(secret) => self.put(&key, &secret.expose().to_vec()),
            None => self.remove(&key),
        }
    }

    pub fn is_backed_up(&self) -> Result<bool, StoreError> {
        Ok(self.get(&self.path("is_backed_up"))?.unwrap_or(false))
    }

    pub fn set_is_backed_up(&self, value: bool) -> Result<(), StoreError> {
        self.put(&self.path("is_backed_up"), &value)
    }

    pub fn pin_type(&self) -> Result<Option<PinType>, StoreError> {
        self.get(&self.path("pin_type"))
    }

    pub fn set_pin_type(&self, value: Option<PinType>) -> Result<(), StoreError> {
        self.put_opt(&self.path("pin_type"), value.as_ref())
    }

    pub fn pin_verification(&self) -> Result<Option<String>, StoreError> {
        self.get(&self.path("pin_verification"))
    }

    pub fn set_pin_verification(&self, value: Option<&str>) -> Result<(), StoreError> {
        self.put_opt(&self.path("pin_verification"), value.map(str::to_string).as_ref())
    }

    /// Enclave the secret was last backed up to or restored from, as hex.
    pub fn enclave(&self) -> Result<Option<String>, StoreError> {
        self.get(&self.path("enclave"))
    }

    pub fn set_enclave(&self, value: Option<&str>) -> Result<(), StoreError> {
        self.put_opt(&self.path("enclave"), value.map(str::to_string).as_ref())
    }

    /// Storage-service key received directly from a primary that predates master secret sync.
    pub fn synced_storage_service_key(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.get(&self.path("synced_storage_service_key"))
    }

    pub fn set_synced_storage_service_key(&self, key: &[u8]) -> Result<(), StoreError> {
        self.put(&self.path("synced_storage_service_key"), &key.to_vec())
    }

    pub fn clear_synced_storage_service_key(&self) -> Result<(), StoreError> {
        self.remove(&self.path("synced_storage_service_key"))
    }

    /// Writes the local view of a completed backup or restore. Returns whether the master
    /// secret changed.
    pub fn apply_local_data(&self, data: &LocalData<'_>) -> Result<bool, StoreError> {
        let changed = self.master_secret()?.as_ref() != Some(data.master_secret);
        if changed {
            self.set_master_secret(Some(data.master_secret))?;
        }
        self.set_is_backed_up(data.is_backed_up)?;
        self.set_pin_type(Some(data.pin_type))?;
        self.set_pin_verification(data.pin_verification)?;
        self.set_enclave(data.enclave)?;
        Ok(changed)
    }

    /// Wipes the secret, its metadata and any checkpoint. In-flight exposes see no
    /// checkpoint afterwards and discard their result.
    pub fn clear_keys(&self) -> Result<(), StoreError> {
        self.clear_in_progress_backup()?;
        self.set_master_secret(None)?;
        self.remove(&self.path("is_backed_up"))?;
        self.set_pin_type(None)?;
        self.set_pin_verification(None)?;
        self.set_enclave(None)?;
        self.clear_synced_storage_service_key()
    }

    pub fn credential(&self, username: &str) -> Result<Option<AuthCredential>, StoreError> {
        self.get(&self.credential_path(username))
    }

    pub fn store_credential(&self, credential: &AuthCredential) -> Result<(), StoreError> {
        self.put(&self.credential_path(&credential.username), credential)
    }

    /// Evicts `credential` if it is the one cached for its user.
    pub fn delete_invalid_credential(&self, credential: &AuthCredential) -> Result<(), StoreError> {
        if self.credential(&credential.username)?.as_ref() == Some(credential) {
            self.remove(&self.credential_path(&credential.username))?;
        }
        Ok(())
    }

    pub fn remove_credentials(&self, username: &str) -> Result<(), StoreError> {
        self.remove(&self.credential_path(username))
    }

    pub fn credential_refresh_app_version(&self) -> Result<Option<String>, StoreError> {
        self.get(&self.path("credential_refresh_app_version"))
    }

    pub fn set_credential_refresh_app_version(&self, version: &str) -> Result<(), StoreError> {
        self.put(
            &self.path("credential_refresh_app_version"),
            &version.to_string(),
        )
    }

    fn pending_set(&self) -> Result<BTreeSet<String>, StoreError> {
        pending_set_or_empty(self.get(&self.path("old_enclaves_to_delete")))
    }

    fn put_pending_set(
        &self,
        mut set: BTreeSet<String>,
        known: &[EnclaveIdentity],
    ) -> Result<(), StoreError> {
        // forget enclaves that are no longer configured as previous ones
        set.retain(|hex| known.iter().any(|e| e.to_hex() == *hex));
        self.put(&self.path("old_enclaves_to_delete"), &set)
    }

    /// Enclaves awaiting deletion, in the order of `known` (newest first).
    pub fn pending_deletions(
        &self,
        known: &[EnclaveIdentity],
    ) -> Result<Vec<EnclaveIdentity>, StoreError> {
        let set = self.pending_set()?;
        Ok(known
            .iter()
            .filter(|e| set.contains(&e.to_hex()))
            .copied()
            .collect())
    }

    pub fn add_pending_deletion(
        &self,
        enclave: &EnclaveIdentity,
        known: &[EnclaveIdentity],
    ) -> Result<(), StoreError> {
        let mut set = self.pending_set()?;
        set.insert(enclave.to_hex());
        self.put_pending_set(set, known)
    }

    pub fn mark_deleted(
        &self,
        enclave: &EnclaveIdentity,
        known: &[EnclaveIdentity],
    ) -> Result<(), StoreError> {
        let mut set = self.pending_set()?;
        set.remove(&enclave.to_hex());
        self.put_pending_set(set, known)
    }
}

/// A set of hex strings that no longer decodes is as good as empty. Any other failure
/// propagates, so a mutation never writes back a set it could not read.
fn pending_set_or_empty(
    read: Result<Option<BTreeSet<String>>, StoreError>,
) -> Result<BTreeSet<String>, StoreError> {
    match read {
        Ok(set) => Ok(set.unwrap_or_default()),
        Err(StoreError::Decode { key, source }) => {
            warn!(%key, %source, "Failed to decode pending deletions");
            Ok(BTreeSet::new())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
pub(crate) fn temp_store() -> (tempfile::TempDir, RecoveryStateStore) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let kv_store = KvStore::open(dir.path().join("db")).expect("Failed to open sled database");
    (dir, RecoveryStateStore::new(kv_store, "svr2"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::derive_verification_string;

    fn enclave(byte: u8) -> EnclaveIdentity {
        EnclaveIdentity::new([byte; 32])
    }

    fn checkpoint(pin: &str, enclave: &EnclaveIdentity) -> InProgressBackup {
        InProgressBackup::new(
            &MasterSecret::generate(),
            vec![9u8; 60],
            PinType::for_pin(pin),
            derive_verification_string(pin).unwrap(),
            enclave,
        )
    }

    #[test]
    fn test_checkpoint_roundtrip_and_clear() {
        let (_dir, store) = temp_store();
        assert!(store.in_progress_backup().unwrap().is_none());

        let backup = checkpoint("1234", &enclave(1));
        store.write(|tx| tx.set_in_progress_backup(&backup)).unwrap();
        let loaded = store.in_progress_backup().unwrap().unwrap();
        assert_eq!(loaded, backup);
        assert!(loaded.matches_intent("1234", &enclave(1)));
        assert!(!loaded.matches_intent("1234", &enclave(2)));
        assert!(!loaded.matches_intent("0000", &enclave(1)));

        store.write(|tx| tx.clear_in_progress_backup()).unwrap();
        assert!(store.in_progress_backup().unwrap().is_none());
    }

    #[test]
    fn test_undecodable_checkpoint_is_absent() {
        let (_dir, store) = temp_store();
        store
            .kv_store
            .db()
            .insert("svr2/in_progress_backup", vec![0xffu8; 3])
            .unwrap();
        assert!(store.in_progress_backup().unwrap().is_none());
    }

    #[test]
    fn test_local_data_and_clear_keys() {
        let (_dir, store) = temp_store();
        let secret = MasterSecret::generate();
        let hex = enclave(1).to_hex();

        let changed = store
            .write(|tx| {
                tx.apply_local_data(&LocalData {
                    master_secret: &secret,
                    is_backed_up: true,
                    pin_type: PinType::Numeric,
                    pin_verification: Some("$argon2id$stub"),
                    enclave: Some(hex.as_str()),
                })
            })
            .unwrap();
        assert!(changed);
        assert_eq!(store.master_secret().unwrap(), Some(secret.clone()));
        assert!(store.is_backed_up().unwrap());
        assert_eq!(store.pin_type().unwrap(), Some(PinType::Numeric));
        assert_eq!(store.enclave().unwrap(), Some(hex.clone()));

        let changed_again = store
            .write(|tx| {
                tx.apply_local_data(&LocalData {
                    master_secret: &secret,
                    is_backed_up: true,
                    pin_type: PinType::Numeric,
                    pin_verification: None,
                    enclave: None,
                })
            })
            .unwrap();
        assert!(!changed_again);
        assert!(store.pin_verification().unwrap().is_none());

        store
            .write(|tx| tx.set_synced_storage_service_key(&[7u8; 32]))
            .unwrap();
        store.write(|tx| tx.clear_keys()).unwrap();
        assert!(store.master_secret().unwrap().is_none());
        assert!(store.read(|tx| tx.synced_storage_service_key()).unwrap().is_none());
        assert!(!store.is_backed_up().unwrap());
        assert!(store.pin_type().unwrap().is_none());
    }

    #[test]
    fn test_pending_deletions_are_garbage_collected() {
        let (_dir, store) = temp_store();
        let known = [enclave(2), enclave(3)];

        store
            .write(|tx| {
                tx.add_pending_deletion(&enclave(3), &known)?;
                tx.add_pending_deletion(&enclave(2), &known)?;
                // not a previous enclave any more
                tx.add_pending_deletion(&enclave(9), &known)
            })
            .unwrap();
        assert_eq!(
            store.pending_deletions(&known).unwrap(),
            vec![enclave(2), enclave(3)]
        );

        store.write(|tx| tx.mark_deleted(&enclave(2), &known)).unwrap();
        assert_eq!(store.pending_deletions(&known).unwrap(), vec![enclave(3)]);

        // enclave 3 retired from configuration: dropped on the next mutation
        let known = [enclave(2)];
        store.write(|tx| tx.mark_deleted(&enclave(2), &known)).unwrap();
        assert!(store.pending_deletions(&[enclave(3)]).unwrap().is_empty());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_undecodable_pending_set_is_empty() {
        let (_dir, store) = temp_store();
        let known = [enclave(2), enclave(3)];
        store
            .kv_store
            .db()
            .insert("svr2/old_enclaves_to_delete", vec![0xffu8; 3])
            .unwrap();
        assert!(store.pending_deletions(&known).unwrap().is_empty());
        assert!(logs_contain("Failed to decode pending deletions"));

        store
            .write(|tx| tx.add_pending_deletion(&enclave(3), &known))
            .unwrap();
        assert_eq!(store.pending_deletions(&known).unwrap(), vec![enclave(3)]);
    }

    #[test]
    fn test_pending_set_read_failure_propagates() {
        let failed = pending_set_or_empty(Err(StoreError::Corrupt("io".into())));
        assert!(matches!(failed, Err(StoreError::Corrupt(_))));

        let stored = BTreeSet::from([enclave(2).to_hex()]);
        assert_eq!(pending_set_or_empty(Ok(Some(stored.clone()))).unwrap(), stored);
        assert!(pending_set_or_empty(Ok(None)).unwrap().is_empty());
    }

    #[test]
    fn test_credential_cache() {
        let (_dir, store) = temp_store();
        let good = AuthCredential::new("alice", "pw1");
        let stale = AuthCredential::new("alice", "pw0");

        store.write(|tx| tx.store_credential(&good)).unwrap();
        // evicting a different credential leaves the cached one alone
        store.write(|tx| tx.delete_invalid_credential(&stale)).unwrap();
        assert_eq!(store.read(|tx| tx.credential("alice")).unwrap(), Some(good.clone()));

        store.write(|tx| tx.delete_invalid_credential(&good)).unwrap();
        assert!(store.read(|tx| tx.credential("alice")).unwrap().is_none());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let backup = checkpoint("1234", &enclave(1));
        {
            let store = RecoveryStateStore::new(KvStore::open(dir.path()).unwrap(), "svr2");
            store.write(|tx| tx.set_in_progress_backup(&backup)).unwrap();
        }
        let store = RecoveryStateStore::new(KvStore::open(dir.path()).unwrap(), "svr2");
        assert_eq!(store.in_progress_backup().unwrap(), Some(backup));
    }
}
