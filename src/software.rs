//! software enclave - in-memory implementation for testing
//!
//! no attestation and no encryption on the wire. keeps one record per (enclave, user) with
//! the same two-phase backup and guess-counting rules as the real service, logs every
//! request it sees, and can be scripted to fail.
//! useful for development and testing, NOT for production.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::account::{AccountState, StorageSync};
use crate::enclave::EnclaveIdentity;
use crate::error::TransportError;
use crate::protocol::{
    BackupStatus, ExposeStatus, Request, RequestKind, Response, RestoreStatus,
};
use crate::transport::{AuthCredential, AuthStrategy, EnclaveConnection, EnclaveConnector};

/// A request as the service saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub enclave: EnclaveIdentity,
    pub kind: RequestKind,
    /// ciphertext carried by backup and expose requests
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
enum Scripted {
    Fail(TransportError),
    Respond(Response),
}

struct Record {
    access_key: [u8; 32],
    data: Vec<u8>,
    tries: u32,
    exposed: bool,
}

#[derive(Default)]
struct ServiceState {
    records: HashMap<(EnclaveIdentity, String), Record>,
    log: Vec<LoggedRequest>,
    scripted: VecDeque<(RequestKind, Scripted)>,
    connect_failures: VecDeque<TransportError>,
    revoked: HashSet<String>,
    latency: Duration,
}

/// The in-memory enclave service, shared by every connection a [`SoftwareConnector`] opens.
#[derive(Default)]
pub struct SoftwareEnclave {
    state: Mutex<ServiceState>,
    connects: AtomicUsize,
}

impl SoftwareEnclave {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state().log.clone()
    }

    pub fn requests_of(&self, kind: RequestKind) -> Vec<LoggedRequest> {
        self.requests().into_iter().filter(|r| r.kind == kind).collect()
    }

    pub fn clear_requests(&self) {
        self.state().log.clear();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The next `kind` request fails with `err` without being applied.
    pub fn fail_next(&self, kind: RequestKind, err: TransportError) {
        self.state().scripted.push_back((kind, Scripted::Fail(err)));
    }

    /// The next `kind` request gets `response` without being applied.
    pub fn respond_next(&self, kind: RequestKind, response: Response) {
        self.state().scripted.push_back((kind, Scripted::Respond(response)));
    }

    pub fn fail_next_connect(&self, err: TransportError) {
        self.state().connect_failures.push_back(err);
    }

    /// Handshakes presenting this credential fail from now on.
    pub fn revoke(&self, credential: &AuthCredential) {
        self.state().revoked.insert(credential.password.clone());
    }

    /// Every request waits this long before it is answered.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn has_backup(&self, enclave: &EnclaveIdentity, username: &str) -> bool {
        self.state()
            .records
            .contains_key(&(*enclave, username.to_string()))
    }

    /// Remaining guesses for an exposed backup.
    pub fn tries(&self, enclave: &EnclaveIdentity, username: &str) -> Option<u32> {
        self.state()
            .records
            .get(&(*enclave, username.to_string()))
            .map(|r| r.tries)
    }

    async fn handle(
        &self,
        enclave: &EnclaveIdentity,
        username: &str,
        request: Request,
    ) -> Result<Response, TransportError> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        let kind = request.kind();
        let data = match &request {
            Request::Backup { data, .. } | Request::Expose { data } => Some(data.clone()),
            _ => None,
        };
        state.log.push(LoggedRequest {
            enclave: *enclave,
            kind,
            data,
        });

        if let Some(pos) = state.scripted.iter().position(|(k, _)| *k == kind) {
            if let Some((_, scripted)) = state.scripted.remove(pos) {
                return match scripted {
                    Scripted::Fail(err) => Err(err),
                    Scripted::Respond(response) => Ok(response),
                };
            }
        }

        let key = (*enclave, username.to_string());
        let response = match request {
            Request::Backup {
                pin,
                data,
                max_tries,
            } => {
                // a new backup replaces whatever was there, exposed or not
                state.records.insert(
                    key,
                    Record {
                        access_key: pin,
                        data,
                        tries: max_tries,
                        exposed: false,
                    },
                );
                Response::Backup(BackupStatus::Ok)
            }
            Request::Expose { data } => match state.records.get_mut(&key) {
                Some(record) if record.data == data => {
                    record.exposed = true;
                    Response::Expose(ExposeStatus::Ok)
                }
                _ => Response::Expose(ExposeStatus::Error),
            },
            Request::Restore { pin } => {
                let status = match state.records.get_mut(&key) {
                    Some(record) if record.exposed => {
                        if record.access_key == pin {
                            RestoreStatus::Ok {
                                data: record.data.clone(),
                            }
                        } else {
                            record.tries = record.tries.saturating_sub(1);
                            RestoreStatus::PinMismatch {
                                tries: record.tries,
                            }
                        }
                    }
                    _ => RestoreStatus::Missing,
                };
                if matches!(status, RestoreStatus::PinMismatch { tries: 0 }) {
                    state.records.remove(&key);
                }
                Response::Restore(status)
            }
            Request::Delete => {
                state.records.remove(&key);
                Response::Delete
            }
        };
        Ok(response)
    }
}

pub struct SoftwareConnection {
    service: Arc<SoftwareEnclave>,
    enclave: EnclaveIdentity,
    credential: AuthCredential,
    closed: AtomicBool,
}

#[async_trait]
impl EnclaveConnection for SoftwareConnection {
    fn credential(&self) -> &AuthCredential {
        &self.credential
    }

    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.service
            .handle(&self.enclave, &self.credential.username, request)
            .await
    }

    fn close(&self, _error: Option<&TransportError>) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Opens [`SoftwareConnection`]s for one user. Credentials it hands out are valid until
/// revoked on the service.
pub struct SoftwareConnector {
    service: Arc<SoftwareEnclave>,
    username: String,
    issued: AtomicU64,
}

impl SoftwareConnector {
    pub fn new(service: Arc<SoftwareEnclave>, username: impl Into<String>) -> Self {
        Self {
            service,
            username: username.into(),
            issued: AtomicU64::new(0),
        }
    }

    fn mint(&self) -> AuthCredential {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        AuthCredential::new(self.username.clone(), format!("{}-{n}", self.username))
    }
}

#[async_trait]
impl EnclaveConnector for SoftwareConnector {
    async fn connect(
        &self,
        enclave: &EnclaveIdentity,
        credential: Option<&AuthCredential>,
    ) -> Result<Box<dyn EnclaveConnection>, TransportError> {
        self.service.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.service.state();
            if let Some(err) = state.connect_failures.pop_front() {
                return Err(err);
            }
            if let Some(credential) = credential {
                if state.revoked.contains(&credential.password) {
                    return Err(TransportError::Handshake("credential rejected".into()));
                }
            }
        }
        let credential = match credential {
            Some(credential) => credential.clone(),
            None => self.mint(),
        };
        Ok(Box::new(SoftwareConnection {
            service: self.service.clone(),
            enclave: *enclave,
            credential,
            closed: AtomicBool::new(false),
        }))
    }

    async fn fetch_credential(&self) -> Result<AuthCredential, TransportError> {
        Ok(self.mint())
    }
}

/// Account state held in memory.
pub struct SoftwareAccount {
    registered: AtomicBool,
    primary: AtomicBool,
    username: Mutex<Option<String>>,
    pin: Mutex<Option<String>>,
    pin_disabled: AtomicBool,
    attribute_updates: AtomicUsize,
}

impl SoftwareAccount {
    /// A registered primary device.
    pub fn primary(username: impl Into<String>) -> Self {
        Self {
            registered: AtomicBool::new(true),
            primary: AtomicBool::new(true),
            username: Mutex::new(Some(username.into())),
            pin: Mutex::new(None),
            pin_disabled: AtomicBool::new(false),
            attribute_updates: AtomicUsize::new(0),
        }
    }

    /// A device that is not registered yet.
    pub fn unregistered() -> Self {
        let account = Self::primary("");
        account.registered.store(false, Ordering::SeqCst);
        account.primary.store(false, Ordering::SeqCst);
        *lock(&account.username) = None;
        account
    }

    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }

    pub fn set_pin(&self, pin: Option<&str>) {
        *lock(&self.pin) = pin.map(str::to_string);
    }

    pub fn is_pin_disabled(&self) -> bool {
        self.pin_disabled.load(Ordering::SeqCst)
    }

    pub fn attribute_updates(&self) -> usize {
        self.attribute_updates.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AccountState for SoftwareAccount {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn is_registered_primary(&self) -> bool {
        self.is_registered() && self.primary.load(Ordering::SeqCst)
    }

    fn username(&self) -> Option<String> {
        lock(&self.username).clone()
    }

    fn pin_code(&self) -> Option<String> {
        lock(&self.pin).clone()
    }

    fn mark_pin_disabled(&self) {
        self.pin_disabled.store(true, Ordering::SeqCst);
        *lock(&self.pin) = None;
    }

    fn schedule_account_attributes_update(&self) {
        self.attribute_updates.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts storage-sync follow-ups.
#[derive(Default)]
pub struct RecordingStorageSync {
    rotations: AtomicUsize,
    manifests: AtomicUsize,
}

impl RecordingStorageSync {
    pub fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }

    pub fn manifests(&self) -> usize {
        self.manifests.load(Ordering::SeqCst)
    }
}

impl StorageSync for RecordingStorageSync {
    fn master_secret_rotated(&self, _auth: &AuthStrategy) {
        self.rotations.fetch_add(1, Ordering::SeqCst);
    }

    fn restore_or_create_manifest(&self) {
        self.manifests.fetch_add(1, Ordering::SeqCst);
    }
}
