//! Seams to the rest of the application: registration state and storage-service sync.

use crate::transport::AuthStrategy;

pub trait AccountState: Send + Sync {
    fn is_registered(&self) -> bool;

    fn is_registered_primary(&self) -> bool;

    /// Username of the current account; keys the credential cache.
    fn username(&self) -> Option<String>;

    /// PIN remembered by the two-factor settings, if any.
    fn pin_code(&self) -> Option<String>;

    fn mark_pin_disabled(&self);

    /// Registration lock and recovery password depend on the escrow state.
    fn schedule_account_attributes_update(&self);
}

pub trait StorageSync: Send + Sync {
    /// The master secret changed on a primary; rotate the storage manifest and resync
    /// linked devices.
    fn master_secret_rotated(&self, auth: &AuthStrategy);

    /// A linked device received a new master secret from its primary.
    fn restore_or_create_manifest(&self);
}

/// A [`StorageSync`] that does nothing, for installs without storage service.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStorageSync;

impl StorageSync for NoStorageSync {
    fn master_secret_rotated(&self, _auth: &AuthStrategy) {}

    fn restore_or_create_manifest(&self) {}
}
