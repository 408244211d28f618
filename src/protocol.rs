//! Request/response messages exchanged with an enclave over an established channel.
//!
//! Two-phase backup:
//! 1. `Backup` stores the encrypted secret as pending, with a guess budget
//! 2. `Expose` confirms that exact ciphertext as the restorable one
//!
//! A backup is never restorable until it is exposed, and a new backup replaces any pending one.

#[derive(Clone, PartialEq, Eq)]
pub enum Request {
    Backup {
        /// access key derived from the PIN
        pin: [u8; 32],
        /// encrypted master secret
        data: Vec<u8>,
        max_tries: u32,
    },
    Expose {
        data: Vec<u8>,
    },
    Restore {
        pin: [u8; 32],
    },
    Delete,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Backup { .. } => RequestKind::Backup,
            Self::Expose { .. } => RequestKind::Expose,
            Self::Restore { .. } => RequestKind::Restore,
            Self::Delete => RequestKind::Delete,
        }
    }
}

// access keys and ciphertexts stay out of logs
impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backup { max_tries, data, .. } => f
                .debug_struct("Backup")
                .field("data_len", &data.len())
                .field("max_tries", max_tries)
                .finish_non_exhaustive(),
            Self::Expose { data } => f
                .debug_struct("Expose")
                .field("data_len", &data.len())
                .finish(),
            Self::Restore { .. } => f.debug_struct("Restore").finish_non_exhaustive(),
            Self::Delete => f.write_str("Delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Backup,
    Expose,
    Restore,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Unset,
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposeStatus {
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStatus {
    Unset,
    Ok { data: Vec<u8> },
    Missing,
    PinMismatch { tries: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Backup(BackupStatus),
    Expose(ExposeStatus),
    Restore(RestoreStatus),
    Delete,
}
