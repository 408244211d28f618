//! PIN-based recovery across enclave generations.
//!
//! Candidates are tried newest first. Only "no backup here" moves on to the next one; every
//! other answer is final, so a wrong PIN never costs a guess on an older enclave.

use tracing::{error, info, instrument, warn};

use crate::crypt::offload;
use crate::enclave::EnclaveIdentity;
use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::kv::LocalData;
use crate::pin::{self, PinType};
use crate::protocol::{Request, Response, RestoreStatus};
use crate::secret::MasterSecret;
use crate::transport::AuthStrategy;

#[derive(Debug)]
pub enum RestoreOutcome {
    Success {
        secret: MasterSecret,
        /// the enclave that held the backup
        enclave: EnclaveIdentity,
    },
    BackupMissing,
    InvalidPin {
        remaining_attempts: u32,
    },
    /// The enclave returned a backup this PIN could not decrypt.
    DecryptionError,
    NetworkError(Error),
    GenericError(Error),
}

impl RestoreOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub(crate) fn from_error(err: Error) -> Self {
        if err.is_network_failure_or_timeout() {
            Self::NetworkError(err)
        } else {
            Self::GenericError(err)
        }
    }
}

enum Attempt {
    Missing,
    Done(RestoreOutcome),
}

pub(crate) async fn restore(ctx: &EngineContext, pin: &str, auth: &AuthStrategy) -> RestoreOutcome {
    let pin = pin::normalize_pin(pin);
    for enclave in ctx.config.restore_candidates() {
        match restore_from(ctx, &pin, &enclave, auth).await {
            Ok(Attempt::Missing) => info!(%enclave, "No backup, trying older enclave"),
            Ok(Attempt::Done(outcome)) => return outcome,
            Err(err) => {
                warn!(%enclave, %err, "Restore failed");
                return RestoreOutcome::from_error(err);
            }
        }
    }
    info!("No backup in any enclave");
    RestoreOutcome::BackupMissing
}

#[instrument(skip_all, fields(enclave = %enclave))]
async fn restore_from(
    ctx: &EngineContext,
    pin: &str,
    enclave: &EnclaveIdentity,
    auth: &AuthStrategy,
) -> Result<Attempt> {
    let channel = ctx.registry.open(enclave, auth).await?;
    let mut turn = channel.acquire().await?;
    let material = match ctx.derive(pin, enclave, turn.username()).await {
        Ok(material) => material,
        Err(Error::LocalCrypto(err)) => {
            error!(%err, "Failed to derive PIN material");
            return Ok(Attempt::Done(RestoreOutcome::DecryptionError));
        }
        Err(err) => return Err(err),
    };
    ctx.lifecycle.ensure_running()?;

    let response = turn
        .send(Request::Restore {
            pin: *material.access_key(),
        })
        .await?;
    let data = match response {
        Response::Restore(RestoreStatus::Ok { data }) => data,
        Response::Restore(RestoreStatus::Missing) => return Ok(Attempt::Missing),
        Response::Restore(RestoreStatus::PinMismatch { tries }) => {
            info!(tries, "PIN mismatch");
            return Ok(Attempt::Done(RestoreOutcome::InvalidPin {
                remaining_attempts: tries,
            }));
        }
        other => {
            error!(?other, "Unexpected restore response");
            return Err(Error::ServerRejected(format!(
                "unexpected restore response {other:?}"
            )));
        }
    };

    let secret = match material.decrypt_secret(&data) {
        Ok(secret) => secret,
        Err(err) => {
            error!(%err, "Failed to decrypt restored secret");
            return Ok(Attempt::Done(RestoreOutcome::DecryptionError));
        }
    };
    let verification = {
        let pin = pin.to_string();
        offload(move || pin::derive_verification_string(&pin)).await?
    };

    let enclave_hex = enclave.to_hex();
    let changed = ctx.store.write(|tx| {
        // a restored secret supersedes any unfinished backup
        tx.clear_in_progress_backup()?;
        tx.apply_local_data(&LocalData {
            master_secret: &secret,
            is_backed_up: true,
            pin_type: PinType::for_pin(pin),
            pin_verification: Some(verification.as_str()),
            enclave: Some(enclave_hex.as_str()),
        })
    })?;
    if changed {
        ctx.secret_rotated(auth);
    }
    info!("Restored secret");
    Ok(Attempt::Done(RestoreOutcome::Success {
        secret,
        enclave: *enclave,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::Harness;
    use crate::error::TransportError;
    use crate::protocol::RequestKind;

    #[tokio::test]
    async fn test_falls_back_to_older_enclave_on_missing() {
        let harness = Harness::with_previous(2);
        let ctx = harness.engine.context();
        let old = ctx.config.previous_enclaves[0];
        let secret = harness.seed_backup(&old, "1234").await;

        let outcome = restore(ctx, "1234", &AuthStrategy::Implicit).await;
        match outcome {
            RestoreOutcome::Success { secret: restored, enclave } => {
                assert_eq!(restored, secret);
                assert_eq!(enclave, old);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let requests = harness.service.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].enclave, ctx.config.current_enclave);
        assert_eq!(requests[1].enclave, old);
        assert!(requests.iter().all(|r| r.kind == RequestKind::Restore));
        assert_eq!(ctx.store.enclave().unwrap(), Some(old.to_hex()));
        assert!(ctx.store.is_backed_up().unwrap());
    }

    #[tokio::test]
    async fn test_pin_mismatch_does_not_fall_through() {
        let harness = Harness::with_previous(1);
        let ctx = harness.engine.context();
        let old = ctx.config.previous_enclaves[0];
        harness.seed_backup(&old, "1234").await;
        harness.seed_backup(&ctx.config.current_enclave, "1234").await;

        let outcome = restore(ctx, "0000", &AuthStrategy::Implicit).await;
        assert!(matches!(
            outcome,
            RestoreOutcome::InvalidPin {
                remaining_attempts: 9
            }
        ));
        let requests = harness.service.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].enclave, ctx.config.current_enclave);
        assert!(ctx.store.master_secret().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_everywhere() {
        let harness = Harness::with_previous(2);
        let ctx = harness.engine.context();

        let outcome = restore(ctx, "1234", &AuthStrategy::Implicit).await;
        assert!(matches!(outcome, RestoreOutcome::BackupMissing));
        assert_eq!(harness.service.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_transport_failure_is_final() {
        let harness = Harness::with_previous(1);
        let ctx = harness.engine.context();

        harness
            .service
            .fail_next(RequestKind::Restore, TransportError::Timeout);
        let outcome = restore(ctx, "1234", &AuthStrategy::Implicit).await;
        assert!(matches!(outcome, RestoreOutcome::NetworkError(_)));
        assert_eq!(harness.service.requests().len(), 1);

        harness.service.respond_next(
            RequestKind::Restore,
            Response::Restore(RestoreStatus::Unset),
        );
        let outcome = restore(ctx, "1234", &AuthStrategy::Implicit).await;
        assert!(matches!(
            outcome,
            RestoreOutcome::GenericError(Error::ServerRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_derivation_is_decryption_error_without_fallback() {
        let harness = Harness::with_failing_hasher(1);
        let ctx = harness.engine.context();
        let old = ctx.config.previous_enclaves[0];
        harness.seed_backup(&old, "1234").await;
        let connects = harness.service.connects();

        let outcome = restore(ctx, "1234", &AuthStrategy::Implicit).await;
        assert!(matches!(outcome, RestoreOutcome::DecryptionError));
        assert!(harness.service.requests().is_empty());
        // only the current enclave was reached
        assert_eq!(harness.service.connects(), connects + 1);
        assert!(ctx.store.master_secret().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecryptable_backup_is_decryption_error() {
        let harness = Harness::with_previous(1);
        let ctx = harness.engine.context();

        harness.service.respond_next(
            RequestKind::Restore,
            Response::Restore(RestoreStatus::Ok {
                data: vec![0u8; 60],
            }),
        );
        let outcome = restore(ctx, "1234", &AuthStrategy::Implicit).await;
        assert!(matches!(outcome, RestoreOutcome::DecryptionError));
        assert_eq!(harness.service.requests().len(), 1);
        assert!(ctx.store.master_secret().unwrap().is_none());
    }
}
