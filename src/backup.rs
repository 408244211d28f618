//! Two-phase backup: `Backup` stores the encrypted secret as pending, `Expose` makes it the
//! restorable one.
//!
//! A successful backup response is checkpointed as an [`InProgressBackup`] before anything
//! else happens. From then on only `Expose` is ever sent for that ciphertext, so a crash or a
//! rejected expose never hands the server a second guess budget for the same material.

use tracing::{error, info, instrument, warn};

use crate::channel::ChannelTurn;
use crate::crypt::offload;
use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::kv::{InProgressBackup, LocalData, StoreError};
use crate::pin::{self, PinType};
use crate::protocol::{BackupStatus, ExposeStatus, Request, Response};
use crate::secret::MasterSecret;
use crate::transport::AuthStrategy;

/// Backs `secret` up to the current enclave and exposes it, resuming a matching checkpoint
/// instead of sending a new backup. Returns the secret that ended up backed up, which is the
/// checkpoint's when one was resumed.
#[instrument(skip_all, fields(enclave = %ctx.config.current_enclave))]
pub(crate) async fn backup_and_expose(
    ctx: &EngineContext,
    pin: &str,
    secret: &MasterSecret,
    auth: &AuthStrategy,
) -> Result<MasterSecret> {
    let pin = pin::normalize_pin(pin);
    let enclave = ctx.config.current_enclave;
    let channel = ctx.registry.open(&enclave, auth).await?;
    let mut turn = channel.acquire().await?;

    let resumable = match ctx.store.in_progress_backup()? {
        Some(checkpoint) => {
            if matches_intent(&checkpoint, &pin, ctx).await? {
                Some(checkpoint)
            } else {
                info!("Ignoring in progress backup for another PIN or enclave");
                None
            }
        }
        None => None,
    };
    let checkpoint = match resumable {
        Some(checkpoint) => {
            info!("Resuming in progress backup at expose");
            checkpoint
        }
        None => backup(ctx, &mut turn, &pin, secret).await?,
    };

    expose(ctx, &mut turn, &checkpoint, auth).await
}

async fn matches_intent(
    checkpoint: &InProgressBackup,
    pin: &str,
    ctx: &EngineContext,
) -> Result<bool> {
    let checkpoint = checkpoint.clone();
    let pin = pin.to_string();
    let enclave = ctx.config.current_enclave;
    let matches = offload(move || Ok(checkpoint.matches_intent(&pin, &enclave))).await?;
    ctx.lifecycle.ensure_running()?;
    Ok(matches)
}

/// Sends `Backup` and checkpoints the accepted ciphertext.
async fn backup(
    ctx: &EngineContext,
    turn: &mut ChannelTurn,
    pin: &str,
    secret: &MasterSecret,
) -> Result<InProgressBackup> {
    let material = ctx.derive(pin, turn.enclave(), turn.username()).await?;
    let verification = {
        let pin = pin.to_string();
        offload(move || pin::derive_verification_string(&pin)).await?
    };
    let encrypted = material.encrypt_secret(secret)?;
    ctx.lifecycle.ensure_running()?;

    let response = turn
        .send(Request::Backup {
            pin: *material.access_key(),
            data: encrypted.clone(),
            max_tries: ctx.config.max_pin_attempts,
        })
        .await?;
    match response {
        Response::Backup(BackupStatus::Ok) => {
            let checkpoint = InProgressBackup::new(
                secret,
                encrypted,
                PinType::for_pin(pin),
                verification,
                turn.enclave(),
            );
            ctx.store
                .write(|tx| tx.set_in_progress_backup(&checkpoint))
                .inspect_err(|err| error!(%err, "Failed to persist in progress backup"))?;
            info!("Backup accepted");
            Ok(checkpoint)
        }
        other => {
            error!(?other, "Backup rejected");
            Err(Error::ServerRejected(format!("unexpected backup response {other:?}")))
        }
    }
}

/// Sends `Expose` for `checkpoint` and, on success, makes it the local state unless a newer
/// checkpoint took over in the meantime.
pub(crate) async fn expose(
    ctx: &EngineContext,
    turn: &mut ChannelTurn,
    checkpoint: &InProgressBackup,
    auth: &AuthStrategy,
) -> Result<MasterSecret> {
    ctx.lifecycle.ensure_running()?;
    let secret = checkpoint.master_secret()?;

    if let Some(current) = ctx.store.in_progress_backup()? {
        if current != *checkpoint {
            // the newer backup owns the server now; this one is done
            info!("Expose superseded by a newer backup");
            return Ok(secret);
        }
    }

    let response = turn
        .send(Request::Expose {
            data: checkpoint.encrypted_master_secret().to_vec(),
        })
        .await?;
    match response {
        Response::Expose(ExposeStatus::Ok) => {
            let applied = ctx.store.write(|tx| {
                let persisted = match tx.in_progress_backup() {
                    Err(StoreError::Decode { .. }) => None,
                    other => other?,
                };
                if persisted.as_ref() != Some(checkpoint) {
                    return Ok(None);
                }
                tx.clear_in_progress_backup()?;
                tx.apply_local_data(&LocalData {
                    master_secret: &secret,
                    is_backed_up: true,
                    pin_type: checkpoint.pin_type(),
                    pin_verification: Some(checkpoint.pin_verification()),
                    enclave: Some(checkpoint.enclave()),
                })
                .map(Some)
            })?;
            match applied {
                Some(changed) => {
                    info!("Expose succeeded");
                    if changed {
                        ctx.secret_rotated(auth);
                    }
                }
                None => info!("Backup state changed while expose was in flight, discarding result"),
            }
            Ok(secret)
        }
        Response::Expose(ExposeStatus::Error) => {
            // keep the checkpoint: a retry re-sends expose only
            error!("Expose rejected by server");
            Err(Error::ServerRejected("expose rejected".into()))
        }
        other => {
            warn!(?other, "Unexpected expose response");
            Err(Error::ServerRejected(format!("unexpected expose response {other:?}")))
        }
    }
}
