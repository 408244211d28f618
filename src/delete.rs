//! Deleting backups, migrating to the current enclave, and cleaning up retired ones.

use tracing::{debug, info, instrument, warn};

use crate::backup::backup_and_expose;
use crate::enclave::EnclaveIdentity;
use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::protocol::{Request, Response};
use crate::transport::AuthStrategy;

/// Deletes whatever this user has stored in `enclave`.
#[instrument(skip_all, fields(enclave = %enclave))]
pub(crate) async fn delete_from(
    ctx: &EngineContext,
    enclave: &EnclaveIdentity,
    auth: &AuthStrategy,
) -> Result<()> {
    let channel = ctx.registry.open(enclave, auth).await?;
    let mut turn = channel.acquire().await?;
    ctx.lifecycle.ensure_running()?;
    match turn.send(Request::Delete).await? {
        Response::Delete => {
            info!("Deleted backup");
            Ok(())
        }
        other => Err(Error::ServerRejected(format!(
            "unexpected delete response {other:?}"
        ))),
    }
}

/// Re-backs the local secret up to the current enclave when the last backup went to an
/// older one, and queues the older one for deletion.
pub(crate) async fn migrate_if_needed(ctx: &EngineContext) -> Result<()> {
    if !ctx.config.is_main_app {
        return Ok(());
    }
    if !ctx.account.is_registered_primary() {
        debug!("Not migrating; not a registered primary");
        return Ok(());
    }
    let (secret, backed_up, stored_enclave) = ctx
        .store
        .read(|tx| Ok((tx.master_secret()?, tx.is_backed_up()?, tx.enclave()?)))?;
    let (Some(secret), Some(pin)) = (secret, ctx.account.pin_code()) else {
        info!("Not migrating; local state not ready");
        return Ok(());
    };
    if !backed_up {
        info!("Not migrating; never backed up");
        return Ok(());
    }
    let Some(old) = stored_enclave.filter(|hex| *hex != ctx.config.current_enclave.to_hex()) else {
        return Ok(());
    };

    info!(old = %old, "Migrating backup to current enclave");
    backup_and_expose(ctx, &pin, &secret, &AuthStrategy::Implicit).await?;
    info!("Migrated backup to current enclave");

    // an enclave that is no longer configured cannot be reached for deletion anyway
    if let Some(old) = ctx.config.retired_enclaves().find(|e| e.to_hex() == old) {
        let known = ctx.retired_enclaves();
        ctx.store.write(|tx| tx.add_pending_deletion(old, &known))?;
        info!(enclave = %old, "Queued old enclave for deletion");
    }
    Ok(())
}

/// Issues one delete per enclave pending deletion, newest first. Failures stay queued for
/// the next warm-up.
pub(crate) async fn drain_pending_deletions(ctx: &EngineContext, auth: &AuthStrategy) {
    if !ctx.account.is_registered() {
        return;
    }
    let known = ctx.retired_enclaves();
    let pending = match ctx.store.pending_deletions(&known) {
        Ok(pending) => pending,
        Err(err) => {
            warn!(%err, "Failed to read enclaves pending deletion");
            return;
        }
    };
    for enclave in pending {
        if ctx.lifecycle.is_terminated() {
            return;
        }
        match delete_from(ctx, &enclave, auth).await {
            Ok(()) => {
                if let Err(err) = ctx.store.write(|tx| tx.mark_deleted(&enclave, &known)) {
                    warn!(%enclave, %err, "Failed to record deletion");
                }
            }
            Err(err) => warn!(%enclave, %err, "Failed to delete from old enclave, will retry later"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::engine::tests::Harness;
    use crate::protocol::RequestKind;

    #[tokio::test]
    async fn test_delete_from_enclave() {
        let harness = Harness::new();
        let ctx = harness.engine.context();
        let enclave = ctx.config.current_enclave;
        harness.seed_backup(&enclave, "1234").await;

        delete_from(ctx, &enclave, &AuthStrategy::Implicit).await.unwrap();
        assert!(!harness.service.has_backup(&enclave, "alice"));
    }

    #[tokio::test]
    async fn test_drain_keeps_failures_queued() {
        let harness = Harness::with_previous(2);
        let ctx = harness.engine.context();
        let known = ctx.retired_enclaves();
        ctx.store
            .write(|tx| {
                tx.add_pending_deletion(&known[1], &known)?;
                tx.add_pending_deletion(&known[0], &known)
            })
            .unwrap();

        harness
            .service
            .fail_next(RequestKind::Delete, TransportError::Network("reset".into()));
        drain_pending_deletions(ctx, &AuthStrategy::Implicit).await;

        // newest first; the failed one stays
        let deletes = harness.service.requests_of(RequestKind::Delete);
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[0].enclave, known[0]);
        assert_eq!(deletes[1].enclave, known[1]);
        assert_eq!(ctx.store.pending_deletions(&known).unwrap(), vec![known[0]]);

        drain_pending_deletions(ctx, &AuthStrategy::Implicit).await;
        assert!(ctx.store.pending_deletions(&known).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migration_requires_backed_up_primary_with_pin() {
        let harness = Harness::with_previous(1);
        let ctx = harness.engine.context();
        let old = ctx.config.previous_enclaves[0];
        harness.seed_local_state(&old, false);
        harness.account.set_pin(Some("1234"));

        migrate_if_needed(ctx).await.unwrap();
        assert!(harness.service.requests().is_empty());

        harness.seed_local_state(&old, true);
        harness.account.set_pin(None);
        migrate_if_needed(ctx).await.unwrap();
        assert!(harness.service.requests().is_empty());

        harness.account.set_pin(Some("1234"));
        harness.account.set_primary(false);
        migrate_if_needed(ctx).await.unwrap();
        assert!(harness.service.requests().is_empty());
    }

    #[tokio::test]
    async fn test_migration_is_a_noop_on_current_enclave() {
        let harness = Harness::with_previous(1);
        let ctx = harness.engine.context();
        harness.seed_local_state(&ctx.config.current_enclave, true);
        harness.account.set_pin(Some("1234"));

        migrate_if_needed(ctx).await.unwrap();
        assert!(harness.service.requests().is_empty());
    }
}
