//! Subcommand implementations
//!
//! Each command takes the registry behind its seam and an output writer, so
//! it runs the same against etcd or an in-memory store.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, bail};
use lodestar_client::{Discovery, Instance, LeaseState, Registry};
use tokio::sync::watch;
use tracing::{info, warn};

/// Register `instance` and hold the registration until `shutdown` resolves.
///
/// Fails if the registration is lost for good while holding it. On shutdown
/// the instance is deregistered within `deregister_timeout`.
pub async fn register(
    registry: &Registry,
    instance: &Instance,
    shutdown: impl Future<Output = ()>,
    deregister_timeout: Duration,
) -> anyhow::Result<()> {
    // subscribed first so no transition after the register call goes unseen
    let state = registry.subscribe();
    registry
        .register(instance)
        .await
        .with_context(|| format!("failed to register {}", instance))?;
    info!(instance = %instance, "Holding registration, press Ctrl-C to deregister");

    hold(state, shutdown, instance).await?;

    tokio::time::timeout(deregister_timeout, registry.deregister(instance))
        .await
        .context("timed out deregistering")?
        .with_context(|| format!("failed to deregister {}", instance))?;
    info!(instance = %instance, "Deregistered");
    Ok(())
}

/// Follow lease state until `shutdown` resolves; fails once the lease is `Closed`.
async fn hold(
    mut state: watch::Receiver<LeaseState>,
    shutdown: impl Future<Output = ()>,
    instance: &Instance,
) -> anyhow::Result<()> {
    tokio::pin!(shutdown);
    loop {
        let current = *state.borrow_and_update();
        info!(state = ?current, "Lease state");
        if current == LeaseState::Closed {
            bail!("registration of {} was lost and could not be restored", instance);
        }
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Print the instances of `name`, one JSON object per line.
pub async fn resolve(
    discovery: &dyn Discovery,
    name: &str,
    out: &mut impl Write,
) -> anyhow::Result<usize> {
    let instances = discovery
        .get_service(name)
        .await
        .with_context(|| format!("failed to resolve {}", name))?;
    for instance in &instances {
        writeln!(out, "{}", serde_json::to_string(instance)?)?;
    }
    Ok(instances.len())
}

/// Print every snapshot of `name` as a JSON array line until `shutdown` resolves.
pub async fn watch(
    discovery: &dyn Discovery,
    name: &str,
    shutdown: impl Future<Output = ()>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let mut watcher = discovery
        .watch(name)
        .await
        .with_context(|| format!("failed to watch {}", name))?;

    tokio::pin!(shutdown);
    loop {
        let snapshot = tokio::select! {
            _ = &mut shutdown => break,
            snapshot = watcher.next() => snapshot,
        };
        match snapshot {
            Ok(instances) => {
                writeln!(out, "{}", serde_json::to_string(&instances)?)?;
                out.flush()?;
            }
            Err(e) => {
                warn!(service = name, error = %e, "Watch ended");
                return Err(e).with_context(|| format!("watch of {} ended", name));
            }
        }
    }

    watcher.stop()?;
    Ok(())
}
