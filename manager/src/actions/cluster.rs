//! Actions driving a cluster's composition between states.

use crate::actions::vlan::bridge_id;
use crate::listener::Context;
use flotilla_common::{
    cmd::{Cmd, ComposeAction},
    db::{Cluster, Connection, User, Vpn},
    Error,
};
use flotilla_types::{ClusterStatus, LinkState};
use tracing::{info, warn};

/// What `cluster_up` has to do given the recorded status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpAction {
    /// Already up; nothing to do.
    None,

    /// Expiring; cancel the pending teardown and mark it up again.
    Reactivate,

    /// Stopped, down or absent; run the composition up.
    Compose,
}

fn up_action(status: Option<ClusterStatus>) -> UpAction {
    match status {
        Some(ClusterStatus::Up) => UpAction::None,
        Some(ClusterStatus::Expiring) => UpAction::Reactivate,
        Some(ClusterStatus::Stopped) | Some(ClusterStatus::Down) | None => UpAction::Compose,
    }
}

/// True if the recorded status claims a bridge should exist.
fn claims_bridge(status: Option<ClusterStatus>) -> bool {
    matches!(
        status,
        Some(ClusterStatus::Up) | Some(ClusterStatus::Expiring)
    )
}

/// Reconciles the recorded status against the container runtime: a
/// cluster that claims to be up but whose default network is gone is
/// forced down so the next connection rebuilds it. Never runs a
/// subprocess.
pub async fn cluster_check(
    ctx: &Context,
    user: &User,
    vpn: &Vpn,
    cluster: &Cluster,
) -> Result<(), Error> {
    let lock = cluster.lock().await?;
    let result = check_cluster(ctx, user, vpn, cluster).await;
    lock.release().await?;
    result
}

async fn check_cluster(ctx: &Context, user: &User, vpn: &Vpn, cluster: &Cluster) -> Result<(), Error> {
    if !claims_bridge(cluster.status().await?) {
        return Ok(());
    }
    match bridge_id(&ctx.docker, &cluster.id).await {
        Ok(_) => return Ok(()),
        Err(Error::MissingNetwork { .. }) => {}
        Err(err) => return Err(err),
    }
    warn!("cluster {} lost its default network; forcing it down", cluster.id);
    cluster.set_status(ClusterStatus::Down).await?;
    downgrade_bridged_link(user, vpn).await
}

/// Brings the cluster's composition up if it is not already running,
/// reviving an expiring cluster without touching the composition.
pub async fn cluster_up(
    ctx: &Context,
    user: &User,
    vpn: &Vpn,
    cluster: &Cluster,
    connection: &Connection,
) -> Result<(), Error> {
    let lock = cluster.lock().await?;
    let result = bring_cluster_up(ctx, user, vpn, cluster, connection).await;
    lock.release().await?;
    result
}

async fn bring_cluster_up(
    ctx: &Context,
    _user: &User,
    vpn: &Vpn,
    cluster: &Cluster,
    connection: &Connection,
) -> Result<(), Error> {
    match up_action(cluster.status().await?) {
        UpAction::None => {
            info!(
                "new connection {} to existing cluster {}",
                connection.id, cluster.id
            );
            return Ok(());
        }
        UpAction::Reactivate => {
            cluster.reactivate().await?;
            info!(
                "connection {} reactivated expiring cluster {}",
                connection.id, cluster.id
            );
            return Ok(());
        }
        UpAction::Compose => {}
    }

    info!("starting cluster {} on new connection {}", cluster.id, connection.id);
    let files = vpn.chal().await?.files().await?;
    let up = Cmd::compose(
        ComposeAction::Up,
        &cluster.id,
        &files,
        &ctx.config.challenge_folder,
    );
    if let Err(err) = up.run().await {
        // The composition may be stuck half-created; tear it down once
        // and retry. A second failure is fatal to the handler turn.
        warn!("compose up failed for {}; retrying after a down: {}", cluster.id, err);
        Cmd::compose(
            ComposeAction::Down,
            &cluster.id,
            &files,
            &ctx.config.challenge_folder,
        )
        .run()
        .await?;
        up.run().await?;
    }
    cluster.set_up(&vpn.id).await?;
    Ok(())
}

/// Stops the cluster's containers without removing them.
pub async fn cluster_stop(
    ctx: &Context,
    user: &User,
    vpn: &Vpn,
    cluster: &Cluster,
) -> Result<(), Error> {
    let lock = cluster.lock().await?;
    let result = stop_cluster(ctx, user, vpn, cluster).await;
    lock.release().await?;
    result
}

async fn stop_cluster(ctx: &Context, user: &User, vpn: &Vpn, cluster: &Cluster) -> Result<(), Error> {
    if !cluster.exists().await? {
        info!("no action for user {} with no registered cluster", user.id);
        return Ok(());
    }
    if cluster.status().await? == Some(ClusterStatus::Stopped) {
        info!("no action for already stopped cluster {}", cluster.id);
        return Ok(());
    }
    let files = vpn.chal().await?.files().await?;
    Cmd::compose(
        ComposeAction::Stop,
        &cluster.id,
        &files,
        &ctx.config.challenge_folder,
    )
    .run()
    .await?;
    cluster.set_status(ClusterStatus::Stopped).await?;
    info!("stopped cluster {}", cluster.id);
    Ok(())
}

/// Tears the cluster's composition down. The status and link are
/// downgraded before the teardown runs; a failed teardown leaves the
/// records in the safer state.
pub async fn cluster_down(
    ctx: &Context,
    user: &User,
    vpn: &Vpn,
    cluster: &Cluster,
) -> Result<(), Error> {
    let lock = cluster.lock().await?;
    let result = tear_cluster_down(ctx, user, vpn, cluster).await;
    lock.release().await?;
    result
}

async fn tear_cluster_down(ctx: &Context, user: &User, vpn: &Vpn, cluster: &Cluster) -> Result<(), Error> {
    info!("destroying cluster {}", cluster.id);
    cluster.set_status(ClusterStatus::Down).await?;
    downgrade_bridged_link(user, vpn).await?;
    let files = vpn.chal().await?.files().await?;
    Cmd::compose(
        ComposeAction::Down,
        &cluster.id,
        &files,
        &ctx.config.challenge_folder,
    )
    .run()
    .await?;
    Ok(())
}

/// Drops a bridged link record for this user back to up; the bridge it
/// was attached to is going (or gone) with the cluster.
async fn downgrade_bridged_link(user: &User, vpn: &Vpn) -> Result<(), Error> {
    let vlan = user.vlan().await?;
    if vpn.link(vlan).await? != Some(LinkState::Bridged) {
        return Ok(());
    }
    let lock = vpn.lock().await?;
    let result = vpn.set_link(vlan, LinkState::Up).await;
    lock.release().await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_action_by_status() {
        assert_eq!(up_action(Some(ClusterStatus::Up)), UpAction::None);
        assert_eq!(up_action(Some(ClusterStatus::Expiring)), UpAction::Reactivate);
        assert_eq!(up_action(Some(ClusterStatus::Stopped)), UpAction::Compose);
        assert_eq!(up_action(Some(ClusterStatus::Down)), UpAction::Compose);
        // An absent cluster is treated as down.
        assert_eq!(up_action(None), UpAction::Compose);
    }

    #[test]
    fn test_claims_bridge() {
        assert!(claims_bridge(Some(ClusterStatus::Up)));
        assert!(claims_bridge(Some(ClusterStatus::Expiring)));
        assert!(!claims_bridge(Some(ClusterStatus::Stopped)));
        assert!(!claims_bridge(Some(ClusterStatus::Down)));
        assert!(!claims_bridge(None));
    }
}
