//! Actions managing per-user VLAN sub-interfaces and their attachment to
//! a cluster's default bridge.

use crate::listener::Context;
use bollard::network::ListNetworksOptions;
use bollard::Docker;
use flotilla_common::{
    cmd::{vlan_ifname, BridgeAction, Cmd, ErrorMatch, VlanAction},
    db::{Cluster, User, Vpn},
    Error,
};
use flotilla_types::{ClusterStatus, LinkState};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Ensures the VLAN sub-interface for this user exists on the vpn's veth
/// and is up, recovering from a link the kernel already carries.
pub async fn vlan_link_up(ctx: &Context, vpn: &Vpn, user: &User) -> Result<(), Error> {
    let lock = vpn.lock().await?;
    let result = bring_up_link(ctx, vpn, user).await;
    lock.release().await?;
    result
}

async fn bring_up_link(_ctx: &Context, vpn: &Vpn, user: &User) -> Result<(), Error> {
    let vlan = user.vlan().await?;
    if matches!(
        vpn.link(vlan).await?,
        Some(LinkState::Up) | Some(LinkState::Bridged)
    ) {
        debug!("vlan link {} on vpn {} already up", vlan, vpn.id);
        return Ok(());
    }

    let veth = vpn.veth().await?;
    match Cmd::vlan(VlanAction::Add, &veth, vlan).run().await {
        Ok(()) => info!("new vlan link on vpn {} for vlan {}", vpn.id, vlan),
        // ip exits 2 when the link already exists in the kernel.
        Err(err) if ErrorMatch::code(2).matches(&err) => {
            if Cmd::vlan(VlanAction::Show, &veth, vlan).run().await.is_err() {
                return Err(err);
            }
            warn!("unrecorded existing link {}:{}", vpn.id, vlan);
        }
        Err(err) => return Err(err),
    }

    vpn.set_link(vlan, LinkState::Up).await?;
    Ok(())
}

/// Attaches the user's VLAN sub-interface to the cluster's default
/// bridge. Takes the cluster lock before the vpn lock; every path that
/// needs both honors that order.
pub async fn vlan_link_bridge(
    ctx: &Context,
    vpn: &Vpn,
    user: &User,
    cluster: &Cluster,
) -> Result<(), Error> {
    let cluster_lock = cluster.lock().await?;
    let vpn_lock = vpn.lock().await?;
    let result = bridge_link(ctx, vpn, user, cluster).await;
    vpn_lock.release().await?;
    cluster_lock.release().await?;
    result
}

async fn bridge_link(ctx: &Context, vpn: &Vpn, user: &User, cluster: &Cluster) -> Result<(), Error> {
    let vlan = user.vlan().await?;
    if vpn.link(vlan).await? == Some(LinkState::Bridged) {
        debug!("vlan link {} already bridged for cluster {}", vlan, cluster.id);
        return Ok(());
    }
    if cluster.status().await? != Some(ClusterStatus::Up) {
        return Err(Error::StateError(format!(
            "cluster {} must be up to bridge vlan {}",
            cluster.id, vlan
        )));
    }
    if vpn.link(vlan).await? != Some(LinkState::Up) {
        return Err(Error::StateError(format!(
            "link {}:{} must be up to bridge it",
            vpn.id, vlan
        )));
    }

    let bridge = bridge_id(&ctx.docker, &cluster.id).await?;
    let vlan_if = vlan_ifname(&vpn.veth().await?, vlan);
    Cmd::bridge(BridgeAction::AddIf, &bridge, &vlan_if).run().await?;
    vpn.set_link(vlan, LinkState::Bridged).await?;
    info!("added {} to bridge {} for cluster {}", vlan_if, bridge, cluster.id);
    Ok(())
}

/// Composition project name for a cluster: the id stripped to
/// alphanumerics, matching what the composition tool does to it.
pub fn project_name(cluster_id: &str) -> String {
    cluster_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Bridge device name backing a network.
pub fn bridge_name(network_id: &str) -> String {
    format!("br-{}", network_id.chars().take(12).collect::<String>())
}

/// Resolves the bridge backing the cluster's default network. Pure
/// lookup over the container runtime; fails with
/// [`Error::MissingNetwork`] when the network does not exist so callers
/// can react.
pub async fn bridge_id(docker: &Docker, cluster_id: &str) -> Result<String, Error> {
    let project = project_name(cluster_id);
    let network = format!("{}_default", project);
    let mut filters = HashMap::new();
    filters.insert("name".to_owned(), vec![network.clone()]);
    let networks = docker
        .list_networks(Some(ListNetworksOptions { filters }))
        .await?;
    // The name filter is a substring match; insist on the exact network.
    let found = networks
        .into_iter()
        .find(|n| n.name.as_deref() == Some(network.as_str()))
        .ok_or(Error::MissingNetwork {
            project: project.clone(),
        })?;
    let id = found.id.ok_or(Error::MissingNetwork { project })?;
    Ok(bridge_name(&id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_name_strips_separators() {
        assert_eq!(project_name("alice@listen"), "alicelisten");
        assert_eq!(project_name("bob@example.com@mitm"), "bobexamplecommitm");
        assert_eq!(project_name("plain"), "plain");
    }

    #[test]
    fn test_bridge_name_truncates_network_id() {
        assert_eq!(
            bridge_name("0123456789abcdef0123456789abcdef"),
            "br-0123456789ab"
        );
        assert_eq!(bridge_name("abc"), "br-abc");
    }
}
