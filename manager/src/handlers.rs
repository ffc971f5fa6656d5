//! Event handlers wiring keyspace notifications to the actions, plus the
//! registration table the control plane installs at startup.

use crate::actions::{cluster, veth, vlan};
use crate::listener::{Context, Event, Handler, HandlerFuture, Listener};
use flotilla_common::Error;
use flotilla_types::{
    keyspace_pattern, parse_cluster_status, parse_connection_alive, parse_vpn_veth, Address,
    ClusterStatus, CLUSTER_STATUS_PATTERN, CONNECTION_ALIVE_PATTERN, VPN_VETH_PATTERN,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |ctx, ev| -> HandlerFuture { Box::pin(f(ctx, ev)) })
}

/// Installs the full handler table on the listener.
pub fn register_all(listener: &mut Listener, db: i64) {
    listener.register(
        keyspace_pattern(db, CONNECTION_ALIVE_PATTERN),
        &["set"],
        "connection-set",
        handler(connection_set),
    );
    listener.register(
        keyspace_pattern(db, CONNECTION_ALIVE_PATTERN),
        &["del", "expired"],
        "connection-deleted",
        handler(connection_deleted),
    );
    listener.register(
        keyspace_pattern(db, CLUSTER_STATUS_PATTERN),
        &["expired"],
        "cluster-expired",
        handler(cluster_expired),
    );
    listener.register(
        keyspace_pattern(db, VPN_VETH_PATTERN),
        &["set"],
        "veth-set",
        handler(veth_set),
    );
}

fn connection_addr(ev: &Event) -> Result<Address, Error> {
    parse_connection_alive(&ev.key).ok_or_else(|| Error::InvalidKey(ev.key.clone()))
}

/// A connection's liveness flag was written. A live connection drives
/// the full bring-up sequence; a dead one only sheds its flag so the
/// delete-path handler runs on its own event.
async fn connection_set(ctx: Context, ev: Event) -> Result<(), Error> {
    let connection = ctx.db.connection(connection_addr(&ev)?);
    let alive = match connection.alive().await? {
        Some(alive) => alive,
        None => {
            info!("connection {} vanished before its handler ran", connection.id);
            return Ok(());
        }
    };

    if !alive {
        connection.delete_alive().await?;
        return Ok(());
    }

    let user = connection.user().await?;
    let vpn = connection.vpn().await?;
    let cluster = connection.cluster().await?;
    if cluster.connection_count().await? == 0 {
        warn!(
            "connection {} is alive but cluster {} has no registered connections",
            connection.id, cluster.id
        );
    }

    veth::veth_up(&ctx, &vpn).await?;
    cluster::cluster_check(&ctx, &user, &vpn, &cluster).await?;
    cluster::cluster_up(&ctx, &user, &vpn, &cluster, &connection).await?;
    vlan::vlan_link_up(&ctx, &vpn, &user).await?;
    vlan::vlan_link_bridge(&ctx, &vpn, &user, &cluster).await?;
    Ok(())
}

/// A connection's liveness flag was deleted (or expired): detach it from
/// its cluster, start the expiry clock when it was the last one, and
/// drop the entity.
async fn connection_deleted(ctx: Context, ev: Event) -> Result<(), Error> {
    let connection = ctx.db.connection(connection_addr(&ev)?);

    match connection.cluster().await {
        Ok(cluster) => {
            cluster.remove_connection(&connection.id).await?;
            if cluster.connection_count().await? == 0 {
                cluster.set_status(ClusterStatus::Expiring).await?;
                cluster.expire_status(ctx.config.cluster_timeout).await?;
                info!(
                    "last connection left cluster {}; expiring in {}s",
                    cluster.id, ctx.config.cluster_timeout
                );
            } else {
                info!(
                    "removed connection {}; cluster {} remains active",
                    connection.id, cluster.id
                );
            }
        }
        // Another worker already cleaned the entity up.
        Err(Error::MissingEntity { .. }) => {
            info!("connection {} already detached from its cluster", connection.id);
        }
        Err(err) => return Err(err),
    }

    connection.delete().await?;
    Ok(())
}

/// A cluster's status key expired: tear the composition down and drop
/// the entity.
async fn cluster_expired(ctx: Context, ev: Event) -> Result<(), Error> {
    let (user_id, chal_id) =
        parse_cluster_status(&ev.key).ok_or_else(|| Error::InvalidKey(ev.key.clone()))?;
    let cluster = ctx.db.cluster(&user_id, &chal_id);
    let user = ctx.db.user(user_id);
    let vpn = ctx.db.vpn(cluster.vpn_id().await?);

    cluster::cluster_down(&ctx, &user, &vpn, &cluster).await?;
    cluster.delete().await?;
    Ok(())
}

/// A vpn registered (or re-registered) its veth: make sure the host side
/// is up.
async fn veth_set(ctx: Context, ev: Event) -> Result<(), Error> {
    let vpn_id = parse_vpn_veth(&ev.key).ok_or_else(|| Error::InvalidKey(ev.key.clone()))?;
    let vpn = ctx.db.vpn(vpn_id);
    veth::veth_up(&ctx, &vpn).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str, event: &str) -> Event {
        Event {
            channel: format!("__keyspace@0__:{}", key),
            key: key.to_owned(),
            event: event.to_owned(),
        }
    }

    #[test]
    fn test_connection_addr() {
        let ev = event("Connection:10.0.0.2.5001:alive", "set");
        let addr = connection_addr(&ev).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.2.5001");

        let bad = event("Connection:garbage:alive", "set");
        assert!(matches!(connection_addr(&bad), Err(Error::InvalidKey(_))));
    }
}
