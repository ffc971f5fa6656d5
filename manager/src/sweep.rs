//! Periodic reconciliation sweep.
//!
//! Keyspace notifications can be dropped on reconnect, so the
//! notification-driven loop is paired with a walk over every known
//! (vpn, user) pair that re-applies the bridge check. Lost events then
//! cost at most one sweep interval, not correctness.

use crate::actions::cluster::cluster_check;
use crate::listener::Context;
use flotilla_common::Error;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub async fn run(ctx: Context, mut stop: watch::Receiver<bool>) {
    if ctx.config.sweep_interval == 0 {
        debug!("reconciliation sweep disabled");
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(ctx.config.sweep_interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = sweep_once(&ctx).await {
                    warn!("reconciliation sweep failed: {}", err);
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
        }
    }
}

/// One pass over every known (vpn, user) pair.
async fn sweep_once(ctx: &Context) -> Result<(), Error> {
    let vpn_ids = ctx.db.vpn_ids().await?;
    let user_ids = ctx.db.user_ids().await?;
    debug!(
        "sweeping {} vpns x {} users for stale clusters",
        vpn_ids.len(),
        user_ids.len()
    );
    for vpn_id in vpn_ids {
        let vpn = ctx.db.vpn(&*vpn_id);
        // One bad vpn or pair must not starve the rest of the sweep.
        let chal = match vpn.chal().await {
            Ok(chal) => chal,
            Err(Error::MissingEntity { .. }) => continue,
            Err(err) => {
                warn!("sweep skipping vpn {}: {}", vpn.id, err);
                continue;
            }
        };
        for user_id in &user_ids {
            let user = ctx.db.user(user_id.clone());
            let cluster = ctx.db.cluster(user_id, &chal.id);
            match cluster.exists().await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!("sweep skipping cluster {}: {}", cluster.id, err);
                    continue;
                }
            }
            if let Err(err) = cluster_check(ctx, &user, &vpn, &cluster).await {
                warn!("sweep check failed for cluster {}: {}", cluster.id, err);
            }
        }
    }
    Ok(())
}
