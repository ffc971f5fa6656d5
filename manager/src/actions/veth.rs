//! Action managing the host-side veth endpoint of a VPN daemon.

use crate::listener::Context;
use flotilla_common::{cmd::Cmd, db::Vpn, Error};
use flotilla_types::VethState;
use tracing::{debug, info};

/// Brings the vpn's host-side veth up (and into promiscuous mode) if it
/// is not already. The sole writer of `veth_state` after registration.
pub async fn veth_up(ctx: &Context, vpn: &Vpn) -> Result<(), Error> {
    let lock = vpn.lock().await?;
    let result = bring_veth_up(ctx, vpn).await;
    lock.release().await?;
    result
}

async fn bring_veth_up(_ctx: &Context, vpn: &Vpn) -> Result<(), Error> {
    if vpn.veth_state().await? == VethState::Up {
        debug!("veth on vpn {} already up", vpn.id);
        return Ok(());
    }
    let veth = vpn.veth().await?;
    Cmd::link_up(&veth).run().await?;
    vpn.set_veth_state(VethState::Up).await?;
    info!("activated veth {} on vpn {}", veth, vpn.id);
    Ok(())
}
