//! Client connect: records the user, connection and cluster membership,
//! and hands the daemon the per-client vlan assignment.

use crate::register::{self, VpnEnv};
use flotilla_common::{
    db::{Db, User},
    Error,
};
use flotilla_types::Address;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

/// Environment the VPN daemon provides to the connect hook.
pub struct ConnectEnv {
    /// Daemon instance id; the container hostname.
    pub vpn_id: String,

    /// Common name from the client certificate.
    pub cn: String,

    pub addr: Address,
}

impl ConnectEnv {
    pub fn from_env() -> Result<Self, Error> {
        let ip = std::env::var("TRUSTED_IP")?;
        let port = std::env::var("TRUSTED_PORT")?;
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| Error::InvalidAddress(ip.clone()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("{}.{}", ip, port)))?;
        Ok(ConnectEnv {
            vpn_id: std::env::var("HOSTNAME")?,
            cn: std::env::var("COMMON_NAME")?,
            addr: Address::new(ip, port),
        })
    }
}

/// User ids are the stable lower-cased common name.
pub(crate) fn user_id_from_cn(cn: &str) -> String {
    cn.to_lowercase()
}

/// The client-config fragment the daemon applies to this session.
pub(crate) fn client_config(vlan: u16) -> String {
    format!("vlan-pvid {}\n", vlan)
}

pub async fn client_connect(db: &Db, ccname: &Path) -> Result<(), Error> {
    let env = ConnectEnv::from_env()?;

    // First connection through a fresh daemon registers it on the fly.
    if !db.vpn_registered(&env.vpn_id).await? {
        register::register(db, &VpnEnv::from_env()?).await?;
    }
    let vpn = db.vpn(&*env.vpn_id);
    let chal = vpn.chal().await?;

    let user = match db.user_for_cn(&env.cn).await? {
        Some(user) => user,
        None => create_user(db, &env.cn).await?,
    };
    let vlan = user.vlan().await?;

    let cluster = db.cluster(&user.id, &chal.id);
    let connection = db.connection(env.addr);
    // Membership lands before the liveness flag so the handler the flag
    // wakes already sees this connection in the set.
    cluster.add_connection(&connection.id).await?;
    connection.create(&user.id, &vpn.id, &cluster.id).await?;
    info!("new connection from {}@{} on vlan {}", env.cn, env.addr, vlan);

    std::fs::write(ccname, client_config(vlan))?;
    Ok(())
}

async fn create_user(db: &Db, cn: &str) -> Result<User, Error> {
    let vlan = db.allocate_vlan().await?;
    let user = db.user(user_id_from_cn(cn));
    user.create(vlan, cn).await?;
    db.set_user_for_cn(cn, &user.id).await?;
    info!("welcome to new user {} on vlan {}", cn, vlan);
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_from_cn() {
        assert_eq!(user_id_from_cn("Alice"), "alice");
        assert_eq!(user_id_from_cn("Bob@Example.COM"), "bob@example.com");
        assert_eq!(user_id_from_cn("carol"), "carol");
    }

    #[test]
    fn test_client_config() {
        assert_eq!(client_config(1234), "vlan-pvid 1234\n");
    }
}
