//! Tunnel registration: announces this daemon and its veth to the
//! cluster manager.

use flotilla_common::{db::Db, Error};
use tracing::info;

/// Environment the VPN daemon provides to the registration hook.
pub struct VpnEnv {
    /// Daemon instance id; the container hostname.
    pub id: String,

    /// Host-side veth endpoint name.
    pub veth: String,

    /// Challenge this daemon fronts.
    pub chal: String,

    /// Composition files of the challenge, comma-separated in the
    /// environment.
    pub files: Vec<String>,
}

impl VpnEnv {
    pub fn from_env() -> Result<Self, Error> {
        Ok(VpnEnv {
            id: std::env::var("HOSTNAME")?,
            veth: std::env::var("FLOTILLA_VETH")?,
            chal: std::env::var("FLOTILLA_CHAL")?,
            files: split_files(&std::env::var("FLOTILLA_FILES")?),
        })
    }
}

pub(crate) fn split_files(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_owned)
        .collect()
}

pub async fn register_vpn(db: &Db) -> Result<(), Error> {
    let env = VpnEnv::from_env()?;
    register(db, &env).await
}

/// Idempotently records the daemon: challenge files, membership in the
/// global vpn set, then the vpn entity itself. The veth key is written
/// last inside the entity write, so the veth-set notification observes a
/// complete vpn.
pub(crate) async fn register(db: &Db, env: &VpnEnv) -> Result<(), Error> {
    db.challenge(&*env.chal).fill_files(&env.files).await?;
    db.add_vpn(&env.id).await?;
    db.vpn(&*env.id).register(&env.veth, &env.chal).await?;
    info!("registered vpn {} with veth {} for challenge {}", env.id, env.veth, env.chal);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_files() {
        assert_eq!(
            split_files("listen/docker-compose.yml"),
            ["listen/docker-compose.yml"]
        );
        assert_eq!(
            split_files("a/compose.yml, b/compose.yml"),
            ["a/compose.yml", "b/compose.yml"]
        );
        assert_eq!(split_files(""), Vec::<String>::new());
        assert_eq!(split_files("a.yml,,b.yml"), ["a.yml", "b.yml"]);
    }
}
