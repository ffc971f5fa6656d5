//! Client disconnect: sheds the connection's liveness flag. The cluster
//! manager owns the rest of the cleanup.

use flotilla_common::{db::Db, Error};
use flotilla_types::Address;
use std::net::IpAddr;
use tracing::warn;

pub async fn client_disconnect(db: &Db) -> Result<(), Error> {
    let ip = std::env::var("TRUSTED_IP")?;
    let port = std::env::var("TRUSTED_PORT")?;
    let ip: IpAddr = ip.parse().map_err(|_| Error::InvalidAddress(ip.clone()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAddress(port.clone()))?;
    let connection = db.connection(Address::new(ip, port));

    if !connection.exists().await? {
        warn!("connection {} removed prior to disconnect", connection.id);
        return Ok(());
    }
    // Deleting the flag (rather than writing false) sends the delete-path
    // handler exactly one event.
    connection.delete_alive().await?;
    Ok(())
}
