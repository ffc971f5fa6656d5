//! Key construction and channel parsing for the shared database.
//!
//! Every entity field lives under its own colon-delimited key
//! (`Vpn:{id}:veth`, `Connection:{addr}:alive`, ...) so keyspace
//! notifications fire per field. The parsers here are the inverse used by
//! the event handlers to recover entity ids from notification channels.

use crate::Address;

/// Subscription pattern matching the liveness flag of every connection.
pub const CONNECTION_ALIVE_PATTERN: &str = "Connection:*:alive";

/// Subscription pattern matching the status field of every cluster.
pub const CLUSTER_STATUS_PATTERN: &str = "Cluster:*:status";

/// Subscription pattern matching the veth name of every vpn.
pub const VPN_VETH_PATTERN: &str = "Vpn:*:veth";

/// Name of the global set of registered vpn ids.
pub const VPNS_KEY: &str = "vpns";

/// Name of the global hash mapping certificate common names to user ids.
pub const USERS_KEY: &str = "users";

/// Name of the global set of allocated vlan ids.
pub const VLANS_KEY: &str = "vlans";

/// Returns the pub/sub channel pattern for keyspace notifications on keys
/// matching `pattern` in the given logical database.
pub fn keyspace_pattern(db: i64, pattern: &str) -> String {
    format!("__keyspace@{}__:{}", db, pattern)
}

/// Strips the `__keyspace@{db}__:` prefix from a notification channel,
/// leaving the key that changed. Returns `None` for non-keyspace channels.
pub fn keyspace_key(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("__keyspace@")?
        .split_once("__:")
        .map(|(_, key)| key)
}

pub fn challenge_key(name: &str) -> String {
    format!("Challenge:{}", name)
}

pub fn vpn_key(id: &str) -> String {
    format!("Vpn:{}", id)
}

pub fn user_key(id: &str) -> String {
    format!("User:{}", id)
}

pub fn connection_key(addr: &Address) -> String {
    format!("Connection:{}", addr)
}

/// Cluster ids join the owning user and challenge as `{user_id}@{chal_id}`.
pub fn cluster_id(user_id: &str, chal_id: &str) -> String {
    format!("{}@{}", user_id, chal_id)
}

pub fn cluster_key(id: &str) -> String {
    format!("Cluster:{}", id)
}

/// Returns the key of one field of an entity.
pub fn field_key(entity_key: &str, field: &str) -> String {
    format!("{}:{}", entity_key, field)
}

/// Parses the connection address out of a `Connection:{addr}:alive` key.
pub fn parse_connection_alive(key: &str) -> Option<Address> {
    key.strip_prefix("Connection:")?
        .strip_suffix(":alive")?
        .parse()
        .ok()
}

/// Parses `(user_id, chal_id)` out of a `Cluster:{user}@{chal}:status` key.
/// The split is on the last `@` so user ids may carry one themselves.
pub fn parse_cluster_status(key: &str) -> Option<(String, String)> {
    let id = key.strip_prefix("Cluster:")?.strip_suffix(":status")?;
    let (user, chal) = id.rsplit_once('@')?;
    if user.is_empty() || chal.is_empty() {
        return None;
    }
    Some((user.to_owned(), chal.to_owned()))
}

/// Parses the vpn id out of a `Vpn:{id}:veth` key.
pub fn parse_vpn_veth(key: &str) -> Option<String> {
    Some(
        key.strip_prefix("Vpn:")?
            .strip_suffix(":veth")?
            .to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_pattern() {
        assert_eq!(
            keyspace_pattern(0, CONNECTION_ALIVE_PATTERN),
            "__keyspace@0__:Connection:*:alive"
        );
        assert_eq!(
            keyspace_pattern(3, VPN_VETH_PATTERN),
            "__keyspace@3__:Vpn:*:veth"
        );
    }

    #[test]
    fn test_keyspace_key() {
        assert_eq!(
            keyspace_key("__keyspace@0__:Connection:10.0.0.2.5001:alive"),
            Some("Connection:10.0.0.2.5001:alive")
        );
        assert_eq!(keyspace_key("__keyevent@0__:set"), None);
        assert_eq!(keyspace_key("some:other:channel"), None);
    }

    #[test]
    fn test_parse_connection_alive() {
        let addr = parse_connection_alive("Connection:10.0.0.2.5001:alive").unwrap();
        assert_eq!(addr.to_string(), "10.0.0.2.5001");
        assert!(parse_connection_alive("Connection:10.0.0.2.5001:user").is_none());
        assert!(parse_connection_alive("Vpn:abc:veth").is_none());
    }

    #[test]
    fn test_parse_cluster_status() {
        let (user, chal) = parse_cluster_status("Cluster:alice@listen:status").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(chal, "listen");

        // User ids derived from email-style common names keep their own '@'.
        let (user, chal) = parse_cluster_status("Cluster:bob@example.com@mitm:status").unwrap();
        assert_eq!(user, "bob@example.com");
        assert_eq!(chal, "mitm");

        assert!(parse_cluster_status("Cluster:noatsign:status").is_none());
        assert!(parse_cluster_status("Cluster:alice@listen:vpn").is_none());
    }

    #[test]
    fn test_parse_vpn_veth() {
        assert_eq!(parse_vpn_veth("Vpn:vpn_listen_1:veth").unwrap(), "vpn_listen_1");
        assert!(parse_vpn_veth("Vpn:vpn_listen_1:veth_state").is_none());
    }

    #[test]
    fn test_entity_keys() {
        let addr: Address = "10.0.0.2.5001".parse().unwrap();
        assert_eq!(connection_key(&addr), "Connection:10.0.0.2.5001");
        assert_eq!(cluster_key(&cluster_id("alice", "listen")), "Cluster:alice@listen");
        assert_eq!(field_key(&vpn_key("v1"), "veth_state"), "Vpn:v1:veth_state");
    }
}
