//! Typed gateway over the shared database.
//!
//! Every entity field is its own key (see [`flotilla_types::keys`]) so each
//! write lands as one keyspace notification. Multi-field reads are
//! therefore non-atomic, but all consumers are idempotent. Multi-field
//! writes go through MULTI/EXEC pipelines with the notification-bearing
//! field written last, so observers never see a half-written entity.

use crate::Error;
use flotilla_types::{
    challenge_key, cluster_id, cluster_key, connection_key, field_key, user_key, vpn_key, Address,
    ClusterStatus, LinkState, VethState, USERS_KEY, VLANS_KEY, VPNS_KEY,
};
use rand::Rng;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Lease on a vpn's advisory lock.
pub const VPN_LOCK_LEASE: Duration = Duration::from_secs(30);

/// Lease on a cluster's advisory lock.
pub const CLUSTER_LOCK_LEASE: Duration = Duration::from_secs(60);

/// Poll interval while waiting on a contended lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Inclusive bounds of the vlan id range handed out to users.
pub const VLAN_MIN: u16 = 10;
pub const VLAN_MAX: u16 = 4000;

/// Attempts at drawing a free vlan id before giving up.
pub const VLAN_ATTEMPTS: u32 = 10_000;

/// Release script: delete the lock key only while we still own it, so a
/// lease that already expired (and may have been re-acquired) is left alone.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Handle to the shared database. Cheap to clone; constructed once in
/// `main` and passed into every component.
#[derive(Clone)]
pub struct Db {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl Db {
    pub async fn connect(info: redis::ConnectionInfo) -> Result<Self, Error> {
        let client = redis::Client::open(info)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Db { client, conn })
    }

    /// A dedicated pub/sub connection for the event listener.
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub, Error> {
        Ok(self.client.get_async_pubsub().await?)
    }

    /// Turns on keyspace notifications for the key classes the control
    /// loop subscribes to. Managed servers may refuse CONFIG; callers may
    /// treat that as non-fatal if the server is configured out of band.
    pub async fn enable_keyspace_events(&self) -> Result<(), Error> {
        // K: keyspace channel; g/$/s/h: generic, string, set, hash
        // commands; x: expired events
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Kg$shx")
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.conn().get(key).await?)
    }

    async fn required(&self, key: &str) -> Result<String, Error> {
        self.get(key)
            .await?
            .ok_or_else(|| Error::MissingEntity {
                key: key.to_owned(),
            })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.conn().set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), Error> {
        self.conn().del::<_, ()>(keys).await?;
        Ok(())
    }

    pub fn challenge(&self, name: impl Into<String>) -> Challenge {
        Challenge {
            db: self.clone(),
            id: name.into(),
        }
    }

    pub fn vpn(&self, id: impl Into<String>) -> Vpn {
        Vpn {
            db: self.clone(),
            id: id.into(),
        }
    }

    pub fn user(&self, id: impl Into<String>) -> User {
        User {
            db: self.clone(),
            id: id.into(),
        }
    }

    pub fn connection(&self, addr: Address) -> Connection {
        Connection {
            db: self.clone(),
            id: addr.to_string(),
            addr,
        }
    }

    pub fn cluster(&self, user_id: &str, chal_id: &str) -> Cluster {
        Cluster {
            db: self.clone(),
            id: cluster_id(user_id, chal_id),
        }
    }

    /// Cluster handle from a serialized reference (`Cluster:{id}`) or a
    /// bare cluster id.
    pub fn cluster_by_id(&self, id: impl Into<String>) -> Cluster {
        Cluster {
            db: self.clone(),
            id: id.into(),
        }
    }

    // Global sets and hashes.

    pub async fn add_vpn(&self, id: &str) -> Result<(), Error> {
        self.conn().sadd::<_, _, ()>(VPNS_KEY, id).await?;
        Ok(())
    }

    pub async fn vpn_registered(&self, id: &str) -> Result<bool, Error> {
        Ok(self.conn().sismember(VPNS_KEY, id).await?)
    }

    pub async fn vpn_ids(&self) -> Result<Vec<String>, Error> {
        Ok(self.conn().smembers(VPNS_KEY).await?)
    }

    pub async fn set_user_for_cn(&self, cn: &str, user_id: &str) -> Result<(), Error> {
        self.conn().hset::<_, _, _, ()>(USERS_KEY, cn, user_id).await?;
        Ok(())
    }

    pub async fn user_for_cn(&self, cn: &str) -> Result<Option<User>, Error> {
        let id: Option<String> = self.conn().hget(USERS_KEY, cn).await?;
        Ok(id.map(|id| self.user(id)))
    }

    pub async fn user_ids(&self) -> Result<Vec<String>, Error> {
        Ok(self.conn().hvals(USERS_KEY).await?)
    }

    /// Draws a random vlan id in [`VLAN_MIN`]..=[`VLAN_MAX`] until one is
    /// new to the global `vlans` set. SADD is the collision gate, so two
    /// concurrent allocations can never return the same id.
    pub async fn allocate_vlan(&self) -> Result<u16, Error> {
        let mut conn = self.conn();
        for _ in 0..VLAN_ATTEMPTS {
            let candidate = random_vlan();
            let added: i64 = conn.sadd(VLANS_KEY, candidate).await?;
            if added == 1 {
                return Ok(candidate);
            }
        }
        Err(Error::VlanExhausted {
            attempts: VLAN_ATTEMPTS,
        })
    }

    /// Acquires an advisory lock, polling until the lease duration has
    /// passed, at which point acquisition fails. The lock key carries the
    /// same lease as its TTL so a crashed holder cannot wedge the system.
    pub async fn lock(&self, key: String, lease: Duration) -> Result<LockGuard, Error> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn();
        let deadline = Instant::now() + lease;
        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(lease.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
                return Ok(LockGuard { conn, key, token });
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout { key });
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }
}

fn random_vlan() -> u16 {
    rand::thread_rng().gen_range(VLAN_MIN..=VLAN_MAX)
}

/// Held advisory lock. Release is explicit; a guard that is dropped
/// without release simply lets the lease run out.
pub struct LockGuard {
    conn: MultiplexedConnection,
    key: String,
    token: String,
}

impl LockGuard {
    /// Compare-and-delete release: only frees the key if this guard still
    /// owns it.
    pub async fn release(mut self) -> Result<(), Error> {
        let _: () = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(())
    }
}

fn parse_state<T: FromStr>(key: &str, value: String) -> Result<T, Error> {
    value.parse().map_err(|_| Error::InvalidState {
        key: key.to_owned(),
        value,
    })
}

/// Strips a `{Class}:` prefix from a serialized reference, tolerating
/// bare ids written by older tooling.
fn ref_id(value: String, class: &str) -> String {
    if let Some(id) = value.strip_prefix(class).and_then(|v| v.strip_prefix(':')) {
        return id.to_owned();
    }
    value
}

/// A named CTF scenario and its composition files.
pub struct Challenge {
    db: Db,
    pub id: String,
}

impl Challenge {
    fn files_key(&self) -> String {
        field_key(&challenge_key(&self.id), "files")
    }

    pub async fn exists(&self) -> Result<bool, Error> {
        Ok(self.db.conn().exists(self.files_key()).await?)
    }

    pub async fn files(&self) -> Result<Vec<String>, Error> {
        Ok(self.db.conn().lrange(self.files_key(), 0, -1).await?)
    }

    /// Fills the composition file list if it has not been filled yet.
    pub async fn fill_files(&self, files: &[String]) -> Result<(), Error> {
        if files.is_empty() || self.exists().await? {
            return Ok(());
        }
        self.db.conn().rpush::<_, _, ()>(self.files_key(), files).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), Error> {
        self.db.del(&[self.files_key()]).await
    }
}

/// One running VPN daemon instance. Created by the registration hook and
/// never deleted by the control loop.
pub struct Vpn {
    db: Db,
    pub id: String,
}

impl Vpn {
    fn key(&self, field: &str) -> String {
        field_key(&vpn_key(&self.id), field)
    }

    pub async fn exists(&self) -> Result<bool, Error> {
        Ok(self.db.conn().exists(self.key("veth")).await?)
    }

    /// Name of the host-side veth endpoint.
    pub async fn veth(&self) -> Result<String, Error> {
        self.db.required(&self.key("veth")).await
    }

    /// Administrative state of the veth; an unset field reads as down.
    pub async fn veth_state(&self) -> Result<VethState, Error> {
        match self.db.get(&self.key("veth_state")).await? {
            Some(value) => parse_state(&self.key("veth_state"), value),
            None => Ok(VethState::Down),
        }
    }

    pub async fn set_veth_state(&self, state: VethState) -> Result<(), Error> {
        self.db.set(&self.key("veth_state"), state.as_str()).await
    }

    /// The challenge this daemon fronts.
    pub async fn chal(&self) -> Result<Challenge, Error> {
        let value = self.db.required(&self.key("chal")).await?;
        Ok(self.db.challenge(ref_id(value, "Challenge")))
    }

    pub async fn link(&self, vlan: u16) -> Result<Option<LinkState>, Error> {
        let value: Option<String> = self.db.conn().hget(self.key("links"), vlan).await?;
        match value {
            Some(value) => Ok(Some(parse_state(&self.key("links"), value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_link(&self, vlan: u16, state: LinkState) -> Result<(), Error> {
        self.db
            .conn()
            .hset::<_, _, _, ()>(self.key("links"), vlan, state.as_str())
            .await?;
        Ok(())
    }

    /// Registers this daemon: challenge reference and veth state land
    /// first, the veth name last so its notification observes a complete
    /// entity. Safe to repeat.
    pub async fn register(&self, veth: &str, chal_id: &str) -> Result<(), Error> {
        let _: () = redis::pipe()
            .atomic()
            .set(self.key("chal"), challenge_key(chal_id))
            .ignore()
            .set(self.key("veth_state"), VethState::Down.as_str())
            .ignore()
            .set(self.key("veth"), veth)
            .ignore()
            .query_async(&mut self.db.conn())
            .await?;
        Ok(())
    }

    pub async fn lock(&self) -> Result<LockGuard, Error> {
        self.db.lock(self.key("lock"), VPN_LOCK_LEASE).await
    }

    pub async fn delete(&self) -> Result<(), Error> {
        self.db
            .del(&[
                self.key("veth"),
                self.key("veth_state"),
                self.key("chal"),
                self.key("links"),
                self.key("lock"),
            ])
            .await
    }
}

/// An authenticated certificate holder, identified by the lower-cased
/// common name, owning one vlan for the lifetime of the deployment.
pub struct User {
    db: Db,
    pub id: String,
}

impl User {
    fn key(&self, field: &str) -> String {
        field_key(&user_key(&self.id), field)
    }

    pub async fn exists(&self) -> Result<bool, Error> {
        Ok(self.db.conn().exists(self.key("vlan")).await?)
    }

    pub async fn vlan(&self) -> Result<u16, Error> {
        let value = self.db.required(&self.key("vlan")).await?;
        value.parse().map_err(|_| Error::InvalidState {
            key: self.key("vlan"),
            value,
        })
    }

    /// Common name exactly as issued in the certificate.
    pub async fn cn(&self) -> Result<String, Error> {
        self.db.required(&self.key("cn")).await
    }

    pub async fn create(&self, vlan: u16, cn: &str) -> Result<(), Error> {
        let _: () = redis::pipe()
            .atomic()
            .set(self.key("cn"), cn)
            .ignore()
            .set(self.key("vlan"), vlan.to_string())
            .ignore()
            .query_async(&mut self.db.conn())
            .await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), Error> {
        self.db.del(&[self.key("vlan"), self.key("cn")]).await
    }
}

/// One live (ip, port) client session.
pub struct Connection {
    db: Db,
    pub id: String,
    pub addr: Address,
}

impl Connection {
    fn key(&self, field: &str) -> String {
        field_key(&connection_key(&self.addr), field)
    }

    pub async fn exists(&self) -> Result<bool, Error> {
        Ok(self.db.conn().exists(self.key("addr")).await?)
    }

    /// The liveness flag whose notifications drive the control loop.
    /// `None` once the field has been deleted.
    pub async fn alive(&self) -> Result<Option<bool>, Error> {
        match self.db.get(&self.key("alive")).await? {
            Some(value) => match value.as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(Error::InvalidState {
                    key: self.key("alive"),
                    value,
                }),
            },
            None => Ok(None),
        }
    }

    pub async fn set_alive(&self, alive: bool) -> Result<(), Error> {
        self.db
            .set(&self.key("alive"), if alive { "true" } else { "false" })
            .await
    }

    /// Deletes only the liveness flag, leaving the rest of the entity for
    /// the delete-path handler.
    pub async fn delete_alive(&self) -> Result<(), Error> {
        self.db.del(&[self.key("alive")]).await
    }

    pub async fn user(&self) -> Result<User, Error> {
        let value = self.db.required(&self.key("user")).await?;
        Ok(self.db.user(ref_id(value, "User")))
    }

    pub async fn vpn(&self) -> Result<Vpn, Error> {
        let value = self.db.required(&self.key("vpn")).await?;
        Ok(self.db.vpn(ref_id(value, "Vpn")))
    }

    pub async fn cluster(&self) -> Result<Cluster, Error> {
        let value = self.db.required(&self.key("cluster")).await?;
        Ok(self.db.cluster_by_id(ref_id(value, "Cluster")))
    }

    /// Writes the whole entity; the liveness flag goes last so its
    /// notification observes complete references.
    pub async fn create(&self, user_id: &str, vpn_id: &str, cluster: &str) -> Result<(), Error> {
        let _: () = redis::pipe()
            .atomic()
            .set(self.key("addr"), self.addr.to_string())
            .ignore()
            .set(self.key("user"), user_key(user_id))
            .ignore()
            .set(self.key("vpn"), vpn_key(vpn_id))
            .ignore()
            .set(self.key("cluster"), cluster_key(cluster))
            .ignore()
            .set(self.key("alive"), "true")
            .ignore()
            .query_async(&mut self.db.conn())
            .await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), Error> {
        self.db
            .del(&[
                self.key("alive"),
                self.key("addr"),
                self.key("user"),
                self.key("vpn"),
                self.key("cluster"),
            ])
            .await
    }
}

/// The per-user, per-challenge instantiation of a challenge's
/// compositions.
pub struct Cluster {
    db: Db,
    pub id: String,
}

impl Cluster {
    fn key(&self, field: &str) -> String {
        field_key(&cluster_key(&self.id), field)
    }

    /// A cluster exists once it has a recorded status; everything else is
    /// treated as down.
    pub async fn exists(&self) -> Result<bool, Error> {
        Ok(self.db.conn().exists(self.key("status")).await?)
    }

    pub async fn status(&self) -> Result<Option<ClusterStatus>, Error> {
        match self.db.get(&self.key("status")).await? {
            Some(value) => Ok(Some(parse_state(&self.key("status"), value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_status(&self, status: ClusterStatus) -> Result<(), Error> {
        self.db.set(&self.key("status"), status.as_str()).await
    }

    /// Applies a TTL to the status key; its expiry notification is what
    /// eventually tears the cluster down.
    pub async fn expire_status(&self, seconds: u64) -> Result<(), Error> {
        self.db
            .conn()
            .expire::<_, ()>(self.key("status"), seconds as i64)
            .await?;
        Ok(())
    }

    /// Marks the cluster up again and drops any pending expiry in one
    /// round trip.
    pub async fn reactivate(&self) -> Result<(), Error> {
        let _: () = redis::pipe()
            .atomic()
            .set(self.key("status"), ClusterStatus::Up.as_str())
            .ignore()
            .persist(self.key("status"))
            .ignore()
            .query_async(&mut self.db.conn())
            .await?;
        Ok(())
    }

    /// Records the cluster as up through the given vpn, atomically.
    pub async fn set_up(&self, vpn_id: &str) -> Result<(), Error> {
        let _: () = redis::pipe()
            .atomic()
            .set(self.key("vpn"), vpn_key(vpn_id))
            .ignore()
            .set(self.key("status"), ClusterStatus::Up.as_str())
            .ignore()
            .query_async(&mut self.db.conn())
            .await?;
        Ok(())
    }

    /// The vpn this cluster was most recently activated through.
    pub async fn vpn_id(&self) -> Result<String, Error> {
        let value = self.db.required(&self.key("vpn")).await?;
        Ok(ref_id(value, "Vpn"))
    }

    pub async fn add_connection(&self, connection_id: &str) -> Result<(), Error> {
        self.db
            .conn()
            .sadd::<_, _, ()>(self.key("connections"), connection_id)
            .await?;
        Ok(())
    }

    pub async fn remove_connection(&self, connection_id: &str) -> Result<(), Error> {
        self.db
            .conn()
            .srem::<_, _, ()>(self.key("connections"), connection_id)
            .await?;
        Ok(())
    }

    pub async fn connection_count(&self) -> Result<usize, Error> {
        Ok(self.db.conn().scard(self.key("connections")).await?)
    }

    pub async fn lock(&self) -> Result<LockGuard, Error> {
        self.db.lock(self.key("lock"), CLUSTER_LOCK_LEASE).await
    }

    pub async fn delete(&self) -> Result<(), Error> {
        self.db
            .del(&[
                self.key("status"),
                self.key("connections"),
                self.key("vpn"),
                self.key("lock"),
            ])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_vlan_in_range() {
        for _ in 0..10_000 {
            let vlan = random_vlan();
            assert!((VLAN_MIN..=VLAN_MAX).contains(&vlan));
        }
    }

    #[test]
    fn test_ref_id() {
        assert_eq!(ref_id("User:alice".to_owned(), "User"), "alice");
        assert_eq!(
            ref_id("Cluster:alice@listen".to_owned(), "Cluster"),
            "alice@listen"
        );
        // Bare ids pass through untouched.
        assert_eq!(ref_id("alice".to_owned(), "User"), "alice");
        // Prefixes of other classes are not stripped.
        assert_eq!(ref_id("Userland:x".to_owned(), "User"), "Userland:x");
    }

    #[test]
    fn test_parse_state() {
        let status: ClusterStatus = parse_state("Cluster:a@b:status", "expiring".to_owned()).unwrap();
        assert_eq!(status, ClusterStatus::Expiring);
        let err = parse_state::<ClusterStatus>("Cluster:a@b:status", "limbo".to_owned());
        assert!(matches!(err, Err(Error::InvalidState { .. })));
    }
}
