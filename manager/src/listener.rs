//! Keyspace notification listener.
//!
//! One receive loop owns the pub/sub connection. Each incoming
//! notification fans out to one spawned worker task per matching
//! registration and the loop moves on immediately, so workers run
//! concurrently with the loop and with each other. Delivery is
//! at-least-once; every handler is idempotent.

use bollard::Docker;
use flotilla_common::{db::Db, Config, Error};
use flotilla_types::keyspace_key;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Shared state injected into every handler invocation.
#[derive(Clone)]
pub struct Context {
    pub db: Db,
    pub docker: Docker,
    pub config: Arc<Config>,
}

/// One keyspace notification, as seen by a handler.
#[derive(Debug, Clone)]
pub struct Event {
    /// Full pub/sub channel the notification arrived on.
    pub channel: String,

    /// The key that changed, with the keyspace prefix stripped.
    pub key: String,

    /// The operation that changed it (`set`, `del`, `expired`, ...).
    pub event: String,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
pub type Handler = Arc<dyn Fn(Context, Event) -> HandlerFuture + Send + Sync>;

/// A `(pattern, event filter, handler)` table entry.
struct Registration {
    name: &'static str,
    pattern: String,
    events: Vec<String>,
    handler: Handler,
}

impl Registration {
    /// True if a notification that matched `pattern` with operation
    /// `event` should start this registration's handler.
    fn matches(&self, pattern: &str, event: &str) -> bool {
        self.pattern == pattern && (self.events.is_empty() || self.events.iter().any(|e| e == event))
    }
}

/// Cooperative stop signal for the listener and its satellites.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct Listener {
    db: Db,
    registrations: Vec<Registration>,
    stop_tx: Arc<watch::Sender<bool>>,
    tracker: TaskTracker,
}

impl Listener {
    pub fn new(db: Db) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Listener {
            db,
            registrations: Vec::new(),
            stop_tx: Arc::new(stop_tx),
            tracker: TaskTracker::new(),
        }
    }

    /// Registers a handler for a channel pattern, filtered to the given
    /// operations. An empty `events` slice accepts every operation.
    pub fn register(
        &mut self,
        pattern: String,
        events: &[&str],
        name: &'static str,
        handler: Handler,
    ) {
        self.registrations.push(Registration {
            name,
            pattern,
            events: events.iter().map(|e| e.to_string()).collect(),
            handler,
        });
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// A receiver that flips to `true` when the listener is stopped.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Runs the receive loop until stopped or the subscription dies.
    pub async fn run(&self, ctx: Context) -> Result<(), Error> {
        let mut pubsub = self.db.pubsub().await?;
        for registration in &self.registrations {
            pubsub.psubscribe(&registration.pattern).await?;
            info!(
                "listener subscribed to {} for {}",
                registration.pattern, registration.name
            );
        }

        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Ok(());
        }
        {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    msg = stream.next() => match msg {
                        Some(msg) => self.dispatch(&ctx, &msg),
                        None => {
                            warn!("notification subscription closed by the server");
                            break;
                        }
                    },
                }
            }
        }

        for registration in &self.registrations {
            // The connection may already be gone; unsubscription is
            // best-effort on the way out.
            if let Err(err) = pubsub.punsubscribe(&registration.pattern).await {
                debug!("punsubscribe from {} failed: {}", registration.pattern, err);
            }
        }
        info!("listener unsubscribed and finished");
        Ok(())
    }

    /// Waits up to `grace` for in-flight workers to finish.
    pub async fn drain(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("workers still in flight after {:?}; abandoning them", grace);
        }
    }

    fn dispatch(&self, ctx: &Context, msg: &redis::Msg) {
        let pattern: String = match msg.get_pattern() {
            Ok(pattern) => pattern,
            Err(err) => {
                error!("discarding message without a pattern: {}", err);
                return;
            }
        };
        let channel = msg.get_channel_name().to_owned();
        let event: String = match msg.get_payload() {
            Ok(event) => event,
            Err(err) => {
                error!("discarding message on {} with no payload: {}", channel, err);
                return;
            }
        };
        let key = match keyspace_key(&channel) {
            Some(key) => key.to_owned(),
            None => {
                debug!("ignoring non-keyspace channel {}", channel);
                return;
            }
        };
        debug!("received event '{}' on {}", event, channel);

        for registration in &self.registrations {
            if !registration.matches(&pattern, &event) {
                continue;
            }
            let name = registration.name;
            let handler = registration.handler.clone();
            let ctx = ctx.clone();
            let ev = Event {
                channel: channel.clone(),
                key: key.clone(),
                event: event.clone(),
            };
            self.tracker.spawn(async move {
                debug!("{} dispatched for '{}' on {}", name, ev.event, ev.channel);
                match handler(ctx, ev.clone()).await {
                    Ok(()) => {}
                    // A vanished entity means another worker already
                    // cleaned up behind this event.
                    Err(Error::MissingEntity { key }) => {
                        info!("{} on {}: {} is gone, nothing to do", name, ev.channel, key);
                    }
                    Err(err) => {
                        error!(
                            "{} failed for '{}' on {}: {}",
                            name, ev.event, ev.channel, err
                        );
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Handler {
        Arc::new(|_, _| -> HandlerFuture { Box::pin(async { Ok(()) }) })
    }

    fn registration(pattern: &str, events: &[&str]) -> Registration {
        Registration {
            name: "test",
            pattern: pattern.to_owned(),
            events: events.iter().map(|e| e.to_string()).collect(),
            handler: noop_handler(),
        }
    }

    #[test]
    fn test_event_filter() {
        let set_only = registration("__keyspace@0__:Connection:*:alive", &["set"]);
        assert!(set_only.matches("__keyspace@0__:Connection:*:alive", "set"));
        assert!(!set_only.matches("__keyspace@0__:Connection:*:alive", "del"));
        assert!(!set_only.matches("__keyspace@0__:Vpn:*:veth", "set"));

        let deleted = registration("__keyspace@0__:Connection:*:alive", &["del", "expired"]);
        assert!(deleted.matches("__keyspace@0__:Connection:*:alive", "del"));
        assert!(deleted.matches("__keyspace@0__:Connection:*:alive", "expired"));
        assert!(!deleted.matches("__keyspace@0__:Connection:*:alive", "set"));
    }

    #[test]
    fn test_empty_filter_accepts_all() {
        let any = registration("__keyspace@0__:Vpn:*:veth", &[]);
        assert!(any.matches("__keyspace@0__:Vpn:*:veth", "set"));
        assert!(any.matches("__keyspace@0__:Vpn:*:veth", "del"));
    }
}
