use bollard::Docker;
use flotilla_common::{db::Db, init_logging, Config};
use flotilla_manager::listener::{Context, Listener};
use flotilla_manager::{handlers, sweep};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// How long shutdown waits for in-flight workers before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = init_logging(&config) {
        eprintln!("failed to initialize logging: {}", err);
        std::process::exit(1);
    }

    info!(
        "connecting to database at {}:{}/{}",
        config.redis_hostname, config.redis_port, config.redis_db
    );
    let db = Db::connect(config.connection_info())
        .await
        .expect("failed to connect to the database");
    if let Err(err) = db.enable_keyspace_events().await {
        // Managed servers may refuse CONFIG; notifications must then be
        // enabled in the server configuration instead.
        tracing::warn!("could not enable keyspace notifications: {}", err);
    }

    let docker = Docker::connect_with_local_defaults().expect("failed to create the docker client");

    let mut listener = Listener::new(db.clone());
    handlers::register_all(&mut listener, config.redis_db);

    let ctx = Context {
        db,
        docker,
        config: Arc::new(config),
    };

    // Graceful stop on SIGTERM/SIGINT: the listener stops taking events
    // and in-flight workers get a bounded grace period.
    let stop = listener.stop_handle();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        info!("shutting down...");
        stop.stop();
    });

    let sweeper = tokio::spawn(sweep::run(ctx.clone(), listener.subscribe_stop()));

    listener.run(ctx).await.expect("listener failed");

    listener.drain(SHUTDOWN_GRACE).await;
    let _ = sweeper.await;
}
