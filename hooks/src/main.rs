//! VPN lifecycle hooks.
//!
//! Invoked by the VPN daemon on tunnel registration, client connect and
//! client disconnect. Each subcommand makes a small set of writes to the
//! shared database; the cluster manager reacts to the resulting keyspace
//! notifications. Nothing here touches the network stack or the
//! container runtime.

use clap::{Parser, Subcommand};
use flotilla_common::{db::Db, init_logging, Config};
use std::path::PathBuf;

mod connect;
mod disconnect;
mod register;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register this VPN daemon, its veth endpoint and its challenge.
    RegisterVpn,

    /// Record an authenticated client connection and write its
    /// client-config fragment to the given file.
    ClientConnect {
        /// Path of the client-config file the VPN daemon will apply.
        ccname: PathBuf,
    },

    /// Record a client disconnect.
    ClientDisconnect,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    init_logging(&config).expect("failed to initialize logging");

    let db = Db::connect(config.connection_info())
        .await
        .expect("failed to connect to the database");

    match args.command {
        Command::RegisterVpn => register::register_vpn(&db).await,
        Command::ClientConnect { ccname } => connect::client_connect(&db, &ccname).await,
        Command::ClientDisconnect => disconnect::client_disconnect(&db).await,
    }
    .expect("hook failed");
}
