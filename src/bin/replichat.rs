/*
 * replichat is the replichat server. It takes configuration via a
 * configuration file, command-line parameters, and environment variables,
 * then starts up a TCP server that communicates with chat clients (port
 * 9605) and Raft peers (port 9705).
 */

#![warn(clippy::all)]

use replichat::errinput;
use replichat::error::Result;
use replichat::raft;
use replichat::storage;
use replichat::Server;

use serde_derive::Deserialize;
use std::collections::BTreeMap;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("Starts a replichat server.")
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/replichat.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("replichat");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let path = std::path::Path::new(&cfg.data_dir);
    let store: Box<dyn storage::Store> = match cfg.storage.as_str() {
        "file" | "" => Box::new(storage::File::new(path, cfg.sync)?),
        "memory" => Box::new(storage::Memory::new()),
        name => return errinput!("invalid storage engine {name}"),
    };
    let log = raft::Log::new(store)?;

    let members = raft::Membership::new(cfg.cluster_members.into_iter().collect());
    let opts = raft::Options {
        heartbeat_interval: cfg.heartbeat_interval,
        election_timeout_range: cfg.election_timeout_min..cfg.election_timeout_max,
        max_append_entries: cfg.max_append_entries,
        snapshot_threshold: cfg.snapshot_threshold,
    };

    Server::new(cfg.id, members, log, opts)?.serve(&cfg.listen_peer, &cfg.listen_client)
}

#[derive(Debug, Deserialize)]
struct Config {
    id: raft::NodeID,
    cluster_members: BTreeMap<raft::NodeID, String>,
    listen_client: String,
    listen_peer: String,
    log_level: String,
    data_dir: String,
    storage: String,
    sync: bool,
    heartbeat_interval: raft::Ticks,
    election_timeout_min: raft::Ticks,
    election_timeout_max: raft::Ticks,
    snapshot_threshold: raft::Index,
    max_append_entries: usize,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", 1_i64)?
            .set_default("listen_client", "0.0.0.0:9605")?
            .set_default("listen_peer", "0.0.0.0:9705")?
            .set_default("log_level", "info")?
            .set_default("data_dir", "data")?
            .set_default("storage", "file")?
            .set_default("sync", true)?
            .set_default("heartbeat_interval", raft::HEARTBEAT_INTERVAL as i64)?
            .set_default("election_timeout_min", raft::ELECTION_TIMEOUT_RANGE.start as i64)?
            .set_default("election_timeout_max", raft::ELECTION_TIMEOUT_RANGE.end as i64)?
            .set_default("snapshot_threshold", raft::SNAPSHOT_THRESHOLD as i64)?
            .set_default("max_append_entries", raft::MAX_APPEND_ENTRIES as i64)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("REPLICHAT"))
            .build()?
            .try_deserialize()?)
    }
}
