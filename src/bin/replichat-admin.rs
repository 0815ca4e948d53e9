/*
 * replichat-admin administers a running replichat cluster: it can ask the
 * cluster to add a new server (which joins as a non-voting learner and is
 * promoted automatically once caught up), and display cluster status.
 */

#![warn(clippy::all)]

use replichat::error::Result;
use replichat::Client;

fn main() -> Result<()> {
    let args = clap::command!()
        .name("replichat-admin")
        .about("Administers a replichat cluster.")
        .arg(
            clap::Arg::new("addr")
                .short('a')
                .long("addr")
                .help("Server address to connect to")
                .default_value("localhost:9605"),
        )
        .subcommand_required(true)
        .subcommand(
            clap::Command::new("join")
                .about("Adds a server to the cluster as a non-voting learner")
                .arg(
                    clap::Arg::new("id")
                        .required(true)
                        .value_parser(clap::value_parser!(u8))
                        .help("The new server's ID"),
                )
                .arg(clap::Arg::new("peer_addr").required(true).help("The new server's peer address")),
        )
        .subcommand(clap::Command::new("status").about("Displays cluster status"))
        .get_matches();

    let addr = args.get_one::<String>("addr").unwrap();
    let mut client = Client::new(addr.as_str())?;

    match args.subcommand() {
        Some(("join", sub)) => {
            let id = *sub.get_one::<u8>("id").unwrap();
            let peer_addr = sub.get_one::<String>("peer_addr").unwrap();
            client.join_cluster(id, peer_addr)?;
            println!("Server {id} added as learner; it will be promoted once it has caught up");
        }
        Some(("status", _)) => {
            let status = client.status()?;
            println!("{status:#?}");
        }
        _ => unreachable!(),
    }
    Ok(())
}
