use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "logring",
    about = "A partitioned, replicated, append-only log store",
    version
)]
pub struct Opts {
    /// Path to a TOML config file; flags override its values.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address to serve on.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Storage root for this node.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// This node's name in the ring; defaults to its own base URL.
    #[arg(long, value_name = "NAME")]
    pub node_name: Option<String>,

    /// Ring member, repeatable; include this node.
    #[arg(long = "node", value_name = "NAME")]
    pub nodes: Vec<String>,

    /// Backup replicas per collection.
    #[arg(long, value_name = "N")]
    pub backups: Option<usize>,

    /// Require signed auth tokens on client requests.
    #[arg(long)]
    pub auth: bool,
}
