use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index a directory and answer HELO/FIND/GET/END requests for it
    Serve {
        /// Port to listen on
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
        /// Directory to index
        #[arg(value_parser = existing_dir)]
        path: PathBuf,
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,
        /// Seconds a connection may sit idle before it is dropped
        #[arg(long, default_value_t = 60)]
        idle_timeout: u64,
    },
    /// Connect to a node and issue requests typed on stdin
    Connect {
        /// Node address
        ip: String,
        /// Node port
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
        /// Directory to save downloaded files under
        #[arg(value_parser = existing_dir)]
        download_dir: PathBuf,
        /// Print only search results and errors
        #[arg(short, long)]
        quiet: bool,
        /// Seconds to wait for the connection and for each response read
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

fn existing_dir(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if path.is_dir() {
        Ok(path)
    } else {
        Err(format!("directory does not exist: {}", s))
    }
}
