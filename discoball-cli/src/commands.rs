use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use discoball::{
    store::{ContentStore, StoreStats},
    Address,
};
use url::Url;

use crate::config::Config;

pub(crate) mod dance;
pub(crate) mod party;
pub(crate) mod watch;

/// Mirror your own site, pin your friends' mirrors.
///
/// Publishers snapshot a page, store it on IPFS and record it in the discoball registry
/// (`dance`). Friends pin everything the publishers they trust have recorded (`party`), or
/// follow the registry live (`watch`).
#[derive(Parser, Debug, Clone)]
#[clap(version)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub(crate) command: Commands,

    /// Path to the configuration file, see <https://github.com/pierce403/discoball>.
    #[clap(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// JSON-RPC endpoint of a Base node [default: https://mainnet.base.org].
    #[clap(long, global = true)]
    pub(crate) rpc_url: Option<Url>,

    /// IPFS API address, multiaddr or url [default: /ip4/127.0.0.1/tcp/5001].
    #[clap(long, global = true)]
    pub(crate) ipfs_api: Option<String>,

    /// Address of the registry contract.
    #[clap(long, global = true)]
    pub(crate) contract: Option<Address>,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Commands {
    /// Mirror a page of a site you own and record it in the registry.
    ///
    /// The domain must carry a TXT record `discoball-site-verification=<your address>`.
    Dance(dance::DanceArgs),
    /// Pin every mirror published by the addresses in your friends file.
    Party(party::PartyArgs),
    /// Replay the registry, then follow it live.
    Watch(watch::WatchArgs),
}

impl Cli {
    pub(crate) async fn run(self, data_dir: &Path) -> Result<ExitCode> {
        let config = Config::load(self.config.as_deref())
            .await?
            .with_overrides(self.rpc_url, self.ipfs_api, self.contract);
        match self.command {
            Commands::Dance(args) => {
                crate::logging::init_terminal_logging()?;
                args.run(&config).await
            }
            Commands::Party(args) => {
                crate::logging::init_terminal_logging()?;
                args.run(&config).await
            }
            Commands::Watch(args) => {
                let _guard =
                    crate::logging::init_terminal_and_file_logging(&config.file_logs, data_dir)?;
                args.run(&config, data_dir).await
            }
        }
    }
}

/// Print the usage statistics of `store`.
pub(crate) async fn print_stats(store: &impl ContentStore) -> Result<StoreStats> {
    let stats = store.stats().await?;
    println!("Pinned items: {}", stats.pinned_count);
    println!("Storage used: {:.2} GB", stats.storage_gib());
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_overrides_after_subcommand() {
        let cli = Cli::try_parse_from([
            "discoball",
            "party",
            "--rpc-url",
            "http://localhost:8545",
            "--friends-file",
            "my-friends.txt",
        ])
        .unwrap();
        assert_eq!(cli.rpc_url.unwrap().as_str(), "http://localhost:8545/");
        let Commands::Party(args) = cli.command else {
            panic!("expected party");
        };
        assert_eq!(args.friends_file, PathBuf::from("my-friends.txt"));
    }

    #[test]
    fn dance_requires_domain_and_key() {
        assert!(Cli::try_parse_from(["discoball", "dance", "--path", "/"]).is_err());
    }
}
