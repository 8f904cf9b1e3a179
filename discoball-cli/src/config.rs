//! Configuration for the discoball CLI.

use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use discoball::{
    ledger::RpcLedger,
    replicate::ReplicationConfig,
    rpc::RpcClient,
    store::KuboStore,
    watcher::WatcherConfig,
    Address,
};
use serde::Deserialize;
use url::Url;

const ENV_CONFIG_DIR: &str = "DISCOBALL_CONFIG_DIR";
const ENV_DATA_DIR: &str = "DISCOBALL_DATA_DIR";
const ENV_FILE_RUST_LOG: &str = "DISCOBALL_FILE_RUST_LOG";

/// Name of the optional config file located in the discoball config directory.
pub(crate) const CONFIG_FILE_NAME: &str = "discoball.config.toml";

/// Public Base mainnet endpoint.
const DEFAULT_RPC_URL: &str = "https://mainnet.base.org";

/// The configuration of all commands.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    /// JSON-RPC endpoint of a node.
    pub(crate) rpc_url: Url,
    /// Content store API address, a multiaddr or an http url.
    pub(crate) ipfs_api: String,
    /// The registry contract.
    pub(crate) registry: RegistryConfig,
    /// Watcher tuning.
    pub(crate) watcher: WatcherConfig,
    /// Replication tuning.
    pub(crate) replication: ReplicationConfig,
    /// Timeouts of external calls.
    pub(crate) timeouts: Timeouts,
    /// Configuration for the logfile.
    pub(crate) file_logs: super::logging::FileLogging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: Url::parse(DEFAULT_RPC_URL).expect("valid url"),
            ipfs_api: discoball::store::kubo::DEFAULT_API.to_string(),
            registry: RegistryConfig::default(),
            watcher: WatcherConfig::default(),
            replication: ReplicationConfig::default(),
            timeouts: Timeouts::default(),
            file_logs: Default::default(),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Default, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RegistryConfig {
    /// Address of the registry contract. There is no default deployment.
    pub(crate) contract: Option<Address>,
    /// First block replayed by `watch`, usually the block the contract was deployed in.
    pub(crate) start_block: u64,
    /// Chain id used for signing. Asked from the node if not set.
    pub(crate) chain_id: Option<u64>,
}

#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Timeouts {
    #[serde(with = "humantime_serde")]
    pub(crate) rpc: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) store: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) pin: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) dns: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) crawl: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) confirmation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            rpc: discoball::rpc::DEFAULT_TIMEOUT,
            store: discoball::store::kubo::DEFAULT_TIMEOUT,
            pin: discoball::store::kubo::DEFAULT_PIN_TIMEOUT,
            dns: discoball::dns::DEFAULT_TIMEOUT,
            crawl: discoball::crawl::DEFAULT_TIMEOUT,
            confirmation: discoball::ledger::DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

impl Config {
    /// Creates a config from the default config file.
    ///
    /// If the *file* is `Some` the configuration will be read from it.  Otherwise the
    /// default config file will be loaded.  If that is not present the default config will
    /// be used.
    pub(crate) async fn load(file: Option<&Path>) -> Result<Config> {
        let default_config = discoball_config_path(CONFIG_FILE_NAME)?;

        let config_file = match file {
            Some(file) => Some(file),
            None => {
                if default_config.exists() {
                    Some(default_config.as_ref())
                } else {
                    None
                }
            }
        };
        let mut config = if let Some(file) = config_file {
            let config = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            Self::load_toml(&config)?
        } else {
            Self::default()
        };

        // override from env var
        if let Some(env_filter) = env_file_rust_log().transpose()? {
            config.file_logs.rust_log = env_filter;
        }
        Ok(config)
    }

    fn load_toml(s: &str) -> Result<Config> {
        let config = toml::from_str(s)?;
        Ok(config)
    }

    /// Apply command line overrides.
    pub(crate) fn with_overrides(
        mut self,
        rpc_url: Option<Url>,
        ipfs_api: Option<String>,
        contract: Option<Address>,
    ) -> Self {
        if let Some(rpc_url) = rpc_url {
            self.rpc_url = rpc_url;
        }
        if let Some(ipfs_api) = ipfs_api {
            self.ipfs_api = ipfs_api;
        }
        if let Some(contract) = contract {
            self.registry.contract = Some(contract);
        }
        self
    }

    /// Read access to the registry.
    pub(crate) fn ledger(&self) -> Result<RpcLedger> {
        let contract = self.registry.contract.ok_or_else(|| {
            anyhow!("registry contract not set, pass --contract or set [registry] contract")
        })?;
        let rpc = RpcClient::new(self.rpc_url.clone(), self.timeouts.rpc)?;
        Ok(RpcLedger::new(rpc, contract)
            .with_chain_id(self.registry.chain_id)
            .with_confirmation_timeout(self.timeouts.confirmation))
    }

    /// The content store.
    pub(crate) fn store(&self) -> Result<KuboStore> {
        let store = KuboStore::new(&self.ipfs_api)?;
        Ok(store.with_timeouts(self.timeouts.store, self.timeouts.pin))
    }
}

/// Parse [`ENV_FILE_RUST_LOG`] as [`tracing_subscriber::EnvFilter`]. Returns `None` if not
/// present.
fn env_file_rust_log() -> Option<Result<crate::logging::EnvFilter>> {
    match env::var(ENV_FILE_RUST_LOG) {
        Ok(s) => Some(crate::logging::EnvFilter::from_str(&s).map_err(Into::into)),
        Err(e) => match e {
            env::VarError::NotPresent => None,
            e @ env::VarError::NotUnicode(_) => Some(Err(e.into())),
        },
    }
}

/// Name of directory that wraps all discoball files in a given application directory
const DISCOBALL_DIR: &str = "discoball";

/// Returns the path to the user's discoball config directory.
///
/// If the `DISCOBALL_CONFIG_DIR` environment variable is set it will be used
/// unconditionally. Otherwise the returned value depends on the operating system.
///
/// | Platform | Value                                           |
/// | -------- | ----------------------------------------------- |
/// | Linux    | `$XDG_CONFIG_HOME` or `$HOME`/.config/discoball |
/// | macOS    | `$HOME`/Library/Application Support/discoball   |
/// | Windows  | `{FOLDERID_RoamingAppData}`/discoball           |
pub(crate) fn discoball_config_root() -> Result<PathBuf> {
    if let Some(val) = env::var_os(ENV_CONFIG_DIR) {
        return Ok(PathBuf::from(val));
    }
    let cfg = dirs_next::config_dir()
        .ok_or_else(|| anyhow!("operating environment provides no directory for configuration"))?;
    Ok(cfg.join(DISCOBALL_DIR))
}

/// Path that leads to a file in the discoball config directory.
pub(crate) fn discoball_config_path(file_name: impl AsRef<Path>) -> Result<PathBuf> {
    let path = discoball_config_root()?.join(file_name);
    Ok(path)
}

/// Returns the path to the user's discoball data directory.
///
/// If the `DISCOBALL_DATA_DIR` environment variable is set it will be used
/// unconditionally. Otherwise the returned value depends on the operating system.
///
/// | Platform | Value                                                     |
/// | -------- | --------------------------------------------------------- |
/// | Linux    | `$XDG_DATA_HOME`/discoball or `$HOME`/.local/share/discoball |
/// | macOS    | `$HOME`/Library/Application Support/discoball             |
/// | Windows  | `{FOLDERID_RoamingAppData}/discoball`                     |
pub(crate) fn discoball_data_root() -> Result<PathBuf> {
    let path = if let Some(val) = env::var_os(ENV_DATA_DIR) {
        PathBuf::from(val)
    } else {
        let path = dirs_next::data_dir().ok_or_else(|| {
            anyhow!("operating environment provides no directory for application data")
        })?;
        path.join(DISCOBALL_DIR)
    };
    let path = if !path.is_absolute() {
        std::env::current_dir()?.join(path)
    } else {
        path
    };
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{EnvFilter, Rotation};

    #[test]
    fn test_toml_empty() {
        let config = Config::load_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.registry.contract, None);
        assert_eq!(config.registry.start_block, 0);
        assert_eq!(config.replication.batch_size, 50);
    }

    #[test]
    fn test_toml_full() {
        let contents = r#"
rpc_url = "http://localhost:8545"
ipfs_api = "/dns/ipfs.local/tcp/5001"

[registry]
contract = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"
start_block = 100
chain_id = 8453

[watcher]
poll_interval = "2s"
max_block_range = 500
retry = { initial_interval = "1s", max_interval = "1m", max_retries = 3 }

[replication]
batch_size = 25
pin_delay = "250ms"

[timeouts]
rpc = "5s"
confirmation = "5m"

[file_logs]
rust_log = "discoball=trace"
rotation = "never"
"#;
        let config = Config::load_toml(contents).unwrap();
        assert_eq!(config.rpc_url.as_str(), "http://localhost:8545/");
        assert_eq!(
            config.registry.contract.unwrap().to_string(),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
        assert_eq!(config.registry.chain_id, Some(8453));
        assert_eq!(config.watcher.poll_interval, Duration::from_secs(2));
        assert_eq!(config.watcher.sync_poll_interval, Duration::from_secs(10));
        assert_eq!(config.watcher.retry.max_interval, Duration::from_secs(60));
        assert_eq!(config.watcher.retry.max_retries, 3);
        assert_eq!(config.replication.pin_delay, Duration::from_millis(250));
        assert_eq!(config.timeouts.rpc, Duration::from_secs(5));
        assert_eq!(config.timeouts.confirmation, Duration::from_secs(300));
        assert_eq!(config.timeouts.pin, Duration::from_secs(120));
        assert_eq!(
            config.file_logs.rust_log,
            EnvFilter::from_str("discoball=trace").unwrap()
        );
        assert_eq!(config.file_logs.rotation, Rotation::Never);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::load_toml("rpc = \"x\"").is_err());
        assert!(Config::load_toml("[replication]\nbatch = 1").is_err());
    }

    #[test]
    fn overrides_win() {
        let contract: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
        let config = Config::default().with_overrides(
            Some(Url::parse("http://127.0.0.1:8545").unwrap()),
            None,
            Some(contract),
        );
        assert_eq!(config.rpc_url.as_str(), "http://127.0.0.1:8545/");
        assert_eq!(config.ipfs_api, "/ip4/127.0.0.1/tcp/5001");
        assert_eq!(config.registry.contract, Some(contract));
        assert!(config.ledger().is_ok());
    }

    #[test]
    fn ledger_needs_a_contract() {
        let err = Config::default().ledger().unwrap_err();
        assert!(
            err.to_string().contains("registry contract not set"),
            "{err}"
        );
    }
}
