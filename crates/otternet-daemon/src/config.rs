//! CLI argument parsing and config file support.
//!
//! The daemon can be configured via CLI flags, a JSON config file,
//! or a combination of both (CLI overrides config file).

use std::path::{Path, PathBuf};

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

use otternet_network::config::NetworkConfig;

/// Catalog file name used when none is configured.
const DEFAULT_CATALOG_FILE: &str = "files.json";

// ---------------------------------------------------------------------------
// CLI arguments (manual parsing, no clap dependency)
// ---------------------------------------------------------------------------

/// What the command line asked for.
pub enum CliCommand {
    Run(CliArgs),
    Help,
}

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    pub data_dir: Option<PathBuf>,
    pub wallet_address: Option<String>,
    pub listen_addrs: Vec<String>,
    pub bootstrap_nodes: Vec<String>,
    pub relay_nodes: Vec<String>,
    pub no_default_peers: bool,
    pub seed: Option<String>,
    pub catalog_path: Option<PathBuf>,
    pub server_mode: bool,
    pub relay_server: bool,
    pub config_path: Option<PathBuf>,
}

impl CliArgs {
    /// Parses CLI arguments from `std::env::args`.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending argument.
    pub fn parse_from_env() -> Result<CliCommand, String> {
        Self::parse(std::env::args().skip(1))
    }

    /// Parses arguments, program name excluded.
    ///
    /// # Errors
    ///
    /// Returns a message for unknown flags and flags missing their value.
    pub fn parse<I>(args: I) -> Result<CliCommand, String>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);
        let mut cli = Self::default();

        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .ok_or_else(|| format!("missing value for {arg}"))
            };
            match arg.as_str() {
                "--data-dir" => cli.data_dir = Some(PathBuf::from(value()?)),
                "--wallet" => cli.wallet_address = Some(value()?),
                "--listen" => cli.listen_addrs.push(value()?),
                "--bootstrap" => cli.bootstrap_nodes.push(value()?),
                "--relay" => cli.relay_nodes.push(value()?),
                "--no-default-peers" => cli.no_default_peers = true,
                "--seed" => cli.seed = Some(value()?),
                "--catalog" => cli.catalog_path = Some(PathBuf::from(value()?)),
                "--server-mode" => cli.server_mode = true,
                "--relay-server" => cli.relay_server = true,
                "--config" => cli.config_path = Some(PathBuf::from(value()?)),
                "--help" | "-h" => return Ok(CliCommand::Help),
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(CliCommand::Run(cli))
    }
}

// ---------------------------------------------------------------------------
// Config file (JSON)
// ---------------------------------------------------------------------------

/// JSON config file format.
///
/// Example `daemon.json`:
/// ```json
/// {
///   "data_dir": "/var/lib/otternet",
///   "wallet_address": "1F1tAaz5x1HUXrCNLbtMDqcw6o5GNn4xqX",
///   "listen_addrs": ["/ip4/0.0.0.0/tcp/6881"],
///   "relay_nodes": [],
///   "seed": "my-node",
///   "server_mode": true
/// }
/// ```
///
/// Omitted peer lists fall back to the deployed relay and bootstrap
/// nodes; an empty list disables them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfigFile {
    pub data_dir: Option<String>,
    pub wallet_address: Option<String>,
    pub listen_addrs: Option<Vec<String>>,
    pub bootstrap_nodes: Option<Vec<String>>,
    pub relay_nodes: Option<Vec<String>>,
    pub seed: Option<String>,
    pub catalog_path: Option<String>,
    pub server_mode: Option<bool>,
    pub relay_server: Option<bool>,
}

// ---------------------------------------------------------------------------
// Resolved config (all defaults applied)
// ---------------------------------------------------------------------------

/// Daemon configuration after merging file and CLI.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub wallet_address: Option<String>,
    /// Empty means the network defaults.
    pub listen_addrs: Vec<String>,
    /// `None` means the deployed bootstrap nodes.
    pub bootstrap_nodes: Option<Vec<String>>,
    /// `None` means the deployed relay nodes.
    pub relay_nodes: Option<Vec<String>>,
    pub seed: Option<String>,
    /// `None` means `<data_dir>/files.json`.
    pub catalog_path: Option<PathBuf>,
    pub server_mode: bool,
    pub relay_server: bool,
}

impl DaemonConfig {
    /// Build config purely from CLI args with defaults.
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self::from_file(DaemonConfigFile::default()).merge_cli(cli)
    }

    /// Load config from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a message if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {e}", path.display()))?;

        let file: DaemonConfigFile =
            serde_json::from_str(&text).map_err(|e| format!("invalid config JSON: {e}"))?;

        Ok(Self::from_file(file))
    }

    fn from_file(file: DaemonConfigFile) -> Self {
        Self {
            data_dir: file
                .data_dir
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
            wallet_address: file.wallet_address,
            listen_addrs: file.listen_addrs.unwrap_or_default(),
            bootstrap_nodes: file.bootstrap_nodes,
            relay_nodes: file.relay_nodes,
            seed: file.seed,
            catalog_path: file.catalog_path.map(PathBuf::from),
            server_mode: file.server_mode.unwrap_or(false),
            relay_server: file.relay_server.unwrap_or(false),
        }
    }

    /// Merge CLI overrides onto a config-file base.
    ///
    /// Scalar flags replace file values. Listen addresses given on the
    /// command line replace the file's list, while `--bootstrap` and
    /// `--relay` add to it. `--no-default-peers` empties both lists
    /// before the additions.
    pub fn merge_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(ref dir) = cli.data_dir {
            self.data_dir = dir.clone();
        }
        if cli.wallet_address.is_some() {
            self.wallet_address = cli.wallet_address.clone();
        }
        if !cli.listen_addrs.is_empty() {
            self.listen_addrs = cli.listen_addrs.clone();
        }
        if cli.no_default_peers {
            self.bootstrap_nodes = Some(Vec::new());
            self.relay_nodes = Some(Vec::new());
        }
        let defaults = NetworkConfig::default();
        extend_peer_list(&mut self.bootstrap_nodes, &cli.bootstrap_nodes, &defaults.bootstrap_nodes);
        extend_peer_list(&mut self.relay_nodes, &cli.relay_nodes, &defaults.relay_nodes);
        if cli.seed.is_some() {
            self.seed = cli.seed.clone();
        }
        if let Some(ref path) = cli.catalog_path {
            self.catalog_path = Some(path.clone());
        }
        if cli.server_mode {
            self.server_mode = true;
        }
        if cli.relay_server {
            self.relay_server = true;
        }
        self
    }

    /// The wallet address the node runs for.
    ///
    /// # Errors
    ///
    /// Returns a message if none was configured.
    pub fn wallet(&self) -> Result<&str, String> {
        match self.wallet_address.as_deref().map(str::trim) {
            Some(wallet) if !wallet.is_empty() => Ok(wallet),
            _ => Err("a wallet address is required (--wallet or \"wallet_address\")".into()),
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_CATALOG_FILE))
    }

    /// Builds the network configuration on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first address that does not parse.
    pub fn network_config(&self) -> Result<NetworkConfig, String> {
        let mut config = NetworkConfig::default();
        if !self.listen_addrs.is_empty() {
            config.listen_addrs = parse_addrs("listen", &self.listen_addrs)?;
        }
        if let Some(ref nodes) = self.bootstrap_nodes {
            config.bootstrap_nodes = parse_addrs("bootstrap", nodes)?;
        }
        if let Some(ref nodes) = self.relay_nodes {
            config.relay_nodes = parse_addrs("relay", nodes)?;
        }
        if let Some(ref seed) = self.seed {
            config.identity_seed = seed.clone();
        }
        config.dht_server_mode = self.server_mode;
        config.enable_relay_server = self.relay_server;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn extend_peer_list(list: &mut Option<Vec<String>>, extra: &[String], defaults: &[Multiaddr]) {
    if extra.is_empty() {
        return;
    }
    // Additions to an unset list keep the deployed defaults.
    list.get_or_insert_with(|| defaults.iter().map(ToString::to_string).collect())
        .extend(extra.iter().cloned());
}

fn parse_addrs(kind: &str, addrs: &[String]) -> Result<Vec<Multiaddr>, String> {
    addrs
        .iter()
        .map(|s| {
            s.parse::<Multiaddr>()
                .map_err(|e| format!("invalid {kind} address '{s}': {e}"))
        })
        .collect()
}

/// Platform-specific default data directory.
fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        if let Some(home) = dirs::home_dir() {
            return home.join(".otternet");
        }
    }
    if let Some(data) = dirs::data_dir() {
        return data.join("Otternet");
    }
    PathBuf::from("otternet-data")
}

pub fn print_help() {
    println!(
        r#"Otternet Daemon - headless overlay node

USAGE:
    otternet-daemon --wallet <ADDRESS> [OPTIONS]

OPTIONS:
    --wallet <ADDRESS>       Wallet address that owns the hosted files
    --data-dir <PATH>        Data directory (default: platform-specific)
    --listen <MULTIADDR>     Listen address (repeatable; default: ephemeral TCP + QUIC)
    --bootstrap <MULTIADDR>  Add a bootstrap node (repeatable)
    --relay <MULTIADDR>      Add a relay node (repeatable)
    --no-default-peers       Do not use the deployed relay and bootstrap nodes
    --seed <STRING>          Identity seed (default: shared legacy seed)
    --catalog <PATH>         Catalog JSON file (default: <data-dir>/files.json)
    --server-mode            Run the DHT in server mode
    --relay-server           Act as a circuit relay for other peers
    --config <PATH>          Load settings from JSON config file
    -h, --help               Show this help

ENVIRONMENT:
    RUST_LOG                 Log level filter (default: info)
"#
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> CliArgs {
        match CliArgs::parse(args.iter().copied()).unwrap() {
            CliCommand::Run(cli) => cli,
            CliCommand::Help => panic!("unexpected help"),
        }
    }

    #[test]
    fn parses_repeatable_flags() {
        let cli = run_args(&[
            "--wallet",
            "w1",
            "--listen",
            "/ip4/127.0.0.1/tcp/1",
            "--listen",
            "/ip4/127.0.0.1/tcp/2",
            "--relay",
            "/ip4/10.0.0.1/tcp/9",
            "--server-mode",
        ]);
        assert_eq!(cli.wallet_address.as_deref(), Some("w1"));
        assert_eq!(cli.listen_addrs.len(), 2);
        assert_eq!(cli.relay_nodes, vec!["/ip4/10.0.0.1/tcp/9"]);
        assert!(cli.server_mode);
    }

    #[test]
    fn rejects_unknown_and_incomplete_flags() {
        assert!(CliArgs::parse(["--bogus"]).is_err());
        assert!(CliArgs::parse(["--wallet"]).is_err());
        assert!(matches!(CliArgs::parse(["-h"]), Ok(CliCommand::Help)));
    }

    #[test]
    fn cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.json");
        std::fs::write(
            &path,
            r#"{
                "data_dir": "/srv/otternet",
                "wallet_address": "file-wallet",
                "listen_addrs": ["/ip4/0.0.0.0/tcp/6881"],
                "relay_nodes": [],
                "seed": "file-seed"
            }"#,
        )
        .unwrap();

        let cli = run_args(&["--wallet", "cli-wallet", "--bootstrap", "/ip4/1.2.3.4/tcp/5"]);
        let config = DaemonConfig::load(&path).unwrap().merge_cli(&cli);

        assert_eq!(config.wallet().unwrap(), "cli-wallet");
        assert_eq!(config.data_dir, PathBuf::from("/srv/otternet"));
        assert_eq!(config.catalog_path(), PathBuf::from("/srv/otternet/files.json"));

        let network = config.network_config().unwrap();
        assert_eq!(network.identity_seed, "file-seed");
        assert!(network.relay_nodes.is_empty());
        assert_eq!(network.listen_addrs.len(), 1);
        assert!(network
            .bootstrap_nodes
            .contains(&"/ip4/1.2.3.4/tcp/5".parse().unwrap()));
    }

    #[test]
    fn no_default_peers_empties_both_lists() {
        let cli = run_args(&["--no-default-peers", "--relay", "/ip4/10.0.0.1/tcp/9"]);
        let network = DaemonConfig::from_cli(&cli).network_config().unwrap();
        assert!(network.bootstrap_nodes.is_empty());
        assert_eq!(network.relay_nodes.len(), 1);
    }

    #[test]
    fn defaults_come_from_network_config() {
        let config = DaemonConfig::from_cli(&CliArgs::default());
        assert!(config.wallet().is_err());

        let network = config.network_config().unwrap();
        let defaults = NetworkConfig::default();
        assert_eq!(network.listen_addrs, defaults.listen_addrs);
        assert_eq!(network.relay_nodes, defaults.relay_nodes);
        assert!(!network.dht_server_mode);
    }

    #[test]
    fn bad_address_is_reported() {
        let cli = run_args(&["--listen", "not-an-addr"]);
        let err = DaemonConfig::from_cli(&cli).network_config().unwrap_err();
        assert!(err.contains("not-an-addr"), "{err}");
    }

    #[test]
    fn invalid_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }
}
