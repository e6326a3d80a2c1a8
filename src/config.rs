//! Node configuration: an optional TOML file with CLI flags layered on
//! top.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::cli::Opts;

const DEFAULT_LISTEN: &str = "127.0.0.1:8040";
const DEFAULT_BACKUPS: usize = 1;
const DEFAULT_TOKEN_TTL_SECS: u64 = 300;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("could not read config file {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not parse config file {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("a data directory is required (--data-dir or data_dir in the config file)"))]
    MissingDataDir,
}

/// The optional file form; everything is optional so flags can fill the
/// gaps.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
    node_name: Option<String>,
    nodes: Option<Vec<String>>,
    backups: Option<usize>,
    auth: Option<bool>,
    token_ttl_secs: Option<u64>,
}

/// Fully resolved node configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    /// This node's name in the ring. Names double as dial targets, so in
    /// a real cluster they are base URLs.
    pub node_name: String,
    /// Full ring membership, this node included.
    pub nodes: Vec<String>,
    pub backups: usize,
    pub auth: bool,
    pub token_ttl_secs: u64,
}

impl Config {
    pub fn load(opts: &Opts) -> Result<Config, ConfigError> {
        let file = match &opts.config {
            Some(path) => {
                let text = fs::read_to_string(path).context(ReadSnafu { path: path.clone() })?;
                toml::from_str::<FileConfig>(&text).context(ParseSnafu { path: path.clone() })?
            }
            None => FileConfig::default(),
        };

        let listen = opts
            .listen
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.parse().expect("default address parses"));
        let data_dir = opts
            .data_dir
            .clone()
            .or(file.data_dir)
            .ok_or(ConfigError::MissingDataDir)?;
        let node_name = opts
            .node_name
            .clone()
            .or(file.node_name)
            .unwrap_or_else(|| format!("http://{listen}"));
        let mut nodes = if opts.nodes.is_empty() {
            file.nodes.unwrap_or_default()
        } else {
            opts.nodes.clone()
        };
        if nodes.is_empty() {
            nodes.push(node_name.clone());
        }

        Ok(Config {
            listen,
            data_dir,
            node_name,
            nodes,
            backups: opts.backups.or(file.backups).unwrap_or(DEFAULT_BACKUPS),
            auth: opts.auth || file.auth.unwrap_or(false),
            token_ttl_secs: file.token_ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_opts() -> Opts {
        Opts {
            config: None,
            listen: None,
            data_dir: Some(PathBuf::from("/tmp/logring")),
            node_name: None,
            nodes: vec![],
            backups: None,
            auth: false,
        }
    }

    #[test]
    fn defaults_fill_in() {
        let config = Config::load(&bare_opts()).unwrap();
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.node_name, format!("http://{DEFAULT_LISTEN}"));
        assert_eq!(config.nodes, vec![config.node_name.clone()]);
        assert_eq!(config.backups, DEFAULT_BACKUPS);
        assert!(!config.auth);
    }

    #[test]
    fn missing_data_dir_is_an_error() {
        let mut opts = bare_opts();
        opts.data_dir = None;
        assert!(matches!(
            Config::load(&opts).unwrap_err(),
            ConfigError::MissingDataDir
        ));
    }

    #[test]
    fn file_values_load_and_flags_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logring.toml");
        fs::write(
            &path,
            r#"
                listen = "127.0.0.1:9001"
                data_dir = "/srv/logring"
                node_name = "http://a.example:9001"
                nodes = ["http://a.example:9001", "http://b.example:9001"]
                backups = 2
            "#,
        )
        .unwrap();

        let mut opts = bare_opts();
        opts.config = Some(path);
        opts.data_dir = None;
        opts.backups = Some(3);

        let config = Config::load(&opts).unwrap();
        assert_eq!(config.listen.to_string(), "127.0.0.1:9001");
        assert_eq!(config.data_dir, PathBuf::from("/srv/logring"));
        assert_eq!(config.nodes.len(), 2);
        // The flag overrides the file.
        assert_eq!(config.backups, 3);
    }
}
