//! Data directory resolution and initialization.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::cli::LaunchArgs;
use crate::config::schema::{DbEngine, EngineMarker, Network, NodeConfig};
use crate::config::validation::validate_network;

/// Configuration errors. All of them are usage errors reported before
/// anything is started.
#[derive(Debug)]
pub enum ConfigError {
    UnsupportedNetwork(u64),
    AmbiguousFileSystem,
    MissingPath {
        path: PathBuf,
    },
    EngineMismatch {
        configured: DbEngine,
        on_disk: DbEngine,
        database_dir: PathBuf,
    },
    AmbiguousLogging,
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    MarkerParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    MarkerEncode(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnsupportedNetwork(id) => write!(
                f,
                "Unsupported network id: {}. Only the preconfigured networks (1 = mainnet, 3 = ropsten) are supported",
                id
            ),
            ConfigError::AmbiguousFileSystem => write!(
                f,
                "Could not determine a data directory. Set {} or HOME, or pass --data-dir",
                ROOT_ENV
            ),
            ConfigError::MissingPath { path } => write!(
                f,
                "It appears that {} does not exist. skein does not create directories outside of its root path. \
                 Either create the path manually or use a data directory inside {}",
                path.display(),
                ROOT_ENV
            ),
            ConfigError::EngineMismatch {
                configured,
                on_disk,
                database_dir,
            } => write!(
                f,
                "Database engine mismatch. The on-disk database uses `{}` but skein is configured to use `{}`. \
                 Re-run with the on-disk engine or remove the database from `{}`",
                on_disk,
                configured,
                database_dir.display()
            ),
            ConfigError::AmbiguousLogging => write!(
                f,
                "Ambiguous logging configuration: the stderr level was set with both \
                 `--stderr-log-level` and `--log-level`. Remove one of these flags"
            ),
            ConfigError::Io { path, source } => write!(f, "IO error at {}: {}", path.display(), source),
            ConfigError::MarkerParse { path, source } => {
                write!(f, "Invalid engine marker {}: {}", path.display(), source)
            }
            ConfigError::MarkerEncode(e) => write!(f, "Cannot encode engine marker: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::MarkerParse { source, .. } => Some(source),
            ConfigError::MarkerEncode(e) => Some(e),
            _ => None,
        }
    }
}

/// Root directory under which skein may create directories.
pub const ROOT_ENV: &str = "XDG_SKEIN_ROOT";

/// Legacy explicit data directory.
pub const DATA_DIR_ENV: &str = "SKEIN_DATA_DIR";

/// Root used when only `HOME` is available, relative to it.
const HOME_ROOT: &str = ".local/share/skein";

/// Read a non-empty variable from the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// The skein root: `XDG_SKEIN_ROOT`, else `$HOME/.local/share/skein`.
pub fn skein_root(env: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
    env(ROOT_ENV)
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|home| PathBuf::from(home).join(HOME_ROOT)))
}

/// Resolve the data directory.
///
/// Precedence: explicit path, `XDG_SKEIN_ROOT/<network>`, `SKEIN_DATA_DIR`,
/// `$HOME/.local/share/skein/<network>`.
pub fn resolve_data_dir(
    explicit: Option<&Path>,
    network: Network,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(root) = env(ROOT_ENV) {
        return Ok(PathBuf::from(root).join(network.name()));
    }
    if let Some(data_dir) = env(DATA_DIR_ENV) {
        return Ok(PathBuf::from(data_dir));
    }
    if let Some(home) = env("HOME") {
        return Ok(PathBuf::from(home).join(HOME_ROOT).join(network.name()));
    }
    Err(ConfigError::AmbiguousFileSystem)
}

/// Build the node configuration from validated arguments.
pub fn load_config(
    args: &LaunchArgs,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<NodeConfig, ConfigError> {
    let network = validate_network(args.network_id)?;
    let data_dir = resolve_data_dir(args.data_dir.as_deref(), network, env)?;

    Ok(NodeConfig {
        network,
        data_dir,
        db_engine: args.db_engine,
    })
}

pub fn is_data_dir_initialized(config: &NodeConfig) -> bool {
    config.data_dir.is_dir()
        && config.required_dirs().iter().all(|dir| dir.is_dir())
        && config.engine_marker_path().is_file()
}

/// Create the data directory layout and record the storage engine.
///
/// The data directory itself is only created inside `root`; anything
/// outside it must already exist. An existing engine marker is left alone.
pub fn initialize_data_dir(config: &NodeConfig, root: Option<&Path>) -> Result<(), ConfigError> {
    if !config.data_dir.exists() {
        let inside_root = root.is_some_and(|root| config.data_dir.starts_with(root));
        if !inside_root {
            return Err(ConfigError::MissingPath {
                path: config.data_dir.clone(),
            });
        }
        create_dir(&config.data_dir)?;
    }

    for dir in config.required_dirs() {
        create_dir(&dir)?;
    }

    let marker_path = config.engine_marker_path();
    if !marker_path.exists() {
        let marker = EngineMarker {
            engine: config.db_engine,
        };
        let content = toml::to_string(&marker).map_err(ConfigError::MarkerEncode)?;
        fs::write(&marker_path, content).map_err(|source| ConfigError::Io {
            path: marker_path.clone(),
            source,
        })?;
        tracing::debug!(path = %marker_path.display(), engine = %config.db_engine, "Engine marker written");
    }

    Ok(())
}

/// Engine recorded on disk, if the database has been initialized.
pub fn read_engine_marker(config: &NodeConfig) -> Result<Option<EngineMarker>, ConfigError> {
    let path = config.engine_marker_path();
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ConfigError::Io { path, source }),
    };
    let marker = toml::from_str(&content).map_err(|source| ConfigError::MarkerParse { path, source })?;
    Ok(Some(marker))
}

fn create_dir(path: &Path) -> Result<(), ConfigError> {
    fs::create_dir_all(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_explicit_path_wins() {
        let env = env_of(&[(ROOT_ENV, "/root-env"), ("HOME", "/home/u")]);
        let dir = resolve_data_dir(Some(Path::new("/explicit")), Network::Mainnet, &env).unwrap();
        assert_eq!(dir, PathBuf::from("/explicit"));
    }

    #[test]
    fn test_root_env_before_legacy() {
        let env = env_of(&[(ROOT_ENV, "/xdg"), (DATA_DIR_ENV, "/legacy")]);
        let dir = resolve_data_dir(None, Network::Ropsten, &env).unwrap();
        assert_eq!(dir, PathBuf::from("/xdg/ropsten"));
    }

    #[test]
    fn test_legacy_before_home() {
        let env = env_of(&[(DATA_DIR_ENV, "/legacy"), ("HOME", "/home/u")]);
        let dir = resolve_data_dir(None, Network::Mainnet, &env).unwrap();
        assert_eq!(dir, PathBuf::from("/legacy"));
    }

    #[test]
    fn test_home_default() {
        let env = env_of(&[("HOME", "/home/u")]);
        let dir = resolve_data_dir(None, Network::Mainnet, &env).unwrap();
        assert_eq!(dir, PathBuf::from("/home/u/.local/share/skein/mainnet"));
        assert_eq!(
            skein_root(&env),
            Some(PathBuf::from("/home/u/.local/share/skein"))
        );
    }

    #[test]
    fn test_nothing_resolvable_is_ambiguous() {
        let env = env_of(&[]);
        let err = resolve_data_dir(None, Network::Mainnet, &env).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousFileSystem));
    }

    #[test]
    fn test_initialize_inside_root() {
        let tmp = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            network: Network::Mainnet,
            data_dir: tmp.path().join("mainnet"),
            db_engine: DbEngine::LevelDb,
        };

        assert!(!is_data_dir_initialized(&config));
        initialize_data_dir(&config, Some(tmp.path())).unwrap();
        assert!(is_data_dir_initialized(&config));

        let marker = read_engine_marker(&config).unwrap().unwrap();
        assert_eq!(marker.engine, DbEngine::LevelDb);
    }

    #[test]
    fn test_missing_path_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            network: Network::Mainnet,
            data_dir: elsewhere.path().join("does-not-exist"),
            db_engine: DbEngine::LevelDb,
        };

        let err = initialize_data_dir(&config, Some(root.path())).unwrap_err();
        match err {
            ConfigError::MissingPath { path } => assert_eq!(path, config.data_dir),
            other => panic!("expected MissingPath, got {:?}", other),
        }
    }
}
