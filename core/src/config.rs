use std::{
    collections::{HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::document::{INDEX_PREFIX, KEY_SEPARATOR};
use crate::error::{MemDbError, MemDbResult};

/// Where flushed documents live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Process-local map, lost on exit
    Memory,
    /// One file per document under `data_dir`
    File { data_dir: String },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::File {
            data_dir: "./memdb_data".into(),
        }
    }
}

/// Per-shard cache and lock settings.
///
/// Millisecond values `<= 0` disable the corresponding timer, except
/// `persistent_delay_ms` where `0` means flush right after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub id: String,
    /// Delay between an entry turning dirty and its flush to the backend
    pub persistent_delay_ms: u64,
    /// Clean entries idle for longer than this are evicted
    pub idle_timeout_ms: i64,
    /// Cadence of the eviction sweep
    pub gc_interval_ms: i64,
    /// Upper bound for waiting on a lock held by another connection
    pub lock_timeout_ms: i64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            id: "s1".to_string(),
            persistent_delay_ms: 0,
            idle_timeout_ms: 30 * 60 * 1000, // 30 minutes
            gc_interval_ms: 1000,
            lock_timeout_ms: 10 * 1000,
        }
    }
}

impl ShardConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn persistent_delay(&self) -> Duration {
        Duration::from_millis(self.persistent_delay_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        positive_millis(self.idle_timeout_ms)
    }

    pub fn gc_interval(&self) -> Option<Duration> {
        positive_millis(self.gc_interval_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        positive_millis(self.lock_timeout_ms)
    }
}

fn positive_millis(ms: i64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms as u64))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Fields maintained in index collections
    pub indexes: Vec<String>,
    /// Owning shard; the first configured shard when unset
    pub shard: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: BackendConfig,
    pub shards: Vec<ShardConfig>,
    pub collections: HashMap<String, CollectionConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            shards: vec![ShardConfig::default()],
            collections: HashMap::new(),
        }
    }
}

impl DatabaseConfig {
    /// Config with a single shard and an in-memory backend.
    pub fn single_shard(shard: ShardConfig) -> Self {
        Self {
            backend: BackendConfig::Memory,
            shards: vec![shard],
            collections: HashMap::new(),
        }
    }

    /// Declare indexes for a collection on the default shard.
    pub fn with_collection(mut self, name: impl Into<String>, indexes: &[&str]) -> Self {
        self.collections.insert(
            name.into(),
            CollectionConfig {
                indexes: indexes.iter().map(|s| s.to_string()).collect(),
                shard: None,
            },
        );
        self
    }

    /// Id of the shard that hosts collections without an explicit route
    pub fn default_shard(&self) -> Option<&str> {
        self.shards.first().map(|s| s.id.as_str())
    }

    pub fn validate(&self) -> MemDbResult<()> {
        if self.shards.is_empty() {
            return Err(MemDbError::Config("at least one shard is required".into()));
        }

        let mut ids = HashSet::new();
        for shard in &self.shards {
            if shard.id.is_empty() {
                return Err(MemDbError::Config("shard id must not be empty".into()));
            }
            if !ids.insert(shard.id.as_str()) {
                return Err(MemDbError::Config(format!(
                    "duplicate shard id '{}'",
                    shard.id
                )));
            }
        }

        for (name, collection) in &self.collections {
            validate_client_collection_name(name)?;
            if let Some(shard) = &collection.shard
                && !ids.contains(shard.as_str())
            {
                return Err(MemDbError::Config(format!(
                    "collection '{}' routed to unknown shard '{}'",
                    name, shard
                )));
            }
        }

        Ok(())
    }

    /// Load config from TOML file, with environment variable overrides.
    /// Falls back to defaults if file is not found. MEMDB_CONFIG env var overrides the path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> MemDbResult<Self> {
        let config = ConfigLoader::new().load(path)?;
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn validate_collection_name(name: &str) -> MemDbResult<()> {
    if name.is_empty() || name.contains(KEY_SEPARATOR) {
        return Err(MemDbError::InvalidInput(format!(
            "invalid collection name '{}'",
            name
        )));
    }
    Ok(())
}

/// Names clients may address; the index prefix is reserved
pub(crate) fn validate_client_collection_name(name: &str) -> MemDbResult<()> {
    validate_collection_name(name)?;
    if name.starts_with(INDEX_PREFIX) {
        return Err(MemDbError::InvalidInput(format!(
            "collection name '{}' is reserved for indexes",
            name
        )));
    }
    Ok(())
}

/// Resolves configuration from file, CLI args, and environment variables.
struct ConfigLoader {
    args: Vec<String>,
}

impl ConfigLoader {
    fn new() -> Self {
        Self {
            args: env::args().collect(),
        }
    }

    fn load<P: AsRef<Path>>(&self, default_path: P) -> MemDbResult<DatabaseConfig> {
        let mut cfg_path = self.resolve_config_path(default_path);

        if let Ok(env_path) = env::var("MEMDB_CONFIG") {
            cfg_path = PathBuf::from(env_path);
        }

        let mut cfg = match fs::read_to_string(&cfg_path) {
            Ok(s) => toml::from_str::<DatabaseConfig>(&s).map_err(|e| {
                MemDbError::Config(format!("{}: {}", cfg_path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DatabaseConfig::default(),
            Err(e) => return Err(e.into()),
        };

        Self::apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    fn resolve_config_path<P: AsRef<Path>>(&self, default_path: P) -> PathBuf {
        Self::find_config_arg(&self.args).unwrap_or_else(|| default_path.as_ref().to_path_buf())
    }

    /// Find --config or -c flag in arguments.
    fn find_config_arg(args: &[String]) -> Option<PathBuf> {
        let mut iter = args.iter().peekable();
        while let Some(a) = iter.next() {
            if a.starts_with("--config=") || a.starts_with("-c=") {
                if let Some((_, val)) = a.split_once('=') {
                    return Some(PathBuf::from(val));
                }
            } else if (a == "--config" || a == "-c")
                && let Some(next) = iter.peek()
            {
                return Some(PathBuf::from((*next).clone()));
            }
        }
        None
    }

    /// Apply MEMDB_* environment variable overrides.
    fn apply_env_overrides(cfg: &mut DatabaseConfig) {
        if let Ok(v) = env::var("MEMDB_DATA_DIR") {
            cfg.backend = BackendConfig::File { data_dir: v };
        }

        if let Ok(v) = env::var("MEMDB_PERSISTENT_DELAY_MS")
            && let Ok(ms) = v.parse::<u64>()
        {
            cfg.shards.iter_mut().for_each(|s| s.persistent_delay_ms = ms);
        }

        if let Ok(v) = env::var("MEMDB_IDLE_TIMEOUT_MS")
            && let Ok(ms) = v.parse::<i64>()
        {
            cfg.shards.iter_mut().for_each(|s| s.idle_timeout_ms = ms);
        }
    }
}
