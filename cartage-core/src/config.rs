//! Worker configuration, loaded from a TOML file shared by the replay
//! worker, the copy workers it spawns, and the admin commands.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use cartage_handlers::obfuscate::ObfuscationMap;
use cartage_handlers::HandlerContext;

use crate::WorkerError;

fn default_loop_delay() -> f64 {
    1.0
}

fn default_parallel_copies() -> usize {
    1
}

fn default_pool_size() -> usize {
    1
}

fn default_lock_timeout() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Job name; also the consumer name registered on the queue.
    pub job_name: String,

    /// Subscriber database connect string.
    pub db: String,

    /// Cascaded queue this node replicates.
    pub queue_name: String,

    #[serde(default)]
    pub pidfile: Option<PathBuf>,

    /// Seconds to sleep when the queue is idle.
    #[serde(default = "default_loop_delay")]
    pub loop_delay: f64,

    /// How many tables can be in initial copy at once.
    #[serde(default = "default_parallel_copies")]
    pub parallel_copies: usize,

    /// Glob patterns for tables that copy with a fan-out inserter pool.
    #[serde(default)]
    pub threaded_copy_tables: Vec<String>,

    /// Inserter pool size for the tables above.
    #[serde(default = "default_pool_size")]
    pub threaded_copy_pool_size: usize,

    /// Accept only events for locally present tables.
    #[serde(default)]
    pub local_only: bool,

    /// With local_only, also drop EXECUTE events at the source.
    #[serde(default)]
    pub local_only_drop_execute: bool,

    /// Drop secondary indexes on the destination for the duration of the
    /// initial copy, re-issuing them while catching up.
    #[serde(default)]
    pub copy_drop_indexes: bool,

    /// Max time DDL may wait on locks, seconds.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: f64,

    /// Override for the comparison query (`_TABLE_`, `_COLS_` templates).
    #[serde(default)]
    pub compare_sql: Option<String>,

    /// Override for the comparison result format string.
    #[serde(default)]
    pub compare_fmt: Option<String>,

    #[serde(default)]
    pub register_only_tables: Vec<String>,
    #[serde(default)]
    pub register_only_seqs: Vec<String>,
    #[serde(default)]
    pub register_skip_tables: Vec<String>,
    #[serde(default)]
    pub register_skip_seqs: Vec<String>,

    /// Hash function used by the shard handler's default expression.
    #[serde(default)]
    pub shard_hash_func: Option<String>,

    /// Query returning `(shard_nr, shard_mask, shard_count)`.
    #[serde(default)]
    pub shard_info_sql: Option<String>,

    /// YAML rule map for the obfuscate handler.
    #[serde(default)]
    pub obfuscator_map: Option<PathBuf>,

    /// Key for the obfuscate handler's keyed hashes.
    #[serde(default)]
    pub obfuscator_key: Option<String>,

    /// Where this config was loaded from; passed to spawned copy workers.
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, WorkerError> {
        let body = std::fs::read_to_string(path).map_err(|e| {
            WorkerError::Usage(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut cf: Config = toml::from_str(&body)
            .map_err(|e| WorkerError::Usage(format!("bad config {}: {e}", path.display())))?;
        cf.config_path = path.to_owned();
        if cf.parallel_copies < 1 {
            return Err(WorkerError::Config(format!(
                "bad value for parallel_copies: {}",
                cf.parallel_copies
            )));
        }
        Ok(cf)
    }

    /// Context handed to handler construction; loads the obfuscation map
    /// when one is configured.
    pub fn handler_context(&self) -> Result<HandlerContext, WorkerError> {
        let obfuscator_map = match &self.obfuscator_map {
            Some(path) => Some(ObfuscationMap::load(path)?),
            None => None,
        };
        Ok(HandlerContext {
            shard_hash_func: self.shard_hash_func.clone(),
            shard_info_sql: self.shard_info_sql.clone(),
            obfuscator_key: self
                .obfuscator_key
                .clone()
                .unwrap_or_default()
                .into_bytes(),
            obfuscator_map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config() {
        let f = write_config(
            "job_name = \"replay_node2\"\n\
             db = \"dbname=subscriber host=127.0.0.1\"\n\
             queue_name = \"mainq\"\n",
        );
        let cf = Config::load(f.path()).unwrap();
        assert_eq!(cf.job_name, "replay_node2");
        assert_eq!(cf.parallel_copies, 1);
        assert_eq!(cf.loop_delay, 1.0);
        assert_eq!(cf.lock_timeout, 10.0);
        assert!(!cf.local_only);
        assert_eq!(cf.config_path, f.path());
    }

    #[test]
    fn parallel_copies_must_be_positive() {
        let f = write_config(
            "job_name = \"w\"\ndb = \"x\"\nqueue_name = \"q\"\nparallel_copies = 0\n",
        );
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn missing_required_field() {
        let f = write_config("job_name = \"w\"\n");
        assert!(Config::load(f.path()).is_err());
    }
}
