use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct L1Config {
    /// Upper bound on L1 chunk-cache memory, in bytes.
    pub max_bytes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct L2Config {
    pub ttl_chunks_s: u64,
    pub ttl_search_s: u64,
    pub ttl_graph_s: u64,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    pub default_workers: usize,
    /// Repositories below this file count are indexed sequentially.
    pub sequential_threshold: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    pub enabled: bool,
    pub timeout_s: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub file_timeout_s: u64,
    pub parse_timeout_s: u64,
    pub metadata_timeout_s: u64,
    pub embed_timeout_s: u64,
    pub persist_timeout_s: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepoConfig {
    pub max_files: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    pub ttl_s: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub l1: L1Config,
    pub l2: L2Config,
    pub workers: WorkersConfig,
    pub oracle: OracleConfig,
    pub pipeline: PipelineConfig,
    pub repo: RepoConfig,
    pub lock: LockConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Self::builder_with_defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("MNEMOLITE").separator("__"));

        builder.build()?.try_deserialize()
    }

    fn builder_with_defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError>
    {
        Config::builder()
            .set_default("l1.max_bytes", 100u64 * 1024 * 1024)?
            .set_default("l2.ttl_chunks_s", 300u64)?
            .set_default("l2.ttl_search_s", 30u64)?
            .set_default("l2.ttl_graph_s", 120u64)?
            .set_default("l2.max_connections", 20u64)?
            .set_default("workers.default_workers", 2u64)?
            .set_default("workers.sequential_threshold", 50u64)?
            .set_default("oracle.enabled", true)?
            .set_default("oracle.timeout_s", 3u64)?
            .set_default("pipeline.file_timeout_s", 60u64)?
            .set_default("pipeline.parse_timeout_s", 10u64)?
            .set_default("pipeline.metadata_timeout_s", 3u64)?
            .set_default("pipeline.embed_timeout_s", 30u64)?
            .set_default("pipeline.persist_timeout_s", 60u64)?
            .set_default("repo.max_files", 10_000u64)?
            .set_default("lock.ttl_s", 600u64)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            l1: L1Config {
                max_bytes: 100 * 1024 * 1024,
            },
            l2: L2Config {
                ttl_chunks_s: 300,
                ttl_search_s: 30,
                ttl_graph_s: 120,
                max_connections: 20,
            },
            workers: WorkersConfig {
                default_workers: 2,
                sequential_threshold: 50,
            },
            oracle: OracleConfig {
                enabled: true,
                timeout_s: 3,
            },
            pipeline: PipelineConfig {
                file_timeout_s: 60,
                parse_timeout_s: 10,
                metadata_timeout_s: 3,
                embed_timeout_s: 30,
                persist_timeout_s: 60,
            },
            repo: RepoConfig { max_files: 10_000 },
            lock: LockConfig { ttl_s: 600 },
        }
    }
}
