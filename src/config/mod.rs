use crate::algorithms::Hyperparameters;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    pub model: ModelConfig,
    pub serving: ServingConfig,
    pub snapshot: SnapshotConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Tokio worker threads for the HTTP server
    pub workers: usize,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub n_factors: usize,
    pub learning_rate: f64,
    pub regularization: f64,
    pub epochs: usize,
    pub init_std_dev: f64,
    pub seed: u64,
}

impl ModelConfig {
    pub fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters {
            n_factors: self.n_factors,
            learning_rate: self.learning_rate,
            regularization: self.regularization,
            init_std_dev: self.init_std_dev,
            seed: self.seed,
        }
    }
}

/// How request handlers obtain the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadMode {
    /// Keep one model in memory; load on start, save after every mutation,
    /// and reload when another process has saved a newer snapshot.
    Persistent,
    /// Reload the snapshot before every recommend, predict and batch update,
    /// discarding any in-memory state that was not saved.
    PerRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub exclude_rated: bool,
    pub apply_on_rate: bool,
    pub reload_mode: ReloadMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub batch_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                workers: num_cpus::get(),
            },
            postgres: PostgresConfig {
                url: "postgresql://localhost:5432/mfrec".to_string(),
                max_connections: 10,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                key_prefix: "mfrec".to_string(),
            },
            model: ModelConfig {
                n_factors: 20,
                learning_rate: 0.01,
                regularization: 0.01,
                epochs: 10,
                init_std_dev: 0.1,
                seed: 42,
            },
            serving: ServingConfig {
                default_top_k: 5,
                max_top_k: 1000,
                exclude_rated: true,
                apply_on_rate: false,
                reload_mode: ReloadMode::Persistent,
            },
            snapshot: SnapshotConfig {
                path: PathBuf::from("data/mf_model.json"),
            },
            worker: WorkerConfig {
                batch_interval_secs: 300,
            },
            retry: RetryConfig {
                max_retries: 3,
                initial_delay_ms: 100,
            },
        }
    }
}

impl Config {
    /// Layers a config file and `MFREC__SECTION__KEY` environment variables
    /// over the defaults.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let defaults = config::Config::try_from(&Config::default())?;
        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MFREC").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// `from_file` when the file exists, defaults otherwise.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if std::path::Path::new(path).exists() {
            Self::from_file(path)
        } else {
            tracing::info!(path, "Config file not found, using default configuration");
            Ok(Self::default())
        }
    }
}
