use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::{info, debug, error};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSettings,
    pub host: HostSettings,
    pub worker: WorkerSettings,
    pub storage: StorageSettings,
}

/// Crawl behaviour shared by hosts, workers and standalone crawls
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerSettings {
    pub user_agent: String,
    pub respect_robots_txt: bool,
    /// Depth-first search uses a LIFO frontier
    pub depth_first: bool,
    /// Frontier items kept in memory before spilling to storage
    pub memory_limit_count: usize,
    pub seed_urls: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub url_patterns: UrlPatterns,
    pub politeness_delay: u64,  // Delay between requests in milliseconds
    pub robots_max_age: u64,  // Seconds a domain's robots rules stay cached unused
    pub robots_sweep_interval: u64,  // Seconds
    pub fetch_timeout: u64,  // Seconds
}

/// URL pattern settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Settings of the process that owns the frontier
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HostSettings {
    pub listen_address: String,
    /// Plain text; only its SHA-256 digest is sent by workers
    pub password: Option<String>,
    pub client_max_age: u64,  // Seconds an offline client is remembered
    pub sweep_interval: u64,  // Seconds
    pub work_backoff: u64,  // Milliseconds to wait when no work or no worker is available
    pub handshake_timeout: u64,  // Seconds
}

/// Settings of a worker process
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    pub host_address: String,
    pub password: Option<String>,
    pub reconnect_delay: u64,  // Seconds
    pub handshake_timeout: u64,  // Seconds
}

/// Record store settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: String, // "memory", "mongodb"
    pub connection_string: String,
    pub database_name: String,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("HiveCrawler/{}", env!("CARGO_PKG_VERSION")),
            respect_robots_txt: true,
            depth_first: false,
            memory_limit_count: 10_000,
            seed_urls: vec![],
            allowed_domains: vec![],
            url_patterns: UrlPatterns::default(),
            politeness_delay: 1000,
            robots_max_age: 3600,
            robots_sweep_interval: 300,
            fetch_timeout: 30,
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:6789".to_string(),
            password: None,
            client_max_age: 600,
            sweep_interval: 30,
            work_backoff: 200,
            handshake_timeout: 10,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            host_address: "127.0.0.1:6789".to_string(),
            password: None,
            reconnect_delay: 5,
            handshake_timeout: 10,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            connection_string: "mongodb://localhost:27017".to_string(),
            database_name: "hive_crawler".to_string(),
        }
    }
}

impl CrawlerSettings {
    pub fn politeness_delay(&self) -> Duration {
        Duration::from_millis(self.politeness_delay)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout.max(1))
    }

    pub fn robots_max_age(&self) -> Duration {
        Duration::from_secs(self.robots_max_age)
    }

    pub fn robots_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.robots_sweep_interval.max(1))
    }
}

impl HostSettings {
    pub fn client_max_age(&self) -> Duration {
        Duration::from_secs(self.client_max_age)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    pub fn work_backoff(&self) -> Duration {
        Duration::from_millis(self.work_backoff.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout.max(1))
    }
}

impl WorkerSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout.max(1))
    }
}

impl CrawlerConfig {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "hive-crawler", "hive-crawler")
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = Self::project_dirs() {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the sites directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        // Move back up to the config directory
        path.pop();
        path
    }

    /// Directory for state that outlives a process, such as the worker id
    pub fn data_dir() -> PathBuf {
        if let Some(proj_dirs) = Self::project_dirs() {
            proj_dirs.data_dir().to_path_buf()
        } else {
            PathBuf::from("./data")
        }
    }

    /// Load a named profile, or the default configuration
    pub fn load(profile: Option<&str>) -> Result<Self> {
        match profile {
            Some(profile) => Self::load_profile(profile),
            None => Self::load_default(),
        }
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let config_dir = Self::config_dir();
        let profile_path = config_dir.join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let sites_dir = Self::config_dir().join("sites");
        let profile_path = sites_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(&sites_dir)
            .context(format!("Failed to read profiles directory: {}", sites_dir.display()))?
        {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}

/// Last client id a host assigned to this machine's worker
pub struct WorkerIdentity {
    path: PathBuf,
}

impl WorkerIdentity {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Identity file in the default data directory
    pub fn default_location() -> Self {
        Self::new(CrawlerConfig::data_dir().join("worker_id"))
    }

    pub fn load(&self) -> Option<String> {
        fs::read_to_string(&self.path)
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    }

    pub fn save(&self, id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(&self.path, id)
            .context(format!("Failed to write worker id: {}", self.path.display()))
    }
}
