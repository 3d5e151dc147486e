use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Default ceiling for buffered request bodies (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

/// Default async timeout applied to every exchange.
pub const DEFAULT_ASYNC_TIMEOUT_MS: u64 = 30_000;

/// What the component table does when a lifecycle hook fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePolicy {
    /// Log the failure and keep going with the remaining components.
    #[default]
    LogAndContinue,
    /// Stop at the first failing component and surface the error.
    FailFast,
}

/// Named settings consumed by the dispatcher at boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Only declarations whose type path starts with this prefix are scanned.
    /// An empty string scans everything.
    pub boot_namespace: String,
    pub worker_pool_size: usize,
    pub worker_pool_name: String,
    pub async_timeout_ms: u64,
    /// `None` disables the body ceiling.
    pub max_body_size: Option<u64>,
    pub default_encoding: String,
    pub lifecycle_policy: LifecyclePolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            boot_namespace: String::new(),
            worker_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            worker_pool_name: "switchyard-worker".to_string(),
            async_timeout_ms: DEFAULT_ASYNC_TIMEOUT_MS,
            max_body_size: Some(DEFAULT_MAX_BODY_SIZE),
            default_encoding: "UTF-8".to_string(),
            lifecycle_policy: LifecyclePolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::new()
    }
}

pub struct DispatcherConfigBuilder {
    config: DispatcherConfig,
}

impl DispatcherConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
        }
    }

    pub fn boot_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.boot_namespace = namespace.into();
        self
    }

    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.config.worker_pool_size = size.max(1);
        self
    }

    pub fn worker_pool_name(mut self, name: impl Into<String>) -> Self {
        self.config.worker_pool_name = name.into();
        self
    }

    pub fn async_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.async_timeout_ms = timeout;
        self
    }

    pub fn max_body_size(mut self, limit: Option<u64>) -> Self {
        self.config.max_body_size = limit;
        self
    }

    pub fn default_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.config.default_encoding = encoding.into();
        self
    }

    pub fn lifecycle_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.config.lifecycle_policy = policy;
        self
    }

    pub fn build(self) -> DispatcherConfig {
        self.config
    }
}

impl Default for DispatcherConfigBuilder {
    fn default() -> Self {
        DispatcherConfigBuilder::new()
    }
}

#[derive(Debug, Default)]
pub struct Config<C> {
    config: C,
}

impl<C> Config<C>
where
    C: Default + DeserializeOwned,
{
    pub fn new(provider: impl ConfigProvider<C>) -> Result<Self, ConfigProviderError> {
        provider.load().map(|config| Config { config })
    }

    pub fn get(&self) -> &C {
        &self.config
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.config
    }

    pub fn into_inner(self) -> C {
        self.config
    }
}

pub trait ConfigProvider<C>
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError>;
}

pub struct DefaultConfigProvider;

impl<C> ConfigProvider<C> for DefaultConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(C::default())
    }
}

/// Reads a JSON document from `base_path/config_name`. Missing fields fall
/// back to the type's serde defaults.
pub struct FileConfigProvider {
    pub base_path: String,
    pub config_name: String,
}

impl<C> ConfigProvider<C> for FileConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        let config_path = Path::new(&self.base_path).join(&self.config_name);
        let file = File::open(&config_path).map_err(|e| {
            let msg = format!("Could not open config file {}: {}", config_path.display(), e);
            ConfigProviderError::load_error(msg)
        })?;
        serde_json::from_reader(file).map_err(|e| {
            let msg = format!("Could not load config file from reader: {}", e);
            ConfigProviderError::load_error(msg)
        })
    }
}

pub struct ProgrammaticConfigProvider<C> {
    pub config: C,
}

impl<C> ConfigProvider<C> for ProgrammaticConfigProvider<C>
where
    C: Default + DeserializeOwned + Clone,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(self.config.clone())
    }
}

#[derive(Error, Debug)]
pub enum ConfigProviderError {
    #[error("Could not load config file. {message}")]
    Load { message: String },
}

impl ConfigProviderError {
    #[inline]
    pub(crate) fn load_error(msg: impl Into<String>) -> Self {
        Self::Load {
            message: msg.into(),
        }
    }
}
