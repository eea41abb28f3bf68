//! Agent configuration.
//!
//! Configuration for the ward node agent, loaded from TOML:
//! - Key-value agent connection settings
//! - Cache staleness and watch retry tuning
//! - A global default debounce window
//! - One `[[template]]` table per managed file

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ward_kv::{
    BackoffConfig, ConsulKv, DEFAULT_BLOCKING_WAIT, DEFAULT_MAX_STALE, KvQuery, WatchConfig,
};
use ward_render::{Delimiters, ParseOptions, Template};

use crate::error::ConfigError;
use crate::exec::CommandLine;
use crate::spec::{
    DEFAULT_COMMAND_TIMEOUT, FileMode, Ownership, TemplateRegistry, TemplateSource, TemplateSpec,
    WaitConfig,
};

/// Default grace period for in-flight commands at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Connection settings for the key-value agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConsulSettings {
    /// `host:port` of the agent.
    #[serde(default = "default_address")]
    pub address: String,
    /// `http` or `https`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// ACL token sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            scheme: default_scheme(),
            token: None,
        }
    }
}

impl ConsulSettings {
    /// Builds the HTTP backend these settings describe.
    pub fn backend(&self) -> Result<ConsulKv, ConfigError> {
        let backend = ConsulKv::new(&self.scheme, &self.address)
            .map_err(|e| ConfigError::Invalid(format!("consul: {e}")))?;
        Ok(match &self.token {
            Some(token) => backend.with_token(token.clone()),
            None => backend,
        })
    }
}

fn default_address() -> String {
    ward_kv::consul::DEFAULT_ADDRESS.to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

/// Cache tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// How old a cached snapshot may be before reads go to the agent.
    #[serde(default = "default_max_stale", with = "humantime_serde")]
    pub max_stale: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_stale: DEFAULT_MAX_STALE,
        }
    }
}

fn default_max_stale() -> Duration {
    DEFAULT_MAX_STALE
}

/// Watch loop tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WatchSettings {
    /// How long one blocking query may be held by the agent.
    #[serde(default = "default_blocking_wait", with = "humantime_serde")]
    pub blocking_wait: Duration,
    /// First retry delay after a failed read.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Ceiling for retry delays.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            blocking_wait: default_blocking_wait(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl WatchSettings {
    /// Converts to the watcher's configuration.
    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            blocking_wait: self.blocking_wait,
            backoff: BackoffConfig {
                initial_delay: self.initial_backoff,
                max_delay: self.max_backoff,
                ..BackoffConfig::default()
            },
        }
    }
}

fn default_blocking_wait() -> Duration {
    DEFAULT_BLOCKING_WAIT
}

fn default_initial_backoff() -> Duration {
    BackoffConfig::default().initial_delay
}

fn default_max_backoff() -> Duration {
    BackoffConfig::default().max_delay
}

const fn default_true() -> bool {
    true
}

/// A debounce window as written in TOML: `"2s:10s"` or `{ min, max }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WaitSetting {
    /// Compact `"<min>[:<max>]"` form.
    Compact(String),
    /// Table form.
    Table {
        /// Quiet period.
        min: String,
        /// Upper bound; defaults to four times `min`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<String>,
    },
}

impl WaitSetting {
    /// Parses into a [`WaitConfig`].
    pub fn resolve(&self) -> Result<WaitConfig, ConfigError> {
        match self {
            Self::Compact(text) => WaitConfig::parse(text),
            Self::Table { min, max } => WaitConfig::new(
                crate::duration::parse_duration(min)?,
                max.as_deref().map(crate::duration::parse_duration).transpose()?,
            ),
        }
    }
}

/// File permissions as written in TOML: `"0550"` or a decimal integer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ModeSetting {
    /// Octal string.
    Octal(String),
    /// Raw integer bits.
    Bits(u32),
}

/// Bits an integer mode may not carry: setuid, setgid, sticky and world-write.
const INTEGER_MODE_FORBIDDEN: u32 = 0o7002;

impl ModeSetting {
    /// Parses into a [`FileMode`].
    ///
    /// An integer is taken as raw bits, so `550` means `0o1046`. Integers
    /// that set the special bits or world-write are rejected; those modes
    /// must be spelled as an octal string.
    pub fn resolve(&self) -> Result<FileMode, ConfigError> {
        match self {
            Self::Octal(text) => FileMode::parse(text),
            Self::Bits(bits) if bits & INTEGER_MODE_FORBIDDEN != 0 => {
                Err(ConfigError::Invalid(format!(
                    "integer file mode {bits} is {bits:#o}, which sets special or world-writable bits; \
                     write the mode as an octal string such as \"0550\""
                )))
            }
            Self::Bits(bits) => FileMode::new(*bits),
        }
    }
}

/// One `[[template]]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    /// Path of the template file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Inline template text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    /// File the output is written to.
    pub destination: PathBuf,
    /// Extra queries to watch, e.g. `"config/services/"` for a prefix.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    /// Bindings from bare template identifiers to key paths.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
    /// Owner of the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Group of the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Permission bits of the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perms: Option<ModeSetting>,
    /// Keep the previous file as `<destination>.bak`.
    #[serde(default)]
    pub backup: bool,
    /// Command run after the destination changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Limit on the command's run time.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub command_timeout: Option<Duration>,
    /// Fail the render when a key without a default is absent.
    #[serde(default)]
    pub error_on_missing_key: bool,
    /// Opening action delimiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_delimiter: Option<String>,
    /// Closing action delimiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_delimiter: Option<String>,
    /// Create missing parent directories.
    #[serde(default = "default_true")]
    pub create_dest_dirs: bool,
    /// Debounce window; overrides the global one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitSetting>,
}

impl TemplateConfig {
    /// A template with inline contents and default settings.
    pub fn inline(destination: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            contents: Some(contents.into()),
            destination: destination.into(),
            create_dest_dirs: true,
            ..Self::default()
        }
    }

    /// A template read from `source` with default settings.
    pub fn from_source(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.into()),
            destination: destination.into(),
            create_dest_dirs: true,
            ..Self::default()
        }
    }

    /// Sets the debounce window, e.g. `"2s:10s"`.
    #[must_use]
    pub fn with_wait(mut self, wait: &str) -> Self {
        self.wait = Some(WaitSetting::Compact(wait.to_string()));
        self
    }

    /// Sets the post-render command.
    #[must_use]
    pub fn with_command(mut self, command: &str, timeout: Duration) -> Self {
        self.command = Some(command.to_string());
        self.command_timeout = Some(timeout);
        self
    }

    /// Sets the permission bits.
    #[must_use]
    pub fn with_perms(mut self, perms: &str) -> Self {
        self.perms = Some(ModeSetting::Octal(perms.to_string()));
        self
    }

    /// Enables the single-generation backup.
    #[must_use]
    pub const fn with_backup(mut self) -> Self {
        self.backup = true;
        self
    }

    /// Fails renders on absent keys.
    #[must_use]
    pub const fn strict(mut self) -> Self {
        self.error_on_missing_key = true;
        self
    }

    /// Validates the entry and builds a [`TemplateSpec`].
    ///
    /// The template source file, if any, is read here. `default_wait` is the
    /// global window used when the entry has none.
    pub fn build(&self, default_wait: Option<WaitConfig>) -> Result<TemplateSpec, ConfigError> {
        let destination = &self.destination;
        let invalid = |message: String| ConfigError::template(destination, message);

        if destination.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("template destination cannot be empty".to_string()));
        }
        if destination.file_name().is_none() {
            return Err(invalid("destination must name a file".to_string()));
        }

        let (source, text) = match (&self.source, &self.contents) {
            (Some(_), Some(_)) => {
                return Err(invalid("source and contents are mutually exclusive".to_string()));
            }
            (None, None) => {
                return Err(invalid("one of source or contents is required".to_string()));
            }
            (Some(path), None) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    invalid(format!("failed to read source '{}': {e}", path.display()))
                })?;
                (TemplateSource::File(path.clone()), text)
            }
            (None, Some(text)) => (TemplateSource::Inline, text.clone()),
        };

        let delimiters = match (&self.left_delimiter, &self.right_delimiter) {
            (None, None) => Delimiters::default(),
            (left, right) => Delimiters::new(
                left.as_deref().unwrap_or(ward_render::DEFAULT_LEFT),
                right.as_deref().unwrap_or(ward_render::DEFAULT_RIGHT),
            )
            .map_err(|e| invalid(e.to_string()))?,
        };

        let options = ParseOptions {
            delimiters: delimiters.clone(),
            vars: self.vars.clone(),
        };
        let template = Template::parse(&text, &options).map_err(|e| invalid(e.to_string()))?;

        let mut dependencies = template
            .dependencies()
            .into_iter()
            .map(KvQuery::key)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(e.to_string()))?;
        for key in &self.keys {
            dependencies.push(KvQuery::parse(key).map_err(|e| invalid(e.to_string()))?);
        }
        dependencies.sort();
        dependencies.dedup();

        let command = self
            .command
            .as_deref()
            .map(CommandLine::parse)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;
        let command_timeout = self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        if command.is_some() && command_timeout.is_zero() {
            return Err(invalid("command_timeout must be greater than zero".to_string()));
        }

        let wait = match &self.wait {
            Some(setting) => setting.resolve().map_err(|e| invalid(e.to_string()))?,
            None => default_wait.unwrap_or(WaitConfig::IMMEDIATE),
        };

        let perms = self
            .perms
            .as_ref()
            .map(ModeSetting::resolve)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(TemplateSpec {
            source,
            template,
            destination: destination.clone(),
            dependencies,
            create_dest_dirs: self.create_dest_dirs,
            perms,
            ownership: Ownership {
                user: self.user.clone(),
                group: self.group.clone(),
            },
            backup: self.backup,
            delimiters,
            error_on_missing_key: self.error_on_missing_key,
            command,
            command_timeout,
            wait,
        })
    }
}

/// Main agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Grace period for in-flight commands at shutdown.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Default debounce window for templates without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitSetting>,
    /// Key-value agent connection.
    #[serde(default)]
    pub consul: ConsulSettings,
    /// Cache tuning.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Watch tuning.
    #[serde(default)]
    pub watch: WatchSettings,
    /// Managed templates.
    #[serde(default, rename = "template")]
    pub templates: Vec<TemplateConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            wait: None,
            consul: ConsulSettings::default(),
            cache: CacheSettings::default(),
            watch: WatchSettings::default(),
            templates: Vec::new(),
        }
    }
}

fn default_shutdown_grace() -> Duration {
    DEFAULT_SHUTDOWN_GRACE
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// Relative template `source` paths are resolved against the directory
    /// containing the configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml(&content)?;
        if let Some(base) = path.parent() {
            for template in &mut config.templates {
                if let Some(source) = template.source.as_mut() {
                    if source.is_relative() {
                        *source = base.join(&*source);
                    }
                }
            }
        }
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the settings that do not need the filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.consul.scheme.as_str(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "consul scheme must be http or https, got '{}'",
                self.consul.scheme
            )));
        }
        if self.consul.address.trim().is_empty() {
            return Err(ConfigError::Invalid("consul address cannot be empty".to_string()));
        }
        if self.watch.initial_backoff.is_zero() {
            return Err(ConfigError::Invalid(
                "watch initial_backoff must be greater than zero".to_string(),
            ));
        }
        if self.watch.max_backoff < self.watch.initial_backoff {
            return Err(ConfigError::Invalid(
                "watch max_backoff must not be shorter than initial_backoff".to_string(),
            ));
        }
        if self.templates.is_empty() {
            return Err(ConfigError::Invalid("at least one [[template]] is required".to_string()));
        }
        self.default_wait()?;
        Ok(())
    }

    /// The global debounce window, if configured.
    pub fn default_wait(&self) -> Result<Option<WaitConfig>, ConfigError> {
        self.wait.as_ref().map(WaitSetting::resolve).transpose()
    }

    /// Builds every template spec into a registry.
    ///
    /// # Errors
    ///
    /// Returns the first invalid template, or a duplicate destination.
    pub fn registry(&self) -> Result<TemplateRegistry, ConfigError> {
        let default_wait = self.default_wait()?;
        let mut registry = TemplateRegistry::new();
        for template in &self.templates {
            registry.register(template.build(default_wait)?)?;
        }
        Ok(registry)
    }

    /// Serializes to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("failed to serialize config: {e}")))
    }

    /// A starting configuration managing the secrets service's region file.
    pub fn sample() -> Self {
        Self {
            templates: vec![TemplateConfig {
                contents: Some(
                    "cluster_name = \"{{ keyOrDefault \"config/services/consul/datacenter\" \"unknown\" }}\"\n"
                        .to_string(),
                ),
                destination: PathBuf::from("/etc/vault/conf.d/region.hcl"),
                perms: Some(ModeSetting::Octal("0550".to_string())),
                backup: true,
                command: Some(
                    "/bin/bash -c 'chown vault:vault /etc/vault/conf.d/region.hcl && systemctl restart vault'"
                        .to_string(),
                ),
                command_timeout: Some(Duration::from_secs(15)),
                create_dest_dirs: false,
                wait: Some(WaitSetting::Compact("2s:10s".to_string())),
                ..TemplateConfig::default()
            }],
            ..Self::default()
        }
    }
}
