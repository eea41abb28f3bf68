//! Template specifications and the registry that owns them.
//!
//! A [`TemplateSpec`] is the validated, immutable form of one `[[template]]`
//! entry: the parsed template, where it is written, how it is debounced and
//! what runs after it changes. Specs are shared read-only between the
//! supervisor and their runner.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ward_kv::KvQuery;
use ward_render::{Delimiters, RenderOptions, Template};

use crate::error::ConfigError;
use crate::exec::CommandLine;

/// Default timeout for post-render commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Mode used for newly created files when none is configured.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Suffix appended to the destination to form the backup path.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Quiescence window for a template.
///
/// After a change the template renders once no further change has arrived
/// for `min`, and never later than `max` after the first change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitConfig {
    min: Duration,
    max: Duration,
}

impl WaitConfig {
    /// Render immediately on every change.
    pub const IMMEDIATE: Self = Self {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    /// Creates a window. A missing `max` defaults to four times `min`.
    pub fn new(min: Duration, max: Option<Duration>) -> Result<Self, ConfigError> {
        let max = max.unwrap_or_else(|| min.saturating_mul(4));
        if max < min {
            return Err(ConfigError::Invalid(format!(
                "wait max ({max:?}) must not be shorter than min ({min:?})"
            )));
        }
        Ok(Self { min, max })
    }

    /// Parses `"<min>"` or `"<min>:<max>"`, e.g. `"2s:10s"`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        match text.split_once(':') {
            Some((min, max)) => Self::new(
                crate::duration::parse_duration(min)?,
                Some(crate::duration::parse_duration(max)?),
            ),
            None => Self::new(crate::duration::parse_duration(text)?, None),
        }
    }

    /// Quiet period that must elapse after the latest change.
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Upper bound measured from the first change of a burst.
    pub const fn max(&self) -> Duration {
        self.max
    }
}

impl fmt::Display for WaitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            crate::duration::format_duration(self.min),
            crate::duration::format_duration(self.max)
        )
    }
}

/// Unix permission bits for a destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(u32);

impl FileMode {
    /// Creates a mode, rejecting bits outside `0o7777`.
    pub fn new(bits: u32) -> Result<Self, ConfigError> {
        if bits > 0o7777 {
            return Err(ConfigError::Invalid(format!("file mode {bits:o} is out of range")));
        }
        Ok(Self(bits))
    }

    /// Parses an octal string such as `"0550"` or `"640"`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let digits = text.trim().trim_start_matches("0o");
        let bits = u32::from_str_radix(digits, 8)
            .map_err(|_| ConfigError::Invalid(format!("invalid octal file mode '{text}'")))?;
        Self::new(bits)
    }

    /// Raw permission bits.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// Owner and group applied to a destination file, by name or numeric id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ownership {
    /// User name or uid.
    pub user: Option<String>,
    /// Group name or gid.
    pub group: Option<String>,
}

impl Ownership {
    /// True when neither user nor group is configured.
    pub const fn is_unset(&self) -> bool {
        self.user.is_none() && self.group.is_none()
    }
}

/// Where a template's text came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Read from a file when the configuration was loaded.
    File(PathBuf),
    /// Given inline in the configuration.
    Inline,
}

impl fmt::Display for TemplateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Inline => f.write_str("<inline>"),
        }
    }
}

/// A validated template specification.
#[derive(Debug, Clone)]
pub struct TemplateSpec {
    /// Where the template text came from.
    pub source: TemplateSource,
    /// Parsed template.
    pub template: Template,
    /// File the rendered output is written to.
    pub destination: PathBuf,
    /// Key-value queries the template reads, sorted and unique.
    pub dependencies: Vec<KvQuery>,
    /// Create missing parent directories of the destination.
    pub create_dest_dirs: bool,
    /// Permission bits; `None` keeps the existing file's mode.
    pub perms: Option<FileMode>,
    /// Owner and group to apply.
    pub ownership: Ownership,
    /// Keep the previous file as `<destination>.bak`.
    pub backup: bool,
    /// Delimiters the template was parsed with.
    pub delimiters: Delimiters,
    /// Fail the render when a key without a default is absent.
    pub error_on_missing_key: bool,
    /// Command run after the destination changes.
    pub command: Option<CommandLine>,
    /// Limit on the command's run time.
    pub command_timeout: Duration,
    /// Debounce window.
    pub wait: WaitConfig,
}

impl TemplateSpec {
    /// Options passed to every render of this template.
    pub const fn render_options(&self) -> RenderOptions {
        RenderOptions {
            error_on_missing_key: self.error_on_missing_key,
        }
    }

    /// Path of the single backup generation.
    pub fn backup_path(&self) -> PathBuf {
        backup_path(&self.destination)
    }

    /// Whether this template reads anything covered by `query`.
    pub fn depends_on(&self, query: &KvQuery) -> bool {
        self.dependencies.contains(query)
    }
}

/// Returns `<destination>.bak`.
pub fn backup_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// The set of templates managed by one agent, keyed by destination.
#[derive(Debug, Default, Clone)]
pub struct TemplateRegistry {
    specs: BTreeMap<PathBuf, Arc<TemplateSpec>>,
}

impl TemplateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a spec.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateDestination`] if another spec already
    /// writes the same file.
    pub fn register(&mut self, spec: TemplateSpec) -> Result<(), ConfigError> {
        if self.specs.contains_key(&spec.destination) {
            return Err(ConfigError::DuplicateDestination(spec.destination));
        }
        self.specs.insert(spec.destination.clone(), Arc::new(spec));
        Ok(())
    }

    /// Looks up a spec by destination.
    pub fn get(&self, destination: &Path) -> Option<&Arc<TemplateSpec>> {
        self.specs.get(destination)
    }

    /// Number of registered specs.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True if no specs are registered.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Iterates specs in destination order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TemplateSpec>> {
        self.specs.values()
    }

    /// Every distinct query across all specs.
    pub fn queries(&self) -> BTreeSet<KvQuery> {
        self.specs
            .values()
            .flat_map(|spec| spec.dependencies.iter().cloned())
            .collect()
    }

    /// Destinations of the specs that depend on `query`.
    pub fn dependents(&self, query: &KvQuery) -> Vec<&Path> {
        self.specs
            .values()
            .filter(|spec| spec.depends_on(query))
            .map(|spec| spec.destination.as_path())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateConfig;
    use test_case::test_case;

    fn spec(destination: &str, contents: &str) -> TemplateSpec {
        TemplateConfig::inline(destination, contents)
            .build(None)
            .expect("valid template")
    }

    // ==================== WaitConfig ====================

    #[test]
    fn test_wait_max_defaults_to_four_times_min() {
        let wait = WaitConfig::new(Duration::from_secs(2), None).expect("valid");
        assert_eq!(wait.max(), Duration::from_secs(8));
    }

    #[test]
    fn test_wait_rejects_max_below_min() {
        assert!(WaitConfig::new(Duration::from_secs(5), Some(Duration::from_secs(1))).is_err());
    }

    #[test_case("2s:10s", 2, 10 ; "min and max")]
    #[test_case("3s", 3, 12 ; "min only")]
    #[test_case("0s:0s", 0, 0 ; "immediate")]
    fn test_wait_parse(text: &str, min: u64, max: u64) {
        let wait = WaitConfig::parse(text).expect("valid");
        assert_eq!(wait.min(), Duration::from_secs(min));
        assert_eq!(wait.max(), Duration::from_secs(max));
    }

    #[test]
    fn test_wait_display_round_trips() {
        let wait = WaitConfig::parse("2s:10s").expect("valid");
        assert_eq!(wait.to_string(), "2s:10s");
        assert_eq!(WaitConfig::parse(&wait.to_string()).expect("reparse"), wait);
    }

    // ==================== FileMode ====================

    #[test_case("0550", 0o550)]
    #[test_case("640", 0o640)]
    #[test_case("0o755", 0o755)]
    #[test_case("4755", 0o4755)]
    fn test_file_mode_parse(text: &str, bits: u32) {
        assert_eq!(FileMode::parse(text).expect("valid").bits(), bits);
    }

    #[test_case("0999" ; "non octal digit")]
    #[test_case("17777" ; "out of range")]
    #[test_case("rw-r--r--" ; "symbolic")]
    fn test_file_mode_rejects(text: &str) {
        assert!(FileMode::parse(text).is_err());
    }

    #[test]
    fn test_file_mode_display() {
        assert_eq!(FileMode::new(0o550).expect("valid").to_string(), "0550");
    }

    // ==================== Registry ====================

    #[test]
    fn test_backup_path_appends_suffix() {
        assert_eq!(
            backup_path(Path::new("/etc/vault/conf.d/region.hcl")),
            PathBuf::from("/etc/vault/conf.d/region.hcl.bak")
        );
    }

    #[test]
    fn test_registry_rejects_duplicate_destination() {
        let mut registry = TemplateRegistry::new();
        registry.register(spec("/tmp/a.conf", "a")).expect("first");
        let err = registry
            .register(spec("/tmp/a.conf", "b"))
            .expect_err("duplicate");
        assert!(matches!(err, ConfigError::DuplicateDestination(_)));
    }

    #[test]
    fn test_registry_tracks_dependents() {
        let mut registry = TemplateRegistry::new();
        registry
            .register(spec("/tmp/a.conf", "{{ key \"shared\" }} {{ key \"only/a\" }}"))
            .expect("a");
        registry
            .register(spec("/tmp/b.conf", "{{ key \"shared\" }}"))
            .expect("b");

        let shared = KvQuery::key("shared").expect("valid");
        let only_a = KvQuery::key("only/a").expect("valid");

        assert_eq!(registry.queries().len(), 2);
        assert_eq!(
            registry.dependents(&shared),
            vec![Path::new("/tmp/a.conf"), Path::new("/tmp/b.conf")]
        );
        assert_eq!(registry.dependents(&only_a), vec![Path::new("/tmp/a.conf")]);
    }
}
