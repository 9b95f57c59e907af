/*!
 * Configuration types for xingest
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::associate::AssociatedFiles;
use crate::core::identifier::{IdentifierExtractor, Template};
use crate::core::placement::LinkMode;
use crate::core::stage::StageOptions;
use crate::error::{IngestError, Result};
use crate::upload::package::PackagingMethod;
use crate::upload::retry::RetryPolicy;

/// Top-level configuration file: one table per run type
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stage: StageConfig,
    pub upload: UploadConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Where raw auxiliary files live and how their names are read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedFilesConfig {
    /// Logical type recorded for claimed files
    #[serde(default = "default_raw_type")]
    pub logical_type: String,

    /// Path glob; may contain `{Field}` placeholders rendered per session
    pub glob: String,

    /// Regular expression with `id` and `resource` named groups
    pub pattern: String,
}

impl AssociatedFilesConfig {
    pub fn compile(&self) -> Result<AssociatedFiles> {
        AssociatedFiles::new(&self.logical_type, &self.glob, &self.pattern)
    }
}

/// Configuration for staging runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Template rendering the subject id
    #[serde(default = "default_subject_template")]
    pub subject_template: String,

    /// Template rendering the session (accession/study) id
    #[serde(default = "default_session_template")]
    pub session_template: String,

    /// Sort key templates, tried in order
    #[serde(default = "default_sort_key_templates")]
    pub sort_key_templates: Vec<String>,

    /// Template rendering an item's correlation key for auxiliary files
    #[serde(default = "default_correlation_template")]
    pub correlation_template: Option<String>,

    /// Extra DICOM header keywords made available to templates
    #[serde(default)]
    pub extra_fields: Vec<String>,

    /// Project id recorded in each bundle manifest
    #[serde(default)]
    pub project: Option<String>,

    #[serde(default)]
    pub associated_files: Vec<AssociatedFilesConfig>,

    /// Remove sources once their staged copies are verified
    #[serde(default)]
    pub delete_source: bool,

    /// Stop after the first failed session
    #[serde(default)]
    pub fail_fast: bool,

    /// Plan only, write nothing
    #[serde(default)]
    pub dry_run: bool,

    /// Parallel session workers (0 = available parallelism)
    #[serde(default)]
    pub workers: usize,

    #[serde(default)]
    pub link_mode: LinkMode,

    /// Record SHA-256 digests in bundle manifests
    #[serde(default)]
    pub checksums: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            subject_template: default_subject_template(),
            session_template: default_session_template(),
            sort_key_templates: default_sort_key_templates(),
            correlation_template: default_correlation_template(),
            extra_fields: Vec::new(),
            project: None,
            associated_files: Vec::new(),
            delete_source: false,
            fail_fast: false,
            dry_run: false,
            workers: 0,
            link_mode: LinkMode::default(),
            checksums: false,
        }
    }
}

impl StageConfig {
    /// Parse every template and compile every pattern
    pub fn validate(&self) -> Result<()> {
        self.extractor()?;
        self.associated()?;
        Ok(())
    }

    pub fn extractor(&self) -> Result<IdentifierExtractor> {
        let subject = Template::parse(&self.subject_template)?;
        let session = Template::parse(&self.session_template)?;
        if !subject.has_placeholders() && !session.has_placeholders() {
            return Err(IngestError::Config(
                "subject and session templates are both constant; every file would share one session"
                    .to_string(),
            ));
        }

        let sort_keys = self
            .sort_key_templates
            .iter()
            .map(|t| Template::parse(t))
            .collect::<Result<Vec<_>>>()?;

        let mut extractor = IdentifierExtractor::new(subject, session).with_sort_keys(sort_keys);
        if let Some(correlation) = &self.correlation_template {
            extractor = extractor.with_correlation(Template::parse(correlation)?);
        }
        Ok(extractor)
    }

    pub fn associated(&self) -> Result<Vec<AssociatedFiles>> {
        self.associated_files.iter().map(|a| a.compile()).collect()
    }

    pub fn stage_options(&self) -> StageOptions {
        StageOptions {
            delete_source: self.delete_source,
            fail_fast: self.fail_fast,
            dry_run: self.dry_run,
            workers: self.workers,
            checksums: self.checksums,
            project: self.project.clone(),
        }
    }
}

/// Configuration for upload runs
#[derive(Debug, Deserialize)]
pub struct UploadConfig {
    /// Base URL of the remote repository
    #[serde(default)]
    pub server: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,

    /// Project override; defaults to the project recorded in each bundle
    #[serde(default)]
    pub project: Option<String>,

    /// TOML file with `[[columns]]` definitions
    #[serde(default)]
    pub columns_file: Option<PathBuf>,

    /// Logical types uploaded even without a matching column
    #[serde(default)]
    pub always_include: Vec<String>,

    /// Abort the run on the first failed unit
    #[serde(default)]
    pub fail_fast: bool,

    /// Exit non-zero when any unit failed
    #[serde(default = "default_true")]
    pub partial_failure_is_error: bool,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Seconds to wait before polling for processing completion
    #[serde(default = "default_wait_period")]
    pub wait_period_secs: u64,

    /// Maximum status polls per transfer unit
    #[serde(default = "default_confirm_polls")]
    pub confirm_polls: u32,

    /// Seconds between status polls
    #[serde(default = "default_confirm_interval")]
    pub confirm_interval_secs: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Sessions uploaded concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub packaging: PackagingMethod,

    /// Resource label for primary series files
    #[serde(default = "default_primary_resource")]
    pub primary_resource: String,

    /// Remove a bundle once all its units are confirmed or skipped
    #[serde(default)]
    pub remove_after_upload: bool,

    /// Directory for packaged archives (system temp if unset)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            server: None,
            user: None,
            password: None,
            project: None,
            columns_file: None,
            always_include: Vec::new(),
            fail_fast: false,
            partial_failure_is_error: true,
            retry: RetryPolicy::default(),
            wait_period_secs: default_wait_period(),
            confirm_polls: default_confirm_polls(),
            confirm_interval_secs: default_confirm_interval(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            concurrency: default_concurrency(),
            packaging: PackagingMethod::default(),
            primary_resource: default_primary_resource(),
            remove_after_upload: false,
            temp_dir: None,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server.as_deref().map_or(true, str::is_empty) {
            return Err(IngestError::Config("no server configured".to_string()));
        }
        if self.user.is_none() || self.password.is_none() {
            return Err(IngestError::Config("credentials are required for upload".to_string()));
        }
        if self.concurrency == 0 {
            return Err(IngestError::Config("concurrency must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(IngestError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(IngestError::Config(format!(
                "retry.jitter_factor must be between 0.0 and 1.0, got {}",
                self.retry.jitter_factor
            )));
        }
        if self.primary_resource.trim().is_empty() {
            return Err(IngestError::Config("primary_resource cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn wait_period(&self) -> Duration {
        Duration::from_secs(self.wait_period_secs)
    }

    pub fn confirm_interval(&self) -> Duration {
        Duration::from_secs(self.confirm_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// JSON log file (None = console only)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn deserialize_secret<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<SecretString>, D::Error> {
    let value: Option<String> = Option::deserialize(d)?;
    Ok(value.map(|p| SecretString::new(p.into_boxed_str())))
}

fn default_true() -> bool {
    true
}

fn default_raw_type() -> String {
    "application/octet-stream".to_string()
}

fn default_subject_template() -> String {
    "{PatientID}".to_string()
}

fn default_session_template() -> String {
    "{AccessionNumber}".to_string()
}

fn default_sort_key_templates() -> Vec<String> {
    vec![
        "{AcquisitionDate}{AcquisitionTime}".to_string(),
        "{SeriesDate}{SeriesTime}".to_string(),
    ]
}

fn default_correlation_template() -> Option<String> {
    Some("{SeriesNumber}".to_string())
}

fn default_wait_period() -> u64 {
    10
}

fn default_confirm_polls() -> u32 {
    6
}

fn default_confirm_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_concurrency() -> usize {
    2
}

fn default_primary_resource() -> String {
    "DICOM".to_string()
}
