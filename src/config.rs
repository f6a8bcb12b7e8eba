//! Configuration for codeport.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CODEPORT_HOME, CODEPORT_OUTPUT_ROOT,
//!    CODEPORT_PROVIDER_COMMAND)
//! 2. Config file (.codeport/config.yaml, or `--config`)
//! 3. Defaults (~/.codeport, ./translated)
//!
//! Config file discovery:
//! - Searches current directory and parents for .codeport/config.yaml
//! - `paths.home` is relative to the .codeport directory, `paths.output_root`
//!   to the directory containing it
//!
//! Settings are resolved once and passed explicitly; nothing is cached
//! globally.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::ProviderSettings;
use crate::core::executor::ExecutorSettings;
use crate::core::pipeline::StageSettings;
use crate::core::safety::StageLimits;
use crate::domain::project_identifier;
use crate::error::PipelineError;

/// Default output root, relative to the working directory
pub const DEFAULT_OUTPUT_ROOT: &str = "translated";

/// Target languages accepted when the config file does not override them
pub const DEFAULT_LANGUAGES: &[&str] = &[
    "c",
    "cpp",
    "csharp",
    "go",
    "java",
    "javascript",
    "kotlin",
    "python",
    "ruby",
    "rust",
    "scala",
    "swift",
    "typescript",
];

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub limits: StageLimits,
    #[serde(default)]
    pub stages: StageSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to the .codeport directory)
    pub home: Option<String>,
    /// Root for translated output (relative to the config's project root)
    pub output_root: Option<String>,
}

/// Environment overrides, read once at load time
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub provider_command: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var("CODEPORT_HOME").ok().map(PathBuf::from),
            output_root: std::env::var("CODEPORT_OUTPUT_ROOT").ok().map(PathBuf::from),
            provider_command: std::env::var("CODEPORT_PROVIDER_COMMAND").ok(),
        }
    }
}

/// Fully resolved, immutable settings
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Engine state directory (database, locks)
    pub home: PathBuf,
    /// Directory under which per-project output directories are created
    pub output_root: PathBuf,
    pub executor: ExecutorSettings,
    pub limits: StageLimits,
    pub stages: StageSettings,
    pub provider: ProviderSettings,
    /// Supported target languages
    pub languages: Vec<String>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Settings {
    /// Defaults rooted at `home`
    pub fn for_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            executor: ExecutorSettings::default(),
            limits: StageLimits::default(),
            stages: StageSettings::default(),
            provider: ProviderSettings::default(),
            languages: DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect(),
            config_file: None,
        }
    }

    /// Load settings from the given or discovered config file plus the
    /// environment
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".codeport");

        let config_path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(),
        };
        let config = config_path
            .as_deref()
            .map(|path| load_config_file(path).map(|config| (path, config)))
            .transpose()?;

        let settings = Self::resolve(config, EnvOverrides::from_env(), default_home);
        settings.validate().context("Invalid configuration")?;
        Ok(settings)
    }

    /// Combine a parsed config file, environment overrides and defaults
    pub fn resolve(
        config: Option<(&Path, ConfigFile)>,
        env: EnvOverrides,
        default_home: PathBuf,
    ) -> Self {
        let mut settings = Self::for_home(default_home);

        if let Some((config_path, config)) = config {
            // .codeport/ and the directory that contains it
            let codeport_dir = config_path.parent().unwrap_or(Path::new("."));
            let base_dir = codeport_dir.parent().unwrap_or(Path::new("."));

            if let Some(ref home) = config.paths.home {
                settings.home = resolve_path(codeport_dir, home);
            }
            if let Some(ref output_root) = config.paths.output_root {
                settings.output_root = resolve_path(base_dir, output_root);
            }
            settings.executor = config.executor;
            settings.limits = config.limits;
            settings.stages = config.stages;
            settings.provider = config.provider;
            if let Some(languages) = config.languages {
                settings.languages = languages
                    .iter()
                    .map(|l| normalize_language(l))
                    .collect();
            }
            settings.config_file = Some(config_path.to_path_buf());
        }

        if let Some(home) = env.home {
            settings.home = home;
        }
        if let Some(output_root) = env.output_root {
            settings.output_root = output_root;
        }
        if let Some(command) = env.provider_command {
            settings.provider.command = command;
        }

        settings
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |message: String| Err(PipelineError::Configuration(message));

        if self.executor.max_concurrency == 0 {
            return invalid("executor.max_concurrency must be at least 1".to_string());
        }
        if self.executor.rate_limit.calls == 0 || self.executor.rate_limit.window_seconds == 0 {
            return invalid("executor.rate_limit needs calls >= 1 and window_seconds >= 1".to_string());
        }
        if self.executor.retry.max_attempts == 0 {
            return invalid("executor.retry.max_attempts must be at least 1".to_string());
        }
        if self.executor.retry.backoff_multiplier < 1.0 {
            return invalid("executor.retry.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.limits.call_timeout_seconds == 0 || self.limits.stage_timeout_seconds == 0 {
            return invalid("limits timeouts must be at least one second".to_string());
        }
        if self.provider.command.trim().is_empty() {
            return invalid("provider.command cannot be empty".to_string());
        }
        if self.languages.is_empty() {
            return invalid("languages cannot be empty".to_string());
        }
        for language in &self.languages {
            if language.is_empty() || language.contains('-') || language.contains('/') {
                return invalid(format!(
                    "language identifier '{}' must be non-empty and contain no '-' or '/'",
                    language
                ));
            }
        }
        Ok(())
    }

    /// Normalize and check a requested target language
    pub fn check_language(&self, requested: &str) -> Result<String, PipelineError> {
        let language = normalize_language(requested);
        if self.languages.iter().any(|l| *l == language) {
            Ok(language)
        } else {
            Err(PipelineError::Configuration(format!(
                "unsupported target language '{}' (supported: {})",
                requested,
                self.languages.join(", ")
            )))
        }
    }

    /// Output directory for a project: the explicit path when given, else
    /// `{output_root}/{name}-{target_language}`
    pub fn output_path(&self, explicit: Option<&Path>, name: &str, target_language: &str) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None => self
                .output_root
                .join(project_identifier(name, target_language)),
        }
    }

    /// SQLite database holding projects and checkpoints
    pub fn database_path(&self) -> PathBuf {
        self.home.join("codeport.db")
    }

    /// Directory of per-project run locks
    pub fn lock_dir(&self) -> PathBuf {
        self.home.join("locks")
    }
}

fn normalize_language(language: &str) -> String {
    language.trim().to_lowercase()
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".codeport").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}
