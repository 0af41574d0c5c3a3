//! Interceptor configuration
//!
//! Static values come from a YAML, TOML or JSON file (with `${VAR}` and
//! `${VAR:-default}` expansion). Environment overrides, when present,
//! win over the static values.

use crate::error::ScriptError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sluice_core::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "SLUICE_";

/// Interceptor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptConfig {
    /// Interceptor name, matched by debug selectors
    #[serde(default = "default_name")]
    pub name: String,

    /// Engine source root
    #[serde(default)]
    pub home: Option<PathBuf>,

    /// Ordered module search roots, relative to `home`
    #[serde(default = "default_module_path")]
    pub module_path: Vec<String>,

    /// Entry module identifier
    #[serde(default = "default_module")]
    pub module: String,

    /// Entry function identifier
    #[serde(default = "default_function")]
    pub function: String,

    /// Reload-detection target (defaults to the parent of `home`)
    #[serde(default)]
    pub watched_path: Option<PathBuf>,

    /// Engine optimization level (`<0` none, `0` simple, `>0` full)
    #[serde(default)]
    pub optimization_level: i32,

    /// Route script output to the log at higher verbosity
    #[serde(default)]
    pub debug_mode: bool,

    /// Disable reload checks and relax variable strictness
    #[serde(default)]
    pub production_mode: bool,

    /// Legacy scripts: relax variable strictness
    #[serde(default)]
    pub legacy_mode: bool,

    /// Include script stacks in failure logs
    #[serde(default)]
    pub verbose: bool,

    /// Construct the engine when the interceptor starts
    #[serde(default = "default_true")]
    pub load_on_startup: bool,

    /// Operation budget per script invocation
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    /// Query parameter that opts a request out of response capture
    #[serde(default = "default_capture_param")]
    pub capture_param: String,
}

fn default_name() -> String {
    "sluice".to_string()
}

fn default_module_path() -> Vec<String> {
    vec!["app".to_string()]
}

fn default_module() -> String {
    "config".to_string()
}

fn default_function() -> String {
    "app".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_operations() -> u64 {
    1_000_000
}

fn default_capture_param() -> String {
    "capture".to_string()
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            home: None,
            module_path: default_module_path(),
            module: default_module(),
            function: default_function(),
            watched_path: None,
            optimization_level: 0,
            debug_mode: false,
            production_mode: false,
            legacy_mode: false,
            verbose: false,
            load_on_startup: true,
            max_operations: default_max_operations(),
            capture_param: default_capture_param(),
        }
    }
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML
    Yaml,
    /// TOML
    Toml,
    /// JSON
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            other => Err(Error::Config(format!(
                "Unsupported config format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }
}

/// Engine settings derived from a configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Resolved (symlink-expanded) engine home
    pub home: PathBuf,
    /// Module search roots in lookup order
    pub module_roots: Vec<PathBuf>,
    /// Entry module identifier
    pub module: String,
    /// Entry function identifier
    pub function: String,
    /// Engine optimization level
    pub optimization_level: i32,
    /// Debug output
    pub debug: bool,
    /// Verbose failure logging
    pub verbose: bool,
    /// Reject undeclared variables at compile time
    pub strict_variables: bool,
    /// Operation budget per invocation
    pub max_operations: u64,
}

impl InterceptConfig {
    /// Create a configuration for an engine home
    pub fn new<P: Into<PathBuf>>(home: P) -> Self {
        Self {
            home: Some(home.into()),
            ..Self::default()
        }
    }

    /// Load from a file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;
        let mut config = Self::from_str_with_format(&content, ConfigFormat::from_path(path)?)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse from a string (no environment overrides)
    pub fn from_str_with_format(content: &str, format: ConfigFormat) -> Result<Self> {
        let expanded = expand_env_vars(content, |name| std::env::var(name).ok())?;

        let config = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(&expanded)
                .map_err(|e| Error::Config(format!("Failed to parse YAML: {e}")))?,
            ConfigFormat::Toml => toml::from_str(&expanded)
                .map_err(|e| Error::Config(format!("Failed to parse TOML: {e}")))?,
            ConfigFormat::Json => serde_json::from_str(&expanded)
                .map_err(|e| Error::Config(format!("Failed to parse JSON: {e}")))?,
        };

        Ok(config)
    }

    /// Check structural validity
    pub fn validate(&self) -> Result<()> {
        if self.module.trim().is_empty() {
            return Err(Error::Config("module must not be empty".to_string()));
        }
        if self.function.trim().is_empty() {
            return Err(Error::Config("function must not be empty".to_string()));
        }
        if self.module_path.is_empty() {
            return Err(Error::Config("modulePath must list at least one root".to_string()));
        }
        if self.max_operations == 0 {
            return Err(Error::Config("maxOperations must be positive".to_string()));
        }
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// Keys are the `SLUICE_*` names listed in the crate documentation.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(home) = var("HOME") {
            let home = PathBuf::from(home);
            if home.exists() {
                info!(home = %home.display(), "Engine home set from environment");
                self.home = Some(home);
            } else {
                warn!(
                    home = %home.display(),
                    "Engine home from environment does not exist, keeping configured value"
                );
            }
        }

        if let Some(module_path) = var("MODULE_PATH") {
            self.module_path = split_list(&module_path);
        }

        if let Some(watched) = var("WATCHED_PATH") {
            self.watched_path = Some(PathBuf::from(watched));
        }

        if let Some(level) = var("OPTLEVEL") {
            match level.trim().parse::<i32>() {
                Ok(level) => self.optimization_level = level,
                Err(_) => error!(value = %level, "Invalid value for optimization level"),
            }
        }

        if let Some(debug_setting) = var("DEBUG") {
            info!(setting = %debug_setting, "Debug setting from environment");
            self.debug_mode = match parse_flag(&debug_setting) {
                Some(flag) => flag,
                None => {
                    let name = self.name.to_lowercase();
                    split_list(&debug_setting)
                        .iter()
                        .any(|selector| name.contains(&selector.to_lowercase()))
                }
            };
        }

        apply_flag(var("PRODUCTION"), "production", &mut self.production_mode);
        apply_flag(var("LEGACY_MODE"), "legacy mode", &mut self.legacy_mode);
        apply_flag(var("VERBOSE"), "verbose", &mut self.verbose);
        apply_flag(var("LOAD_ON_STARTUP"), "load on startup", &mut self.load_on_startup);
    }

    /// Whether staleness checks run
    pub fn reload_enabled(&self) -> bool {
        !self.production_mode
    }

    /// Resolve the engine home to its canonical, symlink-expanded form
    pub fn resolve_home(&self) -> std::result::Result<PathBuf, ScriptError> {
        let home = self
            .home
            .as_ref()
            .ok_or_else(|| ScriptError::invalid_source("no engine home configured"))?;

        home.canonicalize().map_err(|e| {
            ScriptError::invalid_source(format!(
                "engine home {} is not usable: {}",
                home.display(),
                e
            ))
        })
    }

    /// Resolve the reload-detection target for a resolved home
    ///
    /// Returns `None` (reload detection disabled) when the target does not exist.
    pub fn resolve_watched_path(&self, home: &Path) -> Option<PathBuf> {
        let candidate = match &self.watched_path {
            Some(path) => path.clone(),
            None => home.parent().map(Path::to_path_buf)?,
        };

        match candidate.canonicalize() {
            Ok(resolved) => {
                info!(
                    path = %resolved.display(),
                    "Monitoring path to detect newly deployed scripts"
                );
                Some(resolved)
            }
            Err(_) => {
                warn!(
                    path = %candidate.display(),
                    "Watched path does not exist, reload detection disabled"
                );
                None
            }
        }
    }

    /// Derive the engine settings, resolving the home directory
    pub fn engine_settings(&self) -> std::result::Result<EngineSettings, ScriptError> {
        let home = self.resolve_home()?;
        let module_roots = self.module_path.iter().map(|root| home.join(root)).collect();

        Ok(EngineSettings {
            home,
            module_roots,
            module: self.module.clone(),
            function: self.function.clone(),
            optimization_level: self.optimization_level,
            debug: self.debug_mode,
            verbose: self.verbose,
            strict_variables: !self.legacy_mode && !self.production_mode,
            max_operations: self.max_operations,
        })
    }

    /// Set the reload-detection target
    pub fn with_watched_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.watched_path = Some(path.into());
        self
    }

    /// Enable production mode
    pub fn production(mut self) -> Self {
        self.production_mode = true;
        self
    }

    /// Defer engine construction to the first request
    pub fn lazy(mut self) -> Self {
        self.load_on_startup = false;
        self
    }
}

/// Parse `true/1/on` and `false/0/off`
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "on" => Some(true),
        "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn apply_flag(value: Option<String>, what: &str, target: &mut bool) {
    if let Some(value) = value {
        match parse_flag(&value) {
            Some(flag) => *target = flag,
            None => error!(setting = what, value = %value, "Invalid boolean value"),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand `${VAR}` and `${VAR:-default}` references
fn expand_env_vars<F>(content: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| Error::Config(format!("Invalid regex: {e}")))?;

    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();

        let value = match (lookup(var_name), cap.get(3)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                return Err(Error::Config(format!(
                    "Environment variable '{var_name}' not set and no default provided"
                )));
            }
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);
    Ok(result)
}
