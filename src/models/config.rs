//! Configuration models for pledgerun.
//!
//! All I^R (resolvable ignorance) is parameterized here: which page to drive,
//! how to find its fields, and how patient to be with it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for pledgerun.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Row source settings
    #[serde(default)]
    pub input: InputConfig,

    /// Checkpoint file settings
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Browser connection settings
    #[serde(default)]
    pub browser: BrowserConfig,

    /// Target page description
    #[serde(default)]
    pub target: TargetConfig,

    /// Submission loop tunables
    #[serde(default)]
    pub run: RunConfig,
}

/// Input CSV configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Headerless CSV: column 0 = phone, column 1 = pledge
    #[serde(default = "default_csv")]
    pub csv: PathBuf,
}

fn default_csv() -> PathBuf {
    PathBuf::from("rows.csv")
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { csv: default_csv() }
    }
}

/// Checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// JSON file holding RowKey → entry
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("processed.json")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
        }
    }
}

/// Browser connection configuration.
///
/// K_i: The browser is already running with `--remote-debugging-port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// DevTools HTTP endpoint (supports ${ENV_VAR})
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Timeout for a single navigation in seconds
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout_secs: u64,

    /// Timeout for a single CDP command in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Attempts for the initial navigation/reload of a page
    #[serde(default = "default_navigation_attempts")]
    pub navigation_attempts: u32,
}

fn default_endpoint() -> String {
    "http://localhost:9222".to_string()
}

fn default_navigation_timeout() -> u64 {
    45
}

fn default_command_timeout() -> u64 {
    30
}

fn default_navigation_attempts() -> u32 {
    2
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            navigation_timeout_secs: default_navigation_timeout(),
            command_timeout_secs: default_command_timeout(),
            navigation_attempts: default_navigation_attempts(),
        }
    }
}

/// Description of the target form page.
///
/// B_i: Field names differ across pages, so every locator is an ordered
/// list of CSS selectors tried first to last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Page URL (supports ${ENV_VAR})
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_phone_selectors")]
    pub phone_selectors: Vec<String>,

    #[serde(default = "default_pledge_selectors")]
    pub pledge_selectors: Vec<String>,

    #[serde(default = "default_consent_selectors")]
    pub consent_selectors: Vec<String>,

    #[serde(default = "default_submit_selectors")]
    pub submit_selectors: Vec<String>,

    /// Selection controls that get a random non-empty option
    #[serde(default = "default_select_selector")]
    pub select_selector: String,

    /// URL fragment of the submission endpoint whose JSON carries `success`
    #[serde(default = "default_success_endpoint")]
    pub success_endpoint: String,

    /// Elements that become visible after a successful submission
    #[serde(default = "default_success_selectors")]
    pub success_selectors: Vec<String>,

    /// Case-insensitive body text that signals success
    #[serde(default = "default_success_text")]
    pub success_text: String,

    /// Case-insensitive body text that signals a verification challenge
    #[serde(default = "default_challenge_markers")]
    pub challenge_markers: Vec<String>,

    /// Frame URL fragment that signals a verification challenge
    #[serde(default = "default_challenge_frame")]
    pub challenge_frame: String,
}

fn default_phone_selectors() -> Vec<String> {
    vec![
        "#phone".to_string(),
        "input[name='phone']".to_string(),
        "input[type='tel']".to_string(),
    ]
}

fn default_pledge_selectors() -> Vec<String> {
    vec!["#pledge".to_string(), "textarea".to_string()]
}

fn default_consent_selectors() -> Vec<String> {
    vec!["#terms".to_string(), "input[type='checkbox']".to_string()]
}

fn default_submit_selectors() -> Vec<String> {
    vec![
        "#submitBtn".to_string(),
        "button[type='submit']".to_string(),
        "input[type='submit']".to_string(),
    ]
}

fn default_select_selector() -> String {
    "select".to_string()
}

fn default_success_endpoint() -> String {
    "action=submit".to_string()
}

fn default_success_selectors() -> Vec<String> {
    vec!["#pledgeSuccess".to_string()]
}

fn default_success_text() -> String {
    "pledge submitted successfully".to_string()
}

fn default_challenge_markers() -> Vec<String> {
    vec![
        "captcha".to_string(),
        "verify you are human".to_string(),
        "i'm not a robot".to_string(),
    ]
}

fn default_challenge_frame() -> String {
    "recaptcha".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            phone_selectors: default_phone_selectors(),
            pledge_selectors: default_pledge_selectors(),
            consent_selectors: default_consent_selectors(),
            submit_selectors: default_submit_selectors(),
            select_selector: default_select_selector(),
            success_endpoint: default_success_endpoint(),
            success_selectors: default_success_selectors(),
            success_text: default_success_text(),
            challenge_markers: default_challenge_markers(),
            challenge_frame: default_challenge_frame(),
        }
    }
}

/// How the pause between attempts grows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same pause before every retry
    #[default]
    Fixed,
    /// Pause doubles with every retry
    Exponential,
}

/// Submission loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum attempts per row
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,

    /// How long to wait for a success signal after submitting
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,

    /// Poll interval for the indicator and body-text checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lower bound of the random pause after a successful row
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,

    /// Upper bound of the random pause after a successful row
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Wall-clock budget; no new row starts after it is spent
    #[serde(default = "default_max_runtime")]
    pub max_runtime_secs: u64,

    /// Directory for error screenshots and page dumps
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Whether to write diagnostics on failed attempts
    #[serde(default = "default_true")]
    pub capture_diagnostics: bool,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    3000
}

fn default_confirmation_timeout() -> u64 {
    15
}

fn default_poll_interval() -> u64 {
    500
}

fn default_min_delay() -> u64 {
    2000
}

fn default_max_delay() -> u64 {
    4000
}

fn default_max_runtime() -> u64 {
    // 5h50m
    5 * 3600 + 50 * 60
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_true() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            backoff: Backoff::default(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            poll_interval_ms: default_poll_interval(),
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            max_runtime_secs: default_max_runtime(),
            log_dir: default_log_dir(),
            capture_diagnostics: default_true(),
        }
    }
}

impl RunConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })?;
        config.target.url = expand_env_vars(&config.target.url);
        config.browser.endpoint = expand_env_vars(&config.browser.endpoint);
        Ok(config)
    }

    /// Reject values the submission loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.url.trim().is_empty() {
            return Err(ConfigError::Invalid("target.url must be set".to_string()));
        }
        if self.run.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "run.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.run.min_delay_ms > self.run.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "run.min_delay_ms ({}) exceeds run.max_delay_ms ({})",
                self.run.min_delay_ms, self.run.max_delay_ms
            )));
        }
        let locators = [
            ("target.phone_selectors", &self.target.phone_selectors),
            ("target.pledge_selectors", &self.target.pledge_selectors),
            ("target.submit_selectors", &self.target.submit_selectors),
        ];
        for (name, selectors) in locators {
            if selectors.is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_behavior() {
        let config = Config::from_toml("[target]\nurl = \"https://example.com/form\"\n").unwrap();
        assert_eq!(config.run.max_attempts, 2);
        assert_eq!(config.run.confirmation_timeout(), Duration::from_secs(15));
        assert_eq!(config.run.max_runtime(), Duration::from_secs(21_000));
        assert_eq!(config.target.phone_selectors[0], "#phone");
        assert_eq!(config.run.backoff, Backoff::Fixed);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.validate().is_err(), "missing url");

        config.target.url = "https://example.com".to_string();
        config.run.max_attempts = 0;
        assert!(config.validate().is_err());

        config.run.max_attempts = 2;
        config.run.min_delay_ms = 5000;
        config.run.max_delay_ms = 1000;
        assert!(config.validate().is_err());

        config.run.max_delay_ms = 5000;
        config.target.submit_selectors.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("PLEDGERUN_TEST_HOST", "forms.example.org");
        let config = Config::from_toml(
            "[target]\nurl = \"https://${PLEDGERUN_TEST_HOST}/pledge\"\n[run]\nbackoff = \"exponential\"\n",
        )
        .unwrap();
        assert_eq!(config.target.url, "https://forms.example.org/pledge");
        assert_eq!(config.run.backoff, Backoff::Exponential);

        assert_eq!(expand_env_vars("${PLEDGERUN_UNSET_VAR}"), "${PLEDGERUN_UNSET_VAR}");
    }
}
