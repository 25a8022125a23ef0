use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub wa: WaConfig,
    pub crm: CrmConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WaConfig {
    /// Base URL of the WA provider (Evolution-style gateway).
    pub base_url: String,
    pub api_key: SecretString,
    /// Fallback webhook secret for instances without a per-instance secret.
    pub default_webhook_secret: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Connector identity registered with the CRM platform.
    pub connector_code: String,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Connection status poll cadence per pairing instance.
    pub poll_interval_secs: u64,
    /// Total polling budget before a pairing attempt goes quiet.
    pub poll_budget_secs: u64,
    /// Cadence of the background credential refresh sweep.
    pub refresh_sweep_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub wa_base_url: Option<String>,
    pub wa_api_key: Option<String>,
    pub crm_client_id: Option<String>,
    pub crm_client_secret: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://waline.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            wa: WaConfig {
                base_url: "http://127.0.0.1:8085".to_string(),
                api_key: String::new().into(),
                default_webhook_secret: None,
                request_timeout_secs: 15,
            },
            crm: CrmConfig {
                client_id: String::new(),
                client_secret: String::new().into(),
                connector_code: "waline_connector".to_string(),
                request_timeout_secs: 15,
            },
            relay: RelayConfig {
                poll_interval_secs: 5,
                poll_budget_secs: 180,
                refresh_sweep_secs: 300,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("waline.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(wa) = patch.wa {
            if let Some(base_url) = wa.base_url {
                self.wa.base_url = base_url;
            }
            if let Some(api_key) = wa.api_key {
                self.wa.api_key = api_key.into();
            }
            if let Some(default_webhook_secret) = wa.default_webhook_secret {
                self.wa.default_webhook_secret = Some(default_webhook_secret);
            }
            if let Some(request_timeout_secs) = wa.request_timeout_secs {
                self.wa.request_timeout_secs = request_timeout_secs;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(client_id) = crm.client_id {
                self.crm.client_id = client_id;
            }
            if let Some(client_secret) = crm.client_secret {
                self.crm.client_secret = client_secret.into();
            }
            if let Some(connector_code) = crm.connector_code {
                self.crm.connector_code = connector_code;
            }
            if let Some(request_timeout_secs) = crm.request_timeout_secs {
                self.crm.request_timeout_secs = request_timeout_secs;
            }
        }

        if let Some(relay) = patch.relay {
            if let Some(poll_interval_secs) = relay.poll_interval_secs {
                self.relay.poll_interval_secs = poll_interval_secs;
            }
            if let Some(poll_budget_secs) = relay.poll_budget_secs {
                self.relay.poll_budget_secs = poll_budget_secs;
            }
            if let Some(refresh_sweep_secs) = relay.refresh_sweep_secs {
                self.relay.refresh_sweep_secs = refresh_sweep_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("WALINE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("WALINE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("WALINE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("WALINE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("WALINE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("WALINE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("WALINE_SERVER_PORT") {
            self.server.port = parse_u16("WALINE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("WALINE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("WALINE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("WALINE_WA_BASE_URL") {
            self.wa.base_url = value;
        }
        if let Some(value) = read_env("WALINE_WA_API_KEY") {
            self.wa.api_key = value.into();
        }
        if let Some(value) = read_env("WALINE_WA_WEBHOOK_SECRET") {
            self.wa.default_webhook_secret = Some(value);
        }
        if let Some(value) = read_env("WALINE_WA_REQUEST_TIMEOUT_SECS") {
            self.wa.request_timeout_secs = parse_u64("WALINE_WA_REQUEST_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("WALINE_CRM_CLIENT_ID") {
            self.crm.client_id = value;
        }
        if let Some(value) = read_env("WALINE_CRM_CLIENT_SECRET") {
            self.crm.client_secret = value.into();
        }
        if let Some(value) = read_env("WALINE_CRM_CONNECTOR_CODE") {
            self.crm.connector_code = value;
        }
        if let Some(value) = read_env("WALINE_CRM_REQUEST_TIMEOUT_SECS") {
            self.crm.request_timeout_secs = parse_u64("WALINE_CRM_REQUEST_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("WALINE_RELAY_POLL_INTERVAL_SECS") {
            self.relay.poll_interval_secs = parse_u64("WALINE_RELAY_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("WALINE_RELAY_POLL_BUDGET_SECS") {
            self.relay.poll_budget_secs = parse_u64("WALINE_RELAY_POLL_BUDGET_SECS", &value)?;
        }
        if let Some(value) = read_env("WALINE_RELAY_REFRESH_SWEEP_SECS") {
            self.relay.refresh_sweep_secs = parse_u64("WALINE_RELAY_REFRESH_SWEEP_SECS", &value)?;
        }

        let log_level = read_env("WALINE_LOGGING_LEVEL").or_else(|| read_env("WALINE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("WALINE_LOGGING_FORMAT").or_else(|| read_env("WALINE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(wa_base_url) = overrides.wa_base_url {
            self.wa.base_url = wa_base_url;
        }
        if let Some(wa_api_key) = overrides.wa_api_key {
            self.wa.api_key = wa_api_key.into();
        }
        if let Some(crm_client_id) = overrides.crm_client_id {
            self.crm.client_id = crm_client_id;
        }
        if let Some(crm_client_secret) = overrides.crm_client_secret {
            self.crm.client_secret = crm_client_secret.into();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_wa(&self.wa)?;
        validate_crm(&self.crm)?;
        validate_relay(&self.relay)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("waline.toml"), PathBuf::from("config/waline.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url = url.starts_with("sqlite:") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...` or `:memory:`)".to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_wa(wa: &WaConfig) -> Result<(), ConfigError> {
    if !wa.base_url.starts_with("http://") && !wa.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "wa.base_url must start with http:// or https://".to_string(),
        ));
    }

    if wa.api_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "wa.api_key is required. Use the global api key configured on the WA gateway"
                .to_string(),
        ));
    }

    if wa.request_timeout_secs == 0 || wa.request_timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "wa.request_timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if let Some(secret) = &wa.default_webhook_secret {
        if secret.len() < 16 {
            return Err(ConfigError::Validation(
                "wa.default_webhook_secret must be at least 16 characters".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if crm.client_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "crm.client_id is required. Register the connector application with the CRM first"
                .to_string(),
        ));
    }

    if crm.client_secret.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation("crm.client_secret is required".to_string()));
    }

    if crm.connector_code.trim().is_empty() {
        return Err(ConfigError::Validation("crm.connector_code must not be empty".to_string()));
    }

    if crm.request_timeout_secs == 0 || crm.request_timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "crm.request_timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    Ok(())
}

fn validate_relay(relay: &RelayConfig) -> Result<(), ConfigError> {
    if relay.poll_interval_secs == 0 || relay.poll_interval_secs > 60 {
        return Err(ConfigError::Validation(
            "relay.poll_interval_secs must be in range 1..=60".to_string(),
        ));
    }

    if relay.poll_budget_secs < relay.poll_interval_secs {
        return Err(ConfigError::Validation(
            "relay.poll_budget_secs must be at least relay.poll_interval_secs".to_string(),
        ));
    }

    if relay.refresh_sweep_secs < 30 {
        return Err(ConfigError::Validation(
            "relay.refresh_sweep_secs must be at least 30".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    wa: Option<WaPatch>,
    crm: Option<CrmPatch>,
    relay: Option<RelayPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WaPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    default_webhook_secret: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    client_id: Option<String>,
    client_secret: Option<String>,
    connector_code: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RelayPatch {
    poll_interval_secs: Option<u64>,
    poll_budget_secs: Option<u64>,
    refresh_sweep_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    fn required_env() {
        env::set_var("WALINE_WA_API_KEY", "evo-global-key");
        env::set_var("WALINE_CRM_CLIENT_ID", "app.waline");
        env::set_var("WALINE_CRM_CLIENT_SECRET", "crm-secret");
    }

    const REQUIRED_VARS: &[&str] =
        &["WALINE_WA_API_KEY", "WALINE_CRM_CLIENT_ID", "WALINE_CRM_CLIENT_SECRET"];

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        required_env();
        env::set_var("TEST_WA_API_KEY", "evo-key-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("waline.toml");
            fs::write(
                &path,
                r#"
[wa]
api_key = "${TEST_WA_API_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            // The env override still wins; drop it so the file value shows.
            env::remove_var("WALINE_WA_API_KEY");

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.wa.api_key.expose_secret() == "evo-key-from-env",
                "api key should be interpolated from environment",
            )
        })();

        clear_vars(REQUIRED_VARS);
        clear_vars(&["TEST_WA_API_KEY"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        required_env();
        env::set_var("WALINE_DATABASE_URL", "sqlite://from-env.db");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("waline.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")
        })();

        clear_vars(REQUIRED_VARS);
        clear_vars(&["WALINE_DATABASE_URL"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("WALINE_CRM_CLIENT_ID", "app.waline");
        env::set_var("WALINE_CRM_CLIENT_SECRET", "crm-secret");
        env::remove_var("WALINE_WA_API_KEY");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("wa.api_key")
            );
            ensure(has_message, "validation failure should mention wa.api_key")
        })();

        clear_vars(REQUIRED_VARS);
        result
    }

    #[test]
    fn poll_budget_must_cover_at_least_one_interval() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        required_env();
        env::set_var("WALINE_RELAY_POLL_INTERVAL_SECS", "10");
        env::set_var("WALINE_RELAY_POLL_BUDGET_SECS", "5");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected poll budget validation failure".to_string()),
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("poll_budget_secs")
            );
            ensure(has_message, "validation failure should mention poll_budget_secs")
        })();

        clear_vars(REQUIRED_VARS);
        clear_vars(&["WALINE_RELAY_POLL_INTERVAL_SECS", "WALINE_RELAY_POLL_BUDGET_SECS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        required_env();
        env::set_var("WALINE_WA_API_KEY", "evo-secret-value");
        env::set_var("WALINE_CRM_CLIENT_SECRET", "crm-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("evo-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("crm-secret-value"),
                "debug output should not contain client secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(REQUIRED_VARS);
        result
    }
}
