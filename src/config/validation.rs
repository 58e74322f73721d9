use super::{AppConfig, ConfigError};

const VALID_LOG_LEVELS: &[&str] = &[
    "TRACE", "DEBUG", "INFO", "WARN", "WARNING", "ERROR", "CRITICAL", "DISABLED",
];

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_client_auth(config)?;
    validate_agent(config)?;
    validate_models(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.port == 0 {
        return Err(validation_err("server.port must be greater than 0"));
    }
    if server.stream_buffer == 0 {
        return Err(validation_err(
            "server.stream_buffer must be greater than 0",
        ));
    }
    if server.runtime_worker_threads == Some(0) {
        return Err(validation_err(
            "server.runtime_worker_threads must be greater than 0 when set",
        ));
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    let parsed = url::Url::parse(&upstream.base_url).map_err(|err| {
        validation_err(format!("upstream.base_url is not a valid URL: {err}"))
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(validation_err(
            "upstream.base_url must start with http:// or https://",
        ));
    }
    if upstream.default_model.trim().is_empty() {
        return Err(validation_err("upstream.default_model cannot be empty"));
    }
    if upstream.connect_timeout_secs == 0 {
        return Err(validation_err(
            "upstream.connect_timeout_secs must be greater than 0",
        ));
    }
    if upstream.pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "upstream.pool_max_idle_per_host must be greater than 0",
        ));
    }
    if let Some(proxy) = upstream.proxy.as_deref() {
        let parsed = url::Url::parse(proxy)
            .map_err(|err| validation_err(format!("upstream.proxy is invalid: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
            return Err(validation_err(format!(
                "upstream.proxy has unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
    }
    Ok(())
}

fn validate_client_auth(config: &AppConfig) -> Result<(), ConfigError> {
    let auth = &config.client_authentication;
    for key in &auth.allowed_keys {
        if key.trim().is_empty() {
            return Err(validation_err("allowed_keys contains an empty key"));
        }
    }
    if auth.allowed_keys.is_empty() && auth.keys_file.is_none() {
        return Err(validation_err(
            "client_authentication needs allowed_keys or a keys_file",
        ));
    }
    if auth.create_default_key && auth.keys_file.is_none() {
        return Err(validation_err(
            "client_authentication.create_default_key requires keys_file",
        ));
    }
    Ok(())
}

fn validate_agent(config: &AppConfig) -> Result<(), ConfigError> {
    if config.agent.default_max_tokens == 0 {
        return Err(validation_err(
            "agent.default_max_tokens must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_models(config: &AppConfig) -> Result<(), ConfigError> {
    for model in &config.models {
        if model.id.trim().is_empty() {
            return Err(validation_err("models contains an entry with an empty id"));
        }
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "features.log_level '{}' is not one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
