//! Configuration for the Formbricks integration, read from the environment.

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

use super::sdk::SdkGeneration;

pub const DEFAULT_API_HOST: &str = "https://app.formbricks.com";

/// Formbricks environment ids are cuids, ~25 characters. Anything shorter
/// than this is a paste error, not a real id.
const MIN_ENVIRONMENT_ID_LEN: usize = 10;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error(
        "FORMBRICKS_ENV_ID is not set. Copy the environment id from \
         Formbricks → Settings → Setup and export it to enable the feedback \
         integration; the rest of the application is unaffected."
    )]
    MissingEnvironmentId,
    #[error(
        "FORMBRICKS_ENV_ID {0:?} is too short to be a valid environment id. \
         A real id is a ~25 character cuid; check for a truncated paste."
    )]
    InvalidEnvironmentId(String),
    #[error("FORMBRICKS_API_HOST is not a valid URL: {0}")]
    InvalidApiHost(String),
}

#[derive(Debug, Clone)]
pub struct FormbricksConfig {
    pub environment_id: String,
    pub api_host: Url,
    /// Management API key, server-side only. Optional: the tracking path
    /// works without it, analytics reads do not.
    pub api_key: Option<SecretString>,
    pub debug: bool,
    pub sdk_generation: SdkGeneration,
}

impl FormbricksConfig {
    pub fn new(
        environment_id: impl Into<String>,
        api_host: Option<&str>,
        api_key: Option<SecretString>,
    ) -> Result<Self, ConfigError> {
        let environment_id = environment_id.into();
        validate_environment_id(&environment_id)?;
        let host = api_host.unwrap_or(DEFAULT_API_HOST);
        let api_host = Url::parse(host).map_err(|_| ConfigError::InvalidApiHost(host.to_string()))?;
        Ok(Self {
            environment_id,
            api_host,
            api_key,
            debug: false,
            sdk_generation: SdkGeneration::Current,
        })
    }

    /// Build from `FORMBRICKS_*` environment variables. A missing or
    /// malformed environment id is a configuration error; callers treat it
    /// as "integration disabled", never as a crash.
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment_id =
            std::env::var("FORMBRICKS_ENV_ID").map_err(|_| ConfigError::MissingEnvironmentId)?;
        if environment_id.trim().is_empty() {
            return Err(ConfigError::MissingEnvironmentId);
        }
        let api_host = std::env::var("FORMBRICKS_API_HOST").ok();
        let api_key = std::env::var("FORMBRICKS_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);

        let mut config = Self::new(environment_id, api_host.as_deref(), api_key)?;
        config.debug = std::env::var("FORMBRICKS_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        config.sdk_generation = std::env::var("FORMBRICKS_JS_VERSION")
            .map(|v| SdkGeneration::from_version(&v))
            .unwrap_or_default();
        Ok(config)
    }

    /// Re-check the environment id. Configs built through `new`/`from_env`
    /// already passed this; manual construction may not have.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_environment_id(&self.environment_id)
    }
}

fn validate_environment_id(id: &str) -> Result<(), ConfigError> {
    if id.trim().is_empty() {
        return Err(ConfigError::MissingEnvironmentId);
    }
    if id.len() < MIN_ENVIRONMENT_ID_LEN || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConfigError::InvalidEnvironmentId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_environment_id() {
        let err = FormbricksConfig::new("abc", None, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvironmentId(_)));
    }

    #[test]
    fn rejects_non_alphanumeric_environment_id() {
        let err = FormbricksConfig::new("cm1234!@#$abcdefgh", None, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvironmentId(_)));
    }

    #[test]
    fn accepts_plausible_id_and_defaults_host() {
        let config = FormbricksConfig::new("cm4xyz789abcdef012345", None, None).unwrap();
        assert_eq!(config.api_host.as_str(), "https://app.formbricks.com/");
        assert!(config.api_key.is_none());
    }

    #[test]
    fn rejects_bad_host() {
        let err =
            FormbricksConfig::new("cm4xyz789abcdef012345", Some("not a url"), None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidApiHost(_)));
    }
}
