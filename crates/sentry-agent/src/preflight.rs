//! Validation of deployment settings, run before the function is deployed.
//!
//! Settings come from the process environment and an optional `.env` file,
//! whose values take precedence. The target account and region are required.
//! A missing API key only earns a warning, as the function still forwards raw
//! log lines without one.
use crate::config::DEFAULT_ANTHROPIC_VERSION;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log group which simulates the production service.
pub const LOG_GROUP: &str = "prod/payment-service";
/// Name of the subscription filter of `LOG_GROUP`.
pub const FILTER_NAME: &str = "AlertOnErrors";
/// Terms which a log line must contain to trigger the function.
pub const FILTER_TERMS: &[&str] = &["ERROR"];
/// Maximum execution time of one invocation.
pub const FUNCTION_TIMEOUT: Duration = Duration::from_secs(60);
pub const RETENTION_DAYS: u32 = 7;

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("failed to read environment file {path:?}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },
    #[error("{} missing from the environment", .0.join(" and "))]
    MissingTarget(Vec<&'static str>),
}

/// Deployment settings, after merging the `.env` file over the process environment.
#[derive(derivative::Derivative, Default, Clone)]
#[derivative(Debug)]
pub struct Environment {
    #[derivative(Debug = "ignore")]
    vars: BTreeMap<String, String>,
    /// Path of the `.env` file, if one was found.
    pub env_file: Option<PathBuf>,
}

impl Environment {
    /// Load `env_file` over the `process` environment. A missing file is not an error.
    pub fn load<I>(env_file: &Path, process: I) -> Result<Environment, PreflightError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars: BTreeMap<String, String> = process.into_iter().collect();

        if !env_file.exists() {
            tracing::warn!(path = ?env_file, "environment file not found");
            return Ok(Environment {
                vars,
                env_file: None,
            });
        }
        tracing::info!(path = ?env_file, "loading environment file");

        let read_err = |source| PreflightError::EnvFile {
            path: env_file.to_owned(),
            source,
        };
        for item in dotenv::from_path_iter(env_file).map_err(read_err)? {
            let (key, value) = item.map_err(read_err)?;
            vars.insert(key, value);
        }

        Ok(Environment {
            vars,
            env_file: Some(env_file.to_owned()),
        })
    }

    /// Value of `key`, trimmed, or None if it's unset or empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Environment of the deployed function. Values are always present, and empty when unset.
#[derive(derivative::Derivative, Clone, PartialEq, serde::Serialize)]
#[derivative(Debug)]
pub struct FunctionEnv {
    #[serde(rename = "ANTHROPIC_API_KEY", serialize_with = "redact")]
    #[derivative(Debug = "ignore")]
    pub anthropic_api_key: String,
    #[serde(rename = "SLACK_WEBHOOK_URL", serialize_with = "redact")]
    #[derivative(Debug = "ignore")]
    pub slack_webhook_url: String,
    #[serde(rename = "ANTHROPIC_VERSION")]
    pub anthropic_version: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Deployment {
    pub account_id: String,
    pub region: String,
    pub log_group: &'static str,
    pub filter_name: &'static str,
    pub filter_terms: &'static [&'static str],
    #[serde(with = "duration_text")]
    pub function_timeout: Duration,
    pub retention_days: u32,
    pub function_env: FunctionEnv,
    pub warnings: Vec<String>,
}

/// Validate `env`, returning the deployment it describes.
pub fn check(env: &Environment) -> Result<Deployment, PreflightError> {
    let account_id = env.get("AWS_ACCOUNT_ID");
    let region = env.get("AWS_REGION");
    tracing::info!(?account_id, ?region, "deployment target");

    let (Some(account_id), Some(region)) = (account_id, region) else {
        let missing = [("AWS_ACCOUNT_ID", account_id), ("AWS_REGION", region)]
            .into_iter()
            .filter_map(|(name, value)| value.is_none().then_some(name))
            .collect();
        return Err(PreflightError::MissingTarget(missing));
    };

    let mut warnings = Vec::new();
    let anthropic_api_key = env.get("ANTHROPIC_API_KEY").unwrap_or_default();
    if anthropic_api_key.is_empty() {
        warnings.push(
            "ANTHROPIC_API_KEY not found in environment: the function will forward log lines without a diagnosis"
                .to_string(),
        );
    }

    for warning in &warnings {
        tracing::warn!("{warning}");
    }

    Ok(Deployment {
        account_id: account_id.to_string(),
        region: region.to_string(),
        log_group: LOG_GROUP,
        filter_name: FILTER_NAME,
        filter_terms: FILTER_TERMS,
        function_timeout: FUNCTION_TIMEOUT,
        retention_days: RETENTION_DAYS,
        function_env: FunctionEnv {
            anthropic_api_key: anthropic_api_key.to_string(),
            slack_webhook_url: env
                .get("SLACK_WEBHOOK_URL")
                .unwrap_or_default()
                .to_string(),
            anthropic_version: env
                .get("ANTHROPIC_VERSION")
                .unwrap_or(DEFAULT_ANTHROPIC_VERSION)
                .to_string(),
        },
        warnings,
    })
}

fn redact<S: serde::Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if value.is_empty() { "" } else { "<redacted>" })
}

mod duration_text {
    pub fn serialize<S: serde::Serializer>(
        value: &std::time::Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn process(vars: &[(&str, &str)]) -> Vec<(String, String)> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_file_overrides_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# deployment target").unwrap();
        writeln!(file, "AWS_ACCOUNT_ID=123456789012").unwrap();
        writeln!(file, "AWS_REGION=\"us-east-1\"").unwrap();
        writeln!(file, "ANTHROPIC_API_KEY=sk-ant-from-file").unwrap();
        drop(file);

        let env = Environment::load(
            &path,
            process(&[
                ("AWS_REGION", "eu-west-1"),
                ("SLACK_WEBHOOK_URL", " https://hooks.slack.com/services/T/B/X "),
            ]),
        )
        .unwrap();

        assert_eq!(env.env_file.as_deref(), Some(path.as_path()));
        assert_eq!(env.get("AWS_REGION"), Some("us-east-1"));
        assert_eq!(env.get("ANTHROPIC_API_KEY"), Some("sk-ant-from-file"));

        let deployment = check(&env).unwrap();
        assert!(deployment.warnings.is_empty());
        pretty_assertions::assert_eq!(
            deployment.function_env,
            FunctionEnv {
                anthropic_api_key: "sk-ant-from-file".to_string(),
                slack_webhook_url: "https://hooks.slack.com/services/T/B/X".to_string(),
                anthropic_version: "2023-06-01".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_env_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::load(
            &dir.path().join(".env"),
            process(&[("AWS_ACCOUNT_ID", "123456789012"), ("AWS_REGION", "us-east-1")]),
        )
        .unwrap();

        assert_eq!(env.env_file, None);
        let deployment = check(&env).unwrap();
        assert_eq!(deployment.region, "us-east-1");
    }

    #[test]
    fn test_missing_target_is_an_error() {
        let env = Environment::load(
            Path::new("/nonexistent/.env"),
            process(&[("AWS_REGION", "us-east-1"), ("AWS_ACCOUNT_ID", "  ")]),
        )
        .unwrap();
        let err = check(&env).unwrap_err();
        assert_eq!(err.to_string(), "AWS_ACCOUNT_ID missing from the environment");

        let env = Environment::load(Path::new("/nonexistent/.env"), Vec::new()).unwrap();
        let err = check(&env).unwrap_err();
        assert_eq!(
            err.to_string(),
            "AWS_ACCOUNT_ID and AWS_REGION missing from the environment"
        );
    }

    #[test]
    fn test_missing_api_key_is_a_warning() {
        let env = Environment::load(
            Path::new("/nonexistent/.env"),
            process(&[
                ("AWS_ACCOUNT_ID", "123456789012"),
                ("AWS_REGION", "us-east-1"),
                ("ANTHROPIC_API_KEY", ""),
                ("ANTHROPIC_VERSION", "2024-01-01"),
            ]),
        )
        .unwrap();

        let deployment = check(&env).unwrap();
        insta::assert_json_snapshot!(deployment, @r###"
        {
          "account_id": "123456789012",
          "region": "us-east-1",
          "log_group": "prod/payment-service",
          "filter_name": "AlertOnErrors",
          "filter_terms": [
            "ERROR"
          ],
          "function_timeout": "1m",
          "retention_days": 7,
          "function_env": {
            "ANTHROPIC_API_KEY": "",
            "SLACK_WEBHOOK_URL": "",
            "ANTHROPIC_VERSION": "2024-01-01"
          },
          "warnings": [
            "ANTHROPIC_API_KEY not found in environment: the function will forward log lines without a diagnosis"
          ]
        }
        "###);
    }

    #[test]
    fn test_secrets_are_redacted_when_serialized() {
        let env = FunctionEnv {
            anthropic_api_key: "sk-ant-secret".to_string(),
            slack_webhook_url: "https://hooks.slack.com/services/T/B/secret".to_string(),
            anthropic_version: "2023-06-01".to_string(),
        };
        let out = serde_json::to_string(&env).unwrap();
        assert!(!out.contains("secret"), "{out}");
        assert!(!format!("{env:?}").contains("secret"));
    }
}
