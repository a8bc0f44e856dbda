use anyhow::Context;
use std::time::Duration;

pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

/// Settings of the alert handler, read from flags or the function environment.
///
/// The deployment always sets `ANTHROPIC_API_KEY`, `SLACK_WEBHOOK_URL` and
/// `ANTHROPIC_VERSION`, using an empty string for values it doesn't have.
/// Empty values are therefore treated as absent.
#[derive(derivative::Derivative, clap::Args, Clone)]
#[derivative(Debug)]
pub struct AgentArgs {
    /// API key of the language-model service. Without it, log lines are
    /// forwarded without a diagnosis.
    #[derivative(Debug = "ignore")]
    #[clap(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,
    /// Protocol version sent with each language-model request.
    #[clap(long, env = "ANTHROPIC_VERSION", default_value = DEFAULT_ANTHROPIC_VERSION)]
    pub anthropic_version: String,
    /// Model which is asked for diagnoses.
    #[clap(long, env = "ANTHROPIC_MODEL", default_value = DEFAULT_MODEL)]
    pub anthropic_model: String,
    /// Base URL of the language-model service.
    #[clap(
        long,
        env = "ANTHROPIC_BASE_URL",
        default_value = "https://api.anthropic.com"
    )]
    pub anthropic_base_url: url::Url,
    /// Upper bound on the length of a diagnosis, in tokens.
    #[clap(long, env = "ANTHROPIC_MAX_TOKENS", default_value = "300")]
    pub anthropic_max_tokens: u32,
    /// Incoming webhook which receives notifications. Without it, notifications are logged.
    #[derivative(Debug = "ignore")]
    #[clap(long, env = "SLACK_WEBHOOK_URL", hide_env_values = true)]
    pub slack_webhook_url: Option<String>,
    /// Longest time to wait for a diagnosis.
    #[clap(long, env = "DIAGNOSIS_TIMEOUT", default_value = "45s", value_parser = humantime::parse_duration)]
    pub diagnosis_timeout: Duration,
    /// Longest time to wait for the webhook to accept a notification.
    #[clap(long, env = "WEBHOOK_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub webhook_timeout: Duration,
    /// Time held back from a diagnosis before the invocation deadline, so that
    /// the notification can still be delivered.
    #[clap(long, env = "DELIVERY_RESERVE", default_value = "5s", value_parser = humantime::parse_duration)]
    pub delivery_reserve: Duration,
}

#[derive(derivative::Derivative, Clone)]
#[derivative(Debug)]
pub struct Config {
    #[derivative(Debug(format_with = "redact_secret"))]
    pub api_key: Option<String>,
    pub anthropic_version: String,
    pub model: String,
    pub base_url: url::Url,
    pub max_tokens: u32,
    #[derivative(Debug(format_with = "redact_url"))]
    pub webhook_url: Option<url::Url>,
    pub diagnosis_timeout: Duration,
    pub webhook_timeout: Duration,
    pub delivery_reserve: Duration,
}

impl AgentArgs {
    pub fn into_config(self) -> anyhow::Result<Config> {
        let AgentArgs {
            anthropic_api_key,
            anthropic_version,
            anthropic_model,
            anthropic_base_url,
            anthropic_max_tokens,
            slack_webhook_url,
            diagnosis_timeout,
            webhook_timeout,
            delivery_reserve,
        } = self;

        let webhook_url = non_empty(slack_webhook_url)
            .map(|url| url.parse::<url::Url>())
            .transpose()
            .context("parsing SLACK_WEBHOOK_URL")?;

        Ok(Config {
            api_key: non_empty(anthropic_api_key),
            anthropic_version: non_empty(Some(anthropic_version))
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_VERSION.to_string()),
            model: non_empty(Some(anthropic_model)).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: anthropic_base_url,
            max_tokens: anthropic_max_tokens,
            webhook_url,
            diagnosis_timeout,
            webhook_timeout,
            delivery_reserve,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn redact_secret(value: &Option<String>, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    match value {
        Some(_) => f.write_str("Some(<redacted>)"),
        None => f.write_str("None"),
    }
}

fn redact_url(value: &Option<url::Url>, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    match value {
        Some(url) => write!(
            f,
            "Some({}://{}/<redacted>)",
            url.scheme(),
            url.host_str().unwrap_or_default()
        ),
        None => f.write_str("None"),
    }
}
