//! The CloudSentry agent is the function behind the `ERROR` subscription filter
//! of a production log group. Each matching log line is handed to a language
//! model for a short diagnosis, and the diagnosis (or the line itself, if none
//! could be had) is posted to a messaging webhook.
pub mod anthropic;
pub mod config;
mod diagnosis;
pub mod event;
mod filter;
mod handler;
pub mod logging;
pub mod preflight;
pub mod runtime;

pub use config::{AgentArgs, Config};
pub use diagnosis::{
    diagnose_or_fallback, Diagnose, DiagnoseError, Diagnoser, Diagnosis, DiagnosisRequest,
    FallbackReason,
};
pub use filter::TermFilter;
pub use handler::{EventOutcome, Handler, Report, SkipReason};

use sentry_notifications::Sender;

/// Build the `Handler` described by `config`.
pub fn new_handler(
    config: &Config,
    http_client: reqwest::Client,
) -> anyhow::Result<Handler<Diagnoser, Sender>> {
    let Config {
        api_key,
        anthropic_version,
        model,
        base_url,
        max_tokens,
        webhook_url,
        diagnosis_timeout,
        webhook_timeout,
        delivery_reserve,
    } = config;

    let diagnoser = match api_key {
        Some(api_key) => Diagnoser::Anthropic(anthropic::Client::new(
            api_key.clone(),
            anthropic_version.clone(),
            model.clone(),
            *max_tokens,
            base_url,
            http_client.clone(),
        )?),
        None => {
            tracing::warn!("ANTHROPIC_API_KEY is not set, log lines will be forwarded without a diagnosis");
            Diagnoser::Disabled
        }
    };
    let sender = Sender::from_url(webhook_url.clone(), *webhook_timeout, http_client);
    if matches!(sender, Sender::Disabled) {
        tracing::warn!("SLACK_WEBHOOK_URL is not set, notifications will only be logged");
    }

    Handler::new(diagnoser, sender, *diagnosis_timeout, *delivery_reserve)
}
