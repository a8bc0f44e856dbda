use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DiagnoseError {
    #[error("no API key configured")]
    NoApiKey,
    #[error("diagnosis timed out after {0:?}")]
    Timeout(Duration),
    #[error("diagnosis service responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("diagnosis request failed")]
    Transport(#[source] reqwest::Error),
    #[error("diagnosis response is malformed")]
    Malformed(#[source] serde_json::Error),
    #[error("diagnosis response contained no text")]
    EmptyCompletion,
}

/// Why the raw log line was forwarded instead of a diagnosis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FallbackReason {
    NoApiKey,
    /// Too little of the invocation was left to ask for a diagnosis.
    DeadlineExhausted,
    Timeout,
    Status(u16),
    Transport,
    Malformed,
    EmptyCompletion,
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::NoApiKey => f.write_str("no API key configured"),
            FallbackReason::DeadlineExhausted => f.write_str("no time left for a diagnosis"),
            FallbackReason::Timeout => f.write_str("diagnosis timed out"),
            FallbackReason::Status(status) => {
                write!(f, "diagnosis service responded with {status}")
            }
            FallbackReason::Transport => f.write_str("diagnosis request failed"),
            FallbackReason::Malformed => f.write_str("malformed diagnosis response"),
            FallbackReason::EmptyCompletion => f.write_str("empty diagnosis"),
        }
    }
}

impl From<&DiagnoseError> for FallbackReason {
    fn from(err: &DiagnoseError) -> Self {
        match err {
            DiagnoseError::NoApiKey => FallbackReason::NoApiKey,
            DiagnoseError::Timeout(_) => FallbackReason::Timeout,
            DiagnoseError::Status { status, .. } => FallbackReason::Status(*status),
            DiagnoseError::Transport(_) => FallbackReason::Transport,
            DiagnoseError::Malformed(_) => FallbackReason::Malformed,
            DiagnoseError::EmptyCompletion => FallbackReason::EmptyCompletion,
        }
    }
}

/// The text to notify with: a diagnosis of the log line, or the line itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnosis {
    Diagnosed { text: String, model: String },
    Fallback { text: String, reason: FallbackReason },
}

impl Diagnosis {
    pub fn text(&self) -> &str {
        match self {
            Diagnosis::Diagnosed { text, .. } | Diagnosis::Fallback { text, .. } => text,
        }
    }

    pub fn is_diagnosed(&self) -> bool {
        matches!(self, Diagnosis::Diagnosed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosisRequest<'a> {
    pub log_group: &'a str,
    pub message: &'a str,
    pub timeout: Duration,
}

pub trait Diagnose: std::fmt::Debug + Send + Sync + 'static {
    /// Name of the model which produces diagnoses, or None if diagnoses are disabled.
    fn model(&self) -> Option<&str>;

    fn diagnose<'s>(
        &'s self,
        request: DiagnosisRequest<'s>,
    ) -> impl std::future::Future<Output = Result<String, DiagnoseError>> + Send + 's;
}

#[derive(Debug)]
pub enum Diagnoser {
    Disabled,
    Anthropic(crate::anthropic::Client),
}

impl Diagnose for Diagnoser {
    fn model(&self) -> Option<&str> {
        match self {
            Diagnoser::Disabled => None,
            Diagnoser::Anthropic(client) => Some(client.model()),
        }
    }

    async fn diagnose<'s>(&'s self, request: DiagnosisRequest<'s>) -> Result<String, DiagnoseError> {
        match self {
            Diagnoser::Disabled => Err(DiagnoseError::NoApiKey),
            Diagnoser::Anthropic(client) => client.diagnose(request).await,
        }
    }
}

/// Ask `diagnoser` for a diagnosis of `message`, falling back to `message`
/// itself if there's no diagnoser, no time, or the diagnosis fails.
/// A `timeout` of None means the invocation has no time left for a diagnosis.
pub async fn diagnose_or_fallback<D: Diagnose>(
    diagnoser: &D,
    log_group: &str,
    message: &str,
    timeout: Option<Duration>,
) -> Diagnosis {
    let fallback = |reason| Diagnosis::Fallback {
        text: message.to_string(),
        reason,
    };

    let Some(model) = diagnoser.model() else {
        tracing::debug!("diagnoses are disabled, forwarding raw log line");
        return fallback(FallbackReason::NoApiKey);
    };
    let Some(timeout) = timeout else {
        tracing::warn!("invocation deadline is too close to ask for a diagnosis");
        return fallback(FallbackReason::DeadlineExhausted);
    };

    let request = DiagnosisRequest {
        log_group,
        message,
        timeout,
    };
    match diagnoser.diagnose(request).await {
        Ok(text) => {
            tracing::debug!(%model, len = text.len(), "received diagnosis");
            Diagnosis::Diagnosed {
                text,
                model: model.to_string(),
            }
        }
        Err(error) => {
            tracing::warn!(error = ?error, "diagnosis failed, forwarding raw log line");
            fallback(FallbackReason::from(&error))
        }
    }
}
