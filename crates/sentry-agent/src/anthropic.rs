//! Client of the Anthropic Messages API, used to diagnose log lines.
use crate::diagnosis::{DiagnoseError, DiagnosisRequest};
use anyhow::Context;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You are an on-call site reliability engineer. \
You are given one error line from the logs of a production service. \
Reply with a short diagnosis: the most likely cause and a recommended next step, \
in at most three sentences. Reply with the diagnosis only.";

#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Client {
    #[derivative(Debug = "ignore")]
    api_key: String,
    version: String,
    model: String,
    max_tokens: u32,
    endpoint: url::Url,
    #[derivative(Debug = "ignore")]
    http_client: reqwest::Client,
}

#[derive(Debug, serde::Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message>,
}

#[derive(Debug, serde::Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, serde::Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

impl Client {
    pub fn new(
        api_key: String,
        version: String,
        model: String,
        max_tokens: u32,
        base_url: &url::Url,
        http_client: reqwest::Client,
    ) -> anyhow::Result<Client> {
        // Join relative to the full path of `base_url`, which may be a gateway prefix.
        let mut base_url = base_url.clone();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let endpoint = base_url
            .join("v1/messages")
            .context("building messages endpoint URL")?;

        Ok(Client {
            api_key,
            version,
            model,
            max_tokens,
            endpoint,
            http_client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.model, timeout = ?request.timeout))]
    pub async fn diagnose(&self, request: DiagnosisRequest<'_>) -> Result<String, DiagnoseError> {
        let DiagnosisRequest {
            log_group,
            message,
            timeout,
        } = request;

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: format!("Log group: {log_group}\nLog line:\n{message}"),
            }],
        };

        let response = self
            .http_client
            .post(self.endpoint.clone())
            .timeout(timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&body)
            .send()
            .await
            .map_err(|err| map_reqwest_err(err, timeout))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| map_reqwest_err(err, timeout))?;

        if !status.is_success() {
            return Err(DiagnoseError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let MessagesResponse { content } =
            serde_json::from_slice(&bytes).map_err(DiagnoseError::Malformed)?;

        let text = content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        let text = text.trim();

        if text.is_empty() {
            Err(DiagnoseError::EmptyCompletion)
        } else {
            Ok(text.to_string())
        }
    }
}

fn map_reqwest_err(err: reqwest::Error, timeout: Duration) -> DiagnoseError {
    if err.is_timeout() {
        DiagnoseError::Timeout(timeout)
    } else {
        DiagnoseError::Transport(err)
    }
}
