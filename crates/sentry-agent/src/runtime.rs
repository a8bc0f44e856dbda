//! A client of the function runtime API, through which the hosting platform
//! hands invocations to the process and collects their responses.
use crate::diagnosis::Diagnose;
use crate::handler::Handler;
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use sentry_notifications::NotificationSender;

const REQUEST_ID_HEADER: &str = "lambda-runtime-aws-request-id";
const DEADLINE_HEADER: &str = "lambda-runtime-deadline-ms";
const ERROR_TYPE_HEADER: &str = "lambda-runtime-function-error-type";

#[derive(Debug, Clone)]
pub struct RuntimeApi {
    base: url::Url,
    http_client: reqwest::Client,
}

#[derive(Debug)]
pub struct Invocation {
    pub request_id: String,
    pub deadline: Option<DateTime<Utc>>,
    pub payload: bytes::Bytes,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorRequest {
    error_message: String,
    error_type: &'static str,
}

impl RuntimeApi {
    /// Build a client of the runtime API at `address`, which is a `host:port`.
    pub fn new(address: &str, http_client: reqwest::Client) -> anyhow::Result<RuntimeApi> {
        let base = format!("http://{address}/2018-06-01/")
            .parse()
            .with_context(|| format!("invalid runtime API address '{address}'"))?;
        Ok(RuntimeApi { base, http_client })
    }

    /// Block until the next invocation is available.
    pub async fn next(&self) -> anyhow::Result<Invocation> {
        let response = self
            .http_client
            .get(self.base.join("runtime/invocation/next")?)
            .send()
            .await
            .context("polling for next invocation")?
            .error_for_status()
            .context("polling for next invocation")?;

        let headers = response.headers();
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .context("invocation is missing its request ID")?
            .to_string();
        let deadline = headers
            .get(DEADLINE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        let payload = response
            .bytes()
            .await
            .context("reading invocation payload")?;

        Ok(Invocation {
            request_id,
            deadline,
            payload,
        })
    }

    pub async fn respond<T: serde::Serialize>(
        &self,
        request_id: &str,
        response: &T,
    ) -> anyhow::Result<()> {
        let url = self
            .base
            .join(&format!("runtime/invocation/{request_id}/response"))?;
        self.http_client
            .post(url)
            .json(response)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("posting response of invocation {request_id}"))?;
        Ok(())
    }

    /// Report a failure to initialize, after which the platform restarts the process.
    pub async fn init_error(&self, error: &anyhow::Error) -> anyhow::Result<()> {
        self.http_client
            .post(self.base.join("runtime/init/error")?)
            .header(ERROR_TYPE_HEADER, "Runtime.InitError")
            .json(&ErrorRequest {
                error_message: format!("{error:#}"),
                error_type: "Runtime.InitError",
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("posting initialization error")?;
        Ok(())
    }
}

/// Handle a single invocation: fetch it, handle it, and respond with its report.
pub async fn invoke_once<D, S>(api: &RuntimeApi, handler: &Handler<D, S>) -> anyhow::Result<()>
where
    D: Diagnose,
    S: NotificationSender,
{
    let invocation = api.next().await?;
    answer(api, handler, invocation).await
}

#[tracing::instrument(skip_all, fields(request_id = %invocation.request_id))]
async fn answer<D, S>(
    api: &RuntimeApi,
    handler: &Handler<D, S>,
    invocation: Invocation,
) -> anyhow::Result<()>
where
    D: Diagnose,
    S: NotificationSender,
{
    let Invocation {
        request_id,
        deadline,
        payload,
    } = invocation;
    tracing::debug!(?deadline, len = payload.len(), "received invocation");

    let report = handler.handle_payload(&payload, deadline).await;
    api.respond(&request_id, &report).await
}

/// Serve invocations until `shutdown` resolves or the runtime API fails.
///
/// Shutdown is observed only while waiting for the next invocation: an
/// invocation which has been received is always handled and answered.
pub async fn serve<D, S>(
    api: &RuntimeApi,
    handler: &Handler<D, S>,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()>
where
    D: Diagnose,
    S: NotificationSender,
{
    tokio::pin!(shutdown);
    tracing::info!("serving invocations");

    loop {
        let invocation = tokio::select! {
            result = api.next() => result?,
            () = &mut shutdown => {
                tracing::info!("shutdown signal received, stopping");
                return Ok(());
            }
        };
        answer(api, handler, invocation).await?;
    }
}
