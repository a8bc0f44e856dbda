use super::Notification;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("webhook did not respond within {0:?}")]
    Timeout(Duration),
    #[error("webhook responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to post to webhook")]
    Transport(#[source] reqwest::Error),
}

/// The result of a successful `NotificationSender::send`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delivery {
    /// The notification was accepted by the webhook.
    Posted { status: u16 },
    /// No webhook is configured, and the notification was only logged.
    Logged,
}

pub trait NotificationSender: std::fmt::Debug + Send + Sync + 'static {
    fn send<'s>(
        &'s self,
        notification: Notification,
    ) -> impl std::future::Future<Output = Result<Delivery, SendError>> + Send + 's;
}

/// Posts notifications as JSON to an incoming webhook.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct WebhookSender {
    // Incoming webhook URLs embed their credential in the path.
    #[derivative(Debug = "ignore")]
    url: url::Url,
    timeout: Duration,
    #[derivative(Debug = "ignore")]
    http_client: reqwest::Client,
}

impl WebhookSender {
    async fn send(&self, notification: Notification) -> Result<Delivery, SendError> {
        let Self {
            url,
            timeout,
            http_client,
        } = self;

        let response = http_client
            .post(url.clone())
            .timeout(*timeout)
            .json(&notification)
            .send()
            .await
            .map_err(|err| map_reqwest_err(err, *timeout))?;

        let status = response.status();
        if !status.is_success() {
            // The body is only read for diagnostics, so a failure to read it is ignored.
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(%status, "webhook accepted notification");
        Ok(Delivery::Posted {
            status: status.as_u16(),
        })
    }
}

fn map_reqwest_err(err: reqwest::Error, timeout: Duration) -> SendError {
    if err.is_timeout() {
        SendError::Timeout(timeout)
    } else {
        SendError::Transport(err)
    }
}

#[derive(Debug)]
pub enum Sender {
    Disabled,
    Webhook(WebhookSender),
}

impl Sender {
    pub fn webhook(url: url::Url, timeout: Duration, http_client: reqwest::Client) -> Sender {
        Sender::Webhook(WebhookSender {
            url,
            timeout,
            http_client,
        })
    }

    /// Build a `Sender` which posts to `url`, or which only logs if there's no URL.
    pub fn from_url(
        url: Option<url::Url>,
        timeout: Duration,
        http_client: reqwest::Client,
    ) -> Sender {
        match url {
            Some(url) => Sender::webhook(url, timeout, http_client),
            None => Sender::Disabled,
        }
    }
}

impl NotificationSender for Sender {
    async fn send<'s>(&'s self, notification: Notification) -> Result<Delivery, SendError> {
        match self {
            Sender::Disabled => {
                tracing::info!(
                    text = %notification.text,
                    "no webhook configured, logging notification instead of sending it"
                );
                Ok(Delivery::Logged)
            }
            Sender::Webhook(webhook) => webhook.send(notification).await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Block, TextObject};
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn serve(router: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test server");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    fn notification() -> Notification {
        Notification {
            text: "ERROR: disk full on node-7".to_string(),
            blocks: vec![Block::Section {
                text: TextObject::Mrkdwn {
                    text: "```ERROR: disk full on node-7```".to_string(),
                },
            }],
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        async fn capture(State(seen): State<Seen>, Json(body): Json<serde_json::Value>) {
            seen.lock().unwrap().push(body);
        }
        let seen = Seen::default();
        let addr = serve(
            Router::new()
                .route("/services/T000/B000/XXXX", post(capture))
                .with_state(seen.clone()),
        )
        .await;

        let sender = Sender::webhook(
            format!("http://{addr}/services/T000/B000/XXXX").parse().unwrap(),
            Duration::from_secs(5),
            reqwest::Client::new(),
        );
        let delivery = sender.send(notification()).await.unwrap();
        assert_eq!(delivery, Delivery::Posted { status: 200 });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        insta::assert_json_snapshot!(seen[0], @r###"
        {
          "blocks": [
            {
              "text": {
                "text": "```ERROR: disk full on node-7```",
                "type": "mrkdwn"
              },
              "type": "section"
            }
          ],
          "text": "ERROR: disk full on node-7"
        }
        "###);
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        async fn reject() -> (StatusCode, &'static str) {
            (StatusCode::FORBIDDEN, "invalid_token")
        }
        let addr = serve(Router::new().route("/hook", post(reject))).await;

        let sender = Sender::webhook(
            format!("http://{addr}/hook").parse().unwrap(),
            Duration::from_secs(5),
            reqwest::Client::new(),
        );
        let err = sender.send(notification()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "webhook responded with 403: invalid_token"
        );
    }

    #[tokio::test]
    async fn test_webhook_timeout() {
        async fn stall() {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        let addr = serve(Router::new().route("/hook", post(stall))).await;

        let sender = Sender::webhook(
            format!("http://{addr}/hook").parse().unwrap(),
            Duration::from_millis(100),
            reqwest::Client::new(),
        );
        let err = sender.send(notification()).await.unwrap_err();
        assert!(matches!(err, SendError::Timeout(_)), "{err:?}");
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_disabled_sender_only_logs() {
        let sender = Sender::from_url(None, Duration::from_secs(5), reqwest::Client::new());
        let delivery = sender.send(notification()).await.unwrap();

        assert_eq!(delivery, Delivery::Logged);
        assert!(logs_contain("no webhook configured"));
        assert!(logs_contain("ERROR: disk full on node-7"));
    }

    #[test]
    fn test_debug_hides_webhook_url() {
        let sender = Sender::webhook(
            "https://hooks.slack.com/services/T000/B000/secret".parse().unwrap(),
            Duration::from_secs(5),
            reqwest::Client::new(),
        );
        let debug = format!("{sender:?}");
        assert!(!debug.contains("secret"), "{debug}");
    }
}
