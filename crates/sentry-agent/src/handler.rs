use crate::diagnosis::{diagnose_or_fallback, Diagnose, Diagnosis};
use crate::event::{self, LogEvent, LogsData, MessageType};
use chrono::{DateTime, Utc};
use sentry_notifications::{
    AlertState, Delivery, Notification, NotificationSender, Origin, Renderer,
};
use std::time::Duration;

/// Handles batches of log events delivered by a subscription filter.
///
/// Each event yields at most one notification, which carries a diagnosis of
/// the event's message when one can be had, and the message itself otherwise.
/// Handling never fails: upstream failures degrade the notification, and
/// delivery failures are logged.
#[derive(Debug)]
pub struct Handler<D, S> {
    diagnoser: D,
    sender: S,
    renderer: Renderer,
    diagnosis_timeout: Duration,
    delivery_reserve: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    EmptyMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Skipped(SkipReason),
    Notified { diagnosed: bool, delivery: Delivery },
    DeliveryFailed { diagnosed: bool, error: String },
}

/// Summary of one invocation, which is returned as its response.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Report {
    pub events: usize,
    pub diagnosed: usize,
    pub delivered: usize,
    pub logged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Report {
    fn record(&mut self, outcome: &EventOutcome) {
        self.events += 1;
        match outcome {
            EventOutcome::Skipped(_) => self.skipped += 1,
            EventOutcome::Notified {
                diagnosed,
                delivery,
            } => {
                self.diagnosed += *diagnosed as usize;
                match delivery {
                    Delivery::Posted { .. } => self.delivered += 1,
                    Delivery::Logged => self.logged += 1,
                }
            }
            EventOutcome::DeliveryFailed { diagnosed, .. } => {
                self.diagnosed += *diagnosed as usize;
                self.failed += 1;
            }
        }
    }
}

impl<D: Diagnose, S: NotificationSender> Handler<D, S> {
    pub fn new(
        diagnoser: D,
        sender: S,
        diagnosis_timeout: Duration,
        delivery_reserve: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            diagnoser,
            sender,
            renderer: Renderer::try_new()?,
            diagnosis_timeout,
            delivery_reserve,
        })
    }

    /// Handle a raw invocation payload. Payloads which can't be decoded are skipped.
    pub async fn handle_payload(&self, payload: &[u8], deadline: Option<DateTime<Utc>>) -> Report {
        match event::decode(payload) {
            Ok(logs) => self.handle(logs, deadline).await,
            Err(error) => {
                tracing::warn!(
                    error = ?anyhow::Error::from(error),
                    len = payload.len(),
                    "skipping malformed invocation payload"
                );
                Report {
                    skipped: 1,
                    ..Default::default()
                }
            }
        }
    }

    #[tracing::instrument(skip_all, fields(log_group = %logs.log_group, log_stream = %logs.log_stream))]
    pub async fn handle(&self, logs: LogsData, deadline: Option<DateTime<Utc>>) -> Report {
        let LogsData {
            message_type,
            log_group,
            log_stream,
            log_events,
            ..
        } = logs;

        let mut report = Report::default();

        if message_type == MessageType::ControlMessage {
            tracing::info!("acknowledged subscription control message");
            return report;
        }

        for event in log_events {
            let outcome = self
                .handle_event(&log_group, &log_stream, event, deadline)
                .await;
            report.record(&outcome);
        }

        tracing::info!(?report, "finished handling log events");
        report
    }

    #[tracing::instrument(skip_all, fields(event_id = %event.id))]
    pub async fn handle_event(
        &self,
        log_group: &str,
        log_stream: &str,
        event: LogEvent,
        deadline: Option<DateTime<Utc>>,
    ) -> EventOutcome {
        if event.message.trim().is_empty() {
            tracing::warn!("skipping log event with an empty message");
            return EventOutcome::Skipped(SkipReason::EmptyMessage);
        }

        let timeout = self.diagnosis_budget(deadline, Utc::now());
        let diagnosis =
            diagnose_or_fallback(&self.diagnoser, log_group, &event.message, timeout).await;
        let diagnosed = diagnosis.is_diagnosed();

        let (text, origin) = match diagnosis {
            Diagnosis::Diagnosed { text, model } => (text, Origin::Diagnosis { model }),
            Diagnosis::Fallback { text, reason } => (
                text,
                Origin::RawLog {
                    reason: reason.to_string(),
                },
            ),
        };
        let alert = AlertState {
            log_group: log_group.to_string(),
            log_stream: log_stream.to_string(),
            timestamp: event.timestamp(),
            message: event.message,
            text,
            origin,
        };
        let notification = match self.renderer.render(&alert) {
            Ok(notification) => notification,
            Err(error) => {
                tracing::error!(?error, "failed to render notification blocks, sending text only");
                Notification {
                    text: alert.text,
                    blocks: Vec::new(),
                }
            }
        };

        match self.sender.send(notification).await {
            Ok(delivery) => {
                tracing::info!(%diagnosed, ?delivery, "sent alert notification");
                EventOutcome::Notified {
                    diagnosed,
                    delivery,
                }
            }
            Err(error) => {
                let error = format!("{:#}", anyhow::Error::from(error));
                tracing::error!(%error, "failed to deliver alert notification");
                EventOutcome::DeliveryFailed { diagnosed, error }
            }
        }
    }

    /// Time which may be spent on a diagnosis, or None if there's none left.
    fn diagnosis_budget(
        &self,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let Some(deadline) = deadline else {
            return Some(self.diagnosis_timeout);
        };
        (deadline - now)
            .to_std()
            .ok()
            .and_then(|remaining| remaining.checked_sub(self.delivery_reserve))
            .filter(|budget| !budget.is_zero())
            .map(|budget| budget.min(self.diagnosis_timeout))
    }
}
