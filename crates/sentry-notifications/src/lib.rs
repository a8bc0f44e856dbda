//! Rendering and delivery of alert notifications.
//!
//! A `Notification` has two parts. `text` is the notification message itself:
//! either the model's diagnosis of a log line, or the raw log line when no
//! diagnosis was produced. `blocks` decorate that message for display in a
//! Slack-compatible webhook, with a header and a context line naming where the
//! log line came from. Receivers which don't understand blocks show `text`.
//!
//! Block text is rendered by handlebars templates. Slack mrkdwn treats `&`,
//! `<` and `>` as control characters, so the registry escapes exactly those
//! instead of applying HTML escaping.
//!
//! Slack rejects a whole payload when any block is too long, so values are
//! clipped to fit their block after escaping. `text` is never clipped.
mod sender;

pub use sender::{Delivery, NotificationSender, SendError, Sender, WebhookSender};

use anyhow::Context;
use chrono::{DateTime, Utc};

/// Where the text of a notification came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
    /// The text is a diagnosis produced by the named model.
    Diagnosis { model: String },
    /// The text is the raw log line, for the given reason.
    RawLog { reason: String },
}

/// Everything known about one alerting log event at the time of notification.
#[derive(Debug, Clone)]
pub struct AlertState {
    pub log_group: String,
    pub log_stream: String,
    pub timestamp: DateTime<Utc>,
    /// The raw log line which triggered the alert.
    pub message: String,
    /// The notification message: a diagnosis, or the raw log line.
    pub text: String,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Notification {
    pub text: String,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Header { text: TextObject },
    Section { text: TextObject },
    Context { elements: Vec<TextObject> },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextObject {
    PlainText { text: String },
    Mrkdwn { text: String },
}

const HEADER: &str = "header";
const SECTION: &str = "section";
const CONTEXT: &str = "context";

/// Longest text of a header block, in characters.
pub const HEADER_MAX_CHARS: usize = 150;
/// Longest text of a section block, in characters.
pub const SECTION_MAX_CHARS: usize = 3000;

// Text of the header template which precedes the log group.
const HEADER_PREFIX: &str = "CloudSentry alert in ";
// Room left in a section for the diagnosis and the log line, after markup.
const SECTION_BUDGET: usize = SECTION_MAX_CHARS - 100;

#[derive(Debug)]
pub struct Renderer {
    registry: handlebars::Handlebars<'static>,
}

impl Renderer {
    pub fn try_new() -> anyhow::Result<Renderer> {
        let mut registry = handlebars::Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(escape_mrkdwn);

        // Header blocks are plain text and must not be escaped.
        registry
            .register_template_string(HEADER, "CloudSentry alert in {{{header_log_group}}}")
            .context("registering header template")?;
        registry
            .register_template_string(
                SECTION,
                "{{#if diagnosed}}{{text}}\n\n*Log line*\n{{/if}}```{{message}}```",
            )
            .context("registering section template")?;
        registry
            .register_template_string(
                CONTEXT,
                "`{{log_group}}` · `{{log_stream}}` · {{timestamp}} · {{#if diagnosed}}diagnosis by {{model}}{{else}}raw log line ({{reason}}){{/if}}",
            )
            .context("registering context template")?;

        Ok(Renderer { registry })
    }

    pub fn render(&self, alert: &AlertState) -> anyhow::Result<Notification> {
        let AlertState {
            log_group,
            log_stream,
            timestamp,
            message,
            text,
            origin,
        } = alert;

        let (diagnosed, model, reason) = match origin {
            Origin::Diagnosis { model } => (true, model.as_str(), ""),
            Origin::RawLog { reason } => (false, "", reason.as_str()),
        };
        // A diagnosis shares its section with the log line.
        let (text_budget, message_budget) = if diagnosed {
            (SECTION_BUDGET / 2, SECTION_BUDGET / 2)
        } else {
            (0, SECTION_BUDGET)
        };
        let header_budget = HEADER_MAX_CHARS - HEADER_PREFIX.chars().count();

        let data = serde_json::json!({
            "log_group": log_group,
            "header_log_group": clip(log_group, header_budget, |_| 1),
            "log_stream": log_stream,
            "timestamp": timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "message": clip(message, message_budget, escaped_width),
            "text": clip(text, text_budget, escaped_width),
            "diagnosed": diagnosed,
            "model": model,
            "reason": reason,
        });

        let header = self
            .registry
            .render(HEADER, &data)
            .context("rendering header block")?;
        let section = self
            .registry
            .render(SECTION, &data)
            .context("rendering section block")?;
        let context = self
            .registry
            .render(CONTEXT, &data)
            .context("rendering context block")?;

        Ok(Notification {
            text: text.clone(),
            blocks: vec![
                Block::Header {
                    text: TextObject::PlainText { text: header },
                },
                Block::Section {
                    text: TextObject::Mrkdwn { text: section },
                },
                Block::Context {
                    elements: vec![TextObject::Mrkdwn { text: context }],
                },
            ],
        })
    }
}

/// Clip `s` so that its rendered width, as measured by `width` for each char,
/// is at most `max`. Clipped values end with an ellipsis.
fn clip(s: &str, max: usize, width: impl Fn(char) -> usize) -> std::borrow::Cow<'_, str> {
    if s.chars().map(&width).sum::<usize>() <= max {
        return s.into();
    }
    let mut used = 0;
    let mut end = 0;
    for (index, c) in s.char_indices() {
        // Leave room for the ellipsis.
        if used + width(c) > max.saturating_sub(1) {
            break;
        }
        used += width(c);
        end = index + c.len_utf8();
    }
    format!("{}…", &s[..end]).into()
}

fn escaped_width(c: char) -> usize {
    match c {
        '&' => "&amp;".len(),
        '<' | '>' => "&lt;".len(),
        _ => 1,
    }
}

fn escape_mrkdwn(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn alert(origin: Origin, text: &str) -> AlertState {
        AlertState {
            log_group: "prod/payment-service".to_string(),
            log_stream: "node-7".to_string(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            message: "ERROR: disk full on node-7".to_string(),
            text: text.to_string(),
            origin,
        }
    }

    #[test]
    fn test_render_diagnosis() {
        let renderer = Renderer::try_new().unwrap();
        let notification = renderer
            .render(&alert(
                Origin::Diagnosis {
                    model: "claude-3-5-haiku-latest".to_string(),
                },
                "Disk utilization exceeded threshold; recommend cleanup of /tmp",
            ))
            .unwrap();

        insta::assert_json_snapshot!(notification, @r###"
        {
          "text": "Disk utilization exceeded threshold; recommend cleanup of /tmp",
          "blocks": [
            {
              "type": "header",
              "text": {
                "type": "plain_text",
                "text": "CloudSentry alert in prod/payment-service"
              }
            },
            {
              "type": "section",
              "text": {
                "type": "mrkdwn",
                "text": "Disk utilization exceeded threshold; recommend cleanup of /tmp\n\n*Log line*\n```ERROR: disk full on node-7```"
              }
            },
            {
              "type": "context",
              "elements": [
                {
                  "type": "mrkdwn",
                  "text": "`prod/payment-service` · `node-7` · 2023-11-14T22:13:20.123Z · diagnosis by claude-3-5-haiku-latest"
                }
              ]
            }
          ]
        }
        "###);
    }

    #[test]
    fn test_render_raw_log_is_escaped() {
        let renderer = Renderer::try_new().unwrap();
        let mut state = alert(
            Origin::RawLog {
                reason: "no API key configured".to_string(),
            },
            "",
        );
        state.message = "ERROR: <refund> failed for A&B".to_string();
        state.text = state.message.clone();

        let notification = renderer.render(&state).unwrap();

        // The notification message is never escaped or decorated.
        pretty_assertions::assert_eq!(notification.text, "ERROR: <refund> failed for A&B");
        pretty_assertions::assert_eq!(
            notification.blocks[1],
            Block::Section {
                text: TextObject::Mrkdwn {
                    text: "```ERROR: &lt;refund&gt; failed for A&amp;B```".to_string()
                }
            }
        );
        pretty_assertions::assert_eq!(
            notification.blocks[2],
            Block::Context {
                elements: vec![TextObject::Mrkdwn {
                    text: "`prod/payment-service` · `node-7` · 2023-11-14T22:13:20.123Z · raw log line (no API key configured)".to_string()
                }]
            }
        );
    }

    #[test]
    fn test_header_is_not_escaped() {
        let renderer = Renderer::try_new().unwrap();
        let mut state = alert(
            Origin::RawLog {
                reason: "timed out".to_string(),
            },
            "ERROR: x",
        );
        state.log_group = "prod/a&b".to_string();

        let notification = renderer.render(&state).unwrap();
        pretty_assertions::assert_eq!(
            notification.blocks[0],
            Block::Header {
                text: TextObject::PlainText {
                    text: "CloudSentry alert in prod/a&b".to_string()
                }
            }
        );
    }

    fn block_text(block: &Block) -> &str {
        match block {
            Block::Header {
                text: TextObject::PlainText { text },
            }
            | Block::Section {
                text: TextObject::Mrkdwn { text },
            } => text,
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn test_long_values_are_clipped_to_block_limits() {
        let renderer = Renderer::try_new().unwrap();
        let long_line = format!("ERROR: {}", "x".repeat(5000));

        let mut state = alert(
            Origin::RawLog {
                reason: "no API key configured".to_string(),
            },
            &long_line,
        );
        state.message = long_line.clone();
        state.log_group = "g".repeat(300);

        let notification = renderer.render(&state).unwrap();
        // The notification message is sent whole.
        assert_eq!(notification.text, long_line);

        let header = block_text(&notification.blocks[0]);
        assert_eq!(header.chars().count(), HEADER_MAX_CHARS);
        assert!(header.ends_with("g…"), "{header}");

        let section = block_text(&notification.blocks[1]);
        assert!(section.chars().count() <= SECTION_MAX_CHARS);
        assert!(section.starts_with("```ERROR: xxx"), "{section}");
        assert!(section.ends_with("x…```"), "{section}");

        // Escaping lengthens text, and is accounted for.
        let markup = "<&>".repeat(2000);
        state.origin = Origin::Diagnosis {
            model: "claude-3-5-haiku-latest".to_string(),
        };
        state.text = markup.clone();
        state.message = markup;

        let notification = renderer.render(&state).unwrap();
        let section = block_text(&notification.blocks[1]);
        assert!(section.chars().count() <= SECTION_MAX_CHARS, "{}", section.len());
        assert!(section.starts_with("&lt;&amp;&gt;"), "{section}");
        assert!(!section.contains("&…") && !section.contains("&a…"));
    }

    #[test]
    fn test_clip() {
        assert_eq!(clip("short", 5, |_| 1), "short");
        assert_eq!(clip("shorter", 5, |_| 1), "shor…");
        assert_eq!(clip("ééééé", 3, |_| 1), "éé…");
        assert_eq!(clip("a&b&c", 8, escaped_width), "a&b…");
        assert_eq!(clip("", 0, |_| 1), "");
    }
}
