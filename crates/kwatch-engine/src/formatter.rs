//! Notification rendering.
//!
//! Pure substitution of recognized placeholders plus styling and context
//! windows. Unknown placeholders are left verbatim on purpose: a malformed
//! user template must never break delivery.

use crate::config::{ContextConfig, FormatFlags, TRUNCATION_MARKER};
use crate::error::{Error, Result};
use crate::message::{MatchEvent, NotificationPayload};

/// Placeholders a template may reference.
pub const PLACEHOLDERS: &[&str] = &[
    "keyword",
    "group_name",
    "sender_id",
    "sender_username",
    "sender_name",
    "source",
];

/// Renders payloads into notification text.
#[derive(Debug, Clone)]
pub struct Formatter {
    template: String,
    format: FormatFlags,
    context: ContextConfig,
    max_len: usize,
    separator: String,
}

impl Formatter {
    pub fn new(
        template: impl Into<String>,
        format: FormatFlags,
        context: ContextConfig,
        max_len: usize,
        separator: impl Into<String>,
    ) -> Self {
        Self {
            template: template.into(),
            format,
            context,
            max_len,
            separator: separator.into(),
        }
    }

    /// Render a payload. Aggregated payloads render once per event,
    /// joined by the separator; the result is truncated at the length cap
    /// with an explicit marker.
    pub fn render(&self, payload: &NotificationPayload) -> String {
        let template = payload.policy.template.as_deref().unwrap_or(&self.template);
        let parts: Vec<String> = payload
            .events
            .iter()
            .map(|event| self.render_event(template, event, &payload.policy))
            .collect();

        let mut rendered = if parts.len() > 1 {
            let header = format!("{} aggregated matches for '{}'\n", parts.len(), payload.pattern);
            header + &parts.join(&self.separator)
        } else {
            parts.concat()
        };

        if rendered.chars().count() > self.max_len {
            let keep = self.max_len.saturating_sub(TRUNCATION_MARKER.chars().count());
            rendered = rendered.chars().take(keep).collect::<String>() + TRUNCATION_MARKER;
        }
        rendered
    }

    /// Styling flags in effect for this payload's subscription.
    pub fn effective_flags(&self, policy: &crate::subscription::DeliveryPolicy) -> FormatFlags {
        policy.format.unwrap_or(self.format)
    }

    fn render_event(
        &self,
        template: &str,
        event: &MatchEvent,
        policy: &crate::subscription::DeliveryPolicy,
    ) -> String {
        let message = &event.message;
        let mut out = substitute(template, |name| match name {
            "keyword" => Some(event.pattern.clone()),
            "group_name" => Some(message.source_name.clone()),
            "sender_id" => Some(
                message
                    .sender_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "N/A".to_string()),
            ),
            "sender_username" => {
                Some(message.sender_username.clone().unwrap_or_else(|| "N/A".to_string()))
            }
            "sender_name" => {
                Some(message.sender_name.clone().unwrap_or_else(|| "N/A".to_string()))
            }
            "source" => Some(message.source_kind.label().to_string()),
            _ => None,
        });

        let body = message.body();
        if !body.is_empty() {
            let flags = policy.format.unwrap_or(self.format);
            out.push('\n');
            out.push_str(&apply_style(body, flags));
        }

        let lines = policy
            .context_lines
            .unwrap_or(self.context.default_lines)
            .min(self.context.max_lines);
        if lines > 0 && !message.context_lines.is_empty() {
            out.push_str("\nContext:");
            for line in message.context_lines.iter().take(lines) {
                out.push_str("\n> ");
                out.push_str(line);
            }
        }
        out
    }
}

/// Substitute `{name}` placeholders via `resolve`; unresolved names and
/// unterminated braces are kept verbatim.
fn substitute(template: &str, resolve: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Wrap text in markdown-ish styling markers.
fn apply_style(text: &str, flags: FormatFlags) -> String {
    let mut styled = text.to_string();
    if flags.bold {
        styled = format!("*{styled}*");
    }
    if flags.italic {
        styled = format!("_{styled}_");
    }
    if flags.code {
        styled = format!("`{styled}`");
    }
    styled
}

/// Check that a template is usable: non-empty with balanced braces.
/// Unknown placeholder names are allowed by design.
pub fn validate_template(template: &str) -> Result<()> {
    if template.trim().is_empty() {
        return Err(Error::config("template must not be empty"));
    }
    let mut depth = 0i32;
    for c in template.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::config("template has an unmatched '}'"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::config("template has an unmatched '{'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IncomingMessage;
    use crate::message::SourceKind;
    use crate::subscription::DeliveryPolicy;
    use chrono::Utc;
    use std::sync::Arc;

    fn formatter(template: &str) -> Formatter {
        Formatter::new(
            template,
            FormatFlags::default(),
            ContextConfig::default(),
            4_000,
            "\n———\n",
        )
    }

    fn payload_with(template: &str, text: &str) -> NotificationPayload {
        let message = IncomingMessage::text(1, 1, text)
            .with_source_name("rust chat")
            .with_source_kind(SourceKind::Group)
            .with_sender(42, crate::message::SenderKind::User)
            .with_sender_names("alice", "Alice");
        NotificationPayload::from_events(vec![MatchEvent {
            owner_id: 1,
            subscription_id: 1,
            pattern: "foo".to_string(),
            policy: DeliveryPolicy {
                template: Some(template.to_string()),
                ..Default::default()
            },
            message: Arc::new(message),
            matched_at: Utc::now(),
        }])
        .unwrap()
    }

    #[test]
    fn test_placeholder_substitution() {
        let formatter = formatter("unused");
        let payload = payload_with("关键词：{keyword}", "");
        let mut payload = payload;
        payload.events[0].message = Arc::new(IncomingMessage::media(
            1,
            1,
            crate::message::ContentType::Photo,
        ));
        assert_eq!(formatter.render(&payload), "关键词：foo");
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let formatter = formatter("unused");
        let mut payload = payload_with("{keyword} and {bogus}", "");
        payload.events[0].message = Arc::new(IncomingMessage::media(
            1,
            1,
            crate::message::ContentType::Photo,
        ));
        assert_eq!(formatter.render(&payload), "foo and {bogus}");
    }

    #[test]
    fn test_all_placeholders_resolve() {
        let formatter = formatter("unused");
        let payload = payload_with(
            "{keyword}|{group_name}|{sender_id}|{sender_username}|{sender_name}|{source}",
            "body",
        );
        let rendered = formatter.render(&payload);
        assert!(rendered.starts_with("foo|rust chat|42|alice|Alice|group message"));
        assert!(rendered.contains("body"));
    }

    #[test]
    fn test_missing_sender_renders_na() {
        let formatter = formatter("unused");
        let mut payload = payload_with("{sender_id}/{sender_username}", "body");
        payload.events[0].message = Arc::new(IncomingMessage::text(1, 1, "body"));
        let rendered = formatter.render(&payload);
        assert!(rendered.starts_with("N/A/N/A"));
    }

    #[test]
    fn test_unterminated_brace_kept() {
        let formatter = formatter("unused");
        let mut payload = payload_with("tail {keyword", "");
        payload.events[0].message = Arc::new(IncomingMessage::media(
            1,
            1,
            crate::message::ContentType::Photo,
        ));
        assert_eq!(formatter.render(&payload), "tail {keyword");
    }

    #[test]
    fn test_styling_flags_wrap_body() {
        let formatter = Formatter::new(
            "{keyword}",
            FormatFlags {
                bold: true,
                code: true,
                italic: false,
            },
            ContextConfig::default(),
            4_000,
            "-",
        );
        let mut payload = payload_with("{keyword}", "hello");
        payload.policy.template = None;
        let rendered = formatter.render(&payload);
        assert_eq!(rendered, "foo\n`*hello*`");
    }

    #[test]
    fn test_context_lines_capped() {
        let formatter = formatter("{keyword}");
        let mut payload = payload_with("{keyword}", "body");
        let message = IncomingMessage::text(1, 1, "body").with_context_lines(vec![
            "one".into(),
            "two".into(),
            "three".into(),
            "four".into(),
            "five".into(),
            "six".into(),
            "seven".into(),
        ]);
        payload.events[0].message = Arc::new(message);
        payload.policy.context_lines = Some(100); // capped at max_lines = 5
        let rendered = formatter.render(&payload);
        assert!(rendered.contains("> five"));
        assert!(!rendered.contains("> six"));
    }

    #[test]
    fn test_aggregated_render_joins_and_counts() {
        let formatter = formatter("unused");
        let mut payload = payload_with("{keyword}", "first");
        let second = MatchEvent {
            message: Arc::new(IncomingMessage::text(1, 2, "second")),
            ..payload.events[0].clone()
        };
        payload.events.push(second);

        let rendered = formatter.render(&payload);
        assert!(rendered.starts_with("2 aggregated matches for 'foo'"));
        assert!(rendered.contains("first"));
        assert!(rendered.contains("second"));
        assert!(rendered.contains("———"));
    }

    #[test]
    fn test_truncation_with_marker() {
        let formatter = Formatter::new(
            "{keyword}",
            FormatFlags::default(),
            ContextConfig::default(),
            20,
            "-",
        );
        let long_text = "x".repeat(100);
        let payload = payload_with("{keyword}", &long_text);
        let rendered = formatter.render(&payload);
        assert!(rendered.chars().count() <= 20);
        assert!(rendered.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_validate_template() {
        assert!(validate_template("{keyword} seen").is_ok());
        assert!(validate_template("{unknown} is fine").is_ok());
        assert!(validate_template("").is_err());
        assert!(validate_template("unmatched {").is_err());
        assert!(validate_template("unmatched }").is_err());
    }
}
