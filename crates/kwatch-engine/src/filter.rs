//! Stateless filter predicates evaluated before pattern matching.
//!
//! A filter never mutates anything and holds no state, so it is safe to
//! evaluate from any number of matcher workers without coordination.

use std::collections::HashSet;

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::message::{ContentType, IncomingMessage, SenderKind};

/// Daily window of UTC hours in which a subscription is active.
///
/// The start hour is inclusive, the end hour exclusive. `start > end`
/// wraps past midnight (22-6 covers the night); `start == end` means all
/// day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u8,
    pub end: u8,
}

impl HourRange {
    pub fn contains(&self, hour: u32) -> bool {
        let (start, end) = (u32::from(self.start), u32::from(self.end));
        if start == end {
            true
        } else if start < end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        }
    }
}

/// Per-subscription filter options.
///
/// `None` set fields mean "allow everything" for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionFilters {
    /// Allowed content types.
    pub content_types: Option<HashSet<ContentType>>,
    /// Allowed sender categories.
    pub sender_kinds: Option<HashSet<SenderKind>>,
    /// Restrict matching to these source ids.
    pub source_ids: Option<HashSet<i64>>,
    /// Daily hour window (UTC) outside of which the subscription sleeps.
    pub active_hours: Option<HourRange>,
    /// Minimum text length in characters.
    pub min_length: Option<usize>,
    /// Maximum text length in characters.
    pub max_length: Option<usize>,
    /// Any of these substrings present rejects the message.
    pub exclude_keywords: Vec<String>,
}

impl SubscriptionFilters {
    /// True when the filter allows the given content type.
    pub fn allows_content(&self, content_type: ContentType) -> bool {
        match &self.content_types {
            Some(set) => set.contains(&content_type),
            None => true,
        }
    }
}

/// Evaluate a message against a subscription's filters.
///
/// Pure predicate: message type membership, sender category membership,
/// source allow-list, daily active hours, text length bounds, and
/// exclusion keywords.
pub fn passes(message: &IncomingMessage, filters: &SubscriptionFilters) -> bool {
    if !filters.allows_content(message.content_type) {
        return false;
    }

    if let Some(kinds) = &filters.sender_kinds
        && !kinds.contains(&message.sender_kind)
    {
        return false;
    }

    if let Some(sources) = &filters.source_ids
        && !sources.contains(&message.source_id)
    {
        return false;
    }

    if let Some(hours) = &filters.active_hours
        && !hours.contains(message.received_at.hour())
    {
        return false;
    }

    let text = message.body();
    let len = text.chars().count();
    if let Some(min) = filters.min_length
        && len < min
    {
        return false;
    }
    if let Some(max) = filters.max_length
        && len > max
    {
        return false;
    }

    if !filters.exclude_keywords.is_empty() {
        let lowered = text.to_lowercase();
        for word in &filters.exclude_keywords {
            if lowered.contains(&word.to_lowercase()) {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(text: &str) -> IncomingMessage {
        IncomingMessage::text(1, 1, text)
    }

    #[test]
    fn test_empty_filters_pass_everything() {
        let filters = SubscriptionFilters::default();
        assert!(passes(&text_message("anything"), &filters));
        assert!(passes(
            &IncomingMessage::media(1, 1, ContentType::Photo),
            &filters
        ));
    }

    #[test]
    fn test_content_type_membership() {
        let filters = SubscriptionFilters {
            content_types: Some([ContentType::Text].into_iter().collect()),
            ..Default::default()
        };
        assert!(passes(&text_message("hi"), &filters));
        assert!(!passes(
            &IncomingMessage::media(1, 1, ContentType::Video),
            &filters
        ));
    }

    #[test]
    fn test_sender_kind_membership() {
        let filters = SubscriptionFilters {
            sender_kinds: Some([SenderKind::Admin].into_iter().collect()),
            ..Default::default()
        };
        let admin = text_message("hi").with_sender(7, SenderKind::Admin);
        let user = text_message("hi").with_sender(8, SenderKind::User);
        assert!(passes(&admin, &filters));
        assert!(!passes(&user, &filters));
    }

    #[test]
    fn test_source_allow_list() {
        let filters = SubscriptionFilters {
            source_ids: Some([42].into_iter().collect()),
            ..Default::default()
        };
        assert!(passes(&IncomingMessage::text(42, 1, "hi"), &filters));
        assert!(!passes(&IncomingMessage::text(43, 1, "hi"), &filters));
    }

    #[test]
    fn test_length_bounds() {
        let filters = SubscriptionFilters {
            min_length: Some(3),
            max_length: Some(5),
            ..Default::default()
        };
        assert!(!passes(&text_message("hi"), &filters));
        assert!(passes(&text_message("hello"), &filters));
        assert!(!passes(&text_message("toolong"), &filters));
    }

    #[test]
    fn test_active_hours_window() {
        use chrono::TimeZone;
        use chrono::Utc;

        let filters = SubscriptionFilters {
            active_hours: Some(HourRange { start: 8, end: 22 }),
            ..Default::default()
        };
        let at = |hour| {
            let mut message = text_message("hi");
            message.received_at = Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap();
            message
        };
        assert!(passes(&at(8), &filters));
        assert!(passes(&at(21), &filters));
        assert!(!passes(&at(22), &filters));
        assert!(!passes(&at(3), &filters));
    }

    #[test]
    fn test_active_hours_wrap_past_midnight() {
        assert!(HourRange { start: 22, end: 6 }.contains(23));
        assert!(HourRange { start: 22, end: 6 }.contains(2));
        assert!(!HourRange { start: 22, end: 6 }.contains(12));
        // Degenerate range means always active.
        assert!(HourRange { start: 5, end: 5 }.contains(17));
    }

    #[test]
    fn test_exclude_keywords_are_case_insensitive() {
        let filters = SubscriptionFilters {
            exclude_keywords: vec!["spam".to_string()],
            ..Default::default()
        };
        assert!(!passes(&text_message("buy SPAM now"), &filters));
        assert!(passes(&text_message("buy ham now"), &filters));
    }
}
