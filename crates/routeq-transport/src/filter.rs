//! MQTT-style topic filter matching
//!
//! `+` matches exactly one level, a trailing `#` matches the remaining
//! levels (including none). Leading and trailing separators are ignored.

/// Level separator for topics and filters
pub const SEPARATOR: char = '/';

/// Single-level wildcard
pub const SINGLE_LEVEL: &str = "+";

/// Multi-level wildcard, only valid as the last level
pub const MULTI_LEVEL: &str = "#";

/// Check whether `topic` is selected by `filter`
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.trim_matches(SEPARATOR).split(SEPARATOR);
    let mut topic_levels = topic.trim_matches(SEPARATOR).split(SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return filter_levels.next().is_none(),
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
