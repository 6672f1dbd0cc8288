//! Topic name/filter validation and wildcard matching.
//!
//! Matching walks both strings level by level: `+` consumes exactly one
//! level, `#` the remainder (and must be last). Filters whose first level
//! is a wildcard never match topics rooted at `$`, which reserves the
//! `$SYS`-style namespaces.

pub const SHARE_PREFIX: &str = "$share/";

/// A published topic name: non-empty, no wildcards, no U+0000.
pub fn validate_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && !topic.contains(['+', '#'])
        && !topic.contains('\u{0}')
}

/// A subscription filter: non-empty, `+` alone in its level, `#` alone in
/// the last level.
pub fn validate_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\u{0}') {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        match *level {
            "+" => {}
            "#" => {
                if i != last {
                    return false;
                }
            }
            other => {
                if other.contains(['+', '#']) {
                    return false;
                }
            }
        }
    }
    true
}

/// Whether `filter` matches `topic`. Both are assumed validated.
pub fn matches(filter: &str, topic: &str) -> bool {
    // Wildcard at the root never crosses into `$`-reserved topics.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            // "#" swallows the rest; "a/#" also matches the parent "a".
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fp), Some(tp)) => {
                if fp != tp {
                    return false;
                }
            }
            (None, None) => return true,
            (Some(_), None) | (None, Some(_)) => return false,
        }
    }
}

/// A `$share/<group>/<filter>` shared-subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFilter<'a> {
    pub group: &'a str,
    pub filter: &'a str,
}

impl<'a> SharedFilter<'a> {
    /// Split a shared filter into group and inner filter; `None` when the
    /// input is not a shared subscription at all.
    pub fn parse(raw: &'a str) -> Option<Result<Self, ()>> {
        let rest = raw.strip_prefix(SHARE_PREFIX)?;
        let Some((group, filter)) = rest.split_once('/') else {
            return Some(Err(()));
        };
        if group.is_empty()
            || group.contains(['+', '#'])
            || !validate_topic_filter(filter)
        {
            return Some(Err(()));
        }
        Some(Ok(SharedFilter { group, filter }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_topic_name("a/b"));
        assert!(validate_topic_name("$SYS/uptime"));
        assert!(!validate_topic_name(""));
        assert!(!validate_topic_name("a/+"));
        assert!(!validate_topic_name("a/#"));
        assert!(!validate_topic_name("a\u{0}b"));
    }

    #[test]
    fn filter_validation() {
        assert!(validate_topic_filter("a/b"));
        assert!(validate_topic_filter("a/+/c"));
        assert!(validate_topic_filter("a/#"));
        assert!(validate_topic_filter("#"));
        assert!(validate_topic_filter("+"));
        assert!(!validate_topic_filter(""));
        assert!(!validate_topic_filter("a/#/b"));
        assert!(!validate_topic_filter("a/b#"));
        assert!(!validate_topic_filter("a/+b"));
    }

    #[test]
    fn match_reference_table() {
        for (filter, topic, expected) in [
            ("a/b", "a/b", true),
            ("a/+", "a/b", true),
            ("a/+", "a/b/c", false),
            ("a/#", "a/b/c", true),
            ("#", "a", true),
            ("#", "$SYS/x", false),
            ("+/b", "$SYS/b", false),
            ("$SYS/#", "$SYS/x", true),
        ] {
            assert_eq!(matches(filter, topic), expected, "{filter} vs {topic}");
        }
    }

    #[test]
    fn multi_level_matches_parent() {
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b"));
        assert!(!matches("a/+", "a"));
    }

    #[test]
    fn empty_levels_are_significant() {
        assert!(matches("a//b", "a//b"));
        assert!(matches("a/+/b", "a//b"));
        assert!(!matches("a/b", "a//b"));
    }

    #[test]
    fn shared_filter_parsing() {
        let parsed = SharedFilter::parse("$share/g1/room/+").unwrap().unwrap();
        assert_eq!(parsed.group, "g1");
        assert_eq!(parsed.filter, "room/+");

        assert!(SharedFilter::parse("room/+").is_none());
        assert!(SharedFilter::parse("$share//x").unwrap().is_err());
        assert!(SharedFilter::parse("$share/g").unwrap().is_err());
        assert!(SharedFilter::parse("$share/g/").unwrap().is_err());
    }
}
