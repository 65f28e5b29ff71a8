//! Pattern matching for listener and subscriber registrations.
//!
//! Three pattern forms are accepted:
//!
//! - `"*"` matches every event type.
//! - `"<prefix>.*"` matches any type starting with `"<prefix>."`.
//! - anything else matches by exact equality.
//!
//! There are no multi-segment wildcards, character classes, or brace
//! expansion, and matching never allocates.

/// Returns `true` if `event_type` matches `pattern`.
pub(crate) fn matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(head) = pattern.strip_suffix(".*") {
        // The star stands for the suffix beyond the first dot, so the type
        // must continue past `head` with a literal dot.
        return event_type
            .strip_prefix(head)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    pattern == event_type
}

/// Extracts the handler prefix from an event type: the segment before the
/// first dot, or the whole string when there is no dot.
pub(crate) fn prefix_of(event_type: &str) -> &str {
    match event_type.split_once('.') {
        Some((prefix, _)) => prefix,
        None => event_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universal() {
        assert!(matches("*", "foo.bar"));
        assert!(matches("*", "nodot"));
        assert!(matches("*", ""));
    }

    #[test]
    fn prefix_wildcard() {
        assert!(matches("foo.*", "foo.bar"));
        assert!(matches("foo.*", "foo.bar.baz"));
        assert!(!matches("foo.*", "foo"));
        assert!(!matches("foo.*", "foobar.baz"));
        assert!(!matches("foo.*", "bar.foo"));
    }

    #[test]
    fn exact() {
        assert!(matches("foo.bar", "foo.bar"));
        assert!(!matches("foo.bar", "foo.baz"));
        assert!(!matches("foo.bar", "foo.bar.baz"));
    }

    #[test]
    fn prefix_extraction() {
        assert_eq!(prefix_of("trace.add"), "trace");
        assert_eq!(prefix_of("job.progress.step"), "job");
        assert_eq!(prefix_of("nodot"), "nodot");
        assert_eq!(prefix_of(""), "");
    }
}
