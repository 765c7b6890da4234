//! Dotted event-type pattern matching.
//!
//! A pattern is either an exact event type (`job.completed`), a prefix glob
//! whose trailing `*` matches one or more remaining segments (`job.*`), or
//! the catch-all `*`.

pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    match pattern.strip_suffix(".*") {
        Some(prefix) => {
            event_type.len() > prefix.len() + 1
                && event_type.starts_with(prefix)
                && event_type.as_bytes()[prefix.len()] == b'.'
        }
        None => pattern == event_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(pattern_matches("job.completed", "job.completed"));
        assert!(!pattern_matches("job.completed", "job.failed"));
    }

    #[test]
    fn prefix_glob_matches_lifecycle_family() {
        for t in ["job.queued", "job.started", "job.progress", "job.completed", "job.failed"] {
            assert!(pattern_matches("job.*", t), "{t}");
        }
        assert!(!pattern_matches("job.*", "credits.added"));
        assert!(!pattern_matches("credits.*", "job.queued"));
    }

    #[test]
    fn glob_requires_a_segment_after_the_dot() {
        assert!(!pattern_matches("job.*", "job"));
        assert!(!pattern_matches("job.*", "jobs.queued"));
    }

    #[test]
    fn catch_all() {
        assert!(pattern_matches("*", "job.queued"));
        assert!(pattern_matches("*", "credits.added"));
    }
}
