//! Server-side message filtering for `get_message`.

use crate::hash::tags_hash_code;
use crate::message::StoredRecord;
use std::collections::HashSet;

/// Decides which records a pull returns.
///
/// `matches_tags_code` runs against the consume queue entry before the
/// record is read; `matches_record` sees the decoded record and can reject
/// hash collisions.
pub trait MessageFilter: Send + Sync {
    fn matches_tags_code(&self, tags_code: u64) -> bool;

    fn matches_record(&self, _record: &StoredRecord) -> bool {
        true
    }
}

/// Tag subscription such as `"TagA || TagB"`; `"*"` or an empty expression
/// accepts everything.
#[derive(Debug, Clone)]
pub struct TagFilter {
    tags: HashSet<String>,
    codes: HashSet<u64>,
}

impl TagFilter {
    pub fn new(expression: &str) -> Self {
        let tags: HashSet<String> = expression
            .split("||")
            .map(str::trim)
            .filter(|t| !t.is_empty() && *t != "*")
            .map(str::to_string)
            .collect();
        let codes = tags.iter().map(|t| tags_hash_code(Some(t))).collect();
        Self { tags, codes }
    }

    pub fn accepts_all(&self) -> bool {
        self.tags.is_empty()
    }
}

impl MessageFilter for TagFilter {
    fn matches_tags_code(&self, tags_code: u64) -> bool {
        self.accepts_all() || self.codes.contains(&tags_code)
    }

    fn matches_record(&self, record: &StoredRecord) -> bool {
        self.accepts_all() || record.tags().is_some_and(|t| self.tags.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expression() {
        let filter = TagFilter::new(" TagA || TagB ");
        assert!(!filter.accepts_all());
        assert!(filter.matches_tags_code(tags_hash_code(Some("TagA"))));
        assert!(filter.matches_tags_code(tags_hash_code(Some("TagB"))));
        assert!(!filter.matches_tags_code(tags_hash_code(Some("TagC"))));
        assert!(!filter.matches_tags_code(0));
    }

    #[test]
    fn test_wildcard() {
        for expr in ["*", "", "  "] {
            let filter = TagFilter::new(expr);
            assert!(filter.accepts_all());
            assert!(filter.matches_tags_code(12345));
        }
    }
}
