//! Topic filter compilation and matching.
//!
//! `+` matches exactly one level; `#` matches zero or more trailing
//! levels and is only legal as the final segment. Compiled as a small
//! segment matcher rather than a general regex engine, since the
//! grammar is exactly three shapes.

/// True if `filter` contains a wildcard character.
pub fn is_wildcard(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
}

/// A compiled wildcard topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    segments: Vec<Segment>,
    multi_level: bool,
}

impl Matcher {
    /// Compile `filter`. Returns `None` if `filter` is not a wildcard
    /// (callers should use exact string lookup for those instead).
    pub fn compile(filter: &str) -> Option<Self> {
        if !is_wildcard(filter) {
            return None;
        }
        let mut segments = Vec::new();
        let mut multi_level = false;
        let parts: Vec<&str> = filter.split('/').collect();
        for (i, part) in parts.iter().enumerate() {
            match *part {
                "#" => {
                    multi_level = true;
                    debug_assert_eq!(i, parts.len() - 1, "# must be the last segment");
                }
                "+" => segments.push(Segment::SingleLevel),
                other => segments.push(Segment::Literal(other.to_string())),
            }
        }
        Some(Matcher { segments, multi_level })
    }

    /// Does this compiled filter match `topic`?
    pub fn matches(&self, topic: &str) -> bool {
        let levels: Vec<&str> = topic.split('/').collect();
        if levels.len() < self.segments.len() {
            return false;
        }
        if !self.multi_level && levels.len() != self.segments.len() {
            return false;
        }
        for (seg, level) in self.segments.iter().zip(levels.iter()) {
            match seg {
                Segment::Literal(s) => {
                    if s != level {
                        return false;
                    }
                }
                Segment::SingleLevel => {}
            }
        }
        true
    }
}

/// Validate that a subscribed filter's `#`, if present, is the final
/// segment and not glued to a sibling character (e.g. `sport#`).
pub fn validate_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    for part in filter.split('/') {
        if part.contains('#') && part != "#" {
            return false;
        }
        if part.contains('+') && part != "+" {
            return false;
        }
    }
    if let Some(pos) = filter.find('#') {
        pos == filter.len() - 1
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_is_not_wildcard() {
        assert!(Matcher::compile("/a/b").is_none());
    }

    #[test]
    fn single_level_wildcard() {
        let m = Matcher::compile("sport/+/player1").unwrap();
        assert!(m.matches("sport/tennis/player1"));
        assert!(!m.matches("sport/tennis/player1/ranking"));
        assert!(!m.matches("sport/player1"));
    }

    #[test]
    fn multi_level_wildcard() {
        let m = Matcher::compile("#").unwrap();
        assert!(m.matches("sport/tennis/player1"));
        assert!(m.matches("anything"));
    }

    #[test]
    fn multi_level_trailing_wildcard() {
        let m = Matcher::compile("sport/#").unwrap();
        assert!(m.matches("sport"));
        assert!(m.matches("sport/tennis"));
        assert!(m.matches("sport/tennis/player1"));
        assert!(!m.matches("other/tennis"));
    }

    #[test]
    fn validate_rejects_embedded_wildcards() {
        assert!(!validate_filter("sport#"));
        assert!(!validate_filter("sp+ort"));
        assert!(validate_filter("sport/#"));
        assert!(validate_filter("sport/+/player1"));
    }
}
