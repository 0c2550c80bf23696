//! Article headers and outbound article representation
//!
//! Headers are an ordered multimap with case-insensitive names, mirroring
//! RFC 5322: repeated names are preserved in order, lookups ignore case, and
//! folded continuation lines are joined with a single space during parsing.

use super::MessageId;

/// Ordered multimap of article headers with case-insensitive names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, case-insensitive
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a value, preserving insertion order
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values for `name` with a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.push((name.to_string(), value.into()));
    }

    /// Append a folded continuation line to the most recent header
    ///
    /// RFC 5322 §2.2.3: folding whitespace is replaced with a single space.
    pub fn fold_into_last(&mut self, continuation: &str) {
        if let Some((_, v)) = self.entries.last_mut() {
            v.push(' ');
            v.push_str(continuation.trim_start());
        }
    }

    /// Iterate `(name, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse one `Name: value` line into the map; continuation lines
    /// (leading space or tab) fold into the previous entry.
    ///
    /// Returns false for lines that are neither, which callers treat as a
    /// framing error.
    pub fn parse_line(&mut self, line: &str) -> bool {
        if line.starts_with(' ') || line.starts_with('\t') {
            if self.entries.is_empty() {
                return false;
            }
            self.fold_into_last(line);
            return true;
        }
        match line.split_once(':') {
            Some((name, value)) if !name.is_empty() && !name.contains(' ') => {
                self.add(name, value.trim_start());
                true
            }
            _ => false,
        }
    }
}

/// An article assembled from an HTTP POST, ready to hand to `CmdPost`
#[derive(Debug)]
pub struct OutboundArticle {
    pub message_id: MessageId,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_get() {
        let mut h = Headers::new();
        h.add("Subject", "Test");
        assert_eq!(h.get("subject"), Some("Test"));
        assert_eq!(h.get("SUBJECT"), Some("Test"));
        assert_eq!(h.get("From"), None);
    }

    #[test]
    fn test_multimap_preserves_order() {
        let mut h = Headers::new();
        h.add("Path", "a");
        h.add("Received", "x");
        h.add("Path", "b");

        let items: Vec<_> = h.iter().collect();
        assert_eq!(items, vec![("Path", "a"), ("Received", "x"), ("Path", "b")]);
        assert_eq!(h.get("Path"), Some("a"));
    }

    #[test]
    fn test_set_replaces_all_values() {
        let mut h = Headers::new();
        h.add("Subject", "one");
        h.add("subject", "two");
        h.set("Subject", "three");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("subject"), Some("three"));
    }

    #[test]
    fn test_parse_line_and_folding() {
        let mut h = Headers::new();
        assert!(h.parse_line("Subject: a long"));
        assert!(h.parse_line("\tsubject line"));
        assert!(h.parse_line("From: user@example.com"));
        assert_eq!(h.get("Subject"), Some("a long subject line"));
        assert_eq!(h.get("From"), Some("user@example.com"));
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        let mut h = Headers::new();
        assert!(!h.parse_line("no colon here"));
        assert!(!h.parse_line(": empty name"));
        // Continuation with nothing to continue
        assert!(!h.parse_line(" orphan fold"));
    }
}
