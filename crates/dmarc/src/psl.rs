//! Organisational domain resolution backed by the Public Suffix List.
//!
//! The list is compiled into the binary and indexed once; the resulting
//! `PslIndex` is immutable and safe to share across threads.

use once_cell::sync::Lazy;
use std::collections::HashSet;

static EMBEDDED: Lazy<PslIndex> =
    Lazy::new(|| PslIndex::parse(include_str!("../data/public_suffix_list.dat")));

#[derive(Debug, Default)]
pub struct PslIndex {
    rules: HashSet<String>,
    /// Entries listed as `*.foo`, stored without the leading `*.`
    wildcards: HashSet<String>,
    /// Entries listed as `!foo`, stored without the leading `!`
    exceptions: HashSet<String>,
}

impl PslIndex {
    /// The index built from the compiled-in copy of the list.
    pub fn embedded() -> &'static Self {
        &EMBEDDED
    }

    /// Build an index from the text form of the list.
    /// Blank lines and `//` comments are skipped.
    pub fn parse(text: &str) -> Self {
        let mut index = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            // Only the first token of a line is a rule; anything after
            // whitespace is commentary.
            let entry = match line.split_whitespace().next() {
                Some(entry) => entry.to_ascii_lowercase(),
                None => continue,
            };

            if let Some(rest) = entry.strip_prefix('!') {
                index.exceptions.insert(rest.to_string());
            } else if let Some(rest) = entry.strip_prefix("*.") {
                index.wildcards.insert(rest.to_string());
            } else {
                index.rules.insert(entry);
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.rules.len() + self.wildcards.len() + self.exceptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute the organisational domain of `domain`: the registrable
    /// domain one label below the matching public suffix, used for
    /// relaxed DMARC alignment.
    ///
    /// Candidate suffixes are tried left to right; for each candidate the
    /// exception set is consulted first, then wildcards, then plain rules,
    /// and the first match decides the answer. A domain that matches
    /// nothing is returned unchanged.
    pub fn org_domain(&self, domain: &str) -> String {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let labels: Vec<&str> = domain.split('.').collect();

        for i in 0..labels.len() {
            let candidate = labels[i..].join(".");

            if self.exceptions.contains(&candidate) {
                // An exception is itself registrable
                return candidate;
            }

            if self.wildcards.contains(&candidate) {
                // The wildcard suffix occupies one label below the
                // matched entry, so the registrable domain keeps two
                return match i {
                    0 => candidate,
                    1 => domain,
                    _ => labels[i - 2..].join("."),
                };
            }

            if self.rules.contains(&candidate) {
                return match i {
                    0 => domain,
                    _ => labels[i - 1..].join("."),
                };
            }
        }

        domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classification() {
        let index = PslIndex::parse(
            "// a comment\n\
             \n\
             com\n\
             *.ck\n\
             !www.ck\n",
        );
        k9::assert_equal!(index.len(), 3);
    }

    #[test]
    fn test_org_domain_plain_rule() {
        let psl = PslIndex::embedded();
        k9::assert_equal!(psl.org_domain("example.com"), "example.com");
        k9::assert_equal!(psl.org_domain("bbb.aaa.example.com"), "example.com");
    }

    #[test]
    fn test_org_domain_wildcard() {
        let psl = PslIndex::embedded();
        k9::assert_equal!(
            psl.org_domain("bar.foo.abc.sapporo.jp"),
            "foo.abc.sapporo.jp"
        );
    }

    #[test]
    fn test_org_domain_exception() {
        let psl = PslIndex::embedded();
        k9::assert_equal!(psl.org_domain("abc.city.sapporo.jp"), "city.sapporo.jp");
    }

    #[test]
    fn test_org_domain_exception_under_tld_wildcard() {
        let psl = PslIndex::embedded();
        k9::assert_equal!(psl.org_domain("a.www.ck"), "www.ck");
    }

    #[test]
    fn test_org_domain_no_match() {
        let psl = PslIndex::embedded();
        k9::assert_equal!(psl.org_domain("intranet.localdomain"), "intranet.localdomain");
    }

    #[test]
    fn test_org_domain_bare_suffix() {
        let psl = PslIndex::embedded();
        // A bare public suffix has no registrable part; it comes back as-is
        k9::assert_equal!(psl.org_domain("com"), "com");
        k9::assert_equal!(psl.org_domain("co.uk"), "co.uk");
    }

    #[test]
    fn test_org_domain_case_and_trailing_dot() {
        let psl = PslIndex::embedded();
        k9::assert_equal!(psl.org_domain("Mail.Example.COM."), "example.com");
    }
}
