/// A filter pattern which matches log lines containing all of its terms.
///
/// Terms are case-sensitive, and match whole tokens of the line: `ERROR`
/// matches `"[ERROR] refund failed"` but not `"ERRORS: 2"` or `"error"`.
#[derive(Debug, Clone, PartialEq)]
pub struct TermFilter {
    terms: Vec<String>,
}

impl TermFilter {
    pub fn all_terms<I, T>(terms: I) -> TermFilter
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        TermFilter {
            terms: terms.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, line: &str) -> bool {
        self.terms.iter().all(|term| {
            line.split(|c: char| !(c.is_alphanumeric() || c == '_'))
                .any(|token| token == term)
        })
    }
}

impl std::fmt::Display for TermFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.terms.join(" "))
    }
}
