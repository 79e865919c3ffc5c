//! Denylisted response markers

use memchr::memmem;

/// A literal byte pattern that blocks a response
#[derive(Debug, Clone, Copy)]
pub struct SentryRule {
    pub name: &'static str,
    pub exact: &'static [u8],
}

pub const RULES: &[SentryRule] = &[
    SentryRule {
        name: "doc_write",
        exact: b"document.write(",
    },
    SentryRule {
        name: "passwd_input",
        exact: b"type=\"password\"",
    },
];

/// Name of the first rule found in `data`
pub fn check_sentry_rules(data: &[u8]) -> Option<&'static str> {
    RULES
        .iter()
        .find(|rule| memmem::find(data, rule.exact).is_some())
        .map(|rule| rule.name)
}
