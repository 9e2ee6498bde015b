//! Alias substitution in query text before dispatch to a backend

use super::AliasMap;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::OnceLock;

fn curie_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Bracketed aliases, then IRIs and string literals, are matched first so
    // their content is never taken for a bare `prefix:local`.
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"<(?P<bprefix>[A-Za-z][A-Za-z0-9_\-]*):(?P<blocal>[^<>\s]*)>|<[^<>\s]*>|"(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'|(?P<prefix>[A-Za-z][A-Za-z0-9_\-]*):(?P<local>[A-Za-z0-9_][A-Za-z0-9_\-]*)"#,
        )
        .expect("CURIE pattern is valid")
    })
}

/// Replace `prefix:local` and `<prefix:local>` whose prefix is known with `<namespace+local>`
///
/// Unknown prefixes, absolute IRIs and quoted literals are left untouched.
pub fn rewrite_query<'a>(query: &'a str, aliases: &AliasMap) -> Cow<'a, str> {
    if aliases.is_empty() {
        return Cow::Borrowed(query);
    }

    curie_pattern().replace_all(query, |caps: &Captures<'_>| {
        match (caps.name("prefix"), caps.name("local")) {
            (Some(prefix), Some(local)) => match aliases.get(prefix.as_str()) {
                Some(namespace) => format!("<{}{}>", namespace, local.as_str()),
                None => caps[0].to_string(),
            },
            _ => match (caps.name("bprefix"), caps.name("blocal")) {
                // `<scheme://...>` is an absolute IRI even if the scheme is aliased
                (Some(prefix), Some(local)) if !local.as_str().starts_with("//") => {
                    match aliases.get(prefix.as_str()) {
                        Some(namespace) => format!("<{}{}>", namespace, local.as_str()),
                        None => caps[0].to_string(),
                    }
                }
                _ => caps[0].to_string(),
            },
        }
    })
}
