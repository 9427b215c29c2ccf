//! `Cache-Control` directive parsing and rendering (RFC 9111 §5.2).

use std::fmt;

/// An ordered set of `Cache-Control` directives.
///
/// Directive names are compared case-insensitively and stored lowercased.
/// Values keep their original text with surrounding quotes removed.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::CacheControl;
///
/// let mut cc = CacheControl::parse("public, max-age=60, stale-if-error=\"30\"");
/// assert!(cc.has("public"));
/// assert_eq!(cc.seconds("max-age"), Some(60));
/// assert_eq!(cc.seconds("stale-if-error"), Some(30));
///
/// cc.remove("public");
/// cc.set("private", None);
/// assert_eq!(cc.to_string(), "max-age=60, stale-if-error=30, private");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    directives: Vec<(String, Option<String>)>,
}

impl CacheControl {
    /// Parses a header value. Malformed fragments are skipped.
    pub fn parse(value: &str) -> Self {
        let directives = value
            .split(',')
            .filter_map(|part| {
                let part = part.trim();
                if part.is_empty() {
                    return None;
                }
                match part.split_once('=') {
                    Some((name, value)) => Some((
                        name.trim().to_ascii_lowercase(),
                        Some(value.trim().trim_matches('"').to_owned()),
                    )),
                    None => Some((part.to_ascii_lowercase(), None)),
                }
            })
            .collect();
        Self { directives }
    }

    /// Returns `true` when the directive is present, with or without a value.
    pub fn has(&self, name: &str) -> bool {
        self.directives
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the directive's value, if the directive is present and has one.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.directives
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Returns a delta-seconds directive as an integer.
    pub fn seconds(&self, name: &str) -> Option<i64> {
        self.get(name)?.parse().ok()
    }

    /// Adds or replaces a directive.
    pub fn set(&mut self, name: &str, value: Option<String>) {
        let name = name.to_ascii_lowercase();
        match self.directives.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.directives.push((name, value)),
        }
    }

    /// Removes a directive. Returns `true` if it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.directives.len();
        self.directives.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.directives.len() < before
    }

    /// Returns `true` when no directives are present.
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.directives.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                Some(v) if v.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)) => {
                    write!(f, "{name}={v}")?
                }
                Some(v) => write!(f, "{name}=\"{v}\"")?,
                None => f.write_str(name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_directives() {
        let cc = CacheControl::parse("No-Cache, s-maxage=10,, max-age = 0");
        assert!(cc.has("no-cache"));
        assert_eq!(cc.seconds("s-maxage"), Some(10));
        assert_eq!(cc.seconds("max-age"), Some(0));
        assert_eq!(cc.get("no-cache"), None);
        assert!(!cc.has("private"));
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut cc = CacheControl::parse("max-age=5");
        cc.set("max-age", Some("10".into()));
        assert_eq!(cc.to_string(), "max-age=10");
    }

    #[test]
    fn quotes_values_that_need_it() {
        let mut cc = CacheControl::default();
        cc.set("no-cache", Some("Set-Cookie, X-Foo".into()));
        assert_eq!(cc.to_string(), "no-cache=\"Set-Cookie, X-Foo\"");
    }

    #[test]
    fn non_numeric_seconds_are_ignored() {
        let cc = CacheControl::parse("max-age=soon");
        assert_eq!(cc.seconds("max-age"), None);
    }
}
