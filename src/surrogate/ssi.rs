//! Server Side Includes: `<!--#include virtual="…" -->`.
//!
//! Only the `virtual` form is understood. There is no fallback URI and a
//! failing include always fails the page.

use super::{Fragment, Surrogate, SurrogateError, Template, attribute, split_tags};

const INCLUDE_OPEN: &str = "<!--#include";
const INCLUDE_CLOSE: &str = "-->";

/// The SSI dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ssi;

impl Surrogate for Ssi {
    fn name(&self) -> &'static str {
        "ssi"
    }

    fn include_marker(&self) -> &'static str {
        INCLUDE_OPEN
    }

    fn render_include_tag(
        &self,
        uri: &str,
        _alt: Option<&str>,
        _ignore_errors: bool,
        _comment: Option<&str>,
    ) -> String {
        format!("<!--#include virtual=\"{uri}\" -->")
    }

    fn parse(&self, content: &str) -> Result<Template, SurrogateError> {
        split_tags(content, next_include, |attributes| {
            let src = attribute(attributes, "virtual").ok_or(SurrogateError::MissingAttribute {
                tag: "SSI",
                attribute: "virtual",
            })?;
            Ok(Fragment::Include {
                src: src.to_owned(),
                alt: None,
                ignore_errors: false,
            })
        })
    }
}

fn next_include(content: &str) -> Option<(usize, &str, usize)> {
    let mut offset = 0;
    loop {
        let start = offset + content[offset..].find(INCLUDE_OPEN)?;
        let after = start + INCLUDE_OPEN.len();
        let tail = &content[after..];
        if !tail.starts_with(char::is_whitespace) {
            offset = after;
            continue;
        }
        let end = tail.find(INCLUDE_CLOSE)?;
        return Some((start, tail[..end].trim(), after + end + INCLUDE_CLOSE.len()));
    }
}
