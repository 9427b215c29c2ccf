//! Edge Side Includes (ESI/1.0).
//!
//! Supported markup:
//!
//! - `<esi:include src="…" [alt="…"] [onerror="continue"] />`, also written
//!   with an explicit `</esi:include>` closing tag
//! - `<esi:remove>…</esi:remove>` blocks, dropped with their contents
//! - `<esi:comment text="…" />` tags, dropped

use super::{Fragment, Surrogate, SurrogateError, Template, attribute, split_tags, strip_blocks};

const INCLUDE_OPEN: &str = "<esi:include";
const INCLUDE_CLOSE: &str = "</esi:include>";
const REMOVE_OPEN: &str = "<esi:remove>";
const REMOVE_CLOSE: &str = "</esi:remove>";
const COMMENT_OPEN: &str = "<esi:comment";

/// The ESI dialect.
///
/// # Examples
///
/// ```
/// use rttp_cache::surrogate::{Esi, Fragment, Surrogate};
///
/// let template = Esi.parse(r#"<p><esi:include src="/clock" onerror="continue"/></p>"#).unwrap();
/// assert_eq!(
///     template.fragments()[1],
///     Fragment::Include { src: "/clock".into(), alt: None, ignore_errors: true },
/// );
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Esi;

impl Surrogate for Esi {
    fn name(&self) -> &'static str {
        "esi"
    }

    fn include_marker(&self) -> &'static str {
        INCLUDE_OPEN
    }

    fn render_include_tag(
        &self,
        uri: &str,
        alt: Option<&str>,
        ignore_errors: bool,
        comment: Option<&str>,
    ) -> String {
        let mut tag = format!("<esi:include src=\"{uri}\"");
        if ignore_errors {
            tag.push_str(" onerror=\"continue\"");
        }
        if let Some(alt) = alt.filter(|alt| !alt.is_empty()) {
            tag.push_str(&format!(" alt=\"{alt}\""));
        }
        tag.push_str(" />");

        match comment.filter(|c| !c.is_empty()) {
            Some(comment) => format!("<esi:comment text=\"{comment}\" />\n{tag}"),
            None => tag,
        }
    }

    fn parse(&self, content: &str) -> Result<Template, SurrogateError> {
        let content = strip_blocks(content, REMOVE_OPEN, REMOVE_CLOSE);
        let content = strip_comments(&content);
        split_tags(&content, next_include, |attributes| {
            let src = attribute(attributes, "src").ok_or(SurrogateError::MissingAttribute {
                tag: "ESI",
                attribute: "src",
            })?;
            Ok(Fragment::Include {
                src: src.to_owned(),
                alt: attribute(attributes, "alt")
                    .filter(|alt| !alt.is_empty())
                    .map(str::to_owned),
                ignore_errors: attribute(attributes, "onerror") == Some("continue"),
            })
        })
    }
}

fn strip_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find(COMMENT_OPEN) {
        let after = &rest[start + COMMENT_OPEN.len()..];
        let Some(end) = after.find('>').filter(|&end| end > 0) else {
            break;
        };
        out.push_str(&rest[..start]);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Finds the first include tag: `(start, attributes, end)`.
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

        let self_closing = tail.find("/>").map(|i| (i, i + 2));
        let closed = tail.find(INCLUDE_CLOSE).map(|i| (i, i + INCLUDE_CLOSE.len()));
        let (attributes_end, tag_end) = match (self_closing, closed) {
            (Some(a), Some(b)) => {
                if a.0 <= b.0 {
                    a
                } else {
                    b
                }
            }
            (a, b) => a.or(b)?,
        };
        return Some((start, tail[..attributes_end].trim(), after + tag_end));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Method, Request, Response, StatusCode};

    fn include(src: &str, alt: Option<&str>, ignore_errors: bool) -> Fragment {
        Fragment::Include {
            src: src.into(),
            alt: alt.map(Into::into),
            ignore_errors,
        }
    }

    fn html(body: &str) -> Response {
        Response::new(StatusCode::Ok)
            .header("Content-Type", "text/html; charset=utf-8")
            .header("Surrogate-Control", "content=\"ESI/1.0\"")
            .body(body)
    }

    #[test]
    fn parses_includes_between_text() {
        let template = Esi
            .parse(r#"<h1>News</h1><esi:include src="/a" alt="/b" onerror="continue" /><esi:include src="/c"></esi:include>end"#)
            .unwrap();
        assert_eq!(
            template.fragments(),
            &[
                Fragment::Text("<h1>News</h1>".into()),
                include("/a", Some("/b"), true),
                include("/c", None, false),
                Fragment::Text("end".into()),
            ]
        );
    }

    #[test]
    fn strips_remove_blocks_and_comments() {
        let template = Esi
            .parse("a<esi:remove><a href=\"/x\">fallback</a></esi:remove>b<esi:comment text=\"note\" />c")
            .unwrap();
        assert_eq!(template.fragments(), &[Fragment::Text("abc".into())]);
    }

    #[test]
    fn include_without_src_is_an_error() {
        let err = Esi.parse(r#"<esi:include alt="/b" />"#).unwrap_err();
        assert!(matches!(
            err,
            SurrogateError::MissingAttribute {
                attribute: "src",
                ..
            }
        ));
    }

    #[test]
    fn look_alike_tags_are_text() {
        let template = Esi.parse("<esi:included>").unwrap();
        assert_eq!(template.fragments(), &[Fragment::Text("<esi:included>".into())]);
    }

    #[test]
    fn process_marks_body_for_evaluation() {
        let mut response = html(r#"x<esi:include src="/f" />"#);
        Esi.process(&mut response).unwrap();
        assert_eq!(response.headers().get("x-body-eval"), Some("ESI"));
        assert!(!response.headers().contains("surrogate-control"));
        let template = Template::from_body(response.content()).unwrap();
        assert_eq!(template.includes().collect::<Vec<_>>(), vec!["/f"]);
    }

    #[test]
    fn process_skips_other_content_types() {
        let mut response = html(r#"<esi:include src="/f" />"#);
        response.headers_mut().set("Content-Type", "application/json");
        Esi.process(&mut response).unwrap();
        assert!(!response.headers().contains("x-body-eval"));
        assert_eq!(response.content(), br#"<esi:include src="/f" />"#);
    }

    #[test]
    fn legacy_encoded_bodies_stay_byte_identical() {
        let body = b"caf\xE9<esi:include src=\"/f\" />".to_vec();
        let mut response = html("").body_bytes(body.clone());
        Esi.process(&mut response).unwrap();
        assert_eq!(response.content(), body.as_slice());
        assert!(!response.headers().contains("x-body-eval"));
        assert!(Esi.needs_parsing(&response));
    }

    #[test]
    fn missing_content_type_counts_as_html() {
        let mut response = Response::new(StatusCode::Ok).body(r#"<esi:include src="/f" />"#);
        Esi.process(&mut response).unwrap();
        assert_eq!(response.headers().get("x-body-eval"), Some("ESI"));
    }

    #[test]
    fn surrogate_control_negotiation() {
        let mut response = Response::new(StatusCode::Ok).body(r#"<esi:include src="/f" />"#);
        assert!(!Esi.needs_parsing(&response));
        Esi.add_surrogate_control(&mut response);
        assert_eq!(
            response.headers().get("surrogate-control"),
            Some("content=\"ESI/1.0\"")
        );
        assert!(Esi.needs_parsing(&response));

        let mut plain = Response::new(StatusCode::Ok).body("no markup");
        Esi.add_surrogate_control(&mut plain);
        assert!(!plain.headers().contains("surrogate-control"));
    }

    #[test]
    fn control_token_removal() {
        for (before, after) in [
            ("content=\"ESI/1.0\"", None),
            ("no-store, content=\"ESI/1.0\"", Some("no-store")),
            ("content=\"ESI/1.0\", max-age=10", Some("max-age=10")),
        ] {
            let mut response = Response::new(StatusCode::Ok).header("Surrogate-Control", before);
            Esi.remove_from_control(&mut response);
            assert_eq!(response.headers().get("surrogate-control"), after);
        }
    }

    #[test]
    fn capability_negotiation() {
        let mut request = Request::create("/", Method::Get);
        assert!(!Esi.has_surrogate_capability(&request));
        request.headers_mut().insert("Surrogate-Capability", "edge=\"Foo/1.0\"");
        Esi.add_surrogate_capability(&mut request);
        assert_eq!(
            request.headers().get("surrogate-capability"),
            Some("edge=\"Foo/1.0\", rttp=\"ESI/1.0\"")
        );
        assert!(Esi.has_surrogate_capability(&request));
    }

    #[test]
    fn renders_include_tags() {
        assert_eq!(
            Esi.render_include_tag("/f", None, false, None),
            "<esi:include src=\"/f\" />"
        );
        assert_eq!(
            Esi.render_include_tag("/f", Some("/alt"), true, Some("sidebar")),
            "<esi:comment text=\"sidebar\" />\n<esi:include src=\"/f\" onerror=\"continue\" alt=\"/alt\" />"
        );
    }
}
