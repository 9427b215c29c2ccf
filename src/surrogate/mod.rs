//! Surrogate (edge-side) page assembly.
//!
//! A surrogate turns include markup in a cacheable response into a
//! [`Template`]: literal text interleaved with fragment references. The
//! template is what gets cached; fragments are resolved through sub-requests
//! each time the page is served, so every fragment keeps its own cache
//! lifetime.
//!
//! Two dialects are provided: [`Esi`] (`<esi:include src="…"/>`) and
//! [`Ssi`] (`<!--#include virtual="…" -->`).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::kernel::{Kernel, KernelError, RequestType};
use crate::{Method, Request, Response, StatusCode};

pub mod esi;
pub mod ssi;

pub use esi::Esi;
pub use ssi::Ssi;

/// Response header marking a body that holds a serialized [`Template`].
pub const BODY_EVAL_HEADER: &str = "X-Body-Eval";

/// Token advertising our capabilities in `Surrogate-Capability`.
pub const CAPABILITY_NAME: &str = "rttp";

/// Content types whose bodies are scanned for include markup.
const PROCESSED_CONTENT_TYPES: [&str; 4] = [
    "text/html",
    "text/xml",
    "application/xhtml+xml",
    "application/xml",
];

/// Errors produced while processing or assembling surrogate markup.
#[derive(Debug, Error)]
pub enum SurrogateError {
    #[error("unable to process a {tag} tag without a \"{attribute}\" attribute")]
    MissingAttribute {
        tag: &'static str,
        attribute: &'static str,
    },

    #[error("error when rendering \"{uri}\" (status code is {status})")]
    FragmentStatus { uri: String, status: u16 },

    #[error("error when rendering \"{uri}\": {source}")]
    Fragment {
        uri: String,
        #[source]
        source: KernelError,
    },

    #[error("invalid page template: {0}")]
    Template(#[from] serde_json::Error),
}

/// One piece of an assembled page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fragment {
    /// Literal markup, emitted as is.
    Text(String),
    /// A sub-request whose body replaces the tag.
    Include {
        src: String,
        alt: Option<String>,
        ignore_errors: bool,
    },
}

/// A processed response body awaiting fragment resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Template {
    fragments: Vec<Fragment>,
}

impl Template {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self { fragments }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Returns the `src` of every include, in document order.
    pub fn includes(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().filter_map(|fragment| match fragment {
            Fragment::Include { src, .. } => Some(src.as_str()),
            Fragment::Text(_) => None,
        })
    }

    /// Serializes the template into a response body.
    pub fn to_body(&self) -> Result<Vec<u8>, SurrogateError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Reads a template back from a response body.
    pub fn from_body(body: &[u8]) -> Result<Self, SurrogateError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Resolves every include through `kernel` and concatenates the result.
    ///
    /// `main` is the request the page answers; fragment sub-requests inherit
    /// its host, scheme, cookies and client address.
    pub async fn render(
        &self,
        kernel: &dyn Kernel,
        main: &Request,
    ) -> Result<Vec<u8>, SurrogateError> {
        let mut body = Vec::new();
        for fragment in &self.fragments {
            match fragment {
                Fragment::Text(text) => body.extend_from_slice(text.as_bytes()),
                Fragment::Include {
                    src,
                    alt,
                    ignore_errors,
                } => {
                    let content = include(kernel, main, src, alt.as_deref(), *ignore_errors).await?;
                    body.extend_from_slice(&content);
                }
            }
        }
        Ok(body)
    }
}

/// Renders one include: fetches `uri` as a sub-request, falling back to
/// `alt`.
///
/// Any status other than 200 is a failure. When both targets fail the
/// result is an empty body if `ignore_errors` is set, otherwise the last
/// error.
pub async fn include(
    kernel: &dyn Kernel,
    main: &Request,
    uri: &str,
    alt: Option<&str>,
    ignore_errors: bool,
) -> Result<Vec<u8>, SurrogateError> {
    let mut failure = None;
    for target in std::iter::once(uri).chain(alt.filter(|alt| !alt.is_empty())) {
        match render_fragment(kernel, main, target).await {
            Ok(body) => return Ok(body),
            Err(e) => {
                debug!(uri = target, error = %e, "fragment failed");
                failure = Some(e);
            }
        }
    }
    match failure {
        Some(e) if !ignore_errors => Err(e),
        _ => Ok(Vec::new()),
    }
}

async fn render_fragment(
    kernel: &dyn Kernel,
    main: &Request,
    uri: &str,
) -> Result<Vec<u8>, SurrogateError> {
    let request = Request::create_from(uri, Method::Get, main);
    let response = kernel
        .handle(request, RequestType::Sub, true)
        .await
        .map_err(|source| SurrogateError::Fragment {
            uri: uri.to_owned(),
            source,
        })?;
    if response.status() != StatusCode::Ok {
        return Err(SurrogateError::FragmentStatus {
            uri: uri.to_owned(),
            status: response.status().as_u16(),
        });
    }
    Ok(response.content().to_vec())
}

/// An edge-side include dialect.
///
/// Implementors supply the dialect name and markup handling; header
/// negotiation is shared.
pub trait Surrogate: Send + Sync {
    /// Lowercase dialect name, e.g. `esi`.
    fn name(&self) -> &'static str;

    /// Marker whose presence in a body means it needs processing.
    fn include_marker(&self) -> &'static str;

    /// Renders an include tag for `uri`.
    fn render_include_tag(
        &self,
        uri: &str,
        alt: Option<&str>,
        ignore_errors: bool,
        comment: Option<&str>,
    ) -> String;

    /// Parses the body markup into a [`Template`].
    fn parse(&self, content: &str) -> Result<Template, SurrogateError>;

    /// The versioned capability token, e.g. `ESI/1.0`.
    fn capability(&self) -> String {
        format!("{}/1.0", self.name().to_ascii_uppercase())
    }

    /// Returns `true` if a downstream surrogate already advertised this
    /// dialect on the request.
    fn has_surrogate_capability(&self, request: &Request) -> bool {
        let capability = self.capability();
        request
            .headers()
            .get_all("surrogate-capability")
            .any(|value| value.contains(&capability))
    }

    /// Advertises this dialect to the origin.
    fn add_surrogate_capability(&self, request: &mut Request) {
        let token = format!("{CAPABILITY_NAME}=\"{}\"", self.capability());
        let value = match request.headers().get_joined("surrogate-capability") {
            Some(current) => format!("{current}, {token}"),
            None => token,
        };
        request.headers_mut().set("Surrogate-Capability", value);
    }

    /// Tells downstream surrogates that the body contains include markup.
    fn add_surrogate_control(&self, response: &mut Response) {
        let marker = self.include_marker().as_bytes();
        if response.content().windows(marker.len()).any(|w| w == marker) {
            let value = format!("content=\"{}\"", self.capability());
            response.headers_mut().set("Surrogate-Control", value);
        }
    }

    /// Returns `true` when `Surrogate-Control` asks for this dialect.
    fn needs_parsing(&self, response: &Response) -> bool {
        let Some(control) = response.headers().get_joined("surrogate-control") else {
            return false;
        };
        let capability = self.capability();
        control_parts(&control).any(|part| {
            part.strip_prefix("content=\"")
                .and_then(|rest| rest.strip_suffix('"'))
                .is_some_and(|content| content.split_whitespace().any(|c| c == capability))
        })
    }

    /// Rewrites an eligible response body into a serialized [`Template`].
    ///
    /// Bodies of other content types, and bodies that are not valid UTF-8,
    /// are left untouched. On success the
    /// response carries [`BODY_EVAL_HEADER`] and this dialect's token is
    /// removed from `Surrogate-Control`.
    fn process(&self, response: &mut Response) -> Result<(), SurrogateError> {
        let content_type = response
            .headers()
            .get("content-type")
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("text/html");
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !PROCESSED_CONTENT_TYPES.contains(&mime.as_str()) {
            return Ok(());
        }

        let template = match std::str::from_utf8(response.content()) {
            Ok(content) => self.parse(content)?,
            Err(e) => {
                warn!(error = %e, "body is not UTF-8, leaving include markup unprocessed");
                return Ok(());
            }
        };
        response.set_content(template.to_body()?);
        response
            .headers_mut()
            .set(BODY_EVAL_HEADER, self.name().to_ascii_uppercase());
        self.remove_from_control(response);
        Ok(())
    }

    /// Drops this dialect's `content="…"` token from `Surrogate-Control`,
    /// removing the header when nothing else remains.
    fn remove_from_control(&self, response: &mut Response) {
        let Some(control) = response.headers().get_joined("surrogate-control") else {
            return;
        };
        let token = format!("content=\"{}\"", self.capability());
        let remaining: Vec<&str> = control_parts(&control).filter(|part| *part != token).collect();
        if remaining.is_empty() {
            response.headers_mut().remove("surrogate-control");
        } else {
            response
                .headers_mut()
                .set("Surrogate-Control", remaining.join(", "));
        }
    }
}

fn control_parts(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|part| !part.is_empty())
}

// ── Markup scanning ────────────────────────────────────────────────────────

/// Returns the quoted value of `name` inside a tag's attribute text.
pub(crate) fn attribute<'a>(attributes: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = attributes;
    while let Some(eq) = rest.find("=\"") {
        let key_start = rest[..eq]
            .rfind(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == ':'))
            .map_or(0, |i| i + 1);
        let key = &rest[key_start..eq];
        let value_start = eq + 2;
        let value_len = rest[value_start..].find('"')?;
        let value = &rest[value_start..value_start + value_len];
        if key.eq_ignore_ascii_case(name) {
            return Some(value);
        }
        rest = &rest[value_start + value_len + 1..];
    }
    None
}

/// Removes every `open … close` block, contents included.
pub(crate) fn strip_blocks(content: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find(open) {
        let Some(len) = rest[start + open.len()..].find(close) else {
            break;
        };
        out.push_str(&rest[..start]);
        rest = &rest[start + open.len() + len + close.len()..];
    }
    out.push_str(rest);
    out
}

/// Builds a template by cutting `content` at each tag found by `next_tag`.
///
/// `next_tag` returns `(tag start, attribute text, tag end)` for the first
/// tag in its input.
pub(crate) fn split_tags<'a>(
    content: &'a str,
    mut next_tag: impl FnMut(&'a str) -> Option<(usize, &'a str, usize)>,
    mut include: impl FnMut(&'a str) -> Result<Fragment, SurrogateError>,
) -> Result<Template, SurrogateError> {
    let mut fragments = Vec::new();
    let mut rest = content;
    while let Some((start, attributes, end)) = next_tag(rest) {
        if start > 0 {
            fragments.push(Fragment::Text(rest[..start].to_owned()));
        }
        fragments.push(include(attributes)?);
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        fragments.push(Fragment::Text(rest.to_owned()));
    }
    Ok(Template::new(fragments))
}
