//! Cacheability of pages assembled from fragments.
//!
//! A page built from includes can only be cached as long as its
//! shortest-lived part. The strategy collects the freshness of every
//! embedded response and rewrites the main response's headers to match.

use chrono::{DateTime, Utc};

use crate::Response;

/// Merges the cache headers of embedded responses into the main response.
#[derive(Debug, Clone)]
pub struct ResponseCacheStrategy {
    cacheable: bool,
    embedded: usize,
    ttls: Vec<Option<i64>>,
    max_ages: Vec<Option<i64>>,
}

impl Default for ResponseCacheStrategy {
    fn default() -> Self {
        Self {
            cacheable: true,
            embedded: 0,
            ttls: Vec::new(),
            max_ages: Vec::new(),
        }
    }
}

impl ResponseCacheStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an embedded response.
    ///
    /// Validateable fragments cannot be revalidated as part of the page, so
    /// they make the page uncacheable.
    pub fn add(&mut self, response: &Response, now: DateTime<Utc>) {
        if response.is_validateable() {
            self.cacheable = false;
        } else {
            self.ttls.push(response.ttl(now));
            self.max_ages.push(response.max_age());
        }
        self.embedded += 1;
    }

    /// Number of embedded responses seen so far.
    pub fn embedded(&self) -> usize {
        self.embedded
    }

    /// Rewrites the main response's cache headers.
    ///
    /// Does nothing when no fragment was embedded.
    pub fn update(&mut self, response: &mut Response, now: DateTime<Utc>) {
        if self.embedded == 0 {
            return;
        }

        if response.is_validateable() {
            response.set_etag(None);
            response.headers_mut().remove("last-modified");
            self.cacheable = false;
        }

        if !self.cacheable {
            response
                .headers_mut()
                .set("Cache-Control", "private, no-cache, must-revalidate");
            return;
        }

        self.ttls.push(response.ttl(now));
        self.max_ages.push(response.max_age());

        if let (Some(max_age), Some(ttl)) = (smallest(&self.max_ages), smallest(&self.ttls)) {
            response.set_shared_max_age(max_age);
            response.headers_mut().set("Age", (max_age - ttl).to_string());
        }
        response.set_max_age(0);
    }
}

/// The minimum, or `None` if any value is unknown.
fn smallest(values: &[Option<i64>]) -> Option<i64> {
    values
        .iter()
        .copied()
        .collect::<Option<Vec<i64>>>()?
        .into_iter()
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;

    fn with_cc(value: &str, now: DateTime<Utc>) -> Response {
        let mut response = Response::new(StatusCode::Ok).header("Cache-Control", value);
        response.set_date(now);
        response
    }

    #[test]
    fn untouched_without_fragments() {
        let now = Utc::now();
        let mut page = with_cc("s-maxage=60", now);
        ResponseCacheStrategy::new().update(&mut page, now);
        assert_eq!(page.headers().get("cache-control"), Some("s-maxage=60"));
    }

    #[test]
    fn page_takes_the_shortest_lifetime() {
        let now = Utc::now();
        let mut strategy = ResponseCacheStrategy::new();
        strategy.add(&with_cc("s-maxage=10", now), now);
        strategy.add(&with_cc("s-maxage=30", now).header("Age", "25"), now);
        assert_eq!(strategy.embedded(), 2);

        let mut page = with_cc("s-maxage=60", now);
        strategy.update(&mut page, now);
        let cc = page.cache_control();
        assert_eq!(cc.seconds("s-maxage"), Some(10));
        assert_eq!(cc.seconds("max-age"), Some(0));
        assert!(cc.has("public"));
        // shortest ttl is 5 (30 - 25)
        assert_eq!(page.headers().get("age"), Some("5"));
    }

    #[test]
    fn validateable_fragment_makes_page_private() {
        let now = Utc::now();
        let mut strategy = ResponseCacheStrategy::new();
        strategy.add(&with_cc("s-maxage=10", now).header("ETag", "\"x\""), now);

        let mut page = with_cc("s-maxage=60", now).header("Last-Modified", "Mon, 29 Apr 2024 12:00:00 GMT");
        strategy.update(&mut page, now);
        assert_eq!(
            page.headers().get("cache-control"),
            Some("private, no-cache, must-revalidate")
        );
        assert!(page.last_modified().is_none());
    }

    #[test]
    fn unknown_lifetime_only_resets_client_max_age() {
        let now = Utc::now();
        let mut strategy = ResponseCacheStrategy::new();
        strategy.add(&Response::new(StatusCode::Ok), now);

        let mut page = with_cc("s-maxage=60", now);
        strategy.update(&mut page, now);
        let cc = page.cache_control();
        assert_eq!(cc.seconds("s-maxage"), Some(60));
        assert_eq!(cc.seconds("max-age"), Some(0));
        assert!(!page.headers().contains("age"));
    }
}
