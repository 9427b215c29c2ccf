//! HTTP-date handling (RFC 9110 §5.6.7).

use chrono::{DateTime, NaiveDateTime, Utc};

const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Formats a timestamp as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format(IMF_FIXDATE).to_string()
}

/// Parses an HTTP-date. Accepts IMF-fixdate and any RFC 2822 variant.
///
/// Returns `None` for unparseable input; callers treat such headers as absent.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, IMF_FIXDATE)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_imf_fixdate() {
        let date = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(format_http_date(date), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn parses_what_it_formats() {
        let date = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 1).unwrap();
        assert_eq!(parse_http_date(&format_http_date(date)), Some(date));
    }

    #[test]
    fn parses_numeric_offsets() {
        let parsed = parse_http_date("Thu, 01 Jan 2015 01:00:00 +0100").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn garbage_is_none() {
        assert_eq!(parse_http_date("some while ago"), None);
    }
}
