// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! HTTP date formatting and parsing.

RFC 1123 is the format produced on the wire and in protocol messages.
Parsing additionally accepts the two obsolete formats HTTP/1.1 servers are
still allowed to emit: RFC 850 and ANSI C `asctime()`.
*/

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Render a timestamp in RFC 1123 format, e.g. `Thu, 01 Jan 1970 00:00:05 GMT`.
pub fn rfc1123(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an HTTP date in any of the three formats servers emit.
///
/// Returns `None` when the value matches none of them.
pub fn parse(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    // RFC 1123 dates are a subset of RFC 2822.
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }

    // RFC 850: `Sunday, 06-Nov-94 08:49:37 GMT`.
    if let Some(stripped) = value.strip_suffix(" GMT") {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, "%A, %d-%b-%y %H:%M:%S") {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    // asctime: `Sun Nov  6 08:49:37 1994`, always UTC.
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y") {
        return Some(Utc.from_utc_datetime(&naive));
    }

    None
}

/// Convert a Unix timestamp in seconds.
pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1123_round_trip() {
        let dt = from_unix(5).unwrap();
        let formatted = rfc1123(dt);
        assert_eq!(formatted, "Thu, 01 Jan 1970 00:00:05 GMT");
        assert_eq!(parse(&formatted), Some(dt));
    }

    #[test]
    fn test_parse_obsolete_formats() {
        let expected = parse("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(parse("Sunday, 06-Nov-94 08:49:37 GMT"), Some(expected));
        assert_eq!(parse("Sun Nov  6 08:49:37 1994"), Some(expected));
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse("yesterday-ish"), None);
        assert_eq!(parse(""), None);
    }
}
