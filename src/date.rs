/*!
HTTP dates: RFC 1123 for everything the server writes, RFC 1123 or
asctime accepted on the way in.
*/
use time::{
    format_description::FormatItem, macros::format_description, OffsetDateTime, PrimitiveDateTime,
};

const RFC1123: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);
const ASCTIME: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short] [month repr:short] [day padding:space] [hour]:[minute]:[second] [year]"
);

/// Format a Unix timestamp as an RFC 1123 date.
pub fn format_http_date(t: i64) -> String {
    let dt = OffsetDateTime::from_unix_timestamp(t).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    dt.format(RFC1123)
        .unwrap_or_else(|_| String::from("Thu, 01 Jan 1970 00:00:00 GMT"))
}

/**
Parse an HTTP date into a Unix timestamp.

Anything that isn't RFC 1123 or asctime yields 0, which every caller treats
as "no date given".
*/
pub fn parse_http_date(s: &str) -> i64 {
    let s = s.trim();
    for fmt in [RFC1123, ASCTIME] {
        if let Ok(dt) = PrimitiveDateTime::parse(s, fmt) {
            return dt.assume_utc().unix_timestamp();
        }
    }
    log::trace!("unparseable date {:?}", s);
    0
}
