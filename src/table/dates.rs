use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

/// Parse the date/timestamp shapes that show up in extracts and warehouse
/// columns. Offsets are dropped after conversion to UTC.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim().trim_matches('"');
    if s.is_empty() {
        return None;
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.naive_utc());
        }
    }
    None
}

/// Year of a date cell, also accepting a bare year such as `2019` or `2019.0`.
pub fn parse_year(raw: &str) -> Option<i32> {
    if let Some(dt) = parse_datetime(raw) {
        return Some(dt.year());
    }
    let s = raw.trim();
    let s = s.split('.').next().unwrap_or(s);
    if s.len() == 4 {
        return s.parse().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_shapes() {
        let want = NaiveDate::from_ymd_opt(2019, 3, 7)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        for s in ["2019-03-07", "2019/03/07", "03/07/2019", "2019-03-07 00:00:00", "2019-03-07T00:00:00.000"] {
            assert_eq!(parse_datetime(s), Some(want), "{}", s);
        }
        assert_eq!(parse_datetime("2019-03-07 05:00:00+05"), Some(want));
        assert_eq!(parse_datetime(""), None);
        assert_eq!(parse_datetime("nan"), None);
    }

    #[test]
    fn bare_years() {
        assert_eq!(parse_year("2019"), Some(2019));
        assert_eq!(parse_year("2021.0"), Some(2021));
        assert_eq!(parse_year("2015-12-31"), Some(2015));
        assert_eq!(parse_year("n/a"), None);
    }
}
