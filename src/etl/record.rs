//! Raw honeypot CSV rows and their enriched form

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::Deserialize;

use crate::enrich::IpInfo;

/// One line of the honeypot CSV export. Columns are kept as text so a bad
/// value in one field does not reject the whole row.
#[derive(Debug, Default, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "Date", default)]
    pub date: String,
    #[serde(rename = "Time", default)]
    pub time: String,
    #[serde(rename = "IP", default)]
    pub ip: String,
    #[serde(rename = "Node", default)]
    pub node: String,
    #[serde(rename = "Port", default)]
    pub port: String,
    #[serde(rename = "PID", default)]
    pub pid: String,
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "Tag", default)]
    pub tag: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

/// An attack row ready to be written to Parquet
#[derive(Debug, Clone)]
pub struct AttackRecord {
    pub datetime: NaiveDateTime,
    pub ip: String,
    pub time: i64,
    pub geo: IpInfo,
    pub node: String,
    pub port: i64,
    pub pid: String,
    pub username: String,
    pub tag: String,
    pub message: String,
}

impl AttackRecord {
    /// Convert a raw row; `None` when the date cannot be parsed.
    pub fn from_raw(raw: RawRecord) -> Option<Self> {
        let date = parse_date(&raw.date)?;
        Some(Self {
            datetime: date.and_hms_opt(0, 0, 0)?,
            time: parse_int(&raw.time),
            port: parse_int(&raw.port),
            ip: raw.ip.trim().to_string(),
            geo: IpInfo::default(),
            node: raw.node,
            pid: raw.pid,
            username: raw.username,
            tag: raw.tag,
            message: raw.message,
        })
    }

    /// Partition key (year, month)
    pub fn partition(&self) -> (i32, u32) {
        (self.datetime.year(), self.datetime.month())
    }
}

/// Dates are logged as YYYYMMDD, sometimes with a trailing ".0" from spreadsheet exports.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let value = value.split('.').next().unwrap_or(value);
    NaiveDate::parse_from_str(value, "%Y%m%d").ok()
}

/// Numeric columns default to 0 when missing or malformed.
pub fn parse_int(value: &str) -> i64 {
    let value = value.trim();
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_dates() {
        assert_eq!(parse_date("20221101"), NaiveDate::from_ymd_opt(2022, 11, 1));
        assert_eq!(parse_date(" 20230108.0 "), NaiveDate::from_ymd_opt(2023, 1, 8));
        assert_eq!(parse_date("2022-11-01"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn malformed_numbers_become_zero() {
        assert_eq!(parse_int("22"), 22);
        assert_eq!(parse_int("2222.0"), 2222);
        assert_eq!(parse_int("abc"), 0);
        assert_eq!(parse_int(""), 0);
    }

    #[test]
    fn raw_record_without_date_is_rejected() {
        let raw = RawRecord {
            date: "garbage".to_string(),
            ip: "1.2.3.4".to_string(),
            ..Default::default()
        };
        assert!(AttackRecord::from_raw(raw).is_none());
    }

    #[test]
    fn partition_follows_date() {
        let raw = RawRecord {
            date: "20221231".to_string(),
            port: "22".to_string(),
            ..Default::default()
        };
        let record = AttackRecord::from_raw(raw).unwrap();
        assert_eq!(record.partition(), (2022, 12));
        assert_eq!(record.port, 22);
    }
}
