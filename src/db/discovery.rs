//! Discovery tables: one row of metrics per country, ASN, IP or username

use duckdb::Connection;
use serde::Serialize;

use super::query::{DateRange, QueryBuilder};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountrySummary {
    pub country: String,
    pub total_attacks: i64,
    pub avg_daily: f64,
    pub active_days: i64,
    pub first_seen: String,
    pub last_seen: String,
    pub volatility: f64,
    pub max_daily: i64,
    pub date_span: i64,
    pub persistence_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsnSummary {
    pub asn_name: String,
    pub total_attacks: i64,
    pub avg_daily: f64,
    pub active_days: i64,
    pub countries: i64,
    pub first_seen: String,
    pub last_seen: String,
    pub volatility: f64,
    pub max_daily: i64,
    pub date_span: i64,
    pub persistence_pct: f64,
}

/// Metrics shared by the IP and username tables
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityMetrics {
    pub total_attacks: i64,
    pub avg_daily: f64,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub max_daily: i64,
    pub max_absolute_change: f64,
    pub max_pct_change: f64,
    pub persistence_pct: f64,
    pub recent_attacks: i64,
    pub active_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpSummary {
    pub ip: String,
    #[serde(flatten)]
    pub metrics: ActivityMetrics,
    pub country: Option<String>,
    pub asn_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsernameSummary {
    pub username: String,
    #[serde(flatten)]
    pub metrics: ActivityMetrics,
    pub countries: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyPattern {
    pub hour: i32,
    pub attacks: i64,
    pub unique_ips: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableDates {
    pub min_date: Option<String>,
    pub max_date: Option<String>,
}

pub fn country_summary(conn: &Connection, range: &DateRange) -> Result<Vec<CountrySummary>> {
    let mut qb = QueryBuilder::new();
    qb.push(
        "WITH stats AS (\
           SELECT country, SUM(attacks) AS total_attacks, AVG(attacks) AS avg_daily, \
             COUNT(DISTINCT date) AS active_days, MIN(date) AS first_seen, MAX(date) AS last_seen, \
             MAX(attacks) AS max_daily \
           FROM daily_country_attacks WHERE ",
    )
    .push_range("", range)
    .push(
        " AND country <> 'Unknown' GROUP BY country) \
         SELECT s.country, CAST(s.total_attacks AS BIGINT), CAST(ROUND(s.avg_daily, 2) AS DOUBLE), \
           CAST(s.active_days AS BIGINT), CAST(s.first_seen AS VARCHAR), CAST(s.last_seen AS VARCHAR), \
           CAST(ROUND(COALESCE(v.max_volatility, 0), 2) AS DOUBLE), CAST(s.max_daily AS BIGINT), \
           CAST(date_diff('day', s.first_seen, s.last_seen) + 1 AS BIGINT) AS date_span, \
           CAST(ROUND(s.active_days * 100.0 / (date_diff('day', s.first_seen, s.last_seen) + 1), 1) AS DOUBLE) \
         FROM stats s LEFT JOIN volatile_country_summary v ON v.country = s.country \
         ORDER BY s.total_attacks DESC, s.country",
    );

    qb.query_map(conn, |row| {
        Ok(CountrySummary {
            country: row.get(0)?,
            total_attacks: row.get(1)?,
            avg_daily: row.get(2)?,
            active_days: row.get(3)?,
            first_seen: row.get(4)?,
            last_seen: row.get(5)?,
            volatility: row.get(6)?,
            max_daily: row.get(7)?,
            date_span: row.get(8)?,
            persistence_pct: row.get(9)?,
        })
    })
}

pub fn asn_summary(conn: &Connection, range: &DateRange) -> Result<Vec<AsnSummary>> {
    let mut qb = QueryBuilder::new();
    qb.push(
        "WITH per_day AS (\
           SELECT asn_name, date, SUM(attacks) AS attacks FROM daily_asn_attacks WHERE ",
    )
    .push_range("", range)
    .push(
        " GROUP BY asn_name, date), \
         country_counts AS (\
           SELECT asn_name, COUNT(DISTINCT country) AS countries FROM daily_asn_attacks WHERE ",
    )
    .push_range("", range)
    .push(
        " GROUP BY asn_name), \
         stats AS (\
           SELECT asn_name, SUM(attacks) AS total_attacks, AVG(attacks) AS avg_daily, \
             COUNT(*) AS active_days, MIN(date) AS first_seen, MAX(date) AS last_seen, \
             MAX(attacks) AS max_daily \
           FROM per_day GROUP BY asn_name) \
         SELECT s.asn_name, CAST(s.total_attacks AS BIGINT), CAST(ROUND(s.avg_daily, 2) AS DOUBLE), \
           CAST(s.active_days AS BIGINT), CAST(c.countries AS BIGINT), \
           CAST(s.first_seen AS VARCHAR), CAST(s.last_seen AS VARCHAR), \
           CAST(ROUND(COALESCE(v.max_volatility, 0), 2) AS DOUBLE), CAST(s.max_daily AS BIGINT), \
           CAST(date_diff('day', s.first_seen, s.last_seen) + 1 AS BIGINT), \
           CAST(ROUND(s.active_days * 100.0 / (date_diff('day', s.first_seen, s.last_seen) + 1), 1) AS DOUBLE) \
         FROM stats s \
         JOIN country_counts c ON c.asn_name = s.asn_name \
         LEFT JOIN volatile_asn_summary v ON v.asn_name = s.asn_name \
         ORDER BY s.total_attacks DESC, s.asn_name",
    );

    qb.query_map(conn, |row| {
        Ok(AsnSummary {
            asn_name: row.get(0)?,
            total_attacks: row.get(1)?,
            avg_daily: row.get(2)?,
            active_days: row.get(3)?,
            countries: row.get(4)?,
            first_seen: row.get(5)?,
            last_seen: row.get(6)?,
            volatility: row.get(7)?,
            max_daily: row.get(8)?,
            date_span: row.get(9)?,
            persistence_pct: row.get(10)?,
        })
    })
}

/// Shared grid query for the IP and username tables. `details` aggregates the
/// value's in-range rows into the trailing columns named by `outputs`.
fn activity_query(
    table: &str,
    column: &str,
    details: &str,
    outputs: &str,
    range: &DateRange,
    limit: Option<u32>,
) -> QueryBuilder {
    let mut qb = QueryBuilder::new();
    qb.push("WITH date_range AS (")
        .push_date_series(range)
        .push(&format!(
            "), present AS (SELECT {column} AS item, date, SUM(attacks) AS attacks FROM {table} WHERE "
        ))
        .push_range("", range)
        .push(&format!(
            " GROUP BY {column}, date), \
             details AS (SELECT {column} AS item, {details} FROM {table} WHERE "
        ))
        .push_range("", range)
        .push(&format!(
            " GROUP BY {column}), \
             grid AS (\
               SELECT d.date, i.item, COALESCE(p.attacks, 0) AS attacks, p.attacks IS NOT NULL AS was_present \
               FROM date_range d CROSS JOIN (SELECT DISTINCT item FROM present) i \
               LEFT JOIN present p ON p.date = d.date AND p.item = i.item), \
             stats AS (\
               SELECT item, SUM(attacks) AS total_attacks, \
                 AVG(CASE WHEN was_present THEN attacks END) AS avg_daily, \
                 COUNT(*) FILTER (WHERE was_present) AS active_days, \
                 MIN(date) FILTER (WHERE was_present) AS first_seen, \
                 MAX(date) FILTER (WHERE was_present) AS last_seen, \
                 MAX(attacks) AS max_daily \
               FROM grid GROUP BY item), \
             changes AS (\
               SELECT item, attacks, LAG(attacks) OVER (PARTITION BY item ORDER BY date) AS prev FROM grid), \
             volatility AS (\
               SELECT item, CAST(MAX(attacks - prev) AS DOUBLE) AS max_absolute_change, \
                 MAX(CASE WHEN prev = 0 THEN CAST(attacks - 1 AS DOUBLE) * 100.0 \
                          ELSE CAST(attacks - prev AS DOUBLE) * 100.0 / prev END) AS max_pct_change \
               FROM changes WHERE prev IS NOT NULL GROUP BY item), \
             recent AS (\
               SELECT item, SUM(attacks) AS recent_attacks FROM grid \
               WHERE date > (SELECT MAX(date) FROM grid) - INTERVAL 7 DAY GROUP BY item) \
             SELECT s.item, CAST(s.total_attacks AS BIGINT), CAST(ROUND(s.avg_daily, 2) AS DOUBLE), \
               CAST(s.first_seen AS VARCHAR), CAST(s.last_seen AS VARCHAR), CAST(s.max_daily AS BIGINT), \
               CAST(COALESCE(ROUND(v.max_absolute_change, 2), 0) AS DOUBLE), \
               CAST(COALESCE(ROUND(v.max_pct_change, 2), 0) AS DOUBLE), \
               CAST(ROUND(s.active_days * 100.0 / {days}, 1) AS DOUBLE), \
               CAST(COALESCE(r.recent_attacks, 0) AS BIGINT), CAST(s.active_days AS BIGINT), \
               {outputs} \
             FROM stats s \
             JOIN details x ON x.item = s.item \
             LEFT JOIN volatility v ON v.item = s.item \
             LEFT JOIN recent r ON r.item = s.item \
             ORDER BY s.total_attacks DESC, s.item",
            days = range.days(),
        ));
    if let Some(limit) = limit {
        qb.push(&format!(" LIMIT {}", limit));
    }
    qb
}

fn activity_metrics(row: &duckdb::Row<'_>) -> duckdb::Result<ActivityMetrics> {
    Ok(ActivityMetrics {
        total_attacks: row.get(1)?,
        avg_daily: row.get(2)?,
        first_seen: row.get(3)?,
        last_seen: row.get(4)?,
        max_daily: row.get(5)?,
        max_absolute_change: row.get(6)?,
        max_pct_change: row.get(7)?,
        persistence_pct: row.get(8)?,
        recent_attacks: row.get(9)?,
        active_days: row.get(10)?,
    })
}

pub fn ip_summary(conn: &Connection, range: &DateRange, limit: Option<u32>) -> Result<Vec<IpSummary>> {
    activity_query(
        "daily_ip_attacks",
        "ip",
        "MAX(country) AS country, MAX(asn_name) AS asn_name",
        "x.country, x.asn_name",
        range,
        limit,
    )
    .query_map(conn, |row| {
        Ok(IpSummary {
            ip: row.get(0)?,
            metrics: activity_metrics(row)?,
            country: row.get(11)?,
            asn_name: row.get(12)?,
        })
    })
}

pub fn username_summary(
    conn: &Connection,
    range: &DateRange,
    limit: Option<u32>,
) -> Result<Vec<UsernameSummary>> {
    activity_query(
        "daily_username_attacks",
        "username",
        "CAST(COUNT(DISTINCT country) AS BIGINT) AS countries",
        "x.countries",
        range,
        limit,
    )
    .query_map(conn, |row| {
        Ok(UsernameSummary {
            username: row.get(0)?,
            metrics: activity_metrics(row)?,
            countries: row.get(11)?,
        })
    })
}

pub fn hourly_patterns(conn: &Connection) -> Result<Vec<HourlyPattern>> {
    let mut qb = QueryBuilder::new();
    qb.push("SELECT hour, attack_count, unique_ips FROM hourly_patterns ORDER BY hour");
    qb.query_map(conn, |row| {
        Ok(HourlyPattern {
            hour: row.get(0)?,
            attacks: row.get(1)?,
            unique_ips: row.get(2)?,
        })
    })
}

pub fn date_range(conn: &Connection) -> Result<AvailableDates> {
    Ok(conn.query_row(
        "SELECT CAST(MIN(date) AS VARCHAR), CAST(MAX(date) AS VARCHAR) FROM daily_stats",
        [],
        |row| {
            Ok(AvailableDates {
                min_date: row.get(0)?,
                max_date: row.get(1)?,
            })
        },
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{schema, testing, Database};
    use chrono::NaiveDate;

    fn november(start: u32, end: u32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2022, 11, start).unwrap(),
            NaiveDate::from_ymd_opt(2022, 11, end).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn country_summary_excludes_unknown() {
        let db = testing::seeded();
        let conn = db.connection().unwrap();

        let rows = country_summary(&conn, &november(1, 3)).unwrap();
        assert_eq!(rows.len(), 2);

        let china = &rows[0];
        assert_eq!(china.country, "China");
        assert_eq!(china.total_attacks, 160);
        assert_eq!(china.avg_daily, 53.33);
        assert_eq!(china.active_days, 3);
        assert_eq!(china.first_seen, "2022-11-01");
        assert_eq!(china.max_daily, 70);
        assert_eq!(china.volatility, 28.57);
        assert_eq!(china.persistence_pct, 100.0);

        let us = &rows[1];
        assert_eq!(us.date_span, 2);
        assert_eq!(us.last_seen, "2022-11-02");
    }

    #[test]
    fn asn_summary_counts_countries() {
        let db = testing::seeded();
        let conn = db.connection().unwrap();

        let rows = asn_summary(&conn, &november(1, 3)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].asn_name, "Chinanet");
        assert_eq!(rows[0].countries, 1);
        assert_eq!(rows[1].asn_name, "DigitalOcean");
        assert_eq!(rows[1].volatility, 233.33);
    }

    #[test]
    fn ip_summary_uses_full_grid() {
        let db = testing::seeded();
        let conn = db.connection().unwrap();

        let rows = ip_summary(&conn, &november(1, 3), None).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].ip, "1.1.1.1");
        assert_eq!(rows[0].metrics.total_attacks, 140);

        let ip2 = rows.iter().find(|r| r.ip == "2.2.2.2").unwrap();
        assert_eq!(ip2.metrics.active_days, 1);
        assert_eq!(ip2.metrics.persistence_pct, 33.3);
        assert_eq!(ip2.metrics.max_absolute_change, 0.0);
        assert_eq!(ip2.country.as_deref(), Some("China"));

        // 0 -> 20 counts as (20 - 1) * 100 when the previous day was empty
        let ip4 = rows.iter().find(|r| r.ip == "4.4.4.4").unwrap();
        assert_eq!(ip4.metrics.max_pct_change, 1900.0);
        assert_eq!(ip4.metrics.recent_attacks, 20);

        let limited = ip_summary(&conn, &november(1, 3), Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn username_summary_serializes_flat() {
        let db = testing::seeded();
        let conn = db.connection().unwrap();

        let rows = username_summary(&conn, &november(1, 3), None).unwrap();
        let admin = rows.iter().find(|r| r.username == "admin").unwrap();
        assert_eq!(admin.countries, 2);

        let json = serde_json::to_value(admin).unwrap();
        assert_eq!(json["username"], "admin");
        assert_eq!(json["total_attacks"], 150);
        assert!(json.get("metrics").is_none());
    }

    #[test]
    fn hourly_and_date_range() {
        let db = testing::seeded();
        let conn = db.connection().unwrap();

        let hours = hourly_patterns(&conn).unwrap();
        assert_eq!(hours.len(), 2);
        assert_eq!(hours[1].hour, 13);

        let dates = date_range(&conn).unwrap();
        assert_eq!(dates.min_date.as_deref(), Some("2022-11-01"));
        assert_eq!(dates.max_date.as_deref(), Some("2022-11-03"));
    }

    #[test]
    fn empty_database_has_no_date_range() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection().unwrap();
        schema::create_all(&conn).unwrap();

        let dates = date_range(&conn).unwrap();
        assert_eq!(dates.min_date, None);
        assert_eq!(dates.max_date, None);
    }
}
