//! Time-series queries behind the dashboard charts
//!
//! Each chart picks a source table, a ranking and a country label from the
//! filters present on the request. The branch tables live in
//! [`Chart::plan`] and [`total_attacks_plan`]; the SQL shape is shared.
//!
//! An `ip` filter narrows a chart to that address alone; any `country` or
//! `asn` filter sent with it is ignored. A `username` filter keeps every
//! other filter.
//!
//! Every series is zero-filled: a chart over N days with K dimension values
//! returns N x K rows, ordered by date then attacks descending.

use duckdb::Connection;
use serde::ser::{Serialize, SerializeMap, Serializer};

use super::query::{Condition, DateRange, Filters, QueryBuilder, Scope};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Country,
    Asn,
    Ip,
    Username,
}

impl Dimension {
    /// Column name in the summary tables
    pub fn column(self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::Asn => "asn_name",
            Self::Ip => "ip",
            Self::Username => "username",
        }
    }

    /// Key used in the JSON rows
    pub fn json_key(self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::Asn => "asn_name",
            Self::Ip => "IP",
            Self::Username => "username",
        }
    }

    pub fn volatile_table(self) -> &'static str {
        match self {
            Self::Country => "volatile_country_summary",
            Self::Asn => "volatile_asn_summary",
            Self::Ip => "volatile_ip_summary",
            Self::Username => "volatile_username_summary",
        }
    }
}

/// How the top-N dimension values are chosen
#[derive(Debug, Clone, PartialEq)]
pub enum Ranking {
    /// Most attacks in the range
    TotalAttacks,
    /// Highest precomputed volatility among values active in the range
    Precomputed,
    /// Largest day-over-day change computed within the range
    WindowVolatility,
    /// A single value chosen by the filter
    Pinned(String),
}

/// What goes in the `country` field of each row
#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    /// The value's country in the source table, or the fallback when it has none
    Column(&'static str),
    Fixed(String),
    /// The dimension value itself (country charts)
    Key,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopSeries {
    pub dimension: Dimension,
    pub source: &'static str,
    pub conditions: Vec<Condition>,
    pub ranking: Ranking,
    pub label: Label,
    pub pct_change: bool,
    pub exclude_unknown: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailySeries {
    pub source: &'static str,
    pub value: &'static str,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DailyPoint {
    pub date: String,
    pub attacks: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub dimension: Dimension,
    pub date: String,
    pub key: String,
    pub country: String,
    pub attacks: i64,
    pub pct_change: Option<f64>,
}

impl Serialize for SeriesPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("date", &self.date)?;
        map.serialize_entry(self.dimension.json_key(), &self.key)?;
        if self.dimension != Dimension::Country {
            map.serialize_entry("country", &self.country)?;
        }
        map.serialize_entry("attacks", &self.attacks)?;
        if let Some(pct) = self.pct_change {
            map.serialize_entry("pct_change", &pct)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chart {
    Countries,
    UnusualCountries,
    Ips,
    IpsVolatile,
    Usernames,
    UsernamesVolatile,
    Asns,
    AsnsVolatile,
}

/// An IP filter overrides the location filters
fn ip_only(ip: &str) -> Vec<Condition> {
    vec![Condition::new("ip", ip)]
}

fn conditions_without(filters: &Filters, column: &str) -> Vec<Condition> {
    filters
        .conditions()
        .into_iter()
        .filter(|c| c.column != column)
        .collect()
}

/// Daily totals for `/api/total_attacks`, username filter first.
pub fn total_attacks_plan(filters: &Filters) -> DailySeries {
    let scope = filters.scope_username_first();
    let (source, value) = match scope {
        Scope::Username(_) => ("daily_ip_username_attacks", "attacks"),
        Scope::Ip(_) => ("daily_ip_attacks", "attacks"),
        Scope::AsnCountry { .. } | Scope::Asn(_) => ("daily_asn_attacks", "attacks"),
        Scope::Country(_) => ("daily_country_attacks", "attacks"),
        Scope::All => ("daily_stats", "total_attacks"),
    };
    let conditions = match scope {
        Scope::Ip(ip) => ip_only(ip),
        _ => filters.conditions(),
    };
    DailySeries {
        source,
        value,
        conditions,
    }
}

impl Chart {
    pub fn dimension(self) -> Dimension {
        match self {
            Self::Countries | Self::UnusualCountries => Dimension::Country,
            Self::Ips | Self::IpsVolatile => Dimension::Ip,
            Self::Usernames | Self::UsernamesVolatile => Dimension::Username,
            Self::Asns | Self::AsnsVolatile => Dimension::Asn,
        }
    }

    fn is_volatile(self) -> bool {
        matches!(
            self,
            Self::IpsVolatile | Self::UsernamesVolatile | Self::AsnsVolatile
        )
    }

    pub fn plan(self, filters: &Filters) -> TopSeries {
        let mut plan = match self.dimension() {
            Dimension::Country => country_plan(filters),
            Dimension::Ip => ip_plan(filters),
            Dimension::Username => username_plan(filters),
            Dimension::Asn => asn_plan(filters),
        };

        if self == Self::UnusualCountries {
            plan.pct_change = true;
            let window = matches!(
                filters.scope(),
                Scope::Username(_) | Scope::Asn(_) | Scope::All
            );
            if window {
                plan.ranking = Ranking::WindowVolatility;
                plan.exclude_unknown = filters.scope() == Scope::All;
            }
        }

        if self.is_volatile() {
            plan.pct_change = true;
            if plan.ranking == Ranking::TotalAttacks {
                plan.ranking = Ranking::Precomputed;
            }
        }

        plan
    }
}

fn series(
    dimension: Dimension,
    source: &'static str,
    conditions: Vec<Condition>,
    ranking: Ranking,
    label: Label,
) -> TopSeries {
    TopSeries {
        dimension,
        source,
        conditions,
        ranking,
        label,
        pct_change: false,
        exclude_unknown: false,
    }
}

fn country_plan(filters: &Filters) -> TopSeries {
    let d = Dimension::Country;
    match filters.scope() {
        Scope::Ip(ip) => series(d, "daily_ip_attacks", ip_only(ip), Ranking::TotalAttacks, Label::Key),
        Scope::Username(_) => series(
            d,
            "daily_ip_username_attacks",
            filters.conditions(),
            Ranking::TotalAttacks,
            Label::Key,
        ),
        Scope::AsnCountry { asn, country } => series(
            d,
            "daily_asn_attacks",
            vec![Condition::new("asn_name", asn)],
            Ranking::Pinned(country.to_string()),
            Label::Key,
        ),
        Scope::Country(country) => series(
            d,
            "daily_country_attacks",
            Vec::new(),
            Ranking::Pinned(country.to_string()),
            Label::Key,
        ),
        Scope::Asn(asn) => series(
            d,
            "daily_asn_attacks",
            vec![Condition::new("asn_name", asn)],
            Ranking::TotalAttacks,
            Label::Key,
        ),
        Scope::All => series(d, "daily_country_attacks", Vec::new(), Ranking::TotalAttacks, Label::Key),
    }
}

fn ip_plan(filters: &Filters) -> TopSeries {
    let d = Dimension::Ip;
    match filters.scope() {
        Scope::Ip(ip) => series(
            d,
            "daily_ip_attacks",
            Vec::new(),
            Ranking::Pinned(ip.to_string()),
            Label::Column("Unknown"),
        ),
        Scope::Username(_) => series(
            d,
            "daily_ip_username_attacks",
            filters.conditions(),
            Ranking::TotalAttacks,
            Label::Column("Mixed"),
        ),
        Scope::AsnCountry { country, .. } | Scope::Country(country) => series(
            d,
            "daily_ip_attacks",
            filters.conditions(),
            Ranking::TotalAttacks,
            Label::Fixed(country.to_string()),
        ),
        Scope::Asn(_) | Scope::All => series(
            d,
            "daily_ip_attacks",
            filters.conditions(),
            Ranking::TotalAttacks,
            Label::Column("Mixed"),
        ),
    }
}

fn username_plan(filters: &Filters) -> TopSeries {
    let d = Dimension::Username;
    match filters.scope() {
        Scope::Ip(ip) => series(
            d,
            "daily_ip_username_attacks",
            ip_only(ip),
            Ranking::TotalAttacks,
            Label::Fixed("Single IP".to_string()),
        ),
        Scope::Username(username) => series(
            d,
            "daily_username_attacks",
            Vec::new(),
            Ranking::Pinned(username.to_string()),
            Label::Fixed("Mixed".to_string()),
        ),
        Scope::AsnCountry { country, .. } | Scope::Country(country) => series(
            d,
            "daily_username_attacks",
            filters.conditions(),
            Ranking::TotalAttacks,
            Label::Fixed(country.to_string()),
        ),
        Scope::Asn(_) | Scope::All => series(
            d,
            "daily_username_attacks",
            filters.conditions(),
            Ranking::TotalAttacks,
            Label::Fixed("Mixed".to_string()),
        ),
    }
}

fn asn_plan(filters: &Filters) -> TopSeries {
    let d = Dimension::Asn;
    match filters.scope_username_first() {
        Scope::Username(_) => {
            let conditions = conditions_without(filters, "asn_name");
            match filters.asn.as_deref() {
                Some(asn) => series(
                    d,
                    "daily_ip_username_attacks",
                    conditions,
                    Ranking::Pinned(asn.to_string()),
                    Label::Column("Mixed"),
                ),
                None => series(
                    d,
                    "daily_ip_username_attacks",
                    conditions,
                    Ranking::TotalAttacks,
                    Label::Fixed("Mixed".to_string()),
                ),
            }
        }
        Scope::Ip(ip) => series(
            d,
            "daily_ip_attacks",
            ip_only(ip),
            Ranking::TotalAttacks,
            Label::Column("Unknown"),
        ),
        Scope::AsnCountry { asn, country } => series(
            d,
            "daily_asn_attacks",
            vec![Condition::new("country", country)],
            Ranking::Pinned(asn.to_string()),
            Label::Fixed(country.to_string()),
        ),
        Scope::Asn(asn) => series(
            d,
            "daily_asn_attacks",
            Vec::new(),
            Ranking::Pinned(asn.to_string()),
            Label::Column("Mixed"),
        ),
        Scope::Country(country) => series(
            d,
            "daily_asn_attacks",
            vec![Condition::new("country", country)],
            Ranking::TotalAttacks,
            Label::Fixed(country.to_string()),
        ),
        Scope::All => series(
            d,
            "daily_asn_attacks",
            Vec::new(),
            Ranking::TotalAttacks,
            Label::Fixed("Mixed".to_string()),
        ),
    }
}

fn push_date_range_cte(qb: &mut QueryBuilder, range: &DateRange) {
    qb.push("WITH date_range AS (").push_date_series(range).push(")");
}

impl DailySeries {
    pub fn build(&self, range: &DateRange) -> QueryBuilder {
        let mut qb = QueryBuilder::new();
        push_date_range_cte(&mut qb, range);
        qb.push(&format!(
            " SELECT CAST(d.date AS VARCHAR) AS date, CAST(COALESCE(SUM(s.{value}), 0) AS BIGINT) AS attacks \
             FROM date_range d LEFT JOIN {source} s ON s.date = d.date",
            value = self.value,
            source = self.source,
        ))
        .push_conditions("s.", &self.conditions)
        .push(" GROUP BY d.date ORDER BY d.date");
        qb
    }

    pub fn run(&self, conn: &Connection, range: &DateRange) -> Result<Vec<DailyPoint>> {
        self.build(range).query_map(conn, |row| {
            Ok(DailyPoint {
                date: row.get(0)?,
                attacks: row.get(1)?,
            })
        })
    }
}

impl TopSeries {
    /// `date BETWEEN .. AND ..` plus the plan's conditions, unaliased
    fn push_filter(&self, qb: &mut QueryBuilder, range: &DateRange) {
        qb.push_range("", range).push_conditions("", &self.conditions);
        if self.exclude_unknown {
            qb.push(&format!(" AND {} <> 'Unknown'", self.dimension.column()));
        }
    }

    fn push_ranking(&self, qb: &mut QueryBuilder, range: &DateRange, top_n: u32) {
        let column = self.dimension.column();
        let source = self.source;
        match &self.ranking {
            Ranking::Pinned(value) => {
                qb.push("SELECT ").push_text(value).push(" AS item");
            }
            Ranking::TotalAttacks => {
                qb.push(&format!("SELECT {column} AS item FROM {source} WHERE "));
                self.push_filter(qb, range);
                qb.push(&format!(
                    " AND {column} IS NOT NULL GROUP BY {column} ORDER BY SUM(attacks) DESC, item LIMIT {top_n}"
                ));
            }
            Ranking::Precomputed => {
                qb.push(&format!(
                    "SELECT v.{column} AS item FROM {table} v WHERE v.{column} IN (SELECT {column} FROM {source} WHERE ",
                    table = self.dimension.volatile_table(),
                ));
                self.push_filter(qb, range);
                qb.push(&format!(") ORDER BY v.max_volatility DESC, item LIMIT {top_n}"));
            }
            Ranking::WindowVolatility => {
                qb.push(&format!(
                    "SELECT item FROM (\
                       SELECT item, attacks, LAG(attacks) OVER (PARTITION BY item ORDER BY date) AS prev \
                       FROM (SELECT {column} AS item, date, SUM(attacks) AS attacks FROM {source} WHERE "
                ));
                self.push_filter(qb, range);
                qb.push(&format!(
                    " GROUP BY {column}, date)) WHERE prev IS NOT NULL GROUP BY item \
                     ORDER BY MAX(ABS(CASE WHEN prev > 0 THEN CAST(attacks - prev AS DOUBLE) * 100.0 / prev ELSE 0 END)) DESC, item \
                     LIMIT {top_n}"
                ));
            }
        }
    }

    pub fn build(&self, range: &DateRange, top_n: u32) -> QueryBuilder {
        let column = self.dimension.column();
        let source = self.source;
        let mut qb = QueryBuilder::new();

        push_date_range_cte(&mut qb, range);

        qb.push(", top_keys AS (");
        self.push_ranking(&mut qb, range, top_n);
        qb.push(")");

        if let Label::Column(_) = self.label {
            qb.push(&format!(
                ", labels AS (SELECT {column} AS item, MAX(country) AS label FROM {source} WHERE "
            ));
            self.push_filter(&mut qb, range);
            qb.push(&format!(" GROUP BY {column})"));
        }

        qb.push(", grid AS (SELECT d.date, k.item, ");
        match &self.label {
            Label::Column(fallback) => {
                qb.push("COALESCE(l.label, ")
                    .push_text(fallback)
                    .push(") AS label FROM date_range d CROSS JOIN top_keys k LEFT JOIN labels l ON l.item = k.item)");
            }
            Label::Fixed(text) => {
                qb.push_text(text)
                    .push(" AS label FROM date_range d CROSS JOIN top_keys k)");
            }
            Label::Key => {
                qb.push("k.item AS label FROM date_range d CROSS JOIN top_keys k)");
            }
        }

        qb.push(&format!(
            ", series AS (SELECT g.date, g.item, g.label, CAST(COALESCE(SUM(s.attacks), 0) AS BIGINT) AS attacks \
             FROM grid g LEFT JOIN {source} s ON s.date = g.date AND s.{column} = g.item"
        ))
        .push_conditions("s.", &self.conditions)
        .push(" GROUP BY g.date, g.item, g.label)");

        qb.push(
            ", changes AS (SELECT date, item, label, attacks, \
               LAG(attacks) OVER (PARTITION BY item ORDER BY date) AS prev FROM series) \
             SELECT CAST(date AS VARCHAR) AS date, item, label, attacks, \
               CAST(CASE WHEN prev > 0 THEN ROUND(CAST(attacks - prev AS DOUBLE) * 100.0 / prev, 2) ELSE 0 END AS DOUBLE) AS pct_change \
             FROM changes ORDER BY date, attacks DESC, item",
        );
        qb
    }

    pub fn run(&self, conn: &Connection, range: &DateRange, top_n: u32) -> Result<Vec<SeriesPoint>> {
        let dimension = self.dimension;
        let with_pct = self.pct_change;
        self.build(range, top_n).query_map(conn, |row| {
            Ok(SeriesPoint {
                dimension,
                date: row.get(0)?,
                key: row.get(1)?,
                country: row.get(2)?,
                attacks: row.get(3)?,
                pct_change: if with_pct { Some(row.get(4)?) } else { None },
            })
        })
    }
}

pub fn total_attacks(conn: &Connection, range: &DateRange, filters: &Filters) -> Result<Vec<DailyPoint>> {
    total_attacks_plan(filters).run(conn, range)
}

pub fn top_series(
    conn: &Connection,
    chart: Chart,
    range: &DateRange,
    filters: &Filters,
    top_n: u32,
) -> Result<Vec<SeriesPoint>> {
    chart.plan(filters).run(conn, range, top_n)
}
