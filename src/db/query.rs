//! SQL assembly with bound parameters
//!
//! Every value taken from a request is pushed as a `?` placeholder together
//! with its argument, so fragments and arguments can never drift apart.

use chrono::NaiveDate;
use duckdb::types::Value;
use duckdb::{params_from_iter, Connection, Row};
use serde::Deserialize;

use crate::config::ApiConfig;
use crate::error::{AppError, Result};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Default, Clone)]
pub struct QueryBuilder {
    sql: String,
    args: Vec<Value>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push_bind<V: Into<Value>>(&mut self, value: V) -> &mut Self {
        self.sql.push('?');
        self.args.push(value.into());
        self
    }

    pub fn push_text(&mut self, value: &str) -> &mut Self {
        self.push("CAST(").push_bind(value.to_string()).push(" AS VARCHAR)")
    }

    pub fn push_date(&mut self, date: NaiveDate) -> &mut Self {
        self.push("CAST(")
            .push_bind(date.format(DATE_FORMAT).to_string())
            .push(" AS DATE)")
    }

    /// One row per day of the range, in a column named `date`
    pub fn push_date_series(&mut self, range: &DateRange) -> &mut Self {
        self.push("SELECT CAST(UNNEST(generate_series(")
            .push_date(range.start)
            .push(", ")
            .push_date(range.end)
            .push(", INTERVAL 1 DAY)) AS DATE) AS date")
    }

    /// `{alias.}date BETWEEN start AND end`
    pub fn push_range(&mut self, alias: &str, range: &DateRange) -> &mut Self {
        self.push(alias)
            .push("date BETWEEN ")
            .push_date(range.start)
            .push(" AND ")
            .push_date(range.end)
    }

    /// ` AND {alias.}column = ?` for every condition
    pub fn push_conditions(&mut self, alias: &str, conditions: &[Condition]) -> &mut Self {
        for condition in conditions {
            self.push(" AND ")
                .push(alias)
                .push(condition.column)
                .push(" = ")
                .push_bind(condition.value.clone());
        }
        self
    }

    pub fn query_map<T, F>(&self, conn: &Connection, f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> duckdb::Result<T>,
    {
        let mut stmt = conn.prepare(&self.sql)?;
        let rows = stmt.query_map(params_from_iter(self.args.iter()), f)?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }
}

/// Equality condition on a summary table column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: &'static str,
    pub value: String,
}

impl Condition {
    pub fn new(column: &'static str, value: &str) -> Self {
        Self {
            column,
            value: value.to_string(),
        }
    }
}

/// Optional dimension filters from the query string
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct Filters {
    pub country: Option<String>,
    pub asn: Option<String>,
    pub ip: Option<String>,
    pub username: Option<String>,
}

/// Which filters are present, in the order the charts branch on them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Ip(&'a str),
    Username(&'a str),
    AsnCountry { asn: &'a str, country: &'a str },
    Country(&'a str),
    Asn(&'a str),
    All,
}

impl Filters {
    /// Trim values and treat empty strings as absent.
    pub fn normalized(self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Self {
            country: clean(self.country),
            asn: clean(self.asn),
            ip: clean(self.ip),
            username: clean(self.username),
        }
    }

    /// ip > username > asn+country > country > asn > all
    pub fn scope(&self) -> Scope<'_> {
        if let Some(ip) = self.ip.as_deref() {
            return Scope::Ip(ip);
        }
        if let Some(username) = self.username.as_deref() {
            return Scope::Username(username);
        }
        self.location_scope()
    }

    /// username > ip > asn+country > country > asn > all
    pub fn scope_username_first(&self) -> Scope<'_> {
        if let Some(username) = self.username.as_deref() {
            return Scope::Username(username);
        }
        if let Some(ip) = self.ip.as_deref() {
            return Scope::Ip(ip);
        }
        self.location_scope()
    }

    fn location_scope(&self) -> Scope<'_> {
        match (self.asn.as_deref(), self.country.as_deref()) {
            (Some(asn), Some(country)) => Scope::AsnCountry { asn, country },
            (None, Some(country)) => Scope::Country(country),
            (Some(asn), None) => Scope::Asn(asn),
            (None, None) => Scope::All,
        }
    }

    /// Conditions for every present filter, using the summary table column names.
    pub fn conditions(&self) -> Vec<Condition> {
        let mut conditions = Vec::new();
        if let Some(ip) = &self.ip {
            conditions.push(Condition::new("ip", ip));
        }
        if let Some(username) = &self.username {
            conditions.push(Condition::new("username", username));
        }
        if let Some(asn) = &self.asn {
            conditions.push(Condition::new("asn_name", asn));
        }
        if let Some(country) = &self.country {
            conditions.push(Condition::new("country", country));
        }
        conditions
    }
}

/// Inclusive range of days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(AppError::InvalidParameter(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `start`/`end` query values, falling back to the configured defaults.
    pub fn parse(start: Option<&str>, end: Option<&str>, defaults: &ApiConfig) -> Result<Self> {
        let pick = |value: Option<&str>, default: &str, name: &str| -> Result<NaiveDate> {
            let value = value.map(str::trim).filter(|v| !v.is_empty()).unwrap_or(default);
            NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| {
                AppError::InvalidParameter(format!("{} must be a YYYY-MM-DD date, got '{}'", name, value))
            })
        };
        Self::new(
            pick(start, &defaults.default_start, "start")?,
            pick(end, &defaults.default_end, "end")?,
        )
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}
