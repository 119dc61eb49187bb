//! Cross-checks summary table totals against `daily_stats`

use duckdb::Connection;

use crate::error::Result;

/// Tables that keep every row and must match the total exactly
const EXACT: [&str; 3] = [
    "daily_ip_attacks",
    "daily_username_attacks",
    "daily_ip_username_attacks",
];

/// Tables that drop unattributed rows and may fall slightly short
const FILTERED: [&str; 2] = ["daily_country_attacks", "daily_asn_attacks"];

/// Relative difference tolerated for filtered tables, in percent
const TOLERANCE_PCT: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TableCheck {
    pub table: String,
    pub attacks: i64,
    pub difference: i64,
    pub difference_pct: f64,
    pub exact: bool,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub total_attacks: i64,
    pub checks: Vec<TableCheck>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

fn sum(conn: &Connection, table: &str, column: &str) -> Result<i64> {
    Ok(conn.query_row(
        &format!("SELECT CAST(COALESCE(SUM({}), 0) AS BIGINT) FROM {}", column, table),
        [],
        |row| row.get(0),
    )?)
}

pub fn verify(conn: &Connection) -> Result<VerifyReport> {
    let total = sum(conn, "daily_stats", "total_attacks")?;

    let tables = EXACT
        .iter()
        .map(|t| (*t, true))
        .chain(FILTERED.iter().map(|t| (*t, false)));

    let mut checks = Vec::new();
    for (table, exact) in tables {
        let attacks = sum(conn, table, "attacks")?;
        let difference = total - attacks;
        let difference_pct = if total > 0 {
            difference.abs() as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        let ok = if exact {
            difference == 0
        } else {
            difference_pct < TOLERANCE_PCT
        };
        checks.push(TableCheck {
            table: table.to_string(),
            attacks,
            difference,
            difference_pct,
            exact,
            ok,
        });
    }

    Ok(VerifyReport {
        total_attacks: total,
        checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{testing, Database};

    fn check<'a>(report: &'a VerifyReport, table: &str) -> &'a TableCheck {
        report.checks.iter().find(|c| c.table == table).unwrap()
    }

    #[test]
    fn seeded_tables_are_checked() {
        let db = testing::seeded();
        let conn = db.connection().unwrap();

        let report = verify(&conn).unwrap();
        assert_eq!(report.total_attacks, 310);
        assert_eq!(report.checks.len(), 5);

        assert!(check(&report, "daily_ip_attacks").ok);
        assert!(check(&report, "daily_country_attacks").ok);
        assert!(check(&report, "daily_ip_attacks").exact);
        assert!(!check(&report, "daily_country_attacks").exact);

        // 20 unattributed attacks are 6.45% of the total
        let asn = check(&report, "daily_asn_attacks");
        assert_eq!(asn.difference, 20);
        assert!(!asn.ok);
        assert!(!report.is_ok());
    }

    #[test]
    fn exact_tables_reject_any_difference() {
        let db = testing::seeded();
        let conn = db.connection().unwrap();
        conn.execute_batch(
            "DELETE FROM daily_username_attacks WHERE username = 'admin' AND date = DATE '2022-11-03'",
        )
        .unwrap();

        let report = verify(&conn).unwrap();
        let username = check(&report, "daily_username_attacks");
        assert_eq!(username.difference, 20);
        assert!(!username.ok);
    }

    #[test]
    fn built_summaries_within_tolerance_except_unattributed() {
        let dir = tempfile::tempdir().unwrap();
        crate::db::summaries::tests::write_sample(dir.path());

        let db = Database::open_in_memory().unwrap();
        let conn = db.connection().unwrap();
        crate::db::summaries::build_summaries(&conn, dir.path()).unwrap();

        let report = verify(&conn).unwrap();
        assert_eq!(report.total_attacks, 6);
        for table in EXACT {
            assert!(check(&report, table).ok, "{} should match exactly", table);
        }
        assert_eq!(check(&report, "daily_country_attacks").difference, 1);
    }
}
