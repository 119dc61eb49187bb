//! Summary table construction from the partitioned Parquet output
//!
//! Files are aggregated one at a time into staging tables, then the staging
//! rows are consolidated per key. Distinct counts in `daily_stats` and
//! `hourly_patterns` cannot be summed across files, so those keep the
//! largest per-file value (a lower bound).

use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use super::schema::{self, Table};
use crate::error::Result;

struct Aggregate {
    table: &'static Table,
    /// Per-file aggregation; `{source}` is replaced by the file scan
    per_file: &'static str,
    /// Staging to final; `{staging}` is replaced by the staging table name
    consolidate: &'static str,
}

const AGGREGATES: [Aggregate; 7] = [
    Aggregate {
        table: &schema::DAILY_STATS,
        per_file: "SELECT CAST(datetime AS DATE), COUNT(*), COUNT(DISTINCT ip), COUNT(DISTINCT country), \
                   COUNT(DISTINCT username) FROM {source} GROUP BY 1",
        consolidate: "SELECT date, SUM(total_attacks), MAX(unique_ips), MAX(unique_countries), \
                      MAX(unique_usernames) FROM {staging} GROUP BY date ORDER BY date",
    },
    Aggregate {
        table: &schema::DAILY_COUNTRY_ATTACKS,
        per_file: "SELECT CAST(datetime AS DATE), country, COUNT(*) FROM {source} \
                   WHERE country IS NOT NULL GROUP BY 1, 2",
        consolidate: "SELECT date, country, SUM(attacks) FROM {staging} \
                      GROUP BY date, country ORDER BY date, country",
    },
    Aggregate {
        table: &schema::DAILY_ASN_ATTACKS,
        per_file: "SELECT CAST(datetime AS DATE), COALESCE(asn, 'Unknown'), asn_name, country, COUNT(*) \
                   FROM {source} \
                   WHERE asn_name IS NOT NULL AND asn_name <> 'Unknown' AND country IS NOT NULL AND country <> '' \
                   GROUP BY 1, 2, 3, 4",
        consolidate: "SELECT date, asn, asn_name, country, SUM(attacks) FROM {staging} \
                      GROUP BY date, asn, asn_name, country ORDER BY date, asn_name",
    },
    Aggregate {
        table: &schema::DAILY_IP_ATTACKS,
        per_file: "SELECT CAST(datetime AS DATE), ip, COALESCE(country, 'Unknown'), \
                   COALESCE(asn_name, 'Unknown'), COUNT(*) FROM {source} GROUP BY 1, 2, 3, 4",
        consolidate: "SELECT date, ip, country, asn_name, SUM(attacks) FROM {staging} \
                      GROUP BY date, ip, country, asn_name ORDER BY date, ip",
    },
    Aggregate {
        table: &schema::DAILY_USERNAME_ATTACKS,
        per_file: "SELECT CAST(datetime AS DATE), username, COALESCE(country, 'Unknown'), \
                   COALESCE(asn_name, 'Unknown'), COUNT(*) FROM {source} GROUP BY 1, 2, 3, 4",
        consolidate: "SELECT date, username, country, asn_name, SUM(attacks) FROM {staging} \
                      GROUP BY date, username, country, asn_name ORDER BY date, username",
    },
    Aggregate {
        table: &schema::DAILY_IP_USERNAME_ATTACKS,
        per_file: "SELECT CAST(datetime AS DATE), ip, username, COALESCE(country, 'Unknown'), \
                   COALESCE(asn_name, 'Unknown'), COUNT(*) FROM {source} GROUP BY 1, 2, 3, 4, 5",
        consolidate: "SELECT date, ip, username, country, asn_name, SUM(attacks) FROM {staging} \
                      GROUP BY date, ip, username, country, asn_name ORDER BY date, ip, username",
    },
    Aggregate {
        table: &schema::HOURLY_PATTERNS,
        // time is logged as HHMMSS
        per_file: "SELECT CAST((\"time\" // 10000) % 24 AS INTEGER), COUNT(*), COUNT(DISTINCT ip) \
                   FROM {source} WHERE \"time\" >= 0 GROUP BY 1",
        consolidate: "SELECT hour, SUM(attack_count), MAX(unique_ips) FROM {staging} \
                      GROUP BY hour ORDER BY hour",
    },
];

struct Volatility {
    table: &'static Table,
    key: &'static str,
    source: &'static str,
    filter: &'static str,
}

const VOLATILITIES: [Volatility; 4] = [
    Volatility {
        table: &schema::VOLATILE_COUNTRY_SUMMARY,
        key: "country",
        source: "daily_country_attacks",
        filter: "WHERE country <> 'Unknown'",
    },
    Volatility {
        table: &schema::VOLATILE_ASN_SUMMARY,
        key: "asn_name",
        source: "daily_asn_attacks",
        filter: "",
    },
    Volatility {
        table: &schema::VOLATILE_IP_SUMMARY,
        key: "ip",
        source: "daily_ip_attacks",
        filter: "",
    },
    Volatility {
        table: &schema::VOLATILE_USERNAME_SUMMARY,
        key: "username",
        source: "daily_username_attacks",
        filter: "",
    },
];

#[derive(Debug, Default)]
pub struct SummaryReport {
    pub files_found: usize,
    pub files_loaded: usize,
    pub files_failed: usize,
    pub table_rows: Vec<(String, i64)>,
}

/// `year=*/month=*/*.parquet` under `dir`, sorted
pub fn find_parquet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let root = glob::Pattern::escape(&dir.to_string_lossy());
    let pattern = format!("{}/year=*/month=*/*.parquet", root);
    let mut files: Vec<PathBuf> = glob::glob(&pattern)?.filter_map(|entry| entry.ok()).collect();
    files.sort();
    Ok(files)
}

fn parquet_source(path: &Path) -> String {
    format!(
        "read_parquet('{}', hive_partitioning = false)",
        path.to_string_lossy().replace('\'', "''")
    )
}

fn run_in_transaction(conn: &Connection, statements: &[String]) -> Result<()> {
    conn.execute_batch("BEGIN TRANSACTION")?;
    for statement in statements {
        if let Err(e) = conn.execute_batch(statement) {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
    }
    conn.execute_batch("COMMIT")?;
    Ok(())
}

fn load_file(conn: &Connection, path: &Path) -> Result<()> {
    let source = parquet_source(path);
    let statements: Vec<String> = AGGREGATES
        .iter()
        .map(|agg| {
            format!(
                "INSERT INTO {} {}",
                agg.table.staging_name(),
                agg.per_file.replace("{source}", &source)
            )
        })
        .collect();
    run_in_transaction(conn, &statements)
}

fn consolidate(conn: &Connection) -> Result<()> {
    let mut statements = Vec::new();
    for agg in &AGGREGATES {
        let staging = agg.table.staging_name();
        statements.push(format!("DROP TABLE IF EXISTS {}", agg.table.name));
        statements.push(agg.table.create_sql());
        statements.push(format!(
            "INSERT INTO {} {}",
            agg.table.name,
            agg.consolidate.replace("{staging}", &staging)
        ));
        statements.push(format!("DROP TABLE {}", staging));
    }
    run_in_transaction(conn, &statements)
}

fn volatility_sql(v: &Volatility) -> String {
    format!(
        "INSERT INTO {table} \
         WITH per_day AS (\
           SELECT {key} AS item, date, SUM(attacks) AS attacks FROM {source} {filter} GROUP BY 1, 2), \
         changes AS (\
           SELECT item, date, attacks, LAG(attacks) OVER (PARTITION BY item ORDER BY date) AS prev FROM per_day), \
         pct AS (\
           SELECT item, date, attacks, prev, \
             ABS(CASE WHEN prev > 0 THEN CAST(attacks - prev AS DOUBLE) * 100.0 / prev ELSE 0 END) AS pct_change \
           FROM changes WHERE prev IS NOT NULL) \
         SELECT item, MAX(pct_change), arg_max(date, pct_change), arg_max(attacks, pct_change), \
           arg_max(prev, pct_change) \
         FROM pct GROUP BY item ORDER BY 2 DESC",
        table = v.table.name,
        key = v.key,
        source = v.source,
        filter = v.filter,
    )
}

/// Rebuild the volatility tables from the daily tables.
pub fn build_volatility(conn: &Connection) -> Result<()> {
    let mut statements = Vec::new();
    for v in &VOLATILITIES {
        statements.push(format!("DROP TABLE IF EXISTS {}", v.table.name));
        statements.push(v.table.create_sql());
        statements.push(volatility_sql(v));
    }
    run_in_transaction(conn, &statements)
}

pub fn table_rows(conn: &Connection) -> Result<Vec<(String, i64)>> {
    schema::AGGREGATE_TABLES
        .iter()
        .chain(schema::VOLATILE_TABLES.iter())
        .map(|table| {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name), [], |row| row.get(0))?;
            Ok((table.name.to_string(), count))
        })
        .collect()
}

/// Build every summary table from the Parquet files under `parquet_dir`.
/// Existing summary tables are replaced.
pub fn build_summaries(conn: &Connection, parquet_dir: &Path) -> Result<SummaryReport> {
    let files = find_parquet_files(parquet_dir)?;
    let mut report = SummaryReport {
        files_found: files.len(),
        ..Default::default()
    };
    info!("Found {} parquet files under {}", files.len(), parquet_dir.display());

    for table in schema::AGGREGATE_TABLES {
        let staging = table.staging_name();
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", staging))?;
        conn.execute_batch(&table.create_named(&staging))?;
    }

    let started = Instant::now();
    for (i, file) in files.iter().enumerate() {
        match load_file(conn, file) {
            Ok(()) => report.files_loaded += 1,
            Err(e) => {
                warn!("Skipping {}: {}", file.display(), e);
                report.files_failed += 1;
            }
        }

        let done = i + 1;
        if done == 1 || done % 100 == 0 || done == files.len() {
            let rate = done as f64 / started.elapsed().as_secs_f64().max(0.001);
            info!("[{}/{}] files aggregated ({:.1} files/sec)", done, files.len(), rate);
        }
    }

    info!("Consolidating summary tables");
    consolidate(conn)?;

    info!("Computing volatility summaries");
    build_volatility(conn)?;

    report.table_rows = table_rows(conn)?;
    for (table, rows) in &report.table_rows {
        info!("{}: {} rows", table, rows);
    }

    Ok(report)
}
