//! Summary table definitions

pub struct Table {
    pub name: &'static str,
    pub columns: &'static str,
}

impl Table {
    pub fn create_sql(&self) -> String {
        self.create_named(self.name)
    }

    /// Same columns under another name, used for staging copies.
    pub fn create_named(&self, name: &str) -> String {
        format!("CREATE TABLE {} ({})", name, self.columns)
    }

    pub fn staging_name(&self) -> String {
        format!("staging_{}", self.name)
    }
}

pub const DAILY_STATS: Table = Table {
    name: "daily_stats",
    columns: "date DATE NOT NULL, total_attacks BIGINT NOT NULL, unique_ips BIGINT NOT NULL, \
              unique_countries BIGINT NOT NULL, unique_usernames BIGINT NOT NULL",
};

pub const DAILY_COUNTRY_ATTACKS: Table = Table {
    name: "daily_country_attacks",
    columns: "date DATE NOT NULL, country VARCHAR NOT NULL, attacks BIGINT NOT NULL",
};

pub const DAILY_ASN_ATTACKS: Table = Table {
    name: "daily_asn_attacks",
    columns: "date DATE NOT NULL, asn VARCHAR NOT NULL, asn_name VARCHAR NOT NULL, \
              country VARCHAR NOT NULL, attacks BIGINT NOT NULL",
};

pub const DAILY_IP_ATTACKS: Table = Table {
    name: "daily_ip_attacks",
    columns: "date DATE NOT NULL, ip VARCHAR NOT NULL, country VARCHAR NOT NULL, \
              asn_name VARCHAR NOT NULL, attacks BIGINT NOT NULL",
};

pub const DAILY_USERNAME_ATTACKS: Table = Table {
    name: "daily_username_attacks",
    columns: "date DATE NOT NULL, username VARCHAR NOT NULL, country VARCHAR NOT NULL, \
              asn_name VARCHAR NOT NULL, attacks BIGINT NOT NULL",
};

pub const DAILY_IP_USERNAME_ATTACKS: Table = Table {
    name: "daily_ip_username_attacks",
    columns: "date DATE NOT NULL, ip VARCHAR NOT NULL, username VARCHAR NOT NULL, \
              country VARCHAR NOT NULL, asn_name VARCHAR NOT NULL, attacks BIGINT NOT NULL",
};

pub const HOURLY_PATTERNS: Table = Table {
    name: "hourly_patterns",
    columns: "hour INTEGER NOT NULL, attack_count BIGINT NOT NULL, unique_ips BIGINT NOT NULL",
};

pub const VOLATILE_COUNTRY_SUMMARY: Table = Table {
    name: "volatile_country_summary",
    columns: "country VARCHAR NOT NULL, max_volatility DOUBLE NOT NULL, max_change_date DATE, \
              attacks_on_max BIGINT, prev_attacks_on_max BIGINT",
};

pub const VOLATILE_ASN_SUMMARY: Table = Table {
    name: "volatile_asn_summary",
    columns: "asn_name VARCHAR NOT NULL, max_volatility DOUBLE NOT NULL, max_change_date DATE, \
              attacks_on_max BIGINT, prev_attacks_on_max BIGINT",
};

pub const VOLATILE_IP_SUMMARY: Table = Table {
    name: "volatile_ip_summary",
    columns: "ip VARCHAR NOT NULL, max_volatility DOUBLE NOT NULL, max_change_date DATE, \
              attacks_on_max BIGINT, prev_attacks_on_max BIGINT",
};

pub const VOLATILE_USERNAME_SUMMARY: Table = Table {
    name: "volatile_username_summary",
    columns: "username VARCHAR NOT NULL, max_volatility DOUBLE NOT NULL, max_change_date DATE, \
              attacks_on_max BIGINT, prev_attacks_on_max BIGINT",
};

/// Tables filled from Parquet, one staging copy each
pub const AGGREGATE_TABLES: [&Table; 7] = [
    &DAILY_STATS,
    &DAILY_COUNTRY_ATTACKS,
    &DAILY_ASN_ATTACKS,
    &DAILY_IP_ATTACKS,
    &DAILY_USERNAME_ATTACKS,
    &DAILY_IP_USERNAME_ATTACKS,
    &HOURLY_PATTERNS,
];

pub const VOLATILE_TABLES: [&Table; 4] = [
    &VOLATILE_COUNTRY_SUMMARY,
    &VOLATILE_ASN_SUMMARY,
    &VOLATILE_IP_SUMMARY,
    &VOLATILE_USERNAME_SUMMARY,
];

/// Drop and recreate every summary table.
#[cfg(test)]
pub fn create_all(conn: &duckdb::Connection) -> crate::error::Result<()> {
    for table in AGGREGATE_TABLES.iter().chain(VOLATILE_TABLES.iter()) {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", table.name))?;
        conn.execute_batch(&table.create_sql())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckdb::Connection;

    #[test]
    fn creates_every_table() {
        let conn = Connection::open_in_memory().unwrap();
        create_all(&conn).unwrap();
        // Recreating is idempotent
        create_all(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name LIKE 'daily_%' \
                 OR table_name LIKE 'volatile_%' OR table_name = 'hourly_patterns'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 11);
    }

    #[test]
    fn staging_copy_has_prefixed_name() {
        assert_eq!(DAILY_STATS.staging_name(), "staging_daily_stats");
        assert!(DAILY_STATS
            .create_named("staging_daily_stats")
            .starts_with("CREATE TABLE staging_daily_stats ("));
    }
}
