//! Partitioned Parquet output
//!
//! Files land under `year=Y/month=M/` so DuckDB (and anything else that
//! understands hive partitioning) can prune by month.

use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use super::record::AttackRecord;
use crate::error::{AppError, Result};

/// Output schema, in column order
pub fn attack_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            let text = |name: &str| Field::new(name, DataType::Utf8, true);
            Arc::new(Schema::new(vec![
                Field::new("datetime", DataType::Timestamp(TimeUnit::Microsecond, None), false),
                Field::new("year", DataType::Int32, false),
                Field::new("month", DataType::Int32, false),
                text("ip"),
                Field::new("time", DataType::Int64, false),
                text("continent"),
                text("country_code"),
                text("country"),
                Field::new("latitude", DataType::Float64, true),
                Field::new("longitude", DataType::Float64, true),
                text("asn"),
                text("asn_name"),
                text("asn_domain"),
                text("asn_type"),
                text("node"),
                Field::new("port", DataType::Int64, false),
                text("pid"),
                text("username"),
                text("tag"),
                text("message"),
            ]))
        })
        .clone()
}

pub fn parse_compression(name: &str) -> Result<Compression> {
    match name.to_lowercase().as_str() {
        "snappy" => Ok(Compression::SNAPPY),
        "zstd" => Ok(Compression::ZSTD(ZstdLevel::default())),
        "gzip" => Ok(Compression::GZIP(GzipLevel::default())),
        "lz4" => Ok(Compression::LZ4),
        "none" => Ok(Compression::UNCOMPRESSED),
        other => Err(AppError::InvalidParameter(format!("unknown compression '{}'", other))),
    }
}

/// Build an Arrow batch from enriched records
pub fn to_record_batch(records: &[AttackRecord]) -> Result<RecordBatch> {
    fn text<'a>(records: &'a [AttackRecord], f: impl Fn(&'a AttackRecord) -> Option<&'a str>) -> ArrayRef {
        Arc::new(records.iter().map(f).collect::<StringArray>())
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMicrosecondArray::from(
            records
                .iter()
                .map(|r| r.datetime.and_utc().timestamp_micros())
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            records.iter().map(|r| r.partition().0).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            records.iter().map(|r| r.partition().1 as i32).collect::<Vec<_>>(),
        )),
        text(records, |r| Some(r.ip.as_str())),
        Arc::new(Int64Array::from(records.iter().map(|r| r.time).collect::<Vec<_>>())),
        text(records, |r| r.geo.continent.as_deref()),
        text(records, |r| r.geo.country_code.as_deref()),
        text(records, |r| r.geo.country.as_deref()),
        Arc::new(Float64Array::from(
            records.iter().map(|r| r.geo.latitude).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            records.iter().map(|r| r.geo.longitude).collect::<Vec<_>>(),
        )),
        text(records, |r| r.geo.asn.as_deref()),
        text(records, |r| r.geo.asn_name.as_deref()),
        text(records, |r| r.geo.asn_domain.as_deref()),
        text(records, |r| r.geo.asn_type.as_deref()),
        text(records, |r| Some(r.node.as_str())),
        Arc::new(Int64Array::from(records.iter().map(|r| r.port).collect::<Vec<_>>())),
        text(records, |r| Some(r.pid.as_str())),
        text(records, |r| Some(r.username.as_str())),
        text(records, |r| Some(r.tag.as_str())),
        text(records, |r| Some(r.message.as_str())),
    ];

    Ok(RecordBatch::try_new(attack_schema(), columns)?)
}

/// Process-wide file counter. Writers for same-named CSVs in different
/// directories share a stem, so a per-writer count is not enough.
static FILE_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Writes one Parquet file per (partition, chunk)
pub struct PartitionWriter {
    root: PathBuf,
    stem: String,
    properties: WriterProperties,
    written: usize,
}

impl PartitionWriter {
    pub fn new(root: &Path, stem: &str, compression: Compression) -> Self {
        Self {
            root: root.to_path_buf(),
            stem: stem.to_string(),
            properties: WriterProperties::builder().set_compression(compression).build(),
            written: 0,
        }
    }

    pub fn partition_dir(&self, year: i32, month: u32) -> PathBuf {
        self.root.join(format!("year={}", year)).join(format!("month={}", month))
    }

    /// Write records that all belong to the same (year, month) partition.
    pub fn write(&mut self, (year, month): (i32, u32), records: &[AttackRecord]) -> Result<PathBuf> {
        let dir = self.partition_dir(year, month);
        fs::create_dir_all(&dir)?;

        let micros = chrono::Utc::now().timestamp_micros();
        let sequence = FILE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("data_{}_{}_{}.parquet", self.stem, micros, sequence));

        let batch = to_record_batch(records)?;
        // Never replace a file another writer produced
        let file = File::create_new(&path)?;
        let mut writer = ArrowWriter::try_new(file, attack_schema(), Some(self.properties.clone()))?;
        writer.write(&batch)?;
        writer.close()?;

        self.written += 1;
        Ok(path)
    }

    pub fn files_written(&self) -> usize {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::IpInfo;
    use chrono::NaiveDate;
    use parquet::file::reader::{FileReader, SerializedFileReader};

    fn record(day: u32, ip: &str) -> AttackRecord {
        AttackRecord {
            datetime: NaiveDate::from_ymd_opt(2022, 11, day)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            ip: ip.to_string(),
            time: 1200,
            geo: IpInfo {
                country: Some("China".to_string()),
                ..Default::default()
            },
            node: "node1".to_string(),
            port: 22,
            pid: "123".to_string(),
            username: "root".to_string(),
            tag: "sshd".to_string(),
            message: "Failed password".to_string(),
        }
    }

    #[test]
    fn batch_matches_schema() {
        let batch = to_record_batch(&[record(1, "1.2.3.4"), record(2, "5.6.7.8")]).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), attack_schema().fields().len());
    }

    #[test]
    fn writes_into_hive_partition() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PartitionWriter::new(dir.path(), "honeypot", Compression::SNAPPY);

        let path = writer.write((2022, 11), &[record(1, "1.2.3.4"), record(3, "1.2.3.4")]).unwrap();
        assert!(path.starts_with(dir.path().join("year=2022").join("month=11")));
        assert_eq!(writer.files_written(), 1);

        let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }

    #[test]
    fn same_stem_writers_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        // a/attacks.csv and b/attacks.csv converted side by side
        let mut first = PartitionWriter::new(dir.path(), "attacks", Compression::SNAPPY);
        let mut second = PartitionWriter::new(dir.path(), "attacks", Compression::SNAPPY);

        let a = first.write((2022, 11), &[record(1, "1.2.3.4")]).unwrap();
        let b = second.write((2022, 11), &[record(2, "5.6.7.8"), record(3, "5.6.7.8")]).unwrap();
        assert_ne!(a, b);

        let rows = |path: &Path| {
            let reader = SerializedFileReader::new(File::open(path).unwrap()).unwrap();
            reader.metadata().file_metadata().num_rows()
        };
        assert_eq!(rows(&a), 1);
        assert_eq!(rows(&b), 2);
        assert_eq!(fs::read_dir(first.partition_dir(2022, 11)).unwrap().count(), 2);
    }

    #[test]
    fn compression_names() {
        assert_eq!(parse_compression("SNAPPY").unwrap(), Compression::SNAPPY);
        assert_eq!(parse_compression("none").unwrap(), Compression::UNCOMPRESSED);
        assert!(parse_compression("brotli9000").is_err());
    }
}
