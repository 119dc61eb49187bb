//! CSV to Parquet conversion
//!
//! Each honeypot CSV is read in chunks. Every chunk is enriched, split by
//! (year, month) and written to the matching hive partition.

pub mod record;
pub mod writer;

use futures::StreamExt;
use parquet::basic::Compression;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::enrich::{self, IpEnricher, IpInfo};
use crate::error::Result;
use record::{AttackRecord, RawRecord};
use writer::PartitionWriter;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConversionReport {
    pub files_found: usize,
    pub files_converted: usize,
    pub files_failed: usize,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub rows_enriched: u64,
    pub parquet_files: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FileStats {
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub rows_enriched: u64,
    pub parquet_files: usize,
}

impl ConversionReport {
    fn add(&mut self, stats: &FileStats) {
        self.files_converted += 1;
        self.rows_written += stats.rows_written;
        self.rows_skipped += stats.rows_skipped;
        self.rows_enriched += stats.rows_enriched;
        self.parquet_files += stats.parquet_files;
    }
}

/// CSV files directly under `dir` and one directory level down, sorted.
pub fn find_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let root = glob::Pattern::escape(&dir.to_string_lossy());
    let mut files = Vec::new();
    for pattern in [format!("{}/*.csv", root), format!("{}/*/*.csv", root)] {
        files.extend(
            glob::glob(&pattern)?
                .filter_map(|entry| entry.ok())
                .filter(|path| path.is_file()),
        );
    }
    files.sort();
    files.dedup();
    Ok(files)
}

struct ChunkWriter<'a> {
    enricher: &'a dyn IpEnricher,
    writer: PartitionWriter,
    stats: FileStats,
}

impl ChunkWriter<'_> {
    /// Enrich a chunk and write one file per partition it touches.
    fn flush(&mut self, chunk: &mut Vec<AttackRecord>) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let mut lookups: HashMap<String, IpInfo> = HashMap::new();
        let mut partitions: BTreeMap<(i32, u32), Vec<AttackRecord>> = BTreeMap::new();
        for mut record in chunk.drain(..) {
            let geo = lookups
                .entry(record.ip.clone())
                .or_insert_with(|| self.enricher.lookup(&record.ip));
            if !geo.is_empty() {
                self.stats.rows_enriched += 1;
            }
            record.geo = geo.clone();
            partitions.entry(record.partition()).or_default().push(record);
        }

        for (partition, records) in partitions {
            let path = self.writer.write(partition, &records)?;
            debug!("Wrote {} rows to {}", records.len(), path.display());
            self.stats.rows_written += records.len() as u64;
        }
        self.stats.parquet_files = self.writer.files_written();
        Ok(())
    }
}

/// Convert one CSV file. Rows that fail to parse are skipped and counted;
/// I/O failures abort the file.
pub fn convert_file(
    path: &Path,
    output: &Path,
    enricher: &dyn IpEnricher,
    chunk_size: usize,
    compression: Compression,
) -> Result<FileStats> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());

    let mut out = ChunkWriter {
        enricher,
        writer: PartitionWriter::new(output, &stem, compression),
        stats: FileStats::default(),
    };
    let mut chunk = Vec::with_capacity(chunk_size.min(100_000));

    for result in reader.deserialize::<RawRecord>() {
        match result {
            Ok(raw) => match AttackRecord::from_raw(raw) {
                Some(record) => chunk.push(record),
                None => out.stats.rows_skipped += 1,
            },
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                debug!("Skipping malformed row in {}: {}", path.display(), e);
                out.stats.rows_skipped += 1;
            }
        }

        if chunk.len() >= chunk_size {
            out.flush(&mut chunk)?;
        }
    }
    out.flush(&mut chunk)?;

    Ok(out.stats)
}

/// Convert every CSV under `paths.csv_directory` into partitioned Parquet.
pub async fn convert(config: &Config) -> Result<ConversionReport> {
    let files = find_csv_files(&config.paths.csv_directory)?;
    let output = config.paths.output_directory.clone();
    fs::create_dir_all(&output)?;

    let enricher: Arc<dyn IpEnricher> = Arc::new(enrich::from_config(&config.paths)?);
    let compression = writer::parse_compression(&config.etl.compression)?;
    let chunk_size = config.etl.chunk_size;

    let mut report = ConversionReport {
        files_found: files.len(),
        ..Default::default()
    };
    info!(
        "Converting {} CSV files from {} into {}",
        files.len(),
        config.paths.csv_directory.display(),
        output.display()
    );

    let mut results = futures::stream::iter(files)
        .map(|path| {
            let enricher = enricher.clone();
            let output = output.clone();
            tokio::task::spawn_blocking(move || {
                let result = convert_file(&path, &output, enricher.as_ref(), chunk_size, compression);
                (path, result)
            })
        })
        .buffer_unordered(config.etl.workers.max(1));

    while let Some(joined) = results.next().await {
        match joined {
            Ok((path, Ok(stats))) => {
                report.add(&stats);
                info!(
                    "[{}/{}] {}: {} rows, {} skipped, {} enriched",
                    report.files_converted + report.files_failed,
                    report.files_found,
                    path.display(),
                    stats.rows_written,
                    stats.rows_skipped,
                    stats.rows_enriched
                );
            }
            Ok((path, Err(e))) => {
                warn!("Failed to convert {}: {}", path.display(), e);
                report.files_failed += 1;
            }
            Err(e) => {
                error!("Conversion task panicked: {}", e);
                report.files_failed += 1;
            }
        }
    }

    Ok(report)
}
