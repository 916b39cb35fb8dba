//! CSV quotes to Parquet
//!
//! Input is CSV, gzip-compressed when the file name ends in `.gz`, with a
//! header naming at least the columns below. Extra columns are ignored.
//! Rows are streamed to the writer in fixed-size record batches so memory
//! stays bounded regardless of the unit's size.

use super::{ConversionStats, Converter};
use crate::error::{PipelineError, Result};
use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::{Compression, ZstdLevel};
use ::parquet::file::properties::WriterProperties;
use arrow::array::{ArrayRef, Float64Builder, TimestampNanosecondBuilder, UInt32Builder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Rows per record batch
pub const BATCH_ROWS: usize = 65_536;

const COLUMNS: [&str; 6] = ["ts_event", "instrument_id", "bid_px", "ask_px", "bid_sz", "ask_sz"];

pub fn quote_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            "ts_event",
            DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
            false,
        ),
        Field::new("instrument_id", DataType::UInt32, false),
        Field::new("bid_px", DataType::Float64, false),
        Field::new("ask_px", DataType::Float64, false),
        Field::new("bid_sz", DataType::UInt32, false),
        Field::new("ask_sz", DataType::UInt32, false),
    ]))
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_created_by(format!("archsync {}", env!("CARGO_PKG_VERSION")))
        .build()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ParquetConverter;

impl ParquetConverter {
    pub fn new() -> Self {
        Self
    }
}

/// Column builders for one in-flight batch
struct BatchBuilder {
    ts_event: TimestampNanosecondBuilder,
    instrument_id: UInt32Builder,
    bid_px: Float64Builder,
    ask_px: Float64Builder,
    bid_sz: UInt32Builder,
    ask_sz: UInt32Builder,
    len: usize,
}

impl BatchBuilder {
    fn new() -> Self {
        Self {
            ts_event: TimestampNanosecondBuilder::with_capacity(BATCH_ROWS).with_timezone("UTC"),
            instrument_id: UInt32Builder::with_capacity(BATCH_ROWS),
            bid_px: Float64Builder::with_capacity(BATCH_ROWS),
            ask_px: Float64Builder::with_capacity(BATCH_ROWS),
            bid_sz: UInt32Builder::with_capacity(BATCH_ROWS),
            ask_sz: UInt32Builder::with_capacity(BATCH_ROWS),
            len: 0,
        }
    }

    fn finish(&mut self, schema: &SchemaRef) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.ts_event.finish()),
            Arc::new(self.instrument_id.finish()),
            Arc::new(self.bid_px.finish()),
            Arc::new(self.ask_px.finish()),
            Arc::new(self.bid_sz.finish()),
            Arc::new(self.ask_sz.finish()),
        ];
        self.len = 0;
        RecordBatch::try_new(schema.clone(), columns)
            .map_err(|e| PipelineError::format(format!("cannot assemble batch: {e}")))
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, column: &str, line: u64) -> Result<T> {
    value.trim().parse().map_err(|_| {
        PipelineError::format(format!("line {line}: cannot parse {column} from '{value}'"))
    })
}

fn parse_price(value: &str, column: &str, line: u64) -> Result<f64> {
    let px: f64 = parse_field(value, column, line)?;
    if !px.is_finite() {
        return Err(PipelineError::format(format!(
            "line {line}: {column} is not finite ('{value}')"
        )));
    }
    Ok(px)
}

fn open_input(raw: &Path) -> Result<Box<dyn Read>> {
    let file = BufReader::new(File::open(raw)?);
    let gzipped = raw
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if gzipped {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn write_error(e: ::parquet::errors::ParquetError) -> PipelineError {
    PipelineError::Io(std::io::Error::other(format!("parquet write failed: {e}")))
}

impl Converter for ParquetConverter {
    fn convert(&self, raw: &Path, artifact: &Path) -> Result<ConversionStats> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(open_input(raw)?);

        let headers = reader
            .headers()
            .map_err(|e| PipelineError::format(format!("cannot read header: {e}")))?
            .clone();
        if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
            return Err(PipelineError::format("input is empty"));
        }

        let mut index = [0usize; 6];
        for (slot, column) in index.iter_mut().zip(COLUMNS) {
            *slot = headers
                .iter()
                .position(|h| h.trim() == column)
                .ok_or_else(|| PipelineError::format(format!("missing required column '{column}'")))?;
        }

        let schema = quote_schema();
        let out = File::create(artifact)?;
        let mut writer =
            ArrowWriter::try_new(out, schema.clone(), Some(writer_properties())).map_err(write_error)?;

        let mut batch = BatchBuilder::new();
        let mut rows = 0u64;
        let mut record = csv::StringRecord::new();

        loop {
            let more = reader
                .read_record(&mut record)
                .map_err(|e| PipelineError::format(format!("unreadable input: {e}")))?;
            if !more {
                break;
            }
            // header is line 1
            let line = rows + 2;

            batch.ts_event.append_value(parse_field::<i64>(&record[index[0]], COLUMNS[0], line)?);
            batch
                .instrument_id
                .append_value(parse_field::<u32>(&record[index[1]], COLUMNS[1], line)?);
            batch.bid_px.append_value(parse_price(&record[index[2]], COLUMNS[2], line)?);
            batch.ask_px.append_value(parse_price(&record[index[3]], COLUMNS[3], line)?);
            batch.bid_sz.append_value(parse_field::<u32>(&record[index[4]], COLUMNS[4], line)?);
            batch.ask_sz.append_value(parse_field::<u32>(&record[index[5]], COLUMNS[5], line)?);
            batch.len += 1;
            rows += 1;

            if batch.len == BATCH_ROWS {
                writer.write(&batch.finish(&schema)?).map_err(write_error)?;
            }
        }

        if rows == 0 {
            return Err(PipelineError::format("input has a header but no rows"));
        }

        if batch.len > 0 {
            writer.write(&batch.finish(&schema)?).map_err(write_error)?;
        }
        writer.close().map_err(write_error)?;

        let bytes = std::fs::metadata(artifact)?.len();
        debug!(rows, bytes, "Converted to parquet");

        Ok(ConversionStats { rows, bytes })
    }
}
