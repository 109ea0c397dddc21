//! Wire encodings for [`Table`]s.
//!
//! Columnar: Arrow record batches, serialized as Parquet (dataset download,
//! archive, `parquet` selections) or as an Arrow IPC stream (`arrow` query
//! mode). Row-oriented: JSON array, JSON lines, and CSV, written
//! incrementally to any [`Write`] sink so large selections can stream into a
//! file instead of being assembled in memory twice.
//!
//! Column types are inferred from the cells: all-bool → `Boolean`, all-int →
//! `Int64`, ints and floats → `Float64`, only bytes/images → `Binary`,
//! anything else (text, nested JSON, mixtures, all-null) → `Utf8`.

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BinaryArray, BooleanArray, Float64Array, Int64Array, RecordBatch,
    RecordBatchOptions, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::io::{Cursor, Write};
use std::sync::Arc;

use crate::models::{Cell, Column, Table};

pub(crate) fn infer_type(values: &[Cell]) -> DataType {
    let (mut bools, mut ints, mut floats, mut binary, mut other) = (0, 0, 0, 0, 0);
    for value in values {
        match value {
            Cell::Null => {}
            Cell::Bool(_) => bools += 1,
            Cell::Int(_) => ints += 1,
            Cell::Float(_) => floats += 1,
            Cell::Bytes(_) | Cell::Image(_) => binary += 1,
            Cell::Text(_) | Cell::Json(_) => other += 1,
        }
    }
    let total = bools + ints + floats + binary + other;
    if total == 0 || other > 0 {
        DataType::Utf8
    } else if bools == total {
        DataType::Boolean
    } else if ints == total {
        DataType::Int64
    } else if ints + floats == total {
        DataType::Float64
    } else if binary == total {
        DataType::Binary
    } else {
        DataType::Utf8
    }
}

pub(crate) fn image_png(img: &image::DynamicImage) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .ok()?;
    Some(buf)
}

fn column_array(column: &Column, data_type: &DataType) -> ArrayRef {
    let values = &column.values;
    match data_type {
        DataType::Boolean => Arc::new(BooleanArray::from(
            values
                .iter()
                .map(|v| match v {
                    Cell::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Int64 => Arc::new(Int64Array::from(
            values
                .iter()
                .map(|v| match v {
                    Cell::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values
                .iter()
                .map(|v| match v {
                    Cell::Int(i) => Some(*i as f64),
                    Cell::Float(f) => Some(*f),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Binary => {
            let owned: Vec<Option<Vec<u8>>> = values
                .iter()
                .map(|v| match v {
                    Cell::Bytes(b) => Some(b.clone()),
                    Cell::Image(img) => image_png(img),
                    _ => None,
                })
                .collect();
            Arc::new(BinaryArray::from(
                owned.iter().map(|v| v.as_deref()).collect::<Vec<_>>(),
            ))
        }
        _ => Arc::new(StringArray::from(
            values
                .iter()
                .map(|v| if v.is_null() { None } else { Some(v.render()) })
                .collect::<Vec<_>>(),
        )),
    }
}

/// Build a single Arrow record batch holding the whole table.
pub fn record_batch(table: &Table) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(table.columns.len());
    let mut arrays = Vec::with_capacity(table.columns.len());
    for column in &table.columns {
        let data_type = infer_type(&column.values);
        arrays.push(column_array(column, &data_type));
        fields.push(Field::new(column.name.as_str(), data_type, true));
    }
    let options = RecordBatchOptions::new().with_row_count(Some(table.num_rows()));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), arrays, &options)
        .context("failed to assemble record batch")
}

/// Write the table as a Snappy-compressed Parquet file.
pub fn write_parquet<W: Write + Send>(table: &Table, sink: W) -> Result<()> {
    let batch = record_batch(table)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(sink, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

pub fn to_parquet_bytes(table: &Table) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_parquet(table, &mut buf)?;
    Ok(buf)
}

/// Serialize the table as an Arrow IPC stream.
pub fn to_arrow_ipc(table: &Table) -> Result<Vec<u8>> {
    let batch = record_batch(table)?;
    let mut buf = Vec::new();
    {
        let mut writer = arrow_ipc::writer::StreamWriter::try_new(&mut buf, &batch.schema())?;
        writer.write(&batch)?;
        writer.finish()?;
    }
    Ok(buf)
}

fn write_row_object<W: Write>(table: &Table, row: usize, sink: &mut W) -> Result<()> {
    sink.write_all(b"{")?;
    for (i, column) in table.columns.iter().enumerate() {
        if i > 0 {
            sink.write_all(b",")?;
        }
        serde_json::to_writer(&mut *sink, &column.name)?;
        sink.write_all(b":")?;
        let value = column.values.get(row).map(Cell::to_json).unwrap_or_default();
        serde_json::to_writer(&mut *sink, &value)?;
    }
    sink.write_all(b"}")?;
    Ok(())
}

/// `[{"col": value, ...}, ...]`, keys in column order.
pub fn write_json_array<W: Write>(table: &Table, mut sink: W) -> Result<()> {
    sink.write_all(b"[")?;
    for row in 0..table.num_rows() {
        if row > 0 {
            sink.write_all(b",")?;
        }
        write_row_object(table, row, &mut sink)?;
    }
    sink.write_all(b"]")?;
    sink.flush()?;
    Ok(())
}

/// One JSON object per line.
pub fn write_json_lines<W: Write>(table: &Table, mut sink: W) -> Result<()> {
    for row in 0..table.num_rows() {
        write_row_object(table, row, &mut sink)?;
        sink.write_all(b"\n")?;
    }
    sink.flush()?;
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// RFC 4180 CSV with a header row.
pub fn write_csv<W: Write>(table: &Table, mut sink: W) -> Result<()> {
    let header: Vec<String> = table.columns.iter().map(|c| csv_field(&c.name)).collect();
    writeln!(sink, "{}", header.join(","))?;
    for row in 0..table.num_rows() {
        let fields: Vec<String> = table
            .columns
            .iter()
            .map(|c| csv_field(&c.values.get(row).map(Cell::render).unwrap_or_default()))
            .collect();
        writeln!(sink, "{}", fields.join(","))?;
    }
    sink.flush()?;
    Ok(())
}
