//! Loads and saves whole tables as CSV with a header row.

use crate::domain::model::{Row, Table};
use crate::domain::schema::Schema;
use crate::utils::error::Result;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

/// Parses CSV text into rows of `schema`. Columns are matched to the header
/// by name; a column missing from the file gets its default value.
pub fn parse_table<R: Read>(reader: R, schema: &Schema) -> Result<Table> {
    let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let positions: Vec<Option<usize>> = schema
        .columns
        .iter()
        .map(|c| headers.iter().position(|h| h.trim() == c.name))
        .collect();

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        let row = schema
            .columns
            .iter()
            .zip(&positions)
            .map(|(column, position)| match position.and_then(|p| record.get(p)) {
                Some(text) => column.data_type.parse(&column.name, text),
                None => Ok(column.default_or_null()),
            })
            .collect::<Result<Row>>()?;
        rows.push(row);
    }
    Ok(Table::new(schema.clone(), rows))
}

pub fn read_table<P: AsRef<Path>>(path: P, schema: &Schema) -> Result<Table> {
    let file = fs::File::open(path.as_ref())?;
    let table = parse_table(file, schema)?;
    tracing::debug!("Read {} rows from {}", table.rows.len(), path.as_ref().display());
    Ok(table)
}

pub fn format_table<W: Write>(writer: W, table: &Table) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(table.schema.column_names())?;
    for row in &table.rows {
        csv_writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_table<P: AsRef<Path>>(path: P, table: &Table) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    format_table(fs::File::create(path)?, table)?;
    tracing::debug!("Wrote {} rows to {}", table.rows.len(), path.display());
    Ok(())
}
