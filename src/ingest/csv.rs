use anyhow::{Context, Result};

use super::Section;

/// One section per record, rendered as `header: value` lines. Rows are numbered from 0.
pub fn extract_csv_sections(bytes: &[u8]) -> Result<Vec<Section>> {
    let mut reader = ::csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .context("failed to read CSV header row")?
        .clone();

    let mut sections = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("failed to read CSV row {row}"))?;
        let text = record
            .iter()
            .enumerate()
            .map(|(column, value)| {
                let header = headers.get(column).unwrap_or("");
                format!("{}: {}", header.trim(), value.trim())
            })
            .collect::<Vec<_>>()
            .join("\n");

        if !text.trim().is_empty() {
            sections.push(Section::row(text, row as i64));
        }
    }

    Ok(sections)
}
