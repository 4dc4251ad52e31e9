use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use roxmltree::Document;
use zip::ZipArchive;

/// Paragraph text of a DOCX body, one paragraph per block separated by blank lines.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).context("DOCX is not a valid ZIP archive")?;

    let mut document_xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX missing word/document.xml")?
        .read_to_string(&mut document_xml)
        .context("failed to read word/document.xml")?;

    let doc = Document::parse(&document_xml).context("failed to parse DOCX XML")?;

    let paragraphs: Vec<String> = doc
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "p")
        .map(|paragraph| {
            let text = paragraph
                .descendants()
                .filter(|node| node.is_element())
                .filter_map(|node| match node.tag_name().name() {
                    "t" => node.text(),
                    "tab" => Some(" "),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("");
            normalize_text(&text)
        })
        .filter(|text| !text.is_empty())
        .collect();

    Ok(paragraphs.join("\n\n"))
}

fn normalize_text(input: &str) -> String {
    input
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace('\u{00A0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
pub(crate) fn build_test_docx(paragraphs: &[&str]) -> Vec<u8> {
    use std::io::Write;

    let body: String = paragraphs
        .iter()
        .map(|text| format!("<w:p><w:r><w:t>{text}</w:t></w:r></w:p>"))
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
    );

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(xml.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_paragraphs_with_normalized_quotes() {
        let bytes = build_test_docx(&["House \u{201C}rules\u{201D}", "", "No   pets\u{00A0}allowed"]);
        let text = extract_docx_text(&bytes).unwrap();
        assert_eq!(text, "House \"rules\"\n\nNo pets allowed");
    }

    #[test]
    fn rejects_non_zip_input() {
        let err = extract_docx_text(b"plain text").unwrap_err();
        assert!(err.to_string().contains("ZIP"));
    }
}
