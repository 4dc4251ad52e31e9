use anyhow::{Context, Result};

use super::Section;

/// Text per page (1-based), or the whole document as one section when lopdf finds no
/// text on any page.
pub fn extract_pdf_sections(bytes: &[u8]) -> Result<Vec<Section>> {
    let mut sections = Vec::new();

    match lopdf::Document::load_mem(bytes) {
        Ok(doc) => {
            for page in doc.get_pages().keys().copied() {
                match doc.extract_text(&[page]) {
                    Ok(raw_text) => {
                        let content = normalize_text(&raw_text);
                        if !content.is_empty() {
                            sections.push(Section::page(content, i64::from(page)));
                        }
                    }
                    Err(err) => tracing::debug!("lopdf could not read page {}: {}", page, err),
                }
            }
        }
        Err(err) => tracing::debug!("lopdf failed to load pdf: {}", err),
    }

    if sections.is_empty() {
        let extracted = pdf_extract::extract_text_from_mem(bytes)
            .context("failed to extract text from PDF")?;
        let content = normalize_text(&extracted);
        if !content.is_empty() {
            sections.push(Section::text(content));
        }
    }

    Ok(sections)
}

fn normalize_text(input: &str) -> String {
    input
        .replace('\0', "")
        .replace('\u{00A0}', " ")
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
pub(crate) fn build_test_pdf(pages: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_line_breaks_and_collapses_spaces() {
        assert_eq!(
            normalize_text("  Section 1\u{0}  \n\n   pool   hours 9-5 \n"),
            "Section 1\npool hours 9-5"
        );
    }

    #[test]
    fn text_is_split_per_page_with_one_based_numbers() {
        let bytes = build_test_pdf(&["Pool opens at nine.", "Quiet hours after ten."]);
        let sections = extract_pdf_sections(&bytes).unwrap();
        assert_eq!(
            sections,
            vec![
                Section::page("Pool opens at nine.", 1),
                Section::page("Quiet hours after ten.", 2),
            ]
        );
    }

    #[test]
    fn garbage_input_is_an_error() {
        assert!(extract_pdf_sections(b"definitely not a pdf").is_err());
    }
}
