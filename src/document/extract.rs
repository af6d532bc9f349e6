use std::io::{Cursor, Read};

use anyhow::{anyhow, Context, Result};
use calamine::{Data, Reader, Xls, Xlsx};

use crate::database::FileType;

/// Upper bound on CSV rows echoed into the text preview.
const CSV_PREVIEW_ROWS: usize = 10;

pub const IMAGE_PLACEHOLDER: &str =
    "[Image attachment: no text content was extracted from this file]";

/// Extracts plain text from an uploaded file according to its type. The
/// result feeds the chunker, so layout fidelity does not matter, only that
/// the words come out in reading order.
pub fn extract_text(bytes: &[u8], file_type: FileType) -> Result<String> {
    match file_type {
        FileType::Pdf => extract_pdf(bytes),
        FileType::Docx => extract_docx(bytes),
        FileType::Txt => Ok(String::from_utf8_lossy(bytes).into_owned()),
        FileType::Csv => extract_csv(bytes),
        FileType::Xlsx => {
            let workbook = Xlsx::new(Cursor::new(bytes.to_vec()))
                .context("Failed to open XLSX workbook")?;
            extract_spreadsheet(workbook)
        }
        FileType::Xls => {
            let workbook =
                Xls::new(Cursor::new(bytes.to_vec())).context("Failed to open XLS workbook")?;
            extract_spreadsheet(workbook)
        }
        FileType::Image => Ok(IMAGE_PLACEHOLDER.to_string()),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| anyhow!("Failed to extract PDF text: {}", e))?;

    let cleaned = text
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if cleaned.is_empty() {
        return Err(anyhow!("PDF contains no extractable text"));
    }
    Ok(cleaned)
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("Failed to read DOCX as ZIP")?;

    let mut xml_content = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX missing word/document.xml")?
        .read_to_string(&mut xml_content)
        .context("Failed to read document.xml from DOCX")?;

    let text = docx_xml_text(&xml_content);
    if text.is_empty() {
        return Err(anyhow!("DOCX contains no extractable text"));
    }
    Ok(text)
}

/// Pulls the text runs (`<w:t>` elements) out of DOCX XML, one line per
/// paragraph.
fn docx_xml_text(xml: &str) -> String {
    let mut paragraphs = Vec::new();
    for paragraph in xml.split("</w:p>") {
        let mut para_text = String::new();
        let mut rest = paragraph;
        while let Some(start) = rest.find("<w:t") {
            let after_tag = &rest[start..];
            let Some(open_end) = after_tag.find('>') else {
                break;
            };
            let content_start = &after_tag[open_end + 1..];
            let Some(close) = content_start.find("</w:t>") else {
                break;
            };
            para_text.push_str(&unescape_xml(&content_start[..close]));
            rest = &content_start[close + 6..];
        }
        let trimmed = para_text.trim();
        if !trimmed.is_empty() {
            paragraphs.push(trimmed.to_string());
        }
    }
    paragraphs.join("\n")
}

fn unescape_xml(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

/// Summarizes a CSV into header, row count and a bounded row preview rather
/// than dumping the whole table into the chunker.
fn extract_csv(bytes: &[u8]) -> Result<String> {
    let raw = String::from_utf8_lossy(bytes);
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| anyhow!("CSV file is empty"))?
        .trim()
        .to_string();
    let rows: Vec<&str> = lines.collect();

    let mut out = String::new();
    out.push_str(&format!("CSV data with columns: {}\n", header));
    out.push_str(&format!("Total rows: {}\n", rows.len()));
    for row in rows.iter().take(CSV_PREVIEW_ROWS) {
        out.push_str(row.trim());
        out.push('\n');
    }
    if rows.len() > CSV_PREVIEW_ROWS {
        out.push_str(&format!(
            "... and {} more rows\n",
            rows.len() - CSV_PREVIEW_ROWS
        ));
    }
    Ok(out)
}

fn extract_spreadsheet<R: Reader<Cursor<Vec<u8>>>>(mut workbook: R) -> Result<String> {
    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        return Err(anyhow!("Spreadsheet has no sheets"));
    }

    let mut all_text = String::new();
    for sheet_name in &sheet_names {
        let range = match workbook.worksheet_range(sheet_name) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if range.is_empty() {
            continue;
        }

        if sheet_names.len() > 1 {
            all_text.push_str(&format!("\n--- Sheet: {} ---\n", sheet_name));
        }
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(cell_to_string).collect();
            all_text.push_str(&cells.join(" | "));
            all_text.push('\n');
        }
    }

    if all_text.trim().is_empty() {
        return Err(anyhow!("Spreadsheet contains no extractable text"));
    }
    Ok(all_text)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                (*f as i64).to_string()
            } else {
                format!("{:.4}", f)
                    .trim_end_matches('0')
                    .trim_end_matches('.')
                    .to_string()
            }
        }
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::Error(e) => format!("#ERR:{:?}", e),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docx_xml_joins_runs_within_a_paragraph() {
        let xml = "<w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t xml:space=\"preserve\">world</w:t></w:r></w:p><w:p><w:r><w:t>Second &amp; final</w:t></w:r></w:p>";
        assert_eq!(docx_xml_text(xml), "Hello world\nSecond & final");
    }

    #[test]
    fn csv_summary_is_bounded() {
        let mut csv = String::from("name,price\n");
        for i in 0..50 {
            csv.push_str(&format!("item{},{}\n", i, i));
        }
        let summary = extract_csv(csv.as_bytes()).unwrap();
        assert!(summary.contains("CSV data with columns: name,price"));
        assert!(summary.contains("Total rows: 50"));
        assert!(summary.contains("item9,9"));
        assert!(!summary.contains("item10,10"));
        assert!(summary.contains("40 more rows"));
    }

    #[test]
    fn txt_passes_through() {
        let text = extract_text(b"plain words", FileType::Txt).unwrap();
        assert_eq!(text, "plain words");
    }

    #[test]
    fn images_get_a_placeholder() {
        let text = extract_text(&[0xFF, 0xD8], FileType::Image).unwrap();
        assert_eq!(text, IMAGE_PLACEHOLDER);
    }
}
