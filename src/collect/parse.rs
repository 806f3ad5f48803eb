use std::path::PathBuf;

use scraper::{Html, Selector};
use serde_json::Value;

use crate::error::TradeError;

// ================================================================================================
// Field Aliases
// ================================================================================================

/// Resolve a field that upstream payloads spell several ways.
///
/// Aliases are tried in declared order; the first present, non-null value
/// wins.
pub fn field_any<'a>(obj: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    let map = obj.as_object()?;
    aliases
        .iter()
        .filter_map(|alias| map.get(*alias))
        .find(|v| !v.is_null())
}

pub fn field_str(obj: &Value, aliases: &[&str]) -> Option<String> {
    match field_any(obj, aliases)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric field that may arrive as a number or a numeric string.
pub fn field_f64(obj: &Value, aliases: &[&str]) -> Option<f64> {
    match field_any(obj, aliases)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_decimal(s).ok(),
        _ => None,
    }
}

pub fn field_i64(obj: &Value, aliases: &[&str]) -> Option<i64> {
    match field_any(obj, aliases)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ================================================================================================
// Number Formats
// ================================================================================================

/// Parse a decimal that may use Brazilian formatting (`.` thousands, `,`
/// decimal): `"1.234.567,89"` → `1234567.89`.
///
/// Plain formats pass through: `"1234.56"` → `1234.56`.
pub fn parse_decimal(raw: &str) -> Result<f64, TradeError> {
    let s = raw.trim().replace(' ', "");
    if s.is_empty() {
        return Err(TradeError::NumberFormat(raw.to_string()));
    }

    let normalized = if s.contains(',') {
        // Comma decimal: dots are thousands separators.
        s.replace('.', "").replace(',', ".")
    } else if s.matches('.').count() > 1 {
        // Multiple dots without a comma: all are thousands separators.
        s.replace('.', "")
    } else {
        s
    };

    normalized
        .parse()
        .map_err(|_| TradeError::NumberFormat(raw.to_string()))
}

// ================================================================================================
// HTML Tables
// ================================================================================================

#[derive(Debug, Clone)]
pub struct HtmlTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Find the first `<table>` whose header row contains every keyword
/// (case-insensitive substring match), then read its body cells.
pub fn find_table_by_headers(html: &str, keywords: &[&str]) -> Option<HtmlTable> {
    let document = Html::parse_document(html);
    let table_sel = Selector::parse("table").ok()?;
    let row_sel = Selector::parse("tr").ok()?;
    let cell_sel = Selector::parse("th, td").ok()?;

    for table in document.select(&table_sel) {
        let mut rows_iter = table.select(&row_sel);
        let Some(header_row) = rows_iter.next() else {
            continue;
        };
        let headers: Vec<String> = header_row
            .select(&cell_sel)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();

        let joined = headers.join(" ").to_lowercase();
        if !keywords.iter().all(|kw| joined.contains(&kw.to_lowercase())) {
            continue;
        }

        let rows = rows_iter
            .map(|row| {
                row.select(&cell_sel)
                    .map(|cell| cell.text().collect::<String>().trim().to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|cells| !cells.is_empty())
            .collect();

        return Some(HtmlTable { headers, rows });
    }
    None
}

// ================================================================================================
// PDF Extraction
// ================================================================================================

/// Outcome of the three-step PDF parse chain: structured rows, raw text for
/// regex parsing, or a pointer to the archived file for manual processing.
#[derive(Debug, Clone)]
pub enum PdfExtraction {
    Table(Vec<Vec<String>>),
    Text(String),
    Unparsed(PathBuf),
}

/// Extract tabular content from a PDF body.
///
/// 1. Extract text and split lines on runs of 2+ spaces into columns; accept
///    when enough multi-column lines appear.
/// 2. Otherwise return the raw text for regex parsing.
/// 3. If text extraction fails entirely, return the archived path.
pub fn extract_pdf(bytes: &[u8], archived_path: PathBuf) -> PdfExtraction {
    let text = match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) => text,
        Err(_) => return PdfExtraction::Unparsed(archived_path),
    };

    let rows: Vec<Vec<String>> = text
        .lines()
        .map(split_columns)
        .filter(|cols| cols.len() >= 2)
        .collect();

    if rows.len() >= 3 {
        PdfExtraction::Table(rows)
    } else {
        PdfExtraction::Text(text)
    }
}

/// Split a fixed-layout text line into columns on runs of 2+ spaces.
pub fn split_columns(line: &str) -> Vec<String> {
    line.split("  ")
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn field_aliases_first_non_null_wins() {
        let obj = json!({"co_ncm": null, "NCM": "12019000", "ncm": "999"});
        assert_eq!(field_str(&obj, &["co_ncm", "NCM", "ncm"]).as_deref(), Some("12019000"));
        assert_eq!(field_f64(&json!({"vl_fob": "1.234,50"}), &["vl_fob"]), Some(1234.5));
        assert_eq!(field_i64(&json!({"ano": "2024"}), &["year", "ano"]), Some(2024));
    }

    #[test]
    fn brazilian_number_parses_exactly() {
        assert_eq!(parse_decimal("1.234.567,89").unwrap(), 1_234_567.89);
        assert_eq!(parse_decimal("1234,5").unwrap(), 1234.5);
        assert_eq!(parse_decimal("1234.56").unwrap(), 1234.56);
        assert_eq!(parse_decimal("1.234").unwrap(), 1.234);
        assert_eq!(parse_decimal("12.345.678").unwrap(), 12_345_678.0);
        assert!(parse_decimal("").is_err());
        assert!(parse_decimal("abc").is_err());
    }

    #[test]
    fn html_table_is_found_by_header_keywords() {
        let html = r#"
            <html><body>
            <table><tr><th>Irrelevant</th></tr><tr><td>x</td></tr></table>
            <table>
              <tr><th>Port</th><th>Commodity</th><th>Volume (MT)</th></tr>
              <tr><td>Santos</td><td>Soybeans</td><td>120.500</td></tr>
              <tr><td>Paranagua</td><td>Corn</td><td>80.250</td></tr>
            </table>
            </body></html>
        "#;
        let table = find_table_by_headers(html, &["port", "volume"]).unwrap();
        assert_eq!(table.headers.len(), 3);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][0], "Santos");
    }

    #[test]
    fn column_split_handles_fixed_layout() {
        let cols = split_columns("SANTOS    SOYBEANS   120.500   CHINA");
        assert_eq!(cols, vec!["SANTOS", "SOYBEANS", "120.500", "CHINA"]);
    }
}
