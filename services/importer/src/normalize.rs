//! Turn downloaded bytes into rows keyed by canonical column names.
//!
//! Order matters: decode, repair encoding damage, parse with the source's
//! delimiter, then rename headers. Nothing downstream sees raw headers.

use std::collections::HashMap;

use encoding_rs::WINDOWS_1252;
use store::StoreError;
use tracing::{debug, warn};

/// Known corruptions of Italian accented letters.
///
/// U+FFFD is what a lossy UTF-8 read leaves where a Latin-1 `à` stood; the
/// two-character sequences are UTF-8 bytes that were decoded as Latin-1.
const REPAIRS: &[(&str, &str)] = &[
    ("\u{FFFD}", "à"),
    ("Ã\u{a0}", "à"),
    ("Ã¨", "è"),
    ("Ã©", "é"),
    ("Ã¬", "ì"),
    ("Ã²", "ò"),
    ("Ã¹", "ù"),
    ("Ãˆ", "È"),
];

/// Decode a download. Valid UTF-8 is taken as is; anything else is read as
/// Windows-1252, which is what the regional sources export.
pub fn decode_text(bytes: &[u8]) -> String {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = WINDOWS_1252.decode(bytes);
            debug!("content is not UTF-8; decoded as windows-1252");
            text.into_owned()
        }
    };
    repair_text(text.trim_start_matches('\u{feff}'))
}

pub fn repair_text(text: &str) -> String {
    REPAIRS
        .iter()
        .fold(text.to_string(), |acc, (broken, fixed)| acc.replace(broken, fixed))
}

/// One data row. `line` is the 1-based line in the source (header = 1).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub line: usize,
    fields: HashMap<String, String>,
}

impl NormalizedRow {
    pub fn new(line: usize, fields: HashMap<String, String>) -> Self {
        Self { line, fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    /// Field value, or an `InvalidRow` naming the missing column.
    pub fn require(&self, column: &str) -> Result<&str, StoreError> {
        match self.get(column) {
            Some(value) if !value.trim().is_empty() => Ok(value.trim()),
            _ => Err(StoreError::invalid_row(
                self.line,
                format!("missing field '{}'", column),
            )),
        }
    }
}

#[derive(Debug, Default)]
pub struct NormalizedTable {
    pub headers: Vec<String>,
    pub rows: Vec<NormalizedRow>,
    /// Lines the csv reader could not parse, with the reason.
    pub rejected: Vec<(usize, String)>,
}

/// Parse `text` with `delimiter` and apply `renames` to the header row.
pub fn normalize(
    text: &str,
    delimiter: u8,
    renames: &HashMap<String, String>,
) -> Result<NormalizedTable, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| {
            let h = h.trim();
            renames.get(h).cloned().unwrap_or_else(|| h.to_string())
        })
        .collect();

    let mut table = NormalizedTable {
        headers,
        ..Default::default()
    };

    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(line, error = %e, "skipping unparsable csv line");
                table.rejected.push((line, e.to_string()));
                continue;
            }
        };

        if record.iter().all(|field| field.is_empty()) {
            continue;
        }

        let fields = table
            .headers
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect();
        table.rows.push(NormalizedRow::new(line, fields));
    }

    debug!(
        columns = table.headers.len(),
        rows = table.rows.len(),
        rejected = table.rejected.len(),
        "csv normalized"
    );
    Ok(table)
}

/// Parse an observation. Empty, `:` (Eurostat's missing marker) and `NA`
/// are null; a decimal comma is accepted.
pub fn parse_value(raw: &str) -> Result<Option<f64>, String> {
    let value = raw.trim();
    if value.is_empty() || value == ":" || value.eq_ignore_ascii_case("na") {
        return Ok(None);
    }
    let value = value.replace(',', ".");
    value
        .parse::<f64>()
        .map(Some)
        .map_err(|_| format!("invalid number '{}'", raw.trim()))
}

/// Parse a year. Accepts a bare year or a period starting with one
/// (`2019`, `2019-Q1`).
pub fn parse_year(raw: &str) -> Result<i64, String> {
    let value = raw.trim();
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<i64>() {
        Ok(year) if digits.len() == 4 => Ok(year),
        _ => Err(format!("invalid year '{}'", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renames(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn latin1_bytes_decode_to_accented_letters() {
        // "Produttività" in windows-1252
        let bytes = b"Produttivit\xe0;anno\n";
        assert_eq!(decode_text(bytes), "Produttività;anno\n");
    }

    #[test]
    fn replacement_character_is_repaired() {
        assert_eq!(repair_text("Produttivit\u{FFFD}"), "Produttività");
    }

    #[test]
    fn double_encoded_utf8_is_repaired() {
        assert_eq!(repair_text("CittÃ\u{a0} e perchÃ©"), "Città e perché");
    }

    #[test]
    fn bom_is_stripped() {
        assert_eq!(decode_text("\u{feff}anno,regione\n".as_bytes()), "anno,regione\n");
    }

    #[test]
    fn semicolon_source_with_renames() {
        let text = "Anno;Regione;Variazione percentuale occupati\n2020;Piemonte;1,5\n2021;Liguria;\n";
        let table = normalize(
            text,
            b';',
            &renames(&[
                ("Anno", "anno"),
                ("Regione", "regione"),
                ("Variazione percentuale occupati", "occupazione"),
            ]),
        )
        .unwrap();

        assert_eq!(table.headers, vec!["anno", "regione", "occupazione"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].line, 2);
        assert_eq!(table.rows[0].get("regione"), Some("Piemonte"));
        assert_eq!(table.rows[0].get("occupazione"), Some("1,5"));
        assert_eq!(table.rows[1].get("occupazione"), Some(""));
    }

    #[test]
    fn comma_source_keeps_unmapped_headers() {
        let text = "DATAFLOW,LAST UPDATE,geo,TIME_PERIOD,OBS_VALUE,species\nX,01/01/24,IT,2019,12.5,HKE\n";
        let table = normalize(
            text,
            b',',
            &renames(&[("LAST UPDATE", "LAST_UPDATE"), ("geo", "region_code")]),
        )
        .unwrap();

        assert!(table.headers.contains(&"LAST_UPDATE".to_string()));
        assert!(table.headers.contains(&"DATAFLOW".to_string()));
        assert_eq!(table.rows[0].get("region_code"), Some("IT"));
    }

    #[test]
    fn blank_lines_are_dropped() {
        let table = normalize("anno,regione\n2020,Lazio\n,\n", b',', &HashMap::new()).unwrap();
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn require_reports_the_line() {
        let table = normalize("anno,regione\n2020,\n", b',', &HashMap::new()).unwrap();
        let err = table.rows[0].require("regione").unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow { line: 2, .. }));
    }

    #[test]
    fn value_parsing() {
        assert_eq!(parse_value("12.5"), Ok(Some(12.5)));
        assert_eq!(parse_value(" 3,25 "), Ok(Some(3.25)));
        assert_eq!(parse_value(""), Ok(None));
        assert_eq!(parse_value(":"), Ok(None));
        assert_eq!(parse_value("NA"), Ok(None));
        assert!(parse_value("n.d.").is_err());
    }

    #[test]
    fn year_parsing() {
        assert_eq!(parse_year("2019"), Ok(2019));
        assert_eq!(parse_year("2019-Q1"), Ok(2019));
        assert!(parse_year("19").is_err());
        assert!(parse_year("anno").is_err());
    }
}
