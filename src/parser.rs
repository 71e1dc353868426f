// 🏗️ Block Parser - headerless kit catalog exports → material rows
//
// Two-state machine over column-positional rows:
//
//   SeekingHeader --(kit title row)--> Capturing(kit)
//   Capturing(kit) --(kit title row)--> Capturing(new kit)
//   Capturing(kit) --(code + description)--> emit row, stay
//   Capturing(kit) --(blank row)--> stay (blank rows never end a block)
//   Capturing(kit) --(half-filled row)--> warning, stay
//
// A block ends only at the next kit title or at end of stream.

use crate::config::ColumnLayout;
use crate::error::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::{debug, warn};

// ============================================================================
// CORE TYPES
// ============================================================================

/// One material line captured inside a kit block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRow {
    pub kit_name: String,
    pub code: String,
    pub description: String,
    pub quantity: f64,

    // Provenance
    pub source_file: String,
    pub line_number: u64,
}

/// A malformed row that was skipped without aborting the sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub source_file: String,
    pub line_number: u64,
    pub kit_name: Option<String>,
    pub reason: String,
}

/// Everything the parser extracted from one source file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOutput {
    /// Kit titles in order of first appearance (including kits with no lines)
    pub kits: Vec<String>,
    pub rows: Vec<ParsedRow>,
    pub warnings: Vec<ParseWarning>,

    /// Rows outside any block, plus blank rows
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockState {
    SeekingHeader,
    Capturing { kit: String },
}

// ============================================================================
// KIT TITLE MATCHER
// ============================================================================

/// Recognizes kit-title shaped identifiers
#[derive(Debug, Clone)]
pub struct KitTitleMatcher {
    pattern: Regex,
}

impl KitTitleMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(KitTitleMatcher {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn is_title(&self, identifier: &str) -> bool {
        self.pattern.is_match(identifier)
    }
}

// ============================================================================
// BLOCK PARSER
// ============================================================================

#[derive(Debug, Clone)]
pub struct BlockParser {
    titles: KitTitleMatcher,
    columns: ColumnLayout,
}

impl BlockParser {
    pub fn new(titles: KitTitleMatcher, columns: ColumnLayout) -> Self {
        BlockParser { titles, columns }
    }

    /// Parse one file's content. Only I/O-level CSV failures are errors;
    /// malformed rows become warnings.
    pub fn parse(&self, source_file: &str, content: &[u8]) -> Result<ParseOutput> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(content);

        let mut output = ParseOutput::default();
        let mut state = BlockState::SeekingHeader;

        for (index, result) in reader.byte_records().enumerate() {
            let record = result?;
            let line_number = record
                .position()
                .map(|p| p.line())
                .unwrap_or(index as u64 + 1);

            let identifier = cell(&record, self.columns.identifier);
            let description = cell(&record, self.columns.description);
            let quantity_raw = cell(&record, self.columns.quantity);

            // Kit title: identifier in title shape, description empty
            if !identifier.is_empty() && description.is_empty() && self.titles.is_title(&identifier) {
                let kit = identifier.into_owned();
                if !output.kits.contains(&kit) {
                    output.kits.push(kit.clone());
                }
                debug!(source_file, line_number, kit = %kit, "kit block started");
                state = BlockState::Capturing { kit };
                continue;
            }

            let BlockState::Capturing { kit } = &state else {
                output.skipped += 1;
                continue;
            };

            match (identifier.is_empty(), description.is_empty()) {
                (false, false) => {
                    let quantity = parse_quantity(&quantity_raw).unwrap_or_else(|| {
                        if !quantity_raw.is_empty() {
                            debug!(source_file, line_number, raw = %quantity_raw, "unparseable quantity, defaulting to 1");
                        }
                        1.0
                    });

                    output.rows.push(ParsedRow {
                        kit_name: kit.clone(),
                        code: identifier.into_owned(),
                        description: description.into_owned(),
                        quantity,
                        source_file: source_file.to_string(),
                        line_number,
                    });
                }
                (true, true) => output.skipped += 1,
                (missing_code, _) => {
                    let reason = if missing_code {
                        "row has a description but no code"
                    } else {
                        "row has a code but no description"
                    };
                    warn!(source_file, line_number, kit = %kit, "{reason}, skipped");
                    output.warnings.push(ParseWarning {
                        source_file: source_file.to_string(),
                        line_number,
                        kit_name: Some(kit.clone()),
                        reason: reason.to_string(),
                    });
                }
            }
        }

        Ok(output)
    }
}

/// Trimmed cell text; spreadsheet exports in legacy encodings are decoded lossily
fn cell(record: &csv::ByteRecord, column: usize) -> Cow<'_, str> {
    match record.get(column) {
        Some(bytes) => match String::from_utf8_lossy(bytes) {
            Cow::Borrowed(s) => Cow::Borrowed(s.trim()),
            Cow::Owned(s) => Cow::Owned(s.trim().to_string()),
        },
        None => Cow::Borrowed(""),
    }
}

/// Locale-tolerant decimal: "10,5" → 10.5, "1.234,5" → 1234.5, "1,234.5" → 1234.5.
/// Blank, unparseable, or non-finite input yields None.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // comma is the decimal separator, dots group thousands
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}
