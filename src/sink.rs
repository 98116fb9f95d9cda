//! Host-side collaborators: the addressable sheet samples are written into,
//! the change notifications it emits, and the completion signal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// A cell coordinate on the host sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellPos {
    pub row: u32,
    pub col: u32,
}

impl CellPos {
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl core::fmt::Display for CellPos {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "R{}C{}", self.row, self.col)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

impl core::fmt::Display for CellValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Number(value) => write!(f, "{value}"),
            CellValue::Text(text) => write!(f, "{text}"),
        }
    }
}

/// A human edit reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub sheet: String,
    pub address: CellPos,
    pub new_text: String,
}

impl ChangeNotification {
    pub fn new(sheet: impl Into<String>, address: CellPos, new_text: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            address,
            new_text: new_text.into(),
        }
    }
}

pub trait CellSink {
    fn set_value(&mut self, sheet: &str, pos: CellPos, value: CellValue);
    fn get_value(&self, sheet: &str, pos: CellPos) -> CellValue;
}

/// Receives host change notifications, one call per edit.
pub trait ChangeHandler {
    fn on_change(&mut self, change: &ChangeNotification);
}

/// Fire-and-forget "capture finished" signal.
pub trait CompletionNotifier {
    fn notify_complete(&mut self);
}

/// Notifier that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl CompletionNotifier for SilentNotifier {
    fn notify_complete(&mut self) {}
}

/// A sparse in-process sheet, keyed by sheet name and coordinate.
#[derive(Debug, Default, Clone)]
pub struct MemorySheet {
    cells: BTreeMap<String, BTreeMap<CellPos, CellValue>>,
    writes: u64,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn sheets(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    /// Non-empty cells of one sheet in row-major order.
    pub fn cells(&self, sheet: &str) -> Vec<(CellPos, &CellValue)> {
        self.cells
            .get(sheet)
            .map(|cells| cells.iter().map(|(pos, value)| (*pos, value)).collect())
            .unwrap_or_default()
    }

    /// Render one sheet as CSV covering the bounding box of its non-empty cells.
    pub fn to_csv(&self, sheet: &str) -> String {
        let cells = self.cells(sheet);
        let mut out = String::new();
        let (Some(min_row), Some(max_row)) = (
            cells.iter().map(|(pos, _)| pos.row).min(),
            cells.iter().map(|(pos, _)| pos.row).max(),
        ) else {
            return out;
        };
        let min_col = cells.iter().map(|(pos, _)| pos.col).min().unwrap_or_default();
        let max_col = cells.iter().map(|(pos, _)| pos.col).max().unwrap_or(min_col);

        for row in min_row..=max_row {
            let line: Vec<String> = (min_col..=max_col)
                .map(|col| csv_field(&self.get_value(sheet, CellPos::new(row, col))))
                .collect();
            let _ = writeln!(out, "{}", line.join(","));
        }
        out
    }

    pub fn write_csv(&self, sheet: &str, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.to_csv(sheet))
    }
}

fn csv_field(value: &CellValue) -> String {
    let text = value.to_string();
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

impl CellSink for MemorySheet {
    fn set_value(&mut self, sheet: &str, pos: CellPos, value: CellValue) {
        self.writes += 1;
        let cells = self.cells.entry(sheet.to_string()).or_default();
        if value.is_empty() {
            cells.remove(&pos);
        } else {
            cells.insert(pos, value);
        }
    }

    fn get_value(&self, sheet: &str, pos: CellPos) -> CellValue {
        self.cells
            .get(sheet)
            .and_then(|cells| cells.get(&pos))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sheet_round_trip() {
        let mut sheet = MemorySheet::new();
        sheet.set_value("Sheet1", CellPos::new(2, 3), CellValue::Number(4.5));
        assert_eq!(sheet.get_value("Sheet1", CellPos::new(2, 3)), CellValue::Number(4.5));
        assert!(sheet.get_value("Sheet2", CellPos::new(2, 3)).is_empty());
        assert_eq!(sheet.writes(), 1);
    }

    #[test]
    fn test_clearing_a_cell_removes_it() {
        let mut sheet = MemorySheet::new();
        sheet.set_value("S", CellPos::new(1, 1), CellValue::Text("x".into()));
        sheet.set_value("S", CellPos::new(1, 1), CellValue::Empty);
        assert!(sheet.cells("S").is_empty());
    }

    #[test]
    fn test_csv_covers_bounding_box() {
        let mut sheet = MemorySheet::new();
        sheet.set_value("S", CellPos::new(1, 1), CellValue::Text("a,b".into()));
        sheet.set_value("S", CellPos::new(2, 3), CellValue::Number(7.0));
        assert_eq!(sheet.to_csv("S"), "\"a,b\",,\n,,7\n");
    }
}
