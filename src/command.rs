//! Operator capture commands typed into the host sheet.
//!
//! Two forms are recognised, case-insensitively and against the whole
//! trimmed text:
//!
//! - `Syclone <N>`: one row of `N` samples, preceded by a timestamp cell
//! - `Syclone <R> x <C>`: `R` rows of `C` samples, no timestamp column
//!
//! The separator may be `x`, `X` or `×`, with optional whitespace around it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_COMMAND_KEYWORD: &str = "Syclone";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command keyword must not be empty")]
    EmptyKeyword,
    #[error("could not build command pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub rows: u32,
    pub cols: u32,
    pub include_timestamp_column: bool,
}

impl AllocationRequest {
    /// Number of sample-target cells the request reserves.
    pub fn target_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }
}

#[derive(Debug, Clone)]
pub struct CommandParser {
    keyword: String,
    grid_pattern: Regex,
    line_pattern: Regex,
}

impl CommandParser {
    pub fn new(keyword: &str) -> Result<Self, CommandError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(CommandError::EmptyKeyword);
        }

        let escaped = regex::escape(keyword);
        let grid_pattern = Regex::new(&format!(
            r"(?i)^{escaped}\s+([0-9]+)\s*[x×]\s*([0-9]+)$"
        ))?;
        let line_pattern = Regex::new(&format!(r"(?i)^{escaped}\s+([0-9]+)$"))?;

        Ok(Self {
            keyword: keyword.to_lowercase(),
            grid_pattern,
            line_pattern,
        })
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    /// Cheap prefix test: does the text at least start with the keyword?
    pub fn looks_like_command(&self, text: &str) -> bool {
        text.trim().to_lowercase().starts_with(&self.keyword)
    }

    /// Parse a cell's text. `None` means "not a command" and must cause no
    /// side effect.
    pub fn parse(&self, text: &str) -> Option<AllocationRequest> {
        let text = text.trim();
        if !self.looks_like_command(text) {
            return None;
        }

        let request = if let Some(caps) = self.grid_pattern.captures(text) {
            AllocationRequest {
                rows: caps[1].parse().ok()?,
                cols: caps[2].parse().ok()?,
                include_timestamp_column: false,
            }
        } else if let Some(caps) = self.line_pattern.captures(text) {
            AllocationRequest {
                rows: 1,
                cols: caps[1].parse().ok()?,
                include_timestamp_column: true,
            }
        } else {
            return None;
        };

        if request.rows == 0 || request.cols == 0 {
            return None;
        }

        Some(request)
    }
}
