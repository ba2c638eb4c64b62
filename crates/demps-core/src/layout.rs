//! Per-line transforms for simulator output files.
//!
//! The simulator writes whitespace-delimited text, one record per line,
//! optionally preceded by a header. Which fields matter differs per
//! dataset and has changed between simulator releases, so the field
//! layout is configuration data ([`DatasetLayout`]) rather than code.

use serde::Deserialize;

/// Turns one raw line into a formatted record, or nothing.
///
/// Implementations return `None` for header lines and for lines that are
/// malformed or incomplete.
pub trait LineTransform: Send + Sync + 'static {
    /// Transform `line`. `is_first_line` is true only for the first line
    /// of a file.
    fn apply(&self, line: &str, is_first_line: bool) -> Option<String>;
}

impl<F> LineTransform for F
where
    F: Fn(&str, bool) -> Option<String> + Send + Sync + 'static,
{
    fn apply(&self, line: &str, is_first_line: bool) -> Option<String> {
        self(line, is_first_line)
    }
}

/// Field layout of one dataset's output files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetLayout {
    /// Skip the first line of every file.
    #[serde(default = "default_skip_header")]
    pub skip_header: bool,

    /// Zero-based whitespace field positions to extract, in output order.
    pub fields: Vec<usize>,

    /// Require every extracted field to parse as a number.
    #[serde(default = "default_numeric")]
    pub numeric: bool,

    /// Separator placed between extracted fields.
    #[serde(default = "default_field_separator")]
    pub field_separator: String,

    /// Sentinel appended after every record.
    #[serde(default = "default_record_terminator")]
    pub record_terminator: String,
}

const fn default_skip_header() -> bool {
    true
}

const fn default_numeric() -> bool {
    true
}

fn default_field_separator() -> String {
    String::from(",")
}

fn default_record_terminator() -> String {
    String::from("$")
}

impl DatasetLayout {
    /// Agent output: `id lat lng .. .. alive` -> `lat,lng,alive$`.
    pub fn agents() -> Self {
        Self::with_fields(vec![1, 2, 5])
    }

    /// Agent output without the alive flag: `lat,lng$`.
    pub fn agent_positions() -> Self {
        Self::with_fields(vec![1, 2])
    }

    /// Flood state output: `lng,lat,depth$`.
    pub fn flood() -> Self {
        Self::with_fields(vec![1, 2, 4])
    }

    fn with_fields(fields: Vec<usize>) -> Self {
        Self {
            skip_header: default_skip_header(),
            fields,
            numeric: default_numeric(),
            field_separator: default_field_separator(),
            record_terminator: default_record_terminator(),
        }
    }
}

impl LineTransform for DatasetLayout {
    fn apply(&self, line: &str, is_first_line: bool) -> Option<String> {
        if self.skip_header && is_first_line {
            return None;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() || self.fields.is_empty() {
            return None;
        }

        let mut record = String::with_capacity(line.len());
        for (i, &position) in self.fields.iter().enumerate() {
            let token = tokens.get(position)?;
            if self.numeric && token.parse::<f64>().is_err() {
                return None;
            }
            if i > 0 {
                record.push_str(&self.field_separator);
            }
            record.push_str(token);
        }
        record.push_str(&self.record_terminator);
        Some(record)
    }
}
