//! Formatted output helpers for CLI commands.
//!
//! Tables are padded to the widest cell of each column. Everything is
//! written to stdout; diagnostics go through `tracing` to stderr.

use std::fmt::Write as _;
use std::io::Write;

/// Column-aligned plain-text table.
#[derive(Debug, Default)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Creates a table with the given column titles.
    pub fn new<I, S>(header: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row; missing trailing cells render empty.
    pub fn row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(cells.into_iter().map(Into::into).collect());
    }

    /// Renders the table, one line per row, without trailing spaces.
    #[must_use]
    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.header.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate().take(widths.len()) {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }

        let mut out = String::new();
        for row in std::iter::once(&self.header).chain(&self.rows) {
            let mut line = String::new();
            for (i, width) in widths.iter().enumerate() {
                let cell = row.get(i).map_or("", String::as_str);
                if i + 1 == widths.len() {
                    line.push_str(cell);
                } else {
                    let _ = write!(line, "{cell:<width$}   ");
                }
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}

/// Formats a byte count into a human-readable string (e.g., "128.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Shows an optional value, or `-` when absent.
pub fn or_dash(value: Option<impl ToString>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Writes `text` to stdout as is.
///
/// # Errors
///
/// Returns an error if stdout is closed.
pub fn print(text: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// Writes `line` and a newline to stdout.
///
/// # Errors
///
/// Returns an error if stdout is closed.
pub fn println(line: &str) -> anyhow::Result<()> {
    print(&format!("{line}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_pads_columns_to_widest_cell() {
        let mut table = Table::new(["NAME", "STATUS"]);
        table.row(["web-frontend", "running"]);
        table.row(["db", "stopped"]);
        assert_eq!(
            table.render(),
            "NAME           STATUS\nweb-frontend   running\ndb             stopped\n"
        );
    }

    #[test]
    fn short_rows_render_empty_cells() {
        let mut table = Table::new(["A", "B", "C"]);
        table.row(["x"]);
        assert_eq!(table.render(), "A   B   C\nx\n");
    }

    #[test]
    fn or_dash_fills_missing_values() {
        assert_eq!(or_dash(Some(42)), "42");
        assert_eq!(or_dash(None::<u32>), "-");
    }

    #[test]
    fn format_bytes_displays_bytes() {
        assert_eq!(format_bytes(512), "512 B");
    }

    #[test]
    fn format_bytes_displays_kib() {
        assert_eq!(format_bytes(2048), "2.0 KiB");
    }

    #[test]
    fn format_bytes_displays_mib() {
        assert_eq!(format_bytes(134_217_728), "128.0 MiB");
    }
}
