/// Tabular view over bar records
use std::fmt;
use std::io::Write;

use crate::error::Result;
use crate::types::Bar;

/// Column order of every bar table
pub const BAR_COLUMNS: [&str; 6] = ["date", "open", "high", "low", "close", "volume"];

const NUMERIC_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];
const STAT_ROWS: [&str; 8] = ["count", "mean", "std", "min", "25%", "50%", "75%", "max"];

/// Bar records materialized as a table with fixed columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarTable {
    rows: Vec<Bar>,
}

impl BarTable {
    pub fn new(rows: Vec<Bar>) -> Self {
        BarTable { rows }
    }

    pub fn columns(&self) -> &'static [&'static str] {
        &BAR_COLUMNS
    }

    pub fn rows(&self) -> &[Bar] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Bar> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.rows.last()
    }

    /// Values of a numeric column, `None` for `date` or unknown names
    pub fn column_values(&self, column: &str) -> Option<Vec<f64>> {
        let pick: fn(&Bar) -> f64 = match column {
            "open" => |b: &Bar| b.open,
            "high" => |b: &Bar| b.high,
            "low" => |b: &Bar| b.low,
            "close" => |b: &Bar| b.close,
            "volume" => |b: &Bar| b.volume as f64,
            _ => return None,
        };

        Some(self.rows.iter().map(pick).collect())
    }

    /// Summary statistics per numeric column (count, mean, std, min, quartiles, max)
    pub fn describe(&self) -> TableSummary {
        let columns = NUMERIC_COLUMNS
            .iter()
            .map(|name| {
                let values = self.column_values(name).unwrap_or_default();
                (name.to_string(), ColumnStats::from_values(&values))
            })
            .collect();

        TableSummary { columns }
    }

    /// Write the table as CSV with a header row
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);

        if self.rows.is_empty() {
            wtr.write_record(BAR_COLUMNS)?;
        }
        for bar in &self.rows {
            wtr.serialize(bar)?;
        }

        wtr.flush()?;
        Ok(())
    }
}

impl From<Vec<Bar>> for BarTable {
    fn from(rows: Vec<Bar>) -> Self {
        BarTable::new(rows)
    }
}

impl fmt::Display for BarTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rows.is_empty() {
            writeln!(f, "Empty table")?;
            writeln!(f, "Columns: [{}]", BAR_COLUMNS.join(", "))?;
            return write!(f, "Index: []");
        }

        let cells: Vec<[String; 7]> = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, bar)| {
                [
                    i.to_string(),
                    bar.date.clone(),
                    bar.open.to_string(),
                    bar.high.to_string(),
                    bar.low.to_string(),
                    bar.close.to_string(),
                    bar.volume.to_string(),
                ]
            })
            .collect();

        let mut header: [String; 7] = Default::default();
        for (slot, name) in header.iter_mut().skip(1).zip(BAR_COLUMNS.iter()) {
            *slot = name.to_string();
        }

        let mut widths = [0usize; 7];
        for row in std::iter::once(&header).chain(cells.iter()) {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.len());
            }
        }

        write_row(f, &header, &widths)?;
        for row in &cells {
            writeln!(f)?;
            write_row(f, row, &widths)?;
        }

        Ok(())
    }
}

fn write_row(f: &mut fmt::Formatter<'_>, row: &[String], widths: &[usize]) -> fmt::Result {
    for (i, (cell, width)) in row.iter().zip(widths.iter()).enumerate() {
        if i == 0 {
            write!(f, "{:<width$}", cell, width = width)?;
        } else {
            write!(f, "  {:>width$}", cell, width = width)?;
        }
    }
    Ok(())
}

/// Statistics of one numeric column
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

impl ColumnStats {
    pub fn from_values(values: &[f64]) -> Self {
        let count = values.len();
        if count == 0 {
            return ColumnStats {
                count,
                mean: f64::NAN,
                std: f64::NAN,
                min: f64::NAN,
                q25: f64::NAN,
                median: f64::NAN,
                q75: f64::NAN,
                max: f64::NAN,
            };
        }

        let mean = values.iter().sum::<f64>() / count as f64;

        // Sample standard deviation (n - 1)
        let std = if count > 1 {
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        } else {
            f64::NAN
        };

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        ColumnStats {
            count,
            mean,
            std,
            min: sorted[0],
            q25: quantile(&sorted, 0.25),
            median: quantile(&sorted, 0.5),
            q75: quantile(&sorted, 0.75),
            max: sorted[count - 1],
        }
    }

    fn stat(&self, row: &str) -> f64 {
        match row {
            "count" => self.count as f64,
            "mean" => self.mean,
            "std" => self.std,
            "min" => self.min,
            "25%" => self.q25,
            "50%" => self.median,
            "75%" => self.q75,
            _ => self.max,
        }
    }
}

/// Linear interpolation between closest ranks
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;

    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Output of [`BarTable::describe`]
#[derive(Debug, Clone, PartialEq)]
pub struct TableSummary {
    columns: Vec<(String, ColumnStats)>,
}

impl TableSummary {
    pub fn column(&self, name: &str) -> Option<&ColumnStats> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }
}

impl fmt::Display for TableSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<6}", "")?;
        for (name, _) in &self.columns {
            write!(f, "  {:>14}", name)?;
        }

        for row in STAT_ROWS {
            writeln!(f)?;
            write!(f, "{:<6}", row)?;
            for (_, stats) in &self.columns {
                let value = stats.stat(row);
                if value.is_nan() {
                    write!(f, "  {:>14}", "NaN")?;
                } else {
                    write!(f, "  {:>14.6}", value)?;
                }
            }
        }

        Ok(())
    }
}
