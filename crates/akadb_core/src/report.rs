//! Aggregate reports over a node's committed rows.
//!
//! A [`Report`] is a structured value. Text rendering happens at the edge
//! through [`Report::render_pipe`].

use crate::error::CoreError;
use crate::record::Record;
use crate::types::NodeId;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Which column a report groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportKind {
    /// Row count per region.
    Distribution,
    /// Row count per title type.
    Types,
}

impl ReportKind {
    /// Path segment naming the report.
    pub const fn as_str(self) -> &'static str {
        match self {
            ReportKind::Distribution => "distribution",
            ReportKind::Types => "types",
        }
    }

    /// Header of the grouping column.
    pub const fn column(self) -> &'static str {
        match self {
            ReportKind::Distribution => "Region",
            ReportKind::Types => "Type",
        }
    }

    fn label_of(self, record: &Record) -> &str {
        match self {
            ReportKind::Distribution => &record.region,
            ReportKind::Types => &record.types,
        }
    }
}

impl FromStr for ReportKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "distribution" | "distribution-by-region" | "region" => Ok(ReportKind::Distribution),
            "types" | "distribution-by-type" | "type" => Ok(ReportKind::Types),
            other => Err(CoreError::validation(format!("unknown report: {other}"))),
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One group of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    /// Group label.
    pub label: String,
    /// Rows in the group.
    pub count: usize,
}

/// Grouped counts, largest group first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    /// Report kind.
    pub kind: ReportKind,
    /// Node the report was computed on.
    pub node: NodeId,
    /// Column headers.
    pub columns: [&'static str; 2],
    /// Groups sorted by count descending, then label ascending.
    pub rows: Vec<ReportRow>,
    /// Sum of all counts.
    pub total: usize,
}

impl Report {
    /// Groups `records` by the report column.
    pub fn build(kind: ReportKind, node: NodeId, records: &[Record]) -> Self {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in records {
            *counts.entry(kind.label_of(record)).or_default() += 1;
        }

        let mut rows: Vec<ReportRow> = counts
            .into_iter()
            .map(|(label, count)| ReportRow {
                label: label.to_string(),
                count,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));

        Self {
            kind,
            node,
            columns: [kind.column(), "Count"],
            rows,
            total: records.len(),
        }
    }

    /// Pipe-delimited text: header, one line per group, then `TOTAL`.
    pub fn render_pipe(&self) -> String {
        let mut out = format!("{} | {}\n", self.columns[0], self.columns[1]);
        for row in &self.rows {
            out.push_str(&format!("{} | {}\n", row.label, row.count));
        }
        out.push_str(&format!("TOTAL | {}", self.total));
        out
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_pipe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, region: &str, types: &str) -> Record {
        Record::new(id, 1, "T", region, "en", types)
    }

    #[test]
    fn kind_aliases() {
        assert_eq!("distribution".parse::<ReportKind>().unwrap(), ReportKind::Distribution);
        assert_eq!("Distribution-By-Type".parse::<ReportKind>().unwrap(), ReportKind::Types);
        assert!("weekly".parse::<ReportKind>().is_err());
    }

    #[test]
    fn groups_sorted_by_count_then_label() {
        let records = vec![
            rec("a", "US", "movie"),
            rec("b", "PH", "movie"),
            rec("c", "US", "short"),
            rec("d", "JP", "movie"),
        ];
        let report = Report::build(ReportKind::Distribution, NodeId::CENTRAL, &records);
        let labels: Vec<&str> = report.rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["US", "JP", "PH"]);
        assert_eq!(report.total, 4);

        assert_eq!(
            report.render_pipe(),
            "Region | Count\nUS | 2\nJP | 1\nPH | 1\nTOTAL | 4"
        );
    }

    #[test]
    fn empty_report_has_total_only() {
        let report = Report::build(ReportKind::Types, NodeId::CENTRAL, &[]);
        assert_eq!(report.render_pipe(), "Type | Count\nTOTAL | 0");
    }
}
