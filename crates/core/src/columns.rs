//! Table columns for case run configurations.
//!
//! This module provides:
//! - Stable column kinds + specs (labels, widths)
//! - A cell projector that renders one configuration into column text

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::markdown::MarkdownRenderer;
use crate::CaseRunConfiguration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Id,
    Name,
    Configuration,
    RunningFor,
    Workflow,
    State,
    Result,
    Active,
    Status,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub kind: ColumnKind,
    pub label: &'static str,
    pub width: usize,
}

fn col(kind: ColumnKind, label: &'static str, width: usize) -> ColumnSpec {
    ColumnSpec { kind, label, width }
}

/// Default column set of the live table.
pub fn crc_columns() -> Vec<ColumnSpec> {
    vec![
        col(ColumnKind::Id, "Id", 12),
        col(ColumnKind::Name, "Name", 32),
        col(ColumnKind::Configuration, "Configuration", 28),
        col(ColumnKind::RunningFor, "Running for", 20),
        col(ColumnKind::Workflow, "Workflow", 12),
        col(ColumnKind::State, "State", 12),
        col(ColumnKind::Result, "Result", 7),
        col(ColumnKind::Active, "Active", 6),
        col(ColumnKind::Status, "Status", 40),
    ]
}

/// Configuration rendered as `key:value` clauses joined by `;`, the same
/// syntax the configuration filter accepts.
pub fn format_configuration(configuration: &BTreeMap<String, String>) -> String {
    configuration
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join(";")
}

/// Render one cell. Status text goes through the markdown renderer and is
/// folded onto a single line.
pub fn cell(crc: &CaseRunConfiguration, kind: ColumnKind, markdown: &dyn MarkdownRenderer) -> String {
    match kind {
        ColumnKind::Id => crc.id.clone(),
        ColumnKind::Name => crc.name.clone(),
        ColumnKind::Configuration => format_configuration(&crc.configuration),
        ColumnKind::RunningFor => crc.running_for.join(","),
        ColumnKind::Workflow => crc.workflow.clone(),
        ColumnKind::State => crc.state.clone(),
        ColumnKind::Result => crc.result.clone().unwrap_or_else(|| "-".to_string()),
        ColumnKind::Active => if crc.active { "yes".into() } else { "no".into() },
        ColumnKind::Status => markdown
            .render(&crc.display_status)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Truncate or pad `text` to exactly `width` characters.
pub fn fit(text: &str, width: usize) -> String {
    let count = text.chars().count();
    if count <= width {
        let mut s = text.to_string();
        s.extend(std::iter::repeat(' ').take(width - count));
        s
    } else if width == 0 {
        String::new()
    } else {
        let mut s: String = text.chars().take(width - 1).collect();
        s.push('…');
        s
    }
}

/// One fixed-width table row.
pub fn render_row(crc: &CaseRunConfiguration, cols: &[ColumnSpec], markdown: &dyn MarkdownRenderer) -> String {
    cols.iter()
        .map(|c| fit(&cell(crc, c.kind, markdown), c.width))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end()
        .to_string()
}

/// Header line matching [`render_row`].
pub fn render_header(cols: &[ColumnSpec]) -> String {
    cols.iter()
        .map(|c| fit(&c.label.to_ascii_uppercase(), c.width))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end()
        .to_string()
}
