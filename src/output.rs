use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::pipeline::SplitOutcome;
use crate::types::{ArtifactSummary, Dataset, Result, SplitReport};

/// Version of the JSON report layout
const REPORT_VERSION: &str = "1.0";

/// Widest a preview cell may be before it is cut
const PREVIEW_CELL_WIDTH: usize = 24;

/// Summarize a run for JSON output
pub fn build_report(outcome: &SplitOutcome) -> SplitReport {
    SplitReport {
        version: REPORT_VERSION.to_string(),
        file_name: outcome.source_name.clone(),
        source_sha256: outcome.source_sha256.clone(),
        format: outcome.source_format,
        source_rows: outcome.source_rows,
        rows: outcome.dataset.row_count(),
        columns: outcome.dataset.columns().to_vec(),
        artifacts: outcome
            .artifacts
            .iter()
            .map(|a| ArtifactSummary {
                file_name: a.file_name.clone(),
                format: a.format,
                mime_type: a.mime_type().to_string(),
                size: a.bytes.len(),
                fallback_for: a.fallback_for,
            })
            .collect(),
        caveats: outcome.caveats.clone(),
        failures: outcome
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.file_name, f.error))
            .collect(),
    }
}

/// Save every artifact under `dir`, returning the written paths
pub fn write_artifacts(outcome: &SplitOutcome, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    outcome
        .artifacts
        .iter()
        .map(|artifact| {
            let path = dir.join(&artifact.file_name);
            std::fs::write(&path, &artifact.bytes)?;
            info!(path = %path.display(), size = artifact.bytes.len(), "wrote artifact");
            Ok(path)
        })
        .collect()
}

/// Write report to JSON file
pub fn write_json_file(report: &SplitReport, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, report)?;
    Ok(())
}

/// Write report to JSON string
pub fn to_json_string(report: &SplitReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Write report to stdout
pub fn write_json_stdout(report: &SplitReport) -> Result<()> {
    let json = to_json_string(report)?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{}", json)?;
    Ok(())
}

fn clip(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CELL_WIDTH {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(PREVIEW_CELL_WIDTH - 1).collect();
    cut.push('…');
    cut
}

/// Render the first `max_rows` rows as a plain-text table
pub fn render_preview(dataset: &Dataset, max_rows: usize) -> String {
    let header: Vec<String> = dataset.columns().iter().map(|c| clip(c)).collect();
    let body: Vec<Vec<String>> = dataset
        .rows()
        .iter()
        .take(max_rows)
        .map(|row| row.iter().map(|v| clip(&v.to_text())).collect())
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in &body {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{:<width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = line(&header);
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|&w| "-".repeat(w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.push('\n');
    for row in &body {
        out.push_str(&line(row));
        out.push('\n');
    }
    if dataset.row_count() > body.len() {
        out.push_str(&format!(
            "... {} more rows\n",
            dataset.row_count() - body.len()
        ));
    }
    out
}
