//! CLI presentation: text rendering of pipeline results.

use crate::critic::CriticResult;
use crate::pipeline::{BatchOutcome, PipelineResponse};
use crate::reconcile::ReconcileReport;
use crate::store::VersionRecord;
use comfy_table::Table;

/// One row per critique, one column per scored dimension.
pub fn format_attempt_history(history: &[CriticResult]) -> String {
    let mut dimensions: Vec<&String> = history
        .iter()
        .flat_map(|r| r.dimension_scores.keys())
        .collect();
    dimensions.sort();
    dimensions.dedup();

    let mut header = vec!["Attempt".to_string()];
    header.extend(dimensions.iter().map(|d| d.to_string()));
    header.extend(["Weighted".to_string(), "Pass".to_string(), "Cost".to_string()]);

    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(header);
    for (index, result) in history.iter().enumerate() {
        let mut row = vec![(index + 1).to_string()];
        for dimension in &dimensions {
            let cell = match result.dimension_scores.get(*dimension) {
                Some(score) => format!("{:.2}", score),
                None => "-".to_string(),
            };
            row.push(cell);
        }
        row.push(format!("{:.3}", result.weighted_score));
        row.push(if result.overall_pass { "yes" } else { "no" }.to_string());
        row.push(format!("{:.4}", result.cost));
        table.add_row(row);
    }
    table.to_string()
}

pub fn format_response_text(response: &PipelineResponse) -> String {
    let mut lines = vec![
        format!("Execution:    {}", response.execution_id),
        format!("Record:       {}", response.record_id),
        format!("Version:      {} ({})", response.version, response.action),
        format!(
            "Storage:      {}{}",
            response.storage_mode,
            if response.trimmed { " (trimmed)" } else { "" }
        ),
        format!("Total cost:   {:.4}", response.total_cost),
    ];
    for failure in &response.stage_failures {
        lines.push(format!(
            "Skipped:      {} [{}] {}",
            failure.stage, failure.error_kind, failure.message
        ));
    }
    lines.push(String::new());
    lines.push(format_attempt_history(&response.attempt_history));
    lines.join("\n")
}

pub fn format_batch_text(outcome: &BatchOutcome) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Natural Key", "Outcome", "Record / Error", "Attempts"]);
    for response in &outcome.successes {
        table.add_row(vec![
            response.natural_key.to_string(),
            format!("{} v{}", response.action, response.version),
            format!("{} ({})", response.record_id, response.storage_mode),
            response.attempt_history.len().to_string(),
        ]);
    }
    for failed in &outcome.failures {
        table.add_row(vec![
            failed.natural_key.to_string(),
            "failed".to_string(),
            crate::cli::map_error(&failed.failure.error),
            failed.failure.attempt_history.len().to_string(),
        ]);
    }
    format!(
        "{}\n{} succeeded, {} failed",
        table,
        outcome.successes.len(),
        outcome.failures.len()
    )
}

pub fn format_history_text(records: &[VersionRecord]) -> String {
    if records.is_empty() {
        return "No records.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec![
        "Version", "Status", "Record ID", "Storage", "Parent", "Updated At",
    ]);
    for record in records {
        let storage = crate::storage::StoredField::parse(&record.storage_field);
        table.add_row(vec![
            record.version.to_string(),
            record.status.to_string(),
            record.record_id.clone(),
            storage.mode().to_string(),
            record.parent_id.clone().unwrap_or_else(|| "-".to_string()),
            record.updated_at.to_rfc3339(),
        ]);
    }
    table.to_string()
}

pub fn format_reconcile_text(report: &ReconcileReport) -> String {
    let mut lines = Vec::new();
    if report.dry_run {
        lines.push("Dry run: nothing was changed.".to_string());
    }
    if report.is_clean() {
        lines.push("Nothing to reconcile.".to_string());
        return lines.join("\n");
    }
    let sections: [(&str, &Vec<String>); 5] = [
        ("Replayed replacements", &report.replayed),
        ("Re-pointed dependents", &report.relinked),
        ("Unresolved replacements", &report.unresolved),
        ("Dangling dependents", &report.dangling),
        ("Orphaned blobs", &report.orphan_blobs),
    ];
    for (title, ids) in sections {
        if ids.is_empty() {
            continue;
        }
        lines.push(format!("{} ({}):", title, ids.len()));
        lines.extend(ids.iter().map(|id| format!("  {}", id)));
    }
    if !report.dry_run {
        lines.push(format!("Deleted {} blob(s).", report.deleted_blobs));
    }
    lines.join("\n")
}
