//! CLI presentation: text and json formatters per command family.

use crate::api::{StepView, SweepReport};
use crate::config::DarkroomConfig;
use crate::error::OrchestratorError;
use crate::model::{RetrievalTaskRecord, SessionRecord, StepRecord};
use crate::workflow::{RecoveryReport, RetrievalStats};
use chrono::{DateTime, Utc};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use serde::Serialize;

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, OrchestratorError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| OrchestratorError::ConfigError(format!("Failed to render JSON: {}", e)))
}

/// Unix milliseconds as an RFC 3339-like UTC timestamp.
pub fn format_timestamp(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_optional_timestamp(ms: Option<u64>) -> String {
    ms.map(format_timestamp).unwrap_or_else(|| "-".to_string())
}

pub fn format_session(session: &SessionRecord) -> String {
    let origin = match session.origin.source_artifact_id() {
        Some(source) => format!("derived from {}", source),
        None => "fresh".to_string(),
    };
    format!(
        "{}  {}  {}  created {}",
        session.session_id,
        session.status.as_str(),
        origin,
        format_timestamp(session.created_at_ms)
    )
}

pub fn format_session_list(sessions: &[SessionRecord]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Session", "Status", "Origin", "Created", "Closed"]);
    for session in sessions {
        table.add_row(vec![
            session.session_id.to_string(),
            session.status.as_str().to_string(),
            session
                .origin
                .source_artifact_id()
                .map(|s| format!("derived:{}", s))
                .unwrap_or_else(|| "fresh".to_string()),
            format_timestamp(session.created_at_ms),
            format_optional_timestamp(session.completed_at_ms),
        ]);
    }
    table.to_string()
}

pub fn format_session_tree(
    session: &SessionRecord,
    steps: &[StepRecord],
    format: &str,
) -> Result<String, OrchestratorError> {
    if format == "json" {
        return to_json(&serde_json::json!({ "session": session, "steps": steps }));
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Step", "Parent", "Pos", "Status", "Prompt", "Ambiguous"]);
    for step in steps {
        table.add_row(vec![
            step.step_id.to_string(),
            step.parent_step_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            step.sibling_position.to_string(),
            step_status_label(step),
            truncate(&step.prompt, 48),
            if step.ambiguous_correlation { "yes" } else { "" }.to_string(),
        ]);
    }
    Ok(format!("{}\n{}", format_session(session), table))
}

pub fn format_step(step: &StepRecord) -> String {
    format!(
        "{} [{}] {}",
        step.step_id,
        step_status_label(step),
        truncate(&step.prompt, 60)
    )
}

pub fn format_step_view(view: &StepView, format: &str) -> Result<String, OrchestratorError> {
    if format == "json" {
        return to_json(view);
    }
    let step = &view.step;
    let mut lines = vec![
        format!("Step:        {}", step.step_id),
        format!("Session:     {}", step.session_id),
        format!(
            "Parent:      {}",
            step.parent_step_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
        format!("Status:      {}", step_status_label(step)),
        format!("Prompt:      {}", step.prompt),
        format!("Model:       {}", step.model().unwrap_or("-")),
        format!("Token:       {}", step.correlation_token),
        format!("Job:         {}", step.backend_job_id.as_deref().unwrap_or("-")),
        format!(
            "Expected:    {} (ambiguous: {})",
            step.expected_artifact_count, step.ambiguous_correlation
        ),
        format!("Created:     {}", format_timestamp(step.created_at_ms)),
        format!("Submitted:   {}", format_optional_timestamp(step.submitted_at_ms)),
        format!("Completed:   {}", format_optional_timestamp(step.completed_at_ms)),
    ];
    if let Some(monitor) = &step.monitor {
        lines.push(format!(
            "Next poll:   {} (polls: {}, deadline {})",
            format_timestamp(monitor.next_poll_at_ms),
            monitor.polls,
            format_timestamp(monitor.deadline_at_ms)
        ));
    }

    if !view.alternatives.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["#", "Artifact", "Tier", "Task", "Stored", "Selected"]);
        for alternative in &view.alternatives {
            table.add_row(vec![
                alternative.position.to_string(),
                alternative.artifact_ref.clone(),
                alternative.tier.as_str().to_string(),
                alternative.task_id.to_string(),
                if alternative.is_realized() { "yes" } else { "pending" }.to_string(),
                if alternative.selected { "*" } else { "" }.to_string(),
            ]);
        }
        lines.push(table.to_string());
    }
    Ok(lines.join("\n"))
}

pub fn format_tasks(
    tasks: &[RetrievalTaskRecord],
    stats: &RetrievalStats,
    format: &str,
) -> Result<String, OrchestratorError> {
    if format == "json" {
        return to_json(&serde_json::json!({ "tasks": tasks, "stats": stats }));
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "Task", "Step", "Artifact", "Status", "Priority", "Attempts", "Last Attempt", "Error",
    ]);
    for task in tasks {
        table.add_row(vec![
            task.task_id.to_string(),
            task.step_id.to_string(),
            task.artifact_ref.clone(),
            task.status.as_str().to_string(),
            task.priority.as_str().to_string(),
            task.attempts.to_string(),
            format_optional_timestamp(task.last_attempt_at_ms),
            task.error_message
                .as_deref()
                .map(|e| truncate(e, 40))
                .unwrap_or_default(),
        ]);
    }
    Ok(format!(
        "{}\npending {}  in progress {}  completed {}  failed {}",
        table, stats.pending, stats.in_progress, stats.completed, stats.failed
    ))
}

pub fn format_task(task: &RetrievalTaskRecord) -> String {
    format!(
        "{} {} [{}] attempts {}",
        task.task_id,
        task.artifact_ref,
        task.status.as_str(),
        task.attempts
    )
}

pub fn format_sweep_report(report: &SweepReport, format: &str) -> Result<String, OrchestratorError> {
    if format == "json" {
        return to_json(report);
    }
    let m = &report.monitor;
    let r = &report.retrieval;
    Ok(format!(
        "monitor: polled {} (pending {}, completed {}, failed {}, timed out {}, deferred {}, errors {})\n\
         retrieval: attempted {} (completed {}, retried {}, exhausted {})",
        m.polled, m.pending, m.completed, m.failed, m.timed_out, m.deferred, m.errors,
        r.attempted, r.completed, r.retried, r.exhausted
    ))
}

pub fn format_recovery_report(report: &RecoveryReport) -> String {
    format!(
        "interrupted submissions failed: {}\nmonitoring resumed: {}\ntasks re-queued: {}",
        report.interrupted_submissions, report.resumed_monitoring, report.requeued_tasks
    )
}

/// Effective configuration as TOML, with the backend key masked.
pub fn format_config(config: &DarkroomConfig) -> Result<String, OrchestratorError> {
    let mut shown = config.clone();
    if shown.backend.api_key.is_some() {
        shown.backend.api_key = Some("********".to_string());
    }
    toml::to_string_pretty(&shown)
        .map_err(|e| OrchestratorError::ConfigError(format!("Failed to render TOML: {}", e)))
}

fn step_status_label(step: &StepRecord) -> String {
    match &step.error {
        Some(error) => format!("{} ({})", step.status.as_str(), error.kind.as_str()),
        None => step.status.as_str().to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
