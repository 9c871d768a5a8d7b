use std::time::Duration;

use tileseed_engine::{QueueStatus, TaskOutcome};

/// One line per status tick: broker counters first, then local ones.
pub fn format_status_line(status: &QueueStatus) -> String {
    format!(
        "queued={} in_flight={} running={} pending={} uploads={} discarded={}",
        status.queued,
        status.in_flight,
        status.running,
        status.pending,
        status.pending_uploads,
        status.discarded,
    )
}

fn format_outcome_status(outcome: &TaskOutcome) -> String {
    if let Some(err) = &outcome.error {
        return err.clone();
    }
    let mut status = format!("{} tiles", outcome.tiles_rendered);
    if outcome.tiles_skipped > 0 {
        status.push_str(&format!(", {} skipped", outcome.tiles_skipped));
    }
    if outcome.render_errors > 0 {
        status.push_str(&format!(", {} failed", outcome.render_errors));
    }
    if outcome.children_enqueued > 0 {
        status.push_str(&format!(", {} children", outcome.children_enqueued));
    }
    status
}

pub fn format_outcome_line(outcome: &TaskOutcome) -> String {
    let task = &outcome.task;
    let retina = if task.retina { "@2x" } else { "" };
    format!(
        "{}{} m{} | {} | {:.2}s",
        task.tile,
        retina,
        task.metatile_size,
        format_outcome_status(outcome),
        Duration::from_millis(outcome.total_ms).as_secs_f64(),
    )
}
