use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use torque_core::event::EventBus;
use torque_core::types::WorkflowEvent;

/// JSONL run logger.
///
/// Writes one JSON object per line to `{log_dir}/{plan_id}/{timestamp}.jsonl`.
/// Lines are flushed as they are written, so a crash mid-run leaves every
/// earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1 = run and wave events, 2 = plus step results, 3 = plus attempts.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in the background.
    ///
    /// The subscription is taken before this returns, so spawning the logger
    /// and then starting a run never loses the run's first events.
    pub fn spawn(
        self,
        event_bus: &Arc<EventBus>,
        plan_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<PathBuf>> {
        let rx = event_bus.subscribe();
        let plan_id = plan_id.into();
        tokio::spawn(async move { self.run(rx, plan_id, cancel).await })
    }

    /// Log the first run seen on `rx` until it completes, is rejected, or
    /// `cancel` fires. Returns the log file path.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        plan_id: String,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let plan_dir = self.log_dir.join(&plan_id);
        if let Err(e) = tokio::fs::create_dir_all(&plan_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        let log_path = plan_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut tracked: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let run_id = event.run_id().0.clone();
                            match &tracked {
                                Some(id) if *id != run_id => continue,
                                Some(_) => {}
                                None => tracked = Some(run_id.clone()),
                            }

                            if let Some(entry) = self.event_to_entry(&run_id, &event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }

                            if matches!(event, WorkflowEvent::RunComplete { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Convert an event to a log entry, or `None` if filtered by level.
    fn event_to_entry(&self, run_id: &str, event: &WorkflowEvent) -> Option<LogEntry> {
        let (min_level, event_type, step_id, detail) = match event {
            WorkflowEvent::RunStarted { plan_id, steps, .. } => (
                1,
                "run_started",
                None,
                serde_json::json!({ "plan_id": plan_id, "steps": steps }),
            ),
            WorkflowEvent::RunRejected { reason, .. } => (
                1,
                "run_rejected",
                None,
                serde_json::json!({ "reason": reason }),
            ),
            WorkflowEvent::WaveStarted { index, steps, .. } => (
                1,
                "wave_started",
                None,
                serde_json::json!({ "index": index, "steps": steps }),
            ),
            WorkflowEvent::AbortRaised { trigger, .. } => (
                1,
                "abort_raised",
                Some(trigger.clone()),
                serde_json::Value::Null,
            ),
            WorkflowEvent::RunComplete {
                plan_id,
                success,
                failed_steps,
                ..
            } => (
                1,
                "run_complete",
                None,
                serde_json::json!({
                    "plan_id": plan_id,
                    "success": success,
                    "failed_steps": failed_steps,
                }),
            ),
            WorkflowEvent::StepFinished {
                step_id,
                status,
                attempts,
                elapsed_ms,
                ..
            } => (
                2,
                "step_finished",
                Some(step_id.clone()),
                serde_json::json!({
                    "status": status,
                    "attempts": attempts,
                    "elapsed_ms": elapsed_ms,
                }),
            ),
            WorkflowEvent::StepAttempt {
                step_id,
                agent,
                attempt,
                ..
            } => (
                3,
                "step_attempt",
                Some(step_id.clone()),
                serde_json::json!({ "agent": agent, "attempt": attempt }),
            ),
            WorkflowEvent::StepRetrying {
                step_id,
                attempt,
                backoff_ms,
                error,
                ..
            } => (
                3,
                "step_retrying",
                Some(step_id.clone()),
                serde_json::json!({
                    "attempt": attempt,
                    "backoff_ms": backoff_ms,
                    "error": error,
                }),
            ),
        };

        if self.level < min_level {
            return None;
        }

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type,
            step_id,
            detail: (!detail.is_null()).then_some(detail),
        })
    }
}
