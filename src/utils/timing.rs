use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use teloxide::types::Message;
use tracing::info;

#[derive(Debug)]
pub struct CommandTimer {
    command: String,
    chat_id: i64,
    user_id: Option<i64>,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    completed: bool,
}

impl CommandTimer {
    pub fn from_message(command: &str, message: &Message) -> Self {
        CommandTimer {
            command: command.to_string(),
            chat_id: message.chat.id.0,
            user_id: message
                .from
                .as_ref()
                .and_then(|user| i64::try_from(user.id.0).ok()),
            started_at: Utc::now(),
            started_perf: Instant::now(),
            completed: false,
        }
    }

    fn log_received(&self) {
        info!(
            target: "bot.timing",
            "event=command_received command={} chat_id={} user_id={:?} received_at={}",
            self.command,
            self.chat_id,
            self.user_id,
            self.started_at.to_rfc3339()
        );
    }

    pub fn complete(&mut self, status: &str) {
        if self.completed {
            return;
        }
        self.completed = true;
        info!(
            target: "bot.timing",
            "event=command_completed command={} chat_id={} user_id={:?} duration_s={:.3} status={}",
            self.command,
            self.chat_id,
            self.user_id,
            self.started_perf.elapsed().as_secs_f64(),
            status
        );
    }
}

impl Drop for CommandTimer {
    fn drop(&mut self) {
        self.complete("dropped");
    }
}

pub fn start_command_timer(command: &str, message: &Message) -> CommandTimer {
    let timer = CommandTimer::from_message(command, message);
    timer.log_received();
    timer
}

/// Wraps one call to an external backend with start/finish timing lines.
pub async fn log_backend_timing<T, E, F, Fut>(
    backend: &str,
    operation: &str,
    call: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    info!(
        target: "bot.timing",
        "event=backend_request backend={} operation={} started_at={}",
        backend,
        operation,
        started_at.to_rfc3339()
    );

    let result = call().await;
    let status = if result.is_ok() { "success" } else { "error" };

    info!(
        target: "bot.timing",
        "event=backend_response backend={} operation={} completed_at={} duration_s={:.3} status={}",
        backend,
        operation,
        Utc::now().to_rfc3339(),
        started_perf.elapsed().as_secs_f64(),
        status
    );

    result
}
