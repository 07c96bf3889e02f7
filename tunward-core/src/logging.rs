use crate::config::LogLevel;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Ring buffer of recent log lines, polled by the host UI for display
static LOG_BUFFER: once_cell::sync::Lazy<Arc<Mutex<LogBuffer>>> =
    once_cell::sync::Lazy::new(|| Arc::new(Mutex::new(LogBuffer::new(2000))));

pub struct LogBuffer {
    lines: VecDeque<String>,
    max_size: usize,
}

impl LogBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn get_lines(&self, count: usize) -> Vec<String> {
        if count == 0 || count >= self.lines.len() {
            return self.lines.iter().cloned().collect();
        }
        let start = self.lines.len() - count;
        self.lines.iter().skip(start).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Get up to `count` recent log lines (0 = all)
pub fn get_recent_logs(count: usize) -> Vec<String> {
    match LOG_BUFFER.lock() {
        Ok(buffer) => buffer.get_lines(count),
        Err(_) => vec![],
    }
}

/// Clear the log buffer (called at tunnel start)
pub fn clear_logs() {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.clear();
    }
}

fn add_log(line: String) {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.push(line);
    }
}

/// Categorized tunnel events emitted as (category, tag, message) triples.
/// Routing verdicts get their own categories so the display side can
/// color-code them without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Info,
    Warning,
    Error,
    Proxied,
    Direct,
    Blocked,
}

impl EventCategory {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
            Self::Proxied => "PROXY",
            Self::Direct => "DIRECT",
            Self::Blocked => "BLOCK",
        }
    }
}

/// Emit a categorized event into tracing and the ring buffer
pub fn log_event(category: EventCategory, tag: &str, message: &str) {
    match category {
        EventCategory::Error => tracing::error!("[{}] {}", tag, message),
        EventCategory::Warning => tracing::warn!("[{}] {}", tag, message),
        EventCategory::Blocked => tracing::info!("[{}] blocked {}", tag, message),
        EventCategory::Proxied => tracing::info!("[{}] proxied {}", tag, message),
        EventCategory::Direct => tracing::info!("[{}] direct {}", tag, message),
        EventCategory::Info => tracing::info!("[{}] {}", tag, message),
    }
    let timestamp = chrono::Local::now().format("%H:%M:%S");
    add_log(format!(
        "[{}] [{}] [{}] {}",
        timestamp,
        category.label(),
        tag,
        message
    ));
}

/// Initialize the logging system. Safe to call more than once.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Silent => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(
            format!("tunward_core={}", tracing_level)
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        )
        .add_directive(
            format!("tunward_netstack={}", tracing_level)
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        )
        .add_directive(
            "tokio=warn"
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        );

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .with_filter(filter);

    let buffer_layer = BufferLayer;

    // try_init so embedding hosts that installed their own subscriber
    // still get the ring buffer through log_event
    let result = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(buffer_layer)
        .try_init();

    if result.is_ok() {
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}

/// Layer that mirrors events into the ring buffer
struct BufferLayer;

impl<S> tracing_subscriber::Layer<S> for BufferLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with("tokio") {
            return;
        }

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%H:%M:%S");
        add_log(format!(
            "[{}] [{}] {}",
            timestamp,
            metadata.level(),
            visitor.message
        ));
    }
}

#[derive(Default)]
struct LogVisitor {
    message: String,
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = value.to_string();
        } else {
            self.message.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = format!("{:?}", value);
        } else {
            self.message.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_caps_at_max_size() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }
        let lines = buffer.get_lines(0);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "line 2");
        assert_eq!(lines[2], "line 4");
    }

    #[test]
    fn test_event_reaches_ring_buffer() {
        clear_logs();
        log_event(EventCategory::Blocked, "TCP", "1.2.3.4:443");
        let lines = get_recent_logs(0);
        assert!(lines.iter().any(|l| l.contains("[BLOCK]") && l.contains("1.2.3.4:443")));
    }
}
