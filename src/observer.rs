//! Observer interfaces: a log observer emitting one JSON line per
//! metadata/iteration record, and a verbose terminal observer with a
//! box-drawing progress-line style.

use chrono::Utc;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::types::{IterationRecord, MetadataRecord};

const RULE: &str = "───────────────────────────────────────────────────────────";

/// Receives one call per metadata record and one per iteration record.
/// Implementors must not block the driver for long; the log observer
/// writes synchronously to its sink and the verbose observer writes to
/// stdout.
pub trait Observer: Send + Sync {
    fn on_metadata(&self, record: &MetadataRecord);
    fn on_iteration(&self, record: &IterationRecord);
}

/// Emits one JSON line per event to any `std::io::Write` sink, prefixed
/// with an ISO-8601 timestamp and a monotone sequence number. Non-goal:
/// durable/rotating storage — callers needing that wrap their own sink.
pub struct LogObserver<W: Write + Send> {
    sink: Mutex<W>,
    sequence: AtomicU64,
}

impl<W: Write + Send> LogObserver<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
            sequence: AtomicU64::new(0),
        }
    }

    fn write_line(&self, event_type: &str, payload: serde_json::Value) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::Map::new();
        line.insert("type".to_string(), serde_json::json!(event_type));
        line.insert("sequence".to_string(), serde_json::json!(seq));
        line.insert("timestamp".to_string(), serde_json::json!(Utc::now().to_rfc3339()));
        if let serde_json::Value::Object(fields) = payload {
            for (k, v) in fields {
                line.insert(k, v);
            }
        }
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{}", serde_json::Value::Object(line));
        }
    }
}

impl<W: Write + Send> Observer for LogObserver<W> {
    fn on_metadata(&self, record: &MetadataRecord) {
        let payload = serde_json::to_value(record).unwrap_or_default();
        self.write_line("metadata", payload);
    }

    fn on_iteration(&self, record: &IterationRecord) {
        let payload = serde_json::to_value(record).unwrap_or_default();
        self.write_line("iteration", payload);
    }
}

/// Human-readable terminal rendering: box-drawing / section-rule style.
pub struct VerboseObserver;

impl Observer for VerboseObserver {
    fn on_metadata(&self, record: &MetadataRecord) {
        println!("{RULE}");
        println!(
            "RLM completion starting: root={} max_depth={} max_iterations={} backend={}",
            record.root_model, record.max_depth, record.max_iterations, record.sandbox_backend
        );
        println!("{RULE}");
    }

    fn on_iteration(&self, record: &IterationRecord) {
        println!("┌{}", "─".repeat(60));
        println!("│ LLM Response:");
        let preview: String = if record.response.chars().count() > 2000 {
            format!("{}...[truncated]", record.response.chars().take(2000).collect::<String>())
        } else {
            record.response.clone()
        };
        for line in preview.lines() {
            println!("│ {line}");
        }
        println!("└{}", "─".repeat(60));

        if record.code_blocks.is_empty() {
            println!("  (no code blocks this iteration)");
        }
        for (i, block) in record.code_blocks.iter().enumerate() {
            println!("  [{i}] code:");
            for line in block.code.lines() {
                println!("      {line}");
            }
            if !block.result.stdout.is_empty() {
                println!("  -> stdout: {}", block.result.stdout.trim_end());
            }
            if !block.result.stderr.is_empty() {
                println!("  -> stderr: {}", block.result.stderr.trim_end());
            }
        }

        if let Some(answer) = &record.final_answer {
            println!("  FINAL: {answer}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn log_observer_emits_one_line_per_call() {
        let buf: Vec<u8> = Vec::new();
        let observer = LogObserver::new(buf);
        let record = MetadataRecord {
            root_model: "gpt-4o".to_string(),
            max_depth: 1,
            max_iterations: 30,
            sandbox_backend: "local".to_string(),
            sandbox_config: Default::default(),
            sub_models: None,
        };
        observer.on_metadata(&record);
        let sink = observer.sink.into_inner().unwrap();
        let text = String::from_utf8(sink).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("\"type\":\"metadata\""));
    }

    #[test]
    fn log_observer_sequence_increments() {
        let observer = LogObserver::new(Vec::new());
        let record = IterationRecord {
            history: vec![],
            response: "x".to_string(),
            code_blocks: vec![],
            final_answer: None,
            execution_time: Duration::ZERO,
        };
        observer.on_iteration(&record);
        observer.on_iteration(&record);
        let sink = observer.sink.into_inner().unwrap();
        let text = String::from_utf8(sink).unwrap();
        assert!(text.contains("\"sequence\":0"));
        assert!(text.contains("\"sequence\":1"));
    }
}
