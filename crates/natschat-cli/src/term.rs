use chrono::{DateTime, Local};
use tokio::sync::mpsc;

/// Read stdin lines on a dedicated thread.
///
/// The channel closes on EOF. The thread is detached and a pending read is
/// never interrupted; it ends with the process.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// A received chat line as shown to the user.
pub fn format_message(sent_at_ms: u64, text: &str) -> String {
    let stamp = i64::try_from(sent_at_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    format!("[{stamp}] {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_keeps_text_verbatim() {
        let line = format_message(1_700_000_000_000, "Nice to meet you!");
        assert!(line.ends_with("] Nice to meet you!"));
        assert!(line.starts_with('['));
    }

    #[test]
    fn out_of_range_timestamp_still_formats() {
        assert_eq!(format_message(u64::MAX, "hi"), "[--:--:--] hi");
    }
}
