//! Periodic timestamp records.
//!
//! A single background task appends a `timestamp:` line to the shared log
//! every interval until shutdown.

use crate::shutdown::Shutdown;
use crate::storage::SharedLog;
use bytes::Bytes;
use chrono::{DateTime, Local, TimeZone};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// strftime layout of a record, RFC 2822 style.
const RECORD_FORMAT: &str = "timestamp:%a, %d %b %Y %H:%M:%S %z\n";

/// Render one timestamp record for `at`.
pub fn format_record<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    at.format(RECORD_FORMAT).to_string()
}

/// Append a record every `interval` until shutdown is triggered.
pub async fn timestamp_task(log: Arc<SharedLog>, interval: Duration, shutdown: Shutdown) {
    info!(interval_secs = interval.as_secs(), "Timestamp task started");

    while !shutdown.is_triggered() {
        let deadline = Instant::now() + interval;

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = shutdown.wait() => break,
        }

        // The timer and the shutdown trigger can race; never write after it.
        if shutdown.is_triggered() {
            break;
        }

        let record = format_record(&Local::now());
        match log.append_async(Bytes::from(record.clone())).await {
            Ok(()) => debug!(record = record.trim_end(), "Wrote timestamp"),
            Err(e) => error!(error = %e, "Failed to write timestamp"),
        }
    }

    info!("Timestamp task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn test_format_record() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 14, 3, 7).unwrap();
        assert_eq!(
            format_record(&at),
            "timestamp:Mon, 19 Oct 2026 14:03:07 +0000\n"
        );
    }

    #[test]
    fn test_format_record_with_offset() {
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        let at = tz.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();
        assert_eq!(
            format_record(&at),
            "timestamp:Thu, 29 Feb 2024 23:59:59 -0500\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_record_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let log = SharedLog::new(dir.path().join("data"));
        let shutdown = Shutdown::new();

        let task = tokio::spawn(timestamp_task(
            Arc::clone(&log),
            Duration::from_secs(10),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(15)).await;
        shutdown.trigger();
        task.await.unwrap();

        let contents = String::from_utf8(log.snapshot().unwrap()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("timestamp:"));
        assert!(contents.ends_with('\n'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_first_interval_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = SharedLog::new(dir.path().join("data"));
        let shutdown = Shutdown::new();

        let task = tokio::spawn(timestamp_task(
            Arc::clone(&log),
            Duration::from_secs(10),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.trigger();
        task.await.unwrap();

        assert!(log.snapshot().unwrap().is_empty());
        assert!(!log.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let log = SharedLog::new(dir.path().join("missing").join("data"));
        let shutdown = Shutdown::new();

        let task = tokio::spawn(timestamp_task(
            Arc::clone(&log),
            Duration::from_secs(1),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!task.is_finished());

        shutdown.trigger();
        task.await.unwrap();
    }
}
