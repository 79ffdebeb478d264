// src/pipeline/daemon.rs

//! Long-running mode: background crawling plus a line-delimited JSON command
//! channel.
//!
//! Each input line is one [`Command`]; each produces exactly one response
//! line. Unread total changes are pushed as
//! `{"event":"unread-total","total":N}` lines on the same output.

use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::models::{Command, CommandResponse};
use crate::pipeline::Tracker;

/// Run the crawler, the consistency check and the command loop together.
///
/// Returns when the input reaches end of file or an I/O error occurs on
/// either stream.
pub async fn run_daemon<R, W>(tracker: &Tracker, input: R, output: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    log::info!("Daemon started; reading commands from input");
    tokio::select! {
        _ = tracker.engine().run() => Ok(()),
        _ = check_consistency_periodically(tracker) => Ok(()),
        result = serve(tracker, input, output) => result,
    }
}

async fn serve<R, W>(tracker: &Tracker, input: R, output: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut totals = tracker.accounter().subscribe();
    let mut events_open = true;

    loop {
        tokio::select! {
            biased;

            changed = totals.changed(), if events_open => {
                if changed.is_err() {
                    events_open = false;
                    continue;
                }
                let total = *totals.borrow_and_update();
                write_line(output, &json!({ "event": "unread-total", "total": total })).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    log::info!("Command input closed");
                    return Ok(());
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Command>(line) {
                    Ok(command) => {
                        log::debug!("Received {}", command.name());
                        tracker.handle(command).await
                    }
                    Err(e) => CommandResponse::failure(format!("invalid command: {e}")),
                };
                write_line(output, &response).await?;
            }
        }
    }
}

async fn check_consistency_periodically(tracker: &Tracker) {
    let secs = tracker.config().crawler.consistency_check_secs;
    if secs == 0 {
        return std::future::pending().await;
    }

    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let cache = tracker.store().cache();
        if let Err(e) = tracker.accounter().check_consistency(cache).await {
            log::warn!("Unread consistency check failed: {e}");
        }
    }
}

async fn write_line<W, T>(output: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    output.write_all(&buf).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::models::Config;
    use crate::services::ReplyCounter;
    use crate::storage::MemoryStorage;

    struct Offline;

    #[async_trait]
    impl ReplyCounter for Offline {
        async fn fetch_reply_count(&self, _topic_id: &str, _entry_id: &str) -> Option<u64> {
            None
        }
    }

    async fn open_tracker() -> Tracker {
        let mut config = Config::default();
        config.crawler.active_delay_ms = 0;
        Tracker::open(config, Arc::new(MemoryStorage::new()), Arc::new(Offline), None)
            .await
            .unwrap()
    }

    fn parse_lines(output: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(output)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_daemon_answers_each_line_and_pushes_totals() {
        let tracker = open_tracker().await;
        let input = concat!(
            r#"{"command":"upsert","topicId":"1","entryId":"2","replyCount":1}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"command":"upsert","topicId":"1","entryId":"2","replyCount":4}"#,
            "\n",
            r#"{"command":"list-all"}"#,
            "\n",
        );
        let mut output = Vec::new();

        run_daemon(&tracker, input.as_bytes(), &mut output).await.unwrap();

        let lines = parse_lines(&output);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["success"], true);
        assert_eq!(lines[1]["success"], false);
        assert!(lines[1]["error"].as_str().unwrap().starts_with("invalid command"));
        assert_eq!(lines[2]["success"], true);
        assert_eq!(lines[3], serde_json::json!({ "event": "unread-total", "total": 3 }));
        assert_eq!(lines[4]["count"], 1);
        assert_eq!(lines[4]["entries"][0]["unreadCount"], 3);
    }

    #[tokio::test]
    async fn test_daemon_stops_at_end_of_input() {
        let tracker = open_tracker().await;
        let mut output = Vec::new();
        run_daemon(&tracker, &b""[..], &mut output).await.unwrap();
        assert!(output.is_empty());
    }
}
