//! Append-only record of tool invocations

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::params;
use tracing::debug;

use toolgate_core::{CallLogEntry, CallStats, CallStatus, NewCallLog, ServerCallStats};

use crate::db::{Database, parse_timestamp};

/// Hard cap on how many rows `get_recent_logs` returns
pub const MAX_RECENT_LOGS: usize = 1000;

/// Observability log of tool calls
#[derive(Clone)]
pub struct CallLog {
    db: Database,
}

impl CallLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write one row for one terminal call outcome
    pub async fn log_call(&self, entry: NewCallLog) -> Result<i64> {
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO call_logs
                        (timestamp, session_id, role, server_name, tool_name, status, latency_ms, error_message)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        // Fixed width so lexical order is chronological order
                        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                        &entry.session_id,
                        &entry.role,
                        &entry.server_name,
                        &entry.tool_name,
                        entry.status.to_string(),
                        entry.latency_ms as i64,
                        entry.error_message,
                    ],
                )?;
                let id = conn.last_insert_rowid();
                debug!(
                    "Logged call {}:{} -> {} ({}ms)",
                    entry.server_name, entry.tool_name, entry.status, entry.latency_ms
                );
                Ok(id)
            })
            .await
    }

    /// Totals over the whole history, computed on demand
    pub async fn get_stats(&self) -> Result<CallStats> {
        self.db
            .with_conn(|conn| {
                let (total, errors, avg): (i64, i64, Option<f64>) = conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0),
                            AVG(latency_ms)
                     FROM call_logs",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;

                let total = total as u64;
                let error_count = errors as u64;
                let success_rate = if total == 0 {
                    100.0
                } else {
                    (total - error_count) as f64 / total as f64 * 100.0
                };

                Ok(CallStats {
                    total_calls: total,
                    error_count,
                    success_rate,
                    avg_latency_ms: avg.unwrap_or(0.0),
                })
            })
            .await
    }

    /// Totals grouped by server, busiest first
    pub async fn get_server_stats(&self) -> Result<Vec<ServerCallStats>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT server_name,
                            COUNT(*),
                            SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END),
                            AVG(latency_ms)
                     FROM call_logs
                     GROUP BY server_name
                     ORDER BY COUNT(*) DESC, server_name",
                )?;
                let stats = stmt
                    .query_map([], |row| {
                        Ok(ServerCallStats {
                            server_name: row.get(0)?,
                            total_calls: row.get::<_, i64>(1)? as u64,
                            error_count: row.get::<_, i64>(2)? as u64,
                            avg_latency_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(stats)
            })
            .await
    }

    /// Most recent `limit` rows, newest first
    pub async fn get_recent_logs(&self, limit: usize) -> Result<Vec<CallLogEntry>> {
        let limit = limit.min(MAX_RECENT_LOGS) as i64;
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, session_id, role, server_name, tool_name, status, latency_ms, error_message
                     FROM call_logs
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?1",
                )?;
                let logs = stmt
                    .query_map(params![limit], Self::row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(logs)
            })
            .await
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CallLogEntry> {
        let status: String = row.get(6)?;
        Ok(CallLogEntry {
            id: row.get(0)?,
            timestamp: parse_timestamp(&row.get::<_, String>(1)?),
            session_id: row.get(2)?,
            role: row.get(3)?,
            server_name: row.get(4)?,
            tool_name: row.get(5)?,
            status: if status == "success" {
                CallStatus::Success
            } else {
                CallStatus::Error
            },
            latency_ms: row.get::<_, i64>(7)?.max(0) as u64,
            error_message: row.get(8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(server: &str, status: CallStatus, latency_ms: u64) -> NewCallLog {
        NewCallLog {
            session_id: "s1".to_string(),
            role: "analyst".to_string(),
            server_name: server.to_string(),
            tool_name: "get_price".to_string(),
            status,
            latency_ms,
            error_message: (status == CallStatus::Error).then(|| "boom".to_string()),
        }
    }

    #[tokio::test]
    async fn test_empty_stats() -> Result<()> {
        let log = CallLog::new(Database::open_in_memory()?);
        let stats = log.get_stats().await?;
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.success_rate, 100.0);
        assert_eq!(stats.avg_latency_ms, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_aggregate() -> Result<()> {
        let log = CallLog::new(Database::open_in_memory()?);
        log.log_call(entry("research", CallStatus::Success, 10)).await?;
        log.log_call(entry("research", CallStatus::Success, 20)).await?;
        log.log_call(entry("research", CallStatus::Error, 30)).await?;
        log.log_call(entry("unknown", CallStatus::Error, 40)).await?;

        let stats = log.get_stats().await?;
        assert_eq!(stats.total_calls, 4);
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.avg_latency_ms, 25.0);

        let per_server = log.get_server_stats().await?;
        assert_eq!(per_server[0].server_name, "research");
        assert_eq!(per_server[0].total_calls, 3);
        assert_eq!(per_server[0].error_count, 1);
        assert_eq!(per_server[1].server_name, "unknown");
        Ok(())
    }

    #[tokio::test]
    async fn test_recent_logs_newest_first() -> Result<()> {
        let log = CallLog::new(Database::open_in_memory()?);
        let first = log.log_call(entry("a", CallStatus::Success, 1)).await?;
        let second = log.log_call(entry("b", CallStatus::Error, 2)).await?;
        let third = log.log_call(entry("c", CallStatus::Success, 3)).await?;

        let recent = log.get_recent_logs(2).await?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, third);
        assert_eq!(recent[1].id, second);
        assert_eq!(recent[1].error_message.as_deref(), Some("boom"));
        assert_eq!(recent[1].status, CallStatus::Error);

        let all = log.get_recent_logs(100).await?;
        assert_eq!(all.last().unwrap().id, first);
        Ok(())
    }
}
