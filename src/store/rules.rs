//! Rule CRUD. Reads are not cached beyond a single evaluation — the policy
//! engine re-reads from the store on every request.

use super::Store;
use crate::error::StoreError;
use crate::types::Action;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Operator-defined policy entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub action: Action,
    pub enabled: bool,
    pub tool_pattern: Option<String>,
    pub host_pattern: Option<String>,
    pub agent_pattern: Option<String>,
    pub argument_pattern: Option<String>,
    pub rate_limit: Option<RateLimitSpec>,
    pub schedule: Option<Schedule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Informational capacity/refill numbers; the bucket itself lives in
/// `rate_limit_buckets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub max_tokens: f64,
    pub window_seconds: u64,
    pub refill_rate_per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Day-of-week subset, 0 = Sunday .. 6 = Saturday.
    pub days: Vec<u8>,
    pub start_hour: u8,
    pub end_hour: u8,
    pub timezone: Option<String>,
}

fn row_to_rule(row: &Row) -> rusqlite::Result<Rule> {
    let action_str: String = row.get("action")?;
    let rate_limit_json: Option<String> = row.get("rate_limit_json")?;
    let schedule_json: Option<String> = row.get("schedule_json")?;
    let created_at_i: i64 = row.get("created_at")?;
    let updated_at_i: i64 = row.get("updated_at")?;

    Ok(Rule {
        id: row.get("id")?,
        name: row.get("name")?,
        priority: row.get("priority")?,
        action: Action::parse(&action_str)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        tool_pattern: row.get("tool_pattern")?,
        host_pattern: row.get("host_pattern")?,
        agent_pattern: row.get("agent_pattern")?,
        argument_pattern: row.get("argument_pattern")?,
        rate_limit: rate_limit_json
            .and_then(|s| serde_json::from_str(&s).ok()),
        schedule: schedule_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: DateTime::from_timestamp_millis(created_at_i).unwrap_or_else(Utc::now),
        updated_at: DateTime::from_timestamp_millis(updated_at_i).unwrap_or_else(Utc::now),
    })
}

const SELECT_COLUMNS: &str = "id, name, priority, action, enabled, tool_pattern, host_pattern,
     agent_pattern, argument_pattern, rate_limit_json, schedule_json, created_at, updated_at";

impl Store {
    pub async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let rate_limit_json = rule
            .rate_limit
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let schedule_json = rule
            .schedule
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO rules (id, name, priority, action, enabled, tool_pattern, host_pattern,
                agent_pattern, argument_pattern, rate_limit_json, schedule_json, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name, priority=excluded.priority, action=excluded.action,
                enabled=excluded.enabled, tool_pattern=excluded.tool_pattern,
                host_pattern=excluded.host_pattern, agent_pattern=excluded.agent_pattern,
                argument_pattern=excluded.argument_pattern, rate_limit_json=excluded.rate_limit_json,
                schedule_json=excluded.schedule_json, updated_at=excluded.updated_at",
            params![
                rule.id,
                rule.name,
                rule.priority,
                rule.action.as_str(),
                rule.enabled as i64,
                rule.tool_pattern,
                rule.host_pattern,
                rule.agent_pattern,
                rule.argument_pattern,
                rate_limit_json,
                schedule_json,
                rule.created_at.timestamp_millis(),
                rule.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_rule(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute("DELETE FROM rules WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    pub async fn get_rule(&self, id: &str) -> Result<Option<Rule>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM rules WHERE id = ?1");
        conn.query_row(&sql, [id], row_to_rule)
            .optional()
            .map_err(StoreError::from)
    }

    /// All enabled rules, ordered by `priority` ascending then `created_at`
    /// ascending — the exact order step 4 of the decision engine consumes.
    pub async fn list_enabled_rules_ordered(&self) -> Result<Vec<Rule>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM rules WHERE enabled = 1 ORDER BY priority ASC, created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_rule)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn list_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM rules ORDER BY priority ASC, created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_rule)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
