//! Process-global config key/value table — at minimum `mode` and the four
//! anomaly detector thresholds.

use super::Store;
use crate::error::StoreError;
use crate::types::Mode;

impl Store {
    pub async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .ok();
        Ok(value)
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Read the current mode. Absence defaults to `alert` (the safe,
    /// interactive posture); any *present* value that isn't one of the four
    /// enumerated strings is a hard error, never a silent fallback.
    pub async fn get_mode(&self) -> Result<Mode, StoreError> {
        match self.get_config("mode").await? {
            Some(s) => Mode::parse(&s).map_err(|e| StoreError::Constraint(e.to_string())),
            None => Ok(Mode::Alert),
        }
    }

    pub async fn set_mode(&self, mode: Mode) -> Result<(), StoreError> {
        self.set_config("mode", mode.as_str()).await
    }
}
