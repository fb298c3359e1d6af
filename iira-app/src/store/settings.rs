use super::{Database, now_rfc3339};
use rusqlite::params;
use std::collections::BTreeMap;

impl Database {
    pub async fn get_settings(&self) -> anyhow::Result<BTreeMap<String, String>> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT setting_key, setting_value FROM app_settings")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<BTreeMap<String, String>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO app_settings (setting_key, setting_value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(setting_key) DO UPDATE SET
                   setting_value = excluded.setting_value,
                   updated_at = excluded.updated_at",
                params![key, value, now_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}
