// Persisted WhatsApp reconnect intent. One row per connection name;
// rows are upserted on session start, patched on every state transition,
// and never deleted — manual close flips auto_reconnect off.

use super::{opt_ts_from_sql, ts_from_sql, ts_to_sql, Store};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{ConnectionStatus, WhatsAppConnection};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

fn status_from_sql(raw: &str) -> ConnectionStatus {
    match raw {
        "initializing_startup" => ConnectionStatus::InitializingStartup,
        "qr_pending_scan" => ConnectionStatus::QrPendingScan,
        "authenticated" => ConnectionStatus::Authenticated,
        "connected" => ConnectionStatus::Connected,
        "auth_failed" => ConnectionStatus::AuthFailed,
        "reconnecting" => ConnectionStatus::Reconnecting,
        "disconnected_permanent" => ConnectionStatus::DisconnectedPermanent,
        "closed_manually" => ConnectionStatus::ClosedManually,
        _ => ConnectionStatus::Initializing,
    }
}

fn row_to_connection(row: &Row) -> rusqlite::Result<WhatsAppConnection> {
    let status: String = row.get("last_known_status")?;
    Ok(WhatsAppConnection {
        connection_name: row.get("connection_name")?,
        system_prompt_name: row.get("system_prompt_name")?,
        system_prompt_id: row.get("system_prompt_id")?,
        user_id: row.get("user_id")?,
        auto_reconnect: row.get::<_, i64>("auto_reconnect")? != 0,
        last_known_status: status_from_sql(&status),
        last_connected_at: opt_ts_from_sql(row.get("last_connected_at")?),
        last_attempted_reconnect_at: opt_ts_from_sql(row.get("last_attempted_reconnect_at")?),
        phone_number: row.get("phone_number")?,
        created_at: ts_from_sql(&row.get::<_, String>("created_at")?),
        updated_at: ts_from_sql(&row.get::<_, String>("updated_at")?),
    })
}

/// Status-transition patch. `None` fields keep their persisted value.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPatch {
    pub status: Option<ConnectionStatus>,
    pub auto_reconnect: Option<bool>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_attempted_reconnect_at: Option<DateTime<Utc>>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    pub auto_reconnect: Option<bool>,
    pub user_id: Option<String>,
}

impl Store {
    /// Upsert the persisted intent for a connection. On conflict the profile
    /// linkage, status, and auto_reconnect are refreshed; created_at stays.
    pub fn upsert_whatsapp_connection(
        &self,
        connection_name: &str,
        system_prompt_name: &str,
        system_prompt_id: &str,
        user_id: &str,
        auto_reconnect: bool,
        status: ConnectionStatus,
    ) -> GatewayResult<WhatsAppConnection> {
        let conn = self.conn.lock();
        let now = ts_to_sql(Utc::now());
        conn.execute(
            "INSERT INTO whatsapp_connections (
                connection_name, system_prompt_name, system_prompt_id, user_id,
                auto_reconnect, last_known_status, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT (connection_name) DO UPDATE SET
                system_prompt_name = excluded.system_prompt_name,
                system_prompt_id = excluded.system_prompt_id,
                user_id = excluded.user_id,
                auto_reconnect = excluded.auto_reconnect,
                last_known_status = excluded.last_known_status,
                updated_at = excluded.updated_at",
            params![
                connection_name,
                system_prompt_name,
                system_prompt_id,
                user_id,
                auto_reconnect as i64,
                status.as_str(),
                now,
            ],
        )?;
        conn.query_row(
            "SELECT * FROM whatsapp_connections WHERE connection_name = ?1",
            params![connection_name],
            row_to_connection,
        )
        .map_err(Into::into)
    }

    pub fn update_whatsapp_connection(
        &self,
        connection_name: &str,
        patch: ConnectionPatch,
    ) -> GatewayResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE whatsapp_connections SET
                last_known_status = COALESCE(?1, last_known_status),
                auto_reconnect = COALESCE(?2, auto_reconnect),
                last_connected_at = COALESCE(?3, last_connected_at),
                last_attempted_reconnect_at = COALESCE(?4, last_attempted_reconnect_at),
                phone_number = COALESCE(?5, phone_number),
                updated_at = ?6
             WHERE connection_name = ?7",
            params![
                patch.status.map(|s| s.as_str()),
                patch.auto_reconnect.map(|v| v as i64),
                patch.last_connected_at.map(ts_to_sql),
                patch.last_attempted_reconnect_at.map(ts_to_sql),
                patch.phone_number,
                ts_to_sql(Utc::now()),
                connection_name,
            ],
        )?;
        if updated == 0 {
            return Err(GatewayError::not_found(format!(
                "whatsapp connection {}",
                connection_name
            )));
        }
        Ok(())
    }

    pub fn find_whatsapp_connection(
        &self,
        connection_name: &str,
    ) -> GatewayResult<Option<WhatsAppConnection>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM whatsapp_connections WHERE connection_name = ?1",
            params![connection_name],
            row_to_connection,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_whatsapp_connections(
        &self,
        filter: ConnectionFilter,
    ) -> GatewayResult<Vec<WhatsAppConnection>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM whatsapp_connections
             WHERE (?1 IS NULL OR auto_reconnect = ?1)
               AND (?2 IS NULL OR user_id = ?2)
             ORDER BY connection_name",
        )?;
        let connections = stmt
            .query_map(
                params![filter.auto_reconnect.map(|v| v as i64), filter.user_id],
                row_to_connection,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(connections)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &Store, name: &str, auto: bool) -> WhatsAppConnection {
        store
            .upsert_whatsapp_connection(name, "Support", "p1", "u1", auto, ConnectionStatus::Initializing)
            .unwrap()
    }

    #[test]
    fn upsert_refreshes_without_duplicating() {
        let store = Store::open_in_memory().unwrap();
        let first = seed(&store, "shop-bot", true);
        let second = store
            .upsert_whatsapp_connection(
                "shop-bot",
                "Sales",
                "p2",
                "u1",
                true,
                ConnectionStatus::Initializing,
            )
            .unwrap();
        assert_eq!(first.connection_name, second.connection_name);
        assert_eq!(second.system_prompt_name, "Sales");
        assert_eq!(
            store
                .list_whatsapp_connections(ConnectionFilter::default())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn patch_transitions_and_reconnect_flag() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "shop-bot", true);

        store
            .update_whatsapp_connection(
                "shop-bot",
                ConnectionPatch {
                    status: Some(ConnectionStatus::QrPendingScan),
                    auto_reconnect: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let loaded = store.find_whatsapp_connection("shop-bot").unwrap().unwrap();
        assert_eq!(loaded.last_known_status, ConnectionStatus::QrPendingScan);
        assert!(!loaded.auto_reconnect);
        // Untouched fields survive the patch.
        assert_eq!(loaded.system_prompt_name, "Support");
    }

    #[test]
    fn filter_by_auto_reconnect() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "alpha", true);
        seed(&store, "beta", false);

        let auto = store
            .list_whatsapp_connections(ConnectionFilter {
                auto_reconnect: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].connection_name, "alpha");
    }

    #[test]
    fn patch_missing_connection_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.update_whatsapp_connection("ghost", ConnectionPatch::default()),
            Err(GatewayError::NotFound(_))
        ));
    }
}
