// =============================================================================
// Account Store — SQLite-backed gateway account configuration
// =============================================================================
//
// The only durable state in the hub. One `accounts` table; the `settings`
// column is an opaque JSON blob holding vendor credentials and endpoints.
// Every mutation runs in a transaction and publishes `AccountMutated` only
// after the commit. The event deliberately omits `settings` (credentials
// would otherwise reach every WebSocket client); a `settings_changed` flag
// tells the Supervisor when a restart is warranted.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bus::EventBus;
use crate::errors::HubError;
use crate::events::{AccountChange, EventKind};
use crate::types::GatewayKind;

/// A persisted gateway account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub gateway_type: GatewayKind,
    /// Opaque vendor settings (credentials, endpoints).
    pub settings: serde_json::Value,
    /// Lower value = higher preference. Ties resolved by `id` order.
    pub priority: i64,
    pub enabled: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for `create`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountDraft {
    pub id: String,
    pub gateway_type: GatewayKind,
    #[serde(default = "default_settings")]
    pub settings: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_settings() -> serde_json::Value {
    serde_json::json!({})
}

fn default_priority() -> i64 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Partial update for `update`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountPatch {
    pub gateway_type: Option<GatewayKind>,
    pub settings: Option<serde_json::Value>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
    pub description: Option<String>,
}

/// SQLite-backed account store.
pub struct AccountStore {
    conn: Mutex<Connection>,
    bus: EventBus,
}

impl AccountStore {
    /// Open (or create) the store at `url` and initialize the schema.
    /// Accepts a bare path or a `sqlite://` URL.
    pub fn open(url: &str, bus: EventBus) -> Result<Self, HubError> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        let conn = Connection::open(path)
            .map_err(|e| HubError::DependencyUnavailable(format!("open {path}: {e}")))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                gateway_type TEXT NOT NULL,
                settings TEXT NOT NULL,
                priority INTEGER NOT NULL,
                enabled INTEGER NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(store_err)?;

        info!(path = %path, "account store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            bus,
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory(bus: EventBus) -> Self {
        Self::open(":memory:", bus).expect("in-memory store")
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn list(&self) -> Result<Vec<Account>, HubError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM accounts ORDER BY gateway_type, priority, id")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], row_to_account)
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    /// Enabled accounts ordered by `(gateway_type, priority, id)` — the
    /// order the Supervisor starts them in and the base of election order.
    pub fn list_enabled(&self) -> Result<Vec<Account>, HubError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM accounts WHERE enabled = 1
                 ORDER BY gateway_type, priority, id",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], row_to_account)
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    pub fn get(&self, id: &str) -> Result<Account, HubError> {
        let conn = self.conn.lock();
        let account = conn
            .query_row("SELECT * FROM accounts WHERE id = ?1", params![id], row_to_account)
            .optional()
            .map_err(store_err)?;
        account.ok_or_else(|| HubError::NotFound(format!("account '{id}'")))
    }

    // ── Writes ──────────────────────────────────────────────────────────

    pub fn create(&self, draft: AccountDraft) -> Result<Account, HubError> {
        validate_id(&draft.id)?;
        validate_priority(draft.priority)?;

        let now = Utc::now();
        let account = Account {
            id: draft.id,
            gateway_type: draft.gateway_type,
            settings: draft.settings,
            priority: draft.priority,
            enabled: draft.enabled,
            description: draft.description,
            created_at: now,
            updated_at: now,
        };

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            let result = tx.execute(
                "INSERT INTO accounts
                 (id, gateway_type, settings, priority, enabled, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    account.id,
                    account.gateway_type.as_str(),
                    account.settings.to_string(),
                    account.priority,
                    account.enabled as i64,
                    account.description,
                    account.created_at.to_rfc3339(),
                    account.updated_at.to_rfc3339(),
                ],
            );
            match result {
                Ok(_) => tx.commit().map_err(store_err)?,
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(HubError::Duplicate(format!("account '{}'", account.id)));
                }
                Err(e) => return Err(store_err(e)),
            }
        }

        info!(account_id = %account.id, gateway_type = %account.gateway_type, "account created");
        self.publish_mutation(&account, AccountChange::Created, false);
        Ok(account)
    }

    pub fn update(&self, id: &str, patch: AccountPatch) -> Result<Account, HubError> {
        if let Some(priority) = patch.priority {
            validate_priority(priority)?;
        }

        let mut account = self.get(id)?;
        let settings_changed = patch
            .settings
            .as_ref()
            .map(|s| *s != account.settings)
            .unwrap_or(false)
            || patch
                .gateway_type
                .map(|g| g != account.gateway_type)
                .unwrap_or(false);

        if let Some(gateway_type) = patch.gateway_type {
            account.gateway_type = gateway_type;
        }
        if let Some(settings) = patch.settings {
            account.settings = settings;
        }
        if let Some(priority) = patch.priority {
            account.priority = priority;
        }
        if let Some(enabled) = patch.enabled {
            account.enabled = enabled;
        }
        if let Some(description) = patch.description {
            account.description = Some(description);
        }
        account.updated_at = Utc::now();

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            let changed = tx
                .execute(
                    "UPDATE accounts SET gateway_type = ?2, settings = ?3, priority = ?4,
                     enabled = ?5, description = ?6, updated_at = ?7 WHERE id = ?1",
                    params![
                        account.id,
                        account.gateway_type.as_str(),
                        account.settings.to_string(),
                        account.priority,
                        account.enabled as i64,
                        account.description,
                        account.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(store_err)?;
            if changed == 0 {
                return Err(HubError::NotFound(format!("account '{id}'")));
            }
            tx.commit().map_err(store_err)?;
        }

        info!(account_id = %account.id, settings_changed, "account updated");
        self.publish_mutation(&account, AccountChange::Updated, settings_changed);
        Ok(account)
    }

    /// Delete an account. Legal while its session is running — the caller
    /// (Control API) tears the session down first.
    pub fn delete(&self, id: &str) -> Result<(), HubError> {
        let account = self.get(id)?;
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(store_err)?;
            let changed = tx
                .execute("DELETE FROM accounts WHERE id = ?1", params![id])
                .map_err(store_err)?;
            if changed == 0 {
                return Err(HubError::NotFound(format!("account '{id}'")));
            }
            tx.commit().map_err(store_err)?;
        }

        info!(account_id = %id, "account deleted");
        self.publish_mutation(&account, AccountChange::Deleted, false);
        Ok(())
    }

    fn publish_mutation(&self, account: &Account, change: AccountChange, settings_changed: bool) {
        self.bus.publish(EventKind::AccountMutated {
            account_id: account.id.clone(),
            change,
            gateway_type: account.gateway_type,
            enabled: account.enabled,
            settings_changed,
        });
    }
}

fn validate_id(id: &str) -> Result<(), HubError> {
    if id.trim().is_empty() {
        return Err(HubError::Validation("account id must not be empty".into()));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(HubError::Validation(
            "account id must not contain whitespace".into(),
        ));
    }
    Ok(())
}

fn validate_priority(priority: i64) -> Result<(), HubError> {
    if priority < 1 {
        return Err(HubError::Validation("priority must be >= 1".into()));
    }
    Ok(())
}

fn store_err(e: rusqlite::Error) -> HubError {
    HubError::DependencyUnavailable(format!("account store: {e}"))
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let gateway_type: String = row.get("gateway_type")?;
    let settings: String = row.get("settings")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Account {
        id: row.get("id")?,
        gateway_type: GatewayKind::parse(&gateway_type).unwrap_or(GatewayKind::Ctp),
        settings: serde_json::from_str(&settings).unwrap_or_else(|_| serde_json::json!({})),
        priority: row.get("priority")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        description: row.get("description")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TopicFilter;
    use crate::events::topics;

    fn draft(id: &str, kind: GatewayKind, priority: i64) -> AccountDraft {
        AccountDraft {
            id: id.into(),
            gateway_type: kind,
            settings: serde_json::json!({"md_address": "ws://127.0.0.1:9001"}),
            priority,
            enabled: true,
            description: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let bus = EventBus::new(16);
        let store = AccountStore::open_in_memory(bus);
        let created = store.create(draft("a1", GatewayKind::Ctp, 1)).unwrap();
        let fetched = store.get("a1").unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.gateway_type, GatewayKind::Ctp);
        assert_eq!(fetched.settings["md_address"], "ws://127.0.0.1:9001");
        assert!(fetched.enabled);
    }

    #[tokio::test]
    async fn duplicate_id_rejected_without_event() {
        let bus = EventBus::new(16);
        let store = AccountStore::open_in_memory(bus.clone());
        let mut sub = bus.subscribe(TopicFilter::Topics(vec![topics::ACCOUNT_MUTATED]));
        store.create(draft("a1", GatewayKind::Ctp, 1)).unwrap();
        assert!(sub.try_recv().is_some());

        let err = store.create(draft("a1", GatewayKind::Ctp, 2)).unwrap_err();
        assert_eq!(err.kind(), "Duplicate");
        assert!(sub.try_recv().is_none(), "no event for failed create");
    }

    #[tokio::test]
    async fn list_enabled_orders_by_type_priority_then_id() {
        let bus = EventBus::new(64);
        let store = AccountStore::open_in_memory(bus);
        store.create(draft("b2", GatewayKind::Ctp, 2)).unwrap();
        store.create(draft("a9", GatewayKind::Ctp, 1)).unwrap();
        // Priority tie: id breaks it.
        store.create(draft("a5", GatewayKind::Ctp, 1)).unwrap();
        store.create(draft("s1", GatewayKind::Sopt, 1)).unwrap();
        let mut disabled = draft("zz", GatewayKind::Ctp, 1);
        disabled.enabled = false;
        store.create(disabled).unwrap();

        let ids: Vec<String> = store
            .list_enabled()
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["a5", "a9", "b2", "s1"]);
    }

    #[tokio::test]
    async fn update_partial_flags_settings_change() {
        let bus = EventBus::new(16);
        let store = AccountStore::open_in_memory(bus.clone());
        store.create(draft("a1", GatewayKind::Ctp, 1)).unwrap();
        let mut sub = bus.subscribe(TopicFilter::Topics(vec![topics::ACCOUNT_MUTATED]));

        // Priority-only change: settings_changed must be false.
        let updated = store
            .update(
                "a1",
                AccountPatch {
                    priority: Some(3),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.priority, 3);
        match sub.try_recv().unwrap().kind {
            EventKind::AccountMutated {
                settings_changed, ..
            } => assert!(!settings_changed),
            _ => panic!("unexpected event"),
        }

        // Settings change must be flagged.
        store
            .update(
                "a1",
                AccountPatch {
                    settings: Some(serde_json::json!({"md_address": "ws://other:9001"})),
                    ..Default::default()
                },
            )
            .unwrap();
        match sub.try_recv().unwrap().kind {
            EventKind::AccountMutated {
                settings_changed, ..
            } => assert!(settings_changed),
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let bus = EventBus::new(16);
        let store = AccountStore::open_in_memory(bus);
        let err = store.delete("ghost").unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn validation_rejects_bad_drafts() {
        let bus = EventBus::new(16);
        let store = AccountStore::open_in_memory(bus);
        let err = store.create(draft("", GatewayKind::Ctp, 1)).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        let err = store.create(draft("a1", GatewayKind::Ctp, 0)).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        let url = path.to_str().unwrap().to_string();
        {
            let store = AccountStore::open(&url, EventBus::new(16)).unwrap();
            store.create(draft("a1", GatewayKind::Sopt, 2)).unwrap();
        }
        let store = AccountStore::open(&url, EventBus::new(16)).unwrap();
        let account = store.get("a1").unwrap();
        assert_eq!(account.gateway_type, GatewayKind::Sopt);
        assert_eq!(account.priority, 2);
    }
}
