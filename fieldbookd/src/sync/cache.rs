use fieldbook_core::ActionKind;
use serde_json::{Map, Value};

use super::now_unix;
use super::queue::{ActionId, PendingAction, is_local_id};
use super::store::{IndexKey, LocalStore, Provenance, Record, StoreError, StoreTx, Table};

/// Read models the UI renders from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Client,
    Session,
    Invoice,
    BillingRate,
}

impl EntityKind {
    pub fn table(&self) -> Table {
        match self {
            EntityKind::Client => Table::Clients,
            EntityKind::Session => Table::Sessions,
            EntityKind::Invoice => Table::Invoices,
            EntityKind::BillingRate => Table::BillingRates,
        }
    }

    pub fn for_action(kind: ActionKind) -> Self {
        match kind {
            ActionKind::StartSession | ActionKind::EndSession | ActionKind::UpdateSession => {
                EntityKind::Session
            }
            ActionKind::CreateClient | ActionKind::UpdateClient => EntityKind::Client,
            ActionKind::CreateBillingRate => EntityKind::BillingRate,
            ActionKind::CreateInvoice | ActionKind::DeleteInvoice => EntityKind::Invoice,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheQuery<'a> {
    All,
    ById(&'a str),
    ByClient(&'a str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    pub id: String,
    pub data: Value,
    pub provenance: Provenance,
    pub watermark: i64,
    pub updated_at: i64,
}

impl CachedEntity {
    pub fn is_pending(&self) -> bool {
        self.provenance == Provenance::Pending
    }
}

impl From<Record> for CachedEntity {
    fn from(record: Record) -> Self {
        Self {
            id: record.key,
            data: record.data,
            provenance: record.provenance,
            watermark: record.watermark,
            updated_at: record.updated_at,
        }
    }
}

/// Local projection of server state, patched optimistically as actions are
/// enqueued and replaced authoritatively as they confirm.
#[derive(Clone)]
pub struct ReadCache {
    store: LocalStore,
}

impl ReadCache {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Merges `patch` into the cached entity and tags it pending. Returns
    /// `false` when the entity already reflects generation `generation`.
    pub async fn apply_optimistic(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &Value,
        generation: ActionId,
    ) -> Result<bool, StoreError> {
        let mut tx = self.store.begin().await?;
        let applied = write_optimistic(&mut tx, kind.table(), id, patch, generation).await?;
        tx.commit().await?;
        Ok(applied)
    }

    /// Replaces the cached entity with server data. Returns `false` when the
    /// cache already holds data from a later generation.
    pub async fn apply_authoritative(
        &self,
        kind: EntityKind,
        id: &str,
        record: &Value,
        watermark: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.store.begin().await?;
        let applied = write_authoritative(&mut tx, kind.table(), id, record, watermark).await?;
        tx.commit().await?;
        Ok(applied)
    }

    pub async fn read(
        &self,
        kind: EntityKind,
        query: CacheQuery<'_>,
    ) -> Result<Vec<CachedEntity>, StoreError> {
        let records = match query {
            CacheQuery::All => self.store.list(kind.table()).await?,
            CacheQuery::ById(id) => self
                .store
                .get(kind.table(), id)
                .await?
                .into_iter()
                .collect(),
            CacheQuery::ByClient(client_id) => {
                self.store
                    .query_by_index(kind.table(), IndexKey::ClientId(client_id))
                    .await?
            }
        };
        Ok(records.into_iter().map(CachedEntity::from).collect())
    }

    pub async fn active_session(&self) -> Result<Option<CachedEntity>, StoreError> {
        Ok(self.store.active_session().await?.map(CachedEntity::from))
    }

    pub async fn set_active_session(
        &self,
        session: &Value,
        provenance: Provenance,
        watermark: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.store.begin().await?;
        tx.set_active_session(&Record {
            key: String::new(),
            data: session.clone(),
            provenance,
            watermark,
            updated_at: now_unix(),
        })
        .await?;
        tx.commit().await
    }

    pub async fn clear_active_session(&self) -> Result<bool, StoreError> {
        let mut tx = self.store.begin().await?;
        let cleared = tx.clear_active_session().await?;
        tx.commit().await?;
        Ok(cleared)
    }

    /// Stores a refetched listing. Items without a string `id` are skipped.
    /// Returns how many rows were written.
    pub async fn apply_snapshot(
        &self,
        kind: EntityKind,
        items: &[Value],
        watermark: i64,
    ) -> Result<usize, StoreError> {
        let mut tx = self.store.begin().await?;
        let mut written = 0;
        for item in items {
            let Some(id) = item.get("id").and_then(Value::as_str) else {
                tracing::warn!(?kind, "refetched item without id skipped");
                continue;
            };
            if write_authoritative(&mut tx, kind.table(), id, item, watermark).await? {
                written += 1;
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Reconciles the active session with the server's view. A server saying
    /// nothing runs only clears a confirmed row; a session started offline
    /// stays until its own action resolves.
    pub async fn apply_active_snapshot(
        &self,
        session: Option<&Value>,
        watermark: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.store.begin().await?;
        let current = tx.active_session().await?;
        let newer_local = current.as_ref().is_some_and(|row| row.watermark > watermark);
        match session {
            _ if newer_local => {}
            Some(session) => {
                tx.set_active_session(&Record {
                    key: String::new(),
                    data: session.clone(),
                    provenance: Provenance::Confirmed,
                    watermark,
                    updated_at: now_unix(),
                })
                .await?;
            }
            None => {
                if current.is_some_and(|row| row.provenance == Provenance::Confirmed) {
                    tx.clear_active_session().await?;
                }
            }
        }
        tx.commit().await
    }

    /// Applies the optimistic effect of a freshly enqueued action.
    pub async fn project_action(&self, action: &PendingAction) -> Result<(), StoreError> {
        let table = EntityKind::for_action(action.kind).table();
        let mut tx = self.store.begin().await?;
        match action.kind {
            ActionKind::DeleteInvoice => {
                if let Some(id) = action.entity_id() {
                    tx.delete(table, id).await?;
                }
            }
            ActionKind::StartSession => {
                if let Some(id) = action.entity_id() {
                    write_optimistic(&mut tx, table, id, &action.payload, action.id).await?;
                    if let Some(session) = tx.get(table, id).await? {
                        tx.set_active_session(&session).await?;
                    }
                } else {
                    tracing::warn!(action_id = action.id, "start-session without id, active session not projected");
                }
            }
            ActionKind::EndSession => {
                if let Some(id) = action.entity_id() {
                    write_optimistic(&mut tx, table, id, &action.payload, action.id).await?;
                }
                if ends_active_session(&mut tx, action.entity_id()).await? {
                    tx.clear_active_session().await?;
                }
            }
            _ => {
                if let Some(id) = action.entity_id() {
                    write_optimistic(&mut tx, table, id, &action.payload, action.id).await?;
                    if action.kind == ActionKind::UpdateSession {
                        refresh_active_copy(&mut tx, id).await?;
                    }
                }
            }
        }
        tx.commit().await
    }

    /// Undoes what [`ReadCache::project_action`] created for an action the
    /// user discarded. Pending rows for entities the server never saw are
    /// dropped; edits to confirmed entities are left for the next refresh.
    pub async fn revert_action(&self, action: &PendingAction) -> Result<(), StoreError> {
        if !action.kind.creates_resource() {
            return Ok(());
        }
        let Some(id) = action.entity_id() else {
            return Ok(());
        };
        let table = EntityKind::for_action(action.kind).table();
        let mut tx = self.store.begin().await?;
        let existing = tx.get(table, id).await?;
        if existing.is_some_and(|row| row.provenance == Provenance::Pending) {
            tx.delete(table, id).await?;
        }
        if action.kind == ActionKind::StartSession {
            let active = tx.active_session().await?;
            if active.is_some_and(|row| {
                row.provenance == Provenance::Pending && record_id(&row) == Some(id)
            }) {
                tx.clear_active_session().await?;
            }
        }
        tx.commit().await
    }
}

/// Applies a confirmed server response inside the delivery transaction.
///
/// `sent_id` is the entity id the action carried before placeholder
/// rewriting. Returns the `(placeholder, server id)` pair when the server
/// assigned an id to an entity created offline.
pub(crate) async fn project_confirmation(
    tx: &mut StoreTx,
    action: &PendingAction,
    sent_id: Option<&str>,
    delivered: &Value,
    response: Option<&Value>,
) -> Result<Option<(String, String)>, StoreError> {
    let table = EntityKind::for_action(action.kind).table();
    let data = response.unwrap_or(delivered);
    let server_id = data
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| delivered.get("id").and_then(Value::as_str))
        .map(str::to_string);

    if action.kind == ActionKind::DeleteInvoice {
        if let Some(id) = server_id.as_deref() {
            tx.delete(table, id).await?;
        }
        return Ok(None);
    }

    let mut mapping = None;
    if action.kind.creates_resource() {
        if let (Some(local), Some(server)) = (sent_id, server_id.as_deref()) {
            if is_local_id(local) && local != server {
                tx.record_id_mapping(local, server, action.id).await?;
                tx.delete(table, local).await?;
                mapping = Some((local.to_string(), server.to_string()));
            }
        }
    }

    let Some(key) = server_id else {
        if action.kind == ActionKind::EndSession && ends_active_session(tx, None).await? {
            tx.clear_active_session().await?;
        }
        return Ok(mapping);
    };
    match response {
        Some(record) => write_authoritative(tx, table, &key, record, action.id).await?,
        // 204: the server accepted the payload as sent.
        None => write_confirmed_patch(tx, table, &key, delivered, action.id).await?,
    };

    match action.kind {
        ActionKind::StartSession => {
            if let Some(session) = tx.get(table, &key).await? {
                tx.set_active_session(&session).await?;
            }
        }
        ActionKind::EndSession => {
            if ends_active_session(tx, Some(&key)).await? {
                tx.clear_active_session().await?;
            }
        }
        ActionKind::UpdateSession => refresh_active_copy(tx, &key).await?,
        _ => {}
    }
    Ok(mapping)
}

pub(crate) async fn write_optimistic(
    tx: &mut StoreTx,
    table: Table,
    id: &str,
    patch: &Value,
    generation: ActionId,
) -> Result<bool, StoreError> {
    let (mut data, watermark) = match tx.get(table, id).await? {
        Some(existing) if generation <= existing.watermark => {
            tracing::debug!(%table, id, generation, watermark = existing.watermark, "stale optimistic patch ignored");
            return Ok(false);
        }
        Some(existing) => (existing.data, existing.watermark),
        None => (Value::Object(Map::new()), 0),
    };
    merge_patch(&mut data, patch);
    if let Value::Object(fields) = &mut data {
        fields.insert("id".into(), Value::String(id.to_string()));
    }
    tx.put(
        table,
        &Record {
            key: id.to_string(),
            data,
            provenance: Provenance::Pending,
            watermark,
            updated_at: now_unix(),
        },
    )
    .await?;
    Ok(true)
}

pub(crate) async fn write_authoritative(
    tx: &mut StoreTx,
    table: Table,
    id: &str,
    record: &Value,
    watermark: i64,
) -> Result<bool, StoreError> {
    if let Some(existing) = tx.get(table, id).await? {
        if existing.watermark > watermark {
            tracing::debug!(%table, id, watermark, newer = existing.watermark, "stale authoritative record ignored");
            return Ok(false);
        }
    }
    tx.put(
        table,
        &Record {
            key: id.to_string(),
            data: record.clone(),
            provenance: Provenance::Confirmed,
            watermark,
            updated_at: now_unix(),
        },
    )
    .await?;
    Ok(true)
}

/// Merges an accepted payload into the cached row and marks it confirmed.
async fn write_confirmed_patch(
    tx: &mut StoreTx,
    table: Table,
    id: &str,
    patch: &Value,
    watermark: i64,
) -> Result<bool, StoreError> {
    let mut data = match tx.get(table, id).await? {
        Some(existing) if existing.watermark > watermark => {
            tracing::debug!(%table, id, watermark, newer = existing.watermark, "stale confirmation ignored");
            return Ok(false);
        }
        Some(existing) => existing.data,
        None => Value::Object(Map::new()),
    };
    merge_patch(&mut data, patch);
    if let Value::Object(fields) = &mut data {
        fields.insert("id".into(), Value::String(id.to_string()));
    }
    tx.put(
        table,
        &Record {
            key: id.to_string(),
            data,
            provenance: Provenance::Confirmed,
            watermark,
            updated_at: now_unix(),
        },
    )
    .await?;
    Ok(true)
}

async fn ends_active_session(
    tx: &mut StoreTx,
    session_id: Option<&str>,
) -> Result<bool, StoreError> {
    let Some(active) = tx.active_session().await? else {
        return Ok(false);
    };
    Ok(match session_id {
        Some(id) => record_id(&active) == Some(id),
        // Ending "the current session" without naming it.
        None => true,
    })
}

async fn refresh_active_copy(tx: &mut StoreTx, session_id: &str) -> Result<(), StoreError> {
    let Some(active) = tx.active_session().await? else {
        return Ok(());
    };
    if record_id(&active) != Some(session_id) {
        return Ok(());
    }
    if let Some(session) = tx.get(Table::Sessions, session_id).await? {
        tx.set_active_session(&session).await?;
    }
    Ok(())
}

fn record_id(record: &Record) -> Option<&str> {
    record.data.get("id").and_then(Value::as_str)
}

/// JSON merge patch: objects merge recursively, `null` removes a key, any
/// other value replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_fields) = target {
        for (key, value) in patch_fields {
            if value.is_null() {
                target_fields.remove(key);
            } else {
                merge_patch(
                    target_fields.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::queue::ActionStatus;
    use serde_json::json;
    use sqlx::SqlitePool;

    async fn make_cache() -> (ReadCache, LocalStore) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = LocalStore::from_pool(pool).await.unwrap();
        (ReadCache::new(store.clone()), store)
    }

    fn action(id: ActionId, kind: ActionKind, payload: Value) -> PendingAction {
        PendingAction {
            id,
            kind,
            payload,
            created_at: 0,
            synced: false,
            status: ActionStatus::Pending,
            attempt: 0,
            retry_at: None,
            last_error: None,
        }
    }

    #[test]
    fn merge_patch_merges_and_removes() {
        let mut target = json!({ "name": "Smith", "phone": "1", "address": { "city": "A", "zip": "1" } });
        merge_patch(
            &mut target,
            &json!({ "phone": null, "address": { "zip": "2" }, "email": "s@x" }),
        );
        assert_eq!(
            target,
            json!({ "name": "Smith", "address": { "city": "A", "zip": "2" }, "email": "s@x" })
        );
    }

    #[tokio::test]
    async fn optimistic_patch_merges_and_tags_pending() {
        let (cache, _) = make_cache().await;
        cache
            .apply_authoritative(EntityKind::Client, "cl_1", &json!({ "id": "cl_1", "name": "Smith" }), 2)
            .await
            .unwrap();
        assert!(cache
            .apply_optimistic(EntityKind::Client, "cl_1", &json!({ "phone": "555" }), 3)
            .await
            .unwrap());

        let rows = cache.read(EntityKind::Client, CacheQuery::ById("cl_1")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, json!({ "id": "cl_1", "name": "Smith", "phone": "555" }));
        assert!(rows[0].is_pending());
        assert_eq!(rows[0].watermark, 2);
    }

    #[tokio::test]
    async fn authoritative_replaces_optimistic_data() {
        let (cache, _) = make_cache().await;
        cache
            .apply_optimistic(EntityKind::Client, "cl_1", &json!({ "name": "Smyth", "draft": true }), 4)
            .await
            .unwrap();
        cache
            .apply_authoritative(EntityKind::Client, "cl_1", &json!({ "id": "cl_1", "name": "Smith" }), 4)
            .await
            .unwrap();

        let row = cache.read(EntityKind::Client, CacheQuery::ById("cl_1")).await.unwrap().remove(0);
        assert_eq!(row.data, json!({ "id": "cl_1", "name": "Smith" }));
        assert_eq!(row.provenance, Provenance::Confirmed);
    }

    #[tokio::test]
    async fn older_optimistic_patch_does_not_override_authoritative() {
        let (cache, _) = make_cache().await;
        cache
            .apply_authoritative(EntityKind::Invoice, "in_1", &json!({ "id": "in_1", "total": 100 }), 7)
            .await
            .unwrap();
        assert!(!cache
            .apply_optimistic(EntityKind::Invoice, "in_1", &json!({ "total": 50 }), 5)
            .await
            .unwrap());

        let row = cache.read(EntityKind::Invoice, CacheQuery::ById("in_1")).await.unwrap().remove(0);
        assert_eq!(row.data["total"], 100);
        assert_eq!(row.provenance, Provenance::Confirmed);
    }

    #[tokio::test]
    async fn stale_authoritative_record_is_ignored() {
        let (cache, _) = make_cache().await;
        cache
            .apply_authoritative(EntityKind::Client, "cl_1", &json!({ "id": "cl_1", "name": "New" }), 9)
            .await
            .unwrap();
        assert!(!cache
            .apply_authoritative(EntityKind::Client, "cl_1", &json!({ "id": "cl_1", "name": "Old" }), 3)
            .await
            .unwrap());
        let row = cache.read(EntityKind::Client, CacheQuery::ById("cl_1")).await.unwrap().remove(0);
        assert_eq!(row.data["name"], "New");
    }

    #[tokio::test]
    async fn sessions_by_client_are_newest_first() {
        let (cache, _) = make_cache().await;
        for (id, started_at) in [("se_1", 100), ("se_2", 300), ("se_3", 200)] {
            cache
                .apply_authoritative(
                    EntityKind::Session,
                    id,
                    &json!({ "id": id, "client_id": "cl_1", "started_at": started_at }),
                    1,
                )
                .await
                .unwrap();
        }
        cache
            .apply_authoritative(
                EntityKind::Session,
                "se_4",
                &json!({ "id": "se_4", "client_id": "cl_2", "started_at": 400 }),
                1,
            )
            .await
            .unwrap();

        let ids: Vec<_> = cache
            .read(EntityKind::Session, CacheQuery::ByClient("cl_1"))
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.id)
            .collect();
        assert_eq!(ids, vec!["se_2", "se_3", "se_1"]);
    }

    #[tokio::test]
    async fn start_and_end_session_project_active_session() {
        let (cache, _) = make_cache().await;
        cache
            .project_action(&action(
                1,
                ActionKind::StartSession,
                json!({ "id": "local-a", "client_id": "cl_1", "started_at": 10 }),
            ))
            .await
            .unwrap();
        let active = cache.active_session().await.unwrap().unwrap();
        assert_eq!(active.data["id"], "local-a");
        assert!(active.is_pending());

        cache
            .project_action(&action(2, ActionKind::EndSession, json!({ "id": "other", "ended_at": 20 })))
            .await
            .unwrap();
        assert!(cache.active_session().await.unwrap().is_some());

        cache
            .project_action(&action(3, ActionKind::EndSession, json!({ "id": "local-a", "ended_at": 20 })))
            .await
            .unwrap();
        assert!(cache.active_session().await.unwrap().is_none());
        let session = cache.read(EntityKind::Session, CacheQuery::ById("local-a")).await.unwrap().remove(0);
        assert_eq!(session.data["ended_at"], 20);
    }

    #[tokio::test]
    async fn delete_invoice_drops_cached_row() {
        let (cache, _) = make_cache().await;
        cache
            .apply_authoritative(EntityKind::Invoice, "in_1", &json!({ "id": "in_1" }), 1)
            .await
            .unwrap();
        cache
            .project_action(&action(2, ActionKind::DeleteInvoice, json!({ "id": "in_1" })))
            .await
            .unwrap();
        assert!(cache.read(EntityKind::Invoice, CacheQuery::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revert_drops_pending_rows_of_discarded_create() {
        let (cache, _) = make_cache().await;
        let start = action(
            5,
            ActionKind::StartSession,
            json!({ "id": "local-b", "client_id": "cl_1", "started_at": 1 }),
        );
        cache.project_action(&start).await.unwrap();
        cache.revert_action(&start).await.unwrap();

        assert!(cache.read(EntityKind::Session, CacheQuery::All).await.unwrap().is_empty());
        assert!(cache.active_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn confirmation_rekeys_placeholder_and_records_mapping() {
        let (cache, store) = make_cache().await;
        let create = action(1, ActionKind::CreateClient, json!({ "id": "local-c", "name": "Acme" }));
        cache.project_action(&create).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mapping = project_confirmation(
            &mut tx,
            &create,
            Some("local-c"),
            &create.payload,
            Some(&json!({ "id": "cl_9", "name": "Acme" })),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(mapping, Some(("local-c".to_string(), "cl_9".to_string())));
        let rows = cache.read(EntityKind::Client, CacheQuery::All).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "cl_9");
        assert_eq!(rows[0].provenance, Provenance::Confirmed);
        assert_eq!(rows[0].watermark, 1);
        assert_eq!(store.id_map().await.unwrap().get("local-c").map(String::as_str), Some("cl_9"));
    }

    #[tokio::test]
    async fn empty_confirmation_keeps_unpatched_fields() {
        let (cache, store) = make_cache().await;
        cache
            .apply_authoritative(
                EntityKind::Client,
                "cl_1",
                &json!({ "id": "cl_1", "name": "Smith", "phone": "1" }),
                0,
            )
            .await
            .unwrap();
        let update = action(1, ActionKind::UpdateClient, json!({ "id": "cl_1", "phone": "555" }));
        cache.project_action(&update).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        project_confirmation(&mut tx, &update, Some("cl_1"), &update.payload, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let row = cache.read(EntityKind::Client, CacheQuery::ById("cl_1")).await.unwrap().remove(0);
        assert_eq!(row.data, json!({ "id": "cl_1", "name": "Smith", "phone": "555" }));
        assert_eq!(row.provenance, Provenance::Confirmed);
        assert_eq!(row.watermark, 1);
    }

    #[tokio::test]
    async fn empty_end_session_confirmation_keeps_client_link() {
        let (cache, store) = make_cache().await;
        let session = json!({ "id": "se_1", "client_id": "cl_1", "started_at": 10 });
        cache
            .apply_authoritative(EntityKind::Session, "se_1", &session, 0)
            .await
            .unwrap();
        cache
            .set_active_session(&session, Provenance::Confirmed, 0)
            .await
            .unwrap();
        let end = action(2, ActionKind::EndSession, json!({ "id": "se_1", "ended_at": 20 }));
        cache.project_action(&end).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        project_confirmation(&mut tx, &end, Some("se_1"), &end.payload, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let rows = cache
            .read(EntityKind::Session, CacheQuery::ByClient("cl_1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].data,
            json!({ "id": "se_1", "client_id": "cl_1", "started_at": 10, "ended_at": 20 })
        );
        assert_eq!(rows[0].provenance, Provenance::Confirmed);
        assert!(cache.active_session().await.unwrap().is_none());
    }
}
