//! Idempotent merge-upsert of canonical entities into a document store.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use caliber_core::{AttributeField, CanonicalEntity, EntityKey, PRICE_HISTORY_FIELD};
use caliber_store::{
    classify_store_error, BackoffPolicy, Document, DocumentStore, RetryDisposition, StoreError,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entity has no derivable key (brand {brand:?}, reference {reference:?})")]
    Unkeyed { brand: String, reference: String },
    #[error("reconcile task aborted: {0}")]
    Task(String),
}

impl ReconcileError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ReconcileError::Store(err) => classify_store_error(err),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated {
        appended: usize,
        hydrated: Vec<AttributeField>,
    },
    Unchanged,
}

/// A per-entity failure, carrying the payload that could not be written.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationError {
    pub key: EntityKey,
    pub entity: CanonicalEntity,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub run_id: Uuid,
    pub error_count: usize,
    pub errors: Vec<ReconciliationError>,
}

/// Collects every reconciliation failure of a run, unfiltered.
#[derive(Debug, Default, Clone)]
pub struct ErrorSink {
    errors: Vec<ReconciliationError>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: EntityKey, entity: CanonicalEntity, error: impl ToString) {
        let error = error.to_string();
        error!(%key, %error, "reconciliation failed");
        self.errors.push(ReconciliationError { key, entity, error });
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ReconciliationError] {
        &self.errors
    }

    pub fn into_report(self, run_id: Uuid) -> ErrorReport {
        ErrorReport {
            run_id,
            error_count: self.errors.len(),
            errors: self.errors,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub appended_prices: usize,
    pub hydrated_fields: usize,
    pub errors: ErrorSink,
}

impl ReconcileReport {
    fn record_outcome(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Created => self.created += 1,
            ReconcileOutcome::Updated { appended, hydrated } => {
                self.updated += 1;
                self.appended_prices += appended;
                self.hydrated_fields += hydrated.len();
            }
            ReconcileOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

/// Writes canonical entities through a [`DocumentStore`] without ever rewriting remote history
/// or overwriting a remote non-null field.
pub struct UpsertReconciler<S> {
    store: Arc<S>,
    backoff: BackoffPolicy,
    call_timeout: Duration,
}

impl<S> Clone for UpsertReconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            backoff: self.backoff,
            call_timeout: self.call_timeout,
        }
    }
}

fn remote_price_history<'a>(id: &str, document: &'a Document) -> Result<&'a [JsonValue], StoreError> {
    match document.get(PRICE_HISTORY_FIELD) {
        None | Some(JsonValue::Null) => Ok(&[]),
        Some(JsonValue::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(StoreError::Malformed {
            id: id.to_string(),
            reason: format!("`{PRICE_HISTORY_FIELD}` is not an array"),
        }),
    }
}

impl<S: DocumentStore + 'static> UpsertReconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            backoff: BackoffPolicy::default(),
            call_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!("store call timed out after {:?}", self.call_timeout))
            })?
    }

    /// One read-then-write pass for `entity`. Safe to repeat.
    pub async fn reconcile(&self, entity: &CanonicalEntity) -> Result<ReconcileOutcome, ReconcileError> {
        let key = entity.key().ok_or_else(|| ReconcileError::Unkeyed {
            brand: entity.brand.clone(),
            reference: entity.reference.clone(),
        })?;
        let id = key.as_str();

        let Some(remote) = self.call(self.store.get(id)).await? else {
            let document = entity.to_document().map_err(StoreError::from)?;
            self.call(self.store.set(id, document)).await?;
            debug!(%key, prices = entity.price_history.len(), "created document");
            return Ok(ReconcileOutcome::Created);
        };

        let remote_history = remote_price_history(id, &remote)?;
        let mut novel = Vec::new();
        for price in &entity.price_history {
            let value = price.to_json().map_err(StoreError::from)?;
            if !remote_history.contains(&value) && !novel.contains(&value) {
                novel.push(value);
            }
        }
        let appended = if novel.is_empty() {
            0
        } else {
            self.call(self.store.array_union(id, PRICE_HISTORY_FIELD, novel))
                .await?
        };

        let mut patch = Document::new();
        let mut hydrated = Vec::new();
        for field in AttributeField::ALL {
            let Some(local) = entity.attributes.get(field) else {
                continue;
            };
            match remote.get(field.as_str()) {
                None | Some(JsonValue::Null) => {
                    patch.insert(field.as_str().to_string(), JsonValue::String(local.to_string()));
                    hydrated.push(field);
                }
                Some(JsonValue::String(existing)) if existing != local => {
                    debug!(%key, field = field.as_str(), remote = %existing, local = %local, "keeping remote value");
                }
                Some(_) => {}
            }
        }
        if !patch.is_empty() {
            self.call(self.store.update(id, patch)).await?;
            debug!(%key, fields = ?hydrated, "hydrated null fields");
        }

        if appended == 0 && hydrated.is_empty() {
            Ok(ReconcileOutcome::Unchanged)
        } else {
            Ok(ReconcileOutcome::Updated { appended, hydrated })
        }
    }

    /// [`Self::reconcile`], retried with backoff while the failure is transient.
    pub async fn reconcile_with_retry(
        &self,
        entity: &CanonicalEntity,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut attempt = 0;
        loop {
            match self.reconcile(entity).await {
                Ok(outcome) => return Ok(outcome),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, %err, "transient store failure; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reconcile every entity on a bounded worker pool. Each entity ends up either counted as a
    /// success or recorded in the report's [`ErrorSink`].
    pub async fn reconcile_all(
        &self,
        entities: BTreeMap<EntityKey, CanonicalEntity>,
        concurrency: usize,
    ) -> ReconcileReport {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, (EntityKey, Arc<CanonicalEntity>)> =
            HashMap::new();
        let mut report = ReconcileReport::default();

        for (key, entity) in entities {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    report
                        .errors
                        .record(key, entity, ReconcileError::Task(err.to_string()));
                    continue;
                }
            };
            let entity = Arc::new(entity);
            let task_entity = Arc::clone(&entity);
            let reconciler = self.clone();
            let span = info_span!("reconcile", key = %key);
            let handle = tasks.spawn(
                async move {
                    let _permit = permit;
                    reconciler.reconcile_with_retry(&task_entity).await
                }
                .instrument(span),
            );
            in_flight.insert(handle.id(), (key, entity));
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(join_err) => (join_err.id(), Err(ReconcileError::Task(join_err.to_string()))),
            };
            let Some((key, entity)) = in_flight.remove(&id) else {
                error!(task = %id, "finished task has no registered entity");
                continue;
            };
            match result {
                Ok(outcome) => report.record_outcome(&outcome),
                Err(err) => report.errors.record(key, entity.as_ref().clone(), err),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use caliber_core::{Attributes, PriceObservation};
    use caliber_store::MemoryStore;
    use chrono::NaiveDate;
    use serde_json::json;
    use tokio::sync::Mutex;

    fn price(amount: i64, day: u32) -> PriceObservation {
        PriceObservation::new(amount, NaiveDate::from_ymd_opt(2024, 1, day))
    }

    fn entity(brand: &str, reference: &str, attributes: Attributes, prices: &[PriceObservation]) -> CanonicalEntity {
        let mut entity = CanonicalEntity::new(brand, reference, attributes);
        for p in prices {
            entity.record_price(p.clone());
        }
        entity
    }

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn no_wait() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Memory store with scripted failures per document id.
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        transient: Mutex<HashMap<String, usize>>,
        broken: HashSet<String>,
        stalled: HashSet<String>,
        rejected_updates: Mutex<HashSet<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedStore {
        async fn check(&self, id: &str) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stalled.contains(id) {
                std::future::pending::<()>().await;
            }
            if self.broken.contains(id) {
                return Err(StoreError::Rejected {
                    id: id.to_string(),
                    reason: "permission denied".to_string(),
                });
            }
            let mut transient = self.transient.lock().await;
            if let Some(remaining) = transient.get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Unavailable("connection reset".to_string()));
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DocumentStore for ScriptedStore {
        async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
            self.check(id).await?;
            self.inner.get(id).await
        }

        async fn set(&self, id: &str, document: Document) -> Result<(), StoreError> {
            self.check(id).await?;
            self.inner.set(id, document).await
        }

        async fn update(&self, id: &str, fields: Document) -> Result<(), StoreError> {
            self.check(id).await?;
            if self.rejected_updates.lock().await.contains(id) {
                return Err(StoreError::Rejected {
                    id: id.to_string(),
                    reason: "update refused".to_string(),
                });
            }
            self.inner.update(id, fields).await
        }

        async fn array_union(
            &self,
            id: &str,
            field: &str,
            elements: Vec<JsonValue>,
        ) -> Result<usize, StoreError> {
            self.check(id).await?;
            self.inner.array_union(id, field, elements).await
        }
    }

    #[tokio::test]
    async fn absent_document_is_created_in_full() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = UpsertReconciler::new(Arc::clone(&store));
        let attrs = Attributes {
            case_size: Some("40mm".into()),
            ..Attributes::default()
        };
        let local = entity("Rolex", "116610", attrs, &[price(850_000, 1), price(850_000, 2)]);

        let outcome = reconciler.reconcile(&local).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Created);
        let stored = store.get("rolex116610").await.unwrap().unwrap();
        assert_eq!(stored, local.to_document().unwrap());
    }

    #[tokio::test]
    async fn existing_document_gets_union_append_and_hydration_only() {
        let store = Arc::new(MemoryStore::new());
        let remote_first = price(800_000, 1).to_json().unwrap();
        store
            .set(
                "rolex116610",
                doc(json!({
                    "brand": "ROLEX",
                    "reference": "116610",
                    "case_size": "40mm",
                    "movement": null,
                    "legacy_note": "kept",
                    "price_history": [remote_first, {"price": 1, "shape": "older"}],
                })),
            )
            .await
            .unwrap();

        let attrs = Attributes {
            case_size: Some("41mm".into()),
            movement: Some("Automatic".into()),
            caliber: Some("3135".into()),
            ..Attributes::default()
        };
        let local = entity("Rolex", "116610", attrs, &[price(800_000, 1), price(850_000, 2)]);
        let reconciler = UpsertReconciler::new(Arc::clone(&store));

        let outcome = reconciler.reconcile(&local).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                appended: 1,
                hydrated: vec![AttributeField::Movement, AttributeField::Caliber],
            }
        );

        let stored = store.get("rolex116610").await.unwrap().unwrap();
        assert_eq!(stored["brand"], json!("ROLEX"));
        assert_eq!(stored["case_size"], json!("40mm"));
        assert_eq!(stored["movement"], json!("Automatic"));
        assert_eq!(stored["caliber"], json!("3135"));
        assert_eq!(stored["legacy_note"], json!("kept"));
        assert_eq!(
            stored["price_history"],
            json!([
                price(800_000, 1).to_json().unwrap(),
                {"price": 1, "shape": "older"},
                price(850_000, 2).to_json().unwrap(),
            ])
        );
    }

    #[tokio::test]
    async fn reconciling_twice_equals_reconciling_once() {
        let initial = doc(json!({
            "brand": "Omega",
            "reference": "311.30",
            "nickname": null,
            "price_history": [price(500_000, 3).to_json().unwrap()],
        }));
        let attrs = Attributes {
            nickname: Some("Moonwatch".into()),
            ..Attributes::default()
        };
        let local = entity("Omega", "311.30", attrs, &[price(500_000, 3), price(510_000, 4)]);

        let once = Arc::new(MemoryStore::new());
        once.set("omega311.30", initial.clone()).await.unwrap();
        UpsertReconciler::new(Arc::clone(&once))
            .reconcile(&local)
            .await
            .unwrap();

        let twice = Arc::new(MemoryStore::new());
        twice.set("omega311.30", initial).await.unwrap();
        let reconciler = UpsertReconciler::new(Arc::clone(&twice));
        reconciler.reconcile(&local).await.unwrap();
        let second = reconciler.reconcile(&local).await.unwrap();

        assert_eq!(second, ReconcileOutcome::Unchanged);
        assert_eq!(once.snapshot().await, twice.snapshot().await);
    }

    #[tokio::test]
    async fn rerun_against_identical_remote_appends_nothing_and_reports_no_errors() {
        let store = Arc::new(MemoryStore::new());
        let local = entity("Tudor", "79230R", Attributes::default(), &[price(300_000, 5)]);
        store
            .set("tudor79230r", local.to_document().unwrap())
            .await
            .unwrap();

        let reconciler = UpsertReconciler::new(Arc::clone(&store));
        let report = reconciler
            .reconcile_all(BTreeMap::from([(local.key().unwrap(), local.clone())]), 4)
            .await;

        assert_eq!(report.unchanged, 1);
        assert_eq!(report.appended_prices, 0);
        assert!(report.errors.is_empty());
        let stored = store.get("tudor79230r").await.unwrap().unwrap();
        assert_eq!(stored["price_history"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rerun_after_a_failed_hydration_completes_the_entity() {
        let initial = doc(json!({
            "brand": "Omega",
            "reference": "311.30",
            "movement": null,
            "price_history": [price(500_000, 3).to_json().unwrap()],
        }));
        let attrs = Attributes {
            movement: Some("Manual".into()),
            ..Attributes::default()
        };
        let local = entity("Omega", "311.30", attrs, &[price(500_000, 3), price(510_000, 4)]);

        let clean = Arc::new(MemoryStore::new());
        clean.set("omega311.30", initial.clone()).await.unwrap();
        UpsertReconciler::new(Arc::clone(&clean))
            .reconcile(&local)
            .await
            .unwrap();

        let store = Arc::new(ScriptedStore::default());
        store.inner.set("omega311.30", initial).await.unwrap();
        store
            .rejected_updates
            .lock()
            .await
            .insert("omega311.30".to_string());
        let reconciler = UpsertReconciler::new(Arc::clone(&store)).with_backoff(no_wait());

        let err = reconciler.reconcile_with_retry(&local).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Store(StoreError::Rejected { .. })));
        let partial = store.inner.get("omega311.30").await.unwrap().unwrap();
        assert_eq!(partial["price_history"].as_array().unwrap().len(), 2);
        assert_eq!(partial["movement"], JsonValue::Null);

        store.rejected_updates.lock().await.clear();
        let outcome = reconciler.reconcile(&local).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                appended: 0,
                hydrated: vec![AttributeField::Movement],
            }
        );
        assert_eq!(store.inner.snapshot().await, clean.snapshot().await);
    }

    #[tokio::test]
    async fn malformed_remote_history_is_an_error_and_not_retried() {
        let store = Arc::new(ScriptedStore::default());
        store
            .inner
            .set("iwciw3716", doc(json!({"price_history": {"not": "an array"}})))
            .await
            .unwrap();
        let reconciler = UpsertReconciler::new(Arc::clone(&store)).with_backoff(no_wait());
        let local = entity("IWC", "IW3716", Attributes::default(), &[price(700_000, 1)]);

        let err = reconciler.reconcile_with_retry(&local).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Store(StoreError::Malformed { .. })));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let store = Arc::new(ScriptedStore::default());
        store
            .transient
            .lock()
            .await
            .insert("seikosbga211".to_string(), 2);
        let reconciler = UpsertReconciler::new(Arc::clone(&store)).with_backoff(no_wait());
        let local = entity("Seiko", "SBGA211", Attributes::default(), &[price(580_000, 1)]);

        let outcome = reconciler.reconcile_with_retry(&local).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        assert!(store.inner.get("seikosbga211").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn one_failing_entity_does_not_stop_the_batch() {
        let mut scripted = ScriptedStore::default();
        scripted.broken.insert("cartierwssa0018".to_string());
        let store = Arc::new(scripted);
        let reconciler = UpsertReconciler::new(Arc::clone(&store)).with_backoff(no_wait());

        let entities: BTreeMap<_, _> = [
            entity("Cartier", "WSSA0018", Attributes::default(), &[price(600_000, 1)]),
            entity("Rolex", "116610", Attributes::default(), &[price(850_000, 1)]),
            entity("Omega", "311.30", Attributes::default(), &[price(500_000, 1)]),
        ]
        .into_iter()
        .map(|e| (e.key().unwrap(), e))
        .collect();

        let report = reconciler.reconcile_all(entities, 2).await;

        assert_eq!(report.created, 2);
        assert_eq!(report.errors.len(), 1);
        let failure = &report.errors.errors()[0];
        assert_eq!(failure.key.as_str(), "cartierwssa0018");
        assert_eq!(failure.entity.brand, "Cartier");
        assert!(failure.error.contains("permission denied"));
        assert_eq!(store.inner.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_entity_times_out_without_blocking_others() {
        let mut scripted = ScriptedStore::default();
        scripted.stalled.insert("zenith03.2040".to_string());
        let store = Arc::new(scripted);
        let reconciler = UpsertReconciler::new(Arc::clone(&store))
            .with_backoff(BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            })
            .with_call_timeout(Duration::from_millis(50));

        let entities: BTreeMap<_, _> = [
            entity("Zenith", "03.2040", Attributes::default(), &[price(900_000, 1)]),
            entity("Rolex", "116610", Attributes::default(), &[price(850_000, 1)]),
        ]
        .into_iter()
        .map(|e| (e.key().unwrap(), e))
        .collect();

        let report = reconciler.reconcile_all(entities, 1).await;

        assert_eq!(report.created, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors.errors()[0].key.as_str(), "zenith03.2040");
        assert!(report.errors.errors()[0].error.contains("timed out"));
    }

    #[test]
    fn error_sink_keeps_every_error_in_order() {
        let mut sink = ErrorSink::new();
        let local = entity("Rolex", "116610", Attributes::default(), &[]);
        sink.record(local.key().unwrap(), local.clone(), "first");
        sink.record(local.key().unwrap(), local.clone(), "first");
        sink.record(local.key().unwrap(), local, "second");

        let run_id = Uuid::new_v4();
        let report = sink.into_report(run_id);
        assert_eq!(report.error_count, 3);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["errors"][0]["key"], json!("rolex116610"));
        assert_eq!(value["errors"][2]["error"], json!("second"));
        assert_eq!(value["errors"][0]["entity"]["brand"], json!("Rolex"));
    }
}
