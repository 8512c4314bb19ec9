//! End-to-end tests for the active-record layer: registry resolution,
//! scoped session multiplexing, flush timing, and error translation,
//! all against the in-memory engine.

use std::sync::Arc;

use activerec::{
    ActiveRecord, ActiveRecordConfig, ActiveRecordError, ConfigurationDef, Criteria,
    EntityBinding, EntityRegistry, FlushPolicy, ListenerKind, MemoryConfiguration, MemoryStore,
    Record, RecordListener, RecordOperations, Value,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Person {
    id: i64,
    name: String,
}

impl Record for Person {
    type Key = i64;

    fn entity_name() -> &'static str {
        "person"
    }

    fn primary_key(&self) -> Option<i64> {
        Some(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Invoice {
    id: i64,
    total: i64,
}

impl Record for Invoice {
    type Key = i64;

    fn entity_name() -> &'static str {
        "invoice"
    }

    fn primary_key(&self) -> Option<i64> {
        Some(self.id)
    }
}

/// A type persisted through a mapped base entity's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Employee {
    id: i64,
    name: String,
}

impl Record for Employee {
    type Key = i64;

    fn entity_name() -> &'static str {
        "employee"
    }

    fn ancestors() -> &'static [&'static str] {
        &["person"]
    }

    fn primary_key(&self) -> Option<i64> {
        Some(self.id)
    }
}

fn person(id: i64, name: &str) -> Person {
    Person {
        id,
        name: name.to_string(),
    }
}

/// Runtime with one "people" configuration, plus the store behind it
fn people_runtime() -> (ActiveRecord, Arc<MemoryStore>) {
    let config = MemoryConfiguration::new("people")
        .with_source("people-entities")
        .with_entity(EntityBinding::new("person"));
    let store = config.store();
    let registry = Arc::new(EntityRegistry::new());
    registry.register(Arc::new(config)).unwrap();
    (ActiveRecord::with_registry(registry), store)
}

#[tokio::test]
async fn two_configurations_two_stores_end_to_end() {
    let people = MemoryConfiguration::new("people")
        .with_source("people-entities")
        .with_entity(EntityBinding::new("person"));
    let billing = MemoryConfiguration::new("billing")
        .with_source("billing-entities")
        .with_entity(EntityBinding::new("invoice"));
    let people_store = people.store();
    let billing_store = billing.store();

    let registry = Arc::new(EntityRegistry::new());
    registry.register(Arc::new(people)).unwrap();
    registry.register(Arc::new(billing)).unwrap();
    let ar = ActiveRecord::with_registry(registry);

    let guard = ar.begin_scope_with(FlushPolicy::Leave);

    assert!(Person::find_all(&ar, Criteria::new()).await.unwrap().is_empty());
    assert!(Invoice::find_all(&ar, Criteria::new()).await.unwrap().is_empty());

    person(1, "kate").save(&ar).await.unwrap();
    Invoice { id: 10, total: 250 }.save(&ar).await.unwrap();

    let people_found = Person::find_all(&ar, Criteria::new()).await.unwrap();
    let invoices_found = Invoice::find_all(&ar, Criteria::new()).await.unwrap();
    assert_eq!(people_found.len(), 1);
    assert_eq!(invoices_found.len(), 1);

    // The two entities run over different factories, hence different
    // sessions with distinct connection identity
    let person_session = ar.session("person").await.unwrap();
    let invoice_session = ar.session("invoice").await.unwrap();
    assert!(!person_session.same_session(&invoice_session));
    assert_ne!(person_session.connection_id(), invoice_session.connection_id());

    // Nothing hit backing storage yet under the leave policy
    assert!(people_store.is_empty("person"));
    assert!(billing_store.is_empty("invoice"));

    guard.complete().await.unwrap();
    assert_eq!(people_store.len("person"), 1);
    assert_eq!(billing_store.len("invoice"), 1);
}

#[tokio::test]
async fn peek_returns_none_where_find_fails() {
    let (ar, _store) = people_runtime();

    assert!(Person::peek(&ar, 404).await.unwrap().is_none());

    let err = Person::find(&ar, 404).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("person"));
}

#[tokio::test]
async fn scope_reuses_one_session_per_factory() {
    let (ar, _store) = people_runtime();
    let guard = ar.begin_scope_with(FlushPolicy::Leave);

    let first = ar.session("person").await.unwrap();
    let second = ar.session("person").await.unwrap();
    assert!(first.same_session(&second));

    // A nested scope adopts the ancestor's session instead of opening a
    // second connection
    let inner = ar.begin_scope_with(FlushPolicy::Leave);
    let nested = ar.session("person").await.unwrap();
    assert!(nested.same_session(&first));
    assert!(inner.scope().opened_sessions().is_empty());

    inner.complete().await.unwrap();
    // The outer scope's session survived the inner disposal
    assert!(ar.session("person").await.unwrap().same_session(&first));
    guard.complete().await.unwrap();
}

#[tokio::test]
async fn leave_policy_defers_flush_to_disposal() {
    let (ar, store) = people_runtime();
    let guard = ar.begin_scope_with(FlushPolicy::Leave);

    person(1, "kate").save(&ar).await.unwrap();
    assert!(store.is_empty("person"));

    guard.complete().await.unwrap();
    assert_eq!(store.len("person"), 1);
}

#[tokio::test]
async fn auto_policy_flushes_after_each_operation() {
    let (ar, store) = people_runtime();
    let guard = ar.begin_scope_with(FlushPolicy::Auto);

    person(1, "kate").save(&ar).await.unwrap();
    assert_eq!(store.len("person"), 1);

    person(2, "anna").save(&ar).await.unwrap();
    assert_eq!(store.len("person"), 2);

    guard.complete().await.unwrap();
}

#[tokio::test]
async fn standalone_operations_flush_immediately() {
    let (ar, store) = people_runtime();

    person(1, "kate").save(&ar).await.unwrap();
    assert_eq!(store.len("person"), 1);

    let found = Person::find(&ar, 1).await.unwrap();
    assert_eq!(found.name, "kate");
}

#[tokio::test]
async fn failed_session_is_cleared_not_flushed() {
    let (ar, store) = people_runtime();
    let guard = ar.begin_scope_with(FlushPolicy::Leave);

    person(1, "kate").save(&ar).await.unwrap();
    let session = ar.session("person").await.unwrap();
    ar.fail(&session).await.unwrap();

    guard.complete().await.unwrap();
    assert!(store.is_empty("person"));
}

#[tokio::test]
async fn engine_missing_row_translates_to_not_found() {
    let (ar, _store) = people_runtime();

    // update on a record that was never persisted: the engine reports a
    // missing row, surfaced as the layer's NotFound
    let err = person(9, "ghost").update(&ar).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn arbitrary_failures_wrap_as_operation_errors() {
    let (ar, _store) = people_runtime();

    let err = ar
        .execute("person", |_session| async move {
            Err::<(), _>(anyhow::anyhow!("business rule violated"))
        })
        .await
        .unwrap_err();
    match err {
        ActiveRecordError::Operation { entity, .. } => assert_eq!(entity, "person"),
        other => panic!("expected Operation, got {other:?}"),
    }
}

#[tokio::test]
async fn find_one_rejects_ambiguous_matches() {
    let (ar, _store) = people_runtime();

    person(1, "kate").save(&ar).await.unwrap();
    person(2, "kate").save(&ar).await.unwrap();
    person(3, "anna").save(&ar).await.unwrap();

    let one = Person::find_one(&ar, Criteria::new().eq("name", "anna"))
        .await
        .unwrap();
    assert_eq!(one.unwrap().id, 3);

    let none = Person::find_one(&ar, Criteria::new().eq("name", "nobody"))
        .await
        .unwrap();
    assert!(none.is_none());

    let err = Person::find_one(&ar, Criteria::new().eq("name", "kate"))
        .await
        .unwrap_err();
    assert!(matches!(err, ActiveRecordError::AmbiguousResult { .. }));
}

#[tokio::test]
async fn queries_count_slice_and_delete() {
    let (ar, store) = people_runtime();

    for id in 1..=5 {
        person(id, if id % 2 == 0 { "even" } else { "odd" })
            .save(&ar)
            .await
            .unwrap();
    }

    let count = Person::count(&ar, Criteria::new().eq("name", "odd"))
        .await
        .unwrap();
    assert_eq!(count, 3);

    let window: Vec<Person> =
        Person::sliced_find_all(&ar, 1, 2, Criteria::new().order_by("id"))
            .await
            .unwrap();
    assert_eq!(window.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2, 3]);

    let first = Person::find_first(&ar, Criteria::new().order_by_desc("id"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, 5);

    let removed = Person::delete_all(&ar, Criteria::new().eq("name", "even"))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.len("person"), 3);
}

#[tokio::test]
async fn refresh_and_replicate_round_trip() {
    let (ar, _store) = people_runtime();

    person(1, "kate").save(&ar).await.unwrap();

    // Replicate an out-of-band copy over the stored row
    person(1, "katherine").replicate(&ar).await.unwrap();

    let mut local = person(1, "stale");
    local.refresh(&ar).await.unwrap();
    assert_eq!(local.name, "katherine");
}

#[tokio::test]
async fn ancestor_lineage_resolves_through_base_entity() {
    let (ar, store) = people_runtime();

    Employee {
        id: 7,
        name: "kate".to_string(),
    }
    .save(&ar)
    .await
    .unwrap();
    assert_eq!(store.len("person"), 1);

    let found = Employee::find(&ar, 7).await.unwrap();
    assert_eq!(found.name, "kate");
}

#[tokio::test]
async fn stateless_execution_bypasses_scope_sessions() {
    let (ar, store) = people_runtime();
    let guard = ar.begin_scope_with(FlushPolicy::Leave);

    ar.execute_stateless("person", |session| async move {
        let mut fields = activerec::FieldMap::new();
        fields.insert("id".to_string(), Value::Int(1));
        fields.insert("name".to_string(), Value::from("kate"));
        session.insert("person", fields).await?;
        Ok(())
    })
    .await
    .unwrap();

    // The stateless write hit storage even though a leave-policy scope is
    // active
    assert_eq!(store.len("person"), 1);
    guard.complete().await.unwrap();
}

struct UppercaseNames;

#[async_trait]
impl RecordListener for UppercaseNames {
    async fn before_insert(
        &self,
        _entity: &str,
        fields: &mut activerec::FieldMap,
    ) -> Result<(), activerec::ListenerError> {
        if let Some(Value::Text(name)) = fields.get("name") {
            let upper = name.to_uppercase();
            fields.insert("name".to_string(), Value::Text(upper));
        }
        Ok(())
    }
}

#[tokio::test]
async fn listeners_registered_before_build_are_wired_in() {
    let (ar, _store) = people_runtime();
    ar.register_listener(ListenerKind::Insert, Arc::new(UppercaseNames), "people");

    person(1, "kate").save(&ar).await.unwrap();

    let found = Person::find(&ar, 1).await.unwrap();
    assert_eq!(found.name, "KATE");
}

#[tokio::test]
async fn declarative_config_builds_a_working_runtime() {
    let config = ActiveRecordConfig::new()
        .with_flush_policy(FlushPolicy::Leave)
        .with_configuration(
            ConfigurationDef::new("people")
                .with_source("people-entities")
                .with_entity(EntityBinding::new("person")),
        );
    let ar = ActiveRecord::new(config).unwrap();

    let guard = ar.begin_scope();
    person(1, "kate").save(&ar).await.unwrap();
    guard.complete().await.unwrap();

    assert_eq!(Person::find(&ar, 1).await.unwrap().name, "kate");
}

#[tokio::test]
async fn detached_contexts_do_not_share_scopes() {
    let (ar, store) = people_runtime();
    let background = ar.detached();

    let guard = ar.begin_scope_with(FlushPolicy::Leave);
    person(1, "kate").save(&ar).await.unwrap();

    // The detached context sees no scope, so its write flushes immediately
    person(2, "anna").save(&background).await.unwrap();
    assert_eq!(store.len("person"), 1);

    guard.complete().await.unwrap();
    assert_eq!(store.len("person"), 2);
}
