//! Record Trait System
//!
//! The `Record` trait ties an application type to a mapped entity; the
//! `RecordOperations` extension supplies the generic CRUD and query
//! surface. Every operation takes the `ActiveRecord` handle explicitly,
//! resolves the entity's session factory through the registry, and funnels
//! session acquisition through the holder, so the same call works inside
//! and outside a session scope.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::criteria::Criteria;
use crate::engine::core::{FieldMap, Value};
use crate::error::{ActiveRecordError, RecordResult};
use crate::runtime::ActiveRecord;

/// A persistent application type mapped to an entity
pub trait Record: Sized + Send + Sync + Serialize + for<'de> Deserialize<'de> {
    /// The type of this record's primary key
    type Key: Clone + Display + Into<Value> + Send + Sync;

    /// Entity name this type is mapped under
    fn entity_name() -> &'static str;

    /// Mapped base entities, nearest first, for types persisted through a
    /// base entity's configuration
    fn ancestors() -> &'static [&'static str] {
        &[]
    }

    /// Primary key field name inside the record
    fn key_name() -> &'static str {
        "id"
    }

    /// The primary key value, if set
    fn primary_key(&self) -> Option<Self::Key>;

    /// Entity name followed by ancestors, the registry lookup order
    fn lineage() -> Vec<&'static str>
    where
        Self: Sized,
    {
        let mut names = vec![Self::entity_name()];
        names.extend_from_slice(Self::ancestors());
        names
    }

    /// Convert this record into engine fields
    fn to_fields(&self) -> RecordResult<FieldMap> {
        let json = serde_json::to_value(self)
            .map_err(|e| ActiveRecordError::Serialization(e.to_string()))?;
        match json {
            serde_json::Value::Object(map) => Ok(map
                .into_iter()
                .map(|(name, value)| (name, Value::from_json(value)))
                .collect()),
            _ => Err(ActiveRecordError::Serialization(format!(
                "record of '{}' does not serialize to an object",
                Self::entity_name()
            ))),
        }
    }

    /// Build a record from engine fields
    fn from_fields(fields: &FieldMap) -> RecordResult<Self>
    where
        Self: Sized,
    {
        let map: serde_json::Map<String, serde_json::Value> = fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| ActiveRecordError::Serialization(e.to_string()))
    }

    /// The primary key as an engine value, failing when unset
    fn key_value(&self) -> RecordResult<Value> {
        self.primary_key()
            .map(Into::into)
            .ok_or_else(|| ActiveRecordError::MissingKey {
                entity: Self::entity_name().to_string(),
            })
    }
}

/// The mapped entity name operations address for `T`: its own entity when
/// a configuration maps it, otherwise the nearest mapped ancestor
fn storage_entity<T: Record>(ar: &ActiveRecord) -> RecordResult<String> {
    ar.registry().storage_entity(&T::lineage())
}

fn rows_into_records<T: Record>(rows: Vec<FieldMap>) -> RecordResult<Vec<T>> {
    rows.iter().map(|fields| T::from_fields(fields)).collect()
}

/// Generic CRUD and query operations for records
pub trait RecordOperations: Record {
    /// Load by primary key, failing with the missing-record error when the
    /// id does not exist
    async fn find(ar: &ActiveRecord, id: Self::Key) -> RecordResult<Self>
    where
        Self: Sized,
    {
        let display = id.to_string();
        match Self::peek(ar, id).await? {
            Some(record) => Ok(record),
            None => Err(ActiveRecordError::NotFound {
                entity: Self::entity_name().to_string(),
                id: display,
            }),
        }
    }

    /// Load by primary key, returning `None` when the id does not exist
    async fn peek(ar: &ActiveRecord, id: Self::Key) -> RecordResult<Option<Self>>
    where
        Self: Sized,
    {
        let entity = storage_entity::<Self>(ar)?;
        let found = ar
            .holder()
            .execute(ar.scopes(), &Self::lineage(), move |session| async move {
                let id = id.into();
                Ok(session.get(&entity, &id).await?)
            })
            .await?;
        found.map(|fields| Self::from_fields(&fields)).transpose()
    }

    /// True when a record with this primary key exists
    async fn exists(ar: &ActiveRecord, id: Self::Key) -> RecordResult<bool>
    where
        Self: Sized,
    {
        let entity = storage_entity::<Self>(ar)?;
        ar.holder()
            .execute(ar.scopes(), &Self::lineage(), move |session| async move {
                let id = id.into();
                Ok(session.get(&entity, &id).await?.is_some())
            })
            .await
    }

    /// Count records matching the criteria
    async fn count(ar: &ActiveRecord, criteria: Criteria) -> RecordResult<u64>
    where
        Self: Sized,
    {
        let entity = storage_entity::<Self>(ar)?;
        ar.holder()
            .execute(ar.scopes(), &Self::lineage(), move |session| async move {
                Ok(session.count(&entity, &criteria).await?)
            })
            .await
    }

    /// Fetch every record matching the criteria
    async fn find_all(ar: &ActiveRecord, criteria: Criteria) -> RecordResult<Vec<Self>>
    where
        Self: Sized,
    {
        let entity = storage_entity::<Self>(ar)?;
        let rows = ar
            .holder()
            .execute(ar.scopes(), &Self::lineage(), move |session| async move {
                Ok(session.find_all(&entity, &criteria).await?)
            })
            .await?;
        rows_into_records(rows)
    }

    /// Fetch a window of matching records
    async fn sliced_find_all(
        ar: &ActiveRecord,
        first_result: usize,
        max_results: usize,
        criteria: Criteria,
    ) -> RecordResult<Vec<Self>>
    where
        Self: Sized,
    {
        Self::find_all(ar, criteria.skip(first_result).take(max_results)).await
    }

    /// The first matching record, if any
    async fn find_first(ar: &ActiveRecord, criteria: Criteria) -> RecordResult<Option<Self>>
    where
        Self: Sized,
    {
        let mut records = Self::find_all(ar, criteria.take(1)).await?;
        Ok(records.pop())
    }

    /// The single matching record, `None` when nothing matches, and an
    /// ambiguity error when more than one row does
    async fn find_one(ar: &ActiveRecord, criteria: Criteria) -> RecordResult<Option<Self>>
    where
        Self: Sized,
    {
        // Two rows are enough to prove ambiguity; no count query needed
        let mut records = Self::find_all(ar, criteria.take(2)).await?;
        if records.len() > 1 {
            return Err(ActiveRecordError::AmbiguousResult {
                entity: Self::entity_name().to_string(),
            });
        }
        Ok(records.pop())
    }

    /// Insert or update this record, keyed by its primary key
    async fn save(&self, ar: &ActiveRecord) -> RecordResult<()> {
        self.write_with(ar, WriteMode::Merge, false).await
    }

    /// Save and flush the session immediately
    async fn save_and_flush(&self, ar: &ActiveRecord) -> RecordResult<()> {
        self.write_with(ar, WriteMode::Merge, true).await
    }

    /// Insert this record; fails when the key already exists
    async fn create(&self, ar: &ActiveRecord) -> RecordResult<()> {
        self.write_with(ar, WriteMode::Insert, false).await
    }

    /// Create and flush the session immediately
    async fn create_and_flush(&self, ar: &ActiveRecord) -> RecordResult<()> {
        self.write_with(ar, WriteMode::Insert, true).await
    }

    /// Update this record; fails with the missing-record error when it was
    /// never persisted
    async fn update(&self, ar: &ActiveRecord) -> RecordResult<()> {
        self.write_with(ar, WriteMode::Update, false).await
    }

    /// Update and flush the session immediately
    async fn update_and_flush(&self, ar: &ActiveRecord) -> RecordResult<()> {
        self.write_with(ar, WriteMode::Update, true).await
    }

    /// Merge this record's state into the session
    async fn merge(&self, ar: &ActiveRecord) -> RecordResult<()> {
        self.write_with(ar, WriteMode::Merge, false).await
    }

    /// Write this record as-is, id included, overwriting an existing row
    async fn replicate(&self, ar: &ActiveRecord) -> RecordResult<()> {
        self.write_with(ar, WriteMode::Replicate, false).await
    }

    #[doc(hidden)]
    async fn write_with(&self, ar: &ActiveRecord, mode: WriteMode, flush: bool) -> RecordResult<()> {
        let fields = self.to_fields()?;
        let entity = storage_entity::<Self>(ar)?;
        ar.holder()
            .execute(ar.scopes(), &Self::lineage(), move |session| async move {
                match mode {
                    WriteMode::Insert => session.insert(&entity, fields).await?,
                    WriteMode::Update => session.update(&entity, fields).await?,
                    WriteMode::Merge => session.merge(&entity, fields).await?,
                    WriteMode::Replicate => session.replicate(&entity, fields).await?,
                }
                if flush {
                    session.flush().await?;
                }
                Ok(())
            })
            .await
    }

    /// Delete this record by primary key
    async fn delete(self, ar: &ActiveRecord) -> RecordResult<()>
    where
        Self: Sized,
    {
        Self::delete_by_key(ar, self.key_value()?, false).await
    }

    /// Delete and flush the session immediately
    async fn delete_and_flush(self, ar: &ActiveRecord) -> RecordResult<()>
    where
        Self: Sized,
    {
        Self::delete_by_key(ar, self.key_value()?, true).await
    }

    #[doc(hidden)]
    async fn delete_by_key(ar: &ActiveRecord, id: Value, flush: bool) -> RecordResult<()>
    where
        Self: Sized,
    {
        let entity = storage_entity::<Self>(ar)?;
        ar.holder()
            .execute(ar.scopes(), &Self::lineage(), move |session| async move {
                session.delete(&entity, &id).await?;
                if flush {
                    session.flush().await?;
                }
                Ok(())
            })
            .await
    }

    /// Delete every record matching the criteria, returning how many went
    async fn delete_all(ar: &ActiveRecord, criteria: Criteria) -> RecordResult<u64>
    where
        Self: Sized,
    {
        let entity = storage_entity::<Self>(ar)?;
        ar.holder()
            .execute(ar.scopes(), &Self::lineage(), move |session| async move {
                Ok(session.delete_all(&entity, &criteria).await?)
            })
            .await
    }

    /// Re-read this record from backing storage, replacing in-memory state
    async fn refresh(&mut self, ar: &ActiveRecord) -> RecordResult<()>
    where
        Self: Sized,
    {
        let id = self.key_value()?;
        let entity = storage_entity::<Self>(ar)?;
        let fields = ar
            .holder()
            .execute(ar.scopes(), &Self::lineage(), move |session| async move {
                Ok(session.refresh(&entity, &id).await?)
            })
            .await?;
        *self = Self::from_fields(&fields)?;
        Ok(())
    }

    /// Drop this record from the session-level cache
    async fn evict(&self, ar: &ActiveRecord) -> RecordResult<()> {
        let id = self.key_value()?;
        let entity = storage_entity::<Self>(ar)?;
        ar.holder()
            .execute(ar.scopes(), &Self::lineage(), move |session| async move {
                Ok(session.evict(&entity, &id).await?)
            })
            .await
    }
}

/// How a write reaches the session
#[doc(hidden)]
#[derive(Debug, Clone, Copy)]
pub enum WriteMode {
    Insert,
    Update,
    Merge,
    Replicate,
}

// Every Record gets the generic operations
impl<T: Record> RecordOperations for T {}
