//! Conversion between typed entities and property bags.
//!
//! The write path is strict: a field that cannot be encoded fails the whole
//! conversion with the entity and field named in the error. The read path
//! follows [`ConversionMode`]. By default a property that cannot be coerced
//! is logged, reported as a [`PropertyIssue`] and left at its default, so
//! one malformed legacy value does not fail the read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    entity::{EntitySchema, FieldRole, TableEntity},
    error::{ConfigError, ConversionError},
    property::PropertyBag,
    service::{DynamicEntity, ETag},
};

/// How the read path treats a property it cannot coerce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    /// Log the failure, leave the field at its default and keep going.
    #[default]
    SkipMalformed,
    /// Fail the read.
    Strict,
}

/// A property skipped while reading.
#[derive(Debug, Clone)]
pub struct PropertyIssue {
    /// The field that kept its default.
    pub field: &'static str,
    /// The storage name it was read from.
    pub storage_name: &'static str,
    /// Why it was skipped.
    pub error: ConversionError,
}

/// A decoded entity together with the properties that had to be skipped.
#[derive(Debug)]
pub struct Converted<T> {
    /// The entity.
    pub entity: T,
    /// Properties left at their default, empty in strict mode.
    pub issues: Vec<PropertyIssue>,
}

/// Converts `T` to and from property bags.
#[derive(Debug)]
pub struct EntityConverter<T> {
    schema: EntitySchema<T>,
    mode: ConversionMode,
}

impl<T: TableEntity> EntityConverter<T> {
    /// Resolves the schema of `T`.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] raised by [`EntitySchema::resolve`].
    pub fn new(mode: ConversionMode) -> Result<Self, ConfigError> {
        Ok(Self { schema: EntitySchema::resolve()?, mode })
    }

    /// The resolved schema.
    #[must_use]
    pub fn schema(&self) -> &EntitySchema<T> {
        &self.schema
    }

    /// The read-path policy.
    #[must_use]
    pub fn mode(&self) -> ConversionMode {
        self.mode
    }

    /// Builds the property bag of `entity`. Key fields and skipped fields
    /// are left out.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::Property`] naming the field that failed.
    pub fn to_bag(&self, entity: &T) -> Result<PropertyBag, ConversionError> {
        let mut bag = PropertyBag::new();
        for field in self.schema.serializable_fields().filter(|f| !f.role.is_key()) {
            let property = (field.encode)(entity)
                .map_err(|e| e.in_property(self.schema.entity_name(), field.name))?;
            bag.insert(field.storage_name.to_owned(), property);
        }
        Ok(bag)
    }

    /// Builds the full row for `entity`, carrying its version token when it
    /// has a metadata slot.
    ///
    /// # Errors
    ///
    /// As [`to_bag`](Self::to_bag).
    pub fn to_dynamic(
        &self,
        entity: &T,
        partition_key: String,
        row_key: String,
    ) -> Result<DynamicEntity, ConversionError> {
        Ok(DynamicEntity {
            partition_key,
            row_key,
            timestamp: None,
            etag: entity.metadata().and_then(|m| m.etag.clone()),
            properties: self.to_bag(entity)?,
        })
    }

    /// Rebuilds an entity from its row.
    ///
    /// Fields are visited in declaration order. A field found in the bag is
    /// decoded; a key field missing from the bag is restored from the
    /// partition or row key. Metadata slots are filled last.
    ///
    /// # Errors
    ///
    /// In [`ConversionMode::Strict`], the first [`ConversionError::Property`].
    pub fn from_bag(
        &self,
        partition_key: &str,
        row_key: &str,
        timestamp: Option<DateTime<Utc>>,
        bag: &PropertyBag,
        etag: Option<&ETag>,
    ) -> Result<Converted<T>, ConversionError> {
        let entity_name = self.schema.entity_name();
        let mut entity = T::default();
        let mut issues = Vec::new();

        for field in self.schema.serializable_fields() {
            let outcome = match (bag.get(field.storage_name), field.key) {
                (Some(property), _) => (field.decode)(&mut entity, property),
                (None, Some(key)) => match field.role {
                    FieldRole::PartitionKey => (key.assign)(&mut entity, partition_key),
                    FieldRole::RowKey => (key.assign)(&mut entity, row_key),
                    FieldRole::Value => Ok(()),
                },
                (None, None) => Ok(()),
            };

            let Err(err) = outcome else { continue };
            let err = err.in_property(entity_name, field.name);
            if self.mode == ConversionMode::Strict {
                return Err(err);
            }
            tracing::warn!(
                entity = entity_name,
                property = field.storage_name,
                error = %err,
                "skipping malformed property"
            );
            issues.push(PropertyIssue {
                field: field.name,
                storage_name: field.storage_name,
                error: err,
            });
        }

        if let Some(metadata) = entity.metadata_mut() {
            partition_key.clone_into(&mut metadata.partition_key);
            row_key.clone_into(&mut metadata.row_key);
            metadata.etag = etag.cloned();
            metadata.timestamp = timestamp;
        }

        Ok(Converted { entity, issues })
    }

    /// Rebuilds an entity from a row returned by a
    /// [`TableService`](crate::TableService).
    ///
    /// # Errors
    ///
    /// As [`from_bag`](Self::from_bag).
    pub fn from_dynamic(&self, row: &DynamicEntity) -> Result<Converted<T>, ConversionError> {
        self.from_bag(
            &row.partition_key,
            &row.row_key,
            row.timestamp,
            &row.properties,
            row.etag.as_ref(),
        )
    }
}
