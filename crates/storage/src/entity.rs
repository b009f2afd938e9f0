//! Entity registry: how a Rust type maps onto a table row.
//!
//! A type becomes storable by implementing [`TableEntity`], usually through
//! the [`table_entity!`](crate::table_entity) macro. The implementation lists
//! one [`FieldDescriptor`] per persisted field; [`EntitySchema::resolve`]
//! validates that list once per store and works out where the partition and
//! row keys come from.
//!
//! # Key designation
//!
//! - A type with a metadata slot ([`TableEntity::has_metadata`]) takes its
//!   keys from [`EntityMetadata`], which also receives the version token and
//!   timestamp after reads and writes.
//! - Otherwise exactly one field must be marked `#[partition_key]` and
//!   exactly one `#[row_key]`.
//!
//! Key fields never appear in the property bag; they travel as the row's
//! partition and row key. A `#[skip]` marker has no effect on a key field.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::{
    error::{ConfigError, ConversionError, KeyMarker},
    property::EntityProperty,
    service::ETag,
};

/// Key, version and timestamp slots an entity may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityMetadata {
    /// Partition key. Normalized before use.
    pub partition_key: String,
    /// Row key. Normalized before use.
    pub row_key: String,
    /// Version token from the last read or write.
    pub etag: Option<ETag>,
    /// Last-modified time assigned by the store.
    pub timestamp: Option<DateTime<Utc>>,
}

/// What a field contributes to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// An ordinary property.
    Value,
    /// The partition key.
    PartitionKey,
    /// The row key.
    RowKey,
}

impl FieldRole {
    /// Returns `true` for the two key roles.
    #[must_use]
    pub fn is_key(self) -> bool {
        !matches!(self, Self::Value)
    }
}

/// Reads a field into a property.
pub type EncodeFn<T> = fn(&T) -> Result<EntityProperty, ConversionError>;
/// Writes a property into a field.
pub type DecodeFn<T> = fn(&mut T, &EntityProperty) -> Result<(), ConversionError>;
/// Reads a key field as a raw key string.
pub type KeyReadFn<T> = fn(&T) -> String;
/// Assigns a key field from a stored key string.
pub type KeyAssignFn<T> = fn(&mut T, &str) -> Result<(), ConversionError>;

/// Key accessors for a field marked as partition or row key.
pub struct KeyAccess<T> {
    /// Reads the raw key.
    pub read: KeyReadFn<T>,
    /// Restores the field from the stored key.
    pub assign: KeyAssignFn<T>,
}

impl<T> Clone for KeyAccess<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for KeyAccess<T> {}

/// Describes one persisted field of `T`.
pub struct FieldDescriptor<T> {
    /// Field name in the Rust type.
    pub name: &'static str,
    /// Property name in the bag.
    pub storage_name: &'static str,
    /// Key role, if any.
    pub role: FieldRole,
    /// Excluded from conversion unless it is a key.
    pub skip: bool,
    /// Field to property.
    pub encode: EncodeFn<T>,
    /// Property to field.
    pub decode: DecodeFn<T>,
    /// Present for key roles.
    pub key: Option<KeyAccess<T>>,
}

impl<T> FieldDescriptor<T> {
    /// Returns `true` when the field takes part in conversion.
    #[must_use]
    pub fn is_serializable(&self) -> bool {
        !self.skip || self.role.is_key()
    }
}

impl<T> Clone for FieldDescriptor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FieldDescriptor<T> {}

impl<T> fmt::Debug for FieldDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("storage_name", &self.storage_name)
            .field("role", &self.role)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

/// A record type that can be stored in a table.
///
/// `Default` provides construction without side effects on read.
pub trait TableEntity: Default + Send + Sync + 'static {
    /// Short type name used in errors and logs.
    fn entity_name() -> &'static str;

    /// The persisted fields in declaration order.
    fn fields() -> Vec<FieldDescriptor<Self>>;

    /// Whether the type exposes an [`EntityMetadata`] slot.
    fn has_metadata() -> bool {
        false
    }

    /// The metadata slot, if any.
    fn metadata(&self) -> Option<&EntityMetadata> {
        None
    }

    /// The metadata slot, if any.
    fn metadata_mut(&mut self) -> Option<&mut EntityMetadata> {
        None
    }
}

/// Where a store reads partition and row keys from.
pub enum KeyDesignation<T> {
    /// From [`EntityMetadata`].
    Metadata,
    /// From marked fields.
    Fields {
        /// The `#[partition_key]` field.
        partition_key: KeyAccess<T>,
        /// The `#[row_key]` field.
        row_key: KeyAccess<T>,
    },
}

impl<T> fmt::Debug for KeyDesignation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => f.write_str("Metadata"),
            Self::Fields { .. } => f.write_str("Fields"),
        }
    }
}

/// The validated field list of `T`.
#[derive(Debug)]
pub struct EntitySchema<T> {
    entity: &'static str,
    fields: Vec<FieldDescriptor<T>>,
}

impl<T: TableEntity> EntitySchema<T> {
    /// Collects and validates the fields of `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateStorageName`] when two serializable
    /// fields share a storage name.
    pub fn resolve() -> Result<Self, ConfigError> {
        let entity = T::entity_name();
        let fields = T::fields();

        let mut seen = std::collections::HashSet::new();
        for field in fields.iter().filter(|f| f.is_serializable() && !f.role.is_key()) {
            if !seen.insert(field.storage_name) {
                return Err(ConfigError::DuplicateStorageName { name: field.storage_name, entity });
            }
        }

        Ok(Self { entity, fields })
    }

    /// Resolves where keys come from.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingKeyMarker`] or
    /// [`ConfigError::AmbiguousKeyMarker`] when the type has no metadata
    /// slot and the markers are not each on exactly one field.
    pub fn key_designation(&self) -> Result<KeyDesignation<T>, ConfigError> {
        if T::has_metadata() {
            return Ok(KeyDesignation::Metadata);
        }

        let partition_key = self.single_key(FieldRole::PartitionKey, KeyMarker::PartitionKey)?;
        let row_key = self.single_key(FieldRole::RowKey, KeyMarker::RowKey)?;
        Ok(KeyDesignation::Fields { partition_key, row_key })
    }

    fn single_key(&self, role: FieldRole, marker: KeyMarker) -> Result<KeyAccess<T>, ConfigError> {
        let mut marked = self.fields.iter().filter(|f| f.role == role);
        let first = marked
            .next()
            .ok_or(ConfigError::MissingKeyMarker { marker, entity: self.entity })?;
        if marked.next().is_some() {
            return Err(ConfigError::AmbiguousKeyMarker { marker, entity: self.entity });
        }
        first.key.ok_or(ConfigError::MissingKeyMarker { marker, entity: self.entity })
    }

    /// The entity type name.
    #[must_use]
    pub fn entity_name(&self) -> &'static str {
        self.entity
    }

    /// Fields that take part in conversion, in declaration order.
    pub fn serializable_fields(&self) -> impl Iterator<Item = &FieldDescriptor<T>> {
        self.fields.iter().filter(|f| f.is_serializable())
    }
}

/// Implements [`TableEntity`] for an existing struct.
///
/// List every persisted field, optionally preceded by markers:
///
/// - `#[partition_key]` / `#[row_key]` designate the keys; key fields need
///   only [`KeyValue`](crate::keys::KeyValue) and ignore `#[structured]`
/// - `#[skip]` leaves the field out of the property bag
/// - `#[storage_name = "..."]` stores the field under another name
/// - `#[structured]` stores any serde type as tagged structured text
///
/// Fields not listed are not persisted. A `where metadata = field` clause
/// names an [`EntityMetadata`] field that supplies the keys instead.
///
/// ```
/// use cloudtable_storage::table_entity;
///
/// #[derive(Debug, Default)]
/// struct Product {
///     category: String,
///     sku: String,
///     name: String,
///     price: f64,
///     tags: Vec<String>,
///     cached_label: Option<String>,
/// }
///
/// table_entity! {
///     impl TableEntity for Product {
///         #[partition_key] category,
///         #[row_key] sku,
///         name,
///         #[storage_name = "unit_price"] price,
///         #[structured] tags,
///         #[skip] cached_label,
///     }
/// }
/// ```
#[macro_export]
macro_rules! table_entity {
    (
        impl TableEntity for $entity:ident {
            $( $(#[$($marker:tt)+])* $field:ident ),* $(,)?
        }
    ) => {
        $crate::table_entity!(@impl $entity, [], { $( $(#[$($marker)+])* $field ),* });
    };
    (
        impl TableEntity for $entity:ident where metadata = $meta:ident {
            $( $(#[$($marker:tt)+])* $field:ident ),* $(,)?
        }
    ) => {
        $crate::table_entity!(@impl $entity, [$meta], { $( $(#[$($marker)+])* $field ),* });
    };
    (@impl $entity:ident, [$($meta:ident)?], { $( $(#[$($marker:tt)+])* $field:ident ),* }) => {
        impl $crate::entity::TableEntity for $entity {
            fn entity_name() -> &'static str {
                ::std::stringify!($entity)
            }

            fn fields() -> ::std::vec::Vec<$crate::entity::FieldDescriptor<Self>> {
                ::std::vec![
                    $( $crate::__table_field!($entity, $field, [$( [$($marker)+] )*]) ),*
                ]
            }

            $(
                fn has_metadata() -> bool {
                    true
                }

                fn metadata(&self) -> ::std::option::Option<&$crate::entity::EntityMetadata> {
                    ::std::option::Option::Some(&self.$meta)
                }

                fn metadata_mut(
                    &mut self,
                ) -> ::std::option::Option<&mut $crate::entity::EntityMetadata> {
                    ::std::option::Option::Some(&mut self.$meta)
                }
            )?
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __table_field {
    ($entity:ident, $field:ident, [$($markers:tt)*]) => {
        $crate::__table_field!(
            @parse $entity, $field, [$($markers)*],
            role = value, skip = false, name = (::std::stringify!($field)), codec = native
        )
    };

    (@parse $entity:ident, $field:ident, [],
        role = $role:ident, skip = $skip:literal, name = ($name:expr), codec = $codec:ident) => {
        $crate::__table_field!(@build $entity, $field, $role, $skip, ($name), $codec)
    };
    (@parse $entity:ident, $field:ident, [[partition_key] $($rest:tt)*],
        role = $role:ident, skip = $skip:literal, name = ($name:expr), codec = $codec:ident) => {
        $crate::__table_field!(
            @parse $entity, $field, [$($rest)*],
            role = partition_key, skip = $skip, name = ($name), codec = $codec
        )
    };
    (@parse $entity:ident, $field:ident, [[row_key] $($rest:tt)*],
        role = $role:ident, skip = $skip:literal, name = ($name:expr), codec = $codec:ident) => {
        $crate::__table_field!(
            @parse $entity, $field, [$($rest)*],
            role = row_key, skip = $skip, name = ($name), codec = $codec
        )
    };
    (@parse $entity:ident, $field:ident, [[skip] $($rest:tt)*],
        role = $role:ident, skip = $skip:literal, name = ($name:expr), codec = $codec:ident) => {
        $crate::__table_field!(
            @parse $entity, $field, [$($rest)*],
            role = $role, skip = true, name = ($name), codec = $codec
        )
    };
    (@parse $entity:ident, $field:ident, [[storage_name = $storage:literal] $($rest:tt)*],
        role = $role:ident, skip = $skip:literal, name = ($name:expr), codec = $codec:ident) => {
        $crate::__table_field!(
            @parse $entity, $field, [$($rest)*],
            role = $role, skip = $skip, name = ($storage), codec = $codec
        )
    };
    (@parse $entity:ident, $field:ident, [[structured] $($rest:tt)*],
        role = $role:ident, skip = $skip:literal, name = ($name:expr), codec = $codec:ident) => {
        $crate::__table_field!(
            @parse $entity, $field, [$($rest)*],
            role = $role, skip = $skip, name = ($name), codec = structured
        )
    };
    (@parse $entity:ident, $field:ident, [[$($unknown:tt)*] $($rest:tt)*], $($state:tt)*) => {
        ::std::compile_error!(::std::concat!(
            "unknown table_entity marker #[",
            ::std::stringify!($($unknown)*),
            "] on field ",
            ::std::stringify!($field)
        ))
    };

    (@build $entity:ident, $field:ident, value, $skip:literal, ($name:expr), $codec:ident) => {
        $crate::__table_field!(
            @descriptor $entity, $field, Value, $skip, ($name), $codec, ::std::option::Option::None
        )
    };
    (@build $entity:ident, $field:ident, partition_key, $skip:literal, ($name:expr),
        $codec:ident) => {
        $crate::__table_field!(
            @descriptor $entity, $field, PartitionKey, $skip, ($name), key,
            ::std::option::Option::Some($crate::__table_field!(@key $entity, $field))
        )
    };
    (@build $entity:ident, $field:ident, row_key, $skip:literal, ($name:expr), $codec:ident) => {
        $crate::__table_field!(
            @descriptor $entity, $field, RowKey, $skip, ($name), key,
            ::std::option::Option::Some($crate::__table_field!(@key $entity, $field))
        )
    };

    (@key $entity:ident, $field:ident) => {
        $crate::entity::KeyAccess::<$entity> {
            read: |entity: &$entity| $crate::keys::KeyValue::to_key(&entity.$field),
            assign: |entity: &mut $entity, key: &str| {
                entity.$field = $crate::keys::KeyValue::from_key(key)?;
                ::std::result::Result::Ok(())
            },
        }
    };

    (@descriptor $entity:ident, $field:ident, $role:ident, $skip:literal, ($name:expr),
        $codec:ident, $key:expr) => {
        $crate::entity::FieldDescriptor::<$entity> {
            name: ::std::stringify!($field),
            storage_name: $name,
            role: $crate::entity::FieldRole::$role,
            skip: $skip,
            encode: |entity: &$entity| $crate::codec::$codec::encode(&entity.$field),
            decode: |entity: &mut $entity, property: &$crate::property::EntityProperty| {
                let decoded = $crate::codec::$codec::decode(property)?;
                if let ::std::option::Option::Some(value) = decoded {
                    entity.$field = value;
                }
                ::std::result::Result::Ok(())
            },
            key: $key,
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Order {
        customer: String,
        number: i32,
        note: String,
        secret: String,
    }

    crate::table_entity! {
        impl TableEntity for Order {
            #[partition_key] customer,
            #[row_key] #[skip] number,
            #[storage_name = "Notes"] note,
            #[skip] secret,
        }
    }

    #[derive(Debug, Default)]
    struct Unkeyed {
        name: String,
    }

    crate::table_entity! {
        impl TableEntity for Unkeyed {
            name,
        }
    }

    #[derive(Debug, Default)]
    struct TwoPartitions {
        a: String,
        b: String,
        c: String,
    }

    crate::table_entity! {
        impl TableEntity for TwoPartitions {
            #[partition_key] a,
            #[partition_key] b,
            #[row_key] c,
        }
    }

    #[derive(Debug, Default)]
    struct Clashing {
        a: String,
        b: String,
    }

    crate::table_entity! {
        impl TableEntity for Clashing {
            #[storage_name = "x"] a,
            #[storage_name = "x"] b,
        }
    }

    #[derive(Debug, Default)]
    struct WithMetadata {
        meta: EntityMetadata,
        body: String,
    }

    crate::table_entity! {
        impl TableEntity for WithMetadata where metadata = meta {
            body,
        }
    }

    #[test]
    fn test_descriptors_follow_markers() {
        let fields = Order::fields();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].role, FieldRole::PartitionKey);
        assert_eq!(fields[1].role, FieldRole::RowKey);
        assert!(fields[1].skip);
        assert_eq!(fields[2].storage_name, "Notes");
        assert_eq!(fields[2].name, "note");
        assert!(fields[3].skip);
    }

    #[test]
    fn test_skip_does_not_apply_to_keys() {
        let schema = EntitySchema::<Order>::resolve().unwrap();
        let names: Vec<_> = schema.serializable_fields().map(|f| f.name).collect();
        assert_eq!(names, vec!["customer", "number", "note"]);
    }

    #[test]
    fn test_marked_fields_designate_keys() {
        let schema = EntitySchema::<Order>::resolve().unwrap();
        let KeyDesignation::Fields { partition_key, row_key } = schema.key_designation().unwrap()
        else {
            panic!("expected field designation");
        };

        let mut order = Order { customer: "Acme".into(), number: 42, ..Order::default() };
        assert_eq!((partition_key.read)(&order), "Acme");
        assert_eq!((row_key.read)(&order), "42");

        (row_key.assign)(&mut order, "7").unwrap();
        assert_eq!(order.number, 7);
        assert!((row_key.assign)(&mut order, "seven").is_err());
    }

    #[test]
    fn test_missing_marker_names_marker_and_type() {
        let schema = EntitySchema::<Unkeyed>::resolve().unwrap();
        let err = schema.key_designation().unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingKeyMarker { marker: KeyMarker::PartitionKey, entity: "Unkeyed" }
        );
        assert!(err.to_string().contains("partition_key"));
        assert!(err.to_string().contains("Unkeyed"));
    }

    #[test]
    fn test_ambiguous_marker_rejected() {
        let schema = EntitySchema::<TwoPartitions>::resolve().unwrap();
        assert!(matches!(
            schema.key_designation(),
            Err(ConfigError::AmbiguousKeyMarker { marker: KeyMarker::PartitionKey, .. })
        ));
    }

    #[test]
    fn test_duplicate_storage_name_rejected() {
        assert!(matches!(
            EntitySchema::<Clashing>::resolve(),
            Err(ConfigError::DuplicateStorageName { name: "x", entity: "Clashing" })
        ));
    }

    #[test]
    fn test_metadata_slot_takes_precedence() {
        assert!(WithMetadata::has_metadata());
        let schema = EntitySchema::<WithMetadata>::resolve().unwrap();
        assert!(matches!(schema.key_designation().unwrap(), KeyDesignation::Metadata));

        let mut entity = WithMetadata::default();
        entity.metadata_mut().unwrap().row_key = "r1".into();
        assert_eq!(entity.metadata().unwrap().row_key, "r1");
        assert_eq!(entity.meta.row_key, "r1");
    }
}
