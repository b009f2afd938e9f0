//! The store's native property model.
//!
//! A row is a sparse [`PropertyBag`]: storage property name to
//! [`EntityProperty`]. Each variant carries an `Option` so that a null value
//! still records its kind.
//!
//! [`PropertyValue`] is the per-type conversion table. The native
//! implementations below cover every kind the store understands:
//!
//! | Rust type | Stored as |
//! |-----------|-----------|
//! | `Vec<u8>` | binary |
//! | `bool` | boolean |
//! | `DateTime<Utc>` | datetime, clamped to [`min_date_time`] |
//! | `DateTime<FixedOffset>` | datetime (the UTC instant) |
//! | `f32`, `f64` | double |
//! | `i64` | int64 |
//! | `i32` | int32 |
//! | `Uuid` | guid |
//! | `String` | string |
//! | `Option<T>` | as `T`, null when `None` |
//!
//! Enumerations are stored by name through
//! [`enum_property!`](crate::enum_property) and anything else as tagged
//! structured text through [`structured_property!`](crate::structured_property)
//! or the `#[structured]` field marker of [`table_entity!`](crate::table_entity).

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use chrono::{DateTime, FixedOffset, Utc};
use uuid::Uuid;

use crate::error::ConversionError;

/// Seconds from 1601-01-01T00:00:00Z to the Unix epoch.
const MIN_DATE_UNIX_SECONDS: i64 = -11_644_473_600;

/// Storage property name to typed value.
pub type PropertyBag = BTreeMap<String, EntityProperty>;

/// The earliest instant the store can represent, 1601-01-01T00:00:00Z.
/// Earlier timestamps are clamped up to it on write.
#[must_use]
pub fn min_date_time() -> DateTime<Utc> {
    DateTime::from_timestamp(MIN_DATE_UNIX_SECONDS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The kind of a stored property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// Byte sequence.
    Binary,
    /// Boolean.
    Boolean,
    /// UTC timestamp.
    DateTime,
    /// 64-bit float.
    Double,
    /// GUID.
    Guid,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// UTF-8 string.
    String,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Binary => "binary",
            Self::Boolean => "boolean",
            Self::DateTime => "datetime",
            Self::Double => "double",
            Self::Guid => "guid",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::String => "string",
        };
        f.write_str(name)
    }
}

/// A single typed property value. `None` payloads are nulls of that kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityProperty {
    /// Byte sequence.
    Binary(Option<Vec<u8>>),
    /// Boolean.
    Boolean(Option<bool>),
    /// UTC timestamp.
    DateTime(Option<DateTime<Utc>>),
    /// 64-bit float.
    Double(Option<f64>),
    /// GUID.
    Guid(Option<Uuid>),
    /// 32-bit signed integer.
    Int32(Option<i32>),
    /// 64-bit signed integer.
    Int64(Option<i64>),
    /// UTF-8 string.
    String(Option<String>),
}

impl EntityProperty {
    /// A null value of the given kind.
    #[must_use]
    pub fn null(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Binary => Self::Binary(None),
            PropertyKind::Boolean => Self::Boolean(None),
            PropertyKind::DateTime => Self::DateTime(None),
            PropertyKind::Double => Self::Double(None),
            PropertyKind::Guid => Self::Guid(None),
            PropertyKind::Int32 => Self::Int32(None),
            PropertyKind::Int64 => Self::Int64(None),
            PropertyKind::String => Self::String(None),
        }
    }

    /// The kind of this value.
    #[must_use]
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Binary(_) => PropertyKind::Binary,
            Self::Boolean(_) => PropertyKind::Boolean,
            Self::DateTime(_) => PropertyKind::DateTime,
            Self::Double(_) => PropertyKind::Double,
            Self::Guid(_) => PropertyKind::Guid,
            Self::Int32(_) => PropertyKind::Int32,
            Self::Int64(_) => PropertyKind::Int64,
            Self::String(_) => PropertyKind::String,
        }
    }

    /// Returns `true` when the payload is absent.
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Binary(v) => v.is_none(),
            Self::Boolean(v) => v.is_none(),
            Self::DateTime(v) => v.is_none(),
            Self::Double(v) => v.is_none(),
            Self::Guid(v) => v.is_none(),
            Self::Int32(v) => v.is_none(),
            Self::Int64(v) => v.is_none(),
            Self::String(v) => v.is_none(),
        }
    }

    /// The string payload, if this is a non-null string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(Some(s)) => Some(s),
            _ => None,
        }
    }

    /// Orders two non-null values of the same kind. Values of different
    /// kinds, and nulls, are incomparable.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Binary(Some(a)), Self::Binary(Some(b))) => Some(a.cmp(b)),
            (Self::Boolean(Some(a)), Self::Boolean(Some(b))) => Some(a.cmp(b)),
            (Self::DateTime(Some(a)), Self::DateTime(Some(b))) => Some(a.cmp(b)),
            (Self::Double(Some(a)), Self::Double(Some(b))) => a.partial_cmp(b),
            (Self::Guid(Some(a)), Self::Guid(Some(b))) => Some(a.cmp(b)),
            (Self::Int32(Some(a)), Self::Int32(Some(b))) => Some(a.cmp(b)),
            (Self::Int64(Some(a)), Self::Int64(Some(b))) => Some(a.cmp(b)),
            (Self::Int32(Some(a)), Self::Int64(Some(b))) => Some(i64::from(*a).cmp(b)),
            (Self::Int64(Some(a)), Self::Int32(Some(b))) => Some(a.cmp(&i64::from(*b))),
            (Self::String(Some(a)), Self::String(Some(b))) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

macro_rules! impl_from_for_property {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for EntityProperty {
                fn from(value: $ty) -> Self {
                    Self::$variant(Some(value.into()))
                }
            }
        )+
    };
}

impl_from_for_property! {
    Vec<u8> => Binary,
    bool => Boolean,
    DateTime<Utc> => DateTime,
    f64 => Double,
    Uuid => Guid,
    i32 => Int32,
    i64 => Int64,
    String => String,
    &str => String,
}

pub(crate) fn mismatch(expected: PropertyKind, found: &EntityProperty) -> ConversionError {
    ConversionError::TypeMismatch { expected, found: found.kind() }
}

/// Conversion between a Rust field type and an [`EntityProperty`].
///
/// `from_property` returns `Ok(None)` when the stored value is null or empty
/// and the field should keep its default.
pub trait PropertyValue: Sized {
    /// The kind written for this type, including for nulls.
    const KIND: PropertyKind;

    /// Encodes the value.
    ///
    /// # Errors
    ///
    /// Returns a [`ConversionError`] when the value cannot be represented.
    fn to_property(&self) -> Result<EntityProperty, ConversionError>;

    /// Decodes a stored value.
    ///
    /// # Errors
    ///
    /// Returns a [`ConversionError`] when the stored kind cannot be coerced
    /// into this type.
    fn from_property(property: &EntityProperty) -> Result<Option<Self>, ConversionError>;
}

macro_rules! native_property {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl PropertyValue for $ty {
                const KIND: PropertyKind = PropertyKind::$variant;

                fn to_property(&self) -> Result<EntityProperty, ConversionError> {
                    Ok(EntityProperty::$variant(Some(self.to_owned())))
                }

                fn from_property(
                    property: &EntityProperty,
                ) -> Result<Option<Self>, ConversionError> {
                    match property {
                        EntityProperty::$variant(value) => Ok(value.to_owned()),
                        other => Err(mismatch(Self::KIND, other)),
                    }
                }
            }
        )+
    };
}

native_property! {
    Vec<u8> => Binary,
    bool => Boolean,
    f64 => Double,
    Uuid => Guid,
    i32 => Int32,
    String => String,
}

impl PropertyValue for DateTime<Utc> {
    const KIND: PropertyKind = PropertyKind::DateTime;

    fn to_property(&self) -> Result<EntityProperty, ConversionError> {
        Ok(EntityProperty::DateTime(Some((*self).max(min_date_time()))))
    }

    fn from_property(property: &EntityProperty) -> Result<Option<Self>, ConversionError> {
        match property {
            EntityProperty::DateTime(value) => Ok(*value),
            EntityProperty::String(None) => Ok(None),
            EntityProperty::String(Some(text)) => DateTime::parse_from_rfc3339(text)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| {
                    ConversionError::invalid_value(format!("{text:?} is not a timestamp: {e}"))
                }),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl PropertyValue for DateTime<FixedOffset> {
    const KIND: PropertyKind = PropertyKind::DateTime;

    fn to_property(&self) -> Result<EntityProperty, ConversionError> {
        Ok(EntityProperty::DateTime(Some(self.with_timezone(&Utc))))
    }

    fn from_property(property: &EntityProperty) -> Result<Option<Self>, ConversionError> {
        match property {
            EntityProperty::DateTime(value) => Ok(value.map(|dt| dt.fixed_offset())),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl PropertyValue for f32 {
    const KIND: PropertyKind = PropertyKind::Double;

    fn to_property(&self) -> Result<EntityProperty, ConversionError> {
        Ok(EntityProperty::Double(Some(f64::from(*self))))
    }

    fn from_property(property: &EntityProperty) -> Result<Option<Self>, ConversionError> {
        match property {
            #[allow(clippy::cast_possible_truncation)]
            EntityProperty::Double(value) => Ok(value.map(|v| v as f32)),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl PropertyValue for i64 {
    const KIND: PropertyKind = PropertyKind::Int64;

    fn to_property(&self) -> Result<EntityProperty, ConversionError> {
        Ok(EntityProperty::Int64(Some(*self)))
    }

    fn from_property(property: &EntityProperty) -> Result<Option<Self>, ConversionError> {
        match property {
            EntityProperty::Int64(value) => Ok(*value),
            // widening is lossless
            EntityProperty::Int32(value) => Ok(value.map(i64::from)),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl<T: PropertyValue> PropertyValue for Option<T> {
    const KIND: PropertyKind = T::KIND;

    fn to_property(&self) -> Result<EntityProperty, ConversionError> {
        match self {
            Some(value) => value.to_property(),
            None => Ok(EntityProperty::null(T::KIND)),
        }
    }

    fn from_property(property: &EntityProperty) -> Result<Option<Self>, ConversionError> {
        if property.is_null() {
            return Ok(Some(None));
        }
        Ok(T::from_property(property)?.map(Some))
    }
}
