//! Field codecs used by generated entity code.
//!
//! [`table_entity!`](crate::table_entity) picks one codec per field:
//! [`native`] for types implementing [`PropertyValue`] and [`structured`] for
//! fields marked `#[structured]`. [`enumeration`] backs
//! [`enum_property!`](crate::enum_property). Key-marked fields always use
//! [`key`], so their types only need [`KeyValue`](crate::keys::KeyValue).

use std::any::type_name;

use crate::{
    error::ConversionError,
    property::{EntityProperty, PropertyKind, PropertyValue, mismatch},
};

/// Codec for types with a native [`PropertyValue`] implementation.
pub mod native {
    use super::{ConversionError, EntityProperty, PropertyValue};

    /// Encodes a field value.
    ///
    /// # Errors
    ///
    /// Propagates the [`PropertyValue::to_property`] failure.
    pub fn encode<V: PropertyValue>(value: &V) -> Result<EntityProperty, ConversionError> {
        value.to_property()
    }

    /// Decodes a stored property.
    ///
    /// # Errors
    ///
    /// Propagates the [`PropertyValue::from_property`] failure.
    pub fn decode<V: PropertyValue>(
        property: &EntityProperty,
    ) -> Result<Option<V>, ConversionError> {
        V::from_property(property)
    }
}

/// Enumerations stored by variant name.
///
/// An empty or null stored string leaves the field at its default.
pub mod enumeration {
    use std::{fmt::Display, str::FromStr};

    use super::{ConversionError, EntityProperty, PropertyKind, mismatch, type_name};

    /// Encodes the variant name.
    pub fn encode<E: Display>(value: &E) -> EntityProperty {
        EntityProperty::String(Some(value.to_string()))
    }

    /// Parses a variant name.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidValue`] for an unknown name and
    /// [`ConversionError::TypeMismatch`] for a non-string property.
    pub fn decode<E>(property: &EntityProperty) -> Result<Option<E>, ConversionError>
    where
        E: FromStr,
        E::Err: Display,
    {
        match property {
            EntityProperty::String(None) => Ok(None),
            EntityProperty::String(Some(name)) if name.is_empty() => Ok(None),
            EntityProperty::String(Some(name)) => name.parse().map(Some).map_err(|e: E::Err| {
                ConversionError::invalid_value(format!(
                    "{name:?} is not a variant of {}: {e}",
                    type_name::<E>()
                ))
            }),
            other => Err(mismatch(PropertyKind::String, other)),
        }
    }
}

/// Key-marked fields, read back from a same-named legacy property.
///
/// Only [`KeyValue`](crate::keys::KeyValue) is required of the field type.
pub mod key {
    use super::{ConversionError, EntityProperty, PropertyKind, mismatch};
    use crate::keys::KeyValue;

    /// Renders the key as a string property.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn encode<V: KeyValue>(value: &V) -> Result<EntityProperty, ConversionError> {
        Ok(EntityProperty::String(Some(value.to_key())))
    }

    /// Parses a stored string with [`KeyValue::from_key`].
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidValue`] when the text does not parse
    /// and [`ConversionError::TypeMismatch`] for a non-string property.
    pub fn decode<V: KeyValue>(property: &EntityProperty) -> Result<Option<V>, ConversionError> {
        match property {
            EntityProperty::String(None) => Ok(None),
            EntityProperty::String(Some(text)) if text.is_empty() => Ok(None),
            EntityProperty::String(Some(text)) => V::from_key(text).map(Some),
            other => Err(mismatch(PropertyKind::String, other)),
        }
    }
}

/// Type-tagged structured text.
///
/// Values are written as JSON `{"$type": "<declared type>", "$value": ...}`.
/// On read, strings that start with `{` or `[` are parsed as JSON; a tagged
/// envelope is unwrapped and any other document is taken as the untagged
/// value. Strings that do not look structured are handed to the target type
/// as a JSON string, which covers unit enum variants and plain strings.
pub mod structured {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::{Map, Value};

    use super::{ConversionError, EntityProperty, PropertyKind, mismatch, type_name};

    /// Key of the declared type name in the envelope.
    pub const TYPE_TAG: &str = "$type";

    /// Key of the payload in the envelope.
    pub const VALUE_TAG: &str = "$value";

    /// Returns `true` when `text` lexically looks like structured data.
    #[must_use]
    pub fn looks_structured(text: &str) -> bool {
        matches!(text.as_bytes().first(), Some(b'{' | b'['))
    }

    fn error<V>(source: serde_json::Error) -> ConversionError {
        ConversionError::Structured { type_name: type_name::<V>(), source: source.into() }
    }

    /// Encodes a value as tagged structured text. A value that serializes to
    /// JSON `null` becomes a null string.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::Structured`] when serialization fails.
    pub fn encode<V: Serialize>(value: &V) -> Result<EntityProperty, ConversionError> {
        let payload = serde_json::to_value(value).map_err(error::<V>)?;
        if payload.is_null() {
            return Ok(EntityProperty::String(None));
        }

        let mut envelope = Map::with_capacity(2);
        envelope.insert(TYPE_TAG.to_owned(), Value::String(type_name::<V>().to_owned()));
        envelope.insert(VALUE_TAG.to_owned(), payload);
        Ok(EntityProperty::String(Some(Value::Object(envelope).to_string())))
    }

    /// Decodes tagged or untagged structured text.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::Structured`] when the text does not
    /// deserialize into `V`, or [`ConversionError::TypeMismatch`] for a
    /// non-string property.
    pub fn decode<V: DeserializeOwned>(
        property: &EntityProperty,
    ) -> Result<Option<V>, ConversionError> {
        let text = match property {
            EntityProperty::String(Some(text)) => text,
            EntityProperty::String(None) => return Ok(None),
            other => return Err(mismatch(PropertyKind::String, other)),
        };

        if !looks_structured(text) {
            return serde_json::from_value(Value::String(text.clone()))
                .map(Some)
                .map_err(error::<V>);
        }

        let document: Value = serde_json::from_str(text).map_err(error::<V>)?;
        let payload = match document {
            Value::Object(mut map)
                if map.len() == 2 && map.contains_key(TYPE_TAG) && map.contains_key(VALUE_TAG) =>
            {
                let tag = map.remove(TYPE_TAG);
                if tag.as_ref().and_then(Value::as_str) != Some(type_name::<V>()) {
                    tracing::debug!(
                        stored = ?tag,
                        declared = type_name::<V>(),
                        "structured type tag differs from declared type"
                    );
                }
                map.remove(VALUE_TAG).unwrap_or(Value::Null)
            },
            untagged => untagged,
        };

        serde_json::from_value(payload).map(Some).map_err(error::<V>)
    }
}

/// Implements [`PropertyValue`] for enumerations, storing the variant name.
///
/// The type needs `Display` for writing and `FromStr` for reading.
///
/// ```
/// use std::{fmt, str::FromStr};
///
/// #[derive(Debug, Default, PartialEq)]
/// enum Colour { #[default] Red, Blue }
///
/// impl fmt::Display for Colour {
///     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
///         f.write_str(match self { Colour::Red => "Red", Colour::Blue => "Blue" })
///     }
/// }
///
/// impl FromStr for Colour {
///     type Err = String;
///     fn from_str(s: &str) -> Result<Self, String> {
///         match s { "Red" => Ok(Colour::Red), "Blue" => Ok(Colour::Blue), _ => Err(s.to_owned()) }
///     }
/// }
///
/// cloudtable_storage::enum_property!(Colour);
/// ```
#[macro_export]
macro_rules! enum_property {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::property::PropertyValue for $ty {
                const KIND: $crate::property::PropertyKind = $crate::property::PropertyKind::String;

                fn to_property(
                    &self,
                ) -> ::std::result::Result<
                    $crate::property::EntityProperty,
                    $crate::error::ConversionError,
                > {
                    ::std::result::Result::Ok($crate::codec::enumeration::encode(self))
                }

                fn from_property(
                    property: &$crate::property::EntityProperty,
                ) -> ::std::result::Result<
                    ::std::option::Option<Self>,
                    $crate::error::ConversionError,
                > {
                    $crate::codec::enumeration::decode(property)
                }
            }
        )+
    };
}

/// Implements [`PropertyValue`] for serde types, storing them as tagged
/// structured text.
#[macro_export]
macro_rules! structured_property {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::property::PropertyValue for $ty {
                const KIND: $crate::property::PropertyKind = $crate::property::PropertyKind::String;

                fn to_property(
                    &self,
                ) -> ::std::result::Result<
                    $crate::property::EntityProperty,
                    $crate::error::ConversionError,
                > {
                    $crate::codec::structured::encode(self)
                }

                fn from_property(
                    property: &$crate::property::EntityProperty,
                ) -> ::std::result::Result<
                    ::std::option::Option<Self>,
                    $crate::error::ConversionError,
                > {
                    $crate::codec::structured::decode(property)
                }
            }
        )+
    };
}
