//! Query filters and projections.
//!
//! A [`Filter`] is a small expression tree. It renders to the OData
//! `$filter` syntax for the REST backend and evaluates directly against
//! [`DynamicEntity`] rows for the memory backend.

use std::{cmp::Ordering, fmt::Write as _};

use bon::Builder;
use chrono::SecondsFormat;

use crate::{property::EntityProperty, service::DynamicEntity};

/// A column a filter can compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    /// The `PartitionKey` system column.
    PartitionKey,
    /// The `RowKey` system column.
    RowKey,
    /// The `Timestamp` system column.
    Timestamp,
    /// A user property, by storage name.
    Property(String),
}

impl Column {
    /// The column name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::PartitionKey => "PartitionKey",
            Self::RowKey => "RowKey",
            Self::Timestamp => "Timestamp",
            Self::Property(name) => name,
        }
    }

    /// Parses a column name, recognising the system columns.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "PartitionKey" => Self::PartitionKey,
            "RowKey" => Self::RowKey,
            "Timestamp" => Self::Timestamp,
            other => Self::Property(other.to_owned()),
        }
    }

    fn value_of(&self, row: &DynamicEntity) -> Option<EntityProperty> {
        match self {
            Self::PartitionKey => Some(EntityProperty::from(row.partition_key.as_str())),
            Self::RowKey => Some(EntityProperty::from(row.row_key.as_str())),
            Self::Timestamp => row.timestamp.map(EntityProperty::from),
            Self::Property(name) => row.properties.get(name).cloned(),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    /// `eq`
    Eq,
    /// `ne`
    Ne,
    /// `gt`
    Gt,
    /// `ge`
    Ge,
    /// `lt`
    Lt,
    /// `le`
    Le,
}

impl ComparisonOp {
    fn keyword(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
        }
    }
}

/// A filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column op value`
    Compare {
        /// Left-hand column.
        column: Column,
        /// Operator.
        op: ComparisonOp,
        /// Right-hand literal.
        value: EntityProperty,
    },
    /// Both must hold.
    And(Box<Filter>, Box<Filter>),
    /// Either must hold.
    Or(Box<Filter>, Box<Filter>),
    /// Negation.
    Not(Box<Filter>),
}

macro_rules! comparison_constructors {
    ($($fn_name:ident => $op:ident),+ $(,)?) => {
        $(
            #[doc = concat!("`column ", stringify!($fn_name), " value`")]
            #[must_use]
            pub fn $fn_name(column: &str, value: impl Into<EntityProperty>) -> Self {
                Self::Compare {
                    column: Column::parse(column),
                    op: ComparisonOp::$op,
                    value: value.into(),
                }
            }
        )+
    };
}

impl Filter {
    comparison_constructors! {
        eq => Eq,
        ne => Ne,
        gt => Gt,
        ge => Ge,
        lt => Lt,
        le => Le,
    }

    /// Matches a single partition.
    #[must_use]
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self::eq("PartitionKey", partition_key.into())
    }

    /// Conjunction.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// Disjunction.
    #[must_use]
    pub fn or(self, other: Filter) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Negation.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluates the filter against a row.
    ///
    /// A comparison against a missing property, a null, or a value of a
    /// different kind is false. `ne` follows the same rule.
    #[must_use]
    pub fn matches(&self, row: &DynamicEntity) -> bool {
        match self {
            Self::Compare { column, op, value } => column
                .value_of(row)
                .and_then(|stored| stored.compare(value))
                .is_some_and(|ordering| op.holds(ordering)),
            Self::And(a, b) => a.matches(row) && b.matches(row),
            Self::Or(a, b) => a.matches(row) || b.matches(row),
            Self::Not(inner) => !inner.matches(row),
        }
    }

    /// Renders the OData `$filter` expression.
    #[must_use]
    pub fn to_odata(&self) -> String {
        let mut out = String::new();
        self.write_odata(&mut out);
        out
    }

    fn write_odata(&self, out: &mut String) {
        match self {
            Self::Compare { column, op, value } => {
                let _ = write!(out, "{} {} ", column.name(), op.keyword());
                write_literal(value, out);
            },
            Self::And(a, b) => write_binary(a, "and", b, out),
            Self::Or(a, b) => write_binary(a, "or", b, out),
            Self::Not(inner) => {
                out.push_str("not (");
                inner.write_odata(out);
                out.push(')');
            },
        }
    }
}

fn write_binary(left: &Filter, keyword: &str, right: &Filter, out: &mut String) {
    out.push('(');
    left.write_odata(out);
    let _ = write!(out, ") {keyword} (");
    right.write_odata(out);
    out.push(')');
}

fn write_literal(value: &EntityProperty, out: &mut String) {
    let _ = match value {
        EntityProperty::Binary(Some(bytes)) => write!(out, "X'{}'", hex::encode(bytes)),
        EntityProperty::Boolean(Some(b)) => write!(out, "{b}"),
        EntityProperty::DateTime(Some(dt)) => {
            write!(out, "datetime'{}'", dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        },
        EntityProperty::Double(Some(d)) => write!(out, "{d:?}"),
        EntityProperty::Guid(Some(g)) => write!(out, "guid'{g}'"),
        EntityProperty::Int32(Some(i)) => write!(out, "{i}"),
        EntityProperty::Int64(Some(i)) => write!(out, "{i}L"),
        EntityProperty::String(Some(s)) => write!(out, "'{}'", s.replace('\'', "''")),
        _ => write!(out, "null"),
    };
}

/// A query over one table.
#[derive(Debug, Clone, Default, PartialEq, Builder)]
pub struct TableQuery {
    /// Row filter; `None` returns every row.
    pub filter: Option<Filter>,
    /// Property projection. Keys and timestamp are always returned.
    pub select: Option<Vec<String>>,
    /// Maximum rows per page.
    pub take: Option<usize>,
}

impl TableQuery {
    /// A query matching every row.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A query with only a filter.
    #[must_use]
    pub fn filtered(filter: Filter) -> Self {
        Self { filter: Some(filter), ..Self::default() }
    }

    /// Applies the projection to a row in place.
    pub fn project(&self, row: &mut DynamicEntity) {
        if let Some(select) = &self.select {
            row.properties.retain(|name, _| select.iter().any(|s| s == name));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::*;

    fn row() -> DynamicEntity {
        DynamicEntity::new("sales", "widget-1")
            .with_property("Quantity", 5_i32)
            .with_property("Total", 1_000_i64)
            .with_property("Name", "Widget")
    }

    #[test]
    fn test_comparisons_evaluate() {
        let r = row();
        assert!(Filter::partition("sales").matches(&r));
        assert!(Filter::gt("Quantity", 3_i32).matches(&r));
        assert!(!Filter::lt("Quantity", 3_i32).matches(&r));
        assert!(Filter::ge("Total", 1_000_i32).matches(&r));
        assert!(Filter::eq("Name", "Widget").and(Filter::le("RowKey", "widget-1")).matches(&r));
        assert!(Filter::eq("Name", "Nope").or(Filter::ne("Quantity", 4_i32)).matches(&r));
        assert!(Filter::eq("Name", "Nope").not().matches(&r));
    }

    #[test]
    fn test_missing_or_mismatched_property_never_matches() {
        let r = row();
        assert!(!Filter::eq("Missing", 1_i32).matches(&r));
        assert!(!Filter::ne("Missing", 1_i32).matches(&r));
        assert!(!Filter::eq("Name", 1_i32).matches(&r));
    }

    #[test]
    fn test_odata_rendering() {
        let filter = Filter::partition("o'brien").and(Filter::gt("Total", 10_i64));
        assert_eq!(filter.to_odata(), "(PartitionKey eq 'o''brien') and (Total gt 10L)");

        let when = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            Filter::ge("Timestamp", when).to_odata(),
            "Timestamp ge datetime'2024-01-02T03:04:05Z'"
        );
        assert_eq!(
            Filter::eq("Id", Uuid::nil()).not().to_odata(),
            "not (Id eq guid'00000000-0000-0000-0000-000000000000')"
        );
        assert_eq!(Filter::eq("Blob", vec![0xab_u8, 0x01]).to_odata(), "Blob eq X'ab01'");
        assert_eq!(Filter::eq("Ratio", 2.0_f64).to_odata(), "Ratio eq 2.0");
    }

    #[test]
    fn test_projection_keeps_selected_only() {
        let query = TableQuery::builder().select(vec!["Name".to_owned()]).build();
        let mut r = row();
        query.project(&mut r);
        assert_eq!(r.properties.len(), 1);
        assert_eq!(r.partition_key, "sales");
    }
}
