use quarry_error::{DbError, Result};
use serde::{Deserialize, Serialize};

use super::column_vector::ColumnVector;

/// Tuples stored as a set of equal length column vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnVectorsValueAccessor {
    columns: Vec<ColumnVector>,
    num_tuples: usize,
}

impl ColumnVectorsValueAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column. All columns must have the same length.
    pub fn add_column(&mut self, column: impl Into<ColumnVector>) -> Result<()> {
        let column = column.into();
        if !self.columns.is_empty() && column.len() != self.num_tuples {
            return Err(DbError::new("Column length doesn't match accessor")
                .with_field("num_tuples", self.num_tuples)
                .with_field("column_len", column.len()));
        }
        self.num_tuples = column.len();
        self.columns.push(column);
        Ok(())
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_tuples(&self) -> usize {
        self.num_tuples
    }

    pub fn columns(&self) -> &[ColumnVector] {
        &self.columns
    }

    pub fn column(&self, attr_id: usize) -> Result<&ColumnVector> {
        self.columns.get(attr_id).ok_or_else(|| {
            DbError::new("Attribute out of range")
                .with_field("attr_id", attr_id)
                .with_field("num_columns", self.columns.len())
        })
    }
}

/// Which accessor in a [`ValueAccessorMultiplexer`] an attribute comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueAccessorSource {
    /// Attributes read directly from the input relation.
    Base,
    /// Attributes computed from expressions over the base attributes.
    Derived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiSourceAttributeId {
    pub source: ValueAccessorSource,
    pub attr_id: usize,
}

impl MultiSourceAttributeId {
    pub const fn base(attr_id: usize) -> Self {
        MultiSourceAttributeId {
            source: ValueAccessorSource::Base,
            attr_id,
        }
    }

    pub const fn derived(attr_id: usize) -> Self {
        MultiSourceAttributeId {
            source: ValueAccessorSource::Derived,
            attr_id,
        }
    }
}

/// Pairs base and derived accessors for the same set of tuples.
#[derive(Debug, Clone, Copy)]
pub struct ValueAccessorMultiplexer<'a> {
    base: Option<&'a ColumnVectorsValueAccessor>,
    derived: Option<&'a ColumnVectorsValueAccessor>,
}

impl<'a> ValueAccessorMultiplexer<'a> {
    pub fn new(base: &'a ColumnVectorsValueAccessor) -> Self {
        ValueAccessorMultiplexer {
            base: Some(base),
            derived: None,
        }
    }

    pub fn with_derived(mut self, derived: &'a ColumnVectorsValueAccessor) -> Self {
        self.derived = Some(derived);
        self
    }

    pub fn accessor(&self, source: ValueAccessorSource) -> Result<&'a ColumnVectorsValueAccessor> {
        let accessor = match source {
            ValueAccessorSource::Base => self.base,
            ValueAccessorSource::Derived => self.derived,
        };
        accessor.ok_or_else(|| {
            DbError::new("Missing value accessor").with_field("source", format!("{source:?}"))
        })
    }

    /// Get the column for an attribute.
    pub fn column(&self, attr: MultiSourceAttributeId) -> Result<&'a ColumnVector> {
        self.accessor(attr.source)?.column(attr.attr_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::column_vector::NativeColumnVector;
    use crate::storage::types::{KeyType, KeyTypeId};

    fn int_column(values: &[i32]) -> NativeColumnVector {
        NativeColumnVector::from_values(KeyType::new(KeyTypeId::Int32), values.iter().copied())
            .unwrap()
    }

    #[test]
    fn add_columns() {
        let mut accessor = ColumnVectorsValueAccessor::new();
        accessor.add_column(int_column(&[1, 2, 3])).unwrap();
        accessor.add_column(int_column(&[4, 5, 6])).unwrap();
        accessor.add_column(int_column(&[7])).unwrap_err();

        assert_eq!(2, accessor.num_columns());
        assert_eq!(3, accessor.num_tuples());
        accessor.column(2).unwrap_err();
    }

    #[test]
    fn multiplexer_sources() {
        let mut base = ColumnVectorsValueAccessor::new();
        base.add_column(int_column(&[1, 2])).unwrap();
        let mut derived = ColumnVectorsValueAccessor::new();
        derived.add_column(int_column(&[10, 20])).unwrap();

        let mux = ValueAccessorMultiplexer::new(&base);
        mux.column(MultiSourceAttributeId::derived(0)).unwrap_err();

        let mux = mux.with_derived(&derived);
        let col = mux.column(MultiSourceAttributeId::derived(0)).unwrap();
        assert_eq!(Some(&20_i32.to_le_bytes()[..]), col.untyped_value(1));
        let col = mux.column(MultiSourceAttributeId::base(0)).unwrap();
        assert_eq!(Some(&1_i32.to_le_bytes()[..]), col.untyped_value(0));
    }
}
