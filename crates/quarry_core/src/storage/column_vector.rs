use quarry_error::{DbError, Result};

use super::types::KeyType;

/// Fixed width value that can be stored in a [`NativeColumnVector`].
pub trait NativeValue: Copy + Sized {
    const WIDTH: usize;

    fn write_le(self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_native_value {
    ($ty:ty) => {
        impl NativeValue for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Option<Self> {
                let bytes: [u8; std::mem::size_of::<$ty>()] = bytes.try_into().ok()?;
                Some(<$ty>::from_le_bytes(bytes))
            }
        }
    };
}

impl_native_value!(i32);
impl_native_value!(i64);
impl_native_value!(f32);
impl_native_value!(f64);

/// Column of fixed width, non-null values stored contiguously.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeColumnVector {
    key_type: KeyType,
    width: usize,
    data: Vec<u8>,
}

impl NativeColumnVector {
    pub fn new(key_type: KeyType, capacity: usize) -> Result<Self> {
        if key_type.is_variable_length() || key_type.is_nullable() {
            return Err(DbError::new(
                "Native column vectors require non-null fixed length types",
            )
            .with_field("type", key_type));
        }
        let width = key_type.maximum_byte_length();
        Ok(NativeColumnVector {
            key_type,
            width,
            data: Vec::with_capacity(capacity * width),
        })
    }

    /// Create a column from typed values.
    pub fn from_values<T: NativeValue>(
        key_type: KeyType,
        values: impl IntoIterator<Item = T>,
    ) -> Result<Self> {
        let mut col = Self::new(key_type, 0)?;
        if T::WIDTH != col.width {
            return Err(DbError::new("Value width doesn't match column type")
                .with_field("type", key_type)
                .with_field("value_width", T::WIDTH));
        }
        for value in values {
            value.write_le(&mut col.data);
        }
        Ok(col)
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a value from its raw bytes.
    pub fn append_untyped(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.width {
            return Err(DbError::new("Unexpected value width")
                .with_field("expected", self.width)
                .with_field("got", bytes.len()));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Iterate over the raw bytes of every value.
    pub fn iter_untyped(&self) -> std::slice::ChunksExact<'_, u8> {
        self.data.chunks_exact(self.width.max(1))
    }

    pub fn untyped_value(&self, row: usize) -> Option<&[u8]> {
        let start = row.checked_mul(self.width)?;
        self.data.get(start..start + self.width)
    }

    pub fn value<T: NativeValue>(&self, row: usize) -> Option<T> {
        if T::WIDTH != self.width {
            return None;
        }
        T::read_le(self.untyped_value(row)?)
    }
}

/// Column holding owned, possibly null, values of varying length.
#[derive(Debug, Clone, PartialEq)]
pub struct IndirectColumnVector {
    key_type: KeyType,
    values: Vec<Option<Vec<u8>>>,
}

impl IndirectColumnVector {
    pub fn new(key_type: KeyType) -> Self {
        IndirectColumnVector {
            key_type,
            values: Vec::new(),
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: Option<&[u8]>) -> Result<()> {
        match value {
            None if !self.key_type.is_nullable() => {
                return Err(DbError::new("Cannot push null into non-nullable column")
                    .with_field("type", self.key_type));
            }
            Some(v) if v.len() > self.key_type.maximum_byte_length() => {
                return Err(DbError::new("Value exceeds maximum length for column type")
                    .with_field("type", self.key_type)
                    .with_field("len", v.len()));
            }
            _ => (),
        }
        self.values.push(value.map(|v| v.to_vec()));
        Ok(())
    }

    pub fn untyped_value(&self, row: usize) -> Option<&[u8]> {
        self.values.get(row)?.as_deref()
    }
}

/// A single column of values.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnVector {
    Native(NativeColumnVector),
    Indirect(IndirectColumnVector),
}

impl ColumnVector {
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Native(col) => col.key_type(),
            Self::Indirect(col) => col.key_type(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Native(col) => col.len(),
            Self::Indirect(col) => col.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of a value. None if the value is null or out of bounds.
    pub fn untyped_value(&self, row: usize) -> Option<&[u8]> {
        match self {
            Self::Native(col) => col.untyped_value(row),
            Self::Indirect(col) => col.untyped_value(row),
        }
    }

    pub fn try_as_native(&self) -> Result<&NativeColumnVector> {
        match self {
            Self::Native(col) => Ok(col),
            Self::Indirect(col) => Err(DbError::new("Expected native column vector")
                .with_field("type", col.key_type())),
        }
    }
}

impl From<NativeColumnVector> for ColumnVector {
    fn from(col: NativeColumnVector) -> Self {
        ColumnVector::Native(col)
    }
}

impl From<IndirectColumnVector> for ColumnVector {
    fn from(col: IndirectColumnVector) -> Self {
        ColumnVector::Indirect(col)
    }
}
