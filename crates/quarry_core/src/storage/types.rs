use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical type of a key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyTypeId {
    Int32,
    Int64,
    Float32,
    Float64,
    /// Days since epoch.
    Date32,
    /// Fixed length string.
    Char(usize),
    /// Variable length string with a max length.
    VarChar(usize),
}

/// Type of a key column, including nullability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyType {
    pub id: KeyTypeId,
    pub nullable: bool,
}

impl KeyType {
    pub const fn new(id: KeyTypeId) -> Self {
        KeyType {
            id,
            nullable: false,
        }
    }

    pub const fn new_nullable(id: KeyTypeId) -> Self {
        KeyType { id, nullable: true }
    }

    pub const fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub const fn is_variable_length(&self) -> bool {
        matches!(self.id, KeyTypeId::VarChar(_))
    }

    /// Max number of bytes a value of this type takes up.
    pub const fn maximum_byte_length(&self) -> usize {
        match self.id {
            KeyTypeId::Int32 | KeyTypeId::Float32 | KeyTypeId::Date32 => 4,
            KeyTypeId::Int64 | KeyTypeId::Float64 => 8,
            KeyTypeId::Char(len) | KeyTypeId::VarChar(len) => len,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            KeyTypeId::Int32 => write!(f, "Int32")?,
            KeyTypeId::Int64 => write!(f, "Int64")?,
            KeyTypeId::Float32 => write!(f, "Float32")?,
            KeyTypeId::Float64 => write!(f, "Float64")?,
            KeyTypeId::Date32 => write!(f, "Date32")?,
            KeyTypeId::Char(len) => write!(f, "Char({len})")?,
            KeyTypeId::VarChar(len) => write!(f, "VarChar({len})")?,
        }
        if self.nullable {
            write!(f, " NULL")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_lengths() {
        assert_eq!(4, KeyType::new(KeyTypeId::Int32).maximum_byte_length());
        assert_eq!(8, KeyType::new(KeyTypeId::Float64).maximum_byte_length());
        assert_eq!(3, KeyType::new(KeyTypeId::Char(3)).maximum_byte_length());
        assert!(!KeyType::new(KeyTypeId::Char(3)).is_variable_length());
        assert!(KeyType::new(KeyTypeId::VarChar(3)).is_variable_length());
    }

    #[test]
    fn display() {
        assert_eq!("Int64", KeyType::new(KeyTypeId::Int64).to_string());
        assert_eq!(
            "Char(4) NULL",
            KeyType::new_nullable(KeyTypeId::Char(4)).to_string()
        );
    }
}
