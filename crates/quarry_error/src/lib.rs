use std::error::Error;
use std::fmt;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

/// Shorthand for returning a "not implemented" error.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)+) => {{
        let msg = std::format!($($arg)+);
        return Err($crate::DbError::new(std::format!("Not implemented: {msg}")));
    }};
}

/// Error type used throughout the engine.
///
/// Errors carry a message, an optional source error, and a list of named
/// fields providing extra context (ids, sizes, etc).
#[derive(Debug)]
pub struct DbError {
    inner: Box<DbErrorInner>,
}

#[derive(Debug)]
struct DbErrorInner {
    msg: String,
    source: Option<Box<dyn Error + Send + Sync>>,
    fields: Vec<(&'static str, String)>,
}

impl DbError {
    pub fn new(msg: impl Into<String>) -> Self {
        DbError {
            inner: Box::new(DbErrorInner {
                msg: msg.into(),
                source: None,
                fields: Vec::new(),
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        let mut err = Self::new(msg);
        err.inner.source = Some(source);
        err
    }

    /// Attach a named field to the error.
    pub fn with_field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.inner.fields.push((key, value.to_string()));
        self
    }

    pub fn get_msg(&self) -> &str {
        &self.inner.msg
    }

    /// Get the value of a field by name, if it was set.
    pub fn get_field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;

        if !self.inner.fields.is_empty() {
            write!(f, " (")?;
            for (idx, (key, value)) in self.inner.fields.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}: {value}")?;
            }
            write!(f, ")")?;
        }

        if let Some(source) = &self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

impl From<fmt::Error> for DbError {
    fn from(value: fmt::Error) -> Self {
        DbError::with_source("Format error", Box::new(value))
    }
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        DbError::with_source("IO error", Box::new(value))
    }
}

/// Extension trait for wrapping foreign errors with a message.
pub trait ResultExt<T, E> {
    fn context(self, msg: &'static str) -> Result<T>;
    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T, E> for std::result::Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        self.map_err(|e| DbError::with_source(msg, Box::new(e)))
    }

    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DbError::with_source(f(), Box::new(e)))
    }
}

pub trait OptionExt<T> {
    /// Return an error if the option is None.
    fn required(self, what: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, what: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(DbError::new(format!("Missing required {what}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_fields() {
        let err = DbError::new("Block already mapped")
            .with_field("block", 4)
            .with_field("numa_node", 1);
        assert_eq!(
            "Block already mapped (block: 4, numa_node: 1)",
            err.to_string()
        );
        assert_eq!(Some("4"), err.get_field("block"));
        assert_eq!(None, err.get_field("missing"));
    }

    #[test]
    fn display_with_source() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk on fire"));
        let err = res.context("Failed to read node directory").unwrap_err();
        assert_eq!("Failed to read node directory: disk on fire", err.to_string());
        assert!(err.source().is_some());
    }

    #[test]
    fn option_required() {
        let v: Option<usize> = None;
        let err = v.required("query stats").unwrap_err();
        assert_eq!("Missing required query stats", err.get_msg());
    }

    #[test]
    fn not_implemented_macro() {
        fn unsupported() -> Result<()> {
            not_implemented!("aggregation on {}", "compact table");
        }
        let err = unsupported().unwrap_err();
        assert_eq!("Not implemented: aggregation on compact table", err.get_msg());
    }
}
