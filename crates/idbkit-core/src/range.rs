//! Key ranges and query arguments

use crate::error::{Error, Result};
use crate::key::{EncodedKey, Key};

/// A logical key range with optional open/closed bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// Range matching exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(key.into()),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(key.into()),
            lower_open: false,
            upper_open: open,
        }
    }

    /// Range between two keys. Fails with `DataError` when the range is empty
    /// by construction (lower above upper, or equal with an open side).
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Result<Self> {
        let (lower, upper) = (lower.into(), upper.into());
        lower.check()?;
        upper.check()?;
        match lower.cmp(&upper) {
            std::cmp::Ordering::Greater => {
                return Err(Error::Data("lower bound is greater than upper bound".into()))
            }
            std::cmp::Ordering::Equal if lower_open || upper_open => {
                return Err(Error::Data(
                    "bounds are equal and at least one of them is open".into(),
                ))
            }
            _ => {}
        }
        Ok(Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        })
    }

    pub fn includes(&self, key: &Key) -> bool {
        self.encode().contains(&key.encode())
    }

    /// Byte-level form used by backends.
    pub fn encode(&self) -> KeyRangeSpec {
        KeyRangeSpec {
            lower: self.lower.as_ref().map(Key::encode),
            upper: self.upper.as_ref().map(Key::encode),
            lower_open: self.lower_open,
            upper_open: self.upper_open,
        }
    }
}

/// Encoded bounds; `None` is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRangeSpec {
    pub lower: Option<EncodedKey>,
    pub upper: Option<EncodedKey>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRangeSpec {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(key: EncodedKey) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    pub fn contains(&self, key: &EncodedKey) -> bool {
        let above_lower = match &self.lower {
            None => true,
            Some(lower) if self.lower_open => key > lower,
            Some(lower) => key >= lower,
        };
        let below_upper = match &self.upper {
            None => true,
            Some(upper) if self.upper_open => key < upper,
            Some(upper) => key <= upper,
        };
        above_lower && below_upper
    }

    /// True when no key can satisfy both bounds.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper)) => {
                lower > upper || (lower == upper && (self.lower_open || self.upper_open))
            }
            _ => false,
        }
    }
}

/// Selection argument accepted by reads, deletes and cursors.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Query {
    #[default]
    All,
    Key(Key),
    Range(KeyRange),
}

impl Query {
    /// Validate and encode. Keys are checked here so bad input fails before
    /// a request is queued.
    pub fn encode(&self) -> Result<KeyRangeSpec> {
        match self {
            Query::All => Ok(KeyRangeSpec::all()),
            Query::Key(key) => {
                key.check()?;
                Ok(KeyRangeSpec::only(key.encode()))
            }
            Query::Range(range) => {
                if let Some(lower) = &range.lower {
                    lower.check()?;
                }
                if let Some(upper) = &range.upper {
                    upper.check()?;
                }
                Ok(range.encode())
            }
        }
    }
}

impl From<Key> for Query {
    fn from(key: Key) -> Self {
        Query::Key(key)
    }
}

impl From<KeyRange> for Query {
    fn from(range: KeyRange) -> Self {
        Query::Range(range)
    }
}

impl From<f64> for Query {
    fn from(n: f64) -> Self {
        Query::Key(Key::Number(n))
    }
}

impl From<i32> for Query {
    fn from(n: i32) -> Self {
        Query::Key(Key::from(n))
    }
}

impl From<&str> for Query {
    fn from(s: &str) -> Self {
        Query::Key(Key::from(s))
    }
}

impl From<String> for Query {
    fn from(s: String) -> Self {
        Query::Key(Key::String(s))
    }
}
