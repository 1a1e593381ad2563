use std::fmt;
use std::sync::Arc;

/// A single value flowing through the reduction.
///
/// `Text` is the only variable-length (not by-value) variant. When written
/// into the final buffer its bytes are placed out of line in the buffer's
/// extra area.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Int64(i64),
    Float64(f64),
    Text(Arc<str>),
}

impl Datum {
    pub fn text(s: impl AsRef<str>) -> Self {
        Datum::Text(Arc::from(s.as_ref()))
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// If this datum is stored inline in a row slot.
    pub const fn is_by_value(&self) -> bool {
        !matches!(self, Datum::Text(_))
    }

    pub fn try_as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn try_as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn try_as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Number of bytes this value occupies outside of its row slot.
    pub fn out_of_line_len(&self) -> usize {
        match self {
            Datum::Text(s) => s.len(),
            _ => 0,
        }
    }

    /// Bytes moved over the bus when transferring this value.
    pub fn transfer_len(&self) -> usize {
        // One null flag byte plus the 8 byte slot, plus any out of line data.
        9 + self.out_of_line_len()
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Int64(v) => write!(f, "{v}"),
            Datum::Float64(v) => write!(f, "{v}"),
            Datum::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Datum {
    fn from(value: i64) -> Self {
        Datum::Int64(value)
    }
}

impl From<f64> for Datum {
    fn from(value: f64) -> Self {
        Datum::Float64(value)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Datum::text(value)
    }
}

/// A projected row holding grouping keys followed by partial aggregate
/// states.
pub type PartialRow = Vec<Datum>;
