use std::cmp::Ordering;

use preagg_error::{DbError, Result};

use super::hash::hash_prefix;
use super::{ReductionKernels, RowError};
use crate::datum::{Datum, PartialRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Int,
    Text,
}

/// A grouping key read from an input column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupKey {
    pub column: usize,
    pub key_type: KeyType,
}

impl GroupKey {
    pub const fn int(column: usize) -> Self {
        GroupKey {
            column,
            key_type: KeyType::Int,
        }
    }

    pub const fn text(column: usize) -> Self {
        GroupKey {
            column,
            key_type: KeyType::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// COUNT(*) when the column is None, otherwise COUNT(col).
    Count(Option<usize>),
    Sum(usize),
    Min(usize),
    Max(usize),
    /// MAX over a text column.
    MaxText(usize),
}

impl AggregateKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::Sum(_) => "sum",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::MaxText(_) => "max_text",
        }
    }
}

/// Reduction module for simple grouped aggregates.
#[derive(Debug, Clone)]
pub struct GroupedAggregateKernels {
    keys: Vec<GroupKey>,
    aggregates: Vec<AggregateKind>,
}

impl GroupedAggregateKernels {
    pub fn new(
        keys: impl IntoIterator<Item = GroupKey>,
        aggregates: impl IntoIterator<Item = AggregateKind>,
    ) -> Self {
        GroupedAggregateKernels {
            keys: keys.into_iter().collect(),
            aggregates: aggregates.into_iter().collect(),
        }
    }

    pub fn keys(&self) -> &[GroupKey] {
        &self.keys
    }

    pub fn aggregates(&self) -> &[AggregateKind] {
        &self.aggregates
    }

    fn project_key(key: &GroupKey, datum: Option<&Datum>) -> Result<Datum, RowError> {
        let datum = datum.ok_or_else(|| {
            RowError::Fatal(
                DbError::new("Input row missing key column").with_field("column", key.column),
            )
        })?;

        match (key.key_type, datum) {
            (_, Datum::Null) => Ok(Datum::Null),
            (KeyType::Int, Datum::Int64(_)) => Ok(datum.clone()),
            (KeyType::Text, Datum::Text(_)) => Ok(datum.clone()),
            _ => Err(RowError::CpuReCheck),
        }
    }

    fn project_state(agg: &AggregateKind, row: &[Datum]) -> Result<Datum, RowError> {
        let get = |col: usize| {
            row.get(col).ok_or_else(|| {
                RowError::Fatal(
                    DbError::new("Input row missing aggregate column").with_field("column", col),
                )
            })
        };

        Ok(match agg {
            AggregateKind::Count(None) => Datum::Int64(1),
            AggregateKind::Count(Some(col)) => {
                Datum::Int64(if get(*col)?.is_null() { 0 } else { 1 })
            }
            AggregateKind::Sum(col) | AggregateKind::Min(col) | AggregateKind::Max(col) => {
                match get(*col)? {
                    d @ (Datum::Null | Datum::Int64(_) | Datum::Float64(_)) => d.clone(),
                    Datum::Text(_) => return Err(RowError::CpuReCheck),
                }
            }
            AggregateKind::MaxText(col) => match get(*col)? {
                d @ (Datum::Null | Datum::Text(_)) => d.clone(),
                _ => return Err(RowError::CpuReCheck),
            },
        })
    }

    fn combine_states(&self, acc: &mut [Datum], row: &[Datum]) -> Result<(), RowError> {
        let nkeys = self.keys.len();
        if acc.len() != row.len() || acc.len() != self.num_columns() {
            return Err(DbError::new("Partial row width mismatch")
                .with_field("acc", acc.len())
                .with_field("row", row.len())
                .into());
        }

        // Compute every new state before writing any, so a failing aggregate
        // leaves the accumulator as it was.
        let mut updates = Vec::new();
        for (idx, agg) in self.aggregates.iter().enumerate() {
            let col = nkeys + idx;
            if let Some(new) = combine_state(agg, &acc[col], &row[col])? {
                updates.push((col, new));
            }
        }
        for (col, new) in updates {
            acc[col] = new;
        }

        Ok(())
    }
}

/// Combine a single partial state, returning the new state if it changed.
fn combine_state(
    agg: &AggregateKind,
    state: &Datum,
    input: &Datum,
) -> Result<Option<Datum>, RowError> {
    if input.is_null() {
        return Ok(None);
    }
    if state.is_null() {
        return Ok(Some(input.clone()));
    }

    let new = match agg {
        AggregateKind::Count(_) | AggregateKind::Sum(_) => match (state, input) {
            // Overflow is left to the CPU, which may widen the type.
            (Datum::Int64(a), Datum::Int64(b)) => {
                Datum::Int64(a.checked_add(*b).ok_or(RowError::CpuReCheck)?)
            }
            (a, b) => match (a.try_as_f64(), b.try_as_f64()) {
                (Some(a), Some(b)) => Datum::Float64(a + b),
                _ => return Err(state_type_error(agg, state, input).into()),
            },
        },
        AggregateKind::Min(_) | AggregateKind::Max(_) => {
            let ord = compare_numeric(state, input)
                .ok_or_else(|| state_type_error(agg, state, input))?;
            let replace = match agg {
                AggregateKind::Min(_) => ord == Ordering::Greater,
                _ => ord == Ordering::Less,
            };
            if !replace {
                return Ok(None);
            }
            input.clone()
        }
        AggregateKind::MaxText(_) => match (state.try_as_str(), input.try_as_str()) {
            (Some(a), Some(b)) => {
                if a >= b {
                    return Ok(None);
                }
                input.clone()
            }
            _ => return Err(state_type_error(agg, state, input).into()),
        },
    };

    Ok(Some(new))
}

fn compare_numeric(a: &Datum, b: &Datum) -> Option<Ordering> {
    match (a, b) {
        (Datum::Int64(a), Datum::Int64(b)) => Some(a.cmp(b)),
        _ => a.try_as_f64()?.partial_cmp(&b.try_as_f64()?),
    }
}

fn state_type_error(agg: &AggregateKind, state: &Datum, input: &Datum) -> DbError {
    DbError::new("Unexpected partial state types")
        .with_field("aggregate", agg.name())
        .with_field("state", format!("{state:?}"))
        .with_field("input", format!("{input:?}"))
}

impl ReductionKernels for GroupedAggregateKernels {
    fn num_group_keys(&self) -> usize {
        self.keys.len()
    }

    fn num_columns(&self) -> usize {
        self.keys.len() + self.aggregates.len()
    }

    fn has_notbyval(&self) -> bool {
        self.keys.iter().any(|k| k.key_type == KeyType::Text)
            || self
                .aggregates
                .iter()
                .any(|a| matches!(a, AggregateKind::MaxText(_)))
    }

    fn projection(&self, row: &[Datum]) -> Result<PartialRow, RowError> {
        let mut out = Vec::with_capacity(self.num_columns());
        for key in &self.keys {
            out.push(Self::project_key(key, row.get(key.column))?);
        }
        for agg in &self.aggregates {
            out.push(Self::project_state(agg, row)?);
        }
        Ok(out)
    }

    fn hash_value(&self, row: &[Datum]) -> u64 {
        hash_prefix(row, self.keys.len())
    }

    fn key_match(&self, a: &[Datum], b: &[Datum]) -> bool {
        let n = self.keys.len();
        a.len() >= n && b.len() >= n && a[..n] == b[..n]
    }

    fn local_combine(&self, acc: &mut [Datum], row: &[Datum]) -> Result<(), RowError> {
        self.combine_states(acc, row)
    }

    fn global_combine(&self, acc: &mut [Datum], row: &[Datum]) -> Result<(), RowError> {
        self.combine_states(acc, row)
    }

    fn nogroup_combine(&self, acc: &mut [Datum], row: &[Datum]) -> Result<(), RowError> {
        self.combine_states(acc, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_sum() -> GroupedAggregateKernels {
        GroupedAggregateKernels::new(
            [GroupKey::int(0)],
            [AggregateKind::Count(None), AggregateKind::Sum(1)],
        )
    }

    #[test]
    fn project_and_combine() {
        let k = count_sum();
        let mut acc = k.projection(&[Datum::Int64(1), Datum::Int64(10)]).unwrap();
        let row = k.projection(&[Datum::Int64(1), Datum::Int64(5)]).unwrap();

        assert!(k.key_match(&acc, &row));
        assert_eq!(k.hash_value(&acc), k.hash_value(&row));

        k.global_combine(&mut acc, &row).unwrap();
        assert_eq!(vec![Datum::Int64(1), Datum::Int64(2), Datum::Int64(15)], acc);
    }

    #[test]
    fn sum_skips_nulls() {
        let k = count_sum();
        let mut acc = k.projection(&[Datum::Int64(1), Datum::Null]).unwrap();
        let row = k.projection(&[Datum::Int64(1), Datum::Int64(3)]).unwrap();
        k.local_combine(&mut acc, &row).unwrap();
        assert_eq!(Datum::Int64(3), acc[2]);
    }

    #[test]
    fn text_in_numeric_aggregate_needs_recheck() {
        let k = count_sum();
        let err = k
            .projection(&[Datum::Int64(1), Datum::text("oops")])
            .unwrap_err();
        assert!(matches!(err, RowError::CpuReCheck));
    }

    #[test]
    fn wrong_key_type_needs_recheck() {
        let k = count_sum();
        let err = k
            .projection(&[Datum::text("1"), Datum::Int64(1)])
            .unwrap_err();
        assert!(matches!(err, RowError::CpuReCheck));
    }

    #[test]
    fn missing_column_is_fatal() {
        let k = count_sum();
        let err = k.projection(&[Datum::Int64(1)]).unwrap_err();
        assert!(matches!(err, RowError::Fatal(_)));
    }

    #[test]
    fn min_max_text() {
        let k = GroupedAggregateKernels::new(
            [GroupKey::text(0)],
            [
                AggregateKind::Min(1),
                AggregateKind::Max(1),
                AggregateKind::MaxText(2),
            ],
        );
        assert!(k.has_notbyval());

        let mut acc = k
            .projection(&[Datum::text("a"), Datum::Int64(5), Datum::text("pear")])
            .unwrap();
        let row = k
            .projection(&[Datum::text("a"), Datum::Float64(2.5), Datum::text("plum")])
            .unwrap();
        k.global_combine(&mut acc, &row).unwrap();

        assert_eq!(
            vec![
                Datum::text("a"),
                Datum::Float64(2.5),
                Datum::Int64(5),
                Datum::text("plum")
            ],
            acc
        );
    }

    #[test]
    fn sum_overflow_needs_recheck() {
        let k = count_sum();
        let mut acc = k.projection(&[Datum::Int64(1), Datum::Int64(i64::MAX)]).unwrap();
        let before = acc.clone();
        let row = k.projection(&[Datum::Int64(1), Datum::Int64(1)]).unwrap();

        let err = k.global_combine(&mut acc, &row).unwrap_err();
        assert!(matches!(err, RowError::CpuReCheck));
        // Count was combinable but isn't applied on its own.
        assert_eq!(before, acc);
    }

    #[test]
    fn mismatched_states_are_fatal() {
        let k = count_sum();
        let mut acc = vec![Datum::Int64(1), Datum::Int64(1), Datum::text("x")];
        let row = vec![Datum::Int64(1), Datum::Int64(1), Datum::Int64(2)];
        let err = k.local_combine(&mut acc, &row).unwrap_err();
        assert!(matches!(err, RowError::Fatal(_)));
    }
}
