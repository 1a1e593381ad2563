use ahash::RandomState;

use crate::datum::Datum;

/// State used for all hashing.
///
/// Seeds are fixed so that hashes are stable across runs.
pub const HASH_RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

/// Hash a single datum.
pub fn hash_datum(datum: &Datum) -> u64 {
    match datum {
        Datum::Null => null_hash_value(),
        Datum::Int64(v) => HASH_RANDOM_STATE.hash_one(v.to_ne_bytes()),
        Datum::Float64(v) => HASH_RANDOM_STATE.hash_one(v.to_ne_bytes()),
        Datum::Text(s) => HASH_RANDOM_STATE.hash_one(s.as_bytes()),
    }
}

/// Hash the leading `n` datums of a row.
pub fn hash_prefix(row: &[Datum], n: usize) -> u64 {
    row.iter()
        .take(n)
        .fold(0, |acc, datum| combine_hashes(acc, hash_datum(datum)))
}

/// All nulls hash to the same value.
fn null_hash_value() -> u64 {
    HASH_RANDOM_STATE.hash_one(1)
}

/// Combines two hashes into one hash
pub const fn combine_hashes(l: u64, r: u64) -> u64 {
    let hash = (17 * 37u64).wrapping_add(l);
    hash.wrapping_mul(37).wrapping_add(r)
}
