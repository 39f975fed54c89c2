//! Ordered seeks over `BTreeMap`s
//!
//! Shared by the in-memory backend and by write-set overlays of durable
//! backends, so both answer `record_seek`/`index_seek` identically.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::backend::{Position, ScanDirection};
use crate::key::EncodedKey;
use crate::range::KeyRangeSpec;

fn bound_of(key: Option<&EncodedKey>, open: bool) -> Bound<EncodedKey> {
    match key {
        None => Bound::Unbounded,
        Some(key) if open => Bound::Excluded(key.clone()),
        Some(key) => Bound::Included(key.clone()),
    }
}

fn bound_key(bound: &Bound<EncodedKey>) -> Option<&EncodedKey> {
    match bound {
        Bound::Included(key) | Bound::Excluded(key) => Some(key),
        Bound::Unbounded => None,
    }
}

/// The more restrictive of two lower bounds.
fn tighter_lower(a: Bound<EncodedKey>, b: Bound<EncodedKey>) -> Bound<EncodedKey> {
    match (bound_key(&a), bound_key(&b)) {
        (None, _) => b,
        (_, None) => a,
        (Some(x), Some(y)) if x > y => a,
        (Some(x), Some(y)) if x < y => b,
        _ if matches!(a, Bound::Excluded(_)) => a,
        _ => b,
    }
}

/// The more restrictive of two upper bounds.
fn tighter_upper(a: Bound<EncodedKey>, b: Bound<EncodedKey>) -> Bound<EncodedKey> {
    match (bound_key(&a), bound_key(&b)) {
        (None, _) => b,
        (_, None) => a,
        (Some(x), Some(y)) if x < y => a,
        (Some(x), Some(y)) if x > y => b,
        _ if matches!(a, Bound::Excluded(_)) => a,
        _ => b,
    }
}

/// Key bounds still to be scanned: the range narrowed by a key-level
/// position in the direction of travel.
pub fn scan_bounds(
    range: &KeyRangeSpec,
    direction: ScanDirection,
    after: Option<(&EncodedKey, bool)>,
) -> (Bound<EncodedKey>, Bound<EncodedKey>) {
    let lower = bound_of(range.lower.as_ref(), range.lower_open);
    let upper = bound_of(range.upper.as_ref(), range.upper_open);
    let Some((key, inclusive)) = after else {
        return (lower, upper);
    };
    let position = bound_of(Some(key), !inclusive);
    match direction {
        ScanDirection::Forward => (tighter_lower(lower, position), upper),
        ScanDirection::Reverse => (lower, tighter_upper(upper, position)),
    }
}

/// Whether `BTreeMap::range` may be called with these bounds (it panics on
/// inverted ranges) and they can contain anything.
pub fn bounds_nonempty(lower: &Bound<EncodedKey>, upper: &Bound<EncodedKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(a), Bound::Included(b)) => a <= b,
        (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
            a < b
        }
        _ => true,
    }
}

/// First entry of a flat map in `direction`, past `after` when given.
/// Entries for which `skip` returns true are passed over.
pub fn seek_flat<'a, V>(
    map: &'a BTreeMap<EncodedKey, V>,
    range: &KeyRangeSpec,
    direction: ScanDirection,
    after: Option<&Position>,
    skip: impl Fn(&V) -> bool,
) -> Option<(&'a EncodedKey, &'a V)> {
    let (lower, upper) = scan_bounds(range, direction, after.map(|p| (&p.key, p.inclusive)));
    if !bounds_nonempty(&lower, &upper) {
        return None;
    }
    let mut entries = map.range((lower, upper));
    match direction {
        ScanDirection::Forward => entries.find(|(_, v)| !skip(v)),
        ScanDirection::Reverse => entries.rev().find(|(_, v)| !skip(v)),
    }
}

/// First `(key, primary)` pair of a nested index map in `direction`.
///
/// With a primary key in `after`, the remaining primaries of that same index
/// key are tried before moving on. Without one, the position is key-level:
/// the pair returned is the first primary of the next key in travel order.
pub fn seek_nested(
    map: &BTreeMap<EncodedKey, BTreeSet<EncodedKey>>,
    range: &KeyRangeSpec,
    direction: ScanDirection,
    after: Option<&Position>,
) -> Option<(EncodedKey, EncodedKey)> {
    if let Some(Position {
        key,
        primary: Some(primary),
        inclusive,
    }) = after
    {
        if range.contains(key) {
            if let Some(primaries) = map.get(key) {
                let from = bound_of(Some(primary), !inclusive);
                let found = match direction {
                    ScanDirection::Forward => primaries.range((from, Bound::Unbounded)).next(),
                    ScanDirection::Reverse => {
                        primaries.range((Bound::Unbounded, from)).next_back()
                    }
                };
                if let Some(found) = found {
                    return Some((key.clone(), found.clone()));
                }
            }
        }
    }

    let key_after = after.map(|p| (&p.key, p.inclusive && p.primary.is_none()));
    let (lower, upper) = scan_bounds(range, direction, key_after);
    if !bounds_nonempty(&lower, &upper) {
        return None;
    }
    let mut keys = map.range((lower, upper));
    let (key, primaries) = match direction {
        ScanDirection::Forward => keys.find(|(_, set)| !set.is_empty())?,
        ScanDirection::Reverse => keys.rev().find(|(_, set)| !set.is_empty())?,
    };
    let primary = match direction {
        ScanDirection::Forward => primaries.first()?,
        ScanDirection::Reverse => primaries.last()?,
    };
    Some((key.clone(), primary.clone()))
}
