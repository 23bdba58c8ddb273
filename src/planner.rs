//! Discovery fetch sizing
//!
//! Over-requests by a flat factor so that duplicates and shorts can be
//! dropped and still leave enough new items. There is no feedback loop: a
//! shortfall is reported, never re-queried.

/// Largest candidate list requested from discovery in one call
pub const UPSTREAM_BATCH_CEILING: usize = 100;

/// Candidates requested per wanted item
pub const FETCH_MULTIPLIER: usize = 2;

/// Number of candidates to ask discovery for when `target` new items are wanted
pub fn fetch_size(target: usize) -> usize {
    fetch_size_with_ceiling(target, UPSTREAM_BATCH_CEILING)
}

pub fn fetch_size_with_ceiling(target: usize, ceiling: usize) -> usize {
    target.saturating_mul(FETCH_MULTIPLIER).min(ceiling)
}

/// Wanted items that did not survive filtering, if any
pub fn shortfall(target: usize, available: usize) -> usize {
    target.saturating_sub(available)
}
