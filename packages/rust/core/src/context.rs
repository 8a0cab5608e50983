//! Prior-stage context assembly.
//!
//! Regular stages receive the completed outputs of earlier stages, bounded by
//! a character budget: while the total is over budget and more than one item
//! remains, the oldest item is dropped. The terminal synthesis receives every
//! completed output with no bound at all.

use std::collections::VecDeque;

/// Non-empty results at indices `[0, up_to)`, in index order, without any bound.
pub fn collect_prior(results: &[Option<String>], up_to: usize) -> Vec<String> {
    results
        .iter()
        .take(up_to)
        .flatten()
        .filter(|text| !text.trim().is_empty())
        .cloned()
        .collect()
}

/// Prior results bounded to `max_chars` by dropping the oldest first.
///
/// A single remaining item is kept even when it alone exceeds the budget.
pub fn accumulate(results: &[Option<String>], up_to: usize, max_chars: usize) -> Vec<String> {
    let mut items: VecDeque<(usize, String)> = collect_prior(results, up_to)
        .into_iter()
        .map(|text| (text.chars().count(), text))
        .collect();

    let mut total: usize = items.iter().map(|(len, _)| len).sum();
    while total > max_chars && items.len() > 1 {
        if let Some((len, _)) = items.pop_front() {
            total -= len;
        }
    }

    if items.len() == 1 && total > max_chars {
        tracing::debug!(total, max_chars, "single context item exceeds budget, kept");
    }

    items.into_iter().map(|(_, text)| text).collect()
}

/// Total character count of a context list.
pub fn total_chars(items: &[String]) -> usize {
    items.iter().map(|s| s.chars().count()).sum()
}
