//! Valid-date interval merging for `DuplicateStrategy::MergeValidDates`.
//!
//! Intervals are half open, `[from, to)`. A null `from` is unbounded below
//! and a null `to` unbounded above.

use crate::domain::model::Value;
use crate::utils::error::Result;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub from: Value,
    pub to: Value,
}

impl Interval {
    pub fn new(from: impl Into<Value>, to: impl Into<Value>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A clipped piece of the primary interval and the reference it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub interval: Interval,
    pub reference: Option<usize>,
}

fn later_start(a: &Value, b: &Value, column: &str) -> Result<Value> {
    Ok(match (a.is_null(), b.is_null()) {
        (true, _) => b.clone(),
        (_, true) => a.clone(),
        _ if a.compare(b, "join", column)? == Ordering::Less => b.clone(),
        _ => a.clone(),
    })
}

fn earlier_end(a: &Value, b: &Value, column: &str) -> Result<Value> {
    Ok(match (a.is_null(), b.is_null()) {
        (true, _) => b.clone(),
        (_, true) => a.clone(),
        _ if a.compare(b, "join", column)? == Ordering::Greater => b.clone(),
        _ => a.clone(),
    })
}

fn is_non_empty(from: &Value, to: &Value, column: &str) -> Result<bool> {
    if from.is_null() || to.is_null() {
        return Ok(true);
    }
    Ok(from.compare(to, "join", column)? == Ordering::Less)
}

/// Clips `primary` against every reference interval, in reference start order.
///
/// Zero-length and reversed pieces are never produced, so an empty or reversed
/// primary yields nothing. Gaps between references are not filled. When
/// nothing overlaps the primary interval comes back whole with no reference.
pub fn merge_valid_dates(primary: &Interval, references: &[Interval], column: &str) -> Result<Vec<Fragment>> {
    if !is_non_empty(&primary.from, &primary.to, column)? {
        return Ok(Vec::new());
    }

    let mut order: Vec<usize> = (0..references.len()).collect();
    let mut failure = None;
    order.sort_by(|&a, &b| {
        references[a]
            .from
            .compare(&references[b].from, "join", column)
            .unwrap_or_else(|e| {
                failure.get_or_insert(e);
                Ordering::Equal
            })
    });
    if let Some(e) = failure {
        return Err(e);
    }

    let mut fragments = Vec::new();
    for index in order {
        let reference = &references[index];
        let from = later_start(&primary.from, &reference.from, column)?;
        let to = earlier_end(&primary.to, &reference.to, column)?;
        if is_non_empty(&from, &to, column)? {
            fragments.push(Fragment {
                interval: Interval { from, to },
                reference: Some(index),
            });
        }
    }

    if fragments.is_empty() {
        fragments.push(Fragment {
            interval: primary.clone(),
            reference: None,
        });
    }
    Ok(fragments)
}
