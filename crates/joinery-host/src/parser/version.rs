//! Dotted version comparison.

use std::cmp::Ordering;

/// Compares two dotted version strings segment by segment.
///
/// Missing segments count as zero and a leading `v` is ignored. Segments
/// that are not plain numbers compare by their leading digits, then
/// lexically, so `0.1.2-beta` sorts after `0.1.2`.
#[must_use]
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let lhs: Vec<&str> = split(left).collect();
    let rhs: Vec<&str> = split(right).collect();
    let len = lhs.len().max(rhs.len());
    (0..len)
        .map(|index| {
            let a = lhs.get(index).copied().unwrap_or("0");
            let b = rhs.get(index).copied().unwrap_or("0");
            compare_segment(a, b)
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn split(version: &str) -> impl Iterator<Item = &str> {
    let trimmed = version.trim();
    trimmed
        .strip_prefix('v')
        .unwrap_or(trimmed)
        .split('.')
        .filter(|segment| !segment.is_empty())
}

fn compare_segment(left: &str, right: &str) -> Ordering {
    let (left_number, left_rest) = leading_number(left);
    let (right_number, right_rest) = leading_number(right);
    left_number
        .cmp(&right_number)
        .then_with(|| left_rest.cmp(right_rest))
}

fn leading_number(segment: &str) -> (u64, &str) {
    let digits = segment
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(segment.len());
    let (number, rest) = segment.split_at(digits);
    (number.parse().unwrap_or(0), rest)
}
