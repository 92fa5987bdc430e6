//! Destination and variant selection

use crate::models::{Destination, Variant};

/// Index chosen by weighted roulette, `roll` in `[0, 1)`; `None` when no item has weight
pub fn weighted_index<T>(items: &[T], weight: impl Fn(&T) -> f64, roll: f64) -> Option<usize> {
    let total: f64 = items.iter().map(|item| weight(item).max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }

    let mut target = roll.clamp(0.0, 1.0) * total;
    let mut last_weighted = None;
    for (index, item) in items.iter().enumerate() {
        let w = weight(item).max(0.0);
        if w == 0.0 {
            continue;
        }
        if target < w {
            return Some(index);
        }
        target -= w;
        last_weighted = Some(index);
    }
    // Float rounding can leave a sliver past the last bucket
    last_weighted
}

pub fn pick_destination(destinations: &[Destination], roll: f64) -> Option<(usize, &Destination)> {
    weighted_index(destinations, |d| f64::from(d.weight), roll).map(|i| (i, &destinations[i]))
}

/// Cumulative-percentage roulette; `roll` in `[0, 100)`.
///
/// When the percentages add up to less than the roll the last variant takes
/// the remainder.
pub fn pick_variant(variants: &[Variant], roll: f64) -> Option<&Variant> {
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.percentage.max(0.0);
        if roll < cumulative {
            return Some(variant);
        }
    }
    variants.last()
}

pub fn next_rotation_index(current: usize, len: usize) -> usize {
    if len == 0 {
        0
    } else {
        (current + 1) % len
    }
}
