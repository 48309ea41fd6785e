//! Logit adjustments applied before a token is picked.

use std::collections::HashSet;

/// Penalizes every token id that already occurs in `history`, once per id:
/// positive scores are divided by `penalty`, negative ones multiplied, so
/// repeated tokens always become less likely. Ids outside `logits` are ignored.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[i64], penalty: f32) {
    if !penalty.is_finite() || penalty <= 0.0 || penalty == 1.0 {
        return;
    }

    let mut seen = HashSet::with_capacity(history.len());
    for &id in history {
        let Ok(idx) = usize::try_from(id) else {
            continue;
        };
        if !seen.insert(idx) {
            continue;
        }
        if let Some(score) = logits.get_mut(idx) {
            if *score > 0.0 {
                *score /= penalty;
            } else {
                *score *= penalty;
            }
        }
    }
}
