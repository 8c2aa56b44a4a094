//! Candidate ranking for the visible-mob budget
//!
//! Two candidates are scored factor by factor: whoever wins a factor gets
//! its weight, and both get it on a draw. The higher total wins and an
//! exact tie goes to the left argument. Because of that bias the relation
//! is not a total order, so ranking never goes through a sort.

use std::cmp::Ordering;

use crate::game::entity::EntityId;

pub const PROXIMITY_WEIGHT: u32 = 1;
pub const SIZE_WEIGHT: u32 = 1;
pub const COMBAT_LEVEL_WEIGHT: u32 = 2;
pub const IN_COMBAT_WEIGHT: u32 = 3;

/// What the ranking looks at for one mob, relative to one observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: EntityId,
    /// Distance to the observer
    pub distance: i32,
    pub size: u8,
    pub combat_level: u16,
    pub in_combat: bool,
}

/// Award `weight` to the winner of one factor, or to both on a draw
fn score(left: Ordering, weight: u32, totals: &mut (u32, u32)) {
    match left {
        Ordering::Greater => totals.0 += weight,
        Ordering::Less => totals.1 += weight,
        Ordering::Equal => {
            totals.0 += weight;
            totals.1 += weight;
        }
    }
}

/// `Greater` when `left` should be shown before `right`.
///
/// Never returns `Equal`.
pub fn compare(left: &Candidate, right: &Candidate) -> Ordering {
    let mut totals = (0u32, 0u32);
    // closer is better, so the distance comparison is reversed
    score(right.distance.cmp(&left.distance), PROXIMITY_WEIGHT, &mut totals);
    score(left.size.cmp(&right.size), SIZE_WEIGHT, &mut totals);
    score(
        left.combat_level.cmp(&right.combat_level),
        COMBAT_LEVEL_WEIGHT,
        &mut totals,
    );
    score(
        left.in_combat.cmp(&right.in_combat),
        IN_COMBAT_WEIGHT,
        &mut totals,
    );

    if totals.0 >= totals.1 {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// Split `candidates` into the `budget` best, in rank order, and the rest.
///
/// Candidates are visited in id order and each is inserted in front of the
/// first ranked entry that loses to it, so the outcome only depends on the
/// set of candidates, not the order they were gathered in.
pub fn rank_candidates(
    mut candidates: Vec<Candidate>,
    budget: usize,
) -> (Vec<Candidate>, Vec<Candidate>) {
    candidates.sort_by_key(|c| c.id);

    let mut ranked: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let slot = ranked
            .iter()
            .position(|existing| compare(existing, &candidate) == Ordering::Less)
            .unwrap_or(ranked.len());
        ranked.insert(slot, candidate);
    }

    let overflow = ranked.split_off(budget.min(ranked.len()));
    (ranked, overflow)
}
