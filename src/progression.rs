//! Progression engine: experience accumulation, multi-level level-up
//! resolution, and rebirth transitions.
//!
//! The functions here are pure over the entity snapshot plus injected content
//! tables; notification and persistence side effects belong to the world
//! glue that calls them.

use crate::entity::EntitySnapshot;
use crate::errors::CoreError;
use crate::types::{
    RebirthRow, MANUAL_ALLOT_BONUS, MAX_ATTRIBUTE_POINTS, MAX_LEVEL, MAX_VIRTUE_POINTS,
    POINTS_PER_LEVEL, VIRTUE_LEVEL_CUTOFF,
};
use crate::world::LevelTable;

/// What a single `award_experience` call produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LevelUpOutcome {
    /// Levels attained, in order; one level-up notification is owed per entry.
    pub levels_gained: Vec<u8>,
    pub attribute_points_granted: u16,
    pub virtue_granted: u32,
    /// Mentor-experience credit accumulated for the drip subsystem.
    pub mentor_credit_granted: u64,
    /// Experience thrown away at the level cap or table end.
    pub experience_discarded: u64,
}

impl LevelUpOutcome {
    pub fn leveled(&self) -> bool {
        !self.levels_gained.is_empty()
    }
}

/// Add experience and resolve every level threshold it crosses.
///
/// Each gained level grants attribute points (more when the player allots
/// manually), virtue points while at or below the virtue cutoff, and mentor
/// credit proportional to the experience consumed. Experience past the level
/// cap or the table's last row is discarded, never banked.
pub fn award_experience(
    snapshot: &mut EntitySnapshot,
    amount: u64,
    levels: &dyn LevelTable,
    mentor_share_percent: u32,
) -> LevelUpOutcome {
    let mut outcome = LevelUpOutcome::default();
    snapshot.experience = snapshot.experience.saturating_add(amount);

    while snapshot.level < MAX_LEVEL {
        let Some(threshold) = levels.threshold(snapshot.level) else {
            // Table ran out below the cap; discard the overflow.
            outcome.experience_discarded += snapshot.experience;
            snapshot.experience = 0;
            break;
        };
        if snapshot.experience < threshold {
            break;
        }
        snapshot.experience -= threshold;
        snapshot.level += 1;
        outcome.levels_gained.push(snapshot.level);

        let mut points = POINTS_PER_LEVEL;
        if !snapshot.auto_allot {
            points += MANUAL_ALLOT_BONUS;
        }
        snapshot.attribute_points = snapshot
            .attribute_points
            .saturating_add(points)
            .min(MAX_ATTRIBUTE_POINTS);
        outcome.attribute_points_granted += points;

        if snapshot.level <= VIRTUE_LEVEL_CUTOFF {
            snapshot.virtue_points = snapshot.virtue_points.saturating_add(1).min(MAX_VIRTUE_POINTS);
            outcome.virtue_granted += 1;
        }

        let credit = threshold * mentor_share_percent as u64 / 100;
        snapshot.mentor_credit = snapshot.mentor_credit.saturating_add(credit);
        outcome.mentor_credit_granted += credit;
    }

    if snapshot.level >= MAX_LEVEL && snapshot.experience > 0 {
        outcome.experience_discarded += snapshot.experience;
        snapshot.experience = 0;
    }

    if outcome.leveled() {
        if snapshot.auto_allot {
            auto_allot_points(snapshot);
        }
        snapshot.touch();
    }
    outcome
}

/// Distribute banked attribute points across base attributes using the
/// profession's weighting. Only called for auto-allot characters.
pub fn auto_allot_points(snapshot: &mut EntitySnapshot) {
    let points = snapshot.attribute_points;
    if points == 0 {
        return;
    }
    // Profession families: 1x warrior, 2x archer, 3x mage, otherwise balanced.
    let (str_w, agi_w, vit_w, spi_w) = match snapshot.profession / 10 {
        1 => (2, 0, 1, 0),
        2 => (1, 2, 0, 0),
        3 => (0, 0, 1, 2),
        _ => (1, 1, 1, 0),
    };
    let total_w: u16 = str_w + agi_w + vit_w + spi_w;
    let unit = points / total_w;
    let remainder = points % total_w;
    snapshot.strength = snapshot.strength.saturating_add(unit * str_w);
    snapshot.agility = snapshot.agility.saturating_add(unit * agi_w);
    snapshot.vitality = snapshot.vitality.saturating_add(unit * vit_w + remainder);
    snapshot.spirit = snapshot.spirit.saturating_add(unit * spi_w);
    snapshot.attribute_points = 0;
    snapshot.touch();
}

/// Partial level credit (offline training and similar) as floor/ratio
/// arithmetic against the experience row for the *current* level.
pub fn partial_level_exp(
    snapshot: &EntitySnapshot,
    levels: &dyn LevelTable,
    percent: u64,
) -> u64 {
    levels
        .threshold(snapshot.level)
        .map(|threshold| threshold * percent / 100)
        .unwrap_or(0)
}

/// What applying a rebirth row produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebirthOutcome {
    pub new_profession: u16,
    pub new_level: u8,
    pub carry_over_points: u16,
    pub skills_learned: Vec<u32>,
    pub skills_removed: Vec<u32>,
}

/// Apply a validated rebirth row: reset level and attributes to the
/// profession-seeded baseline plus a carry-over bonus from the prior level
/// and rebirth count, degrade equipped gear, and run the skill transitions.
///
/// Eligibility must already have been checked against the rebirth table.
pub fn apply_rebirth(snapshot: &mut EntitySnapshot, row: &RebirthRow) -> Result<RebirthOutcome, CoreError> {
    if snapshot.level < row.min_level {
        return Err(CoreError::validation(format!(
            "rebirth requires level {}, currently {}",
            row.min_level, snapshot.level
        )));
    }
    let prior_level = snapshot.level as u16;

    // Carry-over: one point per level past the requirement, plus a growing
    // bonus per completed rebirth.
    let carry_over = (prior_level - row.min_level as u16)
        .saturating_add(10 * (snapshot.rebirth_count as u16 + 1))
        .min(MAX_ATTRIBUTE_POINTS);

    snapshot.profession = row.to_profession;
    snapshot.level = row.reset_level;
    snapshot.experience = 0;
    snapshot.rebirth_count = snapshot.rebirth_count.saturating_add(1);
    snapshot.strength = row.base_strength;
    snapshot.agility = row.base_agility;
    snapshot.vitality = row.base_vitality;
    snapshot.spirit = row.base_spirit;
    snapshot.attribute_points = carry_over;

    for item in snapshot.equipment.values_mut() {
        item.durability = item.durability * 7 / 10;
    }

    let mut learned = Vec::new();
    let mut removed = Vec::new();
    for skill in &row.remove_skills {
        if snapshot.skills.remove(skill).is_some() {
            removed.push(*skill);
        }
    }
    for skill in &row.learn_skills {
        snapshot.skills.entry(*skill).or_insert(1);
        learned.push(*skill);
    }

    snapshot.touch();
    Ok(RebirthOutcome {
        new_profession: row.to_profession,
        new_level: row.reset_level,
        carry_over_points: carry_over,
        skills_learned: learned,
        skills_removed: removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, EquipSlot, ItemInstance, Position};
    use crate::world::StaticLevelTable;

    fn snapshot() -> EntitySnapshot {
        EntitySnapshot::new(
            EntityId(5),
            "dave",
            10,
            Position {
                map_id: 1002,
                x: 0,
                y: 0,
            },
        )
    }

    fn table() -> StaticLevelTable {
        // Level 1 needs 1000, level 2 needs 1200, level 3 needs 1500, then 2000s.
        StaticLevelTable::new(vec![1000, 1200, 1500, 2000, 2000, 2000])
    }

    #[test]
    fn spanning_three_thresholds_lands_on_level_four() {
        let mut snap = snapshot();
        let outcome = award_experience(&mut snap, 3000, &table(), 0);
        assert_eq!(snap.level, 3);
        assert_eq!(outcome.levels_gained, vec![2, 3]);
        assert_eq!(snap.experience, 3000 - 1000 - 1200);

        let outcome = award_experience(&mut snap, 700, &table(), 0);
        assert_eq!(snap.level, 4);
        assert_eq!(outcome.levels_gained, vec![4]);
        assert_eq!(snap.experience, 0);
    }

    #[test]
    fn points_and_virtue_credited_per_level() {
        let mut snap = snapshot();
        snap.auto_allot = false;
        let outcome = award_experience(&mut snap, 3700, &table(), 0);
        assert_eq!(outcome.levels_gained, vec![2, 3, 4]);
        assert_eq!(
            outcome.attribute_points_granted,
            3 * (POINTS_PER_LEVEL + MANUAL_ALLOT_BONUS)
        );
        assert_eq!(outcome.virtue_granted, 3);
        assert_eq!(snap.attribute_points, outcome.attribute_points_granted);
    }

    #[test]
    fn auto_allot_spends_the_banked_points() {
        let mut snap = snapshot();
        snap.auto_allot = true;
        let before_vit = snap.vitality;
        let outcome = award_experience(&mut snap, 1000, &table(), 0);
        assert!(outcome.leveled());
        assert_eq!(snap.attribute_points, 0);
        assert!(snap.vitality > before_vit || snap.strength > 5);
    }

    #[test]
    fn experience_past_table_end_is_discarded() {
        let mut snap = snapshot();
        snap.level = MAX_LEVEL - 1;
        // Table has no row for MAX_LEVEL - 1.
        let outcome = award_experience(&mut snap, 5000, &table(), 0);
        assert_eq!(outcome.experience_discarded, 5000);
        assert_eq!(snap.experience, 0);
        assert_eq!(snap.level, MAX_LEVEL - 1);
    }

    #[test]
    fn mentor_credit_tracks_consumed_experience() {
        let mut snap = snapshot();
        let outcome = award_experience(&mut snap, 2200, &table(), 10);
        // Crossed levels 1 and 2: thresholds 1000 + 1200 at 10%.
        assert_eq!(outcome.mentor_credit_granted, 100 + 120);
        assert_eq!(snap.mentor_credit, 220);
    }

    #[test]
    fn partial_credit_uses_current_level_row() {
        let mut snap = snapshot();
        snap.level = 2;
        // Current level 2 row is 1200, not level 3's 1500.
        assert_eq!(partial_level_exp(&snap, &table(), 50), 600);
    }

    #[test]
    fn rebirth_resets_and_carries_over() {
        let mut snap = snapshot();
        snap.level = 120;
        snap.experience = 999;
        snap.skills.insert(1001, 9);
        snap.equipment
            .insert(EquipSlot::Weapon, ItemInstance::new(7));
        snap.equipment.get_mut(&EquipSlot::Weapon).unwrap().durability = 100;

        let row = RebirthRow {
            min_level: 110,
            from_profession: 10,
            to_profession: 21,
            reset_level: 15,
            base_strength: 20,
            base_agility: 20,
            base_vitality: 15,
            base_spirit: 5,
            learn_skills: vec![2001],
            remove_skills: vec![1001],
        };
        let outcome = apply_rebirth(&mut snap, &row).expect("rebirth");
        assert_eq!(snap.level, 15);
        assert_eq!(snap.experience, 0);
        assert_eq!(snap.profession, 21);
        assert_eq!(snap.rebirth_count, 1);
        assert_eq!(outcome.carry_over_points, (120 - 110) + 10);
        assert_eq!(snap.equipment[&EquipSlot::Weapon].durability, 70);
        assert!(snap.skills.contains_key(&2001));
        assert!(!snap.skills.contains_key(&1001));
        assert_eq!(outcome.skills_removed, vec![1001]);
    }

    #[test]
    fn rebirth_below_minimum_level_rejected() {
        let mut snap = snapshot();
        snap.level = 50;
        let row = RebirthRow {
            min_level: 110,
            from_profession: 10,
            to_profession: 21,
            reset_level: 15,
            base_strength: 20,
            base_agility: 20,
            base_vitality: 15,
            base_spirit: 5,
            learn_skills: vec![],
            remove_skills: vec![],
        };
        assert!(apply_rebirth(&mut snap, &row).is_err());
        assert_eq!(snap.level, 50);
        assert_eq!(snap.rebirth_count, 0);
    }
}
