//! Tuning configuration for the gameplay core.
//!
//! Game-balance numbers (decay rates, drop percentages, bonus shares, regen
//! amounts) are tuning data rather than structural contracts, so they load
//! from TOML with sensible defaults instead of being hardcoded in the
//! subsystems that consume them.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root tuning configuration, organized by the subsystem that consumes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub scheduler: SchedulerConfig,
    pub pk: PkConfig,
    pub regen: RegenConfig,
    pub mentor: MentorConfig,
    pub combat: CombatConfig,
    pub team: TeamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Base scheduler interval in milliseconds; one tick per entity per interval.
    pub tick_ms: u64,
    /// Seconds between auto-mine attempts.
    pub auto_mine_secs: u64,
    /// Seconds between auto-heal pulses.
    pub auto_heal_secs: u64,
    /// Seconds between team leader position pings.
    pub leader_ping_secs: u64,
    /// Seconds a betrayal stays pending before its consequence lands.
    pub betrayal_grace_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            auto_mine_secs: 3,
            auto_heal_secs: 2,
            leader_ping_secs: 5,
            betrayal_grace_secs: 3 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkConfig {
    /// Seconds between PK point decay steps.
    pub decay_secs: u64,
    /// Points removed per decay step.
    pub decay_amount: u16,
    /// Points awarded for killing an unflagged (white-name) player.
    pub points_per_kill: u16,
    /// Percent chance a red-name victim drops an unbound item on death.
    pub red_drop_percent: u32,
    /// Percent chance a black-name victim drops an unbound item on death.
    pub black_drop_percent: u32,
}

impl Default for PkConfig {
    fn default() -> Self {
        Self {
            decay_secs: 360,
            decay_amount: 1,
            points_per_kill: 10,
            red_drop_percent: 33,
            black_drop_percent: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegenConfig {
    /// Seconds between life/mana regeneration pulses.
    pub pulse_secs: u64,
    pub life_per_pulse: u16,
    pub mana_per_pulse: u16,
    /// Seconds between vigor (mount stamina) pulses.
    pub vigor_pulse_secs: u64,
    pub vigor_per_pulse: u16,
    pub max_vigor: u16,
}

impl Default for RegenConfig {
    fn default() -> Self {
        Self {
            pulse_secs: 4,
            life_per_pulse: 20,
            mana_per_pulse: 30,
            vigor_pulse_secs: 2,
            vigor_per_pulse: 5,
            max_vigor: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MentorConfig {
    /// Seconds between mentor-experience drips.
    pub drip_secs: u64,
    /// Maximum credit transferred per drip.
    pub drip_amount: u64,
    /// Percent of an apprentice's levelling experience credited to the mentor.
    pub share_percent: u32,
}

impl Default for MentorConfig {
    fn default() -> Self {
        Self {
            drip_secs: 10,
            drip_amount: 1000,
            share_percent: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CombatConfig {
    /// Milliseconds between automatic attack rounds.
    pub attack_cadence_ms: u64,
    /// Milliseconds between active-spell pulses.
    pub spell_cadence_ms: u64,
    /// Experience awarded to the killer per point of victim level.
    pub exp_per_victim_level: u64,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            attack_cadence_ms: 1000,
            spell_cadence_ms: 1500,
            exp_per_victim_level: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    /// Percent experience-share bonus contributed by each other online member.
    pub exp_share_per_member_percent: u32,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            exp_share_per_member_percent: 10,
        }
    }
}

impl TuningConfig {
    /// Load tuning values from a TOML file, falling back to defaults for any
    /// omitted section.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| anyhow!("reading {}: {e}", path.as_ref().display()))?;
        let config: TuningConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would stall or divide by zero.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_ms == 0 {
            return Err(anyhow!("scheduler.tick_ms must be nonzero"));
        }
        if self.regen.pulse_secs == 0 || self.regen.vigor_pulse_secs == 0 {
            return Err(anyhow!("regen pulse intervals must be nonzero"));
        }
        if self.pk.decay_secs == 0 {
            return Err(anyhow!("pk.decay_secs must be nonzero"));
        }
        if self.pk.red_drop_percent > 100 || self.pk.black_drop_percent > 100 {
            return Err(anyhow!("pk drop percentages must be <= 100"));
        }
        if self.mentor.share_percent > 100 {
            return Err(anyhow!("mentor.share_percent must be <= 100"));
        }
        if self.combat.attack_cadence_ms == 0 || self.combat.spell_cadence_ms == 0 {
            return Err(anyhow!("combat cadences must be nonzero"));
        }
        Ok(())
    }
}
