//! Teams: bounded rosters with a leader, loot-sharing toggles, and a shared
//! experience bonus recomputed from the online roster.
//!
//! The registry is world-level shared state guarded by a `RwLock`; everything
//! that touches an individual member's entity state goes through that
//! member's mutation stream. Benefit recomputation is a pure function of the
//! roster, so re-running it after any membership event is idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use log::info;

use crate::entity::Entity;
use crate::errors::CoreError;
use crate::types::{EntityId, OutboundMessage, RequestKind, TeamId, TEAM_CAPACITY};
use crate::world::World;

#[derive(Debug, Clone)]
pub struct Team {
    pub id: TeamId,
    pub leader: EntityId,
    pub members: Vec<EntityId>,
    pub money_share: bool,
    pub item_share: bool,
}

#[derive(Default)]
pub struct TeamRegistry {
    teams: RwLock<HashMap<TeamId, Team>>,
    next_id: AtomicU32,
}

impl TeamRegistry {
    fn create(&self, leader: EntityId) -> TeamId {
        let id = TeamId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let team = Team {
            id,
            leader,
            members: vec![leader],
            money_share: false,
            item_share: false,
        };
        self.teams
            .write()
            .expect("team registry poisoned")
            .insert(id, team);
        id
    }

    pub fn get(&self, id: TeamId) -> Option<Team> {
        self.teams
            .read()
            .expect("team registry poisoned")
            .get(&id)
            .cloned()
    }

    pub fn members(&self, id: TeamId) -> Vec<EntityId> {
        self.get(id).map(|t| t.members).unwrap_or_default()
    }

    pub fn leader(&self, id: TeamId) -> Option<EntityId> {
        self.get(id).map(|t| t.leader)
    }

    /// Add a member; re-adding an existing member is a no-op success.
    fn add_member(&self, id: TeamId, member: EntityId) -> Result<(), CoreError> {
        let mut teams = self.teams.write().expect("team registry poisoned");
        let team = teams
            .get_mut(&id)
            .ok_or_else(|| CoreError::validation("team no longer exists"))?;
        if team.members.contains(&member) {
            return Ok(());
        }
        if team.members.len() >= TEAM_CAPACITY {
            return Err(CoreError::exhausted(format!(
                "team is full ({TEAM_CAPACITY} members)"
            )));
        }
        team.members.push(member);
        Ok(())
    }

    /// Remove a member. Returns true when the removed member was the leader.
    fn remove_member(&self, id: TeamId, member: EntityId) -> bool {
        let mut teams = self.teams.write().expect("team registry poisoned");
        let Some(team) = teams.get_mut(&id) else {
            return false;
        };
        team.members.retain(|m| *m != member);
        let was_leader = team.leader == member;
        if team.members.is_empty() {
            teams.remove(&id);
        }
        was_leader
    }

    fn dissolve(&self, id: TeamId) -> Vec<EntityId> {
        self.teams
            .write()
            .expect("team registry poisoned")
            .remove(&id)
            .map(|t| t.members)
            .unwrap_or_default()
    }

    fn set_loot(&self, id: TeamId, money_share: Option<bool>, item_share: Option<bool>) {
        let mut teams = self.teams.write().expect("team registry poisoned");
        if let Some(team) = teams.get_mut(&id) {
            if let Some(m) = money_share {
                team.money_share = m;
            }
            if let Some(i) = item_share {
                team.item_share = i;
            }
        }
    }
}

/// Found a team with this entity as leader and sole member.
pub fn create_team(entity: &mut Entity, world: &Arc<World>) -> Result<TeamId, CoreError> {
    if entity.team.is_some() {
        return Err(CoreError::validation("already in a team"));
    }
    let id = world.teams.create(entity.id());
    entity.team = Some(id);
    info!("{} founded {id}", entity.id());
    recompute_benefits(world, id);
    Ok(id)
}

/// Leader invites `target`; the invitation lands in the target's request map
/// carrying the team id.
pub fn invite(entity: &mut Entity, world: &Arc<World>, target: EntityId) -> Result<(), CoreError> {
    let team = entity
        .team
        .ok_or_else(|| CoreError::validation("not in a team"))?;
    if world.teams.leader(team) != Some(entity.id()) {
        return Err(CoreError::validation("only the leader invites"));
    }
    if world.teams.members(team).len() >= TEAM_CAPACITY {
        return Err(CoreError::exhausted("team is full"));
    }
    let from = entity.id();
    world.enqueue(target, move |other, world| {
        if other.team.is_some() {
            world.send(
                from,
                OutboundMessage::Notice {
                    text: "They already have a team.".into(),
                },
            );
            return;
        }
        match other.requests.put(RequestKind::TeamInvite, from, team.0) {
            Ok(()) => world.send(
                other.id(),
                OutboundMessage::RequestReceived {
                    request: RequestKind::TeamInvite,
                    from,
                },
            ),
            Err(_) => world.send(
                from,
                OutboundMessage::Notice {
                    text: "They already have a pending invitation.".into(),
                },
            ),
        }
    })
}

/// Accept a pending team invitation from `leader`.
pub fn accept_invite(entity: &mut Entity, world: &Arc<World>, leader: EntityId) -> Result<(), CoreError> {
    let pending = entity
        .requests
        .take_from(RequestKind::TeamInvite, leader)
        .ok_or_else(|| CoreError::validation("no team invitation from them"))?;
    if entity.team.is_some() {
        return Err(CoreError::validation("already in a team"));
    }
    let team = TeamId(pending.datum);
    world.teams.add_member(team, entity.id())?;
    entity.team = Some(team);
    info!("{} joined {team}", entity.id());
    recompute_benefits(world, team);
    Ok(())
}

/// Ask the leader of `leader`'s team to be let in.
pub fn request_join(entity: &mut Entity, world: &Arc<World>, leader: EntityId) -> Result<(), CoreError> {
    if entity.team.is_some() {
        return Err(CoreError::validation("already in a team"));
    }
    let from = entity.id();
    world.enqueue(leader, move |l, world| {
        let Some(team) = l.team.filter(|t| world.teams.leader(*t) == Some(l.id())) else {
            world.send(
                from,
                OutboundMessage::Notice {
                    text: "They do not lead a team.".into(),
                },
            );
            return;
        };
        if l.requests.put(RequestKind::TeamJoin, from, team.0).is_ok() {
            world.send(
                l.id(),
                OutboundMessage::RequestReceived {
                    request: RequestKind::TeamJoin,
                    from,
                },
            );
        }
    })
}

/// Leader approves a pending join application.
pub fn approve_join(entity: &mut Entity, world: &Arc<World>, applicant: EntityId) -> Result<(), CoreError> {
    let pending = entity
        .requests
        .take_from(RequestKind::TeamJoin, applicant)
        .ok_or_else(|| CoreError::validation("no application from them"))?;
    let team = TeamId(pending.datum);
    if world.teams.leader(team) != Some(entity.id()) {
        return Err(CoreError::validation("only the leader approves"));
    }
    world.teams.add_member(team, applicant)?;
    world.enqueue(applicant, move |a, world| {
        a.team = Some(team);
        world.send(
            a.id(),
            OutboundMessage::Notice {
                text: "Your application was accepted.".into(),
            },
        );
    })?;
    recompute_benefits(world, team);
    Ok(())
}

/// Leave the team. A departing leader dissolves the whole team.
pub fn leave_team(entity: &mut Entity, world: &Arc<World>) -> Result<(), CoreError> {
    let team = entity
        .team
        .take()
        .ok_or_else(|| CoreError::validation("not in a team"))?;
    let was_leader = world.teams.remove_member(team, entity.id());
    if was_leader {
        dissolve_team(world, team);
    } else {
        recompute_benefits(world, team);
    }
    Ok(())
}

/// Leader removes a member.
pub fn kick(entity: &mut Entity, world: &Arc<World>, target: EntityId) -> Result<(), CoreError> {
    let team = entity
        .team
        .ok_or_else(|| CoreError::validation("not in a team"))?;
    if world.teams.leader(team) != Some(entity.id()) {
        return Err(CoreError::validation("only the leader kicks"));
    }
    if target == entity.id() {
        return Err(CoreError::validation("leaders leave, not kick themselves"));
    }
    world.teams.remove_member(team, target);
    let _ = world.enqueue(target, move |t, world| {
        if t.team == Some(team) {
            t.team = None;
        }
        world.send(
            t.id(),
            OutboundMessage::Notice {
                text: "You were removed from the team.".into(),
            },
        );
    });
    recompute_benefits(world, team);
    Ok(())
}

/// Leader toggles loot sharing.
pub fn set_loot_sharing(
    entity: &mut Entity,
    world: &Arc<World>,
    money_share: Option<bool>,
    item_share: Option<bool>,
) -> Result<(), CoreError> {
    let team = entity
        .team
        .ok_or_else(|| CoreError::validation("not in a team"))?;
    if world.teams.leader(team) != Some(entity.id()) {
        return Err(CoreError::validation("only the leader sets loot rules"));
    }
    world.teams.set_loot(team, money_share, item_share);
    Ok(())
}

/// Detach path: drop an offline member from the roster. Called with the
/// member already cleared from the entity.
pub fn member_went_offline(world: &Arc<World>, team: TeamId, member: EntityId) {
    let was_leader = world.teams.remove_member(team, member);
    if was_leader {
        dissolve_team(world, team);
    } else {
        recompute_benefits(world, team);
    }
}

fn dissolve_team(world: &Arc<World>, team: TeamId) {
    for member in world.teams.dissolve(team) {
        let _ = world.enqueue(member, move |m, world| {
            if m.team == Some(team) {
                m.team = None;
            }
            world.send(
                m.id(),
                OutboundMessage::Notice {
                    text: "The team has disbanded.".into(),
                },
            );
        });
    }
    info!("{team} disbanded");
}

/// Recompute the shared experience bonus from the current roster and push it
/// to every member. Pure over the roster; safe to re-run after any event.
pub fn recompute_benefits(world: &Arc<World>, team: TeamId) {
    let members = world.teams.members(team);
    if members.is_empty() {
        return;
    }
    let bonus = (members.len() as u32 - 1) * world.config.team.exp_share_per_member_percent;
    for member in members {
        let _ = world.enqueue(member, move |m, world| {
            world.send(
                m.id(),
                OutboundMessage::TeamBonusSync {
                    team,
                    exp_share_percent: bonus,
                },
            );
        });
    }
}
