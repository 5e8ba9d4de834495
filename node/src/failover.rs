//! Reaction to a timed-out peer
//!
//! Each node decides on its own from its local copy of the roster; there is
//! no voting round. The plan is pure data so the Session Manager can apply it
//! outside of any lock and tests can check it without sockets.
//!
//! Assumes at most one failure per detection window. A partition can leave two
//! nodes that both believe they are MASTER; nothing here resolves that.

use shared::{NodeRole, Player};
use std::net::SocketAddr;

/// What the local node knows when a peer times out
#[derive(Debug, Clone, Copy)]
pub struct FailoverContext<'a> {
    pub local_role: NodeRole,
    pub local_id: i32,
    pub roster: &'a [Player],
    /// Where this node currently sends MASTER-bound traffic
    pub master_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverAction {
    /// Drop the lost player from the roster; its snake turns into a zombie
    RemovePlayer { player_id: i32 },
    /// Best-effort notice to the lost player that it is only a viewer now
    NotifyViewer { player_id: i32, addr: SocketAddr },
    /// Make a NORMAL the new DEPUTY and tell it who the MASTER is
    AppointDeputy { player_id: i32, addr: SocketAddr },
    /// Take over the session as MASTER
    PromoteSelf,
    /// Tell a surviving player that the sender is MASTER now
    AnnounceMaster { player_id: i32, addr: SocketAddr },
    /// Send MASTER-bound traffic to the DEPUTY until it confirms its promotion
    RedirectToDeputy { addr: SocketAddr },
}

/// Computes the local reaction to `lost` going silent
pub fn plan(ctx: &FailoverContext<'_>, lost: SocketAddr) -> Vec<FailoverAction> {
    match ctx.local_role {
        NodeRole::Master => plan_as_master(ctx, lost),
        NodeRole::Deputy => plan_as_deputy(ctx, lost),
        NodeRole::Normal | NodeRole::Viewer => plan_as_follower(ctx, lost),
    }
}

fn plan_as_master(ctx: &FailoverContext<'_>, lost: SocketAddr) -> Vec<FailoverAction> {
    let Some(player) = ctx
        .roster
        .iter()
        .find(|p| p.id != ctx.local_id && p.address == Some(lost))
    else {
        return Vec::new();
    };

    if player.role == NodeRole::Deputy {
        let mut actions = vec![FailoverAction::RemovePlayer {
            player_id: player.id,
        }];
        if let Some(next) = pick_deputy(ctx.roster, &[ctx.local_id, player.id]) {
            actions.push(next);
        }
        actions
    } else {
        vec![
            FailoverAction::NotifyViewer {
                player_id: player.id,
                addr: lost,
            },
            FailoverAction::RemovePlayer {
                player_id: player.id,
            },
        ]
    }
}

fn plan_as_deputy(ctx: &FailoverContext<'_>, lost: SocketAddr) -> Vec<FailoverAction> {
    if ctx.master_addr != Some(lost) {
        return Vec::new();
    }

    let old_master = ctx
        .roster
        .iter()
        .find(|p| p.role == NodeRole::Master && p.id != ctx.local_id);
    let mut excluded = vec![ctx.local_id];
    if let Some(master) = old_master {
        excluded.push(master.id);
    }

    let mut actions = vec![FailoverAction::PromoteSelf];
    if let Some(master) = old_master {
        actions.push(FailoverAction::RemovePlayer {
            player_id: master.id,
        });
    }

    let deputy = pick_deputy(ctx.roster, &excluded);
    let deputy_id = match &deputy {
        Some(FailoverAction::AppointDeputy { player_id, .. }) => Some(*player_id),
        _ => None,
    };
    actions.extend(deputy);

    for player in ctx.roster {
        if excluded.contains(&player.id) || Some(player.id) == deputy_id {
            continue;
        }
        if let Some(addr) = player.address {
            actions.push(FailoverAction::AnnounceMaster {
                player_id: player.id,
                addr,
            });
        }
    }
    actions
}

fn plan_as_follower(ctx: &FailoverContext<'_>, lost: SocketAddr) -> Vec<FailoverAction> {
    if ctx.master_addr != Some(lost) {
        return Vec::new();
    }

    ctx.roster
        .iter()
        .find(|p| p.role == NodeRole::Deputy && p.id != ctx.local_id)
        .and_then(|deputy| deputy.address)
        .filter(|addr| *addr != lost)
        .map(|addr| vec![FailoverAction::RedirectToDeputy { addr }])
        .unwrap_or_default()
}

/// Chooses the reachable NORMAL with the lowest id, skipping `excluded`
pub fn pick_deputy(roster: &[Player], excluded: &[i32]) -> Option<FailoverAction> {
    roster
        .iter()
        .filter(|p| p.role == NodeRole::Normal && !excluded.contains(&p.id))
        .filter_map(|p| p.address.map(|addr| (p.id, addr)))
        .min_by_key(|(id, _)| *id)
        .map(|(player_id, addr)| FailoverAction::AppointDeputy { player_id, addr })
}
