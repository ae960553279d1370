use crate::machine::World;
use textvm_primitives::{ObjectId, ThreadError};

/// Lets `me` snoop `you`; a null `you` breaks `me`'s outgoing edge. The
/// permission policy lives in the master object, outside this core; this
/// routine only maintains the graph. Returns `false` (without touching the
/// graph) when either endpoint is destructed or the edge would close a
/// cycle; raises when an endpoint is not interactive.
pub fn set_snoop(
    world: &mut World,
    me: ObjectId,
    you: Option<ObjectId>,
) -> Result<bool, ThreadError> {
    if !world.objects.is_live(me) {
        return Ok(false);
    }
    if let Some(you) = you {
        if !world.objects.is_live(you) {
            return Ok(false);
        }
    }

    let Some(by) = world.objects.interactive_of(me) else {
        return Err(ThreadError::raised(
            "first argument of snoop() is not interactive",
        ));
    };

    let Some(you) = you else {
        if let Some(on) = world.users.get(by).and_then(|s| s.snoop_on) {
            if let Some(peer) = world.users.get_mut(on) {
                peer.snoop_by = None;
            }
            if let Some(state) = world.users.get_mut(by) {
                state.snoop_on = None;
            }
        }
        return Ok(true);
    };

    let Some(on) = world.objects.interactive_of(you) else {
        return Err(ThreadError::raised(
            "second argument of snoop() is not interactive",
        ));
    };

    // refuse edges that would let someone snoop themselves transitively
    let mut walk = Some(on);
    while let Some(current) = walk {
        if current == by {
            return Ok(false);
        }
        walk = world.users.get(current).and_then(|s| s.snoop_on);
    }

    // sever my old outgoing edge and the target's old incoming edge
    if let Some(prev) = world.users.get(by).and_then(|s| s.snoop_on) {
        if let Some(peer) = world.users.get_mut(prev) {
            peer.snoop_by = None;
        }
        if let Some(state) = world.users.get_mut(by) {
            state.snoop_on = None;
        }
    }
    if let Some(prev) = world.users.get(on).and_then(|s| s.snoop_by) {
        if let Some(peer) = world.users.get_mut(prev) {
            peer.snoop_on = None;
        }
        if let Some(state) = world.users.get_mut(on) {
            state.snoop_by = None;
        }
    }

    if let Some(state) = world.users.get_mut(on) {
        state.snoop_by = Some(by);
    }
    if let Some(state) = world.users.get_mut(by) {
        state.snoop_on = Some(on);
    }
    Ok(true)
}

/// Who is snooping `ob`, if anyone.
pub fn query_snoop(world: &World, ob: ObjectId) -> Option<ObjectId> {
    let user = world.objects.interactive_of(ob)?;
    let by = world.users.get(user)?.snoop_by?;
    world.users.get(by).map(|s| s.ob)
}

/// Whom `ob` is snooping, if anyone.
pub fn query_snooping(world: &World, ob: ObjectId) -> Option<ObjectId> {
    let user = world.objects.interactive_of(ob)?;
    let on = world.users.get(user)?.snoop_on?;
    world.users.get(on).map(|s| s.ob)
}
