use crate::session::{ConnectionKind, UserTable};
use std::{string::String, vec::Vec};
use textvm_interpreter::Thread;
use textvm_primitives::{DriverCfg, ObjectFlags, ObjectId, ObjectTable, UserId};

/// Everything outside the execution substrate: objects, sessions, the
/// clock, and the two driver registers the routing discipline saves and
/// restores alongside `current_object`.
#[derive(Debug)]
pub struct World {
    pub objects: ObjectTable,
    pub users: UserTable,
    pub cfg: DriverCfg,
    /// Coarse wall clock fed by the backend; stamps `last_time`.
    pub clock: u64,
    pub command_giver: Option<ObjectId>,
    pub current_interactive: Option<ObjectId>,
}

impl World {
    pub fn new(cfg: DriverCfg) -> Self {
        Self {
            objects: ObjectTable::new(),
            users: UserTable::new(cfg.max_users),
            cfg,
            clock: 0,
            command_giver: None,
            current_interactive: None,
        }
    }

    /// The revalidation check run after anything that may have executed
    /// bytecode: the session must still sit in its slot, point back at the
    /// same object, and the object must still point at the session.
    pub fn ip_valid(&self, user: UserId, ob: ObjectId) -> bool {
        self.users.get(user).is_some_and(|state| state.ob == ob)
            && self
                .objects
                .get(ob)
                .is_some_and(|object| !object.is_destructed() && object.interactive == Some(user))
    }

    /// Attaches a session to a live, not-yet-interactive object.
    pub fn connect(&mut self, ob: ObjectId, connection: ConnectionKind) -> Option<UserId> {
        if !self.objects.is_live(ob) || self.objects.interactive_of(ob).is_some() {
            return None;
        }
        let user = self.users.connect(ob, connection)?;
        let object = self.objects.get_mut(ob)?;
        object.interactive = Some(user);
        object.flags.insert(ObjectFlags::ONCE_INTERACTIVE);
        Some(user)
    }

    pub fn disconnect(&mut self, user: UserId) {
        if let Some(state) = self.users.disconnect(user) {
            if let Some(object) = self.objects.get_mut(state.ob) {
                if object.interactive == Some(user) {
                    object.interactive = None;
                }
            }
        }
    }

    /// Destructs the object; an attached session is torn down with it.
    pub fn destruct(&mut self, ob: ObjectId) {
        if let Some(user) = self.objects.destruct(ob) {
            self.users.disconnect(user);
        }
    }

    /// Writes `msg` to the object. Interactive targets get it queued on
    /// their connection, and every snooper up the chain receives a marked
    /// copy; the chain is finite because the snoop graph is acyclic.
    /// Non-interactive targets have no connection to write to.
    pub fn tell_object(&mut self, ob: ObjectId, msg: &str) {
        if !self.objects.is_live(ob) {
            return;
        }
        let Some(user) = self.objects.interactive_of(ob) else {
            log::debug!("message to non-interactive object {ob} dropped");
            return;
        };
        self.write_to_user(user, msg.as_bytes());
    }

    fn write_to_user(&mut self, user: UserId, bytes: &[u8]) {
        let mut payload: Vec<u8> = bytes.to_vec();
        let mut at = Some(user);
        while let Some(current) = at {
            let Some(state) = self.users.get_mut(current) else {
                break;
            };
            state.queue_output(&payload);
            at = state.snoop_by;
            if at.is_some() {
                let mut marked = Vec::with_capacity(payload.len() + 2);
                marked.extend_from_slice(b"% ");
                marked.extend_from_slice(&payload);
                payload = marked;
            }
        }
    }

    /// Convenience over [`tell_object`](Self::tell_object) for formatted
    /// messages.
    pub fn tell_object_fmt(&mut self, ob: ObjectId, args: core::fmt::Arguments<'_>) {
        let mut msg = String::new();
        let _ = core::fmt::write(&mut msg, args);
        self.tell_object(ob, &msg);
    }
}

/// The whole driver: one execution thread plus the world it acts on. The
/// split lets bytecode entry points borrow both halves independently.
#[derive(Debug)]
pub struct Machine {
    pub thread: Thread,
    pub world: World,
}

impl Machine {
    pub fn new(cfg: DriverCfg) -> Self {
        Self {
            thread: Thread::new(cfg.max_call_depth, cfg.max_error_contexts),
            world: World::new(cfg),
        }
    }

    #[inline]
    pub fn split(&mut self) -> (&mut Thread, &mut World) {
        (&mut self.thread, &mut self.world)
    }

    /// Runs the protected program text under a catch landmark; see
    /// [`Thread::do_catch`] for the recovery contract.
    pub fn do_catch<H: crate::Host>(
        &mut self,
        host: &mut H,
        pc: usize,
    ) -> Result<(), textvm_primitives::ThreadError> {
        let Machine { thread, world } = self;
        thread.do_catch(|t| host.eval_instruction(t, world, pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_wires_both_directions() {
        let mut world = World::new(DriverCfg::default().with_max_users(2));
        let ob = world.objects.create("players/ona");
        let user = world.connect(ob, ConnectionKind::Telnet).unwrap();
        assert!(world.ip_valid(user, ob));
        assert_eq!(world.objects.interactive_of(ob), Some(user));
        // a second session on the same object is refused
        assert!(world.connect(ob, ConnectionKind::Telnet).is_none());
    }

    #[test]
    fn destruct_invalidates_ip() {
        let mut world = World::new(DriverCfg::default().with_max_users(2));
        let ob = world.objects.create("players/ona");
        let user = world.connect(ob, ConnectionKind::Telnet).unwrap();
        world.destruct(ob);
        assert!(!world.ip_valid(user, ob));
        assert!(world.users.get(user).is_none());
    }

    #[test]
    fn snoop_chain_receives_marked_copies() {
        let mut world = World::new(DriverCfg::default().with_max_users(3));
        let a = world.objects.create("a");
        let b = world.objects.create("b");
        let c = world.objects.create("c");
        let ua = world.connect(a, ConnectionKind::Telnet).unwrap();
        let ub = world.connect(b, ConnectionKind::Telnet).unwrap();
        let uc = world.connect(c, ConnectionKind::Telnet).unwrap();
        // a snoops b, c snoops a
        world.users.get_mut(ua).unwrap().snoop_on = Some(ub);
        world.users.get_mut(ub).unwrap().snoop_by = Some(ua);
        world.users.get_mut(uc).unwrap().snoop_on = Some(ua);
        world.users.get_mut(ua).unwrap().snoop_by = Some(uc);

        world.tell_object(b, "hi\n");
        assert_eq!(world.users.get_mut(ub).unwrap().take_output(), b"hi\n");
        assert_eq!(world.users.get_mut(ua).unwrap().take_output(), b"% hi\n");
        assert_eq!(world.users.get_mut(uc).unwrap().take_output(), b"% % hi\n");
    }
}
