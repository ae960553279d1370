use crate::buffer::InputBuffer;
use bitflags::bitflags;
use std::{rc::Rc, vec::Vec};
use textvm_primitives::{FunPtr, ObjectId, UserId, Value};

bitflags! {
    /// Per-session mode and bookkeeping bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SessionFlags: u16 {
        /// Echo is suppressed until the next command arrives.
        const NOECHO = 1 << 0;
        /// The `'!'` shell escape is disabled while a redirect is pending.
        const NOESC = 1 << 1;
        /// Every received octet is a complete command.
        const SINGLE_CHAR = 1 << 2;
        /// Single-char mode parked while the user types an escaped line.
        const WAS_SINGLE_CHAR = 1 << 3;
        /// The input buffer holds (what looks like) a complete command.
        const CMD_IN_BUF = 1 << 4;
        /// Turn token granted by the tick scheduler; consumed on dispatch.
        const HAS_CMD_TURN = 1 << 5;
        /// The user object supplies its own `write_prompt`.
        const HAS_WRITE_PROMPT = 1 << 6;
        /// Commands are offered to the user object's `process_input` first.
        const HAS_PROCESS_INPUT = 1 << 7;
        /// The failure slot holds a callable rather than a string.
        const NOTIFY_FAIL_FUNC = 1 << 8;
    }
}

impl SessionFlags {
    /// The subset callers may request when installing a redirect.
    pub const REDIRECT_MASK: Self = Self::NOECHO
        .union(Self::NOESC)
        .union(Self::SINGLE_CHAR);
}

/// How the user is attached; the console needs different echo handling
/// than a telnet connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionKind {
    Console,
    #[default]
    Telnet,
}

/// A one-shot capture of the next command line by a callable. At most one
/// may be installed per session; consumption detaches it before the
/// callable runs so the callable can install a fresh one.
#[derive(Clone, Debug)]
pub struct Redirect {
    pub funp: Rc<FunPtr>,
    pub args: Vec<Value>,
}

impl Redirect {
    pub fn new(funp: Rc<FunPtr>) -> Self {
        Self {
            funp,
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// What to tell the user when the parser matches nothing. Installing either
/// arm replaces (and thereby releases) the other.
#[derive(Clone, Debug)]
pub enum FailMessage {
    Text(Rc<str>),
    Hook(Rc<FunPtr>),
}

/// Everything the driver keeps per connected user.
#[derive(Debug)]
pub struct InteractiveState {
    pub ob: ObjectId,
    pub connection: ConnectionKind,
    pub buffer: InputBuffer,
    outgoing: Vec<u8>,
    pub flags: SessionFlags,
    pub redirect: Option<Redirect>,
    pub fail_message: Option<FailMessage>,
    pub prompt: Rc<str>,
    pub snoop_by: Option<UserId>,
    pub snoop_on: Option<UserId>,
    /// A line-editor session is attached; raw commands go to it.
    pub ed_active: bool,
    pub last_time: u64,
}

impl InteractiveState {
    pub fn new(ob: ObjectId, connection: ConnectionKind) -> Self {
        Self {
            ob,
            connection,
            buffer: InputBuffer::new(),
            outgoing: Vec::new(),
            flags: SessionFlags::empty(),
            redirect: None,
            fail_message: None,
            prompt: Rc::from("> "),
            snoop_by: None,
            snoop_on: None,
            ed_active: false,
            last_time: 0,
        }
    }

    #[inline]
    pub fn single_char(&self) -> bool {
        self.flags.contains(SessionFlags::SINGLE_CHAR)
    }

    /// Accepts received octets and reconciles `CMD_IN_BUF` with what the
    /// buffer actually holds.
    pub fn feed_input(&mut self, bytes: &[u8]) -> usize {
        let accepted = self.buffer.feed(bytes);
        self.reconcile_cmd_in_buf();
        accepted
    }

    pub fn reconcile_cmd_in_buf(&mut self) {
        if self.buffer.has_command(self.single_char()) {
            self.flags.insert(SessionFlags::CMD_IN_BUF);
        } else {
            self.flags.remove(SessionFlags::CMD_IN_BUF);
        }
    }

    pub fn grant_command_turn(&mut self) {
        self.flags.insert(SessionFlags::HAS_CMD_TURN);
    }

    #[inline]
    pub fn message_length(&self) -> usize {
        self.outgoing.len()
    }

    pub fn queue_output(&mut self, bytes: &[u8]) {
        self.outgoing.extend_from_slice(bytes);
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.outgoing)
    }
}

/// Fixed-size table of session slots plus the persistent rotation cursor
/// the dispatcher scans with. Slot indices are the `UserId` handles
/// everything else (snoop edges, object back-pointers) stores.
#[derive(Debug)]
pub struct UserTable {
    slots: Vec<Option<InteractiveState>>,
    next_user: usize,
}

impl UserTable {
    pub fn new(max_users: usize) -> Self {
        assert!(max_users >= 1, "user table needs at least one slot");
        let mut slots = Vec::with_capacity(max_users);
        slots.resize_with(max_users, || None);
        Self {
            slots,
            next_user: 0,
        }
    }

    #[inline]
    pub fn max_users(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.next_user
    }

    pub fn set_cursor(&mut self, at: usize) {
        debug_assert!(at < self.slots.len());
        self.next_user = at.min(self.slots.len() - 1);
    }

    /// Steps the scan cursor one slot down, wrapping below zero. The wrap
    /// fires on the step taken *after* visiting slot zero, matching the
    /// rotation order users observe.
    pub(crate) fn step_cursor(&mut self) {
        if self.next_user == 0 {
            self.next_user = self.slots.len() - 1;
        } else {
            self.next_user -= 1;
        }
    }

    /// Claims the first free slot for a new session. The caller wires the
    /// object's interactive back-pointer.
    pub fn connect(&mut self, ob: ObjectId, connection: ConnectionKind) -> Option<UserId> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(InteractiveState::new(ob, connection));
        Some(UserId::new(slot))
    }

    /// Tears down a session: both snoop edges are unlinked before the state
    /// is dropped so no peer is left pointing at a free slot.
    pub fn disconnect(&mut self, user: UserId) -> Option<InteractiveState> {
        let state = self.slots.get_mut(user.slot())?.take()?;
        if let Some(by) = state.snoop_by {
            if let Some(peer) = self.get_mut(by) {
                peer.snoop_on = None;
            }
        }
        if let Some(on) = state.snoop_on {
            if let Some(peer) = self.get_mut(on) {
                peer.snoop_by = None;
            }
        }
        Some(state)
    }

    #[inline]
    pub fn get(&self, user: UserId) -> Option<&InteractiveState> {
        self.slots.get(user.slot())?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, user: UserId) -> Option<&mut InteractiveState> {
        self.slots.get_mut(user.slot())?.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UserId, &InteractiveState)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, state)| state.as_ref().map(|s| (UserId::new(slot), s)))
    }

    pub fn user_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use textvm_primitives::ObjectTable;

    #[test]
    fn cursor_wraps_after_zero() {
        let mut table = UserTable::new(3);
        assert_eq!(table.cursor(), 0);
        table.step_cursor();
        assert_eq!(table.cursor(), 2);
        table.step_cursor();
        assert_eq!(table.cursor(), 1);
        table.step_cursor();
        assert_eq!(table.cursor(), 0);
    }

    #[test]
    fn single_slot_cursor_stays_put() {
        let mut table = UserTable::new(1);
        table.step_cursor();
        assert_eq!(table.cursor(), 0);
    }

    #[test]
    fn disconnect_unlinks_snoop_edges() {
        let mut objects = ObjectTable::new();
        let mut table = UserTable::new(4);
        let a = table
            .connect(objects.create("a"), ConnectionKind::Telnet)
            .unwrap();
        let b = table
            .connect(objects.create("b"), ConnectionKind::Telnet)
            .unwrap();
        table.get_mut(a).unwrap().snoop_on = Some(b);
        table.get_mut(b).unwrap().snoop_by = Some(a);

        table.disconnect(b);
        assert_eq!(table.get(a).unwrap().snoop_on, None);
        assert_eq!(table.user_count(), 1);
    }

    #[test]
    fn feed_reconciles_cmd_in_buf() {
        let mut objects = ObjectTable::new();
        let mut state =
            InteractiveState::new(objects.create("u"), ConnectionKind::Telnet);
        state.feed_input(b"par");
        assert!(!state.flags.contains(SessionFlags::CMD_IN_BUF));
        state.feed_input(b"tial\n");
        assert!(state.flags.contains(SessionFlags::CMD_IN_BUF));
    }
}
