use crate::machine::World;
use auto_impl::auto_impl;
use std::vec::Vec;
use textvm_interpreter::Thread;
use textvm_primitives::{ObjectId, UserId};

/// Terminal-mode side of the I/O layer. Echo and character-mode changes go
/// out as telnet option negotiation (or ioctls on the console); `flush`
/// pushes queued output down the wire and is a bytecode reentry point
/// because write handlers may run.
#[auto_impl(&mut, Box)]
pub trait Terminal {
    fn set_console_echo(&mut self, on: bool);

    /// The telnet echo trick: announcing WILL ECHO (without echoing)
    /// silences the client's local echo, which is how NOECHO input hides.
    fn set_telnet_echo(&mut self, ob: ObjectId, on: bool);

    fn set_telnet_single_char(&mut self, user: UserId, on: bool);

    /// One-shot option-negotiation filter applied to a command before
    /// dispatch: strips in-band negotiation, leaves the plain octets in
    /// `out`.
    fn telnet_neg(&mut self, out: &mut Vec<u8>, input: &[u8]);

    /// Drains the session's outgoing queue.
    fn flush(&mut self, thread: &mut Thread, world: &mut World, user: UserId);
}

/// Pass-through terminal: negotiation copies the input verbatim, mode
/// changes are dropped, flushed output is discarded.
#[derive(Clone, Debug, Default)]
pub struct DummyTerminal;

impl Terminal for DummyTerminal {
    fn set_console_echo(&mut self, _on: bool) {}

    fn set_telnet_echo(&mut self, _ob: ObjectId, _on: bool) {}

    fn set_telnet_single_char(&mut self, _user: UserId, _on: bool) {}

    fn telnet_neg(&mut self, out: &mut Vec<u8>, input: &[u8]) {
        out.clear();
        out.extend_from_slice(input);
    }

    fn flush(&mut self, _thread: &mut Thread, world: &mut World, user: UserId) {
        if let Some(state) = world.users.get_mut(user) {
            let _ = state.take_output();
        }
    }
}
