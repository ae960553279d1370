use crate::{
    machine::{Machine, World},
    session::{ConnectionKind, Redirect, SessionFlags},
    terminal::Terminal,
    Host,
};
use textvm_primitives::{ObjectId, ThreadError, UserId};

/// Installs a one-shot capture of the user's next command. Returns `false`
/// when there is no user or no sentence, the object is not interactive, or
/// a capture is already pending; a pending capture must be consumed before
/// another can be installed.
pub fn set_call<T: Terminal>(
    world: &mut World,
    term: &mut T,
    ob: Option<ObjectId>,
    redirect: Option<Redirect>,
    flags: SessionFlags,
) -> bool {
    let (Some(ob), Some(redirect)) = (ob, redirect) else {
        return false;
    };
    let Some(user) = world.objects.interactive_of(ob) else {
        return false;
    };
    let Some(state) = world.users.get_mut(user) else {
        return false;
    };
    if state.redirect.is_some() {
        return false;
    }

    state.redirect = Some(redirect);
    let wanted = flags & SessionFlags::REDIRECT_MASK;
    state.flags.insert(wanted);
    let connection = state.connection;

    if wanted.contains(SessionFlags::NOECHO) {
        match connection {
            // no telnet options on the console; drop echo at the tty
            ConnectionKind::Console => term.set_console_echo(false),
            // claim we will echo, then don't: the client stops echoing
            ConnectionKind::Telnet => term.set_telnet_echo(ob, true),
        }
    }
    if wanted.contains(SessionFlags::SINGLE_CHAR) {
        term.set_telnet_single_char(user, true);
    }
    true
}

/// Feeds one arrived command to a pending capture. The capture is detached
/// before the callable runs, because the callable may install a new one;
/// the command string goes first, then the carry-over arguments in their
/// original order. Returns `false` when no capture was pending.
pub fn call_function_interactive<H: Host, T: Terminal>(
    m: &mut Machine,
    host: &mut H,
    term: &mut T,
    user: UserId,
    input: &str,
) -> Result<bool, ThreadError> {
    let Some(state) = m.world.users.get_mut(user) else {
        return Ok(false);
    };
    state.flags.remove(SessionFlags::NOESC);

    let Some(Redirect { funp, args }) = state.redirect.take() else {
        return Ok(false);
    };

    if state.flags.contains(SessionFlags::SINGLE_CHAR) {
        state.flags.remove(SessionFlags::SINGLE_CHAR);
        term.set_telnet_single_char(user, false);
    }

    let (thread, world) = m.split();
    thread.stack.push_str(input)?;
    let num_arg = args.len();
    for arg in args {
        thread.stack.push(arg)?;
    }
    host.call_function_pointer(thread, world, &funp, num_arg + 1)?;
    Ok(true)
}
