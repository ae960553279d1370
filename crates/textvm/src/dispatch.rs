use crate::{
    buffer::MAX_TEXT,
    machine::{Machine, World},
    notify::clear_notify,
    redirect::call_function_interactive,
    session::{ConnectionKind, SessionFlags},
    terminal::Terminal,
    Host,
};
use std::{rc::Rc, string::String, vec::Vec};
use textvm_interpreter::{dump_trace, DumpFlags};
use textvm_primitives::{CallOrigin, ObjectId, ThreadError, UserId, Value};

/// Method offered each command before parsing, when the session asks for it.
pub const APPLY_PROCESS_INPUT: &str = "process_input";
/// Method asked to render the prompt, when the session asks for it.
pub const APPLY_WRITE_PROMPT: &str = "write_prompt";

/// Bails out of the current routing step when the session was invalidated
/// by bytecode that ran in between. Silent by design: invalidation is not
/// an error, the rest of the step just no longer applies.
macro_rules! validate_ip {
    ($world:expr, $user:expr, $ob:expr) => {
        if !$world.ip_valid($user, $ob) {
            return Ok(());
        }
    };
}

/// Replaces the prompt of the current command giver.
pub fn set_prompt(world: &mut World, prompt: &str) {
    let Some(giver) = world.command_giver else {
        return;
    };
    let Some(user) = world.objects.interactive_of(giver) else {
        return;
    };
    if let Some(state) = world.users.get_mut(user) {
        state.prompt = Rc::from(prompt);
    }
}

/// One tick of the command loop: pick the next user with a turn and a
/// complete command, route that one command, emit a prompt. Returns whether
/// a command was consumed, so the backend knows to keep draining.
///
/// `current_object`, `command_giver` and `current_interactive` are restored
/// on every exit path; a failure that no catch stopped is logged with its
/// trace and the thread is reset, and the loop carries on next tick.
pub fn process_user_command<H: Host, T: Terminal>(
    m: &mut Machine,
    host: &mut H,
    term: &mut T,
) -> bool {
    let saved_object = m.thread.current_object;
    let saved_giver = m.world.command_giver;
    let saved_interactive = m.world.current_interactive;

    let mut scratch = Vec::new();
    let got = get_user_command(m, term, &mut scratch);
    let processed = got.is_some();

    if let Some((user, giver)) = got {
        if let Err(err) = route_command(m, host, term, user, giver, &scratch) {
            if let Some(dump) = dump_trace(&m.thread, &m.world.objects, DumpFlags::WITH_ARGS) {
                log::error!("{}", dump.text);
            }
            log::error!("error dispatching user command: {err}");
            m.thread.reset();
        }
    }

    m.thread.current_object = saved_object;
    m.world.command_giver = saved_giver;
    m.world.current_interactive = saved_interactive;
    processed
}

/// Scans at most one full rotation for a user holding both a turn token
/// and a complete command; drains that command through the option filter
/// into `scratch`. Pending output is flushed along the way, which may run
/// bytecode, so every slot is revalidated after its flush.
fn get_user_command<T: Terminal>(
    m: &mut Machine,
    term: &mut T,
    scratch: &mut Vec<u8>,
) -> Option<(UserId, ObjectId)> {
    let max_users = m.world.users.max_users();
    let mut selected = None;

    for _ in 0..max_users {
        let user = UserId::new(m.world.users.cursor());
        let mut slot_ob = None;
        if let Some(state) = m.world.users.get(user) {
            let ob = state.ob;
            slot_ob = Some(ob);
            if state.message_length() > 0 {
                let (thread, world) = m.split();
                term.flush(thread, world, user);
                if !m.world.ip_valid(user, ob) {
                    slot_ob = None;
                }
            }
        }

        if let Some(ob) = slot_ob {
            if let Some(state) = m.world.users.get_mut(user) {
                if state.flags.contains(SessionFlags::CMD_IN_BUF) {
                    let single = state.single_char();
                    if state.buffer.first_command(single).is_some() {
                        if state.flags.contains(SessionFlags::HAS_CMD_TURN) {
                            state.flags.remove(SessionFlags::HAS_CMD_TURN);
                            selected = Some((user, ob));
                        }
                        // a command without a turn waits for a later round
                    } else {
                        // partial data only; stop treating it as a command
                        state.flags.remove(SessionFlags::CMD_IN_BUF);
                    }
                }
            }
        }

        if selected.is_some() {
            break;
        }
        m.world.users.step_cursor();
    }

    let (user, ob) = selected?;
    m.world.command_giver = Some(ob);

    {
        let state = m.world.users.get_mut(user)?;
        let single = state.single_char();
        let command = state.buffer.first_command(single)?;
        term.telnet_neg(scratch, command);
        state.buffer.advance();
        let single = state.single_char();
        if !state.buffer.has_command(single) {
            state.flags.remove(SessionFlags::CMD_IN_BUF);
        }
    }

    // the next rotation starts below the user just served
    m.world.users.step_cursor();

    let clock = m.world.clock;
    if let Some(state) = m.world.users.get_mut(user) {
        if state.flags.contains(SessionFlags::NOECHO) {
            // echo must stay off until the hidden input has been received
            match state.connection {
                ConnectionKind::Console => term.set_console_echo(true),
                ConnectionKind::Telnet => term.set_telnet_echo(ob, false),
            }
            state.flags.remove(SessionFlags::NOECHO);
        }
        state.last_time = clock;
    }

    Some((user, ob))
}

fn route_command<H: Host, T: Terminal>(
    m: &mut Machine,
    host: &mut H,
    term: &mut T,
    user: UserId,
    giver: ObjectId,
    raw: &[u8],
) -> Result<(), ThreadError> {
    if !m.world.ip_valid(user, giver) {
        return Ok(());
    }
    m.world.current_interactive = Some(giver);
    m.thread.current_object = None;
    if let Some(state) = m.world.users.get_mut(user) {
        clear_notify(state);
    }

    let command = String::from_utf8_lossy(raw).into_owned();
    let Some(state) = m.world.users.get(user) else {
        return Ok(());
    };
    let flags = state.flags;
    let ed_active = state.ed_active;
    let has_redirect = state.redirect.is_some();

    // '!' escapes a pending capture or editor session back to the parser,
    // unless the capture was installed escape-proof
    if command.starts_with('!')
        && (ed_active || (has_redirect && !flags.contains(SessionFlags::NOESC)))
    {
        if flags.contains(SessionFlags::SINGLE_CHAR) {
            // one escape octet: park char mode and collect a whole line
            if let Some(state) = m.world.users.get_mut(user) {
                state.flags.insert(SessionFlags::WAS_SINGLE_CHAR);
                state.flags.remove(SessionFlags::SINGLE_CHAR);
            }
            term.set_telnet_single_char(user, false);
        } else {
            if flags.contains(SessionFlags::WAS_SINGLE_CHAR) {
                // the escaped line is in; back to char mode
                if let Some(state) = m.world.users.get_mut(user) {
                    state.flags.remove(SessionFlags::WAS_SINGLE_CHAR);
                    state.flags.insert(SessionFlags::SINGLE_CHAR);
                }
                term.set_telnet_single_char(user, true);
                validate_ip!(m.world, user, giver);
            }
            dispatch_parse(m, host, user, giver, &command[1..])?;
        }
    } else if ed_active {
        let (thread, world) = m.split();
        host.ed_cmd(thread, world, user, &command)?;
    } else if call_function_interactive(m, host, term, user, &command)? {
        // the pending capture consumed this line
    } else {
        dispatch_parse(m, host, user, giver, &command)?;
    }

    validate_ip!(m.world, user, giver);
    print_prompt(m, host, term, user, giver)
}

/// Runs a command through the user object's `process_input` hook when it is
/// enabled, then hands the (possibly replaced) command to the parser. A
/// missing hook method is remembered and never applied again; a non-zero
/// integer return means the hook consumed the command.
fn dispatch_parse<H: Host>(
    m: &mut Machine,
    host: &mut H,
    user: UserId,
    giver: ObjectId,
    command: &str,
) -> Result<(), ThreadError> {
    let has_hook = m
        .world
        .users
        .get(user)
        .is_some_and(|s| s.flags.contains(SessionFlags::HAS_PROCESS_INPUT));
    if !has_hook {
        let (thread, world) = m.split();
        return host.process_command(thread, world, command, giver);
    }

    let (thread, world) = m.split();
    thread.stack.push_str(command)?;
    let ret = host.apply(
        thread,
        world,
        APPLY_PROCESS_INPUT,
        giver,
        1,
        CallOrigin::Driver,
    )?;
    validate_ip!(m.world, user, giver);
    if ret.is_none() {
        if let Some(state) = m.world.users.get_mut(user) {
            state.flags.remove(SessionFlags::HAS_PROCESS_INPUT);
        }
    }
    match ret {
        Some(Value::Str(replacement)) => {
            let (thread, world) = m.split();
            host.process_command(thread, world, truncated(&replacement), giver)
        }
        Some(Value::Int(n)) if n != 0 => Ok(()),
        _ => {
            let (thread, world) = m.split();
            host.process_command(thread, world, command, giver)
        }
    }
}

/// Commands and hook replacements never exceed the buffer size.
fn truncated(s: &str) -> &str {
    if s.len() < MAX_TEXT {
        return s;
    }
    let mut cut = MAX_TEXT - 1;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

/// Emits the prompt unless the user is mid-capture: the user object gets a
/// chance to write its own, falling back to (and from then on sticking
/// with) the stored prompt text. Queued output is flushed either way.
fn print_prompt<H: Host, T: Terminal>(
    m: &mut Machine,
    host: &mut H,
    term: &mut T,
    user: UserId,
    giver: ObjectId,
) -> Result<(), ThreadError> {
    let Some(state) = m.world.users.get(user) else {
        return Ok(());
    };
    if state.redirect.is_none() {
        let flags = state.flags;
        let ed_active = state.ed_active;
        let prompt = state.prompt.clone();
        if !flags.contains(SessionFlags::HAS_WRITE_PROMPT) {
            m.world.tell_object(giver, &prompt);
        } else if ed_active {
            m.world.tell_object(giver, &prompt);
        } else {
            let (thread, world) = m.split();
            let ret = host.apply(
                thread,
                world,
                APPLY_WRITE_PROMPT,
                giver,
                0,
                CallOrigin::Driver,
            )?;
            if ret.is_none() {
                validate_ip!(m.world, user, giver);
                if let Some(state) = m.world.users.get_mut(user) {
                    state.flags.remove(SessionFlags::HAS_WRITE_PROMPT);
                }
                m.world.tell_object(giver, &prompt);
            }
        }
    }
    let (thread, world) = m.split();
    term.flush(thread, world, user);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let short = "look";
        assert_eq!(truncated(short), "look");

        let mut long = String::new();
        while long.len() < MAX_TEXT + 8 {
            long.push('é');
        }
        let cut = truncated(&long);
        assert!(cut.len() < MAX_TEXT);
        assert!(long.starts_with(cut));
    }
}
