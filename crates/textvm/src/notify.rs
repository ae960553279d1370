use crate::{
    machine::Machine,
    session::{FailMessage, InteractiveState, SessionFlags},
    Host,
};
use std::rc::Rc;
use textvm_primitives::{FunPtr, ThreadError, Value};

/// Drops whatever failure response is installed, string or callable.
pub fn clear_notify(state: &mut InteractiveState) {
    state.fail_message = None;
    state.flags.remove(SessionFlags::NOTIFY_FAIL_FUNC);
}

/// Installs a failure string on the current command giver, replacing any
/// previously installed string or callable.
pub fn set_notify_fail_message(machine: &mut Machine, msg: &str) {
    let Some(state) = giver_session_mut(machine) else {
        return;
    };
    clear_notify(state);
    state.fail_message = Some(FailMessage::Text(Rc::from(msg)));
}

/// Installs a failure callable on the current command giver, replacing any
/// previously installed string or callable.
pub fn set_notify_fail_function(machine: &mut Machine, funp: Rc<FunPtr>) {
    let Some(state) = giver_session_mut(machine) else {
        return;
    };
    clear_notify(state);
    state.flags.insert(SessionFlags::NOTIFY_FAIL_FUNC);
    state.fail_message = Some(FailMessage::Hook(funp));
}

/// The parser calls this when a command matched nothing. Resolution order:
/// an installed callable (its string result is printed), an installed
/// string, the configured default message, then a terse built-in.
pub fn notify_no_command<H: Host>(machine: &mut Machine, host: &mut H) -> Result<(), ThreadError> {
    let Some(giver) = machine.world.command_giver else {
        return Ok(());
    };
    let Some(user) = machine.world.objects.interactive_of(giver) else {
        return Ok(());
    };
    let Some(state) = machine.world.users.get_mut(user) else {
        return Ok(());
    };

    if state.flags.contains(SessionFlags::NOTIFY_FAIL_FUNC) {
        let hook = match state.fail_message.take() {
            Some(FailMessage::Hook(funp)) => funp,
            other => {
                state.fail_message = other;
                state.flags.remove(SessionFlags::NOTIFY_FAIL_FUNC);
                return Ok(());
            }
        };
        let saved_giver = machine.world.command_giver;
        let (thread, world) = machine.split();
        let result = host.call_function_pointer(thread, world, &hook, 0);
        machine.world.command_giver = saved_giver;
        let value = result?;
        if machine
            .world
            .objects
            .interactive_of(giver)
            .is_some_and(|u| u == user)
        {
            if let Value::Str(msg) = &value {
                machine.world.tell_object(giver, msg);
            }
            if let Some(state) = machine.world.users.get_mut(user) {
                state.flags.remove(SessionFlags::NOTIFY_FAIL_FUNC);
                state.fail_message = None;
            }
        }
        return Ok(());
    }

    if let Some(FailMessage::Text(msg)) = state.fail_message.take() {
        machine.world.tell_object(giver, &msg);
        return Ok(());
    }

    if let Some(default) = machine.world.cfg.default_fail_message.clone() {
        machine
            .world
            .tell_object_fmt(giver, format_args!("{default}\n"));
        return Ok(());
    }

    machine.world.tell_object(giver, "What?\n");
    Ok(())
}

fn giver_session_mut(machine: &mut Machine) -> Option<&mut InteractiveState> {
    let giver = machine.world.command_giver?;
    let user = machine.world.objects.interactive_of(giver)?;
    machine.world.users.get_mut(user)
}
