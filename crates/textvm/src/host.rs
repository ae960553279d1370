use crate::machine::World;
use auto_impl::auto_impl;
use std::rc::Rc;
use textvm_interpreter::Thread;
use textvm_primitives::{CallOrigin, FunPtr, ObjectId, ThreadError, UserId, Value};

/// The external collaborators of the dispatch core: the bytecode
/// interpreter, the verb parser and the line editor. Every method may run
/// arbitrary bytecode, so callers revalidate their cached session handles
/// afterwards.
#[auto_impl(&mut, Box)]
pub trait Host {
    /// Transfers control to the opcode loop at `pc` within the thread's
    /// current program; returns when the current frame completes or a
    /// failure unwinds.
    fn eval_instruction(
        &mut self,
        thread: &mut Thread,
        world: &mut World,
        pc: usize,
    ) -> Result<(), ThreadError>;

    /// Calls the named method on `ob` with `num_arg` arguments taken from
    /// the stack. Returns `None` when the method does not exist; the
    /// arguments are popped either way.
    fn apply(
        &mut self,
        thread: &mut Thread,
        world: &mut World,
        name: &str,
        ob: ObjectId,
        num_arg: usize,
        origin: CallOrigin,
    ) -> Result<Option<Value>, ThreadError>;

    /// Calls a reified function pointer with `num_arg` stacked arguments.
    /// Pre-bound arguments merge ahead of the stacked ones; that merging
    /// belongs to the callable.
    fn call_function_pointer(
        &mut self,
        thread: &mut Thread,
        world: &mut World,
        funp: &Rc<FunPtr>,
        num_arg: usize,
    ) -> Result<Value, ThreadError>;

    /// The default command parser: verb lookup and action matching. Calls
    /// back into [`notify_no_command`](crate::notify_no_command) when
    /// nothing matches.
    fn process_command(
        &mut self,
        thread: &mut Thread,
        world: &mut World,
        command: &str,
        giver: ObjectId,
    ) -> Result<(), ThreadError>;

    /// Hands a raw line to the user's line-editor session.
    fn ed_cmd(
        &mut self,
        thread: &mut Thread,
        world: &mut World,
        user: UserId,
        line: &str,
    ) -> Result<(), ThreadError>;
}

/// A host that knows no bytecode: every method is absent, every callable
/// returns undefined, parsing and editing do nothing. Useful as a stand-in
/// in tests and benchmarks.
#[derive(Clone, Debug, Default)]
pub struct NullHost;

impl Host for NullHost {
    fn eval_instruction(
        &mut self,
        _thread: &mut Thread,
        _world: &mut World,
        _pc: usize,
    ) -> Result<(), ThreadError> {
        Ok(())
    }

    fn apply(
        &mut self,
        thread: &mut Thread,
        _world: &mut World,
        _name: &str,
        _ob: ObjectId,
        num_arg: usize,
        _origin: CallOrigin,
    ) -> Result<Option<Value>, ThreadError> {
        thread.stack.pop_n(num_arg)?;
        Ok(None)
    }

    fn call_function_pointer(
        &mut self,
        thread: &mut Thread,
        _world: &mut World,
        _funp: &Rc<FunPtr>,
        num_arg: usize,
    ) -> Result<Value, ThreadError> {
        thread.stack.pop_n(num_arg)?;
        Ok(Value::Undefined)
    }

    fn process_command(
        &mut self,
        _thread: &mut Thread,
        _world: &mut World,
        _command: &str,
        _giver: ObjectId,
    ) -> Result<(), ThreadError> {
        Ok(())
    }

    fn ed_cmd(
        &mut self,
        _thread: &mut Thread,
        _world: &mut World,
        _user: UserId,
        _line: &str,
    ) -> Result<(), ThreadError> {
        Ok(())
    }
}
