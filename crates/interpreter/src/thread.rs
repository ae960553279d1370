use crate::{
    frame::{Frame, FrameKind, FrameStack},
    stack::Stack,
};
use bitflags::bitflags;
use std::{rc::Rc, vec::Vec};
use textvm_primitives::{
    CallOrigin, FunctionEntry, FunctionFlags, ObjectId, Program, ThreadError, Value,
};

#[cfg(feature = "profiling")]
use std::time::Instant;

bitflags! {
    /// Reasons the current failure must not be stopped by a catch frame.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ErrorState: u8 {
        const STACK_FULL = 0b0000_0001;
        const MAX_EVAL_COST = 0b0000_0010;
    }
}

/// Heights captured on entering a catch; restoring truncates both stacks
/// back to them. Deliberately not `Clone`: one save, one pop.
#[derive(Debug)]
pub struct ErrorContext {
    frame_depth: usize,
    stack_height: usize,
}

/// The execution substrate: the evaluation stack, the frame stack, and the
/// machine registers the original kept as process globals. Exactly one
/// thread exists per driver; bytecode runs cooperatively and never
/// suspends inside a frame operation.
///
/// Register capture happens only at frame push, restoration only at frame
/// pop; everything in between may freely mutate the registers.
#[derive(Debug)]
pub struct Thread {
    pub stack: Stack,
    frames: FrameStack,
    pub current_object: Option<ObjectId>,
    pub previous_object: Option<ObjectId>,
    pub caller_type: CallOrigin,
    pub current_prog: Option<Rc<Program>>,
    pub pc: usize,
    /// Base of the running frame's argument/local region on the stack.
    pub fp: usize,
    pub function_index_offset: usize,
    pub variable_index_offset: usize,
    /// What the next successful catch pushes. Bytecode failure paths store
    /// the error value here before unwinding.
    pub catch_value: Value,
    error_state: ErrorState,
    context_depth: usize,
    max_error_contexts: usize,
}

impl Thread {
    pub fn new(max_call_depth: usize, max_error_contexts: usize) -> Self {
        Self {
            stack: Stack::new(),
            frames: FrameStack::new(max_call_depth),
            current_object: None,
            previous_object: None,
            caller_type: CallOrigin::Driver,
            current_prog: None,
            pc: 0,
            fp: 0,
            function_index_offset: 0,
            variable_index_offset: 0,
            catch_value: Value::one(),
            error_state: ErrorState::empty(),
            context_depth: 0,
            max_error_contexts,
        }
    }

    #[inline]
    pub fn frames(&self) -> &FrameStack {
        &self.frames
    }

    #[inline]
    pub fn set_error_state(&mut self, flag: ErrorState) {
        self.error_state |= flag;
    }

    #[inline]
    pub fn get_error_state(&self, mask: ErrorState) -> bool {
        self.error_state.intersects(mask)
    }

    #[inline]
    pub fn clear_error_state(&mut self) {
        self.error_state = ErrorState::empty();
    }

    /// Pushes a frame, capturing every register. The only failure is depth
    /// exhaustion, which also latches `STACK_FULL` so the error cannot be
    /// caught further down.
    pub fn push_frame(&mut self, kind: FrameKind) -> Result<(), ThreadError> {
        if self.frames.is_full() {
            self.error_state |= ErrorState::STACK_FULL;
            return Err(ThreadError::TooDeepRecursion);
        }
        self.frames.push_raw(Frame {
            kind,
            caller_type: self.caller_type,
            ob: self.current_object,
            prev_ob: self.previous_object,
            fp: self.fp,
            prog: self.current_prog.clone(),
            pc: self.pc,
            function_index_offset: self.function_index_offset,
            variable_index_offset: self.variable_index_offset,
            num_local_variables: 0,
            #[cfg(feature = "profiling")]
            entered: None,
        });
        Ok(())
    }

    /// Records the actual argument count on the frame just pushed; frame
    /// setup consumes it and replaces it with the normalized local count.
    pub fn set_frame_args(&mut self, actual: usize) {
        if let Some(frame) = self.frames.top_mut() {
            frame.num_local_variables = actual;
        }
    }

    /// Pops one frame and restores the captured registers.
    pub fn pop_frame(&mut self) {
        let Some(frame) = self.frames.pop_raw() else {
            debug_assert!(false, "popped past the bottom of the frame stack");
            return;
        };

        #[cfg(feature = "profiling")]
        self.account_profile(&frame);

        self.current_object = frame.ob;
        self.current_prog = frame.prog;
        self.previous_object = frame.prev_ob;
        self.caller_type = frame.caller_type;
        self.pc = frame.pc;
        self.fp = frame.fp;
        self.function_index_offset = frame.function_index_offset;
        self.variable_index_offset = frame.variable_index_offset;
    }

    /// Attributes the elapsed time of the exiting function to its own
    /// counter and to the caller's children counter. Runs before register
    /// restore: `current_prog` is still the exited function's program and
    /// the new stack top is the caller's frame.
    #[cfg(feature = "profiling")]
    fn account_profile(&mut self, frame: &Frame) {
        let FrameKind::Function { table_index } = frame.kind else {
            return;
        };
        let (Some(entered), Some(prog)) = (frame.entered, self.current_prog.as_ref()) else {
            return;
        };
        let dns = entered.elapsed().as_nanos() as u64;
        if let Some(def) = prog.function(table_index) {
            def.profile.self_ns.set(def.profile.self_ns.get() + dns);
        }
        if let (Some(below), Some(caller_prog)) = (self.frames.top(), frame.prog.as_ref()) {
            if let FrameKind::Function {
                table_index: caller_index,
            } = below.kind
            {
                if let Some(def) = caller_prog.function(caller_index) {
                    def.profile
                        .children_ns
                        .set(def.profile.children_ns.get() + dns);
                }
            }
        }
    }

    /// Resolves runtime function index `index` to its defining program,
    /// resetting the offset accumulators first; records the resolved table
    /// index on the top frame and normalizes the arguments already on the
    /// stack. Returns the resolved table index.
    pub fn setup_new_frame(&mut self, index: usize) -> Result<usize, ThreadError> {
        self.function_index_offset = 0;
        self.variable_index_offset = 0;
        self.setup_frame_common(index)
    }

    /// Same resolution, but the accumulators keep their current values:
    /// they are already relative to an outer non-inherited base.
    pub fn setup_inherited_frame(&mut self, index: usize) -> Result<usize, ThreadError> {
        self.setup_frame_common(index)
    }

    fn setup_frame_common(&mut self, index: usize) -> Result<usize, ThreadError> {
        let mut prog = self
            .current_prog
            .clone()
            .ok_or_else(|| ThreadError::raised("function call without a program"))?;
        let mut index = index;

        while prog.flags(index).contains(FunctionFlags::INHERITED) {
            let Some(FunctionEntry::Inherited {
                inherit,
                index: inherited_index,
            }) = prog.entry(index)
            else {
                return Err(ThreadError::raised("corrupt function table"));
            };
            let Some(inh) = prog.inherits.get(inherit as usize).cloned() else {
                return Err(ThreadError::raised("corrupt inherit table"));
            };
            self.function_index_offset += inh.function_index_offset;
            self.variable_index_offset += inh.variable_index_offset;
            prog = inh.prog;
            index = inherited_index as usize;
        }

        let Some(FunctionEntry::Defined { table_index }) = prog.entry(index) else {
            return Err(ThreadError::raised("corrupt function table"));
        };
        let table_index = table_index as usize;
        let varargs = prog.flags(index).contains(FunctionFlags::TRUE_VARARGS);

        self.current_prog = Some(prog.clone());
        if let Some(frame) = self.frames.top_mut() {
            if let FrameKind::Function { table_index: slot } = &mut frame.kind {
                *slot = table_index;
            }
        }

        let def = prog
            .function(table_index)
            .ok_or_else(|| ThreadError::raised("corrupt function table"))?;
        let num_arg = def.num_arg as usize;
        let num_local = def.num_local as usize;

        #[cfg(feature = "profiling")]
        {
            def.profile.calls.set(def.profile.calls.get() + 1);
            if let Some(frame) = self.frames.top_mut() {
                frame.entered = Some(Instant::now());
            }
        }

        let actual = self.frames.top().map_or(0, |f| f.num_local_variables);
        if varargs {
            self.setup_varargs_variables(actual, num_local, num_arg)?;
        } else {
            self.setup_variables(actual, num_local, num_arg)?;
        }
        Ok(table_index)
    }

    /// Strict argument normalization: excess arguments are dropped, missing
    /// ones filled with undefineds, then locals are zeroed on top.
    pub fn setup_variables(
        &mut self,
        actual: usize,
        num_local: usize,
        num_arg: usize,
    ) -> Result<(), ThreadError> {
        if actual > num_arg {
            self.stack.pop_n(actual - num_arg)?;
            self.stack.push_undefineds(num_local)?;
        } else {
            self.stack.push_undefineds(num_local + num_arg - actual)?;
        }
        self.finish_variables(num_local + num_arg)
    }

    /// True-varargs normalization: the trailing `actual - num_arg + 1`
    /// arguments collapse into an array taking the place of the last
    /// formal; with too few arguments the formal becomes the empty array.
    pub fn setup_varargs_variables(
        &mut self,
        actual: usize,
        num_local: usize,
        num_arg: usize,
    ) -> Result<(), ThreadError> {
        if actual >= num_arg {
            let n = actual - num_arg + 1;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(self.stack.pop()?);
            }
            items.reverse();
            self.stack.push_array(items.into())?;
        } else {
            self.stack.push_undefineds(num_arg - 1 - actual)?;
            self.stack.push(Value::empty_array())?;
        }
        self.stack.push_undefineds(num_local)?;
        self.finish_variables(num_local + num_arg)
    }

    fn finish_variables(&mut self, num_local_variables: usize) -> Result<(), ThreadError> {
        if let Some(frame) = self.frames.top_mut() {
            frame.num_local_variables = num_local_variables;
        }
        self.fp = self
            .stack
            .len()
            .checked_sub(num_local_variables)
            .ok_or(ThreadError::StackUnderflow)?;
        Ok(())
    }

    /// Captures the ambient heights for catch recovery. Fails when contexts
    /// nest past the configured limit; that failure is never catchable.
    pub fn save_context(&mut self) -> Result<ErrorContext, ThreadError> {
        if self.context_depth >= self.max_error_contexts {
            return Err(ThreadError::ContextsTooDeep);
        }
        self.context_depth += 1;
        Ok(ErrorContext {
            frame_depth: self.frames.depth(),
            stack_height: self.stack.len(),
        })
    }

    /// Unwinds both stacks back to the saved heights, restoring registers
    /// frame by frame on the way down.
    pub fn restore_context(&mut self, econ: &ErrorContext) {
        while self.frames.depth() > econ.frame_depth {
            self.pop_frame();
        }
        self.stack.truncate_to(econ.stack_height);
    }

    pub fn pop_context(&mut self, econ: ErrorContext) {
        let _ = econ;
        debug_assert!(self.context_depth > 0);
        self.context_depth = self.context_depth.saturating_sub(1);
    }

    /// Runs `body` (normally a jump into the interpreter) under a catch
    /// landmark. On failure the frame and value stacks are put back exactly
    /// at the save point plus one slot holding the caught value, and the
    /// catch register is reset to the canonical one-value. Failures latched
    /// as `STACK_FULL` or `MAX_EVAL_COST`, and context exhaustion, re-raise
    /// past the landmark.
    ///
    /// On the normal path the CATCH frame is left for the interpreter to
    /// pop when it reaches the end of the protected block.
    pub fn do_catch<F>(&mut self, body: F) -> Result<(), ThreadError>
    where
        F: FnOnce(&mut Self) -> Result<(), ThreadError>,
    {
        let econ = self.save_context()?;
        if let Err(err) = self.push_frame(FrameKind::Catch) {
            self.pop_context(econ);
            return Err(err);
        }
        self.catch_value = Value::one();

        let result = match body(self) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.restore_context(&econ);
                let caught = core::mem::replace(&mut self.catch_value, Value::one());
                match self.stack.push(caught) {
                    Ok(()) => {
                        if self.get_error_state(ErrorState::MAX_EVAL_COST) {
                            Err(ThreadError::EvalCostTooBig)
                        } else if self.get_error_state(ErrorState::STACK_FULL) {
                            Err(ThreadError::TooDeepRecursion)
                        } else if !err.is_catchable() {
                            Err(err)
                        } else {
                            Ok(())
                        }
                    }
                    Err(push_err) => Err(push_err),
                }
            }
        };
        self.pop_context(econ);
        result
    }

    /// The outermost handler: throws away every live frame and value and
    /// puts the registers back to their idle state. The tick loop calls
    /// this after an uncaught failure and carries on.
    pub fn reset(&mut self) {
        while !self.frames.is_empty() {
            self.pop_frame();
        }
        self.stack.truncate_to(0);
        self.current_object = None;
        self.previous_object = None;
        self.caller_type = CallOrigin::Driver;
        self.current_prog = None;
        self.pc = 0;
        self.fp = 0;
        self.function_index_offset = 0;
        self.variable_index_offset = 0;
        self.catch_value = Value::one();
        self.error_state = ErrorState::empty();
        self.context_depth = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use textvm_primitives::{FunctionDef, Inherit};

    fn thread() -> Thread {
        Thread::new(8, 4)
    }

    /// P inherits Q inherits R; `foo` is defined by R and visible from P
    /// through two inherited entries.
    fn inherit_chain() -> Rc<Program> {
        let mut r = Program::new("std/r");
        r.function_table.push(FunctionDef::new("foo", 0, 1, 2));
        r.entries.push(FunctionEntry::Defined { table_index: 0 });
        r.function_flags.push(FunctionFlags::empty());
        let r = Rc::new(r);

        let mut q = Program::new("std/q");
        q.inherits.push(Inherit {
            prog: r,
            function_index_offset: 3,
            variable_index_offset: 5,
        });
        q.entries.push(FunctionEntry::Inherited {
            inherit: 0,
            index: 0,
        });
        q.function_flags.push(FunctionFlags::INHERITED);
        let q = Rc::new(q);

        let mut p = Program::new("std/p");
        p.inherits.push(Inherit {
            prog: q,
            function_index_offset: 10,
            variable_index_offset: 20,
        });
        // pad runtime indices so foo sits at index 7 as seen from p
        for _ in 0..7 {
            p.entries.push(FunctionEntry::Defined { table_index: 0 });
            p.function_flags.push(FunctionFlags::empty());
        }
        p.entries.push(FunctionEntry::Inherited {
            inherit: 0,
            index: 0,
        });
        p.function_flags.push(FunctionFlags::INHERITED);
        Rc::new(p)
    }

    #[test]
    fn push_pop_restores_registers() {
        let mut t = thread();
        t.pc = 42;
        t.fp = 7;
        t.caller_type = CallOrigin::CallOther;
        t.push_frame(FrameKind::Fake).unwrap();
        t.pc = 99;
        t.fp = 0;
        t.caller_type = CallOrigin::Driver;
        t.pop_frame();
        assert_eq!(t.pc, 42);
        assert_eq!(t.fp, 7);
        assert_eq!(t.caller_type, CallOrigin::CallOther);
    }

    #[test]
    fn depth_exhaustion_latches_stack_full() {
        let mut t = Thread::new(2, 4);
        t.push_frame(FrameKind::Fake).unwrap();
        t.push_frame(FrameKind::Fake).unwrap();
        assert_eq!(
            t.push_frame(FrameKind::Fake),
            Err(ThreadError::TooDeepRecursion)
        );
        assert!(t.get_error_state(ErrorState::STACK_FULL));
        assert_eq!(t.frames().depth(), 2);
    }

    #[test]
    fn inherited_resolution_accumulates_offsets() {
        let mut t = thread();
        t.current_prog = Some(inherit_chain());
        t.stack.push(Value::Int(5)).unwrap();
        t.push_frame(FrameKind::Function { table_index: 0 }).unwrap();
        t.set_frame_args(1);

        let table_index = t.setup_new_frame(7).unwrap();
        assert_eq!(table_index, 0);
        assert_eq!(t.function_index_offset, 13);
        assert_eq!(t.variable_index_offset, 25);
        assert_eq!(t.current_prog.as_ref().unwrap().name.as_ref(), "std/r");
        // one arg + two locals
        assert_eq!(t.stack.len(), 3);
        assert_eq!(t.fp, 0);
        assert_eq!(t.frames().top().unwrap().num_local_variables, 3);

        // determinism: an identical call resolves identically
        let mut t2 = thread();
        t2.current_prog = Some(inherit_chain());
        t2.stack.push(Value::Int(5)).unwrap();
        t2.push_frame(FrameKind::Function { table_index: 0 }).unwrap();
        t2.set_frame_args(1);
        assert_eq!(t2.setup_new_frame(7).unwrap(), table_index);
        assert_eq!(t2.function_index_offset, 13);
        assert_eq!(t2.variable_index_offset, 25);
    }

    #[test]
    fn strict_normalization_pops_excess() {
        let mut t = thread();
        for n in 0..4 {
            t.stack.push(Value::Int(n)).unwrap();
        }
        t.push_frame(FrameKind::Fake).unwrap();
        t.set_frame_args(4);
        t.setup_variables(4, 1, 2).unwrap();
        // two excess args dropped, one local pushed
        assert_eq!(t.stack.len(), 3);
        assert_eq!(t.fp, 0);
        assert!(t.stack.top().unwrap().is_undefined());
    }

    #[test]
    fn varargs_aggregates_in_order() {
        let mut t = thread();
        for n in 1..=3 {
            t.stack.push(Value::Int(n)).unwrap();
        }
        t.push_frame(FrameKind::Fake).unwrap();
        t.setup_varargs_variables(3, 0, 2).unwrap();
        // formals: first arg stays, rest collapse into ({ 2, 3 })
        assert_eq!(t.stack.len(), 2);
        let Value::Array(rest) = t.stack.top().unwrap() else {
            panic!("expected aggregated array");
        };
        assert_eq!(rest.as_ref(), &[Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn varargs_short_call_gets_empty_array() {
        let mut t = thread();
        t.push_frame(FrameKind::Fake).unwrap();
        t.setup_varargs_variables(0, 1, 2).unwrap();
        // one undefined formal, the empty array, one local
        assert_eq!(t.stack.len(), 3);
        assert_eq!(t.stack.peek(1).unwrap(), &Value::empty_array());
    }

    #[test]
    fn catch_isolation() {
        let mut t = thread();
        t.stack.push(Value::Int(7)).unwrap();
        let frames_before = t.frames().depth();
        let stack_before = t.stack.len();

        let result = t.do_catch(|t| {
            t.push_frame(FrameKind::Fake)?;
            t.stack.push(Value::Int(1))?;
            t.stack.push(Value::Int(2))?;
            t.catch_value = Value::string("boom");
            Err(ThreadError::raised("boom"))
        });
        assert_eq!(result, Ok(()));
        assert_eq!(t.frames().depth(), frames_before);
        assert_eq!(t.stack.len(), stack_before + 1);
        assert_eq!(t.stack.top().unwrap().as_str(), Some("boom"));
        assert_eq!(t.catch_value, Value::one());
    }

    #[test]
    fn catch_does_not_stop_eval_cost() {
        let mut t = thread();
        let result = t.do_catch(|t| {
            t.set_error_state(ErrorState::MAX_EVAL_COST);
            Err(ThreadError::EvalCostTooBig)
        });
        assert_eq!(result, Err(ThreadError::EvalCostTooBig));
        // the caught value is still left behind for the outer handler
        assert_eq!(t.stack.len(), 1);
    }

    #[test]
    fn context_nesting_limit() {
        let mut t = Thread::new(8, 1);
        let result = t.do_catch(|t| {
            // inner catch cannot save another context
            match t.do_catch(|_| Ok(())) {
                Err(err) => Err(err),
                Ok(()) => Ok(()),
            }
        });
        assert_eq!(result, Err(ThreadError::ContextsTooDeep));
    }

    #[test]
    fn reset_clears_everything() {
        let mut t = thread();
        t.push_frame(FrameKind::Fake).unwrap();
        t.stack.push(Value::Int(1)).unwrap();
        t.set_error_state(ErrorState::MAX_EVAL_COST);
        t.reset();
        assert_eq!(t.frames().depth(), 0);
        assert!(t.stack.is_empty());
        assert!(!t.get_error_state(ErrorState::all()));
    }
}
