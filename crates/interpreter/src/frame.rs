use std::{rc::Rc, vec::Vec};
use textvm_primitives::{CallOrigin, FunPtr, ObjectId, Program};

#[cfg(feature = "profiling")]
use std::time::Instant;

/// What kind of activation a frame records.
#[derive(Clone, Debug)]
pub enum FrameKind {
    /// Ordinary call through the function table. The resolved table index
    /// is filled in by frame setup once inheritance is walked.
    Function { table_index: usize },
    /// Landmark for non-local failure recovery.
    Catch,
    /// Call through a reified function pointer.
    Funp { funp: Rc<FunPtr> },
    /// Driver-fabricated frame with no program context of its own.
    Fake,
}

impl FrameKind {
    #[inline]
    pub const fn is_function(&self) -> bool {
        matches!(self, Self::Function { .. })
    }

    #[inline]
    pub const fn is_catch(&self) -> bool {
        matches!(self, Self::Catch)
    }
}

/// One activation record: the registers of the caller, captured at push and
/// restored at pop. `num_local_variables` doubles as the actual argument
/// count between push and frame setup.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub caller_type: CallOrigin,
    pub ob: Option<ObjectId>,
    pub prev_ob: Option<ObjectId>,
    pub fp: usize,
    pub prog: Option<Rc<Program>>,
    pub pc: usize,
    pub function_index_offset: usize,
    pub variable_index_offset: usize,
    pub num_local_variables: usize,
    #[cfg(feature = "profiling")]
    pub entered: Option<Instant>,
}

/// Bounded stack of activation records. Capacity is fixed at construction;
/// exceeding it is the `STACK_FULL` condition the thread raises.
#[derive(Debug)]
pub struct FrameStack {
    frames: Vec<Frame>,
    limit: usize,
}

impl FrameStack {
    pub fn new(limit: usize) -> Self {
        Self {
            frames: Vec::with_capacity(limit),
            limit,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.frames.len() == self.limit
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    #[inline]
    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    #[inline]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    #[inline]
    pub(crate) fn push_raw(&mut self, frame: Frame) {
        debug_assert!(self.frames.len() < self.limit);
        self.frames.push(frame);
    }

    #[inline]
    pub(crate) fn pop_raw(&mut self) -> Option<Frame> {
        self.frames.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity() {
        let mut stack = FrameStack::new(2);
        assert!(!stack.is_full());
        for _ in 0..2 {
            stack.push_raw(Frame {
                kind: FrameKind::Fake,
                caller_type: CallOrigin::Driver,
                ob: None,
                prev_ob: None,
                fp: 0,
                prog: None,
                pc: 0,
                function_index_offset: 0,
                variable_index_offset: 0,
                num_local_variables: 0,
                #[cfg(feature = "profiling")]
                entered: None,
            });
        }
        assert!(stack.is_full());
        assert_eq!(stack.depth(), 2);
        assert!(stack.pop_raw().is_some());
        assert!(!stack.is_full());
    }
}
