#![warn(rustdoc::all, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
#[cfg(not(feature = "std"))]
extern crate alloc as std;

mod frame;
mod stack;
mod thread;
mod trace;

pub use frame::{Frame, FrameKind, FrameStack};
pub use stack::{Stack, EVAL_STACK_LIMIT};
pub use thread::{ErrorContext, ErrorState, Thread};
pub use trace::{
    current_line_number, dump_trace, find_line, get_line_number, get_svalue_trace, DumpFlags,
    LineLookup, TraceDump, TraceFrame,
};

pub use textvm_primitives as primitives;
