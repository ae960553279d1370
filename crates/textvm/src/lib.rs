#![warn(rustdoc::all, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
#[cfg(not(feature = "std"))]
extern crate alloc as std;

mod buffer;
mod dispatch;
mod host;
mod machine;
mod notify;
mod redirect;
mod session;
mod snoop;
mod terminal;

pub use buffer::{InputBuffer, MAX_TEXT};
pub use dispatch::{
    process_user_command, set_prompt, APPLY_PROCESS_INPUT, APPLY_WRITE_PROMPT,
};
pub use host::{Host, NullHost};
pub use machine::{Machine, World};
pub use notify::{
    clear_notify, notify_no_command, set_notify_fail_function, set_notify_fail_message,
};
pub use redirect::{call_function_interactive, set_call};
pub use session::{
    ConnectionKind, FailMessage, InteractiveState, Redirect, SessionFlags, UserTable,
};
pub use snoop::{query_snoop, query_snooping, set_snoop};
pub use terminal::{DummyTerminal, Terminal};

pub use textvm_interpreter as interpreter;
pub use textvm_interpreter::primitives;
