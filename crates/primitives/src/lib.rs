#![warn(rustdoc::all, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
#[cfg(not(feature = "std"))]
extern crate alloc as std;

mod env;
mod object;
mod program;
mod result;
mod value;

pub use env::DriverCfg;
pub use object::{Object, ObjectFlags, ObjectId, ObjectTable, UserId};
pub use program::{
    FileSpan, FunctionDef, FunctionEntry, FunctionFlags, Inherit, LineInfo, LineRun, Program,
    FILE_INCLUDES_TOO_DEEP,
};
pub use result::{CallOrigin, ThreadError};
pub use value::{FunPtr, Value};

#[cfg(feature = "profiling")]
pub use program::FnProfile;
