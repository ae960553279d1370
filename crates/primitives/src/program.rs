use bitflags::bitflags;
use std::{boxed::Box, rc::Rc, vec::Vec};

#[cfg(feature = "profiling")]
use core::cell::Cell;

bitflags! {
    /// Per-function flags, indexed by runtime function index.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FunctionFlags: u16 {
        /// The index refers to a function defined by an inherited program;
        /// resolution must follow the inherit chain.
        const INHERITED = 0b0000_0001;
        /// Trailing arguments are aggregated into an array formal.
        const TRUE_VARARGS = 0b0000_0010;
    }
}

/// One function defined by this program (as opposed to merely visible
/// through inheritance).
#[derive(Clone, Debug)]
pub struct FunctionDef {
    pub name: Rc<str>,
    /// Entry offset into the program's bytecode.
    pub address: usize,
    pub num_arg: u8,
    pub num_local: u8,
    #[cfg(feature = "profiling")]
    pub profile: FnProfile,
}

impl FunctionDef {
    pub fn new(name: &str, address: usize, num_arg: u8, num_local: u8) -> Self {
        Self {
            name: Rc::from(name),
            address,
            num_arg,
            num_local,
            #[cfg(feature = "profiling")]
            profile: FnProfile::default(),
        }
    }
}

/// Call/self/children counters updated at frame pop. Interior mutability
/// because programs are shared behind `Rc` while execution is mutating.
#[cfg(feature = "profiling")]
#[derive(Clone, Debug, Default)]
pub struct FnProfile {
    pub calls: Cell<u64>,
    pub self_ns: Cell<u64>,
    pub children_ns: Cell<u64>,
}

/// How a runtime function index resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionEntry {
    /// Defined here; index into [`Program::function_table`].
    Defined { table_index: u16 },
    /// Defined by inherit `inherit`, under that program's index `index`.
    Inherited { inherit: u16, index: u16 },
}

#[derive(Clone, Debug)]
pub struct Inherit {
    pub prog: Rc<Program>,
    pub function_index_offset: usize,
    pub variable_index_offset: usize,
}

/// One run of the line-number table: `span` bytes of bytecode belong to
/// absolute line `line`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRun {
    pub span: u8,
    pub line: u16,
}

/// Maps a range of absolute lines (from `first_line` up to the next span)
/// onto a file. `file` indexes [`LineInfo::files`] 1-based; the sentinel
/// [`FILE_INCLUDES_TOO_DEEP`] marks ranges the compiler gave up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileSpan {
    pub first_line: u16,
    pub file: u16,
}

/// Compiler marker for include nesting past the limit.
pub const FILE_INCLUDES_TOO_DEEP: u16 = u16::MAX;

#[derive(Clone, Debug, Default)]
pub struct LineInfo {
    pub runs: Vec<LineRun>,
    pub files: Vec<Rc<str>>,
    pub file_map: Vec<FileSpan>,
}

/// A compiled program: bytecode plus the tables frame setup and trace
/// formatting walk. Programs are immutable once built and shared by `Rc`
/// between objects, inherits and saved frames.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub name: Rc<str>,
    pub bytecode: Box<[u8]>,
    pub function_table: Vec<FunctionDef>,
    /// Parallel to `entries`, indexed by runtime function index.
    pub function_flags: Vec<FunctionFlags>,
    pub entries: Vec<FunctionEntry>,
    pub inherits: Vec<Inherit>,
    /// Compiled-in program with no source text (and thus no lines).
    pub compiled_in: bool,
    pub line_info: Option<LineInfo>,
}

impl Program {
    pub fn new(name: &str) -> Self {
        Self {
            name: Rc::from(name),
            ..Self::default()
        }
    }

    #[inline]
    pub fn entry(&self, index: usize) -> Option<FunctionEntry> {
        self.entries.get(index).copied()
    }

    #[inline]
    pub fn flags(&self, index: usize) -> FunctionFlags {
        self.function_flags
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    #[inline]
    pub fn function(&self, table_index: usize) -> Option<&FunctionDef> {
        self.function_table.get(table_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_lookup() {
        let mut prog = Program::new("obj/thing");
        prog.function_table.push(FunctionDef::new("create", 0, 0, 1));
        prog.entries.push(FunctionEntry::Defined { table_index: 0 });
        prog.function_flags.push(FunctionFlags::empty());

        assert_eq!(
            prog.entry(0),
            Some(FunctionEntry::Defined { table_index: 0 })
        );
        assert_eq!(prog.entry(1), None);
        assert_eq!(prog.flags(7), FunctionFlags::empty());
        assert_eq!(prog.function(0).unwrap().name.as_ref(), "create");
    }
}
