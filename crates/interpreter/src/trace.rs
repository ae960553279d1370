use crate::{frame::FrameKind, thread::Thread};
use bitflags::bitflags;
use core::fmt::Write;
use std::{rc::Rc, string::String, vec::Vec};
use textvm_primitives::{
    LineInfo, ObjectId, ObjectTable, Program, Value, FILE_INCLUDES_TOO_DEEP,
};

bitflags! {
    /// How much detail a trace carries.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DumpFlags: u8 {
        const WITH_ARGS = 0b0000_0001;
        const WITH_LOCALVARS = 0b0000_0010;
    }
}

/// Result of mapping a bytecode offset to a source position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineLookup {
    Found { file: Rc<str>, line: u32 },
    NoProgram,
    CompiledProgram,
    NoLineNumbers,
    IncludesTooDeep,
}

/// Walks the run-length line table until the cumulative span covers `pc`,
/// then maps the absolute line through the file map.
pub fn find_line(prog: Option<&Program>, pc: usize) -> LineLookup {
    let Some(prog) = prog else {
        return LineLookup::NoProgram;
    };
    if prog.compiled_in {
        return LineLookup::CompiledProgram;
    }
    let Some(info) = prog.line_info.as_ref() else {
        return LineLookup::NoLineNumbers;
    };
    if pc > prog.bytecode.len() {
        log::warn!("illegal offset {} in object /{}", pc, prog.name);
        return LineLookup::NoLineNumbers;
    }

    let mut offset = pc;
    let mut abs_line = None;
    for run in &info.runs {
        if offset > run.span as usize {
            offset -= run.span as usize;
        } else {
            abs_line = Some(run.line);
            break;
        }
    }
    let Some(abs) = abs_line else {
        return LineLookup::NoLineNumbers;
    };
    translate_absolute_line(abs, info)
}

/// Absolute lines are partitioned into ranges by the file map; the matching
/// range names the (possibly included) file and the base the relative line
/// counts from.
fn translate_absolute_line(abs: u16, info: &LineInfo) -> LineLookup {
    let span = info
        .file_map
        .iter()
        .filter(|span| span.first_line <= abs)
        .last();
    let Some(span) = span else {
        return LineLookup::NoLineNumbers;
    };
    if span.file == FILE_INCLUDES_TOO_DEEP {
        return LineLookup::IncludesTooDeep;
    }
    let Some(file) = span
        .file
        .checked_sub(1)
        .and_then(|idx| info.files.get(idx as usize))
    else {
        return LineLookup::NoLineNumbers;
    };
    LineLookup::Found {
        file: file.clone(),
        line: u32::from(abs - span.first_line + 1),
    }
}

/// Human-readable position, or one of the diagnostic forms when the offset
/// cannot be resolved.
pub fn get_line_number(prog: Option<&Program>, pc: usize) -> String {
    match find_line(prog, pc) {
        LineLookup::Found { file, line } => {
            let mut out = String::new();
            let _ = write!(out, "/{file}:{line}");
            out
        }
        LineLookup::NoProgram => String::from("(no program)"),
        LineLookup::CompiledProgram => String::from("(compiled program)"),
        LineLookup::NoLineNumbers => String::from("(no line numbers)"),
        LineLookup::IncludesTooDeep => String::from("(includes too deep)"),
    }
}

/// One entry of the structured trace, bottom of the stack first.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceFrame {
    pub function: Rc<str>,
    pub program: Rc<str>,
    pub object: Option<Rc<str>>,
    pub file: Rc<str>,
    pub line: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub arguments: Option<Vec<Value>>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub locals: Option<Vec<Value>>,
}

/// Textual trace plus the object owning a `heart_beat` frame, if one was on
/// the stack (the periodic-callback machinery wants to know whom to blame).
#[derive(Clone, Debug, PartialEq)]
pub struct TraceDump {
    pub text: String,
    pub heart_beat: Option<Rc<str>>,
}

/// A frame as reported: the kind comes from the frame itself, the execution
/// context (program, pc, object, frame pointer) from the frame *above* it,
/// or from the live registers for the topmost one.
struct FrameView<'a> {
    kind: &'a FrameKind,
    prog: Option<&'a Rc<Program>>,
    pc: usize,
    ob: Option<ObjectId>,
    fp: usize,
    /// The frame's own saved object; `heart_beat` attribution uses it.
    own_ob: Option<ObjectId>,
}

fn frame_views(thread: &Thread) -> Vec<FrameView<'_>> {
    let frames = thread.frames().frames();
    frames
        .iter()
        .enumerate()
        .map(|(i, frame)| match frames.get(i + 1) {
            Some(next) => FrameView {
                kind: &frame.kind,
                prog: next.prog.as_ref(),
                pc: next.pc,
                ob: next.ob,
                fp: next.fp,
                own_ob: frame.ob,
            },
            None => FrameView {
                kind: &frame.kind,
                prog: thread.current_prog.as_ref(),
                pc: thread.pc,
                ob: thread.current_object,
                fp: thread.fp,
                own_ob: frame.ob,
            },
        })
        .collect()
}

/// Function label and, where known, (num_arg, num_local).
fn frame_details(view: &FrameView<'_>) -> (Rc<str>, Option<(usize, usize)>) {
    match view.kind {
        FrameKind::Function { table_index } => {
            match view.prog.and_then(|p| p.function(*table_index)) {
                Some(def) => (
                    def.name.clone(),
                    Some((def.num_arg as usize, def.num_local as usize)),
                ),
                None => (Rc::from("<function>"), None),
            }
        }
        FrameKind::Catch => (Rc::from("CATCH"), None),
        FrameKind::Funp { funp } => (
            Rc::from("<function>"),
            Some((funp.num_arg as usize, funp.num_local as usize)),
        ),
        FrameKind::Fake => (Rc::from("<function>"), None),
    }
}

/// Where the thread is executing right now, as `(file, line)`. Falls back
/// to the program name with line 0 when the offset cannot be resolved, and
/// to the empty name when nothing is executing. For error reporting outside
/// a full trace walk.
pub fn current_line_number(thread: &Thread) -> (Rc<str>, u32) {
    resolve_position(thread.current_prog.as_ref(), thread.pc)
}

fn resolve_position(prog: Option<&Rc<Program>>, pc: usize) -> (Rc<str>, u32) {
    match find_line(prog.map(|p| p.as_ref()), pc) {
        LineLookup::Found { file, line } => (file, line),
        _ => (
            prog.map(|p| p.name.clone()).unwrap_or_else(|| Rc::from("")),
            0,
        ),
    }
}

fn position_of(view: &FrameView<'_>) -> (Rc<str>, u32) {
    resolve_position(view.prog, view.pc)
}

/// Structured trace of the whole frame stack, bottom first. Empty when
/// nothing is executing.
pub fn get_svalue_trace(thread: &Thread, objects: &ObjectTable, how: DumpFlags) -> Vec<TraceFrame> {
    if thread.current_prog.is_none() || thread.frames().is_empty() {
        return Vec::new();
    }

    frame_views(thread)
        .iter()
        .map(|view| {
            let (function, counts) = frame_details(view);
            let (file, line) = position_of(view);
            let arguments = counts
                .filter(|_| how.contains(DumpFlags::WITH_ARGS))
                .map(|(num_arg, _)| thread.stack.frame_values(view.fp, num_arg).to_vec());
            let locals = counts
                .filter(|(_, num_local)| {
                    how.contains(DumpFlags::WITH_LOCALVARS) && *num_local > 0
                })
                .map(|(num_arg, num_local)| {
                    thread
                        .stack
                        .frame_values(view.fp + num_arg, num_local)
                        .to_vec()
                });
            TraceFrame {
                function,
                program: view
                    .prog
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| Rc::from("")),
                object: view.ob.and_then(|id| objects.name(id)).cloned(),
                file,
                line,
                arguments,
                locals,
            }
        })
        .collect()
}

/// Writes out a textual trace. Returns `None` when nothing is executing.
pub fn dump_trace(thread: &Thread, objects: &ObjectTable, how: DumpFlags) -> Option<TraceDump> {
    if thread.current_prog.is_none() || thread.frames().is_empty() {
        return None;
    }

    let mut text = String::new();
    let mut heart_beat = None;

    for view in frame_views(thread) {
        let (function, counts) = frame_details(&view);
        let location = get_line_number(view.prog.map(|p| p.as_ref()), view.pc);
        let program = view
            .prog
            .map(|p| p.name.clone())
            .unwrap_or_else(|| Rc::from(""));
        let object = view
            .ob
            .and_then(|id| objects.name(id))
            .map_or_else(|| Rc::from("<none>"), Rc::clone);

        match view.kind {
            FrameKind::Function { .. } => {
                let _ = writeln!(
                    text,
                    "\t{function}() at {location}, in program /{program} (object {object})"
                );
                if function.as_ref() == "heart_beat" {
                    heart_beat = view.own_ob.and_then(|id| objects.name(id)).cloned();
                }
            }
            FrameKind::Catch => {
                let _ = writeln!(
                    text,
                    "\t(catch) at {location}, in program /{program} (object {object})"
                );
            }
            FrameKind::Funp { .. } | FrameKind::Fake => {
                let _ = writeln!(
                    text,
                    "\t(function) at {location}, in program /{program} (object {object})"
                );
            }
        }

        if let Some((num_arg, num_local)) = counts {
            if how.contains(DumpFlags::WITH_ARGS) {
                let _ = write!(text, "\t\targuments: ");
                write_values(&mut text, thread.stack.frame_values(view.fp, num_arg));
                let _ = writeln!(text);
            }
            if how.contains(DumpFlags::WITH_LOCALVARS) && num_local > 0 {
                let _ = write!(text, "\t\tlocal variables: ");
                write_values(
                    &mut text,
                    thread.stack.frame_values(view.fp + num_arg, num_local),
                );
                let _ = writeln!(text);
            }
        }
    }

    Some(TraceDump { text, heart_beat })
}

fn write_values(out: &mut String, values: &[Value]) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{value}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use textvm_primitives::{FileSpan, FunPtr, FunctionDef, FunctionEntry, FunctionFlags, LineRun};

    fn lined_program() -> Rc<Program> {
        let mut prog = Program::new("obj/room");
        prog.bytecode = vec![0u8; 32].into_boxed_slice();
        prog.function_table.push(FunctionDef::new("look", 4, 1, 1));
        prog.entries.push(FunctionEntry::Defined { table_index: 0 });
        prog.function_flags.push(FunctionFlags::empty());
        prog.line_info = Some(LineInfo {
            // bytes [0..10] on line 3, (10..25] on line 7
            runs: vec![
                LineRun { span: 10, line: 3 },
                LineRun { span: 15, line: 7 },
            ],
            files: vec![Rc::from("obj/room.c"), Rc::from("inc/defs.h")],
            file_map: vec![
                FileSpan { first_line: 1, file: 1 },
                FileSpan { first_line: 100, file: 2 },
            ],
        });
        Rc::new(prog)
    }

    #[test]
    fn line_lookup() {
        let prog = lined_program();
        assert_eq!(
            find_line(Some(&prog), 6),
            LineLookup::Found {
                file: Rc::from("obj/room.c"),
                line: 3
            }
        );
        assert_eq!(
            find_line(Some(&prog), 20),
            LineLookup::Found {
                file: Rc::from("obj/room.c"),
                line: 7
            }
        );
        assert_eq!(find_line(None, 0), LineLookup::NoProgram);
        assert_eq!(get_line_number(None, 0), "(no program)");
        assert_eq!(
            get_line_number(Some(&Program::new("bare")), 0),
            "(no line numbers)"
        );
    }

    #[test]
    fn include_mapping() {
        let prog = lined_program();
        let info = prog.line_info.as_ref().unwrap();
        assert_eq!(
            translate_absolute_line(105, info),
            LineLookup::Found {
                file: Rc::from("inc/defs.h"),
                line: 6
            }
        );

        let mut deep = (*prog).clone();
        deep.line_info.as_mut().unwrap().file_map = vec![FileSpan {
            first_line: 1,
            file: FILE_INCLUDES_TOO_DEEP,
        }];
        assert_eq!(find_line(Some(&deep), 6), LineLookup::IncludesTooDeep);
        assert_eq!(get_line_number(Some(&deep), 6), "(includes too deep)");
    }

    #[test]
    fn compiled_in_program() {
        let mut prog = Program::new("builtin");
        prog.compiled_in = true;
        assert_eq!(get_line_number(Some(&prog), 0), "(compiled program)");
    }

    #[test]
    fn offset_past_bytecode() {
        let prog = lined_program();
        assert_eq!(find_line(Some(&prog), 999), LineLookup::NoLineNumbers);
    }

    fn traced_thread(objects: &mut ObjectTable) -> Thread {
        let mut t = Thread::new(8, 4);
        let ob = objects.create("players/frob");
        t.current_object = Some(ob);
        t.current_prog = Some(lined_program());
        t.stack.push(Value::string("east")).unwrap();
        t.push_frame(FrameKind::Function { table_index: 0 }).unwrap();
        t.set_frame_args(1);
        t.setup_new_frame(0).unwrap();
        t.pc = 6;
        t
    }

    #[test]
    fn svalue_trace_reports_args_and_locals() {
        let mut objects = ObjectTable::new();
        let t = traced_thread(&mut objects);
        let trace = get_svalue_trace(
            &t,
            &objects,
            DumpFlags::WITH_ARGS | DumpFlags::WITH_LOCALVARS,
        );
        assert_eq!(trace.len(), 1);
        let frame = &trace[0];
        assert_eq!(frame.function.as_ref(), "look");
        assert_eq!(frame.program.as_ref(), "obj/room");
        assert_eq!(frame.object.as_deref(), Some("players/frob"));
        assert_eq!(frame.file.as_ref(), "obj/room.c");
        assert_eq!(frame.line, 3);
        assert_eq!(frame.arguments.as_deref(), Some(&[Value::string("east")][..]));
        assert_eq!(frame.locals.as_deref(), Some(&[Value::Undefined][..]));
    }

    #[test]
    fn current_position_with_fallbacks() {
        let mut objects = ObjectTable::new();
        let t = traced_thread(&mut objects);
        assert_eq!(current_line_number(&t), (Rc::from("obj/room.c"), 3));

        // unresolvable offset falls back to the program name
        let mut t = t;
        t.pc = 999;
        assert_eq!(current_line_number(&t), (Rc::from("obj/room"), 0));

        // idle thread has no position at all
        let idle = Thread::new(8, 4);
        assert_eq!(current_line_number(&idle), (Rc::from(""), 0));
    }

    #[test]
    fn svalue_trace_empty_when_idle() {
        let objects = ObjectTable::new();
        let t = Thread::new(8, 4);
        assert!(get_svalue_trace(&t, &objects, DumpFlags::empty()).is_empty());
    }

    #[test]
    fn dump_trace_text_and_heart_beat() {
        let mut objects = ObjectTable::new();
        let mut t = Thread::new(8, 4);
        let ob = objects.create("players/frob");
        let mut prog = Program::new("std/living");
        prog.function_table
            .push(FunctionDef::new("heart_beat", 0, 0, 0));
        prog.entries.push(FunctionEntry::Defined { table_index: 0 });
        prog.function_flags.push(FunctionFlags::empty());
        t.current_prog = Some(Rc::new(prog));
        t.current_object = Some(ob);
        t.push_frame(FrameKind::Function { table_index: 0 }).unwrap();
        t.set_frame_args(0);
        t.setup_new_frame(0).unwrap();

        let dump = dump_trace(&t, &objects, DumpFlags::empty()).unwrap();
        assert!(dump.text.contains("heart_beat() at (no line numbers)"));
        assert!(dump.text.contains("in program /std/living"));
        assert_eq!(dump.heart_beat.as_deref(), Some("players/frob"));
    }

    #[test]
    fn funp_frames_use_stored_counts() {
        let mut objects = ObjectTable::new();
        let ob = objects.create("adm/daemon");
        let mut t = Thread::new(8, 4);
        t.current_prog = Some(lined_program());
        t.current_object = Some(ob);
        t.stack.push(Value::Int(9)).unwrap();
        let funp = Rc::new(FunPtr::new(ob, "cb").with_locals(1, 0));
        t.push_frame(FrameKind::Funp { funp }).unwrap();
        t.fp = 0;

        let trace = get_svalue_trace(&t, &objects, DumpFlags::WITH_ARGS);
        assert_eq!(trace[0].function.as_ref(), "<function>");
        assert_eq!(trace[0].arguments.as_deref(), Some(&[Value::Int(9)][..]));
        assert_eq!(trace[0].locals, None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn trace_frame_serializes() {
        let frame = TraceFrame {
            function: Rc::from("look"),
            program: Rc::from("obj/room"),
            object: None,
            file: Rc::from("obj/room.c"),
            line: 3,
            arguments: Some(vec![Value::Int(1)]),
            locals: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"look\""));
        let back: TraceFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}
