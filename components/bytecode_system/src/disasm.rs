//! Human-readable dumps of compiled bytecode.
//!
//! Used by the CLI's `--dump-bytecode` flag and by tests that need to
//! assert on the shape of emitted code.

use crate::Instruction;
use core_types::Value;
use std::fmt::Write;

/// Writes one line per instruction with its decoded fields.
///
/// `lines` is the parallel code-to-line table; pass an empty slice to
/// omit line numbers.
pub fn disassemble_instructions(out: &mut String, code: &[Instruction], lines: &[u16]) {
    for (i, inst) in code.iter().enumerate() {
        if let Some(line) = lines.get(i) {
            let _ = write!(out, "line[{:3}] ", line);
        }

        match inst.op() {
            Some(op) => {
                let _ = writeln!(
                    out,
                    "{:04} | 0x{:08X} | {:12} | a: {:3} b: {:3} c: {:3} bx: {:6} sbx: {:+7}",
                    i,
                    inst.bits(),
                    op.name(),
                    inst.a(),
                    inst.b(),
                    inst.c(),
                    inst.bx(),
                    inst.sbx()
                );
            }
            None => {
                let _ = writeln!(out, "{:04} | 0x{:08X} | <invalid>", i, inst.bits());
            }
        }
    }
}

/// A borrowed view of a compiled function, enough to dump it without
/// this crate knowing about the heap.
pub struct FunctionDump<'a> {
    /// Function name as compiled.
    pub name: &'a str,
    /// Declared arity (-1 means variadic).
    pub arity: i32,
    /// Operand-stack slots the function needs.
    pub needed_stack_space: usize,
    /// The constant pool.
    pub constants: &'a [Value],
    /// The instruction vector.
    pub code: &'a [Instruction],
    /// Parallel code-to-line table.
    pub lines: &'a [u16],
}

/// Renders a full function dump. `fmt_const` formats pool entries; the
/// caller supplies a heap-aware formatter so strings print as content.
pub fn disassemble_function(
    out: &mut String,
    dump: &FunctionDump<'_>,
    fmt_const: impl Fn(Value) -> String,
) {
    let _ = writeln!(
        out,
        "fn {}(arity = {}, stack_space = {}):",
        dump.name, dump.arity, dump.needed_stack_space
    );

    let _ = writeln!(out, "  constants({}):", dump.constants.len());
    for (i, constant) in dump.constants.iter().enumerate() {
        let _ = writeln!(out, "    [{}] = {}", i, fmt_const(*constant));
    }

    let _ = writeln!(out, "  instructions({}):", dump.code.len());
    let mut body = String::new();
    disassemble_instructions(&mut body, dump.code, dump.lines);
    for line in body.lines() {
        let _ = writeln!(out, "    {}", line);
    }
}
