//! The function builder.
//!
//! The parser never touches instruction words directly; it asks a
//! `FunctionBuilder` to declare locals, allocate temporaries, add
//! constants, and emit instructions. When a function body is done,
//! [`FunctionBuilder::end`] produces a [`FnProto`] the runtime turns
//! into a function object.
//!
//! Locals live in one flat list; a parallel stack of per-scope counts
//! makes popping a scope a single truncate. Temporaries are unnamed
//! locals released LIFO.

use bytecode_system::{Instruction, OpCode};
use core_types::Value;

/// Slot value meaning "no register / no symbol".
pub const INVALID_SLOT: u16 = (1 << 15) - 1;

/// Everything needed to materialize a function object.
#[derive(Debug)]
pub struct FnProto {
    /// Function name as written in source (empty for anonymous).
    pub name: String,
    /// Declared parameter count; -1 means variadic.
    pub arity: i32,
    /// De-duplicated constant pool.
    pub constants: Vec<Value>,
    /// Emitted instructions, `RETURN 0` trailer included.
    pub code: Vec<Instruction>,
    /// 1-based source line per instruction.
    pub code_to_line: Vec<u16>,
    /// Operand-stack slots a frame needs.
    pub needed_stack_space: usize,
}

/// Builds one function's bytecode. Builders nest: the parser keeps a
/// stack of them, one per function currently being compiled.
pub struct FunctionBuilder<'a> {
    name: String,
    constants: Vec<Value>,
    code: Vec<Instruction>,
    code_to_line: Vec<u16>,
    /// Flat list of local names; temporaries are empty strings.
    locals: Vec<&'a str>,
    /// Number of locals declared per open scope.
    scope_sizes: Vec<usize>,
    max_local_idx: usize,
    current_line: u32,
}

impl<'a> FunctionBuilder<'a> {
    /// Starts a builder with the outermost scope open.
    pub fn new(name: impl Into<String>) -> FunctionBuilder<'a> {
        let mut builder = FunctionBuilder {
            name: name.into(),
            constants: Vec::new(),
            code: Vec::new(),
            code_to_line: Vec::new(),
            locals: Vec::new(),
            scope_sizes: Vec::new(),
            max_local_idx: 0,
            current_line: 1,
        };
        builder.push_scope();
        builder
    }

    /// Sets the line recorded for subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Number of instructions emitted so far; the "current ip" used by
    /// jump patching.
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Reads an emitted instruction (for patch decisions).
    pub fn instruction(&self, index: usize) -> Instruction {
        self.code[index]
    }

    /// Overwrites an emitted instruction.
    pub fn patch(&mut self, index: usize, inst: Instruction) {
        self.code[index] = inst;
    }

    /// Adds `value` to the constant pool, de-duplicated by exact value
    /// equality. Returns the pool index and whether a new entry was
    /// appended (callers root newly added object constants).
    pub fn add_constant(&mut self, value: Value) -> (u32, bool) {
        if let Some(index) = self.constants.iter().position(|c| *c == value) {
            return (index as u32, false);
        }
        self.constants.push(value);
        ((self.constants.len() - 1) as u32, true)
    }

    /// Opens a scope.
    pub fn push_scope(&mut self) {
        self.scope_sizes.push(0);
    }

    /// Closes the innermost scope, releasing its locals.
    pub fn pop_scope(&mut self) {
        let count = self.scope_sizes.pop().expect("scope underflow");
        let new_len = self.locals.len() - count;
        self.locals.truncate(new_len);
    }

    /// Number of open scopes. The outermost scope of the top-level
    /// function is depth 1.
    pub fn scope_depth(&self) -> usize {
        self.scope_sizes.len()
    }

    /// Declares a named local in the current scope and returns its
    /// register. Redeclaring a name already in the current scope is a
    /// compile error; the existing slot is returned alongside the
    /// error marker.
    pub fn decl_variable(&mut self, name: &'a str) -> Result<u16, u16> {
        let scope_count = *self.scope_sizes.last().expect("no open scope");
        let scope_start = self.locals.len() - scope_count;
        for (i, local) in self.locals[scope_start..].iter().enumerate() {
            if !local.is_empty() && *local == name {
                return Err((scope_start + i) as u16);
            }
        }

        let slot = self.locals.len();
        self.locals.push(name);
        *self.scope_sizes.last_mut().expect("no open scope") += 1;
        self.note_local(slot + 1);
        Ok(slot as u16)
    }

    /// Finds a named local, searching inner scopes first. Temporaries
    /// never match.
    pub fn get_variable(&self, name: &str) -> Option<u16> {
        self.locals
            .iter()
            .rposition(|local| !local.is_empty() && *local == name)
            .map(|i| i as u16)
    }

    /// Reserves `count` anonymous locals and returns the first slot.
    pub fn push_temp(&mut self, count: u16) -> u16 {
        let first = self.locals.len();
        for _ in 0..count {
            self.locals.push("");
        }
        self.note_local(self.locals.len());
        first as u16
    }

    /// Releases every local from `start` upward. Temporaries are
    /// strictly LIFO.
    pub fn pop_temp(&mut self, start: u16) {
        self.locals.truncate(start as usize);
    }

    fn note_local(&mut self, high_water: usize) {
        if self.max_local_idx < high_water {
            self.max_local_idx = high_water;
        }
    }

    /// Emits an ABC-form instruction.
    pub fn emit_abc(&mut self, op: OpCode, a: u16, b: u16, c: u16) {
        self.code_to_line.push(self.current_line as u16);
        self.code.push(Instruction::abc(op, a, b, c));
    }

    /// Emits an ABx-form instruction.
    pub fn emit_abx(&mut self, op: OpCode, a: u16, bx: u32) {
        self.code_to_line.push(self.current_line as u16);
        self.code.push(Instruction::abx(op, a, bx));
    }

    /// Emits an AsBx-form instruction.
    pub fn emit_asbx(&mut self, op: OpCode, a: u16, sbx: i32) {
        self.code_to_line.push(self.current_line as u16);
        self.code.push(Instruction::asbx(op, a, sbx));
    }

    /// Emits the break placeholder; the enclosing loop rewrites it to
    /// a forward jump when it closes.
    pub fn emit_break(&mut self) {
        self.code_to_line.push(self.current_line as u16);
        self.code.push(Instruction::INVALID);
    }

    /// Finishes the function: appends the `RETURN 0` safety trailer,
    /// closes the outermost scope, and hands back the prototype.
    pub fn end(mut self, arity: i32) -> FnProto {
        self.emit_abx(OpCode::Return, 0, 0);
        self.pop_scope();

        let needed = self.max_local_idx + arity.max(0) as usize + 1;
        FnProto {
            name: self.name,
            arity,
            constants: self.constants,
            code: self.code,
            code_to_line: self.code_to_line,
            needed_stack_space: needed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_and_lookup() {
        let mut b = FunctionBuilder::new("f");
        assert_eq!(b.decl_variable("x"), Ok(0));
        assert_eq!(b.decl_variable("y"), Ok(1));
        assert_eq!(b.get_variable("x"), Some(0));
        assert_eq!(b.get_variable("y"), Some(1));
        assert_eq!(b.get_variable("z"), None);
    }

    #[test]
    fn test_duplicate_in_same_scope_is_error() {
        let mut b = FunctionBuilder::new("f");
        assert_eq!(b.decl_variable("x"), Ok(0));
        assert_eq!(b.decl_variable("x"), Err(0));
    }

    #[test]
    fn test_shadowing_in_inner_scope() {
        let mut b = FunctionBuilder::new("f");
        assert_eq!(b.decl_variable("x"), Ok(0));
        b.push_scope();
        assert_eq!(b.decl_variable("x"), Ok(1), "inner scope may shadow");
        assert_eq!(b.get_variable("x"), Some(1), "inner wins");
        b.pop_scope();
        assert_eq!(b.get_variable("x"), Some(0));
    }

    #[test]
    fn test_temps_are_lifo() {
        let mut b = FunctionBuilder::new("f");
        b.decl_variable("x").unwrap();
        let t0 = b.push_temp(2);
        assert_eq!(t0, 1);
        let t1 = b.push_temp(1);
        assert_eq!(t1, 3);
        b.pop_temp(t1);
        assert_eq!(b.push_temp(1), 3, "released slots are reused");
        b.pop_temp(t0);
        assert_eq!(b.push_temp(1), 1);
    }

    #[test]
    fn test_temps_do_not_shadow_names() {
        let mut b = FunctionBuilder::new("f");
        b.decl_variable("x").unwrap();
        b.push_temp(3);
        assert_eq!(b.get_variable("x"), Some(0));
    }

    #[test]
    fn test_constant_dedup() {
        let mut b = FunctionBuilder::new("f");
        let v = Value::from_number(1.5);
        assert_eq!(b.add_constant(v), (0, true));
        assert_eq!(b.add_constant(Value::TRUE), (1, true));
        assert_eq!(b.add_constant(v), (0, false));
    }

    #[test]
    fn test_end_appends_return_and_sizes_stack() {
        let mut b = FunctionBuilder::new("f");
        b.decl_variable("a").unwrap();
        b.decl_variable("b").unwrap();
        let t = b.push_temp(2);
        b.pop_temp(t);
        b.emit_abx(OpCode::LoadBasic, 0, 2);

        let proto = b.end(2);
        assert_eq!(proto.arity, 2);
        assert_eq!(proto.code.last().unwrap().op(), Some(OpCode::Return));
        assert_eq!(proto.code.len(), proto.code_to_line.len());
        // needed_stack_space >= arity + 1 + highest used local index.
        assert!(proto.needed_stack_space >= 2 + 1 + 2);
    }

    #[test]
    fn test_break_placeholder_is_invalid_word() {
        let mut b = FunctionBuilder::new("f");
        b.emit_break();
        assert!(b.instruction(0).is_invalid());
    }
}
