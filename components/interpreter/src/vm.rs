//! VM state, the dispatch loop, and garbage-collection glue.

use crate::symbols::SymbolTable;
use bytecode_system::{Instruction, OpCode};
use core_types::{ErrorKind, ObjId, SymbolId, Value, VmError, VmResult};
use memory_manager::object::{InstanceObj, ModuleObj, ObjData, StrObj};
use memory_manager::{GcRoots, HandlePool, Heap};
use rustc_hash::FxHashMap;
use std::any::Any;

/// A host function callable from script code. `num_args` values are
/// visible at stack indices `0..num_args`; the return value goes to
/// index 0. Returning an error unwinds like any runtime error.
pub type NativeFn = fn(&mut Vm, num_args: i32) -> VmResult<()>;

/// A host finalizer bound to a native class. It runs once, right
/// before the instance is freed, receiving the VM's user data and the
/// instance's inline bytes.
pub type ClassFinalizer = fn(user_data: &mut dyn Any, extra_data: &mut [u8]);

/// Hook invoked for every reported error and stack-trace row.
pub type ErrorHook = Box<dyn FnMut(ErrorKind, i32, &str)>;
/// Hook invoked when script code prints.
pub type PrintHook = Box<dyn FnMut(&str)>;
/// Hook resolving `import "name"` to source text: `(from, name)` to
/// source, or `None` when the module cannot be found.
pub type ModuleHook = Box<dyn FnMut(&str, &str) -> Option<String>>;

/// Construction parameters for a [`Vm`].
pub struct VmParams {
    /// Error hook; `None` means errors are only observable through
    /// return values and [`Vm::error_string`].
    pub error_fn: Option<ErrorHook>,
    /// Print hook; `None` makes `print` a no-op.
    pub print_fn: Option<PrintHook>,
    /// Module-load hook; `None` means user modules cannot be imported.
    pub module_fn: Option<ModuleHook>,
    /// The heap budget never shrinks below this many bytes.
    pub min_heap_size: usize,
    /// Initial heap budget in bytes.
    pub heap_size: usize,
    /// Fractional budget growth after a collection (0.5 grows by half).
    pub heap_growth_factor: f32,
    /// Opaque host data, handed to class finalizers.
    pub user_data: Box<dyn Any>,
}

impl Default for VmParams {
    fn default() -> VmParams {
        VmParams {
            error_fn: None,
            print_fn: None,
            module_fn: None,
            min_heap_size: 1_000_000,
            heap_size: 5_242_880,
            heap_growth_factor: 0.5,
            user_data: Box::new(()),
        }
    }
}

/// Symbols with reserved ids, interned at VM startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltInSymbol {
    /// The default constructor method name.
    Ctor,
    /// The destructor method name, invoked by the collector.
    Dtor,
    /// The call operator method name.
    Call,
}

impl BuiltInSymbol {
    /// The source-level spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            BuiltInSymbol::Ctor => "ctor",
            BuiltInSymbol::Dtor => "dtor",
            BuiltInSymbol::Call => "call",
        }
    }
}

/// One call-stack entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    /// The executing function; `None` for native frames.
    pub(crate) func: Option<ObjId>,
    /// Index of the next instruction to decode.
    pub(crate) ip: usize,
    /// Where this frame's locals start on the operand stack.
    pub(crate) base: usize,
    /// `stack_top` to restore when the frame pops.
    pub(crate) saved_top: usize,
    /// One past the last stack slot this frame owns; vacated slots are
    /// cleared on pop so stale values cannot keep objects alive.
    pub(crate) extent: usize,
}

/// A Skald virtual machine instance.
pub struct Vm {
    pub(crate) params: VmParams,
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) stack_top: usize,
    pub(crate) frames: Vec<Frame>,
    pub(crate) symbols: SymbolTable,
    pub(crate) modules: FxHashMap<Box<str>, ObjId>,
    pub(crate) handles: HandlePool,
    pub(crate) compile_roots: Vec<Value>,
    pub(crate) natives: Vec<NativeFn>,
    pub(crate) finalizers: Vec<ClassFinalizer>,
    pub(crate) builtin_symbols: [SymbolId; 3],
    pub(crate) current_native_fn: Option<ObjId>,
    pub(crate) last_error: String,
}

impl Vm {
    /// Creates a VM from the given parameters.
    pub fn new(params: VmParams) -> Vm {
        let heap = Heap::new(
            params.min_heap_size,
            params.heap_size,
            params.heap_growth_factor,
        );

        let mut symbols = SymbolTable::new();
        let builtin_symbols = [
            symbols.intern(BuiltInSymbol::Ctor.as_str()),
            symbols.intern(BuiltInSymbol::Dtor.as_str()),
            symbols.intern(BuiltInSymbol::Call.as_str()),
        ];

        Vm {
            params,
            heap,
            stack: Vec::new(),
            stack_top: 0,
            frames: Vec::new(),
            symbols,
            modules: FxHashMap::default(),
            handles: HandlePool::new(),
            compile_roots: Vec::new(),
            natives: Vec::new(),
            finalizers: Vec::new(),
            builtin_symbols,
            current_native_fn: None,
            last_error: String::new(),
        }
    }

    /// The reserved symbol id of a built-in name.
    pub(crate) fn builtin(&self, sym: BuiltInSymbol) -> SymbolId {
        match sym {
            BuiltInSymbol::Ctor => self.builtin_symbols[0],
            BuiltInSymbol::Dtor => self.builtin_symbols[1],
            BuiltInSymbol::Call => self.builtin_symbols[2],
        }
    }

    /// Borrows the host's user data.
    pub fn user_data(&mut self) -> &mut dyn Any {
        self.params.user_data.as_mut()
    }

    /// The last error message, user readable.
    pub fn error_string(&self) -> &str {
        &self.last_error
    }

    /// Number of live heap objects. Diagnostic.
    pub fn gc_live_objects(&self) -> usize {
        self.heap.live_count()
    }

    /// Bytes currently charged against the heap budget. Diagnostic.
    pub fn gc_bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    /// Records `message` as the last error and forwards it to the
    /// error hook.
    pub(crate) fn report(&mut self, kind: ErrorKind, line: i32, message: &str) {
        self.last_error = message.to_string();
        if let Some(hook) = self.params.error_fn.as_mut() {
            hook(kind, line, message);
        }
    }

    /* Allocation */

    /// Allocates a heap object, collecting first when the budget is
    /// exhausted. Every allocation in the VM funnels through here, so
    /// a collection can never start mid-allocation.
    pub(crate) fn alloc_obj(&mut self, data: ObjData) -> ObjId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(data)
    }

    /// Allocates a string object from already-unescaped contents.
    pub(crate) fn alloc_str_obj(&mut self, contents: String) -> ObjId {
        self.alloc_obj(ObjData::Str(StrObj::new(contents)))
    }

    /// Allocates an instance of `class`, seeding fields from the
    /// class's initializer list.
    pub(crate) fn alloc_instance(&mut self, class: ObjId) -> ObjId {
        let (fields, extra_len) = match &self.heap.get(class).data {
            ObjData::Class(c) => {
                let mut fields = FxHashMap::default();
                for slot in &c.field_initializers {
                    if let Some(name) = slot.name {
                        fields.insert(name, slot.value);
                    }
                }
                (fields, c.extra_data_size)
            }
            _ => unreachable!("alloc_instance on a non-class"),
        };

        self.alloc_obj(ObjData::Instance(InstanceObj {
            class,
            fields,
            extra_data: vec![0u8; extra_len].into_boxed_slice(),
        }))
    }

    /// Allocates an empty, unregistered module object.
    pub(crate) fn alloc_module(&mut self, name: &str) -> ObjId {
        self.alloc_obj(ObjData::Module(ModuleObj {
            name: name.into(),
            variables: Vec::new(),
            init_fn: None,
        }))
    }

    /* Garbage collection */

    /// Runs a full collection cycle, including deferred script
    /// destructors. A no-op while a collection is already running.
    pub fn collect_garbage(&mut self) {
        if self.heap.gc_is_running() {
            return;
        }

        let frame_fns: Vec<ObjId> = self.frames.iter().filter_map(|f| f.func).collect();
        let module_ids: Vec<ObjId> = self.modules.values().copied().collect();
        let handle_values: Vec<Value> = self.handles.values().collect();
        let dtor_symbol = self.builtin(BuiltInSymbol::Dtor);

        {
            let roots = GcRoots {
                stack: &self.stack,
                frame_fns: &frame_fns,
                modules: &module_ids,
                handles: &handle_values,
                compile_roots: &self.compile_roots,
            };

            let finalizers = &self.finalizers;
            let user_data: &mut dyn Any = self.params.user_data.as_mut();
            self.heap.collect(&roots, dtor_symbol, &mut |fid, extra| {
                (finalizers[fid as usize])(&mut *user_data, extra);
            });
        }

        let pending = self.heap.take_pending_dtors();
        self.run_script_dtors(&pending);
        self.heap.finish_collect();
    }

    /// Best-effort invocation of queued script `dtor`s. Collection is
    /// still suppressed while these run.
    fn run_script_dtors(&mut self, pending: &[ObjId]) {
        if pending.is_empty() {
            return;
        }

        let dtor_symbol = self.builtin(BuiltInSymbol::Dtor);
        for &obj in pending {
            let Some(method) = self.find_class_method(obj, dtor_symbol) else {
                continue;
            };

            // Two scratch slots, saved and restored around the call.
            let _ = self.stack_resize(2);
            let s0 = self.stack[self.stack_top];
            let s1 = self.stack[self.stack_top + 1];
            self.stack[self.stack_top] = method;
            self.stack[self.stack_top + 1] = Value::from_object(obj);
            let _ = self.call(0, 1, 1);
            self.stack[self.stack_top] = s0;
            self.stack[self.stack_top + 1] = s1;
        }
    }

    /// Resolves a method on the class chain of an instance, reference,
    /// or weak reference; only function values count.
    pub(crate) fn find_class_method(&self, obj: ObjId, sym: SymbolId) -> Option<Value> {
        let class = match &self.heap.get(obj).data {
            ObjData::Instance(inst) => Some(inst.class),
            ObjData::Reference(r) => r.class,
            ObjData::WeakRef(w) => w.class,
            _ => None,
        }?;
        self.find_method_on_class(class, sym)
    }

    pub(crate) fn find_method_on_class(&self, class: ObjId, sym: SymbolId) -> Option<Value> {
        let mut cursor = Some(class);
        while let Some(cid) = cursor {
            let ObjData::Class(c) = &self.heap.get(cid).data else {
                return None;
            };
            if let Some(slot) = c.symbols.get(sym.index()) {
                let value = slot.value;
                if value.is_object() && self.heap.get(value.as_object()).data.is_function() {
                    return Some(value);
                }
            }
            cursor = c.base;
        }
        None
    }

    /* Stack and frames */

    /// Ensures `size` addressable slots above `stack_top`.
    pub fn stack_resize(&mut self, size: usize) -> VmResult<()> {
        let required = self.stack_top + size;
        if self.stack.len() < required {
            self.stack.resize(required, Value::NIL);
        }
        Ok(())
    }

    /// Number of slots addressable above `stack_top`.
    pub fn stack_size(&self) -> usize {
        self.stack.len() - self.stack_top
    }

    pub(crate) fn slot(&self, idx: usize) -> usize {
        let slot = self.stack_top + idx;
        assert!(slot < self.stack.len(), "invalid API stack index {}", idx);
        slot
    }

    fn push_script_frame(&mut self, func: ObjId, base: usize) {
        let needed = match &self.heap.get(func).data {
            ObjData::Function(f) => f.needed_stack_space,
            _ => unreachable!("script frame for a non-function"),
        };

        let old_top = self.stack_top;
        let required = base + needed;
        if self.stack.len() < required {
            self.stack.resize(required, Value::NIL);
        }
        if self.stack_top < required {
            self.stack_top = required;
        }

        self.frames.push(Frame {
            func: Some(func),
            ip: 0,
            base,
            saved_top: old_top,
            extent: required,
        });
    }

    fn push_native_frame(&mut self, base: usize) {
        let old_top = self.stack_top;
        // The native sees a window whose slot 0 is its first argument.
        self.stack_top = base;
        self.frames.push(Frame {
            func: None,
            ip: 0,
            base,
            saved_top: old_top,
            extent: base,
        });
    }

    fn pop_frame(&mut self) {
        let frame = self.frames.pop().expect("call frame underflow");
        // Clear the vacated slots (keeping the return slot) so stale
        // values cannot keep dead objects reachable.
        let hi = frame.extent.min(self.stack.len());
        let lo = (frame.base + 1).min(hi);
        for value in &mut self.stack[lo..hi] {
            *value = Value::NIL;
        }
        self.stack_top = frame.saved_top;
    }

    /* Execution */

    /// Runs `func` with its locals based at `base`, unwinding back to
    /// this frame on error.
    pub(crate) fn exec_top_frame(&mut self, func: ObjId, base: usize) -> VmResult<()> {
        self.push_script_frame(func, base);
        let reference_frame = self.frames.len() - 1;

        match self.run_dispatch(reference_frame) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.unwind(reference_frame, &err);
                Err(VmError::new(ErrorKind::Runtime, err.message))
            }
        }
    }

    fn fetch(&self, func: ObjId, ip: usize) -> Option<Instruction> {
        match &self.heap.get(func).data {
            ObjData::Function(f) => f.code.get(ip).copied(),
            _ => None,
        }
    }

    fn fn_constant(&self, func: ObjId, index: usize) -> VmResult<Value> {
        match &self.heap.get(func).data {
            ObjData::Function(f) => f.constants.get(index).copied().ok_or_else(|| {
                VmError::runtime(format!("constant index {} out of range", index))
            }),
            _ => Err(VmError::runtime("constant load outside a function")),
        }
    }

    fn fn_module(&self, func: ObjId) -> ObjId {
        match &self.heap.get(func).data {
            ObjData::Function(f) => f.module,
            _ => unreachable!("frame holds a non-function"),
        }
    }

    fn advance_ip(&mut self, amount: i32) {
        let frame = self.frames.last_mut().expect("no active frame");
        frame.ip = (frame.ip as i64 + i64::from(amount)) as usize;
    }

    fn run_dispatch(&mut self, reference_frame: usize) -> VmResult<()> {
        loop {
            let frame = *self.frames.last().expect("no active frame");
            let func = frame.func.expect("dispatch on a native frame");
            let base = frame.base;

            let inst = self
                .fetch(func, frame.ip)
                .ok_or_else(|| VmError::runtime("instruction pointer out of bounds"))?;
            let op = inst
                .op()
                .ok_or_else(|| VmError::runtime(format!("invalid instruction 0x{:08X}", inst.bits())))?;

            match op {
                OpCode::Return => {
                    let result = self.stack[base + inst.bx() as usize];
                    self.stack[base] = result;
                    self.pop_frame();
                    if self.frames.len() <= reference_frame {
                        return Ok(());
                    }
                    continue;
                }

                OpCode::LoadBasic => {
                    let bx = inst.bx();
                    let value = match bx {
                        0 => Value::TRUE,
                        1 => Value::FALSE,
                        2 => Value::NIL,
                        3 => Value::from_object(self.fn_module(func)),
                        _ => self.fn_constant(func, (bx - 4) as usize)?,
                    };
                    self.stack[base + inst.a() as usize] = value;
                }

                OpCode::StoreMove => {
                    let value = self.stack[base + inst.bx() as usize];
                    self.stack[base + inst.a() as usize] = value;
                }

                OpCode::LoadSymbol => {
                    let owner = self.stack[base + inst.b() as usize];
                    let sym = SymbolId(inst.c());
                    let value = self.symbol_lookup(owner, sym)?;
                    self.stack[base + inst.a() as usize] = value;
                }

                OpCode::StoreSymbol => {
                    let target = self.stack[base + inst.a() as usize];
                    let sym = SymbolId(inst.b());
                    let value = self.stack[base + inst.c() as usize];
                    self.symbol_store(target, sym, value)?;
                }

                OpCode::NewClass => {
                    let class_value = self.stack[base + inst.bx() as usize];
                    if !class_value.is_object() {
                        return Err(VmError::runtime(format!(
                            "called 'new' on a non-class value ({})",
                            self.heap.display(class_value)
                        )));
                    }
                    let class = class_value.as_object();
                    if !matches!(self.heap.get(class).data, ObjData::Class(_)) {
                        return Err(VmError::runtime(format!(
                            "called 'new' on a {}",
                            self.heap.get(class).data.kind_name()
                        )));
                    }
                    let instance = self.alloc_instance(class);
                    self.stack[base + inst.a() as usize] = Value::from_object(instance);
                }

                OpCode::MathAdd => {
                    let lhs = self.stack[base + inst.b() as usize];
                    let rhs = self.stack[base + inst.c() as usize];
                    let result = if lhs.is_number() && rhs.is_number() {
                        Value::from_number(lhs.as_number() + rhs.as_number())
                    } else if self.is_string(lhs) || self.is_string(rhs) {
                        let text = format!("{}{}", self.heap.display(lhs), self.heap.display(rhs));
                        Value::from_object(self.alloc_str_obj(text))
                    } else {
                        return Err(VmError::runtime(format!(
                            "'+' on incompatible types ({} + {})",
                            self.type_description(lhs),
                            self.type_description(rhs)
                        )));
                    };
                    self.stack[base + inst.a() as usize] = result;
                }

                OpCode::MathSub | OpCode::MathMul | OpCode::MathDiv | OpCode::MathMod
                | OpCode::MathPow => {
                    let lhs = self.stack[base + inst.b() as usize];
                    let rhs = self.stack[base + inst.c() as usize];
                    if !lhs.is_number() || !rhs.is_number() {
                        return Err(VmError::runtime(format!(
                            "arithmetic on non-number values ({} and {})",
                            self.type_description(lhs),
                            self.type_description(rhs)
                        )));
                    }
                    let result = match op {
                        OpCode::MathSub => lhs.sub(rhs),
                        OpCode::MathMul => lhs.mul(rhs),
                        OpCode::MathDiv => lhs.div(rhs),
                        OpCode::MathMod => lhs.rem(rhs),
                        OpCode::MathPow => lhs.pow(rhs),
                        _ => unreachable!(),
                    };
                    self.stack[base + inst.a() as usize] = result;
                }

                OpCode::MathInv => {
                    let operand = self.stack[base + inst.bx() as usize];
                    if !operand.is_number() {
                        return Err(VmError::runtime(format!(
                            "negation of a non-number value ({})",
                            self.type_description(operand)
                        )));
                    }
                    self.stack[base + inst.a() as usize] = operand.neg();
                }

                OpCode::CmpEe | OpCode::CmpNe => {
                    let lhs = self.stack[base + inst.b() as usize];
                    let rhs = self.stack[base + inst.c() as usize];
                    let equal = self.heap.values_equal(lhs, rhs);
                    let result = if op == OpCode::CmpEe { equal } else { !equal };
                    self.stack[base + inst.a() as usize] = Value::from_bool(result);
                }

                OpCode::CmpLt | OpCode::CmpLe | OpCode::CmpGt | OpCode::CmpGe => {
                    let lhs = self.stack[base + inst.b() as usize];
                    let rhs = self.stack[base + inst.c() as usize];
                    let result = match op {
                        OpCode::CmpLt => lhs.lt(rhs),
                        OpCode::CmpLe => lhs.le(rhs),
                        OpCode::CmpGt => lhs.gt(rhs),
                        OpCode::CmpGe => lhs.ge(rhs),
                        _ => unreachable!(),
                    };
                    self.stack[base + inst.a() as usize] = Value::from_bool(result);
                }

                OpCode::CmpAnd | OpCode::CmpOr => {
                    let lhs = self.stack[base + inst.b() as usize].is_truthy();
                    let rhs = self.stack[base + inst.c() as usize].is_truthy();
                    let result = if op == OpCode::CmpAnd { lhs && rhs } else { lhs || rhs };
                    self.stack[base + inst.a() as usize] = Value::from_bool(result);
                }

                OpCode::Not => {
                    let operand = self.stack[base + inst.bx() as usize];
                    self.stack[base + inst.a() as usize] = Value::from_bool(!operand.is_truthy());
                }

                OpCode::Jump => {
                    self.advance_ip(inst.sbx());
                    continue;
                }

                OpCode::JumpIf => {
                    if self.stack[base + inst.a() as usize].is_truthy() {
                        self.advance_ip(inst.sbx());
                        continue;
                    }
                }

                OpCode::JumpIfNot => {
                    if !self.stack[base + inst.a() as usize].is_truthy() {
                        self.advance_ip(inst.sbx());
                        continue;
                    }
                }

                OpCode::CallFn => {
                    if self.dispatch_call(base, inst)? {
                        // A script function was entered; its frame is
                        // now on top.
                        continue;
                    }
                }
            }

            self.advance_ip(1);
        }
    }

    /// Handles CALL_FN. Returns `Ok(true)` when a script frame was
    /// pushed (the dispatch loop re-enters it) and `Ok(false)` when
    /// the call completed inline (native functions).
    fn dispatch_call(&mut self, base: usize, inst: Instruction) -> VmResult<bool> {
        let new_base = base + inst.a() as usize;
        let callee_value = self.stack[base + inst.b() as usize];
        let mut num_args = inst.c() as usize;

        if !callee_value.is_object() {
            return Err(VmError::runtime(format!(
                "cannot call a non-object value ({})",
                self.heap.display(callee_value)
            )));
        }

        let mut target = callee_value.as_object();

        // Instances, references, and weak references dispatch through
        // their class's `call` operator with the receiver prepended.
        if matches!(
            self.heap.get(target).data,
            ObjData::Instance(_) | ObjData::Reference(_) | ObjData::WeakRef(_)
        ) {
            let call_sym = self.builtin(BuiltInSymbol::Call);
            let Some(method) = self.find_class_method(target, call_sym) else {
                return Err(VmError::runtime(format!(
                    "{} does not define a 'call' operator",
                    self.heap.display(callee_value)
                )));
            };

            let required = new_base + num_args + 1;
            if self.stack.len() < required {
                self.stack.resize(required, Value::NIL);
            }
            self.stack.copy_within(new_base..new_base + num_args, new_base + 1);
            self.stack[new_base] = callee_value;
            num_args += 1;
            target = method.as_object();
        }

        enum Callee {
            Script { arity: i32, name: String },
            Native { arity: i32, native: u32 },
        }

        let callee = match &self.heap.get(target).data {
            ObjData::Function(f) => Callee::Script {
                arity: f.arity,
                name: f.name.to_string(),
            },
            ObjData::NativeFn(f) => Callee::Native {
                arity: f.arity,
                native: f.native,
            },
            other => {
                return Err(VmError::runtime(format!(
                    "cannot call a {}",
                    other.kind_name()
                )))
            }
        };

        match callee {
            Callee::Script { arity, name } => {
                if arity >= 0 && num_args != arity as usize {
                    return Err(VmError::runtime(format!(
                        "function '{}' called with {} argument(s) but requires {}",
                        name, num_args, arity
                    )));
                }
                self.advance_ip(1);
                self.push_script_frame(target, new_base);
                Ok(true)
            }
            Callee::Native { arity, native } => {
                if arity >= 0 && num_args != arity as usize {
                    return Err(VmError::runtime(format!(
                        "native function called with {} argument(s) but requires {}",
                        num_args, arity
                    )));
                }
                let native = self.natives[native as usize];

                self.push_native_frame(new_base);
                let previous_native = self.current_native_fn.replace(target);
                let result = native(self, num_args as i32);
                self.current_native_fn = previous_native;
                self.pop_frame();
                result?;
                Ok(false)
            }
        }
    }

    /* Symbol resolution */

    fn is_string(&self, value: Value) -> bool {
        value.is_object() && matches!(self.heap.get(value.as_object()).data, ObjData::Str(_))
    }

    fn type_description(&self, value: Value) -> String {
        if value.is_number() {
            "number".to_string()
        } else if value.is_bool() {
            "bool".to_string()
        } else if value.is_nil() {
            "nil".to_string()
        } else {
            self.heap.get(value.as_object()).data.kind_name().to_string()
        }
    }

    /// LOAD_SYMBOL resolution: instance fields, then the class chain,
    /// then module variables. A miss is a runtime error naming the
    /// class chain or module that was searched.
    pub(crate) fn symbol_lookup(&self, owner: Value, sym: SymbolId) -> VmResult<Value> {
        let name = self.symbols.name(sym);

        if !owner.is_object() {
            return Err(VmError::runtime(format!(
                "cannot load symbol '{}' from a non-object value ({})",
                name,
                self.heap.display(owner)
            )));
        }

        let mut obj = owner.as_object();
        match &self.heap.get(obj).data {
            ObjData::Instance(inst) => {
                if let Some(value) = inst.fields.get(&sym) {
                    return Ok(*value);
                }
                obj = inst.class;
            }
            ObjData::Reference(r) => match r.class {
                Some(class) => obj = class,
                None => {
                    return Err(VmError::runtime(format!(
                        "cannot load symbol '{}' from a reference without a class",
                        name
                    )))
                }
            },
            ObjData::WeakRef(w) => match w.class {
                Some(class) => obj = class,
                None => {
                    return Err(VmError::runtime(format!(
                        "cannot load symbol '{}' from a weak reference without a class",
                        name
                    )))
                }
            },
            _ => {}
        }

        match &self.heap.get(obj).data {
            ObjData::Class(_) => {
                let original = obj;
                let mut cursor = Some(obj);
                while let Some(cid) = cursor {
                    let ObjData::Class(c) = &self.heap.get(cid).data else {
                        break;
                    };
                    if let Some(slot) = c.symbols.get(sym.index()) {
                        if !slot.value.is_nil() {
                            return Ok(slot.value);
                        }
                    }
                    cursor = c.base;
                }
                let class_name = match &self.heap.get(original).data {
                    ObjData::Class(c) => c.name.to_string(),
                    _ => String::new(),
                };
                Err(VmError::runtime(format!(
                    "'{}::{}' is not defined (also not found in any base class)",
                    class_name, name
                )))
            }
            ObjData::Module(m) => {
                if let Some(slot) = m.variables.get(sym.index()) {
                    if slot.name.is_some() {
                        return Ok(slot.value);
                    }
                }
                Err(VmError::runtime(format!(
                    "'{}::{}' is not defined",
                    m.name, name
                )))
            }
            other => Err(VmError::runtime(format!(
                "cannot load symbol '{}' from a {}",
                name,
                other.kind_name()
            ))),
        }
    }

    /// STORE_SYMBOL: write an instance field, class symbol, or module
    /// variable.
    pub(crate) fn symbol_store(&mut self, target: Value, sym: SymbolId, value: Value) -> VmResult<()> {
        if !target.is_object() {
            return Err(VmError::runtime("cannot store a symbol into a non-object value"));
        }

        match &mut self.heap.get_mut(target.as_object()).data {
            ObjData::Instance(inst) => {
                inst.fields.insert(sym, value);
                Ok(())
            }
            ObjData::Class(c) => {
                memory_manager::object::set_symbol_slot(&mut c.symbols, sym, value);
                Ok(())
            }
            ObjData::Module(m) => {
                memory_manager::object::set_symbol_slot(&mut m.variables, sym, value);
                Ok(())
            }
            other => Err(VmError::runtime(format!(
                "cannot store a symbol on a {}",
                other.kind_name()
            ))),
        }
    }

    /* Error unwinding */

    /// Unwinds to the frame that entered the VM, emitting a stack
    /// trace through the error hook and discarding everything the
    /// failed activation touched.
    fn unwind(&mut self, reference_frame: usize, err: &VmError) {
        self.last_error = err.message.clone();

        if self.params.error_fn.is_some() {
            let mut rows: Vec<(i32, String)> = Vec::new();
            for (i, frame) in self.frames.iter().enumerate().skip(reference_frame) {
                let index = i - reference_frame;
                match frame.func {
                    Some(func) => {
                        if let ObjData::Function(f) = &self.heap.get(func).data {
                            let line = f
                                .code_to_line
                                .get(frame.ip.min(f.code_to_line.len().saturating_sub(1)))
                                .copied()
                                .unwrap_or(0) as i32;
                            let name: &str =
                                if f.name.is_empty() { "<anonymous>" } else { &f.name };
                            rows.push((line, format!("frame {}, line {}, {}", index, line, name)));
                        }
                    }
                    None => rows.push((-1, format!("frame {}, line -1, <native>", index))),
                }
            }

            let message = self.last_error.clone();
            let hook = self.params.error_fn.as_mut().expect("checked above");
            hook(ErrorKind::StackTraceBegin, -1, "");
            hook(ErrorKind::StackTrace, -1, &message);
            for (line, row) in &rows {
                hook(ErrorKind::StackTrace, *line, row);
            }
            hook(ErrorKind::StackTraceEnd, -1, "");
        }

        let entry = self.frames[reference_frame];
        for value in &mut self.stack[entry.base..] {
            *value = Value::NIL;
        }
        self.stack_top = entry.saved_top;
        self.frames.truncate(reference_frame);
    }

    /* Calls and modules */

    /// Calls the function at stack index `idx` with `num_args`
    /// arguments starting at `args_start`; the return value replaces
    /// the first argument slot.
    pub fn call(&mut self, idx: usize, args_start: usize, num_args: i32) -> VmResult<()> {
        let value = self.stack[self.slot(idx)];
        if !value.is_object() {
            return Err(VmError::new(
                ErrorKind::InvalidOpOnType,
                "call target is not a function object",
            ));
        }

        let target = value.as_object();
        let new_base = self.stack_top + args_start;

        enum Callee {
            Script { arity: i32, name: String },
            Native { arity: i32, native: u32 },
        }

        let callee = match &self.heap.get(target).data {
            ObjData::Function(f) => Callee::Script {
                arity: f.arity,
                name: f.name.to_string(),
            },
            ObjData::NativeFn(f) => Callee::Native {
                arity: f.arity,
                native: f.native,
            },
            _ => {
                return Err(VmError::new(
                    ErrorKind::InvalidOpOnType,
                    "call target is not a function object",
                ))
            }
        };

        match callee {
            Callee::Script { arity, name } => {
                if arity >= 0 && arity != num_args {
                    return Err(VmError::new(
                        ErrorKind::FunctionArityMismatch,
                        format!(
                            "function '{}' called with {} argument(s) but requires {}",
                            name, num_args, arity
                        ),
                    ));
                }
                self.exec_top_frame(target, new_base)
            }
            Callee::Native { arity, native } => {
                if arity >= 0 && arity != num_args {
                    return Err(VmError::new(
                        ErrorKind::FunctionArityMismatch,
                        format!(
                            "native function called with {} argument(s) but requires {}",
                            num_args, arity
                        ),
                    ));
                }
                let native = self.natives[native as usize];

                self.push_native_frame(new_base);
                let previous_native = self.current_native_fn.replace(target);
                let result = native(self, num_args);
                self.current_native_fn = previous_native;
                self.pop_frame();
                result.map_err(|err| {
                    self.last_error = err.message.clone();
                    VmError::new(ErrorKind::Runtime, err.message)
                })
            }
        }
    }

    /// Compiles and runs `source` in a module named `module_name` (or
    /// an anonymous module). The resulting module ends up at stack
    /// index 0.
    pub fn exec_in_module(&mut self, module_name: Option<&str>, source: &str) -> VmResult<()> {
        let module = self.make_module_object(module_name)?;

        self.heap.push_temp_root(module);
        let result = self
            .compile_into_module(module, source)
            .and_then(|()| self.run_module(module));

        let _ = self.stack_resize(1);
        self.stack[self.stack_top] = Value::from_object(module);
        self.heap.pop_temp_root();

        result
    }

    pub(crate) fn compile_into_module(&mut self, module: ObjId, source: &str) -> VmResult<()> {
        parser::compile_module(self, Value::from_object(module), source)
            .map_err(|()| VmError::new(ErrorKind::Compile, self.last_error.clone()))
    }

    pub(crate) fn run_module(&mut self, module: ObjId) -> VmResult<()> {
        let init_fn = match &self.heap.get(module).data {
            ObjData::Module(m) => m.init_fn,
            _ => None,
        };
        let Some(init_fn) = init_fn else {
            return Err(VmError::runtime("module has no compiled code"));
        };
        let base = self.stack_top;
        self.exec_top_frame(init_fn, base)
    }

    /// Finds a registered module by name.
    pub(crate) fn find_module(&self, name: &str) -> Option<ObjId> {
        self.modules.get(name).copied()
    }

    /// Creates a module object; named modules must not collide with a
    /// registered one. The anonymous module is never registered.
    pub(crate) fn make_module_object(&mut self, name: Option<&str>) -> VmResult<ObjId> {
        let (name, is_anon) = match name {
            Some(name) => (name, false),
            None => ("__anon_module__", true),
        };

        if !is_anon && self.find_module(name).is_some() {
            return Err(VmError::new(
                ErrorKind::ModuleAlreadyDefined,
                format!("module '{}' is already defined", name),
            ));
        }

        let module = self.alloc_module(name);
        if !is_anon {
            self.modules.insert(name.into(), module);
        }
        Ok(module)
    }

    /// Resolves `import "name"`: a registered module, or source from
    /// the module hook compiled and run on the spot. Failures record a
    /// message and return `None`; the parser turns that into a compile
    /// error at the import site.
    pub(crate) fn import_module_by_name(&mut self, from: &str, name: &str) -> Option<ObjId> {
        if let Some(module) = self.find_module(name) {
            return Some(module);
        }

        let Some(module_fn) = self.params.module_fn.as_mut() else {
            self.last_error = format!("no module loader registered while importing '{}'", name);
            return None;
        };

        let Some(source) = module_fn(from, name) else {
            self.last_error = format!("failed to find module '{}'", name);
            return None;
        };

        let module = self.alloc_module(name);
        self.heap.push_temp_root(module);
        let ok = self
            .compile_into_module(module, &source)
            .and_then(|()| self.run_module(module))
            .is_ok();
        if ok {
            self.modules.insert(name.into(), module);
        }
        self.heap.pop_temp_root();

        ok.then_some(module)
    }
}

/// String escape processing, applied when a string object is created
/// from source text.
pub(crate) fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
