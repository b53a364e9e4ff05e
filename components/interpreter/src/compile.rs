//! The compiler's view of the VM.
//!
//! `parser::CompileHost` is implemented here: symbol interning, object
//! allocation, module bindings, imports, diagnostics, and the GC
//! pinning contract the single-pass compiler relies on.

use crate::vm::{unescape, Vm};
use core_types::{ErrorKind, ObjId, SymbolId, Value};
use memory_manager::object::{set_symbol_slot, ClassObj, FnObj, ObjData};
use parser::{CompileHost, FnProto};

impl Vm {
    fn expect_module(&self, value: Value) -> ObjId {
        debug_assert!(value.is_object(), "module value is not an object");
        value.as_object()
    }
}

impl CompileHost for Vm {
    fn intern_symbol(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    fn alloc_string(&mut self, contents: &str) -> Value {
        let id = self.alloc_str_obj(unescape(contents));
        Value::from_object(id)
    }

    fn alloc_function(&mut self, module: Value) -> Value {
        let module = self.expect_module(module);
        let id = self.alloc_obj(ObjData::Function(FnObj {
            name: "".into(),
            arity: 0,
            module,
            constants: Vec::new(),
            code: Vec::new(),
            code_to_line: Vec::new(),
            needed_stack_space: 1,
        }));
        Value::from_object(id)
    }

    fn fill_function(&mut self, func: Value, proto: FnProto) {
        let ObjData::Function(f) = &mut self.heap.get_mut(func.as_object()).data else {
            unreachable!("fill_function on a non-function");
        };
        f.name = proto.name.into();
        f.arity = proto.arity;
        f.constants = proto.constants;
        f.code = proto.code;
        f.code_to_line = proto.code_to_line;
        f.needed_stack_space = proto.needed_stack_space;
    }

    fn alloc_class(
        &mut self,
        module: Value,
        name: &str,
        base: Option<Value>,
        extra_data_size: usize,
    ) -> Value {
        let module = self.expect_module(module);
        let id = self.alloc_obj(ObjData::Class(ClassObj {
            name: name.into(),
            base: base.map(|b| b.as_object()),
            module,
            symbols: Vec::new(),
            field_initializers: Vec::new(),
            extra_data_size,
            finalizer: None,
        }));
        Value::from_object(id)
    }

    fn class_base(&self, class: Value) -> Option<Value> {
        match &self.heap.get(class.as_object()).data {
            ObjData::Class(c) => c.base.map(Value::from_object),
            _ => None,
        }
    }

    fn class_add_field(&mut self, class: Value, name: &str, value: Value) {
        let sym = self.symbols.intern(name);
        if let ObjData::Class(c) = &mut self.heap.get_mut(class.as_object()).data {
            c.field_initializers.push(memory_manager::object::VarSlot {
                name: Some(sym),
                value,
            });
        }
    }

    fn class_set_symbol(&mut self, class: Value, name: &str, value: Value) {
        let sym = self.symbols.intern(name);
        if let ObjData::Class(c) = &mut self.heap.get_mut(class.as_object()).data {
            set_symbol_slot(&mut c.symbols, sym, value);
        }
    }

    fn module_name(&self, module: Value) -> String {
        match &self.heap.get(self.expect_module(module)).data {
            ObjData::Module(m) => m.name.to_string(),
            _ => String::new(),
        }
    }

    fn module_set_var(&mut self, module: Value, name: &str, value: Value) -> SymbolId {
        let sym = self.symbols.intern(name);
        if let ObjData::Module(m) = &mut self.heap.get_mut(module.as_object()).data {
            set_symbol_slot(&mut m.variables, sym, value);
        }
        sym
    }

    fn module_get_var(&self, module: Value, name: &str) -> Value {
        let Some(sym) = self.symbols.find(name) else {
            return Value::NIL;
        };
        match &self.heap.get(module.as_object()).data {
            ObjData::Module(m) => {
                memory_manager::object::get_symbol_slot(&m.variables, sym).unwrap_or(Value::NIL)
            }
            _ => Value::NIL,
        }
    }

    fn module_vars(&self, module: Value) -> Vec<(String, Value)> {
        match &self.heap.get(module.as_object()).data {
            ObjData::Module(m) => m
                .variables
                .iter()
                .filter_map(|slot| {
                    slot.name
                        .map(|sym| (self.symbols.name(sym).to_string(), slot.value))
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn module_set_init(&mut self, module: Value, func: Value) {
        if let ObjData::Module(m) = &mut self.heap.get_mut(module.as_object()).data {
            m.init_fn = Some(func.as_object());
        }
    }

    fn import_module(&mut self, from_module: Value, name: &str) -> Option<Value> {
        let from = self.module_name(from_module);
        self.import_module_by_name(&from, name)
            .map(Value::from_object)
    }

    fn is_class(&self, value: Value) -> bool {
        value.is_object() && matches!(self.heap.get(value.as_object()).data, ObjData::Class(_))
    }

    fn report_error(&mut self, kind: ErrorKind, line: u32, message: &str) {
        self.report(kind, line as i32, message);
    }

    fn compile_roots_len(&self) -> usize {
        self.compile_roots.len()
    }

    fn compile_root_push(&mut self, value: Value) {
        self.compile_roots.push(value);
    }

    fn compile_roots_truncate(&mut self, len: usize) {
        self.compile_roots.truncate(len);
    }

    fn gc_pin(&mut self, value: Value) {
        debug_assert!(value.is_object(), "pinning a non-object value");
        self.heap.push_temp_root(value.as_object());
    }

    fn gc_unpin(&mut self) {
        self.heap.pop_temp_root();
    }
}
