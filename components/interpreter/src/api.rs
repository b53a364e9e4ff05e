//! The embedding API.
//!
//! Hosts address the operand stack through small non-negative indices
//! relative to the VM's current window; `stack_resize` guarantees the
//! indices exist. Inside a native function the window starts at the
//! first argument, so indices `0..num_args` alias the script caller's
//! argument slots and index 0 doubles as the return slot.

use crate::vm::{ClassFinalizer, NativeFn, Vm};
use core_types::{ErrorKind, ObjId, Value, VmError, VmResult};
use memory_manager::object::{NativeFnObj, ObjData, ReferenceObj, WeakRefObj};
use memory_manager::Handle;
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

/// The host-visible type of a stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    /// A string object.
    String,
    /// A number.
    Number,
    /// `true` or `false`.
    Bool,
    /// `nil`.
    Nil,
    /// An instance, reference, or weak reference.
    Object,
    /// A script or native function.
    Function,
    /// A module.
    Module,
}

/// One native method of a class binding.
#[derive(Clone, Copy)]
pub struct MethodBind {
    /// Method name as seen by script code.
    pub name: &'static str,
    /// The native function to dispatch to.
    pub func: NativeFn,
    /// Declared arity; -1 accepts any count.
    pub arity: i32,
    /// Static value slots reserved on the function object.
    pub num_statics: u32,
    /// Inline host bytes reserved on the function object.
    pub extra_data: u16,
}

impl MethodBind {
    /// Convenience constructor for the common case of no statics and
    /// no extra data.
    pub fn new(name: &'static str, func: NativeFn, arity: i32) -> MethodBind {
        MethodBind {
            name,
            func,
            arity,
            num_statics: 0,
            extra_data: 0,
        }
    }
}

/// A native class definition the host can install into a module.
pub struct ClassBind {
    /// Class name.
    pub name: &'static str,
    /// Inline host bytes reserved per instance.
    pub extra_data_size: usize,
    /// The native methods.
    pub methods: Vec<MethodBind>,
    /// Optional finalizer run by the collector before an instance is
    /// freed.
    pub finalizer: Option<ClassFinalizer>,
}

impl Vm {
    fn get(&self, idx: usize) -> Value {
        self.stack[self.slot(idx)]
    }

    fn set(&mut self, idx: usize, value: Value) {
        let slot = self.slot(idx);
        self.stack[slot] = value;
    }

    fn type_error(what: &str) -> VmError {
        VmError::new(ErrorKind::InvalidOpOnType, what)
    }

    /* Writing slots */

    /// Stores a number at `idx`.
    pub fn stack_set_number(&mut self, idx: usize, value: f64) {
        self.set(idx, Value::from_number(value));
    }

    /// Stores a boolean at `idx`.
    pub fn stack_set_bool(&mut self, idx: usize, value: bool) {
        self.set(idx, Value::from_bool(value));
    }

    /// Stores `nil` at `idx`.
    pub fn stack_set_nil(&mut self, idx: usize) {
        self.set(idx, Value::NIL);
    }

    /// Creates a string object from `value` and stores it at `idx`.
    pub fn stack_set_string(&mut self, idx: usize, value: &str) {
        let id = self.alloc_str_obj(value.to_string());
        self.set(idx, Value::from_object(id));
    }

    /* Reading slots */

    /// Reads the number at `idx`.
    pub fn stack_read_number(&self, idx: usize) -> VmResult<f64> {
        let value = self.get(idx);
        if value.is_number() {
            Ok(value.as_number())
        } else {
            Err(Self::type_error("stack slot does not hold a number"))
        }
    }

    /// Reads the boolean at `idx`.
    pub fn stack_read_bool(&self, idx: usize) -> VmResult<bool> {
        let value = self.get(idx);
        if value.is_bool() {
            Ok(value.is_truthy())
        } else {
            Err(Self::type_error("stack slot does not hold a boolean"))
        }
    }

    /// Reads the string at `idx`.
    pub fn stack_read_string(&self, idx: usize) -> VmResult<&str> {
        let value = self.get(idx);
        if value.is_object() {
            if let ObjData::Str(s) = &self.heap.get(value.as_object()).data {
                return Ok(&s.value);
            }
        }
        Err(Self::type_error("stack slot does not hold a string"))
    }

    /// Reads the inline host bytes of the instance or reference at
    /// `idx`. A nil slot reads as `None`.
    pub fn stack_read_instance(&mut self, idx: usize) -> VmResult<Option<&mut [u8]>> {
        let value = self.get(idx);
        if value.is_nil() {
            return Ok(None);
        }
        if !value.is_object() {
            return Err(Self::type_error("stack slot does not hold an object"));
        }
        match &mut self.heap.get_mut(value.as_object()).data {
            ObjData::Instance(inst) => Ok(Some(&mut inst.extra_data)),
            ObjData::Reference(r) => Ok(Some(&mut r.extra_data)),
            _ => Err(Self::type_error("stack slot does not hold an instance")),
        }
    }

    /// Reads the host data behind the weak reference at `idx`; `None`
    /// when the target has been dropped.
    pub fn stack_read_weak_ref(&self, idx: usize) -> VmResult<Option<Rc<RefCell<dyn Any>>>> {
        let value = self.get(idx);
        if value.is_object() {
            if let ObjData::WeakRef(w) = &self.heap.get(value.as_object()).data {
                return Ok(w.data.upgrade());
            }
        }
        Err(Self::type_error("stack slot does not hold a weak reference"))
    }

    /// The host-visible type of the value at `idx`.
    pub fn stack_get_type(&self, idx: usize) -> VmType {
        let value = self.get(idx);
        if value.is_bool() {
            return VmType::Bool;
        }
        if value.is_number() {
            return VmType::Number;
        }
        if value.is_object() {
            return match &self.heap.get(value.as_object()).data {
                ObjData::Str(_) => VmType::String,
                ObjData::Instance(_) | ObjData::Reference(_) | ObjData::WeakRef(_) => {
                    VmType::Object
                }
                ObjData::Function(_) | ObjData::NativeFn(_) => VmType::Function,
                ObjData::Module(_) => VmType::Module,
                ObjData::Class(_) => VmType::Object,
            };
        }
        VmType::Nil
    }

    /// The declared arity of the function at `idx` (-1 is variadic).
    pub fn stack_get_arity(&self, idx: usize) -> VmResult<i32> {
        self.value_arity(self.get(idx))
    }

    fn value_arity(&self, value: Value) -> VmResult<i32> {
        if value.is_object() {
            match &self.heap.get(value.as_object()).data {
                ObjData::Function(f) => return Ok(f.arity),
                ObjData::NativeFn(f) => return Ok(f.arity),
                _ => {}
            }
        }
        Err(Self::type_error("only function objects have an arity"))
    }

    /* Handles */

    /// Pins the value at `idx` so it survives across API calls until
    /// the handle is destroyed.
    pub fn stack_make_handle(&mut self, idx: usize) -> Handle {
        let value = self.get(idx);
        self.handles.make(value)
    }

    /// Loads a handle's value into `dst_idx`.
    pub fn stack_load_handle(&mut self, dst_idx: usize, handle: Handle) -> VmResult<()> {
        let value = self
            .handles
            .get(handle)
            .ok_or_else(|| VmError::new(ErrorKind::InvalidArgument, "handle was destroyed"))?;
        self.set(dst_idx, value);
        Ok(())
    }

    /// Destroys a handle. Destroying twice is a no-op.
    pub fn stack_destroy_handle(&mut self, handle: Handle) {
        self.handles.destroy(handle);
    }

    /// The type of a handle's value without loading it.
    pub fn handle_get_type(&self, handle: Handle) -> Option<VmType> {
        let value = self.handles.get(handle)?;
        // Route through a scratch-free read: classify the raw value.
        Some(self.classify(value))
    }

    /// The arity of the function a handle points to.
    pub fn handle_get_arity(&self, handle: Handle) -> VmResult<i32> {
        let value = self
            .handles
            .get(handle)
            .ok_or_else(|| VmError::new(ErrorKind::InvalidArgument, "handle was destroyed"))?;
        self.value_arity(value)
    }

    fn classify(&self, value: Value) -> VmType {
        if value.is_bool() {
            VmType::Bool
        } else if value.is_number() {
            VmType::Number
        } else if value.is_object() {
            match &self.heap.get(value.as_object()).data {
                ObjData::Str(_) => VmType::String,
                ObjData::Function(_) | ObjData::NativeFn(_) => VmType::Function,
                ObjData::Module(_) => VmType::Module,
                _ => VmType::Object,
            }
        } else {
            VmType::Nil
        }
    }

    /* Modules */

    /// Creates a module named `name` (or an anonymous one) and stores
    /// it at `idx`. Fails with [`ErrorKind::ModuleAlreadyDefined`]
    /// when the name is taken; the existing module is still stored.
    pub fn module_make(&mut self, idx: usize, name: Option<&str>) -> VmResult<()> {
        match self.make_module_object(name) {
            Ok(module) => {
                self.set(idx, Value::from_object(module));
                Ok(())
            }
            Err(err) => {
                if let Some(name) = name {
                    if let Some(existing) = self.find_module(name) {
                        self.set(idx, Value::from_object(existing));
                    }
                }
                Err(err)
            }
        }
    }

    /// Loads a registered module into `idx`.
    pub fn module_load(&mut self, idx: usize, name: &str) -> VmResult<()> {
        match self.find_module(name) {
            Some(module) => {
                self.set(idx, Value::from_object(module));
                Ok(())
            }
            None => Err(VmError::new(
                ErrorKind::ModuleNotFound,
                format!("module '{}' is not loaded", name),
            )),
        }
    }

    /// Removes a module from the registry; the collector reclaims it
    /// once nothing else references it.
    pub fn module_unload(&mut self, name: &str) {
        self.modules.remove(name);
    }

    /// Removes every module from the registry.
    pub fn module_unload_all(&mut self) {
        self.modules.clear();
    }

    /* Variables */

    /// Loads `variable` from the instance, class, or module at
    /// `owner_idx` into `dst_idx`; nil when it cannot be found.
    pub fn stack_load_variable(&mut self, dst_idx: usize, owner_idx: usize, variable: &str) {
        let owner = self.get(owner_idx);
        let sym = self.symbols.intern(variable);
        let value = self.symbol_lookup(owner, sym).unwrap_or(Value::NIL);
        self.set(dst_idx, value);
    }

    /// Stores the value at `value_idx` into `field` of the instance,
    /// class, or module at `owner_idx`.
    pub fn stack_store_variable(
        &mut self,
        owner_idx: usize,
        field: &str,
        value_idx: usize,
    ) -> VmResult<()> {
        let owner = self.get(owner_idx);
        let value = self.get(value_idx);
        let sym = self.symbols.intern(field);
        self.symbol_store(owner, sym, value)
            .map_err(|_| Self::type_error("cannot store a variable on this value"))
    }

    /* Native functions */

    /// Binds `func` as a native function named `field` on the object
    /// at `owner_idx`.
    pub fn stack_store_native_fn(
        &mut self,
        owner_idx: usize,
        field: &str,
        func: NativeFn,
        arity: i32,
    ) -> VmResult<()> {
        self.stack_store_closure(owner_idx, field, func, arity, 0, 0)
    }

    /// Binds a native function with static slots and inline host
    /// bytes.
    pub fn stack_store_closure(
        &mut self,
        owner_idx: usize,
        field: &str,
        func: NativeFn,
        arity: i32,
        num_statics: u32,
        extra_data: u16,
    ) -> VmResult<()> {
        let native = self.alloc_native_fn(func, arity, num_statics, extra_data);
        let owner = self.get(owner_idx);
        let sym = self.symbols.intern(field);
        self.symbol_store(owner, sym, Value::from_object(native))
            .map_err(|_| Self::type_error("cannot bind a function on this value"))
    }

    pub(crate) fn alloc_native_fn(
        &mut self,
        func: NativeFn,
        arity: i32,
        num_statics: u32,
        extra_data: u16,
    ) -> ObjId {
        let native_id = self.natives.len() as u32;
        self.natives.push(func);
        self.alloc_obj(ObjData::NativeFn(NativeFnObj {
            native: native_id,
            arity,
            statics: vec![Value::NIL; num_statics as usize],
            extra_data: vec![0u8; extra_data as usize].into_boxed_slice(),
        }))
    }

    /// Reads static slot `static_idx` of the currently executing
    /// native function into `dst_idx`.
    pub fn closure_get_static(&mut self, dst_idx: usize, static_idx: usize) -> VmResult<()> {
        let current = self
            .current_native_fn
            .ok_or_else(|| VmError::new(ErrorKind::InvalidArgument, "no native function running"))?;
        let value = match &self.heap.get(current).data {
            ObjData::NativeFn(f) => f.statics.get(static_idx).copied(),
            _ => None,
        }
        .ok_or_else(|| VmError::new(ErrorKind::InvalidArgument, "static index out of range"))?;
        self.set(dst_idx, value);
        Ok(())
    }

    /// Writes the value at `value_idx` into static slot `static_idx`
    /// of the native function at `closure_idx`.
    pub fn closure_set_static(
        &mut self,
        closure_idx: usize,
        static_idx: usize,
        value_idx: usize,
    ) -> VmResult<()> {
        let closure = self.get(closure_idx);
        let value = self.get(value_idx);
        if !closure.is_object() {
            return Err(Self::type_error("not a native function"));
        }
        match &mut self.heap.get_mut(closure.as_object()).data {
            ObjData::NativeFn(f) => match f.statics.get_mut(static_idx) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(VmError::new(
                    ErrorKind::InvalidArgument,
                    "static index out of range",
                )),
            },
            _ => Err(Self::type_error("not a native function")),
        }
    }

    /// The inline host bytes of the native function at `closure_idx`.
    pub fn closure_stack_extra_data(&mut self, closure_idx: usize) -> Option<&mut [u8]> {
        let closure = self.get(closure_idx);
        if !closure.is_object() {
            return None;
        }
        match &mut self.heap.get_mut(closure.as_object()).data {
            ObjData::NativeFn(f) => Some(&mut f.extra_data),
            _ => None,
        }
    }

    /// The inline host bytes of the currently executing native
    /// function. Only meaningful inside a native call.
    pub fn closure_extra_data(&mut self) -> Option<&mut [u8]> {
        let current = self.current_native_fn?;
        match &mut self.heap.get_mut(current).data {
            ObjData::NativeFn(f) => Some(&mut f.extra_data),
            _ => None,
        }
    }

    /* Instances, references, and class bindings */

    /// Instantiates the class at `clz_idx` into `dst_idx`.
    pub fn stack_make_instance(&mut self, clz_idx: usize, dst_idx: usize) -> VmResult<()> {
        let class_value = self.get(clz_idx);
        if !class_value.is_object() {
            return Err(Self::type_error("not a class"));
        }
        let class = class_value.as_object();
        if !matches!(self.heap.get(class).data, ObjData::Class(_)) {
            return Err(Self::type_error("not a class"));
        }
        let instance = self.alloc_instance(class);
        self.set(dst_idx, Value::from_object(instance));
        Ok(())
    }

    /// Creates a classless reference with `extra_data_size` inline
    /// bytes at `idx` and returns the bytes.
    pub fn stack_make_reference(&mut self, idx: usize, extra_data_size: usize) -> &mut [u8] {
        let id = self.alloc_obj(ObjData::Reference(ReferenceObj {
            class: None,
            extra_data: vec![0u8; extra_data_size].into_boxed_slice(),
        }));
        self.set(idx, Value::from_object(id));
        match &mut self.heap.get_mut(id).data {
            ObjData::Reference(r) => &mut r.extra_data,
            _ => unreachable!("reference allocation produced a non-reference"),
        }
    }

    /// Creates a reference bound to a freshly installed class binding:
    /// the class is defined in the module at `module_idx` and the
    /// reference stored at `dst_idx`. Returns the inline bytes.
    pub fn stack_make_reference_clz(
        &mut self,
        module_idx: usize,
        bind: &ClassBind,
        dst_idx: usize,
    ) -> VmResult<&mut [u8]> {
        let id = self.alloc_obj(ObjData::Reference(ReferenceObj {
            class: None,
            extra_data: vec![0u8; bind.extra_data_size].into_boxed_slice(),
        }));
        self.set(dst_idx, Value::from_object(id));

        let owner = self.get(module_idx);
        self.heap.push_temp_root(id);
        let class = self.create_class_binding(owner, bind);
        self.heap.pop_temp_root();
        let class = class?;

        if let ObjData::Reference(r) = &mut self.heap.get_mut(id).data {
            r.class = Some(class);
        }
        match &mut self.heap.get_mut(id).data {
            ObjData::Reference(r) => Ok(&mut r.extra_data),
            _ => unreachable!("reference allocation produced a non-reference"),
        }
    }

    /// Creates a weak reference to `data` at `idx`. The VM never keeps
    /// `data` alive.
    pub fn stack_make_weak_ref(&mut self, idx: usize, data: &Rc<RefCell<dyn Any>>) {
        let id = self.alloc_obj(ObjData::WeakRef(WeakRefObj {
            class: None,
            data: Rc::downgrade(data),
        }));
        self.set(idx, Value::from_object(id));
    }

    /// Assigns the class at `clz_idx` to the reference (or weak
    /// reference) at `idx`.
    pub fn reference_set_class(&mut self, idx: usize, clz_idx: usize) {
        let reference = self.get(idx);
        let class_value = self.get(clz_idx);
        if !reference.is_object() || !class_value.is_object() {
            return;
        }
        let class = class_value.as_object();
        if !matches!(self.heap.get(class).data, ObjData::Class(_)) {
            return;
        }
        match &mut self.heap.get_mut(reference.as_object()).data {
            ObjData::Reference(r) => r.class = Some(class),
            ObjData::WeakRef(w) => w.class = Some(class),
            _ => {}
        }
    }

    /// Sets the base class of the class at `idx` to the class at
    /// `clz_idx`.
    pub fn class_set_base_class(&mut self, idx: usize, clz_idx: usize) {
        let class_value = self.get(idx);
        let base_value = self.get(clz_idx);
        if !class_value.is_object() || !base_value.is_object() {
            return;
        }
        let base = base_value.as_object();
        if !matches!(self.heap.get(base).data, ObjData::Class(_)) {
            return;
        }
        if let ObjData::Class(c) = &mut self.heap.get_mut(class_value.as_object()).data {
            c.base = Some(base);
        }
    }

    /// Installs a class binding as a variable of the instance, class,
    /// or module at `owner_idx`.
    pub fn stack_store_class(&mut self, owner_idx: usize, bind: &ClassBind) -> VmResult<()> {
        let owner = self.get(owner_idx);
        self.create_class_binding(owner, bind).map(|_| ())
    }

    /// Builds the class described by `bind` inside the module that
    /// owns `owner`, and binds it (and its methods) by name.
    fn create_class_binding(&mut self, owner: Value, bind: &ClassBind) -> VmResult<ObjId> {
        let module = self
            .owning_module(owner)
            .ok_or_else(|| Self::type_error("value cannot own a class binding"))?;

        let finalizer = bind.finalizer.map(|f| {
            let id = self.finalizers.len() as u32;
            self.finalizers.push(f);
            id
        });

        let class = self.alloc_obj(ObjData::Class(memory_manager::object::ClassObj {
            name: bind.name.into(),
            base: None,
            module,
            symbols: Vec::new(),
            field_initializers: Vec::new(),
            extra_data_size: bind.extra_data_size,
            finalizer,
        }));

        self.heap.push_temp_root(class);

        let name_sym = self.symbols.intern(bind.name);
        if self
            .symbol_store(owner, name_sym, Value::from_object(class))
            .is_err()
        {
            self.heap.pop_temp_root();
            return Err(Self::type_error("cannot bind a class on this value"));
        }

        for method in &bind.methods {
            let func = self.alloc_native_fn(
                method.func,
                method.arity,
                method.num_statics,
                method.extra_data,
            );
            self.heap.push_temp_root(func);
            let sym = self.symbols.intern(method.name);
            let class_value = Value::from_object(class);
            let _ = self.symbol_store(class_value, sym, Value::from_object(func));
            self.heap.pop_temp_root();
        }

        self.heap.pop_temp_root();
        Ok(class)
    }

    /// Renders a disassembly of the module at `idx`: its top-level
    /// function followed by every function bound as a module variable.
    pub fn dump_module_bytecode(&self, idx: usize) -> Option<String> {
        let value = self.get(idx);
        if !value.is_object() {
            return None;
        }
        let ObjData::Module(m) = &self.heap.get(value.as_object()).data else {
            return None;
        };

        let mut functions: Vec<ObjId> = Vec::new();
        functions.extend(m.init_fn);
        for slot in &m.variables {
            if slot.name.is_some()
                && slot.value.is_object()
                && matches!(self.heap.get(slot.value.as_object()).data, ObjData::Function(_))
            {
                functions.push(slot.value.as_object());
            }
        }

        let mut out = String::new();
        for func in functions {
            let ObjData::Function(f) = &self.heap.get(func).data else {
                continue;
            };
            let dump = bytecode_system::disasm::FunctionDump {
                name: &f.name,
                arity: f.arity,
                needed_stack_space: f.needed_stack_space,
                constants: &f.constants,
                code: &f.code,
                lines: &f.code_to_line,
            };
            bytecode_system::disasm::disassemble_function(&mut out, &dump, |v| {
                self.heap.display(v)
            });
        }
        Some(out)
    }

    fn owning_module(&self, value: Value) -> Option<ObjId> {
        if !value.is_object() {
            return None;
        }
        match &self.heap.get(value.as_object()).data {
            ObjData::Module(_) => Some(value.as_object()),
            ObjData::Class(c) => Some(c.module),
            ObjData::Instance(inst) => match &self.heap.get(inst.class).data {
                ObjData::Class(c) => Some(c.module),
                _ => None,
            },
            _ => None,
        }
    }
}
