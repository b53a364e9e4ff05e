//! The seam between the compiler and the runtime.
//!
//! Skald compiles in a single pass and builds real heap objects while
//! parsing: string constants, function objects, classes, and module
//! bindings all come to life mid-compile. The parser reaches those
//! services through this trait; the interpreter crate implements it
//! for the VM.
//!
//! GC contract: any object value the parser still holds privately
//! (constant pools of open builders, a function being linked) must be
//! pinned, either in the compile-root list (pool mirrors, truncated
//! per builder) or with the short-lived `gc_pin`/`gc_unpin` pair.

use crate::builder::FnProto;
use core_types::{ErrorKind, SymbolId, Value};

/// Runtime services the compiler needs.
pub trait CompileHost {
    /// Interns a name, returning its stable symbol id.
    fn intern_symbol(&mut self, name: &str) -> SymbolId;

    /// Allocates a string object from raw source text, processing
    /// escape sequences. May trigger a collection.
    fn alloc_string(&mut self, contents: &str) -> Value;

    /// Allocates an empty function object owned by `module`; filled in
    /// later by [`CompileHost::fill_function`]. May trigger a
    /// collection.
    fn alloc_function(&mut self, module: Value) -> Value;

    /// Installs a finished prototype into a function shell. Never
    /// allocates.
    fn fill_function(&mut self, func: Value, proto: FnProto);

    /// Allocates a class bound to `module`. May trigger a collection.
    fn alloc_class(
        &mut self,
        module: Value,
        name: &str,
        base: Option<Value>,
        extra_data_size: usize,
    ) -> Value;

    /// The base class of `class`, if it has one.
    fn class_base(&self, class: Value) -> Option<Value>;

    /// Appends a field initializer to a class.
    fn class_add_field(&mut self, class: Value, name: &str, value: Value);

    /// Binds a method or static on a class's symbol table.
    fn class_set_symbol(&mut self, class: Value, name: &str, value: Value);

    /// The name a module was created with.
    fn module_name(&self, module: Value) -> String;

    /// Binds a module variable, returning the symbol slot it occupies.
    fn module_set_var(&mut self, module: Value, name: &str, value: Value) -> SymbolId;

    /// Reads a module variable by name; nil when absent. Never interns
    /// the name.
    fn module_get_var(&self, module: Value, name: &str) -> Value;

    /// Every named variable of a module, for bulk import.
    fn module_vars(&self, module: Value) -> Vec<(String, Value)>;

    /// Installs the compiled top-level function of a module.
    fn module_set_init(&mut self, module: Value, func: Value);

    /// Resolves `import "name"`: returns the module (loading, compiling
    /// and running it through the module hook if needed), or `None`
    /// when it cannot be found.
    fn import_module(&mut self, from_module: Value, name: &str) -> Option<Value>;

    /// Whether `value` is a class object.
    fn is_class(&self, value: Value) -> bool;

    /// Reports a diagnostic to the host's error hook and records it as
    /// the last error.
    fn report_error(&mut self, kind: ErrorKind, line: u32, message: &str);

    /// Current length of the compile-root list.
    fn compile_roots_len(&self) -> usize;

    /// Pins a value on the compile-root list.
    fn compile_root_push(&mut self, value: Value);

    /// Drops compile roots back to a previously observed length.
    fn compile_roots_truncate(&mut self, len: usize);

    /// Pins a value on the temp-root stack (LIFO, short windows only).
    fn gc_pin(&mut self, value: Value);

    /// Releases the most recent [`CompileHost::gc_pin`].
    fn gc_unpin(&mut self);
}
