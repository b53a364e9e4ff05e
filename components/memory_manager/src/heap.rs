//! The arena heap and its mark-and-sweep collector.
//!
//! Objects live in `slots`; a freed slot goes on a free list for
//! reuse. Collection is stop-the-world: the VM gathers every root it
//! owns into a [`GcRoots`], the heap marks, finalizes, and sweeps.
//!
//! Collection never starts on its own. The VM checks
//! [`Heap::should_collect`] at its allocation points; internal `Vec`
//! growth can therefore never re-enter the collector, which is the
//! Rust shape of the `gc_is_running` reallocation guard.

use crate::object::{FinalizerId, GcObj, ObjData};
use core_types::{fmt_number, ObjId, SymbolId, Value};

/// Mark byte of an object no trace has reached.
pub const MARK_UNREACHABLE: u8 = 0;
/// Mark byte of an object reached from the root set.
pub const MARK_REACHABLE: u8 = 1;
/// Mark byte of a dead object queued for a script `dtor` call.
pub const MARK_FINALIZE: u8 = 3;
/// Mark byte of a queue entry whose `dtor` already ran; it is freed by
/// the next cycle's post-mark phase unless it was resurrected.
pub const MARK_SCHEDULED: u8 = 6;

/// Temp-root slots available between an allocation and the moment the
/// object is linked into a reachable structure. LIFO.
pub const TEMP_ROOT_CAPACITY: usize = 8;

/// The root set for one collection, gathered by the VM.
///
/// The heap adds its own temp-root stack and finalization queue on
/// top of these.
pub struct GcRoots<'a> {
    /// Operand stack up to `stack_top`.
    pub stack: &'a [Value],
    /// Functions held by live call frames.
    pub frame_fns: &'a [ObjId],
    /// Values of the module registry.
    pub modules: &'a [ObjId],
    /// Values held by host handles.
    pub handles: &'a [Value],
    /// Values pinned by active compilations (current modules, current
    /// classes, builder constant pools, just-built functions).
    pub compile_roots: &'a [Value],
}

/// What one collection did.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectStats {
    /// Bytes credited back to the budget.
    pub freed_bytes: usize,
    /// Objects freed.
    pub freed_objects: usize,
}

/// The object arena plus GC bookkeeping for one VM instance.
pub struct Heap {
    slots: Vec<Option<Box<GcObj>>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    heap_size: usize,
    min_heap_size: usize,
    growth_factor: f32,
    gc_is_running: bool,
    temp_roots: [ObjId; TEMP_ROOT_CAPACITY],
    temp_roots_top: usize,
    finalize_queue: Vec<ObjId>,
    pending_dtors: Vec<ObjId>,
}

impl Heap {
    /// Creates a heap with the given budget parameters.
    pub fn new(min_heap_size: usize, heap_size: usize, growth_factor: f32) -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            heap_size,
            min_heap_size,
            growth_factor,
            gc_is_running: false,
            temp_roots: [ObjId(0); TEMP_ROOT_CAPACITY],
            temp_roots_top: 0,
            finalize_queue: Vec::new(),
            pending_dtors: Vec::new(),
        }
    }

    /// Allocates an object, charging its payload size to the budget.
    pub fn alloc(&mut self, data: ObjData) -> ObjId {
        let charged = data.payload_size();
        self.bytes_allocated += charged;

        let obj = Box::new(GcObj {
            mark: MARK_UNREACHABLE,
            finalized: false,
            charged,
            data,
        });

        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                ObjId(index)
            }
            None => {
                self.slots.push(Some(obj));
                ObjId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// True when the budget is exhausted and a collection may start.
    pub fn should_collect(&self) -> bool {
        !self.gc_is_running && self.bytes_allocated >= self.heap_size
    }

    /// Whether a collection (or finalizer dispatch) is in progress.
    pub fn gc_is_running(&self) -> bool {
        self.gc_is_running
    }

    /// Suppresses or re-enables collection; used by the VM around
    /// script `dtor` dispatch.
    pub fn set_gc_running(&mut self, running: bool) {
        self.gc_is_running = running;
    }

    /// Total bytes currently charged against the budget.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Borrow an object. Panics on a freed slot; object ids are only
    /// produced by this heap and stay valid while reachable.
    pub fn get(&self, id: ObjId) -> &GcObj {
        self.slots[id.index()]
            .as_deref()
            .expect("access to a collected object")
    }

    /// Mutably borrow an object.
    pub fn get_mut(&mut self, id: ObjId) -> &mut GcObj {
        self.slots[id.index()]
            .as_deref_mut()
            .expect("access to a collected object")
    }

    /// True while the slot still holds an object. Meant for tests and
    /// assertions; production code should reach objects via roots.
    pub fn is_live(&self, id: ObjId) -> bool {
        self.slots
            .get(id.index())
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Pins an object against collection. LIFO; at most
    /// [`TEMP_ROOT_CAPACITY`] at once.
    pub fn push_temp_root(&mut self, id: ObjId) {
        assert!(
            self.temp_roots_top < TEMP_ROOT_CAPACITY,
            "too many GC temp roots"
        );
        self.temp_roots[self.temp_roots_top] = id;
        self.temp_roots_top += 1;
    }

    /// Releases the most recently pushed temp root.
    pub fn pop_temp_root(&mut self) {
        debug_assert!(self.temp_roots_top > 0, "temp root stack underflow");
        self.temp_roots_top -= 1;
    }

    /// Runs one mark-and-sweep cycle.
    ///
    /// `dtor_symbol` is the reserved `dtor` symbol id. `native_finalize`
    /// is invoked for every dying instance or reference whose class
    /// declares a host finalizer; it receives the finalizer id and the
    /// object's inline bytes.
    ///
    /// On return `gc_is_running` is still set: the caller must run the
    /// script `dtor`s for [`Heap::take_pending_dtors`] and then call
    /// [`Heap::finish_collect`].
    pub fn collect(
        &mut self,
        roots: &GcRoots<'_>,
        dtor_symbol: SymbolId,
        native_finalize: &mut dyn FnMut(FinalizerId, &mut [u8]),
    ) -> CollectStats {
        debug_assert!(!self.gc_is_running, "collection re-entered");
        self.gc_is_running = true;

        // Queue entries from the previous cycle participate in marking
        // again so a resurrected object is kept.
        for id in &self.finalize_queue {
            if let Some(obj) = self.slots[id.index()].as_deref_mut() {
                obj.mark = MARK_UNREACHABLE;
            }
        }

        self.mark_roots(roots);

        let mut stats = CollectStats::default();

        // Post-mark: free queue entries whose dtor already ran and that
        // stayed unreachable; drop resurrected ones back into the
        // ordinary live set.
        let queue = std::mem::take(&mut self.finalize_queue);
        for id in queue {
            let still_dead = self
                .slots
                .get(id.index())
                .and_then(|s| s.as_deref())
                .map(|obj| obj.mark == MARK_UNREACHABLE)
                .unwrap_or(false);
            if still_dead {
                self.free_slot(id, &mut stats);
            }
        }

        // Sweep. Instances and references run their host finalizer and
        // may be parked in the finalization queue for a script dtor;
        // everything else unreachable is freed outright. Instances go
        // first: their finalizers consult classes that may be garbage
        // in the same cycle.
        let garbage: Vec<ObjId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_deref()
                    .filter(|obj| obj.mark == MARK_UNREACHABLE)
                    .map(|_| ObjId(i as u32))
            })
            .collect();

        let (dying_instances, other_garbage): (Vec<ObjId>, Vec<ObjId>) =
            garbage.into_iter().partition(|id| {
                matches!(
                    self.get(*id).data,
                    ObjData::Instance(_) | ObjData::Reference(_)
                )
            });

        for id in dying_instances {
            let (finalizer, wants_dtor) = self.death_actions(id, dtor_symbol);

            let mut obj = self.slots[id.index()].take().expect("garbage slot emptied");

            if !obj.finalized {
                if let Some(fid) = finalizer {
                    let extra: Option<&mut [u8]> = match &mut obj.data {
                        ObjData::Instance(inst) => Some(&mut inst.extra_data[..]),
                        ObjData::Reference(r) => Some(&mut r.extra_data[..]),
                        _ => None,
                    };
                    if let Some(extra) = extra {
                        native_finalize(fid, extra);
                    }
                }

                if wants_dtor {
                    obj.mark = MARK_FINALIZE;
                    obj.finalized = true;
                    self.slots[id.index()] = Some(obj);
                    self.finalize_queue.push(id);
                    self.pending_dtors.push(id);
                    continue;
                }
            }

            stats.freed_bytes += obj.charged;
            stats.freed_objects += 1;
            self.free.push(id.0);
            drop(obj);
        }

        for id in other_garbage {
            self.free_slot(id, &mut stats);
        }

        // Survivors are unmarked for the next cycle; freshly queued
        // objects keep MARK_FINALIZE until finish_collect.
        for slot in self.slots.iter_mut() {
            if let Some(obj) = slot.as_deref_mut() {
                if obj.mark != MARK_FINALIZE {
                    obj.mark = MARK_UNREACHABLE;
                }
            }
        }

        self.bytes_allocated = self.bytes_allocated.saturating_sub(stats.freed_bytes);

        let grown = self.bytes_allocated
            + (self.bytes_allocated as f64 * f64::from(self.growth_factor)) as usize;
        self.heap_size = grown.max(self.min_heap_size);

        stats
    }

    /// Objects queued this cycle whose script `dtor` must run.
    pub fn take_pending_dtors(&mut self) -> Vec<ObjId> {
        std::mem::take(&mut self.pending_dtors)
    }

    /// Ends a collection: queue entries are stamped
    /// [`MARK_SCHEDULED`] and allocation-triggered collection is
    /// re-enabled.
    pub fn finish_collect(&mut self) {
        for id in &self.finalize_queue {
            if let Some(obj) = self.slots[id.index()].as_deref_mut() {
                obj.mark = MARK_SCHEDULED;
            }
        }
        self.gc_is_running = false;
    }

    fn free_slot(&mut self, id: ObjId, stats: &mut CollectStats) {
        if let Some(obj) = self.slots[id.index()].take() {
            stats.freed_bytes += obj.charged;
            stats.freed_objects += 1;
            self.free.push(id.0);
        }
    }

    /// Decides what has to happen when `id` dies: which host finalizer
    /// to run, and whether the class chain defines a script `dtor`.
    fn death_actions(&self, id: ObjId, dtor_symbol: SymbolId) -> (Option<FinalizerId>, bool) {
        let class = match &self.get(id).data {
            ObjData::Instance(inst) => Some(inst.class),
            ObjData::Reference(r) => r.class,
            _ => None,
        };

        let Some(class) = class else {
            return (None, false);
        };

        let finalizer = match &self.get(class).data {
            ObjData::Class(c) => c.finalizer,
            _ => None,
        };

        let mut wants_dtor = false;
        let mut cursor = Some(class);
        while let Some(cid) = cursor {
            let ObjData::Class(c) = &self.get(cid).data else {
                break;
            };
            if let Some(value) = crate::object::get_symbol_slot(&c.symbols, dtor_symbol) {
                if value.is_object() && self.get(value.as_object()).data.is_function() {
                    wants_dtor = true;
                    break;
                }
            }
            cursor = c.base;
        }

        (finalizer, wants_dtor)
    }

    fn mark_roots(&mut self, roots: &GcRoots<'_>) {
        let mut worklist: Vec<ObjId> = Vec::new();

        let mut push_value = |worklist: &mut Vec<ObjId>, v: Value| {
            if v.is_object() {
                worklist.push(v.as_object());
            }
        };

        for v in roots.stack {
            push_value(&mut worklist, *v);
        }
        for v in roots.handles {
            push_value(&mut worklist, *v);
        }
        for v in roots.compile_roots {
            push_value(&mut worklist, *v);
        }
        worklist.extend_from_slice(roots.frame_fns);
        worklist.extend_from_slice(roots.modules);
        worklist.extend_from_slice(&self.temp_roots[..self.temp_roots_top]);

        while let Some(id) = worklist.pop() {
            let Some(obj) = self.slots.get_mut(id.index()).and_then(|s| s.as_deref_mut()) else {
                continue;
            };
            if obj.mark != MARK_UNREACHABLE {
                continue;
            }
            obj.mark = MARK_REACHABLE;

            match &obj.data {
                ObjData::Str(_) => {}
                ObjData::Module(m) => {
                    for slot in &m.variables {
                        push_value(&mut worklist, slot.value);
                    }
                    if let Some(init) = m.init_fn {
                        worklist.push(init);
                    }
                }
                ObjData::Class(c) => {
                    if let Some(base) = c.base {
                        worklist.push(base);
                    }
                    worklist.push(c.module);
                    for slot in &c.symbols {
                        push_value(&mut worklist, slot.value);
                    }
                    for slot in &c.field_initializers {
                        push_value(&mut worklist, slot.value);
                    }
                }
                ObjData::Instance(inst) => {
                    worklist.push(inst.class);
                    for value in inst.fields.values() {
                        push_value(&mut worklist, *value);
                    }
                }
                ObjData::Function(f) => {
                    worklist.push(f.module);
                    for value in &f.constants {
                        push_value(&mut worklist, *value);
                    }
                }
                ObjData::NativeFn(f) => {
                    for value in &f.statics {
                        push_value(&mut worklist, *value);
                    }
                }
                ObjData::Reference(r) => {
                    if let Some(class) = r.class {
                        worklist.push(class);
                    }
                }
                // The referenced host data is deliberately never traced.
                ObjData::WeakRef(w) => {
                    if let Some(class) = w.class {
                        worklist.push(class);
                    }
                }
            }
        }
    }

    /// Heap-aware value formatter: the rendering used by `print` and
    /// by string concatenation.
    pub fn display(&self, value: Value) -> String {
        if value.is_number() {
            return fmt_number(value.as_number());
        }
        if value.is_nil() {
            return "nil".to_string();
        }
        if value.is_true() {
            return "true".to_string();
        }
        if value.is_false() {
            return "false".to_string();
        }

        match &self.get(value.as_object()).data {
            ObjData::Str(s) => s.value.to_string(),
            ObjData::Module(_) => "<module>".to_string(),
            ObjData::Class(c) => format!("<class {}>", c.name),
            ObjData::Instance(_) => "<instance>".to_string(),
            ObjData::Function(f) => format!("<fn {}>", f.name),
            ObjData::NativeFn(_) => "<native function>".to_string(),
            ObjData::Reference(r) => {
                let class = r
                    .class
                    .map(|c| match &self.get(c).data {
                        ObjData::Class(c) => c.name.to_string(),
                        _ => "nil".to_string(),
                    })
                    .unwrap_or_else(|| "nil".to_string());
                format!("<reference class({})>", class)
            }
            ObjData::WeakRef(_) => "<weak ref>".to_string(),
        }
    }

    /// Value equality with string contents compared through the heap:
    /// numbers by IEEE `==`, strings by hash then content, everything
    /// else by bit pattern.
    pub fn values_equal(&self, lhs: Value, rhs: Value) -> bool {
        if lhs.is_number() && rhs.is_number() {
            return lhs.as_number() == rhs.as_number();
        }

        if lhs.is_object() && rhs.is_object() {
            if let (ObjData::Str(a), ObjData::Str(b)) = (
                &self.get(lhs.as_object()).data,
                &self.get(rhs.as_object()).data,
            ) {
                return a.hash == b.hash && a.value == b.value;
            }
        }

        lhs.bits() == rhs.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{set_symbol_slot, ClassObj, FnObj, InstanceObj, ModuleObj, StrObj};
    use rustc_hash::FxHashMap;

    const NO_ROOTS: GcRoots<'static> = GcRoots {
        stack: &[],
        frame_fns: &[],
        modules: &[],
        handles: &[],
        compile_roots: &[],
    };

    const DTOR: SymbolId = SymbolId(1);

    fn test_heap() -> Heap {
        Heap::new(0, 1024, 0.5)
    }

    fn alloc_str(heap: &mut Heap, s: &str) -> ObjId {
        heap.alloc(ObjData::Str(StrObj::new(s)))
    }

    fn collect(heap: &mut Heap, roots: &GcRoots<'_>) -> CollectStats {
        let stats = heap.collect(roots, DTOR, &mut |_, _| {});
        heap.take_pending_dtors();
        heap.finish_collect();
        stats
    }

    #[test]
    fn test_alloc_charges_bytes() {
        let mut heap = test_heap();
        assert_eq!(heap.bytes_allocated(), 0);
        alloc_str(&mut heap, "hello");
        assert!(heap.bytes_allocated() > 0);
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = test_heap();
        let before = heap.bytes_allocated();
        let a = alloc_str(&mut heap, "a");
        let b = alloc_str(&mut heap, "b");

        let stats = collect(&mut heap, &NO_ROOTS);

        assert_eq!(stats.freed_objects, 2);
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
        assert_eq!(heap.bytes_allocated(), before);
    }

    #[test]
    fn test_rooted_objects_survive_with_mark_reset() {
        let mut heap = test_heap();
        let a = alloc_str(&mut heap, "keep");
        let dead = alloc_str(&mut heap, "drop");
        let stack = [Value::from_object(a)];

        let roots = GcRoots {
            stack: &stack,
            ..NO_ROOTS
        };
        collect(&mut heap, &roots);

        assert!(heap.is_live(a));
        assert!(!heap.is_live(dead));
        assert_eq!(heap.get(a).mark, MARK_UNREACHABLE);
    }

    #[test]
    fn test_temp_roots_pin_lifo() {
        let mut heap = test_heap();
        let a = alloc_str(&mut heap, "pinned");
        heap.push_temp_root(a);
        collect(&mut heap, &NO_ROOTS);
        assert!(heap.is_live(a));

        heap.pop_temp_root();
        collect(&mut heap, &NO_ROOTS);
        assert!(!heap.is_live(a));
    }

    #[test]
    #[should_panic(expected = "too many GC temp roots")]
    fn test_temp_root_overflow_asserts() {
        let mut heap = test_heap();
        let a = alloc_str(&mut heap, "x");
        for _ in 0..=TEMP_ROOT_CAPACITY {
            heap.push_temp_root(a);
        }
    }

    #[test]
    fn test_module_keeps_its_variables_alive() {
        let mut heap = test_heap();
        let s = alloc_str(&mut heap, "bound");
        let mut variables = Vec::new();
        set_symbol_slot(&mut variables, SymbolId(0), Value::from_object(s));
        let module = heap.alloc(ObjData::Module(ModuleObj {
            name: "m".into(),
            variables,
            init_fn: None,
        }));

        let modules = [module];
        let roots = GcRoots {
            modules: &modules,
            ..NO_ROOTS
        };
        collect(&mut heap, &roots);

        assert!(heap.is_live(module));
        assert!(heap.is_live(s));
    }

    fn dtor_class(heap: &mut Heap, module: ObjId) -> ObjId {
        let dtor_fn = heap.alloc(ObjData::Function(FnObj {
            name: "dtor".into(),
            arity: 1,
            module,
            constants: Vec::new(),
            code: Vec::new(),
            code_to_line: Vec::new(),
            needed_stack_space: 2,
        }));
        let mut symbols = Vec::new();
        set_symbol_slot(&mut symbols, DTOR, Value::from_object(dtor_fn));
        heap.alloc(ObjData::Class(ClassObj {
            name: "Res".into(),
            base: None,
            module,
            symbols,
            field_initializers: Vec::new(),
            extra_data_size: 0,
            finalizer: None,
        }))
    }

    #[test]
    fn test_dtor_object_is_queued_then_scheduled_then_freed() {
        let mut heap = test_heap();
        let module = heap.alloc(ObjData::Module(ModuleObj {
            name: "m".into(),
            variables: Vec::new(),
            init_fn: None,
        }));
        let class = dtor_class(&mut heap, module);
        let inst = heap.alloc(ObjData::Instance(InstanceObj {
            class,
            fields: FxHashMap::default(),
            extra_data: Box::new([]),
        }));

        // Keep the class alive through its module; the instance dies.
        let modules = [module];
        let roots = GcRoots {
            modules: &modules,
            ..NO_ROOTS
        };

        heap.collect(&roots, DTOR, &mut |_, _| {});
        let pending = heap.take_pending_dtors();
        assert_eq!(pending, vec![inst]);
        assert!(heap.is_live(inst), "queued object must not be freed yet");
        assert_eq!(heap.get(inst).mark, MARK_FINALIZE);

        heap.finish_collect();
        assert_eq!(heap.get(inst).mark, MARK_SCHEDULED);

        // Next cycle frees the scheduled entry and queues nothing new.
        heap.collect(&roots, DTOR, &mut |_, _| {});
        assert!(heap.take_pending_dtors().is_empty());
        heap.finish_collect();
        assert!(!heap.is_live(inst));
    }

    #[test]
    fn test_native_finalizer_runs_once() {
        let mut heap = test_heap();
        let module = heap.alloc(ObjData::Module(ModuleObj {
            name: "m".into(),
            variables: Vec::new(),
            init_fn: None,
        }));
        let class = heap.alloc(ObjData::Class(ClassObj {
            name: "Native".into(),
            base: None,
            module,
            symbols: Vec::new(),
            field_initializers: Vec::new(),
            extra_data_size: 0,
            finalizer: Some(0),
        }));
        let _inst = heap.alloc(ObjData::Instance(InstanceObj {
            class,
            fields: FxHashMap::default(),
            extra_data: Box::new([0u8; 4]),
        }));

        let modules = [module];
        let roots = GcRoots {
            modules: &modules,
            ..NO_ROOTS
        };

        let mut calls = 0;
        heap.collect(&roots, DTOR, &mut |_, _| calls += 1);
        heap.take_pending_dtors();
        heap.finish_collect();
        assert_eq!(calls, 1);

        heap.collect(&roots, DTOR, &mut |_, _| calls += 1);
        heap.take_pending_dtors();
        heap.finish_collect();
        assert_eq!(calls, 1, "a freed object must not be finalized again");
    }

    #[test]
    fn test_bytes_accounting_balances_across_cycles() {
        let mut heap = test_heap();
        let keep = alloc_str(&mut heap, "keep");
        let keep_value = [Value::from_object(keep)];
        for i in 0..32 {
            alloc_str(&mut heap, &format!("gone-{}", i));
        }

        let before = heap.bytes_allocated();
        let roots = GcRoots {
            stack: &keep_value,
            ..NO_ROOTS
        };
        let stats = collect(&mut heap, &roots);
        assert_eq!(heap.bytes_allocated(), before - stats.freed_bytes);
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn test_slot_reuse_after_free() {
        let mut heap = test_heap();
        let a = alloc_str(&mut heap, "first");
        collect(&mut heap, &NO_ROOTS);
        let b = alloc_str(&mut heap, "second");
        assert_eq!(a, b, "freed slot should be reused");
    }

    #[test]
    fn test_values_equal_strings_by_content() {
        let mut heap = test_heap();
        let a = Value::from_object(alloc_str(&mut heap, "same"));
        let b = Value::from_object(alloc_str(&mut heap, "same"));
        let c = Value::from_object(alloc_str(&mut heap, "other"));

        assert!(heap.values_equal(a, b));
        assert!(!heap.values_equal(a, c));
        assert!(heap.values_equal(
            Value::from_number(2.0),
            Value::from_number(2.0)
        ));
        assert!(!heap.values_equal(Value::NIL, Value::FALSE));
    }

    #[test]
    fn test_display_formats_objects() {
        let mut heap = test_heap();
        let s = Value::from_object(alloc_str(&mut heap, "text"));
        assert_eq!(heap.display(s), "text");
        assert_eq!(heap.display(Value::from_number(7.0)), "7");
        assert_eq!(heap.display(Value::NIL), "nil");
    }
}
