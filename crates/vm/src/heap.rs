//! The managed heap: a slot arena that owns every [`Obj`], a string intern
//! table, and a tri-colour mark-and-sweep collector.
//!
//! Every allocation routes through [`Heap::allocate`], which is also the
//! single place that accounts bytes and decides whether a collection runs
//! first. Collection itself is driven by the caller: a `Heap` has no
//! notion of "the VM" or "the compiler", so whoever holds the roots
//! (`Vm` during execution, `Compiler` while still building nested
//! functions) passes a closure that marks them.

use quill_core::object::ObjUpvalue;
use quill_core::{Handle, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative, ObjString, Table, Value};

/// Collection threshold growth factor, applied to `bytes_allocated` right
/// after a sweep to compute the next `next_gc`.
const GC_GROWTH_FACTOR: usize = 2;

/// Seed threshold before the very first collection can run.
const INITIAL_GC_THRESHOLD: usize = 1 << 20;

struct Slot {
    generation: u32,
    marked: bool,
    obj: Option<Obj>,
}

pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    grey: Vec<Handle>,
    /// Interned strings: keyed and valued by the same handle, looked up by
    /// hash + byte comparison via `Table::find_string`. Never itself
    /// treated as a GC root -- that would keep every string alive
    /// forever.
    pub strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    /// When set, every allocation collects first regardless of
    /// `next_gc`. Exercises the collector far more often than real
    /// programs would trigger it; used by tests.
    pub stress_gc: bool,
    pub collections_run: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            grey: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            stress_gc: false,
            collections_run: 0,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    /// Allocates `obj`, running a collection first if the heap has grown
    /// past its threshold. `mark_roots` is invoked to mark every live root
    /// *before* the new object exists, so it never needs to protect the
    /// object currently being constructed -- only whatever the caller
    /// already has reachable (e.g. a string's two concatenation operands,
    /// still sitting on the VM's value stack).
    pub fn allocate(&mut self, obj: Obj, mark_roots: impl FnOnce(&mut Heap)) -> Handle {
        if self.should_collect() {
            self.collect_garbage(mark_roots);
        }
        self.bytes_allocated += obj_size(&obj);
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.marked = false;
                slot.obj = Some(obj);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    marked: false,
                    obj: Some(obj),
                });
                (self.slots.len() - 1) as u32
            }
        };
        Handle::new(index, self.slots[index as usize].generation)
    }

    /// Interns `bytes`: returns the existing handle if an equal string is
    /// already live, otherwise allocates a fresh one and registers it.
    pub fn intern_string(&mut self, bytes: String, mark_roots: impl FnOnce(&mut Heap)) -> Handle {
        let hash = quill_core::fnv1a(bytes.as_bytes());
        if let Some(existing) = self.strings.find_string(hash, |candidate| {
            self.get(candidate).as_string().map(ObjString::as_str) == Some(bytes.as_str())
        }) {
            return existing;
        }
        let handle = self.allocate(Obj::String(ObjString::new(bytes)), mark_roots);
        self.strings.set(handle, hash, Value::object(handle));
        handle
    }

    pub fn get(&self, handle: Handle) -> &Obj {
        let slot = &self.slots[handle.index as usize];
        assert_eq!(slot.generation, handle.generation, "stale handle access");
        slot.obj.as_ref().expect("handle points at a freed slot")
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        let slot = &mut self.slots[handle.index as usize];
        assert_eq!(slot.generation, handle.generation, "stale handle access");
        slot.obj.as_mut().expect("handle points at a freed slot")
    }

    pub fn get_string(&self, handle: Handle) -> &str {
        self.get(handle)
            .as_string()
            .expect("handle does not point at a string")
            .as_str()
    }

    fn is_live(&self, handle: Handle) -> bool {
        let slot = &self.slots[handle.index as usize];
        slot.generation == handle.generation && slot.obj.is_some()
    }

    pub fn mark_value(&mut self, value: Value) {
        if value.is_object() {
            self.mark_handle(value.as_object());
        }
    }

    pub fn mark_handle(&mut self, handle: Handle) {
        if !self.is_live(handle) {
            return;
        }
        let slot = &mut self.slots[handle.index as usize];
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.grey.push(handle);
    }

    fn trace(&mut self) {
        while let Some(handle) = self.grey.pop() {
            self.mark_children(handle);
        }
    }

    fn mark_children(&mut self, handle: Handle) {
        // `obj` is inspected by reference but marking its children needs
        // `&mut self`, so children are collected before recursing.
        let mut to_mark_handles: Vec<Handle> = Vec::new();
        let mut to_mark_values: Vec<Value> = Vec::new();
        match self.get(handle) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    to_mark_handles.push(name);
                }
                for constant in &f.chunk.constants {
                    to_mark_values.push(*constant);
                }
            }
            Obj::Closure(c) => {
                to_mark_handles.push(c.function);
                to_mark_handles.extend(c.upvalues.iter().copied());
            }
            Obj::Upvalue(ObjUpvalue::Closed(v)) => to_mark_values.push(*v),
            Obj::Upvalue(ObjUpvalue::Open { .. }) => {}
            Obj::Class(c) => {
                to_mark_handles.push(c.name);
                to_mark_values.extend(c.methods.iter().map(|(_, v)| v));
            }
            Obj::Instance(i) => {
                to_mark_handles.push(i.class);
                to_mark_values.extend(i.fields.iter().map(|(_, v)| v));
            }
            Obj::BoundMethod(b) => {
                to_mark_values.push(b.receiver);
                to_mark_handles.push(b.method);
            }
        }
        for h in to_mark_handles {
            self.mark_handle(h);
        }
        for v in to_mark_values {
            self.mark_value(v);
        }
    }

    /// Runs mark (via `mark_roots`), trace, intern-table sweep, then
    /// object sweep, in that order -- the intern sweep must see the mark
    /// bits before the object sweep clears them, and must run before
    /// strings it would otherwise keep alive are freed.
    pub fn collect_garbage(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        mark_roots(self);
        self.trace();
        self.sweep_intern_table();
        self.sweep();
        self.next_gc = self.bytes_allocated * GC_GROWTH_FACTOR;
        self.collections_run += 1;
    }

    fn sweep_intern_table(&mut self) {
        let slots_marked: Vec<bool> = self.slots.iter().map(|s| s.marked).collect();
        self.strings
            .retain(|handle, _| slots_marked.get(handle.index as usize).copied().unwrap_or(false));
    }

    fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.obj.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                let freed = slot.obj.take().unwrap();
                self.bytes_allocated = self.bytes_allocated.saturating_sub(obj_size(&freed));
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
    }
}

/// `ObjFunction`/`ObjNative` carry function pointers and aren't natively
/// supported as `Heap` consumers; these conversions exist purely as a
/// convenience for construction call sites.
impl Heap {
    pub fn alloc_function(&mut self, f: ObjFunction, mark_roots: impl FnOnce(&mut Heap)) -> Handle {
        self.allocate(Obj::Function(f), mark_roots)
    }

    pub fn alloc_native(&mut self, n: ObjNative, mark_roots: impl FnOnce(&mut Heap)) -> Handle {
        self.allocate(Obj::Native(n), mark_roots)
    }

    pub fn alloc_closure(&mut self, c: ObjClosure, mark_roots: impl FnOnce(&mut Heap)) -> Handle {
        self.allocate(Obj::Closure(c), mark_roots)
    }

    pub fn alloc_upvalue(&mut self, u: ObjUpvalue, mark_roots: impl FnOnce(&mut Heap)) -> Handle {
        self.allocate(Obj::Upvalue(u), mark_roots)
    }

    pub fn alloc_class(&mut self, c: ObjClass, mark_roots: impl FnOnce(&mut Heap)) -> Handle {
        self.allocate(Obj::Class(c), mark_roots)
    }

    pub fn alloc_instance(&mut self, i: ObjInstance, mark_roots: impl FnOnce(&mut Heap)) -> Handle {
        self.allocate(Obj::Instance(i), mark_roots)
    }

    pub fn alloc_bound_method(&mut self, b: ObjBoundMethod, mark_roots: impl FnOnce(&mut Heap)) -> Handle {
        self.allocate(Obj::BoundMethod(b), mark_roots)
    }
}

/// A coarse estimate of an object's heap footprint, used only to decide
/// when to collect -- it need not be exact, just monotonic in the object's
/// real size.
fn obj_size(obj: &Obj) -> usize {
    use std::mem::size_of_val;
    match obj {
        Obj::String(s) => size_of_val(s) + s.bytes.len(),
        Obj::Function(f) => size_of_val(f) + f.chunk.code.len() + f.chunk.constants.len() * 16,
        Obj::Native(n) => size_of_val(n),
        Obj::Closure(c) => size_of_val(c) + c.upvalues.len() * 8,
        Obj::Upvalue(u) => size_of_val(u),
        Obj::Class(c) => size_of_val(c) + c.methods.len() * 24,
        Obj::Instance(i) => size_of_val(i) + i.fields.len() * 24,
        Obj::BoundMethod(b) => size_of_val(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_handle_for_equal_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello".to_string(), |_| {});
        let b = heap.intern_string("hello".to_string(), |_| {});
        assert_eq!(a, b);
    }

    #[test]
    fn interning_returns_distinct_handles_for_different_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello".to_string(), |_| {});
        let b = heap.intern_string("world".to_string(), |_| {});
        assert_ne!(a, b);
    }

    #[test]
    fn unrooted_string_is_collected_and_intern_entry_removed() {
        let mut heap = Heap::new();
        heap.stress_gc = true;
        let handle = heap.intern_string("temporary".to_string(), |_| {});
        // Nothing roots `handle`; the very next allocation collects it.
        heap.intern_string("other".to_string(), |_| {});
        assert!(!heap.is_live(handle));
        assert!(heap.strings.find_string(quill_core::fnv1a(b"temporary"), |_| true).is_none());
    }

    #[test]
    fn rooted_string_survives_collection() {
        let mut heap = Heap::new();
        heap.stress_gc = true;
        let handle = heap.intern_string("kept".to_string(), |_| {});
        heap.intern_string("other".to_string(), |h| h.mark_handle(handle));
        assert!(heap.is_live(handle));
        assert_eq!(heap.get_string(handle), "kept");
    }

    #[test]
    fn freed_slot_is_reused_and_bumps_generation() {
        let mut heap = Heap::new();
        heap.stress_gc = true;
        let first = heap.intern_string("a".to_string(), |_| {});
        let index = first.index;
        // Collect with nothing rooted -- `first` is freed.
        heap.intern_string("b".to_string(), |_| {});
        let reused = heap.intern_string("c".to_string(), |_| {});
        if reused.index == index {
            assert_ne!(reused.generation, first.generation);
        }
    }
}
