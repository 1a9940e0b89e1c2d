use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::{
    format_number, NativeFun, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFun, ObjInstance,
    ObjUpvalue, Value,
};

/// Collection is first triggered once this many bytes are live.
const FIRST_COLLECTION_THRESHOLD: usize = 1024 * 1024;

/// After a collection, the next threshold is the surviving bytes scaled by
/// this factor, which keeps the amortized collection cost linear in the
/// allocation rate.
const HEAP_GROW_FACTOR: usize = 2;

/// A handle to an object owned by the [`Heap`].
///
/// Handles are small and freely copyable. Because strings are interned, two
/// string handles are equal exactly when their contents are equal; all other
/// objects compare by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

/// Tri-color state of one heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not reached by the current mark phase
    White,
    /// Reached, but its outgoing references have not been followed yet
    Gray,
    /// Reached, outgoing references followed
    Black,
}

#[derive(Debug)]
struct Slot {
    color: Color,
    size: usize,
    obj: Obj,
}

/// The object heap and its mark-sweep collector.
///
/// Every runtime object is allocated here and addressed through an
/// [`ObjRef`]. The heap also owns the interned-string table; dead strings
/// drop out of the table when they are swept. The heap never starts a
/// collection on its own: the compiler and the VM check [`Heap::should_collect`]
/// at their allocation safe points, mark their roots, and then drive
/// [`Heap::trace`] and [`Heap::sweep`].
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    strings: FxHashMap<Rc<str>, ObjRef>,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: FxHashMap::default(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_COLLECTION_THRESHOLD,
        }
    }
}

impl Heap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move an object onto the heap, returning its handle.
    ///
    /// Callers are expected to have run a collection cycle first when
    /// [`Heap::should_collect`] says so; the allocation itself never
    /// collects, so the new object cannot be reclaimed before the caller
    /// anchors it.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = approx_size(&obj);
        let kind = kind_name(&obj);
        self.bytes_allocated += size;
        let slot = Slot {
            color: Color::White,
            size,
            obj,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        };
        if cfg!(feature = "log-gc") {
            eprintln!("-- gc alloc #{} ({}, {} bytes)", idx, kind, size);
        }
        ObjRef(idx)
    }

    /// Return the canonical string object for the given contents, allocating
    /// one if the contents were never seen before.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(&existing) = self.strings.get(s) {
            return existing;
        }
        let data: Rc<str> = Rc::from(s);
        let obj = self.alloc(Obj::String(Rc::clone(&data)));
        self.strings.insert(data, obj);
        obj
    }

    /// Whether enough has been allocated since the last collection that the
    /// owner should run one at its next safe point.
    pub fn should_collect(&self) -> bool {
        cfg!(feature = "stress-gc") || self.bytes_allocated > self.next_gc
    }

    /// Number of live bytes the collector currently accounts for.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// The byte count that will trigger the next collection.
    pub fn next_collection_threshold(&self) -> usize {
        self.next_gc
    }

    /// Number of live objects on the heap.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Announce the start of a collection cycle.
    pub fn begin_collection(&self) {
        if cfg!(feature = "log-gc") {
            eprintln!("-- gc begin ({} bytes)", self.bytes_allocated);
        }
    }

    /// Mark a root value: heap references become gray, everything else is
    /// ignored.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    /// Mark a root object gray so the next [`Heap::trace`] will follow it.
    pub fn mark_object(&mut self, obj: ObjRef) {
        let slot = self.slot_mut(obj);
        if slot.color == Color::White {
            slot.color = Color::Gray;
            self.gray.push(obj);
        }
    }

    /// Follow references from every gray object until the whole live graph is
    /// black.
    pub fn trace(&mut self) {
        while let Some(obj) = self.gray.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: ObjRef) {
        let children = {
            let slot = self.slot_mut(obj);
            slot.color = Color::Black;
            let mut children = Vec::new();
            match &slot.obj {
                Obj::String(_) | Obj::Native(_) => {}
                Obj::Fun(fun) => {
                    if let Some(name) = fun.name {
                        children.push(name);
                    }
                    for constant in fun.chunk.constants() {
                        if let Value::Obj(r) = constant {
                            children.push(*r);
                        }
                    }
                }
                Obj::Closure(closure) => {
                    children.push(closure.fun);
                    children.extend_from_slice(&closure.upvalues);
                }
                Obj::Upvalue(upvalue) => match upvalue {
                    // An open upvalue's target lives on the value stack,
                    // which is rooted by the VM itself.
                    ObjUpvalue::Open(_) => {}
                    ObjUpvalue::Closed(value) => {
                        if let Value::Obj(r) = value {
                            children.push(*r);
                        }
                    }
                },
                Obj::Class(class) => {
                    children.push(class.name);
                    for (name, method) in &class.methods {
                        children.push(*name);
                        if let Value::Obj(r) = method {
                            children.push(*r);
                        }
                    }
                }
                Obj::Instance(instance) => {
                    children.push(instance.class);
                    for (name, field) in &instance.fields {
                        children.push(*name);
                        if let Value::Obj(r) = field {
                            children.push(*r);
                        }
                    }
                }
                Obj::BoundMethod(bound) => {
                    if let Value::Obj(r) = bound.receiver {
                        children.push(r);
                    }
                    children.push(bound.method);
                }
            }
            children
        };
        for child in children {
            self.mark_object(child);
        }
    }

    /// Reclaim every object the last mark phase did not reach and whiten the
    /// survivors for the next cycle.
    pub fn sweep(&mut self) {
        let before = self.bytes_allocated;

        // Interned entries for dying strings must go first so later interns
        // of the same contents allocate a fresh object.
        let slots = &self.slots;
        self.strings.retain(|_, obj| {
            slots[obj.0 as usize]
                .as_ref()
                .map_or(false, |slot| slot.color != Color::White)
        });

        for (idx, entry) in self.slots.iter_mut().enumerate() {
            let dead = matches!(entry, Some(slot) if slot.color == Color::White);
            if dead {
                if let Some(slot) = entry.take() {
                    if cfg!(feature = "log-gc") {
                        eprintln!("-- gc free #{} ({})", idx, kind_name(&slot.obj));
                    }
                    self.bytes_allocated -= slot.size;
                    self.free.push(idx as u32);
                }
            } else if let Some(slot) = entry {
                slot.color = Color::White;
            }
        }

        self.next_gc = self.bytes_allocated.saturating_mul(HEAP_GROW_FACTOR);
        if cfg!(feature = "log-gc") {
            eprintln!(
                "-- gc end (collected {} bytes, {} -> {}, next at {})",
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    /// Record that a class or instance table gained entries, so table growth
    /// keeps pushing the heap towards its next collection.
    pub fn note_table_entries(&mut self, owner: ObjRef, count: usize) {
        let entry = std::mem::size_of::<ObjRef>() + std::mem::size_of::<Value>();
        self.slot_mut(owner).size += entry * count;
        self.bytes_allocated += entry * count;
    }

    /// Borrow the object behind a handle.
    pub fn get(&self, obj: ObjRef) -> &Obj {
        &self.slot(obj).obj
    }

    /// Mutably borrow the object behind a handle.
    pub fn get_mut(&mut self, obj: ObjRef) -> &mut Obj {
        &mut self.slot_mut(obj).obj
    }

    /// Borrow the contents of a string object.
    pub fn string(&self, obj: ObjRef) -> &Rc<str> {
        match self.get(obj) {
            Obj::String(s) => s,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a function object.
    pub fn fun(&self, obj: ObjRef) -> &ObjFun {
        match self.get(obj) {
            Obj::Fun(fun) => fun,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a closure object.
    pub fn closure(&self, obj: ObjRef) -> &ObjClosure {
        match self.get(obj) {
            Obj::Closure(closure) => closure,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow an upvalue object.
    pub fn upvalue(&self, obj: ObjRef) -> &ObjUpvalue {
        match self.get(obj) {
            Obj::Upvalue(upvalue) => upvalue,
            _ => panic!("Invalid cast"),
        }
    }

    /// Mutably borrow an upvalue object.
    pub fn upvalue_mut(&mut self, obj: ObjRef) -> &mut ObjUpvalue {
        match self.get_mut(obj) {
            Obj::Upvalue(upvalue) => upvalue,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a class object.
    pub fn class(&self, obj: ObjRef) -> &ObjClass {
        match self.get(obj) {
            Obj::Class(class) => class,
            _ => panic!("Invalid cast"),
        }
    }

    /// Mutably borrow a class object.
    pub fn class_mut(&mut self, obj: ObjRef) -> &mut ObjClass {
        match self.get_mut(obj) {
            Obj::Class(class) => class,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow an instance object.
    pub fn instance(&self, obj: ObjRef) -> &ObjInstance {
        match self.get(obj) {
            Obj::Instance(instance) => instance,
            _ => panic!("Invalid cast"),
        }
    }

    /// Mutably borrow an instance object.
    pub fn instance_mut(&mut self, obj: ObjRef) -> &mut ObjInstance {
        match self.get_mut(obj) {
            Obj::Instance(instance) => instance,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a bound method object.
    pub fn bound_method(&self, obj: ObjRef) -> &ObjBoundMethod {
        match self.get(obj) {
            Obj::BoundMethod(bound) => bound,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a native function object.
    pub fn native(&self, obj: ObjRef) -> &NativeFun {
        match self.get(obj) {
            Obj::Native(native) => native,
            _ => panic!("Invalid cast"),
        }
    }

    /// Render a value the way the `print` statement shows it.
    pub fn show_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(obj) => self.show_object(obj),
        }
    }

    fn show_object(&self, obj: ObjRef) -> String {
        match self.get(obj) {
            Obj::String(s) => s.to_string(),
            Obj::Fun(fun) => self.show_fun_name(fun.name),
            Obj::Closure(closure) => self.show_object(closure.fun),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Class(class) => self.string(class.name).to_string(),
            Obj::Instance(instance) => {
                format!("{} instance", self.string(self.class(instance.class).name))
            }
            Obj::BoundMethod(bound) => self.show_object(bound.method),
        }
    }

    fn show_fun_name(&self, name: Option<ObjRef>) -> String {
        match name {
            None => "<script>".to_string(),
            Some(obj) => {
                let s = self.string(obj);
                if s.is_empty() {
                    "<fn>".to_string()
                } else {
                    format!("<fn {}>", s)
                }
            }
        }
    }

    fn slot(&self, obj: ObjRef) -> &Slot {
        self.slots[obj.0 as usize]
            .as_ref()
            .expect("Use of a reclaimed object")
    }

    fn slot_mut(&mut self, obj: ObjRef) -> &mut Slot {
        self.slots[obj.0 as usize]
            .as_mut()
            .expect("Use of a reclaimed object")
    }
}

fn kind_name(obj: &Obj) -> &'static str {
    match obj {
        Obj::String(_) => "string",
        Obj::Fun(_) => "function",
        Obj::Closure(_) => "closure",
        Obj::Upvalue(_) => "upvalue",
        Obj::Native(_) => "native",
        Obj::Class(_) => "class",
        Obj::Instance(_) => "instance",
        Obj::BoundMethod(_) => "bound method",
    }
}

fn approx_size(obj: &Obj) -> usize {
    let base = std::mem::size_of::<Slot>();
    base + match obj {
        Obj::String(s) => s.len(),
        Obj::Fun(fun) => fun.chunk.byte_estimate(),
        Obj::Closure(closure) => closure.upvalues.len() * std::mem::size_of::<ObjRef>(),
        // Class and instance tables are empty when allocated; growth is
        // reported through `note_table_entry`.
        Obj::Upvalue(_) | Obj::Native(_) | Obj::Class(_) | Obj::Instance(_)
        | Obj::BoundMethod(_) => 0,
    }
}
