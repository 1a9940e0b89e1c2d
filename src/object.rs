use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::{Chunk, ObjRef, Value};

/// The payload of one heap allocated object.
#[derive(Debug)]
pub enum Obj {
    /// An immutable, interned string
    String(Rc<str>),
    /// A compiled function
    Fun(ObjFun),
    /// A function together with its captured variables
    Closure(ObjClosure),
    /// A closed-over variable
    Upvalue(ObjUpvalue),
    /// A function provided by the host
    Native(NativeFun),
    /// A class and its methods
    Class(ObjClass),
    /// An instance of a class
    Instance(ObjInstance),
    /// A method bound to the instance it was read from
    BoundMethod(ObjBoundMethod),
}

/// A function object that holds the bytecode of the function along with
/// other metadata. Functions are produced by the compiler and never mutated
/// afterwards; the chunk sits behind an `Rc` so call frames can keep hold of
/// it without going through the heap on every instruction.
#[derive(Debug)]
pub struct ObjFun {
    /// The name of the function. `None` for the top-level script; an interned
    /// empty string for anonymous functions.
    pub name: Option<ObjRef>,
    /// Number of parameters the function has
    pub arity: u8,
    /// Number of variables the function closes over
    pub upvalue_count: usize,
    /// The bytecode chunk of this function
    pub chunk: Rc<Chunk>,
}

/// A function that captures its surrounding environment.
#[derive(Debug)]
pub struct ObjClosure {
    /// The base function of this closure
    pub fun: ObjRef,
    /// Upvalues for indirect access to closed-over variables
    pub upvalues: Vec<ObjRef>,
}

/// A structure for managing a closed-over value
#[derive(Debug)]
pub enum ObjUpvalue {
    /// Stores a slot offset pointing at the captured value while it still
    /// lives on the value stack
    Open(usize),
    /// Stores the captured value once its stack slot is gone
    Closed(Value),
}

/// A class object holding the class's methods
#[derive(Debug)]
pub struct ObjClass {
    /// The name of the class
    pub name: ObjRef,
    /// Methods keyed by their interned name
    pub methods: FxHashMap<ObjRef, Value>,
}

/// An instance of a class
#[derive(Debug)]
pub struct ObjInstance {
    /// The class this instance was created from
    pub class: ObjRef,
    /// Fields keyed by their interned name
    pub fields: FxHashMap<ObjRef, Value>,
}

/// A method bound to the instance it was read from. Calling the bound method
/// places the receiver in slot zero of the callee's frame.
#[derive(Debug)]
pub struct ObjBoundMethod {
    /// The receiver captured at property-read time
    pub receiver: Value,
    /// The closure implementing the method
    pub method: ObjRef,
}

/// A function provided by the host
#[derive(Clone)]
pub struct NativeFun {
    /// The function's name, kept for diagnostics
    pub name: Rc<str>,
    /// Native function reference
    pub call: fn(&[Value]) -> Value,
}

impl fmt::Debug for NativeFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}
