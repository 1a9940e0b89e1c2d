use std::collections::BTreeMap;
use std::io::Write;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;

use crate::{
    compile, Chunk, Error, Heap, NativeFun, Obj, ObjBoundMethod, ObjClass, ObjClosure,
    ObjInstance, ObjRef, ObjUpvalue, OpCode, RuntimeError, Value, MAX_FRAMES,
    STACK_INIT_CAPACITY,
};

/// Execution state of one active invocation: the closure being run, the
/// cursor into its bytecode, and where its locals start on the value stack.
#[derive(Debug)]
struct CallFrame {
    closure: ObjRef,
    chunk: Rc<Chunk>,
    ip: usize,
    base: usize,
}

/// The kinds of values a `CALL` can land on, copied out of the heap so the
/// dispatch below can borrow the machine freely.
enum Callee {
    Closure(ObjRef),
    Native(fn(&[Value]) -> Value),
    Class(ObjRef),
    Bound(Value, ObjRef),
}

/// A bytecode virtual machine for the language.
///
/// The machine owns the heap, the globals, and all transient execution
/// state. One machine can interpret any number of sources in sequence;
/// globals persist across calls, which is what a REPL wants.
#[derive(Debug)]
pub struct VM {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: FxHashMap<ObjRef, Value>,
    open_upvalues: BTreeMap<usize, ObjRef>,
    heap: Heap,
    init_string: ObjRef,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    /// Create a machine with the built-in native functions installed.
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            frames: Vec::new(),
            stack: Vec::with_capacity(STACK_INIT_CAPACITY),
            globals: FxHashMap::default(),
            open_upvalues: BTreeMap::new(),
            heap,
            init_string,
        };
        vm.define_native("clock", native_clock);
        vm
    }

    /// Compile and execute the given source, writing `print` output to
    /// `out`. Compile and runtime diagnostics go to standard error.
    pub fn interpret(&mut self, src: &str, out: &mut impl Write) -> Result<(), Error> {
        let script = match compile(src, &mut self.heap) {
            Some(fun) => fun,
            None => return Err(Error::Compile),
        };
        self.stack.push(Value::Obj(script));
        let closure = self.alloc(Obj::Closure(ObjClosure {
            fun: script,
            upvalues: Vec::new(),
        }));
        self.stack.pop();
        self.stack.push(Value::Obj(closure));

        self.call_closure(closure, 0)
            .and_then(|()| self.run(out))
            .map_err(|err| {
                self.report_runtime_error(&err);
                self.reset();
                Error::Runtime
            })
    }

    fn run(&mut self, out: &mut impl Write) -> Result<(), RuntimeError> {
        loop {
            if cfg!(feature = "trace-execution") {
                print_stack_trace(&self.stack, &self.heap);
                if let Some(frame) = self.frames.last() {
                    crate::disassemble_instruction(&frame.chunk, frame.ip, &self.heap);
                }
            }

            let op = {
                let frame = self
                    .frames
                    .last_mut()
                    .expect("The dispatch loop always has a frame.");
                let (op, _) = frame.chunk.read_instruction(frame.ip);
                let op = op.clone();
                frame.ip += 1;
                op
            };

            match op {
                OpCode::Constant(const_id) => {
                    let value = *self.frame().chunk.read_const(const_id);
                    self.stack.push(value);
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::GetLocal(slot) => {
                    let value = self.stack[self.frame().base + slot as usize];
                    self.stack.push(value);
                }
                OpCode::SetLocal(slot) => {
                    let value = self.peek(0)?;
                    let base = self.frame().base;
                    self.stack[base + slot as usize] = value;
                }
                OpCode::GetGlobal(const_id) => {
                    let name = self.read_string_const(const_id);
                    match self.globals.get(&name) {
                        Some(&value) => self.stack.push(value),
                        None => {
                            return Err(RuntimeError::UndefinedVariable(
                                self.heap.string(name).to_string(),
                            ))
                        }
                    }
                }
                OpCode::DefineGlobal(const_id) => {
                    let name = self.read_string_const(const_id);
                    let value = self.peek(0)?;
                    self.globals.insert(name, value);
                    self.pop()?;
                }
                OpCode::SetGlobal(const_id) => {
                    let name = self.read_string_const(const_id);
                    if !self.globals.contains_key(&name) {
                        return Err(RuntimeError::UndefinedVariable(
                            self.heap.string(name).to_string(),
                        ));
                    }
                    let value = self.peek(0)?;
                    self.globals.insert(name, value);
                }
                OpCode::GetUpvalue(slot) => {
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot as usize];
                    let value = match self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(stack_slot) => self.stack[*stack_slot],
                        ObjUpvalue::Closed(value) => *value,
                    };
                    self.stack.push(value);
                }
                OpCode::SetUpvalue(slot) => {
                    let value = self.peek(0)?;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot as usize];
                    match self.heap.upvalue_mut(upvalue) {
                        ObjUpvalue::Open(stack_slot) => {
                            let stack_slot = *stack_slot;
                            self.stack[stack_slot] = value;
                        }
                        ObjUpvalue::Closed(cell) => *cell = value,
                    }
                }
                OpCode::GetProperty(const_id) => {
                    let name = self.read_string_const(const_id);
                    let receiver = self.peek(0)?;
                    let Value::Obj(obj) = receiver else {
                        return Err(RuntimeError::NoProperties);
                    };
                    let (class, field) = match self.heap.get(obj) {
                        Obj::Instance(instance) => {
                            (instance.class, instance.fields.get(&name).copied())
                        }
                        _ => return Err(RuntimeError::NoProperties),
                    };
                    match field {
                        // Fields shadow methods.
                        Some(value) => {
                            self.pop()?;
                            self.stack.push(value);
                        }
                        None => self.bind_method(class, name)?,
                    }
                }
                OpCode::SetProperty(const_id) => {
                    let name = self.read_string_const(const_id);
                    let value = self.peek(0)?;
                    let target = self.peek(1)?;
                    let Value::Obj(obj) = target else {
                        return Err(RuntimeError::NoFields);
                    };
                    let inserted = match self.heap.get_mut(obj) {
                        Obj::Instance(instance) => instance.fields.insert(name, value).is_none(),
                        _ => return Err(RuntimeError::NoFields),
                    };
                    if inserted {
                        self.heap.note_table_entries(obj, 1);
                    }
                    self.pop()?;
                    self.pop()?;
                    self.stack.push(value);
                }
                OpCode::GetSuper(const_id) => {
                    let name = self.read_string_const(const_id);
                    let Value::Obj(superclass) = self.pop()? else {
                        return Err(RuntimeError::BadSuperclass);
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.stack.push(Value::Bool(lhs == rhs));
                }
                OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => {
                    let rhs = self.peek(0)?;
                    let lhs = self.peek(1)?;
                    match (lhs, rhs) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop()?;
                            self.pop()?;
                            self.stack.push(Value::Number(a + b));
                        }
                        (Value::Obj(a), Value::Obj(b)) => {
                            let concatenated = match (self.heap.get(a), self.heap.get(b)) {
                                (Obj::String(s1), Obj::String(s2)) => format!("{}{}", s1, s2),
                                _ => {
                                    return Err(RuntimeError::InvalidOperands(
                                        "Operands must be two numbers or two strings.",
                                    ))
                                }
                            };
                            // Both operands stay on the stack across this
                            // allocation so the collector can reach them.
                            let result = self.intern(&concatenated);
                            self.pop()?;
                            self.pop()?;
                            self.stack.push(Value::Obj(result));
                        }
                        _ => {
                            return Err(RuntimeError::InvalidOperands(
                                "Operands must be two numbers or two strings.",
                            ))
                        }
                    }
                }
                OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop()?;
                    self.stack.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.pop()? {
                    Value::Number(n) => self.stack.push(Value::Number(-n)),
                    _ => {
                        return Err(RuntimeError::InvalidOperands("Operand must be a number."))
                    }
                },
                OpCode::Print => {
                    let value = self.pop()?;
                    let _ = writeln!(out, "{}", self.heap.show_value(value));
                }
                OpCode::Jump(offset) => {
                    self.frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse(offset) => {
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop(offset) => {
                    self.frame_mut().ip -= offset as usize;
                }
                OpCode::Call(argc) => {
                    let callee = self.peek(argc as usize)?;
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke(const_id, argc) => {
                    let name = self.read_string_const(const_id);
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke(const_id, argc) => {
                    let name = self.read_string_const(const_id);
                    let Value::Obj(superclass) = self.pop()? else {
                        return Err(RuntimeError::BadSuperclass);
                    };
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure(const_id, descriptors) => {
                    let fun = match self.frame().chunk.read_const(const_id) {
                        Value::Obj(fun) => *fun,
                        _ => unreachable!("The closure constant must be a function."),
                    };
                    let enclosing = self.frame().closure;
                    let base = self.frame().base;
                    let mut upvalues = Vec::with_capacity(descriptors.len());
                    for descriptor in &descriptors {
                        if descriptor.is_local {
                            upvalues
                                .push(self.capture_upvalue(base + descriptor.index as usize));
                        } else {
                            upvalues.push(
                                self.heap.closure(enclosing).upvalues
                                    [descriptor.index as usize],
                            );
                        }
                    }
                    let closure = self.alloc(Obj::Closure(ObjClosure { fun, upvalues }));
                    self.stack.push(Value::Obj(closure));
                }
                OpCode::CloseUpvalue => {
                    if let Some(top) = self.stack.len().checked_sub(1) {
                        self.close_upvalues(top);
                    }
                    self.pop()?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .expect("The dispatch loop always has a frame.");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        // Clean termination leaves just the script closure.
                        if self.stack.len() != 1 {
                            return Err(RuntimeError::CorruptedStack);
                        }
                        self.stack.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.stack.push(result);
                }
                OpCode::Class(const_id) => {
                    let name = self.read_string_const(const_id);
                    let class = self.alloc(Obj::Class(ObjClass {
                        name,
                        methods: FxHashMap::default(),
                    }));
                    self.stack.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let Value::Obj(superclass) = self.peek(1)? else {
                        return Err(RuntimeError::BadSuperclass);
                    };
                    let methods = match self.heap.get(superclass) {
                        Obj::Class(class) => class.methods.clone(),
                        _ => return Err(RuntimeError::BadSuperclass),
                    };
                    let count = methods.len();
                    let Value::Obj(subclass) = self.peek(0)? else {
                        unreachable!("Inherit always finds the new subclass on top.");
                    };
                    self.heap.class_mut(subclass).methods = methods;
                    self.heap.note_table_entries(subclass, count);
                    self.pop()?;
                }
                OpCode::Method(const_id) => {
                    let name = self.read_string_const(const_id);
                    let method = self.peek(0)?;
                    let Value::Obj(class) = self.peek(1)? else {
                        unreachable!("Method always binds into a class.");
                    };
                    let inserted = self
                        .heap
                        .class_mut(class)
                        .methods
                        .insert(name, method)
                        .is_none();
                    if inserted {
                        self.heap.note_table_entries(class, 1);
                    }
                    self.pop()?;
                }
            }
        }
    }

    // ---- calling convention ----

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Value::Obj(obj) = callee else {
            return Err(RuntimeError::NotCallable);
        };
        let callee = match self.heap.get(obj) {
            Obj::Closure(_) => Callee::Closure(obj),
            Obj::Native(native) => Callee::Native(native.call),
            Obj::Class(_) => Callee::Class(obj),
            Obj::BoundMethod(bound) => Callee::Bound(bound.receiver, bound.method),
            _ => return Err(RuntimeError::NotCallable),
        };
        match callee {
            Callee::Closure(closure) => self.call_closure(closure, argc),
            Callee::Native(call) => {
                let first_arg = self.stack.len() - argc as usize;
                let result = call(&self.stack[first_arg..]);
                self.stack.truncate(first_arg - 1);
                self.stack.push(result);
                Ok(())
            }
            Callee::Class(class) => self.call_class(class, argc),
            Callee::Bound(receiver, method) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let fun_ref = self.heap.closure(closure).fun;
        let (arity, chunk) = {
            let fun = self.heap.fun(fun_ref);
            (fun.arity, Rc::clone(&fun.chunk))
        };
        if argc != arity {
            return Err(RuntimeError::ArityMismatch(arity, argc));
        }
        if self.frames.len() == MAX_FRAMES {
            return Err(RuntimeError::StackOverflow);
        }
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            base: self.stack.len() - argc as usize - 1,
        });
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let slot = self.stack.len() - argc as usize - 1;
        let instance = self.alloc(Obj::Instance(ObjInstance {
            class,
            fields: FxHashMap::default(),
        }));
        self.stack[slot] = Value::Obj(instance);
        let init = self.heap.class(class).methods.get(&self.init_string).copied();
        match init {
            Some(Value::Obj(init_ref)) => self.call_closure(init_ref, argc),
            Some(_) => Err(RuntimeError::NotCallable),
            None if argc != 0 => Err(RuntimeError::ArityMismatch(0, argc)),
            None => Ok(()),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize)?;
        let Value::Obj(obj) = receiver else {
            return Err(RuntimeError::NoMethods);
        };
        let (class, field) = match self.heap.get(obj) {
            Obj::Instance(instance) => (instance.class, instance.fields.get(&name).copied()),
            _ => return Err(RuntimeError::NoMethods),
        };
        if let Some(field) = field {
            // A field shadows any method of the same name; call whatever it
            // holds, mirroring GET_PROPERTY followed by CALL.
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        argc: u8,
    ) -> Result<(), RuntimeError> {
        let method = match self.heap.class(class).methods.get(&name) {
            Some(&method) => method,
            None => {
                return Err(RuntimeError::UndefinedProperty(
                    self.heap.string(name).to_string(),
                ))
            }
        };
        let Value::Obj(method_ref) = method else {
            return Err(RuntimeError::NotCallable);
        };
        self.call_closure(method_ref, argc)
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let method = match self.heap.class(class).methods.get(&name) {
            Some(&method) => method,
            None => {
                return Err(RuntimeError::UndefinedProperty(
                    self.heap.string(name).to_string(),
                ))
            }
        };
        let Value::Obj(method_ref) = method else {
            return Err(RuntimeError::NotCallable);
        };
        let receiver = self.peek(0)?;
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod {
            receiver,
            method: method_ref,
        }));
        self.pop()?;
        self.stack.push(Value::Obj(bound));
        Ok(())
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, stack_slot: usize) -> ObjRef {
        if let Some(&existing) = self.open_upvalues.get(&stack_slot) {
            return existing;
        }
        let upvalue = self.alloc(Obj::Upvalue(ObjUpvalue::Open(stack_slot)));
        self.open_upvalues.insert(stack_slot, upvalue);
        upvalue
    }

    /// Close every open upvalue whose stack slot is at or above `from` by
    /// lifting the slot's value into the upvalue itself.
    fn close_upvalues(&mut self, from: usize) {
        let closing = self.open_upvalues.split_off(&from);
        for (stack_slot, upvalue) in closing {
            let value = self.stack[stack_slot];
            *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
        }
    }

    // ---- stack plumbing ----

    fn frame(&self) -> &CallFrame {
        self.frames
            .last()
            .expect("The dispatch loop always has a frame.")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .expect("The dispatch loop always has a frame.")
    }

    fn read_string_const(&self, const_id: u8) -> ObjRef {
        match self.frame().chunk.read_const(const_id) {
            Value::Obj(obj) => *obj,
            _ => unreachable!("Constant for an identifier must be a string."),
        }
    }

    fn peek(&self, distance: usize) -> Result<Value, RuntimeError> {
        self.stack
            .len()
            .checked_sub(1 + distance)
            .and_then(|idx| self.stack.get(idx))
            .copied()
            .ok_or(RuntimeError::CorruptedStack)
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::CorruptedStack)
    }

    fn binary_number_op(&mut self, apply: fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        match (self.peek(1)?, self.peek(0)?) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.pop()?;
                self.pop()?;
                self.stack.push(apply(lhs, rhs));
                Ok(())
            }
            _ => Err(RuntimeError::InvalidOperands("Operands must be numbers.")),
        }
    }

    // ---- natives ----

    fn define_native(&mut self, name: &str, call: fn(&[Value]) -> Value) {
        let name_obj = self.intern(name);
        assert!(
            !self.globals.contains_key(&name_obj),
            "Duplicate native function '{}'",
            name
        );
        // Anchor both objects on the stack while the second allocation can
        // still trigger a collection.
        self.stack.push(Value::Obj(name_obj));
        let native = self.alloc(Obj::Native(NativeFun {
            name: Rc::from(name),
            call,
        }));
        self.stack.push(Value::Obj(native));
        self.globals.insert(name_obj, Value::Obj(native));
        self.stack.pop();
        self.stack.pop();
    }

    // ---- collector integration ----

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.maybe_collect();
        self.heap.alloc(obj)
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern(s)
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        self.heap.begin_collection();
        for value in &self.stack {
            self.heap.mark_value(*value);
        }
        for (name, value) in &self.globals {
            self.heap.mark_object(*name);
            self.heap.mark_value(*value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for upvalue in self.open_upvalues.values() {
            self.heap.mark_object(*upvalue);
        }
        self.heap.mark_object(self.init_string);
        self.heap.trace();
        self.heap.sweep();
    }

    // ---- diagnostics ----

    fn report_runtime_error(&self, err: &RuntimeError) {
        eprintln!("{}", err);
        for frame in self.frames.iter().rev() {
            let line = frame.chunk.position(frame.ip.saturating_sub(1)).line;
            let fun_ref = self.heap.closure(frame.closure).fun;
            match self.heap.fun(fun_ref).name {
                None => eprintln!("[line {}] in <script>", line),
                Some(name) => {
                    let name = self.heap.string(name);
                    if name.is_empty() {
                        eprintln!("[line {}] in <fn>", line);
                    } else {
                        eprintln!("[line {}] in {}()", line, name);
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }
}

fn native_clock(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}

fn print_stack_trace(stack: &[Value], heap: &Heap) {
    print!("          ");
    for value in stack {
        print!("[ {} ]", heap.show_value(*value));
    }
    println!();
}
