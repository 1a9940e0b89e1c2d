/// OpCode is an instruction executed by the virtual machine, together with
/// its decoded operands.
///
/// # Notes
///
/// We don't have an `OpCode::NotEqual` because we transform `a != b` to
/// `!(a == b)` to demonstrate that bytecode can deviate from the actual
/// user's code as long as it behaves similarly. This is also applied for
/// operator `<=` and operator `>=`.
///
/// `a <= b` is not equivalent to `!(a > b)`, similarly with greater and
/// greater or equal. According to [IEEE 754] all comparison operators return
/// `false` when an operand is `NaN`. These are implementation details that we
/// should keep in mind when making a real language.
///
/// [IEEE 754]: https://en.wikipedia.org/wiki/IEEE_754
#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    /// Load a constant
    Constant(u8),
    /// Load a `nil` value
    Nil,
    /// Load a `true` value
    True,
    /// Load a `false` value
    False,
    /// Pop the top of the stack
    Pop,
    /// Push the local in the given frame slot
    GetLocal(u8),
    /// Write the top of the stack to the given frame slot, keeping the value
    SetLocal(u8),
    /// Push the global named by the constant at the index
    GetGlobal(u8),
    /// Pop the top of the stack and define a global with that value
    DefineGlobal(u8),
    /// Write the top of the stack to an existing global, keeping the value
    SetGlobal(u8),
    /// Push the value captured by the upvalue at the index
    GetUpvalue(u8),
    /// Write the top of the stack through the upvalue at the index
    SetUpvalue(u8),
    /// Replace the instance on top of the stack with its field or bound method
    GetProperty(u8),
    /// Write a field on the instance below the top of the stack
    SetProperty(u8),
    /// Bind a method from the superclass on top of the stack
    GetSuper(u8),
    /// Check for equality between 2 operands
    Equal,
    /// Compare if the first operand is greater than the second
    Greater,
    /// Compare if the first operand is less than the second
    Less,
    /// Add two number operands or two string operands
    Add,
    /// Subtract two number operands
    Subtract,
    /// Multiply two number operands
    Multiply,
    /// Divide two number operands
    Divide,
    /// Apply logical `not` to a single operand
    Not,
    /// Negate a single number operand
    Negate,
    /// Print an expression in human readable format
    Print,
    /// Jump forward by the offset
    Jump(u16),
    /// Jump forward by the offset when the top of the stack is falsey,
    /// leaving the tested value in place
    JumpIfFalse(u16),
    /// Jump backward by the offset
    Loop(u16),
    /// Call the value below the arguments with the given argument count
    Call(u8),
    /// Invoke the named method on the receiver below the arguments
    Invoke(u8, u8),
    /// Invoke the named method through the superclass on top of the stack
    SuperInvoke(u8, u8),
    /// Create a closure over the function constant, capturing the described
    /// upvalues
    Closure(u8, Vec<UpvalueRef>),
    /// Hoist the stack slot referenced by the top open upvalue to the heap,
    /// then pop it
    CloseUpvalue,
    /// Return from the current function
    Return,
    /// Push a new class named by the constant at the index
    Class(u8),
    /// Copy the methods of the superclass into the subclass on top of the stack
    Inherit,
    /// Bind the closure on top of the stack as a method of the class below it
    Method(u8),
}

/// Description of one variable captured by a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueRef {
    /// Slot in the enclosing function's locals (when `is_local`), or index
    /// into the enclosing function's upvalues
    pub index: u8,
    /// Whether the captured variable is a local of the enclosing function
    pub is_local: bool,
}
