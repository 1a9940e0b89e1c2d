use std::fmt;

use crate::Position;

/// Top-level interpreter errors
#[derive(Debug)]
pub enum Error {
    /// A runtime error happened
    Runtime,
    /// A compilation error happened
    Compile,
}

impl std::error::Error for Error {}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime => write!(f, "Runtime error(s) occured."),
            Self::Compile => write!(f, "Compilation error(s) occured."),
        }
    }
}

/// Error while parsing and compiling source code
#[derive(Debug, Clone)]
pub enum ParseError {
    /// Ran out of tokens while more were expected
    UnexpectedEof(String),
    /// A token that is not valid at this point, with the expectation that was violated
    UnexpectedToken(Position, String, String),
    /// The expression left of `=` is not something that can be assigned to
    InvalidAssignment(Position),
    /// A chunk can hold at most 256 constants
    TooManyConstants(Position),
    /// A function can hold at most 256 local variables
    TooManyLocals(Position),
    /// A function can close over at most 256 variables
    TooManyUpvalues(Position),
    /// A function can declare at most 255 parameters
    TooManyParams(Position),
    /// A call can pass at most 255 arguments
    TooManyArgs(Position),
    /// A jump instruction cannot span more than 65535 instructions
    JumpTooLarge(Position),
    /// Two variables with the same name in the same scope
    DuplicateVariable(Position, String),
    /// A local variable read while its initializer is still being compiled
    OwnInitializer(Position, String),
    /// `return` at the top level of a script
    TopLevelReturn(Position),
    /// `return` with a value inside an `init` method
    InitializerReturn(Position),
    /// `this` outside of a class body
    ThisOutsideClass(Position),
    /// `super` outside of a class body
    SuperOutsideClass(Position),
    /// `super` in a class without a superclass
    SuperWithoutSuperclass(Position),
    /// A class listing itself as its superclass
    SelfInheritance(Position, String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof(msg) => write!(f, "Error at end: {}.", msg),
            Self::UnexpectedToken(pos, lexeme, msg) => {
                write!(f, "{} Error at '{}': {}.", pos, lexeme, msg)
            }
            Self::InvalidAssignment(pos) => {
                write!(f, "{} Error: Invalid assignment target.", pos)
            }
            Self::TooManyConstants(pos) => {
                write!(f, "{} Error: Too many constants in one chunk.", pos)
            }
            Self::TooManyLocals(pos) => {
                write!(f, "{} Error: Too many local variables in function.", pos)
            }
            Self::TooManyUpvalues(pos) => {
                write!(f, "{} Error: Too many closure variables in function.", pos)
            }
            Self::TooManyParams(pos) => {
                write!(f, "{} Error: Can't have more than 255 parameters.", pos)
            }
            Self::TooManyArgs(pos) => {
                write!(f, "{} Error: Can't have more than 255 arguments.", pos)
            }
            Self::JumpTooLarge(pos) => {
                write!(f, "{} Error: Too much code to jump over.", pos)
            }
            Self::DuplicateVariable(pos, name) => write!(
                f,
                "{} Error at '{}': Already a variable with this name in this scope.",
                pos, name
            ),
            Self::OwnInitializer(pos, name) => write!(
                f,
                "{} Error at '{}': Can't read local variable in its own initializer.",
                pos, name
            ),
            Self::TopLevelReturn(pos) => {
                write!(f, "{} Error: Can't return from top-level code.", pos)
            }
            Self::InitializerReturn(pos) => {
                write!(f, "{} Error: Can't return a value from an initializer.", pos)
            }
            Self::ThisOutsideClass(pos) => {
                write!(f, "{} Error: Can't use 'this' outside of a class.", pos)
            }
            Self::SuperOutsideClass(pos) => {
                write!(f, "{} Error: Can't use 'super' outside of a class.", pos)
            }
            Self::SuperWithoutSuperclass(pos) => write!(
                f,
                "{} Error: Can't use 'super' in a class with no superclass.",
                pos
            ),
            Self::SelfInheritance(pos, name) => write!(
                f,
                "{} Error at '{}': A class can't inherit from itself.",
                pos, name
            ),
        }
    }
}

/// Virtual machine errors
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// The call-frame stack is exhausted
    StackOverflow,
    /// The value stack did not hold what an opcode expected; this is an
    /// interpreter bug, not a user error
    CorruptedStack,
    /// Accessing a global variable that was never defined
    UndefinedVariable(String),
    /// Accessing a property that is neither a field nor a method
    UndefinedProperty(String),
    /// Calling a value that is not a function, method, or class
    NotCallable,
    /// Calling a function with the wrong number of arguments
    ArityMismatch(u8, u8),
    /// Operand(s) given to an opcode have the wrong type
    InvalidOperands(&'static str),
    /// Reading a property on a value that is not an instance
    NoProperties,
    /// Writing a field on a value that is not an instance
    NoFields,
    /// Invoking a method on a value that is not an instance
    NoMethods,
    /// Inheriting from a value that is not a class
    BadSuperclass,
}

impl std::error::Error for RuntimeError {}
impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => write!(f, "Stack overflow."),
            Self::CorruptedStack => write!(f, "Corrupted value stack."),
            Self::UndefinedVariable(name) => write!(f, "Undefined variable '{}'.", name),
            Self::UndefinedProperty(name) => write!(f, "Undefined property '{}'.", name),
            Self::NotCallable => write!(f, "Can only call functions and classes."),
            Self::ArityMismatch(expected, got) => {
                write!(f, "Expected {} arguments but got {}.", expected, got)
            }
            Self::InvalidOperands(msg) => write!(f, "{}", msg),
            Self::NoProperties => write!(f, "Only instances have properties."),
            Self::NoFields => write!(f, "Only instances have fields."),
            Self::NoMethods => write!(f, "Only instances have methods."),
            Self::BadSuperclass => write!(f, "Superclass must be a class."),
        }
    }
}
