//! Infrastructure for a bytecode virtual machine for a small dynamically
//! typed, class-based scripting language.
//!
//! Source text is compiled in a single pass into bytecode chunks and
//! executed on a stack machine whose objects live under a tracing
//! mark-and-sweep collector.

#![warn(missing_debug_implementations)]
#![deny(missing_docs)]

mod chunk;
mod compile;
mod error;
mod gc;
mod object;
mod opcode;
mod scan;
mod token;
mod value;
mod vm;

pub use chunk::*;
pub use compile::*;
pub use error::*;
pub use gc::*;
pub use object::*;
pub use opcode::*;
pub use scan::*;
pub use token::*;
pub use value::*;
pub use vm::*;

/// Maximum depth of the call-frame stack
pub const MAX_FRAMES: usize = 1024;

/// Initial capacity of the value stack; it grows past this on demand
pub const STACK_INIT_CAPACITY: usize = 256;

/// Maximum number of parameters a function can take, and of arguments a
/// call can pass
pub const MAX_PARAMS: usize = 255;

/// Maximum number of local variables in a function, including the reserved
/// slot zero
pub const MAX_LOCAL_VARIABLES: usize = 256;

/// Maximum number of constants stored in one chunk
pub const MAX_CHUNK_CONSTANTS: usize = 256;

/// Maximum number of upvalues a closure can have
pub const MAX_UPVALUES: usize = 256;
