//! JMPL Core: the value model and heap the interpreter operates on
//!
//! This crate is the shared foundation under the compiler and the VM:
//!
//! - `value`: the tagged `Value` type (booleans, null, f64 numbers, objects)
//! - `object`: heap object payloads and the object header
//! - `heap`: the object arena with its mark-and-sweep collector and the
//!   string intern table
//! - `string`: Unicode strings stored as code points with a cached UTF-8
//!   encoding
//! - `table`: the open-addressed table keyed by interned strings (globals
//!   and interning)
//! - `set`: finite sets with structural hashing
//! - `tuple`: fixed-length tuples
//! - `iter`: the iterator protocol over sets, tuples, and strings
//! - `chunk`: compiled bytecode plus constant pool and line map
//! - `hash`: xxhash-based value hashing

pub mod chunk;
pub mod hash;
pub mod heap;
pub mod iter;
pub mod object;
pub mod set;
pub mod string;
pub mod table;
pub mod tuple;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{Heap, Roots};
pub use object::{
    ClosureObj, FunctionObj, IterObj, NativeObj, Obj, ObjKind, ObjRef, Payload, UpvalueLoc,
    UpvalueObj,
};
pub use set::SetObj;
pub use string::{StrObj, StringKind};
pub use table::Table;
pub use tuple::TupleObj;
pub use value::Value;

/// Maximum number of locals, upvalues, and call arguments per function.
pub const UINT8_COUNT: usize = u8::MAX as usize + 1;
