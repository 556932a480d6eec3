//! JMPL Compiler
//!
//! Turns UTF-8 source into a top-level script function in one pass: the
//! scanner produces tokens (with indentation-based layout), and the Pratt
//! compiler emits bytecode directly into chunks as it parses, with no AST in
//! between.

pub mod compiler;
pub mod escape;
pub mod scanner;
pub mod token;

pub use compiler::compile;
pub use scanner::Scanner;
pub use token::{Token, TokenKind};
