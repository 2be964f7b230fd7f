//! Parser for the Kiln language.
//!
//! Turns the lexer's token stream into the AST defined in [`ast`]. Parsing
//! is recursive descent with one token of lookahead (plus a raw cursor for
//! the lambda ambiguity at `(`) and statement-level error recovery driven
//! by the lexer's `first_on_line` flag, so one pass reports every error.

pub mod ast;
pub mod parser;

pub use parser::{ParseError, parse};
