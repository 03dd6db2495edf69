pub mod ast;
pub mod codegen;
pub mod driver;
pub mod lexer;
pub mod parser;
pub mod runtime;

pub use codegen::{Codegen, CodegenError};
pub use driver::{Driver, DriverError};
pub use lexer::{Lexer, Token};
pub use parser::{ParseError, Parser, PrecedenceTable};

/// Name of the zero-parameter function that wraps a top-level expression.
pub const ANONYMOUS_FUNCTION_NAME: &str = "__anon_expr";
