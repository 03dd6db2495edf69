//! Abstract syntax tree
//!
//! The parser produces these types and the lowerer consumes them. Every
//! expression evaluates to a 64-bit float, so the tree carries no type
//! information beyond its shape.

/// An expression. Variants with more than a couple of fields box a payload
/// struct to keep the enum small.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),

    Unary(Box<Unary>),
    Binary(Box<Binary>),

    Call { callee: String, args: Vec<Expr> },

    If(Box<If>),
    For(Box<For>),
    Var(Box<Var>),
}

/// Application of a unary operator, lowered as a call to `unary⟨op⟩`.
#[derive(Debug, Clone, PartialEq)]
pub struct Unary {
    pub op: u8,
    pub operand: Expr,
}

/// Application of a binary operator. `=` is assignment and is handled
/// specially by the lowerer; everything that is not a built-in lowers as a
/// call to `binary⟨op⟩`.
#[derive(Debug, Clone, PartialEq)]
pub struct Binary {
    pub op: u8,
    pub lhs: Expr,
    pub rhs: Expr,
}

/// `if cond then a else b` — both branches are mandatory and produce the
/// value of the expression.
#[derive(Debug, Clone, PartialEq)]
pub struct If {
    pub cond: Expr,
    pub then: Expr,
    pub otherwise: Expr,
}

/// `for i = start, end, step? in body` — a counted loop. The step defaults
/// to 1.0 and the whole expression always evaluates to 0.0.
#[derive(Debug, Clone, PartialEq)]
pub struct For {
    pub var: String,
    pub start: Expr,
    pub end: Expr,
    pub step: Option<Expr>,
    pub body: Expr,
}

/// `var a = 1, b in body` — local bindings, each initialized left to right
/// (default 0.0), scoped to `body`. Shadowed bindings are restored on exit.
#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub bindings: Vec<(String, Option<Expr>)>,
    pub body: Expr,
}

/// What kind of function a prototype declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrototypeKind {
    Regular,
    Unary,
    Binary,
}

/// A function's external signature. Operator definitions encode the operator
/// symbol as the last byte of the name (`unary!`, `binary:`); `precedence`
/// is only meaningful for binary operators.
#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    pub name: String,
    pub params: Vec<String>,
    pub kind: PrototypeKind,
    pub precedence: u32,
}

impl Prototype {
    pub fn is_unary_op(&self) -> bool {
        self.kind == PrototypeKind::Unary && self.params.len() == 1
    }

    pub fn is_binary_op(&self) -> bool {
        self.kind == PrototypeKind::Binary && self.params.len() == 2
    }

    /// The operator symbol of a unary or binary prototype.
    pub fn operator_symbol(&self) -> u8 {
        debug_assert!(self.is_unary_op() || self.is_binary_op());
        self.name.as_bytes()[self.name.len() - 1]
    }

    /// Function name a unary operator lowers to.
    pub fn unary_name(op: u8) -> String {
        format!("unary{}", op as char)
    }

    /// Function name a binary operator lowers to.
    pub fn binary_name(op: u8) -> String {
        format!("binary{}", op as char)
    }
}

/// A function definition: prototype plus body expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub proto: Prototype,
    pub body: Expr,
}
