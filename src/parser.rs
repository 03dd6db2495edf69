//! Parser
//!
//! Recursive descent over the token stream, with a precedence-climbing layer
//! for binary operators. The precedence table lives on the parser and is
//! mutated at runtime: lowering a `def binary⟨op⟩` installs the operator so
//! that the very next expression can use it, and retracts it again if the
//! body fails to lower.
//!
//! On a parse error the methods here leave the offending token in place and
//! return the error; the driver reports it and skips a single token before
//! retrying at the top level.

use std::collections::HashMap;
use std::io::Read;

use thiserror::Error;

use crate::ast::{self, Expr, Prototype, PrototypeKind};
use crate::lexer::{Lexer, Token};
use crate::ANONYMOUS_FUNCTION_NAME;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown token when expecting an expression")]
    ExpectedExpression,

    #[error("expected ')'")]
    ExpectedCloseParen,

    #[error("Expected ')' or ',' in argument list")]
    ExpectedArgumentList,

    #[error("expected then")]
    ExpectedThen,

    #[error("expected else")]
    ExpectedElse,

    #[error("expected identifier after for")]
    ExpectedForIdentifier,

    #[error("expected '=' after for")]
    ExpectedForAssignment,

    #[error("expected ',' after for start value")]
    ExpectedForComma,

    #[error("expected 'in' after for")]
    ExpectedForIn,

    #[error("expected identifier after var")]
    ExpectedVarIdentifier,

    #[error("expected identifier list after var")]
    ExpectedVarIdentifierList,

    #[error("expected 'in' keyword after 'var'")]
    ExpectedVarIn,

    #[error("Expected function name in prototype")]
    ExpectedFunctionName,

    #[error("Expected unary operator")]
    ExpectedUnaryOperator,

    #[error("Expected binary operator")]
    ExpectedBinaryOperator,

    #[error("Invalid precedence: must be 1..100")]
    InvalidPrecedence,

    #[error("Expected '(' in prototype")]
    ExpectedPrototypeOpenParen,

    #[error("Expected ')' in prototype")]
    ExpectedPrototypeCloseParen,

    #[error("Invalid number of operands for operator")]
    InvalidOperandCount,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Binary operator precedences, keyed by the operator's byte spelling. Only
/// positive entries count; everything else is "not an operator".
#[derive(Debug, Clone)]
pub struct PrecedenceTable(HashMap<u8, u32>);

impl PrecedenceTable {
    /// The built-in operators. 1 is the lowest precedence; assignment binds
    /// below all arithmetic.
    pub fn standard() -> Self {
        Self(HashMap::from([
            (b'=', 2),
            (b'<', 10),
            (b'+', 20),
            (b'-', 20),
            (b'*', 40),
        ]))
    }

    pub fn precedence(&self, op: u8) -> Option<u32> {
        self.0.get(&op).copied().filter(|&prec| prec > 0)
    }

    pub fn install(&mut self, op: u8, precedence: u32) {
        self.0.insert(op, precedence);
    }

    pub fn retract(&mut self, op: u8) {
        self.0.remove(&op);
    }
}

impl Default for PrecedenceTable {
    fn default() -> Self {
        Self::standard()
    }
}

pub struct Parser<R> {
    lexer: Lexer<R>,
    /// Current token; filled lazily so the driver can prompt before the
    /// first blocking read.
    cur: Option<Token>,
    ops: PrecedenceTable,
}

impl<R: Read> Parser<R> {
    pub fn new(lexer: Lexer<R>) -> Self {
        Self {
            lexer,
            cur: None,
            ops: PrecedenceTable::standard(),
        }
    }

    /// The token under the cursor, reading it from the lexer on first use.
    pub fn current(&mut self) -> &Token {
        if self.cur.is_none() {
            self.cur = Some(self.lexer.next_token());
        }
        match &self.cur {
            Some(token) => token,
            None => &Token::Eof,
        }
    }

    /// Consume the current token.
    pub fn advance(&mut self) {
        self.cur = Some(self.lexer.next_token());
    }

    pub fn ops(&self) -> &PrecedenceTable {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut PrecedenceTable {
        &mut self.ops
    }

    /// definition ::= 'def' prototype expression
    pub fn parse_definition(&mut self) -> ParseResult<ast::Function> {
        self.advance(); // eat 'def'
        let proto = self.parse_prototype()?;
        let body = self.parse_expression()?;
        Ok(ast::Function { proto, body })
    }

    /// external ::= 'extern' prototype
    pub fn parse_extern(&mut self) -> ParseResult<Prototype> {
        self.advance(); // eat 'extern'
        self.parse_prototype()
    }

    /// toplevel ::= expression, wrapped in an anonymous nullary function.
    pub fn parse_top_level_expr(&mut self) -> ParseResult<ast::Function> {
        let body = self.parse_expression()?;
        let proto = Prototype {
            name: String::from(ANONYMOUS_FUNCTION_NAME),
            params: Vec::new(),
            kind: PrototypeKind::Regular,
            precedence: 0,
        };
        Ok(ast::Function { proto, body })
    }

    /// expression ::= unary binoprhs
    pub fn parse_expression(&mut self) -> ParseResult<Expr> {
        let lhs = self.parse_unary()?;
        self.parse_bin_rhs(0, lhs)
    }

    /// Precedence of the current token if it is a registered binary
    /// operator.
    fn current_binop(&mut self) -> Option<(u8, u32)> {
        let op = match self.current() {
            Token::Char(c) => *c,
            _ => return None,
        };
        self.ops.precedence(op).map(|prec| (op, prec))
    }

    /// binoprhs ::= (binop unary)*
    ///
    /// Precedence climbing: operators below `min_prec` end the sequence; a
    /// following operator that binds tighter takes the freshly parsed
    /// operand as its own left-hand side first.
    fn parse_bin_rhs(&mut self, min_prec: u32, mut lhs: Expr) -> ParseResult<Expr> {
        loop {
            let Some((op, prec)) = self.current_binop() else {
                return Ok(lhs);
            };
            if prec < min_prec {
                return Ok(lhs);
            }
            self.advance(); // eat the operator

            let mut rhs = self.parse_unary()?;

            if let Some((_, next_prec)) = self.current_binop() {
                if prec < next_prec {
                    rhs = self.parse_bin_rhs(prec + 1, rhs)?;
                }
            }

            lhs = Expr::Binary(Box::new(ast::Binary { op, lhs, rhs }));
        }
    }

    /// unary ::= primary | CHAR unary, where CHAR is neither '(' nor ','.
    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = match self.current() {
            Token::Char(c) if *c != b'(' && *c != b',' => *c,
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary(Box::new(ast::Unary { op, operand })))
    }

    /// primary ::= number | identifierexpr | parenexpr | ifexpr | forexpr
    ///           | varexpr
    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.current().clone() {
            Token::Number(value) => {
                self.advance();
                Ok(Expr::Number(value))
            }
            Token::Ident(name) => self.parse_identifier_expr(name),
            Token::Char(b'(') => self.parse_paren_expr(),
            Token::If => self.parse_if_expr(),
            Token::For => self.parse_for_expr(),
            Token::Var => self.parse_var_expr(),
            _ => Err(ParseError::ExpectedExpression),
        }
    }

    /// parenexpr ::= '(' expression ')'
    fn parse_paren_expr(&mut self) -> ParseResult<Expr> {
        self.advance(); // eat '('
        let inner = self.parse_expression()?;
        if self.current() != &Token::Char(b')') {
            return Err(ParseError::ExpectedCloseParen);
        }
        self.advance(); // eat ')'
        Ok(inner)
    }

    /// identifierexpr ::= identifier | identifier '(' expression* ')'
    fn parse_identifier_expr(&mut self, name: String) -> ParseResult<Expr> {
        self.advance(); // eat the identifier

        if self.current() != &Token::Char(b'(') {
            return Ok(Expr::Variable(name));
        }

        self.advance(); // eat '('
        let mut args = Vec::new();
        if self.current() != &Token::Char(b')') {
            loop {
                args.push(self.parse_expression()?);
                if self.current() == &Token::Char(b')') {
                    break;
                }
                if self.current() != &Token::Char(b',') {
                    return Err(ParseError::ExpectedArgumentList);
                }
                self.advance();
            }
        }
        self.advance(); // eat ')'

        Ok(Expr::Call { callee: name, args })
    }

    /// ifexpr ::= 'if' expression 'then' expression 'else' expression
    fn parse_if_expr(&mut self) -> ParseResult<Expr> {
        self.advance(); // eat 'if'

        let cond = self.parse_expression()?;

        if self.current() != &Token::Then {
            return Err(ParseError::ExpectedThen);
        }
        self.advance(); // eat 'then'

        let then = self.parse_expression()?;

        if self.current() != &Token::Else {
            return Err(ParseError::ExpectedElse);
        }
        self.advance(); // eat 'else'

        let otherwise = self.parse_expression()?;

        Ok(Expr::If(Box::new(ast::If {
            cond,
            then,
            otherwise,
        })))
    }

    /// forexpr ::= 'for' identifier '=' expression ',' expression
    ///             (',' expression)? 'in' expression
    fn parse_for_expr(&mut self) -> ParseResult<Expr> {
        self.advance(); // eat 'for'

        let Token::Ident(var) = self.current().clone() else {
            return Err(ParseError::ExpectedForIdentifier);
        };
        self.advance();

        if self.current() != &Token::Char(b'=') {
            return Err(ParseError::ExpectedForAssignment);
        }
        self.advance();

        let start = self.parse_expression()?;
        if self.current() != &Token::Char(b',') {
            return Err(ParseError::ExpectedForComma);
        }
        self.advance();

        let end = self.parse_expression()?;

        let step = if self.current() == &Token::Char(b',') {
            self.advance();
            Some(self.parse_expression()?)
        } else {
            None
        };

        if self.current() != &Token::In {
            return Err(ParseError::ExpectedForIn);
        }
        self.advance();

        let body = self.parse_expression()?;

        Ok(Expr::For(Box::new(ast::For {
            var,
            start,
            end,
            step,
            body,
        })))
    }

    /// varexpr ::= 'var' identifier ('=' expression)?
    ///             (',' identifier ('=' expression)?)* 'in' expression
    fn parse_var_expr(&mut self) -> ParseResult<Expr> {
        self.advance(); // eat 'var'

        if !matches!(self.current(), Token::Ident(_)) {
            return Err(ParseError::ExpectedVarIdentifier);
        }

        let mut bindings = Vec::new();
        loop {
            let Token::Ident(name) = self.current().clone() else {
                return Err(ParseError::ExpectedVarIdentifierList);
            };
            self.advance();

            let init = if self.current() == &Token::Char(b'=') {
                self.advance();
                Some(self.parse_expression()?)
            } else {
                None
            };
            bindings.push((name, init));

            if self.current() != &Token::Char(b',') {
                break;
            }
            self.advance();
        }

        if self.current() != &Token::In {
            return Err(ParseError::ExpectedVarIn);
        }
        self.advance();

        let body = self.parse_expression()?;

        Ok(Expr::Var(Box::new(ast::Var { bindings, body })))
    }

    /// prototype ::= identifier '(' identifier* ')'
    ///             | 'unary' CHAR '(' identifier ')'
    ///             | 'binary' CHAR number? '(' identifier identifier ')'
    fn parse_prototype(&mut self) -> ParseResult<Prototype> {
        let (name, kind, mut precedence) = match self.current().clone() {
            Token::Ident(name) => {
                self.advance();
                (name, PrototypeKind::Regular, 0)
            }
            Token::Unary => {
                self.advance();
                let Token::Char(op) = self.current() else {
                    return Err(ParseError::ExpectedUnaryOperator);
                };
                let name = Prototype::unary_name(*op);
                self.advance();
                (name, PrototypeKind::Unary, 0)
            }
            Token::Binary => {
                self.advance();
                let Token::Char(op) = self.current() else {
                    return Err(ParseError::ExpectedBinaryOperator);
                };
                let name = Prototype::binary_name(*op);
                self.advance();
                (name, PrototypeKind::Binary, 30)
            }
            _ => return Err(ParseError::ExpectedFunctionName),
        };

        if kind == PrototypeKind::Binary {
            if let Token::Number(value) = *self.current() {
                if !(1.0..=100.0).contains(&value) {
                    return Err(ParseError::InvalidPrecedence);
                }
                precedence = value as u32;
                self.advance();
            }
        }

        if self.current() != &Token::Char(b'(') {
            return Err(ParseError::ExpectedPrototypeOpenParen);
        }

        let mut params = Vec::new();
        loop {
            self.advance();
            match self.current() {
                Token::Ident(param) => params.push(param.clone()),
                _ => break,
            }
        }
        if self.current() != &Token::Char(b')') {
            return Err(ParseError::ExpectedPrototypeCloseParen);
        }
        self.advance(); // eat ')'

        let expected = match kind {
            PrototypeKind::Regular => params.len(),
            PrototypeKind::Unary => 1,
            PrototypeKind::Binary => 2,
        };
        if params.len() != expected {
            return Err(ParseError::InvalidOperandCount);
        }

        Ok(Prototype {
            name,
            params,
            kind,
            precedence,
        })
    }
}
