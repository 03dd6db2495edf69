//! Lexer
//!
//! This module turns a byte stream into a stream of [`Token`]s. Unlike a
//! whole-input tokenizer it pulls one byte at a time from the underlying
//! reader, so it can sit directly on an interactive stdin: the driver only
//! blocks when the parser actually needs the next token.
//!
//! The lexer keeps a one-byte lookahead which starts out as a space, so
//! leading whitespace is skipped on the very first call.

use std::fmt;
use std::io::{ErrorKind, Read};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Eof,

    Def,
    Extern,
    If,
    Then,
    Else,
    For,
    In,
    Binary,
    Unary,
    Var,

    Ident(String),
    Number(f64),

    /// Any byte that is not recognized as anything else. Doubles as
    /// punctuation (`(`, `)`, `,`, `;`) and as an operator symbol.
    Char(u8),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Eof => write!(f, "end of file"),
            Token::Def => write!(f, "def"),
            Token::Extern => write!(f, "extern"),
            Token::If => write!(f, "if"),
            Token::Then => write!(f, "then"),
            Token::Else => write!(f, "else"),
            Token::For => write!(f, "for"),
            Token::In => write!(f, "in"),
            Token::Binary => write!(f, "binary"),
            Token::Unary => write!(f, "unary"),
            Token::Var => write!(f, "var"),
            Token::Ident(name) => write!(f, "{name}"),
            Token::Number(value) => write!(f, "{value}"),
            Token::Char(c) => write!(f, "{}", *c as char),
        }
    }
}

pub struct Lexer<R> {
    input: R,
    /// One-byte lookahead; `None` once the input is exhausted.
    cur: Option<u8>,
}

impl<R: Read> Lexer<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            cur: Some(b' '),
        }
    }

    fn read_char(&mut self) -> Option<u8> {
        let mut buf = [0u8];
        loop {
            match self.input.read(&mut buf) {
                Ok(0) => return None,
                Ok(_) => return Some(buf[0]),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // A failing reader behaves like end of input, as getchar does.
                Err(_) => return None,
            }
        }
    }

    pub fn next_token(&mut self) -> Token {
        while matches!(self.cur, Some(c) if c.is_ascii_whitespace()) {
            self.cur = self.read_char();
        }

        let Some(c) = self.cur else {
            return Token::Eof;
        };

        if c.is_ascii_alphabetic() {
            // identifier: [a-zA-Z][a-zA-Z0-9]*
            let mut ident = String::new();
            ident.push(c as char);
            loop {
                self.cur = self.read_char();
                match self.cur {
                    Some(c) if c.is_ascii_alphanumeric() => ident.push(c as char),
                    _ => break,
                }
            }

            return match ident.as_str() {
                "def" => Token::Def,
                "extern" => Token::Extern,
                "if" => Token::If,
                "then" => Token::Then,
                "else" => Token::Else,
                "for" => Token::For,
                "in" => Token::In,
                "binary" => Token::Binary,
                "unary" => Token::Unary,
                "var" => Token::Var,
                _ => Token::Ident(ident),
            };
        }

        if c.is_ascii_digit() || c == b'.' {
            // number: [0-9.]+
            let mut spelling = String::new();
            let mut c = c;
            loop {
                spelling.push(c as char);
                self.cur = self.read_char();
                match self.cur {
                    Some(next) if next.is_ascii_digit() || next == b'.' => c = next,
                    _ => break,
                }
            }
            return Token::Number(parse_number(&spelling));
        }

        if c == b'#' {
            // comment until end of line
            loop {
                self.cur = self.read_char();
                match self.cur {
                    None | Some(b'\n') | Some(b'\r') => break,
                    Some(_) => {}
                }
            }
            return match self.cur {
                Some(_) => self.next_token(),
                None => Token::Eof,
            };
        }

        self.cur = self.read_char();
        Token::Char(c)
    }
}

/// Value of a `[0-9.]+` spelling with strtod semantics: a spelling with more
/// than one dot is read up to the second dot, and a spelling with no digits
/// at all is 0.0.
fn parse_number(spelling: &str) -> f64 {
    match spelling.parse() {
        Ok(value) => value,
        Err(_) => {
            let prefix = match spelling.match_indices('.').nth(1) {
                Some((i, _)) => &spelling[..i],
                None => spelling,
            };
            prefix.parse().unwrap_or(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(src: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(src.as_bytes());
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token();
            if token == Token::Eof {
                return tokens;
            }
            tokens.push(token);
        }
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            tokenize("def extern if then else for in binary unary var fib x1"),
            vec![
                Token::Def,
                Token::Extern,
                Token::If,
                Token::Then,
                Token::Else,
                Token::For,
                Token::In,
                Token::Binary,
                Token::Unary,
                Token::Var,
                Token::Ident(String::from("fib")),
                Token::Ident(String::from("x1")),
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(
            tokenize("0 1.5 .25 42."),
            vec![
                Token::Number(0.0),
                Token::Number(1.5),
                Token::Number(0.25),
                Token::Number(42.0),
            ]
        );
    }

    #[test]
    fn malformed_numbers_read_like_strtod() {
        assert_eq!(
            tokenize("1.2.3 ."),
            vec![Token::Number(1.2), Token::Number(0.0)]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            tokenize("1 # the rest of this line vanishes\n2 # and a trailing comment"),
            vec![Token::Number(1.0), Token::Number(2.0)]
        );
    }

    #[test]
    fn punctuation_and_operators_are_chars() {
        assert_eq!(
            tokenize("(x, y); x<y !"),
            vec![
                Token::Char(b'('),
                Token::Ident(String::from("x")),
                Token::Char(b','),
                Token::Ident(String::from("y")),
                Token::Char(b')'),
                Token::Char(b';'),
                Token::Ident(String::from("x")),
                Token::Char(b'<'),
                Token::Ident(String::from("y")),
                Token::Char(b'!'),
            ]
        );
    }

    #[test]
    fn definition() {
        assert_eq!(
            tokenize("def fib(x) if x < 3 then 1 else fib(x-1)+fib(x-2)"),
            vec![
                Token::Def,
                Token::Ident(String::from("fib")),
                Token::Char(b'('),
                Token::Ident(String::from("x")),
                Token::Char(b')'),
                Token::If,
                Token::Ident(String::from("x")),
                Token::Char(b'<'),
                Token::Number(3.0),
                Token::Then,
                Token::Number(1.0),
                Token::Else,
                Token::Ident(String::from("fib")),
                Token::Char(b'('),
                Token::Ident(String::from("x")),
                Token::Char(b'-'),
                Token::Number(1.0),
                Token::Char(b')'),
                Token::Char(b'+'),
                Token::Ident(String::from("fib")),
                Token::Char(b'('),
                Token::Ident(String::from("x")),
                Token::Char(b'-'),
                Token::Number(2.0),
                Token::Char(b')'),
            ]
        );
    }

    #[test]
    fn eof_is_sticky() {
        let mut lexer = Lexer::new(&b"x"[..]);
        assert_eq!(lexer.next_token(), Token::Ident(String::from("x")));
        assert_eq!(lexer.next_token(), Token::Eof);
        assert_eq!(lexer.next_token(), Token::Eof);
    }
}
