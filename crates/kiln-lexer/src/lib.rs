//! Lexer for the Kiln language.
//!
//! Hand-written byte-cursor scanner that turns Kiln source into a flat
//! `Vec<Token>`. Every token carries its 1-based source line, its byte span
//! and a `first_on_line` flag (true for the first token after a newline);
//! the parser's error recovery keys off that flag to find statement
//! boundaries without a dedicated newline token.
//!
//! Numbers are IEEE-754 doubles. Radix literals (`0x` / `0b` / `0o`) cap
//! their digit counts so the value always fits a double's 53-bit mantissa
//! exactly.

use std::fmt;

use thiserror::Error;

/// Most hex digits that fit a 53-bit mantissa exactly (48 bits).
const MAX_HEX_DIGITS: usize = 12;
/// Most binary digits that fit a 53-bit mantissa exactly.
const MAX_BINARY_DIGITS: usize = 53;
/// Most octal digits that fit a 53-bit mantissa exactly (51 bits).
const MAX_OCTAL_DIGITS: usize = 17;

/// Token kinds produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Number(f64),
    Str(String),
    Ident(String),

    // Operators and delimiters
    Plus,
    PlusPlus,
    PlusAssign,
    Minus,
    MinusMinus,
    MinusAssign,
    Arrow,
    Star,
    StarAssign,
    Slash,
    SlashAssign,
    Percent,
    PercentAssign,
    Bang,
    Question,
    Assign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Dot,
    DotDot,
    DotDotDot,
    Comma,
    Colon,
    Semi,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,

    // Keywords
    And,
    Base,
    Break,
    Catch,
    Cls,
    Const,
    Ctor,
    Else,
    False,
    Fn,
    For,
    From,
    If,
    Import,
    In,
    Is,
    Let,
    Nil,
    Or,
    Print,
    Ret,
    Skip,
    Static,
    This,
    Throw,
    True,
    Try,
    While,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TokenKind::Number(n) => return write!(f, "{n}"),
            TokenKind::Str(s) => return write!(f, "\"{s}\""),
            TokenKind::Ident(name) => return write!(f, "{name}"),
            TokenKind::Plus => "+",
            TokenKind::PlusPlus => "++",
            TokenKind::PlusAssign => "+=",
            TokenKind::Minus => "-",
            TokenKind::MinusMinus => "--",
            TokenKind::MinusAssign => "-=",
            TokenKind::Arrow => "->",
            TokenKind::Star => "*",
            TokenKind::StarAssign => "*=",
            TokenKind::Slash => "/",
            TokenKind::SlashAssign => "/=",
            TokenKind::Percent => "%",
            TokenKind::PercentAssign => "%=",
            TokenKind::Bang => "!",
            TokenKind::Question => "?",
            TokenKind::Assign => "=",
            TokenKind::Eq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::Dot => ".",
            TokenKind::DotDot => "..",
            TokenKind::DotDotDot => "...",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Semi => ";",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::And => "and",
            TokenKind::Base => "base",
            TokenKind::Break => "break",
            TokenKind::Catch => "catch",
            TokenKind::Cls => "cls",
            TokenKind::Const => "const",
            TokenKind::Ctor => "ctor",
            TokenKind::Else => "else",
            TokenKind::False => "false",
            TokenKind::Fn => "fn",
            TokenKind::For => "for",
            TokenKind::From => "from",
            TokenKind::If => "if",
            TokenKind::Import => "import",
            TokenKind::In => "in",
            TokenKind::Is => "is",
            TokenKind::Let => "let",
            TokenKind::Nil => "nil",
            TokenKind::Or => "or",
            TokenKind::Print => "print",
            TokenKind::Ret => "ret",
            TokenKind::Skip => "skip",
            TokenKind::Static => "static",
            TokenKind::This => "this",
            TokenKind::Throw => "throw",
            TokenKind::True => "true",
            TokenKind::Try => "try",
            TokenKind::While => "while",
            TokenKind::Eof => "end of file",
        };
        f.write_str(text)
    }
}

/// A token with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// 1-based line of the token's first character.
    pub line: u32,
    /// Byte span `(start, end)` into the source, end exclusive.
    pub span: (u32, u32),
    /// True for the first token after a newline.
    pub first_on_line: bool,
}

/// Lexer error with position information.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{line}:{col}: {message}")]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub col: u32,
    /// Byte span of the offending text.
    pub span: (u32, u32),
}

/// Lex `source` into a token stream. The stream always ends with `Eof`.
pub fn lex(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}

struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    /// Byte offset where the current token started.
    start: usize,
    /// Line where the current token started (strings may span lines).
    start_line: u32,
    /// Set when skipping a newline, consumed by the next pushed token.
    first_on_line: bool,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            source: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            start: 0,
            start_line: 1,
            first_on_line: false,
            tokens: Vec::new(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        loop {
            self.first_on_line = false;
            self.skip_whitespace();
            self.start = self.pos;
            self.start_line = self.line;
            let Some(c) = self.peek() else { break };
            match c {
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_ident(),
                b'0'..=b'9' => self.lex_number()?,
                b'"' => self.lex_string()?,
                _ => self.lex_operator()?,
            }
        }
        self.start = self.pos;
        self.start_line = self.line;
        self.push(TokenKind::Eof);
        Ok(self.tokens)
    }

    // ─── Cursor helpers ───

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    /// Consume the next byte if it equals `expected`.
    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn push(&mut self, kind: TokenKind) {
        self.tokens.push(Token {
            kind,
            line: self.start_line,
            span: (self.start as u32, self.pos as u32),
            first_on_line: self.first_on_line,
        });
        self.first_on_line = false;
    }

    fn err(&self, message: impl Into<String>) -> LexError {
        LexError {
            message: message.into(),
            line: self.line,
            col: self.col,
            span: (self.start as u32, self.pos as u32),
        }
    }

    // ─── Scanners ───

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' => {
                    self.advance();
                }
                b'\n' => {
                    self.first_on_line = true;
                    self.advance();
                }
                b'/' if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_ident(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.advance();
            } else {
                break;
            }
        }
        let text = &self.source[self.start..self.pos];
        let kind = match text {
            b"and" => TokenKind::And,
            b"base" => TokenKind::Base,
            b"break" => TokenKind::Break,
            b"catch" => TokenKind::Catch,
            b"cls" => TokenKind::Cls,
            b"const" => TokenKind::Const,
            b"ctor" => TokenKind::Ctor,
            b"else" => TokenKind::Else,
            b"false" => TokenKind::False,
            b"fn" => TokenKind::Fn,
            b"for" => TokenKind::For,
            b"from" => TokenKind::From,
            b"if" => TokenKind::If,
            b"import" => TokenKind::Import,
            b"in" => TokenKind::In,
            b"is" => TokenKind::Is,
            b"let" => TokenKind::Let,
            b"nil" => TokenKind::Nil,
            b"or" => TokenKind::Or,
            b"print" => TokenKind::Print,
            b"ret" => TokenKind::Ret,
            b"skip" => TokenKind::Skip,
            b"static" => TokenKind::Static,
            b"this" => TokenKind::This,
            b"throw" => TokenKind::Throw,
            b"true" => TokenKind::True,
            b"try" => TokenKind::Try,
            b"while" => TokenKind::While,
            _ => TokenKind::Ident(String::from_utf8_lossy(text).into_owned()),
        };
        self.push(kind);
    }

    fn lex_number(&mut self) -> Result<(), LexError> {
        if self.peek() == Some(b'0') {
            match self.peek_at(1) {
                Some(b'x' | b'X') => {
                    return self.lex_radix_int(
                        16,
                        MAX_HEX_DIGITS,
                        is_hex_digit,
                        "Hexadecimal number literal must have at least one digit/letter and at most 12.",
                    );
                }
                Some(b'b' | b'B') => {
                    return self.lex_radix_int(
                        2,
                        MAX_BINARY_DIGITS,
                        is_binary_digit,
                        "Binary number literal must have at least one digit and at most 53.",
                    );
                }
                Some(b'o' | b'O') => {
                    return self.lex_radix_int(
                        8,
                        MAX_OCTAL_DIGITS,
                        is_octal_digit,
                        "Octal number literal must have at least one digit and at most 17.",
                    );
                }
                _ => {}
            }
        }

        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.advance();
        }
        // A fraction needs a digit after the dot; `1.x` is member access
        // and `1..5` is a range.
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9')) {
            self.advance();
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.advance();
            }
        }

        let text = String::from_utf8_lossy(&self.source[self.start..self.pos]);
        let value: f64 = text
            .parse()
            .map_err(|_| self.err(format!("invalid number literal '{text}'")))?;
        self.push(TokenKind::Number(value));
        Ok(())
    }

    /// Scan a radix-prefixed integer literal (`0x`, `0b`, `0o` already
    /// peeked). The digit-count cap keeps the value exact as a double.
    fn lex_radix_int(
        &mut self,
        radix: u32,
        max_digits: usize,
        valid: fn(u8) -> bool,
        cap_msg: &str,
    ) -> Result<(), LexError> {
        self.advance(); // 0
        self.advance(); // x / b / o
        let digits_start = self.pos;
        while let Some(c) = self.peek() {
            if valid(c) {
                self.advance();
            } else {
                break;
            }
        }
        let num_digits = self.pos - digits_start;
        if num_digits == 0 || num_digits > max_digits {
            return Err(self.err(cap_msg));
        }
        let text = String::from_utf8_lossy(&self.source[digits_start..self.pos]);
        let value = u64::from_str_radix(&text, radix)
            .map_err(|_| self.err(format!("invalid number literal '{text}'")))?;
        self.push(TokenKind::Number(value as f64));
        Ok(())
    }

    fn lex_string(&mut self) -> Result<(), LexError> {
        self.advance(); // opening quote
        let mut bytes = Vec::new();
        loop {
            let Some(c) = self.advance() else {
                return Err(self.err("Unterminated string."));
            };
            match c {
                b'"' => break,
                b'\\' => {
                    let Some(esc) = self.advance() else {
                        return Err(self.err("Unterminated string."));
                    };
                    match esc {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        b'0' => bytes.push(b'\0'),
                        // Any other escaped byte passes through, so `\"`
                        // and `\\` fall out of this arm too.
                        other => bytes.push(other),
                    }
                }
                _ => bytes.push(c),
            }
        }
        self.push(TokenKind::Str(String::from_utf8_lossy(&bytes).into_owned()));
        Ok(())
    }

    fn lex_operator(&mut self) -> Result<(), LexError> {
        let Some(c) = self.advance() else {
            return Ok(());
        };
        let kind = match c {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b':' => TokenKind::Colon,
            b';' => TokenKind::Semi,
            b'?' => TokenKind::Question,
            b'.' => {
                if self.eat(b'.') {
                    if self.eat(b'.') {
                        TokenKind::DotDotDot
                    } else {
                        TokenKind::DotDot
                    }
                } else {
                    TokenKind::Dot
                }
            }
            b'+' => {
                if self.eat(b'=') {
                    TokenKind::PlusAssign
                } else if self.eat(b'+') {
                    TokenKind::PlusPlus
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                if self.eat(b'>') {
                    TokenKind::Arrow
                } else if self.eat(b'-') {
                    TokenKind::MinusMinus
                } else if self.eat(b'=') {
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => {
                if self.eat(b'=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            b'/' => {
                if self.eat(b'=') {
                    TokenKind::SlashAssign
                } else {
                    TokenKind::Slash
                }
            }
            b'%' => {
                if self.eat(b'=') {
                    TokenKind::PercentAssign
                } else {
                    TokenKind::Percent
                }
            }
            b'=' => {
                if self.eat(b'=') {
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                }
            }
            b'!' => {
                if self.eat(b'=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            b'<' => {
                if self.eat(b'=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.eat(b'=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            other => {
                return Err(self.err(format!("unexpected character '{}'", other as char)));
            }
        };
        self.push(kind);
        Ok(())
    }
}

fn is_hex_digit(c: u8) -> bool {
    c.is_ascii_hexdigit()
}

fn is_binary_digit(c: u8) -> bool {
    c == b'0' || c == b'1'
}

fn is_octal_digit(c: u8) -> bool {
    (b'0'..=b'7').contains(&c)
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
