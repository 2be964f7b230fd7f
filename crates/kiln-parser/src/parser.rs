//! Recursive-descent parser for Kiln.
//!
//! One token of lookahead everywhere except the lambda ambiguity at `(`,
//! which is resolved by scanning ahead with a raw cursor for `) ->`.
//!
//! On an error the parser records it and synchronises to the next
//! statement boundary: just past a `;`, at a `}`, or at a token flagged
//! `first_on_line` that can start a statement. One parse therefore
//! reports every error in the file, not only the first.

use kiln_lexer::{Token, TokenKind};
use thiserror::Error;

use crate::ast::{BinOp, ClassDecl, Expr, ExprKind, FnDecl, LogicalOp, Program, Stmt, UnaryOp};

/// Parse error with position information.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    /// Byte span of the offending token.
    pub span: (u32, u32),
}

/// Parse a token stream into a program. All errors found in the pass are
/// returned together.
pub fn parse(tokens: Vec<Token>) -> Result<Program, Vec<ParseError>> {
    Parser::new(tokens).run()
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<ParseError>,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Program, Vec<ParseError>> {
        let mut program = Vec::new();
        while !self.at_eof() {
            match self.parse_stmt() {
                Ok(stmt) => program.push(stmt),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }
        if self.errors.is_empty() {
            Ok(program)
        } else {
            Err(self.errors)
        }
    }

    // ─── Cursor helpers ───

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn prev(&self) -> &Token {
        &self.tokens[self.pos - 1]
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    /// Consume and return the current token. Never moves past `Eof`.
    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        token
    }

    /// Consume the current token if it matches `kind`.
    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, ctx: &str) -> Result<(), ParseError> {
        if self.at(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected '{kind}' {ctx}, found {}", self.peek_kind())))
        }
    }

    fn expect_semi(&mut self, ctx: &str) -> Result<(), ParseError> {
        self.expect(TokenKind::Semi, ctx)
    }

    fn expect_ident(&mut self, ctx: &str) -> Result<String, ParseError> {
        if let TokenKind::Ident(name) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error(format!("expected identifier {ctx}, found {}", self.peek_kind())))
        }
    }

    fn expect_string(&mut self, ctx: &str) -> Result<String, ParseError> {
        if let TokenKind::Str(text) = self.peek_kind() {
            let text = text.clone();
            self.advance();
            Ok(text)
        } else {
            Err(self.error(format!("expected string {ctx}, found {}", self.peek_kind())))
        }
    }

    /// Build a parse error at the current token.
    fn error(&self, message: impl Into<String>) -> ParseError {
        let token = self.peek();
        ParseError {
            message: message.into(),
            line: token.line,
            span: token.span,
        }
    }

    /// Skip tokens until a likely statement boundary.
    fn synchronize(&mut self) {
        while !self.at_eof() {
            if self.pos > 0 && matches!(self.prev().kind, TokenKind::Semi) {
                return;
            }
            let token = self.peek();
            if matches!(token.kind, TokenKind::RBrace) {
                return;
            }
            if token.first_on_line && starts_stmt(&token.kind) {
                return;
            }
            self.advance();
        }
    }

    // ─── Statements ───

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.peek_kind() {
            TokenKind::Let => self.parse_let(),
            TokenKind::Const => self.parse_const(),
            TokenKind::Fn => Ok(Stmt::Fn(self.parse_fn()?)),
            TokenKind::Cls => self.parse_class(),
            TokenKind::Print => self.parse_print(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::LBrace => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::Ret => self.parse_ret(),
            TokenKind::Break => {
                let line = self.peek().line;
                self.advance();
                self.expect_semi("after 'break'")?;
                Ok(Stmt::Break { line })
            }
            TokenKind::Skip => {
                let line = self.peek().line;
                self.advance();
                self.expect_semi("after 'skip'")?;
                Ok(Stmt::Skip { line })
            }
            TokenKind::Throw => {
                let line = self.peek().line;
                self.advance();
                let value = self.parse_expr()?;
                self.expect_semi("after throw value")?;
                Ok(Stmt::Throw { value, line })
            }
            TokenKind::Try => self.parse_try(),
            TokenKind::Import => self.parse_import(),
            TokenKind::From => self.parse_from_import(),
            _ => {
                let expr = self.parse_expr()?;
                self.expect_semi("after expression")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_let(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        let name = self.expect_ident("after 'let'")?;
        let init = if self.eat(&TokenKind::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect_semi("after let declaration")?;
        Ok(Stmt::Let { name, init, line })
    }

    fn parse_const(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        let name = self.expect_ident("after 'const'")?;
        self.expect(TokenKind::Assign, "after const name")?;
        let init = self.parse_expr()?;
        self.expect_semi("after const declaration")?;
        Ok(Stmt::Const { name, init, line })
    }

    fn parse_fn(&mut self) -> Result<FnDecl, ParseError> {
        let line = self.peek().line;
        self.advance();
        let name = self.expect_ident("after 'fn'")?;
        let params = self.parse_params()?;
        let body = self.parse_block()?;
        Ok(FnDecl {
            name,
            params,
            body,
            line,
        })
    }

    fn parse_params(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(TokenKind::LParen, "before parameters")?;
        let mut params = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                params.push(self.expect_ident("in parameter list")?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        if params.len() > 255 {
            return Err(self.error("cannot have more than 255 parameters"));
        }
        self.expect(TokenKind::RParen, "after parameters")?;
        Ok(params)
    }

    fn parse_class(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        let name = self.expect_ident("after 'cls'")?;
        let superclass = if self.eat(&TokenKind::Colon) {
            Some(self.expect_ident("after ':'")?)
        } else {
            None
        };
        self.expect(TokenKind::LBrace, "before class body")?;

        let mut ctor: Option<FnDecl> = None;
        let mut methods: Vec<FnDecl> = Vec::new();
        let mut statics: Vec<FnDecl> = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at_eof() {
            if self.at(&TokenKind::Ctor) {
                let member_line = self.peek().line;
                self.advance();
                if ctor.is_some() {
                    return Err(self.error(format!("class '{name}' already has a ctor")));
                }
                let params = self.parse_params()?;
                let body = self.parse_block()?;
                ctor = Some(FnDecl {
                    name: "ctor".to_string(),
                    params,
                    body,
                    line: member_line,
                });
            } else if self.at(&TokenKind::Static) {
                self.advance();
                let member_line = self.peek().line;
                let method_name = self.expect_ident("after 'static'")?;
                if is_duplicate_member(&method_name, &methods, &statics) {
                    return Err(
                        self.error(format!("duplicate method '{method_name}' in class '{name}'"))
                    );
                }
                let params = self.parse_params()?;
                let body = self.parse_block()?;
                statics.push(FnDecl {
                    name: method_name,
                    params,
                    body,
                    line: member_line,
                });
            } else {
                let member_line = self.peek().line;
                let method_name = self.expect_ident("in class body")?;
                if is_duplicate_member(&method_name, &methods, &statics) {
                    return Err(
                        self.error(format!("duplicate method '{method_name}' in class '{name}'"))
                    );
                }
                let params = self.parse_params()?;
                let body = self.parse_block()?;
                methods.push(FnDecl {
                    name: method_name,
                    params,
                    body,
                    line: member_line,
                });
            }
        }
        self.expect(TokenKind::RBrace, "after class body")?;

        Ok(Stmt::Class(ClassDecl {
            name,
            superclass,
            ctor,
            methods,
            statics,
            line,
        }))
    }

    fn parse_print(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        let expr = self.parse_expr()?;
        self.expect_semi("after print value")?;
        Ok(Stmt::Print { expr, line })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        self.expect(TokenKind::LParen, "after 'if'")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen, "after if condition")?;
        let then_branch = Box::new(self.parse_stmt()?);
        let else_branch = if self.eat(&TokenKind::Else) {
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        self.expect(TokenKind::LParen, "after 'while'")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen, "after while condition")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::While { cond, body, line })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        self.expect(TokenKind::LParen, "after 'for'")?;
        let var = self.expect_ident("after '('")?;
        self.expect(TokenKind::In, "after for variable")?;
        let iter = self.parse_expr()?;
        self.expect(TokenKind::RParen, "after for iterable")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::ForIn {
            var,
            iter,
            body,
            line,
        })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(TokenKind::LBrace, "before block")?;
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at_eof() {
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }
        self.expect(TokenKind::RBrace, "after block")?;
        Ok(stmts)
    }

    fn parse_ret(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        let value = if self.at(&TokenKind::Semi) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect_semi("after return value")?;
        Ok(Stmt::Ret { value, line })
    }

    fn parse_try(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        let body = self.parse_block()?;
        self.expect(TokenKind::Catch, "after try block")?;
        self.expect(TokenKind::LParen, "after 'catch'")?;
        let catch_name = self.expect_ident("after '('")?;
        self.expect(TokenKind::RParen, "after catch variable")?;
        let catch_body = self.parse_block()?;
        Ok(Stmt::Try {
            body,
            catch_name,
            catch_body,
            line,
        })
    }

    fn parse_import(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        let path = self.expect_string("after 'import'")?;
        self.expect_semi("after import path")?;
        Ok(Stmt::Import { path, line })
    }

    fn parse_from_import(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance();
        let path = self.expect_string("after 'from'")?;
        self.expect(TokenKind::Import, "after module path")?;
        let mut names = vec![self.expect_ident("after 'import'")?];
        while self.eat(&TokenKind::Comma) {
            names.push(self.expect_ident("after ','")?);
        }
        self.expect_semi("after import list")?;
        Ok(Stmt::FromImport { path, names, line })
    }

    // ─── Expressions ───

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assignment()
    }

    /// Prec 1: assignment, right-associative. Lowest.
    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_ternary()?;
        let op = match self.peek_kind() {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinOp::Add),
            TokenKind::MinusAssign => Some(BinOp::Sub),
            TokenKind::StarAssign => Some(BinOp::Mul),
            TokenKind::SlashAssign => Some(BinOp::Div),
            TokenKind::PercentAssign => Some(BinOp::Mod),
            _ => return Ok(expr),
        };
        let op_token = self.advance();
        let value = Box::new(self.parse_assignment()?);
        let line = expr.line;
        match expr.kind {
            ExprKind::Ident(name) => Ok(Expr::new(ExprKind::Assign { name, op, value }, line)),
            ExprKind::Member { target, field } => Ok(Expr::new(
                ExprKind::MemberAssign {
                    target,
                    field,
                    op,
                    value,
                },
                line,
            )),
            ExprKind::Index { target, index } => Ok(Expr::new(
                ExprKind::IndexAssign {
                    target,
                    index,
                    op,
                    value,
                },
                line,
            )),
            _ => Err(ParseError {
                message: "invalid assignment target".to_string(),
                line: op_token.line,
                span: op_token.span,
            }),
        }
    }

    /// Prec 2: ternary `cond ? a : b`, right-associative.
    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if !self.eat(&TokenKind::Question) {
            return Ok(cond);
        }
        let then_expr = Box::new(self.parse_expr()?);
        self.expect(TokenKind::Colon, "in ternary expression")?;
        let else_expr = Box::new(self.parse_ternary()?);
        let line = cond.line;
        Ok(Expr::new(
            ExprKind::Ternary {
                cond: Box::new(cond),
                then_expr,
                else_expr,
            },
            line,
        ))
    }

    /// Prec 3: `or`, short-circuiting.
    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_and()?;
            let line = left.line;
            left = Expr::new(
                ExprKind::Logical {
                    op: LogicalOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    /// Prec 4: `and`, short-circuiting.
    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_equality()?;
            let line = left.line;
            left = Expr::new(
                ExprKind::Logical {
                    op: LogicalOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    /// Prec 5: `==` `!=`.
    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Eq => BinOp::Eq,
                TokenKind::NotEq => BinOp::NotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
    }

    /// Prec 6: `<` `>` `<=` `>=` `is` `in`.
    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_range()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::LtEq => BinOp::LtEq,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::GtEq => BinOp::GtEq,
                TokenKind::Is => BinOp::Is,
                TokenKind::In => BinOp::In,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_range()?;
            left = binary(op, left, right);
        }
    }

    /// Prec 7: `..` `...`, non-associative.
    fn parse_range(&mut self) -> Result<Expr, ParseError> {
        let start = self.parse_term()?;
        let inclusive = match self.peek_kind() {
            TokenKind::DotDot => false,
            TokenKind::DotDotDot => true,
            _ => return Ok(start),
        };
        self.advance();
        let end = Box::new(self.parse_term()?);
        let line = start.line;
        Ok(Expr::new(
            ExprKind::Range {
                start: Box::new(start),
                end,
                inclusive,
            },
            line,
        ))
    }

    /// Prec 8: `+` `-`.
    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_factor()?;
            left = binary(op, left, right);
        }
    }

    /// Prec 9: `*` `/` `%`.
    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    /// Prec 10: unary `!` `-` and prefix `++` `--`.
    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let line = self.peek().line;
        let op = match self.peek_kind() {
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = Box::new(self.parse_unary()?);
            return Ok(Expr::new(ExprKind::Unary { op, operand }, line));
        }
        if matches!(self.peek_kind(), TokenKind::PlusPlus | TokenKind::MinusMinus) {
            let dec = matches!(self.peek_kind(), TokenKind::MinusMinus);
            self.advance();
            let target = self.parse_unary()?;
            self.check_incdec_target(&target, dec)?;
            return Ok(Expr::new(
                ExprKind::IncDec {
                    target: Box::new(target),
                    dec,
                    postfix: false,
                },
                line,
            ));
        }
        self.parse_postfix()
    }

    /// Prec 11: postfix call / member / index / `++` / `--`.
    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_args()?;
                    let line = expr.line;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        line,
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let field = self.expect_ident("after '.'")?;
                    let line = expr.line;
                    expr = Expr::new(
                        ExprKind::Member {
                            target: Box::new(expr),
                            field,
                        },
                        line,
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "after index")?;
                    let line = expr.line;
                    expr = Expr::new(
                        ExprKind::Index {
                            target: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                    );
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let dec = matches!(self.peek_kind(), TokenKind::MinusMinus);
                    self.advance();
                    self.check_incdec_target(&expr, dec)?;
                    let line = expr.line;
                    expr = Expr::new(
                        ExprKind::IncDec {
                            target: Box::new(expr),
                            dec,
                            postfix: true,
                        },
                        line,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        if args.len() > 255 {
            return Err(self.error("cannot have more than 255 arguments"));
        }
        self.expect(TokenKind::RParen, "after arguments")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek_kind(), TokenKind::LParen) && self.lambda_ahead() {
            return self.parse_lambda();
        }
        let token = self.advance();
        let line = token.line;
        let kind = match token.kind {
            TokenKind::Number(value) => ExprKind::Number(value),
            TokenKind::Str(value) => ExprKind::Str(value),
            TokenKind::True => ExprKind::Bool(true),
            TokenKind::False => ExprKind::Bool(false),
            TokenKind::Nil => ExprKind::Nil,
            TokenKind::Ident(name) => ExprKind::Ident(name),
            TokenKind::This => ExprKind::This,
            TokenKind::Base => {
                self.expect(TokenKind::Dot, "after 'base'")?;
                let method = self.expect_ident("after 'base.'")?;
                ExprKind::Base { method }
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if !self.at(&TokenKind::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket, "after array elements")?;
                ExprKind::Array(items)
            }
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "after expression")?;
                return Ok(inner);
            }
            other => {
                return Err(ParseError {
                    message: format!("expected expression, found {other}"),
                    line,
                    span: token.span,
                });
            }
        };
        Ok(Expr::new(kind, line))
    }

    fn parse_lambda(&mut self) -> Result<Expr, ParseError> {
        let line = self.peek().line;
        let params = self.parse_params()?;
        self.expect(TokenKind::Arrow, "after lambda parameters")?;
        let body = if self.at(&TokenKind::LBrace) {
            self.parse_block()?
        } else {
            let value = self.parse_expr()?;
            let value_line = value.line;
            vec![Stmt::Ret {
                value: Some(value),
                line: value_line,
            }]
        };
        Ok(Expr::new(ExprKind::Lambda { params, body }, line))
    }

    /// Decide whether a `(` at the cursor starts a lambda. True only for
    /// `()` or `( ident (, ident)* )` immediately followed by `->`.
    fn lambda_ahead(&self) -> bool {
        let mut cur = LookaheadCursor::new(&self.tokens, self.pos);
        if !cur.eat(|k| matches!(k, TokenKind::LParen)) {
            return false;
        }
        if !cur.eat(|k| matches!(k, TokenKind::RParen)) {
            loop {
                if !cur.eat(|k| matches!(k, TokenKind::Ident(_))) {
                    return false;
                }
                if !cur.eat(|k| matches!(k, TokenKind::Comma)) {
                    break;
                }
            }
            if !cur.eat(|k| matches!(k, TokenKind::RParen)) {
                return false;
            }
        }
        cur.at(|k| matches!(k, TokenKind::Arrow))
    }

    fn check_incdec_target(&self, target: &Expr, dec: bool) -> Result<(), ParseError> {
        match target.kind {
            ExprKind::Ident(_) | ExprKind::Member { .. } | ExprKind::Index { .. } => Ok(()),
            _ => Err(self.error(format!(
                "invalid target for '{}'",
                if dec { "--" } else { "++" }
            ))),
        }
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    let line = left.line;
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        line,
    )
}

fn is_duplicate_member(name: &str, methods: &[FnDecl], statics: &[FnDecl]) -> bool {
    methods.iter().any(|m| m.name == name) || statics.iter().any(|m| m.name == name)
}

fn starts_stmt(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Let
            | TokenKind::Const
            | TokenKind::Fn
            | TokenKind::Cls
            | TokenKind::Print
            | TokenKind::If
            | TokenKind::While
            | TokenKind::For
            | TokenKind::Ret
            | TokenKind::Break
            | TokenKind::Skip
            | TokenKind::Throw
            | TokenKind::Try
            | TokenKind::Import
            | TokenKind::From
            | TokenKind::LBrace
    )
}

/// Raw token cursor for speculative lookahead. Never consumes from the
/// parser itself.
struct LookaheadCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> LookaheadCursor<'a> {
    fn new(tokens: &'a [Token], pos: usize) -> Self {
        LookaheadCursor { tokens, pos }
    }

    fn at(&self, pred: impl Fn(&TokenKind) -> bool) -> bool {
        self.tokens.get(self.pos).is_some_and(|t| pred(&t.kind))
    }

    fn eat(&mut self, pred: impl Fn(&TokenKind) -> bool) -> bool {
        if self.at(&pred) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(input: &str) -> Result<Program, Vec<ParseError>> {
        parse(kiln_lexer::lex(input).expect("lex failure"))
    }

    fn parse_one(input: &str) -> Stmt {
        let mut program = parse_str(input).expect("parse failure");
        assert_eq!(program.len(), 1, "expected exactly one statement");
        program.remove(0)
    }

    fn parse_expr_str(input: &str) -> Expr {
        match parse_one(&format!("{input};")) {
            Stmt::Expr(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    fn first_error(input: &str) -> ParseError {
        parse_str(input).expect_err("expected parse failure").remove(0)
    }

    #[test]
    fn let_with_initialiser() {
        let Stmt::Let { name, init, line } = parse_one("let x = 42;") else {
            panic!("expected let");
        };
        assert_eq!(name, "x");
        assert_eq!(line, 1);
        assert_eq!(init.unwrap().kind, ExprKind::Number(42.0));
    }

    #[test]
    fn let_without_initialiser() {
        let Stmt::Let { init, .. } = parse_one("let x;") else {
            panic!("expected let");
        };
        assert!(init.is_none());
    }

    #[test]
    fn const_requires_initialiser() {
        let err = first_error("const x;");
        assert!(err.message.contains("expected '='"), "{}", err.message);
        let Stmt::Const { name, init, .. } = parse_one("const x = 1;") else {
            panic!("expected const");
        };
        assert_eq!(name, "x");
        assert_eq!(init.kind, ExprKind::Number(1.0));
    }

    #[test]
    fn fn_declaration() {
        let Stmt::Fn(decl) = parse_one("fn add(a, b) { ret a + b; }") else {
            panic!("expected fn");
        };
        assert_eq!(decl.name, "add");
        assert_eq!(decl.params, vec!["a", "b"]);
        assert_eq!(decl.body.len(), 1);
        assert!(matches!(decl.body[0], Stmt::Ret { value: Some(_), .. }));
    }

    #[test]
    fn class_declaration() {
        let source = "cls Point : Base {\n\
                      ctor(x, y) { this.x = x; this.y = y; }\n\
                      sum() { ret this.x + this.y; }\n\
                      static origin() { ret Point(0, 0); }\n\
                      }";
        let Stmt::Class(decl) = parse_one(source) else {
            panic!("expected class");
        };
        assert_eq!(decl.name, "Point");
        assert_eq!(decl.superclass.as_deref(), Some("Base"));
        assert_eq!(decl.ctor.as_ref().unwrap().params, vec!["x", "y"]);
        assert_eq!(decl.methods.len(), 1);
        assert_eq!(decl.methods[0].name, "sum");
        assert_eq!(decl.statics.len(), 1);
        assert_eq!(decl.statics[0].name, "origin");
    }

    #[test]
    fn class_rejects_second_ctor() {
        let err = first_error("cls A { ctor() {} ctor() {} }");
        assert_eq!(err.message, "class 'A' already has a ctor");
    }

    #[test]
    fn class_rejects_duplicate_method() {
        let err = first_error("cls A { m() {} m() {} }");
        assert_eq!(err.message, "duplicate method 'm' in class 'A'");
        // A static clashing with an instance method is a duplicate too.
        let err = first_error("cls A { m() {} static m() {} }");
        assert_eq!(err.message, "duplicate method 'm' in class 'A'");
    }

    #[test]
    fn if_else_attaches_to_nearest() {
        let Stmt::If { else_branch, .. } = parse_one("if (a) print 1; else print 2;") else {
            panic!("expected if");
        };
        assert!(else_branch.is_some());
    }

    #[test]
    fn while_statement() {
        let Stmt::While { cond, body, .. } = parse_one("while (x < 10) x = x + 1;") else {
            panic!("expected while");
        };
        assert!(matches!(cond.kind, ExprKind::Binary { op: BinOp::Lt, .. }));
        assert!(matches!(*body, Stmt::Expr(_)));
    }

    #[test]
    fn for_in_statement() {
        let Stmt::ForIn { var, iter, .. } = parse_one("for (i in 0..5) print i;") else {
            panic!("expected for");
        };
        assert_eq!(var, "i");
        assert!(matches!(
            iter.kind,
            ExprKind::Range {
                inclusive: false,
                ..
            }
        ));
    }

    #[test]
    fn try_catch_statement() {
        let Stmt::Try {
            body,
            catch_name,
            catch_body,
            ..
        } = parse_one("try { throw \"boom\"; } catch (e) { print e; }")
        else {
            panic!("expected try");
        };
        assert_eq!(body.len(), 1);
        assert_eq!(catch_name, "e");
        assert_eq!(catch_body.len(), 1);
    }

    #[test]
    fn import_statements() {
        let Stmt::Import { path, .. } = parse_one("import \"lib/math.kn\";") else {
            panic!("expected import");
        };
        assert_eq!(path, "lib/math.kn");

        let Stmt::FromImport { path, names, .. } =
            parse_one("from \"util.kn\" import min, max;")
        else {
            panic!("expected from-import");
        };
        assert_eq!(path, "util.kn");
        assert_eq!(names, vec!["min", "max"]);
    }

    #[test]
    fn term_binds_tighter_than_comparison() {
        let expr = parse_expr_str("1 + 2 * 3 < 10");
        let ExprKind::Binary {
            op: BinOp::Lt,
            left,
            ..
        } = expr.kind
        else {
            panic!("expected <");
        };
        let ExprKind::Binary {
            op: BinOp::Add,
            right,
            ..
        } = left.kind
        else {
            panic!("expected + under <");
        };
        assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn assignment_is_right_associative() {
        let expr = parse_expr_str("a = b = 1");
        let ExprKind::Assign { name, value, .. } = expr.kind else {
            panic!("expected assignment");
        };
        assert_eq!(name, "a");
        assert!(matches!(value.kind, ExprKind::Assign { .. }));
    }

    #[test]
    fn compound_assignment_carries_operator() {
        let expr = parse_expr_str("x += 2");
        let ExprKind::Assign { op, .. } = expr.kind else {
            panic!("expected assignment");
        };
        assert_eq!(op, Some(BinOp::Add));
    }

    #[test]
    fn member_and_index_assignment() {
        assert!(matches!(
            parse_expr_str("a.b = 1").kind,
            ExprKind::MemberAssign { op: None, .. }
        ));
        assert!(matches!(
            parse_expr_str("a[0] *= 2").kind,
            ExprKind::IndexAssign {
                op: Some(BinOp::Mul),
                ..
            }
        ));
    }

    #[test]
    fn invalid_assignment_target() {
        let err = first_error("1 = 2;");
        assert_eq!(err.message, "invalid assignment target");
        let err = first_error("a + b = 2;");
        assert_eq!(err.message, "invalid assignment target");
    }

    #[test]
    fn ternary_is_right_associative() {
        let expr = parse_expr_str("a ? 1 : b ? 2 : 3");
        let ExprKind::Ternary { else_expr, .. } = expr.kind else {
            panic!("expected ternary");
        };
        assert!(matches!(else_expr.kind, ExprKind::Ternary { .. }));
    }

    #[test]
    fn logical_operators_nest() {
        let expr = parse_expr_str("a or b and c");
        let ExprKind::Logical {
            op: LogicalOp::Or,
            right,
            ..
        } = expr.kind
        else {
            panic!("expected or");
        };
        assert!(matches!(
            right.kind,
            ExprKind::Logical {
                op: LogicalOp::And,
                ..
            }
        ));
    }

    #[test]
    fn in_operator_with_range() {
        let expr = parse_expr_str("x in 1...10");
        let ExprKind::Binary {
            op: BinOp::In,
            right,
            ..
        } = expr.kind
        else {
            panic!("expected in");
        };
        assert!(matches!(
            right.kind,
            ExprKind::Range {
                inclusive: true,
                ..
            }
        ));
    }

    #[test]
    fn is_operator() {
        let expr = parse_expr_str("p is Point");
        assert!(matches!(expr.kind, ExprKind::Binary { op: BinOp::Is, .. }));
    }

    #[test]
    fn unary_operators() {
        let expr = parse_expr_str("!-x");
        let ExprKind::Unary {
            op: UnaryOp::Not,
            operand,
        } = expr.kind
        else {
            panic!("expected !");
        };
        assert!(matches!(
            operand.kind,
            ExprKind::Unary {
                op: UnaryOp::Neg,
                ..
            }
        ));
    }

    #[test]
    fn prefix_and_postfix_incdec() {
        let expr = parse_expr_str("++x");
        assert!(matches!(
            expr.kind,
            ExprKind::IncDec {
                dec: false,
                postfix: false,
                ..
            }
        ));
        let expr = parse_expr_str("a.count--");
        assert!(matches!(
            expr.kind,
            ExprKind::IncDec {
                dec: true,
                postfix: true,
                ..
            }
        ));
    }

    #[test]
    fn incdec_requires_lvalue() {
        let err = first_error("5++;");
        assert_eq!(err.message, "invalid target for '++'");
        let err = first_error("--(a + b);");
        assert_eq!(err.message, "invalid target for '--'");
    }

    #[test]
    fn call_member_index_chain() {
        let expr = parse_expr_str("obj.items[0].get(1, 2)");
        let ExprKind::Call { callee, args } = expr.kind else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 2);
        let ExprKind::Member { target, field } = callee.kind else {
            panic!("expected member");
        };
        assert_eq!(field, "get");
        assert!(matches!(target.kind, ExprKind::Index { .. }));
    }

    #[test]
    fn array_literal() {
        let expr = parse_expr_str("[1, \"two\", nil]");
        let ExprKind::Array(items) = expr.kind else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn grouping_is_not_a_lambda() {
        let expr = parse_expr_str("(1 + 2) * 3");
        assert!(matches!(expr.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn lambda_with_expression_body() {
        let expr = parse_expr_str("(a, b) -> a + b");
        let ExprKind::Lambda { params, body } = expr.kind else {
            panic!("expected lambda");
        };
        assert_eq!(params, vec!["a", "b"]);
        // Expression bodies lower to a single ret.
        assert!(matches!(body[0], Stmt::Ret { value: Some(_), .. }));
    }

    #[test]
    fn lambda_with_block_body() {
        let expr = parse_expr_str("() -> { print 1; }");
        let ExprKind::Lambda { params, body } = expr.kind else {
            panic!("expected lambda");
        };
        assert!(params.is_empty());
        assert!(matches!(body[0], Stmt::Print { .. }));
    }

    #[test]
    fn empty_parens_without_arrow_are_an_error() {
        let err = first_error("();");
        assert!(err.message.starts_with("expected expression"), "{}", err.message);
    }

    #[test]
    fn base_access_parses() {
        let expr = parse_expr_str("base.init(1)");
        let ExprKind::Call { callee, .. } = expr.kind else {
            panic!("expected call");
        };
        assert_eq!(callee.kind, ExprKind::Base { method: "init".to_string() });
    }

    #[test]
    fn reports_multiple_errors_in_one_pass() {
        let errors = parse_str("let = 1;\nprint 2 2;\n").unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("expected identifier"));
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[1].line, 2);
    }

    #[test]
    fn recovers_at_newline_statement_boundary() {
        // No semicolon ends the broken statement; the flagged `print`
        // keyword on the next line is the recovery point, so the second
        // statement parses cleanly and only one error is reported.
        let errors = parse_str("let x = 1 1\nprint x;").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("expected ';'"), "{}", errors[0].message);
    }

    #[test]
    fn recovers_inside_blocks() {
        let errors = parse_str("fn f() { let = 1; ret 2; }\nlet 3;").unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn error_spans_point_at_the_offending_token() {
        let errors = parse_str("let x = ;").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].span, (8, 9));
    }

    #[test]
    fn too_many_parameters() {
        let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
        let source = format!("fn f({}) {{}}", params.join(", "));
        let err = first_error(&source);
        assert_eq!(err.message, "cannot have more than 255 parameters");
    }
}
