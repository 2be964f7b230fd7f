//! AST node types for the Kiln language.
//!
//! Statements are a plain enum. Expressions wrap an [`ExprKind`] together
//! with the 1-based line they started on; the compiler threads that line
//! into the bytecode line table for runtime tracebacks.

/// Program = sequence of statements.
pub type Program = Vec<Stmt>;

/// Statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let name (= expr)? ;` -- a missing initialiser means `nil`
    Let {
        name: String,
        init: Option<Expr>,
        line: u32,
    },
    /// `const name = expr ;`
    Const {
        name: String,
        init: Expr,
        line: u32,
    },
    /// `fn name(params) { ... }`
    Fn(FnDecl),
    /// `cls Name (: Base)? { ... }`
    Class(ClassDecl),
    /// Expression statement (value is dropped)
    Expr(Expr),
    /// `print expr ;`
    Print { expr: Expr, line: u32 },
    /// `if (cond) stmt (else stmt)?`
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        line: u32,
    },
    /// `while (cond) stmt`
    While {
        cond: Expr,
        body: Box<Stmt>,
        line: u32,
    },
    /// `for (var in iter) stmt`
    ForIn {
        var: String,
        iter: Expr,
        body: Box<Stmt>,
        line: u32,
    },
    /// `{ ... }`
    Block(Vec<Stmt>),
    /// `ret expr? ;`
    Ret { value: Option<Expr>, line: u32 },
    /// `break ;`
    Break { line: u32 },
    /// `skip ;` -- skips to the next loop iteration
    Skip { line: u32 },
    /// `throw expr ;`
    Throw { value: Expr, line: u32 },
    /// `try block catch (name) block`
    Try {
        body: Vec<Stmt>,
        catch_name: String,
        catch_body: Vec<Stmt>,
        line: u32,
    },
    /// `import "path" ;` -- binds the module under its file stem
    Import { path: String, line: u32 },
    /// `from "path" import a, b ;`
    FromImport {
        path: String,
        names: Vec<String>,
        line: u32,
    },
}

/// Function declaration. Also used for methods, ctors and statics.
#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

/// Class declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub superclass: Option<String>,
    pub ctor: Option<FnDecl>,
    pub methods: Vec<FnDecl>,
    pub statics: Vec<FnDecl>,
    pub line: u32,
}

/// Expression -- every node carries the line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
}

impl Expr {
    /// Convenience constructor.
    pub fn new(kind: ExprKind, line: u32) -> Self {
        Expr { kind, line }
    }
}

/// Expression kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    // Literals
    Number(f64),
    Str(String),
    Bool(bool),
    Nil,

    // Names
    Ident(String),
    This,
    /// `base.method` -- resolved against the superclass of the method's
    /// defining class at run time
    Base { method: String },

    // Compound literals
    Array(Vec<Expr>),
    /// `start..end` (exclusive) or `start...end` (inclusive)
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        inclusive: bool,
    },

    // Operators
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `and` / `or`, short-circuiting
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `cond ? then : else`
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },

    // Assignment (an expression; leaves the assigned value)
    /// `name op= value`; `op` is `None` for plain `=`
    Assign {
        name: String,
        op: Option<BinOp>,
        value: Box<Expr>,
    },
    /// `target.field op= value`
    MemberAssign {
        target: Box<Expr>,
        field: String,
        op: Option<BinOp>,
        value: Box<Expr>,
    },
    /// `target[index] op= value`
    IndexAssign {
        target: Box<Expr>,
        index: Box<Expr>,
        op: Option<BinOp>,
        value: Box<Expr>,
    },
    /// `++x` / `x--` on an identifier, member or index target; prefix
    /// yields the new value, postfix the old
    IncDec {
        target: Box<Expr>,
        dec: bool,
        postfix: bool,
    },

    // Access and calls
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Member {
        target: Box<Expr>,
        field: String,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },

    /// `(params) -> expr` or `(params) -> block`. An expression body is
    /// lowered to a single `ret` statement at parse time.
    Lambda { params: Vec<String>, body: Vec<Stmt> },
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    /// `is` -- instance-of test
    Is,
    /// `in` -- membership test
    In,
}

/// Short-circuiting logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}
