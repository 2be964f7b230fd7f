//! Single-pass AST to bytecode compiler.
//!
//! The program compiles into an implicit script function; every `fn`,
//! method, ctor and lambda becomes its own [`Function`] stored in its
//! parent's constant pool. Locals live on the value stack with a
//! slot-per-declaration discipline; slot 0 of each frame holds the callee,
//! which doubles as the recursion binding for named functions and as
//! `this` inside methods. There is no capture: a nested function referencing
//! an enclosing function's local is a compile error, so no closure or
//! upvalue machinery exists.
//!
//! Forward jumps are emitted with a placeholder operand and back-patched,
//! as are `break`/`skip` inside loops. `try` bodies are bracketed by
//! `TryPush`/`TryPop`; `break` and `skip` that leave a protected region
//! emit the matching `TryPop`s themselves.

use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;

use kiln_parser::ast::{
    BinOp, ClassDecl, Expr, ExprKind, FnDecl, LogicalOp, Program, Stmt, UnaryOp,
};
use kiln_vm::chunk::{Chunk, OpCode};
use kiln_vm::object::Function;
use kiln_vm::value::Value;

/// Compile-time error with the 1-based source line.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {message}")]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

/// Compile a program into its script function. Errors are collected per
/// top-level statement, so one pass reports every bad statement.
pub fn compile(program: &Program) -> Result<Rc<Function>, Vec<CompileError>> {
    compile_named(program, "script")
}

/// Compile with an explicit script-function name; the module loader passes
/// the file stem so tracebacks name the module.
pub fn compile_named(program: &Program, name: &str) -> Result<Rc<Function>, Vec<CompileError>> {
    let mut compiler = Compiler::new(name);
    for stmt in program {
        if let Err(e) = compiler.stmt(stmt) {
            compiler.errors.push(e);
            compiler.recover();
        }
    }
    compiler.finish()
}

/// What kind of function body is being compiled; gates `this`, `base`,
/// `ret` and ctor-return rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Method,
    Ctor,
    Static,
    Lambda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    While,
    /// Keeps a hidden iterator slot and the loop variable on the stack.
    ForIn,
}

struct Local {
    name: String,
    depth: usize,
    constant: bool,
    /// False while the initialiser is being compiled.
    initialized: bool,
}

struct LoopCtx {
    kind: LoopKind,
    /// Back-jump target.
    start: usize,
    /// Locals live when the loop was entered.
    entry_locals: usize,
    /// Open `try`s when the loop was entered; jumps out emit the difference.
    entry_try_depth: usize,
    /// Operand offsets to patch to the end of the loop.
    break_jumps: Vec<usize>,
    /// Operand offsets to patch to the loop tail (`ForIn` only).
    skip_jumps: Vec<usize>,
}

struct FuncCtx {
    func: Function,
    kind: FnKind,
    locals: Vec<Local>,
    scope_depth: usize,
    loops: Vec<LoopCtx>,
    /// `try` blocks currently open in this function.
    try_depth: usize,
}

impl FuncCtx {
    fn new(name: &str, arity: u8, kind: FnKind) -> FuncCtx {
        // Slot 0 holds the callee. Named functions see themselves there,
        // methods and ctors see the receiver; scripts, statics and lambdas
        // get an unnameable slot.
        let slot_zero = match kind {
            FnKind::Function => name,
            FnKind::Method | FnKind::Ctor => "this",
            FnKind::Script | FnKind::Static | FnKind::Lambda => "",
        };
        FuncCtx {
            func: Function::new(name, arity),
            kind,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                constant: false,
                initialized: true,
            }],
            scope_depth: 0,
            loops: Vec::new(),
            try_depth: 0,
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

enum Resolved {
    Local { slot: u16, constant: bool },
    Global,
}

struct Compiler {
    funcs: Vec<FuncCtx>,
    classes: Vec<ClassCtx>,
    /// Names declared `const` at the top level of this compilation unit.
    global_consts: HashSet<String>,
    errors: Vec<CompileError>,
    last_line: u32,
}

impl Compiler {
    fn new(script_name: &str) -> Compiler {
        Compiler {
            funcs: vec![FuncCtx::new(script_name, 0, FnKind::Script)],
            classes: Vec::new(),
            global_consts: HashSet::new(),
            errors: Vec::new(),
            last_line: 1,
        }
    }

    fn finish(mut self) -> Result<Rc<Function>, Vec<CompileError>> {
        let line = self.last_line;
        self.emit_return(line);
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        match self.funcs.pop() {
            Some(ctx) => Ok(Rc::new(ctx.func)),
            None => Err(vec![CompileError {
                message: "compiler lost its script context".to_string(),
                line,
            }]),
        }
    }

    /// Drop any half-built function and class contexts after an error so the
    /// next top-level statement compiles in a clean state. The bytecode
    /// emitted so far is abandoned along with the errors.
    fn recover(&mut self) {
        self.funcs.truncate(1);
        self.classes.clear();
        let ctx = &mut self.funcs[0];
        ctx.scope_depth = 0;
        ctx.locals.truncate(1);
        ctx.loops.clear();
        ctx.try_depth = 0;
    }

    // ─── Statements ───

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Let { name, init, line } => self.let_stmt(name, init.as_ref(), false, *line),
            Stmt::Const { name, init, line } => self.let_stmt(name, Some(init), true, *line),
            Stmt::Fn(decl) => self.fn_stmt(decl),
            Stmt::Class(decl) => self.class_stmt(decl),
            Stmt::Expr(expr) => {
                let line = expr.line;
                self.expr(expr)?;
                self.emit_op(OpCode::Pop, line);
                Ok(())
            }
            Stmt::Print { expr, line } => {
                self.expr(expr)?;
                self.emit_op(OpCode::Print, *line);
                Ok(())
            }
            Stmt::If { cond, then_branch, else_branch, line } => {
                self.expr(cond)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse, *line);
                self.emit_op(OpCode::Pop, *line);
                self.stmt(then_branch)?;
                let end_jump = self.emit_jump(OpCode::Jump, *line);
                self.patch_jump(else_jump, *line)?;
                self.emit_op(OpCode::Pop, *line);
                if let Some(else_branch) = else_branch {
                    self.stmt(else_branch)?;
                }
                self.patch_jump(end_jump, *line)
            }
            Stmt::While { cond, body, line } => self.while_stmt(cond, body, *line),
            Stmt::ForIn { var, iter, body, line } => self.for_in_stmt(var, iter, body, *line),
            Stmt::Block(stmts) => {
                self.begin_scope();
                for stmt in stmts {
                    self.stmt(stmt)?;
                }
                self.end_scope(self.last_line);
                Ok(())
            }
            Stmt::Ret { value, line } => self.ret_stmt(value.as_ref(), *line),
            Stmt::Break { line } => self.break_stmt(*line),
            Stmt::Skip { line } => self.skip_stmt(*line),
            Stmt::Throw { value, line } => {
                self.expr(value)?;
                self.emit_op(OpCode::Throw, *line);
                Ok(())
            }
            Stmt::Try { body, catch_name, catch_body, line } => {
                self.try_stmt(body, catch_name, catch_body, *line)
            }
            Stmt::Import { path, line } => {
                self.check_top_level("import", *line)?;
                self.emit_import(path, *line)?;
                let stem = module_stem(path);
                let name_idx = self.name_constant(&stem, *line)?;
                self.emit_op(OpCode::DefineGlobal, *line);
                self.emit_u16(name_idx, *line);
                Ok(())
            }
            Stmt::FromImport { path, names, line } => {
                self.check_top_level("from", *line)?;
                for name in names {
                    self.emit_import(path, *line)?;
                    let name_idx = self.name_constant(name, *line)?;
                    self.emit_op(OpCode::GetField, *line);
                    self.emit_u16(name_idx, *line);
                    self.emit_op(OpCode::DefineGlobal, *line);
                    self.emit_u16(name_idx, *line);
                }
                Ok(())
            }
        }
    }

    fn let_stmt(
        &mut self,
        name: &str,
        init: Option<&Expr>,
        constant: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        if self.at_global_scope() {
            match init {
                Some(expr) => self.expr(expr)?,
                None => self.emit_op(OpCode::Nil, line),
            }
            let name_idx = self.name_constant(name, line)?;
            self.emit_op(OpCode::DefineGlobal, line);
            self.emit_u16(name_idx, line);
            if constant {
                self.global_consts.insert(name.to_string());
            }
            Ok(())
        } else {
            self.declare_local(name, constant, line)?;
            match init {
                Some(expr) => self.expr(expr)?,
                None => self.emit_op(OpCode::Nil, line),
            }
            self.mark_initialized();
            Ok(())
        }
    }

    fn fn_stmt(&mut self, decl: &FnDecl) -> Result<(), CompileError> {
        if self.at_global_scope() {
            self.function(&decl.name, &decl.params, &decl.body, FnKind::Function, decl.line)?;
            let name_idx = self.name_constant(&decl.name, decl.line)?;
            self.emit_op(OpCode::DefineGlobal, decl.line);
            self.emit_u16(name_idx, decl.line);
        } else {
            self.declare_local(&decl.name, false, decl.line)?;
            self.mark_initialized();
            self.function(&decl.name, &decl.params, &decl.body, FnKind::Function, decl.line)?;
        }
        Ok(())
    }

    fn class_stmt(&mut self, decl: &ClassDecl) -> Result<(), CompileError> {
        let line = decl.line;
        let name_idx = self.name_constant(&decl.name, line)?;
        self.emit_op(OpCode::Class, line);
        self.emit_u16(name_idx, line);

        if let Some(superclass) = &decl.superclass {
            if superclass == &decl.name {
                return Err(CompileError {
                    message: format!("class '{}' cannot inherit from itself", decl.name),
                    line,
                });
            }
            self.variable_get(superclass, line)?;
            self.emit_op(OpCode::Inherit, line);
        }

        self.classes.push(ClassCtx { has_superclass: decl.superclass.is_some() });
        let result = self.class_members(decl);
        self.classes.pop();
        result?;

        if self.at_global_scope() {
            self.emit_op(OpCode::DefineGlobal, line);
            self.emit_u16(name_idx, line);
        } else {
            // The class value on the stack becomes the local's slot.
            self.declare_local(&decl.name, false, line)?;
            self.mark_initialized();
        }
        Ok(())
    }

    fn class_members(&mut self, decl: &ClassDecl) -> Result<(), CompileError> {
        if let Some(ctor) = &decl.ctor {
            self.function("ctor", &ctor.params, &ctor.body, FnKind::Ctor, ctor.line)?;
            let idx = self.name_constant("ctor", ctor.line)?;
            self.emit_op(OpCode::Method, ctor.line);
            self.emit_u16(idx, ctor.line);
        }
        for method in &decl.methods {
            self.function(&method.name, &method.params, &method.body, FnKind::Method, method.line)?;
            let idx = self.name_constant(&method.name, method.line)?;
            self.emit_op(OpCode::Method, method.line);
            self.emit_u16(idx, method.line);
        }
        for method in &decl.statics {
            self.function(&method.name, &method.params, &method.body, FnKind::Static, method.line)?;
            let idx = self.name_constant(&method.name, method.line)?;
            self.emit_op(OpCode::StaticMethod, method.line);
            self.emit_u16(idx, method.line);
        }
        Ok(())
    }

    /// Compile a function body in its own context and emit the resulting
    /// function value as a constant.
    fn function(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Stmt],
        kind: FnKind,
        line: u32,
    ) -> Result<(), CompileError> {
        self.funcs.push(FuncCtx::new(name, params.len() as u8, kind));
        self.begin_scope();
        for param in params {
            self.declare_local(param, false, line)?;
            self.mark_initialized();
        }
        for stmt in body {
            self.stmt(stmt)?;
        }
        let end_line = self.last_line;
        self.emit_return(end_line);
        match self.funcs.pop() {
            Some(ctx) => self.emit_value_constant(Value::Fn(Rc::new(ctx.func)), line),
            None => Err(CompileError {
                message: "compiler lost its function context".to_string(),
                line,
            }),
        }
    }

    fn ret_stmt(&mut self, value: Option<&Expr>, line: u32) -> Result<(), CompileError> {
        match self.ctx().kind {
            FnKind::Script => {
                return Err(CompileError {
                    message: "cannot return from top-level code".to_string(),
                    line,
                })
            }
            FnKind::Ctor if value.is_some() => {
                return Err(CompileError {
                    message: "cannot return a value from a ctor".to_string(),
                    line,
                })
            }
            FnKind::Ctor => {
                self.emit_op(OpCode::GetLocal, line);
                self.emit_u16(0, line);
            }
            _ => match value {
                Some(expr) => self.expr(expr)?,
                None => self.emit_op(OpCode::Nil, line),
            },
        }
        self.emit_op(OpCode::Ret, line);
        Ok(())
    }

    fn while_stmt(&mut self, cond: &Expr, body: &Stmt, line: u32) -> Result<(), CompileError> {
        let start = self.chunk().code.len();
        let ctx = self.ctx_mut();
        ctx.loops.push(LoopCtx {
            kind: LoopKind::While,
            start,
            entry_locals: ctx.locals.len(),
            entry_try_depth: ctx.try_depth,
            break_jumps: Vec::new(),
            skip_jumps: Vec::new(),
        });

        self.expr(cond)?;
        let exit = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_op(OpCode::Pop, line);
        self.stmt(body)?;
        self.emit_loop(start, line)?;
        self.patch_jump(exit, line)?;
        self.emit_op(OpCode::Pop, line);

        let Some(loop_ctx) = self.ctx_mut().loops.pop() else {
            return Ok(());
        };
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump, line)?;
        }
        Ok(())
    }

    fn for_in_stmt(
        &mut self,
        var: &str,
        iter: &Expr,
        body: &Stmt,
        line: u32,
    ) -> Result<(), CompileError> {
        self.begin_scope();
        let entry_locals = self.ctx().locals.len();
        let entry_try_depth = self.ctx().try_depth;

        self.expr(iter)?;
        self.emit_op(OpCode::IterNew, line);
        self.declare_local("<iter>", false, line)?;
        self.mark_initialized();

        let start = self.chunk().code.len();
        self.ctx_mut().loops.push(LoopCtx {
            kind: LoopKind::ForIn,
            start,
            entry_locals,
            entry_try_depth,
            break_jumps: Vec::new(),
            skip_jumps: Vec::new(),
        });

        // IterNext pushes the element (the loop variable's slot) or jumps
        // straight past the loop with nothing pushed.
        let exit = self.emit_jump(OpCode::IterNext, line);
        self.declare_local(var, false, line)?;
        self.mark_initialized();
        self.stmt(body)?;

        let Some(loop_ctx) = self.ctx_mut().loops.pop() else {
            return Ok(());
        };
        // Tail: `skip` lands here, the loop variable is replaced next pass.
        for jump in loop_ctx.skip_jumps {
            self.patch_jump(jump, line)?;
        }
        self.emit_op(OpCode::Pop, line);
        self.emit_loop(start, line)?;
        self.patch_jump(exit, line)?;
        // The exit path never pushed the loop variable.
        self.ctx_mut().locals.pop();
        self.end_scope(line);
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump, line)?;
        }
        Ok(())
    }

    fn break_stmt(&mut self, line: u32) -> Result<(), CompileError> {
        let Some(loop_ctx) = self.ctx().loops.last() else {
            return Err(CompileError {
                message: "cannot use 'break' outside of a loop".to_string(),
                line,
            });
        };
        let entry_locals = loop_ctx.entry_locals;
        let entry_try_depth = loop_ctx.entry_try_depth;
        self.close_trys(entry_try_depth, line);
        let pops = self.ctx().locals.len() - entry_locals;
        for _ in 0..pops {
            self.emit_op(OpCode::Pop, line);
        }
        let jump = self.emit_jump(OpCode::Jump, line);
        if let Some(loop_ctx) = self.ctx_mut().loops.last_mut() {
            loop_ctx.break_jumps.push(jump);
        }
        Ok(())
    }

    fn skip_stmt(&mut self, line: u32) -> Result<(), CompileError> {
        let Some(loop_ctx) = self.ctx().loops.last() else {
            return Err(CompileError {
                message: "cannot use 'skip' outside of a loop".to_string(),
                line,
            });
        };
        let kind = loop_ctx.kind;
        let start = loop_ctx.start;
        let entry_locals = loop_ctx.entry_locals;
        let entry_try_depth = loop_ctx.entry_try_depth;
        self.close_trys(entry_try_depth, line);
        match kind {
            LoopKind::While => {
                let pops = self.ctx().locals.len() - entry_locals;
                for _ in 0..pops {
                    self.emit_op(OpCode::Pop, line);
                }
                self.emit_loop(start, line)
            }
            LoopKind::ForIn => {
                // The iterator and loop variable stay; the tail recycles them.
                let pops = self.ctx().locals.len() - entry_locals - 2;
                for _ in 0..pops {
                    self.emit_op(OpCode::Pop, line);
                }
                let jump = self.emit_jump(OpCode::Jump, line);
                if let Some(loop_ctx) = self.ctx_mut().loops.last_mut() {
                    loop_ctx.skip_jumps.push(jump);
                }
                Ok(())
            }
        }
    }

    /// Emit `TryPop` for every `try` opened since `target_depth`; used when
    /// `break`/`skip` jump out of protected regions.
    fn close_trys(&mut self, target_depth: usize, line: u32) {
        let open = self.ctx().try_depth.saturating_sub(target_depth);
        for _ in 0..open {
            self.emit_op(OpCode::TryPop, line);
        }
    }

    fn try_stmt(
        &mut self,
        body: &[Stmt],
        catch_name: &str,
        catch_body: &[Stmt],
        line: u32,
    ) -> Result<(), CompileError> {
        let handler = self.emit_jump(OpCode::TryPush, line);
        self.ctx_mut().try_depth += 1;
        self.begin_scope();
        for stmt in body {
            self.stmt(stmt)?;
        }
        self.end_scope(self.last_line);
        self.emit_op(OpCode::TryPop, line);
        self.ctx_mut().try_depth -= 1;
        let after = self.emit_jump(OpCode::Jump, line);

        // Handler entry: the thrown value is on the stack and becomes the
        // catch variable's slot.
        self.patch_jump(handler, line)?;
        self.begin_scope();
        self.declare_local(catch_name, false, line)?;
        self.mark_initialized();
        for stmt in catch_body {
            self.stmt(stmt)?;
        }
        self.end_scope(self.last_line);
        self.patch_jump(after, line)
    }

    // ─── Expressions ───

    fn expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Number(value) => self.emit_value_constant(Value::Num(*value), line),
            ExprKind::Str(value) => self.emit_value_constant(Value::str(value.as_str()), line),
            ExprKind::Bool(true) => {
                self.emit_op(OpCode::True, line);
                Ok(())
            }
            ExprKind::Bool(false) => {
                self.emit_op(OpCode::False, line);
                Ok(())
            }
            ExprKind::Nil => {
                self.emit_op(OpCode::Nil, line);
                Ok(())
            }
            ExprKind::Ident(name) => self.variable_get(name, line),
            ExprKind::This => {
                if !matches!(self.ctx().kind, FnKind::Method | FnKind::Ctor) {
                    return Err(CompileError {
                        message: this_error(self.ctx().kind),
                        line,
                    });
                }
                self.emit_op(OpCode::GetLocal, line);
                self.emit_u16(0, line);
                Ok(())
            }
            ExprKind::Base { method } => {
                self.check_base(line)?;
                self.emit_op(OpCode::GetLocal, line);
                self.emit_u16(0, line);
                let idx = self.name_constant(method, line)?;
                self.emit_op(OpCode::GetBase, line);
                self.emit_u16(idx, line);
                Ok(())
            }
            ExprKind::Array(items) => {
                if items.len() > u16::MAX as usize {
                    return Err(CompileError {
                        message: "array literal has too many elements".to_string(),
                        line,
                    });
                }
                for item in items {
                    self.expr(item)?;
                }
                self.emit_op(OpCode::Array, line);
                self.emit_u16(items.len() as u16, line);
                Ok(())
            }
            ExprKind::Range { start, end, inclusive } => {
                self.expr(start)?;
                self.expr(end)?;
                self.emit_op(OpCode::Range, line);
                self.emit_byte(u8::from(*inclusive), line);
                Ok(())
            }
            ExprKind::Binary { op, left, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.emit_binop(*op, line);
                Ok(())
            }
            ExprKind::Logical { op, left, right } => self.logical(*op, left, right, line),
            ExprKind::Unary { op, operand } => {
                self.expr(operand)?;
                match op {
                    UnaryOp::Neg => self.emit_op(OpCode::Neg, line),
                    UnaryOp::Not => self.emit_op(OpCode::Not, line),
                }
                Ok(())
            }
            ExprKind::Ternary { cond, then_expr, else_expr } => {
                self.expr(cond)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line);
                self.expr(then_expr)?;
                let end_jump = self.emit_jump(OpCode::Jump, line);
                self.patch_jump(else_jump, line)?;
                self.emit_op(OpCode::Pop, line);
                self.expr(else_expr)?;
                self.patch_jump(end_jump, line)
            }
            ExprKind::Assign { name, op, value } => self.assign(name, *op, value, line),
            ExprKind::MemberAssign { target, field, op, value } => {
                self.member_assign(target, field, *op, value, line)
            }
            ExprKind::IndexAssign { target, index, op, value } => {
                self.index_assign(target, index, *op, value, line)
            }
            ExprKind::IncDec { target, dec, postfix } => {
                self.inc_dec(target, *dec, *postfix, line)
            }
            ExprKind::Call { callee, args } => self.call(callee, args, line),
            ExprKind::Member { target, field } => {
                self.expr(target)?;
                let idx = self.name_constant(field, line)?;
                self.emit_op(OpCode::GetField, line);
                self.emit_u16(idx, line);
                Ok(())
            }
            ExprKind::Index { target, index } => {
                self.expr(target)?;
                self.expr(index)?;
                self.emit_op(OpCode::GetIndex, line);
                Ok(())
            }
            ExprKind::Lambda { params, body } => {
                self.function("lambda", params, body, FnKind::Lambda, line)
            }
        }
    }

    fn logical(
        &mut self,
        op: LogicalOp,
        left: &Expr,
        right: &Expr,
        line: u32,
    ) -> Result<(), CompileError> {
        self.expr(left)?;
        match op {
            LogicalOp::And => {
                let end = self.emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line);
                self.expr(right)?;
                self.patch_jump(end, line)
            }
            LogicalOp::Or => {
                let rhs = self.emit_jump(OpCode::JumpIfFalse, line);
                let end = self.emit_jump(OpCode::Jump, line);
                self.patch_jump(rhs, line)?;
                self.emit_op(OpCode::Pop, line);
                self.expr(right)?;
                self.patch_jump(end, line)
            }
        }
    }

    fn assign(
        &mut self,
        name: &str,
        op: Option<BinOp>,
        value: &Expr,
        line: u32,
    ) -> Result<(), CompileError> {
        match self.resolve(name, line)? {
            Resolved::Local { slot, constant } => {
                if constant {
                    return Err(const_assign_error(name, line));
                }
                if let Some(op) = op {
                    self.emit_op(OpCode::GetLocal, line);
                    self.emit_u16(slot, line);
                    self.expr(value)?;
                    self.emit_binop(op, line);
                } else {
                    self.expr(value)?;
                }
                self.emit_op(OpCode::SetLocal, line);
                self.emit_u16(slot, line);
            }
            Resolved::Global => {
                if self.global_consts.contains(name) {
                    return Err(const_assign_error(name, line));
                }
                let idx = self.name_constant(name, line)?;
                if let Some(op) = op {
                    self.emit_op(OpCode::GetGlobal, line);
                    self.emit_u16(idx, line);
                    self.expr(value)?;
                    self.emit_binop(op, line);
                } else {
                    self.expr(value)?;
                }
                self.emit_op(OpCode::SetGlobal, line);
                self.emit_u16(idx, line);
            }
        }
        Ok(())
    }

    fn member_assign(
        &mut self,
        target: &Expr,
        field: &str,
        op: Option<BinOp>,
        value: &Expr,
        line: u32,
    ) -> Result<(), CompileError> {
        self.expr(target)?;
        let idx = self.name_constant(field, line)?;
        if let Some(op) = op {
            self.emit_op(OpCode::Dup, line);
            self.emit_op(OpCode::GetField, line);
            self.emit_u16(idx, line);
            self.expr(value)?;
            self.emit_binop(op, line);
        } else {
            self.expr(value)?;
        }
        self.emit_op(OpCode::SetField, line);
        self.emit_u16(idx, line);
        Ok(())
    }

    fn index_assign(
        &mut self,
        target: &Expr,
        index: &Expr,
        op: Option<BinOp>,
        value: &Expr,
        line: u32,
    ) -> Result<(), CompileError> {
        self.expr(target)?;
        self.expr(index)?;
        if let Some(op) = op {
            self.emit_op(OpCode::Dup2, line);
            self.emit_op(OpCode::GetIndex, line);
            self.expr(value)?;
            self.emit_binop(op, line);
        } else {
            self.expr(value)?;
        }
        self.emit_op(OpCode::SetIndex, line);
        Ok(())
    }

    /// `++`/`--` on identifier, member and index targets. Prefix leaves the
    /// new value on the stack, postfix the old one. Member and index targets
    /// are read twice; reads have no side effects in this language.
    fn inc_dec(
        &mut self,
        target: &Expr,
        dec: bool,
        postfix: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        let step_op = if dec { OpCode::Sub } else { OpCode::Add };
        match &target.kind {
            ExprKind::Ident(name) => {
                match self.resolve(name, line)? {
                    Resolved::Local { slot, constant } => {
                        if constant {
                            return Err(const_assign_error(name, line));
                        }
                        self.emit_op(OpCode::GetLocal, line);
                        self.emit_u16(slot, line);
                        if postfix {
                            self.emit_op(OpCode::Dup, line);
                        }
                        self.emit_value_constant(Value::Num(1.0), line)?;
                        self.emit_op(step_op, line);
                        self.emit_op(OpCode::SetLocal, line);
                        self.emit_u16(slot, line);
                    }
                    Resolved::Global => {
                        if self.global_consts.contains(name) {
                            return Err(const_assign_error(name, line));
                        }
                        let idx = self.name_constant(name, line)?;
                        self.emit_op(OpCode::GetGlobal, line);
                        self.emit_u16(idx, line);
                        if postfix {
                            self.emit_op(OpCode::Dup, line);
                        }
                        self.emit_value_constant(Value::Num(1.0), line)?;
                        self.emit_op(step_op, line);
                        self.emit_op(OpCode::SetGlobal, line);
                        self.emit_u16(idx, line);
                    }
                }
                if postfix {
                    self.emit_op(OpCode::Pop, line);
                }
                Ok(())
            }
            ExprKind::Member { target, field } => {
                self.expr(target)?;
                let idx = self.name_constant(field, line)?;
                self.emit_op(OpCode::Dup, line);
                if postfix {
                    self.emit_op(OpCode::Dup, line);
                    self.emit_op(OpCode::GetField, line);
                    self.emit_u16(idx, line);
                    self.emit_op(OpCode::Rot3, line);
                }
                self.emit_op(OpCode::GetField, line);
                self.emit_u16(idx, line);
                self.emit_value_constant(Value::Num(1.0), line)?;
                self.emit_op(step_op, line);
                self.emit_op(OpCode::SetField, line);
                self.emit_u16(idx, line);
                if postfix {
                    self.emit_op(OpCode::Pop, line);
                }
                Ok(())
            }
            ExprKind::Index { target, index } => {
                self.expr(target)?;
                self.expr(index)?;
                self.emit_op(OpCode::Dup2, line);
                if postfix {
                    self.emit_op(OpCode::GetIndex, line);
                    self.emit_op(OpCode::Rot3, line);
                    self.emit_op(OpCode::Dup2, line);
                }
                self.emit_op(OpCode::GetIndex, line);
                self.emit_value_constant(Value::Num(1.0), line)?;
                self.emit_op(step_op, line);
                self.emit_op(OpCode::SetIndex, line);
                if postfix {
                    self.emit_op(OpCode::Pop, line);
                }
                Ok(())
            }
            _ => Err(CompileError {
                message: format!("invalid target for '{}'", if dec { "--" } else { "++" }),
                line,
            }),
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], line: u32) -> Result<(), CompileError> {
        match &callee.kind {
            // recv.name(args) fuses into Invoke.
            ExprKind::Member { target, field } => {
                self.expr(target)?;
                for arg in args {
                    self.expr(arg)?;
                }
                let idx = self.name_constant(field, line)?;
                self.emit_op(OpCode::Invoke, line);
                self.emit_u16(idx, line);
                self.emit_byte(args.len() as u8, line);
            }
            ExprKind::Base { method } => {
                self.check_base(line)?;
                self.emit_op(OpCode::GetLocal, line);
                self.emit_u16(0, line);
                for arg in args {
                    self.expr(arg)?;
                }
                let idx = self.name_constant(method, line)?;
                self.emit_op(OpCode::InvokeBase, line);
                self.emit_u16(idx, line);
                self.emit_byte(args.len() as u8, line);
            }
            _ => {
                self.expr(callee)?;
                for arg in args {
                    self.expr(arg)?;
                }
                self.emit_op(OpCode::Call, line);
                self.emit_byte(args.len() as u8, line);
            }
        }
        Ok(())
    }

    // ─── Name resolution and scopes ───

    fn resolve(&self, name: &str, line: u32) -> Result<Resolved, CompileError> {
        let innermost = self.funcs.len() - 1;
        for (level, ctx) in self.funcs.iter().enumerate().rev() {
            let found = ctx
                .locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, local)| local.name == name);
            if let Some((slot, local)) = found {
                if level != innermost {
                    return Err(CompileError {
                        message: format!(
                            "cannot capture '{name}' from an enclosing function"
                        ),
                        line,
                    });
                }
                if !local.initialized {
                    return Err(CompileError {
                        message: format!(
                            "cannot read local variable '{name}' in its own initializer"
                        ),
                        line,
                    });
                }
                return Ok(Resolved::Local { slot: slot as u16, constant: local.constant });
            }
        }
        Ok(Resolved::Global)
    }

    fn variable_get(&mut self, name: &str, line: u32) -> Result<(), CompileError> {
        match self.resolve(name, line)? {
            Resolved::Local { slot, .. } => {
                self.emit_op(OpCode::GetLocal, line);
                self.emit_u16(slot, line);
                Ok(())
            }
            Resolved::Global => {
                let idx = self.name_constant(name, line)?;
                self.emit_op(OpCode::GetGlobal, line);
                self.emit_u16(idx, line);
                Ok(())
            }
        }
    }

    fn declare_local(&mut self, name: &str, constant: bool, line: u32) -> Result<(), CompileError> {
        let ctx = self.ctx_mut();
        for local in ctx.locals.iter().rev() {
            if local.depth < ctx.scope_depth {
                break;
            }
            if local.name == name {
                return Err(CompileError {
                    message: format!("variable '{name}' is already declared in this scope"),
                    line,
                });
            }
        }
        if ctx.locals.len() > u16::MAX as usize {
            return Err(CompileError {
                message: "too many local variables in one function".to_string(),
                line,
            });
        }
        ctx.locals.push(Local {
            name: name.to_string(),
            depth: ctx.scope_depth,
            constant,
            initialized: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        if let Some(local) = self.ctx_mut().locals.last_mut() {
            local.initialized = true;
        }
    }

    fn begin_scope(&mut self) {
        self.ctx_mut().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let ctx = self.ctx_mut();
        ctx.scope_depth -= 1;
        let mut pops = 0;
        while ctx
            .locals
            .last()
            .is_some_and(|local| local.depth > ctx.scope_depth)
        {
            ctx.locals.pop();
            pops += 1;
        }
        for _ in 0..pops {
            ctx.func.chunk.write_op(OpCode::Pop, line);
        }
    }

    fn at_global_scope(&self) -> bool {
        self.funcs.len() == 1 && self.funcs[0].scope_depth == 0
    }

    fn check_top_level(&self, what: &str, line: u32) -> Result<(), CompileError> {
        if self.at_global_scope() {
            Ok(())
        } else {
            Err(CompileError {
                message: format!("'{what}' is only allowed at top level"),
                line,
            })
        }
    }

    fn check_base(&self, line: u32) -> Result<(), CompileError> {
        match self.ctx().kind {
            FnKind::Method | FnKind::Ctor => {}
            FnKind::Static => {
                return Err(CompileError {
                    message: "cannot use 'base' in a static method".to_string(),
                    line,
                })
            }
            _ => {
                return Err(CompileError {
                    message: "cannot use 'base' outside of a method".to_string(),
                    line,
                })
            }
        }
        match self.classes.last() {
            Some(class) if class.has_superclass => Ok(()),
            _ => Err(CompileError {
                message: "cannot use 'base' in a class with no superclass".to_string(),
                line,
            }),
        }
    }

    // ─── Emission helpers ───

    fn ctx(&self) -> &FuncCtx {
        &self.funcs[self.funcs.len() - 1]
    }

    fn ctx_mut(&mut self) -> &mut FuncCtx {
        let last = self.funcs.len() - 1;
        &mut self.funcs[last]
    }

    fn chunk(&self) -> &Chunk {
        &self.ctx().func.chunk
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.ctx_mut().func.chunk
    }

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.last_line = line;
        self.chunk_mut().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.chunk_mut().write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16, line: u32) {
        self.chunk_mut().write_u16(value, line);
    }

    fn constant(&mut self, value: Value, line: u32) -> Result<u16, CompileError> {
        match self.chunk_mut().add_constant(value) {
            Some(index) => Ok(index),
            None => Err(CompileError {
                message: "too many constants in one chunk".to_string(),
                line,
            }),
        }
    }

    fn name_constant(&mut self, name: &str, line: u32) -> Result<u16, CompileError> {
        self.constant(Value::str(name), line)
    }

    fn emit_value_constant(&mut self, value: Value, line: u32) -> Result<(), CompileError> {
        let index = self.constant(value, line)?;
        self.emit_op(OpCode::Constant, line);
        self.emit_u16(index, line);
        Ok(())
    }

    fn emit_binop(&mut self, op: BinOp, line: u32) {
        let opcode = match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::Mod => OpCode::Mod,
            BinOp::Eq => OpCode::Eq,
            BinOp::NotEq => OpCode::NotEq,
            BinOp::Lt => OpCode::Lt,
            BinOp::LtEq => OpCode::LtEq,
            BinOp::Gt => OpCode::Gt,
            BinOp::GtEq => OpCode::GtEq,
            BinOp::Is => OpCode::Is,
            BinOp::In => OpCode::In,
        };
        self.emit_op(opcode, line);
    }

    /// Emit a jump with a placeholder operand; returns the operand offset
    /// for [`patch_jump`].
    fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit_op(op, line);
        let operand = self.chunk().code.len();
        self.emit_u16(0xffff, line);
        operand
    }

    fn patch_jump(&mut self, operand: usize, line: u32) -> Result<(), CompileError> {
        let target = self.chunk().code.len();
        let distance = target - (operand + 2);
        if distance > u16::MAX as usize {
            return Err(CompileError {
                message: "too much code to jump over".to_string(),
                line,
            });
        }
        self.chunk_mut().patch_u16(operand, distance as u16);
        Ok(())
    }

    fn emit_loop(&mut self, start: usize, line: u32) -> Result<(), CompileError> {
        self.emit_op(OpCode::Loop, line);
        let distance = self.chunk().code.len() + 2 - start;
        if distance > u16::MAX as usize {
            return Err(CompileError {
                message: "loop body too large".to_string(),
                line,
            });
        }
        self.emit_u16(distance as u16, line);
        Ok(())
    }

    fn emit_import(&mut self, path: &str, line: u32) -> Result<(), CompileError> {
        let idx = self.constant(Value::str(path), line)?;
        self.emit_op(OpCode::Import, line);
        self.emit_u16(idx, line);
        Ok(())
    }

    fn emit_return(&mut self, line: u32) {
        if self.ctx().kind == FnKind::Ctor {
            self.emit_op(OpCode::GetLocal, line);
            self.emit_u16(0, line);
        } else {
            self.emit_op(OpCode::Nil, line);
        }
        self.emit_op(OpCode::Ret, line);
    }
}

fn const_assign_error(name: &str, line: u32) -> CompileError {
    CompileError {
        message: format!("cannot assign to const '{name}'"),
        line,
    }
}

fn this_error(kind: FnKind) -> String {
    match kind {
        FnKind::Static => "cannot use 'this' in a static method".to_string(),
        _ => "cannot use 'this' outside of a method".to_string(),
    }
}

/// `"dir/util.kn"` imports as the global `util`.
fn module_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_vm::debug::disassemble_recursive;

    fn compile_str(source: &str) -> Result<Rc<Function>, Vec<CompileError>> {
        let tokens = kiln_lexer::lex(source).expect("lex failed");
        let program = kiln_parser::parse(tokens).expect("parse failed");
        compile(&program)
    }

    fn dis(source: &str) -> String {
        let func = compile_str(source).expect("compile failed");
        disassemble_recursive(&func.chunk, &func.name)
    }

    fn first_error(source: &str) -> CompileError {
        match compile_str(source) {
            Ok(_) => panic!("expected a compile error for: {source}"),
            Err(errors) => errors.into_iter().next().expect("no errors recorded"),
        }
    }

    #[test]
    fn top_level_let_defines_a_global() {
        let text = dis("let x = 1;");
        assert!(text.contains("CONSTANT"), "{text}");
        assert!(text.contains("DEFINE_GLOBAL"), "{text}");
        assert!(text.contains("'x'"), "{text}");
    }

    #[test]
    fn block_let_uses_local_slots() {
        let text = dis("{ let x = 1; print x; }");
        assert!(text.contains("GET_LOCAL"), "{text}");
        assert!(!text.contains("GET_GLOBAL"), "{text}");
        // Scope end pops the local.
        assert!(text.contains("POP"), "{text}");
    }

    #[test]
    fn missing_initializer_defaults_to_nil() {
        let text = dis("let x;");
        assert!(text.contains("NIL"), "{text}");
        assert!(text.contains("DEFINE_GLOBAL"), "{text}");
    }

    #[test]
    fn own_initializer_read_is_an_error() {
        let err = first_error("{ let a = a; }");
        assert_eq!(err.message, "cannot read local variable 'a' in its own initializer");
    }

    #[test]
    fn shadowing_outer_scopes_is_allowed() {
        assert!(compile_str("{ let a = 1; { let a = 2; print a; } }").is_ok());
        let err = first_error("{ let a = 1; let a = 2; }");
        assert_eq!(err.message, "variable 'a' is already declared in this scope");
    }

    #[test]
    fn const_assignment_is_rejected() {
        let err = first_error("const x = 1; x = 2;");
        assert_eq!(err.message, "cannot assign to const 'x'");
        let err = first_error("{ const y = 1; y += 1; }");
        assert_eq!(err.message, "cannot assign to const 'y'");
        let err = first_error("const z = 1; z++;");
        assert_eq!(err.message, "cannot assign to const 'z'");
    }

    #[test]
    fn break_and_skip_require_a_loop() {
        assert_eq!(first_error("break;").message, "cannot use 'break' outside of a loop");
        assert_eq!(first_error("skip;").message, "cannot use 'skip' outside of a loop");
    }

    #[test]
    fn return_at_top_level_is_rejected() {
        assert_eq!(first_error("ret 1;").message, "cannot return from top-level code");
    }

    #[test]
    fn this_and_base_are_method_only() {
        assert_eq!(first_error("print this;").message, "cannot use 'this' outside of a method");
        assert_eq!(
            first_error("fn f() { ret this; }").message,
            "cannot use 'this' outside of a method"
        );
        assert_eq!(
            first_error("cls A { static s() { ret this; } }").message,
            "cannot use 'this' in a static method"
        );
        assert_eq!(
            first_error("cls A { m() { ret base.m(); } }").message,
            "cannot use 'base' in a class with no superclass"
        );
    }

    #[test]
    fn ctor_cannot_return_a_value() {
        let err = first_error("cls A { ctor() { ret 1; } }");
        assert_eq!(err.message, "cannot return a value from a ctor");
        assert!(compile_str("cls A { ctor() { ret; } }").is_ok());
    }

    #[test]
    fn lambdas_cannot_capture_locals() {
        let err = first_error("fn f() { let x = 1; let g = () -> x; }");
        assert_eq!(err.message, "cannot capture 'x' from an enclosing function");
        // Globals resolve late, so referencing one from a lambda is fine.
        assert!(compile_str("let x = 1; fn f() { ret () -> x; }").is_ok());
    }

    #[test]
    fn imports_are_top_level_only() {
        assert_eq!(
            first_error("fn f() { import \"m.kn\"; }").message,
            "'import' is only allowed at top level"
        );
        assert_eq!(
            first_error("{ from \"m.kn\" import a; }").message,
            "'from' is only allowed at top level"
        );
    }

    #[test]
    fn self_inheritance_is_rejected() {
        let err = first_error("cls A : A {}");
        assert_eq!(err.message, "class 'A' cannot inherit from itself");
    }

    #[test]
    fn while_compiles_to_a_backward_loop() {
        let text = dis("let i = 0; while (i < 3) i = i + 1;");
        assert!(text.contains("JUMP_IF_FALSE"), "{text}");
        assert!(text.contains("LOOP"), "{text}");
    }

    #[test]
    fn for_in_uses_the_iterator_protocol() {
        let text = dis("for (i in 0..5) print i;");
        assert!(text.contains("RANGE"), "{text}");
        assert!(text.contains("ITER_NEW"), "{text}");
        assert!(text.contains("ITER_NEXT"), "{text}");
        assert!(text.contains("LOOP"), "{text}");
    }

    #[test]
    fn method_calls_fuse_into_invoke() {
        let text = dis("let a = [1]; a.push(2);");
        assert!(text.contains("INVOKE"), "{text}");
        assert!(text.contains("'push' (1 args)"), "{text}");
        assert!(!text.contains("GET_FIELD"), "{text}");
    }

    #[test]
    fn bare_member_access_stays_get_field() {
        let text = dis("let a = x.y;");
        assert!(text.contains("GET_FIELD"), "{text}");
        assert!(!text.contains("INVOKE"), "{text}");
    }

    #[test]
    fn postfix_member_incdec_reads_twice() {
        let text = dis("o.n++;");
        assert!(text.contains("ROT3"), "{text}");
        assert!(text.contains("SET_FIELD"), "{text}");
    }

    #[test]
    fn compound_index_assign_dups_the_pair() {
        let text = dis("a[0] += 1;");
        assert!(text.contains("DUP2"), "{text}");
        assert!(text.contains("GET_INDEX"), "{text}");
        assert!(text.contains("SET_INDEX"), "{text}");
    }

    #[test]
    fn try_blocks_are_bracketed() {
        let text = dis("try { print 1; } catch (e) { print e; }");
        assert!(text.contains("TRY_PUSH"), "{text}");
        assert!(text.contains("TRY_POP"), "{text}");
    }

    #[test]
    fn break_inside_try_closes_the_handler() {
        // One TryPop from the break itself, one on the normal exit path.
        let text = dis("while (true) { try { break; } catch (e) {} }");
        assert_eq!(text.matches("TRY_POP").count(), 2, "{text}");
    }

    #[test]
    fn classes_emit_method_tables() {
        let text = dis(
            "cls Greeter {\n\
             \x20 ctor() { this.greeting = \"hi\"; }\n\
             \x20 greet(name) { ret this.greeting + name; }\n\
             \x20 static version() { ret 1; }\n\
             }",
        );
        assert!(text.contains("CLASS"), "{text}");
        assert!(text.contains("METHOD"), "{text}");
        assert!(text.contains("'ctor'"), "{text}");
        assert!(text.contains("STATIC_METHOD"), "{text}");
        assert!(text.contains("== greet =="), "{text}");
    }

    #[test]
    fn ctor_returns_the_receiver() {
        let text = dis("cls A { ctor() {} }");
        // The ctor body ends with GetLocal 0 + Ret rather than Nil + Ret.
        let ctor_dump = text.split("== ctor ==").nth(1).expect("no ctor chunk");
        assert!(ctor_dump.contains("GET_LOCAL"), "{ctor_dump}");
    }

    #[test]
    fn base_calls_use_invoke_base() {
        let text = dis(
            "cls A { m() { ret 1; } }\n\
             cls B : A { m() { ret base.m(); } }",
        );
        assert!(text.contains("INHERIT"), "{text}");
        assert!(text.contains("INVOKE_BASE"), "{text}");
    }

    #[test]
    fn from_import_binds_each_name() {
        let text = dis("from \"lib.kn\" import helper, value;");
        assert_eq!(text.matches("IMPORT").count(), 2, "{text}");
        assert!(text.contains("'helper'"), "{text}");
        assert!(text.contains("'value'"), "{text}");
        assert_eq!(text.matches("DEFINE_GLOBAL").count(), 2, "{text}");
    }

    #[test]
    fn import_binds_the_file_stem() {
        let text = dis("import \"dir/util.kn\";");
        assert!(text.contains("'dir/util.kn'"), "{text}");
        assert!(text.contains("'util'"), "{text}");
    }

    #[test]
    fn errors_are_collected_per_statement() {
        let errors = match compile_str("break;\nret 1;\nlet ok = 1;") {
            Ok(_) => panic!("expected errors"),
            Err(errors) => errors,
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[1].line, 2);
    }

    #[test]
    fn lambda_bodies_compile_as_functions() {
        let text = dis("let f = (a, b) -> a + b;");
        assert!(text.contains("== lambda =="), "{text}");
        assert!(text.contains("ADD"), "{text}");
    }
}
