//! Single-pass bytecode compiler.
//!
//! One [`FnCtx`] exists per function being compiled; nested function
//! literals push a new context and pop it when their `Closure` emission is
//! done. Identifier resolution walks local slots back-to-front, then
//! enclosing contexts (producing upvalues and marking captured locals),
//! then falls back to a late-bound global.
//!
//! Static typing is enforced here, at declaration/assignment sites, call
//! boundaries, and operators. Reference types auto-dereference at value
//! use sites; assignment to reference bindings distinguishes rebinding
//! (`p = ref x`) from updating (`*p = v`), and struct fields of reference
//! type dispatch on the assigned value's type instead (no `*` syntax for
//! fields).
//!
//! The compiler fails fast: the first error aborts with a `[line N]`
//! prefix.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use noxy_core::chunk::{Chunk, OpCode};
use noxy_core::value::{Function, StructShape, Value};

use crate::ast::{
    BinaryOp, Expr, ExprKind, FuncLit, Stmt, StmtKind, UnaryOp, UseSelect, WhenOp,
};
use crate::types::Type;

/// Hard limit on local slots per function (slots are one byte).
const MAX_LOCALS: usize = 256;
/// Hard limit on upvalues per function.
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

/// A user struct known to the compiler: runtime shape plus field types.
#[derive(Debug, Clone)]
pub struct StructInfo {
    pub shape: Arc<StructShape>,
    pub field_types: Vec<(String, Type)>,
}

impl StructInfo {
    pub fn field_type(&self, name: &str) -> Option<&Type> {
        self.field_types
            .iter()
            .find(|(f, _)| f == name)
            .map(|(_, t)| t)
    }
}

/// Compiler state that survives across compilations: global types and
/// struct definitions. The REPL and the module loader feed each compile
/// the session of the previous one.
#[derive(Debug, Default, Clone)]
pub struct CompileSession {
    pub globals: HashMap<String, Type>,
    pub structs: HashMap<String, StructInfo>,
}

impl CompileSession {
    /// Seed the session with native function names so calls to them
    /// type-check as generic `func` callables.
    pub fn with_natives<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut session = CompileSession::default();
        for name in names {
            session.globals.insert(name.to_string(), Type::Func);
        }
        session
    }
}

/// Compile a parsed program into the top-level script function.
pub fn compile(
    program: &[Stmt],
    session: &mut CompileSession,
    file: Option<&str>,
) -> Result<Arc<Function>, CompileError> {
    let mut compiler = Compiler {
        session,
        ctxs: Vec::new(),
        line: 0,
        file: file.map(str::to_string),
    };
    compiler.push_ctx("<script>", Type::Void);
    for stmt in program {
        compiler.statement(stmt)?;
    }
    compiler.emit(OpCode::Null);
    compiler.emit(OpCode::Return);
    let ctx = compiler.ctxs.pop().expect("script context missing");
    Ok(Arc::new(Function {
        name: "<script>".to_string(),
        arity: 0,
        upvalue_count: 0,
        param_refs: Vec::new(),
        chunk: ctx.chunk,
    }))
}

#[derive(Debug)]
struct Local {
    name: String,
    ty: Type,
    depth: usize,
    captured: bool,
}

#[derive(Debug)]
struct LoopCtx {
    /// Number of locals live when the loop was entered; `break` pops down
    /// to this level before jumping.
    local_count: usize,
    /// Operand offsets of pending break jumps, patched at loop end.
    breaks: Vec<usize>,
}

#[derive(Debug)]
struct FnCtx {
    chunk: Chunk,
    locals: Vec<Local>,
    /// `(index, is_local)` per captured variable, in closure order.
    upvalues: Vec<(u8, bool)>,
    upvalue_types: Vec<Type>,
    scope_depth: usize,
    loops: Vec<LoopCtx>,
    return_type: Type,
}

/// Where an identifier resolved to.
enum Binding {
    Local(usize, Type),
    Upvalue(u8, Type),
    Global(Option<Type>),
}

pub struct Compiler<'s> {
    session: &'s mut CompileSession,
    ctxs: Vec<FnCtx>,
    line: u32,
    file: Option<String>,
}

impl<'s> Compiler<'s> {
    // ------------------------------------------------------------------
    // Context and emission plumbing
    // ------------------------------------------------------------------

    fn push_ctx(&mut self, name: &str, return_type: Type) {
        let mut chunk = Chunk::new();
        chunk.file = self.file.clone();
        let mut ctx = FnCtx {
            chunk,
            locals: Vec::new(),
            upvalues: Vec::new(),
            upvalue_types: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            return_type,
        };
        // Slot 0 holds the callee itself and is never user-addressable.
        ctx.locals.push(Local {
            name: name.to_string(),
            ty: Type::Any,
            depth: 0,
            captured: false,
        });
        self.ctxs.push(ctx);
    }

    fn ctx(&mut self) -> &mut FnCtx {
        self.ctxs.last_mut().expect("no active function context")
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            line: self.line,
            message: message.into(),
        }
    }

    fn emit(&mut self, op: OpCode) {
        let line = self.line;
        self.ctx().chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line;
        self.ctx().chunk.write(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.emit_byte(hi);
        self.emit_byte(lo);
    }

    fn make_constant(&mut self, value: Value) -> Result<u16, CompileError> {
        let idx = self.ctx().chunk.add_constant(value);
        if idx > u16::MAX as usize {
            return Err(self.err("too many constants in one chunk"));
        }
        Ok(idx as u16)
    }

    /// Emit a push of `value` from the constant pool.
    fn emit_constant(&mut self, value: Value) -> Result<(), CompileError> {
        let idx = self.make_constant(value)?;
        if idx <= u8::MAX as u16 {
            self.emit(OpCode::Constant);
            self.emit_byte(idx as u8);
        } else {
            self.emit(OpCode::ConstantLong);
            self.emit_u16(idx);
        }
        Ok(())
    }

    /// Intern a name in the constant pool for a name-carrying instruction.
    fn name_constant(&mut self, name: &str) -> Result<u16, CompileError> {
        self.make_constant(Value::string(name))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.ctx().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, operand: usize) -> Result<(), CompileError> {
        let target = self.ctx().chunk.code.len();
        let jump = target - operand - 2;
        if jump > u16::MAX as usize {
            return Err(self.err("too much code to jump over"));
        }
        let [hi, lo] = (jump as u16).to_be_bytes();
        self.ctx().chunk.code[operand] = hi;
        self.ctx().chunk.code[operand + 1] = lo;
        Ok(())
    }

    fn emit_loop(&mut self, start: usize) -> Result<(), CompileError> {
        self.emit(OpCode::Loop);
        let jump = self.ctx().chunk.code.len() - start + 2;
        if jump > u16::MAX as usize {
            return Err(self.err("loop body too large"));
        }
        let [hi, lo] = (jump as u16).to_be_bytes();
        self.emit_byte(hi);
        self.emit_byte(lo);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scopes and resolution
    // ------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.ctx().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let ctx = self.ctx();
            ctx.scope_depth -= 1;
            ctx.scope_depth
        };
        loop {
            let captured = {
                let ctx = self.ctx();
                match ctx.locals.last() {
                    Some(local) if local.depth > depth => Some(local.captured),
                    _ => None,
                }
            };
            match captured {
                Some(true) => {
                    self.emit(OpCode::CloseUpvalue);
                    self.ctx().locals.pop();
                }
                Some(false) => {
                    self.emit(OpCode::Pop);
                    self.ctx().locals.pop();
                }
                None => break,
            }
        }
    }

    fn declare_local(&mut self, name: &str, ty: Type) -> Result<u8, CompileError> {
        let depth = self.ctx().scope_depth;
        let duplicate = self
            .ctx()
            .locals
            .iter()
            .skip(1)
            .any(|l| l.depth == depth && l.name == name);
        if duplicate && !name.starts_with('$') {
            return Err(self.err(format!("variable '{}' already declared in this scope", name)));
        }
        if self.ctx().locals.len() >= MAX_LOCALS {
            return Err(self.err("too many local variables in function"));
        }
        let ctx = self.ctx();
        ctx.locals.push(Local {
            name: name.to_string(),
            ty,
            depth,
            captured: false,
        });
        Ok((ctx.locals.len() - 1) as u8)
    }

    fn resolve_local_in(&self, ctx_idx: usize, name: &str) -> Option<usize> {
        let ctx = &self.ctxs[ctx_idx];
        ctx.locals
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, _)| i)
    }

    fn add_upvalue(
        &mut self,
        ctx_idx: usize,
        index: u8,
        is_local: bool,
        ty: Type,
    ) -> Result<u8, CompileError> {
        for (i, &(idx, local)) in self.ctxs[ctx_idx].upvalues.iter().enumerate() {
            if idx == index && local == is_local {
                return Ok(i as u8);
            }
        }
        if self.ctxs[ctx_idx].upvalues.len() >= MAX_UPVALUES {
            return Err(self.err("too many captured variables in function"));
        }
        self.ctxs[ctx_idx].upvalues.push((index, is_local));
        self.ctxs[ctx_idx].upvalue_types.push(ty);
        Ok((self.ctxs[ctx_idx].upvalues.len() - 1) as u8)
    }

    /// Walk enclosing contexts looking for `name`, marking captured locals
    /// and threading chained upvalues on the way.
    fn resolve_upvalue(
        &mut self,
        ctx_idx: usize,
        name: &str,
    ) -> Result<Option<(u8, Type)>, CompileError> {
        if ctx_idx == 0 {
            return Ok(None);
        }
        let parent = ctx_idx - 1;
        if let Some(slot) = self.resolve_local_in(parent, name) {
            self.ctxs[parent].locals[slot].captured = true;
            let ty = self.ctxs[parent].locals[slot].ty.clone();
            let idx = self.add_upvalue(ctx_idx, slot as u8, true, ty.clone())?;
            return Ok(Some((idx, ty)));
        }
        if let Some((parent_idx, ty)) = self.resolve_upvalue(parent, name)? {
            let idx = self.add_upvalue(ctx_idx, parent_idx, false, ty.clone())?;
            return Ok(Some((idx, ty)));
        }
        Ok(None)
    }

    fn resolve(&mut self, name: &str) -> Result<Binding, CompileError> {
        let current = self.ctxs.len() - 1;
        if let Some(slot) = self.resolve_local_in(current, name) {
            let ty = self.ctxs[current].locals[slot].ty.clone();
            return Ok(Binding::Local(slot, ty));
        }
        if let Some((idx, ty)) = self.resolve_upvalue(current, name)? {
            return Ok(Binding::Upvalue(idx, ty));
        }
        Ok(Binding::Global(self.session.globals.get(name).cloned()))
    }

    /// True when `name` resolves to a local or captured variable in any
    /// enclosing context (used to decide whether a builtin is shadowed).
    fn is_shadowed(&self, name: &str) -> bool {
        (0..self.ctxs.len()).any(|i| self.resolve_local_in(i, name).is_some())
    }

    // ------------------------------------------------------------------
    // Type helpers
    // ------------------------------------------------------------------

    /// Verify every struct name mentioned by `ty` is declared.
    fn validate_type(&self, ty: &Type) -> Result<(), CompileError> {
        match ty {
            Type::Named(name) => {
                if self.session.structs.contains_key(name) {
                    Ok(())
                } else {
                    Err(self.err(format!("unknown type '{}'", name)))
                }
            }
            Type::Array(elem, _) | Type::Ref(elem) | Type::Chan(elem) => self.validate_type(elem),
            Type::Map(key, value) => {
                self.validate_type(key)?;
                self.validate_type(value)
            }
            Type::Function { params, ret } => {
                for p in params {
                    self.validate_type(p)?;
                }
                self.validate_type(ret)
            }
            _ => Ok(()),
        }
    }

    /// If `ty` is a reference, emit a dereference and return the pointee.
    fn deref_if_ref(&mut self, ty: Type) -> Type {
        if let Type::Ref(inner) = ty {
            self.emit(OpCode::Deref);
            *inner
        } else {
            ty
        }
    }

    fn check_assignable(
        &self,
        expected: &Type,
        actual: &Type,
        what: &str,
    ) -> Result<(), CompileError> {
        if expected.accepts(actual) {
            Ok(())
        } else {
            Err(self.err(format!(
                "type mismatch: {} expects {}, got {}",
                what, expected, actual
            )))
        }
    }

    /// Compile a boolean condition (auto-dereferenced).
    fn condition(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let ty = self.expression(expr)?;
        let ty = self.deref_if_ref(ty);
        if !matches!(ty, Type::Bool | Type::Any) {
            return Err(self.err(format!("condition must be bool, got {}", ty)));
        }
        Ok(())
    }

    fn unify(a: Type, b: &Type) -> Type {
        if a == *b {
            a
        } else {
            Type::Any
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn statement(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::Let { name, ty, init } => self.let_statement(name, ty, init.as_ref()),
            StmtKind::Assign { target, value } => self.assign_statement(target, value),
            StmtKind::RefAssign { target, value } => self.ref_assign_statement(target, value),
            StmtKind::Expr(expr) => {
                self.expression(expr)?;
                self.emit(OpCode::Pop);
                Ok(())
            }
            StmtKind::Return(value) => self.return_statement(value.as_ref()),
            StmtKind::Break => self.break_statement(),
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => self.if_statement(cond, then_block, else_block.as_deref()),
            StmtKind::While { cond, body } => self.while_statement(cond, body),
            StmtKind::For {
                var,
                iterable,
                body,
            } => self.for_statement(var, iterable, body),
            StmtKind::StructDef { name, fields } => self.struct_statement(name, fields),
            StmtKind::FuncDef(lit) => self.func_statement(lit),
            StmtKind::Use {
                path,
                alias,
                select,
            } => self.use_statement(path, alias.as_deref(), select.as_ref()),
            StmtKind::When { cases, default } => self.when_statement(cases, default.as_deref()),
        }
    }

    fn at_top_level(&self) -> bool {
        self.ctxs.len() == 1 && self.ctxs[0].scope_depth == 0
    }

    fn let_statement(
        &mut self,
        name: &str,
        declared: &Type,
        init: Option<&Expr>,
    ) -> Result<(), CompileError> {
        self.validate_type(declared)?;

        match init {
            Some(expr) => {
                let mut actual = self.expression(expr)?;
                if !declared.is_ref() && actual.is_ref() {
                    actual = self.deref_if_ref(actual);
                }
                self.check_assignable(declared, &actual, &format!("'{}'", name))?;
            }
            None => self.emit_zero_value(declared)?,
        }

        if self.at_top_level() {
            let idx = self.name_constant(name)?;
            self.emit(OpCode::SetGlobal);
            self.emit_u16(idx);
            self.session
                .globals
                .insert(name.to_string(), declared.clone());
        } else {
            self.declare_local(name, declared.clone())?;
        }
        Ok(())
    }

    /// The value a declared-but-uninitialized variable starts with.
    fn emit_zero_value(&mut self, ty: &Type) -> Result<(), CompileError> {
        match ty {
            Type::Int => self.emit_constant(Value::Int(0)),
            Type::Float => self.emit_constant(Value::Float(0.0)),
            Type::Bool => {
                self.emit(OpCode::False);
                Ok(())
            }
            Type::Str => self.emit_constant(Value::string("")),
            _ => {
                self.emit(OpCode::Null);
                Ok(())
            }
        }
    }

    fn assign_statement(&mut self, target: &Expr, value: &Expr) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let binding = self.resolve(name)?;
                match binding {
                    Binding::Local(slot, ty) => {
                        self.assign_to_binding(&ty, name, value)?;
                        self.emit(OpCode::SetLocal);
                        self.emit_byte(slot as u8);
                        Ok(())
                    }
                    Binding::Upvalue(idx, ty) => {
                        self.assign_to_binding(&ty, name, value)?;
                        self.emit(OpCode::SetUpvalue);
                        self.emit_byte(idx);
                        Ok(())
                    }
                    Binding::Global(Some(ty)) => {
                        self.assign_to_binding(&ty, name, value)?;
                        let idx = self.name_constant(name)?;
                        self.emit(OpCode::SetGlobal);
                        self.emit_u16(idx);
                        Ok(())
                    }
                    Binding::Global(None) => Err(self.err(format!(
                        "cannot assign to undefined variable '{}'",
                        name
                    ))),
                }
            }
            ExprKind::Member {
                target: object,
                name,
            } => self.member_assign(object, name, value),
            ExprKind::Index {
                target: collection,
                index,
            } => self.index_assign(collection, index, value),
            _ => Err(self.err("invalid assignment target")),
        }
    }

    /// Compile `value` for an assignment to a binding of type `ty`,
    /// enforcing the rebind-only rule for reference bindings.
    fn assign_to_binding(
        &mut self,
        ty: &Type,
        name: &str,
        value: &Expr,
    ) -> Result<(), CompileError> {
        if ty.is_ref() {
            // A reference binding accepts only another reference (rebind)
            // or null; updating the referent requires `*name = …`.
            let actual = self.expression(value)?;
            if actual.is_ref() || matches!(value.kind, ExprKind::Null) {
                self.check_assignable(ty, &actual, &format!("'{}'", name))?;
                return Ok(());
            }
            return Err(self.err(format!(
                "cannot assign a plain value to reference '{}'; write '*{} = …' to update the referent or rebind with 'ref …'",
                name, name
            )));
        }
        let actual = self.expression(value)?;
        let actual = self.deref_if_ref(actual);
        self.check_assignable(ty, &actual, &format!("'{}'", name))
    }

    fn member_assign(
        &mut self,
        object: &Expr,
        name: &str,
        value: &Expr,
    ) -> Result<(), CompileError> {
        let obj_ty = self.expression(object)?;
        let obj_ty = self.deref_if_ref(obj_ty);
        let field_ty = match &obj_ty {
            Type::Named(struct_name) => {
                let info = self
                    .session
                    .structs
                    .get(struct_name)
                    .ok_or_else(|| self.err(format!("unknown type '{}'", struct_name)))?;
                info.field_type(name)
                    .cloned()
                    .ok_or_else(|| {
                        self.err(format!("struct {} has no field '{}'", struct_name, name))
                    })?
            }
            Type::Map(_, v) => (**v).clone(),
            Type::Any => Type::Any,
            other => {
                return Err(self.err(format!("cannot assign to member '{}' on {}", name, other)))
            }
        };

        let idx = self.name_constant(name)?;
        if field_ty.is_ref() {
            // Type-based dispatch: a reference (or null) rebinds the field;
            // a plain value updates through the stored reference.
            let actual = self.expression(value)?;
            if actual.is_ref() || matches!(value.kind, ExprKind::Null) {
                self.check_assignable(&field_ty, &actual, &format!("field '{}'", name))?;
                self.emit(OpCode::SetProperty);
                self.emit_u16(idx);
            } else {
                self.check_assignable(field_ty.deref(), &actual, &format!("field '{}'", name))?;
                self.emit(OpCode::SetPropertyDeref);
                self.emit_u16(idx);
            }
        } else {
            let actual = self.expression(value)?;
            let actual = self.deref_if_ref(actual);
            self.check_assignable(&field_ty, &actual, &format!("field '{}'", name))?;
            self.emit(OpCode::SetProperty);
            self.emit_u16(idx);
        }
        Ok(())
    }

    fn index_assign(
        &mut self,
        collection: &Expr,
        index: &Expr,
        value: &Expr,
    ) -> Result<(), CompileError> {
        let coll_ty = self.expression(collection)?;
        let coll_ty = self.deref_if_ref(coll_ty);
        let idx_ty = self.expression(index)?;
        let idx_ty = self.deref_if_ref(idx_ty);

        let elem_ty = match &coll_ty {
            Type::Array(elem, _) => {
                self.check_assignable(&Type::Int, &idx_ty, "array index")?;
                (**elem).clone()
            }
            Type::Map(key, val) => {
                self.check_assignable(key, &idx_ty, "map key")?;
                (**val).clone()
            }
            Type::Bytes => {
                self.check_assignable(&Type::Int, &idx_ty, "bytes index")?;
                Type::Int
            }
            Type::Any => Type::Any,
            other => return Err(self.err(format!("cannot index {}", other))),
        };

        let val_ty = self.expression(value)?;
        let val_ty = if elem_ty.is_ref() {
            val_ty
        } else {
            self.deref_if_ref(val_ty)
        };
        self.check_assignable(&elem_ty, &val_ty, "element")?;
        self.emit(OpCode::SetIndex);
        Ok(())
    }

    fn ref_assign_statement(&mut self, target: &Expr, value: &Expr) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let binding = self.resolve(name)?;
                match binding {
                    Binding::Local(slot, ty) => {
                        let inner = self.ref_pointee(&ty, name)?;
                        let val_ty = self.expression(value)?;
                        let val_ty = self.deref_if_ref(val_ty);
                        self.check_assignable(&inner, &val_ty, &format!("'*{}'", name))?;
                        self.emit(OpCode::StoreViaRef);
                        self.emit_byte(slot as u8);
                        Ok(())
                    }
                    Binding::Upvalue(idx, ty) => {
                        let inner = self.ref_pointee(&ty, name)?;
                        self.emit(OpCode::GetUpvalue);
                        self.emit_byte(idx);
                        let val_ty = self.expression(value)?;
                        let val_ty = self.deref_if_ref(val_ty);
                        self.check_assignable(&inner, &val_ty, &format!("'*{}'", name))?;
                        self.emit(OpCode::StoreRef);
                        Ok(())
                    }
                    Binding::Global(ty) => {
                        let ty = ty.ok_or_else(|| {
                            self.err(format!("undefined variable '{}'", name))
                        })?;
                        let inner = self.ref_pointee(&ty, name)?;
                        let idx = self.name_constant(name)?;
                        self.emit(OpCode::GetGlobal);
                        self.emit_u16(idx);
                        let val_ty = self.expression(value)?;
                        let val_ty = self.deref_if_ref(val_ty);
                        self.check_assignable(&inner, &val_ty, &format!("'*{}'", name))?;
                        self.emit(OpCode::StoreRef);
                        Ok(())
                    }
                }
            }
            // `*node.next = v` / `*xs[i] = v`: push the stored reference,
            // then write through it.
            ExprKind::Member { .. } | ExprKind::Index { .. } => {
                let ty = self.expression(target)?;
                if !matches!(ty, Type::Ref(_) | Type::Any) {
                    return Err(self.err(format!("'*' update requires a reference, got {}", ty)));
                }
                let inner = ty.deref().clone();
                let val_ty = self.expression(value)?;
                let val_ty = self.deref_if_ref(val_ty);
                self.check_assignable(&inner, &val_ty, "'*' update")?;
                self.emit(OpCode::StoreRef);
                Ok(())
            }
            _ => Err(self.err("'*' update requires a reference variable, field, or index")),
        }
    }

    fn ref_pointee(&self, ty: &Type, name: &str) -> Result<Type, CompileError> {
        match ty {
            Type::Ref(inner) => Ok((**inner).clone()),
            Type::Any => Ok(Type::Any),
            other => Err(self.err(format!(
                "'*' update requires a reference, '{}' has type {}",
                name, other
            ))),
        }
    }

    fn return_statement(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        if self.ctxs.len() == 1 {
            return Err(self.err("cannot return from top-level code"));
        }
        let return_type = self.ctx().return_type.clone();
        match value {
            Some(expr) => {
                let ty = self.expression(expr)?;
                let ty = if !return_type.is_ref() && ty.is_ref() {
                    // Preserve value semantics at function boundaries: the
                    // caller receives a copy, not a view into our frame.
                    self.emit(OpCode::Deref);
                    self.emit(OpCode::Copy);
                    ty.deref().clone()
                } else {
                    ty
                };
                if return_type == Type::Void {
                    return Err(self.err("cannot return a value from a void function"));
                }
                self.check_assignable(&return_type, &ty, "return value")?;
            }
            None => {
                if !matches!(return_type, Type::Void | Type::Any) {
                    return Err(self.err(format!(
                        "missing return value in function returning {}",
                        return_type
                    )));
                }
                self.emit(OpCode::Null);
            }
        }
        self.emit(OpCode::Return);
        Ok(())
    }

    fn break_statement(&mut self) -> Result<(), CompileError> {
        let Some(loop_ctx) = self.ctx().loops.last() else {
            return Err(self.err("'break' outside of a loop"));
        };
        let level = loop_ctx.local_count;
        // Pop body locals without forgetting them; the loop keeps compiling.
        let flags: Vec<bool> = self.ctx().locals[level..]
            .iter()
            .map(|l| l.captured)
            .collect();
        for captured in flags.into_iter().rev() {
            if captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
        }
        let operand = self.emit_jump(OpCode::Jump);
        self.ctx()
            .loops
            .last_mut()
            .expect("loop context disappeared")
            .breaks
            .push(operand);
        Ok(())
    }

    fn if_statement(
        &mut self,
        cond: &Expr,
        then_block: &[Stmt],
        else_block: Option<&[Stmt]>,
    ) -> Result<(), CompileError> {
        self.condition(cond)?;
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.begin_scope();
        for stmt in then_block {
            self.statement(stmt)?;
        }
        self.end_scope();
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump)?;
        self.emit(OpCode::Pop);
        if let Some(block) = else_block {
            self.begin_scope();
            for stmt in block {
                self.statement(stmt)?;
            }
            self.end_scope();
        }
        self.patch_jump(end_jump)?;
        Ok(())
    }

    fn while_statement(&mut self, cond: &Expr, body: &[Stmt]) -> Result<(), CompileError> {
        let loop_start = self.ctx().chunk.code.len();
        self.condition(cond)?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);

        let local_count = self.ctx().locals.len();
        self.ctx().loops.push(LoopCtx {
            local_count,
            breaks: Vec::new(),
        });

        self.begin_scope();
        for stmt in body {
            self.statement(stmt)?;
        }
        self.end_scope();
        self.emit_loop(loop_start)?;

        self.patch_jump(exit_jump)?;
        self.emit(OpCode::Pop);

        let breaks = self.ctx().loops.pop().expect("loop context missing").breaks;
        for operand in breaks {
            self.patch_jump(operand)?;
        }
        Ok(())
    }

    fn for_statement(
        &mut self,
        var: &str,
        iterable: &Expr,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        self.begin_scope();

        // Hidden locals: the (possibly keys-converted) collection, the
        // running index, and the cached length.
        let mark = self.ctx().chunk.code.len();
        let iter_ty = self.expression(iterable)?;
        let iter_ty = self.deref_if_ref(iter_ty);
        let (elem_ty, is_map) = match &iter_ty {
            Type::Array(elem, _) => ((**elem).clone(), false),
            Type::Map(key, _) => ((**key).clone(), true),
            Type::Any => (Type::Any, false),
            other => return Err(self.err(format!("cannot iterate over {}", other))),
        };

        let iter_ty = if is_map {
            // Maps iterate over a snapshot of their keys. The callee must
            // sit below its argument, so splice the keys() load in front of
            // the already-compiled collection; jumps inside it are relative
            // and unaffected by the shift.
            let keys_idx = self.name_constant("keys")?;
            let [hi, lo] = keys_idx.to_be_bytes();
            let line = self.line;
            let ctx = self.ctx();
            ctx.chunk.code.insert(mark, OpCode::GetGlobal as u8);
            ctx.chunk.code.insert(mark + 1, hi);
            ctx.chunk.code.insert(mark + 2, lo);
            for _ in 0..3 {
                ctx.chunk.lines.insert(mark, line);
            }
            self.emit(OpCode::Call);
            self.emit_byte(1);
            Type::Array(Box::new(elem_ty.clone()), 0)
        } else {
            iter_ty
        };
        let iter_slot = self.declare_local("$iter", iter_ty)?;

        self.emit_constant(Value::Int(0))?;
        let idx_slot = self.declare_local("$idx", Type::Int)?;

        self.emit(OpCode::GetLocal);
        self.emit_byte(iter_slot);
        self.emit(OpCode::Len);
        let len_slot = self.declare_local("$len", Type::Int)?;

        let loop_start = self.ctx().chunk.code.len();
        self.emit(OpCode::GetLocal);
        self.emit_byte(idx_slot);
        self.emit(OpCode::GetLocal);
        self.emit_byte(len_slot);
        self.emit(OpCode::LessInt);
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);

        let local_count = self.ctx().locals.len();
        self.ctx().loops.push(LoopCtx {
            local_count,
            breaks: Vec::new(),
        });

        self.begin_scope();
        self.emit(OpCode::GetLocal);
        self.emit_byte(iter_slot);
        self.emit(OpCode::GetLocal);
        self.emit_byte(idx_slot);
        self.emit(OpCode::GetIndex);
        self.declare_local(var, elem_ty)?;
        for stmt in body {
            self.statement(stmt)?;
        }
        self.end_scope();

        self.emit(OpCode::GetLocal);
        self.emit_byte(idx_slot);
        self.emit_constant(Value::Int(1))?;
        self.emit(OpCode::AddInt);
        self.emit(OpCode::SetLocal);
        self.emit_byte(idx_slot);
        self.emit_loop(loop_start)?;

        self.patch_jump(exit_jump)?;
        self.emit(OpCode::Pop);

        let breaks = self.ctx().loops.pop().expect("loop context missing").breaks;
        for operand in breaks {
            self.patch_jump(operand)?;
        }

        self.end_scope();
        Ok(())
    }

    fn struct_statement(
        &mut self,
        name: &str,
        fields: &[(String, Type)],
    ) -> Result<(), CompileError> {
        if !self.at_top_level() {
            return Err(self.err("struct declarations are only allowed at top level"));
        }
        // Register before validating field types so self-referential
        // structs (`next: ref Node`) resolve.
        let shape = Arc::new(StructShape {
            name: name.to_string(),
            fields: fields.iter().map(|(f, _)| f.clone()).collect(),
        });
        self.session.structs.insert(
            name.to_string(),
            StructInfo {
                shape: Arc::clone(&shape),
                field_types: fields.to_vec(),
            },
        );
        for (_, ty) in fields {
            self.validate_type(ty)?;
        }

        self.emit_constant(Value::StructDef(shape))?;
        let idx = self.name_constant(name)?;
        self.emit(OpCode::SetGlobal);
        self.emit_u16(idx);
        self.session.globals.insert(
            name.to_string(),
            Type::Function {
                params: fields.iter().map(|(_, t)| t.clone()).collect(),
                ret: Box::new(Type::Named(name.to_string())),
            },
        );
        Ok(())
    }

    fn func_statement(&mut self, lit: &FuncLit) -> Result<(), CompileError> {
        let name = lit.name.as_deref().expect("parser guarantees a name");
        let signature = Type::Function {
            params: lit.params.iter().map(|p| p.ty.clone()).collect(),
            ret: Box::new(lit.return_type.clone()),
        };
        if self.at_top_level() {
            // Register the signature first so the body can recurse.
            self.session
                .globals
                .insert(name.to_string(), signature.clone());
            self.compile_function(lit)?;
            let idx = self.name_constant(name)?;
            self.emit(OpCode::SetGlobal);
            self.emit_u16(idx);
        } else {
            // Local function: reserve the slot first; the Closure the body
            // compiles into lands exactly there, so recursion resolves.
            self.declare_local(name, signature)?;
            self.compile_function(lit)?;
        }
        Ok(())
    }

    fn use_statement(
        &mut self,
        path: &[String],
        alias: Option<&str>,
        select: Option<&UseSelect>,
    ) -> Result<(), CompileError> {
        let module_name = path.join(".");
        let idx = self.name_constant(&module_name)?;
        self.emit(OpCode::Import);
        self.emit_u16(idx);
        match select {
            Some(UseSelect::All) => {
                self.emit(OpCode::ImportFromAll);
            }
            Some(UseSelect::Names(names)) => {
                for name in names {
                    self.emit(OpCode::Dup);
                    let prop = self.name_constant(name)?;
                    self.emit(OpCode::GetProperty);
                    self.emit_u16(prop);
                    let global = self.name_constant(name)?;
                    self.emit(OpCode::SetGlobal);
                    self.emit_u16(global);
                    self.session.globals.insert(name.clone(), Type::Any);
                }
                self.emit(OpCode::Pop);
            }
            None => {
                let binding = alias
                    .map(str::to_string)
                    .unwrap_or_else(|| path.last().expect("use path is non-empty").clone());
                let global = self.name_constant(&binding)?;
                self.emit(OpCode::SetGlobal);
                self.emit_u16(global);
                self.session.globals.insert(
                    binding,
                    Type::Map(Box::new(Type::Str), Box::new(Type::Any)),
                );
            }
        }
        Ok(())
    }

    fn when_statement(
        &mut self,
        cases: &[crate::ast::WhenCase],
        default: Option<&[Stmt]>,
    ) -> Result<(), CompileError> {
        // Lower each case to a (channel, value, mode) triplet; the default
        // case, when present, is the last triplet with nulls and mode 2.
        for case in cases {
            self.line = case.line;
            let chan_ty = self.expression(&case.channel)?;
            let chan_ty = self.deref_if_ref(chan_ty);
            let elem_ty = match &chan_ty {
                Type::Chan(elem) => (**elem).clone(),
                Type::Any => Type::Any,
                other => {
                    return Err(self.err(format!("'when' case requires a channel, got {}", other)))
                }
            };
            match &case.op {
                WhenOp::Recv => {
                    self.emit(OpCode::Null);
                    self.emit_constant(Value::Int(0))?;
                }
                WhenOp::Send(value) => {
                    let val_ty = self.expression(value)?;
                    let val_ty = self.deref_if_ref(val_ty);
                    self.check_assignable(&elem_ty, &val_ty, "channel send")?;
                    self.emit_constant(Value::Int(1))?;
                }
            }
        }
        let mut case_count = cases.len();
        if default.is_some() {
            self.emit(OpCode::Null);
            self.emit(OpCode::Null);
            self.emit_constant(Value::Int(2))?;
            case_count += 1;
        }
        if case_count > u8::MAX as usize {
            return Err(self.err("too many cases in 'when'"));
        }
        self.emit(OpCode::Select);
        self.emit_byte(case_count as u8);

        // Select leaves (winning_index, received_value, ok); bind them as
        // hidden locals for the dispatch ladder.
        self.begin_scope();
        let idx_slot = self.declare_local("$when_idx", Type::Int)?;
        let val_slot = self.declare_local("$when_val", Type::Any)?;
        let _ok_slot = self.declare_local("$when_ok", Type::Bool)?;

        let mut end_jumps = Vec::new();
        for (i, case) in cases.iter().enumerate() {
            self.line = case.line;
            self.emit(OpCode::GetLocal);
            self.emit_byte(idx_slot);
            self.emit_constant(Value::Int(i as i64))?;
            self.emit(OpCode::EqualInt);
            let next_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit(OpCode::Pop);

            self.begin_scope();
            if let Some(binding) = &case.binding {
                self.emit(OpCode::GetLocal);
                self.emit_byte(val_slot);
                self.declare_local(binding, Type::Any)?;
            }
            for stmt in &case.body {
                self.statement(stmt)?;
            }
            self.end_scope();

            end_jumps.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(next_jump)?;
            self.emit(OpCode::Pop);
        }

        if let Some(block) = default {
            self.begin_scope();
            for stmt in block {
                self.statement(stmt)?;
            }
            self.end_scope();
        }

        for operand in end_jumps {
            self.patch_jump(operand)?;
        }
        self.end_scope();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    fn compile_function(&mut self, lit: &FuncLit) -> Result<(), CompileError> {
        if lit.params.len() > u8::MAX as usize {
            return Err(self.err("too many parameters"));
        }
        self.validate_type(&lit.return_type)?;
        for param in &lit.params {
            self.validate_type(&param.ty)?;
        }

        let name = lit
            .name
            .clone()
            .unwrap_or_else(|| "<anonymous>".to_string());
        self.push_ctx(&name, lit.return_type.clone());
        for param in &lit.params {
            self.line = param.line;
            self.declare_local(&param.name, param.ty.clone())?;
        }
        for stmt in &lit.body {
            self.statement(stmt)?;
        }
        self.line = lit.line;
        self.emit(OpCode::Null);
        self.emit(OpCode::Return);

        let ctx = self.ctxs.pop().expect("function context missing");
        let function = Function {
            name,
            arity: lit.params.len() as u8,
            upvalue_count: ctx.upvalues.len(),
            param_refs: lit.params.iter().map(|p| p.ty.is_ref()).collect(),
            chunk: ctx.chunk,
        };
        let upvalues = ctx.upvalues;

        let fn_idx = self.make_constant(Value::Function(Arc::new(function)))?;
        self.emit(OpCode::Closure);
        self.emit_u16(fn_idx);
        for (index, is_local) in upvalues {
            self.emit_byte(is_local as u8);
            self.emit_byte(index);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self, expr: &Expr) -> Result<Type, CompileError> {
        self.line = expr.line;
        match &expr.kind {
            ExprKind::Int(n) => {
                self.emit_constant(Value::Int(*n))?;
                Ok(Type::Int)
            }
            ExprKind::Float(x) => {
                self.emit_constant(Value::Float(*x))?;
                Ok(Type::Float)
            }
            ExprKind::Str(s) => {
                self.emit_constant(Value::string(s.as_str()))?;
                Ok(Type::Str)
            }
            ExprKind::Bytes(data) => {
                self.emit_constant(Value::bytes(data.clone()))?;
                Ok(Type::Bytes)
            }
            ExprKind::Bool(true) => {
                self.emit(OpCode::True);
                Ok(Type::Bool)
            }
            ExprKind::Bool(false) => {
                self.emit(OpCode::False);
                Ok(Type::Bool)
            }
            ExprKind::Null => {
                self.emit(OpCode::Null);
                Ok(Type::Any)
            }
            ExprKind::Ident(name) => self.ident_expression(name),
            ExprKind::Array(items) => self.array_expression(items),
            ExprKind::MapLit(entries) => self.map_expression(entries),
            ExprKind::Zeros(count) => {
                let ty = self.expression(count)?;
                let ty = self.deref_if_ref(ty);
                self.check_assignable(&Type::Int, &ty, "zeros length")?;
                self.emit(OpCode::Zeros);
                Ok(Type::Bytes)
            }
            ExprKind::Unary { op, operand } => self.unary_expression(*op, operand),
            ExprKind::Binary { op, lhs, rhs } => self.binary_expression(*op, lhs, rhs),
            ExprKind::Logical { and, lhs, rhs } => self.logical_expression(*and, lhs, rhs),
            ExprKind::Ref(operand) => self.ref_expression(operand),
            ExprKind::Call { callee, args } => self.call_expression(callee, args),
            ExprKind::Index { target, index } => self.index_expression(target, index),
            ExprKind::Member { target, name } => self.member_expression(target, name),
            ExprKind::Func(lit) => {
                self.compile_function(lit)?;
                Ok(Type::Function {
                    params: lit.params.iter().map(|p| p.ty.clone()).collect(),
                    ret: Box::new(lit.return_type.clone()),
                })
            }
        }
    }

    fn ident_expression(&mut self, name: &str) -> Result<Type, CompileError> {
        match self.resolve(name)? {
            Binding::Local(slot, ty) => {
                self.emit(OpCode::GetLocal);
                self.emit_byte(slot as u8);
                Ok(ty)
            }
            Binding::Upvalue(idx, ty) => {
                self.emit(OpCode::GetUpvalue);
                self.emit_byte(idx);
                Ok(ty)
            }
            Binding::Global(ty) => {
                let idx = self.name_constant(name)?;
                self.emit(OpCode::GetGlobal);
                self.emit_u16(idx);
                // Unknown globals are late-bound: the VM reports undefined
                // globals at run time.
                Ok(ty.unwrap_or(Type::Any))
            }
        }
    }

    fn array_expression(&mut self, items: &[Expr]) -> Result<Type, CompileError> {
        if items.len() > u16::MAX as usize {
            return Err(self.err("array literal too large"));
        }
        let mut elem_ty: Option<Type> = None;
        for item in items {
            let ty = self.expression(item)?;
            let ty = self.deref_if_ref(ty);
            elem_ty = Some(match elem_ty {
                None => ty,
                Some(prev) => Self::unify(prev, &ty),
            });
        }
        self.emit(OpCode::Array);
        self.emit_u16(items.len() as u16);
        Ok(Type::Array(
            Box::new(elem_ty.unwrap_or(Type::Any)),
            items.len(),
        ))
    }

    fn map_expression(&mut self, entries: &[(Expr, Expr)]) -> Result<Type, CompileError> {
        if entries.len() > u16::MAX as usize {
            return Err(self.err("map literal too large"));
        }
        let mut key_ty: Option<Type> = None;
        let mut val_ty: Option<Type> = None;
        for (key, value) in entries {
            let kt = self.expression(key)?;
            let kt = self.deref_if_ref(kt);
            if !matches!(kt, Type::Int | Type::Str | Type::Any) {
                return Err(self.err(format!("map keys must be int or string, got {}", kt)));
            }
            let vt = self.expression(value)?;
            let vt = self.deref_if_ref(vt);
            key_ty = Some(match key_ty {
                None => kt,
                Some(prev) => Self::unify(prev, &kt),
            });
            val_ty = Some(match val_ty {
                None => vt,
                Some(prev) => Self::unify(prev, &vt),
            });
        }
        self.emit(OpCode::Map);
        self.emit_u16(entries.len() as u16);
        Ok(Type::Map(
            Box::new(key_ty.unwrap_or(Type::Any)),
            Box::new(val_ty.unwrap_or(Type::Any)),
        ))
    }

    fn unary_expression(&mut self, op: UnaryOp, operand: &Expr) -> Result<Type, CompileError> {
        let ty = self.expression(operand)?;
        let ty = self.deref_if_ref(ty);
        match op {
            UnaryOp::Neg => match ty {
                Type::Int => {
                    self.emit(OpCode::NegateInt);
                    Ok(Type::Int)
                }
                Type::Float => {
                    self.emit(OpCode::Negate);
                    Ok(Type::Float)
                }
                Type::Any => {
                    self.emit(OpCode::Negate);
                    Ok(Type::Any)
                }
                other => Err(self.err(format!("operand of '-' must be numeric, got {}", other))),
            },
            UnaryOp::Not => {
                if !matches!(ty, Type::Bool | Type::Any) {
                    return Err(self.err(format!("operand of '!' must be bool, got {}", ty)));
                }
                self.emit(OpCode::Not);
                Ok(Type::Bool)
            }
            UnaryOp::BitNot => {
                if !matches!(ty, Type::Int | Type::Any) {
                    return Err(self.err(format!("operand of '~' must be int, got {}", ty)));
                }
                self.emit(OpCode::BitNot);
                Ok(Type::Int)
            }
        }
    }

    fn binary_expression(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Type, CompileError> {
        let lt = self.expression(lhs)?;
        let lt = self.deref_if_ref(lt);
        let rt = self.expression(rhs)?;
        let rt = self.deref_if_ref(rt);
        self.line = lhs.line;

        use BinaryOp::*;
        match op {
            Add | Sub | Mul | Div | Mod => self.arithmetic(op, &lt, &rt),
            Eq | Ne => {
                let comparable = matches!(lt, Type::Any)
                    || matches!(rt, Type::Any)
                    || lt.accepts(&rt)
                    || rt.accepts(&lt)
                    || (lt.is_numeric() && rt.is_numeric());
                if !comparable {
                    return Err(self.err(format!("cannot compare {} with {}", lt, rt)));
                }
                if lt == Type::Int && rt == Type::Int {
                    self.emit(OpCode::EqualInt);
                } else {
                    self.emit(OpCode::Equal);
                }
                if op == Ne {
                    self.emit(OpCode::Not);
                }
                Ok(Type::Bool)
            }
            Lt | Le | Gt | Ge => {
                let ordered = (lt.is_numeric() && rt.is_numeric())
                    || (lt == Type::Str && rt == Type::Str)
                    || matches!(lt, Type::Any)
                    || matches!(rt, Type::Any);
                if !ordered {
                    return Err(self.err(format!("cannot order {} and {}", lt, rt)));
                }
                let ints = lt == Type::Int && rt == Type::Int;
                match (op, ints) {
                    (Lt, true) => self.emit(OpCode::LessInt),
                    (Lt, false) => self.emit(OpCode::Less),
                    (Gt, true) => self.emit(OpCode::GreaterInt),
                    (Gt, false) => self.emit(OpCode::Greater),
                    (Le, true) => {
                        self.emit(OpCode::GreaterInt);
                        self.emit(OpCode::Not);
                    }
                    (Le, false) => {
                        self.emit(OpCode::Greater);
                        self.emit(OpCode::Not);
                    }
                    (Ge, true) => {
                        self.emit(OpCode::LessInt);
                        self.emit(OpCode::Not);
                    }
                    (Ge, false) => {
                        self.emit(OpCode::Less);
                        self.emit(OpCode::Not);
                    }
                    _ => unreachable!(),
                }
                Ok(Type::Bool)
            }
            BitAnd | BitOr | BitXor | Shl | Shr => {
                for ty in [&lt, &rt] {
                    if !matches!(ty, Type::Int | Type::Any) {
                        return Err(self.err(format!(
                            "bitwise operands must be int, got {}",
                            ty
                        )));
                    }
                }
                self.emit(match op {
                    BitAnd => OpCode::BitAnd,
                    BitOr => OpCode::BitOr,
                    BitXor => OpCode::BitXor,
                    Shl => OpCode::ShiftLeft,
                    Shr => OpCode::ShiftRight,
                    _ => unreachable!(),
                });
                Ok(Type::Int)
            }
        }
    }

    fn arithmetic(&mut self, op: BinaryOp, lt: &Type, rt: &Type) -> Result<Type, CompileError> {
        use BinaryOp::*;
        let symbol = match op {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "%",
            _ => unreachable!(),
        };

        // Integer arithmetic gets specialized opcodes.
        if *lt == Type::Int && *rt == Type::Int {
            self.emit(match op {
                Add => OpCode::AddInt,
                Sub => OpCode::SubtractInt,
                Mul => OpCode::MultiplyInt,
                Div => OpCode::DivideInt,
                Mod => OpCode::ModuloInt,
                _ => unreachable!(),
            });
            return Ok(Type::Int);
        }

        // String and bytes concatenation ride the generic Add.
        if op == Add && ((*lt == Type::Str && *rt == Type::Str) || (*lt == Type::Bytes && *rt == Type::Bytes))
        {
            self.emit(OpCode::Add);
            return Ok(lt.clone());
        }

        let any_involved = matches!(lt, Type::Any) || matches!(rt, Type::Any);
        if !any_involved && (!lt.is_numeric() || !rt.is_numeric()) {
            return Err(self.err(format!(
                "operator '{}' cannot be applied to {} and {}",
                symbol, lt, rt
            )));
        }
        self.emit(match op {
            Add => OpCode::Add,
            Sub => OpCode::Subtract,
            Mul => OpCode::Multiply,
            Div => OpCode::Divide,
            Mod => OpCode::Modulo,
            _ => unreachable!(),
        });
        Ok(if any_involved { Type::Any } else { Type::Float })
    }

    fn logical_expression(
        &mut self,
        and: bool,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Type, CompileError> {
        self.condition(lhs)?;
        // Peek-based jumps leave the decisive operand on the stack; the
        // matched Pop runs only on the fall-through path.
        let end_jump = if and {
            self.emit_jump(OpCode::JumpIfFalse)
        } else {
            self.emit_jump(OpCode::JumpIfTrue)
        };
        self.emit(OpCode::Pop);
        self.condition(rhs)?;
        self.patch_jump(end_jump)?;
        Ok(Type::Bool)
    }

    fn ref_expression(&mut self, operand: &Expr) -> Result<Type, CompileError> {
        match &operand.kind {
            ExprKind::Ident(name) => match self.resolve(name)? {
                Binding::Local(slot, ty) => {
                    self.ctxs.last_mut().expect("no context").locals[slot].captured = true;
                    self.emit(OpCode::RefLocal);
                    self.emit_byte(slot as u8);
                    Ok(Type::Ref(Box::new(ty)))
                }
                Binding::Upvalue(idx, ty) => {
                    self.emit(OpCode::RefUpvalue);
                    self.emit_byte(idx);
                    Ok(Type::Ref(Box::new(ty)))
                }
                Binding::Global(ty) => {
                    let Some(ty) = ty else {
                        return Err(self.err(format!(
                            "cannot take a reference to undefined variable '{}'",
                            name
                        )));
                    };
                    let idx = self.name_constant(name)?;
                    self.emit(OpCode::RefGlobal);
                    self.emit_u16(idx);
                    Ok(Type::Ref(Box::new(ty)))
                }
            },
            ExprKind::Member { target, name } => {
                let obj_ty = self.expression(target)?;
                let obj_ty = self.deref_if_ref(obj_ty);
                let field_ty = match &obj_ty {
                    Type::Named(struct_name) => self
                        .session
                        .structs
                        .get(struct_name)
                        .and_then(|info| info.field_type(name).cloned())
                        .ok_or_else(|| {
                            self.err(format!("struct {} has no field '{}'", struct_name, name))
                        })?,
                    Type::Map(_, v) => (**v).clone(),
                    Type::Any => Type::Any,
                    other => {
                        return Err(
                            self.err(format!("cannot take a reference into {}", other))
                        )
                    }
                };
                let idx = self.name_constant(name)?;
                self.emit(OpCode::RefProperty);
                self.emit_u16(idx);
                Ok(Type::Ref(Box::new(field_ty)))
            }
            ExprKind::Index { target, index } => {
                let coll_ty = self.expression(target)?;
                let coll_ty = self.deref_if_ref(coll_ty);
                let idx_ty = self.expression(index)?;
                self.deref_if_ref(idx_ty);
                let elem_ty = match &coll_ty {
                    Type::Array(elem, _) => (**elem).clone(),
                    Type::Map(_, v) => (**v).clone(),
                    Type::Bytes => Type::Int,
                    Type::Any => Type::Any,
                    other => {
                        return Err(
                            self.err(format!("cannot take a reference into {}", other))
                        )
                    }
                };
                self.emit(OpCode::RefIndex);
                Ok(Type::Ref(Box::new(elem_ty)))
            }
            _ => Err(self.err("'ref' requires an addressable operand")),
        }
    }

    fn call_expression(&mut self, callee: &Expr, args: &[Expr]) -> Result<Type, CompileError> {
        if args.len() > u8::MAX as usize {
            return Err(self.err("too many arguments"));
        }

        // `len(x)` compiles straight to the Len instruction when the name
        // is not shadowed; the for-loop lowering relies on the same op.
        if let ExprKind::Ident(name) = &callee.kind {
            if name == "len" && args.len() == 1 && !self.is_shadowed("len") {
                let ty = self.expression(&args[0])?;
                let ty = self.deref_if_ref(ty);
                if !matches!(
                    ty,
                    Type::Array(..) | Type::Map(..) | Type::Str | Type::Bytes | Type::Any
                ) {
                    return Err(self.err(format!("len() requires a collection, got {}", ty)));
                }
                self.emit(OpCode::Len);
                return Ok(Type::Int);
            }
        }

        let callee_ty = self.expression(callee)?;
        match callee_ty {
            Type::Function { params, ret } => {
                if params.len() != args.len() {
                    return Err(self.err(format!(
                        "expected {} arguments, got {}",
                        params.len(),
                        args.len()
                    )));
                }
                for (i, (arg, param_ty)) in args.iter().zip(&params).enumerate() {
                    if param_ty.is_ref() {
                        let arg_ty = self.expression(arg)?;
                        let ok = arg_ty.is_ref() || matches!(arg.kind, ExprKind::Null);
                        if !ok || !param_ty.accepts(&arg_ty) {
                            return Err(self.err(format!(
                                "argument {} must be {}, got {}",
                                i + 1,
                                param_ty,
                                arg_ty
                            )));
                        }
                    } else {
                        let arg_ty = self.expression(arg)?;
                        let arg_ty = self.deref_if_ref(arg_ty);
                        self.check_assignable(param_ty, &arg_ty, &format!("argument {}", i + 1))?;
                    }
                }
                self.emit(OpCode::Call);
                self.emit_byte(args.len() as u8);
                Ok(*ret)
            }
            Type::Func | Type::Any => {
                // Unknown signature: compile arguments unchecked. References
                // pass through untouched so ref parameters keep working.
                for arg in args {
                    self.expression(arg)?;
                }
                self.emit(OpCode::Call);
                self.emit_byte(args.len() as u8);
                Ok(Type::Any)
            }
            other => Err(self.err(format!("can only call functions, got {}", other))),
        }
    }

    fn index_expression(&mut self, target: &Expr, index: &Expr) -> Result<Type, CompileError> {
        let coll_ty = self.expression(target)?;
        let coll_ty = self.deref_if_ref(coll_ty);
        let idx_ty = self.expression(index)?;
        let idx_ty = self.deref_if_ref(idx_ty);
        let elem_ty = match &coll_ty {
            Type::Array(elem, _) => {
                self.check_assignable(&Type::Int, &idx_ty, "array index")?;
                (**elem).clone()
            }
            Type::Map(key, value) => {
                self.check_assignable(key, &idx_ty, "map key")?;
                (**value).clone()
            }
            Type::Bytes => {
                self.check_assignable(&Type::Int, &idx_ty, "bytes index")?;
                Type::Int
            }
            Type::Str => {
                self.check_assignable(&Type::Int, &idx_ty, "string index")?;
                Type::Str
            }
            Type::Any => Type::Any,
            other => return Err(self.err(format!("cannot index {}", other))),
        };
        self.emit(OpCode::GetIndex);
        Ok(elem_ty)
    }

    fn member_expression(&mut self, target: &Expr, name: &str) -> Result<Type, CompileError> {
        let obj_ty = self.expression(target)?;
        let obj_ty = self.deref_if_ref(obj_ty);
        let member_ty = match &obj_ty {
            Type::Named(struct_name) => self
                .session
                .structs
                .get(struct_name)
                .and_then(|info| info.field_type(name).cloned())
                .ok_or_else(|| {
                    self.err(format!("struct {} has no field '{}'", struct_name, name))
                })?,
            Type::Map(_, value) => (**value).clone(),
            Type::Any => Type::Any,
            other => {
                return Err(self.err(format!("cannot access member '{}' on {}", name, other)))
            }
        };
        let idx = self.name_constant(name)?;
        self.emit(OpCode::GetProperty);
        self.emit_u16(idx);
        Ok(member_ty)
    }
}
