//! Recursive-descent parser with a Pratt expression core.
//!
//! Statements dispatch on their leading keyword; expressions are parsed
//! with binding powers over the precedence ladder (low to high):
//! logical-or, logical-and, bitwise-or, bitwise-xor, bitwise-and,
//! equality, relational, shift, additive, multiplicative, unary, then
//! call/index/member.
//!
//! The parser is single-shot: it accumulates an error list and recovers
//! at the next newline after each error so one mistake does not cascade.
//! F-strings are expanded here - each `{…}` hole is parsed by a fresh
//! parser instance and wrapped in `to_str(…)` (or `fmt(…)` when the hole
//! carries a `:`-format specifier), then concatenated with `+`.

use std::fmt;

use crate::ast::{
    BinaryOp, Expr, ExprKind, FuncLit, Param, Stmt, StmtKind, UnaryOp, UseSelect, WhenCase, WhenOp,
};
use crate::lexer::tokenize;
use crate::token::{Token, TokenKind};
use crate::types::Type;

/// A parse diagnostic with its `[line:col]` position.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub line: u32,
    pub col: u32,
    pub message: String,
}

impl ParseError {
    fn new(token: &Token, message: impl Into<String>) -> Self {
        ParseError {
            line: token.line,
            col: token.col,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.line, self.col, self.message)
    }
}

impl std::error::Error for ParseError {}

// Binding powers, low to high.
const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_BIT_OR: u8 = 3;
const PREC_BIT_XOR: u8 = 4;
const PREC_BIT_AND: u8 = 5;
const PREC_EQUALITY: u8 = 6;
const PREC_RELATIONAL: u8 = 7;
const PREC_SHIFT: u8 = 8;
const PREC_TERM: u8 = 9;
const PREC_FACTOR: u8 = 10;
const PREC_UNARY: u8 = 11;
const PREC_CALL: u8 = 12;

fn infix_binding(kind: TokenKind) -> Option<u8> {
    use TokenKind::*;
    let power = match kind {
        PipePipe => PREC_OR,
        AmpAmp => PREC_AND,
        Pipe => PREC_BIT_OR,
        Caret => PREC_BIT_XOR,
        Amp => PREC_BIT_AND,
        EqEq | BangEq => PREC_EQUALITY,
        Lt | LtEq | Gt | GtEq => PREC_RELATIONAL,
        Shl | Shr => PREC_SHIFT,
        Plus | Minus => PREC_TERM,
        Star | Slash | Percent => PREC_FACTOR,
        LParen | LBracket | Dot => PREC_CALL,
        _ => return None,
    };
    Some(power)
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    pub errors: Vec<ParseError>,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(source: &str) -> Self {
        Parser {
            tokens: tokenize(source),
            pos: 0,
            errors: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.current().kind
    }

    fn next_kind(&self) -> TokenKind {
        self.tokens
            .get(self.pos + 1)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(kind.describe()))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let found = match self.kind() {
            TokenKind::Illegal => self.current().literal.clone(),
            kind => kind.describe().to_string(),
        };
        ParseError::new(self.current(), format!("expected {}, found {}", expected, found))
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    /// Skip to the next newline so one error does not cascade.
    fn synchronize(&mut self) {
        while !self.check(TokenKind::Newline) && !self.check(TokenKind::Eof) {
            self.advance();
        }
        self.eat(TokenKind::Newline);
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Parse a whole program. Returns every statement or the accumulated
    /// error list; the driver aborts before compilation when non-empty.
    pub fn parse(mut self) -> Result<Vec<Stmt>, Vec<ParseError>> {
        let mut program = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(TokenKind::Eof) {
                break;
            }
            match self.statement() {
                Ok(stmt) => {
                    program.push(stmt);
                    if let Err(err) = self.end_of_statement(&[]) {
                        self.errors.push(err);
                        self.synchronize();
                    }
                }
                Err(err) => {
                    self.errors.push(err);
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

    /// Parse exactly one expression spanning the whole input (used for
    /// f-string holes).
    fn parse_expression_only(&mut self) -> PResult<Expr> {
        self.skip_newlines();
        let expr = self.expression()?;
        self.skip_newlines();
        if !self.check(TokenKind::Eof) {
            return Err(self.unexpected("end of expression"));
        }
        Ok(expr)
    }

    /// After a statement: newline, end of file, or a block terminator.
    fn end_of_statement(&mut self, terminators: &[TokenKind]) -> PResult<()> {
        if self.check(TokenKind::Newline) {
            self.skip_newlines();
            return Ok(());
        }
        if self.check(TokenKind::Eof) || terminators.contains(&self.kind()) {
            return Ok(());
        }
        Err(self.unexpected("newline"))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn statement(&mut self) -> PResult<Stmt> {
        let line = self.current().line;
        let kind = match self.kind() {
            TokenKind::Let => {
                self.advance();
                self.let_statement()?
            }
            TokenKind::Return => {
                self.advance();
                self.return_statement()?
            }
            TokenKind::Break => {
                self.advance();
                StmtKind::Break
            }
            TokenKind::If => {
                self.advance();
                self.if_statement()?
            }
            TokenKind::While => {
                self.advance();
                self.while_statement()?
            }
            TokenKind::For => {
                self.advance();
                self.for_statement()?
            }
            TokenKind::Struct => {
                self.advance();
                self.struct_statement()?
            }
            TokenKind::Func if self.next_kind() == TokenKind::Ident => {
                self.advance();
                self.func_statement()?
            }
            TokenKind::Use => {
                self.advance();
                self.use_statement()?
            }
            TokenKind::When => {
                self.advance();
                self.when_statement()?
            }
            TokenKind::Star => {
                self.advance();
                self.ref_assign_statement()?
            }
            // A declaration that forgot its `let`.
            TokenKind::Ident if self.next_kind() == TokenKind::Colon => {
                return Err(ParseError::new(
                    self.current(),
                    format!(
                        "missing 'let' keyword for variable declaration of '{}'",
                        self.current().literal
                    ),
                ));
            }
            _ => self.expression_statement()?,
        };
        Ok(Stmt::new(kind, line))
    }

    fn let_statement(&mut self) -> PResult<StmtKind> {
        let name_token = self.expect(TokenKind::Ident)?;
        let name = name_token.literal;
        if !self.eat(TokenKind::Colon) {
            return Err(ParseError::new(
                self.current(),
                format!("missing type annotation for '{}'", name),
            ));
        }
        let ty = self.parse_type()?;
        let init = if self.eat(TokenKind::Eq) {
            self.skip_newlines();
            Some(self.expression()?)
        } else {
            None
        };
        Ok(StmtKind::Let { name, ty, init })
    }

    fn return_statement(&mut self) -> PResult<StmtKind> {
        let value = match self.kind() {
            TokenKind::Newline | TokenKind::Eof | TokenKind::End => None,
            _ => Some(self.expression()?),
        };
        Ok(StmtKind::Return(value))
    }

    fn if_statement(&mut self) -> PResult<StmtKind> {
        let cond = self.expression()?;
        self.expect(TokenKind::Then)?;
        let then_block =
            self.block(&[TokenKind::Elif, TokenKind::Else, TokenKind::End], "'end'")?;
        let else_block = match self.kind() {
            TokenKind::Elif => {
                // Desugar `elif` into a nested `if` that owns the shared `end`.
                let line = self.current().line;
                self.advance();
                let nested = self.if_statement()?;
                Some(vec![Stmt::new(nested, line)])
            }
            TokenKind::Else => {
                self.advance();
                let block = self.block(&[TokenKind::End], "'end'")?;
                self.expect(TokenKind::End)?;
                Some(block)
            }
            _ => {
                self.expect(TokenKind::End)?;
                None
            }
        };
        Ok(StmtKind::If {
            cond,
            then_block,
            else_block,
        })
    }

    fn while_statement(&mut self) -> PResult<StmtKind> {
        let cond = self.expression()?;
        self.expect(TokenKind::Do)?;
        let body = self.block(&[TokenKind::End], "'end'")?;
        self.expect(TokenKind::End)?;
        Ok(StmtKind::While { cond, body })
    }

    fn for_statement(&mut self) -> PResult<StmtKind> {
        let var = self.expect(TokenKind::Ident)?.literal;
        self.expect(TokenKind::In)?;
        let iterable = self.expression()?;
        self.expect(TokenKind::Do)?;
        let body = self.block(&[TokenKind::End], "'end'")?;
        self.expect(TokenKind::End)?;
        Ok(StmtKind::For {
            var,
            iterable,
            body,
        })
    }

    fn struct_statement(&mut self) -> PResult<StmtKind> {
        let name = self.expect(TokenKind::Ident)?.literal;
        self.skip_newlines();
        let mut fields = Vec::new();
        while !self.check(TokenKind::End) {
            if self.check(TokenKind::Eof) {
                return Err(self.unexpected("'end'"));
            }
            let field = self.expect(TokenKind::Ident)?.literal;
            if !self.eat(TokenKind::Colon) {
                return Err(ParseError::new(
                    self.current(),
                    format!("missing type annotation for field '{}'", field),
                ));
            }
            let ty = self.parse_type()?;
            fields.push((field, ty));
            self.end_of_statement(&[TokenKind::End])?;
        }
        self.expect(TokenKind::End)?;
        Ok(StmtKind::StructDef { name, fields })
    }

    fn func_statement(&mut self) -> PResult<StmtKind> {
        let line = self.current().line;
        let name = self.expect(TokenKind::Ident)?.literal;
        let (params, return_type) = self.func_signature()?;
        let body = self.block(&[TokenKind::End], "'end'")?;
        self.expect(TokenKind::End)?;
        Ok(StmtKind::FuncDef(FuncLit {
            name: Some(name),
            params,
            return_type,
            body,
            line,
        }))
    }

    /// Parse `(name: type, …) [-> type]`. The return type defaults to void.
    fn func_signature(&mut self) -> PResult<(Vec<Param>, Type)> {
        self.expect(TokenKind::LParen)?;
        self.skip_newlines();
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let token = self.expect(TokenKind::Ident)?;
                let (name, line) = (token.literal, token.line);
                if !self.eat(TokenKind::Colon) {
                    return Err(ParseError::new(
                        self.current(),
                        format!("missing type annotation for parameter '{}'", name),
                    ));
                }
                let ty = self.parse_type()?;
                params.push(Param { name, ty, line });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.expect(TokenKind::RParen)?;
        let return_type = if self.eat(TokenKind::Arrow) {
            self.parse_type()?
        } else {
            Type::Void
        };
        Ok((params, return_type))
    }

    fn use_statement(&mut self) -> PResult<StmtKind> {
        let mut path = vec![self.expect(TokenKind::Ident)?.literal];
        while self.eat(TokenKind::Dot) {
            path.push(self.expect(TokenKind::Ident)?.literal);
        }
        let alias = if self.eat(TokenKind::As) {
            Some(self.expect(TokenKind::Ident)?.literal)
        } else {
            None
        };
        let select = if self.eat(TokenKind::Select) {
            if self.eat(TokenKind::Star) {
                Some(UseSelect::All)
            } else {
                let mut names = vec![self.expect(TokenKind::Ident)?.literal];
                while self.eat(TokenKind::Comma) {
                    names.push(self.expect(TokenKind::Ident)?.literal);
                }
                Some(UseSelect::Names(names))
            }
        } else {
            None
        };
        Ok(StmtKind::Use {
            path,
            alias,
            select,
        })
    }

    fn when_statement(&mut self) -> PResult<StmtKind> {
        self.skip_newlines();
        let mut cases = Vec::new();
        let mut default = None;
        loop {
            match self.kind() {
                TokenKind::Case => {
                    self.advance();
                    cases.push(self.when_case()?);
                }
                TokenKind::Default => {
                    if default.is_some() {
                        return Err(ParseError::new(
                            self.current(),
                            "duplicate default case in 'when'",
                        ));
                    }
                    self.advance();
                    default = Some(self.block(
                        &[TokenKind::Case, TokenKind::Default, TokenKind::End],
                        "'end'",
                    )?);
                }
                TokenKind::End => {
                    self.advance();
                    break;
                }
                _ => return Err(self.unexpected("'case', 'default', or 'end'")),
            }
        }
        if cases.is_empty() && default.is_none() {
            return Err(ParseError::new(
                self.current(),
                "'when' requires at least one case",
            ));
        }
        Ok(StmtKind::When { cases, default })
    }

    /// One `when` arm: `[x =] chan_recv(c) then …` or `chan_send(c, v) then …`.
    fn when_case(&mut self) -> PResult<WhenCase> {
        let line = self.current().line;
        let binding = if self.check(TokenKind::Ident) && self.next_kind() == TokenKind::Eq {
            let name = self.advance().literal;
            self.advance(); // '='
            Some(name)
        } else {
            None
        };

        let call = self.expression()?;
        let ExprKind::Call { callee, mut args } = call.kind else {
            return Err(ParseError::new(
                self.current(),
                "'when' case must be a chan_recv or chan_send call",
            ));
        };
        let ExprKind::Ident(func) = &callee.kind else {
            return Err(ParseError::new(
                self.current(),
                "'when' case must be a chan_recv or chan_send call",
            ));
        };

        let (channel, op) = match (func.as_str(), args.len()) {
            ("chan_recv", 1) => (args.remove(0), WhenOp::Recv),
            ("chan_send", 2) => {
                let channel = args.remove(0);
                let value = args.remove(0);
                (channel, WhenOp::Send(value))
            }
            ("chan_recv", n) => {
                return Err(ParseError::new(
                    self.current(),
                    format!("chan_recv in 'when' takes 1 argument, got {}", n),
                ));
            }
            ("chan_send", n) => {
                return Err(ParseError::new(
                    self.current(),
                    format!("chan_send in 'when' takes 2 arguments, got {}", n),
                ));
            }
            _ => {
                return Err(ParseError::new(
                    self.current(),
                    "'when' case must be a chan_recv or chan_send call",
                ));
            }
        };

        if binding.is_some() && matches!(op, WhenOp::Send(_)) {
            return Err(ParseError::new(
                self.current(),
                "cannot bind the result of chan_send in a 'when' case",
            ));
        }

        self.expect(TokenKind::Then)?;
        let body = self.block(
            &[TokenKind::Case, TokenKind::Default, TokenKind::End],
            "'end'",
        )?;
        Ok(WhenCase {
            binding,
            channel,
            op,
            body,
            line,
        })
    }

    /// `*target = value`
    fn ref_assign_statement(&mut self) -> PResult<StmtKind> {
        let target = self.parse_precedence(PREC_CALL)?;
        if !target.is_addressable() {
            return Err(ParseError::new(
                self.current(),
                "'*' update requires a reference variable, field, or index",
            ));
        }
        self.expect(TokenKind::Eq)?;
        self.skip_newlines();
        let value = self.expression()?;
        Ok(StmtKind::RefAssign { target, value })
    }

    fn expression_statement(&mut self) -> PResult<StmtKind> {
        let expr = self.expression()?;
        if self.eat(TokenKind::Eq) {
            if !expr.is_addressable() {
                return Err(ParseError::new(
                    self.current(),
                    "invalid assignment target",
                ));
            }
            self.skip_newlines();
            let value = self.expression()?;
            return Ok(StmtKind::Assign {
                target: expr,
                value,
            });
        }
        Ok(StmtKind::Expr(expr))
    }

    /// Parse statements until one of `terminators`; does not consume it.
    fn block(&mut self, terminators: &[TokenKind], closer: &str) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if terminators.contains(&self.kind()) {
                return Ok(stmts);
            }
            if self.check(TokenKind::Eof) {
                return Err(self.unexpected(closer));
            }
            match self.statement() {
                Ok(stmt) => {
                    stmts.push(stmt);
                    if let Err(err) = self.end_of_statement(terminators) {
                        self.errors.push(err);
                        self.synchronize();
                    }
                }
                Err(err) => {
                    // An unexpected end of file cannot be recovered by
                    // skipping to the next line.
                    if self.check(TokenKind::Eof) {
                        return Err(err);
                    }
                    self.errors.push(err);
                    self.synchronize();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    fn parse_type(&mut self) -> PResult<Type> {
        match self.kind() {
            TokenKind::TyInt => {
                self.advance();
                Ok(Type::Int)
            }
            TokenKind::TyFloat => {
                self.advance();
                Ok(Type::Float)
            }
            TokenKind::TyString => {
                self.advance();
                Ok(Type::Str)
            }
            TokenKind::TyBool => {
                self.advance();
                Ok(Type::Bool)
            }
            TokenKind::TyBytes => {
                self.advance();
                Ok(Type::Bytes)
            }
            TokenKind::TyVoid => {
                self.advance();
                Ok(Type::Void)
            }
            TokenKind::TyAny => {
                self.advance();
                Ok(Type::Any)
            }
            TokenKind::Ident => Ok(Type::Named(self.advance().literal)),
            TokenKind::Ref => {
                self.advance();
                Ok(Type::Ref(Box::new(self.parse_type()?)))
            }
            TokenKind::Chan => {
                self.advance();
                Ok(Type::Chan(Box::new(self.parse_type()?)))
            }
            TokenKind::Map => {
                self.advance();
                self.expect(TokenKind::LBracket)?;
                let key = self.parse_type()?;
                self.expect(TokenKind::Comma)?;
                let value = self.parse_type()?;
                self.expect(TokenKind::RBracket)?;
                Ok(Type::Map(Box::new(key), Box::new(value)))
            }
            TokenKind::LBracket => {
                // `[]elem` dynamic, `[N]elem` fixed-size.
                self.advance();
                let size = if self.check(TokenKind::Int) {
                    let token = self.advance();
                    parse_int_literal(&token.literal).ok_or_else(|| {
                        ParseError::new(&token, "invalid array size literal")
                    })? as usize
                } else {
                    0
                };
                self.expect(TokenKind::RBracket)?;
                let elem = self.parse_type()?;
                Ok(Type::Array(Box::new(elem), size))
            }
            TokenKind::Func => {
                self.advance();
                if self.check(TokenKind::LParen) {
                    self.advance();
                    let mut params = Vec::new();
                    if !self.check(TokenKind::RParen) {
                        loop {
                            params.push(self.parse_type()?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    self.expect(TokenKind::Arrow)?;
                    let ret = self.parse_type()?;
                    Ok(Type::Function {
                        params,
                        ret: Box::new(ret),
                    })
                } else {
                    Ok(Type::Func)
                }
            }
            _ => Err(self.unexpected("type")),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn expression(&mut self) -> PResult<Expr> {
        self.parse_precedence(PREC_OR)
    }

    fn parse_precedence(&mut self, min_power: u8) -> PResult<Expr> {
        let mut lhs = self.prefix()?;
        while let Some(power) = infix_binding(self.kind()) {
            if power < min_power {
                break;
            }
            lhs = self.infix(lhs, power)?;
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> PResult<Expr> {
        let token = self.current().clone();
        let (line, col) = (token.line, token.col);
        match token.kind {
            TokenKind::Int => {
                self.advance();
                let value = parse_int_literal(&token.literal)
                    .ok_or_else(|| ParseError::new(&token, "integer literal out of range"))?;
                Ok(Expr::new(ExprKind::Int(value), line, col))
            }
            TokenKind::Float => {
                self.advance();
                let value: f64 = token
                    .literal
                    .parse()
                    .map_err(|_| ParseError::new(&token, "invalid float literal"))?;
                Ok(Expr::new(ExprKind::Float(value), line, col))
            }
            TokenKind::Str => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(token.literal), line, col))
            }
            TokenKind::Bytes => {
                self.advance();
                Ok(Expr::new(
                    ExprKind::Bytes(token.literal.into_bytes()),
                    line,
                    col,
                ))
            }
            TokenKind::FStr => {
                self.advance();
                self.expand_fstring(&token.literal, line, col)
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(true), line, col))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(false), line, col))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::new(ExprKind::Null, line, col))
            }
            TokenKind::Ident => {
                self.advance();
                Ok(Expr::new(ExprKind::Ident(token.literal), line, col))
            }
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                let inner = self.expression()?;
                self.skip_newlines();
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                self.array_literal(line, col)
            }
            TokenKind::LBrace => {
                self.advance();
                self.map_literal(line, col)
            }
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_precedence(PREC_UNARY)?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(operand),
                    },
                    line,
                    col,
                ))
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_precedence(PREC_UNARY)?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(operand),
                    },
                    line,
                    col,
                ))
            }
            TokenKind::Tilde => {
                self.advance();
                let operand = self.parse_precedence(PREC_UNARY)?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::BitNot,
                        operand: Box::new(operand),
                    },
                    line,
                    col,
                ))
            }
            TokenKind::Ref => {
                self.advance();
                // Only call/index/member may follow the operand head; a
                // reference must designate storage, never a temporary.
                let operand = self.parse_precedence(PREC_CALL)?;
                if !operand.is_addressable() {
                    return Err(ParseError::new(
                        &token,
                        "'ref' requires an addressable operand (a variable, field, or index)",
                    ));
                }
                Ok(Expr::new(ExprKind::Ref(Box::new(operand)), line, col))
            }
            TokenKind::Zeros => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let count = self.expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr::new(ExprKind::Zeros(Box::new(count)), line, col))
            }
            TokenKind::Func => {
                self.advance();
                let name = if self.check(TokenKind::Ident) {
                    Some(self.advance().literal)
                } else {
                    None
                };
                let (params, return_type) = self.func_signature()?;
                let body = self.block(&[TokenKind::End], "'end'")?;
                self.expect(TokenKind::End)?;
                Ok(Expr::new(
                    ExprKind::Func(Box::new(FuncLit {
                        name,
                        params,
                        return_type,
                        body,
                        line,
                    })),
                    line,
                    col,
                ))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn infix(&mut self, lhs: Expr, power: u8) -> PResult<Expr> {
        let token = self.advance();
        let (line, col) = (lhs.line, lhs.col);
        use TokenKind::*;
        match token.kind {
            LParen => {
                let args = self.call_arguments()?;
                Ok(Expr::new(
                    ExprKind::Call {
                        callee: Box::new(lhs),
                        args,
                    },
                    line,
                    col,
                ))
            }
            LBracket => {
                self.skip_newlines();
                let index = self.expression()?;
                self.skip_newlines();
                self.expect(RBracket)?;
                Ok(Expr::new(
                    ExprKind::Index {
                        target: Box::new(lhs),
                        index: Box::new(index),
                    },
                    line,
                    col,
                ))
            }
            Dot => {
                let name = self.expect(Ident)?.literal;
                Ok(Expr::new(
                    ExprKind::Member {
                        target: Box::new(lhs),
                        name,
                    },
                    line,
                    col,
                ))
            }
            AmpAmp | PipePipe => {
                self.skip_newlines();
                let rhs = self.parse_precedence(power + 1)?;
                Ok(Expr::new(
                    ExprKind::Logical {
                        and: token.kind == AmpAmp,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    line,
                    col,
                ))
            }
            _ => {
                let op = match token.kind {
                    Plus => BinaryOp::Add,
                    Minus => BinaryOp::Sub,
                    Star => BinaryOp::Mul,
                    Slash => BinaryOp::Div,
                    Percent => BinaryOp::Mod,
                    EqEq => BinaryOp::Eq,
                    BangEq => BinaryOp::Ne,
                    Lt => BinaryOp::Lt,
                    LtEq => BinaryOp::Le,
                    Gt => BinaryOp::Gt,
                    GtEq => BinaryOp::Ge,
                    Amp => BinaryOp::BitAnd,
                    Pipe => BinaryOp::BitOr,
                    Caret => BinaryOp::BitXor,
                    Shl => BinaryOp::Shl,
                    Shr => BinaryOp::Shr,
                    _ => return Err(ParseError::new(&token, "unexpected operator")),
                };
                self.skip_newlines();
                let rhs = self.parse_precedence(power + 1)?;
                Ok(Expr::new(
                    ExprKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    line,
                    col,
                ))
            }
        }
    }

    fn call_arguments(&mut self) -> PResult<Vec<Expr>> {
        self.skip_newlines();
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn array_literal(&mut self, line: u32, col: u32) -> PResult<Expr> {
        self.skip_newlines();
        let mut items = Vec::new();
        if !self.check(TokenKind::RBracket) {
            loop {
                items.push(self.expression()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::new(ExprKind::Array(items), line, col))
    }

    fn map_literal(&mut self, line: u32, col: u32) -> PResult<Expr> {
        self.skip_newlines();
        let mut entries = Vec::new();
        if !self.check(TokenKind::RBrace) {
            loop {
                let key = self.expression()?;
                self.expect(TokenKind::Colon)?;
                self.skip_newlines();
                let value = self.expression()?;
                entries.push((key, value));
                if !self.eat(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::MapLit(entries), line, col))
    }

    // ------------------------------------------------------------------
    // F-strings
    // ------------------------------------------------------------------

    /// Expand an f-string's raw interior into a `+`-chain of literal runs
    /// and `to_str(…)`/`fmt(…)` wrapped holes.
    fn expand_fstring(&mut self, raw: &str, line: u32, col: u32) -> PResult<Expr> {
        let mut parts: Vec<Expr> = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices().peekable();

        while let Some((start, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => literal.push('\n'),
                    Some((_, 'r')) => literal.push('\r'),
                    Some((_, 't')) => literal.push('\t'),
                    Some((_, '\\')) => literal.push('\\'),
                    Some((_, '"')) => literal.push('"'),
                    Some((_, '\'')) => literal.push('\''),
                    Some((_, other)) => {
                        literal.push('\\');
                        literal.push(other);
                    }
                    None => literal.push('\\'),
                },
                '{' => {
                    // Balance braces to find the end of the hole, skipping
                    // quoted runs so `{m["}"]}` parses.
                    let mut depth = 1usize;
                    let mut quote: Option<char> = None;
                    let mut end = None;
                    for (i, d) in chars.by_ref() {
                        match quote {
                            Some(q) => {
                                if d == q {
                                    quote = None;
                                }
                            }
                            None => match d {
                                '"' | '\'' => quote = Some(d),
                                '{' => depth += 1,
                                '}' => {
                                    depth -= 1;
                                    if depth == 0 {
                                        end = Some(i);
                                        break;
                                    }
                                }
                                _ => {}
                            },
                        }
                    }
                    let Some(end) = end else {
                        return Err(ParseError {
                            line,
                            col,
                            message: "unclosed '{' in f-string".to_string(),
                        });
                    };
                    if !literal.is_empty() {
                        parts.push(Expr::new(
                            ExprKind::Str(std::mem::take(&mut literal)),
                            line,
                            col,
                        ));
                    }
                    parts.push(self.fstring_hole(&raw[start + 1..end], line, col)?);
                }
                other => literal.push(other),
            }
        }

        if !literal.is_empty() || parts.is_empty() {
            parts.push(Expr::new(ExprKind::Str(literal), line, col));
        }

        // Concatenate left-to-right with `+`.
        let mut iter = parts.into_iter();
        let first = iter.next().expect("f-string expansion produced no parts");
        Ok(iter.fold(first, |acc, part| {
            Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Add,
                    lhs: Box::new(acc),
                    rhs: Box::new(part),
                },
                line,
                col,
            )
        }))
    }

    /// Parse one `{expr[:spec]}` hole with a fresh parser instance.
    fn fstring_hole(&mut self, hole: &str, line: u32, col: u32) -> PResult<Expr> {
        let (expr_src, spec) = split_format_spec(hole);

        let mut sub = Parser::new(expr_src);
        let expr = sub.parse_expression_only().map_err(|err| ParseError {
            line,
            col,
            message: format!("in f-string expression '{}': {}", expr_src.trim(), err.message),
        })?;
        if let Some(err) = sub.errors.into_iter().next() {
            return Err(ParseError {
                line,
                col,
                message: format!("in f-string expression '{}': {}", expr_src.trim(), err.message),
            });
        }

        let wrapped = match spec {
            None => ExprKind::Call {
                callee: Box::new(Expr::new(
                    ExprKind::Ident("to_str".to_string()),
                    line,
                    col,
                )),
                args: vec![expr],
            },
            Some(spec) => {
                // `{n:05}` → fmt("%05v", n); `{x:.2f}` → fmt("%.2f", x).
                let verb_given = spec
                    .chars()
                    .last()
                    .map(|c| c.is_ascii_alphabetic())
                    .unwrap_or(false);
                let format = if verb_given {
                    format!("%{}", spec)
                } else {
                    format!("%{}v", spec)
                };
                ExprKind::Call {
                    callee: Box::new(Expr::new(ExprKind::Ident("fmt".to_string()), line, col)),
                    args: vec![Expr::new(ExprKind::Str(format), line, col), expr],
                }
            }
        };
        Ok(Expr::new(wrapped, line, col))
    }
}

/// Split a hole body into expression source and optional format spec at the
/// last top-level `:` (not inside brackets, braces, parens, or quotes).
fn split_format_spec(hole: &str) -> (&str, Option<&str>) {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut split_at = None;
    for (i, c) in hole.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth = depth.saturating_sub(1),
                ':' if depth == 0 => split_at = Some(i),
                _ => {}
            },
        }
    }
    match split_at {
        Some(i) if i + 1 < hole.len() => (&hole[..i], Some(&hole[i + 1..])),
        Some(i) => (&hole[..i], None),
        None => (hole, None),
    }
}

/// Parse a decimal or `0x` hexadecimal integer literal.
fn parse_int_literal(text: &str) -> Option<i64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Vec<Stmt> {
        match Parser::new(source).parse() {
            Ok(program) => program,
            Err(errors) => panic!("parse failed: {:?}", errors),
        }
    }

    fn parse_err(source: &str) -> Vec<ParseError> {
        Parser::new(source).parse().expect_err("expected parse errors")
    }

    #[test]
    fn test_let_with_initializer() {
        let program = parse_ok("let x: int = 10\n");
        assert_eq!(program.len(), 1);
        match &program[0].kind {
            StmtKind::Let { name, ty, init } => {
                assert_eq!(name, "x");
                assert_eq!(*ty, Type::Int);
                assert!(init.is_some());
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_let_keyword() {
        let errors = parse_err("x: int = 10\n");
        assert!(errors[0].message.contains("missing 'let' keyword"));
    }

    #[test]
    fn test_missing_type_annotation() {
        let errors = parse_err("let x = 10\n");
        assert!(errors[0].message.contains("missing type annotation"));
    }

    #[test]
    fn test_parameter_missing_annotation() {
        let errors = parse_err("func f(a)\nend\n");
        assert!(errors[0].message.contains("missing type annotation for parameter 'a'"));
    }

    #[test]
    fn test_precedence() {
        let program = parse_ok("let x: int = 1 + 2 * 3\n");
        let StmtKind::Let { init: Some(expr), .. } = &program[0].kind else {
            panic!("expected let");
        };
        // `+` at the top, `*` nested on the right.
        let ExprKind::Binary { op: BinaryOp::Add, rhs, .. } = &expr.kind else {
            panic!("expected add at root, got {:?}", expr.kind);
        };
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_logical_binds_looser_than_equality() {
        let program = parse_ok("let b: bool = a == 1 && c == 2\n");
        let StmtKind::Let { init: Some(expr), .. } = &program[0].kind else {
            panic!("expected let");
        };
        assert!(matches!(expr.kind, ExprKind::Logical { and: true, .. }));
    }

    #[test]
    fn test_elif_desugars_to_nested_if() {
        let program = parse_ok("if a then\nx()\nelif b then\ny()\nelse\nz()\nend\n");
        let StmtKind::If { else_block: Some(else_block), .. } = &program[0].kind else {
            panic!("expected if with else");
        };
        assert_eq!(else_block.len(), 1);
        assert!(matches!(&else_block[0].kind, StmtKind::If { else_block: Some(_), .. }));
    }

    #[test]
    fn test_map_type_and_literal() {
        let program = parse_ok("let m: map[string, int] = {\"x\": 1, \"y\": 2}\n");
        let StmtKind::Let { ty, init: Some(expr), .. } = &program[0].kind else {
            panic!("expected let");
        };
        assert_eq!(
            *ty,
            Type::Map(Box::new(Type::Str), Box::new(Type::Int))
        );
        let ExprKind::MapLit(entries) = &expr.kind else {
            panic!("expected map literal");
        };
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_array_types() {
        let program = parse_ok("let a: []int = [1, 2]\nlet b: [3]float = [1.0, 2.0, 3.0]\n");
        let StmtKind::Let { ty, .. } = &program[0].kind else { panic!() };
        assert_eq!(*ty, Type::Array(Box::new(Type::Int), 0));
        let StmtKind::Let { ty, .. } = &program[1].kind else { panic!() };
        assert_eq!(*ty, Type::Array(Box::new(Type::Float), 3));
    }

    #[test]
    fn test_ref_requires_addressable() {
        let errors = parse_err("let r: ref int = ref (1 + 2)\n");
        assert!(errors[0].message.contains("addressable"));
    }

    #[test]
    fn test_ref_of_member_and_index() {
        parse_ok("let r: ref int = ref node.next\nlet s: ref int = ref xs[0]\n");
    }

    #[test]
    fn test_deref_assignment() {
        let program = parse_ok("*p = 5\n");
        assert!(matches!(program[0].kind, StmtKind::RefAssign { .. }));
    }

    #[test]
    fn test_func_statement_and_literal() {
        let program = parse_ok(
            "func makeAdder(x: int) -> func\nreturn func(y: int) -> int\nreturn x + y\nend\nend\n",
        );
        let StmtKind::FuncDef(def) = &program[0].kind else {
            panic!("expected func def");
        };
        assert_eq!(def.name.as_deref(), Some("makeAdder"));
        assert_eq!(def.return_type, Type::Func);
        let StmtKind::Return(Some(inner)) = &def.body[0].kind else {
            panic!("expected return");
        };
        assert!(matches!(inner.kind, ExprKind::Func(_)));
    }

    #[test]
    fn test_use_forms() {
        let program = parse_ok("use net.http as h\nuse util select a, b\nuse tools select *\n");
        let StmtKind::Use { path, alias, .. } = &program[0].kind else { panic!() };
        assert_eq!(path, &vec!["net".to_string(), "http".to_string()]);
        assert_eq!(alias.as_deref(), Some("h"));
        let StmtKind::Use { select, .. } = &program[1].kind else { panic!() };
        assert_eq!(
            *select,
            Some(UseSelect::Names(vec!["a".to_string(), "b".to_string()]))
        );
        let StmtKind::Use { select, .. } = &program[2].kind else { panic!() };
        assert_eq!(*select, Some(UseSelect::All));
    }

    #[test]
    fn test_when_cases() {
        let program = parse_ok(
            "when\ncase x = chan_recv(a) then\nprint(x)\ncase chan_send(b, 1) then\nprint(2)\ndefault\nprint(3)\nend\n",
        );
        let StmtKind::When { cases, default } = &program[0].kind else {
            panic!("expected when");
        };
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].binding.as_deref(), Some("x"));
        assert!(matches!(cases[0].op, WhenOp::Recv));
        assert!(matches!(cases[1].op, WhenOp::Send(_)));
        assert!(default.is_some());
    }

    #[test]
    fn test_when_rejects_other_calls() {
        let errors = parse_err("when\ncase foo(a) then\nprint(1)\nend\n");
        assert!(errors[0].message.contains("chan_recv or chan_send"));
    }

    #[test]
    fn test_fstring_plain_hole() {
        let program = parse_ok("let s: string = f\"Sum: {x + y}\"\n");
        let StmtKind::Let { init: Some(expr), .. } = &program[0].kind else { panic!() };
        // "Sum: " + to_str(x + y)
        let ExprKind::Binary { op: BinaryOp::Add, lhs, rhs } = &expr.kind else {
            panic!("expected concatenation, got {:?}", expr.kind);
        };
        assert!(matches!(&lhs.kind, ExprKind::Str(s) if s == "Sum: "));
        let ExprKind::Call { callee, args } = &rhs.kind else {
            panic!("expected to_str call");
        };
        assert!(matches!(&callee.kind, ExprKind::Ident(n) if n == "to_str"));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_fstring_format_spec() {
        let program = parse_ok("let s: string = f\"{x:.2f}|{n:05}\"\n");
        let StmtKind::Let { init: Some(expr), .. } = &program[0].kind else { panic!() };
        // fmt("%.2f", x) + "|" + fmt("%05v", n)
        let mut specs = Vec::new();
        fn collect(expr: &Expr, specs: &mut Vec<String>) {
            match &expr.kind {
                ExprKind::Binary { lhs, rhs, .. } => {
                    collect(lhs, specs);
                    collect(rhs, specs);
                }
                ExprKind::Call { callee, args } => {
                    if matches!(&callee.kind, ExprKind::Ident(n) if n == "fmt") {
                        if let ExprKind::Str(s) = &args[0].kind {
                            specs.push(s.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        collect(expr, &mut specs);
        assert_eq!(specs, vec!["%.2f".to_string(), "%05v".to_string()]);
    }

    #[test]
    fn test_fstring_unclosed_brace() {
        let errors = parse_err("let s: string = f\"{x\"\n");
        assert!(errors[0].message.contains("unclosed '{'"));
    }

    #[test]
    fn test_fstring_no_holes() {
        let program = parse_ok("let s: string = f\"plain\"\n");
        let StmtKind::Let { init: Some(expr), .. } = &program[0].kind else { panic!() };
        assert!(matches!(&expr.kind, ExprKind::Str(s) if s == "plain"));
    }

    #[test]
    fn test_error_recovery_collects_multiple() {
        let errors = parse_err("let a = 1\nlet b = 2\n");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_unexpected_eof_mentions_end_of_file() {
        let errors = parse_err("while true do\nprint(1)\n");
        assert!(errors.iter().any(|e| e.message.contains("end of file")));
    }

    #[test]
    fn test_multiline_inside_parens() {
        parse_ok("let x: int = foo(\n1,\n2\n)\n");
    }

    #[test]
    fn test_hex_literal() {
        let program = parse_ok("let x: int = 0x1F\n");
        let StmtKind::Let { init: Some(expr), .. } = &program[0].kind else { panic!() };
        assert!(matches!(expr.kind, ExprKind::Int(31)));
    }

    #[test]
    fn test_zeros() {
        let program = parse_ok("let b: bytes = zeros(16)\n");
        let StmtKind::Let { init: Some(expr), .. } = &program[0].kind else { panic!() };
        assert!(matches!(expr.kind, ExprKind::Zeros(_)));
    }

    #[test]
    fn test_struct_definition() {
        let program = parse_ok("struct Node\nvalue: int\nnext: ref Node\nend\n");
        let StmtKind::StructDef { name, fields } = &program[0].kind else {
            panic!("expected struct");
        };
        assert_eq!(name, "Node");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].1, Type::Ref(Box::new(Type::Named("Node".into()))));
    }

    #[test]
    fn test_chan_type() {
        let program = parse_ok("let c: chan int = make_chan(0)\n");
        let StmtKind::Let { ty, .. } = &program[0].kind else { panic!() };
        assert_eq!(*ty, Type::Chan(Box::new(Type::Int)));
    }

    #[test]
    fn test_break_and_for() {
        let program = parse_ok("for k in m do\nif k == 0 then break end\nend\n");
        assert!(matches!(program[0].kind, StmtKind::For { .. }));
    }
}
