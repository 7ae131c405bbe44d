//! Single-pass Pratt parser: walks the token stream once, emitting bytecode
//! directly into the function currently being compiled rather than building
//! an intermediate AST. Local/upvalue resolution, jump patching and class
//! method tables are all handled inline as each construct is parsed.

use quill_core::{Chunk, Handle, ObjFunction, OpCode, Value};
use quill_vm::Heap;

use crate::error::CompileError;
use crate::scanner::{Scanner, Token, TokenKind};

#[cfg(feature = "debug-print-code")]
use crate::disassemble::disassemble_chunk;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call | Prec::Primary => Prec::Primary,
        }
    }
}

struct Local<'src> {
    name: &'src str,
    /// -1 means "declared but not yet initialized" -- the window between
    /// `var x = x;` seeing `x` on the right and the assignment completing.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueInfo {
    index: u8,
    is_local: bool,
}

struct FunctionState<'src> {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueInfo>,
    scope_depth: i32,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: Option<Handle>) -> Self {
        let slot_zero_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        FunctionState {
            function: ObjFunction::new(name),
            kind,
            locals: vec![Local { name: slot_zero_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'heap mut Heap,
    states: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

/// Compiles `source` into the top-level script function, ready to be
/// wrapped in a closure and handed to a `Vm`. Every constant a
/// still-under-construction function has already interned is marked during
/// the compiler's own allocations, since none of it is reachable from any
/// VM root until the finished closure is pushed onto the stack.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Handle, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let (handle, _upvalues) = compiler.end_function();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(handle)
    }
}

fn token_excerpt(token: &Token) -> Option<String> {
    match token.kind {
        TokenKind::Eof => Some(" at end".to_string()),
        TokenKind::Error => None,
        _ => Some(format!(" at '{}'", token.lexeme)),
    }
}

fn mark_compile_roots(heap: &mut Heap, states: &[FunctionState]) {
    for state in states {
        if let Some(name) = state.function.name {
            heap.mark_handle(name);
        }
        for &value in &state.function.chunk.constants {
            heap.mark_value(value);
        }
    }
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        let placeholder = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Compiler {
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            heap,
            states: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    // -- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let excerpt = token_excerpt(&self.current);
        self.errors.push(CompileError { message: message.to_string(), line: self.current.line, excerpt });
    }

    fn error(&mut self, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let excerpt = token_excerpt(&self.previous);
        self.errors.push(CompileError { message: message.to_string(), line: self.previous.line, excerpt });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- heap access --------------------------------------------------------

    fn intern(&mut self, s: String) -> Handle {
        let states = &self.states;
        self.heap.intern_string(s, |h| mark_compile_roots(h, states))
    }

    fn alloc_function(&mut self, f: ObjFunction) -> Handle {
        let states = &self.states;
        self.heap.alloc_function(f, |h| mark_compile_roots(h, states))
    }

    // -- emitting bytecode --------------------------------------------------

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.states.last_mut().expect("compiler function stack empty").function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk_mut().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk_mut().write_op(op, line);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        if self.states.last().unwrap().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk_mut().add_constant(value) {
            Ok(idx) => idx,
            Err(()) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, idx);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk_mut().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk_mut().len() - offset - 2;
        if jump > quill_core::MAX_JUMP {
            self.error("Too much code to jump over.");
            return;
        }
        let bytes = (jump as u16).to_be_bytes();
        let chunk = self.current_chunk_mut();
        chunk.code[offset] = bytes[0];
        chunk.code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk_mut().len() - loop_start + 2;
        if offset > quill_core::MAX_JUMP {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // -- scope/local/upvalue bookkeeping ------------------------------------

    fn scope_depth(&self) -> i32 {
        self.states.last().unwrap().scope_depth
    }

    fn begin_scope(&mut self) {
        self.states.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let idx = self.states.len() - 1;
        self.states[idx].scope_depth -= 1;
        let depth = self.states[idx].scope_depth;
        let mut popped_captured = Vec::new();
        while let Some(local) = self.states[idx].locals.last() {
            if local.depth > depth {
                popped_captured.push(local.is_captured);
                self.states[idx].locals.pop();
            } else {
                break;
            }
        }
        for captured in popped_captured {
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &'src str) {
        let idx = self.states.len() - 1;
        if self.states[idx].locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.states[idx].locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.scope_depth() == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.scope_depth();
        let idx = self.states.len() - 1;
        let duplicate = self.states[idx].locals.iter().rev().any(|local| {
            if local.depth != -1 && local.depth < depth {
                false
            } else {
                local.name == name
            }
        });
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let idx = self.states.len() - 1;
        if self.states[idx].scope_depth == 0 {
            return;
        }
        let depth = self.states[idx].scope_depth;
        let last = self.states[idx].locals.len() - 1;
        self.states[idx].locals[last].depth = depth;
    }

    fn resolve_local(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        let found = {
            let locals = &self.states[state_idx].locals;
            locals.iter().enumerate().rev().find(|(_, l)| l.name == name).map(|(i, l)| (i as u8, l.depth))
        };
        match found {
            Some((idx, depth)) => {
                if depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(idx)
            }
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        let enclosing = state_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(state_idx, local_idx, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(state_idx, upvalue_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.states[state_idx]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local);
        if let Some(pos) = existing {
            return pos as u8;
        }
        let count = self.states[state_idx].upvalues.len();
        if count >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.states[state_idx].upvalues.push(UpvalueInfo { index, is_local });
        count as u8
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.intern(name.to_string());
        self.make_constant(Value::object(handle))
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.scope_depth() > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.scope_depth() > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let current_idx = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(current_idx, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(current_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let slot = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, slot)
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // -- expressions ---------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Prec) {
        self.advance();
        let can_assign = precedence <= Prec::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= self.infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::StringLiteral => self.string_literal(),
            TokenKind::False | TokenKind::True | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::Slash
            | TokenKind::Star
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            TokenKind::And => self.and_expr(),
            TokenKind::Or => self.or_expr(),
            _ => {}
        }
    }

    fn infix_precedence(&self, kind: TokenKind) -> Prec {
        use TokenKind::*;
        match kind {
            LeftParen | Dot => Prec::Call,
            Star | Slash => Prec::Factor,
            Plus | Minus => Prec::Term,
            Greater | GreaterEqual | Less | LessEqual => Prec::Comparison,
            BangEqual | EqualEqual => Prec::Equality,
            And => Prec::And,
            Or => Prec::Or,
            _ => Prec::None,
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let kind = self.previous.kind;
        self.parse_precedence(Prec::Unary);
        match kind {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary dispatched on non-unary token"),
        }
    }

    fn binary(&mut self) {
        let kind = self.previous.kind;
        let precedence = self.infix_precedence(kind);
        self.parse_precedence(precedence.next());
        match kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary dispatched on non-binary token"),
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::number(value));
    }

    fn string_literal(&mut self) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let handle = self.intern(contents.to_string());
        self.emit_constant(Value::object(handle));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal dispatched on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);
        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::SuperInvoke, name_idx);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::GetSuper, name_idx);
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Prec::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Prec::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name_idx);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name_idx);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name_idx);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_PARAMS as u16 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(MAX_PARAMS as u16) as u8
    }

    // -- statements ------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk_mut().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk_mut().len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk_mut().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.states.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.states.last().unwrap().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name_lexeme = self.previous.lexeme.to_string();
        let name_handle = self.intern(name_lexeme);
        self.states.push(FunctionState::new(kind, Some(name_handle)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut arity: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                arity += 1;
                if arity > MAX_PARAMS as u16 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        let idx = self.states.len() - 1;
        self.states[idx].function.arity = arity.min(MAX_PARAMS as u16) as u8;
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (handle, upvalues) = self.end_function();
        let const_idx = self.make_constant(Value::object(handle));
        self.emit_op_byte(OpCode::Closure, const_idx);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn end_function(&mut self) -> (Handle, Vec<UpvalueInfo>) {
        self.emit_return();
        let mut state = self.states.pop().expect("function state stack empty");
        state.function.upvalue_count = state.upvalues.len() as u8;
        #[cfg(feature = "debug-print-code")]
        if !self.had_error {
            let name = state
                .function
                .name
                .map(|h| self.heap.get_string(h).to_string())
                .unwrap_or_else(|| "<script>".to_string());
            eprintln!("{}", disassemble_chunk(&state.function.chunk, &name, self.heap));
        }
        let upvalues = state.upvalues.clone();
        let handle = self.alloc_function(state.function);
        (handle, upvalues)
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_lexeme = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&name_lexeme);
        let kind = if name_lexeme == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_op_byte(OpCode::Method, name_idx);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_idx = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_op_byte(OpCode::Class, name_idx);
        self.define_variable(name_idx);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme;
            self.variable(false);
            if superclass_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::OpCode;

    fn compile_ok(source: &str) -> (Handle, Heap) {
        let mut heap = Heap::new();
        let handle = compile(source, &mut heap).expect("expected successful compile");
        (handle, heap)
    }

    fn compile_err(source: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("expected a compile error")
    }

    #[test]
    fn compiles_arithmetic_with_expected_opcodes() {
        let (handle, heap) = compile_ok("print 1 + 2 * 3;");
        let function = heap.get(handle).as_function().unwrap();
        let ops: Vec<OpCode> = function
            .chunk
            .code
            .iter()
            .filter_map(|&b| OpCode::try_from(b).ok())
            .collect();
        assert!(ops.contains(&OpCode::Multiply));
        assert!(ops.contains(&OpCode::Add));
        assert!(ops.contains(&OpCode::Print));
    }

    #[test]
    fn top_level_return_is_a_compile_error() {
        let errors = compile_err("return 1;");
        assert!(errors.iter().any(|e| e.message == "Can't return from top-level code."));
    }

    #[test]
    fn missing_semicolon_is_reported() {
        let errors = compile_err("var x = 1");
        assert!(errors.iter().any(|e| e.message.contains("Expect ';'")));
    }

    #[test]
    fn duplicate_local_in_same_scope_is_an_error() {
        let errors = compile_err("{ var a = 1; var a = 2; }");
        assert!(errors.iter().any(|e| e.message == "Already a variable with this name in this scope."));
    }

    #[test]
    fn closures_compile_with_captured_upvalue() {
        let source = "fun outer() { var x = 1; fun inner() { return x; } return inner; }";
        let (handle, heap) = compile_ok(source);
        let outer = heap.get(handle).as_function().unwrap();
        let ops: Vec<OpCode> = outer.chunk.code.iter().filter_map(|&b| OpCode::try_from(b).ok()).collect();
        assert!(ops.contains(&OpCode::Closure));
    }

    #[test]
    fn this_outside_class_is_an_error() {
        let errors = compile_err("fun f() { return this; }");
        assert!(errors.iter().any(|e| e.message == "Can't use 'this' outside of a class."));
    }

    #[test]
    fn returning_a_value_from_init_is_an_error() {
        let source = "class Foo { init() { return 1; } }";
        let errors = compile_err(source);
        assert!(errors.iter().any(|e| e.message == "Can't return a value from an initializer."));
    }

    fn param_list(count: usize) -> String {
        (0..count).map(|i| format!("p{i}")).collect::<Vec<_>>().join(", ")
    }

    #[test]
    fn two_hundred_fifty_five_parameters_compile() {
        let source = format!("fun f({}) {{}}", param_list(255));
        compile_ok(&source);
    }

    #[test]
    fn two_hundred_fifty_six_parameters_is_an_error() {
        let source = format!("fun f({}) {{}}", param_list(256));
        let errors = compile_err(&source);
        assert!(errors.iter().any(|e| e.message == "Can't have more than 255 parameters."));
    }

    /// `a = a;` repeated N times touches no constants (reads/writes the one
    /// outer local `a`), so it pads a chunk with bytecode without also
    /// tripping the 256-constant limit.
    fn padding_statements(count: usize) -> String {
        "a = a; ".repeat(count)
    }

    #[test]
    fn jump_within_limit_compiles() {
        let source = format!("fun f() {{ var a = 0; if (a) {{ {} }} }}", padding_statements(10));
        compile_ok(&source);
    }

    #[test]
    fn jump_exceeding_limit_is_a_compile_error() {
        let source = format!("fun f() {{ var a = 0; if (a) {{ {} }} }}", padding_statements(20_000));
        let errors = compile_err(&source);
        assert!(errors.iter().any(|e| e.message == "Too much code to jump over."));
    }

    #[test]
    fn loop_within_limit_compiles() {
        let source = format!("fun f() {{ var a = 0; while (a) {{ {} }} }}", padding_statements(10));
        compile_ok(&source);
    }

    #[test]
    fn loop_body_exceeding_limit_is_a_compile_error() {
        let source = format!("fun f() {{ var a = 0; while (a) {{ {} }} }}", padding_statements(20_000));
        let errors = compile_err(&source);
        assert!(errors.iter().any(|e| e.message == "Loop body too large."));
    }

    #[test]
    fn super_outside_class_is_an_error() {
        let errors = compile_err("fun f() { return super.x; }");
        assert!(errors.iter().any(|e| e.message == "Can't use 'super' outside of a class."));
    }

    #[test]
    fn super_in_class_with_no_superclass_is_an_error() {
        let source = "class A { m() { return super.x; } }";
        let errors = compile_err(source);
        assert!(errors.iter().any(|e| e.message == "Can't use 'super' in a class with no superclass."));
    }
}
