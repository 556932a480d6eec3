//! The single-pass compiler.
//!
//! A Pratt parser that emits bytecode directly into the function being
//! compiled, with no AST in between. Nested function declarations stack
//! compiler frames; each frame tracks its locals, upvalues, scope depth, and
//! whether the function is in implicit-return mode (its expression
//! statements stash their value instead of popping it).
//!
//! The first error puts the parser into panic mode; further errors are
//! suppressed until it resynchronises at a statement boundary.

use std::io::{self, IsTerminal};

use jmpl_core::chunk::OpCode;
use jmpl_core::object::{FunctionObj, ObjRef, Payload};
use jmpl_core::{Heap, UINT8_COUNT, Value};

use crate::escape::decode_string;
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};

/// Compile a source buffer into a top-level script function. Errors are
/// reported to stderr; `None` means at least one was raised.
pub fn compile(source: &str, heap: &mut Heap) -> Option<ObjRef> {
    let mut parser = Parser::new(source, heap);
    parser.advance();

    loop {
        if parser.match_token(TokenKind::Newline)
            || parser.match_token(TokenKind::Semicolon)
            || parser.match_token(TokenKind::Dedent)
        {
            continue;
        }
        if parser.match_token(TokenKind::Eof) {
            break;
        }
        parser.declaration();
    }

    let had_error = parser.had_error;
    let (function, _) = parser.end_compiler();
    tracing::debug!(target: "jmpl::compiler", had_error, "compile finished");
    if had_error { None } else { Some(function) }
}

/// Precedence order, lowest to highest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Precedence {
    None,
    /// :=
    Assignment,
    /// ⇒ (right-associative)
    Implies,
    /// or, xor
    Or,
    /// and
    And,
    /// == ¬= in
    Equality,
    /// < > <= >= ⊂ ⊆
    Comparison,
    /// + - ∩ ∪ \
    Term,
    /// * / %
    Factor,
    /// ^
    Exponent,
    /// ¬ - # arb
    Unary,
    /// () []
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Implies,
            Implies => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Exponent,
            Exponent => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Parser<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

#[derive(Clone, Copy)]
struct Local<'src> {
    name: &'src str,
    /// -1 marks declared-but-uninitialised.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueRec {
    index: u8,
    is_local: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

/// One function being compiled.
struct CompilerFrame<'src> {
    kind: FunctionKind,
    chunk: jmpl_core::Chunk,
    arity: usize,
    name: Option<ObjRef>,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRec>,
    scope_depth: i32,
    implicit_return: bool,
}

impl<'src> CompilerFrame<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> CompilerFrame<'src> {
        // Slot zero belongs to the function value itself.
        let blank = Local {
            name: "",
            depth: 0,
            is_captured: false,
        };
        CompilerFrame {
            kind,
            chunk: jmpl_core::Chunk::new(),
            arity: 0,
            name,
            locals: vec![blank],
            upvalues: Vec::new(),
            scope_depth: 0,
            implicit_return: false,
        }
    }
}

pub struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    frames: Vec<CompilerFrame<'src>>,
}

impl<'src, 'h> Parser<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Parser<'src, 'h> {
        Parser {
            scanner: Scanner::new(source),
            heap,
            current: Token::synthetic(TokenKind::Eof),
            previous: Token::synthetic(TokenKind::Eof),
            had_error: false,
            panic_mode: false,
            frames: vec![CompilerFrame::new(FunctionKind::Script, None)],
        }
    }

    // --- Token plumbing ---

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
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

    /// Whether the token after `current` is `∈`, without consuming input.
    fn next_is_in(&self) -> bool {
        let mut lookahead = self.scanner.clone();
        loop {
            let token = lookahead.scan_token();
            if token.kind == TokenKind::Error {
                continue;
            }
            return token.kind == TokenKind::In;
        }
    }

    /// Statement separator: `;`, newline, or a block/file boundary.
    fn consume_separator(&mut self) {
        if self.match_token(TokenKind::Semicolon) || self.match_token(TokenKind::Newline) {
            return;
        }
        if matches!(
            self.current.kind,
            TokenKind::Indent | TokenKind::Dedent | TokenKind::Eof | TokenKind::Else
        ) {
            return;
        }
        self.error("Invalid syntax");
    }

    // --- Errors ---

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme.escape_debug()),
        };

        if io::stderr().is_terminal() {
            eprintln!(
                "[line {}] \x1b[31mError\x1b[0m{}: {}.",
                token.line, location, message
            );
        } else {
            eprintln!("[line {}] Error{}: {}.", token.line, location, message);
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if matches!(
                self.previous.kind,
                TokenKind::Semicolon | TokenKind::Newline | TokenKind::Dedent
            ) {
                return;
            }
            match self.current.kind {
                TokenKind::Let
                | TokenKind::Func
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Out => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- Frame and emission helpers ---

    fn current_frame(&self) -> &CompilerFrame<'src> {
        self.frames.last().expect("compiler frame underflow")
    }

    fn current_frame_mut(&mut self) -> &mut CompilerFrame<'src> {
        self.frames.last_mut().expect("compiler frame underflow")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_frame_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_u8(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_op_u16(&mut self, op: OpCode, operand: u16) {
        self.emit_op(op);
        self.emit_byte((operand >> 8) as u8);
        self.emit_byte((operand & 0xFF) as u8);
    }

    fn current_offset(&self) -> usize {
        self.current_frame().chunk.code.len()
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.current_offset() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the offset bytes themselves.
        let jump = self.current_offset() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("(Internal) Too much code to jump over");
        }
        let chunk = &mut self.current_frame_mut().chunk;
        chunk.code[offset] = ((jump >> 8) & 0xFF) as u8;
        chunk.code[offset + 1] = (jump & 0xFF) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_offset() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("(Internal) Loop body too large");
        }
        self.emit_byte(((offset >> 8) & 0xFF) as u8);
        self.emit_byte((offset & 0xFF) as u8);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        let existing = self.current_frame().chunk.find_constant(self.heap, value);
        let index = match existing {
            Some(i) => i,
            None => self.current_frame_mut().chunk.add_constant(value),
        };
        if index > u16::MAX as usize {
            self.error("(Internal) Too many constants in one chunk");
            return 0;
        }
        index as u16
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_u16(OpCode::Constant, constant);
    }

    fn emit_return(&mut self) {
        let frame = self.current_frame();
        let implicit = frame.implicit_return && frame.kind == FunctionKind::Function;
        if !implicit {
            self.emit_op(OpCode::Null);
        }
        self.emit_op(OpCode::Return);
        self.emit_byte(implicit as u8);
    }

    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueRec>) {
        self.emit_return();
        let frame = self.frames.pop().expect("compiler frame underflow");
        let function = self.heap.alloc(Payload::Function(FunctionObj {
            arity: frame.arity,
            upvalue_count: frame.upvalues.len(),
            chunk: frame.chunk,
            name: frame.name,
        }));
        (function, frame.upvalues)
    }

    // --- Scopes and variables ---

    fn begin_scope(&mut self) {
        self.current_frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_frame_mut().scope_depth -= 1;
        loop {
            let (pop_needed, captured) = {
                let frame = self.current_frame();
                match frame.locals.last() {
                    Some(local) if local.depth > frame.scope_depth => (true, local.is_captured),
                    _ => (false, false),
                }
            };
            if !pop_needed {
                break;
            }
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_frame_mut().locals.pop();
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::Obj(interned))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_frame().locals.len() == UINT8_COUNT {
            self.error("(Internal) Too many local variables in current scope");
            return;
        }
        self.current_frame_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.current_frame().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let frame = self.current_frame();
            for local in frame.locals.iter().rev() {
                if local.depth != -1 && local.depth < frame.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Variable with this identifier already defined in this scope");
        }

        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_frame().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let frame = self.current_frame_mut();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u16) {
        if self.current_frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_u16(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (i, local) in self.frames[frame_index].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i, local.depth == -1));
                break;
            }
        }

        match found {
            Some((slot, uninitialised)) => {
                if uninitialised {
                    self.error("Can't read local variable in its own initialiser");
                }
                Some(slot as u8)
            }
            None => None,
        }
    }

    fn add_upvalue(&mut self, frame_index: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.frames[frame_index]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local);
        if let Some(i) = existing {
            return i as u8;
        }

        if self.frames[frame_index].upvalues.len() == UINT8_COUNT {
            self.error("(Internal) Too many closure variables in function");
            return 0;
        }

        self.frames[frame_index]
            .upvalues
            .push(UpvalueRec { index, is_local });
        (self.frames[frame_index].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        if frame_index == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(frame_index - 1, name) {
            self.frames[frame_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(frame_index, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(frame_index - 1, name) {
            return Some(self.add_upvalue(frame_index, upvalue, false));
        }

        None
    }

    // --- Declarations and statements ---

    pub(crate) fn declaration(&mut self) {
        if self.match_token(TokenKind::Let) {
            self.let_declaration();
        } else if self.match_token(TokenKind::Func) {
            self.func_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn let_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name");

        if self.match_token(TokenKind::Assign) {
            self.expression();
        } else {
            self.emit_op(OpCode::Null);
        }
        self.consume_separator();

        self.define_variable(global);
    }

    fn func_declaration(&mut self) {
        let global = self.parse_variable("Expected function name");
        self.mark_initialized();
        self.function();
        self.define_variable(global);
    }

    fn function(&mut self) {
        let name = self.heap.intern(self.previous.lexeme);
        self.frames
            .push(CompilerFrame::new(FunctionKind::Function, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current_frame_mut().arity += 1;
                if self.current_frame().arity > 255 {
                    self.error_at_current("(Internal) Can't have more than 255 parameters");
                }
                let constant = self.parse_variable("Expected parameter name");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters");
        self.consume(TokenKind::Colon, "Expected ':' before function body");

        if self.match_token(TokenKind::Newline) {
            self.consume(TokenKind::Indent, "Expected an indented block");
            self.block();
        } else {
            self.statement();
        }

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_u16(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn block(&mut self) {
        loop {
            if self.check(TokenKind::Dedent) || self.check(TokenKind::Eof) {
                break;
            }
            if self.match_token(TokenKind::Newline) || self.match_token(TokenKind::Semicolon) {
                continue;
            }
            self.declaration();
        }
        if self.check(TokenKind::Dedent) {
            self.advance();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Out) {
            self.out_statement();
        } else if self.match_token(TokenKind::Indent) {
            self.error("Unexpected indentation");
        } else {
            self.expression_statement();
        }
    }

    /// A statement body: one inline statement, or an indented block.
    fn compile_body(&mut self) {
        if self.match_token(TokenKind::Newline) {
            self.consume(TokenKind::Indent, "Expected an indented block");
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.statement();
        }
    }

    fn if_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Then, "Expected 'then' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.compile_body();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);

        if self.match_token(TokenKind::Else) {
            self.compile_body();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_offset();
        self.expression();
        self.consume(TokenKind::Do, "Expected 'do' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.compile_body();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
    }

    fn return_statement(&mut self) {
        if self.current_frame().kind == FunctionKind::Script {
            self.error("Can't return from top-level code");
        }

        if matches!(
            self.current.kind,
            TokenKind::Newline
                | TokenKind::Semicolon
                | TokenKind::Eof
                | TokenKind::Dedent
                | TokenKind::Else
        ) {
            self.emit_op(OpCode::Null);
        } else {
            self.expression();
        }
        self.consume_separator();

        self.emit_op(OpCode::Return);
        self.emit_byte(0);
    }

    fn out_statement(&mut self) {
        self.expression();
        self.consume_separator();
        self.emit_op(OpCode::Out);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume_separator();

        if self.current_frame().kind == FunctionKind::Function {
            // Implicit-return mode: keep the value in the frame's stash.
            self.emit_op(OpCode::Stash);
            self.current_frame_mut().implicit_return = true;
        } else {
            self.emit_op(OpCode::Pop);
        }
    }

    // --- Expressions ---

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::get_rule(self.previous.kind).prefix else {
            self.error("Expected expression");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Assign) {
            self.error("Invalid assignment target");
        }
    }

    fn get_rule(kind: TokenKind) -> ParseRule<'src, 'h> {
        use TokenKind::*;

        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'h>>,
            Option<ParseFn<'src, 'h>>,
            Precedence,
        ) = match kind {
            LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            LeftBrace => (Some(Self::set_expr), None, Precedence::None),
            LeftSquare => (None, Some(Self::subscript), Precedence::Call),
            Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => (None, Some(Self::binary), Precedence::Term),
            Intersect | Union | Backslash => (None, Some(Self::binary), Precedence::Term),
            Slash | Asterisk | Percent => (None, Some(Self::binary), Precedence::Factor),
            Caret => (None, Some(Self::binary), Precedence::Exponent),
            Not => (Some(Self::unary), None, Precedence::None),
            Hash => (Some(Self::size_expr), None, Precedence::None),
            Arb => (Some(Self::arb_expr), None, Precedence::None),
            Summation => (Some(Self::summation), None, Precedence::None),
            EqualEqual | NotEqual => (None, Some(Self::binary), Precedence::Equality),
            In => (None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            Subset | SubsetEq => (None, Some(Self::binary), Precedence::Comparison),
            And => (None, Some(Self::and_expr), Precedence::And),
            Or => (None, Some(Self::or_expr), Precedence::Or),
            Xor => (None, Some(Self::binary), Precedence::Or),
            Implies => (None, Some(Self::implies_expr), Precedence::Implies),
            Identifier => (Some(Self::variable), None, Precedence::None),
            String => (Some(Self::string), None, Precedence::None),
            Number => (Some(Self::number), None, Precedence::None),
            True | False | Null => (Some(Self::literal), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };

        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let body = &lexeme[1..lexeme.len() - 1];
        match decode_string(body) {
            Ok(text) => {
                let interned = self.heap.intern(&text);
                self.emit_constant(Value::Obj(interned));
            }
            Err(message) => self.error(message),
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Null => self.emit_op(OpCode::Null),
            _ => {}
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let frame_index = self.frames.len() - 1;

        enum Target {
            Local(u8),
            Upvalue(u8),
            Global(u16),
        }

        let target = if let Some(slot) = self.resolve_local(frame_index, name.lexeme) {
            Target::Local(slot)
        } else if let Some(index) = self.resolve_upvalue(frame_index, name.lexeme) {
            Target::Upvalue(index)
        } else {
            Target::Global(self.identifier_constant(name.lexeme))
        };

        if can_assign && self.match_token(TokenKind::Assign) {
            self.expression();
            match target {
                Target::Local(slot) => self.emit_op_u8(OpCode::SetLocal, slot),
                Target::Upvalue(index) => self.emit_op_u8(OpCode::SetUpvalue, index),
                Target::Global(constant) => self.emit_op_u16(OpCode::SetGlobal, constant),
            }
        } else {
            match target {
                Target::Local(slot) => self.emit_op_u8(OpCode::GetLocal, slot),
                Target::Upvalue(index) => self.emit_op_u8(OpCode::GetUpvalue, index),
                Target::Global(constant) => self.emit_op_u16(OpCode::GetGlobal, constant),
            }
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Not => self.emit_op(OpCode::Not),
            _ => {}
        }
    }

    fn size_expr(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::Size);
    }

    fn arb_expr(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::Arb);
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Self::get_rule(operator);
        self.parse_precedence(rule.precedence.next());

        match operator {
            TokenKind::NotEqual => self.emit_op(OpCode::NotEqual),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_op(OpCode::GreaterEqual),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_op(OpCode::LessEqual),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Asterisk => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Caret => self.emit_op(OpCode::Exponent),
            TokenKind::Percent => self.emit_op(OpCode::Mod),
            TokenKind::Xor => self.emit_op(OpCode::Xor),
            TokenKind::In => self.emit_op(OpCode::SetIn),
            TokenKind::Intersect => self.emit_op(OpCode::SetIntersect),
            TokenKind::Union => self.emit_op(OpCode::SetUnion),
            TokenKind::Backslash => self.emit_op(OpCode::SetDifference),
            TokenKind::Subset => self.emit_op(OpCode::Subset),
            TokenKind::SubsetEq => self.emit_op(OpCode::SubsetEq),
            _ => {}
        }
    }

    fn and_expr(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalsePeek);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalsePeek);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    /// `a ⇒ b` is `¬a ∨ b`: a false antecedent short-circuits to true.
    fn implies_expr(&mut self, _can_assign: bool) {
        let false_jump = self.emit_jump(OpCode::JumpIfFalsePeek);
        self.emit_op(OpCode::Pop);
        // Same precedence, not one higher: implication chains to the right.
        self.parse_precedence(Precedence::Implies);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(false_jump);
        self.emit_op(OpCode::Pop);
        self.emit_op(OpCode::True);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let count = self.argument_list();
        self.emit_op_u8(OpCode::Call, count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("(Internal) Can't have more than 255 arguments");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments");
        count.min(255) as u8
    }

    fn subscript(&mut self, _can_assign: bool) {
        let mut is_slice = false;

        if self.match_token(TokenKind::Ellipsis) {
            // [… x]
            is_slice = true;
            self.emit_op(OpCode::Null);
            self.expression();
        } else {
            self.expression();
            if self.match_token(TokenKind::Ellipsis) {
                is_slice = true;
                if self.check(TokenKind::RightSquare) {
                    // [x …]
                    self.emit_op(OpCode::Null);
                } else {
                    // [x … y]
                    self.expression();
                }
            }
        }

        self.consume(TokenKind::RightSquare, "Expected ']' after expression");
        self.emit_op_u8(OpCode::Subscript, is_slice as u8);
    }

    fn grouping(&mut self, _can_assign: bool) {
        // Empty parentheses make an empty tuple.
        if self.match_token(TokenKind::RightParen) {
            self.emit_op_u8(OpCode::CreateTuple, 0);
            return;
        }

        self.expression();
        self.tuple_rest();
        self.consume(TokenKind::RightParen, "Expected ')' after expression");
    }

    /// After the first grouped expression: nothing (plain grouping), `,)`
    /// (1-tuple), a comma list (N-tuple), or an omission.
    fn tuple_rest(&mut self) {
        if self.check(TokenKind::Ellipsis) {
            self.advance();
            self.expression();
            self.emit_op_u8(OpCode::TupleOmission, 0);
        } else if self.match_token(TokenKind::Comma) {
            if self.check(TokenKind::RightParen) {
                self.emit_op_u8(OpCode::CreateTuple, 1);
                return;
            }

            self.expression();

            if self.check(TokenKind::Ellipsis) {
                self.advance();
                self.expression();
                self.emit_op_u8(OpCode::TupleOmission, 1);
            } else {
                let mut count: u32 = 2;
                while self.match_token(TokenKind::Comma) {
                    self.expression();
                    if count < 255 {
                        count += 1;
                    } else {
                        self.error("(Internal) Can't have more than 255 elements in a tuple literal");
                    }
                }
                self.emit_op_u8(OpCode::CreateTuple, count.min(255) as u8);
            }
        }
    }

    fn set_expr(&mut self, _can_assign: bool) {
        if self.match_token(TokenKind::RightBrace) {
            self.emit_op(OpCode::SetCreate);
            return;
        }

        if self.check(TokenKind::Identifier) && self.next_is_in() {
            self.set_builder();
            return;
        }

        self.expression();

        if self.match_token(TokenKind::Ellipsis) {
            // {a … b}
            self.expression();
            self.emit_op_u8(OpCode::SetOmission, 0);
        } else if self.match_token(TokenKind::Comma) {
            self.expression();
            if self.match_token(TokenKind::Ellipsis) {
                // {a, n … b}
                self.expression();
                self.emit_op_u8(OpCode::SetOmission, 1);
            } else {
                let mut count: u32 = 2;
                while self.match_token(TokenKind::Comma) {
                    self.expression();
                    if count < 255 {
                        count += 1;
                    } else {
                        self.error("(Internal) Can't have more than 255 elements in a set literal");
                    }
                }
                self.emit_op(OpCode::SetCreate);
                self.emit_op_u8(OpCode::SetInsert, count.min(255) as u8);
            }
        } else {
            self.emit_op(OpCode::SetCreate);
            self.emit_op_u8(OpCode::SetInsert, 1);
        }

        self.consume(TokenKind::RightBrace, "Expected '}' after set");
    }

    /// `{x ∈ S | P}` — the elements of `S` satisfying `P`.
    fn set_builder(&mut self) {
        self.begin_scope();

        // The result set sits below the generator variable and iterator so
        // the iterator is on top of the stack while the loop runs.
        let set_slot = {
            self.emit_op(OpCode::SetCreate);
            self.add_synthetic_local("@set")
        };
        let gen_slot = self.parse_generator();

        self.consume(TokenKind::Pipe, "Expected '|' after generator");

        let loop_start = self.current_offset();
        let exit_jump = self.emit_iterate(gen_slot);

        self.expression();
        let skip_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op_u8(OpCode::GetLocal, gen_slot);
        self.emit_op_u8(OpCode::GetLocal, set_slot);
        self.emit_op_u8(OpCode::SetInsert, 1);
        self.emit_op(OpCode::Pop);

        self.patch_jump(skip_jump);
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);

        self.consume(TokenKind::RightBrace, "Expected '}' after set builder");
        self.finish_generator_expr(set_slot);
    }

    /// `∑(x ∈ S) E` / `∑(x ∈ S | P) E` — sum `E` over the generator.
    fn summation(&mut self, _can_assign: bool) {
        self.consume(TokenKind::LeftParen, "Expected '(' after summation");
        self.begin_scope();

        let acc_slot = {
            self.emit_constant(Value::Number(0.0));
            self.add_synthetic_local("@sum")
        };
        let gen_slot = self.parse_generator();

        let loop_start = self.current_offset();
        let exit_jump = self.emit_iterate(gen_slot);

        let skip_jump = if self.match_token(TokenKind::Pipe) {
            self.expression();
            Some(self.emit_jump(OpCode::JumpIfFalse))
        } else {
            None
        };
        self.consume(TokenKind::RightParen, "Expected ')' after summation generator");

        self.emit_op_u8(OpCode::GetLocal, acc_slot);
        // The summed term binds arithmetic but not comparisons, so
        // `∑(x ∈ S) x * x < y` reads as `(∑ x²) < y`.
        self.parse_precedence(Precedence::Term);
        self.emit_op(OpCode::Add);
        self.emit_op_u8(OpCode::SetLocal, acc_slot);
        self.emit_op(OpCode::Pop);

        if let Some(offset) = skip_jump {
            self.patch_jump(offset);
        }
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);

        self.finish_generator_expr(acc_slot);
    }

    /// Parse `x ∈ S`: a fresh local for the generator variable (pushed as
    /// null), the target expression, and the iterator built over it. The
    /// iterator stays on the stack as a synthetic local just above the
    /// generator variable.
    fn parse_generator(&mut self) -> u8 {
        let slot = self.current_frame().locals.len() as u8;

        self.consume(TokenKind::Identifier, "Expected identifier");
        self.declare_variable();
        self.emit_op(OpCode::Null);
        self.mark_initialized();

        self.consume(TokenKind::In, "Expected 'in' or '∈' after identifier");
        self.expression();
        self.emit_op(OpCode::CreateIterator);
        self.add_synthetic_local("@iter");

        slot
    }

    /// Record a local for a value an opcode just pushed.
    fn add_synthetic_local(&mut self, name: &'static str) -> u8 {
        let slot = self.current_frame().locals.len() as u8;
        self.add_local(name);
        self.mark_initialized();
        slot
    }

    fn emit_iterate(&mut self, gen_slot: u8) -> usize {
        self.emit_op_u8(OpCode::Iterate, gen_slot);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.current_offset() - 2
    }

    /// Retire a generator expression's loop temporaries. The result (the
    /// accumulator or set) sits lowest of the three, so popping the iterator
    /// and the generator variable leaves it on top; its local slot is
    /// dropped without a pop because the value stays as the expression
    /// result.
    fn finish_generator_expr(&mut self, _result_slot: u8) {
        self.emit_op(OpCode::Pop);
        self.emit_op(OpCode::Pop);

        let frame = self.current_frame_mut();
        let keep = frame.locals.len() - 3;
        frame.locals.truncate(keep);
        frame.scope_depth -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiles(source: &str) -> bool {
        let mut heap = Heap::new(false);
        compile(source, &mut heap).is_some()
    }

    #[test]
    fn test_simple_programs_compile() {
        assert!(compiles("let x := 1 + 2 * 3\n"));
        assert!(compiles("out 1 + 2\n"));
        assert!(compiles("let s := {1, 2, 3} \u{222A} {3, 4}\n"));
        assert!(compiles("let t := (1, 2, 3)\n"));
        assert!(compiles("let e := ()\n"));
        assert!(compiles("let one := (1,)\n"));
        assert!(compiles("let r := (1 \u{2026} 5)\n"));
        assert!(compiles("let r := {1, 3 \u{2026} 9}\n"));
        assert!(compiles("out \u{00AC}true\n"));
        assert!(compiles("out #{1, 2}\n"));
        assert!(compiles("out arb {1, 2}\n"));
    }

    #[test]
    fn test_functions_and_control_flow_compile() {
        assert!(compiles(
            "func add(a, b):\n    return a + b\nout add(1, 2)\n"
        ));
        assert!(compiles("if 1 < 2 then out 1 else out 2\n"));
        assert!(compiles(
            "let i := 0\nwhile i < 3 do\n    i := i + 1\n"
        ));
        assert!(compiles(
            "func make():\n    let c := 0\n    func inc():\n        c := c + 1\n        return c\n    return inc\n"
        ));
    }

    #[test]
    fn test_generator_expressions_compile() {
        assert!(compiles("let evens := {x \u{2208} {1 \u{2026} 10} | x % 2 == 0}\n"));
        assert!(compiles("out \u{2211}(x \u{2208} {1 \u{2026} 5}) x\n"));
        assert!(compiles("out Sum(x \u{2208} {1 \u{2026} 5} | x > 2) x * x\n"));
    }

    #[test]
    fn test_subscripts_compile() {
        assert!(compiles("let t := (1, 2, 3)\nout t[0]\n"));
        assert!(compiles("out \"abc\"[1 \u{2026} 2]\n"));
        assert!(compiles("out \"abc\"[\u{2026} 1]\n"));
        assert!(compiles("out \"abc\"[1 \u{2026}]\n"));
    }

    #[test]
    fn test_compile_errors() {
        // Assignment to a non-target.
        assert!(!compiles("1 + 2 := 3\n"));
        // Reading a local in its own initialiser.
        assert!(!compiles(
            "func f():\n    let a := 1\n    if true then\n        let a := a\n"
        ));
        // Duplicate local.
        assert!(!compiles(
            "func f():\n    let a := 1\n    let a := 2\n"
        ));
        // Unterminated string.
        assert!(!compiles("let s := \"oops\n"));
        // Invalid escape.
        assert!(!compiles("let s := \"\\q\"\n"));
        // Top-level return.
        assert!(!compiles("return 1\n"));
        // Missing operand.
        assert!(!compiles("out 1 +\n"));
    }

    #[test]
    fn test_script_function_shape() {
        let mut heap = Heap::new(false);
        let function = compile("let x := 2\nout x\n", &mut heap).expect("compile");
        let f = heap.as_function(function);
        assert_eq!(f.arity, 0);
        assert!(f.name.is_none());
        assert!(!f.chunk.code.is_empty());
        // Ends with an explicit null return.
        let code = &f.chunk.code;
        assert_eq!(code[code.len() - 3], OpCode::Null as u8);
        assert_eq!(code[code.len() - 2], OpCode::Return as u8);
        assert_eq!(code[code.len() - 1], 0);
    }

    #[test]
    fn test_closure_upvalue_emission() {
        let mut heap = Heap::new(false);
        let source = "\
func outer():
    let x := 1
    func inner():
        return x
    return inner
";
        let script = compile(source, &mut heap).expect("compile");
        // The script's only constant tree: outer's function, whose constants
        // include inner with one upvalue.
        let outer = heap.as_function(script).chunk.constants.iter().find_map(|c| {
            c.as_obj()
                .filter(|&r| heap.kind(r) == jmpl_core::ObjKind::Function)
        });
        let outer = outer.expect("outer function constant");
        let inner = heap
            .as_function(outer)
            .chunk
            .constants
            .iter()
            .find_map(|c| {
                c.as_obj()
                    .filter(|&r| heap.kind(r) == jmpl_core::ObjKind::Function)
            })
            .expect("inner function constant");
        assert_eq!(heap.as_function(inner).upvalue_count, 1);
    }
}
