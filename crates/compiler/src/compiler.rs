//! Single-pass bytecode compiler.
//!
//! Expressions are parsed with a Pratt table: every token kind maps to an
//! optional prefix parselet, an optional infix parselet, and a precedence.
//! `parse_precedence` drives the pair, which is enough to get assignment,
//! short-circuit operators, calls, and property access right without ever
//! building a tree.
//!
//! Each lexical function gets a [`FunctionCompiler`] frame holding the
//! function object under construction, its local slots, and its upvalue
//! descriptors; the frames form a chain (innermost last) that doubles as
//! a GC root, since compilation allocates strings and functions. Name
//! resolution walks the chain: local slot first, then captured upvalue,
//! else global by name.
//!
//! Errors put the parser into panic mode; tokens are skipped to the next
//! statement boundary and accumulation continues so one run reports as
//! much as it can.

use ember_core::chunk::{Chunk, OpCode};
use ember_core::heap::{Heap, Trace};
use ember_core::object::{Gc, ObjFunction, ObjString};
use ember_core::value::Value;

use crate::error::CompileError;
use crate::scanner::{Scanner, Token, TokenKind};

/// Local slots are addressed by one byte; slot 0 is reserved for the
/// enclosing function itself (or `this` inside methods).
const MAX_LOCALS: usize = 256;
/// Upvalue indices are one byte as well.
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while declared but not yet initialized (so the
    /// compiler can reject `var a = a;`).
    depth: i32,
    /// Set when an inner function captures this slot; scope exit then
    /// hoists it instead of popping.
    is_captured: bool,
}

/// Compile-time upvalue descriptor: which slot to capture, and whether it
/// is a local of the enclosing function or one of its own upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compiler state; the chain of these is a GC root.
struct FunctionCompiler<'src> {
    function: Gc<ObjFunction>,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl<'src> FunctionCompiler<'src> {
    fn new(function: Gc<ObjFunction>, kind: FunctionKind) -> Self {
        // Slot 0 belongs to the function object itself; inside methods it
        // is the receiver and resolvable as `this`.
        let slot_zero = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                _ => "",
            },
            depth: 0,
            is_captured: false,
        };
        FunctionCompiler {
            function,
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Per-class compiler state, for `this`/`super` validity checks.
struct ClassCompiler {
    has_superclass: bool,
}

/// Collector roots during compilation: the caller's roots (the VM's
/// resident state, in the REPL case) plus every in-progress function.
struct ChainRoots<'a, 'src> {
    base: &'a dyn Trace,
    compilers: &'a [FunctionCompiler<'src>],
}

impl Trace for ChainRoots<'_, '_> {
    fn trace(&self, heap: &mut Heap) {
        self.base.trace(heap);
        for compiler in self.compilers {
            heap.mark_object(compiler.function.as_obj());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    /// The next-tighter level, used for left-associative infix operators.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Parser<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

impl<'src, 'h> ParseRule<'src, 'h> {
    fn new(
        prefix: Option<ParseFn<'src, 'h>>,
        infix: Option<ParseFn<'src, 'h>>,
        precedence: Precedence,
    ) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    heap: &'h mut Heap,
    base_roots: &'h dyn Trace,
    compilers: Vec<FunctionCompiler<'src>>,
    class_compilers: Vec<ClassCompiler>,
    errors: Vec<CompileError>,
    panic_mode: bool,
}

/// Compile a program into its implicit top-level function (arity 0,
/// unnamed). `roots` is traced by any collection triggered mid-compile, on
/// top of the compiler's own chain of in-progress functions.
///
/// On failure every accumulated diagnostic is returned and nothing is
/// executed. The returned function is not yet rooted anywhere; callers
/// must root it before their next allocation.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    roots: &dyn Trace,
) -> Result<Gc<ObjFunction>, Vec<CompileError>> {
    let mut parser = Parser::new(source, heap, roots);
    parser.init_compiler(FunctionKind::Script);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _upvalues) = parser.end_compiler();
    if parser.errors.is_empty() {
        Ok(function)
    } else {
        Err(parser.errors)
    }
}

impl<'src, 'h> Parser<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap, base_roots: &'h dyn Trace) -> Self {
        Parser {
            scanner: Scanner::new(source),
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            heap,
            base_roots,
            compilers: Vec::new(),
            class_compilers: Vec::new(),
            errors: Vec::new(),
            panic_mode: false,
        }
    }

    // ---- heap access ------------------------------------------------------

    fn intern(&mut self, text: &str) -> Gc<ObjString> {
        let roots = ChainRoots {
            base: self.base_roots,
            compilers: &self.compilers,
        };
        self.heap.intern(text, &roots)
    }

    fn alloc_function(&mut self) -> Gc<ObjFunction> {
        let roots = ChainRoots {
            base: self.base_roots,
            compilers: &self.compilers,
        };
        self.heap.allocate(ObjFunction::new(), &roots)
    }

    // ---- compiler chain ---------------------------------------------------

    fn current(&self) -> &FunctionCompiler<'src> {
        self.compilers.last().expect("compiler chain is never empty")
    }

    fn current_mut(&mut self) -> &mut FunctionCompiler<'src> {
        self.compilers
            .last_mut()
            .expect("compiler chain is never empty")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_mut().function.chunk
    }

    fn init_compiler(&mut self, kind: FunctionKind) {
        let function = self.alloc_function();
        self.compilers.push(FunctionCompiler::new(function, kind));
        if kind != FunctionKind::Script {
            // Interned after the frame is pushed so the function is already
            // rooted if the intern triggers a collection.
            let lexeme = self.previous.lexeme;
            let name = self.intern(lexeme);
            self.current_mut().function.name = Some(name);
        }
    }

    fn end_compiler(&mut self) -> (Gc<ObjFunction>, Vec<Upvalue>) {
        self.emit_return();
        let compiler = self
            .compilers
            .pop()
            .expect("compiler chain is never empty");
        (compiler.function, compiler.upvalues)
    }

    // ---- token plumbing ---------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ---- error reporting --------------------------------------------------

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // One diagnostic per panic; synchronize() clears the flag at the
        // next statement boundary.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(CompileError {
            line: token.line,
            location,
            message: message.to_string(),
        });
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

    // ---- bytecode emission ------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        // Initializers implicitly return the receiver in slot 0.
        if self.current().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    /// Emit a forward jump with a placeholder offset; returns the offset's
    /// position for [`Self::patch_jump`].
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to step over the offset bytes themselves.
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        // +2 to step over the offset bytes about to be emitted.
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // ---- scopes and variables ---------------------------------------------

    fn begin_scope(&mut self) {
        self.current_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_mut().scope_depth -= 1;
        loop {
            let op = {
                let compiler = self.current();
                match compiler.locals.last() {
                    Some(local) if local.depth > compiler.scope_depth => {
                        if local.is_captured {
                            OpCode::CloseUpvalue
                        } else {
                            OpCode::Pop
                        }
                    }
                    _ => break,
                }
            };
            self.emit_op(op);
            self.current_mut().locals.pop();
        }
    }

    fn identifier_constant(&mut self, name: Token<'src>) -> u8 {
        let string = self.intern(name.lexeme);
        self.make_constant(Value::from(string))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.current().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let mut duplicate = false;
        {
            let compiler = self.current();
            for local in compiler.locals.iter().rev() {
                if local.depth != -1 && local.depth < compiler.scope_depth {
                    break;
                }
                if local.name == name.lexeme {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name.lexeme);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current().scope_depth > 0 {
            return 0;
        }
        let name = self.previous;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        let depth = self.current().scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.current_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, compiler: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (i, local) in self.compilers[compiler].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i, local.depth == -1));
                break;
            }
        }
        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    /// Resolve `name` as a captured variable of `compiler`, recursing
    /// outward through the enclosing frames. Capturing marks the source
    /// local so its scope exit hoists it instead of popping.
    fn resolve_upvalue(&mut self, compiler: usize, name: &str) -> Option<u8> {
        if compiler == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(compiler - 1, name) {
            self.compilers[compiler - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(compiler, local, true);
        }
        if let Some(upvalue) = self.resolve_upvalue(compiler - 1, name) {
            return self.add_upvalue(compiler, upvalue, false);
        }
        None
    }

    fn add_upvalue(&mut self, compiler: usize, index: u8, is_local: bool) -> Option<u8> {
        let descriptor = Upvalue { index, is_local };
        if let Some(existing) = self.compilers[compiler]
            .upvalues
            .iter()
            .position(|upvalue| *upvalue == descriptor)
        {
            return Some(existing as u8);
        }
        if self.compilers[compiler].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return Some(0);
        }
        let frame = &mut self.compilers[compiler];
        frame.upvalues.push(descriptor);
        frame.function.upvalue_count = frame.upvalues.len();
        Some((frame.upvalues.len() - 1) as u8)
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let top = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(top, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // ---- Pratt machinery --------------------------------------------------

    fn rule(kind: TokenKind) -> ParseRule<'src, 'h> {
        match kind {
            TokenKind::LeftParen => {
                ParseRule::new(Some(Self::grouping), Some(Self::call), Precedence::Call)
            }
            TokenKind::Dot => ParseRule::new(None, Some(Self::dot), Precedence::Call),
            TokenKind::Minus => ParseRule::new(Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => ParseRule::new(None, Some(Self::binary), Precedence::Term),
            TokenKind::Slash | TokenKind::Star => {
                ParseRule::new(None, Some(Self::binary), Precedence::Factor)
            }
            TokenKind::Bang => ParseRule::new(Some(Self::unary), None, Precedence::None),
            TokenKind::BangEqual | TokenKind::EqualEqual => {
                ParseRule::new(None, Some(Self::binary), Precedence::Equality)
            }
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => ParseRule::new(None, Some(Self::binary), Precedence::Comparison),
            TokenKind::Identifier => ParseRule::new(Some(Self::variable), None, Precedence::None),
            TokenKind::String => ParseRule::new(Some(Self::string), None, Precedence::None),
            TokenKind::Number => ParseRule::new(Some(Self::number), None, Precedence::None),
            TokenKind::And => ParseRule::new(None, Some(Self::and_expr), Precedence::And),
            TokenKind::Or => ParseRule::new(None, Some(Self::or_expr), Precedence::Or),
            TokenKind::False | TokenKind::True | TokenKind::Nil => {
                ParseRule::new(Some(Self::literal), None, Precedence::None)
            }
            TokenKind::Super => ParseRule::new(Some(Self::super_expr), None, Precedence::None),
            TokenKind::This => ParseRule::new(Some(Self::this_expr), None, Precedence::None),
            _ => ParseRule::new(None, None, Precedence::None),
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        // Assignment binds loosest; only a target parsed at assignment
        // precedence may consume a following `=`.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            let Some(infix) = Self::rule(self.previous.kind).infix else {
                break;
            };
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // ---- expression parselets ---------------------------------------------

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary parselet on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = Self::rule(operator).precedence;
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Star => self.emit_op(OpCode::Mult),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            _ => unreachable!("binary parselet on non-binary token"),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        // The scanner only hands over well-formed decimal literals.
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1]; // strip the quotes
        let string = self.intern(contents);
        self.emit_constant(Value::from(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal parselet on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn and_expr(&mut self, _can_assign: bool) {
        // Left operand is on the stack; skip the right operand when it is
        // falsey, leaving the left value as the result.
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_token = self.previous;
        let name = self.identifier_constant(name_token);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            // Fuse property access + call into a single Invoke.
            let argc = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.class_compilers.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expr(&mut self, _can_assign: bool) {
        match self.class_compilers.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_token = self.previous;
        let name = self.identifier_constant(name_token);

        self.named_variable(Token::synthetic("this"), false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    // ---- declarations and statements --------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::LeftBrace) {
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

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is initialized the moment its
        // name is bound.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.init_compiler(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current_mut().function.arity += 1;
                if self.current().function.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the frame's locals die with the call frame.
        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::from(function));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.class_compilers.push(ClassCompiler {
            has_superclass: false,
        });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // A synthetic scope holds the superclass in a local named
            // `super`, which method closures capture as an upvalue.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.class_compilers.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let had_superclass = self
            .class_compilers
            .last()
            .is_some_and(|class| class.has_superclass);
        if had_superclass {
            self.end_scope();
        }
        self.class_compilers.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_token = self.previous;
        let constant = self.identifier_constant(name_token);
        let kind = if name_token.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op_byte(OpCode::Method, constant);
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
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
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

    /// `for` desugars to the `while` primitives inside a fresh scope:
    /// initializer, condition jump, body, then the increment spliced in
    /// between body and condition via a second loop edge.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
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
        if self.current().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::heap::NoRoots;

    fn compile_errors(source: &str) -> Vec<String> {
        let mut heap = Heap::new();
        match compile(source, &mut heap, &NoRoots) {
            Ok(_) => Vec::new(),
            Err(errors) => errors.into_iter().map(|e| e.message).collect(),
        }
    }

    fn assert_compiles(source: &str) {
        let mut heap = Heap::new();
        compile(source, &mut heap, &NoRoots).expect("program should compile");
    }

    #[test]
    fn test_simple_expression_bytecode() {
        let mut heap = Heap::new();
        let function = compile("1 + 2;", &mut heap, &NoRoots).expect("compiles");
        assert_eq!(
            function.chunk.code,
            vec![
                OpCode::Constant as u8,
                0,
                OpCode::Constant as u8,
                1,
                OpCode::Add as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
        assert_eq!(function.chunk.constants.len(), 2);
        assert_eq!(function.arity, 0);
        assert!(function.name.is_none());
    }

    #[test]
    fn test_statement_forms_compile() {
        assert_compiles("var a = 1; if (a < 2) { print a; } else { print 0; }");
        assert_compiles("var i = 0; while (i < 3) { i = i + 1; }");
        assert_compiles("for (var i = 0; i < 3; i = i + 1) { print i; }");
        assert_compiles("var n = 0; for (;;) { n = n + 1; if (n > 2) { n = 0; } }");
    }

    #[test]
    fn test_functions_and_closures_compile() {
        assert_compiles(
            "fun outer() { var x = 1; fun inner() { x = x + 1; return x; } return inner; }",
        );
        assert_compiles("fun f(a, b, c) { return a + b * c; } print f(1, 2, 3);");
    }

    #[test]
    fn test_classes_compile() {
        assert_compiles(
            "class A { init(n) { this.n = n; } get() { return this.n; } }\
             class B < A { get() { return super.get() + 1; } }\
             print B(1).get();",
        );
    }

    #[test]
    fn test_expect_expression() {
        assert_eq!(compile_errors("+;"), vec!["Expect expression."]);
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert_eq!(compile_errors("1 + 2 = 3;"), vec!["Invalid assignment target."]);
    }

    #[test]
    fn test_duplicate_local() {
        assert_eq!(
            compile_errors("{ var a = 1; var a = 2; }"),
            vec!["Already a variable with this name in this scope."]
        );
    }

    #[test]
    fn test_shadowing_across_scopes_is_allowed() {
        assert_compiles("{ var a = 1; { var a = 2; print a; } print a; }");
    }

    #[test]
    fn test_read_in_own_initializer() {
        assert_eq!(
            compile_errors("{ var a = 1; { var a = a; } }"),
            vec!["Can't read local variable in its own initializer."]
        );
    }

    #[test]
    fn test_return_at_top_level() {
        assert_eq!(
            compile_errors("return 1;"),
            vec!["Can't return from top-level code."]
        );
    }

    #[test]
    fn test_return_value_from_initializer() {
        assert_eq!(
            compile_errors("class A { init() { return 1; } }"),
            vec!["Can't return a value from an initializer."]
        );
        assert_compiles("class A { init() { return; } }");
    }

    #[test]
    fn test_this_outside_class() {
        assert_eq!(
            compile_errors("print this;"),
            vec!["Can't use 'this' outside of a class."]
        );
    }

    #[test]
    fn test_super_misuse() {
        assert_eq!(
            compile_errors("fun f() { super.x(); }"),
            vec!["Can't use 'super' outside of a class."]
        );
        assert_eq!(
            compile_errors("class A { m() { super.m(); } }"),
            vec!["Can't use 'super' in a class with no superclass."]
        );
    }

    #[test]
    fn test_class_cannot_inherit_itself() {
        assert_eq!(
            compile_errors("class A < A {}"),
            vec!["A class can't inherit from itself."]
        );
    }

    #[test]
    fn test_panic_mode_recovers_and_accumulates() {
        let errors = compile_errors("var = 1; print this;");
        assert_eq!(
            errors,
            vec![
                "Expect variable name.",
                "Can't use 'this' outside of a class."
            ]
        );
    }

    #[test]
    fn test_too_many_constants() {
        let body: String = (0..300).map(|i| format!("print {i};")).collect();
        let errors = compile_errors(&body);
        assert!(errors.contains(&"Too many constants in one chunk.".to_string()));
    }

    #[test]
    fn test_local_slot_limit() {
        // Slot 0 is reserved, so 255 locals fit and the 256th errors.
        let make = |n: usize| {
            let vars: String = (0..n).map(|i| format!("var l{i} = 0;")).collect();
            format!("fun f() {{ {vars} }}")
        };
        assert_compiles(&make(255));
        let errors = compile_errors(&make(256));
        assert!(errors.contains(&"Too many local variables in function.".to_string()));
    }

    #[test]
    fn test_argument_limit() {
        let make = |n: usize| {
            let args = vec!["a"; n].join(", ");
            format!("fun f() {{ var a = 0; g({args}); }}")
        };
        assert_compiles(&make(255));
        let errors = compile_errors(&make(256));
        assert!(errors.contains(&"Can't have more than 255 arguments.".to_string()));
    }

    #[test]
    fn test_parameter_limit() {
        let make = |n: usize| {
            let params: Vec<String> = (0..n).map(|i| format!("p{i}")).collect();
            format!("fun f({}) {{ }}", params.join(", "))
        };
        assert_compiles(&make(255));
        let errors = compile_errors(&make(256));
        assert!(errors.contains(&"Can't have more than 255 parameters.".to_string()));
    }

    #[test]
    fn test_jump_offset_overflow() {
        // A then-branch bigger than a 16-bit offset cannot be compiled.
        // `true;` emits two bytes and touches no constants.
        let body = "true;".repeat(40_000);
        let errors = compile_errors(&format!("if (true) {{ {body} }}"));
        assert!(errors.contains(&"Too much code to jump over.".to_string()));
    }

    #[test]
    fn test_compiles_under_gc_stress() {
        let mut heap = Heap::with_stress(true);
        let function = compile(
            "fun add(a, b) { return a + b; } print add(1, 2); class C { m() { return \"s\"; } }",
            &mut heap,
            &NoRoots,
        )
        .expect("compiles with a collection at every allocation");
        assert!(function.chunk.code.len() > 0);
    }
}
