//! The single-pass Pratt parser.
//!
//! Expressions compile into a destination register chosen by the
//! caller; subexpressions evaluate into freshly pushed temporaries
//! released in LIFO order. Control flow compiles to explicit jumps
//! patched after the fact; `break` emits the invalid-instruction
//! sentinel that the enclosing loop rewrites when it closes.
//!
//! On an unexpected token the parser reports the diagnostic, skips to
//! the next `;` (or the end of the program), and keeps going, so one
//! compile can surface several errors.

use crate::builder::{FunctionBuilder, INVALID_SLOT};
use crate::host::CompileHost;
use crate::lexer::{Lexer, Token, TokenKind};
use bytecode_system::{Instruction, OpCode};
use core_types::{ErrorKind, Value};

const LOAD_BASIC_TRUE: u32 = 0;
const LOAD_BASIC_FALSE: u32 = 1;
const LOAD_BASIC_NIL: u32 = 2;
const LOAD_BASIC_MODULE: u32 = 3;
const LOAD_BASIC_CONSTANT: u32 = 4;

/// Operator precedence, low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assign,
    Or,
    And,
    Equality,
    #[allow(dead_code)]
    Ternary,
    Comparison,
    Term,
    Factor,
    Unary,
    #[allow(dead_code)]
    Prefix,
    #[allow(dead_code)]
    Postfix,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarKind {
    Local,
    Module,
}

/// Where a name resolved to: a frame register or a module symbol.
#[derive(Debug, Clone, Copy)]
struct VarInfo {
    kind: VarKind,
    location: u16,
}

impl VarInfo {
    fn temp(location: u16) -> VarInfo {
        VarInfo {
            kind: VarKind::Local,
            location,
        }
    }

    fn invalid() -> VarInfo {
        VarInfo::temp(INVALID_SLOT)
    }

    fn is_valid(self) -> bool {
        self.location != INVALID_SLOT
    }
}

/// An expression in flight: the register it writes to, the variable
/// it denotes when it is an lvalue, and - for `super` expressions -
/// the register a method call through it must pass as the receiver.
#[derive(Debug, Clone, Copy)]
struct ExprInfo {
    write_loc: u16,
    var: VarInfo,
    receiver: Option<u16>,
}

impl ExprInfo {
    fn temp_at(write_loc: u16) -> ExprInfo {
        ExprInfo {
            write_loc,
            var: VarInfo::invalid(),
            receiver: None,
        }
    }
}

type PrefixFn<'a, 'h, H> = fn(&mut Parser<'a, 'h, H>, &mut ExprInfo, &Token<'a>);
type InfixFn<'a, 'h, H> = fn(&mut Parser<'a, 'h, H>, &mut ExprInfo, &ExprInfo, &Token<'a>, Prec);

struct Rule<'a, 'h, H: CompileHost> {
    prefix: Option<PrefixFn<'a, 'h, H>>,
    infix: Option<InfixFn<'a, 'h, H>>,
    prec: Prec,
}

/// Compiles `source` into `module`: module-level declarations take
/// effect immediately, and the remaining statements become the
/// module's top-level function. Returns `Err(())` when any compile
/// error was reported through the host.
pub fn compile_module<H: CompileHost>(host: &mut H, module: Value, source: &str) -> Result<(), ()> {
    let module_name = host.module_name(module);
    let mut lexer = Lexer::new(source);
    let current = lexer.next_token();

    let mut parser = Parser {
        host,
        lexer,
        current,
        module,
        current_class: None,
        builders: Vec::new(),
        root_watermarks: Vec::new(),
        loop_stack: Vec::new(),
        has_error: false,
    };

    parser.drain_lexer_diagnostics();
    parser.push_builder(module_name);

    while parser.parse_statement() {}

    let init_fn = parser.finish_function(0);
    parser.host.module_set_init(module, init_fn);
    parser.host.gc_unpin();

    if parser.has_error {
        Err(())
    } else {
        Ok(())
    }
}

struct Parser<'a, 'h, H: CompileHost> {
    host: &'h mut H,
    lexer: Lexer<'a>,
    current: Token<'a>,
    module: Value,
    current_class: Option<Value>,
    builders: Vec<FunctionBuilder<'a>>,
    root_watermarks: Vec<usize>,
    loop_stack: Vec<usize>,
    has_error: bool,
}

impl<'a, 'h, H: CompileHost> Parser<'a, 'h, H> {
    /* Token plumbing */

    fn advance(&mut self) {
        self.current = self.lexer.next_token();
        self.drain_lexer_diagnostics();
        if let Some(builder) = self.builders.last_mut() {
            builder.set_line(self.current.line);
        }
    }

    fn drain_lexer_diagnostics(&mut self) {
        for diagnostic in self.lexer.take_diagnostics() {
            let line = diagnostic.line.unwrap_or(0);
            self.host
                .report_error(ErrorKind::Lexer, line, &diagnostic.message);
        }
    }

    fn error(&mut self, message: &str) {
        let line = self.current.line;
        self.host.report_error(ErrorKind::Compile, line, message);
        self.has_error = true;
    }

    /// Exact-kind check (end of program does not count).
    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    /// Loose check: true for `kind` or for end of program, so loops
    /// waiting on a closer always terminate.
    fn is(&self, kind: TokenKind) -> bool {
        self.current.kind == kind || self.current.kind == TokenKind::Eop
    }

    /// Consumes the token when it matches; silent otherwise.
    fn eat_opt(&mut self, kind: TokenKind) -> bool {
        if self.current.kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consumes the token when it matches; reports `message` and
    /// resynchronizes at the next `;` otherwise.
    fn eat(&mut self, kind: TokenKind, message: &str) -> bool {
        if self.current.kind == kind {
            self.advance();
            return true;
        }

        self.error(message);
        while !matches!(self.current.kind, TokenKind::Semicolon | TokenKind::Eop) {
            self.advance();
        }
        false
    }

    /* Builder plumbing */

    fn builder(&self) -> &FunctionBuilder<'a> {
        self.builders.last().expect("no active function builder")
    }

    fn builder_mut(&mut self) -> &mut FunctionBuilder<'a> {
        self.builders.last_mut().expect("no active function builder")
    }

    fn push_builder(&mut self, name: impl Into<String>) {
        self.root_watermarks.push(self.host.compile_roots_len());
        let mut builder = FunctionBuilder::new(name);
        builder.set_line(self.current.line);
        self.builders.push(builder);
    }

    /// Closes the innermost builder into a pinned function object.
    /// The caller links it somewhere reachable and then calls
    /// `gc_unpin`.
    fn finish_function(&mut self, arity: i32) -> Value {
        let shell = self.host.alloc_function(self.module);
        self.host.gc_pin(shell);

        let watermark = self.root_watermarks.pop().expect("builder underflow");
        let proto = self.builders.pop().expect("builder underflow").end(arity);
        self.host.compile_roots_truncate(watermark);
        self.host.fill_function(shell, proto);
        shell
    }

    fn emit_abc(&mut self, op: OpCode, a: u16, b: u16, c: u16) {
        self.builder_mut().emit_abc(op, a, b, c);
    }

    fn emit_abx(&mut self, op: OpCode, a: u16, bx: u32) {
        self.builder_mut().emit_abx(op, a, bx);
    }

    fn push_temp(&mut self, count: u16) -> u16 {
        self.builder_mut().push_temp(count)
    }

    fn pop_temp(&mut self, start: u16) {
        self.builder_mut().pop_temp(start);
    }

    /// Adds a constant, pinning a newly appended object value on the
    /// compile-root list so it survives collections until the pool is
    /// transferred into its function object.
    fn add_constant(&mut self, value: Value) -> u32 {
        let (index, appended) = self.builder_mut().add_constant(value);
        if appended && value.is_object() {
            self.host.compile_root_push(value);
        }
        index
    }

    fn load_constant(&mut self, write_loc: u16, value: Value) {
        let index = self.add_constant(value);
        self.emit_abx(OpCode::LoadBasic, write_loc, LOAD_BASIC_CONSTANT + index);
    }

    /* Jump helpers */

    /// Emits a placeholder jump and returns its index for patching.
    fn make_jump(&mut self) -> usize {
        let index = self.builder().code_len();
        self.builder_mut().emit_asbx(OpCode::Jump, 0, 0);
        index
    }

    /// The current ip, recorded as the target of a later backward
    /// jump.
    fn mark_jump_target(&self) -> usize {
        self.builder().code_len()
    }

    /// Rewrites the placeholder at `jump_idx` to jump to the current
    /// ip, conditionally on `cond` when given.
    fn patch_jump(&mut self, jump_idx: usize, cond: Option<u16>, if_not: bool) {
        let amount = self.builder().code_len() as i32 - jump_idx as i32;
        let inst = match cond {
            None => Instruction::asbx(OpCode::Jump, 0, amount),
            Some(slot) => {
                let op = if if_not { OpCode::JumpIfNot } else { OpCode::JumpIf };
                Instruction::asbx(op, slot, amount)
            }
        };
        self.builder_mut().patch(jump_idx, inst);
    }

    /// Emits an unconditional jump back to a recorded earlier ip.
    fn emit_jump_back(&mut self, target: usize) {
        let amount = target as i32 - self.builder().code_len() as i32;
        self.builder_mut().emit_asbx(OpCode::Jump, 0, amount);
    }

    /* Loops */

    fn loop_push(&mut self) {
        self.loop_stack.push(self.builder().code_len());
    }

    /// Closes a loop: every break sentinel in the body becomes a
    /// forward jump past the loop.
    fn loop_pop(&mut self) {
        let start = self.loop_stack.pop().expect("loop stack underflow");
        let end = self.builder().code_len();
        for i in start..end {
            if self.builder().instruction(i).is_invalid() {
                let inst = Instruction::asbx(OpCode::Jump, 0, (end - i) as i32);
                self.builder_mut().patch(i, inst);
            }
        }
    }

    /* Variables */

    fn local_or_module(&mut self, name: &str) -> VarInfo {
        match self.builder().get_variable(name) {
            Some(slot) => VarInfo {
                kind: VarKind::Local,
                location: slot,
            },
            None => VarInfo {
                kind: VarKind::Module,
                location: self.host.intern_symbol(name).0 as u16,
            },
        }
    }

    fn variable_load(&mut self, var: VarInfo, write_loc: u16) {
        debug_assert!(var.is_valid());
        match var.kind {
            VarKind::Local => {
                if write_loc != var.location {
                    self.emit_abx(OpCode::StoreMove, write_loc, u32::from(var.location));
                }
            }
            VarKind::Module => {
                let module_loc = self.push_temp(1);
                self.emit_abx(OpCode::LoadBasic, module_loc, LOAD_BASIC_MODULE);
                self.emit_abc(OpCode::LoadSymbol, write_loc, module_loc, var.location);
                self.pop_temp(module_loc);
            }
        }
    }

    fn variable_store(&mut self, var: VarInfo, read_loc: u16) {
        debug_assert!(var.is_valid());
        match var.kind {
            VarKind::Local => {
                self.emit_abx(OpCode::StoreMove, var.location, u32::from(read_loc));
            }
            VarKind::Module => {
                let module_loc = self.push_temp(1);
                self.emit_abx(OpCode::LoadBasic, module_loc, LOAD_BASIC_MODULE);
                self.emit_abc(OpCode::StoreSymbol, module_loc, var.location, read_loc);
                self.pop_temp(module_loc);
            }
        }
    }

    /* Expressions */

    fn rule(kind: TokenKind) -> Rule<'a, 'h, H> {
        use TokenKind::*;

        let (prefix, infix, prec): (
            Option<PrefixFn<'a, 'h, H>>,
            Option<InfixFn<'a, 'h, H>>,
            Prec,
        ) = match kind {
            LParen => (Some(Self::expr_group), Some(Self::expr_call), Prec::Call),
            LBracket => (None, Some(Self::expr_subscript), Prec::Call),
            Dot => (None, Some(Self::expr_dot), Prec::Call),
            Eq | PlusEq | MinusEq => (None, Some(Self::expr_assign), Prec::Assign),
            Plus => (None, Some(Self::expr_binop), Prec::Term),
            Minus => (Some(Self::expr_unary), Some(Self::expr_binop), Prec::Term),
            Star | Slash | Percent | Caret => (None, Some(Self::expr_binop), Prec::Factor),
            EqEq | NotEq => (None, Some(Self::expr_binop), Prec::Equality),
            Lt | LtEq | Gt | GtEq => (None, Some(Self::expr_binop), Prec::Comparison),
            AndAnd => (None, Some(Self::expr_binop), Prec::And),
            OrOr => (None, Some(Self::expr_binop), Prec::Or),
            Bang => (Some(Self::expr_unary), None, Prec::None),
            Identifier => (Some(Self::expr_variable), None, Prec::None),
            Number | Str | True | False | Nil => (Some(Self::expr_literal), None, Prec::None),
            Func => (Some(Self::expr_function), None, Prec::None),
            New => (Some(Self::expr_new), None, Prec::None),
            Super => (Some(Self::expr_super), None, Prec::None),
            _ => (None, None, Prec::None),
        };

        Rule { prefix, infix, prec }
    }

    fn parse_expr(&mut self, expr: &mut ExprInfo, min_prec: Prec) {
        let token = self.current;
        let rule = Self::rule(token.kind);

        let Some(prefix) = rule.prefix else {
            self.error("Expected an expression.");
            return;
        };

        self.advance();
        prefix(self, expr, &token);

        loop {
            let rule = Self::rule(self.current.kind);
            if min_prec >= rule.prec {
                break;
            }

            let token = self.current;
            let Some(infix) = rule.infix else {
                self.error("Token cannot be used as an infix operator.");
                return;
            };

            self.advance();
            let lhs = *expr;
            infix(self, expr, &lhs, &token, rule.prec);
        }
    }

    fn expr_group(&mut self, expr: &mut ExprInfo, _token: &Token<'a>) {
        self.parse_expr(expr, Prec::None);
        self.eat(TokenKind::RParen, "Expected ')' to close the grouping.");
    }

    fn expr_literal(&mut self, expr: &mut ExprInfo, token: &Token<'a>) {
        match token.kind {
            TokenKind::True => self.emit_abx(OpCode::LoadBasic, expr.write_loc, LOAD_BASIC_TRUE),
            TokenKind::False => self.emit_abx(OpCode::LoadBasic, expr.write_loc, LOAD_BASIC_FALSE),
            TokenKind::Nil => self.emit_abx(OpCode::LoadBasic, expr.write_loc, LOAD_BASIC_NIL),
            TokenKind::Number => {
                let value = Value::from_number(token.num);
                self.load_constant(expr.write_loc, value);
            }
            TokenKind::Str => {
                let value = self.host.alloc_string(token.text);
                self.load_constant(expr.write_loc, value);
            }
            _ => unreachable!("literal rule bound to a non-literal token"),
        }
    }

    fn expr_variable(&mut self, expr: &mut ExprInfo, token: &Token<'a>) {
        let var = self.local_or_module(token.text);
        self.variable_load(var, expr.write_loc);
        *expr = ExprInfo {
            write_loc: expr.write_loc,
            var,
            receiver: None,
        };
    }

    fn expr_unary(&mut self, expr: &mut ExprInfo, token: &Token<'a>) {
        let operand = self.push_temp(1);
        let mut sub = ExprInfo::temp_at(operand);
        self.parse_expr(&mut sub, Prec::Unary);

        match token.kind {
            TokenKind::Minus => self.emit_abx(OpCode::MathInv, expr.write_loc, u32::from(operand)),
            TokenKind::Bang => self.emit_abx(OpCode::Not, expr.write_loc, u32::from(operand)),
            _ => unreachable!("unary rule bound to a non-unary token"),
        }
        self.pop_temp(operand);
    }

    fn expr_function(&mut self, expr: &mut ExprInfo, _token: &Token<'a>) {
        self.begin_function(false);
        let arity = self.parse_function_body();
        let func = self.finish_function(arity);
        self.load_constant(expr.write_loc, func);
        self.host.gc_unpin();
    }

    fn expr_new(&mut self, expr: &mut ExprInfo, _token: &Token<'a>) {
        let class_name = self.current.text;
        if !self.eat(TokenKind::Identifier, "'new' must name a class.") {
            return;
        }

        let class_var = self.local_or_module(class_name);
        let class_loc = self.push_temp(1);
        self.variable_load(class_var, class_loc);
        self.emit_abx(OpCode::NewClass, expr.write_loc, u32::from(class_loc));

        let mut ctor_name: &'a str = "ctor";
        let mut explicit_ctor = false;
        if self.eat_opt(TokenKind::Dot) {
            if self.check(TokenKind::Identifier) {
                ctor_name = self.current.text;
                explicit_ctor = true;
            }
            self.eat(TokenKind::Identifier, "Expected a constructor name after '.'.");
        }

        if self.eat_opt(TokenKind::LParen) {
            if self.check(TokenKind::RParen) && !explicit_ctor {
                // `new C()` with no arguments and no named constructor
                // is plain instantiation; classes without a ctor stay
                // constructible.
                self.advance();
            } else {
                let ctor_sym = self.host.intern_symbol(ctor_name).0 as u16;
                self.emit_abc(OpCode::LoadSymbol, class_loc, class_loc, ctor_sym);

                let arg_first = self.push_temp(1);
                self.emit_abx(OpCode::StoreMove, arg_first, u32::from(expr.write_loc));
                let num_args = self.parse_call_args(arg_first, 1, TokenKind::RParen);
                self.eat(
                    TokenKind::RParen,
                    "Constructor call must end with a closing parenthesis.",
                );
                self.emit_abc(OpCode::CallFn, arg_first, class_loc, num_args);
                self.pop_temp(arg_first);
            }
        }

        self.pop_temp(class_loc);
    }

    fn expr_super(&mut self, expr: &mut ExprInfo, _token: &Token<'a>) {
        let Some(class) = self.current_class else {
            self.error("'super' can only be used inside class methods.");
            return;
        };
        let Some(base) = self.host.class_base(class) else {
            self.error("'super' requires the class to have a base class.");
            return;
        };
        self.load_constant(expr.write_loc, base);

        // The base class is only the lookup root; the receiver of a
        // `super.m()` call is the enclosing method's self.
        if let Some(self_slot) = self.builder().get_variable("self") {
            expr.receiver = Some(self_slot);
        }
    }

    fn expr_binop(
        &mut self,
        expr: &mut ExprInfo,
        lhs: &ExprInfo,
        token: &Token<'a>,
        prec: Prec,
    ) {
        let op = match token.kind {
            TokenKind::Plus => OpCode::MathAdd,
            TokenKind::Minus => OpCode::MathSub,
            TokenKind::Star => OpCode::MathMul,
            TokenKind::Slash => OpCode::MathDiv,
            TokenKind::Percent => OpCode::MathMod,
            TokenKind::Caret => OpCode::MathPow,
            TokenKind::EqEq => OpCode::CmpEe,
            TokenKind::NotEq => OpCode::CmpNe,
            TokenKind::Lt => OpCode::CmpLt,
            TokenKind::LtEq => OpCode::CmpLe,
            TokenKind::Gt => OpCode::CmpGt,
            TokenKind::GtEq => OpCode::CmpGe,
            TokenKind::AndAnd => OpCode::CmpAnd,
            TokenKind::OrOr => OpCode::CmpOr,
            _ => {
                self.error("Invalid binary operator.");
                return;
            }
        };

        let rhs_loc = self.push_temp(1);

        // && and || skip the right operand when the left side already
        // decides the result; the destination still holds the left
        // value, which is truthiness-correct.
        let short_circuit = matches!(token.kind, TokenKind::AndAnd | TokenKind::OrOr)
            .then(|| self.make_jump());

        let mut rhs = ExprInfo::temp_at(rhs_loc);
        self.parse_expr(&mut rhs, prec);

        self.emit_abc(op, expr.write_loc, lhs.write_loc, rhs_loc);

        if let Some(jump) = short_circuit {
            self.patch_jump(jump, Some(expr.write_loc), token.kind == TokenKind::AndAnd);
        }

        self.pop_temp(rhs_loc);
    }

    fn expr_dot(&mut self, expr: &mut ExprInfo, lhs: &ExprInfo, _token: &Token<'a>, _prec: Prec) {
        if !self.check(TokenKind::Identifier) {
            self.error("Expected a field or method name after '.'.");
            return;
        }
        let field = self.current.text;
        self.advance();
        let sym = self.host.intern_symbol(field).0 as u16;

        if self.eat_opt(TokenKind::LParen) {
            // Method call: the object the expression denotes becomes
            // the implicit first argument. A `super` owner overrides
            // the receiver register (the method's self) while the
            // lookup still goes through the base class in write_loc.
            let recv_src = lhs.receiver.unwrap_or(lhs.write_loc);

            let fn_loc = self.push_temp(2);
            let recv_loc = fn_loc + 1;
            self.emit_abc(OpCode::LoadSymbol, fn_loc, lhs.write_loc, sym);
            self.emit_abx(OpCode::StoreMove, recv_loc, u32::from(recv_src));

            let num_args = self.parse_call_args(recv_loc, 1, TokenKind::RParen);
            self.eat(
                TokenKind::RParen,
                "Method call must end with a closing parenthesis.",
            );
            self.emit_abc(OpCode::CallFn, recv_loc, fn_loc, num_args);
            if expr.write_loc != recv_loc {
                self.emit_abx(OpCode::StoreMove, expr.write_loc, u32::from(recv_loc));
            }
            self.pop_temp(fn_loc);
            *expr = ExprInfo {
                write_loc: expr.write_loc,
                var: VarInfo::temp(expr.write_loc),
                receiver: None,
            };
        } else if self.eat_opt(TokenKind::Eq) {
            let rhs_loc = self.push_temp(1);
            let mut rhs = ExprInfo::temp_at(rhs_loc);
            self.parse_expr(&mut rhs, Prec::Assign);
            self.emit_abc(OpCode::StoreSymbol, lhs.write_loc, sym, rhs_loc);
            self.pop_temp(rhs_loc);
        } else {
            self.emit_abc(OpCode::LoadSymbol, expr.write_loc, lhs.write_loc, sym);
            *expr = ExprInfo {
                write_loc: expr.write_loc,
                var: VarInfo::temp(expr.write_loc),
                receiver: None,
            };
        }
    }

    fn expr_subscript(
        &mut self,
        expr: &mut ExprInfo,
        lhs: &ExprInfo,
        _token: &Token<'a>,
        _prec: Prec,
    ) {
        let op_loc = self.push_temp(3);
        let self_loc = op_loc + 1;
        let arg_first = op_loc + 2;

        let index_sym = self.host.intern_symbol("[]").0 as u16;

        self.emit_abx(OpCode::StoreMove, self_loc, u32::from(lhs.write_loc));
        let load_idx = self.builder().code_len();
        self.emit_abc(OpCode::LoadSymbol, op_loc, self_loc, index_sym);
        self.emit_abx(OpCode::StoreMove, arg_first, u32::from(self_loc));

        let mut num_args = self.parse_call_args(arg_first, 1, TokenKind::RBracket);
        self.eat(
            TokenKind::RBracket,
            "Subscript must end with a closing square bracket.",
        );

        if self.eat_opt(TokenKind::Eq) {
            // Retarget the operator lookup at `[]=` and pass the value
            // as the extra argument.
            let store_sym = self.host.intern_symbol("[]=").0 as u16;
            self.builder_mut()
                .patch(load_idx, Instruction::abc(OpCode::LoadSymbol, op_loc, self_loc, store_sym));

            let value_loc = self.push_temp(1);
            let mut value = ExprInfo::temp_at(value_loc);
            self.parse_expr(&mut value, Prec::None);
            num_args += 1;
        }

        self.emit_abc(OpCode::CallFn, arg_first, op_loc, num_args);
        if expr.write_loc != arg_first {
            self.emit_abx(OpCode::StoreMove, expr.write_loc, u32::from(arg_first));
        }
        self.pop_temp(op_loc);
        *expr = ExprInfo {
            write_loc: expr.write_loc,
            var: VarInfo::temp(expr.write_loc),
            receiver: None,
        };
    }

    fn expr_call(&mut self, expr: &mut ExprInfo, lhs: &ExprInfo, _token: &Token<'a>, _prec: Prec) {
        let fn_loc = self.push_temp(1);

        let callee = if lhs.var.kind == VarKind::Local && lhs.var.is_valid() {
            lhs.var.location
        } else if lhs.var.kind == VarKind::Module {
            self.variable_load(lhs.var, fn_loc);
            fn_loc
        } else {
            self.emit_abx(OpCode::StoreMove, fn_loc, u32::from(lhs.write_loc));
            fn_loc
        };

        let arg_first = self.push_temp(1);
        let num_args = self.parse_call_args(arg_first, 0, TokenKind::RParen);
        self.eat(
            TokenKind::RParen,
            "Function call must end with a closing parenthesis.",
        );

        self.emit_abc(OpCode::CallFn, arg_first, callee, num_args);
        if expr.write_loc != arg_first {
            self.emit_abx(OpCode::StoreMove, expr.write_loc, u32::from(arg_first));
        }
        self.pop_temp(fn_loc);
        *expr = ExprInfo {
            write_loc: expr.write_loc,
            var: VarInfo::temp(expr.write_loc),
            receiver: None,
        };
    }

    fn expr_assign(
        &mut self,
        _expr: &mut ExprInfo,
        lhs: &ExprInfo,
        token: &Token<'a>,
        prec: Prec,
    ) {
        if !lhs.var.is_valid() {
            self.error("Invalid assignment target.");
        }

        let rhs_loc = self.push_temp(1);
        let mut rhs = ExprInfo::temp_at(rhs_loc);
        self.parse_expr(&mut rhs, prec);

        match token.kind {
            TokenKind::PlusEq => self.emit_abc(OpCode::MathAdd, rhs_loc, lhs.write_loc, rhs_loc),
            TokenKind::MinusEq => self.emit_abc(OpCode::MathSub, rhs_loc, lhs.write_loc, rhs_loc),
            _ => {}
        }

        if lhs.var.is_valid() {
            self.variable_store(lhs.var, rhs_loc);
        }
        self.pop_temp(rhs_loc);
    }

    /// Parses a comma-separated argument list up to `end`. The first
    /// `reserved` argument slots are already occupied starting at
    /// `first`.
    fn parse_call_args(&mut self, first: u16, reserved: u16, end: TokenKind) -> u16 {
        let mut num_args = reserved;
        if !self.is(end) {
            loop {
                let slot = if num_args == 0 {
                    first
                } else {
                    self.push_temp(1)
                };
                let mut arg = ExprInfo::temp_at(slot);
                self.parse_expr(&mut arg, Prec::None);
                num_args += 1;

                if !self.eat_opt(TokenKind::Comma) || self.check(TokenKind::Eop) {
                    break;
                }
            }
        }
        num_args
    }

    /* Functions */

    /// Reads the function name (`name`, `[]`, `[]=`, or nothing when
    /// anonymous functions are allowed) and opens its builder.
    fn begin_function(&mut self, require_name: bool) -> &'a str {
        let name: &'a str = if self.check(TokenKind::Identifier) {
            let name = self.current.text;
            self.advance();
            name
        } else if self.check(TokenKind::LBracket) {
            self.advance();
            self.eat(TokenKind::RBracket, "Expected ']' in operator method name.");
            if self.eat_opt(TokenKind::Eq) {
                "[]="
            } else {
                "[]"
            }
        } else if !require_name {
            ""
        } else {
            self.error("Expected an identifier, \"[]\" or \"[]=\" after 'func'.");
            "__invalid__"
        };

        self.push_builder(name);
        name
    }

    /// Parses `(params...) { body }` into the current builder and
    /// returns the declared parameter count.
    fn parse_function_body(&mut self) -> i32 {
        let mut arity = 0;
        self.eat(TokenKind::LParen, "Expected a parameter list.");

        while !self.is(TokenKind::RParen) {
            if self.check(TokenKind::Identifier) {
                let param = self.current.text;
                if self.builder_mut().decl_variable(param).is_err() {
                    self.error(&format!("'{}' is already declared.", param));
                }
            }
            self.eat(TokenKind::Identifier, "Parameter names must be identifiers.");
            self.eat_opt(TokenKind::Comma);
            arity += 1;
        }

        self.eat(TokenKind::RParen, "Expected ')' after the parameter list.");
        self.parse_block();
        self.eat_opt(TokenKind::Semicolon);
        arity
    }

    fn parse_function_decl(&mut self) {
        self.advance(); // 'func'

        let is_local = self.builders.len() != 1;
        let name = self.begin_function(true);
        let arity = self.parse_function_body();
        let func = self.finish_function(arity);

        if is_local {
            let slot = match self.builder_mut().decl_variable(name) {
                Ok(slot) => slot,
                Err(slot) => {
                    self.error(&format!("'{}' is already declared.", name));
                    slot
                }
            };
            let index = self.add_constant(func);
            self.emit_abx(OpCode::LoadBasic, slot, LOAD_BASIC_CONSTANT + index);
        } else {
            self.host.module_set_var(self.module, name, func);
        }
        self.host.gc_unpin();
    }

    /* Statements */

    fn parse_block(&mut self) {
        self.eat(TokenKind::LBrace, "Expected '{' to open a block.");
        self.builder_mut().push_scope();

        while !self.is(TokenKind::RBrace) {
            if !self.parse_statement() {
                break;
            }
        }

        self.builder_mut().pop_scope();
        self.eat(TokenKind::RBrace, "Expected '}' to close the block.");
    }

    fn parse_var_decl(&mut self, is_static: bool) {
        self.eat(TokenKind::Var, "Expected 'var'.");

        let name = self.current.text;
        if !self.eat(TokenKind::Identifier, "Expected an identifier after 'var'.") {
            return;
        }

        // Module-scope declarations (and every `static var`) bind a
        // module variable the host can read back; everything else is a
        // frame local.
        let module_level =
            is_static || (self.builders.len() == 1 && self.builder().scope_depth() == 1);

        if module_level {
            let sym = self.host.module_set_var(self.module, name, Value::NIL);
            if self.eat_opt(TokenKind::Eq) {
                let var = VarInfo {
                    kind: VarKind::Module,
                    location: sym.0 as u16,
                };
                let expr_loc = self.push_temp(1);
                let mut init = ExprInfo::temp_at(expr_loc);
                self.parse_expr(&mut init, Prec::None);
                self.variable_store(var, expr_loc);
                self.pop_temp(expr_loc);
            }
        } else {
            let slot = match self.builder_mut().decl_variable(name) {
                Ok(slot) => slot,
                Err(slot) => {
                    self.error(&format!("'{}' is already declared.", name));
                    slot
                }
            };
            if self.eat_opt(TokenKind::Eq) {
                let mut init = ExprInfo::temp_at(slot);
                self.parse_expr(&mut init, Prec::None);
            } else {
                self.emit_abx(OpCode::LoadBasic, slot, LOAD_BASIC_NIL);
            }
        }

        self.eat(
            TokenKind::Semicolon,
            "Expected a semicolon after the variable declaration.",
        );
    }

    fn parse_if(&mut self) {
        self.advance(); // 'if'
        self.eat(TokenKind::LParen, "Expected '(' after 'if'.");

        let cond_loc = self.push_temp(1);
        let mut cond = ExprInfo::temp_at(cond_loc);
        self.parse_expr(&mut cond, Prec::None);
        self.eat(TokenKind::RParen, "Expected ')' after the if condition.");

        let if_jump = self.make_jump();
        self.pop_temp(cond_loc);

        self.parse_block();

        if self.eat_opt(TokenKind::Else) {
            let else_jump = self.make_jump();
            self.patch_jump(if_jump, Some(cond_loc), true);
            self.parse_statement();
            self.patch_jump(else_jump, None, false);
        } else {
            self.patch_jump(if_jump, Some(cond_loc), true);
        }
    }

    fn parse_while(&mut self) {
        self.advance(); // 'while'

        let cond_loc = self.push_temp(1);
        let loop_top = self.mark_jump_target();

        self.eat(TokenKind::LParen, "Expected '(' after 'while'.");
        let mut cond = ExprInfo::temp_at(cond_loc);
        self.parse_expr(&mut cond, Prec::None);
        self.eat(TokenKind::RParen, "Expected ')' after the while condition.");

        let exit_jump = self.make_jump();

        self.loop_push();
        self.parse_statement();
        self.emit_jump_back(loop_top);
        self.patch_jump(exit_jump, Some(cond_loc), true);

        self.pop_temp(cond_loc);
        self.loop_pop();
    }

    /// `for (init; cond; increment) { body }` compiles with the
    /// increment placed after the body and before re-testing the
    /// condition:
    ///
    /// ```text
    /// init
    /// cond:  <condition>        (defaults to true when omitted)
    ///        JUMP_IF     -> body
    ///        JUMP_IF_NOT -> end
    /// inc:   <increment>
    ///        JUMP -> cond
    /// body:  <statements>
    ///        JUMP -> inc
    /// end:
    /// ```
    fn parse_for(&mut self) {
        self.eat(TokenKind::LParen, "Expected '(' after 'for'.");
        self.builder_mut().push_scope();

        if !self.eat_opt(TokenKind::Semicolon) {
            self.parse_statement();
        }

        let cond_top = self.mark_jump_target();
        let cond_loc = self.push_temp(1);

        if !self.is(TokenKind::Semicolon) {
            let mut cond = ExprInfo::temp_at(cond_loc);
            self.parse_expr(&mut cond, Prec::None);
        } else {
            self.emit_abx(OpCode::LoadBasic, cond_loc, LOAD_BASIC_TRUE);
        }

        let cond_to_body = self.make_jump();
        let cond_to_end = self.make_jump();
        self.pop_temp(cond_loc);

        self.eat_opt(TokenKind::Semicolon);

        let inc_top = self.mark_jump_target();
        if !self.eat_opt(TokenKind::RParen) {
            self.parse_statement();
            self.eat(TokenKind::RParen, "Expected ')' after the for-loop clauses.");
        }
        self.emit_jump_back(cond_top);

        self.patch_jump(cond_to_body, Some(cond_loc), false);
        self.loop_push();
        self.parse_block();
        self.emit_jump_back(inc_top);

        self.patch_jump(cond_to_end, Some(cond_loc), true);
        self.loop_pop();

        self.builder_mut().pop_scope();
        self.eat_opt(TokenKind::Semicolon);
    }

    /* Classes */

    fn parse_class_decl(&mut self) {
        self.advance(); // 'class'

        let name = self.current.text;
        self.eat(TokenKind::Identifier, "Expected a class name after 'class'.");

        let mut base = None;
        if self.eat_opt(TokenKind::Colon) {
            let base_name = self.current.text;
            if self.eat(TokenKind::Identifier, "Expected a base class name after ':'.") {
                let base_value = self.host.module_get_var(self.module, base_name);
                if self.host.is_class(base_value) {
                    base = Some(base_value);
                } else {
                    self.error(&format!(
                        "'{}' cannot be used as the base class of '{}'.",
                        base_name, name
                    ));
                }
            }
        }

        self.eat(TokenKind::LBrace, "Class body must start with '{'.");

        let class = self.host.alloc_class(self.module, name, base, 0);
        self.host.module_set_var(self.module, name, class);

        let previous_class = self.current_class.replace(class);
        while !self.is(TokenKind::RBrace) {
            if self.eat_opt(TokenKind::Var) {
                self.parse_class_var(class, false);
            } else if self.eat_opt(TokenKind::Func) {
                self.parse_class_func(class);
            } else if self.eat_opt(TokenKind::Static) {
                if self.eat_opt(TokenKind::Func) {
                    self.parse_class_func(class);
                } else if self.eat_opt(TokenKind::Var) {
                    self.parse_class_var(class, true);
                } else {
                    self.error("'static' must be followed by 'var' or 'func'.");
                }
            } else {
                self.error("Only 'var' and 'func' declarations are allowed in a class body.");
                self.parse_statement();
            }
        }
        self.current_class = previous_class;

        self.eat(TokenKind::RBrace, "Class body must end with '}'.");
        self.eat_opt(TokenKind::Semicolon);
    }

    fn parse_class_var(&mut self, class: Value, is_static: bool) {
        let name = self.current.text;
        self.eat(TokenKind::Identifier, "Expected a field name after 'var'.");

        let mut value = Value::NIL;
        if self.eat_opt(TokenKind::Eq) {
            if self.is_constexpr() {
                value = self.constexpr_value();
            } else {
                self.error("Field initializers must be constant expressions.");
            }
        }

        if is_static {
            self.host.class_set_symbol(class, name, value);
        } else {
            self.host.class_add_field(class, name, value);
        }

        self.eat(
            TokenKind::Semicolon,
            "Expected a semicolon after the field declaration.",
        );
    }

    fn parse_class_func(&mut self, class: Value) {
        let name = self.begin_function(true);

        // Every method receives its receiver in slot 0: the instance
        // for ordinary methods, the class object for statics (method
        // calls always pass the value left of the dot).
        let _ = self.builder_mut().decl_variable("self");

        let arity = 1 + self.parse_function_body();
        let func = self.finish_function(arity);
        self.host.class_set_symbol(class, name, func);
        self.host.gc_unpin();
    }

    fn is_constexpr(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Number | TokenKind::Str | TokenKind::True | TokenKind::False | TokenKind::Nil
        )
    }

    fn constexpr_value(&mut self) -> Value {
        let value = match self.current.kind {
            TokenKind::Number => Value::from_number(self.current.num),
            TokenKind::True => Value::TRUE,
            TokenKind::False => Value::FALSE,
            TokenKind::Nil => Value::NIL,
            TokenKind::Str => self.host.alloc_string(self.current.text),
            _ => unreachable!("constexpr_value called on a non-constant token"),
        };
        self.advance();
        value
    }

    /* Imports */

    fn parse_import(&mut self) {
        self.advance(); // 'import'

        let name = self.current.text;
        if !self.eat(TokenKind::Str, "Import must name a module with a string literal.") {
            return;
        }

        let imported = self.host.import_module(self.module, name);
        if imported.is_none() {
            self.error(&format!("failed to import module '{}'", name));
        }

        if self.eat_opt(TokenKind::For) {
            loop {
                let source_name = self.current.text;
                if !self.eat(TokenKind::Identifier, "Imported names must be identifiers.") {
                    break;
                }

                let mut local_name = source_name;
                if self.eat_opt(TokenKind::Eq) || self.eat_opt(TokenKind::As) {
                    local_name = self.current.text;
                    self.eat(TokenKind::Identifier, "Import aliases must be identifiers.");
                }

                if let Some(imported) = imported {
                    let value = self.host.module_get_var(imported, source_name);
                    self.host.module_set_var(self.module, local_name, value);
                }

                if !self.eat_opt(TokenKind::Comma) || self.check(TokenKind::Eop) {
                    break;
                }
            }
        } else if let Some(imported) = imported {
            // Without a `for` list every named, non-nil variable is
            // copied in.
            for (var_name, value) in self.host.module_vars(imported) {
                if !value.is_nil() {
                    self.host.module_set_var(self.module, &var_name, value);
                }
            }
        }

        self.eat(TokenKind::Semicolon, "Expected a semicolon after the import.");
    }

    /* Statement dispatch */

    fn parse_statement(&mut self) -> bool {
        match self.current.kind {
            TokenKind::Eop => false,
            TokenKind::Semicolon => {
                self.advance();
                true
            }
            TokenKind::Break => {
                if self.loop_stack.is_empty() {
                    self.error("'break' cannot be used outside of a loop.");
                } else {
                    self.builder_mut().emit_break();
                }
                self.advance();
                self.eat(TokenKind::Semicolon, "Expected a semicolon after 'break'.");
                // Anything after a break in this block is unreachable.
                false
            }
            TokenKind::Return => {
                self.advance();

                let expr_loc = self.push_temp(1);
                if !self.is(TokenKind::Semicolon) {
                    let mut value = ExprInfo::temp_at(expr_loc);
                    self.parse_expr(&mut value, Prec::None);
                } else {
                    self.emit_abx(OpCode::LoadBasic, expr_loc, LOAD_BASIC_NIL);
                }

                self.emit_abx(OpCode::Return, 0, u32::from(expr_loc));
                self.pop_temp(expr_loc);
                self.eat_opt(TokenKind::Semicolon);

                // Skip unreachable code up to the end of the block.
                while !self.is(TokenKind::RBrace) {
                    self.advance();
                }
                false
            }
            TokenKind::Class => {
                self.parse_class_decl();
                true
            }
            TokenKind::If => {
                self.parse_if();
                true
            }
            TokenKind::While => {
                self.parse_while();
                true
            }
            TokenKind::Static | TokenKind::Var => {
                let is_static = self.eat_opt(TokenKind::Static);
                self.parse_var_decl(is_static);
                true
            }
            TokenKind::Func => {
                self.parse_function_decl();
                true
            }
            TokenKind::Import => {
                self.parse_import();
                true
            }
            TokenKind::For => {
                self.advance();
                self.parse_for();
                true
            }
            TokenKind::Identifier => {
                let working = self.push_temp(1);
                let mut expr = ExprInfo::temp_at(working);
                self.parse_expr(&mut expr, Prec::None);
                self.eat_opt(TokenKind::Semicolon);
                self.pop_temp(working);
                true
            }
            TokenKind::LBrace => {
                self.parse_block();
                true
            }
            TokenKind::New | TokenKind::Super => {
                let working = self.push_temp(1);
                let mut expr = ExprInfo {
                    write_loc: working,
                    var: VarInfo::temp(working),
                    receiver: None,
                };
                self.parse_expr(&mut expr, Prec::None);
                self.eat_opt(TokenKind::Semicolon);
                self.pop_temp(working);
                true
            }
            _ => {
                self.error("Unexpected token at the start of a statement.");
                self.advance();
                false
            }
        }
    }
}
