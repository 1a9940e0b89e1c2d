use std::iter::Peekable;
use std::rc::Rc;

use crate::{
    scan, token, Chunk, Heap, Obj, ObjFun, ObjRef, OpCode, ParseError, Position, Scanner, Token,
    UpvalueRef, Value, MAX_CHUNK_CONSTANTS, MAX_LOCAL_VARIABLES, MAX_PARAMS, MAX_UPVALUES,
};

/// Compile the given source code into a function object holding the
/// bytecode for the whole script.
///
/// Every reported error is printed to standard error. When any error was
/// reported the partial bytecode is thrown away and `None` is returned.
pub fn compile(src: &str, heap: &mut Heap) -> Option<ObjRef> {
    let mut parser = Parser::new(src, heap);
    while parser.peek().is_some() {
        if let Err(err) = parser.declaration() {
            parser.report(err);
            parser.recover();
        }
    }
    parser.finish()
}

/// What kind of function body is being compiled. The kind decides how slot
/// zero is named and what `return` is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable known to the compiler. `depth == -1` marks a variable
/// whose initializer is still being compiled.
#[derive(Debug)]
struct Local {
    name: String,
    depth: i32,
    captured: bool,
}

/// Per-function compilation state. One of these is pushed for every nested
/// function, method, or lambda; the bottom of the stack compiles the script.
#[derive(Debug)]
struct FunCompiler {
    kind: FunKind,
    name: Option<ObjRef>,
    arity: u8,
    upvalues: Vec<UpvalueRef>,
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: i32,
}

impl FunCompiler {
    fn new(kind: FunKind, name: Option<ObjRef>) -> Self {
        // Slot 0 belongs to the VM. Methods name it `this` so user code can
        // resolve it; for other functions the empty name is unresolvable.
        let slot_zero = Local {
            name: match kind {
                FunKind::Method | FunKind::Initializer => "this".to_string(),
                _ => String::new(),
            },
            depth: 0,
            captured: false,
        };
        Self {
            kind,
            name,
            arity: 0,
            upvalues: Vec::new(),
            chunk: Chunk::default(),
            locals: vec![slot_zero],
            scope_depth: 0,
        }
    }
}

/// Per-class compilation state, tracking whether `super` is meaningful.
#[derive(Debug)]
struct ClassCompiler {
    has_superclass: bool,
}

/// Scan for tokens and emit corresponding bytecodes.
struct Parser<'src, 'heap> {
    tokens: Peekable<scan::Iter<'src>>,
    heap: &'heap mut Heap,
    compilers: Vec<FunCompiler>,
    classes: Vec<ClassCompiler>,
    last_pos: Position,
    errors: usize,
}

/// All precedence levels, low to high.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    /// No precedence
    None,
    /// Operator `=`
    Assignment,
    /// Operator `or`
    Or,
    /// Operator `and`
    And,
    /// Operator `==` `!=`
    Equality,
    /// Operator `<` `>` `<=` `>=`
    Comparison,
    /// Operator `+` `-`
    Term,
    /// Operator `*` `/`
    Factor,
    /// Operator `!` `-`
    Unary,
    /// Operator `.` `()`
    Call,
    /// Literal and keywords
    Primary,
}

impl Precedence {
    /// Get the immediately higher precedence level
    fn next(&self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Primary,
            Self::Primary => Self::Primary,
        }
    }

    fn of(typ: &token::Type) -> Self {
        match typ {
            token::Type::BangEqual | token::Type::EqualEqual => Precedence::Equality,
            token::Type::Greater
            | token::Type::GreaterEqual
            | token::Type::Less
            | token::Type::LessEqual => Precedence::Comparison,
            token::Type::Minus | token::Type::Plus => Precedence::Term,
            token::Type::Slash | token::Type::Star => Precedence::Factor,
            token::Type::And => Precedence::And,
            token::Type::Or => Precedence::Or,
            token::Type::LParen | token::Type::Dot => Precedence::Call,
            _ => Self::None,
        }
    }
}

impl<'src, 'heap> Parser<'src, 'heap> {
    fn new(src: &'src str, heap: &'heap mut Heap) -> Self {
        Self {
            tokens: Scanner::new(src).into_iter().peekable(),
            heap,
            compilers: vec![FunCompiler::new(FunKind::Script, None)],
            classes: Vec::new(),
            last_pos: Position::default(),
            errors: 0,
        }
    }

    fn report(&mut self, err: ParseError) {
        eprintln!("{}", err);
        self.errors += 1;
    }

    /// Throw away any half-built nested compilers and skip tokens until a
    /// statement boundary, so one error doesn't drown the rest of the
    /// program in follow-ups.
    fn recover(&mut self) {
        self.compilers.truncate(1);
        self.classes.clear();
        self.synchronize();
    }

    fn finish(mut self) -> Option<ObjRef> {
        if self.errors > 0 {
            return None;
        }
        let (fun, _) = self.end_compiler(self.last_pos);
        Some(fun)
    }

    // ---- token plumbing ----

    fn skip_scan_errors(&mut self) {
        while let Some(Err(_)) = self.tokens.peek() {
            if let Some(Err(err)) = self.tokens.next() {
                eprintln!("{}", err);
                self.errors += 1;
            }
        }
    }

    fn peek(&mut self) -> Option<&Token> {
        self.skip_scan_errors();
        match self.tokens.peek() {
            Some(Ok(tok)) => Some(tok),
            Some(Err(_)) => unreachable!("Scan errors have been skipped."),
            None => None,
        }
    }

    fn check(&mut self, typ: token::Type) -> bool {
        matches!(self.peek(), Some(tok) if tok.typ == typ)
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        self.skip_scan_errors();
        match self.tokens.next() {
            Some(Ok(tok)) => {
                self.last_pos = tok.pos;
                Ok(tok)
            }
            Some(Err(_)) => unreachable!("Scan errors have been skipped."),
            None => Err(ParseError::UnexpectedEof("Expect expression".to_string())),
        }
    }

    fn advance_when(&mut self, typ: token::Type) -> Option<Token> {
        if self.check(typ) {
            self.advance().ok()
        } else {
            None
        }
    }

    fn consume(&mut self, typ: token::Type, msg: &str) -> Result<Token, ParseError> {
        if self.check(typ) {
            return self.advance();
        }
        match self.peek() {
            Some(tok) => Err(ParseError::UnexpectedToken(
                tok.pos,
                tok.lexeme.clone(),
                msg.to_string(),
            )),
            None => Err(ParseError::UnexpectedEof(msg.to_string())),
        }
    }

    fn synchronize(&mut self) {
        while self.peek().is_some() {
            let tok = match self.advance() {
                Ok(tok) => tok,
                Err(_) => return,
            };
            if tok.typ == token::Type::Semicolon {
                return;
            }
            if let Some(tok) = self.peek() {
                match tok.typ {
                    token::Type::Class
                    | token::Type::Fun
                    | token::Type::Var
                    | token::Type::For
                    | token::Type::If
                    | token::Type::While
                    | token::Type::Print
                    | token::Type::Return => return,
                    _ => {}
                }
            }
        }
    }

    // ---- emission plumbing ----

    fn current(&mut self) -> &mut FunCompiler {
        self.compilers
            .last_mut()
            .expect("The compiler stack is never empty.")
    }

    fn emit(&mut self, op: OpCode, pos: Position) {
        self.current().chunk.write_instruction(op, pos);
    }

    fn emit_jump(&mut self, op: OpCode, pos: Position) -> usize {
        self.emit(op, pos);
        self.current().chunk.instructions_count() - 1
    }

    fn patch_jump(&mut self, jump: usize, pos: Position) -> Result<(), ParseError> {
        let offset = self.current().chunk.instructions_count() - jump - 1;
        if offset > u16::MAX as usize {
            return Err(ParseError::JumpTooLarge(pos));
        }
        self.current().chunk.patch_jump_instruction(jump, offset as u16);
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize, pos: Position) -> Result<(), ParseError> {
        // +1 to also hop over the loop instruction itself.
        let offset = self.current().chunk.instructions_count() - loop_start + 1;
        if offset > u16::MAX as usize {
            return Err(ParseError::JumpTooLarge(pos));
        }
        self.emit(OpCode::Loop(offset as u16), pos);
        Ok(())
    }

    fn emit_return(&mut self, pos: Position) {
        if self.current().kind == FunKind::Initializer {
            // An initializer implicitly returns its receiver.
            self.emit(OpCode::GetLocal(0), pos);
        } else {
            self.emit(OpCode::Nil, pos);
        }
        self.emit(OpCode::Return, pos);
    }

    fn make_constant(&mut self, val: Value, pos: Position) -> Result<u8, ParseError> {
        let chunk = &mut self.current().chunk;
        if chunk.const_count() >= MAX_CHUNK_CONSTANTS {
            return Err(ParseError::TooManyConstants(pos));
        }
        Ok(chunk.write_const(val) as u8)
    }

    fn identifier_constant(&mut self, name: &str, pos: Position) -> Result<u8, ParseError> {
        let obj = self.intern(name);
        self.make_constant(Value::Obj(obj), pos)
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern(s)
    }

    /// Collection safe point on the compiler side. The roots are whatever
    /// the in-progress chunks already reference.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        self.heap.begin_collection();
        for compiler in &self.compilers {
            if let Some(name) = compiler.name {
                self.heap.mark_object(name);
            }
            for constant in compiler.chunk.constants() {
                self.heap.mark_value(*constant);
            }
        }
        self.heap.trace();
        self.heap.sweep();
    }

    /// Finish the innermost function: seal its chunk with an implicit return
    /// and move it onto the heap.
    fn end_compiler(&mut self, pos: Position) -> (ObjRef, Vec<UpvalueRef>) {
        self.emit_return(pos);
        // The finished compiler is still on the stack here, which keeps its
        // constants rooted across this safe point.
        self.maybe_collect();
        let compiler = self
            .compilers
            .pop()
            .expect("The compiler stack is never empty.");
        let fun = ObjFun {
            name: compiler.name,
            arity: compiler.arity,
            upvalue_count: compiler.upvalues.len(),
            chunk: Rc::new(compiler.chunk),
        };
        let obj = self.heap.alloc(Obj::Fun(fun));
        if cfg!(feature = "print-code") && self.errors == 0 {
            let label = self.heap.show_value(Value::Obj(obj));
            crate::disassemble_chunk(&self.heap.fun(obj).chunk, &label, self.heap);
        }
        (obj, compiler.upvalues)
    }

    // ---- scopes and variables ----

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self, pos: Position) {
        let compiler = self.current();
        compiler.scope_depth -= 1;
        while let Some(local) = compiler.locals.last() {
            if local.depth <= compiler.scope_depth {
                break;
            }
            let captured = local.captured;
            compiler.locals.pop();
            let op = if captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            compiler.chunk.write_instruction(op, pos);
        }
    }

    fn add_local(&mut self, name: String, pos: Position) -> Result<(), ParseError> {
        let compiler = self.current();
        if compiler.locals.len() >= MAX_LOCAL_VARIABLES {
            return Err(ParseError::TooManyLocals(pos));
        }
        compiler.locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
        Ok(())
    }

    fn declare_variable(&mut self, tok: &Token) -> Result<(), ParseError> {
        let compiler = self.current();
        if compiler.scope_depth == 0 {
            // Globals are late bound; nothing to track at compile time.
            return Ok(());
        }
        for local in compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < compiler.scope_depth {
                break;
            }
            if local.name == tok.lexeme {
                return Err(ParseError::DuplicateVariable(tok.pos, tok.lexeme.clone()));
            }
        }
        self.add_local(tok.lexeme.clone(), tok.pos)
    }

    /// Declare the variable named by the token and, for globals, build the
    /// constant holding its name.
    fn var_name(&mut self, tok: &Token) -> Result<Option<u8>, ParseError> {
        self.declare_variable(tok)?;
        if self.current().scope_depth > 0 {
            Ok(None)
        } else {
            Ok(Some(self.identifier_constant(&tok.lexeme, tok.pos)?))
        }
    }

    fn mark_initialized(&mut self) {
        let compiler = self.current();
        if compiler.scope_depth == 0 {
            return;
        }
        let depth = compiler.scope_depth;
        if let Some(local) = compiler.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: Option<u8>, pos: Position) {
        match global {
            Some(const_id) => self.emit(OpCode::DefineGlobal(const_id), pos),
            None => self.mark_initialized(),
        }
    }

    fn resolve_local(
        &self,
        compiler: usize,
        name: &str,
        pos: Position,
    ) -> Result<Option<u8>, ParseError> {
        for (slot, local) in self.compilers[compiler].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(ParseError::OwnInitializer(pos, name.to_string()));
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    fn resolve_upvalue(
        &mut self,
        compiler: usize,
        name: &str,
        pos: Position,
    ) -> Result<Option<u8>, ParseError> {
        if compiler == 0 {
            return Ok(None);
        }
        let enclosing = compiler - 1;
        if let Some(local) = self.resolve_local(enclosing, name, pos)? {
            self.compilers[enclosing].locals[local as usize].captured = true;
            return self.add_upvalue(compiler, local, true, pos).map(Some);
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name, pos)? {
            return self.add_upvalue(compiler, upvalue, false, pos).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        compiler: usize,
        index: u8,
        is_local: bool,
        pos: Position,
    ) -> Result<u8, ParseError> {
        let upvalues = &mut self.compilers[compiler].upvalues;
        for (i, upvalue) in upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if upvalues.len() >= MAX_UPVALUES {
            return Err(ParseError::TooManyUpvalues(pos));
        }
        upvalues.push(UpvalueRef { index, is_local });
        Ok((upvalues.len() - 1) as u8)
    }

    fn named_variable(
        &mut self,
        name: &str,
        pos: Position,
        can_assign: bool,
    ) -> Result<(), ParseError> {
        let top = self.compilers.len() - 1;
        let (get_op, set_op) = if let Some(slot) = self.resolve_local(top, name, pos)? {
            (OpCode::GetLocal(slot), OpCode::SetLocal(slot))
        } else if let Some(idx) = self.resolve_upvalue(top, name, pos)? {
            (OpCode::GetUpvalue(idx), OpCode::SetUpvalue(idx))
        } else {
            let const_id = self.identifier_constant(name, pos)?;
            (OpCode::GetGlobal(const_id), OpCode::SetGlobal(const_id))
        };
        if can_assign && self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
            self.emit(set_op, pos);
        } else {
            self.emit(get_op, pos);
        }
        Ok(())
    }

    // ---- declarations ----

    fn declaration(&mut self) -> Result<(), ParseError> {
        if let Some(tok) = self.advance_when(token::Type::Class) {
            return self.class_declaration(&tok);
        }
        if self.advance_when(token::Type::Fun).is_some() {
            return self.fun_declaration();
        }
        if self.advance_when(token::Type::Var).is_some() {
            return self.var_declaration();
        }
        self.statement()
    }

    fn var_declaration(&mut self) -> Result<(), ParseError> {
        let ident = self.consume(token::Type::Ident, "Expect variable name")?;
        let global = self.var_name(&ident)?;
        if self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
        } else {
            self.emit(OpCode::Nil, ident.pos);
        }
        self.consume(token::Type::Semicolon, "Expect ';' after variable declaration")?;
        self.define_variable(global, ident.pos);
        Ok(())
    }

    fn fun_declaration(&mut self) -> Result<(), ParseError> {
        let name_tok = self.consume(token::Type::Ident, "Expect function name")?;
        let global = self.var_name(&name_tok)?;
        // The function may call itself recursively; its own body must be
        // able to resolve the name being declared.
        if global.is_none() {
            self.mark_initialized();
        }
        self.function(FunKind::Function, Some(name_tok.lexeme.as_str()), name_tok.pos)?;
        self.define_variable(global, name_tok.pos);
        Ok(())
    }

    fn function(
        &mut self,
        kind: FunKind,
        name: Option<&str>,
        pos: Position,
    ) -> Result<(), ParseError> {
        let name_obj = match name {
            Some(n) => self.intern(n),
            None => self.intern(""),
        };
        self.compilers.push(FunCompiler::new(kind, Some(name_obj)));
        self.begin_scope();
        self.consume(token::Type::LParen, "Expect '(' after function name")?;
        if !self.check(token::Type::RParen) {
            loop {
                {
                    let compiler = self.current();
                    if compiler.arity == MAX_PARAMS as u8 {
                        return Err(ParseError::TooManyParams(pos));
                    }
                    compiler.arity += 1;
                }
                let param = self.consume(token::Type::Ident, "Expect parameter name")?;
                let global = self.var_name(&param)?;
                self.define_variable(global, param.pos);
                if self.advance_when(token::Type::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(token::Type::RParen, "Expect ')' after parameters")?;
        self.consume(token::Type::LBrace, "Expect '{' before function body")?;
        self.block()?;
        let (fun, upvalues) = self.end_compiler(self.last_pos);
        let const_id = self.make_constant(Value::Obj(fun), pos)?;
        self.emit(OpCode::Closure(const_id, upvalues), pos);
        Ok(())
    }

    fn class_declaration(&mut self, tok: &Token) -> Result<(), ParseError> {
        let name_tok = self.consume(token::Type::Ident, "Expect class name")?;
        let name_const = self.identifier_constant(&name_tok.lexeme, name_tok.pos)?;
        let global = if self.current().scope_depth == 0 {
            Some(name_const)
        } else {
            None
        };
        self.declare_variable(&name_tok)?;
        self.emit(OpCode::Class(name_const), name_tok.pos);
        self.define_variable(global, name_tok.pos);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.advance_when(token::Type::Less).is_some() {
            let super_tok = self.consume(token::Type::Ident, "Expect superclass name")?;
            if super_tok.lexeme == name_tok.lexeme {
                return Err(ParseError::SelfInheritance(
                    super_tok.pos,
                    super_tok.lexeme.clone(),
                ));
            }
            self.named_variable(&super_tok.lexeme, super_tok.pos, false)?;
            // `super` lives in its own scope so sibling classes each capture
            // their own superclass.
            self.begin_scope();
            self.add_local("super".to_string(), super_tok.pos)?;
            self.define_variable(None, super_tok.pos);
            self.named_variable(&name_tok.lexeme, name_tok.pos, false)?;
            self.emit(OpCode::Inherit, super_tok.pos);
            self.classes
                .last_mut()
                .expect("A class is being compiled.")
                .has_superclass = true;
        }

        self.named_variable(&name_tok.lexeme, name_tok.pos, false)?;
        self.consume(token::Type::LBrace, "Expect '{' before class body")?;
        while !self.check(token::Type::RBrace) && self.peek().is_some() {
            self.method()?;
        }
        self.consume(token::Type::RBrace, "Expect '}' after class body")?;
        self.emit(OpCode::Pop, tok.pos);

        let has_superclass = self
            .classes
            .pop()
            .expect("A class is being compiled.")
            .has_superclass;
        if has_superclass {
            self.end_scope(tok.pos);
        }
        Ok(())
    }

    fn method(&mut self) -> Result<(), ParseError> {
        let name_tok = self.consume(token::Type::Ident, "Expect method name")?;
        let name_const = self.identifier_constant(&name_tok.lexeme, name_tok.pos)?;
        let kind = if name_tok.lexeme == "init" {
            FunKind::Initializer
        } else {
            FunKind::Method
        };
        self.function(kind, Some(name_tok.lexeme.as_str()), name_tok.pos)?;
        self.emit(OpCode::Method(name_const), name_tok.pos);
        Ok(())
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<(), ParseError> {
        if let Some(tok) = self.advance_when(token::Type::Print) {
            return self.print_statement(&tok);
        }
        if let Some(tok) = self.advance_when(token::Type::If) {
            return self.if_statement(&tok);
        }
        if let Some(tok) = self.advance_when(token::Type::While) {
            return self.while_statement(&tok);
        }
        if let Some(tok) = self.advance_when(token::Type::For) {
            return self.for_statement(&tok);
        }
        if let Some(tok) = self.advance_when(token::Type::Return) {
            return self.return_statement(&tok);
        }
        if self.advance_when(token::Type::LBrace).is_some() {
            self.begin_scope();
            let result = self.block();
            self.end_scope(self.last_pos);
            return result;
        }
        self.expression_statement()
    }

    fn print_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        self.expression()?;
        self.consume(token::Type::Semicolon, "Expect ';' after value")?;
        self.emit(OpCode::Print, tok.pos);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), ParseError> {
        self.expression()?;
        self.consume(token::Type::Semicolon, "Expect ';' after expression")?;
        self.emit(OpCode::Pop, self.last_pos);
        Ok(())
    }

    fn if_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        self.consume(token::Type::LParen, "Expect '(' after 'if'")?;
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after condition")?;

        // The branch never pops the condition itself, hence the explicit
        // pops on both paths.
        let then_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos);
        self.emit(OpCode::Pop, tok.pos);
        self.statement()?;
        let else_jump = self.emit_jump(OpCode::Jump(u16::MAX), tok.pos);
        self.patch_jump(then_jump, tok.pos)?;
        self.emit(OpCode::Pop, tok.pos);
        if self.advance_when(token::Type::Else).is_some() {
            self.statement()?;
        }
        self.patch_jump(else_jump, tok.pos)?;
        Ok(())
    }

    fn while_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        let loop_start = self.current().chunk.instructions_count();
        self.consume(token::Type::LParen, "Expect '(' after 'while'")?;
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after condition")?;

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos);
        self.emit(OpCode::Pop, tok.pos);
        self.statement()?;
        self.emit_loop(loop_start, tok.pos)?;
        self.patch_jump(exit_jump, tok.pos)?;
        self.emit(OpCode::Pop, tok.pos);
        Ok(())
    }

    fn for_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        self.begin_scope();
        self.consume(token::Type::LParen, "Expect '(' after 'for'")?;
        if self.advance_when(token::Type::Semicolon).is_some() {
            // No initializer.
        } else if self.advance_when(token::Type::Var).is_some() {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.current().chunk.instructions_count();
        let mut exit_jump = None;
        if self.advance_when(token::Type::Semicolon).is_none() {
            self.expression()?;
            self.consume(token::Type::Semicolon, "Expect ';' after loop condition")?;
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos));
            self.emit(OpCode::Pop, tok.pos);
        }

        if self.advance_when(token::Type::RParen).is_none() {
            // The increment textually precedes the body but runs after it,
            // so jump over it on the way in and loop back to it afterwards.
            let body_jump = self.emit_jump(OpCode::Jump(u16::MAX), tok.pos);
            let increment_start = self.current().chunk.instructions_count();
            self.expression()?;
            self.emit(OpCode::Pop, tok.pos);
            self.consume(token::Type::RParen, "Expect ')' after for clauses")?;
            self.emit_loop(loop_start, tok.pos)?;
            loop_start = increment_start;
            self.patch_jump(body_jump, tok.pos)?;
        }

        self.statement()?;
        self.emit_loop(loop_start, tok.pos)?;
        if let Some(exit) = exit_jump {
            self.patch_jump(exit, tok.pos)?;
            self.emit(OpCode::Pop, tok.pos);
        }
        self.end_scope(tok.pos);
        Ok(())
    }

    fn return_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        if self.current().kind == FunKind::Script {
            return Err(ParseError::TopLevelReturn(tok.pos));
        }
        if self.advance_when(token::Type::Semicolon).is_some() {
            self.emit_return(tok.pos);
            return Ok(());
        }
        if self.current().kind == FunKind::Initializer {
            return Err(ParseError::InitializerReturn(tok.pos));
        }
        self.expression()?;
        self.consume(token::Type::Semicolon, "Expect ';' after return value")?;
        self.emit(OpCode::Return, tok.pos);
        Ok(())
    }

    fn block(&mut self) -> Result<(), ParseError> {
        while !self.check(token::Type::RBrace) && self.peek().is_some() {
            self.declaration()?;
        }
        self.consume(token::Type::RBrace, "Expect '}' after block")?;
        Ok(())
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<(), ParseError> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<(), ParseError> {
        let tok = self.advance()?;
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix_rule(&tok, can_assign)?;

        loop {
            match self.peek() {
                None => break,
                Some(tok) if precedence > Precedence::of(&tok.typ) => break,
                _ => {}
            }
            let tok = self.advance()?;
            self.infix_rule(&tok, can_assign)?;
        }

        if can_assign {
            if let Some(eq) = self.advance_when(token::Type::Equal) {
                return Err(ParseError::InvalidAssignment(eq.pos));
            }
        }
        Ok(())
    }

    fn prefix_rule(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        match tok.typ {
            token::Type::LParen => self.grouping(),
            token::Type::Minus | token::Type::Bang => self.unary(tok),
            token::Type::String => self.string(tok),
            token::Type::Number => self.number(tok),
            token::Type::False | token::Type::Nil | token::Type::True => self.literal(tok),
            token::Type::Ident => self.named_variable(&tok.lexeme, tok.pos, can_assign),
            token::Type::This => self.this_expression(tok),
            token::Type::Super => self.super_expression(tok),
            token::Type::Fun => self.function(FunKind::Function, None, tok.pos),
            _ => Err(ParseError::UnexpectedToken(
                tok.pos,
                tok.lexeme.clone(),
                "Expect expression".to_string(),
            )),
        }
    }

    fn infix_rule(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        match tok.typ {
            token::Type::Minus
            | token::Type::Plus
            | token::Type::Slash
            | token::Type::Star
            | token::Type::BangEqual
            | token::Type::EqualEqual
            | token::Type::Greater
            | token::Type::GreaterEqual
            | token::Type::Less
            | token::Type::LessEqual => self.binary(tok),
            token::Type::And => self.and_expression(tok),
            token::Type::Or => self.or_expression(tok),
            token::Type::LParen => self.call(tok),
            token::Type::Dot => self.dot(tok, can_assign),
            _ => Err(ParseError::UnexpectedToken(
                tok.pos,
                tok.lexeme.clone(),
                "Expect expression".to_string(),
            )),
        }
    }

    fn binary(&mut self, operator: &Token) -> Result<(), ParseError> {
        self.parse_precedence(Precedence::of(&operator.typ).next())?;
        match operator.typ {
            token::Type::BangEqual => {
                self.emit(OpCode::Equal, operator.pos);
                self.emit(OpCode::Not, operator.pos);
            }
            token::Type::EqualEqual => self.emit(OpCode::Equal, operator.pos),
            token::Type::Greater => self.emit(OpCode::Greater, operator.pos),
            token::Type::GreaterEqual => {
                self.emit(OpCode::Less, operator.pos);
                self.emit(OpCode::Not, operator.pos);
            }
            token::Type::Less => self.emit(OpCode::Less, operator.pos),
            token::Type::LessEqual => {
                self.emit(OpCode::Greater, operator.pos);
                self.emit(OpCode::Not, operator.pos);
            }
            token::Type::Plus => self.emit(OpCode::Add, operator.pos),
            token::Type::Minus => self.emit(OpCode::Subtract, operator.pos),
            token::Type::Star => self.emit(OpCode::Multiply, operator.pos),
            token::Type::Slash => self.emit(OpCode::Divide, operator.pos),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn unary(&mut self, operator: &Token) -> Result<(), ParseError> {
        self.parse_precedence(Precedence::Unary)?;
        match operator.typ {
            token::Type::Bang => self.emit(OpCode::Not, operator.pos),
            token::Type::Minus => self.emit(OpCode::Negate, operator.pos),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn grouping(&mut self) -> Result<(), ParseError> {
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after expression")?;
        Ok(())
    }

    fn literal(&mut self, tok: &Token) -> Result<(), ParseError> {
        match tok.typ {
            token::Type::False => self.emit(OpCode::False, tok.pos),
            token::Type::Nil => self.emit(OpCode::Nil, tok.pos),
            token::Type::True => self.emit(OpCode::True, tok.pos),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn string(&mut self, tok: &Token) -> Result<(), ParseError> {
        let contents = tok.lexeme[1..tok.lexeme.len() - 1].to_string();
        let obj = self.intern(&contents);
        let const_id = self.make_constant(Value::Obj(obj), tok.pos)?;
        self.emit(OpCode::Constant(const_id), tok.pos);
        Ok(())
    }

    fn number(&mut self, tok: &Token) -> Result<(), ParseError> {
        let value = tok
            .lexeme
            .parse()
            .expect("Scanner must ensure that the lexeme contains a valid f64 string.");
        let const_id = self.make_constant(Value::Number(value), tok.pos)?;
        self.emit(OpCode::Constant(const_id), tok.pos);
        Ok(())
    }

    fn and_expression(&mut self, tok: &Token) -> Result<(), ParseError> {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos);
        self.emit(OpCode::Pop, tok.pos);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump, tok.pos)?;
        Ok(())
    }

    fn or_expression(&mut self, tok: &Token) -> Result<(), ParseError> {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos);
        let end_jump = self.emit_jump(OpCode::Jump(u16::MAX), tok.pos);
        self.patch_jump(else_jump, tok.pos)?;
        self.emit(OpCode::Pop, tok.pos);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump, tok.pos)?;
        Ok(())
    }

    fn call(&mut self, tok: &Token) -> Result<(), ParseError> {
        let argc = self.argument_list(tok.pos)?;
        self.emit(OpCode::Call(argc), tok.pos);
        Ok(())
    }

    fn argument_list(&mut self, pos: Position) -> Result<u8, ParseError> {
        let mut argc: usize = 0;
        if !self.check(token::Type::RParen) {
            loop {
                if argc == MAX_PARAMS {
                    return Err(ParseError::TooManyArgs(pos));
                }
                self.expression()?;
                argc += 1;
                if self.advance_when(token::Type::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(token::Type::RParen, "Expect ')' after arguments")?;
        Ok(argc as u8)
    }

    fn dot(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        let name_tok = self.consume(token::Type::Ident, "Expect property name after '.'")?;
        let name_const = self.identifier_constant(&name_tok.lexeme, name_tok.pos)?;
        if can_assign && self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
            self.emit(OpCode::SetProperty(name_const), tok.pos);
        } else if self.advance_when(token::Type::LParen).is_some() {
            let argc = self.argument_list(tok.pos)?;
            self.emit(OpCode::Invoke(name_const, argc), tok.pos);
        } else {
            self.emit(OpCode::GetProperty(name_const), tok.pos);
        }
        Ok(())
    }

    fn this_expression(&mut self, tok: &Token) -> Result<(), ParseError> {
        if self.classes.is_empty() {
            return Err(ParseError::ThisOutsideClass(tok.pos));
        }
        self.named_variable("this", tok.pos, false)
    }

    fn super_expression(&mut self, tok: &Token) -> Result<(), ParseError> {
        match self.classes.last() {
            None => return Err(ParseError::SuperOutsideClass(tok.pos)),
            Some(class) if !class.has_superclass => {
                return Err(ParseError::SuperWithoutSuperclass(tok.pos))
            }
            Some(_) => {}
        }
        self.consume(token::Type::Dot, "Expect '.' after 'super'")?;
        let name_tok = self.consume(token::Type::Ident, "Expect superclass method name")?;
        let name_const = self.identifier_constant(&name_tok.lexeme, name_tok.pos)?;

        self.named_variable("this", tok.pos, false)?;
        if self.advance_when(token::Type::LParen).is_some() {
            let argc = self.argument_list(tok.pos)?;
            self.named_variable("super", tok.pos, false)?;
            self.emit(OpCode::SuperInvoke(name_const, argc), tok.pos);
        } else {
            self.named_variable("super", tok.pos, false)?;
            self.emit(OpCode::GetSuper(name_const), tok.pos);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let fun = compile(src, &mut heap).expect("source should compile");
        (heap, fun)
    }

    fn script_ops(src: &str) -> Vec<OpCode> {
        let (heap, fun) = compile_ok(src);
        let chunk = &heap.fun(fun).chunk;
        (0..chunk.instructions_count())
            .map(|i| chunk.read_instruction(i).0.clone())
            .collect()
    }

    #[test]
    fn arithmetic_respects_precedence() {
        assert_eq!(
            script_ops("1 + 2 * 3;"),
            vec![
                OpCode::Constant(0),
                OpCode::Constant(1),
                OpCode::Constant(2),
                OpCode::Multiply,
                OpCode::Add,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn derived_comparisons_desugar() {
        assert_eq!(
            script_ops("1 <= 2;"),
            vec![
                OpCode::Constant(0),
                OpCode::Constant(1),
                OpCode::Greater,
                OpCode::Not,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn global_definition_references_its_name_constant() {
        assert_eq!(
            script_ops("var a = 1;"),
            vec![
                OpCode::Constant(1),
                OpCode::DefineGlobal(0),
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn locals_use_stack_slots() {
        assert_eq!(
            script_ops("{ var a = 1; print a; }"),
            vec![
                OpCode::Constant(0),
                OpCode::GetLocal(1),
                OpCode::Print,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn if_else_jumps_are_patched() {
        assert_eq!(
            script_ops("if (true) print 1; else print 2;"),
            vec![
                OpCode::True,
                OpCode::JumpIfFalse(4),
                OpCode::Pop,
                OpCode::Constant(0),
                OpCode::Print,
                OpCode::Jump(3),
                OpCode::Pop,
                OpCode::Constant(1),
                OpCode::Print,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn while_loops_jump_backwards() {
        assert_eq!(
            script_ops("while (false) print 1;"),
            vec![
                OpCode::False,
                OpCode::JumpIfFalse(4),
                OpCode::Pop,
                OpCode::Constant(0),
                OpCode::Print,
                OpCode::Loop(6),
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn and_short_circuits_over_its_right_operand() {
        assert_eq!(
            script_ops("true and false;"),
            vec![
                OpCode::True,
                OpCode::JumpIfFalse(2),
                OpCode::Pop,
                OpCode::False,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn or_short_circuits_over_its_right_operand() {
        assert_eq!(
            script_ops("false or true;"),
            vec![
                OpCode::False,
                OpCode::JumpIfFalse(1),
                OpCode::Jump(2),
                OpCode::Pop,
                OpCode::True,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn closures_record_their_captures() {
        let (heap, fun) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let script = &heap.fun(fun).chunk;
        // The script's only function constant is `outer`.
        let outer = script
            .constants()
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) => match heap.get(*r) {
                    Obj::Fun(_) => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");
        let outer_chunk = &heap.fun(outer).chunk;
        let closure_op = (0..outer_chunk.instructions_count())
            .map(|i| outer_chunk.read_instruction(i).0)
            .find_map(|op| match op {
                OpCode::Closure(_, upvalues) => Some(upvalues.clone()),
                _ => None,
            })
            .expect("inner closure instruction");
        assert_eq!(
            closure_op,
            vec![UpvalueRef {
                index: 1,
                is_local: true
            }]
        );
    }

    #[test]
    fn anonymous_functions_are_expressions() {
        let ops = script_ops("var f = fun() { return 1; };");
        assert!(ops
            .iter()
            .any(|op| matches!(op, OpCode::Closure(_, _))));
    }

    #[test]
    fn initializers_return_their_receiver() {
        let (heap, fun) = compile_ok("class P { init(x) { this.x = x; } }");
        let script = &heap.fun(fun).chunk;
        let init = script
            .constants()
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) => match heap.get(*r) {
                    Obj::Fun(f) if f.arity == 1 => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("init function constant");
        let chunk = &heap.fun(init).chunk;
        let count = chunk.instructions_count();
        assert_eq!(*chunk.read_instruction(count - 2).0, OpCode::GetLocal(0));
        assert_eq!(*chunk.read_instruction(count - 1).0, OpCode::Return);
    }

    fn compile_fails(src: &str) -> bool {
        let mut heap = Heap::new();
        compile(src, &mut heap).is_none()
    }

    #[test]
    fn invalid_assignment_targets_are_rejected() {
        assert!(compile_fails("var a; var b; var c; a + b = c;"));
    }

    #[test]
    fn duplicate_declarations_in_one_scope_are_rejected() {
        assert!(compile_fails("{ var a = 1; var a = 2; }"));
        // Shadowing in an inner scope stays legal.
        assert!(!compile_fails("{ var a = 1; { var a = 2; } }"));
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_is_rejected() {
        assert!(compile_fails("{ var a = 1; { var a = a; } }"));
    }

    #[test]
    fn top_level_return_is_rejected() {
        assert!(compile_fails("return 1;"));
    }

    #[test]
    fn value_returns_from_initializers_are_rejected() {
        assert!(compile_fails("class C { init() { return 1; } }"));
        assert!(!compile_fails("class C { init() { return; } }"));
    }

    #[test]
    fn this_and_super_require_a_class() {
        assert!(compile_fails("print this;"));
        assert!(compile_fails("print super.x;"));
        assert!(compile_fails("class C { m() { super.m(); } }"));
        assert!(compile_fails("class C < C {}"));
    }

    #[test]
    fn chunks_hold_at_most_256_constants() {
        let src: String = (0..300).map(|i| format!("{}.5;", i)).collect();
        assert!(compile_fails(&src));
    }

    #[test]
    fn scan_errors_fail_the_compile() {
        assert!(compile_fails("var a = \"unterminated;"));
        assert!(compile_fails("var @ = 1;"));
    }
}
