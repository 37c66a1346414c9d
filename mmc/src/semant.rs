use tracing::debug;

use crate::{
    absyn::*,
    errors::{Result, TranslateError},
    expression::{merge, AddressList, Expression},
    ir::{OpCode, Operand, Taco},
    symtab::{SymbolKind, SymbolRef, TableId, Value},
    translator::Translator,
    types::{DataType, ELEMENT_SIZE, MATRIX_HEADER, MAX_OBJECT_SIZE},
};

/// Walks the syntax tree of one translation unit and drives the translator:
/// symbols go into the table forest, code goes into the quad array.
pub struct TranslationContext<'a> {
    input: &'a str,
    mic: &'a mut Translator,
    return_type: DataType,
}

/// Shape of a matrix temporary, taken from its operands.
enum Shape {
    Like(SymbolRef),
    Product(SymbolRef, SymbolRef),
    Transposed(SymbolRef),
}

pub fn translate(input: &str, unit: &[ExternalDecl], mic: &mut Translator) -> Result<()> {
    let mut ctx = TranslationContext {
        input,
        mic,
        return_type: DataType::VOID,
    };
    for decl in unit {
        match decl {
            ExternalDecl::Function(f) => ctx.function_definition(f)?,
            ExternalDecl::Declaration(d) => ctx.global_declaration(d)?,
        }
    }
    Ok(())
}

fn base_type(spec: TypeSpec) -> DataType {
    match spec {
        TypeSpec::Void => DataType::VOID,
        TypeSpec::Char => DataType::CHAR,
        TypeSpec::Int => DataType::INT,
        TypeSpec::Double => DataType::DOUBLE,
        TypeSpec::Matrix => DataType::DYNAMIC_MATRIX,
    }
}

/// Decodes a quoted char literal such as `'a'` or `'\n'`.
fn unescape_char(lit: &str) -> Option<u8> {
    let inner = lit.strip_prefix('\'')?.strip_suffix('\'')?.as_bytes();
    match inner {
        [c] => Some(*c),
        [b'\\', c] => Some(match c {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            other => *other,
        }),
        _ => None,
    }
}

fn fold_binary(op: BinOp, l: Value, r: Value) -> Option<Value> {
    let ty = DataType::max_type(l.data_type(), r.data_type());
    if ty.is_double() {
        let (a, b) = match (l.convert(&ty)?, r.convert(&ty)?) {
            (Value::Double(a), Value::Double(b)) => (a, b),
            _ => return None,
        };
        let d = match op {
            BinOp::Plus => a + b,
            BinOp::Minus => a - b,
            BinOp::Times => a * b,
            BinOp::Divide => a / b,
            _ => return None,
        };
        return Some(Value::Double(d));
    }
    if !ty.is_integral() {
        return None;
    }
    let (a, b) = match (l.convert(&DataType::INT)?, r.convert(&DataType::INT)?) {
        (Value::Int(a), Value::Int(b)) => (a, b),
        _ => return None,
    };
    let i = match op {
        BinOp::Plus => a.wrapping_add(b),
        BinOp::Minus => a.wrapping_sub(b),
        BinOp::Times => a.wrapping_mul(b),
        BinOp::Divide => a.checked_div(b)?,
        BinOp::Modulo => a.checked_rem(b)?,
        BinOp::Shl => a.checked_shl(u32::try_from(b).ok()?)?,
        BinOp::Shr => a.checked_shr(u32::try_from(b).ok()?)?,
        BinOp::BitAnd => a & b,
        BinOp::BitXor => a ^ b,
        BinOp::BitOr => a | b,
    };
    Value::Int(i).convert(&ty)
}

fn binary_opcode(op: BinOp) -> OpCode {
    match op {
        BinOp::Plus => OpCode::Plus,
        BinOp::Minus => OpCode::Minus,
        BinOp::Times => OpCode::Mult,
        BinOp::Divide => OpCode::Div,
        BinOp::Modulo => OpCode::Mod,
        BinOp::Shl => OpCode::Shl,
        BinOp::Shr => OpCode::Shr,
        BinOp::BitAnd => OpCode::BitAnd,
        BinOp::BitXor => OpCode::BitXor,
        BinOp::BitOr => OpCode::BitOr,
    }
}

fn relational_opcode(op: RelOp) -> OpCode {
    match op {
        RelOp::Lt => OpCode::Lt,
        RelOp::Le => OpCode::Lte,
        RelOp::Gt => OpCode::Gt,
        RelOp::Ge => OpCode::Gte,
        RelOp::Eq => OpCode::Eq,
        RelOp::Ne => OpCode::Neq,
    }
}

impl<'a> TranslationContext<'a> {
    fn text(&self, span: Span) -> &'a str {
        let input: &'a str = self.input;
        &input[span.start()..span.end()]
    }

    fn error(&self, span: Span, msg: impl Into<String>) -> TranslateError {
        let before = &self.input[..span.start()];
        let line = before.matches('\n').count() + 1;
        let col = span.start() - before.rfind('\n').map(|p| p + 1).unwrap_or(0) + 1;
        TranslateError::Semantic {
            line,
            col,
            msg: msg.into(),
        }
    }

    fn emit(&mut self, taco: Taco) -> usize {
        self.mic.emit(taco)
    }

    fn ty(&self, r: SymbolRef) -> DataType {
        self.mic.type_of(r)
    }

    fn int_const(&mut self, i: i32) -> Result<SymbolRef> {
        self.mic.gen_const(Value::Int(i))
    }

    // ------------------------------------------------------------ declarations

    fn declared_type(&self, spec: TypeSpec, d: &Declarator) -> Result<DataType> {
        if spec == TypeSpec::Matrix && d.pointers > 0 {
            return Err(self.error(d.span, "pointers to matrices are not supported"));
        }
        let mut ty = base_type(spec);
        for _ in 0..d.pointers {
            ty = ty.pointer_to();
        }
        Ok(ty)
    }

    fn params(&self, d: &Declarator) -> Result<Vec<(&'a str, DataType)>> {
        let params = match &d.kind {
            DeclaratorKind::Function(params) => params,
            _ => return Ok(Vec::new()),
        };
        let mut res = Vec::new();
        for p in params {
            let ty = self.declared_type(p.ty, &p.declarator)?;
            match p.declarator.kind {
                DeclaratorKind::Plain => {}
                DeclaratorKind::Matrix(..) => {
                    return Err(self.error(p.span, "matrix parameters cannot have dimensions"))
                }
                DeclaratorKind::Function(_) => {
                    return Err(self.error(p.span, "function parameters are not supported"))
                }
            }
            if ty.is_void() {
                return Err(self.error(p.span, "parameter declared void"));
            }
            res.push((self.text(p.declarator.name), ty));
        }
        Ok(res)
    }

    /// Enters the scope of function `name`, creating it on first sight. A later
    /// declaration must agree with the first one on every parameter.
    fn declare_function(&mut self, spec: TypeSpec, d: &Declarator, defining: bool) -> Result<TableId> {
        let name = self.text(d.name);
        let ret = self.declared_type(spec, d)?;
        let params = self.params(d)?;

        // seen before: a prototype, or a definition being redeclared.
        if let Ok(r) = self.mic.lookup(&format!("::{}", name)) {
            let sym = self.mic.symbol(r);
            let t = match (sym.ty.is_function(), sym.child) {
                (true, Some(t)) => t,
                _ => {
                    return Err(self.error(d.span, format!("`{}` redeclared as a function", name)))
                }
            };
            let table = self.mic.table(t);
            if table.is_defined && defining {
                return Err(self.error(d.span, format!("redefinition of `{}`", name)));
            }
            let old_ret = table.retval().map(|s| s.ty).unwrap_or(DataType::VOID);
            let old: Vec<(&str, DataType)> =
                table.params().map(|s| (s.short_name(), s.ty)).collect();
            if old_ret != ret
                || old.len() != params.len()
                || old.iter().zip(&params).any(|(a, b)| a.1 != b.1)
            {
                return Err(self.error(d.span, format!("conflicting types for `{}`", name)));
            }
            if old.iter().zip(&params).any(|(a, b)| a.0 != b.0) {
                return Err(self.error(
                    d.span,
                    format!("parameter names of `{}` differ from its prototype", name),
                ));
            }
            if defining {
                self.mic.table_mut(t).is_defined = true;
            }
            self.mic.push_environment(t);
            return Ok(t);
        }

        // the return slot comes first so params keep their declared order after it.
        let f = self.mic.create_symbol(name, DataType::FUNCTION, SymbolKind::Local)?;
        let t = self.mic.new_environment(name);
        self.mic.symbol_mut(f).child = Some(t);
        self.mic.table_mut(t).is_defined = defining;
        self.mic.create_symbol("#ret", ret, SymbolKind::RetVal)?;
        for (p, ty) in params {
            self.mic.create_symbol(p, ty, SymbolKind::Param)?;
        }
        Ok(t)
    }

    fn function_definition(&mut self, f: &FunctionDef) -> Result<()> {
        if !matches!(f.declarator.kind, DeclaratorKind::Function(_)) {
            return Err(self.error(f.declarator.span, "expected a function declarator"));
        }
        let name = self.text(f.declarator.name);
        let t = self.declare_function(f.ty, &f.declarator, true)?;
        self.return_type = self
            .mic
            .table(t)
            .retval()
            .map(|s| s.ty)
            .unwrap_or(DataType::VOID);

        let start = self.emit(Taco::new(
            OpCode::FuncStart,
            Operand::Name(name.to_string()),
            Operand::None,
            Operand::None,
        ));
        for item in &f.body {
            self.block_item(item)?;
        }
        let end = self.emit(Taco::new(
            OpCode::FuncEnd,
            Operand::Name(name.to_string()),
            Operand::None,
            Operand::None,
        ));
        debug!(function = name, start, end, "translated function");
        self.mic.pop_environment()
    }

    fn global_declaration(&mut self, d: &Declaration) -> Result<()> {
        for init in &d.declarators {
            let decl = &init.declarator;
            if let DeclaratorKind::Function(_) = decl.kind {
                if init.init.is_some() {
                    return Err(self.error(decl.span, "functions cannot be initialized"));
                }
                // a prototype only opens its scope long enough to record params.
                self.declare_function(d.ty, decl, false)?;
                self.mic.pop_environment()?;
                continue;
            }

            let ty = self.variable_type(d.ty, decl)?;
            if let DeclaratorKind::Matrix(..) = decl.kind {
                if !ty.is_static_matrix() {
                    return Err(self.error(decl.span, "global matrices need constant dimensions"));
                }
            }
            let name = self.text(decl.name);
            let g = self.mic.create_symbol(name, ty, SymbolKind::Local)?;
            if let Some((rows, cols)) = ty.dims() {
                self.matrix_header(g, rows, cols)?;
            }
            match &init.init {
                None => {}
                // globals are serialised from these stores, so every element must fold.
                Some(Initializer::Matrix(rows, span)) => {
                    self.check_shape(ty, rows, *span)?;
                    for (offset, e) in self.element_offsets(ty, rows) {
                        let v = self.fold(e).and_then(|v| v.convert(&DataType::DOUBLE));
                        let v = match v {
                            Some(v) => self.mic.gen_const(v)?,
                            None => {
                                return Err(self.error(e.span(), "initializer element is not constant"))
                            }
                        };
                        self.emit(Taco::binary(OpCode::Lxc, g, Operand::Literal(offset), v));
                    }
                }
                Some(Initializer::Expr(e)) => {
                    if !ty.is_scalar() {
                        return Err(self.error(e.span(), "only scalars take a constant initializer"));
                    }
                    match self.fold(e).and_then(|v| v.convert(&ty)) {
                        Some(v) => self.mic.symbol_mut(g).value = Some(v),
                        None => return Err(self.error(e.span(), "initializer is not constant")),
                    }
                }
            }
            // marks where this global's initializer stores end.
            self.emit(Taco::new(
                OpCode::Declare,
                Operand::Symbol(g),
                Operand::None,
                Operand::None,
            ));
        }
        Ok(())
    }

    /// Type of a variable declarator; matrices with constant dimensions are static.
    fn variable_type(&self, spec: TypeSpec, d: &Declarator) -> Result<DataType> {
        let ty = self.declared_type(spec, d)?;
        if ty.is_void() {
            return Err(self.error(
                d.span,
                format!("variable `{}` declared void", self.text(d.name)),
            ));
        }
        match &d.kind {
            DeclaratorKind::Matrix(rows, cols) => {
                if !ty.is_matrix() {
                    return Err(self.error(d.span, "only Matrix variables take dimensions"));
                }
                match (self.fold(rows), self.fold(cols)) {
                    (Some(Value::Int(r)), Some(Value::Int(c))) if r > 0 && c > 0 => {
                        DataType::checked_matrix(r as u32, c as u32).ok_or_else(|| {
                            self.error(
                                d.span,
                                format!(
                                    "matrix `{}` is too large: {} x {} doubles exceed {} bytes",
                                    self.text(d.name),
                                    r,
                                    c,
                                    MAX_OBJECT_SIZE
                                ),
                            )
                        })
                    }
                    (Some(Value::Int(_)), Some(Value::Int(_))) => {
                        Err(self.error(d.span, "matrix dimensions must be positive"))
                    }
                    _ => Ok(DataType::DYNAMIC_MATRIX),
                }
            }
            _ => Ok(ty),
        }
    }

    fn check_shape(&self, ty: DataType, rows: &[Vec<Expr>], span: Span) -> Result<()> {
        match ty.dims() {
            Some((r, c))
                if rows.len() == r as usize && rows.iter().all(|row| row.len() == c as usize) =>
            {
                Ok(())
            }
            Some((r, c)) => Err(self.error(
                span,
                format!("initializer does not match a {}x{} matrix", r, c),
            )),
            None => Err(self.error(span, "only matrices with constant dimensions take an initializer list")),
        }
    }

    /// Byte offset of every initializer element, row major past the header.
    fn element_offsets<'e>(&self, ty: DataType, rows: &'e [Vec<Expr>]) -> Vec<(i64, &'e Expr)> {
        let cols = ty.dims().map(|(_, c)| c as i64).unwrap_or(0);
        rows.iter()
            .enumerate()
            .flat_map(|(i, row)| {
                row.iter().enumerate().map(move |(j, e)| {
                    let k = i as i64 * cols + j as i64;
                    (k * ELEMENT_SIZE as i64 + MATRIX_HEADER as i64, e)
                })
            })
            .collect()
    }

    fn matrix_header(&mut self, m: SymbolRef, rows: u32, cols: u32) -> Result<()> {
        let r = self.int_const(rows as i32)?;
        let c = self.int_const(cols as i32)?;
        self.emit(Taco::binary(OpCode::Lxc, m, Operand::Literal(0), r));
        self.emit(Taco::binary(OpCode::Lxc, m, Operand::Literal(4), c));
        Ok(())
    }

    fn local_declaration(&mut self, d: &Declaration) -> Result<()> {
        for init in &d.declarators {
            let decl = &init.declarator;
            if let DeclaratorKind::Function(_) = decl.kind {
                return Err(self.error(decl.span, "functions cannot be declared inside a function"));
            }
            let ty = self.variable_type(d.ty, decl)?;
            let name = self.text(decl.name);
            let v = self.mic.create_symbol(name, ty, SymbolKind::Local)?;
            if let Some((rows, cols)) = ty.dims() {
                self.matrix_header(v, rows, cols)?;
            } else if let DeclaratorKind::Matrix(rows, cols) = &decl.kind {
                // run time dimensions. The Dealloc frees the last block when the
                // declaration sits in a loop.
                let r = self.expr(rows)?;
                let r = self.int_value(r, rows.span())?;
                let c = self.expr(cols)?;
                let c = self.int_value(c, cols.span())?;
                self.emit(Taco::new(OpCode::Dealloc, Operand::Symbol(v), Operand::None, Operand::None));
                self.emit(Taco::binary(OpCode::Alloc, v, r, c));
            }
            match &init.init {
                None => {}
                Some(Initializer::Matrix(rows, span)) => {
                    self.check_shape(ty, rows, *span)?;
                    for (offset, e) in self.element_offsets(ty, rows) {
                        let x = self.expr(e)?;
                        let x = self.value_of(x, e.span())?;
                        let x = self.convert(x, DataType::DOUBLE, e.span())?;
                        self.emit(Taco::binary(OpCode::Lxc, v, Operand::Literal(offset), x));
                    }
                }
                Some(Initializer::Expr(e)) => {
                    let rhs = self.expr(e)?;
                    self.assign(Expression::simple_reference(v), rhs, decl.span)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------ statements

    fn block_item(&mut self, item: &BlockItem) -> Result<()> {
        match item {
            BlockItem::Declaration(d) => self.local_declaration(d),
            BlockItem::Statement(s) => self.stmt(s),
        }
    }

    fn stmt(&mut self, s: &Stmt) -> Result<()> {
        match s {
            Stmt::Compound(items) => {
                for item in items {
                    self.block_item(item)?;
                }
                Ok(())
            }
            Stmt::Expr(None) => Ok(()),
            Stmt::Expr(Some(e)) => {
                let res = self.expr(e)?;
                self.discard(res)
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                // true jumps land on the then branch, false ones after it or on the
                // else branch, which the then branch skips with a goto.
                let (t, f) = self.condition(cond)?;
                let here = self.mic.next_instruction();
                self.mic.patch_back_list(&t, here)?;
                self.stmt(then)?;
                match otherwise {
                    None => {
                        let here = self.mic.next_instruction();
                        self.mic.patch_back_list(&f, here)?;
                    }
                    Some(otherwise) => {
                        let skip = self.emit(Taco::goto());
                        let here = self.mic.next_instruction();
                        self.mic.patch_back_list(&f, here)?;
                        self.stmt(otherwise)?;
                        let here = self.mic.next_instruction();
                        self.mic.patch_back(skip, here)?;
                    }
                }
                Ok(())
            }
            // the condition is re-evaluated at `top` on every pass.
            Stmt::While { cond, body } => {
                let top = self.mic.next_instruction();
                let (t, f) = self.condition(cond)?;
                let here = self.mic.next_instruction();
                self.mic.patch_back_list(&t, here)?;
                self.stmt(body)?;
                let back = self.emit(Taco::goto());
                self.mic.patch_back(back, top)?;
                let here = self.mic.next_instruction();
                self.mic.patch_back_list(&f, here)
            }
            Stmt::DoWhile { body, cond } => {
                let top = self.mic.next_instruction();
                self.stmt(body)?;
                // true goes straight back to the body.
                let (t, f) = self.condition(cond)?;
                self.mic.patch_back_list(&t, top)?;
                let here = self.mic.next_instruction();
                self.mic.patch_back_list(&f, here)
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    let res = self.expr(init)?;
                    self.discard(res)?;
                }
                let top = self.mic.next_instruction();
                let exits = match cond {
                    Some(cond) => {
                        let (t, f) = self.condition(cond)?;
                        let here = self.mic.next_instruction();
                        self.mic.patch_back_list(&t, here)?;
                        f
                    }
                    // no condition loops until a return.
                    None => AddressList::new(),
                };
                self.stmt(body)?;
                if let Some(step) = step {
                    let res = self.expr(step)?;
                    self.discard(res)?;
                }
                let back = self.emit(Taco::goto());
                self.mic.patch_back(back, top)?;
                let here = self.mic.next_instruction();
                self.mic.patch_back_list(&exits, here)
            }
            Stmt::Return(None, span) => {
                if !self.return_type.is_void() {
                    return Err(self.error(*span, "return without a value in a non void function"));
                }
                self.emit(Taco::new(OpCode::Return, Operand::None, Operand::None, Operand::None));
                Ok(())
            }
            Stmt::Return(Some(e), span) => {
                if self.return_type.is_void() {
                    return Err(self.error(*span, "return with a value in a void function"));
                }
                let v = self.expr(e)?;
                let v = self.value_of(v, e.span())?;
                let v = self.convert(v, self.return_type, e.span())?;
                self.emit(Taco::new(OpCode::Return, Operand::Symbol(v), Operand::None, Operand::None));
                Ok(())
            }
        }
    }

    /// Drops the result of an expression statement; pending jumps fall through.
    fn discard(&mut self, e: Expression) -> Result<()> {
        if e.is_boolean {
            let here = self.mic.next_instruction();
            self.mic.patch_back_list(&e.true_list, here)?;
            self.mic.patch_back_list(&e.false_list, here)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------ values

    /// Loads whatever `e` denotes into a symbol usable as an operand.
    fn value_of(&mut self, e: Expression, span: Span) -> Result<SymbolRef> {
        // a jump list becomes 1 or 0 in a temp: t = 1; goto done; t = 0; done:
        if e.is_boolean {
            let t = self.mic.gen_temp(DataType::INT)?;
            let one = self.int_const(1)?;
            let zero = self.int_const(0)?;
            let here = self.mic.next_instruction();
            self.mic.patch_back_list(&e.true_list, here)?;
            self.emit(Taco::unary(OpCode::Copy, t, one));
            let skip = self.emit(Taco::goto());
            let here = self.mic.next_instruction();
            self.mic.patch_back_list(&e.false_list, here)?;
            self.emit(Taco::unary(OpCode::Copy, t, zero));
            let here = self.mic.next_instruction();
            self.mic.patch_back(skip, here)?;
            return Ok(t);
        }
        if self.mic.is_matrix_reference(&e) {
            let (m, offset) = match (e.symbol, e.aux_symbol) {
                (Some(m), Some(o)) => (m, o),
                _ => return Err(self.error(span, "malformed matrix element")),
            };
            // t = m[offset], offset in bytes.
            let t = self.mic.gen_temp(DataType::DOUBLE)?;
            self.emit(Taco::binary(OpCode::Rxc, t, m, offset));
            return Ok(t);
        }
        if self.mic.is_pointer_reference(&e) {
            let (t, p) = match (e.symbol, e.aux_symbol) {
                (Some(t), Some(p)) => (t, p),
                _ => return Err(self.error(span, "malformed dereference")),
            };
            self.emit(Taco::unary(OpCode::RDeref, t, p));
            return Ok(t);
        }
        e.symbol
            .ok_or_else(|| self.error(span, "void value not ignored as it ought to be"))
    }

    fn int_value(&mut self, e: Expression, span: Span) -> Result<SymbolRef> {
        let v = self.value_of(e, span)?;
        if !self.ty(v).is_integral() {
            return Err(self.error(span, format!("expected an integer but got {}", self.ty(v))));
        }
        self.convert(v, DataType::INT, span)
    }

    /// Coerces `s` to `to`, folding constants and emitting a conversion otherwise.
    fn convert(&mut self, s: SymbolRef, to: DataType, span: Span) -> Result<SymbolRef> {
        let from = self.ty(s);
        if from == to || (from.is_matrix() && to.is_matrix()) {
            return Ok(s);
        }
        let op = match to {
            t if t.is_double() => OpCode::ConvToDouble,
            t if t.is_int() => OpCode::ConvToInt,
            t if t.is_char() => OpCode::ConvToChar,
            _ => return Err(self.error(span, format!("cannot convert {} to {}", from, to))),
        };
        if !(from.is_scalar() || from.is_bool()) {
            return Err(self.error(span, format!("cannot convert {} to {}", from, to)));
        }
        // constants convert at compile time.
        if let Some(c) = self.mic.const_value(s).and_then(|v| v.convert(&to)) {
            return self.mic.gen_const(c);
        }
        let t = self.mic.gen_temp(to)?;
        self.emit(Taco::unary(op, t, s));
        Ok(t)
    }

    /// Jump lists for using `e` as a condition.
    fn condition(&mut self, e: &Expr) -> Result<(AddressList, AddressList)> {
        let res = self.expr(e)?;
        self.as_condition(res, e.span())
    }

    fn as_condition(&mut self, res: Expression, span: Span) -> Result<(AddressList, AddressList)> {
        if res.is_boolean {
            return Ok((res.true_list, res.false_list));
        }
        let v = self.value_of(res, span)?;
        if self.ty(v).is_matrix() {
            return Err(self.error(span, "a matrix cannot be used as a condition"));
        }
        // `if v goto _; goto _`, both left for the caller to patch.
        let t = self.emit(Taco::branch(OpCode::IfVal, v, None));
        let f = self.emit(Taco::goto());
        Ok((vec![t], vec![f]))
    }

    /// Makes a matrix temporary for a result shaped after its operands. Static
    /// shapes get a header; dynamic ones free the last value and allocate.
    fn matrix_temp(&mut self, shape: Shape) -> Result<SymbolRef> {
        let static_ty = match shape {
            Shape::Like(x) => self.ty(x).dims(),
            Shape::Product(x, y) => match (self.ty(x).dims(), self.ty(y).dims()) {
                (Some((r, k1)), Some((k2, c))) if k1 == k2 => Some((r, c)),
                _ => None,
            },
            Shape::Transposed(x) => self.ty(x).dims().map(|(r, c)| (c, r)),
        };
        // a product of two static operands can still be too large to keep static.
        let static_ty = static_ty.and_then(|(r, c)| Some((r, c, DataType::checked_matrix(r, c)?)));
        if let Some((r, c, ty)) = static_ty {
            let t = self.mic.gen_temp(ty)?;
            self.matrix_header(t, r, c)?;
            return Ok(t);
        }
        let t = self.mic.gen_temp(DataType::DYNAMIC_MATRIX)?;
        self.emit(Taco::new(OpCode::Dealloc, Operand::Symbol(t), Operand::None, Operand::None));
        let alloc = match shape {
            Shape::Like(x) => Taco::binary(OpCode::Alloc, t, x, Operand::None),
            Shape::Product(x, y) => Taco::binary(OpCode::Alloc, t, x, y),
            Shape::Transposed(x) => Taco::binary(OpCode::Alloc, t, Operand::None, x),
        };
        self.emit(alloc);
        Ok(t)
    }

    // ------------------------------------------------------------ expressions

    fn fold(&self, e: &Expr) -> Option<Value> {
        match e {
            Expr::IntLit(s) => self.text(*s).parse::<i32>().ok().map(Value::Int),
            Expr::FloatLit(s) => self.text(*s).parse::<f64>().ok().map(Value::Double),
            Expr::CharLit(s) => unescape_char(self.text(*s)).map(Value::Char),
            Expr::Unary {
                op: UnaryOp::Minus,
                operand,
                ..
            } => match self.fold(operand)? {
                Value::Int(i) => Some(Value::Int(i.wrapping_neg())),
                Value::Double(d) => Some(Value::Double(-d)),
                Value::Char(c) => Some(Value::Char((c as i8).wrapping_neg() as u8)),
                Value::Str(_) => None,
            },
            Expr::Unary {
                op: UnaryOp::Plus,
                operand,
                ..
            } => self.fold(operand).filter(|v| !matches!(v, Value::Str(_))),
            Expr::Binary {
                op, left, right, ..
            } => fold_binary(*op, self.fold(left)?, self.fold(right)?),
            _ => None,
        }
    }

    fn expr(&mut self, e: &Expr) -> Result<Expression> {
        // constant subtrees never reach the quads.
        if let Some(v) = self.fold(e) {
            return Ok(Expression::value(self.mic.gen_const(v)?));
        }
        match e {
            Expr::IntLit(s) | Expr::FloatLit(s) | Expr::CharLit(s) => Err(self.error(
                *s,
                format!("invalid literal {}", self.text(*s)),
            )),
            Expr::StringLit(s) => {
                let literal = self.text(*s);
                let idx = self.mic.add_string(literal);
                Ok(Expression::value(self.mic.gen_const(Value::Str(idx))?))
            }
            Expr::Id(s) => {
                let r = self.mic.resolve(self.text(*s))?;
                if self.ty(r).is_function() {
                    return Err(self.error(*s, format!("function `{}` used as a value", self.text(*s))));
                }
                Ok(Expression::simple_reference(r))
            }
            Expr::Binary {
                op,
                left,
                right,
                span,
            } => self.binary(*op, left, right, *span),
            Expr::Relational {
                op,
                left,
                right,
                span,
            } => {
                let l = self.expr(left)?;
                let l = self.value_of(l, left.span())?;
                let r = self.expr(right)?;
                let r = self.value_of(r, right.span())?;
                let (lt, rt) = (self.ty(l), self.ty(r));
                let (l, r) = if lt.is_pointer() || rt.is_pointer() {
                    if lt != rt {
                        return Err(self.error(*span, format!("cannot compare {} with {}", lt, rt)));
                    }
                    (l, r)
                } else {
                    let ty = DataType::max_type(lt, rt);
                    if ty.is_void() {
                        return Err(self.error(*span, format!("cannot compare {} with {}", lt, rt)));
                    }
                    (self.convert(l, ty, *span)?, self.convert(r, ty, *span)?)
                };
                let t = self.emit(Taco::branch(relational_opcode(*op), l, Some(r)));
                let f = self.emit(Taco::goto());
                Ok(Expression::boolean(vec![t], vec![f]))
            }
            Expr::Logical {
                op,
                left,
                right,
                ..
            } => {
                let (lt, lf) = self.condition(left)?;
                let here = self.mic.next_instruction();
                match op {
                    // short circuit: only a true left side falls into the right one.
                    LogicalOp::And => {
                        self.mic.patch_back_list(&lt, here)?;
                        let (rt, rf) = self.condition(right)?;
                        Ok(Expression::boolean(rt, merge(lf, rf)))
                    }
                    LogicalOp::Or => {
                        self.mic.patch_back_list(&lf, here)?;
                        let (rt, rf) = self.condition(right)?;
                        Ok(Expression::boolean(merge(lt, rt), rf))
                    }
                }
            }
            Expr::Unary { op, operand, span } => self.unary(*op, operand, *span),
            Expr::Assign {
                target,
                value,
                span,
            } => {
                let lhs = self.expr(target)?;
                let rhs = self.expr(value)?;
                self.assign(lhs, rhs, *span)
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
                span,
            } => {
                let (t, f) = self.condition(cond)?;
                let here = self.mic.next_instruction();
                self.mic.patch_back_list(&t, here)?;
                let a = self.expr(then)?;
                let a = self.value_of(a, then.span())?;
                let ty = self.ty(a);
                if ty.is_matrix() {
                    return Err(self.error(*span, "conditional expressions cannot yield matrices"));
                }
                // both branches copy into one temp typed after the then branch.
                let res = self.mic.gen_temp(ty)?;
                self.emit(Taco::unary(OpCode::Copy, res, a));
                let skip = self.emit(Taco::goto());
                let here = self.mic.next_instruction();
                self.mic.patch_back_list(&f, here)?;
                let b = self.expr(otherwise)?;
                let b = self.value_of(b, otherwise.span())?;
                let b = self.convert(b, ty, otherwise.span())?;
                self.emit(Taco::unary(OpCode::Copy, res, b));
                let here = self.mic.next_instruction();
                self.mic.patch_back(skip, here)?;
                Ok(Expression::value(res))
            }
            Expr::Index {
                matrix,
                row,
                col,
                span,
            } => self.index(matrix, row, col, *span),
            Expr::Call { name, args, span } => self.call(*name, args, *span),
            Expr::IncDec {
                increment,
                prefix,
                operand,
                span,
            } => self.inc_dec(*increment, *prefix, operand, *span),
            Expr::Transpose { operand, span } => {
                let x = self.expr(operand)?;
                let x = self.value_of(x, operand.span())?;
                if !self.ty(x).is_matrix() {
                    return Err(self.error(*span, "only matrices can be transposed"));
                }
                let t = self.matrix_temp(Shape::Transposed(x))?;
                self.emit(Taco::unary(OpCode::Transpose, t, x));
                Ok(Expression::value(t))
            }
        }
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr, span: Span) -> Result<Expression> {
        let l = self.expr(left)?;
        let l = self.value_of(l, left.span())?;
        let r = self.expr(right)?;
        let r = self.value_of(r, right.span())?;
        let (lt, rt) = (self.ty(l), self.ty(r));

        if lt.is_matrix() || rt.is_matrix() {
            return self.matrix_binary(op, l, r, span);
        }

        if lt.is_pointer() || rt.is_pointer() {
            let (p, n) = match (op, lt.is_pointer(), rt.is_pointer()) {
                (BinOp::Plus, true, false) | (BinOp::Minus, true, false) => (l, r),
                (BinOp::Plus, false, true) => (r, l),
                _ => return Err(self.error(span, format!("invalid operands {} and {} to {}", lt, rt, op))),
            };
            // the integer is scaled to bytes by the pointee size.
            let pty = self.ty(p);
            let size = pty.pointee().map(|t| t.size()).unwrap_or(1).max(1) as i32;
            let n = self.int_value(Expression::value(n), span)?;
            let offset = match self.mic.const_value(n) {
                Some(Value::Int(i)) => self.int_const(i.wrapping_mul(size))?,
                _ => {
                    let scale = self.int_const(size)?;
                    let t = self.mic.gen_temp(DataType::INT)?;
                    self.emit(Taco::binary(OpCode::Mult, t, n, scale));
                    t
                }
            };
            let t = self.mic.gen_temp(pty)?;
            let opc = if op == BinOp::Minus { OpCode::Minus } else { OpCode::Plus };
            self.emit(Taco::binary(opc, t, p, offset));
            return Ok(Expression::value(t));
        }

        let integral_only = !matches!(op, BinOp::Plus | BinOp::Minus | BinOp::Times | BinOp::Divide);
        let ty = if integral_only {
            if !(lt.is_integral() && rt.is_integral()) {
                return Err(self.error(span, format!("invalid operands {} and {} to {}", lt, rt, op)));
            }
            DataType::INT
        } else {
            DataType::max_type(lt, rt)
        };
        if !ty.is_scalar() {
            return Err(self.error(span, format!("invalid operands {} and {} to {}", lt, rt, op)));
        }
        let l = self.convert(l, ty, left.span())?;
        let r = self.convert(r, ty, right.span())?;
        let t = self.mic.gen_temp(ty)?;
        self.emit(Taco::binary(binary_opcode(op), t, l, r));
        Ok(Expression::value(t))
    }

    fn matrix_binary(&mut self, op: BinOp, l: SymbolRef, r: SymbolRef, span: Span) -> Result<Expression> {
        let (lt, rt) = (self.ty(l), self.ty(r));
        let scalar = |t: DataType| t.is_scalar() || t.is_bool();
        let (t, opc, x, y) = match op {
            BinOp::Plus | BinOp::Minus if lt.is_matrix() && rt.is_matrix() => {
                (self.matrix_temp(Shape::Like(l))?, binary_opcode(op), l, r)
            }
            BinOp::Times if lt.is_matrix() && rt.is_matrix() => {
                (self.matrix_temp(Shape::Product(l, r))?, OpCode::Mult, l, r)
            }
            BinOp::Times | BinOp::Divide if lt.is_matrix() && scalar(rt) => {
                let s = self.convert(r, DataType::DOUBLE, span)?;
                (self.matrix_temp(Shape::Like(l))?, binary_opcode(op), l, s)
            }
            // s * M is lowered as M * s.
            BinOp::Times if scalar(lt) && rt.is_matrix() => {
                let s = self.convert(l, DataType::DOUBLE, span)?;
                (self.matrix_temp(Shape::Like(r))?, OpCode::Mult, r, s)
            }
            _ => return Err(self.error(span, format!("invalid operands {} and {} to {}", lt, rt, op))),
        };
        self.emit(Taco::binary(opc, t, x, y));
        Ok(Expression::value(t))
    }

    fn unary(&mut self, op: UnaryOp, operand: &Expr, span: Span) -> Result<Expression> {
        let e = self.expr(operand)?;
        match op {
            // negation just swaps the jump lists.
            UnaryOp::Not => {
                let (t, f) = self.as_condition(e, operand.span())?;
                Ok(Expression::boolean(f, t))
            }
            UnaryOp::AddressOf => {
                if self.mic.is_pointer_reference(&e) {
                    return match e.aux_symbol {
                        Some(p) => Ok(Expression::value(p)),
                        None => Err(self.error(span, "malformed dereference")),
                    };
                }
                if self.mic.is_matrix_reference(&e) {
                    let (m, offset) = match (e.symbol, e.aux_symbol) {
                        (Some(m), Some(o)) => (m, o),
                        _ => return Err(self.error(span, "malformed matrix element")),
                    };
                    let t = self.mic.gen_temp(DataType::DOUBLE.pointer_to())?;
                    self.emit(Taco::binary(OpCode::Plus, t, m, offset));
                    return Ok(Expression::value(t));
                }
                match e.symbol {
                    Some(x) if self.mic.is_simple_reference(&e) => {
                        if self.ty(x).is_matrix() {
                            return Err(self.error(span, "pointers to matrices are not supported"));
                        }
                        let pty = self.ty(x).pointer_to();
                        let t = self.mic.gen_temp(pty)?;
                        self.emit(Taco::unary(OpCode::Refer, t, x));
                        Ok(Expression::value(t))
                    }
                    _ => Err(self.error(span, "lvalue required as unary `&` operand")),
                }
            }
            UnaryOp::Deref => {
                let p = self.value_of(e, operand.span())?;
                let pointee = match self.ty(p).pointee() {
                    Some(t) if !t.is_void() => t,
                    _ => {
                        return Err(self.error(span, format!("cannot dereference {}", self.ty(p))))
                    }
                };
                // nothing is loaded until the reference is used as a value.
                let t = self.mic.gen_temp(pointee)?;
                Ok(Expression::pointer_reference(t, p))
            }
            UnaryOp::Plus => {
                let x = self.value_of(e, operand.span())?;
                Ok(Expression::value(x))
            }
            UnaryOp::Minus => {
                let x = self.value_of(e, operand.span())?;
                let ty = self.ty(x);
                let t = if ty.is_matrix() {
                    self.matrix_temp(Shape::Like(x))?
                } else if ty.is_scalar() {
                    self.mic.gen_temp(ty)?
                } else {
                    return Err(self.error(span, format!("cannot negate {}", ty)));
                };
                self.emit(Taco::unary(OpCode::UMinus, t, x));
                Ok(Expression::value(t))
            }
            UnaryOp::BitNot => {
                let x = self.int_value(e, operand.span())?;
                let t = self.mic.gen_temp(DataType::INT)?;
                self.emit(Taco::unary(OpCode::BitNot, t, x));
                Ok(Expression::value(t))
            }
        }
    }

    /// Stores `v` through the reference `target`. Matrices are handled by `assign`.
    fn store(&mut self, target: &Expression, v: SymbolRef, span: Span) -> Result<SymbolRef> {
        let (sym, aux) = match (target.symbol, target.aux_symbol) {
            (Some(s), Some(a)) => (s, a),
            _ => return Err(self.error(span, "lvalue required as left operand of assignment")),
        };
        if self.mic.is_matrix_reference(target) {
            let v = self.convert(v, DataType::DOUBLE, span)?;
            self.emit(Taco::binary(OpCode::Lxc, sym, aux, v));
            return Ok(v);
        }
        if self.mic.is_pointer_reference(target) {
            let v = self.convert(v, self.ty(sym), span)?;
            self.emit(Taco::unary(OpCode::LDeref, aux, v));
            return Ok(v);
        }
        let ty = self.ty(sym);
        let v = if ty.is_pointer() {
            if self.ty(v) != ty {
                return Err(self.error(span, format!("cannot assign {} to {}", self.ty(v), ty)));
            }
            v
        } else {
            self.convert(v, ty, span)?
        };
        self.emit(Taco::unary(OpCode::Copy, sym, v));
        Ok(sym)
    }

    fn assign(&mut self, lhs: Expression, rhs: Expression, span: Span) -> Result<Expression> {
        if !lhs.is_reference {
            return Err(self.error(span, "lvalue required as left operand of assignment"));
        }
        let target = match lhs.symbol {
            Some(s) if self.mic.is_simple_reference(&lhs) && self.ty(s).is_matrix() => s,
            _ => {
                let v = self.value_of(rhs, span)?;
                let stored = self.store(&lhs, v, span)?;
                return Ok(Expression::value(stored));
            }
        };

        let src = self.value_of(rhs, span)?;
        if !self.ty(src).is_matrix() {
            return Err(self.error(span, format!("cannot assign {} to a matrix", self.ty(src))));
        }
        // an owned dynamic target is reshaped after the source before the copy.
        // Parameters belong to the caller and static targets have a fixed shape,
        // so both are copied in place and the run time shape check applies.
        let owned = self.ty(target).is_dynamic_matrix()
            && self.mic.symbol(target).kind != SymbolKind::Param;
        if owned {
            if src == target {
                return Ok(Expression::value(target));
            }
            self.emit(Taco::new(OpCode::Dealloc, Operand::Symbol(target), Operand::None, Operand::None));
            self.emit(Taco::binary(OpCode::Alloc, target, src, Operand::None));
        }
        self.emit(Taco::unary(OpCode::Copy, target, src));
        Ok(Expression::value(target))
    }

    fn index(&mut self, matrix: &Expr, row: &Expr, col: &Expr, span: Span) -> Result<Expression> {
        let m = self.expr(matrix)?;
        if !self.mic.is_matrix_operand(&m) {
            return Err(self.error(span, "only matrices can be indexed"));
        }
        let m = self.value_of(m, matrix.span())?;
        let mty = self.ty(m);

        if let (Some((rows, cols)), Some(Value::Int(i)), Some(Value::Int(j))) =
            (mty.dims(), self.fold(row), self.fold(col))
        {
            if i < 0 || j < 0 || (i as u32) >= rows || (j as u32) >= cols {
                return Err(self.error(span, format!("index [{}][{}] out of range for {}", i, j, mty)));
            }
            // ((i * cols) + j) * 8 + 8, done wide so a huge matrix cannot wrap it.
            let off = (i64::from(i) * i64::from(cols) + i64::from(j)) * i64::from(ELEMENT_SIZE)
                + i64::from(MATRIX_HEADER);
            let off = i32::try_from(off).map_err(|_| {
                self.error(span, format!("index [{}][{}] is too far into {}", i, j, mty))
            })?;
            let off = self.int_const(off)?;
            return Ok(Expression::matrix_reference(m, off));
        }

        let i = self.expr(row)?;
        let i = self.int_value(i, row.span())?;
        let j = self.expr(col)?;
        let j = self.int_value(j, col.span())?;
        // off = ((i * cols) + j) * 8 + 8
        let cols = match mty.dims() {
            Some((_, c)) => self.int_const(c as i32)?,
            None => {
                // the column count lives in the second header word.
                let p = self.mic.gen_temp(DataType::INT.pointer_to())?;
                self.emit(Taco::binary(OpCode::Plus, p, m, Operand::Literal(4)));
                let c = self.mic.gen_temp(DataType::INT)?;
                self.emit(Taco::unary(OpCode::RDeref, c, p));
                c
            }
        };
        let size = self.int_const(ELEMENT_SIZE as i32)?;
        let header = self.int_const(MATRIX_HEADER as i32)?;
        let t1 = self.mic.gen_temp(DataType::INT)?;
        self.emit(Taco::binary(OpCode::Mult, t1, i, cols));
        let t2 = self.mic.gen_temp(DataType::INT)?;
        self.emit(Taco::binary(OpCode::Plus, t2, t1, j));
        let t3 = self.mic.gen_temp(DataType::INT)?;
        self.emit(Taco::binary(OpCode::Mult, t3, t2, size));
        let off = self.mic.gen_temp(DataType::INT)?;
        self.emit(Taco::binary(OpCode::Plus, off, t3, header));
        Ok(Expression::matrix_reference(m, off))
    }

    fn call(&mut self, name: Span, args: &[Expr], span: Span) -> Result<Expression> {
        let fname = self.text(name);
        let f = self.mic.lookup(&format!("::{}", fname))?;
        let table = match (self.ty(f).is_function(), self.mic.symbol(f).child) {
            (true, Some(t)) => t,
            _ => return Err(self.error(name, format!("`{}` is not a function", fname))),
        };
        let params: Vec<DataType> = self.mic.table(table).params().map(|s| s.ty).collect();
        let ret = self
            .mic
            .table(table)
            .retval()
            .map(|s| s.ty)
            .unwrap_or(DataType::VOID);
        if params.len() != args.len() {
            return Err(self.error(
                span,
                format!(
                    "`{}` takes {} arguments but {} were given",
                    fname,
                    params.len(),
                    args.len()
                ),
            ));
        }

        // every argument is evaluated before the first param quad, so a call
        // nested in an argument cannot interleave its params with ours.
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            let v = self.expr(a)?;
            values.push((self.value_of(v, a.span())?, a.span()));
        }
        let mut converted = Vec::with_capacity(values.len());
        for ((v, s), pty) in values.into_iter().zip(params) {
            let vty = self.ty(v);
            let v = if pty.is_pointer() || vty.is_pointer() || pty.is_matrix() || vty.is_matrix() {
                if !(vty == pty || (vty.is_matrix() && pty.is_matrix())) {
                    return Err(self.error(s, format!("expected {} but got {}", pty, vty)));
                }
                v
            } else {
                self.convert(v, pty, s)?
            };
            converted.push(v);
        }
        for v in &converted {
            self.emit(Taco::new(OpCode::Param, Operand::Symbol(*v), Operand::None, Operand::None));
        }

        let (result, res) = if ret.is_void() {
            (Operand::None, Expression::void())
        } else {
            // a returned matrix is a fresh heap block owned by the temp.
            let t = if ret.is_matrix() {
                let t = self.mic.gen_temp(DataType::DYNAMIC_MATRIX)?;
                self.emit(Taco::new(OpCode::Dealloc, Operand::Symbol(t), Operand::None, Operand::None));
                t
            } else {
                self.mic.gen_temp(ret)?
            };
            (Operand::Symbol(t), Expression::value(t))
        };
        self.emit(Taco::new(
            OpCode::Call,
            result,
            Operand::Name(fname.to_string()),
            Operand::Literal(converted.len() as i64),
        ));
        Ok(res)
    }

    fn inc_dec(&mut self, increment: bool, prefix: bool, operand: &Expr, span: Span) -> Result<Expression> {
        let target = self.expr(operand)?;
        if !target.is_reference {
            return Err(self.error(span, "lvalue required as increment operand"));
        }
        let mut old = self.value_of(target.clone(), operand.span())?;
        let ty = self.ty(old);
        if !(ty.is_scalar() || ty.is_pointer()) {
            return Err(self.error(span, format!("cannot increment {}", ty)));
        }
        // postfix keeps the old value around; element and pointer targets were
        // already loaded into a fresh temp by value_of.
        if !prefix && self.mic.is_simple_reference(&target) {
            let copy = self.mic.gen_temp(ty)?;
            self.emit(Taco::unary(OpCode::Copy, copy, old));
            old = copy;
        }
        let step = match ty.pointee() {
            Some(p) => Operand::Symbol(self.int_const(p.size().max(1) as i32)?),
            None => Operand::Literal(1),
        };
        let new = self.mic.gen_temp(ty)?;
        let op = if increment { OpCode::Plus } else { OpCode::Minus };
        self.emit(Taco::binary(op, new, old, step));
        let stored = self.store(&target, new, span)?;
        Ok(Expression::value(if prefix { stored } else { old }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse;

    fn translate_str(input: &str) -> Result<Translator> {
        let unit = parse(input)?;
        let mut mic = Translator::new("t.mm");
        translate(input, &unit, &mut mic)?;
        Ok(mic)
    }

    fn ops(mic: &Translator) -> Vec<OpCode> {
        mic.quads.iter().map(|q| q.op).collect()
    }

    fn assert_semantic_error(input: &str, needle: &str) {
        match translate_str(input) {
            Err(TranslateError::Semantic { msg, .. }) => {
                assert!(msg.contains(needle), "{} does not mention {}", msg, needle)
            }
            Err(e) => panic!("expected a semantic error for {}, got {}", input, e),
            Ok(_) => panic!("{} translated but was expected to fail", input),
        }
    }

    #[test]
    fn simple_addition() {
        let mic = translate_str("int main() { int a; int b; int c; c = a + b; }").unwrap();
        assert_eq!(
            vec![OpCode::FuncStart, OpCode::Plus, OpCode::Copy, OpCode::FuncEnd],
            ops(&mic)
        );
        let c = mic.resolve("c");
        assert!(c.is_err(), "function scope must be closed");
        assert_eq!("::main::c", mic.symbol(mic.lookup("::main::c").unwrap()).id);
    }

    #[test]
    fn every_jump_is_patched() {
        let mic = translate_str(
            "int main() { int i; int s; s = 0;
               for (i = 0; i < 10 && s != 7 || !(i == 3); i++) { if (i > 2) s = s + i; else s--; }
               while (s) s = s - 1;
               do { s++; } while (s <= 3);
               return s > 1 ? s : 0; }",
        )
        .unwrap();
        let end = mic.quads.len() - 1;
        for q in mic.quads.iter().filter(|q| q.op.is_jump()) {
            let t = q.target().unwrap();
            assert!(t > 0 && t <= end);
        }
    }

    #[test]
    fn constants_are_folded() {
        let mic = translate_str("int g = 2 * 3 + 1; double d = -1.5; char c = 'a';").unwrap();
        let g = mic.lookup("::g").unwrap();
        assert_eq!(Some(Value::Int(7)), mic.symbol(g).value);
        assert_eq!(Some(Value::Double(-1.5)), mic.symbol(mic.lookup("::d").unwrap()).value);
        assert_eq!(Some(Value::Char(b'a')), mic.symbol(mic.lookup("::c").unwrap()).value);
        assert_eq!(
            vec![OpCode::Declare, OpCode::Declare, OpCode::Declare],
            ops(&mic)
        );
    }

    #[test]
    fn global_matrix_initializer() {
        let mic = translate_str("Matrix A[2][2] = {1, 2; 3, 4.5};").unwrap();
        let lxc: Vec<_> = mic.quads.iter().filter(|q| q.op == OpCode::Lxc).collect();
        assert_eq!(6, lxc.len());
        assert_eq!(Operand::Literal(32), lxc[5].arg1);
        let last = lxc[5].arg2.symbol().unwrap();
        assert_eq!(Some(Value::Double(4.5)), mic.const_value(last));
        assert_eq!(Some(&OpCode::Declare), ops(&mic).last());
    }

    #[test]
    fn constant_element_offset() {
        let mic = translate_str("void f() { Matrix A[2][3]; A[1][2] = 5; }").unwrap();
        let store = mic
            .quads
            .iter()
            .filter(|q| q.op == OpCode::Lxc)
            .last()
            .unwrap();
        let off = store.arg1.symbol().unwrap();
        assert_eq!(Some(Value::Int(48)), mic.const_value(off));
        assert_eq!(Some(Value::Double(5.0)), mic.const_value(store.arg2.symbol().unwrap()));
    }

    #[test]
    fn dynamic_matrix_declaration_allocates() {
        let mic = translate_str("void f(int n) { Matrix A[n][n]; A[0][n - 1] = 1.0; }").unwrap();
        let o = ops(&mic);
        let alloc = o.iter().position(|op| *op == OpCode::Alloc).unwrap();
        assert_eq!(OpCode::Dealloc, o[alloc - 1]);
        // columns come from the runtime header.
        assert!(o.contains(&OpCode::RDeref));
    }

    #[test]
    fn matrix_assignment_reallocates_owned_targets() {
        let mic = translate_str(
            "Matrix f(Matrix m) { Matrix B; B = m.'; m = B; return B; }",
        )
        .unwrap();
        let o = ops(&mic);
        let transpose = o.iter().position(|op| *op == OpCode::Transpose).unwrap();
        assert_eq!(
            vec![OpCode::Dealloc, OpCode::Alloc, OpCode::Copy],
            o[transpose + 1..transpose + 4].to_vec()
        );
        // parameters are copied into, never reallocated.
        assert_eq!(OpCode::Copy, o[transpose + 4]);
        assert_eq!(OpCode::Return, o[transpose + 5]);
    }

    #[test]
    fn call_converts_arguments() {
        let mic = translate_str(
            "double sq(double x); int main() { int a; a = 3; return sq(a) > 2.0; }",
        )
        .unwrap();
        let o = ops(&mic);
        let param = o.iter().position(|op| *op == OpCode::Param).unwrap();
        assert_eq!(OpCode::ConvToDouble, o[param - 1]);
        assert_eq!(OpCode::Call, o[param + 1]);
        let call = &mic.quads.as_slice()[param + 1];
        assert_eq!(Operand::Name("sq".into()), call.arg1);
        assert_eq!(Operand::Literal(1), call.arg2);
    }

    #[test]
    fn pointer_arithmetic_scales() {
        let mic = translate_str("void f() { double *p; double d; p = &d; p = p + 2; d = *p; }").unwrap();
        let plus = mic.quads.iter().find(|q| q.op == OpCode::Plus).unwrap();
        assert_eq!(Some(Value::Int(16)), mic.const_value(plus.arg2.symbol().unwrap()));
        assert!(ops(&mic).contains(&OpCode::Refer));
        assert!(ops(&mic).contains(&OpCode::RDeref));
    }

    #[test]
    fn prototype_then_definition() {
        assert!(translate_str("int f(int a); int f(int a) { return a; }").is_ok());
        assert_semantic_error("int f(int a); int f(int b) { return b; }", "parameter names");
        assert_semantic_error("int f(int a); int f(double a) { return 1; }", "conflicting types");
        assert_semantic_error("int f() { return 1; } int f() { return 2; }", "redefinition");
    }

    #[test]
    fn semantic_errors() {
        assert_semantic_error("void f() { double a; double b; a = a % b; }", "invalid operands");
        assert_semantic_error("void x;", "declared void");
        assert_semantic_error("Matrix *p;", "pointers to matrices");
        assert_semantic_error("void f(Matrix m[2][2]) { }", "cannot have dimensions");
        assert_semantic_error("int f(int a); void g() { f(1, 2); }", "arguments");
        assert_semantic_error("void g() { 3 = 4; }", "lvalue");
        assert_semantic_error("void f() { Matrix A[2][2]; A[2][0] = 1.0; }", "out of range");
    }

    #[test]
    fn oversized_matrices_are_rejected() {
        assert_semantic_error("Matrix A[100000][100000];", "too large");
        assert_semantic_error("void f() { Matrix A[16384][16384]; }", "too large");
        assert!(translate_str("void f() { Matrix A[4096][4096]; A[4095][4095] = 1.0; }").is_ok());
    }

    #[test]
    fn oversized_products_become_dynamic() {
        let mic = translate_str(
            "void f() { Matrix A[50000][1]; Matrix B[1][50000]; Matrix C; C = A * B; }",
        )
        .unwrap();
        // sized from both operands at run time instead of a static temp.
        assert!(mic
            .quads
            .iter()
            .any(|q| q.op == OpCode::Alloc && !q.arg1.is_none() && !q.arg2.is_none()));
    }

    #[test]
    fn errors_carry_positions() {
        match translate_str("int main() {\n  double a;\n  a = a % a;\n}") {
            Err(TranslateError::Semantic { line, col, .. }) => {
                assert_eq!(3, line);
                assert_eq!(7, col);
            }
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn lookup_errors() {
        assert!(matches!(
            translate_str("int main() { return y; }"),
            Err(TranslateError::UndefinedSymbol(n)) if n == "y"
        ));
        assert!(matches!(
            translate_str("int main() { int x; char x; }"),
            Err(TranslateError::DuplicateSymbol(n)) if n == "::main::x"
        ));
    }
}
