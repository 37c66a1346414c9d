use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::Write,
};

use tracing::debug;

use crate::{
    assem::{Codegen, Location, Mode},
    errors::{Result, TranslateError},
    frame::{
        x86_64::{xmm, ActivationRecord, ArgReg, Reg, Width, ARG_REGS, NUM_INT_ARG_REGS, NUM_SSE_ARG_REGS},
        Access, ArgClass,
    },
    ir::{OpCode, Operand, Taco},
    symtab::{SymbolKind, SymbolRef, Value, GLOBAL_TABLE},
    translator::Translator,
    types::DataType,
};

pub struct X86Asm;

impl Codegen for X86Asm {
    fn code_gen(mic: &Translator) -> Result<String> {
        // data first, then one text section per function, then rodata.
        let mut gen = Generator::new(mic);
        gen.run()?;
        Ok(gen.out)
    }
}

// emits one tab indented instruction.
macro_rules! ins {
    ($g:expr, $op:expr) => {
        writeln!($g.out, "\t{}", $op)?
    };
    ($g:expr, $op:expr, $($arg:tt)*) => {
        writeln!($g.out, "\t{}\t{}", $op, format_args!($($arg)*))?
    };
}

fn unsupported(index: usize, msg: impl Into<String>) -> TranslateError {
    TranslateError::Unsupported {
        index,
        msg: msg.into(),
    }
}

/// Argument set up for the call being assembled. The moves are replayed in
/// reverse so the last stack argument is pushed first.
#[derive(Default)]
struct CallSite {
    staged: Vec<String>,
    ints: usize,
    sses: usize,
    stack_bytes: i32,
}

struct Generator<'a> {
    mic: &'a Translator,
    out: String,
    doubles: Vec<f64>,
    double_labels: HashMap<SymbolRef, usize>,
    strings: BTreeSet<usize>,
    next_label: usize,
    call: CallSite,
}

/// Rendered `mov` that brings `loc` into `reg`, using the width of the value.
fn load_insn(loc: &Location, reg: Reg) -> String {
    if loc.mode == Mode::Address || loc.ty.is_static_matrix() {
        return format!("\tleaq\t{}, {}", loc, reg.q());
    }
    let w = Width::of(&loc.ty);
    format!("\tmov{}\t{}, {}", w.suffix(), loc, reg.name(w))
}

/// Like [`load_insn`] but widens chars to 32 bits with sign extension.
fn load_long_insn(loc: &Location, reg: Reg) -> String {
    if loc.ty.is_char() && !loc.is_immediate() {
        format!("\tmovsbl\t{}, {}", loc, reg.l())
    } else if loc.ty.is_char() || loc.ty.is_int() || loc.ty.is_bool() {
        format!("\tmovl\t{}, {}", loc, reg.l())
    } else {
        load_insn(loc, reg)
    }
}

fn double_halves(d: f64) -> (i32, i32) {
    let bits = d.to_bits();
    (bits as u32 as i32, (bits >> 32) as u32 as i32)
}

impl<'a> Generator<'a> {
    fn new(mic: &'a Translator) -> Self {
        Generator {
            mic,
            out: String::new(),
            doubles: Vec::new(),
            double_labels: HashMap::new(),
            strings: BTreeSet::new(),
            next_label: 0,
            call: CallSite::default(),
        }
    }

    fn run(&mut self) -> Result<()> {
        writeln!(self.out, "\t.file\t\"{}\"", self.mic.file)?;
        self.emit_globals()?;
        let mic = self.mic;
        let quads = mic.quads.as_slice();
        let mut i = 0;
        while i < quads.len() {
            if quads[i].op != OpCode::FuncStart {
                i += 1;
                continue;
            }
            let name = match &quads[i].result {
                Operand::Name(n) => n.clone(),
                _ => return Err(unsupported(i, "function start without a name")),
            };
            let end = (i + 1..quads.len())
                .find(|j| quads[*j].op == OpCode::FuncEnd)
                .ok_or_else(|| unsupported(i, format!("function `{}` never ends", name)))?;
            let root = mic
                .function_table(&name)
                .ok_or_else(|| TranslateError::UndefinedSymbol(name.clone()))?;
            self.emit_function(&name, i, end, root)?;
            i = end + 1;
        }
        self.emit_rodata()
    }

    fn fresh_label(&mut self) -> String {
        self.next_label += 1;
        format!(".LT{}", self.next_label)
    }

    fn emit_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.out, "{}", line)?;
        Ok(())
    }

    fn load(&mut self, loc: &Location, reg: Reg) -> Result<()> {
        let line = load_insn(loc, reg);
        self.emit_line(&line)
    }

    fn load_long(&mut self, loc: &Location, reg: Reg) -> Result<()> {
        let line = load_long_insn(loc, reg);
        self.emit_line(&line)
    }

    /// Stores the low bytes of `reg` matching the type of `loc`.
    fn store(&mut self, reg: Reg, loc: &Location) -> Result<()> {
        let w = Width::of(&loc.ty);
        ins!(self, format!("mov{}", w.suffix()), "{}, {}", reg.name(w), loc);
        Ok(())
    }

    // ---------------------------------------------------------------- operands

    fn location(&mut self, op: &Operand, ar: &ActivationRecord, index: usize) -> Result<Location> {
        match op {
            Operand::Symbol(r) => self.symbol_location(*r, ar, index),
            Operand::Literal(n) => Ok(Location::immediate(*n, DataType::INT)),
            _ => Err(unsupported(index, "operand is not a value")),
        }
    }

    fn symbol_location(&mut self, r: SymbolRef, ar: &ActivationRecord, index: usize) -> Result<Location> {
        let mic = self.mic;
        let s = mic.symbol(r);
        match ar.access(r) {
            Some(Access::InFrame(off)) => Ok(Location::memory(format!("{}(%rbp)", off), s.ty)),
            Some(Access::Constant(_)) => self.constant_location(r, index),
            None if r.table == GLOBAL_TABLE => Ok(Location::memory(
                format!("{}(%rip)", s.short_name()),
                s.ty,
            )),
            None => Err(unsupported(
                index,
                format!("`{}` is not visible in function `{}`", s.id, ar.name),
            )),
        }
    }

    /// Constants become immediates or rip relative labels registered on first use.
    fn constant_location(&mut self, r: SymbolRef, index: usize) -> Result<Location> {
        let value = self
            .mic
            .const_value(r)
            .ok_or_else(|| unsupported(index, "constant without a value"))?;
        Ok(match value {
            Value::Char(c) => Location::immediate(c as i8 as i64, DataType::CHAR),
            Value::Int(i) => Location::immediate(i as i64, DataType::INT),
            // first use assigns the next .LC label; rodata only gets used ones.
            Value::Double(d) => {
                let next = self.doubles.len();
                let id = *self.double_labels.entry(r).or_insert(next);
                if id == next {
                    self.doubles.push(d);
                }
                Location::memory(format!(".LC{}(%rip)", id), DataType::DOUBLE)
            }
            Value::Str(idx) => {
                self.strings.insert(idx);
                Location {
                    text: format!(".LS{}(%rip)", idx),
                    ty: DataType::CHAR.pointer_to(),
                    mode: Mode::Address,
                }
            }
        })
    }

    // ---------------------------------------------------------------- globals

    fn emit_globals(&mut self) -> Result<()> {
        writeln!(self.out, "\t.data")?;
        let mic = self.mic;
        let quads = mic.quads.as_slice();
        let mut cursor = 0;
        for (index, s) in mic.global_table().symbols.iter().enumerate() {
            if s.kind != SymbolKind::Local || s.ty.is_function() {
                continue;
            }
            let r = SymbolRef {
                table: GLOBAL_TABLE,
                index,
            };
            let marker = Operand::Symbol(r);
            // a global's initializer stores run up to its declare marker.
            let end = (cursor..quads.len())
                .find(|j| quads[*j].op == OpCode::Declare && quads[*j].result == marker)
                .unwrap_or(quads.len());
            let stores: Vec<&Taco> = quads[cursor..end]
                .iter()
                .filter(|q| q.op == OpCode::Lxc && q.result == marker)
                .collect();
            cursor = (end + 1).min(quads.len());

            let name = s.short_name();
            let size = s.ty.size();
            // a static matrix is laid out from its initializer stores, header included.
            if s.ty.is_static_matrix() {
                self.emit_global_matrix(name, size, &stores, end)?;
                continue;
            }
            // uninitialised scalars are common symbols, aligned to their size.
            match s.value {
                None => writeln!(self.out, "\t.comm\t{},{},{}", name, size, size.max(1))?,
                Some(v) => {
                    writeln!(self.out, "\t.globl\t{}", name)?;
                    writeln!(self.out, "\t.align\t{}", size.max(1))?;
                    writeln!(self.out, "\t.type\t{}, @object", name)?;
                    writeln!(self.out, "\t.size\t{}, {}", name, size)?;
                    writeln!(self.out, "{}:", name)?;
                    match v.convert(&s.ty) {
                        Some(Value::Char(c)) => ins!(self, ".byte", "{}", c as i8),
                        Some(Value::Int(i)) => ins!(self, ".long", "{}", i),
                        Some(Value::Double(d)) => {
                            let (lo, hi) = double_halves(d);
                            ins!(self, ".long", "{}", lo);
                            ins!(self, ".long", "{}", hi);
                        }
                        _ => return Err(unsupported(end, format!("bad initializer for `{}`", name))),
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialises a static matrix from the literal stores preceding its marker; the
    /// stores may come in any order and uncovered bytes are zero filled.
    fn emit_global_matrix(&mut self, name: &str, size: u32, stores: &[&Taco], marker: usize) -> Result<()> {
        enum Datum {
            Long(i32),
            Quad(f64),
        }
        let mic = self.mic;
        let literal = |op: &Operand| -> Option<Value> {
            match op {
                Operand::Literal(n) => Some(Value::Int(*n as i32)),
                Operand::Symbol(r) => mic.const_value(*r),
                _ => None,
            }
        };
        let mut data = BTreeMap::new();
        for st in stores {
            let offset = match literal(&st.arg1) {
                Some(Value::Int(o)) if o >= 0 => o as u32,
                _ => return Err(unsupported(marker, format!("`{}` has a non constant initializer", name))),
            };
            let datum = match literal(&st.arg2) {
                Some(Value::Int(i)) => Datum::Long(i),
                Some(Value::Char(c)) => Datum::Long(c as i8 as i32),
                Some(Value::Double(d)) => Datum::Quad(d),
                _ => return Err(unsupported(marker, format!("`{}` has a non constant initializer", name))),
            };
            data.insert(offset, datum);
        }

        writeln!(self.out, "\t.globl\t{}", name)?;
        writeln!(self.out, "\t.align\t16")?;
        writeln!(self.out, "\t.type\t{}, @object", name)?;
        writeln!(self.out, "\t.size\t{}, {}", name, size)?;
        writeln!(self.out, "{}:", name)?;
        // `pos` is the first byte not yet written.
        let mut pos = 0;
        for (offset, datum) in data {
            if offset < pos || offset >= size {
                return Err(unsupported(marker, format!("overlapping stores into `{}`", name)));
            }
            if offset > pos {
                ins!(self, ".zero", "{}", offset - pos);
            }
            pos = match datum {
                Datum::Long(i) => {
                    ins!(self, ".long", "{}", i);
                    offset + 4
                }
                Datum::Quad(d) => {
                    let (lo, hi) = double_halves(d);
                    ins!(self, ".long", "{}", lo);
                    ins!(self, ".long", "{}", hi);
                    offset + 8
                }
            };
        }
        if pos < size {
            ins!(self, ".zero", "{}", size - pos);
        }
        Ok(())
    }

    fn emit_rodata(&mut self) -> Result<()> {
        writeln!(self.out, "\t.section\t.rodata")?;
        let doubles = std::mem::take(&mut self.doubles);
        for (id, d) in doubles.iter().enumerate() {
            let (lo, hi) = double_halves(*d);
            ins!(self, ".align", "8");
            writeln!(self.out, ".LC{}:", id)?;
            ins!(self, ".long", "{}", lo);
            ins!(self, ".long", "{}", hi);
        }
        let mic = self.mic;
        for idx in std::mem::take(&mut self.strings) {
            writeln!(self.out, ".LS{}:", idx)?;
            ins!(self, ".string", "{}", mic.string_table[idx]);
        }
        // sign mask for xorpd, which wants a 16 byte aligned operand.
        ins!(self, ".align", "16");
        writeln!(self.out, ".LNEGD:")?;
        ins!(self, ".long", "0");
        ins!(self, ".long", "-2147483648");
        ins!(self, ".long", "0");
        ins!(self, ".long", "0");
        ins!(self, ".align", "8");
        writeln!(self.out, ".LUNIT:")?;
        ins!(self, ".long", "0");
        ins!(self, ".long", "1072693248");
        writeln!(self.out, "\t.section\t.note.GNU-stack,\"\",@progbits")?;
        Ok(())
    }

    // ---------------------------------------------------------------- functions

    fn emit_function(&mut self, name: &str, from: usize, to: usize, root: usize) -> Result<()> {
        let mic = self.mic;
        let ar = ActivationRecord::new(mic, root)?;
        let quads = mic.quads.as_slice();
        debug!(function = name, from, to, "emitting function");

        // only quads that are jumped to get a `.L<index>` label.
        let mut marks = BTreeSet::new();
        for (idx, q) in quads.iter().enumerate().take(to).skip(from + 1) {
            if !q.op.is_jump() {
                continue;
            }
            match q.target() {
                Some(t) if t > from && t <= to => {
                    marks.insert(t);
                }
                _ => return Err(TranslateError::UnresolvedJump(idx)),
            }
        }

        writeln!(self.out, "\t.text")?;
        writeln!(self.out, "\t.globl\t{}", name)?;
        writeln!(self.out, "\t.type\t{}, @function", name)?;
        writeln!(self.out, "{}:", name)?;
        ins!(self, "pushq", "%rbp");
        ins!(self, "movq", "%rsp, %rbp");
        if ar.frame_size() > 0 {
            ins!(self, "subq", "${}, %rsp", ar.frame_size());
        }
        // register parameters get a home in the frame before anything else runs.
        for (rec, reg) in ar.register_params() {
            match reg {
                ArgReg::Xmm(i) => ins!(self, "movsd", "{}, {}(%rbp)", xmm(i), rec.offset),
                ArgReg::Gp(r) => {
                    let w = Width::of(&rec.ty);
                    ins!(self, format!("mov{}", w.suffix()), "{}, {}(%rbp)", r.name(w), rec.offset);
                }
            }
        }
        // owned dynamic matrices start out null so the epilogue can free them
        // unconditionally.
        let owned: Vec<i32> = ar.owned_matrices().map(|r| r.offset).collect();
        for off in &owned {
            ins!(self, "movq", "$0, {}(%rbp)", off);
        }

        self.call = CallSite::default();
        for idx in from + 1..to {
            if marks.contains(&idx) {
                writeln!(self.out, ".L{}:", idx)?;
            }
            self.emit_quad(idx, &quads[idx], &ar, to)?;
        }

        // every return jumps here. The return value sits in %rax or %xmm0 and
        // has to survive the calls to free.
        writeln!(self.out, ".L{}:", to)?;
        if !owned.is_empty() {
            ins!(self, "pushq", "%rax");
            ins!(self, "leaq", "-8(%rsp), %rsp");
            ins!(self, "movsd", "%xmm0, (%rsp)");
            // two eightbytes pushed keep the stack 16 byte aligned for the calls.
            for off in &owned {
                ins!(self, "movq", "{}(%rbp), %rdi", off);
                ins!(self, "call", "free");
            }
            ins!(self, "movsd", "(%rsp), %xmm0");
            ins!(self, "leaq", "8(%rsp), %rsp");
            ins!(self, "popq", "%rax");
        }
        ins!(self, "leave");
        ins!(self, "ret");
        writeln!(self.out, "\t.size\t{}, .-{}", name, name)?;
        Ok(())
    }

    fn emit_quad(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord, end: usize) -> Result<()> {
        match q.op {
            op if op.is_jump() => self.emit_jump(idx, q, ar),
            op if op.is_copy() => self.emit_copy(idx, q, ar),
            op if op.is_bitwise() => self.emit_bitwise(idx, q, ar),
            op if op.is_conversion() => self.emit_conversion(idx, q, ar),
            OpCode::Plus | OpCode::Minus => self.emit_plus_minus(idx, q, ar),
            OpCode::Mult | OpCode::Div | OpCode::Mod => self.emit_mult_div(idx, q, ar),
            OpCode::UMinus => self.emit_unary_minus(idx, q, ar),
            OpCode::Param => self.emit_param(idx, q, ar),
            OpCode::Call => self.emit_call(idx, q, ar),
            OpCode::Return => self.emit_return(idx, q, ar, end),
            OpCode::Alloc => self.emit_alloc(idx, q, ar),
            OpCode::Dealloc => self.emit_dealloc(idx, q, ar),
            OpCode::Transpose => self.emit_transpose(idx, q, ar),
            _ => Ok(()),
        }
    }

    // ---------------------------------------------------------------- matrices

    /// `call abort` unless the 8 byte headers at `(a)` and `(b)` are equal.
    fn check_dims(&mut self, a: Reg, b: Reg) -> Result<()> {
        let ok = self.fresh_label();
        ins!(self, "movq", "({}), %rax", a.q());
        ins!(self, "cmpq", "({}), %rax", b.q());
        ins!(self, "je", "{}", ok);
        ins!(self, "call", "abort");
        writeln!(self.out, "{}:", ok)?;
        Ok(())
    }

    /// Leaves the block size in bytes, header included, of the matrix at `(m)` in %ecx.
    fn block_bytes(&mut self, m: Reg) -> Result<()> {
        // (rows * cols + 1) * 8
        ins!(self, "movl", "({}), %ecx", m.q());
        ins!(self, "imull", "4({}), %ecx", m.q());
        ins!(self, "incl", "%ecx");
        ins!(self, "sall", "$3, %ecx");
        Ok(())
    }

    /// Runs `body` once per element with the element byte offset in %rdx; the loop
    /// bound must already be in %rcx.
    fn element_loop(&mut self, body: &[String]) -> Result<()> {
        let top = self.fresh_label();
        let check = self.fresh_label();
        // offsets start past the 8 byte header. The bound is tested before the
        // first pass so an empty matrix (bound 8) runs the body zero times.
        ins!(self, "movq", "$8, %rdx");
        ins!(self, "jmp", "{}", check);
        writeln!(self.out, "{}:", top)?;
        for line in body {
            self.emit_line(line)?;
        }
        ins!(self, "addq", "$8, %rdx");
        writeln!(self.out, "{}:", check)?;
        ins!(self, "cmpq", "%rcx, %rdx");
        ins!(self, "jl", "{}", top);
        Ok(())
    }

    // ---------------------------------------------------------------- arithmetic

    fn emit_plus_minus(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let z = self.location(&q.result, ar, idx)?;
        let x = self.location(&q.arg1, ar, idx)?;
        let plus = q.op == OpCode::Plus;
        let unit = q.arg2 == Operand::Literal(1);

        if z.ty.is_matrix() {
            // z, x and y must all share one shape; the loop then walks the three
            // blocks in step.
            let y = self.location(&q.arg2, ar, idx)?;
            self.load(&z, Reg::Rdi)?;
            self.load(&x, Reg::R8)?;
            self.load(&y, Reg::R9)?;
            self.check_dims(Reg::Rdi, Reg::R8)?;
            self.check_dims(Reg::Rdi, Reg::R9)?;
            self.block_bytes(Reg::Rdi)?;
            let op = if plus { "addsd" } else { "subsd" };
            return self.element_loop(&[
                "\tmovsd\t(%r8,%rdx), %xmm0".to_string(),
                format!("\t{}\t(%r9,%rdx), %xmm0", op),
                "\tmovsd\t%xmm0, (%rdi,%rdx)".to_string(),
            ]);
        }

        if z.ty.is_pointer() {
            // base plus a byte offset.
            let y = self.location(&q.arg2, ar, idx)?;
            self.load(&x, Reg::Rdx)?;
            ins!(self, "movl", "{}, %eax", y);
            ins!(self, "cltq");
            ins!(self, if plus { "addq" } else { "subq" }, "%rax, %rdx");
            ins!(self, "movq", "%rdx, {}", z);
            return Ok(());
        }

        // `x + 1` and `x - 1` come from ++ and --, which reuse the unit constant.
        if z.ty.is_double() {
            let y = if unit {
                ".LUNIT(%rip)".to_string()
            } else {
                self.location(&q.arg2, ar, idx)?.text
            };
            ins!(self, "movsd", "{}, %xmm0", x);
            ins!(self, if plus { "addsd" } else { "subsd" }, "{}, %xmm0", y);
            ins!(self, "movsd", "%xmm0, {}", z);
            return Ok(());
        }

        if z.ty.is_int() || z.ty.is_char() {
            let w = Width::of(&z.ty);
            let s = w.suffix();
            self.load(&x, Reg::Rax)?;
            if unit {
                ins!(self, format!("{}{}", if plus { "inc" } else { "dec" }, s), "{}", Reg::Rax.name(w));
            } else {
                let y = self.location(&q.arg2, ar, idx)?;
                ins!(self, format!("mov{}", s), "{}, {}", y, Reg::Rdx.name(w));
                ins!(
                    self,
                    format!("{}{}", if plus { "add" } else { "sub" }, s),
                    "{}, {}",
                    Reg::Rdx.name(w),
                    Reg::Rax.name(w)
                );
            }
            return self.store(Reg::Rax, &z);
        }
        Err(unsupported(idx, format!("no {} for {}", q.op.mnemonic(), z.ty)))
    }

    fn emit_mult_div(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let z = self.location(&q.result, ar, idx)?;
        let x = self.location(&q.arg1, ar, idx)?;
        let y = self.location(&q.arg2, ar, idx)?;

        if z.ty.is_matrix() {
            if q.op == OpCode::Mod {
                return Err(unsupported(idx, "no % for matrices"));
            }
            if y.ty.is_matrix() {
                if q.op != OpCode::Mult {
                    return Err(unsupported(idx, "matrices can only be divided by scalars"));
                }
                // matMult(z, x, y) checks the inner dimensions itself.
                self.load(&z, Reg::Rdi)?;
                self.load(&x, Reg::Rsi)?;
                self.load(&y, Reg::Rdx)?;
                ins!(self, "call", "matMult");
                return Ok(());
            }
            // scaling: the scalar stays in %xmm1 for the whole loop.
            self.load(&z, Reg::Rdi)?;
            self.load(&x, Reg::R8)?;
            self.check_dims(Reg::Rdi, Reg::R8)?;
            self.block_bytes(Reg::Rdi)?;
            ins!(self, "movsd", "{}, %xmm1", y);
            let op = if q.op == OpCode::Mult { "mulsd" } else { "divsd" };
            return self.element_loop(&[
                "\tmovsd\t(%r8,%rdx), %xmm0".to_string(),
                format!("\t{}\t%xmm1, %xmm0", op),
                "\tmovsd\t%xmm0, (%rdi,%rdx)".to_string(),
            ]);
        }

        if z.ty.is_double() {
            let op = match q.op {
                OpCode::Mult => "mulsd",
                OpCode::Div => "divsd",
                _ => return Err(unsupported(idx, "no % for doubles")),
            };
            ins!(self, "movsd", "{}, %xmm0", x);
            ins!(self, op, "{}, %xmm0", y);
            ins!(self, "movsd", "%xmm0, {}", z);
            return Ok(());
        }

        if z.ty.is_int() || z.ty.is_char() {
            self.load_long(&x, Reg::Rax)?;
            self.load_long(&y, Reg::Rcx)?;
            match q.op {
                OpCode::Mult => {
                    ins!(self, "imull", "%ecx, %eax");
                    self.store(Reg::Rax, &z)
                }
                // idivl leaves the quotient in %eax and the remainder in %edx.
                OpCode::Div => {
                    ins!(self, "cltd");
                    ins!(self, "idivl", "%ecx");
                    self.store(Reg::Rax, &z)
                }
                _ => {
                    ins!(self, "cltd");
                    ins!(self, "idivl", "%ecx");
                    self.store(Reg::Rdx, &z)
                }
            }
        } else {
            Err(unsupported(idx, format!("no {} for {}", q.op.mnemonic(), z.ty)))
        }
    }

    fn emit_unary_minus(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let z = self.location(&q.result, ar, idx)?;
        let x = self.location(&q.arg1, ar, idx)?;
        if z.ty.is_matrix() {
            self.load(&z, Reg::Rdi)?;
            self.load(&x, Reg::R8)?;
            self.check_dims(Reg::Rdi, Reg::R8)?;
            self.block_bytes(Reg::Rdi)?;
            // flipping the sign bit negates without touching NaNs or zero.
            return self.element_loop(&[
                "\tmovsd\t(%r8,%rdx), %xmm0".to_string(),
                "\txorpd\t.LNEGD(%rip), %xmm0".to_string(),
                "\tmovsd\t%xmm0, (%rdi,%rdx)".to_string(),
            ]);
        }
        if z.ty.is_double() {
            ins!(self, "movsd", "{}, %xmm0", x);
            ins!(self, "xorpd", ".LNEGD(%rip), %xmm0");
            ins!(self, "movsd", "%xmm0, {}", z);
            return Ok(());
        }
        if z.ty.is_int() || z.ty.is_char() {
            self.load_long(&x, Reg::Rax)?;
            ins!(self, "negl", "%eax");
            return self.store(Reg::Rax, &z);
        }
        Err(unsupported(idx, format!("cannot negate {}", z.ty)))
    }

    fn emit_bitwise(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let z = self.location(&q.result, ar, idx)?;
        if !(z.ty.is_int() || z.ty.is_char()) {
            return Err(unsupported(idx, format!("no {} for {}", q.op.mnemonic(), z.ty)));
        }
        let x = self.location(&q.arg1, ar, idx)?;
        self.load_long(&x, Reg::Rax)?;
        if q.op == OpCode::BitNot {
            ins!(self, "notl", "%eax");
            return self.store(Reg::Rax, &z);
        }
        let y = self.location(&q.arg2, ar, idx)?;
        self.load_long(&y, Reg::Rcx)?;
        match q.op {
            OpCode::BitAnd => ins!(self, "andl", "%ecx, %eax"),
            OpCode::BitXor => ins!(self, "xorl", "%ecx, %eax"),
            OpCode::BitOr => ins!(self, "orl", "%ecx, %eax"),
            OpCode::Shl => ins!(self, "sall", "%cl, %eax"),
            _ => ins!(self, "sarl", "%cl, %eax"),
        }
        self.store(Reg::Rax, &z)
    }

    fn emit_conversion(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let z = self.location(&q.result, ar, idx)?;
        let x = self.location(&q.arg1, ar, idx)?;
        if x.ty.is_double() {
            if z.ty.is_double() {
                ins!(self, "movsd", "{}, %xmm0", x);
                ins!(self, "movsd", "%xmm0, {}", z);
                return Ok(());
            }
            // truncates toward zero like a C cast.
            ins!(self, "cvttsd2si", "{}, %eax", x);
        } else if x.ty.is_scalar() || x.ty.is_bool() {
            self.load_long(&x, Reg::Rax)?;
        } else {
            return Err(unsupported(idx, format!("cannot convert {}", x.ty)));
        }
        if z.ty.is_double() {
            ins!(self, "cvtsi2sdl", "%eax, %xmm0");
            ins!(self, "movsd", "%xmm0, {}", z);
            Ok(())
        } else {
            self.store(Reg::Rax, &z)
        }
    }

    // ---------------------------------------------------------------- copies

    fn emit_copy(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let z = self.location(&q.result, ar, idx)?;
        let x = self.location(&q.arg1, ar, idx)?;
        match q.op {
            // a whole block copy, header included; the shapes must already agree.
            OpCode::Copy if z.ty.is_matrix() => {
                self.load(&z, Reg::Rdi)?;
                self.load(&x, Reg::Rsi)?;
                self.check_dims(Reg::Rdi, Reg::Rsi)?;
                ins!(self, "movl", "(%rsi), %edx");
                ins!(self, "imull", "4(%rsi), %edx");
                ins!(self, "incl", "%edx");
                ins!(self, "sall", "$3, %edx");
                ins!(self, "call", "memcpy");
            }
            OpCode::Copy if z.ty.is_double() => {
                ins!(self, "movsd", "{}, %xmm0", x);
                ins!(self, "movsd", "%xmm0, {}", z);
            }
            OpCode::Copy => {
                self.load(&x, Reg::Rax)?;
                self.store(Reg::Rax, &z)?;
            }
            OpCode::Refer => {
                ins!(self, "leaq", "{}, %rdx", x);
                ins!(self, "movq", "%rdx, {}", z);
            }
            OpCode::RDeref => {
                self.load(&x, Reg::Rdx)?;
                if z.ty.is_double() {
                    ins!(self, "movsd", "(%rdx), %xmm0");
                    ins!(self, "movsd", "%xmm0, {}", z);
                } else {
                    let w = Width::of(&z.ty);
                    ins!(self, format!("mov{}", w.suffix()), "(%rdx), {}", Reg::Rax.name(w));
                    self.store(Reg::Rax, &z)?;
                }
            }
            OpCode::LDeref => {
                self.load(&z, Reg::Rdx)?;
                if x.ty.is_double() {
                    ins!(self, "movsd", "{}, %xmm0", x);
                    ins!(self, "movsd", "%xmm0, (%rdx)");
                } else {
                    let w = Width::of(&x.ty);
                    self.load(&x, Reg::Rax)?;
                    ins!(self, format!("mov{}", w.suffix()), "{}, (%rdx)", Reg::Rax.name(w));
                }
            }
            OpCode::Lxc => {
                // z[x] = y
                let y = self.location(&q.arg2, ar, idx)?;
                self.load(&z, Reg::Rdx)?;
                self.element_index(&x)?;
                if y.ty.is_double() {
                    ins!(self, "movsd", "{}, %xmm0", y);
                    ins!(self, "movsd", "%xmm0, (%rdx,%rax)");
                } else {
                    self.load_long(&y, Reg::Rcx)?;
                    ins!(self, "movl", "%ecx, (%rdx,%rax)");
                }
            }
            _ => {
                // z = x[y]
                let y = self.location(&q.arg2, ar, idx)?;
                self.load(&x, Reg::Rdx)?;
                self.element_index(&y)?;
                if z.ty.is_double() {
                    ins!(self, "movsd", "(%rdx,%rax), %xmm0");
                    ins!(self, "movsd", "%xmm0, {}", z);
                } else {
                    ins!(self, "movl", "(%rdx,%rax), %ecx");
                    self.store(Reg::Rcx, &z)?;
                }
            }
        }
        Ok(())
    }

    /// Sign extends a byte offset into %rax.
    fn element_index(&mut self, offset: &Location) -> Result<()> {
        if offset.is_immediate() {
            ins!(self, "movq", "{}, %rax", offset);
        } else {
            ins!(self, "movl", "{}, %eax", offset);
            ins!(self, "cltq");
        }
        Ok(())
    }

    // ---------------------------------------------------------------- jumps

    fn emit_jump(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let target = q
            .target()
            .map(|t| format!(".L{}", t))
            .ok_or(TranslateError::UnresolvedJump(idx))?;
        if q.op == OpCode::Goto {
            ins!(self, "jmp", "{}", target);
            return Ok(());
        }
        let x = self.location(&q.arg1, ar, idx)?;

        if q.op == OpCode::IfVal || q.op == OpCode::IfNot {
            // ucomisd sets PF for an unordered compare, and NaN counts as true.
            if x.ty.is_double() {
                ins!(self, "movsd", "{}, %xmm0", x);
                ins!(self, "xorpd", "%xmm1, %xmm1");
                ins!(self, "ucomisd", "%xmm1, %xmm0");
                if q.op == OpCode::IfVal {
                    ins!(self, "jne", "{}", target);
                    ins!(self, "jp", "{}", target);
                } else {
                    let skip = self.fresh_label();
                    ins!(self, "jp", "{}", skip);
                    ins!(self, "je", "{}", target);
                    writeln!(self.out, "{}:", skip)?;
                }
            } else {
                let w = Width::of(&x.ty);
                self.load(&x, Reg::Rax)?;
                ins!(self, format!("test{}", w.suffix()), "{}, {}", Reg::Rax.name(w), Reg::Rax.name(w));
                ins!(self, if q.op == OpCode::IfVal { "jne" } else { "je" }, "{}", target);
            }
            return Ok(());
        }

        let y = self.location(&q.arg2, ar, idx)?;
        // ucomisd sets the flags like an unsigned compare.
        if x.ty.is_double() {
            let cc = match q.op {
                OpCode::Lt => "jb",
                OpCode::Lte => "jbe",
                OpCode::Gt => "ja",
                OpCode::Gte => "jae",
                OpCode::Eq => "je",
                _ => "jne",
            };
            ins!(self, "movsd", "{}, %xmm0", x);
            ins!(self, "ucomisd", "{}, %xmm0", y);
            ins!(self, cc, "{}", target);
            return Ok(());
        }
        let cc = match q.op {
            OpCode::Lt => "jl",
            OpCode::Lte => "jle",
            OpCode::Gt => "jg",
            OpCode::Gte => "jge",
            OpCode::Eq => "je",
            _ => "jne",
        };
        let w = Width::of(&x.ty);
        self.load(&x, Reg::Rax)?;
        if y.mode == Mode::Address {
            self.load(&y, Reg::Rcx)?;
            ins!(self, "cmpq", "%rcx, %rax");
        } else {
            ins!(self, format!("cmp{}", w.suffix()), "{}, {}", y, Reg::Rax.name(w));
        }
        ins!(self, cc, "{}", target);
        Ok(())
    }

    // ---------------------------------------------------------------- calls

    fn emit_param(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let p = self.location(&q.result, ar, idx)?;
        // params are staged, not emitted: the call has to see them all before it
        // knows the alignment padding that must precede the first push.
        let call = &mut self.call;
        match ArgClass::of(&p.ty) {
            ArgClass::Sse if call.sses < NUM_SSE_ARG_REGS => {
                call.staged.push(format!("\tmovsd\t{}, {}", p, xmm(call.sses)));
                call.sses += 1;
            }
            // no push for doubles. Staged backwards, this replays as a load into
            // %xmm8, a slot opened below %rsp, and a store into it.
            ArgClass::Sse => {
                call.staged.push("\tmovsd\t%xmm8, (%rsp)".to_string());
                call.staged.push("\tleaq\t-8(%rsp), %rsp".to_string());
                call.staged.push(format!("\tmovsd\t{}, %xmm8", p));
                call.stack_bytes += 8;
            }
            ArgClass::Integer if call.ints < NUM_INT_ARG_REGS => {
                call.staged.push(load_insn(&p, ARG_REGS[call.ints]));
                call.ints += 1;
            }
            ArgClass::Integer => {
                call.staged.push("\tpushq\t%rax".to_string());
                call.staged.push(load_long_insn(&p, Reg::Rax));
                call.stack_bytes += 8;
            }
        }
        Ok(())
    }

    fn emit_call(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let name = match &q.arg1 {
            Operand::Name(n) => n.clone(),
            _ => return Err(unsupported(idx, "call without a function name")),
        };
        // %rsp must be 16 byte aligned at the call, after the stack arguments.
        let mut call = std::mem::take(&mut self.call);
        if call.stack_bytes % 16 != 0 {
            ins!(self, "leaq", "-8(%rsp), %rsp");
            call.stack_bytes += 8;
        }
        // the last stack argument goes first so the seventh ends up at (%rsp).
        for line in call.staged.iter().rev() {
            self.emit_line(line)?;
        }
        // vector register count, read by variadic callees.
        ins!(self, "movl", "${}, %eax", call.sses);
        ins!(self, "call", "{}", name);
        if call.stack_bytes > 0 {
            ins!(self, "leaq", "{}(%rsp), %rsp", call.stack_bytes);
        }
        if q.result.is_none() {
            return Ok(());
        }
        let z = self.location(&q.result, ar, idx)?;
        if z.ty.is_double() {
            ins!(self, "movsd", "%xmm0, {}", z);
        } else if z.ty.is_matrix() {
            ins!(self, "movq", "%rax, {}", z);
        } else {
            self.store(Reg::Rax, &z)?;
        }
        Ok(())
    }

    fn emit_return(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord, end: usize) -> Result<()> {
        if !q.result.is_none() {
            let z = self.location(&q.result, ar, idx)?;
            if z.ty.is_matrix() {
                // hand the caller a fresh copy; locals are freed on the way out.
                self.load(&z, Reg::Rsi)?;
                ins!(self, "movl", "(%rsi), %edi");
                ins!(self, "imull", "4(%rsi), %edi");
                ins!(self, "incl", "%edi");
                ins!(self, "movl", "$8, %esi");
                ins!(self, "call", "calloc");
                ins!(self, "movq", "%rax, %rdi");
                self.load(&z, Reg::Rsi)?;
                ins!(self, "movl", "(%rsi), %edx");
                ins!(self, "imull", "4(%rsi), %edx");
                ins!(self, "incl", "%edx");
                ins!(self, "sall", "$3, %edx");
                ins!(self, "call", "memcpy");
            } else if z.ty.is_double() {
                ins!(self, "movsd", "{}, %xmm0", z);
            } else {
                self.load_long(&z, Reg::Rax)?;
            }
        }
        ins!(self, "jmp", ".L{}", end);
        Ok(())
    }

    // ---------------------------------------------------------------- heap

    fn emit_alloc(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let z = self.location(&q.result, ar, idx)?;
        let x = match q.arg1 {
            Operand::None => None,
            ref op => Some(self.location(op, ar, idx)?),
        };
        let y = match q.arg2 {
            Operand::None => None,
            ref op => Some(self.location(op, ar, idx)?),
        };
        match (&x, &y) {
            (Some(x), None) | (None, Some(x)) if x.ty.is_matrix() => {
                // same element count; the transposed form swaps the header halves.
                let transposed = q.arg1.is_none();
                self.load(x, Reg::Rdx)?;
                ins!(self, "movl", "(%rdx), %edi");
                ins!(self, "imull", "4(%rdx), %edi");
                self.calloc_into(&z)?;
                self.load(x, Reg::Rdx)?;
                ins!(self, "movq", "(%rdx), %rcx");
                if transposed {
                    ins!(self, "rorq", "$32, %rcx");
                }
                ins!(self, "movq", "%rcx, (%rax)");
            }
            // product shape: rows of x by columns of y.
            (Some(x), Some(y)) if x.ty.is_matrix() && y.ty.is_matrix() => {
                self.load(x, Reg::Rdx)?;
                self.load(y, Reg::Rcx)?;
                ins!(self, "movl", "(%rdx), %edi");
                ins!(self, "imull", "4(%rcx), %edi");
                self.calloc_into(&z)?;
                self.load(x, Reg::Rdx)?;
                ins!(self, "movl", "(%rdx), %ecx");
                ins!(self, "movl", "%ecx, (%rax)");
                self.load(y, Reg::Rdx)?;
                ins!(self, "movl", "4(%rdx), %ecx");
                ins!(self, "movl", "%ecx, 4(%rax)");
            }
            // explicit `rows` and `cols` values.
            (Some(x), Some(y)) if x.ty.is_integral() && y.ty.is_integral() => {
                self.load_long(x, Reg::Rdi)?;
                self.load_long(y, Reg::Rcx)?;
                ins!(self, "imull", "%ecx, %edi");
                self.calloc_into(&z)?;
                self.load_long(x, Reg::Rcx)?;
                ins!(self, "movl", "%ecx, (%rax)");
                self.load_long(y, Reg::Rcx)?;
                ins!(self, "movl", "%ecx, 4(%rax)");
            }
            _ => return Err(unsupported(idx, "unknown allocation form")),
        }
        Ok(())
    }

    /// Allocates `%edi` elements plus the header and stores the block in `z`,
    /// leaving its address in %rax.
    fn calloc_into(&mut self, z: &Location) -> Result<()> {
        ins!(self, "incl", "%edi");
        ins!(self, "movl", "$8, %esi");
        ins!(self, "call", "calloc");
        ins!(self, "movq", "%rax, {}", z);
        Ok(())
    }

    fn emit_dealloc(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        // free(NULL) is fine, and nulling keeps a later free harmless.
        let z = self.location(&q.result, ar, idx)?;
        ins!(self, "movq", "{}, %rdi", z);
        ins!(self, "call", "free");
        ins!(self, "movq", "$0, {}", z);
        Ok(())
    }

    fn emit_transpose(&mut self, idx: usize, q: &Taco, ar: &ActivationRecord) -> Result<()> {
        let z = self.location(&q.result, ar, idx)?;
        let x = self.location(&q.arg1, ar, idx)?;
        self.load(&z, Reg::Rdi)?;
        self.load(&x, Reg::Rsi)?;
        // rotating the 8 byte header swaps rows and cols in one compare.
        let ok = self.fresh_label();
        ins!(self, "movq", "(%rsi), %rax");
        ins!(self, "rorq", "$32, %rax");
        ins!(self, "cmpq", "(%rdi), %rax");
        ins!(self, "je", "{}", ok);
        ins!(self, "call", "abort");
        writeln!(self.out, "{}:", ok)?;

        // x is r x c and z is c x r. x is walked row major with its data offset in
        // %r9, so x[i][j] comes next each time. It lands in z[j][i], whose data
        // offset lives in %r8: a step along a row of x moves one row down z,
        // which is a stride of r * 8 bytes (z's column count, kept in %rdx).
        // Stepping past the last row of z means the row of x has ended, so %r8
        // wraps back by the data size in %rcx and moves one column right.
        let top = self.fresh_label();
        let next = self.fresh_label();
        let check = self.fresh_label();
        ins!(self, "movl", "4(%rdi), %edx");
        ins!(self, "sall", "$3, %edx");
        ins!(self, "movl", "(%rdi), %ecx");
        ins!(self, "imull", "%edx, %ecx");
        ins!(self, "xorq", "%r8, %r8");
        ins!(self, "xorq", "%r9, %r9");
        // an empty matrix has no data bytes and skips the loop entirely.
        ins!(self, "jmp", "{}", check);
        writeln!(self.out, "{}:", top)?;
        ins!(self, "movsd", "8(%rsi,%r9), %xmm0");
        ins!(self, "movsd", "%xmm0, 8(%rdi,%r8)");
        ins!(self, "addq", "%rdx, %r8");
        ins!(self, "cmpq", "%rcx, %r8");
        ins!(self, "jl", "{}", next);
        ins!(self, "subq", "%rcx, %r8");
        ins!(self, "addq", "$8, %r8");
        writeln!(self.out, "{}:", next)?;
        ins!(self, "addq", "$8, %r9");
        writeln!(self.out, "{}:", check)?;
        ins!(self, "cmpq", "%rcx, %r9");
        ins!(self, "jl", "{}", top);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function_start(mic: &mut Translator, name: &str, ret: DataType) -> usize {
        let f = mic.create_symbol(name, DataType::FUNCTION, SymbolKind::Local).unwrap();
        let t = mic.new_environment(name);
        mic.symbol_mut(f).child = Some(t);
        mic.create_symbol("#ret", ret, SymbolKind::RetVal).unwrap();
        mic.emit(Taco::new(
            OpCode::FuncStart,
            Operand::Name(name.to_string()),
            Operand::None,
            Operand::None,
        ));
        t
    }

    fn function_end(mic: &mut Translator, name: &str) {
        mic.emit(Taco::new(
            OpCode::FuncEnd,
            Operand::Name(name.to_string()),
            Operand::None,
            Operand::None,
        ));
        mic.pop_environment().unwrap();
    }

    #[test]
    fn scalar_add_uses_three_frame_slots() {
        let mut mic = Translator::new("t.mm");
        function_start(&mut mic, "main", DataType::INT);
        let a = mic.create_symbol("a", DataType::INT, SymbolKind::Local).unwrap();
        let b = mic.create_symbol("b", DataType::INT, SymbolKind::Local).unwrap();
        let c = mic.create_symbol("c", DataType::INT, SymbolKind::Local).unwrap();
        mic.emit(Taco::binary(OpCode::Plus, c, a, b));
        function_end(&mut mic, "main");

        let asm = X86Asm::code_gen(&mic).unwrap();
        assert!(asm.contains("\tmovl\t-4(%rbp), %eax\n\tmovl\t-8(%rbp), %edx\n\taddl\t%edx, %eax\n\tmovl\t%eax, -12(%rbp)"));
        assert!(asm.contains("subq\t$16, %rsp"));
        assert!(asm.contains("main:"));
    }

    #[test]
    fn increment_by_literal_one() {
        let mut mic = Translator::new("t.mm");
        function_start(&mut mic, "main", DataType::VOID);
        let i = mic.create_symbol("i", DataType::INT, SymbolKind::Local).unwrap();
        let d = mic.create_symbol("d", DataType::DOUBLE, SymbolKind::Local).unwrap();
        mic.emit(Taco::binary(OpCode::Plus, i, i, Operand::Literal(1)));
        mic.emit(Taco::binary(OpCode::Minus, d, d, Operand::Literal(1)));
        function_end(&mut mic, "main");

        let asm = X86Asm::code_gen(&mic).unwrap();
        assert!(asm.contains("incl\t%eax"));
        assert!(asm.contains("subsd\t.LUNIT(%rip), %xmm0"));
    }

    #[test]
    fn unused_constants_are_not_emitted() {
        let mut mic = Translator::new("t.mm");
        function_start(&mut mic, "main", DataType::VOID);
        let d = mic.create_symbol("d", DataType::DOUBLE, SymbolKind::Local).unwrap();
        let used = mic.gen_const(Value::Double(2.5)).unwrap();
        mic.gen_const(Value::Double(7.25)).unwrap();
        mic.emit(Taco::unary(OpCode::Copy, d, used));
        mic.emit(Taco::unary(OpCode::Copy, d, used));
        function_end(&mut mic, "main");

        let asm = X86Asm::code_gen(&mic).unwrap();
        assert_eq!(1, asm.matches(".LC0:").count());
        assert!(!asm.contains(".LC1"));
        assert_eq!(2, asm.matches("movsd\t.LC0(%rip), %xmm0").count());
    }

    #[test]
    fn static_matrix_add_checks_dims_at_runtime() {
        let mut mic = Translator::new("t.mm");
        function_start(&mut mic, "main", DataType::VOID);
        let a = mic.create_symbol("a", DataType::matrix(2, 2), SymbolKind::Local).unwrap();
        let b = mic.create_symbol("b", DataType::matrix(3, 3), SymbolKind::Local).unwrap();
        let t = mic.gen_temp(DataType::DYNAMIC_MATRIX).unwrap();
        mic.emit(Taco::unary(OpCode::Alloc, t, a));
        mic.emit(Taco::binary(OpCode::Plus, t, a, b));
        function_end(&mut mic, "main");

        let asm = X86Asm::code_gen(&mic).unwrap();
        assert_eq!(2, asm.matches("call\tabort").count());
        assert!(asm.contains("cmpq\t(%r9), %rax"));
        assert!(asm.contains("addsd\t(%r9,%rdx), %xmm0"));
        // loops back while the byte offset is below the block size.
        assert!(asm.contains("addq\t$8, %rdx\n.LT"));
        assert!(asm.contains("cmpq\t%rcx, %rdx\n\tjl\t.LT"));
        // the temporary is nulled up front and freed in the epilogue.
        assert!(asm.contains("call\tcalloc"));
        assert!(asm.contains("call\tfree"));
    }

    #[test]
    fn seventh_int_argument_is_pushed() {
        let mut mic = Translator::new("t.mm");
        let callee = mic.create_symbol("f", DataType::FUNCTION, SymbolKind::Local).unwrap();
        let ft = mic.new_environment("f");
        mic.symbol_mut(callee).child = Some(ft);
        mic.table_mut(ft).is_defined = false;
        mic.pop_environment().unwrap();

        function_start(&mut mic, "main", DataType::VOID);
        let args: Vec<_> = (0..7)
            .map(|i| mic.create_symbol(&format!("a{}", i), DataType::INT, SymbolKind::Local).unwrap())
            .collect();
        for a in &args {
            mic.emit(Taco::new(OpCode::Param, Operand::Symbol(*a), Operand::None, Operand::None));
        }
        mic.emit(Taco::new(
            OpCode::Call,
            Operand::None,
            Operand::Name("f".into()),
            Operand::Literal(7),
        ));
        function_end(&mut mic, "main");

        let asm = X86Asm::code_gen(&mic).unwrap();
        let expected = [
            "\tleaq\t-8(%rsp), %rsp",
            "\tmovl\t-28(%rbp), %eax",
            "\tpushq\t%rax",
            "\tmovl\t-24(%rbp), %r9d",
            "\tmovl\t-20(%rbp), %r8d",
            "\tmovl\t-16(%rbp), %ecx",
            "\tmovl\t-12(%rbp), %edx",
            "\tmovl\t-8(%rbp), %esi",
            "\tmovl\t-4(%rbp), %edi",
            "\tmovl\t$0, %eax",
            "\tcall\tf",
            "\tleaq\t16(%rsp), %rsp",
        ]
        .join("\n");
        assert!(asm.contains(&expected), "{}", asm);
    }

    /// The label a `jmp` right after `lead` goes to.
    fn jump_after<'a>(asm: &'a str, lead: &str) -> (usize, &'a str) {
        let at = asm.find(lead).unwrap() + lead.len();
        let rest = &asm[at..];
        let rest = rest.strip_prefix("\n\tjmp\t").unwrap();
        (at, &rest[..rest.find('\n').unwrap()])
    }

    #[test]
    fn empty_dynamic_matrices_skip_element_loops() {
        let mut mic = Translator::new("t.mm");
        function_start(&mut mic, "main", DataType::VOID);
        let a = mic.create_symbol("a", DataType::DYNAMIC_MATRIX, SymbolKind::Local).unwrap();
        let b = mic.create_symbol("b", DataType::DYNAMIC_MATRIX, SymbolKind::Local).unwrap();
        mic.emit(Taco::binary(OpCode::Minus, a, a, b));
        function_end(&mut mic, "main");

        let asm = X86Asm::code_gen(&mic).unwrap();
        // the bound is tested before the body runs even once.
        let (at, check) = jump_after(&asm, "movq\t$8, %rdx");
        let body = asm[at..].find("subsd").unwrap() + at;
        let test = asm.find(&format!("{}:\n\tcmpq\t%rcx, %rdx\n\tjl", check)).unwrap();
        assert!(at < body && body < test);
    }

    #[test]
    fn transpose_of_an_empty_matrix_copies_nothing() {
        let mut mic = Translator::new("t.mm");
        function_start(&mut mic, "main", DataType::VOID);
        let a = mic.create_symbol("a", DataType::DYNAMIC_MATRIX, SymbolKind::Local).unwrap();
        let b = mic.create_symbol("b", DataType::DYNAMIC_MATRIX, SymbolKind::Local).unwrap();
        mic.emit(Taco::unary(OpCode::Transpose, b, a));
        function_end(&mut mic, "main");

        let asm = X86Asm::code_gen(&mic).unwrap();
        // the shape is checked against the flipped header first.
        assert!(asm.contains("rorq\t$32, %rax"));
        let (at, check) = jump_after(&asm, "xorq\t%r9, %r9");
        let copy = asm[at..].find("movsd\t%xmm0, 8(%rdi,%r8)").unwrap() + at;
        let test = asm.find(&format!("{}:\n\tcmpq\t%rcx, %r9\n\tjl", check)).unwrap();
        assert!(at < copy && copy < test);
        // a finished row of the source wraps to the next column of the target.
        assert!(asm.contains("subq\t%rcx, %r8\n\taddq\t$8, %r8"));
    }

    #[test]
    fn eighth_double_uses_xmm7_and_ninth_spills() {
        let mut mic = Translator::new("t.mm");
        let callee = mic.create_symbol("g", DataType::FUNCTION, SymbolKind::Local).unwrap();
        let gt = mic.new_environment("g");
        mic.symbol_mut(callee).child = Some(gt);
        mic.table_mut(gt).is_defined = false;
        mic.pop_environment().unwrap();

        function_start(&mut mic, "main", DataType::VOID);
        let args: Vec<_> = (0..9)
            .map(|i| mic.create_symbol(&format!("d{}", i), DataType::DOUBLE, SymbolKind::Local).unwrap())
            .collect();
        for d in &args {
            mic.emit(Taco::new(OpCode::Param, Operand::Symbol(*d), Operand::None, Operand::None));
        }
        mic.emit(Taco::new(
            OpCode::Call,
            Operand::None,
            Operand::Name("g".into()),
            Operand::Literal(9),
        ));
        function_end(&mut mic, "main");

        let asm = X86Asm::code_gen(&mic).unwrap();
        let expected = [
            "\tleaq\t-8(%rsp), %rsp",
            "\tmovsd\t-72(%rbp), %xmm8",
            "\tleaq\t-8(%rsp), %rsp",
            "\tmovsd\t%xmm8, (%rsp)",
            "\tmovsd\t-64(%rbp), %xmm7",
            "\tmovsd\t-56(%rbp), %xmm6",
        ]
        .join("\n");
        assert!(asm.contains(&expected), "{}", asm);
        assert!(asm.contains("\tmovsd\t-8(%rbp), %xmm0\n\tmovl\t$8, %eax\n\tcall\tg\n\tleaq\t16(%rsp), %rsp"));
    }

    #[test]
    fn eighth_double_parameter_arrives_in_xmm7() {
        let mut mic = Translator::new("t.mm");
        function_start(&mut mic, "h", DataType::VOID);
        for i in 0..8 {
            mic.create_symbol(&format!("p{}", i), DataType::DOUBLE, SymbolKind::Param).unwrap();
        }
        function_end(&mut mic, "h");

        let asm = X86Asm::code_gen(&mic).unwrap();
        assert!(asm.contains("\tmovsd\t%xmm0, -8(%rbp)"));
        assert!(asm.contains("\tmovsd\t%xmm7, -64(%rbp)"));
        assert!(!asm.contains("%xmm8"));
    }

    #[test]
    fn matrix_return_copies_to_the_heap() {
        let mut mic = Translator::new("t.mm");
        function_start(&mut mic, "f", DataType::DYNAMIC_MATRIX);
        let m = mic.create_symbol("m", DataType::matrix(2, 3), SymbolKind::Local).unwrap();
        mic.emit(Taco::new(OpCode::Return, Operand::Symbol(m), Operand::None, Operand::None));
        function_end(&mut mic, "f");

        let asm = X86Asm::code_gen(&mic).unwrap();
        let calloc = asm.find("call\tcalloc").unwrap();
        let memcpy = asm.find("call\tmemcpy").unwrap();
        assert!(calloc < memcpy);
        // the size comes from the header at run time.
        assert!(asm.contains("leaq\t-56(%rbp), %rsi\n\tmovl\t(%rsi), %edi\n\timull\t4(%rsi), %edi"));
        assert!(asm.contains("jmp\t.L"));
    }

    #[test]
    fn unresolved_jump_is_an_error() {
        let mut mic = Translator::new("t.mm");
        function_start(&mut mic, "main", DataType::VOID);
        mic.emit(Taco::goto());
        function_end(&mut mic, "main");
        assert!(matches!(
            X86Asm::code_gen(&mic),
            Err(TranslateError::UnresolvedJump(1))
        ));
    }

    #[test]
    fn globals_are_serialised() {
        let mut mic = Translator::new("t.mm");
        let g = mic.create_symbol("g", DataType::INT, SymbolKind::Local).unwrap();
        mic.symbol_mut(g).value = Some(Value::Int(42));
        mic.emit(Taco::new(OpCode::Declare, Operand::Symbol(g), Operand::None, Operand::None));
        let h = mic.create_symbol("h", DataType::DOUBLE, SymbolKind::Local).unwrap();
        mic.emit(Taco::new(OpCode::Declare, Operand::Symbol(h), Operand::None, Operand::None));

        let m = mic.create_symbol("m", DataType::matrix(1, 2), SymbolKind::Local).unwrap();
        let two = mic.gen_const(Value::Double(2.0)).unwrap();
        let one = mic.gen_const(Value::Int(1)).unwrap();
        let rows = mic.gen_const(Value::Int(1)).unwrap();
        let cols = mic.gen_const(Value::Int(2)).unwrap();
        // out of order on purpose.
        mic.emit(Taco::binary(OpCode::Lxc, m, Operand::Literal(16), two));
        mic.emit(Taco::binary(OpCode::Lxc, m, Operand::Literal(0), rows));
        mic.emit(Taco::binary(OpCode::Lxc, m, Operand::Literal(4), cols));
        mic.emit(Taco::new(OpCode::Declare, Operand::Symbol(m), Operand::None, Operand::None));
        assert_eq!(one, rows);

        let asm = X86Asm::code_gen(&mic).unwrap();
        assert!(asm.contains("g:\n\t.long\t42"));
        assert!(asm.contains("\t.comm\th,8,8"));
        assert!(asm.contains("m:\n\t.long\t1\n\t.long\t2\n\t.zero\t8\n\t.long\t0\n\t.long\t1073741824\n"));
    }
}
