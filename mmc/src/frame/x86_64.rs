use std::collections::HashMap;

use tracing::debug;

use crate::{
    errors::{Result, TranslateError},
    frame::{align_down, round_up, Access, ArgClass},
    symtab::{SymbolKind, SymbolRef, TableId},
    translator::Translator,
    types::DataType,
};

pub const WORD_SIZE: i32 = 8;

// caller's rbp and the return address sit between rbp and the first stack argument.
pub const FIRST_STACK_ARG: i32 = 16;

pub const NUM_INT_ARG_REGS: usize = 6;
pub const NUM_SSE_ARG_REGS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    Quad = 0,
    Long = 1,
    Byte = 2,
}

impl Width {
    pub fn of(ty: &DataType) -> Self {
        if ty.is_char() || ty.is_bool() {
            Width::Byte
        } else if ty.is_int() {
            Width::Long
        } else {
            Width::Quad
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Width::Quad => "q",
            Width::Long => "l",
            Width::Byte => "b",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

const REGISTER_NAMES: [[&str; 3]; 16] = [
    ["%rax", "%eax", "%al"],
    ["%rbx", "%ebx", "%bl"],
    ["%rcx", "%ecx", "%cl"],
    ["%rdx", "%edx", "%dl"],
    ["%rsi", "%esi", "%sil"],
    ["%rdi", "%edi", "%dil"],
    ["%rbp", "%ebp", "%bpl"],
    ["%rsp", "%esp", "%spl"],
    ["%r8", "%r8d", "%r8b"],
    ["%r9", "%r9d", "%r9b"],
    ["%r10", "%r10d", "%r10b"],
    ["%r11", "%r11d", "%r11b"],
    ["%r12", "%r12d", "%r12b"],
    ["%r13", "%r13d", "%r13b"],
    ["%r14", "%r14d", "%r14b"],
    ["%r15", "%r15d", "%r15b"],
];

impl Reg {
    pub fn name(self, width: Width) -> &'static str {
        REGISTER_NAMES[self as usize][width as usize]
    }

    pub fn q(self) -> &'static str {
        self.name(Width::Quad)
    }

    pub fn l(self) -> &'static str {
        self.name(Width::Long)
    }

    pub fn b(self) -> &'static str {
        self.name(Width::Byte)
    }
}

// used for passing arguments.
pub const ARG_REGS: [Reg; NUM_INT_ARG_REGS] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

pub fn xmm(i: usize) -> String {
    format!("%xmm{}", i)
}

/// Register a parameter arrives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgReg {
    Gp(Reg),
    Xmm(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub symbol: SymbolRef,
    pub ty: DataType,
    pub kind: SymbolKind,
    pub offset: i32,
}

/// System V AMD64 frame of one function, rebuilt for every code generation pass.
///
/// Records are ordered caller side first (stack arguments, highest offset first),
/// then the callee side in declaration order: register parameters, then locals and
/// temporaries. Integral values take 4 bytes, everything else is 8 byte aligned.
#[derive(Debug)]
pub struct ActivationRecord {
    pub name: String,
    pub records: Vec<Record>,
    loc_map: HashMap<SymbolRef, usize>,
    const_map: HashMap<SymbolRef, usize>,
    pub constants: Vec<SymbolRef>,
    pub ret_val: Option<SymbolRef>,
    frame_size: i32,
}

/// Offset of the next slot below `offset`, or `None` once the frame outgrows
/// what a 32 bit displacement from `%rbp` can reach.
fn next_slot(offset: i32, ty: &DataType) -> Option<i32> {
    if ty.is_integral() {
        return offset.checked_sub(4);
    }
    let size = i32::try_from(ty.size().max(1)).ok()?.checked_add(WORD_SIZE - 1)?;
    align_down(offset, WORD_SIZE).checked_sub(size / WORD_SIZE * WORD_SIZE)
}

impl ActivationRecord {
    pub fn new(mic: &Translator, root: TableId) -> Result<Self> {
        let table = mic.table(root);
        let mut ret_val = None;
        let mut params = Vec::new();
        let mut vars = Vec::new();
        let mut constants = Vec::new();
        for (index, symbol) in table.symbols.iter().enumerate() {
            let r = SymbolRef { table: root, index };
            match symbol.kind {
                SymbolKind::RetVal => ret_val = Some(r),
                SymbolKind::Const => constants.push(r),
                SymbolKind::Param => params.push(r),
                SymbolKind::Local | SymbolKind::Temp if !symbol.ty.is_function() => vars.push(r),
                _ => {}
            }
        }

        let record = |r: SymbolRef, offset: i32| {
            let s = mic.symbol(r);
            Record {
                symbol: r,
                ty: s.ty,
                kind: s.kind,
                offset,
            }
        };

        let too_large = || TranslateError::FrameTooLarge(table.name.clone());
        let mut caller = Vec::new();
        let mut callee = Vec::new();
        let (mut ints, mut sses) = (0, 0);
        let mut caller_offset = FIRST_STACK_ARG;
        let mut callee_offset = 0;
        for r in params {
            let ty = mic.type_of(r);
            let in_register = match ArgClass::of(&ty) {
                ArgClass::Integer => {
                    ints += 1;
                    ints <= NUM_INT_ARG_REGS
                }
                ArgClass::Sse => {
                    sses += 1;
                    sses <= NUM_SSE_ARG_REGS
                }
            };
            if in_register {
                callee_offset = next_slot(callee_offset, &ty).ok_or_else(too_large)?;
                callee.push(record(r, callee_offset));
            } else {
                // every stack argument occupies its own eightbyte.
                caller_offset = round_up(caller_offset, WORD_SIZE);
                caller.push(record(r, caller_offset));
                caller_offset += WORD_SIZE;
            }
        }
        for r in vars {
            callee_offset = next_slot(callee_offset, &mic.type_of(r)).ok_or_else(too_large)?;
            callee.push(record(r, callee_offset));
        }

        // leaves room for the rounding below.
        if callee_offset < -(i32::MAX - 15) {
            return Err(too_large());
        }
        let frame_size = round_up(-callee_offset, 16);
        caller.reverse();
        let records: Vec<Record> = caller.into_iter().chain(callee).collect();
        let loc_map = records
            .iter()
            .enumerate()
            .map(|(i, rec)| (rec.symbol, i))
            .collect();
        let const_map = constants.iter().enumerate().map(|(i, r)| (*r, i)).collect();

        debug!(
            function = %table.name,
            frame_size,
            records = records.len(),
            constants = constants.len(),
            "laid out activation record"
        );
        Ok(ActivationRecord {
            name: table.name.clone(),
            records,
            loc_map,
            const_map,
            constants,
            ret_val,
            frame_size,
        })
    }

    pub fn access(&self, r: SymbolRef) -> Option<Access> {
        if let Some(i) = self.loc_map.get(&r) {
            return Some(Access::InFrame(self.records[*i].offset));
        }
        self.const_map.get(&r).map(|i| Access::Constant(*i))
    }

    pub fn offset(&self, r: SymbolRef) -> Option<i32> {
        self.loc_map.get(&r).map(|i| self.records[*i].offset)
    }

    /// Bytes to subtract from rsp after the prologue; always a multiple of 16.
    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    /// Parameters passed in registers, in declaration order, with their register.
    pub fn register_params(&self) -> Vec<(&Record, ArgReg)> {
        let (mut ints, mut sses) = (0, 0);
        let mut res = Vec::new();
        for rec in self.records.iter().filter(|r| r.kind == SymbolKind::Param && r.offset < 0) {
            match ArgClass::of(&rec.ty) {
                ArgClass::Integer => {
                    res.push((rec, ArgReg::Gp(ARG_REGS[ints])));
                    ints += 1;
                }
                ArgClass::Sse => {
                    res.push((rec, ArgReg::Xmm(sses)));
                    sses += 1;
                }
            }
        }
        res
    }

    /// Dynamic matrices this function allocates and must free on exit.
    pub fn owned_matrices(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| {
            r.ty.is_dynamic_matrix() && matches!(r.kind, SymbolKind::Local | SymbolKind::Temp)
        })
    }
}
