// three address code: one opcode, a result and up to two arguments per quad.
use crate::{
    errors::{Result, TranslateError},
    symtab::SymbolRef,
    translator::Translator,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    BitAnd,
    BitXor,
    BitOr,
    Shl,
    Shr,

    UMinus,
    BitNot,

    /// `z = x`
    Copy,
    /// `z = &x`
    Refer,
    /// `*z = x`
    LDeref,
    /// `z = *x`
    RDeref,
    /// `z[x] = y`, x is a byte offset from the matrix base.
    Lxc,
    /// `z = x[y]`, y is a byte offset from the matrix base.
    Rxc,

    /// `if x goto z`
    IfVal,
    /// `ifFalse x goto z`
    IfNot,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
    Goto,

    Param,
    /// `z = call x, y` with x the function name and y the argument count.
    Call,
    Return,
    FuncStart,
    FuncEnd,

    ConvToChar,
    ConvToInt,
    ConvToDouble,

    /// `z = alloc(x, y)`. Two ints are the dimensions; a lone matrix x lends its
    /// dimensions; matrices x and y give rows of x by cols of y; `alloc(_, y)` takes
    /// the transposed dimensions of y.
    Alloc,
    Dealloc,
    /// `z = x.'`
    Transpose,

    /// Closes the initializer instructions of the global `z`.
    Declare,
}

impl OpCode {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::Plus => "+",
            OpCode::Minus => "-",
            OpCode::Mult => "*",
            OpCode::Div => "/",
            OpCode::Mod => "%",
            OpCode::BitAnd => "&",
            OpCode::BitXor => "^",
            OpCode::BitOr => "|",
            OpCode::Shl => "<<",
            OpCode::Shr => ">>",
            OpCode::UMinus => "-",
            OpCode::BitNot => "~",
            OpCode::Lt => "<",
            OpCode::Lte => "<=",
            OpCode::Gt => ">",
            OpCode::Gte => ">=",
            OpCode::Eq => "==",
            OpCode::Neq => "!=",
            OpCode::ConvToChar => "char2",
            OpCode::ConvToInt => "int2",
            OpCode::ConvToDouble => "double2",
            _ => "",
        }
    }

    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            OpCode::Lt | OpCode::Lte | OpCode::Gt | OpCode::Gte | OpCode::Eq | OpCode::Neq
        )
    }

    pub fn is_jump(&self) -> bool {
        self.is_relational() || matches!(self, OpCode::Goto | OpCode::IfVal | OpCode::IfNot)
    }

    pub fn is_copy(&self) -> bool {
        matches!(
            self,
            OpCode::Copy
                | OpCode::Refer
                | OpCode::LDeref
                | OpCode::RDeref
                | OpCode::Lxc
                | OpCode::Rxc
        )
    }

    pub fn is_bitwise(&self) -> bool {
        matches!(
            self,
            OpCode::BitAnd
                | OpCode::BitXor
                | OpCode::BitOr
                | OpCode::Shl
                | OpCode::Shr
                | OpCode::BitNot
        )
    }

    pub fn is_conversion(&self) -> bool {
        matches!(
            self,
            OpCode::ConvToChar | OpCode::ConvToInt | OpCode::ConvToDouble
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    None,
    Symbol(SymbolRef),
    Literal(i64),
    /// Resolved jump target, an index into the quad array.
    Label(usize),
    /// Jump target still waiting to be back-patched.
    Pending,
    /// Raw text, used for function names.
    Name(String),
}

impl Operand {
    pub fn symbol(&self) -> Option<SymbolRef> {
        match self {
            Operand::Symbol(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }

    pub fn debug_to_string(&self, mic: &Translator) -> String {
        match self {
            Operand::None => String::new(),
            Operand::Symbol(r) => mic.symbol(*r).id.clone(),
            Operand::Literal(n) => n.to_string(),
            Operand::Label(l) => l.to_string(),
            Operand::Pending => "_".to_string(),
            Operand::Name(n) => n.clone(),
        }
    }
}

impl From<SymbolRef> for Operand {
    fn from(r: SymbolRef) -> Self {
        Operand::Symbol(r)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Taco {
    pub op: OpCode,
    pub result: Operand,
    pub arg1: Operand,
    pub arg2: Operand,
}

impl Taco {
    pub fn new(op: OpCode, result: Operand, arg1: Operand, arg2: Operand) -> Self {
        Taco {
            op,
            result,
            arg1,
            arg2,
        }
    }

    pub fn binary(op: OpCode, z: SymbolRef, x: impl Into<Operand>, y: impl Into<Operand>) -> Self {
        Taco::new(op, Operand::Symbol(z), x.into(), y.into())
    }

    pub fn unary(op: OpCode, z: SymbolRef, x: impl Into<Operand>) -> Self {
        Taco::new(op, Operand::Symbol(z), x.into(), Operand::None)
    }

    /// A conditional jump whose target gets patched later.
    pub fn branch(op: OpCode, x: SymbolRef, y: Option<SymbolRef>) -> Self {
        Taco::new(
            op,
            Operand::Pending,
            Operand::Symbol(x),
            y.map(Operand::Symbol).unwrap_or(Operand::None),
        )
    }

    pub fn goto() -> Self {
        Taco::new(OpCode::Goto, Operand::Pending, Operand::None, Operand::None)
    }

    /// The resolved target of a jump.
    pub fn target(&self) -> Option<usize> {
        match (self.op.is_jump(), &self.result) {
            (true, Operand::Label(l)) => Some(*l),
            _ => None,
        }
    }

    pub fn debug_to_string(&self, mic: &Translator) -> String {
        let z = self.result.debug_to_string(mic);
        let x = self.arg1.debug_to_string(mic);
        let y = self.arg2.debug_to_string(mic);
        match self.op {
            op if op.is_relational() => {
                format!("if {} {} {} goto {}", x, op.mnemonic(), y, z)
            }
            OpCode::Plus
            | OpCode::Minus
            | OpCode::Mult
            | OpCode::Div
            | OpCode::Mod
            | OpCode::BitAnd
            | OpCode::BitXor
            | OpCode::BitOr
            | OpCode::Shl
            | OpCode::Shr => format!("{} = {} {} {}", z, x, self.op.mnemonic(), y),
            OpCode::UMinus | OpCode::BitNot => format!("{} = {}{}", z, self.op.mnemonic(), x),
            op if op.is_conversion() => format!("{} = {}({})", z, op.mnemonic(), x),
            OpCode::Copy => format!("{} = {}", z, x),
            OpCode::Refer => format!("{} = &{}", z, x),
            OpCode::LDeref => format!("*{} = {}", z, x),
            OpCode::RDeref => format!("{} = *{}", z, x),
            OpCode::Lxc => format!("{}[{}] = {}", z, x, y),
            OpCode::Rxc => format!("{} = {}[{}]", z, x, y),
            OpCode::IfVal => format!("if {} goto {}", x, z),
            OpCode::IfNot => format!("ifFalse {} goto {}", x, z),
            OpCode::Goto => format!("goto {}", z),
            OpCode::Param => format!("param {}", z),
            OpCode::Call if self.result.is_none() => format!("call {}, {}", x, y),
            OpCode::Call => format!("{} = call {}, {}", z, x, y),
            OpCode::Return if self.result.is_none() => "return".to_string(),
            OpCode::Return => format!("return {}", z),
            OpCode::FuncStart => format!("{}: ", z),
            OpCode::FuncEnd => format!("function {} ends", z),
            OpCode::Alloc => format!("{} = alloc({}, {})", z, x, y),
            OpCode::Dealloc => format!("dealloc {}", z),
            OpCode::Transpose => format!("{} = {}.'", z, x),
            OpCode::Declare => format!("declare {}", z),
            _ => format!("{:?} {} {} {}", self.op, z, x, y),
        }
    }
}

/// Append-only instruction buffer. An address is an index into it.
#[derive(Debug, Default)]
pub struct QuadArray(Vec<Taco>);

impl QuadArray {
    pub fn new() -> Self {
        QuadArray(Vec::new())
    }

    pub fn push(&mut self, taco: Taco) -> usize {
        self.0.push(taco);
        self.0.len() - 1
    }

    /// The address the next pushed quad will get.
    pub fn next_instruction(&self) -> usize {
        self.0.len()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, address: usize) -> Option<&Taco> {
        self.0.get(address)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Taco> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Taco] {
        &self.0
    }

    /// Points the jump at `address` to `target`. Patching again overwrites.
    pub fn patch_target(&mut self, address: usize, target: usize) -> Result<()> {
        match self.0.get_mut(address) {
            Some(taco) if taco.op.is_jump() => {
                taco.result = Operand::Label(target);
                Ok(())
            }
            _ => Err(TranslateError::BadPatch(address)),
        }
    }

    pub fn patch_targets(&mut self, addresses: &[usize], target: usize) -> Result<()> {
        for address in addresses {
            self.patch_target(*address, target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy() -> SymbolRef {
        SymbolRef { table: 0, index: 0 }
    }

    #[test]
    fn patching_is_idempotent_and_overwrites() {
        let mut q = QuadArray::new();
        let j = q.push(Taco::branch(OpCode::Lt, dummy(), Some(dummy())));
        assert_eq!(Operand::Pending, q.get(j).unwrap().result);
        q.patch_target(j, 7).unwrap();
        q.patch_target(j, 7).unwrap();
        assert_eq!(Some(7), q.get(j).unwrap().target());
        q.patch_target(j, 9).unwrap();
        assert_eq!(Some(9), q.get(j).unwrap().target());
    }

    #[test]
    fn patching_a_non_jump_fails() {
        let mut q = QuadArray::new();
        let c = q.push(Taco::unary(OpCode::Copy, dummy(), dummy()));
        assert!(matches!(q.patch_target(c, 0), Err(TranslateError::BadPatch(0))));
        assert!(q.patch_target(42, 0).is_err());
    }

    #[test]
    fn patch_list() {
        let mut q = QuadArray::new();
        let a = q.push(Taco::goto());
        let b = q.push(Taco::goto());
        let end = q.next_instruction();
        q.patch_targets(&[a, b], end).unwrap();
        assert!(q.iter().all(|t| t.target() == Some(2)));
    }

    #[test]
    fn opcode_classes() {
        assert!(OpCode::Goto.is_jump());
        assert!(OpCode::IfNot.is_jump());
        assert!(!OpCode::Copy.is_jump());
        assert!(OpCode::Rxc.is_copy());
        assert!(OpCode::Shl.is_bitwise());
        assert!(OpCode::ConvToInt.is_conversion());
    }
}
