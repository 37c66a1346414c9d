use std::fmt;

use strum_macros::Display;

use crate::types::DataType;

pub type TableId = usize;

/// The global table. It is its own parent.
pub const GLOBAL_TABLE: TableId = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SymbolKind {
    #[strum(serialize = "local")]
    Local,
    #[strum(serialize = "temp")]
    Temp,
    #[strum(serialize = "param")]
    Param,
    #[strum(serialize = "retval")]
    RetVal,
    #[strum(serialize = "const")]
    Const,
}

/// Literal payload of an initialized symbol.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Char(u8),
    Int(i32),
    Double(f64),
    /// Index into the string table.
    Str(usize),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Char(_) => DataType::CHAR,
            Value::Int(_) => DataType::INT,
            Value::Double(_) => DataType::DOUBLE,
            Value::Str(_) => DataType::CHAR.pointer_to(),
        }
    }

    /// Converts between the scalar literal kinds, `None` for strings.
    pub fn convert(&self, to: &DataType) -> Option<Value> {
        let (i, d) = match *self {
            Value::Char(c) => (c as i8 as i32, c as i8 as f64),
            Value::Int(i) => (i, i as f64),
            Value::Double(d) => (d as i32, d),
            Value::Str(_) => return None,
        };
        if to.is_char() {
            Some(Value::Char(i as u8))
        } else if to.is_int() || to.is_bool() {
            Some(Value::Int(i))
        } else if to.is_double() {
            Some(Value::Double(d))
        } else {
            None
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Char(c) => write!(f, "{:?}", *c as char),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{:?}", d),
            Value::Str(idx) => write!(f, "str#{}", idx),
        }
    }
}

/// Stable handle to a symbol: the table it lives in and its position there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolRef {
    pub table: TableId,
    pub index: usize,
}

#[derive(Clone, Debug)]
pub struct Symbol {
    /// Fully mangled name, e.g. `::main::a`.
    pub id: String,
    pub ty: DataType,
    pub kind: SymbolKind,
    /// `Some` iff the symbol carries a compile time value.
    pub value: Option<Value>,
    /// Nested scope owned by this symbol; only function symbols have one.
    pub child: Option<TableId>,
}

impl Symbol {
    pub fn new(id: String, ty: DataType, kind: SymbolKind) -> Self {
        Symbol {
            id,
            ty,
            kind,
            value: None,
            child: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    /// The name without its scope prefix.
    pub fn short_name(&self) -> &str {
        self.id.rsplit("::").next().unwrap_or(&self.id)
    }
}

#[derive(Debug)]
pub struct SymbolTable {
    pub id: TableId,
    pub name: String,
    pub parent: TableId,
    /// Prefix prepended to every name declared in this table.
    pub prefix: String,
    pub symbols: Vec<Symbol>,
    pub params: usize,
    /// Cleared for functions that were only declared.
    pub is_defined: bool,
}

impl SymbolTable {
    pub fn new(id: TableId, name: &str, parent: TableId, prefix: String) -> Self {
        SymbolTable {
            id,
            name: name.to_string(),
            parent,
            prefix,
            symbols: Vec::new(),
            params: 0,
            is_defined: true,
        }
    }

    pub fn params(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|s| s.kind == SymbolKind::Param)
    }

    pub fn retval(&self) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.kind == SymbolKind::RetVal)
    }
}

impl fmt::Display for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Symbol table {} `{}` (parent {}, {} params{})",
            self.id,
            self.name,
            self.parent,
            self.params,
            if self.is_defined { "" } else { ", declared only" }
        )?;
        for s in &self.symbols {
            write!(f, "\t{:<20} {:<16} {:<8}", s.id, s.ty.to_string(), s.kind.to_string())?;
            if let Some(v) = &s.value {
                write!(f, " = {}", v)?;
            }
            if let Some(child) = s.child {
                write!(f, " -> table {}", child)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_strips_scope() {
        let s = Symbol::new("::main::count".into(), DataType::INT, SymbolKind::Local);
        assert_eq!("count", s.short_name());
        let g = Symbol::new("::g".into(), DataType::INT, SymbolKind::Local);
        assert_eq!("g", g.short_name());
    }

    #[test]
    fn value_conversion() {
        assert_eq!(Some(Value::Double(3.0)), Value::Int(3).convert(&DataType::DOUBLE));
        assert_eq!(Some(Value::Int(2)), Value::Double(2.9).convert(&DataType::INT));
        assert_eq!(Some(Value::Int(97)), Value::Char(b'a').convert(&DataType::INT));
        assert_eq!(None, Value::Str(1).convert(&DataType::INT));
    }
}
