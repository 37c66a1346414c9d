use crate::symtab::SymbolRef;

pub type AddressList = Vec<usize>;

/// What an expression evaluated to while the front end walks the syntax tree.
///
/// * value: `symbol == aux_symbol`, `is_reference == false`
/// * simple reference (assignable name): `symbol == aux_symbol`, `is_reference`
/// * pointer reference `*p`: `aux_symbol` is `p`, `symbol` a pointee typed temporary
///   that only receives the loaded value when the expression is used as an rvalue
/// * matrix reference `A[i][j]`: `symbol` is `A`, `aux_symbol` the int byte offset
/// * boolean: jump lists waiting for their true/false targets
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Expression {
    pub symbol: Option<SymbolRef>,
    pub aux_symbol: Option<SymbolRef>,
    pub is_reference: bool,
    pub is_boolean: bool,
    pub true_list: AddressList,
    pub false_list: AddressList,
}

impl Expression {
    pub fn value(r: SymbolRef) -> Self {
        Expression {
            symbol: Some(r),
            aux_symbol: Some(r),
            ..Default::default()
        }
    }

    pub fn simple_reference(r: SymbolRef) -> Self {
        Expression {
            symbol: Some(r),
            aux_symbol: Some(r),
            is_reference: true,
            ..Default::default()
        }
    }

    pub fn pointer_reference(pointee: SymbolRef, pointer: SymbolRef) -> Self {
        Expression {
            symbol: Some(pointee),
            aux_symbol: Some(pointer),
            is_reference: true,
            ..Default::default()
        }
    }

    pub fn matrix_reference(matrix: SymbolRef, offset: SymbolRef) -> Self {
        Expression {
            symbol: Some(matrix),
            aux_symbol: Some(offset),
            is_reference: true,
            ..Default::default()
        }
    }

    pub fn boolean(true_list: AddressList, false_list: AddressList) -> Self {
        Expression {
            is_boolean: true,
            true_list,
            false_list,
            ..Default::default()
        }
    }

    /// Result of calling a function returning void.
    pub fn void() -> Self {
        Expression::default()
    }

    pub fn is_void(&self) -> bool {
        self.symbol.is_none() && !self.is_boolean
    }
}

pub fn merge(mut a: AddressList, b: AddressList) -> AddressList {
    a.extend(b);
    a
}
