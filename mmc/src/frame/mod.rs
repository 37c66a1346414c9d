pub mod x86_64;

use crate::types::DataType;

/// Where a symbol lives relative to the activation record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    // FP + offset
    InFrame(i32),
    // index into the function's constant pool
    Constant(usize),
}

/// Argument passing class. The two classes consume their registers independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgClass {
    Integer,
    Sse,
}

impl ArgClass {
    pub fn of(ty: &DataType) -> Self {
        if ty.is_double() {
            ArgClass::Sse
        } else {
            ArgClass::Integer
        }
    }
}

#[inline]
pub fn align_down(offset: i32, align: i32) -> i32 {
    offset & !(align - 1)
}

#[inline]
pub fn round_up(n: i32, align: i32) -> i32 {
    (n + align - 1) / align * align
}
