use std::fmt;

pub const POINTER_SIZE: u32 = 8;
/// Bytes reserved in front of every matrix for `[rows:i32][cols:i32]`.
pub const MATRIX_HEADER: u32 = 8;
pub const ELEMENT_SIZE: u32 = 8;
/// Largest object a frame or the data section can address with a 32 bit offset.
pub const MAX_OBJECT_SIZE: u32 = i32::MAX as u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BasicKind {
    Void,
    Bool,
    Char,
    Int,
    Double,
    Function,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BaseType {
    Basic(BasicKind),
    /// `rows == cols == 0` is a matrix whose dimensions are only known at runtime.
    Matrix { rows: u32, cols: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataType {
    pub pointers: usize,
    pub base: BaseType,
}

impl DataType {
    pub const VOID: DataType = DataType::basic(BasicKind::Void);
    pub const BOOL: DataType = DataType::basic(BasicKind::Bool);
    pub const CHAR: DataType = DataType::basic(BasicKind::Char);
    pub const INT: DataType = DataType::basic(BasicKind::Int);
    pub const DOUBLE: DataType = DataType::basic(BasicKind::Double);
    pub const FUNCTION: DataType = DataType::basic(BasicKind::Function);
    pub const DYNAMIC_MATRIX: DataType = DataType::matrix(0, 0);

    pub const fn basic(kind: BasicKind) -> Self {
        DataType {
            pointers: 0,
            base: BaseType::Basic(kind),
        }
    }

    pub const fn matrix(rows: u32, cols: u32) -> Self {
        DataType {
            pointers: 0,
            base: BaseType::Matrix { rows, cols },
        }
    }

    /// A static matrix type, or `None` when `rows x cols` doubles plus the header
    /// would not fit in `MAX_OBJECT_SIZE` bytes.
    pub fn checked_matrix(rows: u32, cols: u32) -> Option<Self> {
        let bytes = u64::from(rows) * u64::from(cols) * u64::from(ELEMENT_SIZE);
        if bytes + u64::from(MATRIX_HEADER) > u64::from(MAX_OBJECT_SIZE) {
            return None;
        }
        Some(DataType::matrix(rows, cols))
    }

    pub fn pointer_to(self) -> Self {
        DataType {
            pointers: self.pointers + 1,
            base: self.base,
        }
    }

    /// The type obtained by dereferencing; `None` for non pointers.
    pub fn pointee(self) -> Option<Self> {
        if self.pointers == 0 {
            return None;
        }
        Some(DataType {
            pointers: self.pointers - 1,
            base: self.base,
        })
    }

    fn is_basic(&self, kind: BasicKind) -> bool {
        self.pointers == 0 && self.base == BaseType::Basic(kind)
    }

    pub fn is_pointer(&self) -> bool {
        self.pointers > 0
    }

    pub fn is_void(&self) -> bool {
        self.is_basic(BasicKind::Void)
    }

    pub fn is_bool(&self) -> bool {
        self.is_basic(BasicKind::Bool)
    }

    pub fn is_char(&self) -> bool {
        self.is_basic(BasicKind::Char)
    }

    pub fn is_int(&self) -> bool {
        self.is_basic(BasicKind::Int)
    }

    pub fn is_double(&self) -> bool {
        self.is_basic(BasicKind::Double)
    }

    pub fn is_function(&self) -> bool {
        self.is_basic(BasicKind::Function)
    }

    pub fn is_matrix(&self) -> bool {
        self.pointers == 0 && matches!(self.base, BaseType::Matrix { .. })
    }

    pub fn is_static_matrix(&self) -> bool {
        self.pointers == 0 && matches!(self.base, BaseType::Matrix { rows, cols } if rows > 0 && cols > 0)
    }

    pub fn is_dynamic_matrix(&self) -> bool {
        self.is_matrix() && !self.is_static_matrix()
    }

    /// char, int or double.
    pub fn is_scalar(&self) -> bool {
        self.is_char() || self.is_int() || self.is_double()
    }

    /// Values that occupy a 4 byte slot in a frame.
    pub fn is_integral(&self) -> bool {
        self.is_bool() || self.is_char() || self.is_int()
    }

    /// Dimensions of a static matrix.
    pub fn dims(&self) -> Option<(u32, u32)> {
        match self.base {
            BaseType::Matrix { rows, cols } if self.pointers == 0 && rows > 0 && cols > 0 => {
                Some((rows, cols))
            }
            _ => None,
        }
    }

    pub fn size(&self) -> u32 {
        if self.pointers > 0 {
            return POINTER_SIZE;
        }
        match self.base {
            BaseType::Basic(BasicKind::Void) | BaseType::Basic(BasicKind::Function) => 0,
            BaseType::Basic(BasicKind::Bool) | BaseType::Basic(BasicKind::Char) => 1,
            BaseType::Basic(BasicKind::Int) => 4,
            BaseType::Basic(BasicKind::Double) => 8,
            // saturates; `checked_matrix` keeps real programs far below this.
            BaseType::Matrix { rows, cols } if rows > 0 && cols > 0 => rows
                .saturating_mul(cols)
                .saturating_mul(ELEMENT_SIZE)
                .saturating_add(MATRIX_HEADER),
            BaseType::Matrix { .. } => POINTER_SIZE,
        }
    }

    /// The common type of a binary arithmetic operation, `VOID` when there is none.
    pub fn max_type(a: DataType, b: DataType) -> DataType {
        let rank = |t: &DataType| {
            if t.is_double() {
                Some(4)
            } else if t.is_int() {
                Some(3)
            } else if t.is_char() {
                Some(2)
            } else if t.is_bool() {
                Some(1)
            } else {
                None
            }
        };
        match (rank(&a), rank(&b)) {
            (Some(x), Some(y)) => {
                if x >= y {
                    a
                } else {
                    b
                }
            }
            _ => DataType::VOID,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            BaseType::Basic(kind) => {
                let name = match kind {
                    BasicKind::Void => "void",
                    BasicKind::Bool => "bool",
                    BasicKind::Char => "char",
                    BasicKind::Int => "int",
                    BasicKind::Double => "double",
                    BasicKind::Function => "function",
                };
                write!(f, "{}", name)?;
            }
            BaseType::Matrix { rows, cols } if rows > 0 && cols > 0 => {
                write!(f, "Matrix({}, {})", rows, cols)?
            }
            BaseType::Matrix { .. } => write!(f, "Matrix")?,
        }
        for _ in 0..self.pointers {
            write!(f, "*")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(4, DataType::INT.size());
        assert_eq!(1, DataType::CHAR.size());
        assert_eq!(8, DataType::DOUBLE.size());
        assert_eq!(8, DataType::CHAR.pointer_to().size());
        assert_eq!(8 + 6 * 8, DataType::matrix(2, 3).size());
        assert_eq!(8, DataType::DYNAMIC_MATRIX.size());
    }

    #[test]
    fn huge_matrices_do_not_wrap() {
        assert_eq!(u32::MAX, DataType::matrix(100000, 100000).size());
        assert_eq!(None, DataType::checked_matrix(100000, 100000));
        assert_eq!(None, DataType::checked_matrix(16384, 16384));
        // 8 + 16384 * 16383 * 8 still fits below 2 GiB.
        assert_eq!(Some(DataType::matrix(16384, 16383)), DataType::checked_matrix(16384, 16383));
    }

    #[test]
    fn structural_equality() {
        assert_eq!(DataType::matrix(2, 3), DataType::matrix(2, 3));
        assert_ne!(DataType::matrix(2, 3), DataType::matrix(3, 2));
        assert_ne!(DataType::INT, DataType::INT.pointer_to());
        assert_eq!(Some(DataType::INT), DataType::INT.pointer_to().pointee());
    }

    #[test]
    fn matrix_predicates() {
        assert!(DataType::matrix(1, 1).is_static_matrix());
        assert!(DataType::DYNAMIC_MATRIX.is_dynamic_matrix());
        assert!(!DataType::DYNAMIC_MATRIX.pointer_to().is_matrix());
        assert_eq!(None, DataType::DYNAMIC_MATRIX.dims());
        assert_eq!(Some((4, 5)), DataType::matrix(4, 5).dims());
    }

    #[test]
    fn max_type_picks_widest_scalar() {
        assert_eq!(DataType::DOUBLE, DataType::max_type(DataType::INT, DataType::DOUBLE));
        assert_eq!(DataType::INT, DataType::max_type(DataType::CHAR, DataType::INT));
        assert_eq!(
            DataType::VOID,
            DataType::max_type(DataType::INT, DataType::matrix(2, 2))
        );
        assert_eq!(
            DataType::VOID,
            DataType::max_type(DataType::INT.pointer_to(), DataType::INT)
        );
    }

    #[test]
    fn display() {
        assert_eq!("int*", DataType::INT.pointer_to().to_string());
        assert_eq!("Matrix(2, 3)", DataType::matrix(2, 3).to_string());
        assert_eq!("Matrix", DataType::DYNAMIC_MATRIX.to_string());
    }
}
