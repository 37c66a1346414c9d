pub use cfgrammar::Span;
use strum_macros::Display;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSpec {
    #[strum(serialize = "void")]
    Void,
    #[strum(serialize = "char")]
    Char,
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "double")]
    Double,
    #[strum(serialize = "Matrix")]
    Matrix,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Plus,
    Minus,
    Times,
    Divide,
    Modulo,
    Shl,
    Shr,
    BitAnd,
    BitXor,
    BitOr,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    AddressOf,
    Deref,
    Plus,
    Minus,
    BitNot,
    Not,
}

#[derive(Display, Debug)]
pub enum Expr {
    IntLit(Span),
    FloatLit(Span),
    CharLit(Span),
    StringLit(Span),
    Id(Span),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Relational {
        op: RelOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        span: Span,
    },
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
        span: Span,
    },
    /// `m[row][col]`
    Index {
        matrix: Box<Expr>,
        row: Box<Expr>,
        col: Box<Expr>,
        span: Span,
    },
    Call {
        name: Span,
        args: Vec<Expr>,
        span: Span,
    },
    /// `++x`, `x--` and friends. `prefix` tells whether the new value is the result.
    IncDec {
        increment: bool,
        prefix: bool,
        operand: Box<Expr>,
        span: Span,
    },
    Transpose {
        operand: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::IntLit(s)
            | Expr::FloatLit(s)
            | Expr::CharLit(s)
            | Expr::StringLit(s)
            | Expr::Id(s) => *s,
            Expr::Binary { span, .. }
            | Expr::Relational { span, .. }
            | Expr::Logical { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Assign { span, .. }
            | Expr::Conditional { span, .. }
            | Expr::Index { span, .. }
            | Expr::Call { span, .. }
            | Expr::IncDec { span, .. }
            | Expr::Transpose { span, .. } => *span,
        }
    }
}

#[derive(Debug)]
pub struct Param {
    pub ty: TypeSpec,
    pub declarator: Declarator,
    pub span: Span,
}

#[derive(Display, Debug)]
pub enum DeclaratorKind {
    Plain,
    /// `A[rows][cols]`
    Matrix(Box<Expr>, Box<Expr>),
    Function(Vec<Param>),
}

#[derive(Debug)]
pub struct Declarator {
    pub name: Span,
    pub pointers: usize,
    pub kind: DeclaratorKind,
    pub span: Span,
}

#[derive(Debug)]
pub enum Initializer {
    Expr(Expr),
    /// Rows separated by `;`, elements by `,`.
    Matrix(Vec<Vec<Expr>>, Span),
}

#[derive(Debug)]
pub struct InitDeclarator {
    pub declarator: Declarator,
    pub init: Option<Initializer>,
}

#[derive(Debug)]
pub struct Declaration {
    pub ty: TypeSpec,
    pub declarators: Vec<InitDeclarator>,
    pub span: Span,
}

#[derive(Debug)]
pub struct FunctionDef {
    pub ty: TypeSpec,
    pub declarator: Declarator,
    pub body: Vec<BlockItem>,
    pub span: Span,
}

#[derive(Debug)]
pub enum ExternalDecl {
    Function(FunctionDef),
    Declaration(Declaration),
}

#[derive(Debug)]
pub enum BlockItem {
    Declaration(Declaration),
    Statement(Stmt),
}

#[derive(Display, Debug)]
pub enum Stmt {
    Compound(Vec<BlockItem>),
    Expr(Option<Expr>),
    If {
        cond: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
    },
    For {
        init: Option<Expr>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Return(Option<Expr>, Span),
}
