//! Abstract syntax tree input contract.
//!
//! The scanner and parser live outside this crate; they hand us a `Program`
//! tree and never see it again. The tree is immutable from the backend's
//! point of view: type inference records its results in side tables keyed by
//! `NodeId` rather than mutating nodes, and the typed tree built afterwards
//! borrows the AST for its whole lifetime.
//!
//! Every node carries a `Span` (file, line, column) and a producer-assigned
//! `NodeId`, unique within its `Program`. The `Builder` at the bottom of this
//! module is the construction aid producers (and this crate's tests) use to
//! get the id assignment right.

use crate::value::Value;
use core::fmt;

/// Identifies a source file in a multi-file compilation. The mapping from
/// `FileId` to path is owned by the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileId(pub u32);

/// A source position: file, 1-based line, 1-based column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Span {
    /// Source file.
    pub file: FileId,
    /// Line number, starting at 1. Zero means "unknown".
    pub line: u32,
    /// Column number, starting at 1. Zero means "unknown".
    pub column: u32,
}

impl Span {
    /// A span for synthesized nodes with no source position.
    pub fn none() -> Self {
        Self {
            file: FileId(0),
            line: 0,
            column: 0,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Unique id of an AST node within one `Program`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Is this an arithmetic operator?
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Rem
        )
    }

    /// Is this a comparison operator?
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// Is this a logical operator?
    pub fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "and",
            Self::Or => "or",
        };
        f.write_str(s)
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Unary plus; a no-op on numeric operands.
    Plus,
    /// Boolean not.
    Not,
}

impl fmt::Display for UnOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Neg => "-",
            Self::Plus => "+",
            Self::Not => "not",
        };
        f.write_str(s)
    }
}

/// A parsed type expression. The surface syntax only names primitives and
/// element-typed arrays, so unknown type names are a parse error and never
/// reach the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TypeExpr {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
    Str,
    Void,
    /// `[T]`
    Array(Box<TypeExpr>),
}

/// A type annotation node: a type expression with the source position of the
/// annotation.
#[derive(Clone, Debug)]
pub struct TypeAnnotation {
    /// Position of the annotation.
    pub span: Span,
    /// The annotated type.
    pub ty: TypeExpr,
}

/// An expression node.
#[derive(Debug)]
pub struct Expr {
    /// Node id, unique within the program.
    pub id: NodeId,
    /// Source position.
    pub span: Span,
    /// The expression itself.
    pub kind: ExprKind,
}

/// Expression variants.
#[derive(Debug)]
pub enum ExprKind {
    /// A literal value.
    Literal(Value),
    /// A variable or function reference. Names are always non-empty.
    Ident(String),
    /// `lhs op rhs`
    Binary {
        /// The binary operator.
        op: BinOp,
        /// Left-hand operand.
        lhs: Box<Expr>,
        /// Right-hand operand.
        rhs: Box<Expr>,
    },
    /// `op operand`
    Unary {
        /// The unary operator.
        op: UnOp,
        /// The operand.
        operand: Box<Expr>,
    },
    /// `cond ? then_val : else_val`
    Ternary {
        /// Condition expression.
        cond: Box<Expr>,
        /// Value when `cond` is true.
        then_val: Box<Expr>,
        /// Value when `cond` is false.
        else_val: Box<Expr>,
    },
    /// `operand as T`
    Cast {
        /// The expression being cast.
        operand: Box<Expr>,
        /// The target type.
        target: TypeAnnotation,
    },
    /// `callee(args...)`
    Call {
        /// Expression evaluating to the function to call.
        callee: Box<Expr>,
        /// Call arguments.
        args: Vec<Expr>,
    },
    /// `[e0, e1, ...]`
    ArrayLit(Vec<Expr>),
    /// `base[index]`
    Index {
        /// The indexed expression.
        base: Box<Expr>,
        /// The index expression.
        index: Box<Expr>,
    },
}

/// A function parameter.
#[derive(Debug)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Optional type annotation; absent annotations default to `i32`.
    pub annotation: Option<TypeAnnotation>,
    /// Position of the parameter.
    pub span: Span,
}

/// A function declaration.
#[derive(Debug)]
pub struct FunctionDecl {
    /// Function name.
    pub name: String,
    /// Parameters in order.
    pub params: Vec<Param>,
    /// Return type annotation; absent defaults to `void`.
    pub ret: Option<TypeAnnotation>,
    /// Body statements.
    pub body: Vec<Stmt>,
}

/// A statement node.
#[derive(Debug)]
pub struct Stmt {
    /// Node id, unique within the program.
    pub id: NodeId,
    /// Source position.
    pub span: Span,
    /// The statement itself.
    pub kind: StmtKind,
}

/// Statement variants.
#[derive(Debug)]
pub enum StmtKind {
    /// `let name = init` / `mut name: T = init`
    VarDecl {
        /// Variable name.
        name: String,
        /// Whether the variable is mutable.
        mutable: bool,
        /// Optional type annotation.
        annotation: Option<TypeAnnotation>,
        /// Optional initializer expression.
        init: Option<Expr>,
    },
    /// `name = value`. Assigning to an undeclared name declares it mutable.
    Assign {
        /// Name being assigned.
        name: String,
        /// Value being assigned.
        value: Expr,
    },
    /// `print(args...)`
    Print {
        /// Arguments to print.
        args: Vec<Expr>,
        /// Whether to print a trailing newline.
        newline: bool,
    },
    /// `if cond: then_body else: else_body`
    If {
        /// Condition expression.
        cond: Expr,
        /// Body executed when `cond` is true.
        then_body: Vec<Stmt>,
        /// Optional body executed when `cond` is false.
        else_body: Option<Vec<Stmt>>,
    },
    /// `while cond: body`
    While {
        /// Loop condition.
        cond: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `for var in start..end [step s]: body`. The range is half-open:
    /// iteration stops before `end`.
    ForRange {
        /// Loop variable name.
        var: String,
        /// Range start expression.
        start: Expr,
        /// Range end expression (exclusive).
        end: Expr,
        /// Optional step expression.
        step: Option<Expr>,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `for var in iterable: body`
    ForIter {
        /// Loop variable name.
        var: String,
        /// Expression being iterated over.
        iterable: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// A function declaration.
    Function(FunctionDecl),
    /// `return [value]`
    Return(Option<Expr>),
    /// A braced block introducing a scope.
    Block(Vec<Stmt>),
    /// An expression evaluated for its effects.
    Expr(Expr),
}

/// A whole compilation unit.
#[derive(Debug)]
pub struct Program {
    /// Top-level statements in source order.
    pub stmts: Vec<Stmt>,
}

/// Structural equality of expressions, ignoring spans and node ids.
///
/// This is the equality used to deduplicate loop-invariant candidates and to
/// match hoisted expressions during lowering: two expressions are equal when
/// they compute the same value given the same environment.
pub fn exprs_equal(a: &Expr, b: &Expr) -> bool {
    use ExprKind::*;
    match (&a.kind, &b.kind) {
        (Literal(x), Literal(y)) => x == y,
        (Ident(x), Ident(y)) => x == y,
        (
            Binary {
                op: oa,
                lhs: la,
                rhs: ra,
            },
            Binary {
                op: ob,
                lhs: lb,
                rhs: rb,
            },
        ) => oa == ob && exprs_equal(la, lb) && exprs_equal(ra, rb),
        (
            Unary {
                op: oa,
                operand: xa,
            },
            Unary {
                op: ob,
                operand: xb,
            },
        ) => oa == ob && exprs_equal(xa, xb),
        (
            Ternary {
                cond: ca,
                then_val: ta,
                else_val: ea,
            },
            Ternary {
                cond: cb,
                then_val: tb,
                else_val: eb,
            },
        ) => exprs_equal(ca, cb) && exprs_equal(ta, tb) && exprs_equal(ea, eb),
        (
            Cast {
                operand: xa,
                target: ta,
            },
            Cast {
                operand: xb,
                target: tb,
            },
        ) => ta.ty == tb.ty && exprs_equal(xa, xb),
        (
            Call {
                callee: ca,
                args: aa,
            },
            Call {
                callee: cb,
                args: ab,
            },
        ) => {
            exprs_equal(ca, cb)
                && aa.len() == ab.len()
                && aa.iter().zip(ab).all(|(x, y)| exprs_equal(x, y))
        }
        (ArrayLit(xa), ArrayLit(xb)) => {
            xa.len() == xb.len() && xa.iter().zip(xb).all(|(x, y)| exprs_equal(x, y))
        }
        (
            Index {
                base: ba,
                index: ia,
            },
            Index {
                base: bb,
                index: ib,
            },
        ) => exprs_equal(ba, bb) && exprs_equal(ia, ib),
        _ => false,
    }
}

/// AST construction aid.
///
/// Hands out sequential node ids and keeps the builder call sites terse.
/// Parsers are expected to hold one `Builder` per `Program`; tests use it
/// directly.
pub struct Builder {
    next_id: u32,
    span: Span,
}

impl Builder {
    /// Create a builder. Nodes get `Span::none()` until `at` is called.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            span: Span::none(),
        }
    }

    /// Set the span attached to subsequently built nodes.
    pub fn at(&mut self, line: u32, column: u32) -> &mut Self {
        self.span = Span {
            file: FileId(0),
            line,
            column,
        };
        self
    }

    fn id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Build an expression node around `kind`.
    pub fn expr(&mut self, kind: ExprKind) -> Expr {
        Expr {
            id: self.id(),
            span: self.span,
            kind,
        }
    }

    /// Build a statement node around `kind`.
    pub fn stmt(&mut self, kind: StmtKind) -> Stmt {
        Stmt {
            id: self.id(),
            span: self.span,
            kind,
        }
    }

    /// A literal expression.
    pub fn lit(&mut self, v: Value) -> Expr {
        self.expr(ExprKind::Literal(v))
    }

    /// An `i32` literal.
    pub fn int(&mut self, v: i32) -> Expr {
        self.lit(Value::I32(v))
    }

    /// An identifier expression.
    pub fn ident(&mut self, name: &str) -> Expr {
        self.expr(ExprKind::Ident(name.to_string()))
    }

    /// A binary expression.
    pub fn binary(&mut self, op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        self.expr(ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    /// A unary expression.
    pub fn unary(&mut self, op: UnOp, operand: Expr) -> Expr {
        self.expr(ExprKind::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    /// A call expression.
    pub fn call(&mut self, callee: Expr, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            callee: Box::new(callee),
            args,
        })
    }

    /// A type annotation with the builder's current span.
    pub fn annotation(&mut self, ty: TypeExpr) -> TypeAnnotation {
        TypeAnnotation {
            span: self.span,
            ty,
        }
    }

    /// `let name = init`.
    pub fn let_(&mut self, name: &str, init: Expr) -> Stmt {
        self.stmt(StmtKind::VarDecl {
            name: name.to_string(),
            mutable: false,
            annotation: None,
            init: Some(init),
        })
    }

    /// `mut name = init`.
    pub fn mut_(&mut self, name: &str, init: Expr) -> Stmt {
        self.stmt(StmtKind::VarDecl {
            name: name.to_string(),
            mutable: true,
            annotation: None,
            init: Some(init),
        })
    }

    /// `name = value`.
    pub fn assign(&mut self, name: &str, value: Expr) -> Stmt {
        self.stmt(StmtKind::Assign {
            name: name.to_string(),
            value,
        })
    }

    /// `print(args...)` with a trailing newline.
    pub fn print(&mut self, args: Vec<Expr>) -> Stmt {
        self.stmt(StmtKind::Print {
            args,
            newline: true,
        })
    }

    /// `for var in start..end: body` with step 1.
    pub fn for_range(&mut self, var: &str, start: Expr, end: Expr, body: Vec<Stmt>) -> Stmt {
        self.stmt(StmtKind::ForRange {
            var: var.to_string(),
            start,
            end,
            step: None,
            body,
        })
    }

    /// Finish: wrap statements into a `Program`.
    pub fn program(self, stmts: Vec<Stmt>) -> Program {
        Program { stmts }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
