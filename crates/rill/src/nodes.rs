//! The executable node tree.
//!
//! There is no separate AST/IR split: the parser produces [`NodeLoc`] trees
//! and the evaluator walks them directly. Function bodies and class
//! declarations are shared behind `Rc` so closures and spawned coroutines
//! can hold onto them without cloning subtrees.

use std::rc::Rc;

use crate::{intern::StringId, source::Span, value::Value};

/// Binary operators that evaluate both operands.
///
/// Short-circuiting `&&`/`||` and the elvis operator are separate node
/// variants because they must not evaluate their right-hand side eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Ushr,
    Eq,
    NotEq,
    RefEq,
    RefNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    /// `<=>`, evaluating to an `Int` from `compareTo`.
    Shuttle,
    /// `a => b`, constructing a two-element Entry.
    Entry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnOp {
    Neg,
    Pos,
    Not,
    BitNot,
}

/// Assignment flavors; compound forms read the target first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    /// `?=` - assigns only when the target currently reads as `Null`.
    IfNull,
}

/// Member visibility, default public.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Visibility {
    #[default]
    Public,
    Protected,
    Private,
}

/// One declared parameter.
#[derive(Debug)]
pub(crate) struct Param {
    pub name: StringId,
    /// Default value expression, evaluated in the callee scope on demand.
    pub default: Option<NodeLoc>,
    /// Trailing `...` variadic - collects leftover positional args.
    pub variadic: bool,
    /// `val`/`var` prefix in a class header promotes the parameter to a field.
    pub promote: Option<Promote>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Promote {
    pub mutable: bool,
    pub visibility: Visibility,
}

/// A callable signature.
///
/// `has_header` distinguishes a lambda written without a parameter list
/// (which binds the implicit `it`) from an explicit empty header `() ->`.
#[derive(Debug)]
pub(crate) struct Signature {
    pub params: Vec<Param>,
    pub has_header: bool,
}

impl Signature {
    pub fn empty() -> Self {
        Self {
            params: Vec::new(),
            has_header: true,
        }
    }

    pub fn headerless() -> Self {
        Self {
            params: Vec::new(),
            has_header: false,
        }
    }

    pub fn variadic_index(&self) -> Option<usize> {
        self.params.iter().position(|p| p.variadic)
    }
}

/// A function, method, lambda or property accessor definition.
#[derive(Debug)]
pub(crate) struct FunDef {
    /// `None` for lambdas.
    pub name: Option<StringId>,
    /// Label targeted by `return@label`. Named functions label themselves;
    /// lambdas can be labelled with `@name { ... }`.
    pub label: Option<StringId>,
    pub sig: Rc<Signature>,
    pub body: Rc<NodeLoc>,
    /// `fun f(x) = expr` shorthand - `return` is rejected at parse time.
    pub is_expr_body: bool,
    /// `fun f by delegate`.
    pub delegate: Option<Rc<NodeLoc>>,
}

/// Argument at a call site, in source order.
#[derive(Debug)]
pub(crate) enum ArgNode {
    Pos(NodeLoc),
    Named(StringId, NodeLoc),
    /// `...expr` - a `List` expands positionally, a `Map` expands as named args.
    Splat(NodeLoc),
}

#[derive(Debug)]
pub(crate) enum ListItem {
    Item(NodeLoc),
    Spread(NodeLoc),
}

/// Map literal entries. Keys are always literal strings (identifier keys
/// are their name); computed keys are not part of the literal grammar.
#[derive(Debug)]
pub(crate) enum MapItem {
    Pair { key: String, value: NodeLoc },
    /// `id:` shorthand for `"id": id`.
    Shorthand(StringId),
    /// `...other` - merged left-to-right, rightmost wins.
    Spread(NodeLoc),
}

/// Destructuring pattern element: `[a, rest..., c]`, nesting allowed,
/// at most one splat per level.
#[derive(Debug)]
pub(crate) enum PatItem {
    Name(StringId),
    Nested(Vec<PatItem>),
    /// `rest...` or a bare `...` that discards the interior.
    Splat(Option<StringId>),
}

#[derive(Debug)]
pub(crate) enum ForTarget {
    Name(StringId),
    Pattern(Vec<PatItem>),
}

#[derive(Debug)]
pub(crate) struct VarDecl {
    pub name: StringId,
    pub mutable: bool,
    pub visibility: Visibility,
    /// Missing initialiser leaves the binding `Unset` until single-assigned.
    pub init: Option<NodeLoc>,
    /// `val x by delegate`.
    pub delegate: Option<NodeLoc>,
}

/// One `catch` clause. No classes means "catch everything descending from
/// the root error class"; no binding means the implicit `it`.
#[derive(Debug)]
pub(crate) struct CatchClause {
    pub binding: Option<StringId>,
    pub classes: Vec<NodeLoc>,
    pub body: NodeLoc,
}

#[derive(Debug)]
pub(crate) enum WhenCond {
    /// Bare expression: equality with the subject.
    Equals(NodeLoc),
    In { negated: bool, expr: NodeLoc },
    Is { negated: bool, expr: NodeLoc },
}

#[derive(Debug)]
pub(crate) struct WhenBranch {
    /// Comma-separated conditions are a logical-or with early exit.
    pub conds: Vec<WhenCond>,
    pub body: NodeLoc,
}

/// A field declaration inside a class body (or a `static` one).
#[derive(Debug)]
pub(crate) struct FieldDecl {
    pub name: StringId,
    pub mutable: bool,
    pub visibility: Visibility,
    pub init: Option<NodeLoc>,
    pub delegate: Option<NodeLoc>,
}

#[derive(Debug)]
pub(crate) struct MethodDecl {
    pub def: Rc<FunDef>,
    pub visibility: Visibility,
    pub is_static: bool,
    pub is_abstract: bool,
}

/// A property with custom accessors; there is no automatic backing field.
#[derive(Debug)]
pub(crate) struct PropDecl {
    pub name: StringId,
    pub visibility: Visibility,
    pub getter: Option<Rc<FunDef>>,
    pub setter: Option<Rc<FunDef>>,
}

#[derive(Debug)]
pub(crate) struct BaseDecl {
    /// Expression resolving to the base class.
    pub expr: NodeLoc,
    /// Constructor arguments forwarded to the base, evaluated in the
    /// subclass's construction scope.
    pub args: Vec<ArgNode>,
}

/// A class / object / interface declaration.
#[derive(Debug)]
pub(crate) struct ClassDef {
    pub name: StringId,
    pub sig: Rc<Signature>,
    pub bases: Vec<BaseDecl>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
    pub props: Vec<PropDecl>,
    /// `init { ... }` blocks and stray body statements, in declaration order.
    pub inits: Vec<NodeLoc>,
    pub statics: Vec<FieldDecl>,
    pub nested: Vec<Rc<ClassDef>>,
    pub is_abstract: bool,
    pub is_open: bool,
    /// `object Name { ... }` - the single instance is created eagerly.
    pub is_object: bool,
    pub is_interface: bool,
}

#[derive(Debug)]
pub(crate) struct EnumDef {
    pub name: StringId,
    pub entries: Vec<StringId>,
}

/// A node with its source span.
#[derive(Debug)]
pub(crate) struct NodeLoc {
    pub span: Span,
    pub node: Node,
}

impl NodeLoc {
    pub fn new(span: Span, node: Node) -> Self {
        Self { span, node }
    }
}

/// Everything is an expression: statements and expressions share one node
/// type, and every node evaluates to a value (possibly `Void`).
#[derive(Debug)]
pub(crate) enum Node {
    /// Immediate literal (`Int`, `Real`, `Bool`, `Char`, interned string,
    /// `null`, `void`, `true`, `false`).
    Literal(Value),
    Name(StringId),
    This,
    /// `this@Type` - qualified access selecting a declaring class's storage.
    QualifiedThis(StringId),
    Super,
    ListLit(Vec<ListItem>),
    MapLit(Vec<MapItem>),
    /// `a..b`, `a..<b` and the open-ended forms with omitted bounds.
    RangeLit {
        start: Option<Box<NodeLoc>>,
        end: Option<Box<NodeLoc>>,
        inclusive: bool,
    },
    Lambda(Rc<FunDef>),
    /// `dynamic { get { ... } set { ... } }`.
    Dynamic {
        getter: Option<Rc<FunDef>>,
        setter: Option<Rc<FunDef>>,
    },

    Binary {
        op: BinOp,
        lhs: Box<NodeLoc>,
        rhs: Box<NodeLoc>,
    },
    /// Short-circuit `&&` / `||`.
    Logic {
        and: bool,
        lhs: Box<NodeLoc>,
        rhs: Box<NodeLoc>,
    },
    /// `a ?: b` - right side evaluated only when the left reads as `Null`.
    Elvis {
        lhs: Box<NodeLoc>,
        rhs: Box<NodeLoc>,
    },
    Unary {
        op: UnOp,
        operand: Box<NodeLoc>,
    },
    /// `a in b` / `a !in b`, dispatching to `b.contains(a)`.
    InTest {
        negated: bool,
        lhs: Box<NodeLoc>,
        rhs: Box<NodeLoc>,
    },
    /// `a is C` / `a !is C`, class membership along the linearization.
    TypeTest {
        negated: bool,
        lhs: Box<NodeLoc>,
        class_expr: Box<NodeLoc>,
    },
    /// `a as C` - checked cast producing a view for qualified member access.
    Cast {
        lhs: Box<NodeLoc>,
        class_expr: Box<NodeLoc>,
    },
    /// `++x` / `x--` and friends.
    IncDec {
        pre: bool,
        inc: bool,
        target: Box<NodeLoc>,
    },
    Assign {
        op: AssignOp,
        target: Box<NodeLoc>,
        value: Box<NodeLoc>,
    },
    /// `[a, rest..., c] = expr` or `val [a, b] = expr`.
    Destructure {
        pattern: Vec<PatItem>,
        value: Box<NodeLoc>,
        /// `Some(mutable)` when this introduces bindings.
        decl: Option<bool>,
    },
    ValVar(Box<VarDecl>),
    Call {
        callee: Box<NodeLoc>,
        args: Vec<ArgNode>,
        /// `?(` - the call short-circuits to `Null` on a `Null` callee.
        optional: bool,
    },
    Index {
        object: Box<NodeLoc>,
        index: Box<NodeLoc>,
        optional: bool,
    },
    Member {
        object: Box<NodeLoc>,
        name: StringId,
        optional: bool,
    },
    /// `a::b`; `expr::class` yields the reflective class value.
    ScopeAccess {
        object: Box<NodeLoc>,
        name: StringId,
    },
    Block(Vec<NodeLoc>),
    If {
        cond: Box<NodeLoc>,
        then: Box<NodeLoc>,
        otherwise: Option<Box<NodeLoc>>,
    },
    While {
        label: Option<StringId>,
        cond: Box<NodeLoc>,
        body: Box<NodeLoc>,
        otherwise: Option<Box<NodeLoc>>,
    },
    /// `do { ... } while (cond)` - the condition sees the body's scope.
    DoWhile {
        label: Option<StringId>,
        body: Box<NodeLoc>,
        cond: Box<NodeLoc>,
        otherwise: Option<Box<NodeLoc>>,
    },
    For {
        label: Option<StringId>,
        target: ForTarget,
        iter: Box<NodeLoc>,
        body: Box<NodeLoc>,
        otherwise: Option<Box<NodeLoc>>,
    },
    Break {
        label: Option<StringId>,
        value: Option<Box<NodeLoc>>,
    },
    Continue {
        label: Option<StringId>,
    },
    Return {
        label: Option<StringId>,
        value: Option<Box<NodeLoc>>,
    },
    Throw {
        value: Box<NodeLoc>,
    },
    Try {
        body: Box<NodeLoc>,
        catches: Vec<CatchClause>,
        finally: Option<Box<NodeLoc>>,
    },
    When {
        subject: Box<NodeLoc>,
        branches: Vec<WhenBranch>,
        otherwise: Option<Box<NodeLoc>>,
    },
    FunDecl(Rc<FunDef>),
    ClassDecl(Rc<ClassDef>),
    EnumDecl(Rc<EnumDef>),
    Import {
        path: String,
        star: bool,
    },
    Package {
        name: String,
    },
    /// `@Name(args) decl` - the annotation callable runs at definition time.
    Annotated {
        name: StringId,
        args: Vec<ArgNode>,
        target: Box<NodeLoc>,
    },
}
