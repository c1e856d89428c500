//! Tokens to executable nodes.
//!
//! Precedence-climbing over the token stream. Newlines terminate
//! statements and break postfix chains (except before a leading `.` so
//! fluent chains can wrap); inside delimiters and after binary operators
//! they are skipped. Comments are dropped before parsing begins.
//!
//! Brace disambiguation follows the surface rules: a brace at statement
//! position is a block; in expression position it is a map literal when
//! the first tokens form a `key:` / `"key":` / `...spread` sequence and a
//! lambda otherwise; directly after a call on the same line it is always
//! a trailing lambda.

use std::rc::Rc;

use crate::{
    exceptions::SyntaxError,
    intern::{Interns, StringId},
    lexer::{Kw, Tok, Token, lex},
    nodes::{
        ArgNode, AssignOp, BaseDecl, BinOp, CatchClause, ClassDef, EnumDef, FieldDecl, ForTarget,
        FunDef, ListItem, MapItem, MethodDecl, Node, NodeLoc, Param, PatItem, Promote, PropDecl,
        Signature, UnOp, VarDecl, Visibility, WhenBranch, WhenCond,
    },
    source::{Source, Span},
    value::Value,
};

/// Parses a whole compilation unit into a statement list.
pub(crate) fn parse(source: &Source, interns: &mut Interns) -> Result<Vec<NodeLoc>, SyntaxError> {
    let mut tokens = lex(source, interns)?;
    // Comments are tokens so tooling can keep them; the parser drops them.
    tokens.retain(|t| !matches!(t.tok, Tok::LineComment(_) | Tok::BlockComment(_)));
    let kw_as = interns.intern("as");
    let kw_dynamic = interns.intern("dynamic");
    let kw_get = interns.intern("get");
    let kw_set = interns.intern("set");
    let mut parser = Parser {
        tokens,
        pos: 0,
        interns,
        no_return: false,
        kw_as,
        kw_dynamic,
        kw_get,
        kw_set,
    };
    parser.parse_program()
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    interns: &'a mut Interns,
    /// Set while parsing a shorthand (`= expr`) function body, where
    /// `return` is rejected.
    no_return: bool,
    kw_as: StringId,
    kw_dynamic: StringId,
    kw_get: StringId,
    kw_set: StringId,
}

type PResult<T> = Result<T, SyntaxError>;

#[derive(Default, Clone, Copy)]
struct Mods {
    visibility: Visibility,
    is_static: bool,
    is_abstract: bool,
    is_open: bool,
}

impl Parser<'_> {
    // --- cursor helpers ----------------------------------------------------

    fn tok(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn tok_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map_or(&Tok::Eof, |t| &t.tok)
    }

    fn span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn prev_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1)].span
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.tok() == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> PResult<Span> {
        if self.tok() == tok {
            Ok(self.bump().span)
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.tok())))
        }
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.span())
    }

    fn skip_newlines(&mut self) {
        while matches!(self.tok(), Tok::Newline) {
            self.bump();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.tok(), Tok::Newline | Tok::Semicolon) {
            self.bump();
        }
    }

    fn expect_ident(&mut self, what: &str) -> PResult<StringId> {
        match *self.tok() {
            Tok::Ident(id) => {
                self.bump();
                Ok(id)
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    /// True when the current token can start an expression (used for the
    /// optional operands of `break`, `return` and open-ended ranges).
    fn starts_expression(&self) -> bool {
        matches!(
            self.tok(),
            Tok::Ident(_)
                | Tok::Int(_)
                | Tok::Real(_)
                | Tok::Str(_)
                | Tok::Char(_)
                | Tok::AtLabel(_)
                | Tok::Kw(
                    Kw::True
                        | Kw::False
                        | Kw::Null
                        | Kw::Void
                        | Kw::This
                        | Kw::Super
                        | Kw::If
                        | Kw::When
                        | Kw::Try
                        | Kw::While
                        | Kw::Do
                        | Kw::For
                        | Kw::Object
                )
                | Tok::LParen
                | Tok::LBracket
                | Tok::Not
                | Tok::Minus
                | Tok::Plus
                | Tok::Tilde
                | Tok::PlusPlus
                | Tok::MinusMinus
                | Tok::DotDot
                | Tok::DotDotLt
        )
    }

    /// Whether there is a newline between the previous token and the
    /// current one (trailing-lambda and postfix decisions).
    fn newline_before(&self) -> bool {
        self.pos > 0 && matches!(self.tokens[self.pos - 1].tok, Tok::Newline)
    }

    // --- program and statements --------------------------------------------

    fn parse_program(&mut self) -> PResult<Vec<NodeLoc>> {
        let mut out = Vec::new();
        self.skip_separators();
        while !matches!(self.tok(), Tok::Eof) {
            out.push(self.parse_statement()?);
            self.skip_separators();
        }
        Ok(out)
    }

    fn parse_statement(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        match self.tok().clone() {
            Tok::Label(label) => {
                self.bump();
                self.skip_newlines();
                match self.tok() {
                    Tok::Kw(Kw::While) => self.parse_while(Some(label)),
                    Tok::Kw(Kw::Do) => self.parse_do_while(Some(label)),
                    Tok::Kw(Kw::For) => self.parse_for(Some(label)),
                    _ => Err(self.error("a label must be followed by a loop")),
                }
            }
            Tok::AtLabel(name) if !matches!(self.tok_at(1), Tok::LBrace) => {
                self.bump();
                self.parse_annotation(name, start)
            }
            Tok::Kw(Kw::Val) => {
                self.bump();
                self.parse_valvar(false, Visibility::Public, start)
            }
            Tok::Kw(Kw::Var) => {
                self.bump();
                self.parse_valvar(true, Visibility::Public, start)
            }
            Tok::Kw(Kw::Fun | Kw::Fn) => {
                self.bump();
                let def = self.parse_fun_def(true)?;
                Ok(NodeLoc::new(start.to(self.prev_span()), Node::FunDecl(Rc::new(def))))
            }
            Tok::Kw(Kw::Private | Kw::Protected | Kw::Abstract | Kw::Open | Kw::Static) => {
                let mods = self.parse_mods();
                match self.tok() {
                    Tok::Kw(Kw::Val) => {
                        self.bump();
                        self.parse_valvar(false, mods.visibility, start)
                    }
                    Tok::Kw(Kw::Var) => {
                        self.bump();
                        self.parse_valvar(true, mods.visibility, start)
                    }
                    Tok::Kw(Kw::Fun | Kw::Fn) => {
                        self.bump();
                        let def = self.parse_fun_def(true)?;
                        Ok(NodeLoc::new(start.to(self.prev_span()), Node::FunDecl(Rc::new(def))))
                    }
                    Tok::Kw(Kw::Class) => {
                        self.bump();
                        self.parse_class(mods, false, false, start)
                    }
                    Tok::Kw(Kw::Interface) => {
                        self.bump();
                        self.parse_class(mods, false, true, start)
                    }
                    Tok::Kw(Kw::Object) => {
                        self.bump();
                        self.parse_class(mods, true, false, start)
                    }
                    _ => Err(self.error("modifiers must precede a declaration")),
                }
            }
            Tok::Kw(Kw::Class) => {
                self.bump();
                self.parse_class(Mods::default(), false, false, start)
            }
            Tok::Kw(Kw::Interface) => {
                self.bump();
                self.parse_class(Mods::default(), false, true, start)
            }
            Tok::Kw(Kw::Object) => {
                self.bump();
                self.parse_class(Mods::default(), true, false, start)
            }
            Tok::Kw(Kw::Enum) => {
                self.bump();
                // `enum class Name` is accepted alongside `enum Name`.
                self.eat(&Tok::Kw(Kw::Class));
                self.parse_enum(start)
            }
            Tok::Kw(Kw::Break) => {
                self.bump();
                let label = self.eat_at_label();
                let value = if self.starts_expression() && !matches!(self.tok(), Tok::Newline) {
                    Some(Box::new(self.parse_expr()?))
                } else {
                    None
                };
                Ok(NodeLoc::new(start.to(self.prev_span()), Node::Break { label, value }))
            }
            Tok::Kw(Kw::Continue) => {
                self.bump();
                let label = self.eat_at_label();
                Ok(NodeLoc::new(start.to(self.prev_span()), Node::Continue { label }))
            }
            Tok::Kw(Kw::Return) => {
                if self.no_return {
                    return Err(self.error("'return' is not allowed in a shorthand function body"));
                }
                self.bump();
                let label = self.eat_at_label();
                let value = if self.starts_expression() && !matches!(self.tok(), Tok::Newline) {
                    Some(Box::new(self.parse_expr()?))
                } else {
                    None
                };
                Ok(NodeLoc::new(start.to(self.prev_span()), Node::Return { label, value }))
            }
            Tok::Kw(Kw::Throw) => {
                self.bump();
                let value = Box::new(self.parse_expr()?);
                Ok(NodeLoc::new(start.to(self.prev_span()), Node::Throw { value }))
            }
            Tok::Kw(Kw::Import) => {
                self.bump();
                let (path, star) = self.parse_dotted_path()?;
                Ok(NodeLoc::new(start.to(self.prev_span()), Node::Import { path, star }))
            }
            Tok::Kw(Kw::Package) => {
                self.bump();
                let (name, star) = self.parse_dotted_path()?;
                if star {
                    return Err(self.error("a package name cannot end in '*'"));
                }
                Ok(NodeLoc::new(start.to(self.prev_span()), Node::Package { name }))
            }
            Tok::LBrace => {
                if self.brace_is_expression() {
                    self.parse_expr()
                } else {
                    self.parse_block()
                }
            }
            Tok::LBracket => {
                // Possibly a destructuring assignment to existing names.
                let saved = self.pos;
                if let Ok(pattern) = self.try_parse_pattern()
                    && self.eat(&Tok::Assign)
                {
                    let value = Box::new(self.parse_expr()?);
                    return Ok(NodeLoc::new(
                        start.to(self.prev_span()),
                        Node::Destructure {
                            pattern,
                            value,
                            decl: None,
                        },
                    ));
                }
                self.pos = saved;
                self.parse_expr()
            }
            _ => self.parse_expr(),
        }
    }

    fn eat_at_label(&mut self) -> Option<StringId> {
        match *self.tok() {
            Tok::AtLabel(id) => {
                self.bump();
                Some(id)
            }
            _ => None,
        }
    }

    fn parse_mods(&mut self) -> Mods {
        let mut mods = Mods::default();
        loop {
            match self.tok() {
                Tok::Kw(Kw::Private) => {
                    mods.visibility = Visibility::Private;
                    self.bump();
                }
                Tok::Kw(Kw::Protected) => {
                    mods.visibility = Visibility::Protected;
                    self.bump();
                }
                Tok::Kw(Kw::Static) => {
                    mods.is_static = true;
                    self.bump();
                }
                Tok::Kw(Kw::Abstract) => {
                    mods.is_abstract = true;
                    self.bump();
                }
                Tok::Kw(Kw::Open) => {
                    mods.is_open = true;
                    self.bump();
                }
                _ => return mods,
            }
        }
    }

    fn parse_dotted_path(&mut self) -> PResult<(String, bool)> {
        let first = self.expect_ident("a package path")?;
        let mut path = self.interns.get(first).to_owned();
        let mut star = false;
        while self.eat(&Tok::Dot) {
            if self.eat(&Tok::Star) {
                star = true;
                break;
            }
            let part = self.expect_ident("a package path segment")?;
            path.push('.');
            path.push_str(self.interns.get(part));
        }
        Ok((path, star))
    }

    fn parse_annotation(&mut self, name: StringId, start: Span) -> PResult<NodeLoc> {
        let args = if self.eat(&Tok::LParen) {
            self.parse_call_args()?
        } else {
            Vec::new()
        };
        self.skip_newlines();
        let target = Box::new(self.parse_statement()?);
        if !matches!(target.node, Node::FunDecl(_) | Node::ValVar(_)) {
            return Err(SyntaxError::new(
                "annotations apply to function and val/var declarations",
                target.span,
            ));
        }
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::Annotated { name, args, target },
        ))
    }

    // --- declarations ------------------------------------------------------

    fn parse_valvar(&mut self, mutable: bool, visibility: Visibility, start: Span) -> PResult<NodeLoc> {
        if matches!(self.tok(), Tok::LBracket) {
            let pattern = self.try_parse_pattern()?;
            self.expect(&Tok::Assign, "'=' after a destructuring pattern")?;
            let value = Box::new(self.parse_expr()?);
            return Ok(NodeLoc::new(
                start.to(self.prev_span()),
                Node::Destructure {
                    pattern,
                    value,
                    decl: Some(mutable),
                },
            ));
        }
        let name = self.expect_ident("a binding name")?;
        if self.eat(&Tok::Kw(Kw::By)) {
            let delegate = self.parse_expr()?;
            return Ok(NodeLoc::new(
                start.to(self.prev_span()),
                Node::ValVar(Box::new(VarDecl {
                    name,
                    mutable,
                    visibility,
                    init: None,
                    delegate: Some(delegate),
                })),
            ));
        }
        let init = if self.eat(&Tok::Assign) {
            self.skip_newlines();
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::ValVar(Box::new(VarDecl {
                name,
                mutable,
                visibility,
                init,
                delegate: None,
            })),
        ))
    }

    /// Parses a function after its `fun`/`fn` keyword. `named` requires a
    /// function name (declarations); accessors pass `false`.
    fn parse_fun_def(&mut self, named: bool) -> PResult<FunDef> {
        let name = if named {
            Some(self.expect_ident("a function name")?)
        } else {
            None
        };
        if named && self.eat(&Tok::Kw(Kw::By)) {
            let delegate = self.parse_expr()?;
            return Ok(FunDef {
                name,
                label: None,
                sig: Rc::new(Signature::empty()),
                body: Rc::new(NodeLoc::new(self.prev_span(), Node::Literal(Value::Void))),
                is_expr_body: false,
                delegate: Some(Rc::new(delegate)),
            });
        }
        self.expect(&Tok::LParen, "'(' to start the parameter list")?;
        let sig = self.parse_params(true)?;
        self.parse_fun_body(name, sig)
    }

    fn parse_fun_body(&mut self, name: Option<StringId>, sig: Signature) -> PResult<FunDef> {
        self.skip_newlines();
        if self.eat(&Tok::Assign) {
            // Shorthand body: `fun f(x) = expr` - `return` is rejected.
            let saved = self.no_return;
            self.no_return = true;
            let body = self.parse_expr();
            self.no_return = saved;
            return Ok(FunDef {
                name,
                label: None,
                sig: Rc::new(sig),
                body: Rc::new(body?),
                is_expr_body: true,
                delegate: None,
            });
        }
        let body = self.parse_block()?;
        Ok(FunDef {
            name,
            label: None,
            sig: Rc::new(sig),
            body: Rc::new(body),
            is_expr_body: false,
            delegate: None,
        })
    }

    /// Parameter list after `(`. `allow_promote` admits `val`/`var`
    /// prefixes (class headers).
    fn parse_params(&mut self, allow_promote: bool) -> PResult<Signature> {
        let mut params: Vec<Param> = Vec::new();
        let mut seen_default = false;
        self.skip_newlines();
        while !self.eat(&Tok::RParen) {
            let mut mods = Mods::default();
            let mut promote = None;
            if allow_promote {
                mods = self.parse_mods();
                if self.eat(&Tok::Kw(Kw::Val)) {
                    promote = Some(Promote {
                        mutable: false,
                        visibility: mods.visibility,
                    });
                } else if self.eat(&Tok::Kw(Kw::Var)) {
                    promote = Some(Promote {
                        mutable: true,
                        visibility: mods.visibility,
                    });
                }
            }
            let name = self.expect_ident("a parameter name")?;
            let variadic = self.eat(&Tok::Ellipsis);
            let default = if self.eat(&Tok::Assign) {
                self.skip_newlines();
                Some(self.parse_expr()?)
            } else {
                None
            };
            if variadic && params.iter().any(|p| p.variadic) {
                return Err(self.error("at most one variadic parameter is allowed"));
            }
            if default.is_some() {
                seen_default = true;
            } else if seen_default && !variadic {
                return Err(self.error("required parameters cannot follow defaulted ones"));
            }
            params.push(Param {
                name,
                default,
                variadic,
                promote,
            });
            self.skip_newlines();
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RParen, "')' to close the parameter list")?;
                break;
            }
            self.skip_newlines();
        }
        if let Some(vi) = params.iter().position(|p| p.variadic)
            && vi + 1 != params.len()
        {
            return Err(self.error("the variadic parameter must come last"));
        }
        Ok(Signature {
            params,
            has_header: true,
        })
    }

    fn parse_class(
        &mut self,
        mods: Mods,
        is_object: bool,
        is_interface: bool,
        start: Span,
    ) -> PResult<NodeLoc> {
        let name = self.expect_ident("a class name")?;
        let sig = if self.eat(&Tok::LParen) {
            self.parse_params(true)?
        } else {
            Signature::empty()
        };
        let mut bases = Vec::new();
        if self.eat(&Tok::Colon) {
            loop {
                self.skip_newlines();
                let expr = self.parse_type_expr()?;
                let args = if self.eat(&Tok::LParen) {
                    self.parse_call_args()?
                } else {
                    Vec::new()
                };
                bases.push(BaseDecl { expr, args });
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        let mut def = ClassDef {
            name,
            sig: Rc::new(sig),
            bases,
            fields: Vec::new(),
            methods: Vec::new(),
            props: Vec::new(),
            inits: Vec::new(),
            statics: Vec::new(),
            nested: Vec::new(),
            is_abstract: mods.is_abstract,
            is_open: mods.is_open,
            is_object,
            is_interface,
        };
        self.skip_newlines();
        if self.eat(&Tok::LBrace) {
            self.parse_class_body(&mut def)?;
        }
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::ClassDecl(Rc::new(def)),
        ))
    }

    /// A base-class reference: `Name`, `a.b.Name` or `Outer::Inner`.
    fn parse_type_expr(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let first = self.expect_ident("a class name")?;
        let mut node = NodeLoc::new(start, Node::Name(first));
        loop {
            if self.eat(&Tok::Dot) {
                let name = self.expect_ident("a member name")?;
                node = NodeLoc::new(
                    start.to(self.prev_span()),
                    Node::Member {
                        object: Box::new(node),
                        name,
                        optional: false,
                    },
                );
            } else if self.eat(&Tok::Scope) {
                let name = self.expect_ident("a member name")?;
                node = NodeLoc::new(
                    start.to(self.prev_span()),
                    Node::ScopeAccess {
                        object: Box::new(node),
                        name,
                    },
                );
            } else {
                return Ok(node);
            }
        }
    }

    fn parse_class_body(&mut self, def: &mut ClassDef) -> PResult<()> {
        self.skip_separators();
        while !self.eat(&Tok::RBrace) {
            if matches!(self.tok(), Tok::Eof) {
                return Err(self.error("unterminated class body"));
            }
            self.parse_class_member(def)?;
            self.skip_separators();
        }
        Ok(())
    }

    fn parse_class_member(&mut self, def: &mut ClassDef) -> PResult<()> {
        let mods = self.parse_mods();
        match self.tok().clone() {
            Tok::Kw(Kw::Init) => {
                self.bump();
                let block = self.parse_block()?;
                def.inits.push(block);
            }
            Tok::Kw(Kw::Val | Kw::Var) => {
                let mutable = matches!(self.tok(), Tok::Kw(Kw::Var));
                self.bump();
                let name = self.expect_ident("a field name")?;
                // `val x get() = ...` declares a property accessor pair.
                if self.is_accessor_next() {
                    let prop = self.parse_property(name, mods.visibility, mutable)?;
                    def.props.push(prop);
                    return Ok(());
                }
                let delegate = if self.eat(&Tok::Kw(Kw::By)) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                let init = if delegate.is_none() && self.eat(&Tok::Assign) {
                    self.skip_newlines();
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                let field = FieldDecl {
                    name,
                    mutable,
                    visibility: mods.visibility,
                    init,
                    delegate,
                };
                if mods.is_static {
                    def.statics.push(field);
                } else {
                    def.fields.push(field);
                }
            }
            Tok::Kw(Kw::Fun | Kw::Fn) => {
                self.bump();
                let name = self.expect_ident("a method name")?;
                if self.eat(&Tok::Kw(Kw::By)) {
                    let delegate = self.parse_expr()?;
                    def.methods.push(MethodDecl {
                        def: Rc::new(FunDef {
                            name: Some(name),
                            label: None,
                            sig: Rc::new(Signature::empty()),
                            body: Rc::new(NodeLoc::new(self.prev_span(), Node::Literal(Value::Void))),
                            is_expr_body: false,
                            delegate: Some(Rc::new(delegate)),
                        }),
                        visibility: mods.visibility,
                        is_static: mods.is_static,
                        is_abstract: false,
                    });
                    return Ok(());
                }
                self.expect(&Tok::LParen, "'(' to start the parameter list")?;
                let sig = self.parse_params(false)?;
                // A method without a body is abstract.
                self.skip_newlines();
                let is_abstract = mods.is_abstract
                    || !matches!(self.tok(), Tok::LBrace | Tok::Assign);
                let fun_def = if is_abstract {
                    FunDef {
                        name: Some(name),
                        label: None,
                        sig: Rc::new(sig),
                        body: Rc::new(NodeLoc::new(self.prev_span(), Node::Literal(Value::Void))),
                        is_expr_body: false,
                        delegate: None,
                    }
                } else {
                    self.parse_fun_body(Some(name), sig)?
                };
                def.methods.push(MethodDecl {
                    def: Rc::new(fun_def),
                    visibility: mods.visibility,
                    is_static: mods.is_static,
                    is_abstract,
                });
            }
            Tok::Kw(Kw::Class) => {
                self.bump();
                let start = self.span();
                let nested = self.parse_class(mods, false, false, start)?;
                if let Node::ClassDecl(class_def) = nested.node {
                    def.nested.push(class_def);
                }
            }
            Tok::Kw(Kw::Object) => {
                self.bump();
                let start = self.span();
                let nested = self.parse_class(mods, true, false, start)?;
                if let Node::ClassDecl(class_def) = nested.node {
                    def.nested.push(class_def);
                }
            }
            _ => {
                // Stray statements run at construction time, after fields.
                let stmt = self.parse_statement()?;
                def.inits.push(stmt);
            }
        }
        Ok(())
    }

    fn is_accessor_next(&self) -> bool {
        let mut i = 0;
        while matches!(self.tok_at(i), Tok::Newline) {
            i += 1;
        }
        matches!(self.tok_at(i), Tok::Ident(id) if *id == self.kw_get)
            && matches!(self.tok_at(i + 1), Tok::LParen)
    }

    fn parse_property(
        &mut self,
        name: StringId,
        visibility: Visibility,
        mutable: bool,
    ) -> PResult<PropDecl> {
        self.skip_newlines();
        // `get()` accessor.
        self.bump();
        self.expect(&Tok::LParen, "'(' after 'get'")?;
        self.expect(&Tok::RParen, "')' - getters take no parameters")?;
        let getter = self.parse_fun_body(None, Signature::empty())?;
        let mut setter = None;
        let save = self.pos;
        self.skip_newlines();
        if mutable
            && matches!(self.tok(), Tok::Ident(id) if *id == self.kw_set)
            && matches!(self.tok_at(1), Tok::LParen)
        {
            self.bump();
            self.expect(&Tok::LParen, "'(' after 'set'")?;
            let param = self.expect_ident("the setter parameter name")?;
            self.expect(&Tok::RParen, "')' after the setter parameter")?;
            let sig = Signature {
                params: vec![Param {
                    name: param,
                    default: None,
                    variadic: false,
                    promote: None,
                }],
                has_header: true,
            };
            setter = Some(self.parse_fun_body(None, sig)?);
        } else {
            self.pos = save;
        }
        Ok(PropDecl {
            name,
            visibility,
            getter: Some(Rc::new(getter)),
            setter: setter.map(Rc::new),
        })
    }

    fn parse_enum(&mut self, start: Span) -> PResult<NodeLoc> {
        let name = self.expect_ident("an enum name")?;
        let mut entries = Vec::new();
        self.skip_newlines();
        self.expect(&Tok::LBrace, "'{' to open the enum body")?;
        self.skip_separators();
        while !self.eat(&Tok::RBrace) {
            entries.push(self.expect_ident("an enum entry name")?);
            self.skip_separators();
            if self.eat(&Tok::Comma) {
                self.skip_separators();
            }
        }
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::EnumDecl(Rc::new(EnumDef { name, entries })),
        ))
    }

    // --- patterns ----------------------------------------------------------

    /// `[a, rest..., [x, y]]` - fails (for backtracking) when the bracket
    /// content is not a pattern.
    fn try_parse_pattern(&mut self) -> PResult<Vec<PatItem>> {
        self.expect(&Tok::LBracket, "'['")?;
        let mut items = Vec::new();
        let mut seen_splat = false;
        self.skip_newlines();
        while !self.eat(&Tok::RBracket) {
            let item = match self.tok().clone() {
                Tok::Ident(id) => {
                    self.bump();
                    if self.eat(&Tok::Ellipsis) {
                        PatItem::Splat(Some(id))
                    } else {
                        PatItem::Name(id)
                    }
                }
                Tok::Ellipsis => {
                    self.bump();
                    PatItem::Splat(None)
                }
                Tok::LBracket => PatItem::Nested(self.try_parse_pattern()?),
                _ => return Err(self.error("expected a name, splat or nested pattern")),
            };
            if matches!(item, PatItem::Splat(_)) {
                if seen_splat {
                    return Err(self.error("only one splat is allowed per pattern"));
                }
                seen_splat = true;
            }
            items.push(item);
            self.skip_newlines();
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RBracket, "']' to close the pattern")?;
                break;
            }
            self.skip_newlines();
        }
        Ok(items)
    }

    // --- expressions -------------------------------------------------------

    fn parse_expr(&mut self) -> PResult<NodeLoc> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let mut lhs = self.parse_entry()?;
        loop {
            let op = match self.tok() {
                Tok::Assign => AssignOp::Set,
                Tok::PlusAssign => AssignOp::Add,
                Tok::MinusAssign => AssignOp::Sub,
                Tok::StarAssign => AssignOp::Mul,
                Tok::SlashAssign => AssignOp::Div,
                Tok::PercentAssign => AssignOp::Rem,
                Tok::IfNullAssign => AssignOp::IfNull,
                _ => return Ok(lhs),
            };
            self.bump();
            self.skip_newlines();
            let value = self.parse_entry()?;
            lhs = NodeLoc::new(
                start.to(self.prev_span()),
                Node::Assign {
                    op,
                    target: Box::new(lhs),
                    value: Box::new(value),
                },
            );
        }
    }

    fn parse_entry(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let mut lhs = self.parse_or()?;
        while self.eat(&Tok::FatArrow) {
            self.skip_newlines();
            let rhs = self.parse_or()?;
            lhs = NodeLoc::new(
                start.to(self.prev_span()),
                Node::Binary {
                    op: BinOp::Entry,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let mut lhs = self.parse_and()?;
        while self.eat(&Tok::OrOr) {
            self.skip_newlines();
            let rhs = self.parse_and()?;
            lhs = NodeLoc::new(
                start.to(self.prev_span()),
                Node::Logic {
                    and: false,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let mut lhs = self.parse_bitor()?;
        while self.eat(&Tok::AndAnd) {
            self.skip_newlines();
            let rhs = self.parse_bitor()?;
            lhs = NodeLoc::new(
                start.to(self.prev_span()),
                Node::Logic {
                    and: true,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
        }
        Ok(lhs)
    }

    fn parse_binary_level(
        &mut self,
        ops: &[(Tok, BinOp)],
        next: fn(&mut Self) -> PResult<NodeLoc>,
    ) -> PResult<NodeLoc> {
        let start = self.span();
        let mut lhs = next(self)?;
        'outer: loop {
            for (tok, op) in ops {
                if self.tok() == tok {
                    self.bump();
                    self.skip_newlines();
                    let rhs = next(self)?;
                    lhs = NodeLoc::new(
                        start.to(self.prev_span()),
                        Node::Binary {
                            op: *op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                    );
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_bitor(&mut self) -> PResult<NodeLoc> {
        self.parse_binary_level(&[(Tok::Pipe, BinOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> PResult<NodeLoc> {
        self.parse_binary_level(&[(Tok::Caret, BinOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> PResult<NodeLoc> {
        self.parse_binary_level(&[(Tok::Amp, BinOp::BitAnd)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> PResult<NodeLoc> {
        self.parse_binary_level(
            &[
                (Tok::Eq, BinOp::Eq),
                (Tok::NotEq, BinOp::NotEq),
                (Tok::RefEq, BinOp::RefEq),
                (Tok::RefNotEq, BinOp::RefNotEq),
            ],
            Self::parse_relational,
        )
    }

    fn parse_relational(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let mut lhs = self.parse_shuttle()?;
        loop {
            let node = match self.tok().clone() {
                Tok::Lt | Tok::LtEq | Tok::Gt | Tok::GtEq => {
                    let op = match self.tok() {
                        Tok::Lt => BinOp::Lt,
                        Tok::LtEq => BinOp::LtEq,
                        Tok::Gt => BinOp::Gt,
                        _ => BinOp::GtEq,
                    };
                    self.bump();
                    self.skip_newlines();
                    let rhs = self.parse_shuttle()?;
                    Node::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    }
                }
                Tok::In | Tok::NotIn => {
                    let negated = matches!(self.tok(), Tok::NotIn);
                    self.bump();
                    self.skip_newlines();
                    let rhs = self.parse_shuttle()?;
                    Node::InTest {
                        negated,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    }
                }
                Tok::Is | Tok::NotIs => {
                    let negated = matches!(self.tok(), Tok::NotIs);
                    self.bump();
                    self.skip_newlines();
                    let class_expr = self.parse_shuttle()?;
                    Node::TypeTest {
                        negated,
                        lhs: Box::new(lhs),
                        class_expr: Box::new(class_expr),
                    }
                }
                Tok::Ident(id) if id == self.kw_as => {
                    self.bump();
                    self.skip_newlines();
                    let class_expr = self.parse_shuttle()?;
                    Node::Cast {
                        lhs: Box::new(lhs),
                        class_expr: Box::new(class_expr),
                    }
                }
                _ => return Ok(lhs),
            };
            lhs = NodeLoc::new(start.to(self.prev_span()), node);
        }
    }

    fn parse_shuttle(&mut self) -> PResult<NodeLoc> {
        self.parse_binary_level(&[(Tok::Shuttle, BinOp::Shuttle)], Self::parse_elvis)
    }

    fn parse_elvis(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let lhs = self.parse_range()?;
        if self.eat(&Tok::Elvis) {
            self.skip_newlines();
            // Right-associative.
            let rhs = self.parse_elvis()?;
            return Ok(NodeLoc::new(
                start.to(self.prev_span()),
                Node::Elvis {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            ));
        }
        Ok(lhs)
    }

    fn parse_range(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let lhs = self.parse_shift()?;
        let inclusive = match self.tok() {
            Tok::DotDot => true,
            Tok::DotDotLt => false,
            _ => return Ok(lhs),
        };
        self.bump();
        let end = if self.starts_expression() {
            Some(Box::new(self.parse_shift()?))
        } else {
            None
        };
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::RangeLit {
                start: Some(Box::new(lhs)),
                end,
                inclusive,
            },
        ))
    }

    fn parse_shift(&mut self) -> PResult<NodeLoc> {
        self.parse_binary_level(
            &[
                (Tok::Shl, BinOp::Shl),
                (Tok::Shr, BinOp::Shr),
                (Tok::Ushr, BinOp::Ushr),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> PResult<NodeLoc> {
        self.parse_binary_level(
            &[(Tok::Plus, BinOp::Add), (Tok::Minus, BinOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> PResult<NodeLoc> {
        self.parse_binary_level(
            &[
                (Tok::Star, BinOp::Mul),
                (Tok::Slash, BinOp::Div),
                (Tok::Percent, BinOp::Rem),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let op = match self.tok() {
            Tok::Not => Some(UnOp::Not),
            Tok::Minus => Some(UnOp::Neg),
            Tok::Plus => Some(UnOp::Pos),
            Tok::Tilde => Some(UnOp::BitNot),
            Tok::PlusPlus | Tok::MinusMinus => {
                let inc = matches!(self.tok(), Tok::PlusPlus);
                self.bump();
                let target = self.parse_unary()?;
                return Ok(NodeLoc::new(
                    start.to(self.prev_span()),
                    Node::IncDec {
                        pre: true,
                        inc,
                        target: Box::new(target),
                    },
                ));
            }
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.parse_unary()?;
            return Ok(NodeLoc::new(
                start.to(self.prev_span()),
                Node::Unary {
                    op,
                    operand: Box::new(operand),
                },
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        let mut node = self.parse_primary()?;
        loop {
            match self.tok() {
                Tok::LParen | Tok::QParen => {
                    if self.newline_before() {
                        return Ok(node);
                    }
                    let optional = matches!(self.tok(), Tok::QParen);
                    self.bump();
                    let mut args = self.parse_call_args()?;
                    // Trailing lambda on the same line joins the call.
                    if matches!(self.tok(), Tok::LBrace) && !self.newline_before() {
                        let lambda = self.parse_brace_expression()?;
                        args.push(ArgNode::Pos(lambda));
                    }
                    node = NodeLoc::new(
                        start.to(self.prev_span()),
                        Node::Call {
                            callee: Box::new(node),
                            args,
                            optional,
                        },
                    );
                }
                Tok::LBrace if !self.newline_before() => {
                    // `f { ... }` - a call whose only argument is a lambda.
                    let lambda = self.parse_brace_expression()?;
                    node = NodeLoc::new(
                        start.to(self.prev_span()),
                        Node::Call {
                            callee: Box::new(node),
                            args: vec![ArgNode::Pos(lambda)],
                            optional: false,
                        },
                    );
                }
                Tok::LBracket | Tok::QBracket => {
                    if self.newline_before() {
                        return Ok(node);
                    }
                    let optional = matches!(self.tok(), Tok::QBracket);
                    self.bump();
                    self.skip_newlines();
                    let index = self.parse_expr()?;
                    self.skip_newlines();
                    self.expect(&Tok::RBracket, "']' to close the index")?;
                    node = NodeLoc::new(
                        start.to(self.prev_span()),
                        Node::Index {
                            object: Box::new(node),
                            index: Box::new(index),
                            optional,
                        },
                    );
                }
                Tok::Dot | Tok::QDot => {
                    let optional = matches!(self.tok(), Tok::QDot);
                    self.bump();
                    self.skip_newlines();
                    let name = self.parse_member_name()?;
                    node = NodeLoc::new(
                        start.to(self.prev_span()),
                        Node::Member {
                            object: Box::new(node),
                            name,
                            optional,
                        },
                    );
                }
                Tok::Scope => {
                    self.bump();
                    let name = self.parse_member_name()?;
                    node = NodeLoc::new(
                        start.to(self.prev_span()),
                        Node::ScopeAccess {
                            object: Box::new(node),
                            name,
                        },
                    );
                }
                Tok::PlusPlus | Tok::MinusMinus => {
                    let inc = matches!(self.tok(), Tok::PlusPlus);
                    self.bump();
                    node = NodeLoc::new(
                        start.to(self.prev_span()),
                        Node::IncDec {
                            pre: false,
                            inc,
                            target: Box::new(node),
                        },
                    );
                }
                // A fluent chain may wrap before the dot.
                Tok::Newline => {
                    let mut i = 1;
                    while matches!(self.tok_at(i), Tok::Newline) {
                        i += 1;
                    }
                    if matches!(self.tok_at(i), Tok::Dot | Tok::QDot) {
                        self.skip_newlines();
                    } else {
                        return Ok(node);
                    }
                }
                _ => return Ok(node),
            }
        }
    }

    /// Member names after `.` / `::`, admitting the `class` keyword.
    fn parse_member_name(&mut self) -> PResult<StringId> {
        match self.tok().clone() {
            Tok::Ident(id) => {
                self.bump();
                Ok(id)
            }
            Tok::Kw(Kw::Class) => {
                self.bump();
                Ok(crate::intern::sym::CLASS)
            }
            _ => Err(self.error("expected a member name")),
        }
    }

    fn parse_call_args(&mut self) -> PResult<Vec<ArgNode>> {
        let mut args = Vec::new();
        let mut seen_named = false;
        self.skip_newlines();
        while !self.eat(&Tok::RParen) {
            if self.eat(&Tok::Ellipsis) {
                let expr = self.parse_expr()?;
                args.push(ArgNode::Splat(expr));
            } else if let Tok::Ident(id) = *self.tok()
                && matches!(self.tok_at(1), Tok::Colon)
            {
                self.bump();
                self.bump();
                self.skip_newlines();
                let expr = self.parse_expr()?;
                if args
                    .iter()
                    .any(|a| matches!(a, ArgNode::Named(n, _) if *n == id))
                {
                    return Err(self.error("duplicate named argument"));
                }
                seen_named = true;
                args.push(ArgNode::Named(id, expr));
            } else {
                if seen_named {
                    return Err(self.error("positional arguments cannot follow named arguments"));
                }
                let expr = self.parse_expr()?;
                args.push(ArgNode::Pos(expr));
            }
            self.skip_newlines();
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RParen, "')' to close the argument list")?;
                break;
            }
            self.skip_newlines();
        }
        Ok(args)
    }

    // --- primaries ---------------------------------------------------------

    fn parse_primary(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        match self.tok().clone() {
            Tok::Int(i) => {
                self.bump();
                Ok(NodeLoc::new(start, Node::Literal(Value::Int(i))))
            }
            Tok::Real(r) => {
                self.bump();
                Ok(NodeLoc::new(start, Node::Literal(Value::Real(r))))
            }
            Tok::Str(s) => {
                self.bump();
                let id = self.interns.intern(&s);
                Ok(NodeLoc::new(start, Node::Literal(Value::InternStr(id))))
            }
            Tok::Char(c) => {
                self.bump();
                Ok(NodeLoc::new(start, Node::Literal(Value::Char(c))))
            }
            Tok::Kw(Kw::True) => {
                self.bump();
                Ok(NodeLoc::new(start, Node::Literal(Value::Bool(true))))
            }
            Tok::Kw(Kw::False) => {
                self.bump();
                Ok(NodeLoc::new(start, Node::Literal(Value::Bool(false))))
            }
            Tok::Kw(Kw::Null) => {
                self.bump();
                Ok(NodeLoc::new(start, Node::Literal(Value::Null)))
            }
            Tok::Kw(Kw::Void) => {
                self.bump();
                Ok(NodeLoc::new(start, Node::Literal(Value::Void)))
            }
            Tok::Kw(Kw::This) => {
                self.bump();
                if let Tok::AtLabel(name) = *self.tok() {
                    self.bump();
                    return Ok(NodeLoc::new(start.to(self.prev_span()), Node::QualifiedThis(name)));
                }
                Ok(NodeLoc::new(start, Node::This))
            }
            Tok::Kw(Kw::Super) => {
                self.bump();
                Ok(NodeLoc::new(start, Node::Super))
            }
            Tok::Ident(id) if id == self.kw_dynamic && matches!(self.tok_at(1), Tok::LBrace) => {
                self.bump();
                self.parse_dynamic(start)
            }
            Tok::Ident(id) => {
                self.bump();
                Ok(NodeLoc::new(start, Node::Name(id)))
            }
            Tok::AtLabel(label) if matches!(self.tok_at(1), Tok::LBrace) => {
                // `@name { ... }` - a labelled lambda for non-local return.
                self.bump();
                let mut lambda = self.parse_brace_expression()?;
                if let Node::Lambda(def) = &lambda.node {
                    let labelled = FunDef {
                        name: def.name,
                        label: Some(label),
                        sig: Rc::clone(&def.sig),
                        body: Rc::clone(&def.body),
                        is_expr_body: def.is_expr_body,
                        delegate: def.delegate.clone(),
                    };
                    lambda = NodeLoc::new(start.to(self.prev_span()), Node::Lambda(Rc::new(labelled)));
                }
                Ok(lambda)
            }
            Tok::LParen => {
                self.bump();
                self.skip_newlines();
                let inner = self.parse_expr()?;
                self.skip_newlines();
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => self.parse_list_literal(start),
            Tok::LBrace => self.parse_brace_expression(),
            Tok::DotDot | Tok::DotDotLt => {
                // Open-start ranges: `..n`, `..<n`.
                let inclusive = matches!(self.tok(), Tok::DotDot);
                self.bump();
                let end = Some(Box::new(self.parse_shift()?));
                Ok(NodeLoc::new(
                    start.to(self.prev_span()),
                    Node::RangeLit {
                        start: None,
                        end,
                        inclusive,
                    },
                ))
            }
            Tok::Kw(Kw::If) => self.parse_if(),
            Tok::Kw(Kw::While) => self.parse_while(None),
            Tok::Kw(Kw::Do) => self.parse_do_while(None),
            Tok::Kw(Kw::For) => self.parse_for(None),
            Tok::Kw(Kw::When) => self.parse_when(),
            Tok::Kw(Kw::Try) => self.parse_try(),
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_list_literal(&mut self, start: Span) -> PResult<NodeLoc> {
        self.expect(&Tok::LBracket, "'['")?;
        let mut items = Vec::new();
        self.skip_newlines();
        while !self.eat(&Tok::RBracket) {
            if self.eat(&Tok::Ellipsis) {
                let expr = self.parse_expr()?;
                items.push(ListItem::Spread(expr));
            } else {
                let expr = self.parse_expr()?;
                items.push(ListItem::Item(expr));
            }
            self.skip_newlines();
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RBracket, "']' to close the list")?;
                break;
            }
            self.skip_newlines();
        }
        Ok(NodeLoc::new(start.to(self.prev_span()), Node::ListLit(items)))
    }

    /// A `{ ... }` in expression position: map literal when the first
    /// tokens look like `key:` / `"key":` / `...spread`; otherwise a
    /// lambda (with an explicit `params ->` header or the implicit `it`).
    fn parse_brace_expression(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        // Peek past the brace and any newlines.
        let mut i = 1;
        while matches!(self.tok_at(i), Tok::Newline) {
            i += 1;
        }
        let is_map = match self.tok_at(i) {
            Tok::Ellipsis => true,
            Tok::Str(_) => matches!(self.tok_at(i + 1), Tok::Colon),
            Tok::Ident(_) => matches!(self.tok_at(i + 1), Tok::Colon),
            _ => false,
        };
        if is_map {
            return self.parse_map_literal(start);
        }
        self.parse_lambda(start)
    }

    fn parse_map_literal(&mut self, start: Span) -> PResult<NodeLoc> {
        self.expect(&Tok::LBrace, "'{'")?;
        let mut items = Vec::new();
        let mut literal_keys: Vec<String> = Vec::new();
        self.skip_newlines();
        while !self.eat(&Tok::RBrace) {
            match self.tok().clone() {
                Tok::Ellipsis => {
                    self.bump();
                    let expr = self.parse_expr()?;
                    items.push(MapItem::Spread(expr));
                }
                Tok::Str(key) => {
                    self.bump();
                    self.expect(&Tok::Colon, "':' after the map key")?;
                    self.skip_newlines();
                    let value = self.parse_expr()?;
                    if literal_keys.contains(&key) {
                        return Err(self.error(format!("duplicate map key {key:?}")));
                    }
                    literal_keys.push(key.clone());
                    items.push(MapItem::Pair { key, value });
                }
                Tok::Ident(id) => {
                    self.bump();
                    self.expect(&Tok::Colon, "':' after the map key")?;
                    let key = self.interns.get(id).to_owned();
                    if literal_keys.contains(&key) {
                        return Err(self.error(format!("duplicate map key {key:?}")));
                    }
                    literal_keys.push(key.clone());
                    // `id:` shorthand for `"id": id`.
                    if matches!(self.tok(), Tok::Comma | Tok::RBrace | Tok::Newline) {
                        items.push(MapItem::Shorthand(id));
                    } else {
                        self.skip_newlines();
                        let value = self.parse_expr()?;
                        items.push(MapItem::Pair { key, value });
                    }
                }
                other => return Err(self.error(format!("unexpected token {other:?} in map literal"))),
            }
            self.skip_newlines();
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RBrace, "'}' to close the map")?;
                break;
            }
            self.skip_newlines();
        }
        Ok(NodeLoc::new(start.to(self.prev_span()), Node::MapLit(items)))
    }

    fn parse_lambda(&mut self, start: Span) -> PResult<NodeLoc> {
        self.expect(&Tok::LBrace, "'{'")?;
        // Attempt an explicit parameter header `a, b = 1, rest... ->`.
        let saved = self.pos;
        let sig = match self.try_parse_lambda_header() {
            Ok(Some(sig)) => sig,
            Ok(None) | Err(_) => {
                self.pos = saved;
                Signature::headerless()
            }
        };
        let mut stmts = Vec::new();
        self.skip_separators();
        while !self.eat(&Tok::RBrace) {
            if matches!(self.tok(), Tok::Eof) {
                return Err(self.error("unterminated lambda body"));
            }
            stmts.push(self.parse_statement()?);
            self.skip_separators();
        }
        let span = start.to(self.prev_span());
        let body = NodeLoc::new(span, Node::Block(stmts));
        Ok(NodeLoc::new(
            span,
            Node::Lambda(Rc::new(FunDef {
                name: None,
                label: None,
                sig: Rc::new(sig),
                body: Rc::new(body),
                is_expr_body: false,
                delegate: None,
            })),
        ))
    }

    /// Parses `params ->` after `{`; `Ok(None)` when the content is not a
    /// lambda header (the caller rewinds).
    fn try_parse_lambda_header(&mut self) -> PResult<Option<Signature>> {
        self.skip_newlines();
        let mut params = Vec::new();
        if self.eat(&Tok::Arrow) {
            // `{ -> ... }`: explicit empty header.
            return Ok(Some(Signature {
                params,
                has_header: true,
            }));
        }
        loop {
            let Tok::Ident(name) = *self.tok() else {
                return Ok(None);
            };
            self.bump();
            let variadic = self.eat(&Tok::Ellipsis);
            let default = if self.eat(&Tok::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param {
                name,
                default,
                variadic,
                promote: None,
            });
            if self.eat(&Tok::Comma) {
                self.skip_newlines();
                continue;
            }
            if self.eat(&Tok::Arrow) {
                return Ok(Some(Signature {
                    params,
                    has_header: true,
                }));
            }
            return Ok(None);
        }
    }

    fn parse_dynamic(&mut self, start: Span) -> PResult<NodeLoc> {
        self.expect(&Tok::LBrace, "'{' after 'dynamic'")?;
        let mut getter = None;
        let mut setter = None;
        self.skip_separators();
        while !self.eat(&Tok::RBrace) {
            let which = match *self.tok() {
                Tok::Ident(id) if id == self.kw_get => true,
                Tok::Ident(id) if id == self.kw_set => false,
                _ => return Err(self.error("expected 'get' or 'set' in a dynamic body")),
            };
            self.bump();
            let lambda = self.parse_brace_expression()?;
            let Node::Lambda(def) = lambda.node else {
                return Err(self.error("expected a lambda after 'get'/'set'"));
            };
            if which {
                getter = Some(def);
            } else {
                setter = Some(def);
            }
            self.skip_separators();
        }
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::Dynamic { getter, setter },
        ))
    }

    // --- control-flow forms ------------------------------------------------

    fn parse_block(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        self.expect(&Tok::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        self.skip_separators();
        while !self.eat(&Tok::RBrace) {
            if matches!(self.tok(), Tok::Eof) {
                return Err(self.error("unterminated block"));
            }
            stmts.push(self.parse_statement()?);
            self.skip_separators();
        }
        Ok(NodeLoc::new(start.to(self.prev_span()), Node::Block(stmts)))
    }

    /// A branch body: a block in braces, or a single expression. Braces
    /// that open a lambda header or a map literal stay expressions.
    fn parse_body(&mut self) -> PResult<NodeLoc> {
        self.skip_newlines();
        if matches!(self.tok(), Tok::LBrace) && !self.brace_is_expression() {
            self.parse_block()
        } else {
            self.parse_statement()
        }
    }

    /// Looks past an opening brace: `{ a, b -> ... }`, `{ -> ... }` and
    /// map-literal openers are expressions even at statement position.
    fn brace_is_expression(&self) -> bool {
        let mut i = 1;
        while matches!(self.tok_at(i), Tok::Newline) {
            i += 1;
        }
        match self.tok_at(i) {
            Tok::Arrow | Tok::Ellipsis => true,
            Tok::Str(_) => matches!(self.tok_at(i + 1), Tok::Colon),
            Tok::Ident(_) => {
                if matches!(self.tok_at(i + 1), Tok::Colon) {
                    return true;
                }
                // Scan a potential `a, b, rest... ->` header.
                loop {
                    if !matches!(self.tok_at(i), Tok::Ident(_)) {
                        return false;
                    }
                    i += 1;
                    if matches!(self.tok_at(i), Tok::Ellipsis) {
                        i += 1;
                    }
                    match self.tok_at(i) {
                        Tok::Arrow => return true,
                        Tok::Comma => i += 1,
                        _ => return false,
                    }
                }
            }
            _ => false,
        }
    }

    fn parse_if(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        self.expect(&Tok::Kw(Kw::If), "'if'")?;
        self.expect(&Tok::LParen, "'(' after 'if'")?;
        self.skip_newlines();
        let cond = Box::new(self.parse_expr()?);
        self.skip_newlines();
        self.expect(&Tok::RParen, "')' after the condition")?;
        let then = Box::new(self.parse_body()?);
        let otherwise = self.parse_else()?;
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::If {
                cond,
                then,
                otherwise,
            },
        ))
    }

    /// An optional `else` branch, looking past newlines.
    fn parse_else(&mut self) -> PResult<Option<Box<NodeLoc>>> {
        let saved = self.pos;
        self.skip_newlines();
        if self.eat(&Tok::Kw(Kw::Else)) {
            Ok(Some(Box::new(self.parse_body()?)))
        } else {
            self.pos = saved;
            Ok(None)
        }
    }

    fn parse_while(&mut self, label: Option<StringId>) -> PResult<NodeLoc> {
        let start = self.span();
        self.expect(&Tok::Kw(Kw::While), "'while'")?;
        self.expect(&Tok::LParen, "'(' after 'while'")?;
        self.skip_newlines();
        let cond = Box::new(self.parse_expr()?);
        self.skip_newlines();
        self.expect(&Tok::RParen, "')' after the condition")?;
        let body = Box::new(self.parse_body()?);
        let otherwise = self.parse_else()?;
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::While {
                label,
                cond,
                body,
                otherwise,
            },
        ))
    }

    fn parse_do_while(&mut self, label: Option<StringId>) -> PResult<NodeLoc> {
        let start = self.span();
        self.expect(&Tok::Kw(Kw::Do), "'do'")?;
        let body = Box::new(self.parse_body()?);
        self.skip_newlines();
        self.expect(&Tok::Kw(Kw::While), "'while' after the do body")?;
        self.expect(&Tok::LParen, "'(' after 'while'")?;
        self.skip_newlines();
        let cond = Box::new(self.parse_expr()?);
        self.skip_newlines();
        self.expect(&Tok::RParen, "')' after the condition")?;
        let otherwise = self.parse_else()?;
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::DoWhile {
                label,
                body,
                cond,
                otherwise,
            },
        ))
    }

    fn parse_for(&mut self, label: Option<StringId>) -> PResult<NodeLoc> {
        let start = self.span();
        self.expect(&Tok::Kw(Kw::For), "'for'")?;
        self.expect(&Tok::LParen, "'(' after 'for'")?;
        self.skip_newlines();
        let target = if matches!(self.tok(), Tok::LBracket) {
            ForTarget::Pattern(self.try_parse_pattern()?)
        } else {
            ForTarget::Name(self.expect_ident("the loop variable")?)
        };
        if !self.eat(&Tok::In) {
            return Err(self.error("expected 'in' in the for loop header"));
        }
        self.skip_newlines();
        let iter = Box::new(self.parse_expr()?);
        self.skip_newlines();
        self.expect(&Tok::RParen, "')' after the iterable")?;
        let body = Box::new(self.parse_body()?);
        let otherwise = self.parse_else()?;
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::For {
                label,
                target,
                iter,
                body,
                otherwise,
            },
        ))
    }

    fn parse_when(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        self.expect(&Tok::Kw(Kw::When), "'when'")?;
        self.expect(&Tok::LParen, "'(' after 'when'")?;
        self.skip_newlines();
        let subject = Box::new(self.parse_expr()?);
        self.skip_newlines();
        self.expect(&Tok::RParen, "')' after the subject")?;
        self.skip_newlines();
        self.expect(&Tok::LBrace, "'{' to open the when body")?;
        let mut branches = Vec::new();
        let mut otherwise = None;
        self.skip_separators();
        while !self.eat(&Tok::RBrace) {
            if matches!(self.tok(), Tok::Eof) {
                return Err(self.error("unterminated when body"));
            }
            if self.eat(&Tok::Kw(Kw::Else)) {
                self.expect(&Tok::Arrow, "'->' after 'else'")?;
                otherwise = Some(Box::new(self.parse_body()?));
                self.skip_separators();
                continue;
            }
            let mut conds = Vec::new();
            loop {
                let cond = match self.tok() {
                    Tok::In => {
                        self.bump();
                        WhenCond::In {
                            negated: false,
                            expr: self.parse_entry()?,
                        }
                    }
                    Tok::NotIn => {
                        self.bump();
                        WhenCond::In {
                            negated: true,
                            expr: self.parse_entry()?,
                        }
                    }
                    Tok::Is => {
                        self.bump();
                        WhenCond::Is {
                            negated: false,
                            expr: self.parse_entry()?,
                        }
                    }
                    Tok::NotIs => {
                        self.bump();
                        WhenCond::Is {
                            negated: true,
                            expr: self.parse_entry()?,
                        }
                    }
                    _ => WhenCond::Equals(self.parse_entry()?),
                };
                conds.push(cond);
                if !self.eat(&Tok::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            self.expect(&Tok::Arrow, "'->' after the when condition")?;
            let body = self.parse_body()?;
            branches.push(WhenBranch { conds, body });
            self.skip_separators();
        }
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::When {
                subject,
                branches,
                otherwise,
            },
        ))
    }

    fn parse_try(&mut self) -> PResult<NodeLoc> {
        let start = self.span();
        self.expect(&Tok::Kw(Kw::Try), "'try'")?;
        let body = Box::new(self.parse_block()?);
        let mut catches = Vec::new();
        loop {
            let saved = self.pos;
            self.skip_newlines();
            if !self.eat(&Tok::Kw(Kw::Catch)) {
                self.pos = saved;
                break;
            }
            let mut binding = None;
            let mut classes = Vec::new();
            if self.eat(&Tok::LParen) {
                binding = Some(self.expect_ident("the exception binding name")?);
                if self.eat(&Tok::Colon) {
                    loop {
                        self.skip_newlines();
                        classes.push(self.parse_type_expr()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RParen, "')' after the catch binding")?;
            }
            let body = self.parse_block()?;
            catches.push(CatchClause {
                binding,
                classes,
                body,
            });
        }
        let finally = {
            let saved = self.pos;
            self.skip_newlines();
            if self.eat(&Tok::Kw(Kw::Finally)) {
                Some(Box::new(self.parse_block()?))
            } else {
                self.pos = saved;
                None
            }
        };
        if catches.is_empty() && finally.is_none() {
            return Err(self.error("'try' needs at least one 'catch' or a 'finally'"));
        }
        Ok(NodeLoc::new(
            start.to(self.prev_span()),
            Node::Try {
                body,
                catches,
                finally,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> Vec<NodeLoc> {
        let source = Source::new("test", text);
        let mut interns = Interns::default();
        parse(&source, &mut interns).unwrap()
    }

    fn parse_err(text: &str) -> SyntaxError {
        let source = Source::new("test", text);
        let mut interns = Interns::default();
        parse(&source, &mut interns).unwrap_err()
    }

    #[test]
    fn precedence_shapes() {
        let nodes = parse_ok("1 + 2 * 3");
        let Node::Binary { op: BinOp::Add, rhs, .. } = &nodes[0].node else {
            panic!("expected + at the top");
        };
        assert!(matches!(rhs.node, Node::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn assignment_is_left_associative() {
        // `a = b = c` parses as `(a = b) = c`; the evaluator rejects the
        // outer target, which is why chains need parenthesisation.
        let nodes = parse_ok("a = b = c");
        let Node::Assign { target, .. } = &nodes[0].node else {
            panic!("expected an assignment");
        };
        assert!(matches!(target.node, Node::Assign { .. }));
    }

    #[test]
    fn ranges_and_open_ends() {
        let nodes = parse_ok("1..5");
        assert!(matches!(
            nodes[0].node,
            Node::RangeLit { inclusive: true, .. }
        ));
        let nodes = parse_ok("1..<5");
        assert!(matches!(
            nodes[0].node,
            Node::RangeLit { inclusive: false, .. }
        ));
        let nodes = parse_ok("..5");
        assert!(matches!(
            nodes[0].node,
            Node::RangeLit { start: None, .. }
        ));
        let nodes = parse_ok("val r = 5..");
        assert!(matches!(nodes[0].node, Node::ValVar(_)));
    }

    #[test]
    fn empty_braces_are_never_a_map() {
        let nodes = parse_ok("val f = {}");
        let Node::ValVar(decl) = &nodes[0].node else {
            panic!("expected val");
        };
        assert!(matches!(decl.init.as_ref().unwrap().node, Node::Lambda(_)));
    }

    #[test]
    fn map_literal_shapes() {
        let nodes = parse_ok(r#"val m = {"a": 1, b: 2, c:, ...other}"#);
        let Node::ValVar(decl) = &nodes[0].node else {
            panic!("expected val");
        };
        let Node::MapLit(items) = &decl.init.as_ref().unwrap().node else {
            panic!("expected map literal");
        };
        assert_eq!(items.len(), 4);
        assert!(matches!(items[2], MapItem::Shorthand(_)));
        assert!(matches!(items[3], MapItem::Spread(_)));
    }

    #[test]
    fn duplicate_map_keys_fail_at_parse_time() {
        let err = parse_err(r#"{"k": 1, "k": 2}"#);
        assert!(err.message.contains("duplicate map key"));
    }

    #[test]
    fn trailing_lambda_joins_call() {
        let nodes = parse_ok("xs.forEach { println(it) }");
        let Node::Call { args, .. } = &nodes[0].node else {
            panic!("expected a call");
        };
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0], ArgNode::Pos(NodeLoc { node: Node::Lambda(_), .. })));
    }

    #[test]
    fn lambda_header_and_headerless() {
        let nodes = parse_ok("val f = { a, b -> a + b }");
        let Node::ValVar(decl) = &nodes[0].node else {
            panic!("expected val");
        };
        let Node::Lambda(def) = &decl.init.as_ref().unwrap().node else {
            panic!("expected lambda");
        };
        assert!(def.sig.has_header);
        assert_eq!(def.sig.params.len(), 2);

        let nodes = parse_ok("val g = { it * 2 }");
        let Node::ValVar(decl) = &nodes[0].node else {
            panic!("expected val");
        };
        let Node::Lambda(def) = &decl.init.as_ref().unwrap().node else {
            panic!("expected lambda");
        };
        assert!(!def.sig.has_header);
    }

    #[test]
    fn destructuring_patterns() {
        let nodes = parse_ok("val [a, mid..., z] = xs");
        let Node::Destructure { pattern, decl, .. } = &nodes[0].node else {
            panic!("expected destructure");
        };
        assert_eq!(pattern.len(), 3);
        assert!(matches!(pattern[1], PatItem::Splat(Some(_))));
        assert_eq!(*decl, Some(false));
    }

    #[test]
    fn labelled_loops_and_breaks() {
        let nodes = parse_ok("outer@ while (true) { break@outer 5 }");
        let Node::While { label, body, .. } = &nodes[0].node else {
            panic!("expected while");
        };
        assert!(label.is_some());
        let Node::Block(stmts) = &body.node else {
            panic!("expected block body");
        };
        assert!(matches!(
            stmts[0].node,
            Node::Break { label: Some(_), value: Some(_) }
        ));
    }

    #[test]
    fn shorthand_body_rejects_return() {
        let err = parse_err("fun f(x) = return x");
        assert!(err.message.contains("shorthand"));
    }

    #[test]
    fn class_with_bases_and_body() {
        let nodes = parse_ok(
            "class D(val x) : B1(x), B2() {\n  var y = 1\n  init { y = 2 }\n  fun m(a) = a\n}",
        );
        let Node::ClassDecl(def) = &nodes[0].node else {
            panic!("expected class");
        };
        assert_eq!(def.bases.len(), 2);
        assert_eq!(def.fields.len(), 1);
        assert_eq!(def.inits.len(), 1);
        assert_eq!(def.methods.len(), 1);
        assert!(def.sig.params[0].promote.is_some());
    }

    #[test]
    fn when_branches() {
        let nodes = parse_ok("when (x) { 1, 2 -> \"small\"\n in 3..9 -> \"mid\"\n is String -> \"s\"\n else -> \"big\" }");
        let Node::When { branches, otherwise, .. } = &nodes[0].node else {
            panic!("expected when");
        };
        assert_eq!(branches.len(), 3);
        assert_eq!(branches[0].conds.len(), 2);
        assert!(matches!(branches[1].conds[0], WhenCond::In { negated: false, .. }));
        assert!(matches!(branches[2].conds[0], WhenCond::Is { negated: false, .. }));
        assert!(otherwise.is_some());
    }

    #[test]
    fn scope_access_class() {
        let nodes = parse_ok("x::class::linearization");
        assert!(matches!(nodes[0].node, Node::ScopeAccess { .. }));
    }

    #[test]
    fn named_args_and_splats() {
        let nodes = parse_ok("f(1, k: 2, ...m)");
        let Node::Call { args, .. } = &nodes[0].node else {
            panic!("expected call");
        };
        assert!(matches!(args[0], ArgNode::Pos(_)));
        assert!(matches!(args[1], ArgNode::Named(..)));
        assert!(matches!(args[2], ArgNode::Splat(_)));
    }

    #[test]
    fn positional_after_named_fails() {
        let err = parse_err("f(k: 2, 1)");
        assert!(err.message.contains("positional"));
    }

    #[test]
    fn import_forms() {
        let nodes = parse_ok("import a.b.*");
        assert!(matches!(
            &nodes[0].node,
            Node::Import { path, star: true } if path == "a.b"
        ));
    }
}
