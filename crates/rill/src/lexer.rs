//! Single-pass lexer: source text to a token stream.
//!
//! Newlines are emitted as tokens (the parser uses them for statement
//! termination and trailing-lambda disambiguation) and comments are kept
//! as tokens so downstream tooling can preserve them; the parser skips
//! both comments and, where the grammar allows, newlines.
//!
//! `in`, `is`, `!in` and `!is` are lexed as single atomic tokens. A name
//! immediately followed by `@` is a label declaration (`outer@`); `@` then
//! a name is a label reference (`@outer`).

use strum::Display;

use crate::{
    exceptions::SyntaxError,
    intern::{Interns, StringId},
    source::{Source, Span},
};

/// Keywords of the surface language.
///
/// `in` and `is` are not here: together with their negated forms they are
/// atomic operator tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Kw {
    Val,
    Var,
    Fun,
    Fn,
    Class,
    Object,
    Enum,
    Interface,
    Init,
    Static,
    Private,
    Protected,
    Open,
    Abstract,
    If,
    Else,
    When,
    While,
    Do,
    For,
    Break,
    Continue,
    Return,
    Try,
    Catch,
    Finally,
    Throw,
    Import,
    Package,
    By,
    This,
    Super,
    Null,
    Void,
    True,
    False,
}

fn keyword(word: &str) -> Option<Kw> {
    Some(match word {
        "val" => Kw::Val,
        "var" => Kw::Var,
        "fun" => Kw::Fun,
        "fn" => Kw::Fn,
        "class" => Kw::Class,
        "object" => Kw::Object,
        "enum" => Kw::Enum,
        "interface" => Kw::Interface,
        "init" => Kw::Init,
        "static" => Kw::Static,
        "private" => Kw::Private,
        "protected" => Kw::Protected,
        "open" => Kw::Open,
        "abstract" => Kw::Abstract,
        "if" => Kw::If,
        "else" => Kw::Else,
        "when" => Kw::When,
        "while" => Kw::While,
        "do" => Kw::Do,
        "for" => Kw::For,
        "break" => Kw::Break,
        "continue" => Kw::Continue,
        "return" => Kw::Return,
        "try" => Kw::Try,
        "catch" => Kw::Catch,
        "finally" => Kw::Finally,
        "throw" => Kw::Throw,
        "import" => Kw::Import,
        "package" => Kw::Package,
        "by" => Kw::By,
        "this" => Kw::This,
        "super" => Kw::Super,
        "null" => Kw::Null,
        "void" => Kw::Void,
        "true" => Kw::True,
        "false" => Kw::False,
        _ => return None,
    })
}

/// One lexical token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(StringId),
    Int(i64),
    Real(f64),
    Str(String),
    Char(char),
    /// Label declaration: `name@`.
    Label(StringId),
    /// Label reference: `@name`.
    AtLabel(StringId),
    Kw(Kw),

    // membership / type tests, lexed atomically
    In,
    NotIn,
    Is,
    NotIs,

    // operators
    Assign,        // =
    PlusAssign,    // +=
    MinusAssign,   // -=
    StarAssign,    // *=
    SlashAssign,   // /=
    PercentAssign, // %=
    IfNullAssign,  // ?=
    Eq,            // ==
    NotEq,         // !=
    RefEq,         // ===
    RefNotEq,      // !==
    Lt,
    LtEq,
    Gt,
    GtEq,
    Shuttle, // <=>
    AndAnd,
    OrOr,
    PlusPlus,
    MinusMinus,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,      // !
    Amp,      // &
    Pipe,     // |
    Caret,    // ^
    Tilde,    // ~
    Shl,      // <<
    Shr,      // >>
    Ushr,     // >>>
    Elvis,    // ?:
    QDot,     // ?.
    QBracket, // ?[
    QParen,   // ?(
    Arrow,    // ->
    FatArrow, // =>
    Scope,    // ::
    DotDot,   // ..
    DotDotLt, // ..<
    Ellipsis, // ...
    Dot,
    Colon,
    Semicolon,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    Newline,
    LineComment(String),
    BlockComment(String),
    Eof,
}

/// A token with its source span.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub span: Span,
}

pub(crate) struct Lexer<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    interns: &'a mut Interns,
    tokens: Vec<Token>,
}

/// Lexes a whole source, returning the token stream terminated by `Eof`.
pub(crate) fn lex(source: &Source, interns: &mut Interns) -> Result<Vec<Token>, SyntaxError> {
    Lexer {
        text: source.text(),
        bytes: source.text().as_bytes(),
        pos: 0,
        interns,
        tokens: Vec::new(),
    }
    .run()
}

impl Lexer<'_> {
    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        while self.pos < self.bytes.len() {
            let start = self.pos;
            let b = self.bytes[self.pos];
            match b {
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'\n' => {
                    self.pos += 1;
                    // Collapse runs of blank lines into one Newline token.
                    if !matches!(self.tokens.last().map(|t| &t.tok), Some(Tok::Newline)) {
                        self.push(Tok::Newline, start);
                    }
                }
                b'0'..=b'9' => self.number(start)?,
                b'"' => self.string(start)?,
                b'\'' => self.char_literal(start)?,
                b'@' => self.at_label(start)?,
                b'/' => self.slash(start)?,
                _ if is_ident_start(self.cur_char()) => self.word(start),
                _ => self.operator(start)?,
            }
        }
        let end = self.pos;
        self.push(Tok::Eof, end);
        Ok(self.tokens)
    }

    fn cur_char(&self) -> char {
        self.text[self.pos..].chars().next().unwrap_or('\0')
    }

    fn peek(&self, ahead: usize) -> u8 {
        *self.bytes.get(self.pos + ahead).unwrap_or(&0)
    }

    fn push(&mut self, tok: Tok, start: usize) {
        self.tokens.push(Token {
            tok,
            span: Span::new(start as u32, self.pos as u32),
        });
    }

    fn error(&self, start: usize, msg: impl Into<String>) -> SyntaxError {
        SyntaxError::new(msg, Span::new(start as u32, self.pos.max(start + 1) as u32))
    }

    // --- words -------------------------------------------------------------

    fn word(&mut self, start: usize) {
        let mut chars = self.text[self.pos..].char_indices();
        let mut end = self.pos;
        for (i, c) in &mut chars {
            if is_ident_continue(c) {
                end = self.pos + i + c.len_utf8();
            } else {
                break;
            }
        }
        let word = &self.text[self.pos..end];
        self.pos = end;
        if word == "in" {
            self.push(Tok::In, start);
        } else if word == "is" {
            self.push(Tok::Is, start);
        } else if let Some(kw) = keyword(word) {
            self.push(Tok::Kw(kw), start);
        } else if self.peek(0) == b'@' && self.peek(1) != b'@' {
            // `name@` declares a label for the construct that follows.
            let id = self.interns.intern(word);
            self.pos += 1;
            self.push(Tok::Label(id), start);
        } else {
            let id = self.interns.intern(word);
            self.push(Tok::Ident(id), start);
        }
    }

    fn at_label(&mut self, start: usize) -> Result<(), SyntaxError> {
        self.pos += 1;
        if !is_ident_start(self.cur_char()) {
            return Err(self.error(start, "expected a name after '@'"));
        }
        let word_start = self.pos;
        while is_ident_continue(self.cur_char()) {
            self.pos += self.cur_char().len_utf8();
        }
        let id = self.interns.intern(&self.text[word_start..self.pos]);
        self.push(Tok::AtLabel(id), start);
        Ok(())
    }

    // --- numbers -----------------------------------------------------------

    fn number(&mut self, start: usize) -> Result<(), SyntaxError> {
        if self.peek(0) == b'0' && (self.peek(1) == b'x' || self.peek(1) == b'X') {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek(0).is_ascii_hexdigit() {
                self.pos += 1;
            }
            if self.pos == digits_start {
                return Err(self.error(start, "expected hex digits after '0x'"));
            }
            let value = i64::from_str_radix(&self.text[digits_start..self.pos], 16)
                .map_err(|_| self.error(start, "hex literal out of range"))?;
            self.push(Tok::Int(value), start);
            return Ok(());
        }

        while self.peek(0).is_ascii_digit() {
            self.pos += 1;
        }
        let mut is_real = false;
        // A trailing `.` without a digit is member access, not a fraction.
        if self.peek(0) == b'.' && self.peek(1).is_ascii_digit() {
            is_real = true;
            self.pos += 1;
            while self.peek(0).is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.peek(0) == b'e' || self.peek(0) == b'E' {
            let mut ahead = 1;
            if self.peek(1) == b'+' || self.peek(1) == b'-' {
                ahead = 2;
            }
            if self.peek(ahead).is_ascii_digit() {
                is_real = true;
                self.pos += ahead;
                while self.peek(0).is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }
        let text = &self.text[start..self.pos];
        if is_real {
            let value: f64 = text.parse().map_err(|_| self.error(start, "invalid number literal"))?;
            self.push(Tok::Real(value), start);
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error(start, "integer literal out of range"))?;
            self.push(Tok::Int(value), start);
        }
        Ok(())
    }

    // --- strings and chars -------------------------------------------------

    fn escape(&mut self, quote: char) -> char {
        // Called with `pos` on the character after the backslash. Unknown
        // escapes pass the escaped character through literally.
        let c = self.cur_char();
        self.pos += c.len_utf8();
        match c {
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            '\\' => '\\',
            c if c == quote => quote,
            c => c,
        }
    }

    fn string(&mut self, start: usize) -> Result<(), SyntaxError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            if self.pos >= self.bytes.len() {
                return Err(self.error(start, "unterminated string literal"));
            }
            let c = self.cur_char();
            self.pos += c.len_utf8();
            match c {
                '"' => break,
                '\\' => {
                    if self.pos >= self.bytes.len() {
                        return Err(self.error(start, "unterminated string literal"));
                    }
                    out.push(self.escape('"'));
                }
                c => out.push(c),
            }
        }
        self.push(Tok::Str(dedent_multiline(&out)), start);
        Ok(())
    }

    fn char_literal(&mut self, start: usize) -> Result<(), SyntaxError> {
        self.pos += 1;
        if self.pos >= self.bytes.len() {
            return Err(self.error(start, "unterminated character literal"));
        }
        let mut c = self.cur_char();
        self.pos += c.len_utf8();
        if c == '\\' {
            if self.pos >= self.bytes.len() {
                return Err(self.error(start, "unterminated character literal"));
            }
            c = self.escape('\'');
        } else if c == '\'' {
            return Err(self.error(start, "empty character literal"));
        }
        if self.cur_char() != '\'' {
            return Err(self.error(start, "character literal must contain exactly one character"));
        }
        self.pos += 1;
        self.push(Tok::Char(c), start);
        Ok(())
    }

    // --- comments ----------------------------------------------------------

    fn slash(&mut self, start: usize) -> Result<(), SyntaxError> {
        match self.peek(1) {
            b'/' => {
                self.pos += 2;
                let text_start = self.pos;
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                let text = self.text[text_start..self.pos].to_owned();
                self.push(Tok::LineComment(text), start);
            }
            b'*' => {
                self.pos += 2;
                let text_start = self.pos;
                loop {
                    if self.pos + 1 >= self.bytes.len() {
                        return Err(self.error(start, "unterminated block comment"));
                    }
                    if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                        break;
                    }
                    self.pos += 1;
                }
                let text = self.text[text_start..self.pos].to_owned();
                self.pos += 2;
                self.push(Tok::BlockComment(text), start);
            }
            b'=' => {
                self.pos += 2;
                self.push(Tok::SlashAssign, start);
            }
            _ => {
                self.pos += 1;
                self.push(Tok::Slash, start);
            }
        }
        Ok(())
    }

    // --- operators ---------------------------------------------------------

    fn operator(&mut self, start: usize) -> Result<(), SyntaxError> {
        let b = self.bytes[self.pos];
        let tok = match b {
            b'=' => match (self.peek(1), self.peek(2)) {
                (b'=', b'=') => self.take(3, Tok::RefEq),
                (b'=', _) => self.take(2, Tok::Eq),
                (b'>', _) => self.take(2, Tok::FatArrow),
                _ => self.take(1, Tok::Assign),
            },
            b'!' => {
                if self.word_follows(1, "in") {
                    self.pos += 3;
                    Tok::NotIn
                } else if self.word_follows(1, "is") {
                    self.pos += 3;
                    Tok::NotIs
                } else {
                    match (self.peek(1), self.peek(2)) {
                        (b'=', b'=') => self.take(3, Tok::RefNotEq),
                        (b'=', _) => self.take(2, Tok::NotEq),
                        _ => self.take(1, Tok::Not),
                    }
                }
            }
            b'<' => match (self.peek(1), self.peek(2)) {
                (b'=', b'>') => self.take(3, Tok::Shuttle),
                (b'=', _) => self.take(2, Tok::LtEq),
                (b'<', _) => self.take(2, Tok::Shl),
                _ => self.take(1, Tok::Lt),
            },
            b'>' => match (self.peek(1), self.peek(2)) {
                (b'>', b'>') => self.take(3, Tok::Ushr),
                (b'>', _) => self.take(2, Tok::Shr),
                (b'=', _) => self.take(2, Tok::GtEq),
                _ => self.take(1, Tok::Gt),
            },
            b'&' => match self.peek(1) {
                b'&' => self.take(2, Tok::AndAnd),
                _ => self.take(1, Tok::Amp),
            },
            b'|' => match self.peek(1) {
                b'|' => self.take(2, Tok::OrOr),
                _ => self.take(1, Tok::Pipe),
            },
            b'+' => match self.peek(1) {
                b'+' => self.take(2, Tok::PlusPlus),
                b'=' => self.take(2, Tok::PlusAssign),
                _ => self.take(1, Tok::Plus),
            },
            b'-' => match self.peek(1) {
                b'-' => self.take(2, Tok::MinusMinus),
                b'=' => self.take(2, Tok::MinusAssign),
                b'>' => self.take(2, Tok::Arrow),
                _ => self.take(1, Tok::Minus),
            },
            b'*' => match self.peek(1) {
                b'=' => self.take(2, Tok::StarAssign),
                _ => self.take(1, Tok::Star),
            },
            b'%' => match self.peek(1) {
                b'=' => self.take(2, Tok::PercentAssign),
                _ => self.take(1, Tok::Percent),
            },
            b'?' => match self.peek(1) {
                b':' => self.take(2, Tok::Elvis),
                b'=' => self.take(2, Tok::IfNullAssign),
                b'.' => self.take(2, Tok::QDot),
                b'[' => self.take(2, Tok::QBracket),
                b'(' => self.take(2, Tok::QParen),
                _ => {
                    self.pos += 1;
                    return Err(self.error(start, "unexpected '?'"));
                }
            },
            b'.' => match (self.peek(1), self.peek(2)) {
                (b'.', b'<') => self.take(3, Tok::DotDotLt),
                (b'.', b'.') => self.take(3, Tok::Ellipsis),
                (b'.', _) => self.take(2, Tok::DotDot),
                _ => self.take(1, Tok::Dot),
            },
            b':' => match self.peek(1) {
                b':' => self.take(2, Tok::Scope),
                _ => self.take(1, Tok::Colon),
            },
            b'^' => self.take(1, Tok::Caret),
            b'~' => self.take(1, Tok::Tilde),
            b'(' => self.take(1, Tok::LParen),
            b')' => self.take(1, Tok::RParen),
            b'[' => self.take(1, Tok::LBracket),
            b']' => self.take(1, Tok::RBracket),
            b'{' => self.take(1, Tok::LBrace),
            b'}' => self.take(1, Tok::RBrace),
            b',' => self.take(1, Tok::Comma),
            b';' => self.take(1, Tok::Semicolon),
            _ => {
                let c = self.cur_char();
                self.pos += c.len_utf8();
                return Err(self.error(start, format!("unexpected character '{c}'")));
            }
        };
        self.push(tok, start);
        Ok(())
    }

    fn take(&mut self, len: usize, tok: Tok) -> Tok {
        self.pos += len;
        tok
    }

    /// True when `word` appears at `pos + offset` followed by a non-identifier
    /// character, so `!in`/`!is` never swallow names like `!inner`.
    fn word_follows(&self, offset: usize, word: &str) -> bool {
        let start = self.pos + offset;
        let end = start + word.len();
        if self.text.len() < end || &self.text[start..end] != word {
            return false;
        }
        !self.text[end..].chars().next().is_some_and(is_ident_continue)
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

/// Strips blank first/last lines and the common leading indent from a
/// multi-line string literal. Single-line literals pass through unchanged.
fn dedent_multiline(s: &str) -> String {
    if !s.contains('\n') {
        return s.to_owned();
    }
    let lines: Vec<&str> = s.split('\n').collect();
    let first_blank = lines.first().is_some_and(|l| l.trim().is_empty());
    let last_blank = lines.last().is_some_and(|l| l.trim().is_empty());
    if !first_blank || !last_blank {
        return s.to_owned();
    }
    let body = &lines[1..lines.len() - 1];
    let indent = body
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    body.iter()
        .map(|l| if l.len() >= indent { &l[indent..] } else { l.trim_start() })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(text: &str) -> Vec<Tok> {
        let source = Source::new("test", text);
        let mut interns = Interns::default();
        lex(&source, &mut interns)
            .unwrap()
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    fn names(text: &str) -> (Vec<Tok>, Interns) {
        let source = Source::new("test", text);
        let mut interns = Interns::default();
        let tokens = lex(&source, &mut interns).unwrap();
        (tokens.into_iter().map(|t| t.tok).collect(), interns)
    }

    #[test]
    fn numbers() {
        assert_eq!(toks("42")[0], Tok::Int(42));
        assert_eq!(toks("0xFF")[0], Tok::Int(255));
        assert_eq!(toks("3.5")[0], Tok::Real(3.5));
        assert_eq!(toks("1e3")[0], Tok::Real(1000.0));
        assert_eq!(toks("2.5e-1")[0], Tok::Real(0.25));
    }

    #[test]
    fn trailing_dot_is_member_access() {
        let ts = toks("1.size");
        assert_eq!(ts[0], Tok::Int(1));
        assert_eq!(ts[1], Tok::Dot);
    }

    #[test]
    fn range_after_int() {
        let ts = toks("1..5");
        assert_eq!(ts[0], Tok::Int(1));
        assert_eq!(ts[1], Tok::DotDot);
        assert_eq!(ts[2], Tok::Int(5));
        let ts = toks("1..<5");
        assert_eq!(ts[1], Tok::DotDotLt);
    }

    #[test]
    fn membership_tokens_are_atomic() {
        assert_eq!(toks("a in b")[1], Tok::In);
        assert_eq!(toks("a !in b")[1], Tok::NotIn);
        assert_eq!(toks("a is b")[1], Tok::Is);
        assert_eq!(toks("a !is b")[1], Tok::NotIs);
        // `!inner` must stay a negation of a name
        let ts = toks("!inner");
        assert_eq!(ts[0], Tok::Not);
        assert!(matches!(ts[1], Tok::Ident(_)));
    }

    #[test]
    fn labels() {
        let (ts, interns) = names("outer@ while break@outer");
        match &ts[0] {
            Tok::Label(id) => assert_eq!(interns.get(*id), "outer"),
            other => panic!("expected label, got {other:?}"),
        }
        assert_eq!(ts[1], Tok::Kw(Kw::While));
        assert_eq!(ts[2], Tok::Kw(Kw::Break));
        match &ts[3] {
            Tok::AtLabel(id) => assert_eq!(interns.get(*id), "outer"),
            other => panic!("expected at-label, got {other:?}"),
        }
    }

    #[test]
    fn string_escapes() {
        assert_eq!(toks(r#""a\tb\n\"q\"""#)[0], Tok::Str("a\tb\n\"q\"".into()));
        // unknown escapes pass through literally
        assert_eq!(toks(r#""\q""#)[0], Tok::Str("q".into()));
    }

    #[test]
    fn multiline_string_dedent() {
        let src = "\"\n    line one\n      line two\n\"";
        assert_eq!(toks(src)[0], Tok::Str("line one\n  line two".into()));
    }

    #[test]
    fn char_literals() {
        assert_eq!(toks("'x'")[0], Tok::Char('x'));
        assert_eq!(toks(r"'\n'")[0], Tok::Char('\n'));
        assert_eq!(toks(r"'\''")[0], Tok::Char('\''));
    }

    #[test]
    fn compound_operators() {
        assert_eq!(toks("<=>")[0], Tok::Shuttle);
        assert_eq!(toks(">>>")[0], Tok::Ushr);
        assert_eq!(toks("?:")[0], Tok::Elvis);
        assert_eq!(toks("?.")[0], Tok::QDot);
        assert_eq!(toks("?[")[0], Tok::QBracket);
        assert_eq!(toks("===")[0], Tok::RefEq);
        assert_eq!(toks("!==")[0], Tok::RefNotEq);
        assert_eq!(toks("...")[0], Tok::Ellipsis);
        assert_eq!(toks("=>")[0], Tok::FatArrow);
    }

    #[test]
    fn comments_are_tokens() {
        let ts = toks("1 // note\n2");
        assert!(matches!(ts[1], Tok::LineComment(ref s) if s == " note"));
        let ts = toks("1 /* block */ 2");
        assert!(matches!(ts[1], Tok::BlockComment(_)));
    }

    #[test]
    fn unterminated_string_fails() {
        let source = Source::new("test", "\"abc");
        let mut interns = Interns::default();
        assert!(lex(&source, &mut interns).is_err());
    }

    #[test]
    fn newlines_collapse() {
        let ts = toks("a\n\n\nb");
        assert_eq!(ts.iter().filter(|t| matches!(t, Tok::Newline)).count(), 1);
    }
}
