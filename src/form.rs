// Surface S-expression forms
//
// The compiler consumes and produces host code as S-expression data. The
// reader below stands in for the host reader; it attaches line/column spans
// that every downstream error kind carries.

use std::fmt;
use thiserror::Error;

/// Source position of a form, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A surface form. Equality ignores spans.
#[derive(Debug, Clone)]
pub struct Form {
    pub kind: FormKind,
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormKind {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Sym(String),
    Keyword(String),
    List(Vec<Form>),
    Vector(Vec<Form>),
    Map(Vec<(Form, Form)>),
    Set(Vec<Form>),
}

impl PartialEq for Form {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Form {}

impl Form {
    pub fn new(kind: FormKind) -> Self {
        Form { kind, span: None }
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }

    pub fn nil() -> Self {
        Form::new(FormKind::Nil)
    }

    pub fn bool(b: bool) -> Self {
        Form::new(FormKind::Bool(b))
    }

    pub fn int(n: i64) -> Self {
        Form::new(FormKind::Int(n))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Form::new(FormKind::Str(s.into()))
    }

    pub fn sym(name: impl Into<String>) -> Self {
        Form::new(FormKind::Sym(name.into()))
    }

    pub fn keyword(name: impl Into<String>) -> Self {
        Form::new(FormKind::Keyword(name.into()))
    }

    pub fn list(items: Vec<Form>) -> Self {
        Form::new(FormKind::List(items))
    }

    pub fn vector(items: Vec<Form>) -> Self {
        Form::new(FormKind::Vector(items))
    }

    pub fn map(pairs: Vec<(Form, Form)>) -> Self {
        Form::new(FormKind::Map(pairs))
    }

    pub fn set(items: Vec<Form>) -> Self {
        Form::new(FormKind::Set(items))
    }

    pub fn as_sym(&self) -> Option<&str> {
        match &self.kind {
            FormKind::Sym(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Form]> {
        match &self.kind {
            FormKind::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[Form]> {
        match &self.kind {
            FormKind::Vector(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.kind {
            FormKind::Int(n) => Some(n),
            _ => None,
        }
    }

    /// The operator symbol of a list form, if any.
    pub fn op_sym(&self) -> Option<&str> {
        self.as_list().and_then(|items| items.first()).and_then(|f| f.as_sym())
    }

    pub fn is_sym(&self, name: &str) -> bool {
        self.as_sym() == Some(name)
    }

    /// True when the form is a literal with no evaluation behavior.
    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            FormKind::Nil | FormKind::Bool(_) | FormKind::Int(_) | FormKind::Str(_) | FormKind::Keyword(_)
        )
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Form]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FormKind::Nil => write!(f, "nil"),
            FormKind::Bool(b) => write!(f, "{b}"),
            FormKind::Int(n) => write!(f, "{n}"),
            FormKind::Str(s) => write!(f, "{s:?}"),
            FormKind::Sym(s) => write!(f, "{s}"),
            FormKind::Keyword(k) => write!(f, ":{k}"),
            FormKind::List(items) => {
                write!(f, "(")?;
                write_seq(f, items)?;
                write!(f, ")")
            }
            FormKind::Vector(items) => {
                write!(f, "[")?;
                write_seq(f, items)?;
                write!(f, "]")
            }
            FormKind::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{k} {v}")?;
                }
                write!(f, "}}")
            }
            FormKind::Set(items) => {
                write!(f, "#{{")?;
                write_seq(f, items)?;
                write!(f, "}}")
            }
        }
    }
}

/// Syntactic rejection by the reader.
#[derive(Debug, Error)]
#[error("read error at {line}:{col}: {reason}")]
pub struct ReadError {
    pub reason: String,
    pub line: u32,
    pub col: u32,
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str) -> Self {
        Reader { src: src.as_bytes(), pos: 0, line: 1, col: 1 }
    }

    fn error(&self, reason: impl Into<String>) -> ReadError {
        ReadError { reason: reason.into(), line: self.line, col: self.col }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_ws(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() || c == b',' => {
                    self.bump();
                }
                Some(b';') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn span(&self) -> Span {
        Span { line: self.line, col: self.col }
    }

    fn read_form(&mut self) -> Result<Form, ReadError> {
        self.skip_ws();
        let span = self.span();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'(') => {
                self.bump();
                let items = self.read_until(b')')?;
                Ok(Form::list(items).with_span(Some(span)))
            }
            Some(b'[') => {
                self.bump();
                let items = self.read_until(b']')?;
                Ok(Form::vector(items).with_span(Some(span)))
            }
            Some(b'{') => {
                self.bump();
                let items = self.read_until(b'}')?;
                if items.len() % 2 != 0 {
                    return Err(self.error("map literal needs an even number of forms"));
                }
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                Ok(Form::map(pairs).with_span(Some(span)))
            }
            Some(b'#') if self.peek2() == Some(b'{') => {
                self.bump();
                self.bump();
                let items = self.read_until(b'}')?;
                Ok(Form::set(items).with_span(Some(span)))
            }
            Some(b')') | Some(b']') | Some(b'}') => Err(self.error("unmatched closing delimiter")),
            Some(b'"') => self.read_string(span),
            Some(b'\'') => {
                self.bump();
                let quoted = self.read_form()?;
                Ok(Form::list(vec![Form::sym("quote"), quoted]).with_span(Some(span)))
            }
            Some(_) => self.read_atom(span),
        }
    }

    fn read_until(&mut self, close: u8) -> Result<Vec<Form>, ReadError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Err(self.error(format!("missing closing {:?}", close as char))),
                Some(c) if c == close => {
                    self.bump();
                    return Ok(items);
                }
                Some(_) => items.push(self.read_form()?),
            }
        }
    }

    fn read_string(&mut self, span: Span) -> Result<Form, ReadError> {
        self.bump();
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => {
                    let text = String::from_utf8(out).map_err(|_| self.error("string is not valid utf-8"))?;
                    return Ok(Form::string(text).with_span(Some(span)));
                }
                Some(b'\\') => match self.bump() {
                    Some(b'n') => out.push(b'\n'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'"') => out.push(b'"'),
                    Some(b'\\') => out.push(b'\\'),
                    _ => return Err(self.error("bad string escape")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn read_atom(&mut self, span: Span) -> Result<Form, ReadError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() || matches!(c, b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'"' | b';' | b',') {
                break;
            }
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("atom is not valid utf-8"))?;
        if text.is_empty() {
            return Err(self.error("expected an atom"));
        }
        let kind = match text {
            "nil" => FormKind::Nil,
            "true" => FormKind::Bool(true),
            "false" => FormKind::Bool(false),
            _ => {
                if let Some(rest) = text.strip_prefix(':') {
                    if rest.is_empty() {
                        return Err(self.error("empty keyword"));
                    }
                    FormKind::Keyword(rest.to_string())
                } else if looks_numeric(text) {
                    match text.parse::<i64>() {
                        Ok(n) => FormKind::Int(n),
                        Err(_) => return Err(self.error(format!("bad number {text:?}"))),
                    }
                } else {
                    FormKind::Sym(text.to_string())
                }
            }
        };
        Ok(Form::new(kind).with_span(Some(span)))
    }
}

fn looks_numeric(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().next().is_some_and(|c| c.is_ascii_digit())
}

/// Read every form in `src`.
pub fn read_str(src: &str) -> Result<Vec<Form>, ReadError> {
    let mut reader = Reader::new(src);
    let mut forms = Vec::new();
    loop {
        reader.skip_ws();
        if reader.peek().is_none() {
            return Ok(forms);
        }
        forms.push(reader.read_form()?);
    }
}

/// Read exactly one form.
pub fn read_one(src: &str) -> Result<Form, ReadError> {
    let forms = read_str(src)?;
    match forms.len() {
        1 => Ok(forms.into_iter().next().expect("length checked above")),
        n => Err(ReadError { reason: format!("expected one form, found {n}"), line: 1, col: 1 }),
    }
}
