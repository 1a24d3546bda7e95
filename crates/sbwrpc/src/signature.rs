//! # Signatures
//!
//! Structural type descriptors and the textual syntax they are declared in.
//!
//! ```text
//! signature := type name '(' [element (',' element)*] ')'
//! element   := type [name]
//! type      := base ('[' ']')*
//! base      := byte | int | integer | double | boolean | string | complex | void
//!            | '{' [element (',' element)*] '}'
//!            | list '(' [element (',' element)*] ')'
//! ```
//!
//! ## Matching
//!
//! `Signature::matches` is the compatibility relation used to pick methods. It is
//! reflexive and symmetric. Element names never take part in it, and an empty list `{}`
//! matches any list.

use crate::error::{Error, Result};
use sbwpack::MAX_DEPTH;
use sbwpack::Tag;

/// The non-composite types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Atomic {
    Byte,
    Integer,
    Double,
    Boolean,
    String,
    Complex,
    Void,
    /// A list whose contents are unspecified, written `{}`.
    List,
}

impl Atomic {
    pub fn keyword(self) -> &'static str {
        match self {
            Atomic::Byte => "byte",
            Atomic::Integer => "int",
            Atomic::Double => "double",
            Atomic::Boolean => "boolean",
            Atomic::String => "string",
            Atomic::Complex => "complex",
            Atomic::Void => "void",
            Atomic::List => "{}",
        }
    }

    pub fn tag(self) -> Tag {
        match self {
            Atomic::Byte => Tag::Byte,
            Atomic::Integer => Tag::Integer,
            Atomic::Double => Tag::Double,
            Atomic::Boolean => Tag::Boolean,
            Atomic::String => Tag::String,
            Atomic::Complex => Tag::Complex,
            Atomic::Void => Tag::Void,
            Atomic::List => Tag::List,
        }
    }
}

/// A structural type descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Signature {
    Atomic(Atomic),
    /// `inner` is never itself an array; extra dimensions are folded into `dims`.
    Array { inner: Box<Signature>, dims: u32 },
    /// An ordered list of typed, optionally named elements.
    List(Vec<Element>),
}

/// One position of a list or parameter list.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub ty: Signature,
    pub name: Option<String>,
}

impl Element {
    pub fn new(ty: Signature) -> Self {
        Self { ty, name: None }
    }

    pub fn named(ty: Signature, name: impl Into<String>) -> Self {
        Self { ty, name: Some(name.into()) }
    }
}

impl From<Signature> for Element {
    fn from(ty: Signature) -> Self { Element::new(ty) }
}

impl Signature {
    pub fn byte() -> Self { Signature::Atomic(Atomic::Byte) }
    pub fn integer() -> Self { Signature::Atomic(Atomic::Integer) }
    pub fn double() -> Self { Signature::Atomic(Atomic::Double) }
    pub fn boolean() -> Self { Signature::Atomic(Atomic::Boolean) }
    pub fn string() -> Self { Signature::Atomic(Atomic::String) }
    pub fn complex() -> Self { Signature::Atomic(Atomic::Complex) }
    pub fn void() -> Self { Signature::Atomic(Atomic::Void) }
    pub fn any_list() -> Self { Signature::Atomic(Atomic::List) }

    /// Builds a list signature. An empty element list is the `{}` placeholder.
    pub fn list(elements: Vec<Element>) -> Self {
        if elements.is_empty() {
            Signature::any_list()
        } else {
            Signature::List(elements)
        }
    }

    /// Builds an array signature, folding nested arrays into a single rank.
    pub fn array(inner: Signature, dims: u32) -> Self {
        if dims == 0 {
            return inner;
        }
        match inner {
            Signature::Array { inner, dims: d } => Signature::Array { inner, dims: d + dims },
            other => Signature::Array { inner: Box::new(other), dims },
        }
    }

    /// The wire tag of values of this type.
    pub fn tag(&self) -> Tag {
        match self {
            Signature::Atomic(a) => a.tag(),
            Signature::Array { .. } => Tag::Array,
            Signature::List(_) => Tag::List,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Signature::Atomic(Atomic::Void))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Signature::List(_) | Signature::Atomic(Atomic::List))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Signature::Array { .. })
    }

    /// Compatibility check used for method resolution.
    pub fn matches(&self, other: &Signature) -> bool {
        match (self, other) {
            (Signature::Atomic(a), Signature::Atomic(b)) => a == b,
            (Signature::Array { inner: a, dims: da }, Signature::Array { inner: b, dims: db }) => {
                da == db && a.matches(b)
            }
            (Signature::List(a), Signature::List(b)) => {
                a.is_empty() || b.is_empty() || elements_match(a, b)
            }
            (Signature::List(_), Signature::Atomic(Atomic::List))
            | (Signature::Atomic(Atomic::List), Signature::List(_)) => true,
            _ => false,
        }
    }

    /// Exact structural equality with element names ignored.
    pub fn same_shape(&self, other: &Signature) -> bool {
        match (self, other) {
            (Signature::Atomic(a), Signature::Atomic(b)) => a == b,
            (Signature::Array { inner: a, dims: da }, Signature::Array { inner: b, dims: db }) => {
                da == db && a.same_shape(b)
            }
            (Signature::List(a), Signature::List(b)) => elements_same_shape(a, b),
            (Signature::List(a), Signature::Atomic(Atomic::List))
            | (Signature::Atomic(Atomic::List), Signature::List(a)) => a.is_empty(),
            _ => false,
        }
    }

    pub fn array_inner_type(&self) -> Result<&Signature> {
        match self {
            Signature::Array { inner, .. } => Ok(inner),
            other => Err(other.not_a("array")),
        }
    }

    pub fn array_dimensions(&self) -> Result<u32> {
        match self {
            Signature::Array { dims, .. } => Ok(*dims),
            other => Err(other.not_a("array")),
        }
    }

    /// The elements of a list type. The `{}` placeholder has none.
    pub fn list_contents(&self) -> Result<&[Element]> {
        match self {
            Signature::List(elements) => Ok(elements),
            Signature::Atomic(Atomic::List) => Ok(&[]),
            other => Err(other.not_a("list")),
        }
    }

    fn not_a(&self, expected: &str) -> Error {
        Error::TypeMismatch { expected: expected.to_string(), found: self.to_string() }
    }

    /// Parses a single type, e.g. `"{double x, int[]}"`.
    pub fn parse(input: &str) -> Result<Signature> {
        let mut parser = Parser::new(input);
        let ty = parser.parse_type(true)?;
        parser.end()?;
        Ok(ty)
    }
}

/// Positional compatibility of two element lists.
pub fn elements_match(a: &[Element], b: &[Element]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.ty.matches(&y.ty))
}

fn elements_same_shape(a: &[Element], b: &[Element]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.ty.same_shape(&y.ty))
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signature::Atomic(a) => f.write_str(a.keyword()),
            Signature::Array { inner, dims } => {
                write!(f, "{}", inner)?;
                for _ in 0..*dims {
                    f.write_str("[]")?;
                }
                Ok(())
            }
            Signature::List(elements) => {
                f.write_str("{")?;
                write_elements(f, elements)?;
                f.write_str("}")
            }
        }
    }
}

impl std::fmt::Display for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} {}", self.ty, name),
            None => write!(f, "{}", self.ty),
        }
    }
}

fn write_elements(f: &mut std::fmt::Formatter<'_>, elements: &[Element]) -> std::fmt::Result {
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", element)?;
    }
    Ok(())
}

// ============================================================================
//  METHOD SIGNATURES
// ============================================================================

/// A method's name, return type and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSignature {
    pub name: String,
    pub returns: Signature,
    pub params: Vec<Element>,
}

impl MethodSignature {
    /// Parses `"<returnType> <name>(<paramType> [paramName], ...)"`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = Parser::new(input);
        let returns = parser.parse_type(true)?;
        let name = parser.ident().ok_or_else(|| parser.error("method name"))?.to_string();
        parser.expect("(", "`(`")?;
        let params = parser.parse_elements(')')?;
        parser.end()?;
        Ok(Self { name, returns, params })
    }

    /// The parameter types as a single list signature.
    pub fn params_signature(&self) -> Signature {
        Signature::list(self.params.clone())
    }

    /// Two methods that would be indistinguishable to a full selector.
    pub fn same_shape(&self, other: &MethodSignature) -> bool {
        self.name == other.name && elements_same_shape(&self.params, &other.params)
    }
}

impl std::fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}(", self.returns, self.name)?;
        write_elements(f, &self.params)?;
        f.write_str(")")
    }
}

impl std::str::FromStr for MethodSignature {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> { MethodSignature::parse(s) }
}

// ============================================================================
//  SELECTORS
// ============================================================================

/// Picks a method out of a service.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// `"sin"`: every method with this name.
    Name(String),
    /// `"sin(double)"`: methods with this name whose parameters match.
    Params { name: String, params: Vec<Element> },
    /// `"double sin(double)"`: the method with exactly these parameters, or else as
    /// `Params`. The return type is informational.
    Full(MethodSignature),
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self> {
        if let Ok(sig) = MethodSignature::parse(input) {
            return Ok(Selector::Full(sig));
        }

        let mut parser = Parser::new(input);
        let name = parser.ident().ok_or_else(|| parser.error("method name"))?.to_string();
        if parser.at_end() {
            return Ok(Selector::Name(name));
        }
        parser.expect("(", "`(` or end of selector")?;
        let params = parser.parse_elements(')')?;
        parser.end()?;
        Ok(Selector::Params { name, params })
    }

    /// A selector for `name` with the given parameter types.
    pub fn with_params(name: impl Into<String>, params: Vec<Element>) -> Self {
        Selector::Params { name: name.into(), params }
    }

    pub fn name(&self) -> &str {
        match self {
            Selector::Name(name) | Selector::Params { name, .. } => name,
            Selector::Full(sig) => &sig.name,
        }
    }

    pub fn matches(&self, method: &MethodSignature) -> bool {
        match self {
            Selector::Name(name) => *name == method.name,
            Selector::Params { name, params } => {
                *name == method.name && elements_match(params, &method.params)
            }
            Selector::Full(sig) => {
                sig.name == method.name && elements_match(&sig.params, &method.params)
            }
        }
    }

    /// Finds the single method this selector picks.
    pub fn resolve<'m>(&self, methods: impl IntoIterator<Item = &'m MethodSignature>) -> Result<usize> {
        let methods: Vec<&MethodSignature> = methods.into_iter().collect();
        if let Selector::Full(sig) = self {
            // Services never hold two methods of the same shape.
            if let Some(index) = methods.iter().position(|m| sig.same_shape(m)) {
                return Ok(index);
            }
        }

        let mut found = None;
        let mut candidates = Vec::new();
        for (index, method) in methods.into_iter().enumerate() {
            if self.matches(method) {
                found.get_or_insert(index);
                candidates.push(method.to_string());
            }
        }
        match (found, candidates.len()) {
            (Some(index), 1) => Ok(index),
            (None, _) => Err(Error::MethodNotFound(self.to_string())),
            _ => Err(Error::MethodAmbiguous { selector: self.to_string(), candidates }),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Name(name) => f.write_str(name),
            Selector::Params { name, params } => {
                write!(f, "{}(", name)?;
                write_elements(f, params)?;
                f.write_str(")")
            }
            Selector::Full(sig) => write!(f, "{}", sig),
        }
    }
}

impl std::str::FromStr for Selector {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> { Selector::parse(s) }
}

// ============================================================================
//  PARSER
// ============================================================================

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    /// Lists currently open inside the parameter list.
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0, depth: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.rest().is_empty()
    }

    fn error(&self, expected: &'static str) -> Error {
        Error::SignatureSyntax { input: self.src.to_string(), position: self.pos, expected }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str, expected: &'static str) -> Result<()> {
        if self.eat(token) { Ok(()) } else { Err(self.error(expected)) }
    }

    fn end(&mut self) -> Result<()> {
        if self.at_end() { Ok(()) } else { Err(self.error("end of signature")) }
    }

    fn ident(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
            .unwrap_or(rest.len());
        if len == 0 || rest.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }

    fn parse_type(&mut self, allow_void: bool) -> Result<Signature> {
        let start = self.pos;
        let base = self.parse_base()?;
        let mut dims = 0;
        while self.eat("[") {
            self.expect("]", "`]`")?;
            dims += 1;
        }
        if base.is_void() && (dims > 0 || !allow_void) {
            self.pos = start;
            return Err(self.error("a non-void type"));
        }
        Ok(Signature::array(base, dims))
    }

    fn parse_base(&mut self) -> Result<Signature> {
        if self.eat("{") {
            return Ok(Signature::list(self.parse_nested('}')?));
        }
        let start = self.pos;
        let word = self.ident().ok_or_else(|| self.error("a type"))?;
        let atomic = match word {
            "byte" => Atomic::Byte,
            "int" | "integer" => Atomic::Integer,
            "double" => Atomic::Double,
            "boolean" => Atomic::Boolean,
            "string" => Atomic::String,
            "complex" => Atomic::Complex,
            "void" => Atomic::Void,
            "list" if self.eat("(") => return Ok(Signature::list(self.parse_nested(')')?)),
            _ => {
                self.pos = start;
                return Err(self.error("a type"));
            }
        };
        Ok(Signature::Atomic(atomic))
    }

    fn parse_nested(&mut self, close: char) -> Result<Vec<Element>> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("fewer nested lists"));
        }
        self.depth += 1;
        let elements = self.parse_elements(close);
        self.depth -= 1;
        elements
    }

    fn parse_elements(&mut self, close: char) -> Result<Vec<Element>> {
        let mut close_buf = [0u8; 4];
        let close: &str = close.encode_utf8(&mut close_buf);

        let mut elements = Vec::new();
        if self.eat(close) {
            return Ok(elements);
        }
        loop {
            let ty = self.parse_type(false)?;
            let name = self.ident().map(str::to_string);
            elements.push(Element { ty, name });
            if self.eat(",") {
                continue;
            }
            if self.eat(close) {
                return Ok(elements);
            }
            return Err(self.error("`,` or end of list"));
        }
    }
}
