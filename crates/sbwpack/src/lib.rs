//! # Sbwpack
//!
//! The DataBlock wire format: a small, strictly typed, stream-oriented binary encoding.
//!
//! ## Philosophy
//!
//! - **Sequential**: Writers are built by appending items and readers consume them in the
//!   same order. There is no random access and no schema embedded in the stream.
//! - **Tagged**: Every item starts with a one-byte `Tag`. A reader asking for an integer
//!   where a string was written gets `Error::TypeMismatch`, never a reinterpretation.
//! - **Bounded**: Encoders track open scopes explicitly. Decoders are zero-copy,
//!   bounds-checked views that never panic on malformed input.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Strings**: `[Tag: 1b][Len: 4b][UTF-8: Len]`
//! - **Lists**: `[Tag: 1b][Count: 4b][Item]*Count`
//! - **Arrays**: `[Tag: 1b][Element: 1b][Rank: 4b][Size: 4b]*Rank [Item]*Product(Sizes)`
//!
//! All numbers are Big-Endian (network order).


/// The maximum nesting depth a decoder will follow before giving up.
pub const MAX_DEPTH: usize = 64;

/// Sbwpack serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`.
    InvalidTag(u8),
    /// The next item on the wire is not the kind the reader asked for.
    TypeMismatch { expected: Tag, found: Tag },
    /// A String item holds bytes that are not UTF-8.
    InvalidUtf8,
    /// The block ended in the middle of an item.
    UnexpectedEnd,
    /// Blob, count or shape exceeds `u32::MAX`.
    BlobTooLarge(usize),
    /// Closing a scope that does not match the active scope.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// `list_end` or `array_end` with nothing open.
    ScopeUnderflow,
    /// The block was finished with a container still open.
    ScopeStillOpen,
    /// An array item does not carry the array's element tag.
    ElementMismatch { expected: Tag, found: Tag },
    /// An array received more or fewer items than its shape allows.
    ShapeMismatch { expected: usize, found: usize },
    /// Arrays may not directly contain arrays; use a higher rank instead.
    NestedArray,
    /// Arrays must have at least one dimension.
    InvalidRank,
    /// The nesting depth exceeded `MAX_DEPTH`.
    RecursionLimitExceeded,
    /// A decoder expected to be exhausted still holds bytes.
    TrailingBytes(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::TypeMismatch { expected, found } => {
                write!(f, "encountered {} required {}", found.name(), expected.name())
            }
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::ElementMismatch { expected, found } => {
                write!(f, "array of {} cannot hold {}", expected.name(), found.name())
            }
            Error::ShapeMismatch { expected, found } => {
                write!(f, "array shape holds {} items, found {}", expected, found)
            }
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after last item", n),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for sbwpack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the type of an encoded item.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Byte = 0,
    Integer = 1,
    Double = 2,
    Boolean = 3,
    String = 4,
    Array = 5,
    List = 6,
    Void = 7,
    Complex = 8,
}

impl Tag {
    /// Returns the Tag for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Tag::Byte),
            1 => Some(Tag::Integer),
            2 => Some(Tag::Double),
            3 => Some(Tag::Boolean),
            4 => Some(Tag::String),
            5 => Some(Tag::Array),
            6 => Some(Tag::List),
            7 => Some(Tag::Void),
            8 => Some(Tag::Complex),
            _ => None,
        }
    }

    /// Human-readable name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Tag::Byte => "byte",
            Tag::Integer => "integer",
            Tag::Double => "double",
            Tag::Boolean => "boolean",
            Tag::String => "string",
            Tag::Array => "array",
            Tag::List => "list",
            Tag::Void => "void",
            Tag::Complex => "complex",
        }
    }
}

/// Kind of container the encoder is currently filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Top level of the block; any item may follow.
    Root,
    /// Ordered sequence; allows any number of items of any kind.
    List,
    /// Homogeneous block; allows exactly `product(shape)` items of the element tag.
    Array,
}

/// One open container and what it still expects.
struct Frame {
    /// Offset of the count placeholder for lists.
    patch: usize,
    scope: Scope,
    count: usize,
    element: Option<Tag>,
    expected: usize,
}

impl Frame {
    fn root() -> Self {
        Self { patch: 0, scope: Scope::Root, count: 0, element: None, expected: 0 }
    }
}

/// A state-machine driven DataBlock writer.
///
/// The Encoder keeps a stack of open scopes and back-patches list counts when a list
/// is closed.
///
/// # Structural Invariants
///
/// 1.  **Array Scopes**: Every item must carry the declared element tag, and exactly
///     `product(shape)` items must be written before `array_end()`.
/// 2.  **Closing**: Scopes are closed in LIFO order with the matching `*_end` call.
/// 3.  **Root Scope**: The encoder must be back at the Root scope to finalize bytes.
pub struct Encoder {
    buf: Vec<u8>,
    /// Never empty: the root frame stays at the bottom.
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates a new, empty encoder.
    pub fn new() -> Self {
        let mut enc = Self {
            buf: Vec::with_capacity(256),
            stack: Vec::with_capacity(8),
        };
        enc.stack.push(Frame::root());
        enc
    }

    /// Finishes the block. Fails while a list or array is still open.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if a list or array is still open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    /// The bytes written so far, once every scope is closed.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if a list or array is still open.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(&self.buf)
    }

    fn current_frame(&mut self) -> &mut Frame {
        let top = self.stack.len() - 1;
        &mut self.stack[top]
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.current_frame();
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Array => {
                if let Some(expected) = frame.element {
                    if expected != tag {
                        return Err(Error::ElementMismatch { expected, found: tag });
                    }
                }
                if frame.count >= frame.expected {
                    return Err(Error::ShapeMismatch {
                        expected: frame.expected,
                        found: frame.count + 1,
                    });
                }
                Ok(())
            }
        }
    }

    fn on_item_written(&mut self) {
        self.current_frame().count += 1;
    }

    fn write_tag(&mut self, tag: Tag) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        Ok(())
    }

    fn write_u32_raw(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn close_scope(&mut self, expected: Scope) -> Result<Frame> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }
        let frame = self.current_frame();
        if frame.scope != expected {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if frame.scope == Scope::Array && frame.count != frame.expected {
            return Err(Error::ShapeMismatch { expected: frame.expected, found: frame.count });
        }
        let top = self.stack.len() - 1;
        Ok(self.stack.remove(top))
    }

    /// Encodes a single byte.
    pub fn byte(&mut self, v: u8) -> Result<()> { self.write_tag(Tag::Byte)?; self.buf.push(v); self.on_item_written(); Ok(()) }
    /// Encodes a signed 32-bit integer (BE).
    pub fn integer(&mut self, v: i32) -> Result<()> { self.write_tag(Tag::Integer)?; self.buf.extend_from_slice(&v.to_be_bytes()); self.on_item_written(); Ok(()) }
    /// Encodes a 64-bit float (BE).
    pub fn double(&mut self, v: f64) -> Result<()> { self.write_tag(Tag::Double)?; self.buf.extend_from_slice(&v.to_be_bytes()); self.on_item_written(); Ok(()) }
    /// Encodes a boolean as a single byte.
    pub fn boolean(&mut self, v: bool) -> Result<()> { self.write_tag(Tag::Boolean)?; self.buf.push(v as u8); self.on_item_written(); Ok(()) }
    /// Encodes the absence of a value.
    pub fn void(&mut self) -> Result<()> { self.write_tag(Tag::Void)?; self.on_item_written(); Ok(()) }

    /// Encodes a complex number as two doubles (real, imaginary).
    pub fn complex(&mut self, re: f64, im: f64) -> Result<()> {
        self.write_tag(Tag::Complex)?;
        self.buf.extend_from_slice(&re.to_be_bytes());
        self.buf.extend_from_slice(&im.to_be_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes a length-prefixed UTF-8 string.
    pub fn str(&mut self, v: &str) -> Result<()> {
        let len = u32::try_from(v.len()).map_err(|_| Error::BlobTooLarge(v.len()))?;
        self.write_tag(Tag::String)?;
        self.write_u32_raw(len);
        self.buf.extend_from_slice(v.as_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Begins a List.
    ///
    /// # Invariants
    /// - Must be closed via `list_end()`.
    /// - Allows any number of items of any kind.
    pub fn list_begin(&mut self) -> Result<()> {
        self.write_tag(Tag::List)?;
        let patch = self.buf.len();
        self.write_u32_raw(0); // Count placeholder
        self.stack.push(Frame { patch, scope: Scope::List, count: 0, element: None, expected: 0 });
        Ok(())
    }

    /// Ends a List, patching its item count.
    pub fn list_end(&mut self) -> Result<()> {
        let frame = self.close_scope(Scope::List)?;
        let count = u32::try_from(frame.count).map_err(|_| Error::BlobTooLarge(frame.count))?;
        self.buf[frame.patch..frame.patch + 4].copy_from_slice(&count.to_be_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Begins an Array of `element` items with the given `shape` (one size per dimension).
    ///
    /// # Invariants
    /// - Must be closed via `array_end()` after exactly `product(shape)` items.
    /// - **Strict:** every item must carry the `element` tag.
    pub fn array_begin(&mut self, element: Tag, shape: &[u32]) -> Result<()> {
        if element == Tag::Array {
            return Err(Error::NestedArray);
        }
        if shape.is_empty() {
            return Err(Error::InvalidRank);
        }
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n as usize))
            .ok_or(Error::BlobTooLarge(usize::MAX))?;
        let rank = u32::try_from(shape.len()).map_err(|_| Error::BlobTooLarge(shape.len()))?;

        self.write_tag(Tag::Array)?;
        self.buf.push(element as u8);
        self.write_u32_raw(rank);
        for &size in shape {
            self.write_u32_raw(size);
        }
        self.stack.push(Frame { patch: 0, scope: Scope::Array, count: 0, element: Some(element), expected });
        Ok(())
    }

    /// Ends an Array.
    pub fn array_end(&mut self) -> Result<()> {
        self.close_scope(Scope::Array)?;
        self.on_item_written();
        Ok(())
    }

    /// Appends one already-encoded item verbatim.
    ///
    /// `encoded` must hold exactly one well-formed item; it is validated before being copied.
    pub fn item(&mut self, encoded: &[u8]) -> Result<()> {
        let mut probe = Decoder::new(encoded);
        let tag = probe.peek_tag()?;
        probe.skip()?;
        probe.finish()?;
        self.check_write(tag)?;
        self.buf.extend_from_slice(encoded);
        self.on_item_written();
        Ok(())
    }
}

/// Reads items out of a borrowed DataBlock without copying.
///
/// Reading advances the internal cursor. Container reads return iterators whose
/// items are new `Decoder` instances restricted to exactly one item.
///
/// # Errors
/// All read operations return `Error::UnexpectedEnd` if the buffer is exhausted and
/// `Error::TypeMismatch` if the next item is not of the requested kind.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Returns true once every item has been consumed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fails with `Error::TrailingBytes` unless the view is exhausted.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() { Ok(()) } else { Err(Error::TrailingBytes(self.buf.len())) }
    }

    /// The tag of the next item, left unconsumed.
    pub fn peek_tag(&self) -> Result<Tag> {
        let b = *self.buf.first().ok_or(Error::UnexpectedEnd)?;
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.buf.len() { return Err(Error::UnexpectedEnd); }
        self.buf = &self.buf[n..];
        Ok(())
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() { return Err(Error::UnexpectedEnd); }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> { Ok(self.read_array::<1>()?[0]) }
    fn read_u32(&mut self) -> Result<u32> { Ok(u32::from_be_bytes(self.read_array()?)) }
    fn read_f64(&mut self) -> Result<f64> { Ok(f64::from_be_bytes(self.read_array()?)) }

    fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(Error::TypeMismatch { expected, found });
        }
        self.consume(1)
    }

    fn read_shape(&mut self) -> Result<(Vec<u32>, usize)> {
        let rank = self.read_u32()? as usize;
        if rank == 0 {
            return Err(Error::InvalidRank);
        }
        // Every size takes four bytes, so a rank larger than the view is malformed.
        if rank > self.buf.len() / 4 {
            return Err(Error::UnexpectedEnd);
        }
        let mut shape = Vec::with_capacity(rank);
        let mut total = 1usize;
        for _ in 0..rank {
            let size = self.read_u32()?;
            total = total.checked_mul(size as usize).ok_or(Error::BlobTooLarge(usize::MAX))?;
            shape.push(size);
        }
        Ok((shape, total))
    }

    fn read_element(&mut self) -> Result<Tag> {
        let b = self.read_u8()?;
        match Tag::from_u8(b) {
            Some(Tag::Array) => Err(Error::NestedArray),
            Some(tag) => Ok(tag),
            None => Err(Error::InvalidTag(b)),
        }
    }

    /// Steps over the next item, nested contents included.
    pub fn skip(&mut self) -> Result<()> {
        self.skip_depth(0)
    }

    fn skip_depth(&mut self, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(Error::RecursionLimitExceeded);
        }
        let tag = self.peek_tag()?;
        self.consume(1)?;

        match tag {
            Tag::Void => {},
            Tag::Byte | Tag::Boolean => self.consume(1)?,
            Tag::Integer => self.consume(4)?,
            Tag::Double => self.consume(8)?,
            Tag::Complex => self.consume(16)?,
            Tag::String => {
                let len = self.read_u32()? as usize;
                self.consume(len)?;
            }
            Tag::List => {
                let count = self.read_u32()?;
                for _ in 0..count {
                    self.skip_depth(depth + 1)?;
                }
            }
            Tag::Array => {
                let element = self.read_element()?;
                let (_, total) = self.read_shape()?;
                for _ in 0..total {
                    let found = self.peek_tag()?;
                    if found != element {
                        return Err(Error::ElementMismatch { expected: element, found });
                    }
                    self.skip_depth(depth + 1)?;
                }
            }
        }
        Ok(())
    }

    /// Returns the raw bytes of the next item (tag included) and advances past it.
    pub fn item(&mut self) -> Result<&'a [u8]> {
        let mut probe = self.clone();
        probe.skip()?;
        let len = self.buf.len() - probe.remaining();
        self.read_bytes(len)
    }

    fn item_of(&mut self, expected: Tag) -> Result<&'a [u8]> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(Error::TypeMismatch { expected, found });
        }
        self.item()
    }

    /// Decodes a byte.
    pub fn byte(&mut self) -> Result<u8> { self.expect_tag(Tag::Byte)?; self.read_u8() }
    /// Decodes a signed 32-bit integer (BE).
    pub fn integer(&mut self) -> Result<i32> { self.expect_tag(Tag::Integer)?; Ok(i32::from_be_bytes(self.read_array()?)) }
    /// Decodes a 64-bit float (BE).
    pub fn double(&mut self) -> Result<f64> { self.expect_tag(Tag::Double)?; self.read_f64() }
    /// Decodes a boolean. Any non-zero byte reads as `true`.
    pub fn boolean(&mut self) -> Result<bool> { self.expect_tag(Tag::Boolean)?; Ok(self.read_u8()? != 0) }
    /// Decodes the absence of a value.
    pub fn void(&mut self) -> Result<()> { self.expect_tag(Tag::Void) }

    /// Decodes a complex number as `(real, imaginary)`.
    pub fn complex(&mut self) -> Result<(f64, f64)> {
        self.expect_tag(Tag::Complex)?;
        let re = self.read_f64()?;
        let im = self.read_f64()?;
        Ok((re, im))
    }

    /// Reads a String item as borrowed UTF-8.
    pub fn str(&mut self) -> Result<&'a str> {
        self.expect_tag(Tag::String)?;
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a List into an iterator over its items.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        let mut body = Decoder::new(self.item_of(Tag::List)?);
        body.consume(1)?;
        let count = body.read_u32()? as usize;
        Ok(ListIter { dec: body, remaining: count })
    }

    /// Decodes an Array into its element tag, shape, and an iterator over its items.
    pub fn array(&mut self) -> Result<ArrayIter<'a>> {
        let mut body = Decoder::new(self.item_of(Tag::Array)?);
        body.consume(1)?;
        let element = body.read_element()?;
        let (shape, total) = body.read_shape()?;
        Ok(ArrayIter { element, shape, dec: body, remaining: total })
    }
}

/// Walks the items of one List, each through its own sub-decoder.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
    remaining: usize,
}

impl<'a> ListIter<'a> {
    /// Number of items not yet returned.
    pub fn len(&self) -> usize {
        self.remaining
    }

    /// Returns true when no items are left.
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Returns a Decoder for the next item, or `None` once the list is exhausted.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(Decoder::new(self.dec.item()?)))
    }
}

/// Iterator for items within an Array, in row-major order.
#[derive(Debug)]
pub struct ArrayIter<'a> {
    element: Tag,
    shape: Vec<u32>,
    dec: Decoder<'a>,
    remaining: usize,
}

impl<'a> ArrayIter<'a> {
    /// The tag every item carries.
    pub fn element(&self) -> Tag {
        self.element
    }

    /// One size per dimension.
    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    /// Number of items not yet returned.
    pub fn len(&self) -> usize {
        self.remaining
    }

    /// Returns true when no items are left.
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Returns a Decoder for the next item, or `None` once the array is exhausted.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(Decoder::new(self.dec.item()?)))
    }
}
