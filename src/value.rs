// File: src/value.rs
//
// Runtime value types for the Leonie execution core.
// A tagged variant with coerce-on-read / coerce-on-write operations, matching
// the weakly-typed surface the bytecode expects.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts live heap-owned strings. Used by tests to verify that every
/// constructed owning string is eventually dropped (no leaked allocations).
static LIVE_OWNED_STRINGS: AtomicUsize = AtomicUsize::new(0);

/// Returns the number of currently-live owning string allocations.
///
/// Exposed for leak tests; a balanced program should return this to the same
/// count it started with once its context is cleaned up.
pub fn live_owned_string_count() -> usize {
    LIVE_OWNED_STRINGS.load(Ordering::SeqCst)
}

/// An owning string buffer whose construction/drop is counted.
///
/// `Value::String` (a slot that owns its buffer) uses this; `Value::StringConstant`
/// (a slot that merely references a literal already owned by the script) does not,
/// since it never allocates on construction.
#[derive(Debug)]
struct OwnedString(Arc<str>);

impl OwnedString {
    fn new(s: &str) -> Self {
        LIVE_OWNED_STRINGS.fetch_add(1, Ordering::SeqCst);
        OwnedString(Arc::from(s))
    }
}

impl Clone for OwnedString {
    fn clone(&self) -> Self {
        LIVE_OWNED_STRINGS.fetch_add(1, Ordering::SeqCst);
        OwnedString(Arc::clone(&self.0))
    }
}

impl Drop for OwnedString {
    fn drop(&mut self) {
        LIVE_OWNED_STRINGS.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::ops::Deref for OwnedString {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

/// A back-reference to another stack slot.
///
/// Leonie's full object model lets one value weakly reference another (so
/// assigning through the referent updates the original). The reference table
/// that tracks and invalidates these lives with the context group and is an
/// external collaborator this crate does not model; `Reference` only carries
/// enough information to round-trip through a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub target_slot: usize,
}

/// Whether constructing or assigning a value should notify outstanding
/// references to the slot's previous occupant that their target is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationPolicy {
    /// Tell outstanding weak references into this slot that the target is gone.
    InvalidateReferences,
    /// Leave any outstanding references alone (the caller already knows the
    /// previous occupant is still valid, e.g. re-reading the same value type).
    Preserve,
}

/// A dynamically-typed Leonie value.
///
/// Every variant is cheap to move (no field needs an explicit destructor walk
/// beyond the `Arc` decrement `Drop` already performs), so a slot assignment
/// (`*slot = Value::Number(..)`) destructs the previous occupant for free via
/// ordinary Rust drop glue.
#[derive(Debug, Clone)]
pub enum Value {
    /// The "nothing here yet" value; reads as 0 / false / "".
    Empty,
    Boolean(bool),
    /// IEEE-754 double, the default numeric representation.
    Number(f64),
    /// A narrower integral representation some opcodes prefer.
    Integer(i64),
    /// A reference into the owning script's literal-string table. Never
    /// allocates on construction or assignment — the bytes are owned by the
    /// script, not the slot.
    StringConstant(Arc<str>),
    /// A string this slot owns outright (the result of formatting,
    /// concatenation, or `set_as_string`).
    String(OwnedStringHandle),
    /// A weak back-reference to another slot.
    Reference(Reference),
}

/// Public handle wrapping the leak-tracked owned string so the counting
/// machinery stays private to this module.
#[derive(Debug, Clone)]
pub struct OwnedStringHandle(OwnedString);

impl OwnedStringHandle {
    fn new(s: &str) -> Self {
        OwnedStringHandle(OwnedString::new(s))
    }
}

impl std::ops::Deref for OwnedStringHandle {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Empty
    }
}

impl Value {
    /// `init_empty(slot, policy, ctx)`.
    pub fn init_empty(policy: InvalidationPolicy) -> Self {
        let _ = policy;
        Value::Empty
    }

    /// `init_number(slot, f64, policy, ctx)`.
    pub fn init_number(n: f64, policy: InvalidationPolicy) -> Self {
        let _ = policy;
        Value::Number(n)
    }

    /// `init_boolean(slot, bool, policy, ctx)`.
    pub fn init_boolean(b: bool, policy: InvalidationPolicy) -> Self {
        let _ = policy;
        Value::Boolean(b)
    }

    /// `init_string_constant(slot, &str, policy, ctx)`.
    pub fn init_string_constant(s: Arc<str>, policy: InvalidationPolicy) -> Self {
        let _ = policy;
        Value::StringConstant(s)
    }

    /// Builds an owning string value (what `set_as_string` produces).
    pub fn owned_string(s: &str) -> Self {
        Value::String(OwnedStringHandle::new(s))
    }

    /// `get_as_number(slot, ctx) -> f64`.
    ///
    /// Empty reads as 0, booleans as 0/1, numbers and integers pass through,
    /// strings parse as a double. Fails with a message describing why on a
    /// non-numeric string or a reference.
    pub fn get_as_number(&self) -> Result<f64, String> {
        match self {
            Value::Empty => Ok(0.0),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => Ok(*n),
            Value::Integer(n) => Ok(*n as f64),
            Value::StringConstant(s) => parse_number(s),
            Value::String(s) => parse_number(s),
            Value::Reference(r) => {
                Err(format!("can't make a number from a reference to slot {}", r.target_slot))
            }
        }
    }

    /// `get_as_boolean(slot, ctx) -> bool`.
    ///
    /// Case-insensitive "true"/"false" for strings, zero-test for numbers.
    pub fn get_as_boolean(&self) -> Result<bool, String> {
        match self {
            Value::Empty => Ok(false),
            Value::Boolean(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Integer(n) => Ok(*n != 0),
            Value::StringConstant(s) => parse_boolean(s),
            Value::String(s) => parse_boolean(s),
            Value::Reference(r) => {
                Err(format!("can't make a boolean from a reference to slot {}", r.target_slot))
            }
        }
    }

    /// `get_as_string(slot, buf, len, ctx)`.
    ///
    /// Always succeeds; the result is truncated to `max_bytes`, preserving
    /// the source's 1024-byte `Print` truncation as an observable contract.
    pub fn get_as_string(&self, max_bytes: usize) -> String {
        let full = match self {
            Value::Empty => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Integer(n) => n.to_string(),
            Value::StringConstant(s) => s.to_string(),
            Value::String(s) => s.to_string(),
            Value::Reference(r) => format!("<reference to slot {}>", r.target_slot),
        };
        truncate_to_bytes(&full, max_bytes)
    }

    /// `set_as_string(slot, &str, ctx)` — replaces the slot's content with an
    /// owned copy, preserving the slot's identity (any reference still
    /// targets this slot index, only the payload changed).
    pub fn set_as_string(&mut self, s: &str) {
        *self = Value::owned_string(s);
    }

    /// `set_as_number(slot, f64, ctx)`.
    pub fn set_as_number(&mut self, n: f64) {
        *self = Value::Number(n);
    }

    /// `cleanup(slot)` — the explicit destructor. Dropping the previous
    /// content and replacing it with `Empty` is what ordinary assignment to
    /// `Value::Empty` already does via Rust's drop glue; this method exists
    /// so call sites can name the operation the way the source contract does.
    pub fn cleanup(&mut self) {
        *self = Value::Empty;
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }
}

fn parse_number(s: &str) -> Result<f64, String> {
    let trimmed = s.trim();
    trimmed.parse::<f64>().map_err(|_| format!("can't make a number from \"{}\"", s))
}

fn parse_boolean(s: &str) -> Result<bool, String> {
    if s.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if s.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(format!("can't make a boolean from \"{}\"", s))
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn truncate_to_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_as_string(usize::MAX))
    }
}
