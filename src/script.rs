// File: src/script.rs
//
// Script and Handler containers. A Script owns the command and function
// handlers of one object; it is built up by appending handlers and
// instructions, then frozen and shared by reference count. Comparisons on
// handler names are case-insensitive, matching HyperCard-style handler
// dispatch.

use crate::instruction::Instruction;
use std::sync::Arc;

/// Handler names are stored verbatim but truncated to this many bytes, as
/// the fixed-width source contract requires.
pub const MAX_HANDLER_NAME_BYTES: usize = 256;

fn truncate_handler_name(name: &str) -> String {
    if name.len() <= MAX_HANDLER_NAME_BYTES {
        return name.to_string();
    }
    let mut end = MAX_HANDLER_NAME_BYTES;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Which of a script's two handler tables a `HandlerRef` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Command,
    Function,
}

/// A stable handle to a handler within a script: kind plus index, not a
/// pointer. `ScriptBuilder::add_command_handler_named` and friends may
/// reallocate their backing `Vec` on append, which would invalidate an
/// interior pointer; an index survives that reallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRef {
    pub kind: HandlerKind,
    pub index: usize,
}

/// A named sequence of instructions: either a command (no return value) or a
/// function, per the object model this crate doesn't otherwise model.
#[derive(Debug, Clone)]
pub struct Handler {
    name: String,
    instructions: Vec<Instruction>,
}

impl Handler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
}

/// Builder-side handler: same shape as `Handler`, but still growable.
struct HandlerBuilder {
    name: String,
    instructions: Vec<Instruction>,
}

impl HandlerBuilder {
    fn freeze(self) -> Handler {
        Handler { name: self.name, instructions: self.instructions }
    }
}

/// The set of handlers owned by one object, reference-counted and immutable
/// after build. The `(owner_id, owner_seed)` pair is a deletion-safe handle:
/// a seed mismatch on resolution means the owner slot was reused for a
/// different object, so a running handler can detect that its owner has been
/// destroyed without dereferencing a dangling pointer.
#[derive(Debug)]
pub struct Script {
    owner_id: u64,
    owner_seed: u64,
    commands: Vec<Handler>,
    functions: Vec<Handler>,
    /// Literal strings referenced by `PushStringFromTable`/
    /// `AssignStringFromTable`. Out-of-range indices resolve to "". `Arc<str>`
    /// so a `StringConstant` slot can clone the reference rather than copy
    /// the bytes.
    pub literal_strings: Vec<Arc<str>>,
}

impl Script {
    pub fn owner_handle(&self) -> (u64, u64) {
        (self.owner_id, self.owner_seed)
    }

    /// Whether `current_seed` still matches this script's owner slot. A
    /// mismatch is the `DanglingOwner` condition: the owner identifier was
    /// reused for a different object since this script was built.
    pub fn owner_matches(&self, current_seed: u64) -> bool {
        self.owner_seed == current_seed
    }

    pub fn handler(&self, handler_ref: HandlerRef) -> &Handler {
        match handler_ref.kind {
            HandlerKind::Command => &self.commands[handler_ref.index],
            HandlerKind::Function => &self.functions[handler_ref.index],
        }
    }

    /// Case-insensitive linear search, as the source's fixed-width name
    /// buffers require (no hash index — names are compared byte-by-byte
    /// under ASCII case folding).
    pub fn find_command_handler_named(&self, name: &str) -> Option<HandlerRef> {
        find_named(&self.commands, name).map(|index| HandlerRef { kind: HandlerKind::Command, index })
    }

    pub fn find_function_handler_named(&self, name: &str) -> Option<HandlerRef> {
        find_named(&self.functions, name).map(|index| HandlerRef { kind: HandlerKind::Function, index })
    }

    /// Clones the `Arc<str>` at `index` (a refcount bump, not a byte copy).
    /// Out-of-range indices yield an empty `Arc<str>`.
    pub fn literal_string(&self, index: usize) -> Arc<str> {
        self.literal_strings.get(index).cloned().unwrap_or_else(|| Arc::from(""))
    }
}

fn find_named(handlers: &[Handler], name: &str) -> Option<usize> {
    let truncated = truncate_handler_name(name);
    handlers.iter().position(|h| h.name.eq_ignore_ascii_case(&truncated))
}

/// Accumulates handlers and instructions for one script. Appending a handler
/// may reallocate the handler array and appending an instruction may
/// reallocate the instruction array — either invalidates any interior
/// pointer taken before the append, which is why handles here are indices,
/// never references. Build the whole script before handing it to a
/// `Context`; `build()` freezes it immutably.
pub struct ScriptBuilder {
    owner_id: u64,
    owner_seed: u64,
    commands: Vec<HandlerBuilder>,
    functions: Vec<HandlerBuilder>,
    literal_strings: Vec<Arc<str>>,
}

impl ScriptBuilder {
    pub fn new(owner_id: u64, owner_seed: u64) -> Self {
        ScriptBuilder {
            owner_id,
            owner_seed,
            commands: Vec::new(),
            functions: Vec::new(),
            literal_strings: Vec::new(),
        }
    }

    pub fn add_command_handler_named(&mut self, name: &str) -> HandlerRef {
        self.commands.push(HandlerBuilder { name: truncate_handler_name(name), instructions: Vec::new() });
        HandlerRef { kind: HandlerKind::Command, index: self.commands.len() - 1 }
    }

    pub fn add_function_handler_named(&mut self, name: &str) -> HandlerRef {
        self.functions.push(HandlerBuilder { name: truncate_handler_name(name), instructions: Vec::new() });
        HandlerRef { kind: HandlerKind::Function, index: self.functions.len() - 1 }
    }

    /// Appends an instruction to the named handler and returns its index.
    pub fn append_instruction(&mut self, handler_ref: HandlerRef, instr: Instruction) -> usize {
        let instructions = match handler_ref.kind {
            HandlerKind::Command => &mut self.commands[handler_ref.index].instructions,
            HandlerKind::Function => &mut self.functions[handler_ref.index].instructions,
        };
        instructions.push(instr);
        instructions.len() - 1
    }

    /// Adds a literal string and returns its table index for
    /// `PushStringFromTable`/`AssignStringFromTable` operands.
    pub fn add_literal_string(&mut self, s: impl Into<String>) -> u32 {
        self.literal_strings.push(Arc::from(s.into()));
        (self.literal_strings.len() - 1) as u32
    }

    pub fn build(self) -> Arc<Script> {
        Arc::new(Script {
            owner_id: self.owner_id,
            owner_seed: self.owner_seed,
            commands: self.commands.into_iter().map(HandlerBuilder::freeze).collect(),
            functions: self.functions.into_iter().map(HandlerBuilder::freeze).collect(),
            literal_strings: self.literal_strings,
        })
    }
}

/// `script_create(owner_id, owner_seed)` — returns a refcount-1 builder.
pub fn script_create(owner_id: u64, owner_seed: u64) -> ScriptBuilder {
    ScriptBuilder::new(owner_id, owner_seed)
}

/// `script_retain` — `Arc::clone` is the retain: it bumps the strong count
/// rather than copying the script.
pub fn script_retain(script: &Arc<Script>) -> Arc<Script> {
    Arc::clone(script)
}

/// `script_release` — dropping the `Arc` is the release; when the strong
/// count reaches zero, every handler's instruction array is freed as part of
/// ordinary Rust drop glue.
pub fn script_release(script: Arc<Script>) {
    drop(script);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;

    #[test]
    fn handler_lookup_is_case_insensitive() {
        let mut builder = script_create(1, 1);
        builder.add_command_handler_named("MouseUp");
        let script = builder.build();
        assert!(script.find_command_handler_named("mouseup").is_some());
        assert!(script.find_command_handler_named("MOUSEUP").is_some());
        assert!(script.find_command_handler_named("mouseDown").is_none());
    }

    #[test]
    fn handler_refs_survive_array_growth() {
        let mut builder = script_create(1, 1);
        let first = builder.add_command_handler_named("a");
        for i in 0..64 {
            builder.add_command_handler_named(&format!("filler{}", i));
        }
        builder.append_instruction(first, Instruction::new(2, 0, 0));
        let script = builder.build();
        assert_eq!(script.handler(first).name(), "a");
        assert_eq!(script.handler(first).instructions().len(), 1);
    }

    #[test]
    fn owner_seed_mismatch_is_detectable() {
        let builder = script_create(42, 7);
        let script = builder.build();
        assert!(script.owner_matches(7));
        assert!(!script.owner_matches(8));
    }

    #[test]
    fn refcounting_frees_on_last_release() {
        let builder = script_create(1, 1);
        let script = builder.build();
        let retained = script_retain(&script);
        assert_eq!(Arc::strong_count(&script), 2);
        script_release(retained);
        assert_eq!(Arc::strong_count(&script), 1);
    }

    #[test]
    fn out_of_range_literal_string_is_empty() {
        let builder = script_create(1, 1);
        let script = builder.build();
        assert_eq!(&*script.literal_string(5), "");
    }
}
