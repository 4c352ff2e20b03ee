// File: src/context.rs
//
// Per-thread execution state: the value stack, the call stack, the program
// counter, the error slot, and the optional hook points. A `Context` is
// privately owned by exactly one thread for the duration of any `step`/`run`;
// scripts it executes may be shared with other threads via `Arc`.

use crate::error::{VmError, VmErrorKind};
use crate::instruction::{Instruction, BACK_OF_STACK};
use crate::script::{HandlerRef, Script};
use crate::value::Value;
use std::sync::Arc;

/// Default capacity of a context's value stack.
pub const DEFAULT_STACK_CAPACITY: usize = 1024;
/// Default truncation length for `Print` and `ctx.error_message()`.
pub const DEFAULT_ERR_BUFFER_LEN: usize = 1024;
/// Default item delimiter used by chunk expressions in value coercions.
pub const DEFAULT_ITEM_DELIMITER: char = ',';

/// Tunable limits for a `Context`, taking the place of the source's
/// compile-time constants so embedders can adjust them without recompiling.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    pub stack_capacity: usize,
    pub item_delimiter: char,
    pub err_buffer_len: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            stack_capacity: DEFAULT_STACK_CAPACITY,
            item_delimiter: DEFAULT_ITEM_DELIMITER,
            err_buffer_len: DEFAULT_ERR_BUFFER_LEN,
        }
    }
}

/// Shared structures a group of contexts running the same scripts would hold
/// in common (reference tables, literal pools shared across contexts). The
/// execution core treats this as an opaque external collaborator; a context
/// simply retains its group for the duration of its lifetime.
#[derive(Debug, Default)]
pub struct ContextGroup;

impl ContextGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(ContextGroup)
    }
}

/// A suspended call frame: everything needed to resume the caller once the
/// handler that was active when this entry was pushed returns. The owning
/// `script` reference keeps that caller's instruction memory alive for as
/// long as this entry sits on the call stack, even if every other owner of
/// the script releases it in the meantime.
struct CallStackEntry {
    script: Arc<Script>,
    handler: HandlerRef,
    return_address: usize,
    old_base_pointer: usize,
}

/// Invoked before each opcode's function is dispatched. Must not advance the
/// program counter — it is explicitly not an opcode.
pub type PreInstructionHook = Box<dyn FnMut(&mut Context) + Send>;
/// Invoked by an opcode (or embedder) that needs to solicit input; not
/// exercised by the core's sixteen opcodes, but part of the contract host
/// extensions may rely on.
pub type PromptHook = Box<dyn FnMut(&mut Context) -> String + Send>;

/// Per-thread execution state: value stack, call stack, program counter,
/// error slot, and hook points.
pub struct Context {
    stack: Vec<Value>,
    capacity: usize,
    stack_base: usize,
    stack_end: usize,

    call_stack: Vec<CallStackEntry>,
    current_script: Option<Arc<Script>>,
    current_handler: Option<HandlerRef>,
    pc: usize,

    err: Option<VmError>,
    keep_running: bool,
    item_delimiter: char,
    err_buffer_len: usize,
    step_counter: u64,

    pre_instruction_hook: Option<PreInstructionHook>,
    prompt_hook: Option<PromptHook>,

    #[allow(dead_code)] // retained for lifetime parity with the source's group handle; no shared state yet lives here
    group: Arc<ContextGroup>,
}

impl Context {
    /// `init_context(ctx, group)` — zeroes all fields, sets
    /// `stack_base = stack_end = 0`, `keepRunning = true`, the default item
    /// delimiter, and retains the group.
    pub fn new(config: ContextConfig, group: Arc<ContextGroup>) -> Self {
        Context {
            stack: vec![Value::Empty; config.stack_capacity],
            capacity: config.stack_capacity,
            stack_base: 0,
            stack_end: 0,
            call_stack: Vec::new(),
            current_script: None,
            current_handler: None,
            pc: 0,
            err: None,
            keep_running: true,
            item_delimiter: config.item_delimiter,
            err_buffer_len: config.err_buffer_len,
            step_counter: 0,
            pre_instruction_hook: None,
            prompt_hook: None,
            group,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ContextConfig::default(), ContextGroup::new())
    }

    // -- stack accessors -----------------------------------------------

    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    pub fn stack_end(&self) -> usize {
        self.stack_end
    }

    pub fn stack_depth(&self) -> usize {
        self.stack_end - self.stack_base
    }

    pub fn item_delimiter(&self) -> char {
        self.item_delimiter
    }

    pub fn set_item_delimiter(&mut self, delimiter: char) {
        self.item_delimiter = delimiter;
    }

    pub fn step_counter(&self) -> u64 {
        self.step_counter
    }

    /// Pushes a constructed value; fails with `StackOverflow` rather than
    /// growing past the fixed capacity.
    pub fn push_checked(&mut self, value: Value) -> bool {
        if self.stack_end >= self.capacity {
            self.stop_with_error(VmErrorKind::StackOverflow, "value stack is full");
            return false;
        }
        self.stack[self.stack_end] = value;
        self.stack_end += 1;
        true
    }

    /// Destroys every value from `stack_end` downward until `stack_end ==
    /// target`, in LIFO order. Assigning `Value::Empty` into each vacated
    /// slot runs the previous occupant's drop glue, satisfying "destroying a
    /// slot must run before overwriting it" without any manual bookkeeping.
    pub fn cleanup_stack_to(&mut self, target: usize) {
        while self.stack_end > target {
            self.stack_end -= 1;
            self.stack[self.stack_end] = Value::Empty;
        }
    }

    pub fn stack_value(&self, slot: usize) -> &Value {
        &self.stack[slot]
    }

    pub fn stack_value_mut(&mut self, slot: usize) -> &mut Value {
        &mut self.stack[slot]
    }

    /// Resolves a `param1` operand under the addressing discipline: the
    /// `BACK_OF_STACK` sentinel addresses `stack_end - 1`; anything else
    /// addresses `stack_base + param1`. Fails with `StackUnderflow` if the
    /// resulting slot falls outside the current frame.
    pub fn addressed_slot(&mut self, param1: u16) -> Option<usize> {
        if param1 == BACK_OF_STACK {
            if self.stack_end <= self.stack_base {
                self.stop_with_error(VmErrorKind::StackUnderflow, "operand addresses an empty frame");
                return None;
            }
            Some(self.stack_end - 1)
        } else {
            let idx = self.stack_base + param1 as usize;
            if idx >= self.stack_end {
                self.stop_with_error(
                    VmErrorKind::StackUnderflow,
                    format!("slot {} is outside the current frame", param1),
                );
                return None;
            }
            Some(idx)
        }
    }

    // -- literal table ---------------------------------------------------

    /// Resolves a literal-string-table index against the currently
    /// executing script. Out-of-range indices tolerate the lookup and yield
    /// the empty string rather than faulting. Cloning the `Arc<str>` bumps a
    /// refcount; it never copies the underlying bytes.
    pub fn literal_string(&self, index: usize) -> Arc<str> {
        self.current_script.as_ref().map(|s| s.literal_string(index)).unwrap_or_else(|| Arc::from(""))
    }

    // -- call-stack discipline -------------------------------------------

    /// `push_frame(ctx, handler, script, ...)` — transfers control into
    /// `new_handler` of `new_script`. The caller's current script/handler,
    /// program counter, and base pointer are saved onto the call stack
    /// (retaining the caller's script for the duration of the call) before
    /// the new frame becomes active.
    pub fn push_frame(&mut self, new_script: Arc<Script>, new_handler: HandlerRef) {
        if let (Some(caller_script), Some(caller_handler)) =
            (self.current_script.take(), self.current_handler.take())
        {
            self.call_stack.push(CallStackEntry {
                script: caller_script,
                handler: caller_handler,
                return_address: self.pc,
                old_base_pointer: self.stack_base,
            });
        }
        self.current_script = Some(new_script);
        self.current_handler = Some(new_handler);
        self.pc = 0;
        self.stack_base = self.stack_end;
    }

    /// `pop_frame(ctx)` — releases the top entry's script and restores the
    /// caller it describes. Returns `false` if the call stack was already
    /// empty: the handler that just finished was the outermost one, and
    /// execution should terminate.
    pub fn pop_frame(&mut self) -> bool {
        match self.call_stack.pop() {
            Some(entry) => {
                self.current_script = Some(entry.script);
                self.current_handler = Some(entry.handler);
                self.pc = entry.return_address;
                self.stack_base = entry.old_base_pointer;
                true
            }
            None => {
                self.current_script = None;
                self.current_handler = None;
                false
            }
        }
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn has_active_frame(&self) -> bool {
        self.current_script.is_some()
    }

    pub fn current_script(&self) -> Option<&Arc<Script>> {
        self.current_script.as_ref()
    }

    pub fn current_handler(&self) -> Option<HandlerRef> {
        self.current_handler
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    pub fn advance_pc(&mut self) {
        self.pc += 1;
    }

    pub(crate) fn current_instruction(&self) -> Option<Instruction> {
        let script = self.current_script.as_ref()?;
        let handler_ref = self.current_handler?;
        script.handler(handler_ref).instructions().get(self.pc).copied()
    }

    pub(crate) fn current_instructions_len(&self) -> usize {
        match (&self.current_script, self.current_handler) {
            (Some(script), Some(handler_ref)) => script.handler(handler_ref).instructions().len(),
            _ => 0,
        }
    }

    /// Applies a relative displacement to the program counter, measured in
    /// whole instructions from the branching instruction itself. Traps with
    /// `JumpOutOfRange` rather than following a target outside the active
    /// handler's instruction array.
    pub fn relative_jump(&mut self, displacement: i32) {
        let len = self.current_instructions_len() as i64;
        let target = self.pc as i64 + displacement as i64;
        if target < 0 || target > len {
            self.stop_with_error(
                VmErrorKind::JumpOutOfRange,
                format!("relative jump target {} is outside the active handler ({} instructions)", target, len),
            );
            return;
        }
        self.pc = target as usize;
    }

    // -- error / lifecycle state ------------------------------------------

    pub fn keep_running(&self) -> bool {
        self.keep_running
    }

    /// `context_stop_with_error(ctx, fmt, ...)` — formats a message into
    /// `ctx.err` and clears `keepRunning`. No opcode recovers from this; the
    /// dispatcher observes the flag between instructions.
    pub fn stop_with_error(&mut self, kind: VmErrorKind, message: impl Into<String>) {
        self.err = Some(VmError::new(kind, message));
        self.keep_running = false;
    }

    pub fn stop(&mut self) {
        self.keep_running = false;
    }

    pub fn error(&self) -> Option<&VmError> {
        self.err.as_ref()
    }

    /// Renders the error slot the way the source's fixed 1024-byte error
    /// buffer would hold it: truncated to `err_buffer_len` bytes.
    pub fn error_message(&self) -> Option<String> {
        self.err.as_ref().map(|e| {
            let full = format!("{}", e);
            if full.len() <= self.err_buffer_len {
                full
            } else {
                let mut end = self.err_buffer_len;
                while end > 0 && !full.is_char_boundary(end) {
                    end -= 1;
                }
                full[..end].to_string()
            }
        })
    }

    // -- hooks --------------------------------------------------------------

    pub fn set_pre_instruction_hook(&mut self, hook: PreInstructionHook) {
        self.pre_instruction_hook = Some(hook);
    }

    pub fn clear_pre_instruction_hook(&mut self) {
        self.pre_instruction_hook = None;
    }

    pub fn set_prompt_hook(&mut self, hook: PromptHook) {
        self.prompt_hook = Some(hook);
    }

    pub fn prompt(&mut self) -> Option<String> {
        let mut hook = self.prompt_hook.take()?;
        let answer = hook(self);
        self.prompt_hook = Some(hook);
        Some(answer)
    }

    /// Invokes the pre-instruction hook, if installed, without letting it
    /// advance the program counter. The hook is temporarily taken out of
    /// `self` so it can be called with a mutable borrow of the context it
    /// inspects.
    pub(crate) fn run_pre_instruction_hook(&mut self) {
        if let Some(mut hook) = self.pre_instruction_hook.take() {
            let pc_before = self.pc;
            hook(self);
            self.pc = pc_before;
            self.pre_instruction_hook = Some(hook);
        }
    }

    pub(crate) fn bump_step_counter(&mut self) {
        self.step_counter += 1;
    }

    // -- lifecycle ------------------------------------------------------

    /// `prepare(ctx, instructions)` — points the context at the first
    /// instruction of `handler` in `script`, resets the base pointer to the
    /// current top of stack, clears any stale call-stack entries from a
    /// previous run, and sets `keepRunning = true`.
    pub fn prepare(&mut self, script: Arc<Script>, handler: HandlerRef) {
        self.call_stack.clear();
        self.current_script = Some(script);
        self.current_handler = Some(handler);
        self.pc = 0;
        self.stack_base = self.stack_end;
        self.keep_running = true;
        self.err = None;
    }

    /// `cleanup_context(ctx)` — destroys every value still on the stack in
    /// LIFO order, releases every entry remaining on the call stack, and
    /// drops the group handle. This is the only legal exit from a context;
    /// Rust's ordinary drop glue performs the same unwinding automatically
    /// when a `Context` simply goes out of scope, so calling this explicitly
    /// is for contexts an embedder wants to reuse.
    pub fn cleanup(&mut self) {
        self.cleanup_stack_to(0);
        self.call_stack.clear();
        self.current_script = None;
        self.current_handler = None;
        self.keep_running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::script_create;

    fn trivial_script() -> (Arc<Script>, HandlerRef) {
        let mut builder = script_create(1, 1);
        let handler = builder.add_command_handler_named("go");
        builder.append_instruction(handler, Instruction::new(1, 0, 0));
        (builder.build(), handler)
    }

    #[test]
    fn prepare_resets_base_pointer_to_current_top() {
        let mut ctx = Context::with_defaults();
        ctx.push_checked(Value::Number(1.0));
        let (script, handler) = trivial_script();
        ctx.prepare(script, handler);
        assert_eq!(ctx.stack_base(), 1);
        assert_eq!(ctx.stack_end(), 1);
    }

    #[test]
    fn addressed_slot_back_of_stack_targets_top() {
        let mut ctx = Context::with_defaults();
        ctx.push_checked(Value::Number(1.0));
        ctx.push_checked(Value::Number(2.0));
        let slot = ctx.addressed_slot(BACK_OF_STACK).unwrap();
        assert_eq!(slot, 1);
    }

    #[test]
    fn addressed_slot_underflow_stops_context() {
        let mut ctx = Context::with_defaults();
        assert!(ctx.addressed_slot(BACK_OF_STACK).is_none());
        assert!(!ctx.keep_running());
        assert_eq!(ctx.error().unwrap().kind, VmErrorKind::StackUnderflow);
    }

    #[test]
    fn push_past_capacity_reports_overflow_not_corruption() {
        let config = ContextConfig { stack_capacity: 2, ..ContextConfig::default() };
        let mut ctx = Context::new(config, ContextGroup::new());
        assert!(ctx.push_checked(Value::Number(1.0)));
        assert!(ctx.push_checked(Value::Number(2.0)));
        assert!(!ctx.push_checked(Value::Number(3.0)));
        assert_eq!(ctx.error().unwrap().kind, VmErrorKind::StackOverflow);
    }

    #[test]
    fn push_frame_then_pop_frame_restores_caller() {
        let mut ctx = Context::with_defaults();
        let (script, handler) = trivial_script();
        ctx.prepare(Arc::clone(&script), handler);
        ctx.set_pc(3);
        ctx.push_frame(Arc::clone(&script), handler);
        assert_eq!(ctx.call_depth(), 1);
        assert_eq!(ctx.pc(), 0);
        assert!(ctx.pop_frame());
        assert_eq!(ctx.pc(), 3);
        assert_eq!(ctx.call_depth(), 0);
    }

    #[test]
    fn pop_frame_on_empty_call_stack_signals_termination() {
        let mut ctx = Context::with_defaults();
        let (script, handler) = trivial_script();
        ctx.prepare(script, handler);
        assert!(!ctx.pop_frame());
        assert!(!ctx.has_active_frame());
    }

    #[test]
    fn relative_jump_out_of_range_traps() {
        let mut ctx = Context::with_defaults();
        let (script, handler) = trivial_script();
        ctx.prepare(script, handler);
        ctx.relative_jump(100);
        assert_eq!(ctx.error().unwrap().kind, VmErrorKind::JumpOutOfRange);
    }

    #[test]
    fn error_message_is_truncated_to_configured_length() {
        let config = ContextConfig { err_buffer_len: 8, ..ContextConfig::default() };
        let mut ctx = Context::new(config, ContextGroup::new());
        ctx.stop_with_error(VmErrorKind::CantMakeNumber, "a very long message indeed");
        assert!(ctx.error_message().unwrap().len() <= 8 + "Can't Make Number: ".len().min(8));
    }
}
