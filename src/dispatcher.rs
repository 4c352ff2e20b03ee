// File: src/dispatcher.rs
//
// Opcode dispatch table and the fetch-decode-execute loop. A `Dispatcher`
// owns a table of opcode functions indexed by opcode id; the base sixteen
// occupy ids 0-16 (0 is the `Invalid` trap), and a host embedder can append
// further opcodes at ids 17 and up via `add_instructions`.

use crate::context::Context;
use crate::error::VmErrorKind;
use crate::instruction::{Instruction, Opcode, BACK_OF_STACK};
use crate::value::{InvalidationPolicy, Value};

/// An opcode implementation: given the context and the instruction that
/// selected it, performs one step of work. Must not loop — the dispatcher
/// advances the program counter between calls (opcodes that jump set `pc`
/// directly instead via `Context::relative_jump`, which the dispatcher
/// detects and does not additionally advance past).
pub type OpcodeFn = fn(&mut Context, Instruction);

/// The opcode dispatch table. Holds one `OpcodeFn` per opcode id; unknown ids
/// beyond the table's length behave the same as `Invalid`.
pub struct Dispatcher {
    table: Vec<OpcodeFn>,
}

impl Dispatcher {
    /// Builds a table with the base seventeen entries (ids 0-16) installed.
    pub fn new() -> Self {
        let mut table: Vec<OpcodeFn> = Vec::with_capacity(32);
        table.push(op_invalid); // 0
        table.push(op_exit_to_top); // 1
        table.push(op_no_op); // 2
        table.push(op_push_string_from_table); // 3
        table.push(op_print); // 4
        table.push(op_pop); // 5
        table.push(op_push_boolean); // 6
        table.push(op_assign_string_from_table); // 7
        table.push(op_jump_relative); // 8
        table.push(op_jump_relative_if_true); // 9
        table.push(op_jump_relative_if_false); // 10
        table.push(op_jump_relative_if_greater_than_zero); // 11
        table.push(op_jump_relative_if_less_than_zero); // 12
        table.push(op_jump_relative_if_greater_same_than_zero); // 13
        table.push(op_jump_relative_if_less_same_than_zero); // 14
        table.push(op_push_number); // 15
        table.push(op_add_number); // 16
        Dispatcher { table }
    }

    /// Appends host-registered opcode functions starting at
    /// `crate::instruction::FIRST_HOST_OPCODE` (or the next free id, if a
    /// previous `add_instructions` call already extended the table). Returns
    /// the id assigned to the first function in `functions`.
    pub fn add_instructions(&mut self, functions: &[OpcodeFn]) -> u16 {
        let first_id = self.table.len() as u16;
        self.table.extend_from_slice(functions);
        first_id
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Executes exactly one instruction: fetches the instruction at the
    /// active frame's program counter, dispatches it, and advances the
    /// program counter unless the opcode already repositioned it (a jump) or
    /// stopped the context (an error, or `ExitToTop` with an empty call
    /// stack). Running off the end of a handler's instruction array (no
    /// explicit `ExitToTop` or host return) is an implicit return to the
    /// caller, or a clean halt if there is no caller.
    pub fn step(&self, ctx: &mut Context) {
        if !ctx.keep_running() || !ctx.has_active_frame() {
            ctx.stop();
            return;
        }
        ctx.run_pre_instruction_hook();

        let instr = match ctx.current_instruction() {
            Some(i) => i,
            None => {
                if !ctx.pop_frame() {
                    ctx.stop();
                }
                return;
            }
        };

        let pc_before = ctx.pc();
        let handler = self.table.get(instr.opcode as usize).copied().unwrap_or(op_invalid);
        handler(ctx, instr);
        ctx.bump_step_counter();

        if !ctx.keep_running() {
            return;
        }
        // An opcode that repositioned pc (a taken jump) or changed frames (a
        // call/return extension) already left pc where execution should
        // resume; only a "straight-line" opcode needs the automatic advance.
        if ctx.pc() == pc_before {
            ctx.advance_pc();
        }
    }

    /// `prepare(ctx, script, handler)` followed by a loop of `step` until
    /// `keepRunning` clears or the active frame is exhausted (the call stack
    /// has emptied out from underneath the outermost handler returning).
    pub fn run(&self, ctx: &mut Context) {
        while ctx.keep_running() && ctx.has_active_frame() {
            self.step(ctx);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// -- opcode 0: Invalid -------------------------------------------------

fn op_invalid(ctx: &mut Context, instr: Instruction) {
    ctx.stop_with_error(VmErrorKind::UnknownInstruction, format!("unknown instruction {}", instr.opcode));
}

// -- opcode 1: ExitToTop -------------------------------------------------

/// Unwinds every suspended caller frame and halts, regardless of call depth
/// — the "panic button" a host's `exit` command would invoke.
fn op_exit_to_top(ctx: &mut Context, _instr: Instruction) {
    while ctx.pop_frame() {}
    ctx.stop();
}

// -- opcode 2: NoOp -------------------------------------------------

fn op_no_op(_ctx: &mut Context, _instr: Instruction) {}

// -- opcode 3: PushStringFromTable -------------------------------------------------

/// Pushes a `StringConstant` view of `literal_strings[param2]`. Cloning the
/// `Arc<str>` bumps a refcount; it never copies the bytes onto the slot (the
/// script, not the slot, owns them).
fn op_push_string_from_table(ctx: &mut Context, instr: Instruction) {
    let index = instr.param2_as_u32() as usize;
    let text = ctx.literal_string(index);
    ctx.push_checked(Value::init_string_constant(text, InvalidationPolicy::InvalidateReferences));
}

// -- opcode 4: Print -------------------------------------------------

/// Reads the addressed slot as a string (truncated to 1024 bytes, the
/// source's fixed print-buffer size) and writes it to stdout, followed by a
/// newline. Pops the operand only when addressed via `BACK_OF_STACK`; an
/// explicit slot index is a read-only reference, same as the predicate jumps.
fn op_print(ctx: &mut Context, instr: Instruction) {
    let slot = match ctx.addressed_slot(instr.param1) {
        Some(s) => s,
        None => return,
    };
    let text = ctx.stack_value(slot).get_as_string(1024);
    println!("{}", text);
    if instr.param1 == BACK_OF_STACK {
        ctx.cleanup_stack_to(slot);
    }
}

// -- opcode 5: Pop -------------------------------------------------

/// Destroys the top-of-stack value. Fails with `StackUnderflow` if the
/// current frame is already empty.
fn op_pop(ctx: &mut Context, _instr: Instruction) {
    if ctx.stack_depth() == 0 {
        ctx.stop_with_error(VmErrorKind::StackUnderflow, "pop with an empty frame");
        return;
    }
    let target = ctx.stack_end() - 1;
    ctx.cleanup_stack_to(target);
}

// -- opcode 6: PushBoolean -------------------------------------------------

/// `param2 != 0` becomes `true`.
fn op_push_boolean(ctx: &mut Context, instr: Instruction) {
    ctx.push_checked(Value::Boolean(instr.param2 != 0));
}

// -- opcode 7: AssignStringFromTable -------------------------------------------------

/// Overwrites the addressed slot in place with a `StringConstant` view of
/// `literal_strings[param2]`, rather than pushing a new slot. The assignment
/// itself destroys whatever the slot held before, via ordinary Rust drop glue.
fn op_assign_string_from_table(ctx: &mut Context, instr: Instruction) {
    let slot = match ctx.addressed_slot(instr.param1) {
        Some(s) => s,
        None => return,
    };
    let index = instr.param2_as_u32() as usize;
    let text = ctx.literal_string(index);
    *ctx.stack_value_mut(slot) = Value::init_string_constant(text, InvalidationPolicy::InvalidateReferences);
}

// -- opcodes 8-14: jump family -------------------------------------------------

fn op_jump_relative(ctx: &mut Context, instr: Instruction) {
    ctx.relative_jump(instr.param2_as_i32());
}

/// Shared machinery for the boolean-predicate jumps: read the addressed
/// operand as a boolean and branch if `want == actual`. Only the
/// `BACK_OF_STACK` sentinel pops the operand after the read; an explicit slot
/// index is a read-only reference, the same as `AddNumber`'s operand, so a
/// value held in a fixed slot can be tested repeatedly across loop
/// iterations without being destroyed.
fn predicate_jump_bool(ctx: &mut Context, instr: Instruction, want: bool) {
    let slot = match ctx.addressed_slot(instr.param1) {
        Some(s) => s,
        None => return,
    };
    let cond = match ctx.stack_value(slot).get_as_boolean() {
        Ok(b) => b,
        Err(msg) => {
            ctx.stop_with_error(VmErrorKind::CantMakeBoolean, msg);
            return;
        }
    };
    if instr.param1 == BACK_OF_STACK {
        ctx.cleanup_stack_to(slot);
    }
    if cond == want {
        ctx.relative_jump(instr.param2_as_i32());
    }
}

fn op_jump_relative_if_true(ctx: &mut Context, instr: Instruction) {
    predicate_jump_bool(ctx, instr, true);
}

fn op_jump_relative_if_false(ctx: &mut Context, instr: Instruction) {
    predicate_jump_bool(ctx, instr, false);
}

/// Shared machinery for the numeric-predicate jumps: read the addressed
/// operand as a number and branch if `test(n)` holds. Same pop-only-on-
/// `BACK_OF_STACK` discipline as `predicate_jump_bool`.
fn predicate_jump_numeric(ctx: &mut Context, instr: Instruction, test: fn(f64) -> bool) {
    let slot = match ctx.addressed_slot(instr.param1) {
        Some(s) => s,
        None => return,
    };
    let n = match ctx.stack_value(slot).get_as_number() {
        Ok(n) => n,
        Err(msg) => {
            ctx.stop_with_error(VmErrorKind::CantMakeNumber, msg);
            return;
        }
    };
    if instr.param1 == BACK_OF_STACK {
        ctx.cleanup_stack_to(slot);
    }
    if test(n) {
        ctx.relative_jump(instr.param2_as_i32());
    }
}

fn op_jump_relative_if_greater_than_zero(ctx: &mut Context, instr: Instruction) {
    predicate_jump_numeric(ctx, instr, |n| n > 0.0);
}

fn op_jump_relative_if_less_than_zero(ctx: &mut Context, instr: Instruction) {
    predicate_jump_numeric(ctx, instr, |n| n < 0.0);
}

fn op_jump_relative_if_greater_same_than_zero(ctx: &mut Context, instr: Instruction) {
    predicate_jump_numeric(ctx, instr, |n| n >= 0.0);
}

fn op_jump_relative_if_less_same_than_zero(ctx: &mut Context, instr: Instruction) {
    predicate_jump_numeric(ctx, instr, |n| n <= 0.0);
}

// -- opcode 15: PushNumber -------------------------------------------------

/// `param2` is an IEEE-754 single-precision bit pattern, widened to `f64` for
/// storage — not a lossy cast, a bit-reinterpretation of a narrower payload.
fn op_push_number(ctx: &mut Context, instr: Instruction) {
    ctx.push_checked(Value::Number(instr.param2_as_f32() as f64));
}

// -- opcode 16: AddNumber -------------------------------------------------

/// Adds the instruction's own `param2` (a compile-time constant, signed) into
/// the addressed slot's current number, and writes the sum back into that
/// same slot. `param2` is never another stack slot's value — the addressed
/// operand is both the only input and the only output.
fn op_add_number(ctx: &mut Context, instr: Instruction) {
    let slot = match ctx.addressed_slot(instr.param1) {
        Some(s) => s,
        None => return,
    };
    let current = match ctx.stack_value(slot).get_as_number() {
        Ok(n) => n,
        Err(msg) => {
            ctx.stop_with_error(VmErrorKind::CantMakeNumber, msg);
            return;
        }
    };
    let sum = current + instr.param2_as_i32() as f64;
    ctx.stack_value_mut(slot).set_as_number(sum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::instruction::BACK_OF_STACK;
    use crate::script::script_create;
    use std::sync::Arc;

    fn run_handler(builder_instrs: impl FnOnce(&mut crate::script::ScriptBuilder, crate::script::HandlerRef)) -> Context {
        let mut builder = script_create(1, 1);
        let handler = builder.add_command_handler_named("go");
        builder_instrs(&mut builder, handler);
        let script = builder.build();
        let mut ctx = Context::with_defaults();
        ctx.prepare(Arc::clone(&script), handler);
        let dispatcher = Dispatcher::new();
        dispatcher.run(&mut ctx);
        ctx
    }

    #[test]
    fn unknown_opcode_stops_with_error() {
        let ctx = run_handler(|b, h| {
            b.append_instruction(h, Instruction::new(9999, 0, 0));
        });
        assert_eq!(ctx.error().unwrap().kind, VmErrorKind::UnknownInstruction);
    }

    #[test]
    fn push_number_then_exit_leaves_value_on_stack() {
        let ctx = run_handler(|b, h| {
            b.append_instruction(h, Instruction::new(Opcode::PushNumber.id(), 0, (3.5f32).to_bits()));
            b.append_instruction(h, Instruction::new(Opcode::ExitToTop.id(), 0, 0));
        });
        assert_eq!(ctx.stack_depth(), 1);
        assert_eq!(ctx.stack_value(ctx.stack_base()).get_as_number().unwrap(), 3.5);
    }

    #[test]
    fn add_number_adds_constant_into_addressed_slot() {
        let ctx = run_handler(|b, h| {
            b.append_instruction(h, Instruction::new(Opcode::PushNumber.id(), 0, (10.0f32).to_bits()));
            b.append_instruction(h, Instruction::new(Opcode::AddNumber.id(), BACK_OF_STACK, 5u32));
            b.append_instruction(h, Instruction::new(Opcode::ExitToTop.id(), 0, 0));
        });
        assert_eq!(ctx.stack_depth(), 1);
        assert_eq!(ctx.stack_value(ctx.stack_base()).get_as_number().unwrap(), 15.0);
    }

    #[test]
    fn conditional_jump_skips_the_true_branch() {
        let ctx = run_handler(|b, h| {
            b.append_instruction(h, Instruction::new(Opcode::PushBoolean.id(), 0, 0));
            b.append_instruction(h, Instruction::new(Opcode::JumpRelativeIfFalse.id(), BACK_OF_STACK, 2));
            b.append_instruction(h, Instruction::new(Opcode::PushNumber.id(), 0, (1.0f32).to_bits()));
            b.append_instruction(h, Instruction::new(Opcode::ExitToTop.id(), 0, 0));
            b.append_instruction(h, Instruction::new(Opcode::PushNumber.id(), 0, (2.0f32).to_bits()));
            b.append_instruction(h, Instruction::new(Opcode::ExitToTop.id(), 0, 0));
        });
        assert_eq!(ctx.stack_depth(), 1);
        assert_eq!(ctx.stack_value(ctx.stack_base()).get_as_number().unwrap(), 2.0);
    }

    #[test]
    fn backward_jump_loop_prints_three_times() {
        // slot0: the counter. AddNumber addresses it directly (not
        // BACK_OF_STACK), decrementing it in place by its own param2 constant
        // without consuming it, so the loop test can read it again next pass.
        let mut builder = script_create(1, 1);
        let handler = builder.add_command_handler_named("go");
        let msg = builder.add_literal_string("x");
        builder.append_instruction(handler, Instruction::new(Opcode::PushNumber.id(), 0, (3.0f32).to_bits())); // 0: slot0 = counter
        // loop body starts at index 1
        builder.append_instruction(handler, Instruction::new(Opcode::PushStringFromTable.id(), 0, msg)); // 1
        builder.append_instruction(handler, Instruction::new(Opcode::Print.id(), BACK_OF_STACK, 0)); // 2: prints and pops "x"
        builder.append_instruction(handler, Instruction::new(Opcode::AddNumber.id(), 0, (-1i32) as u32)); // 3: counter -= 1
        // jump back to index 1 (loop body start) while counter > 0: displacement = 1 - 4 = -3
        builder.append_instruction(handler, Instruction::new(Opcode::JumpRelativeIfGreaterThanZero.id(), 0, (-3i32) as u32)); // 4
        builder.append_instruction(handler, Instruction::new(Opcode::ExitToTop.id(), 0, 0)); // 5
        let script = builder.build();
        let mut ctx = Context::with_defaults();
        ctx.prepare(script, handler);
        let dispatcher = Dispatcher::new();
        dispatcher.run(&mut ctx);
        assert!(ctx.error().is_none(), "{:?}", ctx.error());
        assert_eq!(ctx.stack_depth(), 1);
        assert_eq!(ctx.stack_value(ctx.stack_base()).get_as_number().unwrap(), 0.0);
    }

    #[test]
    fn stack_underflow_on_pop_with_empty_frame() {
        let ctx = run_handler(|b, h| {
            b.append_instruction(h, Instruction::new(Opcode::Pop.id(), 0, 0));
        });
        assert_eq!(ctx.error().unwrap().kind, VmErrorKind::StackUnderflow);
    }
}
