//! Offset-preserving bytecode rewriter.
//!
//! The patcher injects a call to a sentinel callable at a given instruction
//! boundary. Two strategies exist:
//!
//! * *Insert* splices the call sequence in place, adjusting every branch
//!   whose span crosses the insertion and cascading any instruction growth
//!   needed to widen branch arguments.
//! * *Append* is used for code containing suspension points: the paused
//!   frame stores a raw byte offset, so instructions around a yield cannot
//!   move. A trampoline jump at the target offset transfers control to an
//!   appended block holding the call, the relocated instructions and a jump
//!   back.

use std::iter;

use crate::bytecode::dialect::{Dialect, OpcodeGroup};
use crate::bytecode::linetable;
use crate::bytecode::opcode::{CALL_FUNCTION, JUMP_ABSOLUTE, LOAD_CONST, NOP, POP_TOP};
use crate::bytecode::{Encoding, Instruction};
use crate::error::Error;

/// How [`BytecodePatcher::inject_call`] will rewrite this code object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    /// No suspension points: splice the call sequence in place.
    Insert,
    /// At least one yield present: jump to an appended block.
    Append,
    /// Bytecode failed to decode, every injection is refused.
    Fail,
}

/// A branch instruction of the original bytecode that may need its argument
/// fixed and/or an upgrade to a wider encoded form.
#[derive(Debug, Clone, Copy)]
struct UpdatedBranch {
    instruction: Instruction,
    original_size: usize,
    current_offset: usize,
}

/// Space reserved by one insertion operation.
#[derive(Debug, Clone, Copy)]
struct Insertion {
    size: usize,
    current_offset: usize,
}

// Bound on the widening cascade; real-world bytecode converges in a handful
// of iterations.
const MAX_INSERTION_ITERATIONS: usize = 10;

/// Instruction sequence invoking the callable stored at `const_index` and
/// discarding its result.
fn method_call(encoding: Encoding, const_index: u32) -> [Instruction; 3] {
    [
        Instruction::with_arg(encoding, LOAD_CONST, const_index),
        Instruction::with_arg(encoding, CALL_FUNCTION, 0),
        Instruction::no_arg(encoding, POP_TOP),
    ]
}

fn instructions_size(instructions: &[Instruction]) -> usize {
    instructions.iter().map(|i| i.size).sum()
}

pub struct BytecodePatcher<'a> {
    dialect: &'a Dialect,
    bytecode: Vec<u8>,
    line_table: Option<Vec<u8>>,
    strategy: PatchStrategy,
}

impl<'a> BytecodePatcher<'a> {
    /// Parse the bytecode once and pick a strategy for later injections.
    pub fn new(dialect: &'a Dialect, bytecode: Vec<u8>, line_table: Option<Vec<u8>>) -> Self {
        let encoding = dialect.encoding;

        let mut strategy = PatchStrategy::Insert;
        let mut it = 0;
        while it < bytecode.len() {
            match Instruction::read(encoding, &bytecode, it) {
                Err(_) => {
                    strategy = PatchStrategy::Fail;
                    break;
                }
                Ok(instruction) => {
                    if dialect.group(instruction.opcode) == OpcodeGroup::Yield {
                        strategy = PatchStrategy::Append;
                        break;
                    }
                    it += instruction.size;
                }
            }
        }

        Self {
            dialect,
            bytecode,
            line_table,
            strategy,
        }
    }

    pub fn strategy(&self) -> PatchStrategy {
        self.strategy
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn line_table(&self) -> Option<&[u8]> {
        self.line_table.as_deref()
    }

    pub fn into_parts(self) -> (Vec<u8>, Option<Vec<u8>>) {
        (self.bytecode, self.line_table)
    }

    /// Rewrite a working copy to call `constants[const_index]` at `offset`
    /// and swap it in. On failure the current bytecode stays untouched.
    ///
    /// `offset` must be an instruction boundary under the *current* bytecode;
    /// the caller guarantees that `const_index` is unique per injection.
    pub fn inject_call(&mut self, offset: usize, const_index: u32) -> Result<(), Error> {
        let mut bytecode = self.bytecode.clone();
        let mut line_table = self.line_table.clone();

        match self.strategy {
            PatchStrategy::Insert => {
                self.insert_method_call(&mut bytecode, line_table.as_mut(), offset, const_index)?
            }
            PatchStrategy::Append => self.append_method_call(&mut bytecode, offset, const_index)?,
            PatchStrategy::Fail => return Err(Error::Undecodable),
        }

        self.bytecode = bytecode;
        self.line_table = line_table;
        Ok(())
    }

    /// Reserve space for an insertion and recompute the offsets and arguments
    /// of every branch instruction.
    ///
    /// Updating in place is unmanageable: fixing one branch argument may
    /// force an `EXTENDED_ARG` upgrade, which is itself an insertion that
    /// invalidates offsets already visited. Insertions are therefore
    /// processed one at a time off a stack, and an upgrade pushes a new
    /// insertion to be processed later.
    fn reserve_and_update(
        &self,
        first: Insertion,
        branches: &mut [UpdatedBranch],
    ) -> Result<(), Error> {
        let encoding = self.dialect.encoding;
        let scale = self.dialect.branch_unit_scale();

        let mut insertions = vec![first];
        let mut iterations = 0;

        while !insertions.is_empty() && iterations < MAX_INSERTION_ITERATIONS {
            let insertion = insertions.pop().expect("non-empty");

            // Shift the insertions queued after this one.
            for pending in insertions.iter_mut() {
                if pending.current_offset >= insertion.current_offset {
                    pending.current_offset += insertion.size;
                }
            }

            for branch in branches.iter_mut() {
                let instruction = branch.instruction;
                let arg_bytes = instruction.arg as usize * scale;

                let need_update = match self.dialect.group(instruction.opcode) {
                    OpcodeGroup::RelativeBranch => {
                        // A relative argument moves if the insertion falls
                        // between the instruction and its target. The host
                        // compiler sometimes leaves a redundant
                        // EXTENDED_ARG(0) prefix; the original size is the
                        // one that positions the target correctly.
                        let inst_size = instruction.size.max(branch.original_size);
                        let target = branch.current_offset + inst_size + arg_bytes;
                        branch.current_offset < insertion.current_offset
                            && insertion.current_offset < target
                    }
                    OpcodeGroup::AbsoluteBranch => insertion.current_offset < arg_bytes,
                    _ => unreachable!("only branches are gathered"),
                };

                // The top-level insertion shifts instructions at or after the
                // insertion point. A cascading EXTENDED_ARG insertion shifts
                // only instructions strictly after it: the new prefix goes in
                // front of the very instruction sitting at that offset.
                let offset_diff = branch.current_offset as isize - insertion.current_offset as isize;
                if (iterations == 0 && offset_diff >= 0) || offset_diff > 0 {
                    branch.current_offset += insertion.size;
                }

                if need_update {
                    let new_instruction = Instruction::with_arg(
                        encoding,
                        instruction.opcode,
                        instruction.arg + self.dialect.branch_arg_delta(insertion.size),
                    );
                    let size_diff = new_instruction.size as isize - instruction.size as isize;
                    if size_diff > 0 {
                        insertions.push(Insertion {
                            size: size_diff as usize,
                            current_offset: branch.current_offset,
                        });
                    }
                    branch.instruction = new_instruction;
                }
            }

            iterations += 1;
        }

        if insertions.is_empty() {
            Ok(())
        } else {
            Err(Error::CascadeDiverged)
        }
    }

    fn insert_method_call(
        &self,
        bytecode: &mut Vec<u8>,
        mut line_table: Option<&mut Vec<u8>>,
        offset: usize,
        const_index: u32,
    ) -> Result<(), Error> {
        let encoding = self.dialect.encoding;

        // Gather all branch instructions.
        let mut branches = Vec::new();
        let mut offset_valid = false;
        let mut it = 0;
        while it < bytecode.len() {
            if it == offset {
                offset_valid = true;
            }
            let instruction = Instruction::read(encoding, bytecode, it)?;
            if self.dialect.is_branch(instruction.opcode) {
                branches.push(UpdatedBranch {
                    instruction,
                    original_size: instruction.size,
                    current_offset: it,
                });
            }
            it += instruction.size;
        }
        if !offset_valid {
            return Err(Error::MidInstruction(offset));
        }

        let call = method_call(encoding, const_index);
        let call_size = instructions_size(&call);
        self.reserve_and_update(
            Insertion {
                size: call_size,
                current_offset: offset,
            },
            &mut branches,
        )?;

        // Insert the method call.
        bytecode.splice(offset..offset, iter::repeat(NOP).take(call_size));
        let mut at = offset;
        for instruction in call {
            instruction.write(encoding, bytecode, at);
            at += instruction.size;
        }
        self.update_line_table(line_table.as_deref_mut(), offset, call_size)?;

        // Write the updated branches. All insertions before an instruction
        // are in place by the time it is visited, so `current_offset` can be
        // used directly.
        for branch in &branches {
            let size_diff = branch.instruction.size as isize - branch.original_size as isize;
            let mut write_at = branch.current_offset;
            if size_diff > 0 {
                bytecode.splice(
                    write_at..write_at,
                    iter::repeat(NOP).take(size_diff as usize),
                );
                self.update_line_table(
                    line_table.as_deref_mut(),
                    branch.current_offset,
                    size_diff as usize,
                )?;
            } else if size_diff < 0 {
                // The argument shrank below a redundant EXTENDED_ARG(0)
                // prefix. Leave the prefix in place and write the new
                // instruction after it.
                write_at += (-size_diff) as usize;
            }
            branch.instruction.write(encoding, bytecode, write_at);
        }

        Ok(())
    }

    fn update_line_table(
        &self,
        line_table: Option<&mut Vec<u8>>,
        offset: usize,
        size: usize,
    ) -> Result<(), Error> {
        let format = self.dialect.line_format;
        if let Some(table) = line_table {
            if format.supports_updates() {
                *table = linetable::insert_gap(format, table, offset, size)?;
            }
        }
        Ok(())
    }

    /// Append-based injection for yield-bearing code.
    ///
    /// The line table is deliberately not updated: it is a monotone format,
    /// and appending code beyond the original range cannot be expressed in
    /// it. The trampoline virtually always fits within one instruction's
    /// width, so line boundaries stay accurate enough.
    fn append_method_call(
        &self,
        bytecode: &mut Vec<u8>,
        offset: usize,
        const_index: u32,
    ) -> Result<(), Error> {
        let encoding = self.dialect.encoding;
        let scale = self.dialect.branch_unit_scale();

        let trampoline = Instruction::with_arg(
            encoding,
            JUMP_ABSOLUTE,
            (bytecode.len() / scale) as u32,
        );

        // Relocate enough instructions to make room for the trampoline.
        // Relative branches cannot move forward (the delta would turn
        // negative) and yields cannot move at all: a paused frame stores the
        // raw byte offset of its suspension point, and resuming after a
        // patch or unpatch would jump into a wrong location.
        let mut relocated = Vec::new();
        let mut relocated_size = 0usize;
        let mut it = offset;
        while relocated_size < trampoline.size {
            if it >= bytecode.len() {
                return Err(Error::TrampolineSpace);
            }
            let instruction = Instruction::read(encoding, bytecode, it)?;
            match self.dialect.group(instruction.opcode) {
                OpcodeGroup::RelativeBranch => {
                    return Err(Error::PinnedInstruction("relative branch"))
                }
                OpcodeGroup::Yield => return Err(Error::PinnedInstruction("yield")),
                _ => {}
            }
            relocated.push(instruction);
            relocated_size += instruction.size;
            it += instruction.size;
        }

        // A jump into `offset` itself is fine: it lands on the trampoline and
        // runs the relocated instructions in the appended block. A jump into
        // the relocated span would land mid-instruction (or skip relocated
        // instructions through the NOP gap), so such code is refused.
        let mut it = 0;
        while it < bytecode.len() {
            let instruction = Instruction::read(encoding, bytecode, it)?;
            if self.dialect.is_branch(instruction.opcode) {
                let target = self.dialect.branch_target(it, &instruction);
                if target > offset && target < offset + relocated_size {
                    return Err(Error::JumpIntoRelocation(target));
                }
            }
            it += instruction.size;
        }

        // Appended block: sentinel call, relocated instructions, jump back.
        let mut appendix = method_call(encoding, const_index).to_vec();
        appendix.extend(relocated);
        appendix.push(Instruction::with_arg(
            encoding,
            JUMP_ABSOLUTE,
            ((offset + relocated_size) / scale) as u32,
        ));

        let mut at = bytecode.len();
        bytecode.resize(at + instructions_size(&appendix), NOP);
        for instruction in appendix {
            instruction.write(encoding, bytecode, at);
            at += instruction.size;
        }

        trampoline.write(encoding, bytecode, offset);
        bytecode[offset + trampoline.size..offset + relocated_size].fill(NOP);

        Ok(())
    }
}
