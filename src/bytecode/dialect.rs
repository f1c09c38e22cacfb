//! Dialect matrix of the target runtime family.
//!
//! The differences between interpreter generations (instruction encoding,
//! branch argument units, line table format, opcode classification) are
//! modeled as a strategy value chosen at engine construction. Code that
//! patches or scans bytecode consults the dialect instead of hardcoding any
//! version knowledge.

use once_cell::sync::Lazy;

use super::linetable::LineTableFormat;
use super::opcode::*;
use super::{Encoding, Instruction};

/// Classification of an opcode for patching purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeGroup {
    /// Argument (if any) is unrelated to code offsets.
    Sequential,
    /// Argument is a forward delta from the end of the instruction.
    RelativeBranch,
    /// Argument is an absolute target.
    AbsoluteBranch,
    /// Suspension point whose byte offset must survive patching.
    Yield,
}

/// Unit in which branch arguments are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchUnits {
    Bytes,
    /// One unit per 2-byte instruction word (newest wide dialects).
    Instructions,
}

/// A concrete interpreter generation.
pub struct Dialect {
    pub name: &'static str,
    pub encoding: Encoding,
    pub branch_units: BranchUnits,
    pub line_format: LineTableFormat,
    groups: [OpcodeGroup; 256],
    immutable: [bool; 256],
}

impl std::fmt::Debug for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialect").field("name", &self.name).finish()
    }
}

// Opcodes whose effect is invisible outside the evaluated expression:
// arithmetic, stack shuffling, loads, local stores (a condition mutating its
// own locals does not leak), collection literals, iteration, comparisons,
// jumps and calls (calls recursively re-enter the tracer). Everything absent
// from this list is treated as mutating, unknown opcodes included.
const IMMUTABLE_OPCODES: &[u8] = &[
    NOP,
    POP_TOP,
    ROT_TWO,
    ROT_THREE,
    DUP_TOP,
    DUP_TOP_TWO,
    UNARY_POSITIVE,
    UNARY_NEGATIVE,
    UNARY_NOT,
    UNARY_INVERT,
    BINARY_POWER,
    BINARY_MULTIPLY,
    BINARY_MODULO,
    BINARY_ADD,
    BINARY_SUBTRACT,
    BINARY_SUBSCR,
    BINARY_FLOOR_DIVIDE,
    BINARY_TRUE_DIVIDE,
    INPLACE_FLOOR_DIVIDE,
    INPLACE_TRUE_DIVIDE,
    INPLACE_ADD,
    INPLACE_SUBTRACT,
    INPLACE_MULTIPLY,
    INPLACE_MODULO,
    BINARY_LSHIFT,
    BINARY_RSHIFT,
    BINARY_AND,
    BINARY_XOR,
    BINARY_OR,
    INPLACE_POWER,
    GET_ITER,
    BREAK_LOOP,
    RETURN_VALUE,
    YIELD_VALUE,
    POP_BLOCK,
    UNPACK_SEQUENCE,
    STORE_FAST,
    DELETE_FAST,
    LOAD_FAST,
    LOAD_CONST,
    LOAD_NAME,
    LOAD_GLOBAL,
    LOAD_ATTR,
    LOAD_DEREF,
    BUILD_TUPLE,
    BUILD_LIST,
    BUILD_SET,
    BUILD_MAP,
    BUILD_SLICE,
    COMPARE_OP,
    JUMP_FORWARD,
    JUMP_IF_FALSE_OR_POP,
    JUMP_IF_TRUE_OR_POP,
    JUMP_ABSOLUTE,
    POP_JUMP_IF_FALSE,
    POP_JUMP_IF_TRUE,
    FOR_ITER,
    CONTINUE_LOOP,
    SETUP_LOOP,
    CALL_FUNCTION,
    CALL_FUNCTION_KW,
    MAKE_FUNCTION,
    EXTENDED_ARG,
];

struct DialectSpec {
    name: &'static str,
    encoding: Encoding,
    branch_units: BranchUnits,
    line_format: LineTableFormat,
    relative: &'static [u8],
    absolute: &'static [u8],
    yields: &'static [u8],
    immutable_extra: &'static [u8],
}

fn build(spec: DialectSpec) -> Dialect {
    let mut groups = [OpcodeGroup::Sequential; 256];
    for &op in spec.relative {
        groups[op as usize] = OpcodeGroup::RelativeBranch;
    }
    for &op in spec.absolute {
        groups[op as usize] = OpcodeGroup::AbsoluteBranch;
    }
    for &op in spec.yields {
        groups[op as usize] = OpcodeGroup::Yield;
    }

    let mut immutable = [false; 256];
    for &op in IMMUTABLE_OPCODES.iter().chain(spec.immutable_extra) {
        immutable[op as usize] = true;
    }

    Dialect {
        name: spec.name,
        encoding: spec.encoding,
        branch_units: spec.branch_units,
        line_format: spec.line_format,
        groups,
        immutable,
    }
}

impl Dialect {
    /// Legacy encoding generation (2.7 line of the runtime family).
    pub fn cpython27() -> &'static Dialect {
        static D: Lazy<Dialect> = Lazy::new(|| {
            build(DialectSpec {
                name: "cpython-2.7",
                encoding: Encoding::Legacy,
                branch_units: BranchUnits::Bytes,
                line_format: LineTableFormat::ByteDelta,
                relative: &[
                    FOR_ITER,
                    JUMP_FORWARD,
                    SETUP_LOOP,
                    SETUP_EXCEPT,
                    SETUP_FINALLY,
                    SETUP_WITH,
                ],
                absolute: &[
                    JUMP_IF_FALSE_OR_POP,
                    JUMP_IF_TRUE_OR_POP,
                    JUMP_ABSOLUTE,
                    POP_JUMP_IF_FALSE,
                    POP_JUMP_IF_TRUE,
                    CONTINUE_LOOP,
                ],
                yields: &[YIELD_VALUE],
                immutable_extra: &[],
            })
        });
        &D
    }

    /// Wide encoding with byte branch arguments (3.6 through 3.9).
    pub fn cpython37() -> &'static Dialect {
        static D: Lazy<Dialect> = Lazy::new(|| {
            build(DialectSpec {
                name: "cpython-3.7",
                encoding: Encoding::Wide,
                branch_units: BranchUnits::Bytes,
                line_format: LineTableFormat::ByteDelta,
                relative: &[
                    FOR_ITER,
                    JUMP_FORWARD,
                    SETUP_LOOP,
                    SETUP_EXCEPT,
                    SETUP_FINALLY,
                    SETUP_WITH,
                ],
                absolute: &[
                    JUMP_IF_FALSE_OR_POP,
                    JUMP_IF_TRUE_OR_POP,
                    JUMP_ABSOLUTE,
                    POP_JUMP_IF_FALSE,
                    POP_JUMP_IF_TRUE,
                    CONTINUE_LOOP,
                ],
                yields: &[YIELD_VALUE, YIELD_FROM],
                immutable_extra: &[GET_YIELD_FROM_ITER, YIELD_FROM],
            })
        });
        &D
    }

    /// Wide encoding with instruction-unit branch arguments and the
    /// address-range line table (3.10).
    pub fn cpython310() -> &'static Dialect {
        static D: Lazy<Dialect> = Lazy::new(|| {
            build(DialectSpec {
                name: "cpython-3.10",
                encoding: Encoding::Wide,
                branch_units: BranchUnits::Instructions,
                line_format: LineTableFormat::AddressRange,
                relative: &[FOR_ITER, JUMP_FORWARD, SETUP_FINALLY, SETUP_WITH],
                absolute: &[
                    JUMP_IF_FALSE_OR_POP,
                    JUMP_IF_TRUE_OR_POP,
                    JUMP_ABSOLUTE,
                    POP_JUMP_IF_FALSE,
                    POP_JUMP_IF_TRUE,
                ],
                yields: &[YIELD_VALUE, YIELD_FROM],
                immutable_extra: &[GET_YIELD_FROM_ITER, YIELD_FROM],
            })
        });
        &D
    }

    /// Newest generation: structured locations table, decode only. Patching
    /// functions of this dialect leaves the location table untouched.
    pub fn cpython311() -> &'static Dialect {
        static D: Lazy<Dialect> = Lazy::new(|| {
            build(DialectSpec {
                name: "cpython-3.11",
                encoding: Encoding::Wide,
                branch_units: BranchUnits::Instructions,
                line_format: LineTableFormat::Locations,
                relative: &[FOR_ITER, JUMP_FORWARD, SETUP_WITH],
                absolute: &[
                    JUMP_IF_FALSE_OR_POP,
                    JUMP_IF_TRUE_OR_POP,
                    JUMP_ABSOLUTE,
                    POP_JUMP_IF_FALSE,
                    POP_JUMP_IF_TRUE,
                ],
                yields: &[YIELD_VALUE, YIELD_FROM],
                immutable_extra: &[GET_YIELD_FROM_ITER, YIELD_FROM],
            })
        });
        &D
    }

    pub fn group(&self, opcode: u8) -> OpcodeGroup {
        self.groups[opcode as usize]
    }

    pub fn is_branch(&self, opcode: u8) -> bool {
        matches!(
            self.group(opcode),
            OpcodeGroup::RelativeBranch | OpcodeGroup::AbsoluteBranch
        )
    }

    /// Whether executing this opcode cannot change observable program state.
    /// Unknown opcodes report `false`.
    pub fn is_immutable(&self, opcode: u8) -> bool {
        self.immutable[opcode as usize]
    }

    /// Bytes per branch argument unit.
    pub fn branch_unit_scale(&self) -> usize {
        match self.branch_units {
            BranchUnits::Bytes => 1,
            BranchUnits::Instructions => 2,
        }
    }

    /// Byte target of a branch instruction located at `offset`.
    pub fn branch_target(&self, offset: usize, instruction: &Instruction) -> usize {
        let arg_bytes = instruction.arg as usize * self.branch_unit_scale();
        match self.group(instruction.opcode) {
            OpcodeGroup::RelativeBranch => offset + instruction.size + arg_bytes,
            OpcodeGroup::AbsoluteBranch => arg_bytes,
            _ => unreachable!("not a branch instruction"),
        }
    }

    /// Branch argument encoding a byte target for a branch at `offset`.
    pub fn branch_arg(&self, offset: usize, size: usize, opcode: u8, target: usize) -> u32 {
        let scale = self.branch_unit_scale();
        match self.group(opcode) {
            OpcodeGroup::RelativeBranch => ((target - offset - size) / scale) as u32,
            OpcodeGroup::AbsoluteBranch => (target / scale) as u32,
            _ => unreachable!("not a branch instruction"),
        }
    }

    /// Argument delta corresponding to an insertion of `size` bytes.
    pub fn branch_arg_delta(&self, size: usize) -> u32 {
        (size / self.branch_unit_scale()) as u32
    }
}
