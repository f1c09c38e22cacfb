//! Label-based assembler for code objects of the reference runtime.
//!
//! Branch widths are resolved by iterating to a fixpoint: a jump whose
//! argument outgrows its current encoded form is widened with
//! `EXTENDED_ARG` prefixes, which shifts offsets and may widen further
//! jumps. The builder also emits the byte-delta line table and estimates the
//! operand stack depth.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::dialect::Dialect;
use crate::bytecode::linetable;
use crate::bytecode::opcode::*;
use crate::bytecode::Instruction;

use super::{CodeObject, CodeRef, Value, CO_GENERATOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Clone, Copy)]
enum Operand {
    None,
    Immediate(u32),
    Jump(Label),
}

struct Emitted {
    opcode: u8,
    operand: Operand,
    line: u32,
}

pub struct CodeBuilder {
    name: String,
    dialect: &'static Dialect,
    items: Vec<Emitted>,
    labels: Vec<Option<usize>>,
    consts: Vec<Value>,
    names: Vec<String>,
    varnames: Vec<String>,
    arg_count: usize,
    current_line: u32,
}

impl CodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dialect: Dialect::cpython37(),
            items: Vec::new(),
            labels: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            arg_count: 0,
            current_line: 1,
        }
    }

    /// Declare the next positional parameter.
    pub fn param(&mut self, name: &str) -> u32 {
        let index = self.var_index(name);
        self.arg_count += 1;
        index
    }

    /// Source line of the instructions emitted from here on.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    pub fn emit(&mut self, opcode: u8) -> &mut Self {
        self.items.push(Emitted {
            opcode,
            operand: Operand::None,
            line: self.current_line,
        });
        self
    }

    pub fn emit_arg(&mut self, opcode: u8, arg: u32) -> &mut Self {
        self.items.push(Emitted {
            opcode,
            operand: Operand::Immediate(arg),
            line: self.current_line,
        });
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.items.len());
    }

    pub fn jump(&mut self, opcode: u8, label: Label) -> &mut Self {
        debug_assert!(self.dialect.is_branch(opcode));
        self.items.push(Emitted {
            opcode,
            operand: Operand::Jump(label),
            line: self.current_line,
        });
        self
    }

    pub fn add_const(&mut self, value: Value) -> u32 {
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    pub fn name_index(&mut self, name: &str) -> u32 {
        index_of(&mut self.names, name)
    }

    pub fn var_index(&mut self, name: &str) -> u32 {
        index_of(&mut self.varnames, name)
    }

    // Shorthands for the common instruction shapes.

    pub fn load_const(&mut self, value: Value) -> &mut Self {
        let index = self.add_const(value);
        self.emit_arg(LOAD_CONST, index)
    }

    pub fn load_fast(&mut self, name: &str) -> &mut Self {
        let index = self.var_index(name);
        self.emit_arg(LOAD_FAST, index)
    }

    pub fn store_fast(&mut self, name: &str) -> &mut Self {
        let index = self.var_index(name);
        self.emit_arg(STORE_FAST, index)
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        let index = self.name_index(name);
        self.emit_arg(LOAD_GLOBAL, index)
    }

    pub fn store_global(&mut self, name: &str) -> &mut Self {
        let index = self.name_index(name);
        self.emit_arg(STORE_GLOBAL, index)
    }

    pub fn load_name(&mut self, name: &str) -> &mut Self {
        let index = self.name_index(name);
        self.emit_arg(LOAD_NAME, index)
    }

    pub fn load_attr(&mut self, name: &str) -> &mut Self {
        let index = self.name_index(name);
        self.emit_arg(LOAD_ATTR, index)
    }

    pub fn call_function(&mut self, argc: u32) -> &mut Self {
        self.emit_arg(CALL_FUNCTION, argc)
    }

    pub fn return_value(&mut self) -> &mut Self {
        self.emit(RETURN_VALUE)
    }

    /// Assemble into a code object.
    pub fn build(self) -> CodeRef {
        let encoding = self.dialect.encoding;

        // Start with the smallest encoding everywhere and widen until no
        // jump argument outgrows its instruction.
        let mut sizes: Vec<usize> = self
            .items
            .iter()
            .map(|item| match item.operand {
                Operand::None => Instruction::no_arg(encoding, item.opcode).size,
                Operand::Immediate(arg) => {
                    Instruction::with_arg(encoding, item.opcode, arg).size
                }
                Operand::Jump(_) => Instruction::no_arg(encoding, item.opcode).size,
            })
            .collect();

        let mut offsets = vec![0usize; self.items.len() + 1];
        loop {
            for (i, size) in sizes.iter().enumerate() {
                offsets[i + 1] = offsets[i] + size;
            }

            let mut stable = true;
            for (i, item) in self.items.iter().enumerate() {
                let Operand::Jump(label) = item.operand else {
                    continue;
                };
                let target_item = self.labels[label.0].expect("unbound label");
                let arg = self.dialect.branch_arg(
                    offsets[i],
                    sizes[i],
                    item.opcode,
                    offsets[target_item],
                );
                let needed = Instruction::with_arg(encoding, item.opcode, arg).size;
                if needed > sizes[i] {
                    sizes[i] = needed;
                    stable = false;
                }
            }
            if stable {
                break;
            }
        }

        let mut bytecode = vec![0u8; offsets[self.items.len()]];
        for (i, item) in self.items.iter().enumerate() {
            let instruction = match item.operand {
                Operand::None => Instruction {
                    opcode: item.opcode,
                    arg: 0,
                    size: sizes[i],
                },
                Operand::Immediate(arg) => Instruction {
                    opcode: item.opcode,
                    arg,
                    size: sizes[i],
                },
                Operand::Jump(label) => {
                    let target_item = self.labels[label.0].expect("unbound label");
                    let arg = self.dialect.branch_arg(
                        offsets[i],
                        sizes[i],
                        item.opcode,
                        offsets[target_item],
                    );
                    Instruction {
                        opcode: item.opcode,
                        arg,
                        size: sizes[i],
                    }
                }
            };
            instruction.write(encoding, &mut bytecode, offsets[i]);
        }

        let first_line = self.items.first().map(|i| i.line).unwrap_or(1);
        let mut boundaries = Vec::new();
        let mut previous_line = first_line;
        for (i, item) in self.items.iter().enumerate() {
            if item.line != previous_line {
                boundaries.push((offsets[i], item.line));
                previous_line = item.line;
            }
        }
        let line_table = linetable::encode_byte_delta(&boundaries, first_line);

        let mut is_generator = false;
        let mut depth = 0i64;
        let mut max_depth = 0i64;
        for item in &self.items {
            if matches!(item.opcode, YIELD_VALUE | YIELD_FROM) {
                is_generator = true;
            }
            let arg = match item.operand {
                Operand::Immediate(arg) => arg as i64,
                _ => 0,
            };
            depth += stack_effect(item.opcode, arg);
            max_depth = max_depth.max(depth);
        }

        Rc::new(RefCell::new(CodeObject {
            name: self.name,
            bytecode: Rc::new(bytecode),
            consts: Rc::new(self.consts),
            names: self.names,
            varnames: self.varnames,
            line_table: Some(Rc::new(line_table)),
            first_line,
            stack_size: max_depth.max(1) as u32,
            arg_count: self.arg_count,
            flags: if is_generator { CO_GENERATOR } else { 0 },
        }))
    }
}

fn index_of(table: &mut Vec<String>, name: &str) -> u32 {
    match table.iter().position(|n| n == name) {
        Some(index) => index as u32,
        None => {
            table.push(name.to_string());
            (table.len() - 1) as u32
        }
    }
}

// Net operand stack effect; an estimate over the linear instruction list is
// enough for code this builder produces.
fn stack_effect(opcode: u8, arg: i64) -> i64 {
    match opcode {
        LOAD_CONST | LOAD_FAST | LOAD_GLOBAL | LOAD_NAME | DUP_TOP => 1,
        FOR_ITER => 1,
        STORE_FAST | STORE_GLOBAL | STORE_NAME | POP_TOP | RETURN_VALUE | PRINT_EXPR => -1,
        POP_JUMP_IF_FALSE | POP_JUMP_IF_TRUE => -1,
        BINARY_ADD | BINARY_SUBTRACT | BINARY_MULTIPLY | BINARY_MODULO | BINARY_TRUE_DIVIDE
        | BINARY_FLOOR_DIVIDE | INPLACE_ADD | INPLACE_SUBTRACT | INPLACE_MULTIPLY
        | INPLACE_MODULO | INPLACE_TRUE_DIVIDE | INPLACE_FLOOR_DIVIDE | BINARY_SUBSCR
        | COMPARE_OP => -1,
        STORE_ATTR => -2,
        STORE_SUBSCR => -3,
        BUILD_TUPLE | BUILD_LIST => 1 - arg,
        CALL_FUNCTION => -arg,
        RAISE_VARARGS => -arg,
        _ => 0,
    }
}
