//! Well-formedness checks on a code unit
//!
//! The compiler that produced a unit is trusted, but a unit loaded from JSON
//! is not. Every immediate that indexes a frame slot is checked against the
//! frame layout. Constant and name indices are checked only when the unit
//! carries those tables, since they are printable metadata and may be left
//! empty.

use super::code::CodeUnit;
use super::decoder::{folded_oparg, Instruction};
use super::opcode::Opcode;

/// A unit that cannot be compiled as-is
#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("{opcode} at instruction {vpc} addresses local {slot}, but the unit has {nlocals}")]
    LocalOutOfRange { vpc: usize, opcode: &'static str, slot: u32, nlocals: u32 },
    #[error("{opcode} at instruction {vpc} addresses cell {slot}, but the unit has {ncells}")]
    CellOutOfRange { vpc: usize, opcode: &'static str, slot: u32, ncells: usize },
    #[error("LOAD_CONST at instruction {vpc} reads constant {index} of {len}")]
    ConstOutOfRange { vpc: usize, index: u32, len: usize },
    #[error("{opcode} at instruction {vpc} reads name {index} of {len}")]
    NameOutOfRange { vpc: usize, opcode: &'static str, index: u32, len: usize },
    #[error("Unit declares {nlocals} locals but lists {varnames} variable names")]
    LocalsMismatch { nlocals: u32, varnames: usize },
    #[error("Unit binds {nargs} arguments into {nlocals} locals")]
    TooManyArguments { nargs: usize, nlocals: u32 },
}

/// Check every instruction of `unit` against its frame layout and tables
pub fn validate(unit: &CodeUnit, instrs: &[Instruction]) -> Result<(), ValidateError> {
    if !unit.varnames.is_empty() && unit.varnames.len() != unit.nlocals as usize {
        return Err(ValidateError::LocalsMismatch {
            nlocals: unit.nlocals,
            varnames: unit.varnames.len(),
        });
    }
    if unit.nargs() > unit.nlocals as usize {
        return Err(ValidateError::TooManyArguments { nargs: unit.nargs(), nlocals: unit.nlocals });
    }

    for (vpc, instr) in instrs.iter().enumerate() {
        let oparg = folded_oparg(instrs, vpc);
        let opcode = instr.opcode;
        match opcode {
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
                if oparg >= unit.nlocals {
                    return Err(ValidateError::LocalOutOfRange {
                        vpc,
                        opcode: opcode.name(),
                        slot: oparg,
                        nlocals: unit.nlocals,
                    });
                }
            }
            Opcode::LoadClosure
            | Opcode::LoadDeref
            | Opcode::StoreDeref
            | Opcode::DeleteDeref
            | Opcode::LoadClassderef => {
                if oparg as usize >= unit.ncells() {
                    return Err(ValidateError::CellOutOfRange {
                        vpc,
                        opcode: opcode.name(),
                        slot: oparg,
                        ncells: unit.ncells(),
                    });
                }
            }
            Opcode::LoadConst => {
                if !unit.consts.is_empty() && oparg as usize >= unit.consts.len() {
                    return Err(ValidateError::ConstOutOfRange {
                        vpc,
                        index: oparg,
                        len: unit.consts.len(),
                    });
                }
            }
            _ if uses_name(opcode) => {
                if !unit.names.is_empty() && oparg as usize >= unit.names.len() {
                    return Err(ValidateError::NameOutOfRange {
                        vpc,
                        opcode: opcode.name(),
                        index: oparg,
                        len: unit.names.len(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn uses_name(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::LoadName
            | Opcode::StoreAttr
            | Opcode::DeleteAttr
            | Opcode::LoadAttr
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::LoadGlobal
            | Opcode::ImportName
            | Opcode::ImportFrom
            | Opcode::LoadMethod
    )
}
