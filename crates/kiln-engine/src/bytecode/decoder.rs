//! Wordcode decoder
//!
//! Splits a raw instruction stream into `(opcode, arg)` pairs and folds
//! `EXTENDED_ARG` prefix chains into logical operands. Folding walks
//! backward from the consuming instruction, so any instruction index can be
//! decoded without a forward scan.

use super::opcode::{Opcode, EXTENDED_ARG_SHIFT};

/// Error during wordcode decoding
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Instruction stream has odd length {0}")]
    OddLength(usize),
    #[error("Invalid opcode byte {byte:#x} at instruction {vpc}")]
    InvalidOpcode { byte: u8, vpc: usize },
    #[error("EXTENDED_ARG at instruction {0} has no instruction to extend")]
    DanglingPrefix(usize),
}

/// A single decoded instruction word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    /// The raw argument byte, before prefix folding
    pub arg: u8,
}

/// Decode every instruction word of `code`
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    if code.len() % 2 != 0 {
        return Err(DecodeError::OddLength(code.len()));
    }

    let instrs = code
        .chunks_exact(2)
        .enumerate()
        .map(|(vpc, word)| {
            Opcode::from_u8(word[0])
                .map(|opcode| Instruction { opcode, arg: word[1] })
                .ok_or(DecodeError::InvalidOpcode { byte: word[0], vpc })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(last) = instrs.last() {
        if last.opcode == Opcode::ExtendedArg {
            return Err(DecodeError::DanglingPrefix(instrs.len() - 1));
        }
    }
    Ok(instrs)
}

/// Logical operand of the instruction at `vpc`, with every preceding
/// `EXTENDED_ARG` prefix folded in
pub fn folded_oparg(instrs: &[Instruction], vpc: usize) -> u32 {
    let mut oparg = instrs[vpc].arg as u32;
    let mut shift = 0;
    let mut cursor = vpc;
    while cursor > 0 && instrs[cursor - 1].opcode == Opcode::ExtendedArg {
        cursor -= 1;
        shift += EXTENDED_ARG_SHIFT;
        oparg |= (instrs[cursor].arg as u32) << shift;
    }
    oparg
}

/// Index of the first prefix of the chain ending at `vpc` (`vpc` itself when
/// it has no prefix)
pub fn prefix_start(instrs: &[Instruction], vpc: usize) -> usize {
    let mut cursor = vpc;
    while cursor > 0 && instrs[cursor - 1].opcode == Opcode::ExtendedArg {
        cursor -= 1;
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(code: &mut Vec<u8>, op: Opcode, arg: u8) {
        code.push(op.to_u8());
        code.push(arg);
    }

    #[test]
    fn test_decode_simple() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadConst, 0);
        emit(&mut code, Opcode::ReturnValue, 0);

        let instrs = decode(&code).unwrap();
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0], Instruction { opcode: Opcode::LoadConst, arg: 0 });
        assert_eq!(instrs[1].opcode, Opcode::ReturnValue);
    }

    #[test]
    fn test_decode_invalid_opcode() {
        let code = vec![Opcode::Nop.to_u8(), 0, 0xFF, 0];
        match decode(&code) {
            Err(DecodeError::InvalidOpcode { byte, vpc }) => {
                assert_eq!(byte, 0xFF);
                assert_eq!(vpc, 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_odd_length() {
        assert!(matches!(decode(&[100, 0, 83]), Err(DecodeError::OddLength(3))));
    }

    #[test]
    fn test_decode_dangling_prefix() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::Nop, 0);
        emit(&mut code, Opcode::ExtendedArg, 1);
        assert!(matches!(decode(&code), Err(DecodeError::DanglingPrefix(1))));
    }

    #[test]
    fn test_fold_extended_arg_chain() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::ExtendedArg, 0x01);
        emit(&mut code, Opcode::ExtendedArg, 0x02);
        emit(&mut code, Opcode::JumpAbsolute, 0x03);
        let instrs = decode(&code).unwrap();

        assert_eq!(folded_oparg(&instrs, 2), 0x01_02_03);
        assert_eq!(folded_oparg(&instrs, 1), 0x01_02);
        assert_eq!(prefix_start(&instrs, 2), 0);
        assert_eq!(prefix_start(&instrs, 0), 0);
    }

    #[test]
    fn test_fold_without_prefix() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 7);
        let instrs = decode(&code).unwrap();
        assert_eq!(folded_oparg(&instrs, 0), 7);
        assert_eq!(prefix_start(&instrs, 0), 0);
    }
}
