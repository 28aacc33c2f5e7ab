//! Signatures and host offsets for Cranelift IR generation

use cranelift_codegen::ir::{self, types, AbiParam};
use cranelift_codegen::isa::CallConv;

use crate::jit::emit::{Failure, Field, Helper};
use crate::jit::runtime::abi::{cell, object, type_object};

/// Entry signature: `(symbols, frame, cframe, eval_breaker) -> object`
pub fn entry_signature(call_conv: CallConv) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // symbols
    sig.params.push(AbiParam::new(types::I64)); // frame
    sig.params.push(AbiParam::new(types::I64)); // cframe
    sig.params.push(AbiParam::new(types::I64)); // eval_breaker
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

/// Signature of a runtime helper. Status helpers return a C `int`
pub fn helper_signature(call_conv: CallConv, helper: Helper) -> ir::Signature {
    let mut sig = word_params(call_conv, helper.arity());
    match helper.failure() {
        Failure::NullObject => sig.returns.push(AbiParam::new(types::I64)),
        Failure::NegativeStatus => sig.returns.push(AbiParam::new(types::I32)),
        Failure::Never | Failure::Always => {}
    }
    sig
}

/// Signature of a slot function taking and returning object pointers
pub fn indirect_signature(call_conv: CallConv, arity: usize) -> ir::Signature {
    let mut sig = word_params(call_conv, arity);
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

/// `destructor`: `void (*)(PyObject *)`
pub fn dealloc_signature(call_conv: CallConv) -> ir::Signature {
    word_params(call_conv, 1)
}

fn word_params(call_conv: CallConv, arity: usize) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    sig.params.extend((0..arity).map(|_| AbiParam::new(types::I64)));
    sig
}

/// Byte offset of an object field from its base pointer
pub fn field_offset(field: Field) -> i32 {
    match field {
        Field::Pointee => 0,
        Field::ObType => object::OB_TYPE,
        Field::TypeFlags => type_object::TP_FLAGS,
        Field::TypeIternext => type_object::TP_ITERNEXT,
        Field::CellRef => cell::OB_REF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_signatures() {
        let cc = CallConv::SystemV;
        let sig = helper_signature(cc, Helper::LoadAttr);
        assert_eq!(sig.params.len(), 4);
        assert_eq!(sig.returns[0].value_type, types::I64);

        let sig = helper_signature(cc, Helper::ForIter);
        assert_eq!(sig.returns[0].value_type, types::I32);

        let sig = helper_signature(cc, Helper::BlockSetup);
        assert!(sig.returns.is_empty());
    }

    #[test]
    fn test_entry_signature() {
        let sig = entry_signature(CallConv::SystemV);
        assert_eq!(sig.params.len(), 4);
        assert_eq!(sig.returns.len(), 1);
    }
}
