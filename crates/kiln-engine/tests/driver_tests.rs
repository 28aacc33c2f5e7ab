//! End-to-end compilation through the driver

mod common;

use common::*;
use kiln_engine::jit::emit::{Helper, IrOp};
use kiln_engine::jit::runtime::StackHeights;
use kiln_engine::{CodeUnit, JitError, Opcode};

#[test]
fn test_return_constant() {
    let unit = return_constant("f");
    let t = stub_driver(None).translate(&unit).unwrap();

    assert_eq!(t.artifact.handler_num(), 0);
    assert_eq!(t.artifact.stack_heights(), &StackHeights::U8(vec![0, 1]));
    assert_eq!(t.artifact.resume_key(-1), Some(0));

    // The constant is loaded, its reference taken once, and returned
    let incref = t.emitted.function.ops().filter(|op| matches!(op, IrOp::IncRef { .. })).count();
    assert_eq!(incref, 1);
    assert_eq!(t.analysis.redundant_loads.count(), 0);
}

#[test]
fn test_copy_through_local() {
    let mut code = Vec::new();
    emit(&mut code, Opcode::LoadFast, 0);
    emit(&mut code, Opcode::StoreFast, 1);
    emit(&mut code, Opcode::LoadFast, 1);
    emit(&mut code, Opcode::ReturnValue, 0);
    let mut unit = CodeUnit::new("copy", code, 2, 1);
    unit.argcount = 1;

    let t = stub_driver(None).translate(&unit).unwrap();
    assert!(t.analysis.redundant_loads.get(0));
    assert_eq!(t.artifact.stack_heights(), &StackHeights::U8(vec![0, 0, 0, 1]));
}

#[test]
fn test_loop_resume_table() {
    let unit = simple_loop();
    let t = stub_driver(None).translate(&unit).unwrap();

    assert_eq!(t.artifact.handler_vpcs(), &[2]);
    // A frame that last executed the GET_ITER resumes at the loop header
    assert_eq!(t.artifact.resume_key(1), Some(t.code.handler_pcs[0]));
    assert_eq!(t.artifact.resume_key(3), None);
}

#[test]
fn test_generator_resumes_after_yield() {
    let unit = generator();
    let t = stub_driver(None).translate(&unit).unwrap();

    assert_eq!(t.artifact.handler_vpcs(), &[3]);
    assert_eq!(t.artifact.resume_key(2), t.artifact.calc_pc(3));
    assert_eq!(t.artifact.stack_height(0), Some(1));
}

#[test]
fn test_inline_cache_slots() {
    let mut code = Vec::new();
    emit(&mut code, Opcode::LoadGlobal, 0);
    emit(&mut code, Opcode::LoadAttr, 1);
    emit(&mut code, Opcode::LoadGlobal, 0);
    emit(&mut code, Opcode::BinaryAdd, 0);
    emit(&mut code, Opcode::ReturnValue, 0);
    let unit = CodeUnit::new("caches", code, 0, 2);

    let t = stub_driver(None).translate(&unit).unwrap();
    assert_eq!(t.artifact.opcache_num(), 3);
    assert!(t.artifact.opcache().iter().all(|c| c.optimized == 0));
    let adds = t
        .emitted
        .function
        .ops()
        .filter(|op| matches!(op, IrOp::Call { helper: Helper::BinaryAdd, .. }))
        .count();
    assert_eq!(adds, 1);
}

#[test]
fn test_wide_stack_heights() {
    let mut unit = return_constant("wide");
    unit.stacksize = 300;
    let t = stub_driver(None).translate(&unit).unwrap();
    assert_eq!(t.artifact.stack_heights(), &StackHeights::U16(vec![0, 1]));
}

#[test]
fn test_malformed_units_fail() {
    let driver = stub_driver(None);

    let odd = CodeUnit::new("odd", vec![100, 0, 83], 0, 1);
    assert!(matches!(driver.translate(&odd), Err(JitError::Decode(_))));

    let mut code = Vec::new();
    emit(&mut code, Opcode::JumpAbsolute, 9);
    let jump = CodeUnit::new("jump", code, 0, 1);
    assert!(matches!(driver.translate(&jump), Err(JitError::Graph(_))));

    let mut code = Vec::new();
    emit(&mut code, Opcode::LoadFast, 3);
    emit(&mut code, Opcode::ReturnValue, 0);
    let local = CodeUnit::new("local", code, 1, 1);
    assert!(matches!(driver.translate(&local), Err(JitError::Invalid(_))));
}

#[cfg(feature = "native")]
mod native {
    use super::*;
    use kiln_engine::jit::backend::CraneliftBackend;
    use kiln_engine::jit::runtime::ExecMemoryArena;
    use kiln_engine::{CompilationDriver, JitConfig};

    fn native_driver() -> CompilationDriver {
        let config = JitConfig { cache_root: None, ..JitConfig::default() };
        CompilationDriver::with_backend(
            Box::new(CraneliftBackend::host().unwrap()),
            ExecMemoryArena::new(),
            config,
        )
    }

    #[test]
    fn test_native_loop() {
        let t = native_driver().translate(&simple_loop()).unwrap();
        assert_eq!(t.artifact.handler_pcs(), &[1]);
        assert!(t.artifact.code().len() > 16);
    }

    #[test]
    fn test_native_generator() {
        let t = native_driver().translate(&generator()).unwrap();
        assert_eq!(t.artifact.calc_pc(3), Some(1));
    }
}
