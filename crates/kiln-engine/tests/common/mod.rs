//! Shared unit builders for integration tests

#![allow(dead_code)]

use std::path::Path;

use kiln_engine::jit::backend::StubBackend;
use kiln_engine::jit::runtime::ExecMemoryArena;
use kiln_engine::{CodeFlags, CodeUnit, CompilationDriver, JitConfig, Opcode};

pub fn emit(code: &mut Vec<u8>, op: Opcode, arg: u8) {
    code.push(op.to_u8());
    code.push(arg);
}

/// Driver over the stub backend with a private arena
pub fn stub_driver(cache_root: Option<&Path>) -> CompilationDriver {
    let config = JitConfig {
        cache_root: cache_root.map(Path::to_path_buf),
        ..JitConfig::default()
    };
    CompilationDriver::with_backend(Box::new(StubBackend), ExecMemoryArena::new(), config)
}

/// `LOAD_CONST 0; RETURN_VALUE`
pub fn return_constant(name: &str) -> CodeUnit {
    let mut code = Vec::new();
    emit(&mut code, Opcode::LoadConst, 0);
    emit(&mut code, Opcode::ReturnValue, 0);
    let mut unit = CodeUnit::new(name, code, 0, 1);
    unit.consts = vec!["None".into()];
    unit
}

/// `for x in arg: y = x` followed by `return None`
pub fn simple_loop() -> CodeUnit {
    let mut code = Vec::new();
    emit(&mut code, Opcode::LoadFast, 0); // 0
    emit(&mut code, Opcode::GetIter, 0); // 1
    emit(&mut code, Opcode::ForIter, 2); // 2 -> 5
    emit(&mut code, Opcode::StoreFast, 1); // 3
    emit(&mut code, Opcode::JumpAbsolute, 2); // 4
    emit(&mut code, Opcode::LoadConst, 0); // 5
    emit(&mut code, Opcode::ReturnValue, 0); // 6
    let mut unit = CodeUnit::new("loop", code, 2, 2);
    unit.argcount = 1;
    unit.varnames = vec!["items".into(), "x".into()];
    unit
}

/// A generator yielding one constant
pub fn generator() -> CodeUnit {
    let mut code = Vec::new();
    emit(&mut code, Opcode::GenStart, 0); // 0
    emit(&mut code, Opcode::LoadConst, 0); // 1
    emit(&mut code, Opcode::YieldValue, 0); // 2
    emit(&mut code, Opcode::PopTop, 0); // 3
    emit(&mut code, Opcode::LoadConst, 0); // 4
    emit(&mut code, Opcode::ReturnValue, 0); // 5
    let mut unit = CodeUnit::new("gen", code, 0, 2);
    unit.flags = CodeFlags(CodeFlags::GENERATOR);
    unit
}

/// Write a source file for `unit` under `dir` and point the unit at it
pub fn with_source(mut unit: CodeUnit, dir: &Path, file: &str) -> CodeUnit {
    let source = dir.join(file);
    if let Some(parent) = source.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    if !source.exists() {
        std::fs::write(&source, "pass\n").unwrap();
    }
    unit.filename = source.to_string_lossy().into_owned();
    unit
}
