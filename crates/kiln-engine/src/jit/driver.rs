//! Compilation driver
//!
//! Chains: cache lookup → decode → validate → block graph → dataflow →
//! emit → backend → artifact → cache store. The unit's cache file stays
//! locked from the lookup until the store, so a concurrent compile of the
//! same unit in another process waits for this one.

use std::sync::Arc;

use crate::bytecode::{decode, validate, CodeUnit};
use crate::jit::analysis::{analyze, Analysis};
use crate::jit::backend::{default_backend, CodegenBackend, CodegenError, CompiledCode};
use crate::jit::cache::ArtifactCache;
use crate::jit::config::JitConfig;
use crate::jit::emit::{emit, EmitOutput};
use crate::jit::runtime::{global_arena, CompiledArtifact, ExecMemoryArena, StackHeights};
use crate::jit::JitError;

/// Result of compiling one unit from scratch
pub struct Translation {
    pub analysis: Analysis,
    pub emitted: EmitOutput,
    pub code: CompiledCode,
    pub artifact: CompiledArtifact,
}

/// An artifact and where it came from
pub struct CompileOutcome {
    pub artifact: CompiledArtifact,
    pub from_cache: bool,
}

/// Drives units through the compilation pipeline
pub struct CompilationDriver {
    backend: Box<dyn CodegenBackend>,
    arena: Arc<ExecMemoryArena>,
    config: JitConfig,
}

impl CompilationDriver {
    /// Driver with the best available backend and the process-wide arena
    pub fn new(config: JitConfig) -> Result<Self, JitError> {
        Ok(Self::with_backend(default_backend()?, Arc::clone(global_arena()), config))
    }

    /// Driver with an explicit backend and arena
    pub fn with_backend(
        backend: Box<dyn CodegenBackend>,
        arena: Arc<ExecMemoryArena>,
        config: JitConfig,
    ) -> Self {
        CompilationDriver { backend, arena, config }
    }

    pub fn backend(&self) -> &dyn CodegenBackend {
        self.backend.as_ref()
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Compile `unit`, reusing a cached artifact when one matches
    pub fn compile(&self, unit: &CodeUnit) -> Result<CompileOutcome, JitError> {
        let mut cache = ArtifactCache::open(self.config.cache_root(), unit);
        if let Some(artifact) = cache.load(&self.arena) {
            log::debug!("{}: cache hit, {} bytes", unit.name, artifact.code().len());
            return Ok(CompileOutcome { artifact, from_cache: true });
        }
        if cache.is_enabled() {
            log::debug!("{}: cache miss", unit.name);
        }

        let translation = self.translate(unit)?;
        if let Err(e) = cache.store(&translation.artifact) {
            log::warn!("{}: failed to store artifact: {}", unit.name, e);
        }
        Ok(CompileOutcome { artifact: translation.artifact, from_cache: false })
    }

    /// Compile `unit` without consulting the cache
    pub fn translate(&self, unit: &CodeUnit) -> Result<Translation, JitError> {
        let instrs = decode(&unit.code)?;
        validate(unit, &instrs)?;
        let analysis = analyze(unit, &instrs)?;
        let emitted = emit(unit, &instrs, &analysis, self.config.emit_options())?;
        let code = self.backend.compile_function(&emitted.function)?;

        if code.entry_offset != 0 {
            return Err(CodegenError::UnsupportedOperation(format!(
                "{} backend placed the entry at offset {}",
                self.backend.name(),
                code.entry_offset
            ))
            .into());
        }
        if code.handler_pcs.len() != emitted.handlers.len() {
            return Err(JitError::Contract(format!(
                "{}: {} handlers emitted but the backend reported {}",
                unit.name,
                emitted.handlers.len(),
                code.handler_pcs.len()
            )));
        }

        let handler_vpcs = emitted.handlers.iter().map(|h| h.vpc).collect();
        let heights = StackHeights::for_capacity(unit.stacksize, &emitted.stack_heights);
        let artifact = CompiledArtifact::new(
            &self.arena,
            &code.code,
            handler_vpcs,
            code.handler_pcs.clone(),
            heights,
            emitted.opcache_num as usize,
        )?;
        log::debug!(
            "{}: {} bytes of code via {}, {} handlers",
            unit.name,
            artifact.code().len(),
            self.backend.name(),
            artifact.handler_num()
        );

        Ok(Translation { analysis, emitted, code, artifact })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
    use crate::jit::backend::StubBackend;

    fn emit_op(code: &mut Vec<u8>, op: Opcode, arg: u8) {
        code.push(op.to_u8());
        code.push(arg);
    }

    fn stub_driver() -> CompilationDriver {
        let config = JitConfig { cache_root: None, ..JitConfig::default() };
        CompilationDriver::with_backend(Box::new(StubBackend), ExecMemoryArena::new(), config)
    }

    #[test]
    fn test_translate_loop() {
        let mut code = Vec::new();
        emit_op(&mut code, Opcode::LoadFast, 0);
        emit_op(&mut code, Opcode::GetIter, 0);
        emit_op(&mut code, Opcode::ForIter, 2);
        emit_op(&mut code, Opcode::StoreFast, 1);
        emit_op(&mut code, Opcode::JumpAbsolute, 2);
        emit_op(&mut code, Opcode::LoadConst, 0);
        emit_op(&mut code, Opcode::ReturnValue, 0);
        let mut unit = CodeUnit::new("loop", code, 2, 2);
        unit.argcount = 1;

        let t = stub_driver().translate(&unit).unwrap();
        assert_eq!(t.artifact.handler_vpcs(), &[2]);
        assert_eq!(t.artifact.calc_pc(2), Some(t.code.handler_pcs[0]));
        assert_eq!(t.artifact.stack_height(3), Some(2));
        assert_eq!(t.artifact.code(), t.code.code.as_slice());
    }

    #[test]
    fn test_invalid_unit_rejected() {
        let mut code = Vec::new();
        emit_op(&mut code, Opcode::LoadFast, 5);
        emit_op(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("bad", code, 1, 1);
        assert!(matches!(stub_driver().translate(&unit), Err(JitError::Invalid(_))));
    }

    #[test]
    fn test_compile_without_cache_root() {
        let mut code = Vec::new();
        emit_op(&mut code, Opcode::LoadConst, 0);
        emit_op(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("f", code, 0, 1);

        let outcome = stub_driver().compile(&unit).unwrap();
        assert!(!outcome.from_cache);
        assert_eq!(outcome.artifact.opcache_num(), 0);
    }
}
