//! Cranelift code generation backend
//!
//! Implements `CodegenBackend` using Cranelift to produce real native code
//! from emitter IR. Supports x86_64 and AArch64 targets. The generated code
//! is position independent and carries no relocations: every external
//! address is read from the symbol table passed on entry.

pub mod abi;
pub mod lowering;

use std::sync::Arc;
use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{ir, Context};
use cranelift_frontend::FunctionBuilderContext;
use target_lexicon::Architecture;

use crate::jit::backend::traits::*;
use crate::jit::emit::IrFunction;
use self::lowering::LoweringContext;

/// Cranelift-based code generation backend
pub struct CraneliftBackend {
    /// The target ISA (instruction set architecture)
    isa: Arc<dyn TargetIsa>,
}

impl CraneliftBackend {
    /// Create a backend targeting the host machine
    pub fn host() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder.set("opt_level", "speed").map_err(|e|
            CodegenError::BackendError(format!("Failed to set opt_level: {}", e))
        )?;
        flag_builder.set("is_pic", "true").map_err(|e|
            CodegenError::BackendError(format!("Failed to set is_pic: {}", e))
        )?;

        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| CodegenError::BackendError(format!("Failed to create native ISA builder: {}", e)))?
            .finish(flags)
            .map_err(|e| CodegenError::BackendError(format!("Failed to finish ISA: {}", e)))?;

        Ok(CraneliftBackend { isa })
    }

    /// Create a backend with a specific ISA
    pub fn with_isa(isa: Arc<dyn TargetIsa>) -> Self {
        CraneliftBackend { isa }
    }
}

impl CodegenBackend for CraneliftBackend {
    fn name(&self) -> &str {
        "cranelift"
    }

    fn compile_function(&self, func: &IrFunction) -> Result<CompiledCode, CodegenError> {
        let mut codegen_ctx = Context::new();
        let mut func_builder_ctx = FunctionBuilderContext::new();

        let call_conv = self.isa.default_call_conv();
        codegen_ctx.func.signature = abi::entry_signature(call_conv);
        codegen_ctx.func.name = ir::UserFuncName::user(0, 0);

        let handler_pcs = {
            let builder = cranelift_frontend::FunctionBuilder::new(
                &mut codegen_ctx.func,
                &mut func_builder_ctx,
            );

            // lower() takes ownership of builder (finalize() consumes it)
            LoweringContext::lower(func, builder, call_conv)
                .map_err(|e| CodegenError::Lowering(e.to_string()))?
        };

        let mut ctrl_plane = ControlPlane::default();
        let code = codegen_ctx
            .compile(&*self.isa, &mut ctrl_plane)
            .map_err(|e| {
                CodegenError::BackendError(format!("Cranelift compilation failed: {:?}", e))
            })?;

        let code_bytes = code.code_buffer().to_vec();
        log::trace!("{}: {} bytes of native code", func.name, code_bytes.len());

        Ok(CompiledCode {
            code: code_bytes,
            entry_offset: 0,
            handler_pcs,
        })
    }

    fn target_info(&self) -> TargetInfo {
        let arch = match self.isa.triple().architecture {
            Architecture::Aarch64(_) => TargetArch::AArch64,
            _ => TargetArch::X86_64,
        };
        TargetInfo {
            arch,
            pointer_size: self.isa.pointer_bytes() as usize,
        }
    }
}
