//! Code generation backends

pub mod traits;
pub mod stub;
#[cfg(feature = "native")]
pub mod cranelift;

pub use traits::{CodegenBackend, CodegenError, CompiledCode, TargetArch, TargetInfo};
pub use stub::StubBackend;
#[cfg(feature = "native")]
pub use self::cranelift::CraneliftBackend;

/// The best backend available in this build: Cranelift with the `native`
/// feature, the stub otherwise
pub fn default_backend() -> Result<Box<dyn CodegenBackend>, CodegenError> {
    #[cfg(feature = "native")]
    {
        Ok(Box::new(CraneliftBackend::host()?))
    }

    #[cfg(not(feature = "native"))]
    {
        Ok(Box::new(StubBackend))
    }
}
