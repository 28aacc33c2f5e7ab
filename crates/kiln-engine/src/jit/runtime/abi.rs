//! Host ABI
//!
//! Layout of the host structures compiled code touches directly, for a
//! 64-bit CPython 3.10 build. Everything else goes through helper calls.
//!
//! Compiled code has the signature
//! `extern "C" fn(symbols, frame, cframe, eval_breaker) -> *mut PyObject`:
//! `symbols` is the table described by `symbol_names()`, `frame` the
//! executing frame object, `cframe` a [`JitCFrame`] linked into the thread
//! state and `eval_breaker` the interpreter's pending-work flag.

use std::ffi::c_void;
use std::mem::offset_of;

/// Signature of an emitted unit's entry point
pub type JitEntryFn = unsafe extern "C" fn(
    symbols: *const *const c_void,
    frame: *mut c_void,
    cframe: *mut JitCFrame,
    eval_breaker: *const i32,
) -> *mut c_void;

/// `PyObject`
pub mod object {
    pub const OB_REFCNT: i32 = 0;
    pub const OB_TYPE: i32 = 8;
}

/// `PyFrameObject`
pub mod frame {
    pub const F_CODE: i32 = 32;
    pub const F_VALUESTACK: i32 = 64;
    /// `int`
    pub const F_STACKDEPTH: i32 = 80;
    /// `int`
    pub const F_LASTI: i32 = 96;
    /// `PyFrameState`, a signed char
    pub const F_STATE: i32 = 108;
    pub const F_LOCALSPLUS: i32 = 352;
}

/// `PyCodeObject`
pub mod code {
    pub const CO_CONSTS: i32 = 56;
    pub const CO_NAMES: i32 = 64;
}

/// `PyTupleObject`
pub mod tuple {
    pub const OB_ITEM: i32 = 24;
}

/// `PyTypeObject`
pub mod type_object {
    pub const TP_DEALLOC: i32 = 48;
    /// `unsigned long`
    pub const TP_FLAGS: i32 = 168;
    pub const TP_ITERNEXT: i32 = 224;
}

/// `PyCellObject`
pub mod cell {
    pub const OB_REF: i32 = 16;
}

/// Size of a pointer-sized slot
pub const WORD: i32 = 8;

/// One inline-cache entry (`_PyOpcache`): a 24-byte union followed by the
/// `optimized` counter
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Opcache {
    pub payload: [u64; 3],
    pub optimized: i8,
}

impl Opcache {
    /// An entry nothing has been cached in yet
    pub const EMPTY: Opcache = Opcache { payload: [0; 3], optimized: 0 };
}

impl Default for Opcache {
    fn default() -> Self {
        Opcache::EMPTY
    }
}

/// The host's `CFrame` extended with what compiled code reads on entry
#[repr(C)]
#[derive(Debug)]
pub struct JitCFrame {
    pub use_tracing: i32,
    pub previous: *mut c_void,
    /// First entry of the unit's inline-cache pool
    pub opcache: *mut Opcache,
    /// Resume key: zero for a fresh call, a handler pc otherwise
    pub handler: i64,
}

/// Offsets into [`JitCFrame`]
pub mod cframe {
    use super::*;

    pub const OPCACHE: i32 = offset_of!(JitCFrame, opcache) as i32;
    pub const HANDLER: i32 = offset_of!(JitCFrame, handler) as i32;
}

pub const OPCACHE_ENTRY_SIZE: i32 = std::mem::size_of::<Opcache>() as i32;
