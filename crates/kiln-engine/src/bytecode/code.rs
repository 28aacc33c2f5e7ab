//! Code unit model
//!
//! A [`CodeUnit`] is one compilable function body: the raw instruction bytes
//! plus the metadata the JIT consumes (argument layout, local count, stack
//! capacity, flags, source identity and the read-only name/constant tables).
//! Units are exchanged as JSON; the instruction bytes travel hex-encoded.

use serde::{Deserialize, Serialize};

use super::opcode::Opcode;

/// Code object flags, numerically identical to the interpreter's `CO_*` bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeFlags(pub u32);

impl CodeFlags {
    pub const OPTIMIZED: u32 = 0x0001;
    pub const NEWLOCALS: u32 = 0x0002;
    pub const VARARGS: u32 = 0x0004;
    pub const VARKEYWORDS: u32 = 0x0008;
    pub const NESTED: u32 = 0x0010;
    pub const GENERATOR: u32 = 0x0020;
    pub const NOFREE: u32 = 0x0040;
    pub const COROUTINE: u32 = 0x0080;
    pub const ITERABLE_COROUTINE: u32 = 0x0100;
    pub const ASYNC_GENERATOR: u32 = 0x0200;

    /// Check whether every bit of `mask` is set
    pub fn contains(self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    /// Check whether any bit of `mask` is set
    pub fn intersects(self, mask: u32) -> bool {
        self.0 & mask != 0
    }
}

/// One compilable function body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    /// Function name (`<module>`, `<lambda>`, `<listcomp>`, ...)
    pub name: String,
    /// Source file path as recorded by the compiler
    pub filename: String,
    /// First source line of the unit
    pub first_line: u32,
    /// Positional parameter count
    pub argcount: u32,
    /// Keyword-only parameter count
    #[serde(default)]
    pub kwonlyargcount: u32,
    /// Local variable slots, parameters included
    pub nlocals: u32,
    /// Declared evaluation stack capacity
    pub stacksize: u32,
    #[serde(default)]
    pub flags: CodeFlags,
    /// Raw wordcode
    #[serde(with = "hex_bytes")]
    pub code: Vec<u8>,
    /// Printable form of the constant table
    #[serde(default)]
    pub consts: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub varnames: Vec<String>,
    #[serde(default)]
    pub cellvars: Vec<String>,
    #[serde(default)]
    pub freevars: Vec<String>,
}

impl CodeUnit {
    /// Create a unit with no metadata besides the instruction bytes
    pub fn new(name: impl Into<String>, code: Vec<u8>, nlocals: u32, stacksize: u32) -> Self {
        CodeUnit {
            name: name.into(),
            filename: String::new(),
            first_line: 1,
            argcount: 0,
            kwonlyargcount: 0,
            nlocals,
            stacksize,
            flags: CodeFlags::default(),
            code,
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
        }
    }

    /// Parse a unit from its JSON description
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize the unit to pretty JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Number of two-byte instructions
    pub fn instr_num(&self) -> usize {
        self.code.len() / 2
    }

    /// Size of the instruction stream in bytes
    pub fn instr_size(&self) -> usize {
        self.code.len()
    }

    /// Raw opcode byte at `vpc`
    pub fn opcode_byte(&self, vpc: usize) -> u8 {
        self.code[vpc * 2]
    }

    /// Decoded opcode at `vpc`, if the byte is a known opcode
    pub fn opcode_at(&self, vpc: usize) -> Option<Opcode> {
        Opcode::from_u8(self.opcode_byte(vpc))
    }

    /// Local slots that are bound on entry: positional, `*args`, keyword-only
    /// and `**kwargs` parameters
    pub fn nargs(&self) -> usize {
        self.argcount as usize
            + self.flags.intersects(CodeFlags::VARARGS) as usize
            + self.kwonlyargcount as usize
            + self.flags.intersects(CodeFlags::VARKEYWORDS) as usize
    }

    /// Generators, coroutines and async generators start with a sentinel on
    /// the stack
    pub fn is_resumable(&self) -> bool {
        self.flags.intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR)
    }

    /// Cell and free variable slots that follow the locals in the frame
    pub fn ncells(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    /// Module bodies are named `<module>`
    pub fn is_module(&self) -> bool {
        self.name == "<module>"
    }

    /// Units synthesized with a `<...>` name other than `<module>` have no
    /// stable identity inside their source file
    pub fn is_anonymous(&self) -> bool {
        self.name.starts_with('<') && !self.is_module()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let compact: String = text.split_whitespace().collect();
        hex::decode(compact).map_err(serde::de::Error::custom)
    }
}
