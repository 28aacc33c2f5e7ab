//! Bytecode opcodes
//!
//! The instruction set is the 3.10 generation of the reference interpreter's
//! wordcode: every instruction is two bytes, `(opcode, oparg)`, and opcodes at
//! or above [`HAVE_ARGUMENT`] use their argument byte. Wider arguments are
//! built from a chain of [`Opcode::ExtendedArg`] prefixes.

/// First opcode whose argument byte is meaningful
pub const HAVE_ARGUMENT: u8 = 90;

/// Bits contributed by each `EXTENDED_ARG` prefix
pub const EXTENDED_ARG_SHIFT: u32 = 8;

/// Mask selecting the conversion part of a `FORMAT_VALUE` argument
pub const FVC_MASK: u32 = 0x3;

/// Mask selecting the "has format spec" part of a `FORMAT_VALUE` argument
pub const FVS_MASK: u32 = 0x4;

/// `FORMAT_VALUE` flag: a format spec sits on top of the value
pub const FVS_HAVE_SPEC: u32 = 0x4;

macro_rules! opcodes {
    ($($(#[$doc:meta])* $variant:ident = $byte:literal => $name:literal,)*) => {
        /// Bytecode opcode enumeration
        ///
        /// Discriminants match the interpreter's opcode numbers so that a raw
        /// instruction stream can be read without translation.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($(#[$doc])* $variant = $byte,)*
        }

        impl Opcode {
            /// Convert byte to opcode
            ///
            /// Returns None if the byte does not correspond to a valid opcode.
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// Get the interpreter's name for the opcode
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            /// Every opcode, in numeric order
            pub const ALL: &'static [Opcode] = &[$(Self::$variant,)*];
        }
    };
}

opcodes! {
    // ===== Stack manipulation =====
    /// Discard TOS
    PopTop = 1 => "POP_TOP",
    /// Swap the two topmost items
    RotTwo = 2 => "ROT_TWO",
    /// Lift the second and third items one position up, TOS goes third
    RotThree = 3 => "ROT_THREE",
    /// Duplicate TOS
    DupTop = 4 => "DUP_TOP",
    /// Duplicate the two topmost items, keeping their order
    DupTopTwo = 5 => "DUP_TOP_TWO",
    /// Four-item rotation
    RotFour = 6 => "ROT_FOUR",
    /// Does nothing
    Nop = 9 => "NOP",

    // ===== Unary and binary operators =====
    UnaryPositive = 10 => "UNARY_POSITIVE",
    UnaryNegative = 11 => "UNARY_NEGATIVE",
    UnaryNot = 12 => "UNARY_NOT",
    UnaryInvert = 15 => "UNARY_INVERT",
    BinaryMatrixMultiply = 16 => "BINARY_MATRIX_MULTIPLY",
    InplaceMatrixMultiply = 17 => "INPLACE_MATRIX_MULTIPLY",
    BinaryPower = 19 => "BINARY_POWER",
    BinaryMultiply = 20 => "BINARY_MULTIPLY",
    BinaryModulo = 22 => "BINARY_MODULO",
    BinaryAdd = 23 => "BINARY_ADD",
    BinarySubtract = 24 => "BINARY_SUBTRACT",
    BinarySubscr = 25 => "BINARY_SUBSCR",
    BinaryFloorDivide = 26 => "BINARY_FLOOR_DIVIDE",
    BinaryTrueDivide = 27 => "BINARY_TRUE_DIVIDE",
    InplaceFloorDivide = 28 => "INPLACE_FLOOR_DIVIDE",
    InplaceTrueDivide = 29 => "INPLACE_TRUE_DIVIDE",

    // ===== Pattern matching =====
    GetLen = 30 => "GET_LEN",
    MatchMapping = 31 => "MATCH_MAPPING",
    MatchSequence = 32 => "MATCH_SEQUENCE",
    MatchKeys = 33 => "MATCH_KEYS",
    CopyDictWithoutKeys = 34 => "COPY_DICT_WITHOUT_KEYS",

    // ===== Context managers and async iteration =====
    WithExceptStart = 49 => "WITH_EXCEPT_START",
    GetAiter = 50 => "GET_AITER",
    GetAnext = 51 => "GET_ANEXT",
    BeforeAsyncWith = 52 => "BEFORE_ASYNC_WITH",
    EndAsyncFor = 54 => "END_ASYNC_FOR",

    InplaceAdd = 55 => "INPLACE_ADD",
    InplaceSubtract = 56 => "INPLACE_SUBTRACT",
    InplaceMultiply = 57 => "INPLACE_MULTIPLY",
    InplaceModulo = 59 => "INPLACE_MODULO",
    StoreSubscr = 60 => "STORE_SUBSCR",
    DeleteSubscr = 61 => "DELETE_SUBSCR",
    BinaryLshift = 62 => "BINARY_LSHIFT",
    BinaryRshift = 63 => "BINARY_RSHIFT",
    BinaryAnd = 64 => "BINARY_AND",
    BinaryXor = 65 => "BINARY_XOR",
    BinaryOr = 66 => "BINARY_OR",
    InplacePower = 67 => "INPLACE_POWER",
    GetIter = 68 => "GET_ITER",
    GetYieldFromIter = 69 => "GET_YIELD_FROM_ITER",
    PrintExpr = 70 => "PRINT_EXPR",
    LoadBuildClass = 71 => "LOAD_BUILD_CLASS",
    /// Delegate to a sub-iterator; suspends the frame until it is exhausted
    YieldFrom = 72 => "YIELD_FROM",
    GetAwaitable = 73 => "GET_AWAITABLE",
    LoadAssertionError = 74 => "LOAD_ASSERTION_ERROR",
    InplaceLshift = 75 => "INPLACE_LSHIFT",
    InplaceRshift = 76 => "INPLACE_RSHIFT",
    InplaceAnd = 77 => "INPLACE_AND",
    InplaceXor = 78 => "INPLACE_XOR",
    InplaceOr = 79 => "INPLACE_OR",
    ListToTuple = 82 => "LIST_TO_TUPLE",
    /// Return TOS to the caller
    ReturnValue = 83 => "RETURN_VALUE",
    ImportStar = 84 => "IMPORT_STAR",
    SetupAnnotations = 85 => "SETUP_ANNOTATIONS",
    /// Suspend the frame, producing TOS
    YieldValue = 86 => "YIELD_VALUE",
    /// Leave the innermost protected region
    PopBlock = 87 => "POP_BLOCK",
    PopExcept = 89 => "POP_EXCEPT",

    // ===== Opcodes with an argument =====
    StoreName = 90 => "STORE_NAME",
    DeleteName = 91 => "DELETE_NAME",
    UnpackSequence = 92 => "UNPACK_SEQUENCE",
    /// Advance the iterator at TOS; jump forward by oparg when exhausted
    ForIter = 93 => "FOR_ITER",
    UnpackEx = 94 => "UNPACK_EX",
    StoreAttr = 95 => "STORE_ATTR",
    DeleteAttr = 96 => "DELETE_ATTR",
    StoreGlobal = 97 => "STORE_GLOBAL",
    DeleteGlobal = 98 => "DELETE_GLOBAL",
    RotN = 99 => "ROT_N",
    LoadConst = 100 => "LOAD_CONST",
    LoadName = 101 => "LOAD_NAME",
    BuildTuple = 102 => "BUILD_TUPLE",
    BuildList = 103 => "BUILD_LIST",
    BuildSet = 104 => "BUILD_SET",
    BuildMap = 105 => "BUILD_MAP",
    LoadAttr = 106 => "LOAD_ATTR",
    CompareOp = 107 => "COMPARE_OP",
    ImportName = 108 => "IMPORT_NAME",
    ImportFrom = 109 => "IMPORT_FROM",
    JumpForward = 110 => "JUMP_FORWARD",
    JumpIfFalseOrPop = 111 => "JUMP_IF_FALSE_OR_POP",
    JumpIfTrueOrPop = 112 => "JUMP_IF_TRUE_OR_POP",
    JumpAbsolute = 113 => "JUMP_ABSOLUTE",
    PopJumpIfFalse = 114 => "POP_JUMP_IF_FALSE",
    PopJumpIfTrue = 115 => "POP_JUMP_IF_TRUE",
    LoadGlobal = 116 => "LOAD_GLOBAL",
    IsOp = 117 => "IS_OP",
    ContainsOp = 118 => "CONTAINS_OP",
    Reraise = 119 => "RERAISE",
    JumpIfNotExcMatch = 121 => "JUMP_IF_NOT_EXC_MATCH",
    /// Enter a protected region whose handler is oparg instructions ahead
    SetupFinally = 122 => "SETUP_FINALLY",
    LoadFast = 124 => "LOAD_FAST",
    StoreFast = 125 => "STORE_FAST",
    DeleteFast = 126 => "DELETE_FAST",
    GenStart = 129 => "GEN_START",
    RaiseVarargs = 130 => "RAISE_VARARGS",
    CallFunction = 131 => "CALL_FUNCTION",
    MakeFunction = 132 => "MAKE_FUNCTION",
    BuildSlice = 133 => "BUILD_SLICE",
    LoadClosure = 135 => "LOAD_CLOSURE",
    LoadDeref = 136 => "LOAD_DEREF",
    StoreDeref = 137 => "STORE_DEREF",
    DeleteDeref = 138 => "DELETE_DEREF",
    CallFunctionKw = 141 => "CALL_FUNCTION_KW",
    CallFunctionEx = 142 => "CALL_FUNCTION_EX",
    SetupWith = 143 => "SETUP_WITH",
    /// Prefix contributing the high bits of the next instruction's argument
    ExtendedArg = 144 => "EXTENDED_ARG",
    ListAppend = 145 => "LIST_APPEND",
    SetAdd = 146 => "SET_ADD",
    MapAdd = 147 => "MAP_ADD",
    LoadClassderef = 148 => "LOAD_CLASSDEREF",
    MatchClass = 152 => "MATCH_CLASS",
    SetupAsyncWith = 154 => "SETUP_ASYNC_WITH",
    FormatValue = 155 => "FORMAT_VALUE",
    BuildConstKeyMap = 156 => "BUILD_CONST_KEY_MAP",
    BuildString = 157 => "BUILD_STRING",
    LoadMethod = 160 => "LOAD_METHOD",
    CallMethod = 161 => "CALL_METHOD",
    ListExtend = 162 => "LIST_EXTEND",
    SetUpdate = 163 => "SET_UPDATE",
    DictMerge = 164 => "DICT_MERGE",
    DictUpdate = 165 => "DICT_UPDATE",
}

impl Opcode {
    /// Convert opcode to byte
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if the argument byte of this opcode is meaningful
    pub fn has_argument(self) -> bool {
        self.to_u8() >= HAVE_ARGUMENT
    }

    /// Check if control never falls through to the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::ReturnValue
                | Self::Reraise
                | Self::RaiseVarargs
                | Self::JumpAbsolute
                | Self::JumpForward
        )
    }

    /// Check if the argument is an absolute jump target
    pub fn is_absolute_jump(self) -> bool {
        matches!(
            self,
            Self::PopJumpIfTrue
                | Self::PopJumpIfFalse
                | Self::JumpIfTrueOrPop
                | Self::JumpIfFalseOrPop
                | Self::JumpIfNotExcMatch
                | Self::JumpAbsolute
        )
    }

    /// Check if the argument is a jump delta relative to the next instruction
    pub fn is_relative_jump(self) -> bool {
        matches!(self, Self::ForIter | Self::JumpForward)
    }

    /// Check if this opcode enters a protected region
    pub fn is_try_setup(self) -> bool {
        matches!(self, Self::SetupFinally | Self::SetupWith | Self::SetupAsyncWith)
    }

    /// Check if this opcode calls a callable
    pub fn is_call(self) -> bool {
        matches!(
            self,
            Self::CallFunction | Self::CallMethod | Self::CallFunctionKw | Self::CallFunctionEx
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op.to_u8()), Some(op), "{}", op);
        }
    }

    #[test]
    fn test_unassigned_bytes() {
        for byte in [0u8, 7, 8, 13, 14, 18, 21, 35, 48, 53, 58, 80, 81, 88, 120, 123, 127, 255] {
            assert_eq!(Opcode::from_u8(byte), None, "byte {}", byte);
        }
    }

    #[test]
    fn test_well_known_numbers() {
        assert_eq!(Opcode::LoadConst.to_u8(), 100);
        assert_eq!(Opcode::ReturnValue.to_u8(), 83);
        assert_eq!(Opcode::ExtendedArg.to_u8(), 144);
        assert_eq!(Opcode::LoadFast.name(), "LOAD_FAST");
    }

    #[test]
    fn test_classification() {
        assert!(Opcode::JumpForward.is_terminator());
        assert!(Opcode::JumpForward.is_relative_jump());
        assert!(!Opcode::JumpForward.is_absolute_jump());
        assert!(Opcode::ForIter.is_relative_jump());
        assert!(!Opcode::ForIter.is_terminator());
        assert!(Opcode::SetupWith.is_try_setup());
        assert!(Opcode::JumpIfNotExcMatch.is_absolute_jump());
        assert!(Opcode::StoreName.has_argument());
        assert!(!Opcode::PopExcept.has_argument());
    }
}
