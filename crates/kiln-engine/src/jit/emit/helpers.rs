//! Runtime symbol table shared by compiled code and the host
//!
//! Compiled code never embeds absolute addresses. Every singleton and helper
//! routine it needs is read from a table of pointers the host passes on
//! entry; the order of that table is fixed by [`DataSymbol::ALL`] followed by
//! [`Helper::ALL`].

use std::fmt;

use crate::bytecode::Opcode;

/// Global objects read through the symbol table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSymbol {
    /// Address of the `True` singleton
    True,
    /// Address of the `False` singleton
    False,
    /// Address of the variable holding the `AssertionError` type
    AssertionError,
}

impl DataSymbol {
    pub const ALL: [DataSymbol; 3] = [DataSymbol::True, DataSymbol::False, DataSymbol::AssertionError];

    pub fn name(self) -> &'static str {
        match self {
            DataSymbol::True => "_Py_TrueStruct",
            DataSymbol::False => "_Py_FalseStruct",
            DataSymbol::AssertionError => "PyExc_AssertionError",
        }
    }

    /// Position in the entry symbol table
    pub fn table_index(self) -> usize {
        self as usize
    }
}

/// How a helper reports failure to the compiled caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Returns nothing and cannot fail
    Never,
    /// Returns a new reference; null means an exception is set
    NullObject,
    /// Returns an integer status; negative means an exception is set
    NegativeStatus,
    /// Always leaves an exception set and returns nothing
    Always,
}

impl Failure {
    /// Whether the helper produces a value the caller can use
    pub fn has_result(self) -> bool {
        matches!(self, Failure::NullObject | Failure::NegativeStatus)
    }
}

macro_rules! runtime_helpers {
    ($( $variant:ident = $name:literal ($arity:literal) -> $failure:ident, )*) => {
        /// Semantic helper routines invoked by compiled code
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Helper {
            $( $variant, )*
        }

        impl Helper {
            pub const ALL: &'static [Helper] = &[$( Helper::$variant, )*];

            /// Exported symbol name of the routine
            pub fn name(self) -> &'static str {
                match self {
                    $( Helper::$variant => $name, )*
                }
            }

            /// Number of pointer-sized arguments
            pub fn arity(self) -> usize {
                match self {
                    $( Helper::$variant => $arity, )*
                }
            }

            pub fn failure(self) -> Failure {
                match self {
                    $( Helper::$variant => Failure::$failure, )*
                }
            }
        }
    };
}

runtime_helpers! {
    LoadClassderef = "handle_LOAD_CLASSDEREF" (2) -> NullObject,
    LoadGlobal = "handle_LOAD_GLOBAL" (3) -> NullObject,
    StoreGlobal = "handle_STORE_GLOBAL" (3) -> NegativeStatus,
    DeleteGlobal = "handle_DELETE_GLOBAL" (2) -> NegativeStatus,
    LoadName = "handle_LOAD_NAME" (2) -> NullObject,
    StoreName = "handle_STORE_NAME" (3) -> NegativeStatus,
    DeleteName = "handle_DELETE_NAME" (2) -> NegativeStatus,
    LoadAttr = "handle_LOAD_ATTR" (4) -> NullObject,
    LoadMethod = "handle_LOAD_METHOD" (2) -> NegativeStatus,
    StoreAttr = "handle_STORE_ATTR" (3) -> NegativeStatus,

    BinarySubscr = "handle_BINARY_SUBSCR" (2) -> NullObject,
    StoreSubscr = "handle_STORE_SUBSCR" (3) -> NegativeStatus,
    DeleteSubscr = "handle_DELETE_SUBSCR" (2) -> NegativeStatus,

    UnaryNot = "handle_UNARY_NOT" (1) -> NullObject,
    UnaryPositive = "handle_UNARY_POSITIVE" (1) -> NullObject,
    UnaryNegative = "handle_UNARY_NEGATIVE" (1) -> NullObject,
    UnaryInvert = "handle_UNARY_INVERT" (1) -> NullObject,

    BinaryAdd = "handle_BINARY_ADD" (2) -> NullObject,
    InplaceAdd = "handle_INPLACE_ADD" (2) -> NullObject,
    BinarySubtract = "handle_BINARY_SUBTRACT" (2) -> NullObject,
    InplaceSubtract = "handle_INPLACE_SUBTRACT" (2) -> NullObject,
    BinaryMultiply = "handle_BINARY_MULTIPLY" (2) -> NullObject,
    InplaceMultiply = "handle_INPLACE_MULTIPLY" (2) -> NullObject,
    BinaryFloorDivide = "handle_BINARY_FLOOR_DIVIDE" (2) -> NullObject,
    InplaceFloorDivide = "handle_INPLACE_FLOOR_DIVIDE" (2) -> NullObject,
    BinaryTrueDivide = "handle_BINARY_TRUE_DIVIDE" (2) -> NullObject,
    InplaceTrueDivide = "handle_INPLACE_TRUE_DIVIDE" (2) -> NullObject,
    BinaryModulo = "handle_BINARY_MODULO" (2) -> NullObject,
    InplaceModulo = "handle_INPLACE_MODULO" (2) -> NullObject,
    BinaryPower = "handle_BINARY_POWER" (2) -> NullObject,
    InplacePower = "handle_INPLACE_POWER" (2) -> NullObject,
    BinaryMatrixMultiply = "handle_BINARY_MATRIX_MULTIPLY" (2) -> NullObject,
    InplaceMatrixMultiply = "handle_INPLACE_MATRIX_MULTIPLY" (2) -> NullObject,
    BinaryLshift = "handle_BINARY_LSHIFT" (2) -> NullObject,
    InplaceLshift = "handle_INPLACE_LSHIFT" (2) -> NullObject,
    BinaryRshift = "handle_BINARY_RSHIFT" (2) -> NullObject,
    InplaceRshift = "handle_INPLACE_RSHIFT" (2) -> NullObject,
    BinaryAnd = "handle_BINARY_AND" (2) -> NullObject,
    InplaceAnd = "handle_INPLACE_AND" (2) -> NullObject,
    BinaryOr = "handle_BINARY_OR" (2) -> NullObject,
    InplaceOr = "handle_INPLACE_OR" (2) -> NullObject,
    BinaryXor = "handle_BINARY_XOR" (2) -> NullObject,
    InplaceXor = "handle_INPLACE_XOR" (2) -> NullObject,
    CompareOp = "handle_COMPARE_OP" (3) -> NullObject,
    ContainsOp = "handle_CONTAINS_OP" (3) -> NullObject,

    CallFunction = "handle_CALL_FUNCTION" (2) -> NullObject,
    CallMethod = "handle_CALL_METHOD" (2) -> NullObject,
    CallFunctionKw = "handle_CALL_FUNCTION_KW" (3) -> NullObject,
    CallFunctionEx = "handle_CALL_FUNCTION_EX" (3) -> NullObject,
    MakeFunction = "handle_MAKE_FUNCTION" (5) -> NullObject,
    LoadBuildClass = "handle_LOAD_BUILD_CLASS" (1) -> NullObject,

    ImportName = "handle_IMPORT_NAME" (4) -> NullObject,
    ImportFrom = "handle_IMPORT_FROM" (2) -> NullObject,
    ImportStar = "handle_IMPORT_STAR" (2) -> NegativeStatus,

    GetIter = "handle_GET_ITER" (1) -> NullObject,
    ForIter = "handle_FOR_ITER" (1) -> NegativeStatus,

    BuildString = "handle_BUILD_STRING" (2) -> NullObject,
    BuildTuple = "handle_BUILD_TUPLE" (2) -> NullObject,
    BuildList = "handle_BUILD_LIST" (2) -> NullObject,
    BuildSet = "handle_BUILD_SET" (2) -> NullObject,
    BuildMap = "handle_BUILD_MAP" (2) -> NullObject,
    BuildConstKeyMap = "handle_BUILD_CONST_KEY_MAP" (2) -> NullObject,
    ListAppend = "handle_LIST_APPEND" (2) -> NegativeStatus,
    SetAdd = "handle_SET_ADD" (2) -> NegativeStatus,
    MapAdd = "handle_MAP_ADD" (3) -> NegativeStatus,
    ListExtend = "handle_LIST_EXTEND" (2) -> NegativeStatus,
    SetUpdate = "handle_SET_UPDATE" (2) -> NegativeStatus,
    DictUpdate = "handle_DICT_UPDATE" (2) -> NegativeStatus,
    DictMerge = "handle_DICT_MERGE" (3) -> NegativeStatus,
    ListToTuple = "handle_LIST_TO_TUPLE" (1) -> NullObject,
    FormatValue = "handle_FORMAT_VALUE" (3) -> NullObject,
    BuildSlice = "handle_BUILD_SLICE" (3) -> NullObject,

    SetupAnnotations = "handle_SETUP_ANNOTATIONS" (1) -> NegativeStatus,
    PrintExpr = "handle_PRINT_EXPR" (1) -> NegativeStatus,
    UnpackSequence = "handle_UNPACK_SEQUENCE" (3) -> NegativeStatus,
    UnpackEx = "handle_UNPACK_EX" (4) -> NegativeStatus,

    GetLen = "handle_GET_LEN" (1) -> NullObject,
    MatchKeys = "handle_MATCH_KEYS" (1) -> NegativeStatus,
    MatchClass = "handle_MATCH_CLASS" (3) -> NegativeStatus,
    CopyDictWithoutKeys = "handle_COPY_DICT_WITHOUT_KEYS" (2) -> NullObject,

    BlockSetup = "PyFrame_BlockSetup" (4) -> Never,
    BlockPop = "PyFrame_BlockPop" (1) -> Never,
    PopExcept = "handle_POP_EXCEPT" (2) -> Never,
    JumpIfNotExcMatch = "handle_JUMP_IF_NOT_EXC_MATCH" (2) -> NegativeStatus,
    Reraise = "handle_RERAISE" (2) -> Always,
    SetupWith = "handle_SETUP_WITH" (3) -> NegativeStatus,
    WithExceptStart = "handle_WITH_EXCEPT_START" (1) -> NullObject,
    RaiseVarargs = "handle_RAISE_VARARGS" (2) -> Always,

    YieldValue = "handle_YIELD_VALUE" (1) -> NullObject,
    YieldFrom = "handle_YIELD_FROM" (1) -> NegativeStatus,
    GetYieldFromIter = "handle_GET_YIELD_FROM_ITER" (2) -> NullObject,
    GetAwaitable = "handle_GET_AWAITABLE" (3) -> NullObject,
    GetAiter = "handle_GET_AITER" (1) -> NullObject,
    GetAnext = "handle_GET_ANEXT" (1) -> NullObject,
    EndAsyncFor = "handle_END_ASYNC_FOR" (1) -> NegativeStatus,
    BeforeAsyncWith = "handle_BEFORE_ASYNC_WITH" (1) -> NegativeStatus,

    RotN = "handle_ROT_N" (2) -> Never,
    TruthValue = "castPyObjectToBool" (1) -> NegativeStatus,
    HandleEvalBreaker = "handleEvalBreaker" (0) -> NegativeStatus,
    RaiseUnboundLocal = "raiseUnboundError" (1) -> Always,
}

impl Helper {
    /// Position in the entry symbol table
    pub fn table_index(self) -> usize {
        DataSymbol::ALL.len() + self as usize
    }

    /// Helper implementing a two-operand arithmetic or subscript opcode
    pub fn for_binary(opcode: Opcode) -> Option<Helper> {
        use Opcode::*;
        Some(match opcode {
            BinarySubscr => Helper::BinarySubscr,
            BinaryAdd => Helper::BinaryAdd,
            InplaceAdd => Helper::InplaceAdd,
            BinarySubtract => Helper::BinarySubtract,
            InplaceSubtract => Helper::InplaceSubtract,
            BinaryMultiply => Helper::BinaryMultiply,
            InplaceMultiply => Helper::InplaceMultiply,
            BinaryFloorDivide => Helper::BinaryFloorDivide,
            InplaceFloorDivide => Helper::InplaceFloorDivide,
            BinaryTrueDivide => Helper::BinaryTrueDivide,
            InplaceTrueDivide => Helper::InplaceTrueDivide,
            BinaryModulo => Helper::BinaryModulo,
            InplaceModulo => Helper::InplaceModulo,
            BinaryPower => Helper::BinaryPower,
            InplacePower => Helper::InplacePower,
            BinaryMatrixMultiply => Helper::BinaryMatrixMultiply,
            InplaceMatrixMultiply => Helper::InplaceMatrixMultiply,
            BinaryLshift => Helper::BinaryLshift,
            InplaceLshift => Helper::InplaceLshift,
            BinaryRshift => Helper::BinaryRshift,
            InplaceRshift => Helper::InplaceRshift,
            BinaryAnd => Helper::BinaryAnd,
            InplaceAnd => Helper::InplaceAnd,
            BinaryOr => Helper::BinaryOr,
            InplaceOr => Helper::InplaceOr,
            BinaryXor => Helper::BinaryXor,
            InplaceXor => Helper::InplaceXor,
            _ => return None,
        })
    }

    pub fn for_unary(opcode: Opcode) -> Option<Helper> {
        Some(match opcode {
            Opcode::UnaryNot => Helper::UnaryNot,
            Opcode::UnaryPositive => Helper::UnaryPositive,
            Opcode::UnaryNegative => Helper::UnaryNegative,
            Opcode::UnaryInvert => Helper::UnaryInvert,
            _ => return None,
        })
    }

    pub fn for_build(opcode: Opcode) -> Option<Helper> {
        Some(match opcode {
            Opcode::BuildString => Helper::BuildString,
            Opcode::BuildTuple => Helper::BuildTuple,
            Opcode::BuildList => Helper::BuildList,
            Opcode::BuildSet => Helper::BuildSet,
            Opcode::BuildMap => Helper::BuildMap,
            Opcode::BuildConstKeyMap => Helper::BuildConstKeyMap,
            _ => return None,
        })
    }
}

impl fmt::Display for Helper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for DataSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Names of every entry in the symbol table, in table order
pub fn symbol_names() -> impl Iterator<Item = &'static str> {
    DataSymbol::ALL
        .iter()
        .map(|s| s.name())
        .chain(Helper::ALL.iter().map(|h| h.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_layout() {
        assert_eq!(Helper::ALL[0].table_index(), DataSymbol::ALL.len());
        for (i, helper) in Helper::ALL.iter().enumerate() {
            assert_eq!(helper.table_index(), DataSymbol::ALL.len() + i);
        }
        assert_eq!(symbol_names().count(), DataSymbol::ALL.len() + Helper::ALL.len());
    }

    #[test]
    fn test_names_unique() {
        let mut names: Vec<_> = symbol_names().collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn test_binary_mapping() {
        assert_eq!(Helper::for_binary(Opcode::InplaceXor), Some(Helper::InplaceXor));
        assert_eq!(Helper::for_binary(Opcode::CompareOp), None);
        assert_eq!(Helper::BinaryAdd.arity(), 2);
        assert_eq!(Helper::BinaryAdd.failure(), Failure::NullObject);
        assert_eq!(Helper::Reraise.failure(), Failure::Always);
        assert!(!Failure::Never.has_result());
    }
}
