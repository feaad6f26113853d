//! Only the opcodes needed for validation and diagnostics are listed; everything else is
//! walked over by word count.

/// `OpSourceContinued`
pub const SOURCE_CONTINUED: u16 = 2;
/// `OpSource`
pub const SOURCE: u16 = 3;
/// `OpName`
pub const NAME: u16 = 5;
/// `OpString`
pub const STRING: u16 = 7;
/// `OpLine`
pub const LINE: u16 = 8;
/// `OpExtInstImport`
pub const EXT_INST_IMPORT: u16 = 11;
/// `OpExtInst`
pub const EXT_INST: u16 = 12;
/// `OpMemoryModel`
pub const MEMORY_MODEL: u16 = 14;
/// `OpEntryPoint`
pub const ENTRY_POINT: u16 = 15;
/// `OpCapability`
pub const CAPABILITY: u16 = 17;
/// `OpTypeVoid`
pub const TYPE_VOID: u16 = 19;
/// `OpTypeInt`
pub const TYPE_INT: u16 = 21;
/// `OpTypeFloat`
pub const TYPE_FLOAT: u16 = 22;
/// `OpConstant`
pub const CONSTANT: u16 = 43;
/// `OpFunction`
pub const FUNCTION: u16 = 54;
/// `OpFunctionEnd`
pub const FUNCTION_END: u16 = 56;
/// `OpLabel`
pub const LABEL: u16 = 248;
/// `OpReturn`
pub const RETURN: u16 = 253;
/// `OpNoLine`
pub const NO_LINE: u16 = 317;

/// Import name of the debug printf extended instruction set.
pub const DEBUG_PRINTF_IMPORT: &str = "NonSemantic.DebugPrintf";
/// `DebugPrintf` instruction number within [`DEBUG_PRINTF_IMPORT`].
pub const DEBUG_PRINTF: u32 = 1;

/// Import name of the shader debug info extended instruction set.
pub const SHADER_DEBUG_INFO_IMPORT: &str = "NonSemantic.Shader.DebugInfo.100";
/// `DebugSource` instruction number.
pub const DEBUG_SOURCE: u32 = 35;
/// `DebugSourceContinued` instruction number.
pub const DEBUG_SOURCE_CONTINUED: u32 = 102;
/// `DebugLine` instruction number.
pub const DEBUG_LINE: u32 = 103;
/// `DebugNoLine` instruction number.
pub const DEBUG_NO_LINE: u32 = 104;
