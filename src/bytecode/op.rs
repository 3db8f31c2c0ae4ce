// =============================================================================
// OpCode - single-byte instructions for the stack machine
// =============================================================================

/// Bytecode instruction opcodes.
///
/// Operands follow the opcode inline in the code stream: constant and
/// slot indices are one byte, jump distances are unsigned 16-bit
/// big-endian. `Closure` is variable length: a constant index followed
/// by one `(is_local, index)` byte pair per upvalue of the wrapped
/// function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Constants
    Constant = 0,
    Nil,
    True,
    False,

    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Negate,

    // Comparison
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Not,

    // Variables
    GetLocal,
    SetLocal,
    GetGlobal,
    SetGlobal,

    // Control flow
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    Loop,

    // Functions
    Call,
    Return,

    // Stack manipulation
    Pop,

    // Closures
    Closure,
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "CONSTANT",
            OpCode::Nil => "NIL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Add => "ADD",
            OpCode::Subtract => "SUB",
            OpCode::Multiply => "MUL",
            OpCode::Divide => "DIV",
            OpCode::Modulo => "MOD",
            OpCode::Negate => "NEGATE",
            OpCode::Equal => "EQ",
            OpCode::NotEqual => "NE",
            OpCode::Less => "LT",
            OpCode::LessEqual => "LE",
            OpCode::Greater => "GT",
            OpCode::GreaterEqual => "GE",
            OpCode::Not => "NOT",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::JumpIfTrue => "JUMP_IF_TRUE",
            OpCode::Loop => "LOOP",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::Pop => "POP",
            OpCode::Closure => "CLOSURE",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::CloseUpvalue => "CLOSE_UPVALUE",
        }
    }

    /// Net stack effect as shown by the disassembler's `--stack` column.
    pub fn stack_effect(self) -> &'static str {
        match self {
            OpCode::Constant
            | OpCode::Nil
            | OpCode::True
            | OpCode::False
            | OpCode::GetLocal
            | OpCode::GetGlobal
            | OpCode::GetUpvalue
            | OpCode::Closure => "+1",
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Modulo
            | OpCode::Equal
            | OpCode::NotEqual
            | OpCode::Less
            | OpCode::LessEqual
            | OpCode::Greater
            | OpCode::GreaterEqual
            | OpCode::Pop
            | OpCode::CloseUpvalue => "-1",
            OpCode::Negate
            | OpCode::Not
            | OpCode::SetLocal
            | OpCode::SetGlobal
            | OpCode::SetUpvalue
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTrue
            | OpCode::Loop => "0",
            OpCode::Call | OpCode::Return => "varies",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<OpCode, u8> {
        if byte <= OpCode::CloseUpvalue as u8 {
            // Discriminants are contiguous from zero.
            Ok(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            Err(byte)
        }
    }
}
