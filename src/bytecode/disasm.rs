use std::fmt::Write;

use crate::bytecode::image::{ImageChunk, ImageConst};
use crate::bytecode::op::OpCode;
use crate::lang::value::format_number;

/// Presentation switches for the disassembler, mirroring the CLI flags.
#[derive(Debug, Clone)]
pub struct DisasmOptions {
    pub show_constants: bool,
    pub show_lines: bool,
    /// Annotate jump targets with `►` markers.
    pub flow: bool,
    /// Print a per-instruction stack-effect column.
    pub stack_effects: bool,
}

impl Default for DisasmOptions {
    fn default() -> Self {
        DisasmOptions {
            show_constants: true,
            show_lines: true,
            flow: false,
            stack_effects: false,
        }
    }
}

/// Renders a heap-resident function and every function reachable from
/// its constant pool, outermost first.
pub fn disassemble_function(
    heap: &crate::runtime::gc::Heap,
    id: crate::lang::value::FunctionId,
    options: &DisasmOptions,
) -> String {
    let function = heap.function(id);
    let label = match &function.name {
        Some(name) => format!("fn {}", name),
        None => "script".to_string(),
    };

    let image = crate::bytecode::image::lower(&function.chunk, heap);
    let mut out = disassemble(&image, &label, options);

    for constant in &function.chunk.constants {
        if let crate::lang::value::Value::Function(nested) = constant {
            out.push('\n');
            out.push_str(&disassemble_function(heap, *nested, options));
        }
    }

    out
}

/// Renders a chunk as human-readable disassembly.
pub fn disassemble(image: &ImageChunk, name: &str, options: &DisasmOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);

    let targets = if options.flow {
        collect_jump_targets(image)
    } else {
        Vec::new()
    };

    let mut offset = 0;
    while offset < image.code.len() {
        offset = disassemble_instruction(image, offset, options, &targets, &mut out);
    }

    if options.show_constants && !image.constants.is_empty() {
        let _ = writeln!(out, "== constants ==");
        for (index, constant) in image.constants.iter().enumerate() {
            let _ = writeln!(out, "{:4}  {}", index, format_constant(constant));
        }
    }

    out
}

fn disassemble_instruction(
    image: &ImageChunk,
    offset: usize,
    options: &DisasmOptions,
    targets: &[usize],
    out: &mut String,
) -> usize {
    if options.flow {
        if targets.contains(&offset) {
            let _ = write!(out, "► ");
        } else {
            let _ = write!(out, "  ");
        }
    }

    let _ = write!(out, "{:04} ", offset);

    if options.show_lines {
        let line = image.lines.get(offset).copied().unwrap_or(0);
        let previous = if offset > 0 {
            image.lines.get(offset - 1).copied()
        } else {
            None
        };
        if previous == Some(line) {
            let _ = write!(out, "   | ");
        } else {
            let _ = write!(out, "{:4} ", line);
        }
    }

    let Ok(op) = OpCode::try_from(image.code[offset]) else {
        let _ = writeln!(out, "UNKNOWN {:#04x}", image.code[offset]);
        return offset + 1;
    };

    let mut text = format!("{:<16}", op.name());
    let next = match op {
        OpCode::Constant | OpCode::GetGlobal | OpCode::SetGlobal => {
            let index = image.code[offset + 1] as usize;
            let _ = write!(
                text,
                "{:4} {}",
                index,
                image
                    .constants
                    .get(index)
                    .map(format_constant)
                    .unwrap_or_else(|| "<bad constant>".to_string())
            );
            offset + 2
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue => {
            let _ = write!(text, "{:4}", image.code[offset + 1]);
            offset + 2
        }
        OpCode::Call => {
            let _ = write!(text, "{:4} args", image.code[offset + 1]);
            offset + 2
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            let distance = read_u16(image, offset + 1) as usize;
            let target = offset + 3 + distance;
            let _ = write!(text, "{:4} -> {:04}", distance, target);
            offset + 3
        }
        OpCode::Loop => {
            let distance = read_u16(image, offset + 1) as usize;
            let target = (offset + 3).saturating_sub(distance);
            let _ = write!(text, "{:4} -> {:04}", distance, target);
            offset + 3
        }
        OpCode::Closure => {
            let index = image.code[offset + 1] as usize;
            let constant = image.constants.get(index);
            let _ = write!(
                text,
                "{:4} {}",
                index,
                constant
                    .map(format_constant)
                    .unwrap_or_else(|| "<bad constant>".to_string())
            );

            let upvalues = match constant {
                Some(ImageConst::Function { upvalues, .. }) => *upvalues as usize,
                _ => 0,
            };
            let mut cursor = offset + 2;
            for _ in 0..upvalues {
                let is_local = image.code.get(cursor).copied().unwrap_or(0) != 0;
                let slot = image.code.get(cursor + 1).copied().unwrap_or(0);
                let _ = write!(
                    text,
                    "\n        |                {} {}",
                    if is_local { "local" } else { "upvalue" },
                    slot
                );
                cursor += 2;
            }
            cursor
        }
        _ => offset + 1,
    };

    if options.stack_effects {
        let _ = writeln!(out, "{:<40} [{}]", text, op.stack_effect());
    } else {
        let _ = writeln!(out, "{}", text.trim_end());
    }

    next
}

/// Offsets that some jump or loop instruction lands on.
fn collect_jump_targets(image: &ImageChunk) -> Vec<usize> {
    let mut targets = Vec::new();
    let mut offset = 0;

    while offset < image.code.len() {
        let Ok(op) = OpCode::try_from(image.code[offset]) else {
            offset += 1;
            continue;
        };
        match op {
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
                let distance = read_u16(image, offset + 1) as usize;
                let target = offset + 3 + distance;
                if !targets.contains(&target) {
                    targets.push(target);
                }
                offset += 3;
            }
            OpCode::Loop => {
                let distance = read_u16(image, offset + 1) as usize;
                let target = (offset + 3).saturating_sub(distance);
                if !targets.contains(&target) {
                    targets.push(target);
                }
                offset += 3;
            }
            OpCode::Constant
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::Call
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue => offset += 2,
            OpCode::Closure => {
                let index = image.code[offset + 1] as usize;
                let upvalues = match image.constants.get(index) {
                    Some(ImageConst::Function { upvalues, .. }) => *upvalues as usize,
                    _ => 0,
                };
                offset += 2 + upvalues * 2;
            }
            _ => offset += 1,
        }
    }

    targets
}

fn read_u16(image: &ImageChunk, offset: usize) -> u16 {
    (u16::from(image.code[offset]) << 8) | u16::from(image.code[offset + 1])
}

fn format_constant(constant: &ImageConst) -> String {
    match constant {
        ImageConst::Nil => "nil".to_string(),
        ImageConst::Bool(b) => b.to_string(),
        ImageConst::Number(n) => format_number(*n),
        ImageConst::Str(s) => format!("\"{}\"", s),
        ImageConst::Function { name, .. } => {
            if name.is_empty() {
                "<script>".to_string()
            } else {
                format!("<fn {}>", name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ImageChunk {
        // CONSTANT 0; JUMP_IF_FALSE +1; POP; RETURN
        ImageChunk {
            code: vec![
                OpCode::Constant as u8,
                0,
                OpCode::JumpIfFalse as u8,
                0,
                1,
                OpCode::Pop as u8,
                OpCode::Return as u8,
            ],
            lines: vec![1, 1, 1, 1, 1, 2, 2],
            constants: vec![ImageConst::Number(7.0)],
        }
    }

    #[test]
    fn test_basic_listing() {
        let text = disassemble(&sample(), "script", &DisasmOptions::default());
        assert!(text.contains("== script =="));
        assert!(text.contains("CONSTANT"));
        assert!(text.contains("'7'") || text.contains(" 7"));
        assert!(text.contains("JUMP_IF_FALSE"));
        assert!(text.contains("RETURN"));
        assert!(text.contains("== constants =="));
    }

    #[test]
    fn test_no_constants_flag() {
        let options = DisasmOptions {
            show_constants: false,
            ..DisasmOptions::default()
        };
        let text = disassemble(&sample(), "script", &options);
        assert!(!text.contains("== constants =="));
    }

    #[test]
    fn test_no_lines_flag() {
        let options = DisasmOptions {
            show_lines: false,
            ..DisasmOptions::default()
        };
        let text = disassemble(&sample(), "script", &options);
        // With lines off, the repeated-line pipe column disappears.
        assert!(!text.contains("   | "));
    }

    #[test]
    fn test_flow_marks_jump_targets() {
        let options = DisasmOptions {
            flow: true,
            ..DisasmOptions::default()
        };
        let text = disassemble(&sample(), "script", &options);
        // JUMP_IF_FALSE at 2 skips 1 byte past the operand: target 0006.
        assert!(text.contains("► 0006"));
    }

    #[test]
    fn test_stack_effect_column() {
        let options = DisasmOptions {
            stack_effects: true,
            ..DisasmOptions::default()
        };
        let text = disassemble(&sample(), "script", &options);
        assert!(text.contains("[+1]"));
        assert!(text.contains("[-1]"));
    }

    #[test]
    fn test_jump_target_arithmetic() {
        let text = disassemble(&sample(), "script", &DisasmOptions::default());
        assert!(text.contains("-> 0006"));
    }
}
