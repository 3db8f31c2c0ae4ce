use thiserror::Error;

use crate::bytecode::chunk::Chunk;
use crate::lang::value::Value;
use crate::runtime::gc::Heap;

/// Container magic and current format version.
pub const MAGIC: &[u8; 3] = b"TBC";
pub const VERSION: u8 = 1;

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_NUMBER: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_FUNCTION: u8 = 4;

/// A constant as stored in the container.
///
/// Function constants are placeholders: the container holds one chunk,
/// so nested code is not persisted, only the metadata the disassembler
/// needs to walk a `CLOSURE` instruction's operands.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageConst {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
    Function {
        name: String,
        arity: u8,
        upvalues: u8,
    },
}

/// A chunk detached from the VM heap, ready to encode or disassemble.
#[derive(Debug, Clone, Default)]
pub struct ImageChunk {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<ImageConst>,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not a bytecode file (bad magic)")]
    BadMagic,
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated bytecode file")]
    Truncated,
    #[error("unknown constant tag {0}")]
    BadTag(u8),
    #[error("constant string is not valid UTF-8")]
    InvalidUtf8,
}

/// Detaches a heap-resident chunk into its container form.
pub fn lower(chunk: &Chunk, heap: &Heap) -> ImageChunk {
    let constants = chunk
        .constants
        .iter()
        .map(|value| match value {
            Value::Nil => ImageConst::Nil,
            Value::Bool(b) => ImageConst::Bool(*b),
            Value::Number(n) => ImageConst::Number(*n),
            Value::Str(s) => ImageConst::Str(s.to_string()),
            Value::Function(id) => {
                let function = heap.function(*id);
                ImageConst::Function {
                    name: function
                        .name
                        .as_deref()
                        .unwrap_or_default()
                        .to_string(),
                    arity: function.arity,
                    upvalues: function.upvalue_count.min(255) as u8,
                }
            }
            // Closures and natives never appear in constant pools.
            Value::Closure(_) | Value::Native(_) => ImageConst::Nil,
        })
        .collect();

    ImageChunk {
        code: chunk.code.clone(),
        lines: chunk.lines.clone(),
        constants,
    }
}

pub fn encode(image: &ImageChunk) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION);

    out.extend_from_slice(&(image.code.len() as u32).to_le_bytes());
    out.extend_from_slice(&image.code);

    out.extend_from_slice(&(image.lines.len() as u32).to_le_bytes());
    for line in &image.lines {
        out.extend_from_slice(&line.to_le_bytes());
    }

    out.extend_from_slice(&(image.constants.len() as u32).to_le_bytes());
    for constant in &image.constants {
        match constant {
            ImageConst::Nil => out.push(TAG_NIL),
            ImageConst::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            ImageConst::Number(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            ImageConst::Str(s) => {
                out.push(TAG_STRING);
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            ImageConst::Function {
                name,
                arity,
                upvalues,
            } => {
                out.push(TAG_FUNCTION);
                out.push(*arity);
                out.push(*upvalues);
                out.extend_from_slice(&(name.len() as u32).to_le_bytes());
                out.extend_from_slice(name.as_bytes());
            }
        }
    }

    out
}

pub fn decode(bytes: &[u8]) -> Result<ImageChunk, ImageError> {
    let mut reader = Reader { bytes, pos: 0 };

    if reader.take(3)? != MAGIC.as_slice() {
        return Err(ImageError::BadMagic);
    }
    let version = reader.byte()?;
    if version != VERSION {
        return Err(ImageError::UnsupportedVersion(version));
    }

    let code_len = reader.u32()? as usize;
    let code = reader.take(code_len)?.to_vec();

    let line_count = reader.u32()? as usize;
    let mut lines = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        lines.push(reader.u32()?);
    }

    let constant_count = reader.u32()? as usize;
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        let constant = match reader.byte()? {
            TAG_NIL => ImageConst::Nil,
            TAG_BOOL => ImageConst::Bool(reader.byte()? != 0),
            TAG_NUMBER => {
                let raw: [u8; 8] = reader
                    .take(8)?
                    .try_into()
                    .map_err(|_| ImageError::Truncated)?;
                ImageConst::Number(f64::from_le_bytes(raw))
            }
            TAG_STRING => {
                let len = reader.u32()? as usize;
                let raw = reader.take(len)?;
                let text = std::str::from_utf8(raw).map_err(|_| ImageError::InvalidUtf8)?;
                ImageConst::Str(text.to_string())
            }
            TAG_FUNCTION => {
                let arity = reader.byte()?;
                let upvalues = reader.byte()?;
                let len = reader.u32()? as usize;
                let raw = reader.take(len)?;
                let name = std::str::from_utf8(raw).map_err(|_| ImageError::InvalidUtf8)?;
                ImageConst::Function {
                    name: name.to_string(),
                    arity,
                    upvalues,
                }
            }
            other => return Err(ImageError::BadTag(other)),
        };
        constants.push(constant);
    }

    Ok(ImageChunk {
        code,
        lines,
        constants,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ImageError> {
        if self.pos + n > self.bytes.len() {
            return Err(ImageError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, ImageError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ImageError> {
        let raw: [u8; 4] = self.take(4)?.try_into().map_err(|_| ImageError::Truncated)?;
        Ok(u32::from_le_bytes(raw))
    }
}
