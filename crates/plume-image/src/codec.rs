// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! A minimal, hand-rolled little-endian binary codec for [`Program`],
//! in the same manual read/write style as the teacher crate's
//! `BytecodeWriter`/`BytecodeReader` (no serde: this is a small, explicit
//! on-disk layout, not a normative one — spec §6 leaves the image format to
//! an external deserializer this workspace does not implement).

use std::io::{self, Read, Write};

use plume_types::Value;

use crate::{LibraryEntry, LibraryManifest, Program};

const MAGIC: &[u8; 4] = b"PLM1";

const CONST_TAG_INTEGER: u8 = 0;
const CONST_TAG_FLOAT: u8 = 1;
const CONST_TAG_SPECIAL: u8 = 2;
const CONST_TAG_STRING: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("i/o error reading/writing image: {0}")]
    Io(#[from] io::Error),

    #[error("not a plume image: bad magic bytes")]
    BadMagic,

    #[error("constant #{index} has unsupported tag {tag} (expected int/float/special/string)")]
    UnsupportedConstantTag { index: usize, tag: u8 },

    #[error("string constant/library name #{index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },
}

/// Encodes a [`Program`] to the minimal binary image format.
pub struct ImageWriter {
    buffer: Vec<u8>,
}

impl Default for ImageWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageWriter {
    pub fn new() -> Self {
        ImageWriter { buffer: Vec::new() }
    }

    fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buffer.extend_from_slice(bytes);
    }

    pub fn encode(program: &Program) -> Vec<u8> {
        let mut writer = ImageWriter::new();
        writer.buffer.extend_from_slice(MAGIC);

        writer.write_u32(program.instructions.len() as u32);
        for word in &program.instructions {
            writer.write_u32(*word);
        }

        writer.write_u32(program.constants.len() as u32);
        for constant in &program.constants {
            writer.write_constant(*constant);
        }

        writer.write_u32(program.libraries.libraries.len() as u32);
        for library in &program.libraries.libraries {
            writer.write_bytes(library.name.as_bytes());
            writer.write_u8(library.is_standard as u8);
            writer.write_u32(library.num_functions);
        }

        writer.buffer
    }

    fn write_constant(&mut self, value: Value) {
        use plume_types::ValueKind;
        match value.kind() {
            ValueKind::Integer(i) => {
                self.write_u8(CONST_TAG_INTEGER);
                self.write_u32(i as u32);
            }
            ValueKind::Float(f) => {
                self.write_u8(CONST_TAG_FLOAT);
                self.write_u64(f.to_bits());
            }
            ValueKind::Special => {
                self.write_u8(CONST_TAG_SPECIAL);
            }
            ValueKind::String(heap) => {
                self.write_u8(CONST_TAG_STRING);
                self.write_bytes(heap.get().as_bytes().unwrap_or_default());
            }
            other => panic!(
                "constants pool cannot hold a {} value; this is a bug in the encoder's caller",
                other.name()
            ),
        }
    }

    pub fn write_to<W: Write>(program: &Program, mut out: W) -> Result<(), ImageError> {
        out.write_all(&Self::encode(program))?;
        Ok(())
    }
}

/// Decodes a [`Program`] from the minimal binary image format.
pub struct ImageReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ImageReader { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, ImageError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u32(&mut self) -> Result<u32, ImageError> {
        let end = self.pos + 4;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        self.pos = end;
        Ok(u32::from_le_bytes(slice.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, ImageError> {
        let end = self.pos + 8;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        self.pos = end;
        Ok(u64::from_le_bytes(slice.try_into().unwrap()))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, ImageError> {
        let len = self.read_u32()? as usize;
        let end = self.pos + len;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        self.pos = end;
        Ok(slice.to_vec())
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Program, ImageError> {
        let mut reader = ImageReader::new(bytes);

        if reader.bytes.len() < 4 || &reader.bytes[0..4] != MAGIC {
            return Err(ImageError::BadMagic);
        }
        reader.pos = 4;

        let instruction_word_count = reader.read_u32()? as usize;
        let mut instructions = Vec::with_capacity(instruction_word_count);
        for _ in 0..instruction_word_count {
            instructions.push(reader.read_u32()?);
        }

        let constant_count = reader.read_u32()? as usize;
        let mut constants = Vec::with_capacity(constant_count);
        for index in 0..constant_count {
            constants.push(reader.read_constant(index)?);
        }

        let library_count = reader.read_u32()? as usize;
        let mut libraries = Vec::with_capacity(library_count);
        for index in 0..library_count {
            let name_bytes = reader.read_bytes()?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| ImageError::InvalidUtf8 { index })?;
            let is_standard = reader.read_u8()? != 0;
            let num_functions = reader.read_u32()?;
            libraries.push(LibraryEntry {
                name,
                is_standard,
                num_functions,
            });
        }

        Ok(Program::new(
            instructions,
            constants,
            LibraryManifest { libraries },
        ))
    }

    fn read_constant(&mut self, index: usize) -> Result<Value, ImageError> {
        let tag = self.read_u8()?;
        match tag {
            CONST_TAG_INTEGER => Ok(Value::from_i32(self.read_u32()? as i32)),
            CONST_TAG_FLOAT => Ok(Value::from_f64(f64::from_bits(self.read_u64()?))),
            CONST_TAG_SPECIAL => Ok(Value::special()),
            CONST_TAG_STRING => Ok(Value::from_string(self.read_bytes()?)),
            other => Err(ImageError::UnsupportedConstantTag { index, tag: other }),
        }
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Program, ImageError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_instructions_constants_and_libraries() {
        let program = Program::new(
            vec![2, 0, 0, 0, 23, 0, 0, 0], // LoadConstant 0; Halt
            vec![Value::from_i32(42), Value::from_f64(1.5), Value::special()],
            LibraryManifest {
                libraries: vec![LibraryEntry {
                    name: "std.io".to_string(),
                    is_standard: true,
                    num_functions: 4,
                }],
            },
        );

        let bytes = ImageWriter::encode(&program);
        let decoded = ImageReader::decode(&bytes).unwrap();

        assert_eq!(decoded.instructions, program.instructions);
        assert_eq!(decoded.libraries, program.libraries);
        assert_eq!(decoded.constants[0].as_i32(), Some(42));
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(
            ImageReader::decode(b"nope"),
            Err(ImageError::BadMagic)
        ));
    }
}
