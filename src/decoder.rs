//! Parses a DXB container byte buffer into a [`Binary`].
use flate2::read::ZlibDecoder;
use std::io::Read;

use crate::binary::{Binary, CodeEntry, DefinitionEntry};
use crate::cursor::ByteCursor;
use crate::error::DecodeError;

const SIGNATURE: [u8; 3] = *b"DNX";
const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_TRANSLATION_FILE: u8 = 0x02;

/// Decodes a complete DXB byte buffer into an immutable [`Binary`].
pub fn decode(bytes: &[u8]) -> Result<Binary, DecodeError> {
    let mut header = ByteCursor::new(bytes);

    let sig = header.read_bytes(3)?;
    if sig != SIGNATURE {
        return Err(DecodeError::InvalidSignature);
    }

    let version = header.read_u8()?;
    if version != 3 && version != 4 {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let flags = header.read_u8()?;
    let compressed = flags & FLAG_COMPRESSED != 0;
    let has_translation_file = flags & FLAG_TRANSLATION_FILE != 0;

    let _uncompressed_size = header.read_u32()?;

    // Only the compressed path needs an owned buffer; the uncompressed path
    // reads straight out of `bytes` via a cursor positioned past the header.
    let decompressed;
    let mut cursor = if compressed {
        let compressed_size = header.read_u32()? as usize;
        let start = header.position();
        let end = start.saturating_add(compressed_size).min(bytes.len());
        let compressed_bytes = &bytes[start..end];
        let mut out = Vec::new();
        ZlibDecoder::new(compressed_bytes)
            .read_to_end(&mut out)
            .map_err(|e| DecodeError::DecompressionFailure(e.to_string()))?;
        decompressed = out;
        ByteCursor::new(&decompressed)
    } else {
        ByteCursor::at(bytes, header.position())
    };

    skip_v4_size_prefix(&mut cursor, version)?;
    let scenes = decode_code_entries(&mut cursor, "scene")?;

    skip_v4_size_prefix(&mut cursor, version)?;
    let functions = decode_code_entries(&mut cursor, "function")?;

    skip_v4_size_prefix(&mut cursor, version)?;
    let definitions = decode_definitions(&mut cursor)?;

    let instructions_len = cursor.read_u32()? as usize;
    let instructions = cursor.read_bytes(instructions_len)?.to_vec();

    skip_v4_size_prefix(&mut cursor, version)?;
    let string_table = decode_string_table(&mut cursor, "string_table")?;

    let translation_table = if has_translation_file {
        skip_v4_size_prefix(&mut cursor, version)?;
        decode_string_table(&mut cursor, "translation_table")?
    } else {
        Vec::new()
    };

    let ext_count = cursor.read_u32()? as usize;
    let mut external_function_list = Vec::with_capacity(ext_count);
    for _ in 0..ext_count {
        external_function_list.push(cursor.read_u32()?);
    }

    let binary = Binary {
        translation_loaded: has_translation_file,
        string_table,
        translation_table,
        instructions,
        external_function_list,
        scenes,
        functions,
        definitions,
    };

    validate(&binary)?;
    Ok(binary)
}

/// V4 containers prefix metadata sections and string tables with a redundant
/// byte-length, intended to let a lazy decoder skip them. We parse eagerly,
/// so the prefix is read and discarded.
fn skip_v4_size_prefix(cursor: &mut ByteCursor, version: u8) -> Result<(), DecodeError> {
    if version >= 4 {
        cursor.read_u32()?;
    }
    Ok(())
}

fn decode_code_entries(
    cursor: &mut ByteCursor,
    _label: &'static str,
) -> Result<Vec<CodeEntry>, DecodeError> {
    let count = cursor.read_u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let symbol = cursor.read_u32()?;
        let indices_count = cursor.read_u16()? as usize;
        let mut instruction_indices = Vec::with_capacity(indices_count);
        for _ in 0..indices_count {
            instruction_indices.push(cursor.read_i32()?);
        }
        entries.push(CodeEntry {
            symbol,
            instruction_indices,
        });
    }
    Ok(entries)
}

fn decode_definitions(cursor: &mut ByteCursor) -> Result<Vec<DefinitionEntry>, DecodeError> {
    let count = cursor.read_u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let symbol = cursor.read_u32()?;
        let reference = cursor.read_u32()?;
        let instruction_index = cursor.read_i32()?;
        entries.push(DefinitionEntry {
            symbol,
            reference,
            instruction_index,
        });
    }
    Ok(entries)
}

fn decode_string_table(
    cursor: &mut ByteCursor,
    section: &'static str,
) -> Result<Vec<String>, DecodeError> {
    let count = cursor.read_u32()? as usize;
    let mut strings = Vec::with_capacity(count);
    for _ in 0..count {
        strings
            .push(cursor.read_cstring().map_err(|_| DecodeError::Truncated(section))?);
    }
    Ok(strings)
}

fn validate(binary: &Binary) -> Result<(), DecodeError> {
    let check_symbol = |symbol: u32| -> Result<(), DecodeError> {
        if (symbol as usize) >= binary.string_table.len() {
            return Err(DecodeError::IndexOutOfBounds {
                table: "string_table",
                index: symbol,
                len: binary.string_table.len(),
            });
        }
        Ok(())
    };

    for scene in &binary.scenes {
        check_symbol(scene.symbol)?;
        if scene.instruction_indices.is_empty() || scene.instruction_indices.len() % 2 == 0 {
            return Err(DecodeError::Truncated("scene instruction_indices"));
        }
    }
    for function in &binary.functions {
        check_symbol(function.symbol)?;
        if function.instruction_indices.is_empty() || function.instruction_indices.len() % 2 == 0
        {
            return Err(DecodeError::Truncated("function instruction_indices"));
        }
    }
    for definition in &binary.definitions {
        check_symbol(definition.symbol)?;
    }
    Ok(())
}
