//! WASM binary pre-flight scanner.
//!
//! Walks the section headers of a module to recover its static memory
//! layout (end of data segments, heap base) before anything is compiled or
//! instantiated. Only the globals and data sections are decoded; every other
//! section is skipped by length.
//!
//! Reference: <https://webassembly.github.io/spec/core/binary/index.html>

use crate::memory::MemoryLayout;
use crate::RuntimeError;

/// WASM magic number: `\0asm`
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// Magic + version.
const PREAMBLE_LEN: usize = 8;

/// `i32.const` opcode.
const OP_I32_CONST: u8 = 0x41;

/// `i64.const` opcode.
const OP_I64_CONST: u8 = 0x42;

/// Layout assumed for sections the module does not carry.
const DEFAULT_DATA_END: u32 = 64;
const DEFAULT_HEAP_BASE: u32 = 65536;

/// Section IDs in the WASM binary format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
}

impl SectionId {
    /// Map a section type to an id. Types past `Data` end the scan.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SectionId::Custom),
            1 => Some(SectionId::Type),
            2 => Some(SectionId::Import),
            3 => Some(SectionId::Function),
            4 => Some(SectionId::Table),
            5 => Some(SectionId::Memory),
            6 => Some(SectionId::Global),
            7 => Some(SectionId::Export),
            8 => Some(SectionId::Start),
            9 => Some(SectionId::Element),
            10 => Some(SectionId::Code),
            11 => Some(SectionId::Data),
            _ => None,
        }
    }
}

/// Parse error with position information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: &'static str,
    pub offset: usize,
}

impl ParseError {
    pub fn new(message: &'static str, offset: usize) -> Self {
        ParseError { message, offset }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error at offset {:#x}: {}", self.offset, self.message)
    }
}

/// Binary reader with position tracking.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    /// Create a new binary reader.
    pub fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    /// Current position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move to an absolute position.
    pub fn seek(&mut self, pos: usize) -> Result<(), ParseError> {
        if pos > self.data.len() {
            return Err(ParseError::new("Seek past end of data", pos));
        }
        self.pos = pos;
        Ok(())
    }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if at end.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8, ParseError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(ParseError::new("Unexpected end of data", self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    /// Read N bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if n > self.remaining() {
            return Err(ParseError::new("Unexpected end of data", self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read an unsigned LEB128-encoded u32.
    pub fn read_leb128_u32(&mut self) -> Result<u32, ParseError> {
        let start = self.pos;
        let mut result: u32 = 0;
        let mut shift: u32 = 0;

        loop {
            if shift > 28 {
                return Err(ParseError::new("LEB128 u32 overflow", start));
            }
            let byte = self.read_byte()?;
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok(result)
    }

    /// Read a signed LEB128-encoded i32.
    pub fn read_leb128_i32(&mut self) -> Result<i32, ParseError> {
        let start = self.pos;
        let mut result: i32 = 0;
        let mut shift: u32 = 0;

        loop {
            if shift > 28 {
                return Err(ParseError::new("LEB128 i32 overflow", start));
            }
            let byte = self.read_byte()?;
            result |= ((byte & 0x7F) as i32) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                // Sign extend
                if shift < 32 && (byte & 0x40) != 0 {
                    result |= !0 << shift;
                }
                break;
            }
        }
        Ok(result)
    }

    /// Read a signed LEB128-encoded i64.
    pub fn read_leb128_i64(&mut self) -> Result<i64, ParseError> {
        let start = self.pos;
        let mut result: i64 = 0;
        let mut shift: u32 = 0;

        loop {
            if shift > 63 {
                return Err(ParseError::new("LEB128 i64 overflow", start));
            }
            let byte = self.read_byte()?;
            result |= ((byte & 0x7F) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                // Sign extend
                if shift < 64 && (byte & 0x40) != 0 {
                    result |= !0i64 << shift;
                }
                break;
            }
        }
        Ok(result)
    }

    /// Skip N bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        if n > self.remaining() {
            return Err(ParseError::new("Cannot skip past end", self.pos));
        }
        self.pos += n;
        Ok(())
    }
}

/// Values collected while walking sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScanState {
    data_end: u32,
    heap_base: u32,
}

/// Scan a module's sections and derive its memory layout.
///
/// Scanning stops quietly at the first section header that cannot be
/// interpreted (unknown type, length past the buffer, truncated varint);
/// whatever was learned up to that point is used.
pub fn scan_layout(bytes: &[u8]) -> Result<MemoryLayout, RuntimeError> {
    if bytes.len() < PREAMBLE_LEN || bytes[..4] != WASM_MAGIC {
        return Err(RuntimeError::InvalidBinary(
            "missing WASM magic number".into(),
        ));
    }

    let mut reader = BinaryReader::new(bytes);
    let mut state = ScanState {
        data_end: DEFAULT_DATA_END,
        heap_base: DEFAULT_HEAP_BASE,
    };
    reader
        .skip(PREAMBLE_LEN)
        .map_err(|e| RuntimeError::InvalidBinary(e.to_string()))?;

    while !reader.is_empty() {
        let Ok(section_type) = reader.read_leb128_u32() else {
            break;
        };
        let Ok(section_len) = reader.read_leb128_u32() else {
            break;
        };
        let section_len = section_len as usize;
        let section_start = reader.position();
        if section_len > reader.remaining() {
            log::debug!(
                "[wajs] section {} at {:#x} overruns module, scan stopped",
                section_type,
                section_start
            );
            break;
        }
        let Some(section_id) = SectionId::from_u32(section_type) else {
            log::debug!(
                "[wajs] section type {} at {:#x} ends scan",
                section_type,
                section_start
            );
            break;
        };

        let section = &bytes[section_start..section_start + section_len];
        let parsed = match section_id {
            SectionId::Global => scan_globals(section, &mut state),
            SectionId::Data => scan_data(section, &mut state),
            _ => Ok(()),
        };
        if let Err(e) = parsed {
            log::warn!("[wajs] {:?} section: {}", section_id, e);
        }

        if reader.skip(section_len).is_err() {
            break;
        }
    }

    let stack_top = round_up_16(state.data_end);
    let layout = MemoryLayout {
        data_end: state.data_end,
        stack_top,
        heap_base: state.heap_base,
    };

    if layout.data_end == 0 || layout.heap_base <= layout.stack_top {
        return Err(RuntimeError::InvalidLayout {
            data_end: layout.data_end,
            stack_top: layout.stack_top,
            heap_base: layout.heap_base,
        });
    }

    log::debug!(
        "[wajs] layout data_end={} stack_top={} heap_base={}",
        layout.data_end,
        layout.stack_top,
        layout.heap_base
    );
    Ok(layout)
}

/// The toolchain places the heap base pointer in the first global.
fn scan_globals(section: &[u8], state: &mut ScanState) -> Result<(), ParseError> {
    let mut sr = BinaryReader::new(section);
    let count = sr.read_leb128_u32()?;
    if count == 0 {
        return Ok(());
    }
    let _value_type = sr.read_byte()?;
    let _mutable = sr.read_byte()?;
    match sr.read_byte()? {
        OP_I32_CONST => state.heap_base = sr.read_leb128_i32()? as u32,
        OP_I64_CONST => state.heap_base = sr.read_leb128_i64()? as u32,
        other => log::debug!("[wajs] first global init opcode {:#04x} ignored", other),
    }
    Ok(())
}

/// Track the highest byte covered by an active data segment.
fn scan_data(section: &[u8], state: &mut ScanState) -> Result<(), ParseError> {
    let mut sr = BinaryReader::new(section);
    let count = sr.read_leb128_u32()?;
    let mut data_end: Option<u32> = None;

    for _ in 0..count {
        if sr.is_empty() {
            break;
        }
        let flags = sr.read_leb128_u32()?;
        let offset = match flags {
            0 => Some(read_offset_expr(&mut sr)?),
            1 => None,
            2 => {
                let _memory_index = sr.read_leb128_u32()?;
                Some(read_offset_expr(&mut sr)?)
            }
            _ => return Err(ParseError::new("Unknown data segment flags", sr.position())),
        };
        let size = sr.read_leb128_u32()?;
        sr.skip(size as usize)?;

        if let Some(offset) = offset {
            let end = offset.saturating_add(size);
            data_end = Some(data_end.map_or(end, |cur| cur.max(end)));
        }
    }

    if let Some(end) = data_end {
        state.data_end = end;
    }
    Ok(())
}

/// `<opcode> <value> end` constant offset expression.
fn read_offset_expr(sr: &mut BinaryReader<'_>) -> Result<u32, ParseError> {
    let opcode = sr.read_byte()?;
    let value = match opcode {
        OP_I32_CONST => sr.read_leb128_i32()? as u32,
        OP_I64_CONST => sr.read_leb128_i64()? as u32,
        _ => return Err(ParseError::new("Unsupported offset expression", sr.position())),
    };
    let _end = sr.read_byte()?;
    Ok(value)
}

/// Round up to the next multiple of 16.
pub fn round_up_16(v: u32) -> u32 {
    v.saturating_add(15) & !15
}
