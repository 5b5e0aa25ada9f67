// Binary images are ELF64 x86-64 relocatable objects written and read with the object
// crate. The dynamic generator builds them in memory, the static loader reads them back
// from the artifact store, and the external toolchain hands them in for source-emitted
// units. Every image carries a .modgen.unit section recording the name and fingerprint of
// the unit that produced it, so a loader can reject an image built from a different
// version of the unit. Parsing happens once, when the image is constructed; afterwards
// the symbol table and the .text range are plain data behind an Arc, so images are cheap
// to clone and safe to share between threads.

//! ELF image construction and inspection.

use crate::core::unit::{Fingerprint, UnitId};
use object::write::{Object as ObjectWriter, StandardSection, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, Object, ObjectSection, ObjectSymbol, SectionKind,
    SymbolFlags, SymbolKind, SymbolScope,
};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

/// Section recording which unit an image was built from.
pub const UNIT_SECTION: &str = ".modgen.unit";
const UNIT_MAGIC: &str = "modgen-unit";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("failed to parse object: {0}")]
    Parse(String),

    #[error("failed to write object: {0}")]
    Write(String),

    #[error("unsupported image target: {0}")]
    WrongTarget(String),

    #[error("image has no {UNIT_SECTION} section")]
    MissingUnitNote,

    #[error("malformed {UNIT_SECTION} section: {0}")]
    MalformedUnitNote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolBinding {
    Global,
    Local,
    Undefined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    /// Offset of the function within `.text`.
    pub offset: u64,
    pub size: u64,
    pub binding: SymbolBinding,
}

impl SymbolInfo {
    pub fn is_defined(&self) -> bool {
        self.binding != SymbolBinding::Undefined
    }
}

struct ImageInner {
    bytes: Vec<u8>,
    unit: UnitId,
    text: Option<Range<usize>>,
    symbols: Vec<SymbolInfo>,
}

/// A parsed, immutable relocatable object.
#[derive(Clone)]
pub struct BinaryImage {
    inner: Arc<ImageInner>,
}

impl BinaryImage {
    /// Validate `bytes` as an x86-64 ELF object carrying a unit record.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, ImageError> {
        let (unit, text, symbols) = {
            let file = object::File::parse(&*bytes).map_err(|e| ImageError::Parse(e.to_string()))?;
            if file.format() != BinaryFormat::Elf || file.architecture() != Architecture::X86_64 {
                return Err(ImageError::WrongTarget(format!(
                    "{:?}/{:?}",
                    file.format(),
                    file.architecture()
                )));
            }

            let note = file
                .section_by_name(UNIT_SECTION)
                .ok_or(ImageError::MissingUnitNote)?;
            let note_data = note.data().map_err(|e| ImageError::Parse(e.to_string()))?;
            let unit = decode_unit_note(note_data)?;

            let text = file.section_by_name(".text").and_then(|section| {
                let (start, len) = section.file_range()?;
                let start = usize::try_from(start).ok()?;
                let end = start.checked_add(usize::try_from(len).ok()?)?;
                (end <= bytes.len()).then_some(start..end)
            });

            let mut symbols = Vec::new();
            for symbol in file.symbols() {
                if symbol.kind() != SymbolKind::Text {
                    continue;
                }
                let name = symbol.name().map_err(|e| ImageError::Parse(e.to_string()))?;
                if name.is_empty() {
                    continue;
                }
                let binding = if symbol.is_undefined() {
                    SymbolBinding::Undefined
                } else if symbol.is_local() {
                    SymbolBinding::Local
                } else {
                    SymbolBinding::Global
                };
                symbols.push(SymbolInfo {
                    name: name.to_string(),
                    offset: symbol.address(),
                    size: symbol.size(),
                    binding,
                });
            }
            symbols.sort_by(|a, b| a.name.cmp(&b.name));

            (unit, text, symbols)
        };

        Ok(Self {
            inner: Arc::new(ImageInner {
                bytes,
                unit,
                text,
                symbols,
            }),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.inner.bytes
    }

    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }

    /// The unit recorded in the image.
    pub fn unit(&self) -> &UnitId {
        &self.inner.unit
    }

    /// Function symbols sorted by name.
    pub fn symbols(&self) -> &[SymbolInfo] {
        &self.inner.symbols
    }

    pub fn symbol(&self, name: &str) -> Option<&SymbolInfo> {
        self.inner
            .symbols
            .binary_search_by(|s| s.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.inner.symbols[idx])
    }

    /// Machine code of a defined function.
    pub fn function_code(&self, name: &str) -> Option<&[u8]> {
        let symbol = self.symbol(name).filter(|s| s.is_defined())?;
        let text = self.inner.text.clone()?;
        let start = text.start.checked_add(usize::try_from(symbol.offset).ok()?)?;
        let end = start.checked_add(usize::try_from(symbol.size).ok()?)?;
        if end > text.end {
            return None;
        }
        self.inner.bytes.get(start..end)
    }

    /// Same shared allocation, i.e. the same generation result.
    pub fn ptr_eq(&self, other: &BinaryImage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Same unit, same symbols, same code for every defined function.
    pub fn equivalent_to(&self, other: &BinaryImage) -> bool {
        if self.unit() != other.unit() || self.symbols().len() != other.symbols().len() {
            return false;
        }
        self.symbols().iter().zip(other.symbols()).all(|(a, b)| {
            a.name == b.name
                && a.binding == b.binding
                && self.function_code(&a.name) == other.function_code(&b.name)
        })
    }
}

impl fmt::Debug for BinaryImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryImage")
            .field("unit", self.unit())
            .field("bytes", &self.len())
            .field("symbols", &self.inner.symbols.len())
            .finish()
    }
}

/// Accumulates functions and writes them out as one relocatable object.
pub struct ImageBuilder {
    object: ObjectWriter<'static>,
    unit: UnitId,
}

impl ImageBuilder {
    pub fn new(unit: &UnitId) -> Self {
        Self {
            object: ObjectWriter::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little),
            unit: unit.clone(),
        }
    }

    /// Append a function's code to `.text` and define its symbol.
    pub fn add_function(&mut self, name: &str, code: &[u8], local: bool) -> u64 {
        let text = self.object.section_id(StandardSection::Text);
        let offset = self.object.append_section_data(text, code, 16);
        self.object.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: code.len() as u64,
            kind: SymbolKind::Text,
            scope: if local {
                SymbolScope::Compilation
            } else {
                SymbolScope::Dynamic
            },
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        offset
    }

    /// Declare a function provided by another unit.
    pub fn add_external(&mut self, name: &str) {
        self.object.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
    }

    pub fn build(mut self) -> Result<BinaryImage, ImageError> {
        let note = self.object.add_section(
            Vec::new(),
            UNIT_SECTION.as_bytes().to_vec(),
            SectionKind::ReadOnlyData,
        );
        let payload = encode_unit_note(&self.unit);
        self.object.append_section_data(note, &payload, 1);

        let bytes = self
            .object
            .write()
            .map_err(|e| ImageError::Write(e.to_string()))?;
        BinaryImage::parse(bytes)
    }
}

fn encode_unit_note(unit: &UnitId) -> Vec<u8> {
    format!("{}\0{}\0{}", UNIT_MAGIC, unit.name(), unit.fingerprint().to_hex()).into_bytes()
}

fn decode_unit_note(data: &[u8]) -> Result<UnitId, ImageError> {
    let text = std::str::from_utf8(data)
        .map_err(|_| ImageError::MalformedUnitNote("not UTF-8".to_string()))?;
    let mut parts = text.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(UNIT_MAGIC), Some(name), Some(hex), None) => {
            let fingerprint = Fingerprint::from_hex(hex)
                .ok_or_else(|| ImageError::MalformedUnitNote(format!("bad fingerprint '{}'", hex)))?;
            UnitId::new(name, fingerprint)
                .map_err(|_| ImageError::MalformedUnitNote(format!("bad unit name '{}'", name)))
        }
        _ => Err(ImageError::MalformedUnitNote(
            "expected magic, name and fingerprint".to_string(),
        )),
    }
}
