//! Loads guest executables. It is responsible for parsing the ELF, extracting the mapped segments
//! the agent executes from, the executable sections the oracle disassembles, and the symbols.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;
use std::ops::Range;
use std::path::Path;

use goblin as gb;

use crate::error::*;

// -----------------------------------------------------------------------------------------------
// Loader - Symbols
// -----------------------------------------------------------------------------------------------

/// Represents a symbol found in an executable
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Symbol {
    /// The symbol's name.
    pub name: String,
    /// The symbol's address.
    pub addr: u64,
    /// The symbol's size.
    pub size: u64,
}

impl Symbol {
    /// Creates a new symbol.
    pub fn new(name: &str, addr: u64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            addr,
            size,
        }
    }
}

/// Objects containing all the executable's symbols, ordered by address.
#[derive(Clone, Debug, Default)]
pub struct Symbols {
    /// Binary tree storing the symbols.
    pub symbols: BTreeMap<u64, Symbol>,
}

impl Symbols {
    /// Creates a new empty symbol tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new object from a vector of symbols.
    pub fn from_vec(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols: symbols
                .into_iter()
                .map(|s| (s.addr, s))
                .collect::<BTreeMap<u64, Symbol>>(),
        }
    }

    /// Finds a symbol by name.
    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.symbols.values().find(|s| s.name == name)
    }

    /// Looks for a symbol at address `addr` and formats it into a string.
    /// Returns the stringified address if the symbol doesn't exist.
    ///
    /// ```text
    /// _start+0x4 [0x401004]
    /// ```
    pub fn format(&self, addr: u64) -> String {
        match self.symbols.range(..=addr).next_back() {
            Some((_, s)) if addr == s.addr || (s.addr..s.addr + s.size).contains(&addr) => {
                format!("{}+{:#x} [{:#x}]", s.name, addr - s.addr, addr)
            }
            _ => format!("{:#x}", addr),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Loader - Segments & sections
// -----------------------------------------------------------------------------------------------

/// Memory permissions of a mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemPerms {
    R,
    RW,
    RX,
    RWX,
}

impl MemPerms {
    /// Returns `true` if the mapping can be written to.
    pub fn writable(self) -> bool {
        matches!(self, MemPerms::RW | MemPerms::RWX)
    }

    /// Returns `true` if the mapping can be executed.
    pub fn executable(self) -> bool {
        matches!(self, MemPerms::RX | MemPerms::RWX)
    }

    fn from_flags(writable: bool, executable: bool) -> Self {
        match (writable, executable) {
            (false, false) => MemPerms::R,
            (false, true) => MemPerms::RX,
            (true, false) => MemPerms::RW,
            (true, true) => MemPerms::RWX,
        }
    }
}

/// A loadable segment, ready to be mapped in the agent's address space.
#[derive(Clone, Debug)]
pub struct Segment {
    /// Segment virtual address range.
    pub range: Range<u64>,
    /// Segment permissions.
    pub perms: MemPerms,
    /// Segment content, zero-filled up to the size of `range`.
    pub data: Vec<u8>,
}

/// An executable section of the guest.
#[derive(Clone, Debug)]
pub struct CodeSection {
    /// Section name.
    pub name: String,
    /// Section virtual address.
    pub addr: u64,
    /// Section content.
    pub data: Vec<u8>,
}

// -----------------------------------------------------------------------------------------------
// Loader - Guest image
// -----------------------------------------------------------------------------------------------

/// Represents the guest binary and contains the information the agent and the oracle need.
#[derive(Clone, Debug)]
pub struct GuestImage {
    /// Guest name (i.e. the path basename).
    pub name: String,
    /// Program entry point.
    pub entry: u64,
    /// Loadable segments.
    pub segments: Vec<Segment>,
    /// Executable sections, sorted by address.
    pub code: Vec<CodeSection>,
    /// Guest symbols.
    pub symbols: Symbols,
}

impl GuestImage {
    /// Reads and parses the ELF at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let name = path
            .as_ref()
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LoaderError::IoError(format!("invalid path: {:?}", path.as_ref())))?
            .to_string();
        let mut file = File::open(&path)?;
        let mut binary = Vec::new();
        file.read_to_end(&mut binary)?;
        Self::from_bytes(&name, &binary)
    }

    /// Parses an in-memory ELF.
    pub fn from_bytes(name: &str, binary: &[u8]) -> Result<Self> {
        let elf = match gb::Object::parse(binary)? {
            gb::Object::Elf(elf) => elf,
            _ => return Err(LoaderError::UnsupportedFormat(name.to_string()).into()),
        };
        if !elf.is_64
            || !elf.little_endian
            || elf.header.e_machine != gb::elf::header::EM_X86_64
        {
            return Err(LoaderError::UnsupportedFormat(format!(
                "{} is not a little-endian x86-64 ELF",
                name
            ))
            .into());
        }
        let segments = Self::get_segments(&elf, binary)?;
        let code = Self::get_code_sections(&elf, binary)?;
        if code.is_empty() {
            return Err(LoaderError::NoCode.into());
        }
        let symbols = Self::get_symbols(&elf);
        log::debug!(
            "loaded {}: entry {:#x}, {} segment(s), {} code section(s), {} symbol(s)",
            name,
            elf.entry,
            segments.len(),
            code.len(),
            symbols.symbols.len()
        );
        Ok(Self {
            name: name.to_string(),
            entry: elf.entry,
            segments,
            code,
            symbols,
        })
    }

    /// Returns the address of symbol `name`.
    pub fn symbol_address(&self, name: &str) -> Result<u64> {
        self.symbols
            .find(name)
            .map(|s| s.addr)
            .ok_or_else(|| LoaderError::UnknownSymbol(name.to_string()).into())
    }

    /// Retrieves the `PT_LOAD` segments and the data they contain.
    fn get_segments(elf: &gb::elf::Elf, data: &[u8]) -> Result<Vec<Segment>> {
        elf.program_headers
            .iter()
            .filter(|ph| ph.p_type == gb::elf::program_header::PT_LOAD && ph.p_memsz != 0)
            .map(|ph| -> Result<Segment> {
                let file_range = ph.file_range();
                let file_data = data.get(file_range.clone()).ok_or_else(|| {
                    LoaderError::Parse(format!("segment out of bounds: {:?}", file_range))
                })?;
                let mut segment_data = file_data.to_vec();
                segment_data.resize(ph.p_memsz as usize, 0);
                Ok(Segment {
                    range: ph.p_vaddr..ph.p_vaddr + ph.p_memsz,
                    perms: MemPerms::from_flags(ph.is_write(), ph.is_executable()),
                    data: segment_data,
                })
            })
            .collect()
    }

    /// Retrieves the allocated executable sections, sorted by address.
    fn get_code_sections(elf: &gb::elf::Elf, data: &[u8]) -> Result<Vec<CodeSection>> {
        let mut sections = elf
            .section_headers
            .iter()
            .filter(|sh| sh.is_alloc() && sh.is_executable() && sh.sh_size != 0)
            .map(|sh| -> Result<CodeSection> {
                let name = elf
                    .shdr_strtab
                    .get_at(sh.sh_name)
                    .ok_or_else(|| LoaderError::Parse(format!("unknown section: {:?}", sh)))?
                    .to_string();
                let content = sh
                    .file_range()
                    .and_then(|r| data.get(r))
                    .ok_or_else(|| LoaderError::Parse(format!("section out of bounds: {}", name)))?
                    .to_vec();
                Ok(CodeSection {
                    name,
                    addr: sh.sh_addr,
                    data: content,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        sections.sort_by_key(|s| s.addr);
        Ok(sections)
    }

    /// Retrieves the named static symbols.
    fn get_symbols(elf: &gb::elf::Elf) -> Symbols {
        Symbols::from_vec(
            elf.syms
                .iter()
                .filter(|s| s.st_value != 0)
                .filter_map(|s| {
                    let name = elf.strtab.get_at(s.st_name)?;
                    if name.is_empty() {
                        return None;
                    }
                    Some(Symbol::new(name, s.st_value, s.st_size))
                })
                .collect(),
        )
    }
}
