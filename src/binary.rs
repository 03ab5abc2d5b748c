//! Static instruction listings of a guest.
//!
//! A [`ParsedBinary`] is the ordered `(address, mnemonic)` sequence of the guest's executable code.
//! It can be produced by the embedded disassembler, from a loaded ELF or raw bytes, or by parsing
//! the textual output of `objdump -d`.

use std::path::Path;
use std::process::Command;

use capstone::prelude::*;
use regex::Regex;

use crate::error::*;
use crate::loader::GuestImage;

thread_local!(
    /// A per-thread global capstone instance used to disassemble x86-64 instructions.
    pub static CSE: Capstone = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .detail(true)
        .build()
        .expect("Could not initialize Capstone engine");
);

/// Instruction prefixes that objdump prints in front of the mnemonic.
const PREFIXES: &[&str] = &[
    "lock", "rep", "repe", "repz", "repne", "repnz", "bnd", "notrack", "data16", "addr32", "rex",
    "rex.w", "cs", "ds", "es", "fs", "gs", "ss",
];

/// Ordered `(address, mnemonic)` listing of a guest's executable code.
///
/// Addresses are strictly ascending and mnemonics are lowercase. The listing can be iterated over
/// any number of times, always from its first instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedBinary {
    instructions: Vec<(u64, String)>,
}

impl ParsedBinary {
    /// Creates a listing from `(address, mnemonic)` pairs given in layout order.
    pub fn new(instructions: impl IntoIterator<Item = (u64, String)>) -> Result<Self> {
        let instructions = instructions
            .into_iter()
            .map(|(addr, mnemonic)| (addr, mnemonic.to_lowercase()))
            .collect::<Vec<_>>();
        if instructions.is_empty() {
            return Err(BinaryError::Empty.into());
        }
        if let Some(w) = instructions.windows(2).find(|w| w[0].0 >= w[1].0) {
            return Err(BinaryError::UnorderedAddress(w[0].0, w[1].0).into());
        }
        Ok(Self { instructions })
    }

    /// Disassembles `code` as if it were mapped at `base`.
    ///
    /// Disassembly stops at the first byte sequence that does not decode.
    pub fn from_code(code: &[u8], base: u64) -> Result<Self> {
        Self::new(Self::disassemble(code, base)?)
    }

    /// Disassembles every executable section of a loaded guest, in address order.
    pub fn from_image(image: &GuestImage) -> Result<Self> {
        let mut instructions = vec![];
        for section in image.code.iter() {
            log::debug!(
                "disassembling {} at {:#x} ({:#x} bytes)",
                section.name,
                section.addr,
                section.data.len()
            );
            instructions.extend(Self::disassemble(&section.data, section.addr)?);
        }
        Self::new(instructions)
    }

    /// Loads the ELF at `path` and disassembles its executable sections.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_image(&GuestImage::from_path(path)?)
    }

    /// Parses the textual output of `objdump -d`, with or without raw instruction bytes.
    ///
    /// Lines that do not hold an instruction (headers, labels, byte continuations) are skipped.
    /// Prefixes such as `rep` or `lock` are not part of the mnemonic.
    pub fn from_objdump(listing: &str) -> Result<Self> {
        let line_re = Regex::new(r"^\s*([0-9a-fA-F]+):\t(.*)$")
            .map_err(|e| BinaryError::Tool(e.to_string()))?;
        let bytes_re = Regex::new(r"^[0-9a-fA-F]{2}( [0-9a-fA-F]{2})*\s*$")
            .map_err(|e| BinaryError::Tool(e.to_string()))?;
        let mut instructions = vec![];
        for line in listing.lines() {
            let caps = match line_re.captures(line) {
                Some(caps) => caps,
                None => continue,
            };
            let addr = u64::from_str_radix(&caps[1], 16)
                .map_err(|e| BinaryError::Tool(format!("{}: {}", line, e)))?;
            // The raw bytes, when shown, come first.
            let text = match caps[2].split('\t').find(|field| !bytes_re.is_match(field)) {
                Some(text) => text,
                None => continue,
            };
            let mnemonic = text
                .split_whitespace()
                .find(|token| !PREFIXES.contains(token));
            if let Some(mnemonic) = mnemonic {
                instructions.push((addr, mnemonic.to_string()));
            }
        }
        Self::new(instructions)
    }

    /// Runs the system `objdump` on `path` and parses its output.
    pub fn objdump(path: impl AsRef<Path>) -> Result<Self> {
        let output = Command::new("objdump")
            .args(["-d", "-M", "intel", "--no-show-raw-insn"])
            .arg(path.as_ref())
            .output()
            .map_err(|e| BinaryError::Tool(format!("could not run objdump: {}", e)))?;
        if !output.status.success() {
            return Err(BinaryError::Tool(format!(
                "objdump failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Self::from_objdump(&String::from_utf8_lossy(&output.stdout))
    }

    /// Iterates over the `(address, mnemonic)` pairs from the first instruction.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> + '_ {
        self.instructions.iter().map(|(a, m)| (*a, m.as_str()))
    }

    /// Number of instructions in the listing.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Always `false`, listings are never empty.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    fn disassemble(code: &[u8], base: u64) -> Result<Vec<(u64, String)>> {
        CSE.with(|cs| -> Result<Vec<(u64, String)>> {
            let insns = cs.disasm_all(code, base)?;
            insns
                .iter()
                .map(|insn| -> Result<(u64, String)> {
                    let mnemonic = insn.mnemonic().ok_or_else(|| {
                        BinaryError::Disassembler(format!("no mnemonic at {:#x}", insn.address()))
                    })?;
                    Ok((insn.address(), mnemonic.to_string()))
                })
                .collect()
        })
    }
}
