//! Builds the reference guest program and emits it as a static ELF executable.
//!
//! The guest is assembled with [`iced_x86::code_asm`], one label per basic block, so that the
//! blocks land in the exact order the layout table declares them:
//!
//! ```text
//! INIT:                            xor eax, eax ; xor ebx, ebx
//! LOOP_BODY_CHECK_COND:            mov ecx, eax ; and ecx, 1 ; je LOOP_EXIT_BLOCK
//! LOOP_BODY_CONDITIONAL_INCREMENT: add ebx, 1
//! LOOP_EXIT_BLOCK:                 add eax, 1 ; cmp eax, <iterations> ; jl LOOP_BODY_CHECK_COND
//! PROGRAM_EXIT:                    xor edi, edi ; mov eax, 60 ; syscall
//! WRONGPATH_LOOP:                  mov eax, 1 ; mov ebx, 2 ; jmp WRONGPATH_LOOP
//! ```

use std::fs;
use std::path::Path;

use iced_x86::code_asm::*;
use iced_x86::BlockEncoderOptions;

use crate::error::*;
use crate::layout::{BasicBlockId, BlockTable};
use crate::loader::Symbol;

/// Address the ELF image is mapped at.
pub const IMAGE_BASE: u64 = 0x400000;
/// File offset of the code in the emitted ELF. Headers fit in the first `0x80` bytes.
pub const TEXT_OFFSET: u64 = 0x80;
/// Address of the first guest instruction.
pub const TEXT_ADDR: u64 = IMAGE_BASE + TEXT_OFFSET;

/// `exit` system call number.
pub const SYS_EXIT: u64 = 60;

/// An assembled guest program.
#[derive(Clone, Debug)]
pub struct GuestProgram {
    /// Address of the first instruction.
    base: u64,
    /// Machine code.
    code: Vec<u8>,
    /// Address of the first instruction of each block.
    block_starts: BlockTable<u64>,
}

impl GuestProgram {
    /// Assembles the reference loop guest, running `iterations` loop iterations.
    pub fn simple_loop(iterations: usize) -> Result<Self> {
        let trip_count = match i32::try_from(iterations) {
            Ok(n) if n > 0 => n,
            _ => return Err(GuestError::InvalidIterations(iterations).into()),
        };
        let mut a = CodeAssembler::new(64)?;
        let mut labels = [
            a.create_label(),
            a.create_label(),
            a.create_label(),
            a.create_label(),
            a.create_label(),
            a.create_label(),
        ];
        let check_cond = labels[BasicBlockId::LoopBodyCheckCond.index()];
        let exit_block = labels[BasicBlockId::LoopExitBlock.index()];
        let wrongpath_loop = labels[BasicBlockId::WrongpathLoop.index()];

        a.set_label(&mut labels[BasicBlockId::Init.index()])?;
        a.xor(eax, eax)?;
        a.xor(ebx, ebx)?;

        a.set_label(&mut labels[BasicBlockId::LoopBodyCheckCond.index()])?;
        a.mov(ecx, eax)?;
        a.and(ecx, 1)?;
        a.je(exit_block)?;

        a.set_label(&mut labels[BasicBlockId::LoopBodyConditionalIncrement.index()])?;
        a.add(ebx, 1)?;

        a.set_label(&mut labels[BasicBlockId::LoopExitBlock.index()])?;
        a.add(eax, 1)?;
        a.cmp(eax, trip_count)?;
        a.jl(check_cond)?;

        a.set_label(&mut labels[BasicBlockId::ProgramExit.index()])?;
        a.xor(edi, edi)?;
        a.mov(eax, SYS_EXIT as u32)?;
        a.syscall()?;

        a.set_label(&mut labels[BasicBlockId::WrongpathLoop.index()])?;
        a.mov(eax, 1)?;
        a.mov(ebx, 2)?;
        a.jmp(wrongpath_loop)?;

        let result =
            a.assemble_options(TEXT_ADDR, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
        let block_starts = BlockTable::new([
            result.label_ip(&labels[0])?,
            result.label_ip(&labels[1])?,
            result.label_ip(&labels[2])?,
            result.label_ip(&labels[3])?,
            result.label_ip(&labels[4])?,
            result.label_ip(&labels[5])?,
        ]);
        let code = result.inner.code_buffer;
        log::debug!(
            "assembled simple_loop({}) at {:#x}: {:#x} bytes",
            iterations,
            TEXT_ADDR,
            code.len()
        );
        Ok(Self {
            base: TEXT_ADDR,
            code,
            block_starts,
        })
    }

    /// Address of the first instruction, which is also the entry point.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Machine code of the program.
    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    /// One symbol per basic block, named after the block in lowercase.
    pub fn symbols(&self) -> Vec<Symbol> {
        let end = self.base + self.code.len() as u64;
        let starts = self.block_starts.iter().map(|(_, &s)| s).collect::<Vec<_>>();
        self.block_starts
            .iter()
            .enumerate()
            .map(|(i, (block, &start))| {
                let next = starts.get(i + 1).copied().unwrap_or(end);
                Symbol::new(&block.to_string().to_lowercase(), start, next - start)
            })
            .collect()
    }

    /// Returns the program as a static ELF64 executable.
    ///
    /// The image holds a single read-execute `PT_LOAD` segment mapping the headers and the code at
    /// [`IMAGE_BASE`], followed by the `.text`, `.symtab`, `.strtab` and `.shstrtab` sections.
    pub fn to_elf(&self) -> Vec<u8> {
        let symbols = self.symbols();

        // String tables.
        let mut strtab = vec![0u8];
        let mut sym_names = vec![];
        for s in symbols.iter() {
            sym_names.push(strtab.len() as u32);
            strtab.extend_from_slice(s.name.as_bytes());
            strtab.push(0);
        }
        let mut shstrtab = vec![0u8];
        let mut sh_names = vec![];
        for name in [".text", ".symtab", ".strtab", ".shstrtab"] {
            sh_names.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }

        // Symbol table, the first entry is the null symbol.
        let mut symtab = ElfWriter::default();
        symtab.pad(SYM_SIZE);
        for (s, &name) in symbols.iter().zip(sym_names.iter()) {
            symtab.u32(name);
            symtab.u8(STB_GLOBAL << 4 | STT_FUNC);
            symtab.u8(0);
            symtab.u16(TEXT_SHNDX);
            symtab.u64(s.addr);
            symtab.u64(s.size);
        }
        let symtab = symtab.0;

        // File layout.
        let text_off = TEXT_OFFSET;
        let text_end = text_off + self.code.len() as u64;
        let symtab_off = align(text_end, 8);
        let strtab_off = symtab_off + symtab.len() as u64;
        let shstrtab_off = strtab_off + strtab.len() as u64;
        let shdrs_off = align(shstrtab_off + shstrtab.len() as u64, 8);

        let mut w = ElfWriter::default();
        // ELF header.
        w.bytes(&[0x7f, b'E', b'L', b'F']);
        w.u8(2); // ELFCLASS64
        w.u8(1); // ELFDATA2LSB
        w.u8(1); // EV_CURRENT
        w.u8(0); // ELFOSABI_SYSV
        w.pad(8);
        w.u16(2); // ET_EXEC
        w.u16(0x3e); // EM_X86_64
        w.u32(1);
        w.u64(self.base);
        w.u64(EHDR_SIZE);
        w.u64(shdrs_off);
        w.u32(0);
        w.u16(EHDR_SIZE as u16);
        w.u16(PHDR_SIZE as u16);
        w.u16(1);
        w.u16(SHDR_SIZE as u16);
        w.u16(5);
        w.u16(4);
        // Program header.
        w.u32(1); // PT_LOAD
        w.u32(5); // PF_R | PF_X
        w.u64(0);
        w.u64(IMAGE_BASE);
        w.u64(IMAGE_BASE);
        w.u64(text_end);
        w.u64(text_end);
        w.u64(0x1000);
        // Sections content.
        w.pad_to(text_off);
        w.bytes(&self.code);
        w.pad_to(symtab_off);
        w.bytes(&symtab);
        w.bytes(&strtab);
        w.bytes(&shstrtab);
        w.pad_to(shdrs_off);
        // Section headers.
        w.pad(SHDR_SIZE);
        w.section_header(sh_names[0], 1, 6, self.base, text_off, self.code.len(), 0, 0, 16, 0);
        w.section_header(sh_names[1], 2, 0, 0, symtab_off, symtab.len(), 3, 1, 8, SYM_SIZE);
        w.section_header(sh_names[2], 3, 0, 0, strtab_off, strtab.len(), 0, 0, 1, 0);
        w.section_header(sh_names[3], 3, 0, 0, shstrtab_off, shstrtab.len(), 0, 0, 1, 0);
        w.0
    }

    /// Writes the ELF executable to `path` and makes it executable.
    pub fn write_elf(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(&path, self.to_elf())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        log::info!("wrote guest to {}", path.as_ref().display());
        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// Guest - ELF emission
// -----------------------------------------------------------------------------------------------

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SHDR_SIZE: u64 = 64;
const SYM_SIZE: u64 = 24;
const STB_GLOBAL: u8 = 1;
const STT_FUNC: u8 = 2;
const TEXT_SHNDX: u16 = 1;

#[inline]
fn align(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Little-endian byte sink.
#[derive(Default)]
struct ElfWriter(Vec<u8>);

impl ElfWriter {
    fn bytes(&mut self, b: &[u8]) {
        self.0.extend_from_slice(b);
    }

    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn pad(&mut self, count: u64) {
        self.0.resize(self.0.len() + count as usize, 0);
    }

    fn pad_to(&mut self, offset: u64) {
        self.0.resize(offset as usize, 0);
    }

    #[allow(clippy::too_many_arguments)]
    fn section_header(
        &mut self,
        name: u32,
        kind: u32,
        flags: u64,
        addr: u64,
        offset: u64,
        size: usize,
        link: u32,
        info: u32,
        addralign: u64,
        entsize: u64,
    ) {
        self.u32(name);
        self.u32(kind);
        self.u64(flags);
        self.u64(addr);
        self.u64(offset);
        self.u64(size as u64);
        self.u32(link);
        self.u32(info);
        self.u64(addralign);
        self.u64(entsize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::ParsedBinary;
    use crate::layout::{BlockAddresses, BlockMnemonics};
    use crate::loader::GuestImage;

    #[test]
    fn guest_matches_layout() {
        let program = GuestProgram::simple_loop(10).unwrap();
        let binary = ParsedBinary::from_code(program.bytes(), program.base()).unwrap();
        assert_eq!(binary.len(), BlockMnemonics::simple_loop().total_len());
        let addresses =
            BlockAddresses::verify_and_bind(&binary, &BlockMnemonics::simple_loop()).unwrap();
        for symbol in program.symbols() {
            let block = BasicBlockId::ALL
                .iter()
                .copied()
                .find(|b| b.to_string().to_lowercase() == symbol.name)
                .unwrap();
            assert_eq!(addresses.start_of(block), Some(symbol.addr));
        }
    }

    #[test]
    fn guest_elf_loads() {
        let program = GuestProgram::simple_loop(10).unwrap();
        let image = GuestImage::from_bytes("simple_loop", &program.to_elf()).unwrap();
        assert_eq!(image.entry, TEXT_ADDR);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].range.start, IMAGE_BASE);
        assert!(image.segments[0].perms.executable());
        assert_eq!(image.code.len(), 1);
        assert_eq!(image.code[0].name, ".text");
        assert_eq!(image.code[0].data, program.bytes());
        assert_eq!(image.symbol_address("init"), Ok(TEXT_ADDR));
        assert_eq!(
            ParsedBinary::from_image(&image).unwrap(),
            ParsedBinary::from_code(program.bytes(), program.base()).unwrap()
        );
    }

    #[test]
    fn guest_rejects_invalid_iterations() {
        assert_eq!(
            GuestProgram::simple_loop(0).unwrap_err(),
            Error::Guest(GuestError::InvalidIterations(0))
        );
    }
}
