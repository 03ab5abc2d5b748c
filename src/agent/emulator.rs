//! Decodes guest instructions with capstone and emulates the subset of x86-64 user code the agent
//! supports.

use std::collections::HashMap;

use capstone::arch::x86::{X86OpMem, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;

use crate::agent::cpu::*;
use crate::agent::memory::GuestMemory;
use crate::binary::CSE;
use crate::error::*;

/// `exit` system call number.
const SYS_EXIT: u64 = 60;
/// `exit_group` system call number.
const SYS_EXIT_GROUP: u64 = 231;

// -----------------------------------------------------------------------------------------------
// Emulator - Decoding
// -----------------------------------------------------------------------------------------------

/// A memory operand.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemOperand {
    /// Base register, if any.
    pub base: Option<Register>,
    /// `true` if the address is relative to the next instruction.
    pub rip_relative: bool,
    /// Index register, if any.
    pub index: Option<Register>,
    /// Index scale.
    pub scale: i32,
    /// Displacement.
    pub disp: i64,
    /// Access size in bytes.
    pub size: u8,
}

/// A decoded instruction operand.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operand {
    Reg(Register),
    Imm(i64, u8),
    Mem(MemOperand),
}

impl Operand {
    /// Operand size in bytes.
    pub fn size(&self) -> u8 {
        match self {
            Operand::Reg(r) => r.size,
            Operand::Imm(_, size) => *size,
            Operand::Mem(m) => m.size,
        }
    }
}

/// A decoded guest instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Decoded {
    pub addr: u64,
    pub size: usize,
    pub mnemonic: String,
    pub op_str: String,
    pub operands: Vec<Operand>,
}

impl Decoded {
    /// Address of the next sequential instruction.
    #[inline]
    pub fn next(&self) -> u64 {
        self.addr + self.size as u64
    }

    /// `true` for `syscall`, which is never executed on the wrong path.
    #[inline]
    pub fn is_syscall(&self) -> bool {
        self.mnemonic == "syscall"
    }

    fn unsupported(&self) -> Error {
        AgentError::UnsupportedInstruction(self.addr, format!("{} {}", self.mnemonic, self.op_str))
            .into()
    }
}

/// Decoder with a per-address instruction cache.
///
/// Each entry keeps the bytes it was decoded from. An entry whose bytes no longer match guest
/// memory, after a write to executable memory or a recovery, is decoded again.
#[derive(Default)]
pub struct Decoder {
    cache: HashMap<u64, (Vec<u8>, Decoded)>,
}

impl Decoder {
    /// Creates a decoder with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the instruction at `addr`.
    pub fn decode(&mut self, memory: &GuestMemory, addr: u64) -> Result<&Decoded> {
        let code = memory.fetch(addr)?;
        let stale = self
            .cache
            .get(&addr)
            .map_or(true, |(bytes, _)| !code.starts_with(bytes));
        if stale {
            let decoded = Self::decode_bytes(code, addr)?;
            let bytes = code[..decoded.size.min(code.len())].to_vec();
            self.cache.insert(addr, (bytes, decoded));
        }
        self.cache
            .get(&addr)
            .map(|(_, decoded)| decoded)
            .ok_or_else(|| AgentError::InvalidInstruction(addr).into())
    }

    fn decode_bytes(code: &[u8], addr: u64) -> Result<Decoded> {
        CSE.with(|cs| -> Result<Decoded> {
            let insns = cs.disasm_count(code, addr, 1)?;
            let insn = insns
                .iter()
                .next()
                .ok_or(AgentError::InvalidInstruction(addr))?;
            let mnemonic = insn
                .mnemonic()
                .ok_or(AgentError::InvalidInstruction(addr))?
                .to_string();
            let op_str = insn.op_str().unwrap_or_default().to_string();
            let detail = cs.insn_detail(&insn)?;
            let arch_detail = detail.arch_detail();
            let unsupported = || -> Error {
                AgentError::UnsupportedInstruction(addr, format!("{} {}", mnemonic, op_str)).into()
            };
            let register = |id: RegId| -> Option<Register> {
                cs.reg_name(id).and_then(|name| Register::from_name(&name))
            };
            let mut operands = vec![];
            for op in arch_detail.operands() {
                let op = match op {
                    ArchOperand::X86Operand(op) => op,
                    _ => return Err(unsupported()),
                };
                operands.push(match op.op_type {
                    X86OperandType::Reg(id) => {
                        Operand::Reg(register(id).ok_or_else(|| unsupported())?)
                    }
                    X86OperandType::Imm(value) => Operand::Imm(value, op.size),
                    X86OperandType::Mem(mem) => Operand::Mem(
                        Self::mem_operand(cs, &mem, op.size).ok_or_else(|| unsupported())?,
                    ),
                    X86OperandType::Invalid => return Err(unsupported()),
                });
            }
            Ok(Decoded {
                addr,
                size: insn.bytes().len(),
                mnemonic,
                op_str,
                operands,
            })
        })
    }

    /// Resolves a memory operand. Segment overrides are not supported.
    fn mem_operand(cs: &Capstone, mem: &X86OpMem, size: u8) -> Option<MemOperand> {
        let name = |id: RegId| -> Option<String> {
            if id.0 == 0 {
                None
            } else {
                cs.reg_name(id)
            }
        };
        if name(mem.segment()).is_some() {
            return None;
        }
        let (base, rip_relative) = match name(mem.base()) {
            None => (None, false),
            Some(n) if n == "rip" => (None, true),
            Some(n) => (Some(Register::from_name(&n)?), false),
        };
        let index = match name(mem.index()) {
            None => None,
            Some(n) => Some(Register::from_name(&n)?),
        };
        Some(MemOperand {
            base,
            rip_relative,
            index,
            scale: mem.scale(),
            disp: mem.disp(),
            size,
        })
    }
}

// -----------------------------------------------------------------------------------------------
// Emulator - Execution
// -----------------------------------------------------------------------------------------------

/// Outcome of an executed instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// Execution continues at `rip`.
    Continue,
    /// The guest exited with the given status.
    Exit(i32),
}

/// Empty structure that represents the x86-64 emulator of the agent.
pub struct Emulator;

impl Emulator {
    /// Executes `insn`, updating `cpu` and `memory`. On error, `rip` still points to `insn`.
    pub fn execute(insn: &Decoded, cpu: &mut Cpu, memory: &mut GuestMemory) -> Result<Step> {
        let ops = insn.operands.as_slice();
        let mut next = insn.next();
        match (insn.mnemonic.as_str(), ops) {
            // -----------------------------------------------------------------------------------
            // Data transfer
            // -----------------------------------------------------------------------------------
            ("mov" | "movabs", [dst, src]) => {
                let value = Self::read(insn, cpu, memory, src, dst.size())?;
                Self::write(insn, cpu, memory, dst, value)?;
            }
            ("lea", [dst, Operand::Mem(m)]) => {
                let ea = Self::effective_address(insn, cpu, m);
                Self::write(insn, cpu, memory, dst, ea)?;
            }
            ("push", [src]) => {
                let value = Self::read(insn, cpu, memory, src, 8)?;
                Self::push(cpu, memory, value)?;
            }
            ("pop", [dst]) => {
                let value = Self::pop(cpu, memory)?;
                Self::write(insn, cpu, memory, dst, value)?;
            }
            // -----------------------------------------------------------------------------------
            // Arithmetic & logic
            // -----------------------------------------------------------------------------------
            (m @ ("add" | "sub" | "cmp" | "and" | "or" | "xor" | "test"), [dst, src]) => {
                let size = dst.size();
                let a = Self::read(insn, cpu, memory, dst, size)?;
                let b = Self::read(insn, cpu, memory, src, size)?;
                let result = match m {
                    "add" => a.wrapping_add(b),
                    "sub" | "cmp" => a.wrapping_sub(b),
                    "and" | "test" => a & b,
                    "or" => a | b,
                    _ => a ^ b,
                } & mask(size);
                match m {
                    "add" => cpu.rflags.update_add(a, b, result, size, true),
                    "sub" | "cmp" => cpu.rflags.update_sub(a, b, result, size, true),
                    _ => cpu.rflags.update_logic(result, size),
                }
                if m != "cmp" && m != "test" {
                    Self::write(insn, cpu, memory, dst, result)?;
                }
            }
            (m @ ("inc" | "dec"), [dst]) => {
                let size = dst.size();
                let a = Self::read(insn, cpu, memory, dst, size)?;
                let result = if m == "inc" {
                    let r = a.wrapping_add(1) & mask(size);
                    cpu.rflags.update_add(a, 1, r, size, false);
                    r
                } else {
                    let r = a.wrapping_sub(1) & mask(size);
                    cpu.rflags.update_sub(a, 1, r, size, false);
                    r
                };
                Self::write(insn, cpu, memory, dst, result)?;
            }
            // -----------------------------------------------------------------------------------
            // Control flow
            // -----------------------------------------------------------------------------------
            ("jmp", [target]) => next = Self::branch_target(insn, cpu, memory, target)?,
            ("call", [target]) => {
                let target = Self::branch_target(insn, cpu, memory, target)?;
                Self::push(cpu, memory, next)?;
                next = target;
            }
            ("ret", []) => next = Self::pop(cpu, memory)?,
            ("ret", [Operand::Imm(bytes, _)]) => {
                next = Self::pop(cpu, memory)?;
                cpu.regs[RSP] = cpu.regs[RSP].wrapping_add(*bytes as u64);
            }
            (m, [target]) if Self::condition_code(m).is_some() => {
                let cond = Self::condition_code(m).ok_or_else(|| insn.unsupported())?;
                if Self::evaluate_condition(cond, cpu.rflags) {
                    next = Self::branch_target(insn, cpu, memory, target)?;
                }
            }
            // -----------------------------------------------------------------------------------
            // Misc
            // -----------------------------------------------------------------------------------
            ("nop" | "endbr64", _) => {}
            ("syscall", []) => {
                let number = cpu.regs[RAX];
                return match number {
                    SYS_EXIT | SYS_EXIT_GROUP => Ok(Step::Exit(cpu.regs[RDI] as i32)),
                    _ => Err(AgentError::UnsupportedSyscall(number).into()),
                };
            }
            _ => return Err(insn.unsupported()),
        }
        cpu.rip = next;
        Ok(Step::Continue)
    }

    /// Maps a conditional jump mnemonic to its x86 condition code.
    #[inline]
    fn condition_code(mnemonic: &str) -> Option<u8> {
        let cond = match mnemonic {
            "jo" => 0x0,
            "jno" => 0x1,
            "jb" => 0x2,
            "jae" => 0x3,
            "je" => 0x4,
            "jne" => 0x5,
            "jbe" => 0x6,
            "ja" => 0x7,
            "js" => 0x8,
            "jns" => 0x9,
            "jp" => 0xa,
            "jnp" => 0xb,
            "jl" => 0xc,
            "jge" => 0xd,
            "jle" => 0xe,
            "jg" => 0xf,
            _ => return None,
        };
        Some(cond)
    }

    /// Evaluates an instruction condition based on RFLAGS.
    #[inline]
    fn evaluate_condition(cond: u8, rflags: Rflags) -> bool {
        let ret = match cond >> 1 {
            // O or NO
            0b000 => rflags.get_of(),
            // B or AE
            0b001 => rflags.get_cf(),
            // E or NE
            0b010 => rflags.get_zf(),
            // BE or A
            0b011 => rflags.get_cf() || rflags.get_zf(),
            // S or NS
            0b100 => rflags.get_sf(),
            // P or NP
            0b101 => rflags.get_pf(),
            // L or GE
            0b110 => rflags.get_sf() != rflags.get_of(),
            // LE or G
            _ => rflags.get_zf() || rflags.get_sf() != rflags.get_of(),
        };
        if cond & 1 == 1 {
            !ret
        } else {
            ret
        }
    }

    fn effective_address(insn: &Decoded, cpu: &Cpu, m: &MemOperand) -> u64 {
        let base = match (m.base, m.rip_relative) {
            (Some(r), _) => cpu.read(r),
            (None, true) => insn.next(),
            (None, false) => 0,
        };
        let index = m
            .index
            .map_or(0, |r| cpu.read(r).wrapping_mul(m.scale as u64));
        base.wrapping_add(index).wrapping_add(m.disp as u64)
    }

    /// Reads an operand, with immediates sign-extended to `size` bytes.
    fn read(
        insn: &Decoded,
        cpu: &Cpu,
        memory: &GuestMemory,
        op: &Operand,
        size: u8,
    ) -> Result<u64> {
        match op {
            Operand::Reg(r) => Ok(cpu.read(*r)),
            Operand::Imm(value, _) => Ok(*value as u64 & mask(size)),
            Operand::Mem(m) => memory.read(Self::effective_address(insn, cpu, m), m.size),
        }
    }

    fn write(
        insn: &Decoded,
        cpu: &mut Cpu,
        memory: &mut GuestMemory,
        op: &Operand,
        value: u64,
    ) -> Result<()> {
        match op {
            Operand::Reg(r) => {
                cpu.write(*r, value);
                Ok(())
            }
            Operand::Mem(m) => memory.write(Self::effective_address(insn, cpu, m), m.size, value),
            Operand::Imm(..) => Err(insn.unsupported()),
        }
    }

    /// Branch targets are absolute in immediates.
    fn branch_target(
        insn: &Decoded,
        cpu: &Cpu,
        memory: &GuestMemory,
        target: &Operand,
    ) -> Result<u64> {
        match target {
            Operand::Imm(addr, _) => Ok(*addr as u64),
            op => Self::read(insn, cpu, memory, op, 8),
        }
    }

    fn push(cpu: &mut Cpu, memory: &mut GuestMemory, value: u64) -> Result<()> {
        let rsp = cpu.regs[RSP].wrapping_sub(8);
        memory.write(rsp, 8, value)?;
        cpu.regs[RSP] = rsp;
        Ok(())
    }

    fn pop(cpu: &mut Cpu, memory: &GuestMemory) -> Result<u64> {
        let value = memory.read(cpu.regs[RSP], 8)?;
        cpu.regs[RSP] = cpu.regs[RSP].wrapping_add(8);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::memory::STACK_TOP;
    use crate::loader::MemPerms;

    const BASE: u64 = 0x1000;

    fn setup(code: &[u8]) -> (Decoder, Cpu, GuestMemory) {
        let mut memory = GuestMemory::new();
        memory.map(BASE, code.to_vec(), MemPerms::RX).unwrap();
        memory
            .map(STACK_TOP - 0x1000, vec![0; 0x1000], MemPerms::RW)
            .unwrap();
        (Decoder::new(), Cpu::new(BASE, STACK_TOP - 0x100), memory)
    }

    fn run(decoder: &mut Decoder, cpu: &mut Cpu, memory: &mut GuestMemory, count: usize) -> Step {
        let mut step = Step::Continue;
        for _ in 0..count {
            let insn = decoder.decode(memory, cpu.rip).unwrap().clone();
            step = Emulator::execute(&insn, cpu, memory).unwrap();
        }
        step
    }

    #[test]
    fn emulator_decodes_operands() {
        // mov ecx, eax ; and ecx, 1 ; lea rax, [rbx + rcx*4 + 8]
        let code = [0x89, 0xc1, 0x83, 0xe1, 0x01, 0x48, 0x8d, 0x44, 0x8b, 0x08];
        let (mut decoder, _, memory) = setup(&code);
        let mov = decoder.decode(&memory, BASE).unwrap().clone();
        assert_eq!(mov.mnemonic, "mov");
        assert_eq!(mov.size, 2);
        assert_eq!(
            mov.operands,
            vec![
                Operand::Reg(Register::from_name("ecx").unwrap()),
                Operand::Reg(Register::from_name("eax").unwrap()),
            ]
        );
        let and = decoder.decode(&memory, BASE + 2).unwrap().clone();
        assert!(matches!(and.operands[1], Operand::Imm(1, _)));
        let lea = decoder.decode(&memory, BASE + 5).unwrap().clone();
        match lea.operands[1] {
            Operand::Mem(m) => {
                assert_eq!(m.base, Register::from_name("rbx"));
                assert_eq!(m.index, Register::from_name("rcx"));
                assert_eq!(m.scale, 4);
                assert_eq!(m.disp, 8);
            }
            op => panic!("unexpected operand {:?}", op),
        }
    }

    #[test]
    fn emulator_redecodes_modified_code() {
        let mut memory = GuestMemory::new();
        // mov ecx, eax ; ret
        memory.map(BASE, vec![0x89, 0xc1, 0xc3], MemPerms::RWX).unwrap();
        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode(&memory, BASE).unwrap().mnemonic, "mov");
        // nop ; nop
        memory.write(BASE, 2, 0x9090).unwrap();
        let nop = decoder.decode(&memory, BASE).unwrap().clone();
        assert_eq!(nop.mnemonic, "nop");
        assert_eq!(nop.size, 1);
        assert_eq!(decoder.decode(&memory, BASE + 1).unwrap().mnemonic, "nop");
        assert_eq!(decoder.decode(&memory, BASE + 2).unwrap().mnemonic, "ret");
    }

    #[test]
    fn emulator_rejects_undecodable_code() {
        // Truncated `mov eax, imm32`.
        let (mut decoder, _, memory) = setup(&[0xb8, 0x01]);
        assert!(decoder.decode(&memory, BASE).is_err());
        assert_eq!(
            decoder.decode(&memory, 0x5000).unwrap_err(),
            Error::Agent(AgentError::UnmappedMemory(0x5000))
        );
    }

    #[test]
    fn emulator_counted_loop() {
        // xor eax, eax ; xor ebx, ebx
        // loop: mov ecx, eax ; and ecx, 1 ; je skip ; add ebx, 1
        // skip: add eax, 1 ; cmp eax, 10 ; jl loop
        // xor edi, edi ; mov eax, 60 ; syscall
        let code = [
            0x31, 0xc0, 0x31, 0xdb, // init
            0x89, 0xc1, 0x83, 0xe1, 0x01, 0x74, 0x03, // check
            0x83, 0xc3, 0x01, // increment
            0x83, 0xc0, 0x01, 0x83, 0xf8, 0x0a, 0x7c, 0xee, // exit block
            0x31, 0xff, 0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05, // exit
        ];
        let (mut decoder, mut cpu, mut memory) = setup(&code);
        let mut executed = 0;
        let step = loop {
            let insn = decoder.decode(&memory, cpu.rip).unwrap().clone();
            executed += 1;
            match Emulator::execute(&insn, &mut cpu, &mut memory).unwrap() {
                Step::Continue => {}
                step => break step,
            }
        };
        assert_eq!(step, Step::Exit(0));
        assert_eq!(executed, 70);
        // The accumulator counts odd iterations.
        assert_eq!(cpu.read(Register::from_name("ebx").unwrap()), 5);
    }

    #[test]
    fn emulator_call_ret_push_pop() {
        // push 0x2a ; call f ; pop rbx ; nop
        // f: ret
        let code = [0x6a, 0x2a, 0xe8, 0x02, 0x00, 0x00, 0x00, 0x5b, 0x90, 0xc3];
        let (mut decoder, mut cpu, mut memory) = setup(&code);
        let rsp = cpu.regs[RSP];
        run(&mut decoder, &mut cpu, &mut memory, 2);
        assert_eq!(cpu.rip, BASE + 9);
        assert_eq!(cpu.regs[RSP], rsp - 16);
        run(&mut decoder, &mut cpu, &mut memory, 2);
        assert_eq!(cpu.rip, BASE + 8);
        assert_eq!(cpu.read(Register::from_name("rbx").unwrap()), 0x2a);
        assert_eq!(cpu.regs[RSP], rsp);
    }

    #[test]
    fn emulator_conditions() {
        let mut f = Rflags::default();
        f.update_sub(1, 2, 0xffff_ffff, 4, true);
        for (m, taken) in [
            ("jl", true),
            ("jge", false),
            ("jb", true),
            ("ja", false),
            ("jne", true),
            ("je", false),
            ("jle", true),
            ("jg", false),
            ("js", true),
        ] {
            let cond = Emulator::condition_code(m).unwrap();
            assert_eq!(Emulator::evaluate_condition(cond, f), taken, "{}", m);
        }
        assert_eq!(Emulator::condition_code("jmp"), None);
    }

    #[test]
    fn emulator_rejects_unsupported_syscall() {
        // mov eax, 1 ; syscall
        let (mut decoder, mut cpu, mut memory) =
            setup(&[0xb8, 0x01, 0x00, 0x00, 0x00, 0x0f, 0x05]);
        run(&mut decoder, &mut cpu, &mut memory, 1);
        let insn = decoder.decode(&memory, cpu.rip).unwrap().clone();
        assert_eq!(
            Emulator::execute(&insn, &mut cpu, &mut memory),
            Err(Error::Agent(AgentError::UnsupportedSyscall(1)))
        );
        assert_eq!(cpu.rip, BASE + 5);
    }
}
