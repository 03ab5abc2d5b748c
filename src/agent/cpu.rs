//! x86-64 general purpose register file and flags.

use bitfield::bitfield;

// -----------------------------------------------------------------------------------------------
// CPU - Registers
// -----------------------------------------------------------------------------------------------

/// Number of general purpose registers.
pub const NB_GPRS: usize = 16;

/// Index of `rsp` in the register file.
pub const RSP: usize = 4;
/// Index of `rax` in the register file.
pub const RAX: usize = 0;
/// Index of `rdi` in the register file.
pub const RDI: usize = 7;

/// Names of the 64, 32, 16 and 8-bit views of the eight legacy registers, in encoding order.
const LEGACY_NAMES: [[&str; 4]; 8] = [
    ["rax", "eax", "ax", "al"],
    ["rcx", "ecx", "cx", "cl"],
    ["rdx", "edx", "dx", "dl"],
    ["rbx", "ebx", "bx", "bl"],
    ["rsp", "esp", "sp", "spl"],
    ["rbp", "ebp", "bp", "bpl"],
    ["rsi", "esi", "si", "sil"],
    ["rdi", "edi", "di", "dil"],
];

/// Names of the legacy high-byte registers.
const HIGH_NAMES: [&str; 4] = ["ah", "ch", "dh", "bh"];

/// A view on a general purpose register.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Register {
    /// Index of the underlying 64-bit register.
    pub index: usize,
    /// Width of the view in bytes.
    pub size: u8,
    /// `true` for `ah`, `ch`, `dh` and `bh`.
    pub high: bool,
}

impl Register {
    /// The full 64-bit view of register `index`.
    pub const fn full(index: usize) -> Self {
        Self {
            index,
            size: 8,
            high: false,
        }
    }

    /// Resolves a register name, as printed by the disassembler.
    pub fn from_name(name: &str) -> Option<Self> {
        if let Some(index) = HIGH_NAMES.iter().position(|&n| n == name) {
            return Some(Self {
                index,
                size: 1,
                high: true,
            });
        }
        for (index, views) in LEGACY_NAMES.iter().enumerate() {
            if let Some(view) = views.iter().position(|&n| n == name) {
                return Some(Self {
                    index,
                    size: 8 >> view,
                    high: false,
                });
            }
        }
        // r8 to r15, with their d/w/b suffixed views.
        let rest = name.strip_prefix('r')?;
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let index = rest[..digits].parse::<usize>().ok()?;
        if !(8..NB_GPRS).contains(&index) {
            return None;
        }
        let size = match &rest[digits..] {
            "" => 8,
            "d" => 4,
            "w" => 2,
            "b" => 1,
            _ => return None,
        };
        Some(Self {
            index,
            size,
            high: false,
        })
    }
}

/// Mask covering the lowest `size` bytes.
#[inline]
pub fn mask(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size as u32 * 8)) - 1
    }
}

/// Most significant bit of a `size`-byte value.
#[inline]
pub fn sign_bit(size: u8) -> u64 {
    1u64 << (size as u32 * 8 - 1)
}

// -----------------------------------------------------------------------------------------------
// CPU - Flags
// -----------------------------------------------------------------------------------------------

bitfield! {
    /// RFLAGS register
    #[derive(Copy, Clone, Eq, Hash, PartialEq)]
    pub struct Rflags(u64);
    impl Debug;
    pub get_cf, set_cf: 0;
    pub get_pf, set_pf: 2;
    pub get_af, set_af: 4;
    pub get_zf, set_zf: 6;
    pub get_sf, set_sf: 7;
    pub get_if, set_if: 9;
    pub get_df, set_df: 10;
    pub get_of, set_of: 11;
}

impl Default for Rflags {
    fn default() -> Self {
        // Bit 1 is reserved and always set.
        let mut rflags = Rflags(1 << 1);
        rflags.set_if(true);
        rflags
    }
}

impl Rflags {
    /// Updates ZF, SF and PF from a `size`-byte result.
    #[inline]
    fn update_result(&mut self, result: u64, size: u8) {
        self.set_zf(result & mask(size) == 0);
        self.set_sf(result & sign_bit(size) != 0);
        self.set_pf((result as u8).count_ones() % 2 == 0);
    }

    /// Flags of `and`, `or`, `xor` and `test`.
    pub fn update_logic(&mut self, result: u64, size: u8) {
        self.update_result(result, size);
        self.set_cf(false);
        self.set_of(false);
        self.set_af(false);
    }

    /// Flags of `a + b = result`. CF is left untouched when `carry` is `false` (`inc`).
    pub fn update_add(&mut self, a: u64, b: u64, result: u64, size: u8, carry: bool) {
        let m = mask(size);
        self.update_result(result, size);
        if carry {
            self.set_cf((a & m) as u128 + (b & m) as u128 > m as u128);
        }
        self.set_of((a ^ result) & (b ^ result) & sign_bit(size) != 0);
        self.set_af((a ^ b ^ result) & 0x10 != 0);
    }

    /// Flags of `a - b = result`. CF is left untouched when `borrow` is `false` (`dec`).
    pub fn update_sub(&mut self, a: u64, b: u64, result: u64, size: u8, borrow: bool) {
        let m = mask(size);
        self.update_result(result, size);
        if borrow {
            self.set_cf(a & m < b & m);
        }
        self.set_of((a ^ b) & (a ^ result) & sign_bit(size) != 0);
        self.set_af((a ^ b ^ result) & 0x10 != 0);
    }
}

// -----------------------------------------------------------------------------------------------
// CPU - State
// -----------------------------------------------------------------------------------------------

/// Architectural state of the guest thread.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cpu {
    /// General purpose registers, in encoding order (`rax`, `rcx`, `rdx`, `rbx`, ...).
    pub regs: [u64; NB_GPRS],
    /// Instruction pointer.
    pub rip: u64,
    /// Flags.
    pub rflags: Rflags,
}

impl Cpu {
    /// Creates a zeroed CPU starting at `entry` with the stack pointer set to `rsp`.
    pub fn new(entry: u64, rsp: u64) -> Self {
        let mut regs = [0; NB_GPRS];
        regs[RSP] = rsp;
        Self {
            regs,
            rip: entry,
            rflags: Rflags::default(),
        }
    }

    /// Reads a register view, zero-extended to 64 bits.
    #[inline]
    pub fn read(&self, reg: Register) -> u64 {
        let value = self.regs[reg.index];
        if reg.high {
            (value >> 8) & 0xff
        } else {
            value & mask(reg.size)
        }
    }

    /// Writes a register view. 32-bit writes clear the upper half of the register, 8 and 16-bit
    /// writes preserve the bits they do not cover.
    #[inline]
    pub fn write(&mut self, reg: Register, value: u64) {
        let old = self.regs[reg.index];
        self.regs[reg.index] = match (reg.size, reg.high) {
            (_, true) => (old & !0xff00) | ((value & 0xff) << 8),
            (8, _) => value,
            (4, _) => value & mask(4),
            (size, _) => (old & !mask(size)) | (value & mask(size)),
        };
    }
}
