//! Anchors the guest binary to symbolic basic-block names.
//!
//! The layout is declared once as a [`BlockMnemonics`] table listing, for each [`BasicBlockId`],
//! the mnemonics the block is made of. [`BlockAddresses::verify_and_bind`] walks a
//! [`ParsedBinary`] once and checks that the instructions it contains match the declaration
//! exactly, block after block, recording the address of every instruction on the way.

use std::fmt;
use std::ops::Index;

use crate::binary::ParsedBinary;
use crate::error::*;

// -----------------------------------------------------------------------------------------------
// Layout - Block identifiers
// -----------------------------------------------------------------------------------------------

/// Basic blocks of the reference guest, in static layout order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BasicBlockId {
    /// Clears the loop counter and the accumulator.
    Init,
    /// Tests the low bit of the counter and skips the increment when it is clear.
    LoopBodyCheckCond,
    /// Increments the accumulator (odd iterations only).
    LoopBodyConditionalIncrement,
    /// Increments the counter and loops back while it is below the trip count.
    LoopExitBlock,
    /// Exits the program.
    ProgramExit,
    /// Never reached on the right path. Used as a wrong-path redirect target.
    WrongpathLoop,
}

impl BasicBlockId {
    /// Number of basic blocks.
    pub const COUNT: usize = 6;

    /// All the basic blocks, in static layout order.
    pub const ALL: [BasicBlockId; Self::COUNT] = [
        BasicBlockId::Init,
        BasicBlockId::LoopBodyCheckCond,
        BasicBlockId::LoopBodyConditionalIncrement,
        BasicBlockId::LoopExitBlock,
        BasicBlockId::ProgramExit,
        BasicBlockId::WrongpathLoop,
    ];

    /// Position of the block in the layout and in [`BlockTable`]s.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for BasicBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BasicBlockId::Init => "INIT",
            BasicBlockId::LoopBodyCheckCond => "LOOP_BODY_CHECK_COND",
            BasicBlockId::LoopBodyConditionalIncrement => "LOOP_BODY_CONDITIONAL_INCREMENT",
            BasicBlockId::LoopExitBlock => "LOOP_EXIT_BLOCK",
            BasicBlockId::ProgramExit => "PROGRAM_EXIT",
            BasicBlockId::WrongpathLoop => "WRONGPATH_LOOP",
        };
        write!(f, "{}", name)
    }
}

// -----------------------------------------------------------------------------------------------
// Layout - Tables
// -----------------------------------------------------------------------------------------------

/// A total mapping from [`BasicBlockId`] to `T`, stored as a flat array indexed by the block.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BlockTable<T>([T; BasicBlockId::COUNT]);

impl<T> BlockTable<T> {
    /// Creates a table from one entry per block, in [`BasicBlockId::ALL`] order.
    pub fn new(entries: [T; BasicBlockId::COUNT]) -> Self {
        Self(entries)
    }

    /// Iterates over the entries in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (BasicBlockId, &T)> {
        BasicBlockId::ALL.iter().copied().zip(self.0.iter())
    }
}

impl<T> Index<BasicBlockId> for BlockTable<T> {
    type Output = T;

    #[inline]
    fn index(&self, block: BasicBlockId) -> &Self::Output {
        &self.0[block.index()]
    }
}

/// Expected mnemonics of each block.
pub type BlockMnemonics = BlockTable<&'static [&'static str]>;

impl BlockMnemonics {
    /// Mnemonics of the reference `simple_loop` guest.
    pub fn simple_loop() -> Self {
        BlockTable::new([
            &["xor", "xor"],
            &["mov", "and", "je"],
            &["add"],
            &["add", "cmp", "jl"],
            &["xor", "mov", "syscall"],
            &["mov", "mov", "jmp"],
        ])
    }

    /// Number of instructions in `block`.
    #[inline]
    pub fn len_of(&self, block: BasicBlockId) -> usize {
        self[block].len()
    }

    /// Total number of instructions declared by the table.
    pub fn total_len(&self) -> usize {
        self.iter().map(|(_, m)| m.len()).sum()
    }
}

/// Addresses of the instructions of each block, bound against an actual binary.
pub type BlockAddresses = BlockTable<Vec<u64>>;

impl BlockAddresses {
    /// Checks that `binary` starts with the blocks declared in `mnemonics`, in order, and
    /// returns the address of every instruction of every block.
    ///
    /// The binary is consumed once from its beginning. Any difference between an expected and an
    /// observed mnemonic, or a binary that ends too early, results in a
    /// [`LayoutError::BinaryLayoutMismatch`] and no table is returned.
    pub fn verify_and_bind(binary: &ParsedBinary, mnemonics: &BlockMnemonics) -> Result<Self> {
        let mut instructions = binary.iter();
        let mut addresses: [Vec<u64>; BasicBlockId::COUNT] = Default::default();
        for (block, expected) in mnemonics.iter() {
            let block_addresses = &mut addresses[block.index()];
            for (position, expected) in expected.iter().enumerate() {
                let mismatch = |observed: Option<&str>| LayoutError::BinaryLayoutMismatch {
                    block,
                    position,
                    expected: expected.to_string(),
                    observed: observed.map(str::to_string),
                };
                let (addr, mnemonic) = instructions.next().ok_or_else(|| mismatch(None))?;
                if mnemonic != *expected {
                    return Err(mismatch(Some(mnemonic)).into());
                }
                block_addresses.push(addr);
            }
            log::debug!("{} bound at {:x?}", block, block_addresses);
        }
        Ok(BlockTable::new(addresses))
    }

    /// First address of `block`.
    #[inline]
    pub fn start_of(&self, block: BasicBlockId) -> Option<u64> {
        self[block].first().copied()
    }
}
