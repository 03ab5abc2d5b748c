//! Oracle for the reference `simple_loop` guest.
//!
//! [`SimpleLoopInfo`] binds the guest's listing to the block layout once, then derives the
//! on-path stream and the two canonical wrong-path scenarios from it.

use crate::binary::ParsedBinary;
use crate::error::*;
use crate::layout::{BasicBlockId, BlockAddresses, BlockMnemonics};
use crate::scenario::{build_wrongpath, WrongPathScenario};
use crate::stream::BlockScript;

/// Loop trip count of the reference guest.
pub const DEFAULT_ITERATIONS: usize = 10;

/// Layout and expected streams of the reference guest.
#[derive(Clone, Debug)]
pub struct SimpleLoopInfo {
    mnemonics: BlockMnemonics,
    addresses: BlockAddresses,
    iterations: usize,
}

impl SimpleLoopInfo {
    /// Verifies `binary` against the reference layout, for a guest running
    /// [`DEFAULT_ITERATIONS`] iterations.
    pub fn new(binary: &ParsedBinary) -> Result<Self> {
        Self::with_iterations(binary, DEFAULT_ITERATIONS)
    }

    /// Verifies `binary` against the reference layout, for a guest running `iterations`
    /// iterations.
    pub fn with_iterations(binary: &ParsedBinary, iterations: usize) -> Result<Self> {
        if iterations == 0 {
            return Err(LayoutError::NotEnoughIterations(1).into());
        }
        let mnemonics = BlockMnemonics::simple_loop();
        let addresses = BlockAddresses::verify_and_bind(binary, &mnemonics)?;
        Ok(Self {
            mnemonics,
            addresses,
            iterations,
        })
    }

    /// Bound block addresses.
    pub fn addresses(&self) -> &BlockAddresses {
        &self.addresses
    }

    /// Loop trip count.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// The canonical on-path stream.
    pub fn expected_addresses(&self) -> Vec<u64> {
        BlockScript::on_path(self.iterations).expand(&self.addresses)
    }

    /// Redirects the `je` of the second iteration to the exit block.
    ///
    /// The wrong path then runs the exit block, the remaining iterations and the program exit, as
    /// if the increment had been predicted skipped.
    pub fn normal_wrongpath_test_info(&self) -> Result<WrongPathScenario> {
        if self.iterations < 2 {
            return Err(LayoutError::NotEnoughIterations(2).into());
        }
        let split_index = self.len(BasicBlockId::Init)
            + 2 * self.len(BasicBlockId::LoopBodyCheckCond)
            + self.len(BasicBlockId::LoopExitBlock)
            - 1;
        let redirect = self.start_of(BasicBlockId::LoopExitBlock)?;
        let wrongpath_script = BlockScript::new()
            .visit(BasicBlockId::LoopExitBlock)
            .loop_iterations(2..self.iterations)
            .visit(BasicBlockId::ProgramExit);
        build_wrongpath(
            &self.addresses,
            &self.expected_addresses(),
            split_index,
            redirect,
            false,
            Some(&wrongpath_script),
        )
    }

    /// Redirects the `je` of the first iteration to the wrong-path loop, in NOP mode.
    pub fn wrongpath_nop_mode_test_info(&self) -> Result<WrongPathScenario> {
        let split_index =
            self.len(BasicBlockId::Init) + self.len(BasicBlockId::LoopBodyCheckCond) - 1;
        let redirect = self.start_of(BasicBlockId::WrongpathLoop)?;
        build_wrongpath(
            &self.addresses,
            &self.expected_addresses(),
            split_index,
            redirect,
            true,
            None,
        )
    }

    fn len(&self, block: BasicBlockId) -> usize {
        self.mnemonics.len_of(block)
    }

    fn start_of(&self, block: BasicBlockId) -> Result<u64> {
        self.addresses
            .start_of(block)
            .ok_or_else(|| Error::Generic(format!("{} is empty", block)))
    }
}
