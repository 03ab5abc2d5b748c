//! Expected fetch/execute streams.
//!
//! A [`BlockScript`] is a symbolic sequence of basic-block visits. Expanding it through a
//! [`BlockAddresses`] table yields the flat address stream the agent is expected to report.

use std::ops::Range;

use crate::layout::{BasicBlockId, BlockAddresses};

/// Concatenates the addresses of `blocks`, in the order given.
pub fn expand(addresses: &BlockAddresses, blocks: &[BasicBlockId]) -> Vec<u64> {
    blocks
        .iter()
        .flat_map(|&b| addresses[b].iter().copied())
        .collect()
}

/// Sequence of basic-block visits.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockScript(Vec<BasicBlockId>);

impl BlockScript {
    /// Creates an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a visit to `block`.
    pub fn visit(mut self, block: BasicBlockId) -> Self {
        self.0.push(block);
        self
    }

    /// Appends the loop iterations in `iterations`.
    ///
    /// Every iteration checks the condition and goes through the exit block. The guest tests the
    /// low bit of the counter and skips the increment when it is clear, so only odd iterations
    /// visit the conditional increment.
    pub fn loop_iterations(mut self, iterations: Range<usize>) -> Self {
        for i in iterations {
            self.0.push(BasicBlockId::LoopBodyCheckCond);
            if i % 2 == 1 {
                self.0.push(BasicBlockId::LoopBodyConditionalIncrement);
            }
            self.0.push(BasicBlockId::LoopExitBlock);
        }
        self
    }

    /// The canonical on-path script of a guest running `iterations` loop iterations.
    pub fn on_path(iterations: usize) -> Self {
        Self::new()
            .visit(BasicBlockId::Init)
            .loop_iterations(0..iterations)
            .visit(BasicBlockId::ProgramExit)
    }

    /// The blocks visited, in order.
    pub fn blocks(&self) -> &[BasicBlockId] {
        &self.0
    }

    /// Number of visits to `block`.
    pub fn count(&self, block: BasicBlockId) -> usize {
        self.0.iter().filter(|&&b| b == block).count()
    }

    /// Expands the script into an address stream.
    pub fn expand(&self, addresses: &BlockAddresses) -> Vec<u64> {
        expand(addresses, &self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BlockMnemonics, BlockTable};

    fn addresses() -> BlockAddresses {
        BlockTable::new([
            vec![0x10, 0x12],
            vec![0x14, 0x16, 0x18],
            vec![0x1a],
            vec![0x1d, 0x20, 0x23],
            vec![0x25, 0x27, 0x2c],
            vec![0x2e, 0x33, 0x38],
        ])
    }

    #[test]
    fn stream_expand_concatenates() {
        let addresses = addresses();
        let blocks = [
            BasicBlockId::LoopExitBlock,
            BasicBlockId::Init,
            BasicBlockId::LoopExitBlock,
        ];
        assert_eq!(
            expand(&addresses, &blocks),
            vec![0x1d, 0x20, 0x23, 0x10, 0x12, 0x1d, 0x20, 0x23]
        );
        assert!(expand(&addresses, &[]).is_empty());
    }

    #[test]
    fn stream_is_deterministic() {
        let addresses = addresses();
        let script = BlockScript::on_path(10);
        assert_eq!(script.expand(&addresses), script.expand(&addresses));
    }

    #[test]
    fn stream_parity_rule() {
        let script = BlockScript::on_path(10);
        assert_eq!(script.count(BasicBlockId::LoopBodyConditionalIncrement), 5);
        assert_eq!(script.count(BasicBlockId::LoopBodyCheckCond), 10);
        assert_eq!(script.count(BasicBlockId::LoopExitBlock), 10);
        assert_eq!(script.count(BasicBlockId::WrongpathLoop), 0);
        // The increment immediately follows the condition check of odd iterations only.
        let mut iteration = 0;
        let blocks = script.blocks();
        for (i, &b) in blocks.iter().enumerate() {
            if b == BasicBlockId::LoopBodyCheckCond {
                let increments = blocks[i + 1] == BasicBlockId::LoopBodyConditionalIncrement;
                assert_eq!(increments, iteration % 2 == 1);
                iteration += 1;
            }
        }
        assert_eq!(blocks.first(), Some(&BasicBlockId::Init));
        assert_eq!(blocks.last(), Some(&BasicBlockId::ProgramExit));
    }

    #[test]
    fn stream_on_path_length() {
        let mnemonics = BlockMnemonics::simple_loop();
        let addresses = addresses();
        let script = BlockScript::on_path(10);
        let expected = script
            .blocks()
            .iter()
            .map(|&b| mnemonics.len_of(b))
            .sum::<usize>();
        assert_eq!(script.expand(&addresses).len(), expected);
        assert_eq!(expected, 70);
    }
}
