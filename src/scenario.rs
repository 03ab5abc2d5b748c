//! Wrong-path scenarios built by splitting an on-path stream at a branch.

use crate::error::*;
use crate::layout::BlockAddresses;
use crate::stream::BlockScript;

/// Everything the driver needs to run a wrong-path scenario.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WrongPathScenario {
    /// Address of the branch at which the agent is redirected.
    pub branch_instruction_addr: u64,
    /// Addresses executed before the redirect.
    pub prefix: Vec<u64>,
    /// Addresses executed after recovery. Starts with the branch itself.
    pub suffix: Vec<u64>,
    /// Wrong fetch address supplied to the agent.
    pub redirect_fetch_addr: u64,
    /// The agent fabricates NOPs instead of fetching from the redirect address.
    pub nop_mode: bool,
    /// Addresses expected on the wrong path. Always empty in NOP mode.
    pub wrongpath_stream: Vec<u64>,
}

/// Splits `on_path_stream` at `split_index` and builds the corresponding scenario.
///
/// The instruction at `split_index` is the branch. It is excluded from the prefix and is the first
/// element of the suffix, since recovery restarts the fetch at the branch. Outside of NOP mode,
/// the expected wrong-path stream is `wrongpath_script` expanded through `addresses`. It is left
/// empty when `nop_mode` is set or no script is given.
pub fn build_wrongpath(
    addresses: &BlockAddresses,
    on_path_stream: &[u64],
    split_index: usize,
    redirect_fetch_addr: u64,
    nop_mode: bool,
    wrongpath_script: Option<&BlockScript>,
) -> Result<WrongPathScenario> {
    let branch_instruction_addr = *on_path_stream
        .get(split_index)
        .ok_or(LayoutError::InvalidSplitIndex(split_index, on_path_stream.len()))?;
    let (prefix, suffix) = on_path_stream.split_at(split_index);
    let wrongpath_stream = match wrongpath_script {
        Some(script) if !nop_mode => script.expand(addresses),
        _ => vec![],
    };
    Ok(WrongPathScenario {
        branch_instruction_addr,
        prefix: prefix.to_vec(),
        suffix: suffix.to_vec(),
        redirect_fetch_addr,
        nop_mode,
        wrongpath_stream,
    })
}
