//! Messages exchanged between the driver and the instrumentation agent.
//!
//! The driver sends one [`Command`] at a time and waits for exactly one [`Reply`] before sending
//! the next one.

use std::fmt;

use crate::error::Error;

/// Which stream an instruction was fetched on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PathKind {
    /// Fetched and executed on the architectural path.
    OnPath,
    /// Fetched after a redirect, executed speculatively.
    WrongPath,
    /// Fabricated by the agent in NOP mode. Never backed by guest memory.
    FabricatedNop,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::OnPath => write!(f, "on-path"),
            PathKind::WrongPath => write!(f, "wrong-path"),
            PathKind::FabricatedNop => write!(f, "fake-nop"),
        }
    }
}

/// An instruction reported by the agent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstInfo {
    /// Instruction address.
    pub addr: u64,
    /// Instruction size in bytes.
    pub size: usize,
    /// Lowercase mnemonic.
    pub mnemonic: String,
    /// Operands, as printed by the disassembler.
    pub op_str: String,
    /// Stream the instruction belongs to.
    pub path: PathKind,
}

impl InstInfo {
    /// Creates a fabricated one-byte NOP at `addr`.
    pub fn fabricated_nop(addr: u64) -> Self {
        Self {
            addr,
            size: 1,
            mnemonic: "nop".to_string(),
            op_str: String::new(),
            path: PathKind::FabricatedNop,
        }
    }
}

impl fmt::Display for InstInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {} {}", self.addr, self.mnemonic, self.op_str)
    }
}

/// How the agent produces wrong-path instructions after a redirect.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WrongPathMode {
    /// Fetches and speculatively executes the guest code at the redirect address.
    Fetch,
    /// Fabricates `count` consecutive one-byte NOPs starting at the redirect address.
    Nop { count: usize },
}

/// Requests sent to the agent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Fetches the next instruction on the current path.
    Fetch,
    /// Tells the agent that the next on-path instruction, at `branch_addr`, mispredicted to
    /// `redirect_addr`.
    Redirect {
        branch_addr: u64,
        redirect_addr: u64,
        mode: WrongPathMode,
    },
    /// Discards the wrong path and resumes fetching at the branch.
    Recover,
    /// Queries the agent state.
    Status,
    /// Stops the agent thread.
    Terminate,
}

/// State reported by [`Command::Status`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AgentStatus {
    /// The guest is running and its next instruction is at `next_addr`.
    Running { next_addr: u64 },
    /// The agent is on the wrong path after a redirect at `branch_addr`.
    Speculating { branch_addr: u64, fetched: usize },
    /// The guest exited with the given status.
    Exited(i32),
}

/// Answers sent back by the agent, one per command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// The instruction that was fetched.
    Instruction(InstInfo),
    /// No more instruction is available on the wrong path.
    WrongPathEnd,
    /// The guest exited with the given status.
    Exited(i32),
    /// Answer to [`Command::Status`].
    Status(AgentStatus),
    /// The command was applied.
    Ack,
    /// The command failed.
    Error(Error),
}
