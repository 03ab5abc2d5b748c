//! Contains all error types that can be returned by this crate.

use std::error;
use std::fmt;
use std::io;

use crate::layout::BasicBlockId;

/// Convenient `Result` type for custom errors.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------------------------
// Errors - General
// -----------------------------------------------------------------------------------------------

/// Main error structure which is just a simple wrapper for all errors that can be returned by the
/// oracle, the driver or the agent.
///
/// Errors are `Clone` because agent-side failures are sent back to the driver as messages.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Agent-related errors.
    Agent(AgentError),
    /// Parsed-binary errors.
    Binary(BinaryError),
    /// Driver and transport errors.
    Driver(DriverError),
    /// Guest builder errors.
    Guest(GuestError),
    /// Basic-block layout errors.
    Layout(LayoutError),
    /// Loader-related errors.
    Loader(LoaderError),
    /// Stream verification errors.
    Verify(VerifyError),
    /// Generic user-defined errors.
    Generic(String),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Agent(e) => write!(f, "[Agent error] {}", e),
            Error::Binary(e) => write!(f, "[Binary error] {}", e),
            Error::Driver(e) => write!(f, "[Driver error] {}", e),
            Error::Guest(e) => write!(f, "[Guest error] {}", e),
            Error::Layout(e) => write!(f, "[Layout error] {}", e),
            Error::Loader(e) => write!(f, "[Loader error] {}", e),
            Error::Verify(e) => write!(f, "[Verify error] {}", e),
            Error::Generic(e) => write!(f, "[Error] {}", e),
        }
    }
}

impl From<AgentError> for Error {
    fn from(error: AgentError) -> Self {
        Error::Agent(error)
    }
}

impl From<BinaryError> for Error {
    fn from(error: BinaryError) -> Self {
        Error::Binary(error)
    }
}

impl From<DriverError> for Error {
    fn from(error: DriverError) -> Self {
        Error::Driver(error)
    }
}

impl From<GuestError> for Error {
    fn from(error: GuestError) -> Self {
        Error::Guest(error)
    }
}

impl From<LayoutError> for Error {
    fn from(error: LayoutError) -> Self {
        Error::Layout(error)
    }
}

impl From<LoaderError> for Error {
    fn from(error: LoaderError) -> Self {
        Error::Loader(error)
    }
}

impl From<VerifyError> for Error {
    fn from(error: VerifyError) -> Self {
        Error::Verify(error)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Loader(LoaderError::IoError(format!("{}", error)))
    }
}

impl From<goblin::error::Error> for Error {
    fn from(error: goblin::error::Error) -> Self {
        Error::Loader(LoaderError::Parse(format!("{}", error)))
    }
}

impl From<capstone::Error> for Error {
    fn from(error: capstone::Error) -> Self {
        Error::Binary(BinaryError::Disassembler(format!("{}", error)))
    }
}

impl From<iced_x86::IcedError> for Error {
    fn from(error: iced_x86::IcedError) -> Self {
        Error::Guest(GuestError::Assembler(format!("{}", error)))
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Agent
// -----------------------------------------------------------------------------------------------

/// Agent-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AgentError {
    /// The bytes at the given address could not be decoded.
    InvalidInstruction(u64),
    /// The instruction decoded at the given address is not emulated.
    UnsupportedInstruction(u64, String),
    /// The guest issued a system call the agent does not model.
    UnsupportedSyscall(u64),
    /// A memory access touched an address that is not mapped.
    UnmappedMemory(u64),
    /// A write targeted a read-only mapping.
    ReadOnlyMemory(u64),
    /// A redirect was requested at a branch that is not the next on-path instruction
    /// (expected branch, actual next instruction).
    BranchMismatch(u64, u64),
    /// A wrong-path command was received while not speculating.
    NotSpeculating,
    /// A redirect was received while already on the wrong path.
    AlreadySpeculating,
    /// The guest has exited and cannot be redirected anymore.
    GuestExited(i32),
    /// User-defined agent error.
    Generic(String),
}

impl error::Error for AgentError {}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::InvalidInstruction(a) => write!(f, "invalid instruction at {:#x}", a),
            AgentError::UnsupportedInstruction(a, m) => {
                write!(f, "unsupported instruction at {:#x}: {}", a, m)
            }
            AgentError::UnsupportedSyscall(n) => write!(f, "unsupported syscall ({})", n),
            AgentError::UnmappedMemory(a) => write!(f, "access to unmapped memory at {:#x}", a),
            AgentError::ReadOnlyMemory(a) => write!(f, "write to read-only memory at {:#x}", a),
            AgentError::BranchMismatch(e, a) => write!(
                f,
                "redirect requested at branch {:#x}, but the next instruction is at {:#x}",
                e, a
            ),
            AgentError::NotSpeculating => write!(f, "the agent is not on the wrong path"),
            AgentError::AlreadySpeculating => write!(f, "the agent is already on the wrong path"),
            AgentError::GuestExited(c) => write!(f, "the guest already exited ({})", c),
            AgentError::Generic(e) => write!(f, "{}", e),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Binary
// -----------------------------------------------------------------------------------------------

/// Parsed-binary errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BinaryError {
    /// The disassembler returned an error.
    Disassembler(String),
    /// Addresses are not strictly ascending (previous address, current address).
    UnorderedAddress(u64, u64),
    /// The binary does not contain any instruction.
    Empty,
    /// An external tool failed while producing a listing.
    Tool(String),
}

impl error::Error for BinaryError {}

impl fmt::Display for BinaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryError::Disassembler(e) => write!(f, "disassembler error: {}", e),
            BinaryError::UnorderedAddress(p, c) => {
                write!(f, "address {:#x} does not follow {:#x}", c, p)
            }
            BinaryError::Empty => write!(f, "the binary does not contain any instruction"),
            BinaryError::Tool(e) => write!(f, "{}", e),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Driver
// -----------------------------------------------------------------------------------------------

/// Driver and transport errors. Any of these is a driver failure and is fatal to the scenario.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DriverError {
    /// The agent could not be launched.
    Launch(String),
    /// The channel to the agent was closed.
    Disconnected,
    /// No reply was received in time.
    Timeout,
    /// The agent replied something the driver did not expect at this point.
    Protocol(String),
    /// The agent thread panicked.
    AgentPanicked,
}

impl error::Error for DriverError {}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Launch(e) => write!(f, "could not launch the agent: {}", e),
            DriverError::Disconnected => write!(f, "the agent channel is closed"),
            DriverError::Timeout => write!(f, "timed out while waiting for the agent"),
            DriverError::Protocol(e) => write!(f, "unexpected reply: {}", e),
            DriverError::AgentPanicked => write!(f, "the agent thread panicked"),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Guest
// -----------------------------------------------------------------------------------------------

/// Guest builder errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GuestError {
    /// The assembler rejected the guest program.
    Assembler(String),
    /// The requested iteration count cannot be encoded.
    InvalidIterations(usize),
}

impl error::Error for GuestError {}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestError::Assembler(e) => write!(f, "assembler error: {}", e),
            GuestError::InvalidIterations(n) => write!(f, "invalid iteration count: {}", n),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Layout
// -----------------------------------------------------------------------------------------------

/// Basic-block layout errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LayoutError {
    /// The parsed binary does not match the declared block mnemonics. Stores the block, the
    /// position inside the block, the expected mnemonic and the observed one (`None` if the
    /// binary ended first).
    BinaryLayoutMismatch {
        block: BasicBlockId,
        position: usize,
        expected: String,
        observed: Option<String>,
    },
    /// The split index is outside of the on-path stream (index, stream length).
    InvalidSplitIndex(usize, usize),
    /// The oracle needs more loop iterations than were requested.
    NotEnoughIterations(usize),
}

impl error::Error for LayoutError {}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::BinaryLayoutMismatch {
                block,
                position,
                expected,
                observed: Some(observed),
            } => write!(
                f,
                "expected to see instruction {} ({:?}[{}]), but saw {} in the binary",
                expected, block, position, observed
            ),
            LayoutError::BinaryLayoutMismatch {
                block,
                position,
                expected,
                observed: None,
            } => write!(
                f,
                "expected to see instruction {} ({:?}[{}]), but reached the end of the binary",
                expected, block, position
            ),
            LayoutError::InvalidSplitIndex(i, l) => {
                write!(f, "split index {} is outside of a {}-instruction stream", i, l)
            }
            LayoutError::NotEnoughIterations(n) => {
                write!(f, "at least {} loop iterations are needed", n)
            }
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Loader
// -----------------------------------------------------------------------------------------------

/// Loader-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoaderError {
    /// An I/O error occured while reading the guest.
    IoError(String),
    /// The guest could not be parsed.
    Parse(String),
    /// The guest is not a 64-bit little-endian x86 ELF.
    UnsupportedFormat(String),
    /// The guest does not contain any executable code.
    NoCode,
    /// The symbol is unknown.
    UnknownSymbol(String),
}

impl error::Error for LoaderError {}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::IoError(e) => write!(f, "{}", e),
            LoaderError::Parse(e) => write!(f, "could not parse the guest: {}", e),
            LoaderError::UnsupportedFormat(e) => write!(f, "unsupported file type: {}", e),
            LoaderError::NoCode => write!(f, "the guest does not contain executable code"),
            LoaderError::UnknownSymbol(s) => write!(f, "unknown symbol: {}", s),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Verify
// -----------------------------------------------------------------------------------------------

/// A single observed address that differs from the expected one.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Mismatch {
    /// Index in the expected stream.
    pub index: usize,
    /// Expected address.
    pub expected: u64,
    /// Address reported by the agent.
    pub observed: u64,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{}: expected {:#x}, observed {:#x}",
            self.index, self.expected, self.observed
        )
    }
}

/// Stream verification errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerifyError {
    /// One or more observed addresses differ from the expected stream.
    AddressMismatch(Vec<Mismatch>),
    /// The guest ended before the expected stream was exhausted (expected, observed).
    PrematureTermination(usize, usize),
    /// The wrong path ended before the expected wrong-path stream was exhausted
    /// (expected, observed).
    WrongPathExhausted(usize, usize),
    /// The agent did not fabricate the requested number of NOPs (expected, observed).
    NopCountMismatch(usize, usize),
    /// An instruction fetched in NOP mode was not a fabricated NOP.
    NotANop(u64),
    /// The expected stream completed, but the guest has not terminated.
    EndNotReached,
}

impl error::Error for VerifyError {}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::AddressMismatch(m) => {
                write!(f, "{} address mismatch(es)", m.len())?;
                for mismatch in m.iter() {
                    write!(f, "\n  {}", mismatch)?;
                }
                Ok(())
            }
            VerifyError::PrematureTermination(e, o) => write!(
                f,
                "the guest terminated after {} of {} expected instructions",
                o, e
            ),
            VerifyError::WrongPathExhausted(e, o) => write!(
                f,
                "the wrong path ended after {} of {} expected instructions",
                o, e
            ),
            VerifyError::NopCountMismatch(e, o) => {
                write!(f, "expected {} fabricated nops, got {}", e, o)
            }
            VerifyError::NotANop(a) => write!(f, "instruction at {:#x} is not a fabricated nop", a),
            VerifyError::EndNotReached => write!(f, "the guest has not reached its end"),
        }
    }
}
