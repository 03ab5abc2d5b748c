//! The instrumentation agent.
//!
//! The agent owns the guest: its address space, its register file and a decoder. It runs on a
//! dedicated thread and serves [`Command`]s received from the driver, answering each one with a
//! single [`Reply`].
//!
//! # Fetch & Speculation
//!
//! On the right path, every [`Command::Fetch`] decodes and executes the instruction at `rip` and
//! reports it. A [`Command::Redirect`] is only accepted at the branch the guest is about to
//! execute. The agent then checkpoints the CPU and the address space, and moves its fetch address
//! to the redirect target:
//!
//!  * in [`WrongPathMode::Fetch`], instructions are fetched and executed speculatively from the
//!    redirect target. The wrong path ends at a `syscall` (reported, never executed) or at the
//!    first address that cannot be fetched or executed;
//!  * in [`WrongPathMode::Nop`], the agent fabricates one-byte NOPs at consecutive addresses
//!    starting at the redirect target, until the requested count is reached.
//!
//! Once the wrong path has ended, fetches are answered with [`Reply::WrongPathEnd`].
//! [`Command::Recover`] restores the checkpoint: the next fetch is the branch itself.

pub mod cpu;
pub mod emulator;
pub mod memory;

use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::error::*;
use crate::loader::GuestImage;
use crate::protocol::*;

use cpu::Cpu;
use emulator::{Decoder, Emulator, Step};
use memory::{GuestMemory, STACK_TOP};

/// Gap left between the initial stack pointer and the top of the stack.
const STACK_RED_ZONE: u64 = 0x100;

/// Speculative state, from a redirect to the matching recovery.
struct Speculation {
    /// Branch the agent was redirected at.
    branch_addr: u64,
    /// First wrong-path address.
    redirect_addr: u64,
    /// How wrong-path instructions are produced.
    mode: WrongPathMode,
    /// Number of wrong-path instructions reported so far.
    fetched: usize,
    /// Set once the wrong path cannot produce instructions anymore.
    ended: bool,
    /// CPU state at the redirect.
    cpu: Cpu,
    /// Address space at the redirect.
    memory: GuestMemory,
}

/// The instrumentation agent.
pub struct Agent {
    /// Guest name.
    name: String,
    /// Guest registers.
    cpu: Cpu,
    /// Guest address space.
    memory: GuestMemory,
    /// Cached instruction decoder.
    decoder: Decoder,
    /// Wrong-path state, if the agent has been redirected.
    speculation: Option<Speculation>,
    /// Exit status, once the guest has exited.
    exit_status: Option<i32>,
    /// Number of instructions executed on the right path.
    retired: u64,
}

impl Agent {
    /// Creates an agent ready to execute `image` from its entry point, with a `stack_size`-byte
    /// stack.
    pub fn new(image: &GuestImage, stack_size: usize) -> Result<Self> {
        if (stack_size as u64) < STACK_RED_ZONE {
            return Err(AgentError::Generic(format!("stack too small: {:#x}", stack_size)).into());
        }
        let memory = GuestMemory::from_image(image, stack_size)?;
        Ok(Self {
            name: image.name.clone(),
            cpu: Cpu::new(image.entry, STACK_TOP - STACK_RED_ZONE),
            memory,
            decoder: Decoder::new(),
            speculation: None,
            exit_status: None,
            retired: 0,
        })
    }

    /// Moves the agent to its own thread.
    ///
    /// Returns the channel ends the driver talks through and the thread handle. The thread stops
    /// on [`Command::Terminate`] or when the command channel is closed.
    pub fn spawn(self) -> Result<(Sender<Command>, Receiver<Reply>, JoinHandle<()>)> {
        let (cmd_tx, cmd_rx) = channel::<Command>();
        let (reply_tx, reply_rx) = channel::<Reply>();
        let handle = thread::Builder::new()
            .name(format!("agent_{}", self.name))
            .spawn(move || self.run(cmd_rx, reply_tx))
            .map_err(|e| DriverError::Launch(e.to_string()))?;
        Ok((cmd_tx, reply_rx, handle))
    }

    /// Command loop.
    fn run(mut self, commands: Receiver<Command>, replies: Sender<Reply>) {
        log::info!("agent started for {}", self.name);
        while let Ok(command) = commands.recv() {
            log::debug!("agent command: {:?}", command);
            let terminate = command == Command::Terminate;
            let reply = self.handle(command);
            if replies.send(reply).is_err() || terminate {
                break;
            }
        }
        log::info!(
            "agent stopped for {} after {} instruction(s)",
            self.name,
            self.retired
        );
    }

    /// Applies a command and builds its reply.
    pub fn handle(&mut self, command: Command) -> Reply {
        let reply = match command {
            Command::Fetch => self.fetch(),
            Command::Redirect {
                branch_addr,
                redirect_addr,
                mode,
            } => self
                .redirect(branch_addr, redirect_addr, mode)
                .map(|_| Reply::Ack),
            Command::Recover => self.recover().map(|_| Reply::Ack),
            Command::Status => Ok(Reply::Status(self.status())),
            Command::Terminate => Ok(Reply::Ack),
        };
        reply.unwrap_or_else(|e| {
            log::error!("agent error: {}", e);
            Reply::Error(e)
        })
    }

    /// Current agent state.
    pub fn status(&self) -> AgentStatus {
        match (&self.speculation, self.exit_status) {
            (Some(s), _) => AgentStatus::Speculating {
                branch_addr: s.branch_addr,
                fetched: s.fetched,
            },
            (None, Some(code)) => AgentStatus::Exited(code),
            (None, None) => AgentStatus::Running {
                next_addr: self.cpu.rip,
            },
        }
    }

    fn fetch(&mut self) -> Result<Reply> {
        if self.speculation.is_some() {
            return Ok(self.fetch_wrongpath());
        }
        if let Some(code) = self.exit_status {
            return Ok(Reply::Exited(code));
        }
        let insn = self.decoder.decode(&self.memory, self.cpu.rip)?;
        let info = InstInfo {
            addr: insn.addr,
            size: insn.size,
            mnemonic: insn.mnemonic.clone(),
            op_str: insn.op_str.clone(),
            path: PathKind::OnPath,
        };
        match Emulator::execute(insn, &mut self.cpu, &mut self.memory)? {
            Step::Continue => {}
            Step::Exit(code) => {
                log::info!("{} exited with status {}", self.name, code);
                self.exit_status = Some(code);
            }
        }
        self.retired += 1;
        Ok(Reply::Instruction(info))
    }

    fn fetch_wrongpath(&mut self) -> Reply {
        let current = match self.speculation.as_mut() {
            Some(current) => current,
            None => return Reply::WrongPathEnd,
        };
        if current.ended {
            return Reply::WrongPathEnd;
        }
        let info = match current.mode {
            WrongPathMode::Nop { count } => {
                if current.fetched >= count {
                    current.ended = true;
                    return Reply::WrongPathEnd;
                }
                InstInfo::fabricated_nop(current.redirect_addr + current.fetched as u64)
            }
            WrongPathMode::Fetch => {
                let insn = match self.decoder.decode(&self.memory, self.cpu.rip) {
                    Ok(insn) => insn,
                    Err(e) => {
                        log::debug!("wrong path ended: {}", e);
                        current.ended = true;
                        return Reply::WrongPathEnd;
                    }
                };
                let info = InstInfo {
                    addr: insn.addr,
                    size: insn.size,
                    mnemonic: insn.mnemonic.clone(),
                    op_str: insn.op_str.clone(),
                    path: PathKind::WrongPath,
                };
                if insn.is_syscall() {
                    current.ended = true;
                } else if let Err(e) = Emulator::execute(insn, &mut self.cpu, &mut self.memory) {
                    // The instruction was fetched, nothing past it can be.
                    log::debug!("wrong path ended after {:#x}: {}", insn.addr, e);
                    current.ended = true;
                }
                info
            }
        };
        current.fetched += 1;
        Reply::Instruction(info)
    }

    fn redirect(&mut self, branch_addr: u64, redirect_addr: u64, mode: WrongPathMode) -> Result<()> {
        if self.speculation.is_some() {
            return Err(AgentError::AlreadySpeculating.into());
        }
        if let Some(code) = self.exit_status {
            return Err(AgentError::GuestExited(code).into());
        }
        if self.cpu.rip != branch_addr {
            return Err(AgentError::BranchMismatch(branch_addr, self.cpu.rip).into());
        }
        log::debug!(
            "redirect at {:#x} to {:#x} ({:?})",
            branch_addr,
            redirect_addr,
            mode
        );
        self.speculation = Some(Speculation {
            branch_addr,
            redirect_addr,
            mode,
            fetched: 0,
            ended: false,
            cpu: self.cpu.clone(),
            memory: self.memory.clone(),
        });
        if mode == WrongPathMode::Fetch {
            self.cpu.rip = redirect_addr;
        }
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        let current = self
            .speculation
            .take()
            .ok_or(AgentError::NotSpeculating)?;
        log::debug!(
            "recover at {:#x} after {} wrong-path instruction(s)",
            current.branch_addr,
            current.fetched
        );
        self.cpu = current.cpu;
        self.memory = current.memory;
        Ok(())
    }
}
