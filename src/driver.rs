//! Drives the instrumentation agent and verifies the instructions it reports.
//!
//! The oracle only sees the synchronous [`AgentDriver`] interface. [`FakeModel`] implements it on
//! top of an [`Agent`] running on its own thread: every operation is a sequence of
//! [`Command`]/[`Reply`] exchanges, each reply being awaited for at most the configured timeout.

use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;

use crate::agent::Agent;
use crate::config::Config;
use crate::error::*;
use crate::loader::GuestImage;
use crate::protocol::*;
use crate::tracer::Tracer;

// -----------------------------------------------------------------------------------------------
// Driver - Interface
// -----------------------------------------------------------------------------------------------

/// Operations a model must provide so that its fetch stream can be checked.
pub trait AgentDriver {
    /// Steps the model `expected.len()` times and compares every fetched address with the
    /// corresponding expected one.
    fn execute_and_verify(&mut self, expected: &[u64]) -> Result<()>;

    /// Redirects the model at `branch_addr` to `redirect_addr`, compares the wrong-path fetches
    /// with `expected` and recovers.
    fn fetch_wrongpath_and_verify(
        &mut self,
        branch_addr: u64,
        redirect_addr: u64,
        expected: &[u64],
    ) -> Result<()>;

    /// Redirects the model at `branch_addr` to `redirect_addr` and requests `count` fabricated
    /// NOPs, then recovers.
    fn fetch_wrongpath_nop_mode(
        &mut self,
        branch_addr: u64,
        redirect_addr: u64,
        count: usize,
    ) -> Result<()>;

    /// Returns `true` if the guest terminated with a zero exit status.
    fn has_reached_end(&mut self) -> Result<bool>;
}

// -----------------------------------------------------------------------------------------------
// Driver - Fake model
// -----------------------------------------------------------------------------------------------

/// A minimal model that forwards fetches to the agent without any timing.
pub struct FakeModel {
    /// Driver configuration.
    config: Config,
    /// Command channel to the agent.
    commands: Sender<Command>,
    /// Reply channel from the agent.
    replies: Receiver<Reply>,
    /// Agent thread handle, taken when the thread is joined or abandoned. Once taken, every
    /// request fails with [`DriverError::Disconnected`].
    join_handle: Option<JoinHandle<()>>,
    /// Called on every instruction received, if tracing is enabled.
    tracer: Option<Tracer>,
    /// Number of instructions received so far, all paths included.
    observed: u64,
}

impl FakeModel {
    /// Loads the guest named in `config` and launches an agent on it.
    pub fn new(config: Config) -> Result<Self> {
        let image = GuestImage::from_path(&config.guest_path)
            .map_err(|e| DriverError::Launch(format!("{:?}: {}", config.guest_path, e)))?;
        Self::from_image(&image, config)
    }

    /// Launches an agent on the guest at `path`, with the default configuration.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Config::builder().guest_path(path).build())
    }

    /// Launches an agent on an already loaded guest.
    pub fn from_image(image: &GuestImage, config: Config) -> Result<Self> {
        let agent = Agent::new(image, config.stack_size)
            .map_err(|e| DriverError::Launch(e.to_string()))?;
        let (commands, replies, join_handle) = agent.spawn()?;
        log::info!("launched agent for {} (entry {:#x})", image.name, image.entry);
        Ok(Self::from_channels(image, config, commands, replies, join_handle))
    }

    /// Wraps the channels of an agent thread already running on `image`.
    fn from_channels(
        image: &GuestImage,
        config: Config,
        commands: Sender<Command>,
        replies: Receiver<Reply>,
        join_handle: JoinHandle<()>,
    ) -> Self {
        Self {
            tracer: Tracer::from_config(&config, &image.symbols),
            config,
            commands,
            replies,
            join_handle: Some(join_handle),
            observed: 0,
        }
    }

    /// Number of instructions received from the agent so far.
    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// Sends a command and waits for its reply. Errors reported by the agent are returned as is.
    fn request(&mut self, command: Command) -> Result<Reply> {
        log::debug!("driver command: {:?}", command);
        if self.join_handle.is_none() {
            return Err(DriverError::Disconnected.into());
        }
        if self.commands.send(command).is_err() {
            return Err(self.disconnected());
        }
        match self.replies.recv_timeout(self.config.timeout) {
            Ok(Reply::Error(e)) => Err(e),
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                log::error!("no reply from the agent after {:?}", self.config.timeout);
                // A late reply would be taken for the answer to the next command.
                self.abandon();
                Err(DriverError::Timeout.into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// Joins the agent thread after its channel was closed, to find out whether it panicked.
    fn disconnected(&mut self) -> Error {
        let panicked = self
            .join_handle
            .take()
            .map_or(false, |handle| handle.join().is_err());
        log::error!("agent disconnected (panicked: {})", panicked);
        if panicked {
            DriverError::AgentPanicked.into()
        } else {
            DriverError::Disconnected.into()
        }
    }

    /// Stops talking to an agent whose replies can no longer be matched with commands. The agent
    /// is asked to terminate and its thread is detached rather than joined, since it may be the
    /// reason no reply came.
    fn abandon(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            log::warn!(
                "abandoning agent thread {}",
                handle.thread().name().unwrap_or("<unnamed>")
            );
            let _ = self.commands.send(Command::Terminate);
        }
    }

    /// Reports a reply that does not fit `command` and abandons the agent.
    fn unexpected(&mut self, command: &str, reply: &Reply) -> Error {
        log::error!("unexpected reply {:?} to {}", reply, command);
        self.abandon();
        DriverError::Protocol(format!("{:?} in response to {}", reply, command)).into()
    }

    /// Sends a command that must be acknowledged.
    fn command(&mut self, command: Command) -> Result<()> {
        let description = format!("{:?}", command);
        match self.request(command)? {
            Reply::Ack => Ok(()),
            reply => Err(self.unexpected(&description, &reply)),
        }
    }

    /// Fetches the next instruction. The inner error holds the reply received instead when the
    /// current path has no instruction left.
    fn fetch(&mut self) -> Result<std::result::Result<InstInfo, Reply>> {
        match self.request(Command::Fetch)? {
            Reply::Instruction(info) => {
                self.observed += 1;
                log::debug!("fetched {} ({})", info, info.path);
                if let Some(tracer) = &self.tracer {
                    tracer.trace(&info);
                }
                Ok(Ok(info))
            }
            reply @ (Reply::Exited(_) | Reply::WrongPathEnd) => Ok(Err(reply)),
            reply => Err(self.unexpected("Fetch", &reply)),
        }
    }

    /// Compares fetched addresses with `expected`, one fetch per expected address.
    fn verify(&mut self, expected: &[u64]) -> Result<()> {
        let mut mismatches = vec![];
        for (index, &expected_addr) in expected.iter().enumerate() {
            let info = match self.fetch()? {
                Ok(info) => info,
                Err(Reply::Exited(code)) => {
                    log::warn!(
                        "guest exited with status {} after {} of {} instructions",
                        code,
                        index,
                        expected.len()
                    );
                    return Err(VerifyError::PrematureTermination(expected.len(), index).into());
                }
                Err(_) => {
                    log::warn!(
                        "wrong path ended after {} of {} instructions",
                        index,
                        expected.len()
                    );
                    return Err(VerifyError::WrongPathExhausted(expected.len(), index).into());
                }
            };
            if info.addr != expected_addr {
                let mismatch = Mismatch {
                    index,
                    expected: expected_addr,
                    observed: info.addr,
                };
                log::warn!("{}", mismatch);
                mismatches.push(mismatch);
                if self.config.fail_fast {
                    break;
                }
            }
        }
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(VerifyError::AddressMismatch(mismatches).into())
        }
    }

    /// Collects exactly `count` fabricated NOPs.
    fn collect_nops(&mut self, count: usize) -> Result<()> {
        for fetched in 0..count {
            match self.fetch()? {
                Ok(info) if info.path == PathKind::FabricatedNop => {}
                Ok(info) => return Err(VerifyError::NotANop(info.addr).into()),
                Err(_) => return Err(VerifyError::NopCountMismatch(count, fetched).into()),
            }
        }
        // The agent must not produce more than what was requested.
        match self.fetch()? {
            Ok(_) => Err(VerifyError::NopCountMismatch(count, count + 1).into()),
            Err(_) => Ok(()),
        }
    }

    /// Redirects, runs `collect` on the wrong path and recovers, even if `collect` failed.
    fn speculate(
        &mut self,
        branch_addr: u64,
        redirect_addr: u64,
        mode: WrongPathMode,
        collect: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.command(Command::Redirect {
            branch_addr,
            redirect_addr,
            mode,
        })?;
        let collected = collect(self);
        let recovered = self.command(Command::Recover);
        collected?;
        recovered
    }
}

impl AgentDriver for FakeModel {
    fn execute_and_verify(&mut self, expected: &[u64]) -> Result<()> {
        log::info!("verifying {} on-path instruction(s)", expected.len());
        self.verify(expected)
    }

    fn fetch_wrongpath_and_verify(
        &mut self,
        branch_addr: u64,
        redirect_addr: u64,
        expected: &[u64],
    ) -> Result<()> {
        log::info!(
            "verifying {} wrong-path instruction(s) from {:#x} at {:#x}",
            expected.len(),
            redirect_addr,
            branch_addr
        );
        self.speculate(branch_addr, redirect_addr, WrongPathMode::Fetch, |model| {
            model.verify(expected)
        })
    }

    fn fetch_wrongpath_nop_mode(
        &mut self,
        branch_addr: u64,
        redirect_addr: u64,
        count: usize,
    ) -> Result<()> {
        log::info!(
            "requesting {} nop(s) at {:#x} from {:#x}",
            count,
            redirect_addr,
            branch_addr
        );
        self.speculate(
            branch_addr,
            redirect_addr,
            WrongPathMode::Nop { count },
            |model| model.collect_nops(count),
        )
    }

    fn has_reached_end(&mut self) -> Result<bool> {
        match self.request(Command::Status)? {
            Reply::Status(AgentStatus::Exited(code)) => {
                log::info!("guest exited with status {}", code);
                Ok(code == 0)
            }
            Reply::Status(status) => {
                log::debug!("agent status: {:?}", status);
                Ok(false)
            }
            reply => Err(self.unexpected("Status", &reply)),
        }
    }
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            if self.commands.send(Command::Terminate).is_ok() {
                let _ = self.replies.recv_timeout(self.config.timeout);
            }
            if handle.join().is_err() {
                log::error!("the agent thread panicked");
            }
        }
        log::info!(
            "agent terminated after {} observed instruction(s)",
            self.observed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::GuestProgram;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn model(config: Config) -> (FakeModel, GuestProgram) {
        let program = GuestProgram::simple_loop(10).unwrap();
        let image = GuestImage::from_bytes("simple_loop", &program.to_elf()).unwrap();
        (FakeModel::from_image(&image, config).unwrap(), program)
    }

    /// Runs an agent on a thread where `serve` answers each command in place of the agent loop.
    fn served(
        config: Config,
        mut serve: impl FnMut(&mut Agent, Command) -> Reply + Send + 'static,
    ) -> (FakeModel, GuestProgram) {
        let program = GuestProgram::simple_loop(10).unwrap();
        let image = GuestImage::from_bytes("simple_loop", &program.to_elf()).unwrap();
        let mut agent = Agent::new(&image, config.stack_size).unwrap();
        let (commands, command_rx) = channel::<Command>();
        let (reply_tx, replies) = channel::<Reply>();
        let handle = thread::spawn(move || {
            while let Ok(command) = command_rx.recv() {
                let terminate = command == Command::Terminate;
                if reply_tx.send(serve(&mut agent, command)).is_err() || terminate {
                    break;
                }
            }
        });
        (
            FakeModel::from_channels(&image, config, commands, replies, handle),
            program,
        )
    }

    /// On-path addresses up to the `je` closing the first block.
    fn prefix(program: &GuestProgram) -> [u64; 4] {
        let base = program.base();
        // xor eax, eax ; xor ebx, ebx ; mov ecx, eax ; and ecx, 1
        [base, base + 2, base + 4, base + 6]
    }

    #[test]
    fn driver_collects_mismatches() {
        let (mut model, program) = model(Config::builder().build());
        let base = program.base();
        // xor eax, eax ; xor ebx, ebx ; mov ecx, eax
        let expected = [base, base + 1, base + 5];
        match model.execute_and_verify(&expected) {
            Err(Error::Verify(VerifyError::AddressMismatch(m))) => {
                assert_eq!(m.len(), 2);
                assert_eq!(m[0].index, 1);
                assert_eq!(m[0].expected, base + 1);
                assert_eq!(m[0].observed, base + 2);
            }
            r => panic!("unexpected result {:?}", r),
        }
        assert_eq!(model.observed(), 3);
        assert_eq!(model.has_reached_end(), Ok(false));
    }

    #[test]
    fn driver_fail_fast() {
        let (mut model, program) = model(Config::builder().fail_fast(true).build());
        let base = program.base();
        match model.execute_and_verify(&[base + 1, base + 2, base + 4]) {
            Err(Error::Verify(VerifyError::AddressMismatch(m))) => assert_eq!(m.len(), 1),
            r => panic!("unexpected result {:?}", r),
        }
        assert_eq!(model.observed(), 1);
    }

    #[test]
    fn driver_reports_agent_errors() {
        let (mut model, program) = model(Config::builder().build());
        assert_eq!(
            model.fetch_wrongpath_nop_mode(program.base() + 2, program.base(), 10),
            Err(Error::Agent(AgentError::BranchMismatch(
                program.base() + 2,
                program.base()
            )))
        );
        // The failed redirect left the agent on the right path.
        assert_eq!(model.execute_and_verify(&[program.base()]), Ok(()));
    }

    #[test]
    fn driver_detects_dead_agent() {
        let (mut model, _) = model(Config::builder().build());
        // The agent thread exits once the reply channel is dropped.
        model.command(Command::Terminate).unwrap();
        assert!(matches!(
            model.has_reached_end(),
            Err(Error::Driver(DriverError::Disconnected))
        ));
    }

    #[test]
    fn driver_abandons_agent_after_timeout() {
        let config = Config::builder().timeout(Duration::from_millis(10)).build();
        let (mut model, program) = served(config, |agent, command| {
            thread::sleep(Duration::from_millis(100));
            agent.handle(command)
        });
        assert_eq!(
            model.has_reached_end(),
            Err(Error::Driver(DriverError::Timeout))
        );
        // By now the status reply is waiting in the channel, it must not answer a fetch.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(
            model.execute_and_verify(&[program.base()]),
            Err(Error::Driver(DriverError::Disconnected))
        );
        assert_eq!(
            model.has_reached_end(),
            Err(Error::Driver(DriverError::Disconnected))
        );
        assert_eq!(model.observed(), 0);
    }

    #[test]
    fn driver_checks_nop_count() {
        // The agent is asked for one nop less, then one more, than the driver expects.
        for (served_count, observed) in [(9, 9), (11, 11)] {
            let (mut model, program) = served(Config::builder().build(), move |agent, command| {
                match command {
                    Command::Redirect {
                        branch_addr,
                        redirect_addr,
                        mode: WrongPathMode::Nop { .. },
                    } => agent.handle(Command::Redirect {
                        branch_addr,
                        redirect_addr,
                        mode: WrongPathMode::Nop {
                            count: served_count,
                        },
                    }),
                    command => agent.handle(command),
                }
            });
            let base = program.base();
            model.execute_and_verify(&prefix(&program)).unwrap();
            assert_eq!(
                model.fetch_wrongpath_nop_mode(base + 9, base, 10),
                Err(Error::Verify(VerifyError::NopCountMismatch(10, observed)))
            );
            // The agent was recovered and resumes at the branch.
            assert_eq!(model.execute_and_verify(&[base + 9]), Ok(()));
        }
    }

    #[test]
    fn driver_rejects_real_instructions_as_nops() {
        let recovered = Arc::new(AtomicBool::new(false));
        let flag = recovered.clone();
        // Redirects are acknowledged but never applied, so fetches stay on-path.
        let (mut model, program) = served(Config::builder().build(), move |agent, command| {
            match command {
                Command::Redirect { .. } => Reply::Ack,
                Command::Recover => {
                    flag.store(true, Ordering::SeqCst);
                    Reply::Ack
                }
                command => agent.handle(command),
            }
        });
        let base = program.base();
        model.execute_and_verify(&prefix(&program)).unwrap();
        assert_eq!(
            model.fetch_wrongpath_nop_mode(base + 9, base, 10),
            Err(Error::Verify(VerifyError::NotANop(base + 9)))
        );
        assert!(recovered.load(Ordering::SeqCst));
        assert_eq!(model.observed(), 5);
    }
}
