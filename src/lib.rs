//! Fetch-stream oracle for an instrumentation-driven x86-64 front-end model.
//!
//! A front-end model fetches its instructions from an instrumentation agent running a real guest
//! program. This crate checks that the stream of instruction addresses the model observes is the
//! exact stream the guest is expected to produce, on the right path as well as on wrong paths
//! injected after a mispredicted branch.
//!
//! ## Internals
//!
//! It is recommended to read the documentation in the following order.
//!
//! 1. Guest
//!     1. [Loader](loader::GuestImage)
//!     2. [Parsed binary](binary::ParsedBinary)
//!     3. [Reference guest builder](guest::GuestProgram)
//! 2. Oracle
//!     1. [Block layout](layout::BlockAddresses)
//!     2. [Expected streams](stream::BlockScript)
//!     3. [Wrong-path scenarios](scenario::WrongPathScenario)
//!     4. [Reference guest oracle](simple_loop::SimpleLoopInfo)
//! 3. Agent
//!     1. [Protocol](protocol::Command)
//!     2. [Agent](agent::Agent)
//!     3. [Emulator](agent::emulator::Emulator)
//! 4. Verification
//!     1. [Driver](driver::AgentDriver)
//!     2. [Harness](harness::Harness)
//!     3. [Tracing](tracer::Tracer)
//!  5. [Config](config::Config)
//!
//! ## Example
//!
//! ```no_run
//! use simloop::config::Config;
//! use simloop::harness::Harness;
//!
//! let harness = Harness::new(Config::builder().guest_path("./simple_loop").build())
//!     .expect("the guest does not match the reference layout");
//! for (scenario, result) in harness.run_all() {
//!     println!("{}: {:?}", scenario, result);
//! }
//! ```
//!
//! A guest matching the reference layout can be produced with
//! [`GuestProgram::write_elf`](guest::GuestProgram::write_elf).

pub mod agent;
pub mod binary;
pub mod config;
pub mod driver;
pub mod error;
pub mod guest;
pub mod harness;
pub mod layout;
pub mod loader;
pub mod protocol;
pub mod scenario;
pub mod simple_loop;
pub mod stream;
pub mod tracer;
