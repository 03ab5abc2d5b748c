//! Implements the driver configuration builder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::InstInfo;
use crate::simple_loop::DEFAULT_ITERATIONS;

/// Path of the reference guest, overridable at build time with the `SIMPLE_LOOP` environment
/// variable.
pub const SIMPLE_LOOP: &str = match option_env!("SIMPLE_LOOP") {
    Some(path) => path,
    None => "./simple_loop",
};

/// Default number of NOPs requested from the agent in wrong-path NOP mode.
pub const DEFAULT_NOP_COUNT: usize = 10;

/// Default size of the guest stack.
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Hook called on every instruction observed by the driver.
pub type TracerHook = fn(&InstInfo);

/// Structure that contains the different configuration options of the driver and the oracle.
///
/// # Example
///
/// ```
/// use simloop::config::Config;
///
/// // Checks `/tmp/simple_loop`, waits at most one second for each agent reply and stops on the
/// // first address mismatch.
/// let config = Config::builder()
///     .guest_path("/tmp/simple_loop")
///     .timeout(std::time::Duration::new(1, 0))
///     .fail_fast(true)
///     .build();
/// assert_eq!(config.nop_count(), 10);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the guest executable.
    pub(crate) guest_path: PathBuf,
    /// Maximum duration the driver waits for a reply from the agent.
    pub(crate) timeout: Duration,
    /// Number of NOPs requested in wrong-path NOP mode.
    pub(crate) nop_count: usize,
    /// Trip count of the guest loop.
    pub(crate) loop_iterations: usize,
    /// Stops verifying at the first address mismatch if set to `true`.
    pub(crate) fail_fast: bool,
    /// Size of the guest stack.
    pub(crate) stack_size: usize,
    /// Enables instruction tracing if set to `true`.
    pub(crate) tracer: bool,
    /// Sets the tracing hook.
    pub(crate) tracer_hook: Option<TracerHook>,
}

impl Config {
    /// Creates a new builder instance initialized with the default configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Path to the guest executable.
    pub fn guest_path(&self) -> &Path {
        &self.guest_path
    }

    /// Maximum duration the driver waits for a reply from the agent.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of NOPs requested in wrong-path NOP mode.
    pub fn nop_count(&self) -> usize {
        self.nop_count
    }

    /// Trip count of the guest loop.
    pub fn loop_iterations(&self) -> usize {
        self.loop_iterations
    }
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/// Configuration builder.
pub struct ConfigBuilder {
    /// The inner configuration object.
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new configuration builder.
    fn new() -> Self {
        Self {
            config: Config {
                guest_path: PathBuf::from(SIMPLE_LOOP),
                timeout: Duration::new(3, 0),
                nop_count: DEFAULT_NOP_COUNT,
                loop_iterations: DEFAULT_ITERATIONS,
                fail_fast: false,
                stack_size: DEFAULT_STACK_SIZE,
                tracer: false,
                tracer_hook: None,
            },
        }
    }

    /// Returns the [`Config`] object built with the current [`ConfigBuilder`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Sets the path to the guest executable.
    pub fn guest_path(mut self, guest_path: impl AsRef<Path>) -> Self {
        self.config.guest_path = guest_path.as_ref().to_owned();
        self
    }

    /// Sets the duration after which a missing reply from the agent is reported.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Sets the number of NOPs requested in wrong-path NOP mode.
    pub fn nop_count(mut self, nop_count: usize) -> Self {
        self.config.nop_count = nop_count;
        self
    }

    /// Sets the trip count of the guest loop.
    pub fn loop_iterations(mut self, loop_iterations: usize) -> Self {
        self.config.loop_iterations = loop_iterations;
        self
    }

    /// Makes the first address mismatch fatal if set to `true`.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    /// Sets the size of the guest stack.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.config.stack_size = stack_size;
        self
    }

    /// Enables tracing if set to `true`.
    pub fn tracer(mut self, tracer: bool) -> Self {
        self.config.tracer = tracer;
        self
    }

    /// Enables tracing by setting the tracer hook.
    pub fn tracer_hook(mut self, tracer_hook: TracerHook) -> Self {
        self.config.tracer = true;
        self.config.tracer_hook = Some(tracer_hook);
        self
    }
}
