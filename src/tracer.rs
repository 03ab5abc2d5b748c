//! Handles everything related to instruction tracing.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::{Config, TracerHook};
use crate::loader::Symbols;
use crate::protocol::InstInfo;

/// Structure that defines hooks handling instruction tracing operations.
///
/// # Role of Tracing in the Driver
///
/// The tracer does not take part in verification. It displays every instruction the driver
/// receives from the agent, on-path, wrong-path and fabricated alike, which helps understanding
/// where an observed stream departs from the expected one.
///
/// # Tracing Implementation
///
/// When tracing is enabled, [`FakeModel`](crate::driver::FakeModel) calls [`Tracer::trace`] on
/// each instruction in the order the agent reported them. It forwards the instruction to the
/// configured hook or, if none was set, prints a timestamped line to `stdout` where the address is
/// resolved against the guest's symbols.
pub struct Tracer {
    /// User hook replacing the default output.
    hook: Option<TracerHook>,
    /// Symbols of the traced guest.
    symbols: Symbols,
}

impl Tracer {
    /// Creates a tracer for a guest with `symbols`, if tracing is enabled in `config`.
    pub fn from_config(config: &Config, symbols: &Symbols) -> Option<Self> {
        if !config.tracer {
            return None;
        }
        Some(Self {
            hook: config.tracer_hook,
            symbols: symbols.clone(),
        })
    }

    /// Handles an observed instruction.
    pub fn trace(&self, info: &InstInfo) {
        match self.hook {
            Some(hook) => hook(info),
            None => println!("{}", self.format(info)),
        }
    }

    /// Formats the default trace line for `info`.
    pub fn format(&self, info: &InstInfo) -> String {
        Tracer::line(info, Some(&self.symbols))
    }

    /// Formats a trace line for `info`, resolving its address with `symbols` when given.
    pub fn line(info: &InstInfo, symbols: Option<&Symbols>) -> String {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let timestamp = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());
        let location = match symbols {
            Some(symbols) => symbols.format(info.addr),
            None => format!("{:#x}", info.addr),
        };
        format!(
            "[{}] {:<10} {}: {} {}",
            timestamp,
            info.path.to_string(),
            location,
            info.mnemonic,
            info.op_str
        )
        .trim_end()
        .to_string()
    }
}
