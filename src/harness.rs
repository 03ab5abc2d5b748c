//! Runs the reference scenarios against an [`AgentDriver`].
//!
//! Each scenario is a straight sequence of driver calls derived from the oracle. The
//! [`Harness`] verifies the guest layout once, before launching any agent, then gives every
//! scenario its own [`FakeModel`], dropped as soon as the scenario returns.

use std::fmt;

use crate::binary::ParsedBinary;
use crate::config::Config;
use crate::driver::{AgentDriver, FakeModel};
use crate::error::*;
use crate::loader::GuestImage;
use crate::scenario::WrongPathScenario;
use crate::simple_loop::SimpleLoopInfo;

/// The reference scenarios.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Scenario {
    /// Runs the whole on-path stream.
    OnPath,
    /// Fetches and recovers a wrong path made of guest code.
    NormalWrongPath,
    /// Fetches and recovers a wrong path made of fabricated NOPs.
    WrongPathNopMode,
}

impl Scenario {
    /// All the scenarios, in the order they are run.
    pub const ALL: [Scenario; 3] = [
        Scenario::OnPath,
        Scenario::NormalWrongPath,
        Scenario::WrongPathNopMode,
    ];
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scenario::OnPath => "OnPathExecutesCorrectly",
            Scenario::NormalWrongPath => "CanFetchAndRecoverNormalWrongPath",
            Scenario::WrongPathNopMode => "CanFetchAndRecoverWrongPathNopMode",
        };
        write!(f, "{}", name)
    }
}

/// Fails with [`VerifyError::EndNotReached`] if the guest has not terminated cleanly.
fn ensure_end(driver: &mut impl AgentDriver) -> Result<()> {
    if driver.has_reached_end()? {
        Ok(())
    } else {
        Err(VerifyError::EndNotReached.into())
    }
}

/// Runs the on-path stream and checks the guest terminated.
pub fn run_on_path(driver: &mut impl AgentDriver, info: &SimpleLoopInfo) -> Result<()> {
    driver.execute_and_verify(&info.expected_addresses())?;
    ensure_end(driver)
}

/// Runs a wrong-path scenario: the prefix, the wrong path and its recovery, then the suffix.
/// `nop_count` NOPs are requested when the scenario is in NOP mode.
pub fn run_wrongpath(
    driver: &mut impl AgentDriver,
    scenario: &WrongPathScenario,
    nop_count: usize,
) -> Result<()> {
    driver.execute_and_verify(&scenario.prefix)?;
    if scenario.nop_mode {
        driver.fetch_wrongpath_nop_mode(
            scenario.branch_instruction_addr,
            scenario.redirect_fetch_addr,
            nop_count,
        )?;
    } else {
        driver.fetch_wrongpath_and_verify(
            scenario.branch_instruction_addr,
            scenario.redirect_fetch_addr,
            &scenario.wrongpath_stream,
        )?;
    }
    driver.execute_and_verify(&scenario.suffix)?;
    ensure_end(driver)
}

/// Runs the normal wrong-path scenario.
pub fn run_normal_wrongpath(driver: &mut impl AgentDriver, info: &SimpleLoopInfo) -> Result<()> {
    run_wrongpath(driver, &info.normal_wrongpath_test_info()?, 0)
}

/// Runs the NOP-mode wrong-path scenario, requesting `nop_count` NOPs.
pub fn run_wrongpath_nop_mode(
    driver: &mut impl AgentDriver,
    info: &SimpleLoopInfo,
    nop_count: usize,
) -> Result<()> {
    run_wrongpath(driver, &info.wrongpath_nop_mode_test_info()?, nop_count)
}

/// Verified guest, ready to run scenarios.
pub struct Harness {
    /// Configuration shared by every model.
    config: Config,
    /// Loaded guest.
    image: GuestImage,
    /// Oracle bound to the guest's layout.
    info: SimpleLoopInfo,
}

impl Harness {
    /// Loads the guest named in `config` and binds its layout. Fails before any agent is
    /// launched if the guest does not match the reference layout.
    pub fn new(config: Config) -> Result<Self> {
        let image = GuestImage::from_path(&config.guest_path)?;
        let binary = ParsedBinary::from_image(&image)?;
        let info = SimpleLoopInfo::with_iterations(&binary, config.loop_iterations)?;
        log::info!(
            "{}: layout verified, {} on-path instruction(s)",
            image.name,
            info.expected_addresses().len()
        );
        Ok(Self {
            config,
            image,
            info,
        })
    }

    /// The oracle.
    pub fn info(&self) -> &SimpleLoopInfo {
        &self.info
    }

    /// Runs `scenario` on a fresh model.
    pub fn run(&self, scenario: Scenario) -> Result<()> {
        log::info!("running {}", scenario);
        let mut model = FakeModel::from_image(&self.image, self.config.clone())?;
        let result = match scenario {
            Scenario::OnPath => run_on_path(&mut model, &self.info),
            Scenario::NormalWrongPath => run_normal_wrongpath(&mut model, &self.info),
            Scenario::WrongPathNopMode => {
                run_wrongpath_nop_mode(&mut model, &self.info, self.config.nop_count)
            }
        };
        match &result {
            Ok(_) => log::info!("{} passed", scenario),
            Err(e) => log::error!("{} failed: {}", scenario, e),
        }
        result
    }

    /// Runs every scenario and returns their outcomes.
    pub fn run_all(&self) -> Vec<(Scenario, Result<()>)> {
        Scenario::ALL
            .iter()
            .map(|&scenario| (scenario, self.run(scenario)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BlockMnemonics;

    /// Records driver calls.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        ended: bool,
    }

    impl AgentDriver for Recorder {
        fn execute_and_verify(&mut self, expected: &[u64]) -> Result<()> {
            self.calls.push(format!("execute {}", expected.len()));
            Ok(())
        }

        fn fetch_wrongpath_and_verify(&mut self, b: u64, r: u64, e: &[u64]) -> Result<()> {
            self.calls.push(format!("wrongpath {:#x} {:#x} {}", b, r, e.len()));
            Ok(())
        }

        fn fetch_wrongpath_nop_mode(&mut self, b: u64, r: u64, count: usize) -> Result<()> {
            self.calls.push(format!("nop {:#x} {:#x} {}", b, r, count));
            Ok(())
        }

        fn has_reached_end(&mut self) -> Result<bool> {
            Ok(self.ended)
        }
    }

    fn info() -> SimpleLoopInfo {
        let listing = BlockMnemonics::simple_loop()
            .iter()
            .flat_map(|(_, m)| m.iter())
            .enumerate()
            .map(|(i, m)| (0x1000 + 4 * i as u64, m.to_string()))
            .collect::<Vec<_>>();
        SimpleLoopInfo::new(&ParsedBinary::new(listing).unwrap()).unwrap()
    }

    #[test]
    fn harness_call_sequences() {
        let info = info();
        let mut driver = Recorder {
            ended: true,
            ..Default::default()
        };
        run_on_path(&mut driver, &info).unwrap();
        run_normal_wrongpath(&mut driver, &info).unwrap();
        run_wrongpath_nop_mode(&mut driver, &info, 10).unwrap();
        assert_eq!(
            driver.calls,
            [
                "execute 70",
                "execute 10",
                "wrongpath 0x1010 0x1018 58",
                "execute 60",
                "execute 4",
                "nop 0x1010 0x1030 10",
                "execute 66",
            ]
        );
    }

    #[test]
    fn harness_requires_end() {
        let mut driver = Recorder::default();
        assert_eq!(
            run_on_path(&mut driver, &info()),
            Err(Error::Verify(VerifyError::EndNotReached))
        );
    }

    #[test]
    fn scenario_names() {
        let names = Scenario::ALL.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            names,
            [
                "OnPathExecutesCorrectly",
                "CanFetchAndRecoverNormalWrongPath",
                "CanFetchAndRecoverWrongPathNopMode",
            ]
        );
    }
}
