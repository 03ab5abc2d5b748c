// -----------------------------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use simloop::binary::*;
    use simloop::config::*;
    use simloop::driver::*;
    use simloop::error::*;
    use simloop::guest::*;
    use simloop::harness::*;
    use simloop::layout::*;
    use simloop::loader::*;
    use simloop::protocol::*;
    use simloop::simple_loop::*;
    use simloop::tracer::*;

    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    /// Writes the reference guest into a temporary directory.
    fn simple_loop(iterations: usize) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simple_loop");
        GuestProgram::simple_loop(iterations)
            .unwrap()
            .write_elf(&path)
            .unwrap();
        (dir, path)
    }

    /// Loads the reference guest and binds its layout.
    fn oracle(path: &PathBuf) -> SimpleLoopInfo {
        SimpleLoopInfo::new(&ParsedBinary::from_path(path).unwrap()).unwrap()
    }

    // -------------------------------------------------------------------------------------------
    // Guest & Layout

    #[test]
    fn guest_layout_binds() {
        let (_dir, path) = simple_loop(10);
        let image = GuestImage::from_path(&path).unwrap();
        assert_eq!(image.entry, TEXT_ADDR);
        assert!(image.symbol_address("wrongpath_loop").is_ok());
        assert_eq!(
            image.symbol_address("main"),
            Err(Error::Loader(LoaderError::UnknownSymbol("main".to_string())))
        );
        let info = oracle(&path);
        let addresses = info.addresses();
        assert_eq!(addresses[BasicBlockId::Init][0], TEXT_ADDR);
        assert_eq!(
            image.symbol_address("loop_exit_block"),
            Ok(addresses[BasicBlockId::LoopExitBlock][0])
        );
        let flat = addresses
            .iter()
            .flat_map(|(_, a)| a.iter().copied())
            .collect::<Vec<_>>();
        assert_eq!(flat.len(), BlockMnemonics::simple_loop().total_len());
        assert!(flat.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn guest_objdump_listing() {
        let (_dir, path) = simple_loop(10);
        // Skipped when binutils is not installed.
        let listing = match ParsedBinary::objdump(&path) {
            Ok(listing) => listing,
            Err(_) => return,
        };
        assert_eq!(
            listing.iter().collect::<Vec<_>>(),
            ParsedBinary::from_path(&path).unwrap().iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn layout_mismatch_is_fatal() {
        // xor eax, eax ; nop
        let binary = ParsedBinary::from_code(&[0x31, 0xc0, 0x90], 0x1000).unwrap();
        match SimpleLoopInfo::new(&binary) {
            Err(Error::Layout(LayoutError::BinaryLayoutMismatch {
                block,
                position,
                expected,
                observed,
            })) => {
                assert_eq!(block, BasicBlockId::Init);
                assert_eq!(position, 1);
                assert_eq!(expected, "xor");
                assert_eq!(observed.as_deref(), Some("nop"));
            }
            r => panic!("unexpected result {:?}", r),
        }
    }

    #[test]
    fn harness_rejects_invalid_guests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_an_elf");
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        assert!(matches!(
            Harness::new(Config::builder().guest_path(&path).build()),
            Err(Error::Loader(_))
        ));
        assert!(matches!(
            FakeModel::from_path(dir.path().join("missing")),
            Err(Error::Driver(DriverError::Launch(_)))
        ));
    }

    // -------------------------------------------------------------------------------------------
    // Scenarios

    #[test]
    fn on_path_executes_correctly() {
        let (_dir, path) = simple_loop(10);
        let info = oracle(&path);
        let expected = info.expected_addresses();
        assert_eq!(expected.len(), 70);
        let mut model = FakeModel::from_path(&path).unwrap();
        model.execute_and_verify(&expected).unwrap();
        assert_eq!(model.has_reached_end(), Ok(true));
    }

    #[test]
    fn can_fetch_and_recover_normal_wrongpath() {
        let (_dir, path) = simple_loop(10);
        let info = oracle(&path);
        let scenario = info.normal_wrongpath_test_info().unwrap();
        assert_eq!(scenario.prefix.len(), 10);
        assert_eq!(scenario.wrongpath_stream.len(), 58);
        let mut model = FakeModel::from_path(&path).unwrap();
        model.execute_and_verify(&scenario.prefix).unwrap();
        model
            .fetch_wrongpath_and_verify(
                scenario.branch_instruction_addr,
                scenario.redirect_fetch_addr,
                &scenario.wrongpath_stream,
            )
            .unwrap();
        // The wrong path ran to the exit syscall, the guest must still be alive.
        assert_eq!(model.has_reached_end(), Ok(false));
        model.execute_and_verify(&scenario.suffix).unwrap();
        assert_eq!(model.has_reached_end(), Ok(true));
        assert_eq!(model.observed(), 70 + 58);
    }

    #[test]
    fn can_fetch_and_recover_wrongpath_nop_mode() {
        let (_dir, path) = simple_loop(10);
        let info = oracle(&path);
        let scenario = info.wrongpath_nop_mode_test_info().unwrap();
        assert!(scenario.nop_mode && scenario.wrongpath_stream.is_empty());
        let mut model = FakeModel::from_path(&path).unwrap();
        model.execute_and_verify(&scenario.prefix).unwrap();
        model
            .fetch_wrongpath_nop_mode(
                scenario.branch_instruction_addr,
                scenario.redirect_fetch_addr,
                DEFAULT_NOP_COUNT,
            )
            .unwrap();
        model.execute_and_verify(&scenario.suffix).unwrap();
        assert_eq!(model.has_reached_end(), Ok(true));
    }

    #[test]
    fn harness_runs_all_scenarios() {
        let (_dir, path) = simple_loop(10);
        let harness = Harness::new(Config::builder().guest_path(&path).nop_count(3).build())
            .unwrap();
        for (scenario, result) in harness.run_all() {
            assert_eq!(result, Ok(()), "{} failed", scenario);
        }
    }

    #[test]
    fn harness_other_trip_counts() {
        let (_dir, path) = simple_loop(4);
        let config = Config::builder().guest_path(&path).loop_iterations(4).build();
        let harness = Harness::new(config).unwrap();
        assert_eq!(harness.info().expected_addresses().len(), 2 + 4 * 6 + 2 + 3);
        for scenario in Scenario::ALL {
            assert_eq!(harness.run(scenario), Ok(()));
        }
    }

    // -------------------------------------------------------------------------------------------
    // Failures

    #[test]
    fn wrong_trip_count_mismatches() {
        let (_dir, path) = simple_loop(10);
        let config = Config::builder().guest_path(&path).loop_iterations(8).build();
        let harness = Harness::new(config).unwrap();
        assert!(matches!(
            harness.run(Scenario::OnPath),
            Err(Error::Verify(VerifyError::AddressMismatch(_)))
        ));
    }

    #[test]
    fn premature_termination() {
        let (_dir, path) = simple_loop(10);
        let mut expected = oracle(&path).expected_addresses();
        expected.push(TEXT_ADDR);
        let mut model = FakeModel::from_path(&path).unwrap();
        assert_eq!(
            model.execute_and_verify(&expected),
            Err(Error::Verify(VerifyError::PrematureTermination(71, 70)))
        );
        // The guest exited anyway.
        assert_eq!(model.has_reached_end(), Ok(true));
    }

    #[test]
    fn end_not_reached() {
        let (_dir, path) = simple_loop(10);
        let expected = oracle(&path).expected_addresses();
        let mut model = FakeModel::from_path(&path).unwrap();
        model.execute_and_verify(&expected[..69]).unwrap();
        assert_eq!(model.has_reached_end(), Ok(false));
    }

    #[test]
    fn wrongpath_failures_still_recover() {
        let (_dir, path) = simple_loop(10);
        let scenario = oracle(&path).normal_wrongpath_test_info().unwrap();
        let mut model = FakeModel::from_path(&path).unwrap();
        model.execute_and_verify(&scenario.prefix).unwrap();
        // Two more instructions than the wrong path holds.
        let mut wrongpath = scenario.wrongpath_stream.clone();
        wrongpath.extend([TEXT_ADDR, TEXT_ADDR]);
        assert_eq!(
            model.fetch_wrongpath_and_verify(
                scenario.branch_instruction_addr,
                scenario.redirect_fetch_addr,
                &wrongpath,
            ),
            Err(Error::Verify(VerifyError::WrongPathExhausted(60, 58)))
        );
        // Redirecting to the wrong block only produces mismatches.
        let mut wrongpath = scenario.wrongpath_stream.clone();
        wrongpath[0] += 1;
        match model.fetch_wrongpath_and_verify(
            scenario.branch_instruction_addr,
            scenario.redirect_fetch_addr,
            &wrongpath,
        ) {
            Err(Error::Verify(VerifyError::AddressMismatch(m))) => {
                assert_eq!(m.len(), 1);
                assert_eq!(m[0].index, 0);
            }
            r => panic!("unexpected result {:?}", r),
        }
        model.execute_and_verify(&scenario.suffix).unwrap();
        assert_eq!(model.has_reached_end(), Ok(true));
    }

    #[test]
    fn redirect_at_wrong_branch() {
        let (_dir, path) = simple_loop(10);
        let scenario = oracle(&path).wrongpath_nop_mode_test_info().unwrap();
        let mut model = FakeModel::from_path(&path).unwrap();
        model.execute_and_verify(&scenario.prefix[..3]).unwrap();
        assert_eq!(
            model.fetch_wrongpath_nop_mode(
                scenario.branch_instruction_addr,
                scenario.redirect_fetch_addr,
                10
            ),
            Err(Error::Agent(AgentError::BranchMismatch(
                scenario.branch_instruction_addr,
                scenario.prefix[3]
            )))
        );
    }

    // -------------------------------------------------------------------------------------------
    // Tracer

    static TRACED: AtomicUsize = AtomicUsize::new(0);
    static TRACED_NOPS: AtomicUsize = AtomicUsize::new(0);

    fn count_hook(info: &InstInfo) {
        TRACED.fetch_add(1, Ordering::SeqCst);
        if info.path == PathKind::FabricatedNop {
            TRACED_NOPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tracer_sees_every_instruction() {
        let (_dir, path) = simple_loop(10);
        let config = Config::builder()
            .guest_path(&path)
            .tracer_hook(count_hook)
            .build();
        let harness = Harness::new(config).unwrap();
        harness.run(Scenario::WrongPathNopMode).unwrap();
        // Fabricated nops, then the on-path instructions.
        assert_eq!(TRACED_NOPS.load(Ordering::SeqCst), 10);
        assert_eq!(TRACED.load(Ordering::SeqCst), 70 + 10);
    }

    #[test]
    fn tracer_names_guest_blocks() {
        let (_dir, path) = simple_loop(10);
        let image = GuestImage::from_path(&path).unwrap();
        let exit_block = image.symbol_address("loop_exit_block").unwrap();
        let config = Config::builder().guest_path(&path).tracer(true).build();
        let tracer = Tracer::from_config(&config, &image.symbols).unwrap();
        let line = tracer.format(&InstInfo::fabricated_nop(exit_block));
        assert!(line.ends_with(&format!("loop_exit_block+0x0 [{:#x}]: nop", exit_block)));
    }
}
