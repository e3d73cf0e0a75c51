mod common;

use std::sync::Arc;

use common::{
    bootloader, collaborators, connect, fast_config, pattern_image, position_from, t8_image,
    temp_path,
};
use trionic_flash::{
    firmware::{EcuVariant, FirmwareImage, BLOCK_BASE, RAW_BLOCK_LEN},
    flash::{
        CancelToken, FlashState, FlashWorkflow, Phase, ProbeResult, ReadState, ReadWorkflow,
        RecoveryWorkflow, Region, WorkflowErrorKind, BOOTLOADER_ADDRESS,
    },
    hardware::simulation::{EraseScript, SimulatedEcu},
    kwp2000::SecurityLevel,
};

fn is_download_to(r: &[u8], address: u32) -> bool {
    r.len() == 8 && r[0] == 0x34 && r[2..5] == address.to_be_bytes()[1..]
}

fn is_transfer_to(r: &[u8], address: u32) -> bool {
    r.len() >= 6 && r[0] == 0x36 && r[1] == 0x00 && r[2..6] == address.to_be_bytes()
}

#[test]
fn t8_flash_writes_and_verifies_blocks() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    let cfg = fast_config();
    let mut session = connect(&ecu, &cfg);
    let image = t8_image(0x021000);
    let boot = bootloader();

    let mut wf = FlashWorkflow::new(&mut session, &image, &boot, cfg.flash_options());
    let report = wf.run(&collaborators()).unwrap();
    assert_eq!(wf.state(), FlashState::Done);
    assert!(report.bootloader_uploaded);
    assert_eq!(report.blocks_written, 20);
    assert_eq!(report.bytes_written, 20 * RAW_BLOCK_LEN as u64);

    let written = (20 * RAW_BLOCK_LEN) as usize;
    let start = BLOCK_BASE as usize;
    assert_eq!(ecu.flash(BLOCK_BASE, written), &image.data()[start..start + written]);
    // Blocks past the last used address stay erased
    assert!(ecu.flash(BLOCK_BASE + written as u32, 0x100).iter().all(|b| *b == 0xFF));

    let requests = ecu.requests();
    assert!(requests.iter().any(|r| is_download_to(r, BOOTLOADER_ADDRESS)));
    assert_eq!(requests.last().unwrap().as_slice(), [0x11, 0x01]);
    assert_eq!(ecu.resets(), 1);
    assert!(!ecu.bootloader_running());
}

#[test]
fn one_tester_present_per_block() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    ecu.set_transfer_delay(std::time::Duration::from_millis(5));
    let mut cfg = fast_config();
    cfg.keep_alive_period_ms = 10;
    let mut session = connect(&ecu, &cfg);
    let image = t8_image(0x021000);
    let boot = bootloader();

    FlashWorkflow::new(&mut session, &image, &boot, cfg.flash_options())
        .run(&collaborators())
        .unwrap();

    let requests = ecu.requests();
    let erase = position_from(&requests, 0, |r| r == [0x31, 0x52]).unwrap();
    let first = position_from(&requests, erase, |r| is_download_to(r, BLOCK_BASE)).unwrap();
    let exit = position_from(&requests, first, |r| r == [0x37]).unwrap();
    let tester_present = requests[first..exit]
        .iter()
        .filter(|r| r.as_slice() == [0x3E, 0x02])
        .count();
    assert_eq!(tester_present, 20);
}

#[test]
fn block_retry_budget_aborts_the_flash() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    let block3 = BLOCK_BASE + 3 * RAW_BLOCK_LEN;
    ecu.nak_transfers_at(block3, 3);
    let cfg = fast_config();
    let mut session = connect(&ecu, &cfg);
    let image = t8_image(0x021000);
    let boot = bootloader();

    let mut wf = FlashWorkflow::new(&mut session, &image, &boot, cfg.flash_options());
    let err = wf.run(&collaborators()).unwrap_err();
    assert_eq!(wf.state(), FlashState::Failed);
    assert_eq!(err.phase, Phase::Program);
    match err.kind {
        WorkflowErrorKind::RetryBudgetExhausted { index, attempts, last } => {
            assert_eq!(index, 3);
            assert_eq!(attempts, 3);
            assert_eq!(last.nrc(), Some(0x72));
        }
        other => panic!("unexpected error {other}"),
    }
    let requests = ecu.requests();
    assert_eq!(requests.iter().filter(|r| is_transfer_to(r, block3)).count(), 3);
    assert!(!requests
        .iter()
        .any(|r| is_transfer_to(r, block3 + RAW_BLOCK_LEN)));
    // The ECU is still reset
    assert_eq!(requests.last().unwrap().as_slice(), [0x11, 0x01]);
}

#[test]
fn refused_transfers_within_budget_are_retried() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    let block3 = BLOCK_BASE + 3 * RAW_BLOCK_LEN;
    ecu.nak_transfers_at(block3, 2);
    let cfg = fast_config();
    let mut session = connect(&ecu, &cfg);
    let image = t8_image(0x021000);
    let boot = bootloader();
    let report = FlashWorkflow::new(&mut session, &image, &boot, cfg.flash_options())
        .run(&collaborators())
        .unwrap();
    assert_eq!(report.blocks_written, 20);
}

#[test]
fn busy_and_pending_erase_completes() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    ecu.set_erase_script(EraseScript {
        pending: 4,
        busy: 2,
        refuse: None,
    });
    let cfg = fast_config();
    let mut session = connect(&ecu, &cfg);
    let image = t8_image(0x021000);
    let boot = bootloader();
    FlashWorkflow::new(&mut session, &image, &boot, cfg.flash_options())
        .run(&collaborators())
        .unwrap();
    let erases = ecu.requests().iter().filter(|r| r.as_slice() == [0x31, 0x52]).count();
    assert_eq!(erases, 3);
}

#[test]
fn refused_erase_fails_without_programming() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    ecu.set_erase_script(EraseScript {
        refuse: Some(0x72),
        ..Default::default()
    });
    let cfg = fast_config();
    let mut session = connect(&ecu, &cfg);
    let image = t8_image(0x021000);
    let boot = bootloader();
    let mut wf = FlashWorkflow::new(&mut session, &image, &boot, cfg.flash_options());
    let err = wf.run(&collaborators()).unwrap_err();
    assert_eq!(err.phase, Phase::Erase);
    assert!(matches!(&err.kind, WorkflowErrorKind::EraseRefused(e) if e.nrc() == Some(0x72)));
    assert!(!ecu.requests().iter().any(|r| is_download_to(r, BLOCK_BASE)));
}

#[test]
fn cancelled_flash_stops_before_erase() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    let cfg = fast_config();
    let mut session = connect(&ecu, &cfg);
    let image = t8_image(0x021000);
    let boot = bootloader();
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut wf =
        FlashWorkflow::new(&mut session, &image, &boot, cfg.flash_options()).with_cancel(cancel);
    let err = wf.run(&collaborators()).unwrap_err();
    assert!(matches!(err.kind, WorkflowErrorKind::Cancelled));
    assert!(!ecu.requests().iter().any(|r| r.as_slice() == [0x31, 0x52]));
}

#[test]
fn recovery_skips_upload_when_bootloader_runs() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    ecu.set_bootloader_running(true);
    let cfg = fast_config();
    let mut session = connect(&ecu, &cfg);
    let image = t8_image(0x021000);
    let boot = bootloader();

    let mut wf = RecoveryWorkflow::new(&mut session, &image, &boot, cfg.flash_options());
    let report = wf.run(&collaborators()).unwrap();
    assert_eq!(wf.probe_result(), Some(ProbeResult::BootloaderRunning));
    assert_eq!(wf.state(), FlashState::Done);
    assert!(!report.bootloader_uploaded);

    let requests = ecu.requests();
    assert!(!requests.iter().any(|r| is_download_to(r, BOOTLOADER_ADDRESS)));
    assert!(!requests.iter().any(|r| r.as_slice() == [0x10, 0x92]));
    let written = (20 * RAW_BLOCK_LEN) as usize;
    let start = BLOCK_BASE as usize;
    assert_eq!(ecu.flash(BLOCK_BASE, written), &image.data()[start..start + written]);
}

#[test]
fn recovery_uploads_when_application_runs() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::T8));
    let cfg = fast_config();
    let mut session = connect(&ecu, &cfg);
    let image = t8_image(0x021000);
    let boot = bootloader();

    let mut wf = RecoveryWorkflow::new(&mut session, &image, &boot, cfg.flash_options());
    let report = wf.run(&collaborators()).unwrap();
    assert_eq!(wf.probe_result(), Some(ProbeResult::ApplicationRunning));
    assert!(report.bootloader_uploaded);
    assert!(ecu.requests().iter().any(|r| is_download_to(r, BOOTLOADER_ADDRESS)));
}

#[test]
fn me96_partition_flash_and_rearm() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::Me96));
    let image = FirmwareImage::from_bytes(pattern_image(EcuVariant::Me96)).unwrap();
    let boot = bootloader();
    let cfg = fast_config();
    let mut session = connect(&ecu, &cfg);

    ecu.fail_write_at(0x040010);
    let mut wf = FlashWorkflow::new(&mut session, &image, &boot, cfg.flash_options());
    wf.select_partitions(vec![2, 1]);
    let err = wf.run(&collaborators()).unwrap_err();
    assert_eq!(err.phase, Phase::Verify);
    let regions = err.mismatched_regions().unwrap().to_vec();
    assert_eq!(regions, vec![Region::Partition(2)]);
    // Partition 1 made it
    assert_eq!(ecu.flash(0x020000, 0x20000), &image.data()[0x020000..0x040000]);

    ecu.clear_faults();
    wf.rearm(&regions);
    let report = wf.run(&collaborators()).unwrap();
    assert_eq!(report.partitions, vec![2]);
    assert_eq!(ecu.flash(0x040000, 0x20000), &image.data()[0x040000..0x060000]);
    assert_eq!(ecu.resets(), 2);
}

#[test]
fn e39_calibration_partition_is_remapped() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::E39));
    let image = FirmwareImage::from_bytes(pattern_image(EcuVariant::E39)).unwrap();
    let boot = bootloader();
    let mut cfg = fast_config();
    cfg.bootloader_level = SecurityLevel::LevelFD;
    let mut session = connect(&ecu, &cfg);

    let mut wf = FlashWorkflow::new(&mut session, &image, &boot, cfg.flash_options());
    wf.select_partitions(vec![0, 3]);
    let report = wf.run(&collaborators()).unwrap();
    // Boot partition is never written
    assert_eq!(report.partitions, vec![3]);
    assert!(ecu.flash(0, 0x100).iter().all(|b| *b == 0xFF));
    assert_eq!(ecu.flash(0x1C0000, 0x80000), &image.data()[0x100000..0x180000]);
    assert!(ecu.requests().iter().any(|r| is_download_to(r, 0x1C0000)));
}

#[test]
fn read_workflow_dumps_flash_with_sidecar() {
    let ecu = Arc::new(SimulatedEcu::new(EcuVariant::E39));
    let image = pattern_image(EcuVariant::E39);
    ecu.load_image(&image);
    let boot = bootloader();
    let mut cfg = fast_config();
    cfg.read_chunk = 0xF0;
    let mut session = connect(&ecu, &cfg);

    let path = temp_path("e39_dump.bin");
    let mut wf = ReadWorkflow::new(&mut session, &boot, cfg.flash_options());
    let dump = wf.run(EcuVariant::E39, &path, &collaborators()).unwrap();
    assert_eq!(wf.state(), ReadState::Done);
    assert_eq!(dump, image);
    assert_eq!(std::fs::read(&path).unwrap(), image);
    assert!(path.with_extension("hash").exists());
    assert_eq!(ecu.resets(), 1);
}
