use std::sync::{Arc, Mutex};

use crate::emulator::{EmulatedFlash, Emulator, BRIDGE_MAX_FREQUENCY};
use crate::*;

const SELECTOR: UsbSelector = UsbSelector::new(0x0403, 0x6010, 1);

const W25Q80: JedecId = JedecId::new(0xEF, 0x4014);
const W25Q128: JedecId = JedecId::new(0xEF, 0x4018);
const M25P16: JedecId = JedecId::new(0x20, 0x2015);
const SST25VF016B: JedecId = JedecId::new(0xBF, 0x2541);
const AT25DF321: JedecId = JedecId::new(0x1F, 0x4700);

const TEST_STRING: &[u8; 32] = b"This is a serial SPI flash test.";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn chip(id: JedecId) -> EmulatedFlash {
    EmulatedFlash::new(*registry::lookup(id).unwrap())
}

fn attach(template: EmulatedFlash) -> Flash<EmulatedFlash> {
    init_logging();
    let mut emulator = Emulator::new(template).at(SELECTOR);
    Flash::attach(&mut emulator, &SELECTOR).unwrap()
}

/// Deterministic pseudo-random test data.
fn pattern(seed: u32, length: usize) -> Vec<u8> {
    let mut x = seed | 1;
    (0..length).map(|_| {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        (x >> 24) as u8
    }).collect()
}

/// Opcodes which modify the array or the status register.
fn is_mutating(opcode: u8) -> bool {
    matches!(opcode, 0x01 | 0x02 | 0x20 | 0x52 | 0xD8 | 0x60 | 0xC7 | 0xAD)
}

#[test]
fn test_attach_identifies_device() {
    let flash = attach(chip(W25Q128));
    assert_eq!(flash.name(), "Winbond W25Q128");
    assert_eq!(flash.size(), 16 << 20);
    assert_eq!(flash.page_size(), 256);
    assert_eq!(flash.sector_size(), 4096);
    assert_eq!(flash.id(), W25Q128);
    assert_eq!(flash.to_string(), "Winbond W25Q128 16 MiB");
    assert_eq!(flash.id().manufacturer_name(), Some("Winbond/NEXCOM"));
    assert_eq!(flash.last_status(), None);
}

#[test]
fn test_frequency_limited_by_device_and_bridge() {
    let mut flash = attach(chip(W25Q128));
    assert_eq!(flash.frequency(), BRIDGE_MAX_FREQUENCY);
    assert_eq!(flash.access().frequency(), BRIDGE_MAX_FREQUENCY);
    assert_eq!(flash.set_frequency(200_000_000).unwrap(), BRIDGE_MAX_FREQUENCY);
    assert_eq!(flash.set_frequency(1_000_000).unwrap(), 1_000_000);
    assert_eq!(flash.access().frequency(), 1_000_000);

    let mut emulator = Emulator::new(chip(W25Q128));
    let config = Config { frequency: Some(10_000_000), ..Config::default() };
    let flash = Flash::attach_with(&mut emulator, &SELECTOR, config).unwrap();
    assert_eq!(flash.frequency(), 10_000_000);
}

#[test]
fn test_attach_unknown_device_closes_transport() {
    init_logging();
    let unknown = chip(W25Q80).with_id(JedecId::new(0xEF, 0x1234));
    let mut emulator = Emulator::new(unknown).at(SELECTOR);
    match Flash::attach(&mut emulator, &SELECTOR) {
        Err(Error::UnknownDevice { id }) => assert_eq!(id, JedecId::new(0xEF, 0x1234)),
        other => panic!("expected UnknownDevice, got {:?}", other.map(|f| f.name())),
    }
    assert_eq!(emulator.open_handles(), 0);

    // Nothing on the bus reads as a blank ID, which is never registered.
    let blank = chip(W25Q80).with_id(JedecId::new(0xFF, 0xFFFF));
    let mut emulator = Emulator::new(blank);
    assert!(matches!(Flash::attach(&mut emulator, &SELECTOR), Err(Error::UnknownDevice { .. })));
    assert_eq!(emulator.open_handles(), 0);
}

#[test]
fn test_attach_banked_manufacturer_id() {
    init_logging();
    // A bank 2 manufacturer code, reached through one continuation byte.
    let id = JedecId { manufacturer_bank: 1, ..JedecId::new(0x9D, 0x4014) };
    let mut emulator = Emulator::new(chip(W25Q80).with_id(id));
    match Flash::attach(&mut emulator, &SELECTOR) {
        Err(Error::UnknownDevice { id: found }) => assert_eq!(found, id),
        other => panic!("expected UnknownDevice, got {:?}", other.map(|f| f.name())),
    }
    assert_eq!(emulator.open_handles(), 0);
}

#[test]
fn test_attach_wrong_selector() {
    init_logging();
    let mut emulator = Emulator::new(chip(W25Q80)).at(SELECTOR);
    let result = Flash::attach(&mut emulator, &UsbSelector::new(0x0403, 0x6014, 0));
    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(emulator.open_handles(), 0);
}

#[test]
fn test_release_and_drop_close_transport() {
    init_logging();
    let mut emulator = Emulator::new(chip(W25Q80));
    let flash = Flash::attach(&mut emulator, &SELECTOR).unwrap();
    assert_eq!(emulator.open_handles(), 1);
    let access = flash.release();
    assert_eq!(emulator.open_handles(), 1);
    assert_eq!(access.opcodes(), &[0x9F]);
    drop(access);
    assert_eq!(emulator.open_handles(), 0);

    let flash = Flash::attach(&mut emulator, &SELECTOR).unwrap();
    drop(flash);
    assert_eq!(emulator.open_handles(), 0);
}

#[test]
fn test_small_read_write() {
    let mut flash = attach(chip(W25Q80));
    flash.unlock().unwrap();
    flash.erase(0x7000, 4096, false).unwrap();
    let erased = flash.read(0x7020, 128).unwrap();
    assert!(erased.iter().all(|&b| b == 0xFF));

    flash.write(0x7020, TEST_STRING).unwrap();
    let data = flash.read(0x7020, 128).unwrap();
    assert_eq!(&data[..32], TEST_STRING);
    assert_eq!(data[32..].len(), 96);
    assert!(data[32..].iter().all(|&b| b == 0xFF));

    // Neighbouring bytes are untouched.
    assert!(flash.read(0x7000, 0x20).unwrap().iter().all(|&b| b == 0xFF));
}

#[test]
fn test_erase_sets_all_bytes() {
    let mut flash = attach(chip(W25Q80));
    flash.access_mut().contents_mut().iter_mut().for_each(|b| *b = 0x00);
    flash.erase(0x2_0000, 0x1_1000, false).unwrap();
    let contents = flash.access().contents();
    assert!(contents[0x2_0000..0x3_1000].iter().all(|&b| b == 0xFF));
    assert_eq!(contents[0x1_FFFF], 0x00);
    assert_eq!(contents[0x3_1000], 0x00);
}

#[test]
fn test_erase_uses_largest_instructions() {
    let mut flash = attach(chip(W25Q80));
    flash.access_mut().clear_log();
    flash.erase(0x1_0000, 0x1_9000, false).unwrap();
    let erases: Vec<u8> = flash.access().opcodes().iter().copied()
        .filter(|&op| matches!(op, 0x20 | 0x52 | 0xD8)).collect();
    assert_eq!(erases, vec![0xD8, 0x52, 0x20]);
}

#[test]
fn test_write_stores_bitwise_and() {
    let mut flash = attach(chip(W25Q80));
    let a = pattern(1, 300);
    let b = pattern(2, 300);
    flash.write(0x100, &a).unwrap();
    flash.write(0x100, &b).unwrap();
    let expected: Vec<u8> = a.iter().zip(b.iter()).map(|(x, y)| x & y).collect();
    assert_eq!(flash.read(0x100, 300).unwrap(), expected);
}

#[test]
fn test_write_split_on_page_boundaries() {
    let mut flash = attach(chip(W25Q80));
    flash.access_mut().clear_log();
    let data = pattern(3, 600);
    flash.write(0x70F0, &data).unwrap();
    assert_eq!(flash.read(0x70F0, 600).unwrap(), data);
    // 16 bytes to the first boundary, two full pages, then the remainder.
    let programs = flash.access().opcodes().iter().filter(|&&op| op == 0x02).count();
    assert_eq!(programs, 4);
    // Nothing wrapped to the start of the first page.
    assert!(flash.read(0x7000, 0xF0).unwrap().iter().all(|&b| b == 0xFF));
}

#[test]
fn test_page_program_wraps_within_page() {
    let mut flash = attach(chip(W25Q80));
    flash.page_program(0x70FE, &[1, 2, 3, 4]).unwrap();
    assert_eq!(flash.read(0x70FE, 2).unwrap(), vec![1, 2]);
    assert_eq!(flash.read(0x7000, 2).unwrap(), vec![3, 4]);
    assert_eq!(flash.read(0x7100, 2).unwrap(), vec![0xFF, 0xFF]);

    let err = flash.page_program(0x7000, &[0u8; 257]).unwrap_err();
    assert!(matches!(err, Error::InvalidRange { reason: RangeFault::ExceedsPage { page_size: 256 }, .. }));
}

#[test]
fn test_write_enable_precedes_each_mutation() {
    let mut flash = attach(chip(W25Q80).with_status(0b0000_0100));
    flash.access_mut().clear_log();
    flash.unlock().unwrap();
    flash.erase(0, 0x2000, false).unwrap();
    flash.write(0x80, &pattern(4, 700)).unwrap();
    flash.erase(0, 1 << 20, true).unwrap();

    let opcodes = flash.access().opcodes();
    let mut last_command = None;
    let mut mutations = 0;
    for &op in opcodes.iter().filter(|&&op| op != 0x05) {
        if is_mutating(op) {
            assert_eq!(last_command, Some(0x06), "0x{:02X} without write enable in {:02X?}", op, opcodes);
            mutations += 1;
        }
        last_command = Some(op);
    }
    // Status write, two sector erases, four page programs, one chip erase.
    assert_eq!(mutations, 8);
}

#[test]
fn test_invalid_ranges_rejected_before_bus_activity() {
    let mut flash = attach(chip(W25Q80));
    let size = flash.size();
    flash.access_mut().contents_mut()[size - 1] = 0x00;
    flash.access_mut().clear_log();

    assert!(matches!(flash.read(size as u32 - 4, 8),
                     Err(Error::InvalidRange { reason: RangeFault::OutOfBounds { .. }, .. })));
    assert!(matches!(flash.write(size as u32, &[0]), Err(Error::InvalidRange { .. })));
    assert!(matches!(flash.write(u32::MAX, &[0; 4]), Err(Error::InvalidRange { .. })));
    assert!(matches!(flash.erase(0x7020, 4096, false),
                     Err(Error::InvalidRange { reason: RangeFault::Misaligned { granule: 4096 }, .. })));
    assert!(matches!(flash.erase(0x7000, 100, false), Err(Error::InvalidRange { .. })));
    assert!(matches!(flash.erase(size as u32, 4096, false),
                     Err(Error::InvalidRange { reason: RangeFault::OutOfBounds { .. }, .. })));
    assert!(matches!(flash.erase_region(size as u32 - 1, 2), Err(Error::InvalidRange { .. })));

    assert!(flash.access().opcodes().is_empty());
    assert_eq!(flash.access().contents()[size - 1], 0x00);

    // Zero-length requests within bounds succeed without touching the device.
    assert_eq!(flash.read(size as u32, 0).unwrap(), Vec::<u8>::new());
    flash.write(0x100, &[]).unwrap();
    flash.erase(0x1000, 0, false).unwrap();
    assert!(flash.access().opcodes().is_empty());
}

#[test]
fn test_locked_device_refuses_writes() {
    let mut flash = attach(chip(W25Q80).with_status(0b0001_1100));
    let before = flash.access().contents().to_vec();
    assert!(flash.is_locked().unwrap());

    match flash.write(0x7020, TEST_STRING) {
        Err(Error::Locked { status }) => assert_eq!(status.block_protect(0x7C), 0b0001_1100),
        other => panic!("expected Locked, got {:?}", other),
    }
    assert!(matches!(flash.erase(0x7000, 4096, false), Err(Error::Locked { .. })));
    assert!(matches!(flash.erase_chip(), Err(Error::Locked { .. })));
    assert!(flash.access().opcodes().iter().all(|&op| !is_mutating(op)));
    assert_eq!(flash.access().contents(), &before[..]);

    flash.unlock().unwrap();
    assert!(!flash.is_locked().unwrap());
    flash.write(0x7020, TEST_STRING).unwrap();
    assert_eq!(flash.read(0x7020, 32).unwrap(), TEST_STRING.to_vec());
}

#[test]
fn test_lock_and_unlock() {
    let mut flash = attach(chip(W25Q80));
    flash.unlock().unwrap();
    flash.access_mut().clear_log();
    // Already unlocked: only the status register is read.
    flash.unlock().unwrap();
    assert_eq!(flash.access().opcodes(), &[0x05]);

    flash.lock().unwrap();
    assert!(flash.is_locked().unwrap());
    assert_eq!(flash.access().status().block_protect(0x7C), 0x7C);
    assert!(matches!(flash.write(0, &[0]), Err(Error::Locked { .. })));
    flash.unlock().unwrap();
    flash.write(0, &[0]).unwrap();
    assert_eq!(flash.access().contents()[0], 0x00);
}

#[test]
fn test_unlock_sst_uses_enable_write_status() {
    let mut flash = attach(chip(SST25VF016B).with_status(0b0001_1100));
    flash.access_mut().clear_log();
    flash.unlock().unwrap();
    let opcodes: Vec<u8> = flash.access().opcodes().iter().copied().filter(|&op| op != 0x05).collect();
    assert_eq!(opcodes, vec![0x50, 0x01]);
    assert!(!flash.is_locked().unwrap());
}

#[test]
fn test_lock_unsupported() {
    let mut flash = attach(chip(AT25DF321));
    assert!(matches!(flash.unlock(),
                     Err(Error::Unsupported { operation: Operation::Unlock, device: "Atmel AT25DF321" })));
    assert!(matches!(flash.lock(), Err(Error::Unsupported { operation: Operation::Lock, .. })));
    assert!(!flash.is_locked().unwrap());
    flash.write(0x10, &[0x5A]).unwrap();
    assert_eq!(flash.read(0x10, 1).unwrap(), vec![0x5A]);
}

#[test]
fn test_bulk_erase() {
    let mut flash = attach(chip(W25Q80));
    flash.access_mut().contents_mut().iter_mut().for_each(|b| *b = 0x00);

    // A partial range falls back to sector and block erases.
    flash.access_mut().clear_log();
    flash.erase(0x1000, 0x1000, true).unwrap();
    assert!(!flash.access().opcodes().contains(&0xC7));
    assert_eq!(flash.access().contents()[0x0FFF], 0x00);

    flash.access_mut().clear_log();
    flash.erase(0, 1 << 20, true).unwrap();
    assert!(flash.access().opcodes().contains(&0xC7));
    assert!(!flash.access().opcodes().contains(&0xD8));
    assert!(flash.access().contents().iter().all(|&b| b == 0xFF));
}

#[test]
fn test_erase_chip_unsupported() {
    init_logging();
    let device = DeviceDescriptor { chip_erase: None, ..*registry::lookup(W25Q80).unwrap() };
    let mut flash = Flash::with_device(EmulatedFlash::new(device), device, Config::default()).unwrap();
    assert!(matches!(flash.erase_chip(),
                     Err(Error::Unsupported { operation: Operation::ChipErase, .. })));
    // Bulk erase of the whole device degrades to block erases.
    flash.access_mut().clear_log();
    flash.erase(0, device.size, true).unwrap();
    let blocks = flash.access().opcodes().iter().filter(|&&op| op == 0xD8).count();
    assert_eq!(blocks, 16);
}

#[test]
fn test_erase_region_widens_to_sectors() {
    let mut flash = attach(chip(W25Q80));
    flash.access_mut().contents_mut()[0x6000..0x9000].iter_mut().for_each(|b| *b = 0x00);
    let region = flash.erase_region(0x7020, 33).unwrap();
    assert_eq!(region, Region::new(0x7000, 0x1000));
    let contents = flash.access().contents();
    assert!(contents[0x7000..0x8000].iter().all(|&b| b == 0xFF));
    assert_eq!(contents[0x6FFF], 0x00);
    assert_eq!(contents[0x8000], 0x00);
}

#[test]
fn test_erase_region_empty_erases_nothing() {
    let mut flash = attach(chip(W25Q80));
    flash.access_mut().contents_mut()[0x7000..0x8000].iter_mut().for_each(|b| *b = 0x00);
    flash.access_mut().clear_log();
    let region = flash.erase_region(0x7020, 0).unwrap();
    assert_eq!(region, Region::new(0x7020, 0));
    assert!(flash.access().opcodes().is_empty());
    assert!(flash.access().contents()[0x7000..0x8000].iter().all(|&b| b == 0x00));
    // An unaligned empty erase is not an error either.
    flash.erase(0x7020, 0, false).unwrap();
    assert!(flash.access().opcodes().is_empty());
}

#[test]
fn test_read_batches_and_opcode() {
    let mut flash = attach(chip(W25Q80).with_max_transfer_size(4096));
    flash.access_mut().clear_log();
    let data = flash.read(0x100, 10_000).unwrap();
    assert_eq!(data.len(), 10_000);
    // 30 MHz is within the legacy read limit of this device.
    assert_eq!(flash.access().opcodes(), &[0x03, 0x03, 0x03]);

    let mut flash = attach(chip(M25P16));
    flash.access_mut().contents_mut()[0x20] = 0x42;
    flash.access_mut().clear_log();
    assert_eq!(flash.read(0x20, 1).unwrap(), vec![0x42]);
    assert_eq!(flash.access().opcodes(), &[0x0B]);

    flash.set_frequency(10_000_000).unwrap();
    flash.access_mut().clear_log();
    assert_eq!(flash.read(0x20, 1).unwrap(), vec![0x42]);
    assert_eq!(flash.access().opcodes(), &[0x03]);
}

#[test]
fn test_read_progress_callback() {
    let mut flash = attach(chip(W25Q80).with_max_transfer_size(1000));
    let progress = Mutex::new(Vec::new());
    flash.read_cb(0, 2500, |n| progress.lock().unwrap().push(n)).unwrap();
    assert_eq!(progress.into_inner().unwrap(), vec![0, 1000, 2000, 2500]);
}

#[test]
fn test_long_read_write() {
    let mut flash = attach(chip(W25Q80));
    flash.unlock().unwrap();
    let length = flash.size().min(1 << 20);
    let start = (flash.size() - length) as u32;
    flash.erase(start, length, true).unwrap();

    let data = pattern(0xC0FFEE, length);
    flash.write(start, &data).unwrap();
    assert_eq!(flash.read(start, length).unwrap(), data);
    assert!(flash.compare(start, &data, 32).unwrap().is_empty());

    // Corrupt the chip behind the session's back and check mismatches are reported.
    for offset in (0..length).step_by(4096) {
        flash.access_mut().contents_mut()[offset] = !data[offset];
    }
    let mismatches = flash.compare(start, &data, 32).unwrap();
    assert_eq!(mismatches.len(), 32);
    assert_eq!(mismatches[1], Mismatch { address: start + 4096, expected: data[4096], found: !data[4096] });
}

#[test]
fn test_sst_aai_read_write() {
    let mut flash = attach(chip(SST25VF016B).with_status(0b0001_1100));
    assert!(flash.name().starts_with("SST"));
    assert_eq!(flash.descriptor().throughput(), Throughput::Slow);
    flash.unlock().unwrap();

    let mut length = flash.size().min(1 << 20);
    let start = (flash.size() - length) as u32;
    flash.erase(start, length, true).unwrap();
    if flash.descriptor().throughput() == Throughput::Slow {
        length = 16 << 10;
    }

    // Odd start address and odd remainder exercise the single byte programs.
    let data = pattern(7, length - 2);
    flash.access_mut().clear_log();
    flash.write(start + 1, &data).unwrap();
    assert_eq!(flash.read(start + 1, data.len()).unwrap(), data);
    assert_eq!(flash.read(start, 1).unwrap(), vec![0xFF]);
    assert_eq!(flash.read(start + length as u32 - 1, 1).unwrap(), vec![0xFF]);

    let opcodes = flash.access().opcodes();
    assert_eq!(opcodes.iter().filter(|&&op| op == 0x02).count(), 2);
    assert_eq!(opcodes.iter().filter(|&&op| op == 0xAD).count(), (data.len() - 2) / 2);
    assert_eq!(opcodes.iter().filter(|&&op| op == 0x04).count(), 1);
}

#[test]
fn test_interrupted_write_reports_progress() {
    let mut flash = attach(chip(W25Q80));
    let data = pattern(9, 1024);
    // Status check, then two pages of write enable, program, and two polls.
    flash.access_mut().fail_after(1 + 2 * 4 + 1);
    match flash.write(0, &data) {
        Err(Error::Interrupted { committed, source }) => {
            assert_eq!(committed, 512);
            assert!(matches!(*source, Error::Transport(_)));
        },
        other => panic!("expected Interrupted, got {:?}", other),
    }
    assert_eq!(&flash.access().contents()[..512], &data[..512]);
    assert!(flash.access().contents()[512..1024].iter().all(|&b| b == 0xFF));
}

#[test]
fn test_timeout_leaves_state_unknown() {
    init_logging();
    let mut emulator = Emulator::new(chip(W25Q80).with_busy_cycles(u32::MAX));
    let config = Config { timeout: Some(core::time::Duration::from_millis(20)),
                          poll_interval: core::time::Duration::from_millis(1),
                          ..Config::default() };
    let mut flash = Flash::attach_with(&mut emulator, &SELECTOR, config).unwrap();

    match flash.erase(0, 4096, false) {
        Err(Error::Timeout { operation: Operation::Erase, elapsed }) => {
            assert!(elapsed >= core::time::Duration::from_millis(20));
        },
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(flash.last_status(), None);

    // Still busy: the next operation waits, and times out again.
    let err = flash.write(0, &[0]).unwrap_err();
    assert_eq!(err.committed(), Some(0));
    assert!(matches!(err, Error::Interrupted { ref source, .. }
                     if matches!(**source, Error::Timeout { .. })));
}

#[test]
fn test_stuck_busy_recovers() {
    let mut flash = attach(chip(W25Q80));
    flash.set_timeout(Some(core::time::Duration::from_millis(10)));
    flash.access_mut().set_stuck_busy(true);
    assert!(matches!(flash.erase(0, 4096, false), Err(Error::Timeout { .. })));
    flash.access_mut().set_stuck_busy(false);
    flash.set_timeout(None);
    flash.erase(0, 4096, false).unwrap();
    assert!(!flash.last_status().unwrap().is_busy());
}

#[test]
fn test_shared_between_threads() {
    let flash = Arc::new(Mutex::new(attach(chip(W25Q80))));
    let handles: Vec<_> = (0..4u32).map(|n| {
        let flash = flash.clone();
        std::thread::spawn(move || {
            let address = 0x1_0000 * (n + 1);
            let data = pattern(n + 100, 1000);
            let mut flash = flash.lock().unwrap();
            flash.erase(address, 4096, false).unwrap();
            flash.write(address, &data).unwrap();
        })
    }).collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut flash = flash.lock().unwrap();
    for n in 0..4u32 {
        let address = 0x1_0000 * (n + 1);
        assert_eq!(flash.read(address, 1000).unwrap(), pattern(n + 100, 1000));
    }
}
