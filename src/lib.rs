// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! serial-flash
//!
//! This crate turns a raw SPI transport into device-aware access to common
//! SPI NOR flash memories: the attached chip is identified against a table
//! of known devices, then read, erased, and programmed using that device's
//! opcodes, geometry, timings, and write protection scheme.
//!
//! NOR flash is exposed as it is: erase sets bytes to 0xFF, and programming
//! can only clear bits, so writing to a region which was not erased stores
//! the bitwise AND of the old and new data.

use core::time::Duration;
#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

pub mod command;
pub mod device;
pub mod emulator;
pub mod id;
pub mod poll;
pub mod region;
pub mod registry;
pub mod sreg;
mod erase_plan;

#[cfg(test)]
mod tests;

pub use command::Frame;
pub use device::{DeviceDescriptor, EraseOp, LockControl, ProgramMode, Throughput};
pub use id::JedecId;
pub use poll::{Outcome, Poll};
pub use region::Region;
pub use sreg::StatusRegister;

use command::split_pages;
use erase_plan::ErasePlan;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unknown flash device: {id}.")]
    UnknownDevice { id: JedecId },
    #[error("Invalid range 0x{address:08X}+{length}: {reason}.")]
    InvalidRange { address: u32, length: usize, reason: RangeFault },
    #[error("Flash is write protected (status register {status}), unlock it first.")]
    Locked { status: StatusRegister },
    #[error("Timed out after {elapsed:?} waiting for {operation} to complete.")]
    Timeout { operation: Operation, elapsed: Duration },
    #[error("{operation} is not supported by {device}.")]
    Unsupported { operation: Operation, device: &'static str },
    #[error("Write interrupted after {committed} bytes: {source}")]
    Interrupted { committed: usize, source: Box<Error> },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl Error {
    /// Number of bytes known to be programmed before a write failed.
    pub fn committed(&self) -> Option<usize> {
        match self {
            Error::Interrupted { committed, .. } => Some(*committed),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub type AnyhowResult<T> = anyhow::Result<T>;

/// Why a range was rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RangeFault {
    /// The range extends past the end of the device.
    OutOfBounds { size: usize },
    /// Erase ranges must start and end on an erase boundary.
    Misaligned { granule: usize },
    /// A single page program may not exceed one page.
    ExceedsPage { page_size: usize },
}

impl core::fmt::Display for RangeFault {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            RangeFault::OutOfBounds { size } => write!(f, "exceeds device size of {} bytes", size),
            RangeFault::Misaligned { granule } => write!(f, "not aligned to {} bytes", granule),
            RangeFault::ExceedsPage { page_size } => write!(f, "longer than page of {} bytes", page_size),
        }
    }
}

/// Flash operations, as reported in errors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Program,
    Erase,
    ChipErase,
    Lock,
    Unlock,
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let name = match self {
            Operation::Program => "program",
            Operation::Erase => "erase",
            Operation::ChipErase => "chip erase",
            Operation::Lock => "lock",
            Operation::Unlock => "unlock",
        };
        f.write_str(name)
    }
}

/// USB location of an SPI bridge.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct UsbSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Interface index on multi-interface bridges, such as an FT2232H.
    pub interface: u8,
}

impl UsbSelector {
    pub const fn new(vendor_id: u16, product_id: u16, interface: u8) -> Self {
        UsbSelector { vendor_id, product_id, interface }
    }
}

impl core::fmt::Display for UsbSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:04x}:{:04x}/{}", self.vendor_id, self.product_id, self.interface)
    }
}

/// Trait for objects which provide access to SPI flash.
///
/// Providers only need to implement `exchange()`, which asserts CS, writes all the bytes
/// in `data`, reads `read_len` bytes, then de-asserts CS, and `set_frequency()`.
/// If it provides a performance optimisation, providers may also implement `write()`,
/// which does not read any data.
///
/// The transport is closed when it is dropped.
pub trait FlashAccess {
    /// Assert CS, write all bytes in `data` to the SPI bus, then de-assert CS.
    fn write(&mut self, data: &[u8]) -> AnyhowResult<()> {
        // Default implementation uses `exchange()` with no read.
        self.exchange(data, 0)?;
        Ok(())
    }

    /// Assert CS, write all bytes in `data`, then read `read_len` bytes and de-assert CS.
    ///
    /// Returns the received data.
    fn exchange(&mut self, data: &[u8], read_len: usize) -> AnyhowResult<Vec<u8>>;

    /// Set the SPI clock frequency in Hz.
    ///
    /// Returns the frequency actually configured, which may be lower.
    fn set_frequency(&mut self, frequency: u32) -> AnyhowResult<u32>;

    /// Largest number of bytes to read in a single exchange.
    fn max_transfer_size(&self) -> usize {
        64 * 1024
    }

    fn sleep(&mut self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// Trait for objects which open `FlashAccess` transports by USB location.
pub trait Connector {
    type Access: FlashAccess;

    fn open(&mut self, selector: &UsbSelector) -> AnyhowResult<Self::Access>;
}

/// Session configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// SPI clock frequency in Hz. Defaults to the device's maximum,
    /// and is always limited to it.
    pub frequency: Option<u32>,
    /// Pause between busy polls. Zero polls in a tight loop.
    pub poll_interval: Duration,
    /// Bound on every busy wait. By default each operation is bounded by twice
    /// the maximum time given for it in the device descriptor.
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config { frequency: None, poll_interval: Duration::from_secs(0), timeout: None }
    }
}

/// SPI clock used to read the JEDEC ID, before the device is known.
pub const IDENTIFY_FREQUENCY: u32 = 1_000_000;

/// A byte which did not read back as expected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    pub address: u32,
    pub expected: u8,
    pub found: u8,
}

impl core::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "0x{:06X}: expected 0x{:02X}, read 0x{:02X}", self.address, self.expected, self.found)
    }
}

/// SPI Flash.
///
/// A session bound to one identified flash device. The session owns the
/// transport; all operations take `&mut self` and complete before returning,
/// so commands from different operations can never interleave on the bus.
/// Share a session between threads behind a `Mutex`.
pub struct Flash<A: FlashAccess> {
    access: A,

    /// Descriptor of the attached device.
    device: DeviceDescriptor,

    /// ID read from the device, which may differ from `device.id`
    /// if the descriptor was supplied by the caller.
    id: JedecId,

    /// SPI clock frequency actually configured on the transport.
    frequency: u32,

    config: Config,

    /// Last status register read. Cleared when the device state is unknown.
    status: Option<StatusRegister>,
}

impl<A: FlashAccess> Flash<A> {
    #[cfg(feature = "progress")]
    const DATA_PROGRESS_TPL: &'static str =
        " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
    #[cfg(feature = "progress")]
    const DATA_PROGRESS_CHARS: &'static str = "=> ";

    /// Open the transport at `selector` and identify the attached flash,
    /// using the default configuration.
    pub fn attach<C>(connector: &mut C, selector: &UsbSelector) -> Result<Self>
        where C: Connector<Access = A>
    {
        Self::attach_with(connector, selector, Config::default())
    }

    /// Open the transport at `selector` and identify the attached flash.
    ///
    /// If identification fails the transport is closed before returning.
    pub fn attach_with<C>(connector: &mut C, selector: &UsbSelector, config: Config) -> Result<Self>
        where C: Connector<Access = A>
    {
        log::debug!("Opening SPI transport at {}", selector);
        let access = connector.open(selector)?;
        Self::new(access, config)
    }

    /// Identify the flash attached to an open transport.
    ///
    /// Fails with `Error::UnknownDevice` if the device is not in the registry.
    pub fn new(mut access: A, config: Config) -> Result<Self> {
        let frequency = IDENTIFY_FREQUENCY.min(config.frequency.unwrap_or(u32::MAX));
        access.set_frequency(frequency)?;
        let id = read_jedec_id(&mut access)?;
        let device = registry::resolve(id)?;
        Self::with_id(access, *device, id, config)
    }

    /// Use `device` for the flash attached to an open transport, without
    /// reading its ID or consulting the registry.
    pub fn with_device(access: A, device: DeviceDescriptor, config: Config) -> Result<Self> {
        Self::with_id(access, device, device.id, config)
    }

    fn with_id(access: A, device: DeviceDescriptor, id: JedecId, config: Config) -> Result<Self> {
        let mut flash = Flash { access, device, id, frequency: 0, config, status: None };
        flash.set_frequency(config.frequency.unwrap_or(device.max_frequency))?;
        log::debug!("Attached {} ({}) at {} Hz", flash.device, flash.id, flash.frequency);
        Ok(flash)
    }

    /// Close the session, returning the transport.
    pub fn release(self) -> A {
        self.access
    }

    pub fn access(&self) -> &A {
        &self.access
    }

    pub fn access_mut(&mut self) -> &mut A {
        &mut self.access
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// JEDEC ID reported by the device.
    pub fn id(&self) -> JedecId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.device.name
    }

    /// Total memory capacity in bytes.
    pub fn size(&self) -> usize {
        self.device.size
    }

    /// Page program size in bytes.
    pub fn page_size(&self) -> usize {
        self.device.page_size
    }

    /// Smallest erase size in bytes.
    pub fn sector_size(&self) -> usize {
        self.device.sector_size()
    }

    /// SPI clock frequency in Hz.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Set the SPI clock frequency, limited to the device's maximum.
    ///
    /// Returns the frequency the transport actually configured.
    pub fn set_frequency(&mut self, frequency: u32) -> Result<u32> {
        let frequency = frequency.min(self.device.max_frequency);
        self.frequency = self.access.set_frequency(frequency)?;
        if self.frequency != frequency {
            log::debug!("Requested {} Hz SPI clock, got {} Hz", frequency, self.frequency);
        }
        Ok(self.frequency)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Set a bound on every busy wait, overriding the device timings.
    ///
    /// `None` restores the per-operation bounds from the device descriptor.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.config.timeout = timeout;
    }

    /// Set the pause between busy polls.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.config.poll_interval = interval;
    }

    /// Read `length` bytes of data from the attached flash, starting at `address`.
    ///
    /// Reads are split into exchanges of at most `FlashAccess::max_transfer_size()`
    /// bytes. Fast Read is used when the SPI clock is above the device's limit for
    /// the legacy Read Data command.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.read_cb(address, length, |_| {})
    }

    /// Read `length` bytes of data from the attached flash, starting at `address`.
    ///
    /// This method is similar to the `read()` method, except it calls the provided
    /// callback function after each exchange with the number of bytes read so far.
    pub fn read_cb<F: Fn(usize)>(&mut self, address: u32, length: usize, cb: F)
        -> Result<Vec<u8>>
    {
        self.check_range(address, length)?;
        let chunk_size = self.access.max_transfer_size().max(1);
        let start = address as usize;
        let end = start + length;
        let mut data = Vec::with_capacity(length);
        cb(0);
        for addr in (start..end).step_by(chunk_size) {
            let size = usize::min(chunk_size, end - addr);
            let frame = self.read_frame(addr as u32, size);
            data.append(&mut self.exchange(&frame)?);
            cb(data.len());
        }
        Ok(data)
    }

    /// Read `length` bytes of data from the attached flash, starting at `address`.
    ///
    /// This method is similar to the `read()` method, except it renders a progress
    /// bar to the terminal during the read.
    #[cfg(feature = "progress")]
    pub fn read_progress(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let pb = ProgressBar::new(length as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Reading");
        let result = self.read_cb(address, length, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Read back `expected.len()` bytes from `address` and report the first
    /// `limit` bytes which differ from `expected`.
    pub fn compare(&mut self, address: u32, expected: &[u8], limit: usize) -> Result<Vec<Mismatch>> {
        let data = self.read(address, expected.len())?;
        let mismatches: Vec<Mismatch> = expected.iter().zip(data.iter()).enumerate()
            .filter(|(_, (a, b))| a != b)
            .take(limit)
            .map(|(idx, (&expected, &found))| Mismatch { address: address + idx as u32, expected, found })
            .collect();
        for mismatch in mismatches.iter() {
            log::warn!("Readback mismatch at {}", mismatch);
        }
        Ok(mismatches)
    }

    /// Erase `length` bytes starting at `address`.
    ///
    /// Both `address` and `length` must be multiples of the sector size.
    /// The largest erase instructions which fit inside the range are used,
    /// and nothing outside the range is erased. If `bulk` is set and the range
    /// covers the whole device, a single chip erase is issued instead, if the
    /// device supports it.
    ///
    /// Returns only after the erase operation is complete.
    pub fn erase(&mut self, address: u32, length: usize, bulk: bool) -> Result<()> {
        self.erase_cb(address, length, bulk, |_| {})
    }

    /// Erase `length` bytes starting at `address`.
    ///
    /// This is identical to `erase()`, except it calls `cb` with the number of
    /// bytes erased so far after each erase instruction completes.
    pub fn erase_cb<F: Fn(usize)>(&mut self, address: u32, length: usize, bulk: bool, cb: F)
        -> Result<()>
    {
        let region = self.check_range(address, length)?;
        if region.is_empty() {
            return Ok(());
        }
        let granule = self.device.sector_size();
        if !region.is_aligned(granule) {
            log::error!("Erase of {} is not aligned to {} byte sectors", region, granule);
            return Err(Error::InvalidRange {
                address, length, reason: RangeFault::Misaligned { granule },
            });
        }
        self.prepare(Operation::Erase)?;

        cb(0);
        let chip_erase = self.device.chip_erase;
        match chip_erase {
            Some(opcode) if bulk && address == 0 && length == self.device.size => {
                self.run_chip_erase(opcode)?;
                cb(length);
                return Ok(());
            },
            _ if bulk => log::debug!("Bulk erase not possible for {}, erasing by sector", region),
            _ => (),
        }

        let plan = ErasePlan::new(self.device.erase_ops, address as usize, length);
        self.run_erase_plan(&plan, cb)
    }

    /// Erase at least `length` bytes starting at `address`.
    ///
    /// The range is widened to sector boundaries, so bytes outside it may also
    /// be erased. Returns the region actually erased.
    pub fn erase_region(&mut self, address: u32, length: usize) -> Result<Region> {
        let region = self.check_range(address, length)?;
        let effective = region.align_out(self.device.sector_size());
        if effective != region {
            log::debug!("Widening erase of {} to {}", region, effective);
        }
        self.erase(effective.address, effective.length, false)?;
        Ok(effective)
    }

    /// Erase entire flash chip.
    ///
    /// Returns only after the erase operation is complete.
    pub fn erase_chip(&mut self) -> Result<()> {
        let opcode = match self.device.chip_erase {
            Some(opcode) => opcode,
            None => return Err(self.unsupported(Operation::ChipErase)),
        };
        self.prepare(Operation::ChipErase)?;
        self.run_chip_erase(opcode)
    }

    /// Erase `length` bytes starting at `address`, and draw a progress bar to the terminal.
    #[cfg(feature = "progress")]
    pub fn erase_progress(&mut self, address: u32, length: usize, bulk: bool) -> Result<()> {
        let pb = ProgressBar::new(length as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Erasing");
        let result = self.erase_cb(address, length, bulk, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Program `data` to `address`, automatically split into page program operations
    /// so that no command crosses a page boundary.
    ///
    /// Note that this does *not* erase the flash beforehand: each byte ends up as
    /// the bitwise AND of its previous and new values.
    ///
    /// If the transport fails or the device times out partway, returns
    /// `Error::Interrupted` with the number of bytes committed so far.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.write_cb(address, data, |_| {})
    }

    /// Program `data` to `address`.
    ///
    /// This is identical to `write()`, except it calls `cb` with the number of
    /// bytes programmed so far after each program operation.
    pub fn write_cb<F: Fn(usize)>(&mut self, address: u32, data: &[u8], cb: F) -> Result<()> {
        self.check_range(address, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        log::trace!("Programming {} bytes to 0x{:08X}, page size {} bytes",
                    data.len(), address, self.device.page_size);

        let mut committed = 0;
        cb(committed);
        let result = self.prepare(Operation::Program).and_then(|_| match self.device.program_mode {
            ProgramMode::Page => self.program_pages(address, data, &mut committed, &cb),
            ProgramMode::AaiWord => self.program_aai(address, data, &mut committed, &cb),
        });
        result.map_err(|err| match err {
            Error::Transport(_) | Error::Timeout { .. } => {
                log::error!("Write stopped after {} of {} bytes", committed, data.len());
                Error::Interrupted { committed, source: Box::new(err) }
            },
            err => err,
        })
    }

    /// Program `data` to `address`, and draw a progress bar to the terminal.
    #[cfg(feature = "progress")]
    pub fn write_progress(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let pb = ProgressBar::new(data.len() as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Writing");
        let result = self.write_cb(address, data, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Issue a single Page Program command.
    ///
    /// Unlike `write()`, `data` is sent as-is: if it runs past the end of the
    /// page containing `address`, the device wraps around to the start of that
    /// same page.
    pub fn page_program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.check_range(address, data.len())?;
        if data.len() > self.device.page_size {
            return Err(Error::InvalidRange {
                address, length: data.len(),
                reason: RangeFault::ExceedsPage { page_size: self.device.page_size },
            });
        }
        self.prepare(Operation::Program)?;
        self.program_page(address, data)
    }

    /// Clear the block protect bits in the status register, if any are set.
    ///
    /// Fails with `Error::Locked` if the bits cannot be cleared, for example
    /// when the status register is itself protected by the WP pin.
    pub fn unlock(&mut self) -> Result<()> {
        let lock = self.lock_control(Operation::Unlock)?;
        let status = self.status()?;
        if !status.is_protected(lock.mask) {
            log::debug!("Block protect bits already clear");
            return Ok(());
        }
        log::debug!("Block protect bits set (status {}), clearing", status);
        self.write_status(Operation::Unlock, lock, status.without(lock.mask))?;
        let status = self.status()?;
        if status.is_protected(lock.mask) {
            log::error!("Block protect bits still set (status {})", status);
            return Err(Error::Locked { status });
        }
        Ok(())
    }

    /// Set every block protect bit, protecting the whole device.
    pub fn lock(&mut self) -> Result<()> {
        let lock = self.lock_control(Operation::Lock)?;
        let status = self.status()?;
        log::debug!("Setting block protect bits 0x{:02X}", lock.mask);
        self.write_status(Operation::Lock, lock, status.with(lock.mask))?;
        let status = self.status()?;
        if status.block_protect(lock.mask) != lock.mask {
            log::warn!("Not all block protect bits were set (status {})", status);
        }
        Ok(())
    }

    /// Check if any block protect bits are set.
    ///
    /// Always false for devices without lock control.
    pub fn is_locked(&mut self) -> Result<bool> {
        let status = self.status()?;
        Ok(self.is_protected(status))
    }

    /// Read the status register.
    pub fn status(&mut self) -> Result<StatusRegister> {
        let data = self.exchange(&Frame::read_status())?;
        let status = StatusRegister(data[0]);
        self.status = Some(status);
        Ok(status)
    }

    /// Most recently read status register, or `None` if the device state is
    /// unknown, such as after a timeout.
    pub fn last_status(&self) -> Option<StatusRegister> {
        self.status
    }

    /// Check if the device is currently busy performing an operation.
    pub fn is_busy(&mut self) -> Result<bool> {
        self.status().map(|status| status.is_busy())
    }

    /// Send the WriteEnable command, setting the WEL in the status register.
    ///
    /// The device clears WEL after every program, erase, or status write,
    /// so this is sent before each of them.
    pub fn write_enable(&mut self) -> Result<()> {
        self.write_frame(&Frame::write_enable(self.device.write_enable_opcode()))
    }

    /// Send the WriteDisable command, clearing the WEL and ending AAI programming.
    pub fn write_disable(&mut self) -> Result<()> {
        self.write_frame(&Frame::write_disable())
    }

    /// Wait until the device stops being busy.
    ///
    /// Bounded by `Config::timeout` if set, otherwise by twice `time_max` if given.
    pub fn wait_while_busy(&mut self, operation: Operation, time_max: Option<Duration>) -> Result<()> {
        let timeout = self.config.timeout.or_else(|| time_max.map(|t| t * 2));
        let poll = Poll::new(self.config.poll_interval, timeout);
        let outcome = poll.run(&mut *self,
                               |flash, dur| flash.access.sleep(dur),
                               |flash| flash.is_busy().map(|busy| !busy))?;
        match outcome {
            Outcome::Ready { polls, elapsed } => {
                log::trace!("{} complete after {} polls, {:?}", operation, polls, elapsed);
                Ok(())
            },
            Outcome::Expired { polls, elapsed } => {
                log::error!("Device still busy with {} after {} polls, {:?}; state unknown",
                            operation, polls, elapsed);
                self.status = None;
                Err(Error::Timeout { operation, elapsed })
            },
        }
    }

    /// Writes `frame` to the flash memory, then returns `frame.rx_len` bytes of response.
    pub fn exchange(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        log::trace!("SPI exchange: write {:02X?}, read {} bytes", &frame.tx, frame.rx_len);
        let rx = transfer(&mut self.access, frame)?;
        log::trace!("SPI exchange: read {:02X?}", &rx[..rx.len().min(16)]);
        Ok(rx)
    }

    /// Writes `frame` to the flash memory, without reading the response.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        log::trace!("SPI write: {:02X?}", &frame.tx[..frame.tx.len().min(16)]);
        self.access.write(&frame.tx)?;
        Ok(())
    }

    /// Checks `address` and `length` lie within the device.
    fn check_range(&self, address: u32, length: usize) -> Result<Region> {
        log::trace!("Checking address={:08X} length={}", address, length);
        let region = Region::new(address, length);
        match region.end() {
            Some(end) if end <= self.device.size => Ok(region),
            _ => {
                log::error!("Operation would exceed flash capacity");
                Err(Error::InvalidRange {
                    address, length, reason: RangeFault::OutOfBounds { size: self.device.size },
                })
            },
        }
    }

    /// Check the device may be modified, waiting for any operation in progress.
    fn prepare(&mut self, operation: Operation) -> Result<()> {
        let status = self.status()?;
        if self.is_protected(status) {
            log::error!("Flash write protection is enabled (status {}), try unlocking.", status);
            return Err(Error::Locked { status });
        }
        if status.is_busy() {
            log::debug!("Device busy, waiting before starting");
            self.wait_while_busy(operation, None)?;
        }
        Ok(())
    }

    fn is_protected(&self, status: StatusRegister) -> bool {
        match self.device.lock {
            Some(lock) => status.is_protected(lock.mask),
            None => false,
        }
    }

    fn lock_control(&self, operation: Operation) -> Result<LockControl> {
        match self.device.lock {
            Some(lock) => Ok(lock),
            None => Err(self.unsupported(operation)),
        }
    }

    fn unsupported(&self, operation: Operation) -> Error {
        log::error!("{} does not support {}", self.device.name, operation);
        Error::Unsupported { operation, device: self.device.name }
    }

    fn read_frame(&self, address: u32, length: usize) -> Frame {
        if self.frequency > self.device.max_read_frequency {
            Frame::fast_read(address, length)
        } else {
            Frame::read(address, length)
        }
    }

    fn write_status(&mut self, operation: Operation, lock: LockControl, value: StatusRegister)
        -> Result<()>
    {
        self.write_frame(&Frame::write_enable(lock.write_enable))?;
        self.write_frame(&Frame::write_status(value.0))?;
        self.wait_while_busy(operation, Some(lock.time_max))
    }

    /// Program up to one page of data, which must not cross a page boundary.
    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.write_enable()?;
        self.write_frame(&Frame::page_program(address, data))?;
        self.wait_while_busy(Operation::Program, Some(self.device.page_program_time_max))
    }

    fn program_pages(&mut self, address: u32, data: &[u8], committed: &mut usize, cb: &dyn Fn(usize))
        -> Result<()>
    {
        for (page_addr, range) in split_pages(address, data.len(), self.device.page_size) {
            self.program_page(page_addr, &data[range.clone()])?;
            *committed += range.len();
            cb(*committed);
        }
        Ok(())
    }

    /// Program using AAI word programming, with single byte programs for an
    /// odd start address or an odd trailing byte.
    fn program_aai(&mut self, address: u32, data: &[u8], committed: &mut usize, cb: &dyn Fn(usize))
        -> Result<()>
    {
        let mut address = address;
        let mut data = data;

        if address % 2 == 1 {
            self.program_page(address, &data[..1])?;
            *committed += 1;
            cb(*committed);
            address += 1;
            data = &data[1..];
        }

        let words = data.len() / 2;
        if words > 0 {
            self.write_enable()?;
            let result = self.program_aai_words(address, &data[..words * 2], committed, cb);
            // AAI mode must be left even on failure, or the device ignores other commands.
            let disable = self.write_disable();
            result?;
            disable?;
            address += (words * 2) as u32;
            data = &data[words * 2..];
        }

        if let Some(&byte) = data.first() {
            self.program_page(address, &[byte])?;
            *committed += 1;
            cb(*committed);
        }
        Ok(())
    }

    fn program_aai_words(&mut self, address: u32, data: &[u8], committed: &mut usize,
                         cb: &dyn Fn(usize)) -> Result<()>
    {
        log::trace!("AAI programming {} words from 0x{:08X}", data.len() / 2, address);
        for (idx, word) in data.chunks_exact(2).enumerate() {
            let word = [word[0], word[1]];
            let frame = if idx == 0 {
                Frame::aai_word_first(address, word)
            } else {
                Frame::aai_word_next(word)
            };
            self.write_frame(&frame)?;
            self.wait_while_busy(Operation::Program, Some(self.device.page_program_time_max))?;
            *committed += 2;
            cb(*committed);
        }
        Ok(())
    }

    fn run_chip_erase(&mut self, opcode: u8) -> Result<()> {
        log::debug!("Erasing entire {}", self.device);
        self.write_enable()?;
        self.write_frame(&Frame::chip_erase(opcode))?;
        self.wait_while_busy(Operation::ChipErase, Some(self.device.chip_erase_time_max))
    }

    /// Execute the sequence of erase operations from `plan`.
    ///
    /// `cb` is called with the number of bytes erased so far.
    fn run_erase_plan<F: Fn(usize)>(&mut self, plan: &ErasePlan, cb: F) -> Result<()> {
        let mut total_erased = 0;
        for step in plan.0.iter() {
            log::trace!("Executing erase plan: Erase 0x{:02X} ({} bytes) from 0x{:08X}",
                        step.opcode, step.size, step.address);
            self.write_enable()?;
            self.write_frame(&Frame::erase(step.opcode, step.address))?;
            self.wait_while_busy(Operation::Erase, Some(step.time_max))?;
            total_erased += step.size;
            cb(total_erased);
        }
        log::debug!("Erased {} bytes", plan.total_size());
        Ok(())
    }
}

impl<A: FlashAccess> core::fmt::Display for Flash<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self.device)
    }
}

/// Perform one exchange, checking the response length.
fn transfer<A: FlashAccess>(access: &mut A, frame: &Frame) -> Result<Vec<u8>> {
    let rx = access.exchange(&frame.tx, frame.rx_len)?;
    if rx.len() != frame.rx_len {
        return Err(anyhow::anyhow!("Expected {} bytes from SPI exchange, got {}",
                                   frame.rx_len, rx.len()).into());
    }
    Ok(rx)
}

/// Read the device's JEDEC manufacturer and device ID.
///
/// The manufacturer ID may be prefixed with up to 13 of the
/// continuation code 0x7F.
fn read_jedec_id<A: FlashAccess>(access: &mut A) -> Result<JedecId> {
    log::debug!("Reading SPI Flash ID");
    // Attempt to read assuming a single-byte manufacturer ID.
    let mut data = transfer(access, &Frame::read_id(3))?;
    if data[0] == JedecId::CONTINUATION {
        // If the first byte is continuation, read 16 bytes, to allow
        // up to 13 continuation bytes.
        data = transfer(access, &Frame::read_id(16))?;
    }
    let id = match JedecId::from_bytes(&data) {
        Some(id) => id,
        None => {
            log::error!("Found more than 13 continuation bytes in manufacturer ID");
            return Err(Error::UnknownDevice {
                id: JedecId::new(JedecId::CONTINUATION, 0x7F7F),
            });
        },
    };
    if id.is_blank() {
        log::warn!("No device responding, read ID {:02X?}", data);
    }
    log::debug!("Read ID: {}", id);
    Ok(id)
}
