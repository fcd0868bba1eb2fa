//! ATECC608A device session: serialized command loop, wake/idle/sleep
//! sequencing, failure accounting and recovery.
//!
//! All bus traffic happens under one mutex, so callers from any number of
//! handler tasks execute strictly in series. Every operation here blocks
//! (bus I/O plus mandated settle times); run it under `spawn_blocking`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::i2c::{Bus, I2cBus};
use crate::protocol::{
    build_command, parse_response, scan_fault_patterns, ProtocolError, EXEC_CONFIG_READ,
    EXEC_INFO, EXEC_LOCK, EXEC_RANDOM, EXEC_WRITE, INFO_MODE_REVISION, LOCK_MODE_CONFIG_NO_CRC,
    LOCK_STATUS_WORD, OPCODE_INFO, OPCODE_LOCK, OPCODE_RANDOM, OPCODE_READ, OPCODE_WRITE,
    RANDOM_BLOCK_LEN, RANDOM_RESPONSE_LEN, STATUS_RESPONSE_LEN, WORD_ADDR_IDLE, WORD_ADDR_SLEEP,
    WORD_RESPONSE_LEN, ZONE_CONFIG,
};

/// Settle time after power-on before any bus traffic.
const POWER_ON_DELAY: Duration = Duration::from_millis(50);
/// Pause after the wake pulse before the device is addressable.
const WAKE_DELAY: Duration = Duration::from_millis(2);
/// Pause between wake verification and the first real command.
const POST_WAKE_DELAY: Duration = Duration::from_millis(5);
const WAKE_RETRIES: u32 = 5;
const READ_RETRIES: u32 = 20;
const INIT_RETRIES: u32 = 10;
const INIT_BACKOFF: Duration = Duration::from_millis(100);

/// TLS provisioning template for config-zone bytes 16..128. The first 16
/// bytes of the zone are read-only; the word at offset 84 (lock bytes) is
/// skipped at write time and only changed by the LOCK command.
const CONFIG_TLS: [u8; 112] = [
    0xC0, 0x00, 0x00, 0x01, // I2C address, reserved, OTP mode, chip mode
    0x85, 0x00, 0x82, 0x00, // SlotConfig 0-1
    0x85, 0x20, 0x85, 0x20, // SlotConfig 2-3
    0x85, 0x20, 0x8F, 0x46, // SlotConfig 4-5
    0x8F, 0x0F, 0x9F, 0x8F, // SlotConfig 6-7
    0x0F, 0x0F, 0x8F, 0x0F, // SlotConfig 8-9
    0x0F, 0x8F, 0x0F, 0x8F, // SlotConfig 10-11
    0x0F, 0x8F, 0x0F, 0x0F, // SlotConfig 12-13
    0x0D, 0x1F, 0x0F, 0x0F, // SlotConfig 14-15
    0xFF, 0xFF, 0xFF, 0xFF, // Counter 0
    0x00, 0x00, 0x00, 0x00,
    0xFF, 0xFF, 0xFF, 0xFF, // Counter 1
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, // UseLock, VolatileKey permit
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x55, 0x55, // reserved word at offset 84, never written
    0xFF, 0xFF, 0x00, 0x00, // SlotLocked
    0x00, 0x00, 0x00, 0x00, // ChipOptions, X509format
    0x33, 0x00, 0x33, 0x00, // KeyConfig 0-1
    0x33, 0x00, 0x33, 0x00, // KeyConfig 2-3
    0x33, 0x00, 0x1C, 0x00, // KeyConfig 4-5
    0x1C, 0x00, 0x1C, 0x00, // KeyConfig 6-7
    0x3C, 0x00, 0x3C, 0x00, // KeyConfig 8-9
    0x3C, 0x00, 0x3C, 0x00, // KeyConfig 10-11
    0x3C, 0x00, 0x3C, 0x00, // KeyConfig 12-13
    0x32, 0x00, 0x3C, 0x00, // KeyConfig 14-15
];

/// First writable byte offset of the config zone.
const CONFIG_WRITABLE_OFFSET: usize = 16;
/// Byte offset of the reserved lock word inside the config zone.
const CONFIG_RESERVED_OFFSET: usize = 84;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unknown,
    Healthy,
    Failed,
    Recovering,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("i2c: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("wake verification failed after {attempts} attempts")]
    WakeFailed { attempts: u32 },
    #[error("unexpected response length {got}, wanted {wanted}")]
    UnexpectedLength { got: usize, wanted: usize },
    #[error("initialization failed after {attempts} attempts: {last}")]
    InitFailed { attempts: u32, last: String },
    #[error("{consecutive} consecutive hardware failures, limit reached")]
    Fatal { consecutive: u32 },
}

impl DeviceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Fatal { .. })
    }
}

pub struct DeviceOptions {
    pub auto_config: bool,
    pub auto_config_confirm: bool,
    pub max_failures: u32,
}

pub struct AteccDevice {
    bus: Mutex<Box<dyn Bus>>,
    state: Mutex<SessionState>,
    consecutive_failures: AtomicU32,
    revision: Mutex<Option<[u8; 4]>>,
    opts: DeviceOptions,
}

impl AteccDevice {
    /// Open the I2C bus and bring the session to `Healthy`, retrying
    /// initialization with exponential backoff. Blocking.
    pub fn open(
        bus_path: &std::path::Path,
        addr: u16,
        opts: DeviceOptions,
    ) -> Result<Arc<Self>, DeviceError> {
        thread::sleep(POWER_ON_DELAY);
        let bus = I2cBus::open(bus_path, addr)?;
        Self::with_bus(Box::new(bus), opts)
    }

    pub(crate) fn with_bus(bus: Box<dyn Bus>, opts: DeviceOptions) -> Result<Arc<Self>, DeviceError> {
        let device = Arc::new(Self {
            bus: Mutex::new(bus),
            state: Mutex::new(SessionState::Unknown),
            consecutive_failures: AtomicU32::new(0),
            revision: Mutex::new(None),
            opts,
        });

        let mut backoff = INIT_BACKOFF;
        let mut last = String::new();
        for attempt in 1..=INIT_RETRIES {
            match device.initialize() {
                Ok(()) => {
                    device.set_state(SessionState::Healthy);
                    info!("device initialized on attempt {attempt}");
                    return Ok(device);
                }
                Err(e) => {
                    warn!("device init attempt {attempt}/{INIT_RETRIES} failed: {e}");
                    last = e.to_string();
                    thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
        device.set_state(SessionState::Failed);
        Err(DeviceError::InitFailed {
            attempts: INIT_RETRIES,
            last,
        })
    }

    /// Produce 32 fresh random bytes. A failure marks the session `Failed`
    /// and bumps the consecutive-failure counter; crossing the configured
    /// limit returns `Fatal` so the caller can exit for supervision. No
    /// retry happens here; retry policy belongs to the caller.
    pub fn generate_random(&self) -> Result<[u8; RANDOM_BLOCK_LEN], DeviceError> {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        match self.generate_random_locked(bus.as_mut()) {
            Ok(block) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.set_state(SessionState::Healthy);
                Ok(block)
            }
            Err(e) => {
                let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                self.set_state(SessionState::Failed);
                if n >= self.opts.max_failures {
                    error!("hardware failure limit reached ({n}): {e}");
                    Err(DeviceError::Fatal { consecutive: n })
                } else {
                    Err(e)
                }
            }
        }
    }

    fn generate_random_locked(
        &self,
        bus: &mut dyn Bus,
    ) -> Result<[u8; RANDOM_BLOCK_LEN], DeviceError> {
        self.wake(bus)?;
        let data = self.transact(
            bus,
            OPCODE_RANDOM,
            0,
            0,
            &[],
            EXEC_RANDOM,
            RANDOM_RESPONSE_LEN,
        )?;
        if data.len() != RANDOM_BLOCK_LEN {
            return Err(DeviceError::UnexpectedLength {
                got: data.len(),
                wanted: RANDOM_BLOCK_LEN,
            });
        }
        scan_fault_patterns(&data)?;
        self.idle(bus);
        let mut block = [0u8; RANDOM_BLOCK_LEN];
        block.copy_from_slice(&data);
        Ok(block)
    }

    /// Wake-verify handshake: pulse the bus (the NACK at address 0x00 is
    /// expected), wait, then confirm with an INFO command. Progressive
    /// backoff across attempts.
    fn wake(&self, bus: &mut dyn Bus) -> Result<(), DeviceError> {
        for attempt in 1..=WAKE_RETRIES {
            bus.wake_pulse();
            thread::sleep(WAKE_DELAY);
            thread::sleep(POST_WAKE_DELAY);
            match self.transact(
                bus,
                OPCODE_INFO,
                INFO_MODE_REVISION,
                0,
                &[],
                EXEC_INFO,
                WORD_RESPONSE_LEN,
            ) {
                Ok(data) if data.len() == 4 => return Ok(()),
                Ok(data) => warn!("wake verify returned {} bytes", data.len()),
                Err(e) => warn!("wake attempt {attempt}/{WAKE_RETRIES}: {e}"),
            }
            thread::sleep(WAKE_DELAY * attempt);
        }
        Err(DeviceError::WakeFailed {
            attempts: WAKE_RETRIES,
        })
    }

    /// One command round-trip: write packet, wait the command's execution
    /// time (measured from the end of the write), then read the response,
    /// retrying the read on bus errors.
    fn transact(
        &self,
        bus: &mut dyn Bus,
        opcode: u8,
        p1: u8,
        p2: u16,
        payload: &[u8],
        exec_wait: Duration,
        resp_len: usize,
    ) -> Result<Vec<u8>, DeviceError> {
        let packet = build_command(opcode, p1, p2, payload);
        bus.write(&packet)?;
        thread::sleep(exec_wait);

        let mut raw = vec![0u8; resp_len];
        let mut read_result = Ok(());
        for _ in 0..READ_RETRIES {
            read_result = bus.read(&mut raw);
            if read_result.is_ok() {
                break;
            }
            thread::sleep(WAKE_DELAY);
        }
        read_result?;

        let data = parse_response(&raw)?;
        // A one-byte payload in a longer exchange is a status frame; nonzero
        // codes are errors, zero is a bare acknowledgement.
        if data.len() == 1 && resp_len > STATUS_RESPONSE_LEN && data[0] != 0 {
            return Err(ProtocolError::DeviceStatus { code: data[0] }.into());
        }
        Ok(data)
    }

    fn initialize(&self) -> Result<(), DeviceError> {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        let bus = bus.as_mut();
        self.wake(bus)?;

        let info = self.transact(
            bus,
            OPCODE_INFO,
            INFO_MODE_REVISION,
            0,
            &[],
            EXEC_INFO,
            WORD_RESPONSE_LEN,
        )?;
        if info.len() == 4 {
            let mut rev = [0u8; 4];
            rev.copy_from_slice(&info);
            *self.revision.lock().unwrap_or_else(|e| e.into_inner()) = Some(rev);
        }

        let lock_word = self.transact(
            bus,
            OPCODE_READ,
            ZONE_CONFIG,
            LOCK_STATUS_WORD,
            &[],
            EXEC_CONFIG_READ,
            WORD_RESPONSE_LEN,
        )?;
        let locked = lock_word.len() == 4 && lock_word[2] == 0x00 && lock_word[3] == 0x00;
        if locked {
            info!("config zone locked");
        } else if self.opts.auto_config && self.opts.auto_config_confirm {
            info!("config zone unlocked, provisioning TLS template");
            self.write_config_zone(bus)?;
            self.lock_config_zone(bus)?;
        } else {
            warn!("config zone unlocked; provisioning needs both auto_config and the confirm flag");
        }
        Ok(())
    }

    fn write_config_zone(&self, bus: &mut dyn Bus) -> Result<(), DeviceError> {
        for (i, word) in CONFIG_TLS.chunks(4).enumerate() {
            let offset = CONFIG_WRITABLE_OFFSET + i * 4;
            if offset == CONFIG_RESERVED_OFFSET {
                continue;
            }
            self.transact(
                bus,
                OPCODE_WRITE,
                ZONE_CONFIG,
                (offset / 4) as u16,
                word,
                EXEC_WRITE,
                STATUS_RESPONSE_LEN,
            )?;
        }
        Ok(())
    }

    fn lock_config_zone(&self, bus: &mut dyn Bus) -> Result<(), DeviceError> {
        self.transact(
            bus,
            OPCODE_LOCK,
            LOCK_MODE_CONFIG_NO_CRC,
            0x0000,
            &[],
            EXEC_LOCK,
            STATUS_RESPONSE_LEN,
        )?;
        info!("config zone locked");
        Ok(())
    }

    fn idle(&self, bus: &mut dyn Bus) {
        if let Err(e) = bus.write(&[WORD_ADDR_IDLE]) {
            warn!("failed to idle device: {e}");
        }
    }

    /// Put the device to sleep; called on shutdown before the fd closes.
    pub fn sleep_device(&self) {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = bus.write(&[WORD_ADDR_SLEEP]) {
            warn!("failed to put device to sleep: {e}");
        }
    }

    /// Launch a background recovery pass: re-run the wake-verify handshake
    /// with exponential backoff. Exhaustion is fatal to the process.
    pub fn begin_recovery(self: &Arc<Self>) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *st == SessionState::Recovering {
                return;
            }
            *st = SessionState::Recovering;
        }
        let device = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut backoff = INIT_BACKOFF;
            for attempt in 1..=INIT_RETRIES {
                {
                    let mut bus = device.bus.lock().unwrap_or_else(|e| e.into_inner());
                    if device.wake(bus.as_mut()).is_ok() {
                        device.consecutive_failures.store(0, Ordering::Relaxed);
                        device.set_state(SessionState::Healthy);
                        info!("device recovered on attempt {attempt}");
                        return;
                    }
                }
                thread::sleep(backoff);
                backoff *= 2;
            }
            error!("device recovery exhausted, exiting for supervision restart");
            std::process::exit(1);
        });
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn revision(&self) -> Option<[u8; 4]> {
        *self.revision.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc16;
    use std::collections::VecDeque;
    use std::io;

    /// Scripted bus: hands out canned response frames in order and records
    /// every write for inspection.
    struct MockBus {
        frames: VecDeque<Vec<u8>>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl MockBus {
        fn new(frames: Vec<Vec<u8>>) -> Self {
            Self {
                frames: frames.into(),
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Bus for MockBus {
        fn write(&mut self, buf: &[u8]) -> io::Result<()> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
            match self.frames.pop_front() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(())
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no frame queued")),
            }
        }

        fn wake_pulse(&mut self) {}
    }

    fn frame(data: &[u8]) -> Vec<u8> {
        let mut out = vec![(1 + data.len() + 2) as u8];
        out.extend_from_slice(data);
        let crc = crc16(&out);
        out.push((crc & 0xFF) as u8);
        out.push((crc >> 8) as u8);
        out
    }

    const REVISION: [u8; 4] = [0x00, 0x00, 0x60, 0x02];
    /// Lock bytes zero: config zone locked.
    const LOCKED_WORD: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

    /// wake-verify INFO, revision INFO, lock-status READ
    fn init_frames() -> Vec<Vec<u8>> {
        vec![frame(&REVISION), frame(&REVISION), frame(&LOCKED_WORD)]
    }

    fn opts(max_failures: u32) -> DeviceOptions {
        DeviceOptions {
            auto_config: false,
            auto_config_confirm: false,
            max_failures,
        }
    }

    fn device_with_frames(extra: Vec<Vec<u8>>, max_failures: u32) -> Arc<AteccDevice> {
        let mut frames = init_frames();
        frames.extend(extra);
        AteccDevice::with_bus(Box::new(MockBus::new(frames)), opts(max_failures)).unwrap()
    }

    /// One generate_random exchange: wake-verify INFO then the RANDOM frame.
    fn generate_frames(block: &[u8; 32]) -> Vec<Vec<u8>> {
        vec![frame(&REVISION), frame(block)]
    }

    #[test]
    fn initialization_reads_revision_and_lock_state() {
        let device = device_with_frames(Vec::new(), 10);
        assert_eq!(device.state(), SessionState::Healthy);
        assert_eq!(device.revision(), Some(REVISION));
    }

    #[test]
    fn generate_returns_the_device_block() {
        let block: [u8; 32] = std::array::from_fn(|i| i as u8);
        let device = device_with_frames(generate_frames(&block), 10);
        assert_eq!(device.generate_random().unwrap(), block);
        assert_eq!(device.consecutive_failures(), 0);
        assert_eq!(device.state(), SessionState::Healthy);
    }

    #[test]
    fn stuck_high_block_fails_and_marks_the_session() {
        let device = device_with_frames(generate_frames(&[0xFF; 32]), 10);
        let err = device.generate_random().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Protocol(ProtocolError::FaultPattern { .. })
        ));
        assert_eq!(device.consecutive_failures(), 1);
        assert_eq!(device.state(), SessionState::Failed);
    }

    #[test]
    fn success_resets_the_failure_run() {
        let good: [u8; 32] = std::array::from_fn(|i| (i * 7) as u8);
        let mut extra = generate_frames(&[0xFF; 32]);
        extra.extend(generate_frames(&good));
        let device = device_with_frames(extra, 10);
        assert!(device.generate_random().is_err());
        assert!(device.generate_random().is_ok());
        assert_eq!(device.consecutive_failures(), 0);
    }

    #[test]
    fn failure_limit_escalates_to_fatal() {
        let mut extra = Vec::new();
        for _ in 0..3 {
            extra.extend(generate_frames(&[0xFF; 32]));
        }
        let device = device_with_frames(extra, 3);
        assert!(!device.generate_random().unwrap_err().is_fatal());
        assert!(!device.generate_random().unwrap_err().is_fatal());
        let third = device.generate_random().unwrap_err();
        assert!(third.is_fatal());
        assert_eq!(device.consecutive_failures(), 3);
    }

    #[test]
    fn nonzero_status_frame_surfaces_as_device_status() {
        // RANDOM answered by a status frame carrying an error code
        let extra = vec![frame(&REVISION), frame(&[0x0F])];
        let device = device_with_frames(extra, 10);
        let err = device.generate_random().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Protocol(ProtocolError::DeviceStatus { code: 0x0F })
        ));
    }

    #[test]
    fn random_command_goes_out_framed_and_device_is_idled() {
        let block: [u8; 32] = std::array::from_fn(|i| i as u8);
        let mut frames = init_frames();
        frames.extend(generate_frames(&block));
        let bus = MockBus::new(frames);
        let writes = Arc::clone(&bus.writes);
        let device = AteccDevice::with_bus(Box::new(bus), opts(10)).unwrap();
        device.generate_random().unwrap();
        let writes = writes.lock().unwrap();
        let expected = build_command(OPCODE_RANDOM, 0, 0, &[]);
        assert!(writes.iter().any(|w| *w == expected));
        assert_eq!(writes.last().unwrap(), &vec![WORD_ADDR_IDLE]);
    }
}
