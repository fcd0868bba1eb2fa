//! Bus access behind a small trait so the driver's command loop can be
//! exercised without silicon. The real implementation wraps a `/dev/i2c-N`
//! character device; the handle owns the file descriptor and dropping it
//! closes the bus. Slave address selection uses the `I2C_SLAVE` ioctl.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

// From linux/i2c-dev.h.
nix::ioctl_write_int_bad!(i2c_set_slave, 0x0703);

pub trait Bus: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
    /// One bus read transaction filling `buf` completely; a short read is an
    /// error rather than a retry, so the caller controls retry pacing.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<()>;
    /// Wake pulse ahead of addressing the device.
    fn wake_pulse(&mut self);
}

pub struct I2cBus {
    file: File,
    path: PathBuf,
}

impl I2cBus {
    pub fn open(path: &Path, addr: u16) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        unsafe { i2c_set_slave(file.as_raw_fd(), i32::from(addr)) }.map_err(io::Error::from)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Bus for I2cBus {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let n = self.file.read(buf)?;
        if n < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short i2c read: {n} of {} bytes", buf.len()),
            ));
        }
        Ok(())
    }

    fn wake_pulse(&mut self) {
        // Throwaway session at address 0x00; the write is NACKed by design
        // of the wake pulse, so the error is ignored.
        if let Ok(mut pulse) = I2cBus::open(&self.path, 0x00) {
            let _ = pulse.file.write_all(&[0x00]);
        }
    }
}
