// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! Byte-level device transport
//!
//! This module provides the single low-level operation every programming
//! engine is built on: a paired write-then-read exchange with one device on
//! a local hardware bus. The production implementation talks to the Linux
//! i2c-dev interface; tests substitute scripted transports through the
//! [`ByteTransport`] trait.

use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
};

use log::{debug, info, trace};

/// Transport error types for byte-level device exchanges
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Operation attempted on a handle that is not open
    #[error("device handle is not open")]
    NotOpen,

    /// Error while opening or claiming the bus device file
    #[error("error occurred while opening the bus device")]
    IOError(#[from] io::Error),

    /// The combined transfer failed after exhausting retries
    #[error("bus transfer failed with errno {errno}")]
    TransportFailed {
        /// `errno` captured from the failing transfer
        errno: i32,
    },
}

/// Result type for transport operations
pub type ResultTransport<T> = Result<T, TransportError>;

/// Core transport trait for device byte exchanges
///
/// A single call performs, atomically with respect to other users of the
/// same handle, an optional write of `write` followed by an optional read
/// of `read_len` bytes from the same device address. Either half may be
/// empty; both empty is a no-op returning an empty read.
pub trait ByteTransport {
    /// Perform one write-then-read exchange
    ///
    /// # Arguments
    /// * `write` - Bytes to send, possibly empty
    /// * `read_len` - Number of bytes to read back, possibly zero
    ///
    /// # Returns
    /// The bytes read, `read_len` long
    ///
    /// # Errors
    /// [`TransportError::NotOpen`] on a closed handle, otherwise
    /// [`TransportError::TransportFailed`] once retries are exhausted.
    fn send_receive(&mut self, write: &[u8], read_len: usize) -> ResultTransport<Vec<u8>>;

    /// Get a string identifier for this transport instance
    fn identifier(&self) -> &str;
}

// i2c-dev ioctl interface, see Documentation/i2c/dev-interface.rst
const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_RDWR: libc::c_ulong = 0x0707;
const I2C_M_RD: u16 = 0x0001;

#[repr(C)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

#[repr(C)]
struct I2cRdwrIoctlData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

/// Linux i2c-dev transport
///
/// Opens a numbered bus device and claims one 7-bit device address for the
/// lifetime of the handle. Exchanges go through a combined `I2C_RDWR`
/// transaction so no other traffic can interleave between the write and the
/// read halves.
#[derive(Debug)]
pub struct I2cDevice {
    interface: String,
    device: Option<File>,
    address: u8,
    max_retries: u32,
}

impl I2cDevice {
    /// Open bus `bus` and claim `address`
    ///
    /// # Errors
    /// [`TransportError::IOError`] when the device file cannot be opened or
    /// the address claim is rejected (for example when another driver holds
    /// it).
    pub fn open(bus: u16, address: u8) -> ResultTransport<Self> {
        Self::open_with_retries(bus, address, 0)
    }

    /// Open with a per-exchange retry budget for transient bus failures
    ///
    /// # Errors
    /// Same as [`I2cDevice::open`].
    pub fn open_with_retries(bus: u16, address: u8, max_retries: u32) -> ResultTransport<Self> {
        let path = format!("/dev/i2c-{bus}");

        let device = OpenOptions::new().read(true).write(true).open(&path)?;

        // Claim the device address. The plain (non-force) claim keeps the
        // address exclusive against other userspace users.
        unsafe {
            let result = libc::ioctl(device.as_raw_fd(), I2C_SLAVE, libc::c_ulong::from(address));
            if result < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        info!("Opened I2C device {path} with device address 0x{address:02X}");

        Ok(I2cDevice {
            interface: format!("{path}:0x{address:02X}"),
            device: Some(device),
            address,
            max_retries,
        })
    }

    /// Release the address claim and close the device file
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            debug!("Closed I2C device {}", self.interface);
        }
    }

    /// Whether the handle is currently open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn transfer_once(&self, device: &File, write: &[u8], read: &mut [u8]) -> Result<(), i32> {
        let mut msgs: [I2cMsg; 2] = [
            I2cMsg {
                addr: u16::from(self.address),
                flags: 0,
                len: 0,
                buf: std::ptr::null_mut(),
            },
            I2cMsg {
                addr: u16::from(self.address),
                flags: I2C_M_RD,
                len: 0,
                buf: std::ptr::null_mut(),
            },
        ];

        let mut n_msg = 0;
        if !write.is_empty() {
            msgs[n_msg].len = write.len() as u16;
            msgs[n_msg].buf = write.as_ptr().cast_mut();
            n_msg += 1;
        }
        if !read.is_empty() {
            msgs[n_msg].flags = I2C_M_RD;
            msgs[n_msg].len = read.len() as u16;
            msgs[n_msg].buf = read.as_mut_ptr();
            n_msg += 1;
        }

        if n_msg == 0 {
            return Ok(());
        }

        let mut request = I2cRdwrIoctlData {
            msgs: msgs.as_mut_ptr(),
            nmsgs: n_msg as u32,
        };

        let result = unsafe { libc::ioctl(device.as_raw_fd(), I2C_RDWR, &mut request) };
        if result < 0 {
            return Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        Ok(())
    }
}

impl ByteTransport for I2cDevice {
    fn send_receive(&mut self, write: &[u8], read_len: usize) -> ResultTransport<Vec<u8>> {
        let device = self.device.as_ref().ok_or(TransportError::NotOpen)?;
        let mut read = vec![0u8; read_len];

        if !write.is_empty() {
            debug!("TX: {write:02X?}");
        }

        let mut last_errno = 0;
        for attempt in 0..=self.max_retries {
            match self.transfer_once(device, write, &mut read) {
                Ok(()) => {
                    if !read.is_empty() {
                        debug!("RX: {read:02X?}");
                    }
                    return Ok(read);
                }
                Err(errno) => {
                    trace!(
                        "transfer on {} failed with errno {errno} (attempt {})",
                        self.interface,
                        attempt + 1
                    );
                    last_errno = errno;
                }
            }
        }

        Err(TransportError::TransportFailed { errno: last_errno })
    }

    fn identifier(&self) -> &str {
        &self.interface
    }
}

impl Drop for I2cDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteTransport, I2cDevice, TransportError};

    fn closed_device() -> I2cDevice {
        I2cDevice {
            interface: "/dev/i2c-9:0x40".to_owned(),
            device: None,
            address: 0x40,
            max_retries: 0,
        }
    }

    #[test]
    fn test_send_receive_requires_open_handle() {
        let mut device = closed_device();
        let err = device.send_receive(&[0xE0, 0, 0, 0], 4).unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
    }

    #[test]
    #[ignore = "Requires an i2c-dev adapter"]
    fn test_board_open_and_probe() {
        let mut device = I2cDevice::open(0, 0x40).unwrap();
        let id = device.send_receive(&[0xE0, 0, 0, 0], 4).unwrap();
        assert_eq!(id.len(), 4);
    }
}
