// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! MachXO5D programming engine
//!
//! XO5D parts carry an out-of-band update block speaking a framed command
//! protocol: every request is a checksummed packet with fragment flags, and
//! large payloads split into fragments the device reassembles. The part
//! keeps two customer images; an update targets the non-active one and
//! activates it for the next reset after a device-side dry run validates
//! it.
//!
//! # Frame formats
//! Request: `|0xA5|cmd|fragFlags:2 LE|len|payload|checksum|`
//! Status response: `|0xA5|cmd|fragFlags:2|len|type|status|len16:2|checksum|`
//! Data response: `|0xA5|cmd|fragFlags:2|len|type|data...|checksum|`
//!
//! The checksum is the 8-bit sum of every preceding byte.

use log::{error, info};
use tokio::time::sleep;

use super::{
    ChipInfo, ProgramSequence, ProtocolError, ResultProtocol, WAIT_BUSY_INTERVAL,
    WAIT_BUSY_MAX_RETRY,
};
use crate::transport::ByteTransport;

const OOB_HEADER: u8 = 0xA5;

// Command identifiers
const CMD_CHECK_IMAGE_STATUS: u8 = 0x00;
const CMD_IMAGE_ERASE: u8 = 0x01;
const CMD_IMAGE_PROGRAM: u8 = 0x02;
const CMD_IMAGE_DRY_RUN: u8 = 0x03;
const CMD_GET_DRY_RUN_RESULT: u8 = 0x04;
const CMD_SET_PRIMARY_IMAGE: u8 = 0x05;
const CMD_GET_STATUS_LENGTH: u8 = 0x06;
const CMD_GET_DATA: u8 = 0x07;

// Fragment flag word: top bits mark packet position, low bits count
// packets starting at 1.
const FIRST_PACKET: u16 = 0x8000;
const LAST_PACKET: u16 = 0x4000;
const FIRST_AND_LAST_PACKET: u16 = FIRST_PACKET | LAST_PACKET;
const FIRST_PACKET_NUM: u16 = 1;

// Fixed frame overhead: header, command, fragment flags, length, checksum.
const WRITE_FRAME_OVERHEAD: usize = 6;
const STATUS_RESPONSE_LEN: usize = 10;
const DATA_RESPONSE_OVERHEAD: usize = 7;

// Response byte positions
const HEADER_POS: usize = 0;
const LENGTH_POS: usize = 4;
const STATUS_POS: usize = 6;
const DATA_LEN_POS: usize = 7;
const DATA_POS: usize = 6;

// Largest data payload per fragment, leaving room for the image id byte.
const FRAGMENT_DATA_LEN: usize = 244;
const DATA_READ_MAX: usize = 245;

const IMAGE_ID_1: u8 = 1;
const IMAGE_ID_2: u8 = 2;

// Key blob prefix of the customer image streamed with the erase command.
const KEY_BLOB_LEN: usize = 1024;

const DRY_RUN_RESULT_SUCCESS: u8 = 0xAA;
const DRY_RUN_OUTER_RETRY: u32 = 30;
const WRITE_RETRY: u32 = 3;

/// Status codes carried in framed command responses
#[repr(u8)]
#[derive(derive_more::Display, derive_more::TryFrom, Debug, Clone, Copy, strum::EnumIs, PartialEq, Eq)]
#[try_from(repr)]
pub enum OobStatus {
    /// Command completed
    Success = 0x00,
    /// Command failed
    Fail = 0x01,
    /// Dry run still in progress
    DryRun = 0x02,
    /// Request checksum was wrong
    ChecksumError = 0x22,
    /// Command id not recognized
    InvalidCommand = 0x33,
    /// Command arguments rejected
    InvalidArguments = 0x44,
    /// Follow-up packet never arrived
    TimeoutNoPacket = 0x55,
    /// Device is still working on the previous command
    Busy = 0x66,
    /// Power-on default, no command processed yet
    DefaultStatus = 0x77,
    /// Internal I2C API error
    I2cApiError = 0x80,
    /// Internal I2C length error
    I2cLengthError = 0x81,
    /// Internal library handle error
    LibHandleError = 0x82,
    /// No channel scanned
    NoChannelScanned = 0x83,
    /// Channel select failed
    ChannelSelectError = 0x84,
    /// Request frame header invalid
    FrameHeaderError = 0x85,
    /// Request frame length invalid
    FrameLengthError = 0x86,
    /// Request frame checksum invalid
    FrameChecksumError = 0x87,
}

fn checksum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

/// Programming engine for the MachXO5D family
#[derive(Debug)]
pub struct Xo5dEngine<T: ByteTransport> {
    transport: T,
    chip: &'static ChipInfo,
    non_active_image: u8,
    image: Vec<u8>,
}

impl<T: ByteTransport + Send> Xo5dEngine<T> {
    pub(crate) fn new(transport: T, chip: &'static ChipInfo) -> Self {
        Xo5dEngine {
            transport,
            chip,
            non_active_image: IMAGE_ID_2,
            image: Vec::new(),
        }
    }

    pub(crate) fn chip_model(&self) -> &'static str {
        self.chip.model
    }

    fn esfb_write(&mut self, fragment_flag: u16, cmd_id: u8, data: &[u8]) -> ResultProtocol<()> {
        let packet_len = WRITE_FRAME_OVERHEAD + data.len();

        let mut request = Vec::with_capacity(packet_len);
        request.push(OOB_HEADER);
        request.push(cmd_id);
        request.extend_from_slice(&fragment_flag.to_le_bytes());
        request.push(packet_len as u8);
        request.extend_from_slice(data);
        request.push(checksum8(&request));

        self.transport.send_receive(&request, 0)?;
        Ok(())
    }

    // Read the command status and the pending data length. Busy and
    // dry-run statuses short-circuit before frame validation so pollers
    // can keep waiting.
    fn esfb_read_status(&mut self) -> ResultProtocol<(OobStatus, u16)> {
        let response = self
            .transport
            .send_receive(&[CMD_GET_STATUS_LENGTH], STATUS_RESPONSE_LEN)?;
        if response.len() != STATUS_RESPONSE_LEN {
            return Err(ProtocolError::BadResponse("status response length"));
        }

        let status = OobStatus::try_from(response[STATUS_POS])
            .map_err(|_| ProtocolError::BadResponse("unknown status code"))?;

        if status.is_busy() || status.is_dry_run() {
            return Ok((status, 0));
        }

        if response[HEADER_POS] != OOB_HEADER {
            return Err(ProtocolError::BadResponse("status response header"));
        }
        if usize::from(response[LENGTH_POS]) != STATUS_RESPONSE_LEN {
            return Err(ProtocolError::BadResponse("status response length field"));
        }
        let (body, stored) = response.split_at(STATUS_RESPONSE_LEN - 1);
        if stored[0] != checksum8(body) {
            return Err(ProtocolError::BadResponse("status response checksum"));
        }

        let data_len = u16::from_le_bytes([response[DATA_LEN_POS], response[DATA_LEN_POS + 1]]);
        Ok((status, data_len))
    }

    fn esfb_read_data(&mut self, len: usize) -> ResultProtocol<Vec<u8>> {
        let total = DATA_RESPONSE_OVERHEAD + len;
        let response = self.transport.send_receive(&[CMD_GET_DATA], total)?;
        if response.len() != total {
            return Err(ProtocolError::BadResponse("data response length"));
        }

        if response[HEADER_POS] != OOB_HEADER {
            return Err(ProtocolError::BadResponse("data response header"));
        }
        if usize::from(response[LENGTH_POS]) != total {
            return Err(ProtocolError::BadResponse("data response length field"));
        }
        let (body, stored) = response.split_at(total - 1);
        if stored[0] != checksum8(body) {
            return Err(ProtocolError::BadResponse("data response checksum"));
        }

        Ok(response[DATA_POS..DATA_POS + len].to_vec())
    }

    // Poll the status until the device stops reporting busy.
    async fn poll_status(&mut self) -> ResultProtocol<(OobStatus, u16)> {
        let mut retry = 0;
        loop {
            sleep(WAIT_BUSY_INTERVAL).await;
            let (status, data_len) = self.esfb_read_status()?;
            if !status.is_busy() {
                return Ok((status, data_len));
            }
            retry += 1;
            if retry >= WAIT_BUSY_MAX_RETRY {
                error!("device stayed busy past the polling budget");
                return Err(ProtocolError::BusyTimeout);
            }
        }
    }

    async fn expect_success(&mut self) -> ResultProtocol<u16> {
        let (status, data_len) = self.poll_status().await?;
        if status.is_success() {
            Ok(data_len)
        } else {
            error!("framed command failed with status {status}");
            Err(ProtocolError::Framed(status))
        }
    }

    async fn check_current_running_image_status(&mut self) -> ResultProtocol<u32> {
        let mut attempt = 0;
        loop {
            sleep(WAIT_BUSY_INTERVAL).await;
            match self.esfb_write(
                FIRST_AND_LAST_PACKET + FIRST_PACKET_NUM,
                CMD_CHECK_IMAGE_STATUS,
                &[],
            ) {
                Ok(()) => break,
                Err(err) => {
                    attempt += 1;
                    if attempt >= WRITE_RETRY {
                        return Err(err);
                    }
                }
            }
        }

        let status_len = self.expect_success().await?;

        let mut image_status = Vec::with_capacity(usize::from(status_len));
        let mut remaining = usize::from(status_len);
        while remaining > 0 {
            let chunk_len = remaining.min(DATA_READ_MAX);
            let chunk = self.esfb_read_data(chunk_len)?;
            image_status.extend_from_slice(&chunk);
            remaining -= chunk_len;
        }

        // Status block: image id, then the 32-bit bitstream version.
        if image_status.len() < 5 {
            error!("current image status block is too short ({})", image_status.len());
            return Err(ProtocolError::BadResponse("image status block"));
        }

        let image_id = image_status[0];
        let bitstream_version = u32::from_le_bytes(
            image_status[1..5]
                .try_into()
                .expect("status block slice is 4 bytes"),
        );

        self.non_active_image = if image_id == IMAGE_ID_1 {
            IMAGE_ID_2
        } else {
            IMAGE_ID_1
        };
        info!(
            "running image {image_id} (bitstream version {bitstream_version:#010X}), update target {}",
            self.non_active_image
        );

        Ok(bitstream_version)
    }

    // Stream a payload to the device as a sequence of framed fragments,
    // the target image id prepended to each one.
    async fn stream_fragments(
        &mut self,
        cmd_id: u8,
        payload: &[u8],
        mut progress: Option<(&mut (dyn FnMut(u8) + Send), u8, u8)>,
    ) -> ResultProtocol<()> {
        let total = payload.len();
        let mut fragment_flag = FIRST_PACKET + FIRST_PACKET_NUM;
        let mut sent = 0usize;

        while sent < total {
            let chunk_len = FRAGMENT_DATA_LEN.min(total - sent);
            if sent + chunk_len >= total {
                fragment_flag |= LAST_PACKET;
            }

            let mut data = Vec::with_capacity(1 + chunk_len);
            data.push(self.non_active_image);
            data.extend_from_slice(&payload[sent..sent + chunk_len]);

            self.esfb_write(fragment_flag, cmd_id, &data)?;
            self.expect_success().await?;

            sent += chunk_len;
            fragment_flag &= !FIRST_PACKET;
            fragment_flag += 1;

            if let Some((callback, from, to)) = progress.as_mut() {
                let span = usize::from(*to - *from);
                (*callback)(*from + (sent * span / total) as u8);
            }
        }

        Ok(())
    }

    async fn erase_non_active_image(&mut self) -> ResultProtocol<()> {
        let key_blob = self.image[..KEY_BLOB_LEN.min(self.image.len())].to_vec();
        self.stream_fragments(CMD_IMAGE_ERASE, &key_blob, None).await
    }

    async fn program_customer_image(
        &mut self,
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> ResultProtocol<()> {
        let image = self.image.clone();
        self.stream_fragments(CMD_IMAGE_PROGRAM, &image, Some((progress, 30, 80)))
            .await
    }

    // Ask the device to validate the programmed image. A dry-run status
    // means the validation is still running; repeat the request.
    async fn run_polled_command(&mut self, cmd_id: u8) -> ResultProtocol<u16> {
        let request = [self.non_active_image];

        let mut outer_retry = 0;
        loop {
            self.esfb_write(FIRST_AND_LAST_PACKET + FIRST_PACKET_NUM, cmd_id, &request)?;
            let (status, data_len) = self.poll_status().await?;

            if !status.is_dry_run() {
                return if status.is_success() {
                    Ok(data_len)
                } else {
                    error!("framed command {cmd_id:#04X} failed with status {status}");
                    Err(ProtocolError::Framed(status))
                };
            }

            outer_retry += 1;
            if outer_retry >= DRY_RUN_OUTER_RETRY {
                error!("dry run never completed");
                return Err(ProtocolError::BusyTimeout);
            }
        }
    }

    async fn dry_run_customer_image(&mut self) -> ResultProtocol<()> {
        self.run_polled_command(CMD_IMAGE_DRY_RUN).await?;
        Ok(())
    }

    async fn get_dry_run_result(&mut self) -> ResultProtocol<()> {
        let result_len = self.run_polled_command(CMD_GET_DRY_RUN_RESULT).await?;
        let result = self.esfb_read_data(usize::from(result_len))?;

        if result.first() != Some(&DRY_RUN_RESULT_SUCCESS) {
            error!("dry run verdict: {result:02X?}");
            return Err(ProtocolError::BadResponse("dry run verdict"));
        }
        Ok(())
    }

    async fn set_primary_customer_image(&mut self) -> ResultProtocol<()> {
        let request = [self.non_active_image];
        self.esfb_write(FIRST_AND_LAST_PACKET + FIRST_PACKET_NUM, CMD_SET_PRIMARY_IMAGE, &request)?;
        self.expect_success().await?;
        Ok(())
    }
}

impl<T: ByteTransport + Send> ProgramSequence for Xo5dEngine<T> {
    async fn prepare_update(
        &mut self,
        image: &[u8],
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> ResultProtocol<()> {
        info!("checking current running image status");
        self.image = image.to_vec();
        self.check_current_running_image_status().await?;
        progress(10);
        Ok(())
    }

    async fn do_erase(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        info!("erasing non-active image {}", self.non_active_image);
        self.erase_non_active_image().await?;
        progress(30);
        Ok(())
    }

    async fn do_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        info!("programming customer image {}", self.non_active_image);
        self.program_customer_image(progress).await?;
        progress(80);
        Ok(())
    }

    async fn finish_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        info!("dry running customer image {}", self.non_active_image);
        self.dry_run_customer_image().await?;
        progress(85);

        self.get_dry_run_result().await?;
        progress(88);

        info!("activating customer image {} for the next reset", self.non_active_image);
        self.set_primary_customer_image().await?;
        progress(90);
        Ok(())
    }

    async fn read_user_code(&mut self) -> ResultProtocol<u32> {
        self.check_current_running_image_status().await
    }
}
