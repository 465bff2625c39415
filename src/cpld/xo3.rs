// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! MachXO2/XO3/XO3D programming engine
//!
//! The flash families program in transparent mode: the running image stays
//! active while the configuration flash is erased and rewritten 16 bytes at
//! a time, and the device switches over at program-done. Every flash
//! operation is followed by a busy poll and a status register check; each
//! page is read back and compared before moving on.

use log::{debug, error};
use tokio::time::sleep;

use std::time::Duration;

use super::{
    CfgBank, ChipFamily, ChipInfo, ProgramSequence, ProtocolError, ResultProtocol,
    WAIT_BUSY_INTERVAL, WAIT_BUSY_MAX_RETRY,
    jed::JedFile,
};
use crate::transport::ByteTransport;

// Configuration interface opcodes
const CMD_ERASE_FLASH: u8 = 0x0E;
const CMD_DISABLE_CONFIG_INTERFACE: u8 = 0x26;
const CMD_READ_STATUS_REG: u8 = 0x3C;
const CMD_RESET_CONFIG_FLASH: u8 = 0x46;
const CMD_PROGRAM_DONE: u8 = 0x5E;
const CMD_PROGRAM_PAGE: u8 = 0x70;
const CMD_READ_PAGE: u8 = 0x73;
const CMD_ENABLE_CONFIG_MODE: u8 = 0x74;
const CMD_SET_PAGE_ADDRESS: u8 = 0xB4;
const CMD_READ_USER_CODE: u8 = 0xC0;
const CMD_PROGRAM_USER_CODE: u8 = 0xC2;
const CMD_READ_DEVICE_ID: u8 = 0xE0;
const CMD_READ_BUSY_FLAG: u8 = 0xF0;

const BUSY_FLAG_BIT: u8 = 0x80;
// Status register byte 2: bit 4 busy/ready (0 = ready), bit 5 fail/ok
// (0 = ok)
const STATUS_BUSY_OR_READY_BIT: u8 = 4;
const STATUS_FAIL_OR_OK_BIT: u8 = 5;

const PAGE_SIZE: usize = 16;
const MAX_PAGE_WRITE_RETRY: u32 = 10;

// The flash needs a short settle after each page write or the update takes
// far longer overall.
const PAGE_PROGRAM_DELAY: Duration = Duration::from_micros(200);

/// Programming engine for the MachXO2/XO3/XO3D families
#[derive(Debug)]
pub struct Xo3Engine<T: ByteTransport> {
    transport: T,
    chip: &'static ChipInfo,
    target: CfgBank,
    jed: Option<JedFile>,
}

impl<T: ByteTransport + Send> Xo3Engine<T> {
    pub(crate) fn new(transport: T, chip: &'static ChipInfo, target: CfgBank) -> Self {
        Xo3Engine {
            transport,
            chip,
            target,
            jed: None,
        }
    }

    pub(crate) fn chip_model(&self) -> &'static str {
        self.chip.model
    }

    fn is_xo3d(&self) -> bool {
        self.chip.family == ChipFamily::Xo3d
    }

    fn send(&mut self, command: &[u8]) -> ResultProtocol<()> {
        self.transport.send_receive(command, 0)?;
        Ok(())
    }

    fn query(&mut self, command: &[u8], read_len: usize) -> ResultProtocol<Vec<u8>> {
        Ok(self.transport.send_receive(command, read_len)?)
    }

    fn read_device_id(&mut self) -> ResultProtocol<()> {
        let Some(expected) = self.chip.device_id else {
            return Ok(());
        };

        let response = self.query(&[CMD_READ_DEVICE_ID, 0, 0, 0], 4)?;
        let actual: [u8; 4] = response
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::BadResponse("device id length"))?;

        if actual != expected {
            error!("device id {actual:02X?} does not match chip {}", self.chip.model);
            return Err(ProtocolError::DeviceIdMismatch { expected, actual });
        }

        debug!("device id matches chip {}", self.chip.model);
        Ok(())
    }

    fn read_busy_flag(&mut self) -> ResultProtocol<u8> {
        let response = self.query(&[CMD_READ_BUSY_FLAG, 0, 0, 0], 1)?;
        response
            .first()
            .copied()
            .ok_or(ProtocolError::BadResponse("busy flag length"))
    }

    fn read_status_reg(&mut self) -> ResultProtocol<u8> {
        let response = self.query(&[CMD_READ_STATUS_REG, 0, 0, 0], 4)?;
        response
            .get(2)
            .copied()
            .ok_or(ProtocolError::BadResponse("status register length"))
    }

    // Poll the busy flag until it clears, then require ready and not-fail
    // from the status register.
    async fn wait_busy_and_verify(&mut self) -> ResultProtocol<()> {
        let mut retry = 0;
        loop {
            let busy = self.read_busy_flag()?;
            if busy & BUSY_FLAG_BIT == 0 {
                break;
            }
            retry += 1;
            if retry > WAIT_BUSY_MAX_RETRY {
                error!("device busy flag never cleared");
                return Err(ProtocolError::BusyTimeout);
            }
            sleep(WAIT_BUSY_INTERVAL).await;
        }

        let status = self.read_status_reg()?;
        let ready = (status >> STATUS_BUSY_OR_READY_BIT) & 1 == 0;
        let ok = (status >> STATUS_FAIL_OR_OK_BIT) & 1 == 0;
        if ready && ok {
            Ok(())
        } else {
            error!("status register reports failure: {status:#04X}");
            Err(ProtocolError::StatusFailed { status })
        }
    }

    async fn enable_program_mode(&mut self) -> ResultProtocol<()> {
        // Transparent configuration mode
        self.send(&[CMD_ENABLE_CONFIG_MODE, 0x08, 0x00, 0x00])?;
        self.wait_busy_and_verify().await?;
        sleep(WAIT_BUSY_INTERVAL).await;
        Ok(())
    }

    // XO3D payload bytes select the flash sector: bit 8 CFG0, bit 9 CFG1.
    fn target_payload(&self) -> [u8; 2] {
        match self.target {
            CfgBank::Cfg0 => [0x00, 0x01],
            CfgBank::Cfg1 => [0x00, 0x02],
        }
    }

    async fn erase_flash(&mut self) -> ResultProtocol<()> {
        let command = if self.is_xo3d() {
            let [low, high] = self.target_payload();
            [CMD_ERASE_FLASH, low, high, 0x00]
        } else {
            [CMD_ERASE_FLASH, 0x0C, 0x00, 0x00]
        };
        self.send(&command)?;
        self.wait_busy_and_verify().await?;
        sleep(WAIT_BUSY_INTERVAL).await;
        Ok(())
    }

    fn reset_config_flash(&mut self) -> ResultProtocol<()> {
        let command = if self.is_xo3d() {
            let [low, high] = self.target_payload();
            [CMD_RESET_CONFIG_FLASH, low, high, 0x00]
        } else {
            [CMD_RESET_CONFIG_FLASH, 0x00, 0x00, 0x00]
        };
        self.send(&command)
    }

    fn set_page_address(&mut self, page: u16) -> ResultProtocol<()> {
        let mut command = [CMD_SET_PAGE_ADDRESS, 0, 0, 0, 0, 0, 0, 0];
        command[6] = (page >> 8) as u8;
        command[7] = page as u8;
        self.send(&command)
    }

    async fn program_single_page(&mut self, page: u16, data: &[u8]) -> ResultProtocol<()> {
        self.set_page_address(page)?;

        let mut command = vec![CMD_PROGRAM_PAGE, 0x00, 0x00, 0x01];
        command.extend_from_slice(data);
        self.send(&command)?;

        sleep(PAGE_PROGRAM_DELAY).await;
        self.wait_busy_and_verify().await
    }

    fn verify_single_page(&mut self, page: u16, data: &[u8]) -> ResultProtocol<()> {
        self.set_page_address(page)?;

        let read_back = self.query(&[CMD_READ_PAGE, 0x00, 0x00, 0x01], data.len())?;
        for (index, (expected, actual)) in data.iter().zip(&read_back).enumerate() {
            if expected != actual {
                let offset = usize::from(page) * PAGE_SIZE + index;
                error!("page verify failed at byte {offset}");
                return Err(ProtocolError::VerifyMismatch { offset });
            }
        }
        Ok(())
    }

    async fn write_program_pages(&mut self) -> ResultProtocol<()> {
        let cfg_data = self
            .jed
            .as_ref()
            .ok_or(ProtocolError::BadResponse("no parsed image"))?
            .cfg_data
            .clone();

        for (page, chunk) in cfg_data.chunks(PAGE_SIZE).enumerate() {
            let page = page as u16;
            let mut attempt = 0;
            loop {
                let result = async {
                    self.program_single_page(page, chunk).await?;
                    self.verify_single_page(page, chunk)
                }
                .await;

                match result {
                    Ok(()) => break,
                    Err(err) => {
                        attempt += 1;
                        if attempt >= MAX_PAGE_WRITE_RETRY {
                            error!("program and verify of page {page} kept failing");
                            return Err(err);
                        }
                        debug!("page {page} retry {attempt}: {err}");
                    }
                }
            }
        }

        self.wait_busy_and_verify().await
    }

    async fn program_user_code(&mut self) -> ResultProtocol<()> {
        let user_code = self
            .jed
            .as_ref()
            .ok_or(ProtocolError::BadResponse("no parsed image"))?
            .user_code;

        let mut command = vec![CMD_PROGRAM_USER_CODE, 0x00, 0x00, 0x00];
        command.extend_from_slice(&user_code.to_be_bytes());
        self.send(&command)?;
        self.wait_busy_and_verify().await
    }

    async fn program_done(&mut self) -> ResultProtocol<()> {
        self.send(&[CMD_PROGRAM_DONE, 0x00, 0x00, 0x00])?;
        self.wait_busy_and_verify().await
    }

    fn disable_config_interface(&mut self) -> ResultProtocol<()> {
        self.send(&[CMD_DISABLE_CONFIG_INTERFACE, 0x00, 0x00])
    }

    fn read_user_code_plain(&mut self) -> ResultProtocol<u32> {
        let response = self.query(&[CMD_READ_USER_CODE, 0, 0, 0], 4)?;
        let bytes: [u8; 4] = response
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::BadResponse("user code length"))?;
        Ok(u32::from_be_bytes(bytes))
    }
}

impl<T: ByteTransport + Send> ProgramSequence for Xo3Engine<T> {
    async fn prepare_update(
        &mut self,
        image: &[u8],
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> ResultProtocol<()> {
        self.read_device_id()?;
        progress(10);

        let jed = JedFile::parse(image, Some(self.chip.model))?;
        progress(15);

        jed.verify_checksum()?;
        progress(20);

        self.jed = Some(jed);
        Ok(())
    }

    async fn do_erase(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        progress(25);

        // A stale busy flag here is not fatal; the enable below re-checks.
        if let Err(err) = self.wait_busy_and_verify().await {
            debug!("pre-enable busy check: {err}");
        }

        self.enable_program_mode().await?;
        progress(30);

        self.erase_flash().await?;
        progress(40);
        Ok(())
    }

    async fn do_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        self.reset_config_flash()?;
        progress(50);

        self.write_program_pages().await?;
        progress(60);

        self.program_user_code().await?;
        progress(70);

        self.program_done().await?;
        progress(80);
        Ok(())
    }

    async fn finish_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        self.disable_config_interface()?;
        progress(90);
        Ok(())
    }

    async fn read_user_code(&mut self) -> ResultProtocol<u32> {
        if !self.is_xo3d() {
            return self.read_user_code_plain();
        }

        // Dual-bank parts read the user code of the selected bank inside a
        // configuration bracket.
        if let Err(err) = self.wait_busy_and_verify().await {
            debug!("pre-read busy check: {err}");
        }
        self.enable_program_mode().await?;
        self.reset_config_flash()?;
        let user_code = self.read_user_code_plain()?;
        self.program_done().await?;
        self.disable_config_interface()?;
        Ok(user_code)
    }
}
