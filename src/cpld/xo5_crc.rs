// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! MachXO5 programming engine, command-CRC protocol variant
//!
//! Some XO5 update blocks advertise a hardened command channel: every
//! command carries a trailing CRC-16/CCITT and the device reports whether
//! it accepted the frame, and post-program verification compares a
//! device-computed SHA-384 digest against one computed locally instead of
//! reading every page back.

use crc::{CRC_16_IBM_3740, Crc};
use log::{debug, error, info, warn};
use sha2::{Digest, Sha384};
use tokio::time::sleep;

use std::time::Duration;

use super::{CfgBank, ChipInfo, ProgramSequence, ProtocolError, ResultProtocol, jed::JedFile};
use crate::transport::ByteTransport;

const CMD_READ_DEVICE_ID: u8 = 0xE0;
const CMD_READ_SOFT_IP_ID: u8 = 0xE6;
const CMD_READ_USER_CODE: u8 = 0xC0;
const CMD_CHECK_BUSY_STATUS: u8 = 0xF0;
const CMD_READ_STATUS_REG: u8 = 0x3C;
const CMD_ENABLE: u8 = 0x74;
const CMD_DISABLE: u8 = 0x26;
const CMD_INIT_ADDRESS: u8 = 0x46;
const CMD_ERASE: u8 = 0x0E;
const CMD_PROGRAM_INCR: u8 = 0x82;
const CMD_READ_INCR: u8 = 0x6A;
const CMD_PROGRAM_DONE: u8 = 0x5E;
const CMD_REFRESH: u8 = 0x79;
const CMD_CALC_HASH: u8 = 0x7C;
const CMD_READ_HASH: u8 = 0xE5;
const CMD_CONTROL_CMD_CRC: u8 = 0xFD;

const STATUS_READY: u8 = 0x00;

const INCR_DATA_SIZE: usize = 128;
const CRC_RETRY_MAX: u32 = 3;
const DIGEST_LEN: usize = 48;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READY_TIMEOUT: Duration = Duration::from_millis(1000);
const ERASE_TIMEOUT: Duration = Duration::from_millis(20000);

// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, appended
// to commands as two little-endian bytes.
const COMMAND_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

fn cfg_index(target: CfgBank) -> u8 {
    match target {
        CfgBank::Cfg0 => 1,
        CfgBank::Cfg1 => 2,
    }
}

// Framing policy per opcode: the incremental data commands are always
// framed, the control and status commands never are, everything else
// follows the negotiated setting.
fn framing(opcode: u8, enabled: bool) -> bool {
    match opcode {
        CMD_PROGRAM_INCR | CMD_READ_INCR => true,
        CMD_CONTROL_CMD_CRC | CMD_CHECK_BUSY_STATUS | CMD_READ_STATUS_REG | CMD_REFRESH => false,
        _ => enabled,
    }
}

/// Programming engine for MachXO5 parts with the CRC command channel
#[derive(Debug)]
pub struct Xo5CrcEngine<T: ByteTransport> {
    transport: T,
    chip: &'static ChipInfo,
    target: CfgBank,
    crc_enabled: bool,
    jed: Option<JedFile>,
}

impl<T: ByteTransport + Send> Xo5CrcEngine<T> {
    pub(crate) fn new(transport: T, chip: &'static ChipInfo, target: CfgBank) -> Self {
        Xo5CrcEngine {
            transport,
            chip,
            target,
            crc_enabled: false,
            jed: None,
        }
    }

    pub(crate) fn chip_model(&self) -> &'static str {
        self.chip.model
    }

    fn read_crc_status(&mut self) -> ResultProtocol<bool> {
        let response = self
            .transport
            .send_receive(&[CMD_CHECK_BUSY_STATUS, 0, 0, 0], 1)?;
        let status = response
            .first()
            .ok_or(ProtocolError::BadResponse("busy status length"))?;
        // CRC verdict is bit 1: 0 = accepted, 1 = bad CRC.
        Ok(status & 0x02 == 0)
    }

    /// Exchange one command, framing it with a CRC when the policy says so
    fn exchange(&mut self, command: &[u8], read_len: usize) -> ResultProtocol<Vec<u8>> {
        let opcode = command[0];

        if !framing(opcode, self.crc_enabled) {
            return Ok(self.transport.send_receive(command, read_len)?);
        }

        let mut framed = command.to_vec();
        let crc = COMMAND_CRC.checksum(&framed);
        framed.extend_from_slice(&crc.to_le_bytes());

        // The program-incr response carries the CRC verdict inline in its
        // first byte; every other framed response is read with two extra
        // CRC bytes that get stripped.
        let inline_verdict = opcode == CMD_PROGRAM_INCR;
        let framed_read_len = if read_len > 0 && !inline_verdict {
            read_len + 2
        } else {
            read_len
        };

        for attempt in 1..=CRC_RETRY_MAX {
            let response = self.transport.send_receive(&framed, framed_read_len)?;

            let accepted = if inline_verdict {
                response.first().is_some_and(|status| status & 0x01 == 0x01)
            } else {
                self.read_crc_status()?
            };

            if accepted {
                let mut response = response;
                if read_len > 0 && !inline_verdict {
                    response.truncate(read_len);
                }
                return Ok(response);
            }

            warn!("command {opcode:#04X} CRC check failed, attempt {attempt}");
        }

        error!("command {opcode:#04X} kept failing the CRC check");
        Err(ProtocolError::CrcRejected {
            retries: CRC_RETRY_MAX,
        })
    }

    fn toggle_crc16(&mut self, enable: bool) -> ResultProtocol<()> {
        self.exchange(&[CMD_CONTROL_CMD_CRC, u8::from(enable), 0, 0], 0)?;
        self.crc_enabled = enable;
        debug!("command CRC16 {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    async fn wait_until_ready(&mut self, timeout: Duration) -> ResultProtocol<()> {
        let attempts = (timeout.as_millis() / READY_POLL_INTERVAL.as_millis()).max(1);
        for _ in 0..attempts {
            let response = self.exchange(&[CMD_CHECK_BUSY_STATUS, 0, 0, 0], 1)?;
            if response.first() == Some(&STATUS_READY) {
                return Ok(());
            }
            sleep(READY_POLL_INTERVAL).await;
        }
        error!("timeout waiting for device ready");
        Err(ProtocolError::BusyTimeout)
    }

    // The soft IP reports an id one above the device id; anything else
    // means the update block is absent or unresponsive.
    fn read_soft_ip_id(&mut self) -> ResultProtocol<()> {
        let device = self.exchange(&[CMD_READ_DEVICE_ID, 0, 0, 0], 4)?;
        let soft_ip = self.exchange(&[CMD_READ_SOFT_IP_ID, 0, 0, 0], 5)?;
        if device.len() != 4 || soft_ip.len() != 5 {
            return Err(ProtocolError::BadResponse("soft IP id length"));
        }

        let device_id = u32::from_be_bytes([device[0], device[1], device[2], device[3]]);
        let soft_ip_id = u32::from_be_bytes([soft_ip[0], soft_ip[1], soft_ip[2], soft_ip[3]]);

        if soft_ip_id != device_id.wrapping_add(1) {
            error!("soft IP id {soft_ip_id:#010X} does not match device id {device_id:#010X}");
            return Err(ProtocolError::BadResponse("soft IP id mismatch"));
        }

        debug!("soft IP version {:#04X}", soft_ip[4]);
        Ok(())
    }

    fn padded_cfg(&self) -> ResultProtocol<Vec<u8>> {
        let jed = self.jed.as_ref().ok_or(ProtocolError::BadResponse("no parsed image"))?;
        let mut cfg = jed.cfg_data.clone();
        let remainder = cfg.len() % INCR_DATA_SIZE;
        if remainder != 0 {
            cfg.resize(cfg.len() + INCR_DATA_SIZE - remainder, 0xFF);
        }
        Ok(cfg)
    }

    async fn erase_cfg(&mut self) -> ResultProtocol<()> {
        let index = cfg_index(self.target);

        self.exchange(&[CMD_ENABLE, 0, 0, 0], 0)?;
        self.exchange(&[CMD_INIT_ADDRESS, 0, index, 0], 0)?;
        self.exchange(&[CMD_ERASE, 0, index, 0], 0)?;

        self.wait_until_ready(ERASE_TIMEOUT).await?;

        self.exchange(&[CMD_DISABLE, 0, 0, 0], 0)?;
        Ok(())
    }

    async fn program_cfg(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        let index = cfg_index(self.target);
        let cfg = self.padded_cfg()?;
        let total = cfg.len();

        self.exchange(&[CMD_ENABLE, 0, 0, 0], 0)?;
        self.exchange(&[CMD_INIT_ADDRESS, 0, index, 0], 0)?;
        self.exchange(&[CMD_CALC_HASH, 0, 0, 0], 0)?;
        debug!("pre-programming bracket completed");

        for (chunk_index, chunk) in cfg.chunks(INCR_DATA_SIZE).enumerate() {
            let mut command = vec![CMD_PROGRAM_INCR, 0, 0, 0];
            command.extend_from_slice(chunk);
            self.exchange(&command, 1)?;
            self.wait_until_ready(READY_TIMEOUT).await?;

            let written = (chunk_index + 1) * INCR_DATA_SIZE;
            progress(40 + (written.min(total) * 30 / total) as u8);
        }
        debug!("programming data completed");

        self.exchange(&[CMD_ENABLE, 0, 0, 0], 0)?;
        self.exchange(&[CMD_INIT_ADDRESS, 0, index, 0], 0)?;
        self.exchange(&[CMD_PROGRAM_DONE, 0, 0, 0], 0)?;
        self.exchange(&[CMD_DISABLE, 0, 0, 0], 0)?;
        debug!("post-programming bracket completed");

        Ok(())
    }

    fn verify_digest(&mut self) -> ResultProtocol<()> {
        self.exchange(&[CMD_CALC_HASH, 0, 0, 0], 0)?;
        let device_digest = self.exchange(&[CMD_READ_HASH, 0, 0, 0], DIGEST_LEN)?;

        let local_digest = Sha384::digest(self.padded_cfg()?);

        if device_digest.as_slice() != local_digest.as_slice() {
            error!("device digest does not match programmed image");
            return Err(ProtocolError::DigestMismatch);
        }

        debug!("hash digest verified after programming");
        Ok(())
    }
}

impl<T: ByteTransport + Send> ProgramSequence for Xo5CrcEngine<T> {
    async fn prepare_update(
        &mut self,
        image: &[u8],
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> ResultProtocol<()> {
        let jed = JedFile::parse(image, Some(self.chip.model))?;
        jed.verify_checksum()?;
        self.jed = Some(jed);
        progress(10);

        self.toggle_crc16(true)?;
        self.read_soft_ip_id()?;
        progress(15);

        self.wait_until_ready(READY_TIMEOUT).await?;
        progress(20);
        Ok(())
    }

    async fn do_erase(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        debug!("erasing {}...", self.target);
        self.erase_cfg().await?;
        progress(40);
        Ok(())
    }

    async fn do_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        debug!("programming {}...", self.target);
        self.program_cfg(progress).await?;
        progress(70);
        Ok(())
    }

    async fn finish_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        self.verify_digest()?;
        progress(90);

        let user_code = self.read_user_code().await?;
        info!("{} user code after programming: {user_code:08X}", self.target);
        Ok(())
    }

    async fn read_user_code(&mut self) -> ResultProtocol<u32> {
        let index = cfg_index(self.target);

        self.exchange(&[CMD_ENABLE, 0, 0, 0], 0)?;
        self.exchange(&[CMD_INIT_ADDRESS, 0, index, 0], 0)?;

        // The first read initiates the fetch, the second returns the data.
        self.exchange(&[CMD_READ_USER_CODE, 0, 0, 0], 4)?;
        self.wait_until_ready(READY_TIMEOUT).await?;
        let response = self.exchange(&[CMD_READ_USER_CODE, 0, 0, 0], 4)?;

        self.exchange(&[CMD_DISABLE, 0, 0, 0], 0)?;

        if response.len() != 4 {
            return Err(ProtocolError::BadResponse("user code length"));
        }
        Ok(u32::from_le_bytes([
            response[0],
            response[1],
            response[2],
            response[3],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha384};

    use crate::cpld::{CfgBank, ProgramSequence, ProtocolError, chip_info};
    use crate::transport::{ByteTransport, ResultTransport};

    use super::{COMMAND_CRC, Xo5CrcEngine};

    // Simulated XO5 update block that checks the command CRC itself and
    // hashes programmed data like the device would.
    struct CrcSim {
        crc_expected: bool,
        programmed: Vec<u8>,
        user_code: u32,
        reject_next_crc: u32,
        bad_crc_seen: bool,
    }

    impl CrcSim {
        fn new() -> Self {
            CrcSim {
                crc_expected: false,
                programmed: Vec::new(),
                user_code: 0,
                reject_next_crc: 0,
                bad_crc_seen: false,
            }
        }

        fn check_frame<'a>(&mut self, write: &'a [u8]) -> &'a [u8] {
            let (payload, crc_bytes) = write.split_at(write.len() - 2);
            let crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
            if self.reject_next_crc > 0 {
                self.reject_next_crc -= 1;
                self.bad_crc_seen = true;
            } else {
                self.bad_crc_seen = COMMAND_CRC.checksum(payload) != crc;
            }
            payload
        }
    }

    impl ByteTransport for CrcSim {
        fn send_receive(&mut self, write: &[u8], read_len: usize) -> ResultTransport<Vec<u8>> {
            let opcode = write.first().copied().unwrap_or(0);

            // Unframed control plane.
            match opcode {
                0xFD => {
                    self.crc_expected = write[1] == 0x01;
                    return Ok(Vec::new());
                }
                0xF0 => {
                    // Busy status: bit 1 carries the CRC verdict.
                    let status = if self.bad_crc_seen { 0x02 } else { 0x00 };
                    return Ok(vec![status]);
                }
                _ => {}
            }

            let payload = if self.crc_expected || opcode == 0x82 {
                self.check_frame(write).to_vec()
            } else {
                write.to_vec()
            };

            let respond = |mut body: Vec<u8>| {
                // Framed responses carry two trailing CRC bytes.
                if read_len > body.len() {
                    body.resize(read_len, 0);
                }
                body
            };

            match payload[0] {
                0x82 => {
                    if self.bad_crc_seen {
                        self.bad_crc_seen = false;
                        return Ok(vec![0x00]);
                    }
                    self.programmed.extend_from_slice(&payload[4..]);
                    Ok(vec![0x01])
                }
                0xE0 => Ok(respond(vec![0x01, 0x2F, 0x30, 0x43])),
                0xE6 => Ok(respond(vec![0x01, 0x2F, 0x30, 0x44, 0x07])),
                0xE5 => {
                    let digest = Sha384::digest(&self.programmed);
                    Ok(respond(digest.to_vec()))
                }
                0xC0 => Ok(respond(self.user_code.to_le_bytes().to_vec())),
                _ => Ok(respond(Vec::new())),
            }
        }

        fn identifier(&self) -> &str {
            "xo5-crc-sim"
        }
    }

    fn make_jed(cfg: &[u8]) -> String {
        let mut text = String::from("NOTE DEVICE NAME: LFMXO5-25*\n");
        text.push_str(&format!("QF{}*\n", cfg.len() * 8));
        text.push_str("L0000\n");
        for chunk in cfg.chunks(4) {
            for byte in chunk {
                text.push_str(&format!("{byte:08b}"));
            }
            text.push('\n');
        }
        let checksum: u32 = cfg.iter().map(|&b| u32::from(b.reverse_bits())).sum();
        text.push('\n');
        text.push('\n');
        text.push_str("NOTE User Electronic Signature Data*\n");
        text.push_str("UH00000002*\n");
        text.push_str(&format!("C{:04X}*\n", checksum & 0xFFFF));
        text
    }

    fn engine(sim: CrcSim) -> Xo5CrcEngine<CrcSim> {
        Xo5CrcEngine::new(sim, chip_info("LFMXO5-25").unwrap(), CfgBank::Cfg0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_program_with_crc_and_digest() {
        let cfg: Vec<u8> = (0u8..200).collect();
        let jed = make_jed(&cfg);

        let mut engine = engine(CrcSim::new());
        let mut checkpoints = Vec::new();
        engine
            .program_firmware(jed.as_bytes(), &mut |value| checkpoints.push(value))
            .await
            .unwrap();

        // 200 bytes pad to 256 with 0xFF and arrive in two 128-byte chunks.
        let programmed = &engine.transport.programmed;
        assert_eq!(programmed.len(), 256);
        assert_eq!(programmed[..200], cfg[..]);
        assert!(programmed[200..].iter().all(|&byte| byte == 0xFF));

        assert!(checkpoints.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(*checkpoints.last().unwrap() >= 90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crc_rejection_retries() {
        let cfg: Vec<u8> = vec![0x11; 128];
        let jed = make_jed(&cfg);

        let mut sim = CrcSim::new();
        sim.reject_next_crc = 1;

        let mut engine = engine(sim);
        engine
            .program_firmware(jed.as_bytes(), &mut |_| {})
            .await
            .unwrap();
        assert_eq!(engine.transport.programmed.len(), 128);
    }

    #[tokio::test(start_paused = true)]
    async fn test_digest_mismatch_fails_update() {
        struct TamperedSim(CrcSim);
        impl ByteTransport for TamperedSim {
            fn send_receive(&mut self, write: &[u8], read_len: usize) -> ResultTransport<Vec<u8>> {
                let response = self.0.send_receive(write, read_len)?;
                if write.first() == Some(&0xE5)
                    || (self.0.crc_expected && write.len() > 2 && write[0] == 0xE5)
                {
                    let mut tampered = response;
                    tampered[0] ^= 0xFF;
                    return Ok(tampered);
                }
                Ok(response)
            }
            fn identifier(&self) -> &str {
                "tampered"
            }
        }

        let cfg: Vec<u8> = vec![0x22; 128];
        let jed = make_jed(&cfg);

        let mut engine = Xo5CrcEngine::new(
            TamperedSim(CrcSim::new()),
            chip_info("LFMXO5-25").unwrap(),
            CfgBank::Cfg0,
        );
        let err = engine
            .program_firmware(jed.as_bytes(), &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DigestMismatch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_user_code() {
        let mut sim = CrcSim::new();
        sim.user_code = 0xA1B2_C3D4;
        let mut engine = engine(sim);
        assert_eq!(engine.read_user_code().await.unwrap(), 0xA1B2_C3D4);
    }
}
