// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! MachXO5 programming engine
//!
//! XO5 configuration flash is organized as blocks of 256 pages of 256
//! bytes; a CFG bank spans 11 blocks starting at a bank-specific block
//! index. Readiness is inferred from a dummy byte read returning zero.
//! Verification reads every programmed page back and compares.

use log::{debug, error, info};
use tokio::time::sleep;

use std::time::Duration;

use super::{CfgBank, ChipInfo, ProgramSequence, ProtocolError, ResultProtocol, jed::JedFile};
use crate::transport::ByteTransport;

const CMD_SECTOR_ERASE: u8 = 0xD8;
const CMD_PAGE_PROGRAM: u8 = 0x02;
const CMD_PAGE_READ: u8 = 0x0B;
const CMD_READ_USER_CODE: u8 = 0xC0;

const STATUS_READY: u8 = 0x00;

const PAGE_SIZE: usize = 256;
const PAGES_PER_BLOCK: usize = 256;
const BLOCKS_PER_CFG: usize = 11;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READY_TIMEOUT: Duration = Duration::from_millis(1000);

// The page read command needs a moment before the data fetch.
const PAGE_READ_DELAY: Duration = Duration::from_millis(1);

fn start_block(target: CfgBank) -> u8 {
    match target {
        CfgBank::Cfg0 => 0x01,
        CfgBank::Cfg1 => 0x10,
    }
}

/// Programming engine for the MachXO5 family
#[derive(Debug)]
pub struct Xo5Engine<T: ByteTransport> {
    transport: T,
    chip: &'static ChipInfo,
    target: CfgBank,
    jed: Option<JedFile>,
}

impl<T: ByteTransport + Send> Xo5Engine<T> {
    pub(crate) fn new(transport: T, chip: &'static ChipInfo, target: CfgBank) -> Self {
        Xo5Engine {
            transport,
            chip,
            target,
            jed: None,
        }
    }

    pub(crate) fn chip_model(&self) -> &'static str {
        self.chip.model
    }

    fn cfg_data(&self) -> ResultProtocol<&JedFile> {
        self.jed.as_ref().ok_or(ProtocolError::BadResponse("no parsed image"))
    }

    // A zero dummy byte means the device finished the previous operation.
    async fn wait_until_ready(&mut self, timeout: Duration) -> ResultProtocol<()> {
        let attempts = (timeout.as_millis() / READY_POLL_INTERVAL.as_millis()).max(1);
        for _ in 0..attempts {
            let response = self.transport.send_receive(&[], 1)?;
            if response.first() == Some(&STATUS_READY) {
                return Ok(());
            }
            sleep(READY_POLL_INTERVAL).await;
        }
        error!("timeout waiting for device ready");
        Err(ProtocolError::BusyTimeout)
    }

    async fn erase_cfg(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        let first = start_block(self.target);
        for index in 0..BLOCKS_PER_CFG {
            let block = first + index as u8;
            self.transport
                .send_receive(&[CMD_SECTOR_ERASE, block, 0x00, 0x00], 0)?;
            self.wait_until_ready(READY_TIMEOUT).await?;
            progress(20 + ((index + 1) * 20 / BLOCKS_PER_CFG) as u8);
        }
        Ok(())
    }

    fn program_page(&mut self, block: u8, page: u8, data: &[u8]) -> ResultProtocol<()> {
        let mut command = vec![CMD_PAGE_PROGRAM, block, page, 0x00];
        command.extend_from_slice(data);
        self.transport.send_receive(&command, 0)?;
        Ok(())
    }

    async fn program_cfg(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        let cfg = self.cfg_data()?.cfg_data.clone();
        let total = cfg.len();
        let first = start_block(self.target);
        let mut written = 0usize;

        'blocks: for block_index in 0..BLOCKS_PER_CFG {
            let block = first + block_index as u8;
            for page in 0..PAGES_PER_BLOCK {
                if written >= total {
                    break 'blocks;
                }

                let chunk_len = PAGE_SIZE.min(total - written);
                let chunk = &cfg[written..written + chunk_len];
                self.program_page(block, page as u8, chunk)?;
                sleep(READY_POLL_INTERVAL).await;
                self.wait_until_ready(READY_TIMEOUT).await?;

                written += chunk_len;
            }
            progress(40 + (written * 30 / total) as u8);
        }

        progress(70);
        debug!("programmed {written} configuration bytes");
        Ok(())
    }

    async fn read_page(&mut self, block: u8, page: u8, len: usize) -> ResultProtocol<Vec<u8>> {
        self.transport
            .send_receive(&[CMD_PAGE_READ, block, page, 0x00], 0)?;
        sleep(PAGE_READ_DELAY).await;
        self.wait_until_ready(READY_TIMEOUT).await?;

        // The data fetch returns a leading status byte before the page.
        let response = self.transport.send_receive(&[], 1 + len)?;
        if response.first() != Some(&STATUS_READY) {
            return Err(ProtocolError::BadResponse("page read status"));
        }
        Ok(response[1..].to_vec())
    }

    async fn verify_cfg(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        let cfg = self.cfg_data()?.cfg_data.clone();
        let total = cfg.len();
        let first = start_block(self.target);
        let mut verified = 0usize;

        'blocks: for block_index in 0..BLOCKS_PER_CFG {
            let block = first + block_index as u8;
            for page in 0..PAGES_PER_BLOCK {
                if verified >= total {
                    break 'blocks;
                }

                let chunk_len = PAGE_SIZE.min(total - verified);
                let expected = &cfg[verified..verified + chunk_len];
                let actual = self.read_page(block, page as u8, chunk_len).await?;

                if let Some(index) = expected.iter().zip(&actual).position(|(a, b)| a != b) {
                    error!("verify failed: block {block} page {page}");
                    return Err(ProtocolError::VerifyMismatch {
                        offset: verified + index,
                    });
                }

                verified += chunk_len;
            }
            progress(70 + (verified * 20 / total) as u8);
        }

        progress(90);
        Ok(())
    }
}

impl<T: ByteTransport + Send> ProgramSequence for Xo5Engine<T> {
    async fn prepare_update(
        &mut self,
        image: &[u8],
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> ResultProtocol<()> {
        let jed = JedFile::parse(image, Some(self.chip.model))?;
        progress(10);
        self.jed = Some(jed);

        self.wait_until_ready(READY_TIMEOUT).await?;
        progress(20);
        Ok(())
    }

    async fn do_erase(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        debug!("erasing {}...", self.target);
        self.erase_cfg(progress).await
    }

    async fn do_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        debug!("programming {}...", self.target);
        self.program_cfg(progress).await
    }

    async fn finish_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()> {
        debug!("verifying {}...", self.target);
        self.verify_cfg(progress).await?;

        let user_code = self.read_user_code().await?;
        info!("{} user code after programming: {user_code:08X}", self.target);
        Ok(())
    }

    async fn read_user_code(&mut self) -> ResultProtocol<u32> {
        let response = self.transport.send_receive(&[CMD_READ_USER_CODE, 0, 0, 0], 5)?;
        if response.len() != 5 {
            return Err(ProtocolError::BadResponse("user code length"));
        }
        Ok(u32::from_le_bytes([
            response[1],
            response[2],
            response[3],
            response[4],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::cpld::{CfgBank, ProgramSequence, ProtocolError, chip_info};
    use crate::transport::{ByteTransport, ResultTransport};

    use super::Xo5Engine;

    // Block/page flash simulation. A dummy single-byte read answers the
    // ready poll; longer empty-write reads fetch the last addressed page.
    struct Xo5Sim {
        pages: HashMap<(u8, u8), Vec<u8>>,
        pending_read: Option<(u8, u8)>,
        erased_blocks: Vec<u8>,
        user_code: u32,
    }

    impl Xo5Sim {
        fn new() -> Self {
            Xo5Sim {
                pages: HashMap::new(),
                pending_read: None,
                erased_blocks: Vec::new(),
                user_code: 0,
            }
        }
    }

    impl ByteTransport for Xo5Sim {
        fn send_receive(&mut self, write: &[u8], read_len: usize) -> ResultTransport<Vec<u8>> {
            if write.is_empty() {
                if read_len == 1 {
                    return Ok(vec![0x00]);
                }
                let (block, page) = self.pending_read.take().unwrap();
                let mut response = vec![0x00];
                response.extend_from_slice(
                    self.pages
                        .get(&(block, page))
                        .cloned()
                        .unwrap_or_else(|| vec![0xFF; read_len - 1])
                        .as_slice(),
                );
                response.truncate(read_len);
                return Ok(response);
            }

            match write[0] {
                0xD8 => {
                    self.erased_blocks.push(write[1]);
                    Ok(Vec::new())
                }
                0x02 => {
                    self.pages.insert((write[1], write[2]), write[4..].to_vec());
                    Ok(Vec::new())
                }
                0x0B => {
                    self.pending_read = Some((write[1], write[2]));
                    Ok(Vec::new())
                }
                0xC0 => {
                    let bytes = self.user_code.to_le_bytes();
                    Ok(vec![0x00, bytes[0], bytes[1], bytes[2], bytes[3]])
                }
                _ => Ok(vec![0; read_len]),
            }
        }

        fn identifier(&self) -> &str {
            "xo5-sim"
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
        text.push_str("UH00000001*\n");
        text.push_str(&format!("C{:04X}*\n", checksum & 0xFFFF));
        text
    }

    fn engine(sim: Xo5Sim) -> Xo5Engine<Xo5Sim> {
        Xo5Engine::new(sim, chip_info("LFMXO5-25").unwrap(), CfgBank::Cfg0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_program_and_verify_roundtrip() {
        // Two and a half pages of configuration data.
        let cfg: Vec<u8> = (0..640).map(|value| (value % 251) as u8).collect();
        let jed = make_jed(&cfg);

        let mut engine = engine(Xo5Sim::new());
        let mut checkpoints = Vec::new();
        engine
            .program_firmware(jed.as_bytes(), &mut |value| checkpoints.push(value))
            .await
            .unwrap();

        let sim = &engine.transport;
        // CFG0 occupies 11 blocks starting at 0x01; all were erased.
        assert_eq!(sim.erased_blocks.len(), 11);
        assert_eq!(sim.erased_blocks[0], 0x01);
        assert_eq!(sim.erased_blocks[10], 0x0B);

        // The pages hold the image, split at 256 bytes.
        assert_eq!(sim.pages[&(0x01, 0)].len(), 256);
        assert_eq!(sim.pages[&(0x01, 2)].len(), 640 - 512);
        assert_eq!(sim.pages[&(0x01, 0)][..4], cfg[..4]);

        assert!(checkpoints.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(*checkpoints.last().unwrap() >= 90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cfg1_targets_other_bank() {
        let cfg: Vec<u8> = vec![0x5A; 16];
        let jed = make_jed(&cfg);

        let mut engine = Xo5Engine::new(Xo5Sim::new(), chip_info("LFMXO5-25").unwrap(), CfgBank::Cfg1);
        engine
            .program_firmware(jed.as_bytes(), &mut |_| {})
            .await
            .unwrap();

        assert_eq!(engine.transport.erased_blocks[0], 0x10);
        assert!(engine.transport.pages.contains_key(&(0x10, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_detects_corruption() {
        struct Corrupting(Xo5Sim);
        impl ByteTransport for Corrupting {
            fn send_receive(&mut self, write: &[u8], read_len: usize) -> ResultTransport<Vec<u8>> {
                if !write.is_empty() && write[0] == 0x02 {
                    let mut corrupted = write.to_vec();
                    corrupted[4] ^= 0x01;
                    return self.0.send_receive(&corrupted, read_len);
                }
                self.0.send_receive(write, read_len)
            }
            fn identifier(&self) -> &str {
                "corrupting"
            }
        }

        let cfg: Vec<u8> = vec![0xA5; 16];
        let jed = make_jed(&cfg);

        let mut engine = Xo5Engine::new(
            Corrupting(Xo5Sim::new()),
            chip_info("LFMXO5-25").unwrap(),
            CfgBank::Cfg0,
        );
        let err = engine
            .program_firmware(jed.as_bytes(), &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::VerifyMismatch { offset: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_user_code_little_endian() {
        let mut sim = Xo5Sim::new();
        sim.user_code = 0x0102_0304;
        let mut engine = engine(sim);
        assert_eq!(engine.read_user_code().await.unwrap(), 0x0102_0304);
    }
}
