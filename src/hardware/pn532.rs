//! NXP PN532 NFC controller over its high-speed UART (HSU) interface.
//!
//! Normal information frame:
//! `00 00 FF LEN LCS TFI PD0..PDn DCS 00`, with `LEN + LCS == 0` and
//! `TFI + PD0 + .. + PDn + DCS == 0` (mod 256). TFI is D4 host→PN532 and
//! D5 PN532→host. The controller answers every command with an ACK frame
//! `00 00 FF 00 FF 00` before its response.

use std::{
    io::{self, Read, Write},
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use serialport::SerialPort;

use super::TagReader;

const HOST_TO_PN532: u8 = 0xD4;
const PN532_TO_HOST: u8 = 0xD5;

const CMD_GET_FIRMWARE_VERSION: u8 = 0x02;
const CMD_SAM_CONFIGURATION: u8 = 0x14;
const CMD_RF_CONFIGURATION: u8 = 0x32;
const CMD_IN_LIST_PASSIVE_TARGET: u8 = 0x4A;

const BAUD_ISO14443A: u8 = 0x00;
const ACK_TIMEOUT: Duration = Duration::from_millis(100);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    /// TFI plus packet data, checksums already verified.
    Information(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Parse {
    /// More bytes are needed.
    Incomplete,
    /// Bytes before this offset can never start a valid frame.
    Skip(usize),
    Complete(Frame, usize),
}

pub fn encode_command(command: u8, params: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(params.len() + 2);
    data.push(HOST_TO_PN532);
    data.push(command);
    data.extend_from_slice(params);

    let len = data.len() as u8;
    let data_checksum = data.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte));

    let mut frame = Vec::with_capacity(data.len() + 7);
    frame.extend_from_slice(&[0x00, 0x00, 0xFF, len, len.wrapping_neg()]);
    frame.extend_from_slice(&data);
    frame.push(data_checksum.wrapping_neg());
    frame.push(0x00);
    frame
}

pub fn parse_frame(buffer: &[u8]) -> Parse {
    let Some(start) = buffer.windows(2).position(|w| w == [0x00, 0xFF]) else {
        // Keep a trailing 0x00, it may be the first half of a start code.
        return match buffer.last() {
            Some(0x00) => Parse::Skip(buffer.len() - 1),
            _ => Parse::Skip(buffer.len()),
        };
    };

    let body = &buffer[start + 2..];
    if body.len() < 2 {
        return if start > 0 { Parse::Skip(start) } else { Parse::Incomplete };
    }

    match (body[0], body[1]) {
        (0x00, 0xFF) => return Parse::Complete(Frame::Ack, start + 4),
        (0xFF, 0x00) => return Parse::Complete(Frame::Nack, start + 4),
        _ => {}
    }

    let len = body[0];
    if len.wrapping_add(body[1]) != 0 || len == 0 {
        return Parse::Skip(start + 1);
    }

    let len = len as usize;
    if body.len() < 2 + len + 1 {
        return Parse::Incomplete;
    }

    let data = &body[2..2 + len];
    let checksum = data.iter().fold(body[2 + len], |acc, byte| acc.wrapping_add(*byte));
    if checksum != 0 {
        return Parse::Skip(start + 1);
    }

    // Postamble is optional on the wire; consume it when present.
    let mut consumed = start + 2 + 2 + len + 1;
    if buffer.get(consumed) == Some(&0x00) {
        consumed += 1;
    }
    Parse::Complete(Frame::Information(data.to_vec()), consumed)
}

/// First target's NFCID from an InListPassiveTarget (106 kbps type A) answer.
pub fn parse_passive_target(response: &[u8]) -> Result<Option<Vec<u8>>> {
    let Some(&count) = response.first() else {
        bail!("empty InListPassiveTarget response");
    };
    if count == 0 {
        return Ok(None);
    }

    // Tg, SENS_RES (2), SEL_RES, NFCIDLength, NFCID...
    if response.len() < 6 {
        bail!("truncated InListPassiveTarget response");
    }
    let uid_len = response[5] as usize;
    let uid = response
        .get(6..6 + uid_len)
        .ok_or_else(|| anyhow!("NFCID length {uid_len} exceeds response"))?;
    Ok(Some(uid.to_vec()))
}

pub struct Pn532Reader {
    port: Mutex<Box<dyn SerialPort>>,
}

impl Pn532Reader {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(20))
            .open()
            .with_context(|| format!("failed to open serial port {path}"))?;

        let reader = Self {
            port: Mutex::new(port),
        };
        reader.setup()?;
        Ok(reader)
    }

    fn setup(&self) -> Result<()> {
        let mut port = self.lock_port()?;

        // HSU wakeup: a long 0x55 preamble, then silence before the first command.
        let mut wakeup = vec![0x55, 0x55];
        wakeup.extend_from_slice(&[0x00; 14]);
        port.write_all(&wakeup).context("failed to wake PN532")?;
        thread::sleep(Duration::from_millis(5));

        let version = send_command(&mut port, CMD_GET_FIRMWARE_VERSION, &[], COMMAND_TIMEOUT)
            .context("PN532 did not report a firmware version")?;
        if version.len() >= 3 {
            info!(
                "PN5{:02x} firmware v{}.{}",
                version[0], version[1], version[2]
            );
        }

        // Normal mode, 1 s virtual card timeout, IRQ enabled.
        send_command(&mut port, CMD_SAM_CONFIGURATION, &[0x01, 0x14, 0x01], COMMAND_TIMEOUT)
            .context("PN532 SAM configuration failed")?;

        // MxRtyATR, MxRtyPSL, MxRtyPassiveActivation: give up quickly when no tag is present.
        send_command(&mut port, CMD_RF_CONFIGURATION, &[0x05, 0xFF, 0x01, 0x02], COMMAND_TIMEOUT)
            .context("PN532 RF retry configuration failed")?;

        info!("PN532 ready for ISO14443A tags");
        Ok(())
    }

    fn lock_port(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn SerialPort>>> {
        self.port
            .lock()
            .map_err(|_| anyhow!("PN532 port lock poisoned"))
    }
}

impl TagReader for Pn532Reader {
    fn read_passive_target(&self) -> Result<Option<Vec<u8>>> {
        let mut port = self.lock_port()?;
        let response = send_command(
            &mut port,
            CMD_IN_LIST_PASSIVE_TARGET,
            &[0x01, BAUD_ISO14443A],
            COMMAND_TIMEOUT,
        )?;
        parse_passive_target(&response)
    }
}

fn send_command(
    port: &mut Box<dyn SerialPort>,
    command: u8,
    params: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    port.write_all(&encode_command(command, params))
        .with_context(|| format!("failed to send PN532 command {command:#04x}"))?;
    port.flush().ok();

    let mut buffer = Vec::new();
    match read_frame(port, &mut buffer, ACK_TIMEOUT)? {
        Some(Frame::Ack) => {}
        Some(other) => bail!("expected ACK for {command:#04x}, got {other:?}"),
        None => bail!("no ACK for PN532 command {command:#04x}"),
    }

    match read_frame(port, &mut buffer, timeout)? {
        Some(Frame::Information(data)) => {
            if data.len() < 2 || data[0] != PN532_TO_HOST || data[1] != command + 1 {
                bail!("unexpected PN532 response to {command:#04x}: {data:02X?}");
            }
            debug!("PN532 {command:#04x} -> {:02X?}", &data[2..]);
            Ok(data[2..].to_vec())
        }
        Some(other) => bail!("expected response for {command:#04x}, got {other:?}"),
        None => bail!("PN532 command {command:#04x} timed out"),
    }
}

fn read_frame(
    port: &mut Box<dyn SerialPort>,
    buffer: &mut Vec<u8>,
    timeout: Duration,
) -> Result<Option<Frame>> {
    let deadline = Instant::now() + timeout;
    let mut chunk = [0u8; 64];

    loop {
        match parse_frame(buffer) {
            Parse::Complete(frame, consumed) => {
                buffer.drain(..consumed);
                return Ok(Some(frame));
            }
            Parse::Skip(count) => {
                buffer.drain(..count);
            }
            Parse::Incomplete => {}
        }

        if Instant::now() >= deadline {
            return Ok(None);
        }

        match port.read(&mut chunk) {
            Ok(read) => buffer.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err).context("PN532 read failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_in_list_passive_target() {
        assert_eq!(
            encode_command(CMD_IN_LIST_PASSIVE_TARGET, &[0x01, 0x00]),
            vec![0x00, 0x00, 0xFF, 0x04, 0xFC, 0xD4, 0x4A, 0x01, 0x00, 0xE1, 0x00]
        );
    }

    #[test]
    fn parses_ack_then_response() {
        let mut stream = vec![0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00];
        // D5 03 32 01 06 07: firmware response
        stream.extend_from_slice(&[0x00, 0x00, 0xFF, 0x06, 0xFA, 0xD5, 0x03, 0x32, 0x01, 0x06, 0x07, 0xE8, 0x00]);

        let Parse::Complete(first, consumed) = parse_frame(&stream) else {
            panic!("ack not parsed");
        };
        assert_eq!(first, Frame::Ack);

        let Parse::Complete(second, _) = parse_frame(&stream[consumed..]) else {
            panic!("response not parsed");
        };
        assert_eq!(
            second,
            Frame::Information(vec![0xD5, 0x03, 0x32, 0x01, 0x06, 0x07])
        );
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = encode_command(CMD_GET_FIRMWARE_VERSION, &[]);
        assert_eq!(parse_frame(&frame[..5]), Parse::Incomplete);
    }

    #[test]
    fn bad_checksum_is_skipped() {
        let mut frame = encode_command(CMD_GET_FIRMWARE_VERSION, &[]);
        let checksum_index = frame.len() - 2;
        frame[checksum_index] ^= 0xFF;
        assert!(matches!(parse_frame(&frame), Parse::Skip(_)));
    }

    #[test]
    fn extracts_uid_from_target_list() {
        // NbTg=1, Tg=1, SENS_RES=00 04, SEL_RES=08, len=4, uid
        let response = [0x01, 0x01, 0x00, 0x04, 0x08, 0x04, 0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(
            parse_passive_target(&response).unwrap(),
            Some(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
        assert_eq!(parse_passive_target(&[0x00]).unwrap(), None);
        assert!(parse_passive_target(&[0x01, 0x01, 0x00, 0x04, 0x08, 0x07, 0xDE]).is_err());
    }
}
