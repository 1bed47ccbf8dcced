//! HLK-LD2410 24 GHz presence radar over UART.
//!
//! The radar streams report frames continuously:
//!
//! ```text
//! F4 F3 F2 F1 | len (u16 LE) | type AA state mov_cm(2) mov_e stat_cm(2) stat_e det_cm(2) [eng..] 55 00 | F8 F7 F6 F5
//! ```
//!
//! `type` is 0x02 for basic reports and 0x01 in engineering mode; the target
//! block sits at the same offsets in both.

use std::{
    io::{self, Read},
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use serialport::{ClearBuffer, SerialPort};

use super::{DistanceReport, DistanceSensor};

const FRAME_HEADER: [u8; 4] = [0xF4, 0xF3, 0xF2, 0xF1];
const FRAME_FOOTER: [u8; 4] = [0xF8, 0xF7, 0xF6, 0xF5];
const MAX_PAYLOAD_LEN: usize = 64;
const TARGET_HEAD: u8 = 0xAA;
const MIN_TARGET_PAYLOAD: usize = 11;

const TARGET_MOVING: u8 = 0x01;
const TARGET_STATIC: u8 = 0x02;

/// Reassembles report frames from an arbitrary byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        // A stream with no header for a long time is noise; keep the tail only.
        if self.buffer.len() > 4 * (MAX_PAYLOAD_LEN + 10) {
            let keep_from = self.buffer.len() - (MAX_PAYLOAD_LEN + 10);
            self.buffer.drain(..keep_from);
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Next complete, well-formed report in the buffer, if any.
    pub fn next_report(&mut self) -> Option<DistanceReport> {
        loop {
            let start = find_subslice(&self.buffer, &FRAME_HEADER)?;
            self.buffer.drain(..start);

            if self.buffer.len() < 6 {
                return None;
            }

            let payload_len = u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize;
            if payload_len > MAX_PAYLOAD_LEN {
                self.buffer.drain(..1);
                continue;
            }

            let frame_len = 4 + 2 + payload_len + 4;
            if self.buffer.len() < frame_len {
                return None;
            }

            let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();
            if frame[frame_len - 4..] != FRAME_FOOTER {
                continue;
            }

            if let Some(report) = parse_payload(&frame[6..6 + payload_len]) {
                return Some(report);
            }
        }
    }
}

fn parse_payload(payload: &[u8]) -> Option<DistanceReport> {
    if payload.len() < MIN_TARGET_PAYLOAD || payload[1] != TARGET_HEAD {
        return None;
    }
    if !matches!(payload[0], 0x01 | 0x02) {
        return None;
    }

    let state = payload[2];
    let moving = u16::from_le_bytes([payload[3], payload[4]]);
    let stationary = u16::from_le_bytes([payload[6], payload[7]]);
    let detection = u16::from_le_bytes([payload[9], payload[10]]);

    Some(DistanceReport {
        moving_cm: (state & TARGET_MOVING != 0).then_some(moving),
        static_cm: (state & TARGET_STATIC != 0).then_some(stationary),
        detection_cm: (state != 0).then_some(detection),
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub struct Ld2410Radar {
    port: Mutex<Box<dyn SerialPort>>,
    decoder: Mutex<FrameDecoder>,
    read_timeout: Duration,
}

impl Ld2410Radar {
    pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| format!("failed to open serial port {path}"))?;

        Ok(Self {
            port: Mutex::new(port),
            decoder: Mutex::new(FrameDecoder::new()),
            read_timeout,
        })
    }
}

impl DistanceSensor for Ld2410Radar {
    fn read_report(&self) -> Result<DistanceReport> {
        let mut port = self
            .port
            .lock()
            .map_err(|_| anyhow!("LD2410 port lock poisoned"))?;
        let mut decoder = self
            .decoder
            .lock()
            .map_err(|_| anyhow!("LD2410 decoder lock poisoned"))?;

        // Frames queued since the last tick are stale.
        port.clear(ClearBuffer::Input)
            .context("failed to flush LD2410 input")?;
        decoder.clear();

        let deadline = Instant::now() + self.read_timeout;
        let mut chunk = [0u8; 64];
        while Instant::now() < deadline {
            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(read) => {
                    decoder.push(&chunk[..read]);
                    if let Some(report) = decoder.next_report() {
                        return Ok(report);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err).context("LD2410 read failed"),
            }
        }

        bail!("no LD2410 report within {:?}", self.read_timeout)
    }
}
