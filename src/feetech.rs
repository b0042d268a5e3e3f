//! Feetech STS-series servo bus over a serial port.
//!
//! The STS3215 servos in SO-ARM arms speak a Dynamixel-v1-style protocol:
//!
//! `[0xFF, 0xFF, id, length, instruction, params..., checksum]`
//!
//! Status replies have the same framing with an error byte in place of the
//! instruction. Sync read/write use the broadcast ID; sync write gets no
//! reply.

use std::io::{Read, Write};
use std::time::Duration;

use crate::bus::{JointRead, JointWrite, ServoBus};
use crate::error::{Error, Result};

/// Feetech buses run at 1 Mbaud by default.
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

/// Control-table addresses used by this crate.
mod registers {
    /// Torque enable (1 byte, read-write).
    pub const TORQUE_ENABLE: u8 = 0x28;
    /// Goal position (2 bytes little-endian, read-write).
    pub const GOAL_POSITION: u8 = 0x2A;
    /// Present position (2 bytes little-endian, read-only).
    pub const PRESENT_POSITION: u8 = 0x38;
}

const BROADCAST_ID: u8 = 0xFE;

/// Bytes of noise tolerated while hunting for a reply header.
const MAX_SYNC_SCAN: usize = 64;

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

/// `FeetechBus` over a real serial port.
pub type SerialBus = FeetechBus<Box<dyn serialport::SerialPort>>;

/// Feetech protocol driver over any byte stream.
///
/// Generic over the transport so the packet layer is testable without
/// hardware; production code uses [`SerialBus::open`].
pub struct FeetechBus<S> {
    stream: S,
}

impl SerialBus {
    /// Open the serial port and take ownership of the bus.
    ///
    /// `timeout` bounds every read; the protocol adds no timeout of its
    /// own beyond what the transport provides.
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| Error::transport(format!("open {}: {}", path, e)))?;
        tracing::info!("opened servo bus on {} at {} baud", path, baud_rate);
        Ok(Self { stream: port })
    }
}

impl<S> FeetechBus<S>
where
    S: Read + Write + Send,
{
    /// Wrap an already-open byte stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Check whether a servo answers at all.
    pub fn ping(&mut self, id: u8) -> bool {
        let packet = build_packet(id, Instruction::Ping, &[]);
        self.transact(&packet, id).is_ok()
    }

    fn read_register(&mut self, id: u8, address: u8, length: u8) -> Result<Vec<u8>> {
        let packet = build_packet(id, Instruction::Read, &[address, length]);
        self.transact(&packet, id)
    }

    fn write_register(&mut self, id: u8, address: u8, data: &[u8]) -> Result<()> {
        let mut params = vec![address];
        params.extend_from_slice(data);
        let packet = build_packet(id, Instruction::Write, &params);
        self.transact(&packet, id)?;
        Ok(())
    }

    /// Send a packet and read the status reply, returning its parameters.
    fn transact(&mut self, packet: &[u8], id: u8) -> Result<Vec<u8>> {
        self.stream
            .write_all(packet)
            .map_err(|e| Error::transport(format!("servo {}: write failed: {}", id, e)))?;
        self.read_reply(id)
    }

    /// Read and validate one status reply:
    /// `[0xFF, 0xFF, id, length, error, params..., checksum]`.
    fn read_reply(&mut self, id: u8) -> Result<Vec<u8>> {
        self.sync_to_header(id)?;

        let mut head = [0u8; 2];
        self.read_exact(&mut head, id)?;
        let reply_id = head[0];
        let length = head[1] as usize;
        if length < 2 {
            return Err(Error::transport(format!(
                "servo {}: short reply (length {})",
                id, length
            )));
        }

        let mut body = vec![0u8; length];
        self.read_exact(&mut body, id)?;

        let expected = checksum(reply_id, head[1], &body[..length - 1]);
        if body[length - 1] != expected {
            return Err(Error::transport(format!(
                "servo {}: reply checksum mismatch",
                id
            )));
        }

        let status = body[0];
        if status != 0 {
            return Err(Error::transport(format!(
                "servo {}: status error 0x{:02X}",
                reply_id, status
            )));
        }

        Ok(body[1..length - 1].to_vec())
    }

    fn read_exact(&mut self, buf: &mut [u8], id: u8) -> Result<()> {
        self.stream
            .read_exact(buf)
            .map_err(|e| Error::transport(format!("servo {}: read failed: {}", id, e)))
    }

    /// Scan for the `FF FF` reply marker, skipping a bounded amount of line
    /// noise or stale bytes left over from an earlier framing error.
    fn sync_to_header(&mut self, id: u8) -> Result<()> {
        let mut consecutive = 0;
        for _ in 0..MAX_SYNC_SCAN {
            let mut byte = [0u8; 1];
            self.read_exact(&mut byte, id)?;
            if byte[0] == 0xFF {
                consecutive += 1;
                if consecutive == 2 {
                    return Ok(());
                }
            } else {
                consecutive = 0;
            }
        }
        Err(Error::transport(format!(
            "servo {}: no reply header within {} bytes",
            id, MAX_SYNC_SCAN
        )))
    }

    fn read_individually(&mut self, ids: &[u8]) -> Vec<JointRead> {
        ids.iter()
            .map(|&id| JointRead {
                id,
                position: self.read_position(id),
            })
            .collect()
    }
}

impl<S> ServoBus for FeetechBus<S>
where
    S: Read + Write + Send,
{
    fn read_position(&mut self, id: u8) -> Result<u16> {
        let data = self.read_register(id, registers::PRESENT_POSITION, 2)?;
        if data.len() < 2 {
            return Err(Error::transport(format!(
                "servo {}: truncated position data",
                id
            )));
        }
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    fn write_position(&mut self, id: u8, position: u16) -> Result<()> {
        self.write_register(id, registers::GOAL_POSITION, &position.to_le_bytes())
    }

    fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        self.write_register(id, registers::TORQUE_ENABLE, &[enabled as u8])
    }

    /// Sync read with per-joint fallback: one broadcast request, then one
    /// status reply per servo. If the reply stream loses framing the
    /// remaining joints are read individually instead.
    fn sync_read_positions(&mut self, ids: &[u8]) -> Vec<JointRead> {
        let mut params = vec![registers::PRESENT_POSITION, 2];
        params.extend_from_slice(ids);
        let packet = build_packet(BROADCAST_ID, Instruction::SyncRead, &params);

        if let Err(e) = self.stream.write_all(&packet) {
            tracing::warn!("sync read dispatch failed, falling back: {}", e);
            return self.read_individually(ids);
        }

        let mut reads = Vec::with_capacity(ids.len());
        for (i, &id) in ids.iter().enumerate() {
            match self.read_reply(id) {
                Ok(data) if data.len() >= 2 => reads.push(JointRead {
                    id,
                    position: Ok(u16::from_le_bytes([data[0], data[1]])),
                }),
                Ok(_) => reads.push(JointRead {
                    id,
                    position: Err(Error::transport(format!(
                        "servo {}: truncated position data",
                        id
                    ))),
                }),
                Err(e) => {
                    // Framing is gone; re-read this and the remaining
                    // joints one by one.
                    tracing::warn!("sync read reply failed at servo {}: {}", id, e);
                    reads.extend(self.read_individually(&ids[i..]));
                    break;
                }
            }
        }
        reads
    }

    /// Sync write: a single broadcast packet, no replies. On dispatch
    /// failure every joint is written individually.
    fn sync_write_positions(&mut self, targets: &[(u8, u16)]) -> Vec<JointWrite> {
        let mut params = vec![registers::GOAL_POSITION, 2];
        for &(id, position) in targets {
            params.push(id);
            params.extend_from_slice(&position.to_le_bytes());
        }
        let packet = build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);

        match self.stream.write_all(&packet) {
            Ok(()) => targets
                .iter()
                .map(|&(id, _)| JointWrite {
                    id,
                    outcome: Ok(()),
                })
                .collect(),
            Err(e) => {
                tracing::warn!("sync write failed, falling back: {}", e);
                targets
                    .iter()
                    .map(|&(id, position)| JointWrite {
                        id,
                        outcome: self.write_position(id, position),
                    })
                    .collect()
            }
        }
    }

    fn set_torque_all(&mut self, ids: &[u8], enabled: bool) -> Vec<JointWrite> {
        let mut params = vec![registers::TORQUE_ENABLE, 1];
        for &id in ids {
            params.push(id);
            params.push(enabled as u8);
        }
        let packet = build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);

        match self.stream.write_all(&packet) {
            Ok(()) => ids
                .iter()
                .map(|&id| JointWrite {
                    id,
                    outcome: Ok(()),
                })
                .collect(),
            Err(e) => {
                tracing::warn!("torque sync write failed, falling back: {}", e);
                ids.iter()
                    .map(|&id| JointWrite {
                        id,
                        outcome: self.set_torque(id, enabled),
                    })
                    .collect()
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.stream
            .flush()
            .map_err(|e| Error::transport(format!("flush on close: {}", e)))
    }
}

fn checksum(id: u8, length: u8, payload: &[u8]) -> u8 {
    let mut sum = id.wrapping_add(length);
    for &byte in payload {
        sum = sum.wrapping_add(byte);
    }
    !sum
}

fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    // length counts instruction + params + checksum
    let length = (params.len() + 2) as u8;
    let mut packet = vec![0xFF, 0xFF, id, length, instruction as u8];
    packet.extend_from_slice(params);
    // Checksum covers everything after the two-byte header marker.
    let sum = packet[2..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    packet.push(!sum);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Byte stream with scripted replies, for exercising the packet layer.
    struct FakeStream {
        sent: Vec<u8>,
        replies: VecDeque<u8>,
    }

    impl FakeStream {
        fn new(replies: &[u8]) -> Self {
            Self {
                sent: Vec::new(),
                replies: replies.iter().copied().collect(),
            }
        }

        /// A well-formed status reply for `id` with the given params.
        fn reply(id: u8, params: &[u8]) -> Vec<u8> {
            let length = (params.len() + 2) as u8;
            let mut body = vec![0u8]; // status: no error
            body.extend_from_slice(params);
            let mut reply = vec![0xFF, 0xFF, id, length];
            reply.extend_from_slice(&body);
            reply.push(checksum(id, length, &body));
            reply
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.replies.is_empty() {
                return Err(std::io::Error::from(std::io::ErrorKind::TimedOut));
            }
            let n = buf.len().min(self.replies.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.replies.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_build_packet_layout() {
        // Read 2 bytes of present position from servo 1.
        let packet = build_packet(1, Instruction::Read, &[0x38, 2]);
        assert_eq!(&packet[..5], &[0xFF, 0xFF, 1, 4, 0x02]);
        assert_eq!(packet.len(), 8);
        // Checksum: !(1 + 4 + 2 + 0x38 + 2)
        assert_eq!(*packet.last().unwrap(), !(1u8 + 4 + 2 + 0x38 + 2));
    }

    #[test]
    fn test_read_position_parses_reply() {
        let reply = FakeStream::reply(1, &1234u16.to_le_bytes());
        let mut bus = FeetechBus::new(FakeStream::new(&reply));
        assert_eq!(bus.read_position(1).unwrap(), 1234);
    }

    #[test]
    fn test_status_error_byte_is_transport_error() {
        let mut reply = vec![0xFF, 0xFF, 1, 2];
        let body = [0x20u8]; // overload flag
        reply.extend_from_slice(&body);
        reply.push(checksum(1, 2, &body));
        let mut bus = FeetechBus::new(FakeStream::new(&reply));
        assert!(bus.read_position(1).is_err());
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let mut reply = FakeStream::reply(1, &1234u16.to_le_bytes());
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        let mut bus = FeetechBus::new(FakeStream::new(&reply));
        assert!(bus.read_position(1).is_err());
    }

    #[test]
    fn test_sync_write_is_single_broadcast() {
        let mut bus = FeetechBus::new(FakeStream::new(&[]));
        let writes = bus.sync_write_positions(&[(1, 1000), (2, 2000)]);
        assert!(writes.iter().all(|w| w.outcome.is_ok()));

        let sent = &bus.stream.sent;
        assert_eq!(&sent[..5], &[0xFF, 0xFF, BROADCAST_ID, 10, 0x83]);
        // Params: addr, width, then (id, lo, hi) per servo.
        assert_eq!(&sent[5..13], &[0x2A, 2, 1, 0xE8, 0x03, 2, 0xD0, 0x07]);
    }

    #[test]
    fn test_sync_read_skips_line_noise() {
        // Stray bytes before the first reply header are scanned past.
        let mut replies = vec![0x00, 0x17, 0x00, 0x00];
        replies.extend(FakeStream::reply(1, &100u16.to_le_bytes()));
        replies.extend(FakeStream::reply(2, &200u16.to_le_bytes()));
        let mut bus = FeetechBus::new(FakeStream::new(&replies));

        let reads = bus.sync_read_positions(&[1, 2]);
        assert_eq!(reads.len(), 2);
        assert_eq!(*reads[0].position.as_ref().unwrap(), 100);
        assert_eq!(*reads[1].position.as_ref().unwrap(), 200);
    }

    #[test]
    fn test_sync_read_falls_back_after_lost_reply() {
        // Only the second servo's reply arrives; the first read fails with
        // nothing left to parse and the rest are re-read individually,
        // which also comes up empty. Every joint still gets a result.
        let replies = FakeStream::reply(2, &200u16.to_le_bytes());
        let mut bus = FeetechBus::new(FakeStream::new(&replies));
        bus.stream.replies.truncate(3); // cut the reply mid-header

        let reads = bus.sync_read_positions(&[1, 2]);
        assert_eq!(reads.len(), 2);
        assert!(reads[0].position.is_err());
        assert!(reads[1].position.is_err());
    }

    #[test]
    fn test_timeout_surfaces_per_joint() {
        let mut bus = FeetechBus::new(FakeStream::new(&[]));
        let reads = bus.sync_read_positions(&[1]);
        assert!(reads[0].position.is_err());
    }
}
