// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP sinks: line-oriented status datagrams, sync-aligned TS in 7-packet
//! quanta, and raw BBFRAME datagrams for Generic Continuous streams.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, warn};
use std::net::{SocketAddr, UdpSocket};

pub const TS_PACKET_LEN: usize = 188;
/// Seven TS packets per datagram.
pub const TS_QUANTUM: usize = 7 * TS_PACKET_LEN;
pub const BBFRAME_MAX_LEN: usize = 7274;

/* CRC-8 with the reflected DVB-S2 polynomial 0xd5 */
const CRC_POLY_REFLECTED: u8 = 0xd5;

const fn build_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = 0u8;
        let mut j = 7i32;
        while j >= 0 {
            let bit = ((i as u8 >> j) & 1) ^ (crc >> 7);
            if bit != 0 {
                crc = (crc << 1) ^ CRC_POLY_REFLECTED;
            } else {
                crc <<= 1;
            }
            j -= 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC8_TABLE: [u8; 256] = build_crc8_table();

pub(crate) fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &b| CRC8_TABLE[(b ^ crc) as usize])
}

/// Re-frames an arbitrary byte stream to TS sync alignment and emits it in
/// 1316-byte quanta. Sync is acquired by finding two 0x47 bytes 188 apart
/// within the first two packets' worth of data, and dropped again whenever
/// the send buffer stops starting on a sync byte.
pub(crate) struct TsNormalizer {
    buffer: Vec<u8>,
    synced: bool,
}

impl TsNormalizer {
    pub fn new() -> TsNormalizer {
        TsNormalizer {
            buffer: Vec::with_capacity(2 * TS_QUANTUM),
            synced: false,
        }
    }

    pub fn push(&mut self, data: &[u8], emit: &mut dyn FnMut(&[u8])) {
        let mut data = data;
        if !self.synced {
            if data.len() < 2 * TS_PACKET_LEN {
                return;
            }
            let mut start = None;
            for i in 0..TS_PACKET_LEN {
                if data[i] == 0x47 && data[i + TS_PACKET_LEN] == 0x47 {
                    start = Some(i);
                    break;
                }
            }
            match start {
                Some(i) => {
                    info!("TS sync recovered at offset {}", i);
                    data = &data[i..];
                    self.synced = true;
                    self.buffer.clear();
                }
                None => {
                    debug!("no TS sync in {} bytes", data.len());
                    return;
                }
            }
        }

        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= TS_QUANTUM {
            if self.buffer[0] != 0x47 {
                warn!("TS sync lost");
                self.buffer.clear();
                self.synced = false;
                return;
            }
            emit(&self.buffer[..TS_QUANTUM]);
            self.buffer.drain(..TS_QUANTUM);
        }
    }
}

/// Reassembles BBFRAMEs from arbitrary chunk boundaries. A frame starts at
/// a 10-byte header whose CRC-8 over the first nine bytes matches the
/// tenth; its total length is DFL/8 + 10 with DFL big-endian at bytes 4..6.
pub(crate) struct BbDefrag {
    frame: Vec<u8>,
    expected_len: usize,
}

impl BbDefrag {
    pub fn new() -> BbDefrag {
        BbDefrag {
            frame: Vec::with_capacity(BBFRAME_MAX_LEN),
            expected_len: 0,
        }
    }

    /// Total frame length from a validated header, or None if the header
    /// CRC does not check out.
    fn header_len(chunk: &[u8]) -> Option<usize> {
        if chunk.len() < 10 || crc8(&chunk[..9]) != chunk[9] {
            return None;
        }
        let dfl_bits = BigEndian::read_u16(&chunk[4..6]) as usize;
        Some(dfl_bits / 8 + 10)
    }

    pub fn push(&mut self, data: &[u8], emit: &mut dyn FnMut(&[u8])) {
        let mut data = data;
        loop {
            if self.expected_len == 0 {
                match Self::header_len(data) {
                    Some(len) if len <= BBFRAME_MAX_LEN => self.expected_len = len,
                    Some(len) => {
                        warn!("oversize BBFRAME ({} bytes) discarded", len);
                        return;
                    }
                    None => {
                        debug!("no BBFRAME header in {} byte chunk", data.len());
                        return;
                    }
                }
            }

            // Accumulating below the expected length keeps the frame under
            // the cap, because the expected length itself is capped.
            let have = self.frame.len() + data.len();
            if have < self.expected_len {
                self.frame.extend_from_slice(data);
                return;
            }

            let need = self.expected_len - self.frame.len();
            self.frame.extend_from_slice(&data[..need]);
            emit(&self.frame);
            data = &data[need..];
            self.frame.clear();
            self.expected_len = 0;
            if data.is_empty() {
                return;
            }
        }
    }
}

fn open_socket(ip: &str, port: u16) -> Result<(UdpSocket, SocketAddr)> {
    let dest: SocketAddr = format!("{}:{}", ip, port)
        .parse()
        .map_err(|_| Error::ArgsInput(format!("bad UDP address {}:{}", ip, port)))?;
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(Error::UdpSocketOpen)?;
    Ok((socket, dest))
}

/// TS payload sink: routes to the TS normalizer or the BBFRAME
/// defragmenter depending on the stream type the caller saw in MATYPE.
pub struct UdpTs {
    socket: UdpSocket,
    dest: SocketAddr,
    normalizer: TsNormalizer,
    defrag: BbDefrag,
}

impl UdpTs {
    pub fn new(ip: &str, port: u16) -> Result<UdpTs> {
        info!("UDP TS sink {}:{}", ip, port);
        let (socket, dest) = open_socket(ip, port)?;
        Ok(UdpTs {
            socket,
            dest,
            normalizer: TsNormalizer::new(),
            defrag: BbDefrag::new(),
        })
    }

    pub fn retarget(&mut self, ip: &str, port: u16) -> Result<()> {
        let (socket, dest) = open_socket(ip, port)?;
        self.socket = socket;
        self.dest = dest;
        Ok(())
    }

    pub fn write_ts(&mut self, data: &[u8]) {
        let socket = &self.socket;
        let dest = self.dest;
        self.normalizer.push(data, &mut |quantum| {
            if let Err(e) = socket.send_to(quantum, dest) {
                error!("UDP TS send failed: {}", e);
            }
        });
    }

    pub fn write_bbframes(&mut self, data: &[u8]) {
        let socket = &self.socket;
        let dest = self.dest;
        self.defrag.push(data, &mut |frame| {
            if let Err(e) = socket.send_to(frame, dest) {
                error!("UDP BBFRAME send failed: {}", e);
            }
        });
    }
}

/// Line-oriented status sink: one datagram per field, "$<code>,<value>\n".
pub struct UdpStatus {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl UdpStatus {
    pub fn new(ip: &str, port: u16) -> Result<UdpStatus> {
        info!("UDP status sink {}:{}", ip, port);
        let (socket, dest) = open_socket(ip, port)?;
        Ok(UdpStatus { socket, dest })
    }

    fn send_line(&self, line: String) {
        if let Err(e) = self.socket.send_to(line.as_bytes(), self.dest) {
            error!("UDP status send failed: {}", e);
        }
    }

    // Values print as signed decimal: MER, carrier offset, and the
    // constellation samples ride the same u32 slot as everything else.
    pub fn write_u32(&mut self, code: u8, value: u32) {
        self.send_line(format!("${},{}\n", code, value as i32));
    }

    pub fn write_str(&mut self, code: u8, value: &str) {
        self.send_line(format!("${},{}\n", code, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_stream(packets: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for n in 0..packets {
            let mut packet = vec![0u8; TS_PACKET_LEN];
            packet[0] = 0x47;
            packet[1] = n as u8;
            data.extend_from_slice(&packet);
        }
        data
    }

    #[test]
    fn crc8_of_empty_is_zero() {
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn crc8_validates_and_rejects_bit_flips() {
        let mut header = [0u8; 10];
        header[0] = 0x72;
        header[4] = 0x12;
        header[5] = 0x34;
        header[9] = crc8(&header[..9]);
        assert_eq!(crc8(&header[..9]), header[9]);

        // Flipping any single bit of the first nine bytes must break it.
        for byte in 0..9 {
            for bit in 0..8 {
                let mut corrupt = header;
                corrupt[byte] ^= 1 << bit;
                assert_ne!(
                    crc8(&corrupt[..9]),
                    corrupt[9],
                    "bit {}:{} not detected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn normalizer_emits_aligned_quanta() {
        let mut normalizer = TsNormalizer::new();
        let mut out = Vec::new();
        let stream = ts_stream(14);
        // Deliver in awkward chunk sizes.
        for chunk in stream.chunks(510) {
            normalizer.push(chunk, &mut |q| out.extend_from_slice(q));
        }
        assert_eq!(out.len(), 2 * TS_QUANTUM);
        for i in (0..out.len()).step_by(TS_PACKET_LEN) {
            assert_eq!(out[i], 0x47, "packet at {} misaligned", i);
        }
        // Output is a prefix of the input.
        assert_eq!(&out[..], &stream[..out.len()]);
    }

    #[test]
    fn normalizer_skips_leading_garbage() {
        let mut normalizer = TsNormalizer::new();
        let mut out = Vec::new();
        let mut stream = vec![0xab, 0xcd, 0x55];
        stream.extend(ts_stream(8));
        normalizer.push(&stream, &mut |q| out.extend_from_slice(q));
        assert_eq!(out.len(), TS_QUANTUM);
        assert_eq!(&out[..], &stream[3..3 + TS_QUANTUM]);
    }

    #[test]
    fn normalizer_needs_two_syncs_to_lock() {
        let mut normalizer = TsNormalizer::new();
        let mut out = Vec::new();
        // A lone 0x47 not followed by another at +188 must not sync.
        let mut stream = vec![0u8; 2 * TS_PACKET_LEN];
        stream[0] = 0x47;
        normalizer.push(&stream, &mut |q| out.extend_from_slice(q));
        assert!(out.is_empty());
    }

    fn bbframe(payload_len: usize, filler: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 10 + payload_len];
        frame[0] = 0x72;
        BigEndian::write_u16(&mut frame[4..6], (payload_len * 8) as u16);
        frame[9] = crc8(&frame[..9]);
        for slot in frame[10..].iter_mut() {
            *slot = filler;
        }
        frame
    }

    #[test]
    fn defrag_reassembles_across_chunks() {
        let mut defrag = BbDefrag::new();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let frame = bbframe(600, 0x5a);
        for chunk in frame.chunks(128) {
            defrag.push(chunk, &mut |f| out.push(f.to_vec()));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], frame);
    }

    #[test]
    fn defrag_splits_back_to_back_frames() {
        let mut defrag = BbDefrag::new();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let first = bbframe(100, 0x11);
        let second = bbframe(80, 0x22);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        defrag.push(&stream, &mut |f| out.push(f.to_vec()));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], first);
        assert_eq!(out[1], second);
    }

    #[test]
    fn defrag_rejects_bad_header() {
        let mut defrag = BbDefrag::new();
        let mut out = 0;
        let mut frame = bbframe(50, 0x33);
        frame[9] ^= 0xff; /* break the header CRC */
        defrag.push(&frame, &mut |_| out += 1);
        assert_eq!(out, 0);
    }

    #[test]
    fn defrag_discards_oversize_frames() {
        let mut defrag = BbDefrag::new();
        let mut out = 0;
        // DFL implies a frame bigger than the cap.
        let mut header = vec![0u8; 10];
        header[0] = 0x72;
        BigEndian::write_u16(&mut header[4..6], 60_000);
        header[9] = crc8(&header[..9]);
        defrag.push(&header, &mut |_| out += 1);
        assert_eq!(out, 0);
    }
}
