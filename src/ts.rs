// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport-stream pipeline: per tuner, a reader thread pulling bulk USB
//! data and a parser thread extracting service metadata. The reader strips
//! the FTDI framing, fans the clean bytes out to the configured sink, and
//! offers each chunk to the parser through a single-slot mailbox; when the
//! parser is busy the chunk is dropped for parsing but still delivered.

use crate::config::TsSink;
use crate::psi::{PsiCallbacks, TsParser};
use crate::sink::{fifo::FifoWriter, udp::UdpTs};
use crate::status::{StatusMonitor, NUM_ELEMENT_STREAMS};
use crate::{TaskContext, TunerId};
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Bulk read size: twenty 512-byte USB packets.
pub const TS_FRAME_SIZE: usize = 20 * 512;
const USB_PACKET_LEN: usize = 512;
/// Every USB packet starts with two bytes of FTDI modem status.
const FTDI_STATUS_LEN: usize = 2;

const READ_TIMEOUT: Duration = Duration::from_millis(1000);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
const PARSE_WAIT: Duration = Duration::from_millis(100);

/// Remove the 2-byte modem status that prefixes every 512-byte USB packet.
/// Bulk reads complete on packet boundaries, so walking the buffer in fixed
/// strides is exact.
pub(crate) fn strip_ftdi_framing(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for packet in raw.chunks(USB_PACKET_LEN) {
        if packet.len() > FTDI_STATUS_LEN {
            out.extend_from_slice(&packet[FTDI_STATUS_LEN..]);
        }
    }
    out
}

struct Slot {
    data: Vec<u8>,
    full: bool,
    /// True while the parser is blocked waiting for a chunk.
    waiting: bool,
}

/// Single-slot, non-blocking-producer mailbox between reader and parser.
pub struct Mailbox {
    slot: Mutex<Slot>,
    signal: Condvar,
}

impl Default for Mailbox {
    fn default() -> Self {
        Mailbox::new()
    }
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            slot: Mutex::new(Slot {
                data: Vec::with_capacity(TS_FRAME_SIZE),
                full: false,
                waiting: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Try-lock offer: succeeds only when the parser is already waiting,
    /// otherwise the chunk is dropped for parsing.
    pub fn offer(&self, data: &[u8]) -> bool {
        if let Ok(mut slot) = self.slot.try_lock() {
            if slot.waiting && !slot.full {
                slot.data.clear();
                slot.data.extend_from_slice(data);
                slot.full = true;
                slot.waiting = false;
                self.signal.notify_one();
                return true;
            }
        }
        false
    }

    /// Parser side: wait up to `timeout` for a chunk.
    pub fn take(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut slot = self.slot.lock().unwrap();
        slot.waiting = true;
        let (mut slot, _) = self
            .signal
            .wait_timeout_while(slot, timeout, |s| !s.full)
            .unwrap();
        slot.waiting = false;
        if slot.full {
            slot.full = false;
            Some(std::mem::take(&mut slot.data))
        } else {
            None
        }
    }
}

/// Where a tuner's transport stream goes.
pub enum TsOutput {
    Udp(UdpTs),
    Fifo(FifoWriter),
}

impl TsOutput {
    /// MATYPE top bits 01 mean a Generic Continuous stream, which is routed
    /// to the BBFRAME defragmenter instead of TS re-framing.
    fn write(&mut self, data: &[u8], matype1: u32) {
        match self {
            TsOutput::Udp(sink) => {
                if (matype1 & 0xc0) >> 6 == 1 {
                    sink.write_bbframes(data);
                } else {
                    sink.write_ts(data);
                }
            }
            TsOutput::Fifo(writer) => writer.write(data),
        }
    }
}

/// Reader thread body: bulk reads, de-framing, sink fan-out, mailbox offer.
pub fn loop_ts(ctx: TaskContext, mut output: TsOutput) {
    info!("TS reader for {} running", ctx.tuner.label());
    let mut raw = vec![0u8; TS_FRAME_SIZE];

    while !ctx.shutdown.is_set() {
        let reset_requested = {
            let cfg = ctx.config.lock().unwrap();
            cfg.tuners[ctx.tuner.index()].ts_reset
        };
        if reset_requested {
            if let Err(e) = drain_endpoint(&ctx, &mut raw) {
                ctx.shutdown.raise(&e);
                break;
            }
            clear_service_metadata(&ctx.status);
            ctx.ts_bytes.store(0, Ordering::Relaxed);
            ctx.parser_reset.store(true, Ordering::Relaxed);
            retarget_output(&ctx, &mut output);
            ctx.config.lock().unwrap().tuners[ctx.tuner.index()].ts_reset = false;
            debug!("TS buffer reset for {}", ctx.tuner.label());
        }

        match ctx.gateway.ts_read(ctx.tuner, &mut raw, READ_TIMEOUT) {
            Ok(len) if len > FTDI_STATUS_LEN => {
                let clean = strip_ftdi_framing(&raw[..len]);
                if clean.is_empty() {
                    continue;
                }
                let matype1 = ctx.status.lock().matype1;
                output.write(&clean, matype1);
                ctx.mailbox.offer(&clean);
                ctx.ts_bytes.fetch_add(clean.len() as u32, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => {
                error!("TS read on {} failed: {}", ctx.tuner.label(), e);
                ctx.shutdown.raise(&e);
                break;
            }
        }
    }
    info!("TS reader for {} stopped", ctx.tuner.label());
}

/// Pick up a changed UDP destination (the MQTT `tsip` command) at the reset
/// boundary; tuner 2's sink is fixed at startup.
fn retarget_output(ctx: &TaskContext, output: &mut TsOutput) {
    if ctx.tuner != TunerId::Tuner1 {
        return;
    }
    if let TsOutput::Udp(sink) = output {
        let target = {
            let cfg = ctx.config.lock().unwrap();
            match &cfg.ts_sink {
                TsSink::Udp(ip, port) => Some((ip.clone(), *port)),
                TsSink::Fifo(_) => None,
            }
        };
        if let Some((ip, port)) = target {
            if let Err(e) = sink.retarget(&ip, port) {
                warn!("TS sink retarget to {}:{} failed: {}", ip, port, e);
            }
        }
    }
}

/// Pull until the endpoint only returns its status prefix.
fn drain_endpoint(ctx: &TaskContext, raw: &mut [u8]) -> crate::error::Result<()> {
    loop {
        let len = ctx.gateway.ts_read(ctx.tuner, raw, DRAIN_TIMEOUT)?;
        if len <= FTDI_STATUS_LEN {
            return Ok(());
        }
    }
}

fn clear_service_metadata(status: &StatusMonitor) {
    let mut s = status.lock();
    s.service_name.clear();
    s.service_provider_name.clear();
    s.ts_null_percentage = 100;
    s.ts_packet_count = 0;
    s.ts_bitrate_kbps = 0;
    for entry in s.ts_elementary_streams.iter_mut() {
        *entry = (0, 0);
    }
}

/// PSI callbacks writing straight into the tuner's status record.
struct StatusUpdater<'a> {
    status: &'a StatusMonitor,
}

impl PsiCallbacks for StatusUpdater<'_> {
    fn on_sdt_service(&mut self, provider_name: &str, service_name: &str) {
        let mut status = self.status.lock();
        status.service_name = service_name.to_string();
        status.service_provider_name = provider_name.to_string();
    }

    fn on_pmt_entry(&mut self, index: usize, pid: u16, stream_type: u8) {
        if index < NUM_ELEMENT_STREAMS {
            let mut status = self.status.lock();
            status.ts_elementary_streams[index] = (pid, stream_type as u16);
        }
    }

    fn on_ts_stats(&mut self, total_packets: u32, null_percent: u8) {
        if total_packets > 0 {
            let mut status = self.status.lock();
            status.ts_null_percentage = null_percent;
        }
    }
}

/// Parser thread body: wait on the mailbox, run the PSI parser, poke the
/// status condvar so the publisher sees fresh service data promptly.
pub fn loop_ts_parse(ctx: TaskContext) {
    info!("TS parser for {} running", ctx.tuner.label());
    let mut parser = TsParser::new();

    while !ctx.shutdown.is_set() {
        if ctx.parser_reset.swap(false, Ordering::Relaxed) {
            parser.reset();
        }
        if let Some(chunk) = ctx.mailbox.take(PARSE_WAIT) {
            let mut updater = StatusUpdater { status: &ctx.status };
            parser.parse(&chunk, &mut updater);
            ctx.status.notify();
        }
    }
    info!("TS parser for {} stopped", ctx.tuner.label());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn framing_strip_removes_every_prefix() {
        // Three USB packets, each prefixed by the modem status 0xab 0xcd.
        let mut raw = Vec::new();
        let mut expected = Vec::new();
        for n in 0..3u8 {
            raw.extend_from_slice(&[0xab, 0xcd]);
            let payload: Vec<u8> = (0..510).map(|i| (i as u8).wrapping_add(n)).collect();
            raw.extend_from_slice(&payload);
            expected.extend_from_slice(&payload);
        }
        let clean = strip_ftdi_framing(&raw);
        assert_eq!(clean, expected);
        // The status bytes never appear adjacent in the output.
        assert!(!clean.windows(2).any(|w| w == [0xab, 0xcd]));
    }

    #[test]
    fn framing_strip_handles_short_tail() {
        let mut raw = vec![0u8; 512];
        raw.extend_from_slice(&[0xab, 0xcd, 0x47]);
        let clean = strip_ftdi_framing(&raw);
        assert_eq!(clean.len(), 510 + 1);
        assert_eq!(*clean.last().unwrap(), 0x47);
    }

    #[test]
    fn framing_strip_drops_status_only_packet() {
        assert!(strip_ftdi_framing(&[0xab, 0xcd]).is_empty());
    }

    #[test]
    fn mailbox_drops_when_parser_is_busy() {
        let mailbox = Mailbox::new();
        // No taker waiting: offer is refused.
        assert!(!mailbox.offer(&[1, 2, 3]));
    }

    #[test]
    fn mailbox_hands_over_when_parser_waits() {
        let mailbox = std::sync::Arc::new(Mailbox::new());
        let taker = mailbox.clone();
        let handle = thread::spawn(move || taker.take(Duration::from_secs(5)));
        // Spin until the parser thread registers as waiting.
        let mut delivered = false;
        for _ in 0..500 {
            if mailbox.offer(&[9, 8, 7]) {
                delivered = true;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(delivered);
        assert_eq!(handle.join().unwrap(), Some(vec![9, 8, 7]));
    }

    #[test]
    fn mailbox_take_times_out_empty() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.take(Duration::from_millis(10)), None);
    }
}
