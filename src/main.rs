// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use longmynd_rs::config::{Config, Polarisation, StatusSinkConfig, TsSink};
use longmynd_rs::device::{BusGateway, UsbAddress};
use longmynd_rs::error::{Error, Result};
use longmynd_rs::sink::fifo::FifoWriter;
use longmynd_rs::sink::json::{JsonFormat, JsonStatus};
use longmynd_rs::sink::mqtt::MqttStatus;
use longmynd_rs::sink::udp::{UdpStatus, UdpTs};
use longmynd_rs::sink::StatusSink;
use longmynd_rs::status::StatusMonitor;
use longmynd_rs::ts::{Mailbox, TsOutput};
use longmynd_rs::{acquisition, ts, Shutdown, TaskContext, TunerId};

use log::{error, info};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Publisher condvar wait per tuner; FIFO reopen happens on these timeouts.
const PUBLISH_WAIT: Duration = Duration::from_millis(10);

fn main() {
    stderrlog::new().verbosity(log::Level::Info).init().unwrap();

    let exit_code = match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            e.code()
        }
    };
    std::process::exit(exit_code as i32);
}

#[derive(Debug, Clone, Copy)]
struct JsonOptions {
    format: JsonFormat,
    pretty: bool,
}

fn run() -> Result<u8> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (config, json_options) = process_command_line(&args)?;
    let config = Arc::new(Mutex::new(config));

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.raise(&Error::SignalTerminate);
        })
        .map_err(|_| Error::Thread)?;
    }
    /* a closed FIFO or socket must surface as a write error, not a signal */
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }

    let (dual, usb1, usb2, auto_detect) = {
        let cfg = config.lock().unwrap();
        (cfg.dual_enabled, cfg.usb_device, cfg.usb_device2, cfg.auto_detect_second)
    };
    let address1 = usb_address(usb1, 0);
    let gateway = if dual {
        let address2 = if auto_detect {
            UsbAddress::Nth(1)
        } else {
            usb_address(usb2, 1)
        };
        Arc::new(BusGateway::open_dual(address1, address2)?)
    } else {
        Arc::new(BusGateway::open_single(address1)?)
    };

    /* status sink, selected once per run */
    let mut status_sink = {
        let cfg = config.lock().unwrap();
        match &cfg.status_sink {
            StatusSinkConfig::Udp(ip, port) => StatusSink::Udp(UdpStatus::new(ip, *port)?),
            StatusSinkConfig::Fifo(path) => StatusSink::Fifo(FifoWriter::new(path)),
            StatusSinkConfig::Mqtt(broker) => {
                let (host, port) = broker
                    .rsplit_once(':')
                    .map(|(h, p)| (h.to_string(), p.parse().unwrap_or(1883)))
                    .unwrap_or_else(|| (broker.clone(), 1883));
                StatusSink::Mqtt(MqttStatus::new(&host, port, config.clone(), shutdown.clone())?)
            }
            StatusSinkConfig::Json => {
                let options = json_options.unwrap_or(JsonOptions {
                    format: JsonFormat::Full,
                    pretty: false,
                });
                StatusSink::Json(JsonStatus::new(options.format, options.pretty))
            }
        }
    };

    let barrier = Arc::new(acquisition::InitBarrier::new());
    let tuners: Vec<TunerId> = if dual {
        vec![TunerId::Tuner1, TunerId::Tuner2]
    } else {
        vec![TunerId::Tuner1]
    };

    let mut contexts = Vec::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    for &tuner in &tuners {
        let ctx = TaskContext {
            tuner,
            config: config.clone(),
            status: StatusMonitor::new(),
            gateway: gateway.clone(),
            shutdown: shutdown.clone(),
            barrier: barrier.clone(),
            mailbox: Arc::new(Mailbox::new()),
            ts_bytes: Arc::new(AtomicU32::new(0)),
            parser_reset: Arc::new(AtomicBool::new(false)),
        };

        let output = ts_output(&config, tuner)?;
        let reader_ctx = ctx.clone();
        handles.push(spawn_named(format!("ts-{}", tuner.label()), move || {
            ts::loop_ts(reader_ctx, output)
        })?);

        let parser_ctx = ctx.clone();
        handles.push(spawn_named(format!("parse-{}", tuner.label()), move || {
            ts::loop_ts_parse(parser_ctx)
        })?);

        let acq_ctx = ctx.clone();
        handles.push(spawn_named(format!("acq-{}", tuner.label()), move || {
            acquisition::loop_acquisition(acq_ctx)
        })?);

        contexts.push(ctx);
    }

    /* publisher: wait for status updates and fan them out to the sink. The
     * line formats carry no tuner marker, so tuner 2 only publishes through
     * sinks that do (MQTT topic prefix, JSON tuner field). */
    let tuner2_publishable = matches!(
        status_sink,
        StatusSink::Mqtt(_) | StatusSink::Json(_)
    );
    let mut last_sent = vec![0u64; contexts.len()];
    while !shutdown.is_set() {
        for (i, ctx) in contexts.iter().enumerate() {
            if ctx.tuner == TunerId::Tuner2 && !tuner2_publishable {
                continue;
            }
            if let Some(snapshot) = ctx.status.wait_newer(last_sent[i], PUBLISH_WAIT) {
                status_sink.publish(ctx.tuner, &snapshot);
                last_sent[i] = snapshot.last_updated;
            }
        }
    }

    info!("main loop done, waiting for threads");
    for handle in handles {
        let _ = handle.join();
    }
    info!("all threads accounted for, exiting");
    Ok(shutdown.exit_code())
}

fn usb_address(pair: (u8, u8), index: usize) -> UsbAddress {
    if pair == (0, 0) {
        if index == 0 {
            UsbAddress::Any
        } else {
            UsbAddress::Nth(index)
        }
    } else {
        UsbAddress::BusAddr(pair.0, pair.1)
    }
}

fn ts_output(config: &Arc<Mutex<Config>>, tuner: TunerId) -> Result<TsOutput> {
    let cfg = config.lock().unwrap();
    match tuner {
        TunerId::Tuner1 => match &cfg.ts_sink {
            TsSink::Udp(ip, port) => Ok(TsOutput::Udp(UdpTs::new(ip, *port)?)),
            TsSink::Fifo(path) => Ok(TsOutput::Fifo(FifoWriter::new(path))),
        },
        TunerId::Tuner2 => {
            let (ip, port) = cfg.ts2_udp.clone();
            Ok(TsOutput::Udp(UdpTs::new(&ip, port)?))
        }
    }
}

fn spawn_named<F>(name: String, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(|_| Error::Thread)
}

fn bad_args(msg: impl Into<String>) -> Error {
    Error::ArgsInput(msg.into())
}

/// Parse `n[,n[,n[,n]]]` into a four-slot list, zero-filled.
fn parse_list(arg: &str, what: &str) -> Result<[u32; 4]> {
    let mut list = [0u32; 4];
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() > 4 {
        return Err(bad_args(format!("too many {} entries (max 4)", what)));
    }
    for (i, part) in parts.iter().enumerate() {
        list[i] = part
            .parse::<u32>()
            .map_err(|_| bad_args(format!("{} '{}' not a number", what, part)))?;
        if list[i] == 0 {
            return Err(bad_args(format!("{} entry must be non-zero", what)));
        }
    }
    Ok(list)
}

fn check_freq_list(list: &[u32; 4]) -> Result<()> {
    for &freq in list.iter().filter(|&&f| f != 0) {
        if freq > longmynd_rs::config::FREQ_MAX_KHZ {
            return Err(bad_args(format!("freq {} must be <= 2450 MHz", freq)));
        }
        if freq < longmynd_rs::config::FREQ_MIN_KHZ {
            return Err(bad_args(format!("freq {} must be >= 144 MHz", freq)));
        }
    }
    Ok(())
}

fn check_sr_list(list: &[u32; 4]) -> Result<()> {
    for &sr in list.iter().filter(|&&s| s != 0) {
        if sr > longmynd_rs::config::SR_MAX_KSPS {
            return Err(bad_args(format!("sr {} must be <= 27500 kS/s", sr)));
        }
        if sr < longmynd_rs::config::SR_MIN_KSPS {
            return Err(bad_args(format!("sr {} must be >= 33 kS/s", sr)));
        }
    }
    Ok(())
}

fn process_command_line(args: &[String]) -> Result<(Config, Option<JsonOptions>)> {
    let mut config = Config::default();
    let mut json_options = None;
    let mut polarisation_str: Option<String> = None;
    let mut ts_ip_set = false;
    let mut ts_fifo_set = false;
    let mut status_ip_set = false;
    let mut status_fifo_set = false;
    let mut pretty = false;

    let mut positionals: Vec<&str> = Vec::new();
    let mut idx = 0;
    let take = |args: &[String], idx: &mut usize, flag: &str| -> Result<String> {
        *idx += 1;
        args.get(*idx)
            .cloned()
            .ok_or_else(|| bad_args(format!("missing value for {}", flag)))
    };

    while idx < args.len() {
        match args[idx].as_str() {
            "-u" => {
                let bus = take(args, &mut idx, "-u")?;
                let addr = take(args, &mut idx, "-u")?;
                config.usb_device = (
                    bus.parse().map_err(|_| bad_args("bad USB bus"))?,
                    addr.parse().map_err(|_| bad_args("bad USB address"))?,
                );
            }
            "-U" => {
                let bus = take(args, &mut idx, "-U")?;
                let addr = take(args, &mut idx, "-U")?;
                config.usb_device2 = (
                    bus.parse().map_err(|_| bad_args("bad USB bus"))?,
                    addr.parse().map_err(|_| bad_args("bad USB address"))?,
                );
                config.dual_enabled = true;
            }
            "-d" => config.dual_enabled = true,
            "-D" => {
                config.dual_enabled = true;
                config.auto_detect_second = true;
            }
            "-i" => {
                let ip = take(args, &mut idx, "-i")?;
                let port = take(args, &mut idx, "-i")?;
                config.ts_sink =
                    TsSink::Udp(ip, port.parse().map_err(|_| bad_args("bad TS port"))?);
                ts_ip_set = true;
            }
            "-t" => {
                config.ts_sink = TsSink::Fifo(take(args, &mut idx, "-t")?);
                ts_fifo_set = true;
            }
            "-I" => {
                let ip = take(args, &mut idx, "-I")?;
                let port = take(args, &mut idx, "-I")?;
                config.status_sink = StatusSinkConfig::Udp(
                    ip,
                    port.parse().map_err(|_| bad_args("bad status port"))?,
                );
                status_ip_set = true;
            }
            "-M" => {
                let host = take(args, &mut idx, "-M")?;
                let port = take(args, &mut idx, "-M")?;
                let port: u16 = port.parse().map_err(|_| bad_args("bad MQTT port"))?;
                config.status_sink = StatusSinkConfig::Mqtt(format!("{}:{}", host, port));
            }
            "-s" => {
                config.status_sink = StatusSinkConfig::Fifo(take(args, &mut idx, "-s")?);
                status_fifo_set = true;
            }
            "-p" => polarisation_str = Some(take(args, &mut idx, "-p")?),
            "-w" => config.port_swap = true,
            "-S" => {
                let ratio = take(args, &mut idx, "-S")?;
                config.halfscan_ratio = ratio
                    .parse()
                    .map_err(|_| bad_args("bad halfscan ratio"))?;
            }
            "-r" => {
                let ms = take(args, &mut idx, "-r")?;
                config.ts_timeout_ms = ms.parse().map_err(|_| bad_args("bad TS timeout"))?;
            }
            "-b" => config.beep_enabled = true,
            "-j" => {
                let ip = take(args, &mut idx, "-j")?;
                let port = take(args, &mut idx, "-j")?;
                config.ts2_udp = (ip, port.parse().map_err(|_| bad_args("bad TS port"))?);
                config.dual_enabled = true;
            }
            "-J" => {
                let format = match take(args, &mut idx, "-J")?.as_str() {
                    "full" => JsonFormat::Full,
                    "compact" => JsonFormat::Compact,
                    "minimal" => JsonFormat::Minimal,
                    other => return Err(bad_args(format!("unknown JSON format '{}'", other))),
                };
                config.status_sink = StatusSinkConfig::Json;
                json_options = Some(JsonOptions { format, pretty: false });
            }
            "-y" => pretty = true,
            other if other.starts_with('-') => {
                return Err(bad_args(format!("unknown flag '{}'", other)));
            }
            _ => positionals.push(args[idx].as_str()),
        }
        idx += 1;
    }
    if let Some(options) = json_options.as_mut() {
        options.pretty = pretty;
    }

    if positionals.len() < 2 {
        return Err(bad_args("main frequency and main symbol rate not found"));
    }

    if !(0.0..=100.0).contains(&config.halfscan_ratio) {
        return Err(bad_args("scan width not valid"));
    }

    let freqs = parse_list(positionals[0], "frequency")?;
    let srs = parse_list(positionals[1], "symbol rate")?;
    check_freq_list(&freqs)?;
    check_sr_list(&srs)?;

    let multi = freqs[1] != 0 || srs[1] != 0;
    if multi && config.ts_timeout_ms == -1 {
        return Err(bad_args(
            "TS timeout must be enabled when multiple frequencies or symbol rates are given",
        ));
    }

    config.tuners[0].freq_khz = freqs;
    config.tuners[0].sr_ksps = srs;

    if let Some(p) = polarisation_str {
        config.tuners[0].polarisation = match p.as_str() {
            "h" | "H" => Polarisation::Horizontal18V,
            "v" | "V" => Polarisation::Vertical13V,
            _ => return Err(bad_args("polarisation voltage parameter not recognised")),
        };
    }

    if ts_ip_set && ts_fifo_set {
        return Err(bad_args("cannot set both TS FIFO and TS IP"));
    }
    if status_ip_set && status_fifo_set {
        return Err(bad_args("cannot set both status FIFO and status IP"));
    }
    if let (TsSink::Udp(ts_ip, ts_port), StatusSinkConfig::Udp(st_ip, st_port)) =
        (&config.ts_sink, &config.status_sink)
    {
        if ts_ip == st_ip && ts_port == st_port {
            return Err(bad_args("status IP/port must differ from TS IP/port"));
        }
    }
    if config.ts_timeout_ms != -1 && config.ts_timeout_ms <= 500 {
        return Err(bad_args("TS timeout, if enabled, must be > 500 ms"));
    }

    /* tuner 2 inherits tuner 1's scan lists unless it was given its own */
    if config.dual_enabled && config.tuners[1].freq_khz[0] == 0 {
        config.tuners[1].freq_khz = config.tuners[0].freq_khz;
        config.tuners[1].sr_ksps = config.tuners[0].sr_ksps;
        config.tuners[1].polarisation = config.tuners[0].polarisation;
    }

    /* everything runs off the new-config path, including first start */
    config.tuners[0].new_config = true;
    if config.dual_enabled {
        config.tuners[1].new_config = true;
    }

    echo_config(&config);
    Ok((config, json_options))
}

fn echo_config(config: &Config) {
    info!("main frequency = {} kHz", config.tuners[0].freq_khz[0]);
    for &f in config.tuners[0].freq_khz[1..].iter().filter(|&&f| f != 0) {
        info!("alternative frequency = {} kHz", f);
    }
    info!("main symbol rate = {} kS/s", config.tuners[0].sr_ksps[0]);
    for &s in config.tuners[0].sr_ksps[1..].iter().filter(|&&s| s != 0) {
        info!("alternative symbol rate = {} kS/s", s);
    }
    match &config.ts_sink {
        TsSink::Fifo(path) => info!("main TS output to FIFO {}", path),
        TsSink::Udp(ip, port) => info!("main TS output to UDP {}:{}", ip, port),
    }
    match &config.status_sink {
        StatusSinkConfig::Fifo(path) => info!("status output to FIFO {}", path),
        StatusSinkConfig::Udp(ip, port) => info!("status output to UDP {}:{}", ip, port),
        StatusSinkConfig::Mqtt(broker) => info!("status output to MQTT broker {}", broker),
        StatusSinkConfig::Json => info!("status output as JSON on stdout"),
    }
    if config.dual_enabled {
        info!(
            "dual tuner enabled, tuner 2: {} kHz at {} kS/s, TS to {}:{}",
            config.tuners[1].freq_khz[0],
            config.tuners[1].sr_ksps[0],
            config.ts2_udp.0,
            config.ts2_udp.1
        );
    }
    if config.port_swap {
        info!("NIM inputs swapped: main now refers to the BOTTOM F-type");
    }
    if config.tuners[0].polarisation.supply_enabled() {
        info!(
            "polarisation voltage supply enabled: {}",
            if config.tuners[0].polarisation.horizontal() {
                "H, 18V"
            } else {
                "V, 13V"
            }
        );
    }
    if config.ts_timeout_ms == -1 {
        info!("TS timeout disabled");
    } else {
        info!("TS timeout period = {} ms", config.ts_timeout_ms);
    }
    if config.beep_enabled {
        info!("MER beep requested (no audio backend in this build)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn minimal_invocation() {
        let (config, _) = process_command_line(&argv(&["741500", "1500"])).unwrap();
        assert_eq!(config.tuners[0].freq_khz, [741_500, 0, 0, 0]);
        assert_eq!(config.tuners[0].sr_ksps, [1500, 0, 0, 0]);
        assert!(config.tuners[0].new_config);
        assert!(!config.dual_enabled);
    }

    #[test]
    fn frequency_bounds() {
        assert!(process_command_line(&argv(&["144000", "1500"])).is_ok());
        assert!(process_command_line(&argv(&["2450000", "1500"])).is_ok());
        assert!(process_command_line(&argv(&["143999", "1500"])).is_err());
        assert!(process_command_line(&argv(&["2450001", "1500"])).is_err());
    }

    #[test]
    fn symbolrate_bounds() {
        assert!(process_command_line(&argv(&["741500", "33"])).is_ok());
        assert!(process_command_line(&argv(&["741500", "32"])).is_err());
        assert!(process_command_line(&argv(&["741500", "27500"])).is_ok());
        assert!(process_command_line(&argv(&["741500", "27501"])).is_err());
    }

    #[test]
    fn ts_timeout_bounds() {
        assert!(process_command_line(&argv(&["-r", "500", "741500", "1500"])).is_err());
        assert!(process_command_line(&argv(&["-r", "501", "741500", "1500"])).is_ok());
        assert!(process_command_line(&argv(&["-r", "-1", "741500", "1500"])).is_ok());
    }

    #[test]
    fn multiple_entries_need_timeout() {
        let result = process_command_line(&argv(&["-r", "-1", "741500,748000", "1500"]));
        assert!(result.is_err());
        let (config, _) =
            process_command_line(&argv(&["741500,748000", "1500,333"])).unwrap();
        assert_eq!(config.tuners[0].freq_khz[1], 748_000);
        assert_eq!(config.tuners[0].sr_ksps[1], 333);
    }

    #[test]
    fn conflicting_sinks_rejected() {
        assert!(process_command_line(&argv(&[
            "-i", "230.0.0.2", "1234", "-t", "pipe", "741500", "1500"
        ]))
        .is_err());
        assert!(process_command_line(&argv(&[
            "-i", "230.0.0.2", "1234", "-I", "230.0.0.2", "1234", "741500", "1500"
        ]))
        .is_err());
    }

    #[test]
    fn dual_inherits_tuner1_lists() {
        let (config, _) =
            process_command_line(&argv(&["-d", "-r", "10000", "741500,748000", "1500"])).unwrap();
        assert!(config.dual_enabled);
        assert_eq!(config.tuners[1].freq_khz, config.tuners[0].freq_khz);
        assert_eq!(config.tuners[1].sr_ksps, config.tuners[0].sr_ksps);
        assert!(config.tuners[1].new_config);
    }

    #[test]
    fn second_device_implies_dual() {
        let (config, _) =
            process_command_line(&argv(&["-U", "1", "5", "741500", "1500"])).unwrap();
        assert!(config.dual_enabled);
        assert_eq!(config.usb_device2, (1, 5));
    }

    #[test]
    fn tuner2_udp_sink() {
        let (config, _) = process_command_line(&argv(&[
            "-j", "230.0.0.3", "4321", "741500", "1500",
        ]))
        .unwrap();
        assert!(config.dual_enabled);
        assert_eq!(config.ts2_udp, ("230.0.0.3".to_string(), 4321));
    }

    #[test]
    fn polarisation_flag() {
        let (config, _) =
            process_command_line(&argv(&["-p", "h", "741500", "1500"])).unwrap();
        assert_eq!(config.tuners[0].polarisation, Polarisation::Horizontal18V);
        assert!(process_command_line(&argv(&["-p", "x", "741500", "1500"])).is_err());
    }

    #[test]
    fn halfscan_range() {
        assert!(process_command_line(&argv(&["-S", "100", "741500", "1500"])).is_ok());
        assert!(process_command_line(&argv(&["-S", "100.5", "741500", "1500"])).is_err());
    }

    #[test]
    fn json_sink_selection() {
        let (config, options) =
            process_command_line(&argv(&["-J", "compact", "-y", "741500", "1500"])).unwrap();
        assert!(matches!(config.status_sink, StatusSinkConfig::Json));
        let options = options.unwrap();
        assert_eq!(options.format, JsonFormat::Compact);
        assert!(options.pretty);
    }
}
