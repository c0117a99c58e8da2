use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ledsense_rs::calibration::CalibrationSession;
use ledsense_rs::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "ledsense", version, about = "Stream and configure LED/ADC sensor boards over BLE")]
struct Args {
    /// JSON config file; missing keys take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the built-in simulated device instead of Bluetooth.
    #[arg(long)]
    simulate: bool,

    /// Override the discovery window, in seconds.
    #[arg(long)]
    scan_secs: Option<u64>,

    /// Do not print individual samples.
    #[arg(long, short)]
    quiet: bool,
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq)]
enum Input {
    Scan,
    Connect(usize),
    Disconnect,
    State(bool),
    Message(String),
    Timing(PathBuf),
    Calibrate(Option<usize>),
    Point(f64),
    Fit,
    Isolate(Option<u8>),
    Stats,
    Clear,
    Help,
    Quit,
}

fn parse_input(line: &str) -> Result<Input> {
    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map(|(w, r)| (w, r.trim()))
        .unwrap_or((line, ""));
    let input = match (word, rest) {
        ("scan", _) => Input::Scan,
        ("connect", n) => Input::Connect(n.parse().context("usage: connect <n>")?),
        ("disconnect", _) => Input::Disconnect,
        ("state", "on") => Input::State(true),
        ("state", "off") => Input::State(false),
        ("msg", text) if !text.is_empty() => Input::Message(text.to_owned()),
        ("timing", path) if !path.is_empty() => Input::Timing(PathBuf::from(path)),
        ("calib", "off") => Input::Calibrate(None),
        ("calib", ch) => Input::Calibrate(Some(ch.parse().context("usage: calib <ch>|off")?)),
        ("point", v) => Input::Point(v.parse().context("usage: point <value>")?),
        ("fit", _) => Input::Fit,
        ("isolate", "off") => Input::Isolate(None),
        ("isolate", pin) => Input::Isolate(Some(pin.parse().context("usage: isolate <pin>|off")?)),
        ("stats", _) => Input::Stats,
        ("clear", _) => Input::Clear,
        ("help" | "?", _) => Input::Help,
        ("q" | "quit", _) => Input::Quit,
        _ => bail!("unknown command {line:?}; type 'help'"),
    };
    Ok(input)
}

fn print_help() {
    info!("Commands (type + Enter):");
    info!("  scan                 – discover devices");
    info!("  connect <n>          – connect to device n from the last scan");
    info!("  disconnect");
    info!("  state on|off         – system on/off");
    info!("  msg <text>           – send a timestamped text message");
    info!("  timing <file.json>   – upload LED timing sequences");
    info!("  calib <ch>|off       – enter/leave calibration mode for a channel");
    info!("  point <value>        – pair a reference value with the latest reading");
    info!("  fit                  – fit a calibration curve for the active channel");
    info!("  isolate <pin>|off    – tag incoming data with an LED pin");
    info!("  stats | clear | q");
}

fn load_timing(path: &Path) -> Result<TimingConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    // Accept either {"sequences":[...]} or a bare array of entries.
    let entries = match serde_json::from_str::<TimingConfig>(&text) {
        Ok(cfg) => cfg.sequences,
        Err(_) => serde_json::from_str::<Vec<TimingEntry>>(&text)
            .with_context(|| format!("parsing {}", path.display()))?,
    };
    Ok(TimingConfig::from_entries(entries))
}

fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=ledsense_rs=debug cargo run -- --simulate
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(secs) = args.scan_secs {
        config.scan_timeout_secs = secs;
    }

    let (tx, rx) = mpsc::unbounded_channel::<SensorEvent>();
    let listener: Arc<dyn SensorListener> = Arc::new(tx);

    if args.simulate {
        info!("Using simulated device.");
        let bridge = Bridge::with_transport(SimulatedTransport::default(), config, listener)?;
        run(bridge, rx, args.quiet)
    } else {
        let bridge = Bridge::spawn(config, listener, BleTransport::new)?;
        run(bridge, rx, args.quiet)
    }
}

fn run<D: DeviceInfo>(
    bridge: Bridge<D>,
    mut rx: mpsc::UnboundedReceiver<SensorEvent>,
    quiet: bool,
) -> Result<()> {
    let session = Arc::new(Mutex::new(CalibrationSession::new()));

    // ── Event printer ─────────────────────────────────────────────────────────
    // Events arrive from the transport thread; print them from our own.
    let printer_session = Arc::clone(&session);
    let printer = std::thread::spawn(move || {
        while let Some(event) = rx.blocking_recv() {
            match event {
                SensorEvent::Sample(s) if !quiet => {
                    let led = s.source_led.map(|p| format!(" led={p}")).unwrap_or_default();
                    println!(
                        "[DATA] ch{} ts={:>8} raw={:>5} {:>8.1} {}{led}",
                        s.channel, s.device_timestamp, s.raw_value, s.measured_value, s.unit
                    );
                }
                SensorEvent::Sample(_) => {}
                SensorEvent::Calibration(c) => {
                    printer_session.lock().record_sample(&c);
                    if !quiet {
                        println!("[CALIB] ch{} raw={}", c.channel, c.raw_value);
                    }
                }
                SensorEvent::ConnectionState(state) => println!("[STATE] {state}"),
                SensorEvent::Log(line) => println!("{line}"),
            }
        }
    });

    print_help();

    let mut devices: Vec<D> = Vec::new();
    let mut calib_channel: Option<usize> = None;

    // ── Stdin command loop ────────────────────────────────────────────────────
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let input = match parse_input(line) {
            Ok(i) => i,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };

        let outcome: Result<()> = match input {
            Input::Scan => bridge.scan().wait().map_err(Into::into).map(|found| {
                for (i, d) in found.iter().enumerate() {
                    println!("  [{i}] {} ({})", d.name(), d.id());
                }
                devices = found;
            }),
            Input::Connect(n) => match devices.get(n) {
                Some(d) => bridge.connect(d.clone()).wait().map_err(Into::into),
                None => Err(anyhow!("no device {n}; run 'scan' first")),
            },
            Input::Disconnect => bridge.disconnect().wait().map_err(Into::into),
            Input::State(on) => bridge.send(Command::State(on)).wait().map_err(Into::into),
            Input::Message(text) => bridge.send(Command::Text(text)).wait().map_err(Into::into),
            Input::Timing(path) => load_timing(&path).and_then(|cfg| {
                info!(
                    "Timing: {} sequences, {} enabled, {} active LEDs",
                    cfg.sequences.len(),
                    cfg.enabled_count(),
                    cfg.active_leds()
                );
                bridge.send(Command::Timing(cfg)).wait().map_err(Into::into)
            }),
            Input::Calibrate(Some(ch)) if ch < NUM_CHANNELS => {
                let sent = bridge.send(Command::Calibration(CalibrationConfig::activate(ch))).wait();
                if sent.is_ok() {
                    calib_channel = Some(ch);
                }
                sent.map_err(Into::into)
            }
            Input::Calibrate(Some(ch)) => Err(anyhow!("channel {ch} out of range")),
            Input::Calibrate(None) => {
                calib_channel = None;
                bridge
                    .send(Command::Calibration(CalibrationConfig::deactivate()))
                    .wait()
                    .map_err(Into::into)
            }
            Input::Point(value) => match calib_channel {
                Some(ch) => session
                    .lock()
                    .add_point(ch, value)
                    .map(|n| info!("Point {n} added for channel {ch}"))
                    .map_err(Into::into),
                None => Err(anyhow!("no active calibration channel; run 'calib <ch>' first")),
            },
            Input::Fit => match calib_channel {
                Some(ch) => session.lock().fit(ch).map_err(Into::into).map(|curve| {
                    println!("  channel {ch}: {}  (R² = {:.4})", curve.formula(), curve.r_squared());
                }),
                None => Err(anyhow!("no active calibration channel; run 'calib <ch>' first")),
            },
            Input::Isolate(pin) => {
                bridge.store().set_led_isolation(pin);
                match pin {
                    Some(p) => info!("LED isolation on: tagging data with pin {p}"),
                    None => info!("LED isolation off"),
                }
                Ok(())
            }
            Input::Stats => {
                let stats = bridge.store().stats();
                println!(
                    "  state={}  messages={}  session={}  buffered={:?}  last={}",
                    bridge.state(),
                    stats.messages_received,
                    stats.session_events,
                    stats.buffered,
                    stats
                        .last_data_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".into())
                );
                Ok(())
            }
            Input::Clear => {
                bridge.store().clear();
                info!("Buffers and session log cleared");
                Ok(())
            }
            Input::Help => {
                print_help();
                Ok(())
            }
            Input::Quit => break,
        };
        if let Err(e) = outcome {
            error!("{e}");
        }
        io::stdout().flush().ok();
    }

    info!("Shutting down …");
    if bridge.is_connected() {
        if let Err(e) = bridge.disconnect().wait() {
            warn!("disconnect: {e}");
        }
    }
    bridge.shutdown();
    if printer.join().is_err() {
        error!("event printer panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_input("connect 2").unwrap(), Input::Connect(2));
        assert_eq!(parse_input("state off").unwrap(), Input::State(false));
        assert_eq!(
            parse_input("msg hello  world").unwrap(),
            Input::Message("hello  world".into())
        );
        assert_eq!(parse_input("calib off").unwrap(), Input::Calibrate(None));
        assert_eq!(parse_input("isolate 3").unwrap(), Input::Isolate(Some(3)));
        assert_eq!(parse_input("point 0.25").unwrap(), Input::Point(0.25));
        assert_eq!(parse_input("q").unwrap(), Input::Quit);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_input("connect").is_err());
        assert!(parse_input("state maybe").is_err());
        assert!(parse_input("msg").is_err());
        assert!(parse_input("frobnicate").is_err());
    }

    #[test]
    fn timing_file_accepts_both_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(
            &wrapped,
            r#"{"sequences":[{"led_pin":3,"time_open_ms":1,"time_delay_ms":2,"time_read_ms":3,"enabled":true},
                             {"led_pin":1,"time_open_ms":1,"time_delay_ms":2,"time_read_ms":3,"enabled":false,"lpo":20}]}"#,
        )
        .unwrap();
        let cfg = load_timing(&wrapped).unwrap();
        assert_eq!(cfg.sequences.iter().map(|e| e.led_pin).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(cfg.sequences[0].brightness, Some(20));

        let bare = dir.path().join("bare.json");
        std::fs::write(
            &bare,
            r#"[{"led_pin":2,"time_open_ms":1,"time_delay_ms":2,"time_read_ms":3,"enabled":true},
                {"led_pin":2,"time_open_ms":1,"time_delay_ms":2,"time_read_ms":3,"enabled":true}]"#,
        )
        .unwrap();
        assert_eq!(load_timing(&bare).unwrap().sequences.len(), 1);
    }
}
