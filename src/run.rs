//! `gsm-trx run` — bring up the pipeline and journal metrics.
//!
//! Wires the loopback backend through device, radio interface and
//! transceiver, then idles until SIGINT/SIGTERM while appending one
//! metrics snapshot per interval to the configured JSONL journal.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info};

use trx_core::{sim, Device, GsmTime, RadioInterface, RefSource, Transceiver, TrxMetricsSnapshot};

use crate::config::TrxConfig;

/// Timeslots between device RX time and the GSM receive clock.
const RECEIVE_OFFSET: u8 = 3;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signo: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

#[derive(Serialize)]
struct LogEntry {
    ts: u64,
    started_at: u64,
    /// Current GSM clock reading, "TN:FN".
    clock: String,
    metrics: TrxMetricsSnapshot,
}

pub fn run(config: &TrxConfig, device_args: Option<String>) -> Result<()> {
    install_signal_handlers();

    let args = device_args.unwrap_or_else(|| config.device.args.clone());
    let reference = match config.device.reference.as_str() {
        "internal" => RefSource::Internal,
        "external" => RefSource::External,
        "gpsdo" => RefSource::Gps,
        other => bail!("unknown clock reference '{other}'"),
    };
    info!(reference = reference.as_str(), "clock reference");

    let usrp = sim::find(&args)
        .with_context(|| format!("no device found with address '{args}'"))?;
    let (device, dispatch) =
        Device::open(usrp, reference, config.device.sps).context("failed to open device")?;
    let device = Arc::new(device);

    let iface = Arc::new(
        RadioInterface::new(
            device,
            dispatch,
            RECEIVE_OFFSET,
            config.device.sps as usize,
            GsmTime::default(),
        )
        .context("failed to initialize radio interface")?,
    );

    iface.tune_tx(config.radio.tx_freq_hz);
    iface.tune_rx(config.radio.rx_freq_hz);
    if let Some(gain) = config.radio.rx_gain_db {
        iface.set_rx_gain(gain);
    }
    iface.set_power_attenuation(config.radio.power_attenuation_db);

    let mut trx = Transceiver::new(iface.clone(), GsmTime::default());
    trx.start().context("failed to start transceiver")?;

    // No GSM stack is attached on a loopback run; drain the burst FIFO
    // so backpressure never stalls the clock.
    let fifo = trx.receive_fifo();
    std::thread::spawn(move || for _ in fifo.iter() {});

    let started_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let interval = Duration::from_secs(config.log.snapshot_secs.max(1));
    let mut next_snapshot = Instant::now() + interval;
    let metrics = iface.metrics();
    let clock = trx.clock();

    info!("transceiver running");
    while !SHUTDOWN.load(Ordering::Relaxed) && !trx.shutdown_requested() {
        std::thread::sleep(Duration::from_millis(100));

        let Some(path) = config.log.snapshot_path.as_deref() else {
            continue;
        };
        if Instant::now() < next_snapshot {
            continue;
        }
        next_snapshot += interval;

        let entry = LogEntry {
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            started_at,
            clock: clock.get().to_string(),
            metrics: metrics.snapshot(),
        };
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut file) => {
                if let Ok(line) = serde_json::to_string(&entry) {
                    let _ = writeln!(file, "{line}");
                }
            }
            Err(e) => error!(%e, path, "failed to open snapshot journal"),
        }
    }

    info!("shutting down transceiver");
    trx.stop();
    Ok(())
}
