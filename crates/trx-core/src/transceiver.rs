//! The transceiver loop: pump threads, the outbound burst queue, and the
//! surface exposed to the upper layer.
//!
//! Two cooperating threads drive the radio interface. The RX pump runs
//! `drive_receive` in a tight loop, suspending in device I/O; each carved
//! burst advances the shared GSM clock by one timeslot. The TX pump
//! follows that clock with a transmit deadline held a fixed number of
//! frames ahead, draining the priority queue: bursts whose time has
//! passed are discarded, due bursts are transmitted, and unscheduled
//! slots are zero-filled so the device write cadence never starves.

use std::sync::atomic::{AtomicBool, Ordering, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use num_complex::Complex;
use tracing::{debug, error, info};

use crate::burst::{Burst, BurstQueue};
use crate::clock::RadioClock;
use crate::error::{Error, Result};
use crate::gsm_time::GsmTime;
use crate::radio_iface::{burst_len, RadioInterface};

/// How far the transmit deadline runs ahead of the radio clock, in
/// frames. Covers device transport latency plus the TX pre-roll.
const TX_LEAD_FRAMES: i32 = 3;

pub struct Transceiver {
    iface: Arc<RadioInterface>,
    tx_queue: Arc<BurstQueue>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    start_time: GsmTime,
    running: bool,
}

impl Transceiver {
    pub fn new(iface: Arc<RadioInterface>, start_time: GsmTime) -> Self {
        Self {
            iface,
            tx_queue: Arc::new(BurstQueue::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            start_time,
            running: false,
        }
    }

    /// Start the radio and spawn the RX and TX pump threads.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::Unhandled("transceiver already started".into()));
        }
        info!("starting transceiver");
        self.shutdown.store(false, Ordering::SeqCst);
        self.iface.start()?;

        let iface = self.iface.clone();
        let shutdown = self.shutdown.clone();
        let rx_handle = std::thread::Builder::new()
            .name("trx-rx".into())
            .spawn(move || {
                while !shutdown.load(Relaxed) {
                    if let Err(e) = iface.drive_receive() {
                        error!(%e, "receive pump failed, shutting down");
                        shutdown.store(true, Ordering::SeqCst);
                    }
                }
            })
            .map_err(|e| Error::Unhandled(format!("failed to spawn rx pump: {e}")))?;

        let iface = self.iface.clone();
        let queue = self.tx_queue.clone();
        let shutdown = self.shutdown.clone();
        let clock = self.iface.clock();
        let metrics = self.iface.metrics();
        let sps = self.iface.sps_tx();
        let mut deadline = self.start_time;
        let tx_handle = std::thread::Builder::new()
            .name("trx-tx".into())
            .spawn(move || {
                let filler = vec![Complex::new(0.0f32, 0.0); burst_len(0, sps)];
                while !shutdown.load(Relaxed) {
                    clock.wait();
                    let horizon = clock.get() + TX_LEAD_FRAMES;

                    while deadline < horizon && !shutdown.load(Relaxed) {
                        while let Some(stale) = queue.get_stale(deadline) {
                            metrics.bursts_stale.fetch_add(1, Relaxed);
                            debug!(time = %stale.time(), "dropping stale burst");
                        }

                        let result = match queue.get_current(deadline) {
                            Some(burst) => iface.drive_transmit(burst.samples(), false),
                            None => {
                                metrics.zero_fill_slots.fetch_add(1, Relaxed);
                                let len = burst_len(deadline.timeslot(), sps);
                                iface.drive_transmit(&filler[..len], true)
                            }
                        };
                        if let Err(e) = result {
                            error!(%e, "transmit pump failed, shutting down");
                            shutdown.store(true, Ordering::SeqCst);
                            break;
                        }

                        // A single-slot step is always within bounds.
                        let _ = deadline.inc_tn(1);
                    }
                }
            })
            .map_err(|e| Error::Unhandled(format!("failed to spawn tx pump: {e}")))?;

        self.handles.push(rx_handle);
        self.handles.push(tx_handle);
        self.running = true;
        Ok(())
    }

    /// Request shutdown, join the pumps and stop the radio.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!("stopping transceiver");
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        if let Err(e) = self.iface.stop() {
            error!(%e, "radio stop failed");
        }
        self.running = false;
    }

    /// Schedule an outbound burst for its GSM time.
    pub fn submit(&self, burst: Burst) {
        self.tx_queue.push(burst);
    }

    /// Bursts scheduled and not yet transmitted.
    pub fn pending_bursts(&self) -> usize {
        self.tx_queue.len()
    }

    /// The FIFO of received bursts.
    pub fn receive_fifo(&self) -> Receiver<Burst> {
        self.iface.receive_fifo()
    }

    /// The basestation clock.
    pub fn clock(&self) -> Arc<RadioClock> {
        self.iface.clock()
    }

    /// True once a pump has failed or shutdown was requested.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Relaxed)
    }

    pub fn tune_tx(&self, freq: f64) -> f64 {
        self.iface.tune_tx(freq)
    }

    pub fn tune_rx(&self, freq: f64) -> f64 {
        self.iface.tune_rx(freq)
    }

    pub fn set_rx_gain(&self, gain: f64) -> f64 {
        self.iface.set_rx_gain(gain)
    }

    pub fn set_power_attenuation(&self, atten: f64) {
        self.iface.set_power_attenuation(atten)
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, RateDispatch};
    use crate::driver::RefSource;
    use crate::gsm_time::HYPERFRAME;
    use crate::sim;
    use std::time::Duration;

    fn loopback_interface() -> Arc<RadioInterface> {
        let usrp = sim::find("type=b200").unwrap();
        let (device, dispatch) = Device::open(usrp, RefSource::Internal, 1).unwrap();
        assert_eq!(dispatch, RateDispatch::Normal);
        Arc::new(
            RadioInterface::new(Arc::new(device), dispatch, 3, 1, GsmTime::default()).unwrap(),
        )
    }

    #[test]
    fn test_lifecycle_and_double_start() {
        let iface = loopback_interface();
        let mut trx = Transceiver::new(iface, GsmTime::default());
        trx.start().unwrap();
        assert!(trx.start().is_err());
        trx.stop();
    }

    #[test]
    fn test_end_to_end_loopback() {
        let iface = loopback_interface();
        let mut trx = Transceiver::new(iface.clone(), GsmTime::default());
        trx.start().unwrap();

        // Drain received bursts so backpressure never stalls the clock.
        let fifo = trx.receive_fifo();
        std::thread::spawn(move || for _ in fifo.iter() {});

        // Dated in the past under modular time: discarded as stale.
        trx.submit(Burst::new(
            vec![Complex::new(0.1, 0.0); 156],
            GsmTime::new(HYPERFRAME - 100, 1).unwrap(),
        ));
        // Well ahead of the transmit deadline: transmitted when due.
        trx.submit(Burst::new(
            vec![Complex::new(0.2, 0.0); 157],
            GsmTime::new(20, 0).unwrap(),
        ));

        // The sim paces at the real GSM rate: ~4.6 ms per frame. 250 ms
        // runs the clock well past frame 20.
        std::thread::sleep(Duration::from_millis(250));

        let clock_now = trx.clock().get();
        trx.stop();

        let m = iface.metrics().snapshot();
        assert!(m.bursts_carved > 8, "carving stalled: {m:?}");
        assert!(m.zero_fill_slots > 0, "tx never zero-filled: {m:?}");
        assert_eq!(m.bursts_stale, 1);
        // The clock advanced with the carve cadence, past the scheduled
        // burst's slot.
        assert!(clock_now > GsmTime::new(20, 0).unwrap());
        // The scheduled burst was consumed from the queue.
        assert_eq!(trx.pending_bursts(), 0);
    }
}
