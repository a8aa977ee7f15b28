use crate::system::SliderRig;
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Drives [`SliderRig::tick`] from a background thread at a fixed period of
/// the rig's clock.
///
/// Transport failures are logged once when they start and once when the bus
/// recovers; the loop itself never stops on them. Dropping the poller stops
/// the thread and waits for the tick in progress.
pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn spawn(rig: Arc<SliderRig>, period: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("sc-poller".into())
            .spawn(move || run(&rig, period, &flag))?;
        info!("polling every {} ms", period.as_millis());
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("poller thread panicked");
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(rig: &SliderRig, period: Duration, stop: &AtomicBool) {
    let clock = rig.clock();
    let period = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);
    let mut failing = 0u64;
    let mut next = clock.now().as_nanos();
    while !stop.load(Ordering::Relaxed) {
        match rig.tick() {
            Ok(()) if failing > 0 => {
                info!("bus recovered after {failing} failed ticks");
                failing = 0;
            }
            Ok(()) => {}
            Err(e) => {
                if failing == 0 {
                    warn!("tick failed: {e}");
                } else {
                    debug!("tick failed: {e}");
                }
                failing += 1;
            }
        }

        next = next.saturating_add(period);
        let now = clock.now().as_nanos();
        if next > now {
            thread::sleep(Duration::from_nanos(next - now));
        } else {
            // overran; don't try to catch up
            next = now;
        }
    }
    debug!("poller stopped");
}
