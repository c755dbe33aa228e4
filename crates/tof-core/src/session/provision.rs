//! Firmware provisioning with ordered candidate fallback.
//!
//! Each candidate is fetched and uploaded by a loader thread while the
//! caller waits, lock released, for that candidate's completion or the
//! per-candidate timeout. The loader stamps its work with the candidate's
//! generation; a loader that finishes after its caller moved on finds a
//! newer generation and backs off.

use std::sync::PoisonError;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use super::{DeviceSession, Guard, SessionState};
use crate::error::Result;
use crate::events::TofEvent;
use crate::firmware::upload::Uploader;
use crate::firmware::{FirmwareError, UploadSummary};
use crate::protocol::AppId;
use crate::protocol::constants::IRQ_STANDARD;
use crate::transport::SensorTransport;

impl<T: SensorTransport> SessionState<T> {
    /// Download `image` through the bootloader. The info record is refreshed
    /// afterwards whether or not the upload worked.
    pub(crate) fn upload_firmware(&mut self, image: &[u8], salt: u8) -> Result<UploadSummary> {
        if self.info.app_id != AppId::Bootloader {
            self.switch_to_bootloader()?;
        }

        let mut uploader = Uploader::new(&mut self.transport, &self.timing);
        let uploaded = match uploader.init(salt) {
            Ok(()) => uploader.run(image),
            Err(e) => Err(e),
        };

        thread::sleep(self.timing.i2c_settle());
        if let Err(e) = self.wait_for_cpu_ready() {
            debug!(error = %e, "CPU not ready after download");
        }
        let refreshed = self.read_info_record();

        let summary = uploaded?;
        refreshed?;
        Ok(summary)
    }
}

impl<T: SensorTransport> DeviceSession<T> {
    /// Download firmware, trying each configured candidate in order until
    /// App0 runs.
    #[instrument(skip(self))]
    pub fn request_firmware(&self) -> Result<()> {
        let st = self.shared.lock();
        let (_st, res) = self.provision_locked(st);
        res
    }

    /// Provision with the device claimed, so starts and switches from
    /// other handles fail with `Busy` while the lock is released.
    pub(crate) fn provision_locked<'a>(&'a self, mut st: Guard<'a, T>) -> (Guard<'a, T>, Result<()>) {
        if let Err(e) = st.require_unclaimed() {
            return (st, Err(e));
        }
        st.claim = Some("firmware download");
        let (mut st, res) = self.try_candidates(st);
        st.claim = None;
        (st, res)
    }

    fn try_candidates<'a>(&'a self, mut st: Guard<'a, T>) -> (Guard<'a, T>, Result<()>) {
        let shared = &self.shared;
        let candidates = &shared.config.firmware_candidates;
        let timeout = shared.config.timing.firmware_timeout();
        let started = Instant::now();

        for (index, name) in candidates.iter().enumerate() {
            st.upload.generation += 1;
            st.upload.done = false;
            let generation = st.upload.generation;
            st.emit(TofEvent::FirmwareAttempt {
                name: name.clone(),
                index,
            });

            let loader = self.clone();
            let candidate = name.clone();
            let spawned = thread::Builder::new()
                .name("tof-fw-loader".into())
                .spawn(move || loader.load_candidate(&candidate, generation));
            if let Err(e) = spawned {
                warn!(candidate = %name, error = %e, "Failed to start firmware loader");
                continue;
            }

            let (guard, wait) = shared
                .signal
                .wait_timeout_while(st, timeout, |s| {
                    !(s.upload.done && s.upload.generation == generation)
                })
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
            if wait.timed_out() {
                error!(
                    candidate = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for firmware download"
                );
            }

            if st.info.app_id == AppId::Measurement {
                st.firmware_loaded = true;
                st.emit(TofEvent::FirmwareLoaded {
                    name: name.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                if let Err(e) = st.enable_interrupts(IRQ_STANDARD) {
                    return (st, Err(e));
                }
                return (st, Ok(()));
            }
        }

        error!(tried = candidates.len(), "No usable firmware");
        (
            st,
            Err(FirmwareError::NoUsableCandidate {
                tried: candidates.len(),
            }
            .into()),
        )
    }

    /// Loader thread body: fetch unlocked, upload locked, then signal.
    fn load_candidate(&self, name: &str, generation: u64) {
        let blob = self.shared.firmware.fetch(name);

        let mut st = self.shared.lock();
        if st.upload.generation != generation {
            warn!(candidate = %name, "Discarding stale firmware load");
            return;
        }

        match blob {
            None => {
                st.firmware_loaded = false;
                st.emit(TofEvent::FirmwareUnavailable {
                    name: name.to_string(),
                });
            }
            Some(image) => {
                let salt = self.shared.config.upload_salt;
                match st.upload_firmware(&image, salt) {
                    Ok(summary) => info!(
                        candidate = %name,
                        records = summary.records,
                        bytes = summary.bytes,
                        "Firmware downloaded"
                    ),
                    Err(e) => warn!(candidate = %name, error = %e, "Firmware download failed"),
                }
            }
        }

        st.upload.done = true;
        drop(st);
        self.shared.signal.notify_all();
    }
}
