//! Interrupt servicing, the polling loop and the frame consumer side.
//!
//! A hardware interrupt and a poller tick both end up in
//! [`SessionState::service_interrupt`]; frames it produces go through the
//! bounded queue to a single reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, instrument, trace, warn};

use super::{DeviceSession, SessionState};
use crate::error::{Result, TofError};
use crate::events::TofEvent;
use crate::protocol::constants::*;
use crate::protocol::{AppId, ErrorCode, ErrorReport, Frame, FrameKind, ResultRecord};
use crate::transport::SensorTransport;

/// What one servicing pass found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Not running App0; acknowledged without touching the device.
    NotApp0,
    /// No interrupt pending.
    Idle,
    /// Pending bits that were cleared and handled.
    Handled { status: u8 },
}

impl<T: SensorTransport> SessionState<T> {
    /// Read, clear and dispatch the pending interrupt status.
    pub(crate) fn service_interrupt(&mut self) -> Result<ServiceOutcome> {
        if self.info.app_id != AppId::Measurement || self.closed {
            return Ok(ServiceOutcome::NotApp0);
        }

        let status = match self.transport.read_u8(REG_INT_STAT) {
            Ok(status) => status,
            Err(e) => {
                self.report_error(ErrorCode::Communication, 0, &e.to_string());
                return Err(e.into());
            }
        };
        if status == 0 {
            return Ok(ServiceOutcome::Idle);
        }
        if let Err(e) = self.transport.write_u8(REG_INT_STAT, status) {
            self.report_error(ErrorCode::Communication, 0, &e.to_string());
            return Err(e.into());
        }
        trace!(status = %format!("{status:#04x}"), "Servicing interrupt");

        if status & IRQ_RESULTS != 0 {
            self.handle_results()?;
        }
        if status & IRQ_DIAG != 0 {
            let mask = self.transport.read_u8(REG_DIAG_STATE)?;
            self.diag_state_mask = mask;
            debug!(mask = %format!("{mask:#04x}"), "Diagnostic state");
            self.enqueue_frame(Frame::new(FrameKind::Diagnostic, vec![mask]))?;
        }
        if status & IRQ_ERROR != 0 {
            let code = self.transport.read_u8(REG_APP0_STATUS)?;
            self.device_error = code;
            self.report_error(ErrorCode::Device, code, "device reported an error");
        }
        Ok(ServiceOutcome::Handled { status })
    }

    fn handle_results(&mut self) -> Result<()> {
        match self.transport.read_u8(REG_REGISTER_CONTENTS)? {
            CONTENT_RESULTS => {
                let mut raw = [0u8; RESULT_RECORD_SIZE];
                self.transport.read(REG_RESULTS, &mut raw)?;
                self.shadow[REG_RESULTS as usize..REG_RESULTS as usize + RESULT_RECORD_SIZE]
                    .copy_from_slice(&raw);
                self.last_result = ResultRecord::parse(&raw);
                self.enqueue_frame(Frame::new(FrameKind::Results, raw.to_vec()))
            }
            CONTENT_CALIBRATION => self.read_factory_calibration(),
            other => {
                debug!(contents = %format!("{other:#04x}"), "Ignoring result area contents");
                Ok(())
            }
        }
    }

    /// Queue a frame. A full queue is reset, the overflow reported, and the
    /// frame retried once.
    pub(crate) fn enqueue_frame(&mut self, frame: Frame) -> Result<()> {
        let kind = frame.kind;
        let frame = match self.queue.push(frame) {
            Ok(()) => {
                self.emit(TofEvent::FrameQueued {
                    kind,
                    pending: self.queue.len(),
                });
                return Ok(());
            }
            Err(frame) => frame,
        };

        warn!(capacity = self.queue.capacity(), "Frame queue full, resetting");
        self.queue.reset();
        self.report_error(ErrorCode::BufferOverflow, 0, "frame queue overflow");

        if self.queue.push(frame).is_err() {
            error!(kind = %kind, "Frame dropped after queue reset");
            return Err(TofError::Overflow);
        }
        self.emit(TofEvent::FrameQueued {
            kind,
            pending: self.queue.len(),
        });
        Ok(())
    }

    /// Report through the log, the observer and an error frame. The frame
    /// is dropped if the queue has no room.
    pub(crate) fn report_error(&mut self, code: ErrorCode, device_status: u8, message: &str) {
        error!(code = %code, device_status = device_status, "{message}");
        self.emit(TofEvent::Error {
            code,
            message: message.to_string(),
        });
        let report = ErrorReport {
            code,
            device_status,
        };
        if self.queue.push(report.to_frame()).is_err() {
            debug!("No room for error report");
        }
    }
}

/// Background polling loop. Dropping the handle stops it.
pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to exit.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.halt();
    }
}

impl<T: SensorTransport> DeviceSession<T> {
    /// Interrupt-line entry point. Safe to call spuriously.
    pub fn handle_interrupt(&self) -> Result<ServiceOutcome> {
        let outcome = self.with_state(|st| st.service_interrupt())?;
        if matches!(outcome, ServiceOutcome::Handled { .. }) {
            self.shared.frames.notify_all();
        }
        Ok(outcome)
    }

    /// Service the device every `period` while a capture runs.
    #[instrument(skip(self))]
    pub fn start_polling(&self, period: Duration) -> Result<Poller> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let session = self.clone();

        let handle = thread::Builder::new()
            .name("tof-poller".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    thread::park_timeout(period);
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }
                    let outcome = session.with_state(|st| {
                        if st.closed {
                            return None;
                        }
                        if !st.capture.is_active()
                            || st.transport.interrupt_asserted() == Some(false)
                        {
                            return Some(Ok(ServiceOutcome::Idle));
                        }
                        Some(st.service_interrupt())
                    });
                    match outcome {
                        None => break,
                        Some(Ok(ServiceOutcome::Handled { .. })) => {
                            session.shared.frames.notify_all();
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => debug!(error = %e, "Poll failed"),
                    }
                }
                debug!("Poller exiting");
            })?;

        Ok(Poller {
            stop,
            handle: Some(handle),
        })
    }

    /// Start the configured interrupt source: a poller in polled mode,
    /// nothing in interrupt mode.
    pub fn start_dispatcher(&self) -> Result<Option<Poller>> {
        match self.shared.config.poll_period() {
            Some(period) => self.start_polling(period).map(Some),
            None => Ok(None),
        }
    }

    /// Take the oldest queued frame without blocking.
    pub fn read_frame(&self) -> Option<Frame> {
        self.with_state(|st| st.queue.pop())
    }

    /// Take the oldest queued frame, waiting up to `timeout` for one.
    pub fn wait_frame(&self, timeout: Duration) -> Option<Frame> {
        let st = self.shared.lock();
        let (mut st, _) = self
            .shared
            .frames
            .wait_timeout_while(st, timeout, |s| s.queue.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        st.queue.pop()
    }

    pub fn pending_frames(&self) -> usize {
        self.with_state(|st| st.queue.len())
    }

    /// Take every queued frame.
    pub fn drain_frames(&self) -> Vec<Frame> {
        self.with_state(|st| std::iter::from_fn(|| st.queue.pop()).collect())
    }

    /// Number of times the queue was reset on overflow.
    pub fn queue_resets(&self) -> u64 {
        self.with_state(|st| st.queue.resets())
    }

    /// Distance in mm and confidence of the latest result, `None` before
    /// the first result.
    pub fn distance(&self) -> Result<Option<(u16, u8)>> {
        self.with_state(|st| {
            if !st.healthy {
                return Err(st.unhealthy());
            }
            Ok(st.last_result.map(|r| (r.distance_mm, r.reliability)))
        })
    }

    pub fn last_result(&self) -> Option<ResultRecord> {
        self.with_state(|st| st.last_result)
    }

    /// Die temperature in °C from the latest result.
    pub fn last_temperature(&self) -> Option<i8> {
        self.with_state(|st| st.last_result.map(|r| r.temperature))
    }

    /// Reference and object hit counts from the latest result.
    pub fn hit_counts(&self) -> Option<(u32, u32)> {
        self.with_state(|st| st.last_result.map(|r| (r.reference_hits, r.object_hits)))
    }

    pub fn diag_state_mask(&self) -> u8 {
        self.with_state(|st| st.diag_state_mask)
    }

    /// Last device-side error code.
    pub fn device_error(&self) -> u8 {
        self.with_state(|st| st.device_error)
    }
}
