//! Multi-domain clock service
//!
//! Supplies media timestamps for the pipelines: a monotonic wall clock
//! plus a table of per-PTP-domain offsets with graceful fallback. The
//! per-domain worker here is a placeholder that asserts lock after a
//! fixed delay and publishes a constant offset; it stands in for a real
//! PTP stack and must be treated as fallback-only timing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Aes67Error, Result};
use crate::protocol::sdp::SdpSession;

/// Interval between worker status refreshes
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Worker iterations before the placeholder asserts lock (~2 s)
const LOCK_AFTER_ITERATIONS: u32 = 20;

/// Placeholder offset published once locked
const PLACEHOLDER_OFFSET_NS: i64 = 100;

/// Synchronization state of one PTP domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStatus {
    /// PTP domain number
    pub domain: i32,
    /// Whether the domain has achieved lock
    pub locked: bool,
    /// Offset from the monotonic clock in nanoseconds
    pub offset_ns: i64,
    /// IEEE 1588 clock class (248 = free-running, 6 = primary reference)
    pub clock_class: u8,
    /// IEEE 1588 clock accuracy code
    pub clock_accuracy: u8,
    /// Grandmaster identity
    pub master_id: String,
}

/// One PTP domain clock with a background synchronization worker
struct PtpClock {
    domain: i32,
    locked: Arc<AtomicBool>,
    offset_ns: Arc<AtomicI64>,
    state: Arc<Mutex<ClockQuality>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
struct ClockQuality {
    clock_class: u8,
    clock_accuracy: u8,
    master_id: String,
}

impl PtpClock {
    fn start(domain: i32) -> Self {
        let locked = Arc::new(AtomicBool::new(false));
        let offset_ns = Arc::new(AtomicI64::new(0));
        let state = Arc::new(Mutex::new(ClockQuality {
            clock_class: 248,
            clock_accuracy: 0xFE,
            master_id: String::new(),
        }));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let locked = Arc::clone(&locked);
            let offset_ns = Arc::clone(&offset_ns);
            let state = Arc::clone(&state);
            let running = Arc::clone(&running);

            std::thread::Builder::new()
                .name(format!("ptp-domain-{domain}"))
                .spawn(move || {
                    let mut iterations = 0u32;
                    while running.load(Ordering::Relaxed) {
                        iterations += 1;
                        if iterations > LOCK_AFTER_ITERATIONS && !locked.load(Ordering::Relaxed) {
                            offset_ns.store(PLACEHOLDER_OFFSET_NS, Ordering::Relaxed);
                            if let Ok(mut quality) = state.lock() {
                                quality.clock_class = 6;
                                quality.clock_accuracy = 0x20;
                                quality.master_id = "00:00:00:00:00:00:00:00".to_string();
                            }
                            locked.store(true, Ordering::Release);
                            tracing::debug!("PTP domain {domain} locked (placeholder worker)");
                        }
                        std::thread::sleep(WORKER_POLL);
                    }
                })
                .expect("spawn ptp worker")
        };

        Self {
            domain,
            locked,
            offset_ns,
            state,
            running,
            worker: Some(worker),
        }
    }

    fn status(&self) -> DomainStatus {
        let quality = self
            .state
            .lock()
            .map(|q| q.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        DomainStatus {
            domain: self.domain,
            locked: self.locked.load(Ordering::Acquire),
            offset_ns: self.offset_ns.load(Ordering::Relaxed),
            clock_class: quality.clock_class,
            clock_accuracy: quality.clock_accuracy,
            master_id: quality.master_id,
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PtpClock {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Process-wide clock service
///
/// Owns one [`PtpClock`] per active domain. Passed around as an explicit
/// `Arc` handle; there is no hidden global. Reads are atomic; a domain
/// that has never been locked contributes a zero offset.
pub struct ClockService {
    epoch: Instant,
    clocks: Mutex<BTreeMap<i32, PtpClock>>,
    enabled: AtomicBool,
}

impl ClockService {
    /// Create a clock service with PTP offsets enabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            clocks: Mutex::new(BTreeMap::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Monotonic time in nanoseconds since service creation
    ///
    /// Strictly non-decreasing between calls on the same thread.
    #[must_use]
    pub fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Globally enable or disable PTP offsets
    ///
    /// When disabled every read falls back to the monotonic clock.
    pub fn set_ptp_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether PTP offsets are globally enabled
    #[must_use]
    pub fn is_ptp_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Start (or return) the clock for `domain`
    ///
    /// # Errors
    ///
    /// Returns `ClockDomainInvalid` for domains outside 0..=127.
    pub fn ensure_domain(&self, domain: i32) -> Result<()> {
        if !(0..=127).contains(&domain) {
            return Err(Aes67Error::ClockDomainInvalid { domain });
        }
        let mut clocks = self.clocks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clocks.entry(domain).or_insert_with(|| PtpClock::start(domain));
        Ok(())
    }

    /// Stop and remove the clock for `domain`
    pub fn remove_domain(&self, domain: i32) {
        let mut clocks = self.clocks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(mut clock) = clocks.remove(&domain) {
            clock.stop();
        }
    }

    /// Domains with a running clock
    #[must_use]
    pub fn active_domains(&self) -> Vec<i32> {
        let clocks = self.clocks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clocks.keys().copied().collect()
    }

    /// Status of one domain, if its clock is running
    #[must_use]
    pub fn domain_status(&self, domain: i32) -> Option<DomainStatus> {
        let clocks = self.clocks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clocks.get(&domain).map(PtpClock::status)
    }

    /// Time for `domain` in nanoseconds
    ///
    /// Monotonic plus the domain offset while the domain is locked;
    /// plain monotonic otherwise (including unknown domains and the
    /// no-PTP domain -1).
    #[must_use]
    pub fn now_for_domain(&self, domain: i32) -> u64 {
        let now = self.now();
        if !self.is_ptp_enabled() || domain < 0 {
            return now;
        }

        let clocks = self.clocks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match clocks.get(&domain) {
            Some(clock) if clock.locked.load(Ordering::Acquire) => {
                let offset = clock.offset_ns.load(Ordering::Relaxed);
                now.saturating_add_signed(offset)
            }
            _ => now,
        }
    }

    /// Time for the domain a stream's SDP declares
    #[must_use]
    pub fn now_for_stream(&self, sdp: &SdpSession) -> u64 {
        self.now_for_domain(sdp.ptp_domain)
    }
}

impl Default for ClockService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let clock = ClockService::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_unknown_domain_reads_monotonic() {
        let clock = ClockService::new();
        let before = clock.now();
        let domain_time = clock.now_for_domain(5);
        let after = clock.now();
        assert!(domain_time >= before && domain_time <= after);
    }

    #[test]
    fn test_negative_domain_is_monotonic_fallback() {
        let clock = ClockService::new();
        let t = clock.now_for_domain(-1);
        assert!(t <= clock.now());
    }

    #[test]
    fn test_invalid_domain_rejected() {
        let clock = ClockService::new();
        assert!(matches!(
            clock.ensure_domain(128),
            Err(Aes67Error::ClockDomainInvalid { domain: 128 })
        ));
        assert!(matches!(
            clock.ensure_domain(-1),
            Err(Aes67Error::ClockDomainInvalid { domain: -1 })
        ));
    }

    #[test]
    fn test_domain_lifecycle() {
        let clock = ClockService::new();
        clock.ensure_domain(0).unwrap();
        clock.ensure_domain(3).unwrap();
        assert_eq!(clock.active_domains(), vec![0, 3]);

        let status = clock.domain_status(0).unwrap();
        assert_eq!(status.domain, 0);
        // Freshly started clocks are unlocked with zero offset
        assert!(!status.locked || status.offset_ns == PLACEHOLDER_OFFSET_NS);

        clock.remove_domain(0);
        assert_eq!(clock.active_domains(), vec![3]);
        assert!(clock.domain_status(0).is_none());
    }

    #[test]
    fn test_unlocked_domain_offset_is_zero() {
        let clock = ClockService::new();
        clock.ensure_domain(7).unwrap();
        let status = clock.domain_status(7).unwrap();
        assert!(!status.locked);
        assert_eq!(status.offset_ns, 0);
        assert_eq!(status.clock_class, 248);
    }

    #[test]
    fn test_global_disable_forces_fallback() {
        let clock = ClockService::new();
        clock.ensure_domain(1).unwrap();
        clock.set_ptp_enabled(false);
        assert!(!clock.is_ptp_enabled());

        let t = clock.now_for_domain(1);
        assert!(t <= clock.now());
    }

    #[test]
    fn test_now_for_stream_dispatches_on_domain() {
        let clock = ClockService::new();
        let mut sdp = SdpSession::default();
        sdp.ptp_domain = -1;
        let t = clock.now_for_stream(&sdp);
        assert!(t <= clock.now());
    }
}
