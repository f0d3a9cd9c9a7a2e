//! SAP announcement listener
//!
//! One background thread on the well-known AES67 SAP group. Each
//! announcement is parsed and cached; entries not refreshed within the
//! timeout are expired by a janitor pass. Discovery and deletion
//! callbacks are always invoked outside the cache mutex, so a callback
//! may call back into the listener.

use std::collections::BTreeMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Aes67Error, Result};
use crate::net::MulticastReceiver;
use crate::protocol::sap::{parse_sap, SapPacket};
use crate::protocol::sdp::{self, SdpSession};

/// Default AES67 SAP group
pub const SAP_DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 255);

/// Default SAP port
pub const SAP_DEFAULT_PORT: u16 = 9875;

/// Largest accepted SAP datagram
const SAP_MAX_DATAGRAM: usize = 65_536;

/// Entries unseen this long are expired
const ANNOUNCEMENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Minimum interval between janitor passes
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Sleep applied when the socket has no pending datagram
const IDLE_POLL: Duration = Duration::from_millis(50);

/// One cached announcement
#[derive(Debug, Clone)]
pub struct SapAnnouncement {
    /// 16-bit message id hash from the SAP header
    pub msg_id_hash: u16,
    /// Originating source address
    pub origin: Ipv4Addr,
    /// The announced session
    pub sdp: SdpSession,
    /// When the announcement was last refreshed
    pub last_seen: Instant,
}

/// Callback fired when a stream is discovered or refreshed
pub type DiscoveryCallback = Box<dyn Fn(&SdpSession) + Send + Sync>;

/// Callback fired when an announcement is deleted or expires
pub type DeletionCallback = Box<dyn Fn(u16) + Send + Sync>;

enum CacheEvent {
    Discovered(SdpSession),
    Deleted(u16),
}

/// Announcement cache keyed by (origin, message id hash)
///
/// Pure state machine, driven by the listener thread and by tests.
#[derive(Default)]
pub(crate) struct SapCache {
    entries: BTreeMap<(Ipv4Addr, u16), SapAnnouncement>,
}

impl SapCache {
    /// Apply one parsed packet; returns the event to publish
    fn apply(&mut self, packet: &SapPacket<'_>, now: Instant) -> Option<CacheEvent> {
        let key = (packet.origin, packet.msg_id_hash);

        if packet.is_delete {
            return self
                .entries
                .remove(&key)
                .map(|_| CacheEvent::Deleted(packet.msg_id_hash));
        }

        let text = std::str::from_utf8(packet.sdp).ok()?;
        let sdp = match sdp::parse(text) {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::debug!("ignoring unparseable SAP body from {}: {e}", packet.origin);
                return None;
            }
        };

        self.entries.insert(
            key,
            SapAnnouncement {
                msg_id_hash: packet.msg_id_hash,
                origin: packet.origin,
                sdp: sdp.clone(),
                last_seen: now,
            },
        );
        Some(CacheEvent::Discovered(sdp))
    }

    /// Drop entries unseen for the timeout; returns their hashes
    fn expire(&mut self, now: Instant) -> Vec<u16> {
        let mut expired = Vec::new();
        self.entries.retain(|_, entry| {
            let stale = now.duration_since(entry.last_seen) >= ANNOUNCEMENT_TIMEOUT;
            if stale {
                expired.push(entry.msg_id_hash);
            }
            !stale
        });
        expired
    }

    fn announcements(&self) -> Vec<SapAnnouncement> {
        self.entries.values().cloned().collect()
    }
}

/// SAP listener for AES67 stream discovery
pub struct SapListener {
    group: Ipv4Addr,
    port: u16,
    cache: Arc<Mutex<SapCache>>,
    discovery_callback: Arc<Mutex<Option<DiscoveryCallback>>>,
    deletion_callback: Arc<Mutex<Option<DeletionCallback>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SapListener {
    /// Create a listener on the default AES67 SAP group
    #[must_use]
    pub fn new() -> Self {
        Self {
            group: SAP_DEFAULT_GROUP,
            port: SAP_DEFAULT_PORT,
            cache: Arc::new(Mutex::new(SapCache::default())),
            discovery_callback: Arc::new(Mutex::new(None)),
            deletion_callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Override the multicast group and port before starting
    pub fn set_multicast_address(&mut self, group: Ipv4Addr, port: u16) {
        self.group = group;
        self.port = port;
    }

    /// Register the discovery callback
    ///
    /// Invoked outside the cache mutex, once per received announcement.
    pub fn set_discovery_callback(&self, callback: DiscoveryCallback) {
        *lock(&self.discovery_callback) = Some(callback);
    }

    /// Register the deletion callback
    ///
    /// Invoked outside the cache mutex for explicit deletions and for
    /// expired entries.
    pub fn set_deletion_callback(&self, callback: DeletionCallback) {
        *lock(&self.deletion_callback) = Some(callback);
    }

    /// Join the SAP group and launch the listener thread
    ///
    /// # Errors
    ///
    /// The socket error when the group cannot be joined.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let socket = MulticastReceiver::open(self.group, self.port, None).map_err(|e| {
            Aes67Error::MulticastJoin {
                group: format!("{}:{}", self.group, self.port),
                message: e.to_string(),
            }
        })?;

        self.running.store(true, Ordering::Release);

        let cache = Arc::clone(&self.cache);
        let discovery_callback = Arc::clone(&self.discovery_callback);
        let deletion_callback = Arc::clone(&self.deletion_callback);
        let running = Arc::clone(&self.running);

        let thread = std::thread::Builder::new()
            .name("sap-listener".to_string())
            .spawn(move || {
                tracing::debug!("SAP listener started");
                let mut buf = vec![0u8; SAP_MAX_DATAGRAM];
                let mut last_cleanup = Instant::now();

                while running.load(Ordering::Acquire) {
                    match socket.recv(&mut buf) {
                        Ok((len, _src)) => {
                            let now = Instant::now();
                            let event = match parse_sap(&buf[..len]) {
                                Ok(packet) => lock(&cache).apply(&packet, now),
                                Err(e) => {
                                    tracing::trace!("ignoring SAP datagram: {e}");
                                    None
                                }
                            };
                            // Fire outside the cache mutex
                            match event {
                                Some(CacheEvent::Discovered(sdp)) => {
                                    if let Some(cb) = lock(&discovery_callback).as_ref() {
                                        cb(&sdp);
                                    }
                                }
                                Some(CacheEvent::Deleted(hash)) => {
                                    if let Some(cb) = lock(&deletion_callback).as_ref() {
                                        cb(hash);
                                    }
                                }
                                None => {}
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            std::thread::sleep(IDLE_POLL);
                        }
                        Err(e) => {
                            tracing::warn!("SAP receive error: {e}");
                            std::thread::sleep(IDLE_POLL);
                        }
                    }

                    let now = Instant::now();
                    if now.duration_since(last_cleanup) >= CLEANUP_INTERVAL {
                        last_cleanup = now;
                        let expired = lock(&cache).expire(now);
                        if !expired.is_empty() {
                            tracing::debug!("expired {} SAP announcements", expired.len());
                            if let Some(cb) = lock(&deletion_callback).as_ref() {
                                for hash in expired {
                                    cb(hash);
                                }
                            }
                        }
                    }
                }
                tracing::debug!("SAP listener stopped");
            })
            .map_err(Aes67Error::Network)?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Stop the listener thread; idempotent
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Whether the listener thread is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Sessions currently present in the announcement cache
    #[must_use]
    pub fn discovered_streams(&self) -> Vec<SdpSession> {
        lock(&self.cache)
            .announcements()
            .into_iter()
            .map(|a| a.sdp)
            .collect()
    }

    /// All cached announcements with their metadata
    #[must_use]
    pub fn announcements(&self) -> Vec<SapAnnouncement> {
        lock(&self.cache).announcements()
    }

    /// Number of cached announcements
    #[must_use]
    pub fn announcement_count(&self) -> usize {
        lock(&self.cache).entries.len()
    }

    /// Drop every cached announcement
    pub fn clear_discovered(&self) {
        lock(&self.cache).entries.clear();
    }
}

impl Default for SapListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SapListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sap::build_sap;

    const ANNOUNCE_SDP: &str = "v=0\r\n\
        o=- 17 17 IN IP4 10.0.64.4\r\n\
        s=Discovered Stream\r\n\
        c=IN IP4 239.69.1.1/32\r\n\
        t=0 0\r\n\
        m=audio 5004 RTP/AVP 97\r\n\
        a=rtpmap:97 L24/48000/2\r\n";

    fn announce(hash: u16, origin: Ipv4Addr) -> Vec<u8> {
        build_sap(false, hash, origin, ANNOUNCE_SDP.as_bytes())
    }

    #[test]
    fn test_announce_populates_cache() {
        let mut cache = SapCache::default();
        let now = Instant::now();
        let data = announce(7, Ipv4Addr::new(10, 0, 64, 4));
        let packet = parse_sap(&data).unwrap();

        let event = cache.apply(&packet, now);
        assert!(matches!(event, Some(CacheEvent::Discovered(_))));
        assert_eq!(cache.entries.len(), 1);

        let entry = cache.announcements().remove(0);
        assert_eq!(entry.msg_id_hash, 7);
        assert_eq!(entry.sdp.session_name, "Discovered Stream");
    }

    #[test]
    fn test_repeat_announce_refreshes_entry() {
        let mut cache = SapCache::default();
        let origin = Ipv4Addr::new(10, 0, 64, 4);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(30);

        let data = announce(7, origin);
        let packet = parse_sap(&data).unwrap();
        cache.apply(&packet, t0);
        cache.apply(&packet, t1);

        assert_eq!(cache.entries.len(), 1);
        assert_eq!(cache.announcements()[0].last_seen, t1);
    }

    #[test]
    fn test_same_hash_different_origin_is_distinct() {
        let mut cache = SapCache::default();
        let now = Instant::now();

        let a = announce(7, Ipv4Addr::new(10, 0, 0, 1));
        let b = announce(7, Ipv4Addr::new(10, 0, 0, 2));
        cache.apply(&parse_sap(&a).unwrap(), now);
        cache.apply(&parse_sap(&b).unwrap(), now);

        assert_eq!(cache.entries.len(), 2);
    }

    #[test]
    fn test_delete_removes_and_reports() {
        let mut cache = SapCache::default();
        let origin = Ipv4Addr::new(10, 0, 64, 4);
        let now = Instant::now();

        cache.apply(&parse_sap(&announce(9, origin)).unwrap(), now);

        let delete = build_sap(true, 9, origin, ANNOUNCE_SDP.as_bytes());
        let event = cache.apply(&parse_sap(&delete).unwrap(), now);
        assert!(matches!(event, Some(CacheEvent::Deleted(9))));
        assert!(cache.entries.is_empty());

        // Deleting again is a no-op
        let event = cache.apply(&parse_sap(&delete).unwrap(), now);
        assert!(event.is_none());
    }

    #[test]
    fn test_unparseable_body_is_ignored() {
        let mut cache = SapCache::default();
        let data = build_sap(false, 1, Ipv4Addr::new(10, 0, 0, 1), b"v=0\r\nnot really sdp");
        let event = cache.apply(&parse_sap(&data).unwrap(), Instant::now());
        assert!(event.is_none());
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn test_expiration_after_timeout() {
        let mut cache = SapCache::default();
        let t0 = Instant::now();
        cache.apply(&parse_sap(&announce(3, Ipv4Addr::new(10, 0, 0, 3))).unwrap(), t0);

        // Just under the timeout: kept
        let kept = cache.expire(t0 + ANNOUNCEMENT_TIMEOUT - Duration::from_secs(1));
        assert!(kept.is_empty());
        assert_eq!(cache.entries.len(), 1);

        // Past the timeout: expired and reported
        let expired = cache.expire(t0 + ANNOUNCEMENT_TIMEOUT + Duration::from_secs(1));
        assert_eq!(expired, vec![3]);
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn test_refresh_defers_expiration() {
        let mut cache = SapCache::default();
        let origin = Ipv4Addr::new(10, 0, 0, 4);
        let t0 = Instant::now();
        let packet_data = announce(4, origin);
        let packet = parse_sap(&packet_data).unwrap();

        cache.apply(&packet, t0);
        // Refresh half-way through the window
        cache.apply(&packet, t0 + Duration::from_secs(300));

        let expired = cache.expire(t0 + ANNOUNCEMENT_TIMEOUT + Duration::from_secs(1));
        assert!(expired.is_empty());
        assert_eq!(cache.entries.len(), 1);
    }

    #[test]
    fn test_listener_queries_before_start() {
        let listener = SapListener::new();
        assert!(!listener.is_running());
        assert_eq!(listener.announcement_count(), 0);
        assert!(listener.discovered_streams().is_empty());
    }

    #[test]
    #[ignore = "requires a multicast-capable network interface"]
    fn test_listener_discovers_injected_announcement() {
        use crate::net::MulticastTransmitter;

        let group = Ipv4Addr::new(239, 254, 7, 7);
        let mut listener = SapListener::new();
        listener.set_multicast_address(group, 9876);

        let discovered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&discovered);
        listener.set_discovery_callback(Box::new(move |_| {
            flag.store(true, Ordering::Release);
        }));

        listener.start().unwrap();

        let tx = MulticastTransmitter::open(group, 9876, 1, None).unwrap();
        tx.send(&announce(42, Ipv4Addr::new(10, 0, 0, 1))).unwrap();

        std::thread::sleep(Duration::from_millis(500));
        assert!(discovered.load(Ordering::Acquire));
        assert_eq!(listener.announcement_count(), 1);
        listener.stop();
    }
}
