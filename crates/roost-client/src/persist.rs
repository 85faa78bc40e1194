//! Session persistence.
//!
//! Outstanding QoS state is written through a key/packet store so a client
//! can resume its handshakes across reconnects or process restarts. Keys
//! are `"S<id>"` for the send side (a PUBLISH awaiting PUBACK/PUBREC, or a
//! PUBREL awaiting PUBCOMP) and `"R<id>"` for the receive side (an inbound
//! QoS 2 PUBLISH held until PUBREL, then the PUBREL completion marker).
//!
//! Store failures never tear down a connection; they only reach the
//! persist callback.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use roost_core::{decode_packet, encode_packet, CodecError, Packet, ProtocolVersion};

/// Key for an outbound exchange.
pub fn send_key(packet_id: u16) -> String {
    format!("S{packet_id}")
}

/// Key for an inbound exchange.
pub fn recv_key(packet_id: u16) -> String {
    format!("R{packet_id}")
}

#[derive(Debug, Error)]
pub enum PersistError {
    /// The configured strategy refused the store.
    #[error("packet dropped by persist strategy")]
    Dropped,

    /// The key already exists and the strategy forbids replacement.
    #[error("duplicate persist key {0}")]
    Duplicate(String),

    #[error("persist i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("persist codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Behavior knobs shared by persistence backends.
#[derive(Debug, Clone)]
pub struct Strategy {
    /// Flush period for backends that coalesce writes. `None` writes
    /// through immediately.
    pub interval: Option<Duration>,
    /// Capacity bound; zero means unbounded.
    pub max_count: usize,
    /// When at capacity: reject the new store (`true`) or evict the
    /// oldest entry (`false`).
    pub drop_on_exceed: bool,
    /// Whether storing an existing key overwrites it.
    pub duplicate_replace: bool,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            interval: None,
            max_count: 0,
            drop_on_exceed: false,
            duplicate_replace: true,
        }
    }
}

/// Key-addressed packet storage.
///
/// Implementations synchronize internally; the client treats each
/// operation as atomic and may call them from several tasks at once.
pub trait PersistStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn store(&self, key: &str, packet: Packet) -> Result<(), PersistError>;

    fn load(&self, key: &str) -> Option<Packet>;

    fn delete(&self, key: &str) -> Result<(), PersistError>;

    /// Visit a snapshot of all entries; returning `false` stops the walk.
    fn range(&self, visit: &mut dyn FnMut(&str, &Packet) -> bool);
}

/// The default no-op store.
#[derive(Debug, Default)]
pub struct NonePersist;

impl PersistStore for NonePersist {
    fn name(&self) -> &'static str {
        "none"
    }

    fn store(&self, _key: &str, _packet: Packet) -> Result<(), PersistError> {
        Ok(())
    }

    fn load(&self, _key: &str) -> Option<Packet> {
        None
    }

    fn delete(&self, _key: &str) -> Result<(), PersistError> {
        Ok(())
    }

    fn range(&self, _visit: &mut dyn FnMut(&str, &Packet) -> bool) {}
}

#[derive(Debug, Default)]
struct MemInner {
    entries: HashMap<String, Packet>,
    /// Insertion order, used to pick the eviction victim.
    order: VecDeque<String>,
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemPersist {
    strategy: Strategy,
    inner: Mutex<MemInner>,
}

impl MemPersist {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            inner: Mutex::new(MemInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistStore for MemPersist {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn store(&self, key: &str, packet: Packet) -> Result<(), PersistError> {
        let mut inner = self.lock();

        if inner.entries.contains_key(key) {
            if !self.strategy.duplicate_replace {
                return Err(PersistError::Duplicate(key.to_string()));
            }
            inner.entries.insert(key.to_string(), packet);
            return Ok(());
        }

        if self.strategy.max_count > 0 && inner.entries.len() >= self.strategy.max_count {
            if self.strategy.drop_on_exceed {
                return Err(PersistError::Dropped);
            }
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(key.to_string(), packet);
        inner.order.push_back(key.to_string());
        Ok(())
    }

    fn load(&self, key: &str) -> Option<Packet> {
        self.lock().entries.get(key).cloned()
    }

    fn delete(&self, key: &str) -> Result<(), PersistError> {
        let mut inner = self.lock();
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
        Ok(())
    }

    fn range(&self, visit: &mut dyn FnMut(&str, &Packet) -> bool) {
        let snapshot: Vec<(String, Packet)> = {
            let inner = self.lock();
            inner
                .order
                .iter()
                .filter_map(|k| inner.entries.get(k).map(|p| (k.clone(), p.clone())))
                .collect()
        };
        for (key, packet) in snapshot {
            if !visit(&key, &packet) {
                break;
            }
        }
    }
}

/// All packets are stored with the newest level; the prefix byte keeps
/// the file format self-describing.
const FILE_VERSION: ProtocolVersion = ProtocolVersion::V5;

#[derive(Debug)]
struct FileInner {
    /// Keys present on disk or awaiting flush, in insertion order.
    order: VecDeque<String>,
    pending: HashMap<String, Packet>,
    last_flush: Instant,
}

/// One-file-per-key store. With `Strategy::interval` set, writes coalesce
/// in memory and reach disk when the period elapses or on [`flush`].
///
/// [`flush`]: FilePersist::flush
#[derive(Debug)]
pub struct FilePersist {
    dir: PathBuf,
    strategy: Strategy,
    inner: Mutex<FileInner>,
}

impl FilePersist {
    /// Open (and create if needed) the backing directory, indexing any
    /// entries left over from a previous run.
    pub fn new(dir: impl Into<PathBuf>, strategy: Strategy) -> Result<Self, PersistError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut order = VecDeque::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    order.push_back(name.to_string());
                }
            }
        }

        Ok(Self {
            dir,
            strategy,
            inner: Mutex::new(FileInner {
                order,
                pending: HashMap::new(),
                last_flush: Instant::now(),
            }),
        })
    }

    /// Write every coalesced entry to disk.
    pub fn flush(&self) -> Result<(), PersistError> {
        let pending: Vec<(String, Packet)> = {
            let mut inner = self.lock();
            inner.last_flush = Instant::now();
            inner.pending.drain().collect()
        };
        for (key, packet) in pending {
            self.write_file(&key, &packet)?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, FileInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn write_file(&self, key: &str, packet: &Packet) -> Result<(), PersistError> {
        let mut data = vec![FILE_VERSION.level()];
        encode_packet(packet, FILE_VERSION, &mut data)?;
        std::fs::write(self.path(key), data)?;
        Ok(())
    }

    fn read_file(&self, key: &str) -> Option<Packet> {
        let data = std::fs::read(self.path(key)).ok()?;
        let (&level, frame) = data.split_first()?;
        let version = ProtocolVersion::try_from(level).ok()?;
        match decode_packet(frame, version) {
            Ok(Some((packet, _))) => Some(packet),
            _ => None,
        }
    }

    fn flush_if_due(&self, interval: Duration) -> Result<(), PersistError> {
        let due = {
            let inner = self.lock();
            !inner.pending.is_empty() && inner.last_flush.elapsed() >= interval
        };
        if due {
            self.flush()?;
        }
        Ok(())
    }
}

impl Drop for FilePersist {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl PersistStore for FilePersist {
    fn name(&self) -> &'static str {
        "file"
    }

    fn store(&self, key: &str, packet: Packet) -> Result<(), PersistError> {
        {
            let mut inner = self.lock();

            if inner.order.contains(&key.to_string()) {
                if !self.strategy.duplicate_replace {
                    return Err(PersistError::Duplicate(key.to_string()));
                }
            } else {
                if self.strategy.max_count > 0 && inner.order.len() >= self.strategy.max_count {
                    if self.strategy.drop_on_exceed {
                        return Err(PersistError::Dropped);
                    }
                    if let Some(oldest) = inner.order.pop_front() {
                        inner.pending.remove(&oldest);
                        let _ = std::fs::remove_file(self.path(&oldest));
                    }
                }
                inner.order.push_back(key.to_string());
            }

            if self.strategy.interval.is_some() {
                inner.pending.insert(key.to_string(), packet.clone());
            }
        }

        match self.strategy.interval {
            None => self.write_file(key, &packet),
            Some(interval) => self.flush_if_due(interval),
        }
    }

    fn load(&self, key: &str) -> Option<Packet> {
        if let Some(packet) = self.lock().pending.get(key) {
            return Some(packet.clone());
        }
        self.read_file(key)
    }

    fn delete(&self, key: &str) -> Result<(), PersistError> {
        {
            let mut inner = self.lock();
            inner.pending.remove(key);
            inner.order.retain(|k| k != key);
        }
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn range(&self, visit: &mut dyn FnMut(&str, &Packet) -> bool) {
        let keys: Vec<String> = self.lock().order.iter().cloned().collect();
        for key in keys {
            if let Some(packet) = self.load(&key) {
                if !visit(&key, &packet) {
                    break;
                }
            }
        }
    }
}
