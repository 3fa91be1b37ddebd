use crate::catalog::MapCatalog;
use crate::compiler::ControllerSet;
use crate::game::room::{Member, Room, RoomCode};
use crate::handlers::{HandlerId, SharedRooms};
use crate::pixels::PixelConverter;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use log::{info, warn};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;

/// More than this many accepted connections from one IP inside the rolling
/// one-second window drops the next connection without a handshake.
const MAX_CONNECTS_PER_IP: u32 = 3;
const KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("keypair generation failed: {0}")]
    Keygen(#[from] rsa::Error),
}

#[derive(Debug, Default)]
struct IpRecord {
    recent: u32,
    kicked: bool,
}

/// Process-wide state: handler and room registries, the handshake keypair,
/// the translation subsystems, and per-IP admission control.
pub struct Broker {
    pub rooms: SharedRooms,
    pub converter: Arc<PixelConverter>,
    pub catalog: Arc<MapCatalog>,
    pub controllers: Arc<ControllerSet>,
    handlers: Mutex<HashSet<HandlerId>>,
    keypair: RsaPrivateKey,
    public_jwk: serde_json::Value,
    ip_records: Mutex<HashMap<String, IpRecord>>,
    active: AtomicBool,
    starting: AtomicBool,
    crashed: AtomicBool,
}

impl Broker {
    pub fn new(
        converter: Arc<PixelConverter>,
        catalog: Arc<MapCatalog>,
        controllers: Arc<ControllerSet>,
    ) -> Result<Arc<Self>, BrokerError> {
        Self::with_key_bits(converter, catalog, controllers, KEY_BITS)
    }

    /// Tests use a short key so construction stays fast; the handshake path
    /// is identical.
    pub fn with_key_bits(
        converter: Arc<PixelConverter>,
        catalog: Arc<MapCatalog>,
        controllers: Arc<ControllerSet>,
        bits: usize,
    ) -> Result<Arc<Self>, BrokerError> {
        let mut rng = rand::thread_rng();
        let keypair = RsaPrivateKey::new(&mut rng, bits)?;
        let public = keypair.to_public_key();
        let public_jwk = serde_json::json!({
            "kty": "RSA",
            "alg": "RSA-OAEP-256",
            "ext": true,
            "key_ops": ["encrypt"],
            "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        });
        info!("broker keypair ready ({bits} bits)");
        Ok(Arc::new(Broker {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            converter,
            catalog,
            controllers,
            handlers: Mutex::new(HashSet::new()),
            keypair,
            public_jwk,
            ip_records: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
            starting: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
        }))
    }

    pub fn public_jwk(&self) -> serde_json::Value {
        self.public_jwk.clone()
    }

    /// RSA-OAEP(SHA-256) decode of a base64 ciphertext from the handshake.
    pub fn decrypt_password(&self, ciphertext_b64: &str) -> Result<String, String> {
        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| e.to_string())?;
        let plain = self
            .keypair
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| e.to_string())?;
        String::from_utf8(plain).map_err(|e| e.to_string())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_starting(&self) -> bool {
        self.starting.load(Ordering::Relaxed)
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Relaxed)
    }

    pub fn set_starting(&self, starting: bool) {
        self.starting.store(starting, Ordering::Relaxed);
    }

    /// Latch the crashed flag; a crashed broker refuses new connections.
    pub fn set_crashed(&self) {
        self.crashed.store(true, Ordering::Relaxed);
    }

    /// Whether a new connection from `ip` may proceed to the handshake.
    /// Logs the "connection spam" warning once per kick window.
    pub fn admit(&self, ip: &str) -> bool {
        if !self.is_active() || self.is_crashed() {
            return false;
        }
        let mut records = self.ip_records.lock().unwrap();
        let record = records.entry(ip.to_string()).or_default();
        record.recent += 1;
        if record.recent > MAX_CONNECTS_PER_IP {
            if !record.kicked {
                warn!("connection spam from {ip}");
                record.kicked = true;
            }
            return false;
        }
        true
    }

    pub fn register_handler(&self, id: HandlerId) {
        self.handlers.lock().unwrap().insert(id);
    }

    pub fn unregister_handler(&self, id: HandlerId) {
        self.handlers.lock().unwrap().remove(&id);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    /// Create a room for `host` under a fresh unique code.
    pub fn create_room(&self, host: Member) -> RoomCode {
        let mut rooms = self.rooms.lock().unwrap();
        let mut rng = rand::thread_rng();
        let code = loop {
            let code = RoomCode::generate(&mut rng);
            if !rooms.contains_key(&code) {
                break code;
            }
        };
        rooms.insert(code.clone(), Room::create(code.clone(), host));
        code
    }

    /// 1 Hz maintenance: decay per-IP counters and clear kick windows. The
    /// task holds only a weak reference and winds down with the broker.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let weak: Weak<Broker> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let Some(broker) = weak.upgrade() else {
                    break;
                };
                if !broker.is_active() {
                    break;
                }
                let mut records = broker.ip_records.lock().unwrap();
                records.retain(|_, record| {
                    record.recent = record.recent.saturating_sub(1);
                    record.kicked = false;
                    record.recent > 0
                });
            }
        });
    }

    /// Stop accepting, tear down rooms, and let sessions drain. Session
    /// actors observe the inactive flag on their next guard tick and stop.
    pub fn close(&self) {
        if !self.active.swap(false, Ordering::Relaxed) {
            return;
        }
        info!("broker closing ({} handlers connected)", self.handler_count());
        let mut rooms = self.rooms.lock().unwrap();
        for room in rooms.values_mut() {
            room.destroy();
        }
        rooms.clear();
    }
}
