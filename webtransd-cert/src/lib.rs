//! Rotating self-signed server certificates.
//!
//! Browsers accept a WebTransport server's certificate without a trusted CA
//! when the page supplies `serverCertificateHashes`, provided the certificate
//! uses an allowed algorithm (ECDSA P-256 here) and is valid for at most two
//! weeks. The [`CertRing`] keeps a short FIFO of such certificates so that a
//! hash handed out near the end of one certificate's life remains usable:
//! clients get every current hash via [`CertRing::enumerate_hashes`], while
//! the TLS layer serves the ring's most mature still-fresh entry from
//! [`CertRing::certificate`].

use std::collections::VecDeque;

use parking_lot::RwLock;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;

pub type Result<T> = std::result::Result<T, CertError>;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
}

/// What goes into each generated certificate.
#[derive(Debug, Clone)]
pub struct CertOptions {
    /// X.500 common name of the subject.
    pub subject_name: String,
    /// DNS names for the Subject Alternative Name extension.
    pub dns_names: Vec<String>,
    /// Validity window of each certificate. WebTransport caps this at two
    /// weeks, which is also the default.
    pub validity: Duration,
}

impl Default for CertOptions {
    fn default() -> Self {
        CertOptions {
            subject_name: "localhost".to_owned(),
            dns_names: vec!["localhost".to_owned()],
            validity: Duration::days(14),
        }
    }
}

/// SHA-256 over a certificate's DER encoding, the form browsers expect in
/// `serverCertificateHashes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateHash(pub [u8; 32]);

impl CertificateHash {
    fn of(der: &[u8]) -> Self {
        CertificateHash(Sha256::digest(der).into())
    }
}

impl std::fmt::Display for CertificateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A certificate the TLS layer can serve, together with its advertised hash.
pub struct ServerCertificate {
    pub cert: CertificateDer<'static>,
    pub key: PrivatePkcs8KeyDer<'static>,
    pub hash: CertificateHash,
}

struct RingEntry {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    hash: CertificateHash,
    expires: OffsetDateTime,
}

type NowFn = Box<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// FIFO of short-lived self-signed certificates with time-driven rotation.
///
/// Rotation keeps these invariants: at least one unexpired entry exists, no
/// expired entry is retained, and at most one entry expires later than
/// `now + validity/3`, so the ring holds at most three entries under
/// monotone time.
pub struct CertRing {
    options: CertOptions,
    now: NowFn,
    entries: RwLock<VecDeque<RingEntry>>,
}

impl CertRing {
    /// Ring over the system clock.
    pub fn new(options: CertOptions) -> CertRing {
        Self::with_time_provider(options, Box::new(OffsetDateTime::now_utc))
    }

    /// Ring over an injected clock, for tests and simulated time.
    pub fn with_time_provider(options: CertOptions, now: NowFn) -> CertRing {
        CertRing {
            options,
            now,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// SHA-256 hashes of every held certificate, oldest first, after a
    /// rotation step.
    pub fn enumerate_hashes(&self) -> Result<Vec<CertificateHash>> {
        self.rotate()?;
        Ok(self.entries.read().iter().map(|entry| entry.hash).collect())
    }

    /// The certificate the TLS layer should serve: the penultimate entry
    /// when two or more are held (the newest is pre-announced, not yet
    /// served), otherwise the sole entry. Rotation is performed first.
    pub fn certificate(&self) -> Result<ServerCertificate> {
        self.rotate()?;
        let entries = self.entries.read();
        let entry = match entries.len() {
            0 => unreachable!("rotation always leaves at least one entry"),
            1 => &entries[0],
            n => &entries[n - 2],
        };
        Ok(ServerCertificate {
            cert: CertificateDer::from(entry.cert_der.clone()),
            key: PrivatePkcs8KeyDer::from(entry.key_der.clone()),
            hash: entry.hash,
        })
    }

    /// Advance the ring to the current time: evict expired entries from the
    /// head, then append a fresh certificate when the newest one has entered
    /// the last third of its life (or the ring is empty).
    ///
    /// The fast path only takes the read lock; the condition is re-checked
    /// under the write lock so concurrent callers generate at most one
    /// certificate.
    pub fn rotate(&self) -> Result<()> {
        let now = (self.now)();
        if !self.needs_rotation(now) {
            return Ok(());
        }

        let mut entries = self.entries.write();
        while entries
            .front()
            .map_or(false, |entry| entry.expires < now)
        {
            let evicted = entries.pop_front().expect("checked front");
            debug!(hash = %evicted.hash, "evicted expired certificate");
        }
        let threshold = now + self.options.validity * 2 / 3;
        if entries
            .back()
            .map_or(true, |entry| entry.expires <= threshold)
        {
            let entry = self.generate(now)?;
            debug!(hash = %entry.hash, expires = %entry.expires, "generated certificate");
            entries.push_back(entry);
        }
        Ok(())
    }

    fn needs_rotation(&self, now: OffsetDateTime) -> bool {
        let entries = self.entries.read();
        let head_expired = entries
            .front()
            .map_or(false, |entry| entry.expires < now);
        let threshold = now + self.options.validity * 2 / 3;
        let tail_stale = entries
            .back()
            .map_or(true, |entry| entry.expires <= threshold);
        head_expired || tail_stale
    }

    fn generate(&self, now: OffsetDateTime) -> Result<RingEntry> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::new(self.options.dns_names.clone())?;
        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, self.options.subject_name.clone());
        params.distinguished_name = subject;
        params.not_before = now;
        params.not_after = now + self.options.validity;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params.self_signed(&key_pair)?;
        let cert_der = cert.der().as_ref().to_vec();
        let hash = CertificateHash::of(&cert_der);
        Ok(RingEntry {
            cert_der,
            key_der: key_pair.serialize_der(),
            hash,
            expires: now + self.options.validity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn start() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn ring_with_clock() -> (CertRing, Arc<Mutex<OffsetDateTime>>) {
        let clock = Arc::new(Mutex::new(start()));
        let now = clock.clone();
        let ring = CertRing::with_time_provider(
            CertOptions::default(),
            Box::new(move || *now.lock()),
        );
        (ring, clock)
    }

    #[test]
    fn first_rotation_creates_one_entry() {
        let (ring, _clock) = ring_with_clock();
        let hashes = ring.enumerate_hashes().unwrap();
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    fn rotation_schedule_over_a_validity_period() {
        let (ring, clock) = ring_with_clock();
        let third = Duration::days(14) / 3;

        assert_eq!(ring.enumerate_hashes().unwrap().len(), 1);
        let original = ring.enumerate_hashes().unwrap()[0];

        *clock.lock() = start() + third + Duration::seconds(1);
        let hashes = ring.enumerate_hashes().unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], original);

        *clock.lock() = start() + third * 2 - Duration::seconds(1);
        assert_eq!(ring.enumerate_hashes().unwrap().len(), 2);

        *clock.lock() = start() + third * 2 + Duration::seconds(1);
        assert_eq!(ring.enumerate_hashes().unwrap().len(), 3);

        *clock.lock() = start() + Duration::days(14) + Duration::seconds(1);
        let hashes = ring.enumerate_hashes().unwrap();
        assert_eq!(hashes.len(), 3);
        assert!(!hashes.contains(&original));
    }

    #[test]
    fn rotation_is_idempotent_at_fixed_time() {
        let (ring, _clock) = ring_with_clock();
        ring.rotate().unwrap();
        let before = ring.enumerate_hashes().unwrap();
        ring.rotate().unwrap();
        ring.rotate().unwrap();
        assert_eq!(ring.enumerate_hashes().unwrap(), before);
    }

    #[test]
    fn no_expired_entry_survives_rotation() {
        let (ring, clock) = ring_with_clock();
        ring.rotate().unwrap();
        // Jump far past everything the ring could hold.
        *clock.lock() = start() + Duration::days(365);
        let hashes = ring.enumerate_hashes().unwrap();
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    fn served_certificate_is_penultimate() {
        let (ring, clock) = ring_with_clock();
        ring.rotate().unwrap();
        let first = ring.certificate().unwrap();
        // Sole entry: served directly.
        assert_eq!(ring.enumerate_hashes().unwrap()[0], first.hash);

        *clock.lock() = start() + Duration::days(5);
        let served = ring.certificate().unwrap();
        let hashes = ring.enumerate_hashes().unwrap();
        assert_eq!(hashes.len(), 2);
        // Two entries: the older one is served while the newer hash is
        // only being advertised.
        assert_eq!(served.hash, hashes[0]);
    }

    #[test]
    fn hash_matches_der_digest() {
        let (ring, _clock) = ring_with_clock();
        let cert = ring.certificate().unwrap();
        assert_eq!(cert.hash, CertificateHash::of(cert.cert.as_ref()));
        assert!(!cert.key.secret_pkcs8_der().is_empty());
    }

    #[test]
    fn expiries_separated_by_a_third() {
        let (ring, clock) = ring_with_clock();
        let third = Duration::days(14) / 3;
        for step in 0..12 {
            // Offsets grow so eviction and generation never land on the
            // exact same instant.
            *clock.lock() = start() + third * step + Duration::seconds(30 * (i64::from(step) + 1));
            ring.rotate().unwrap();
            let entries = ring.entries.read();
            assert!(entries.len() <= 3, "ring grew past three entries");
            for pair in entries
                .iter()
                .zip(entries.iter().skip(1))
            {
                assert!(pair.1.expires - pair.0.expires >= third - Duration::seconds(60));
            }
        }
    }
}
