//! Signed over-the-air firmware updates.
//!
//! A retained directive names the image: `{url, version, md5sum,
//! signature}` (single-letter aliases accepted). The Ed25519 signature
//! covers `url || md5sum` under the compiled-in public key; nothing is
//! downloaded until it verifies. The download+install itself runs on a
//! dedicated worker thread with a generous stack, while the caller blocks
//! on a rendezvous channel with a hard deadline, since a hung transfer must
//! not keep the node awake forever.
//!
//! Failure of any stage (parse, signature, Wi-Fi, HTTP, MD5, timeout)
//! collapses to `false` and the wake cycle carries on with a normal
//! render. A torn download cannot brick the device: the partition writer
//! only activates the inactive slot after a fully verified image.

use core::fmt;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, VerifyingKey};
use log::{info, warn};
use serde::Deserialize;

use crate::config::OTA_INSTALL_TIMEOUT_SECS;

/// Worker stack: TLS plus the HTTP client need far more than the ESP-IDF
/// default pthread stack.
const WORKER_STACK_BYTES: usize = 32 * 1024;

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    MalformedDirective,
    MissingField(&'static str),
    BadSignature,
    WifiDown,
    SpawnFailed,
    HttpFailed,
    Md5Mismatch,
    PartitionWriteFailed,
    Timeout,
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedDirective => write!(f, "directive is not valid JSON"),
            Self::MissingField(field) => write!(f, "directive missing '{field}'"),
            Self::BadSignature => write!(f, "signature verification failed"),
            Self::WifiDown => write!(f, "WiFi not connected"),
            Self::SpawnFailed => write!(f, "could not spawn install worker"),
            Self::HttpFailed => write!(f, "firmware download failed"),
            Self::Md5Mismatch => write!(f, "image MD5 mismatch"),
            Self::PartitionWriteFailed => write!(f, "partition write failed"),
            Self::Timeout => write!(f, "install worker deadline exceeded"),
        }
    }
}

// ── Directive ─────────────────────────────────────────────────

/// Parsed OTA directive. All four fields are mandatory.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UpdateDirective {
    #[serde(alias = "u")]
    pub url: Option<String>,
    #[serde(alias = "v")]
    pub version: Option<String>,
    #[serde(alias = "m")]
    pub md5sum: Option<String>,
    #[serde(alias = "s")]
    pub signature: Option<String>,
}

/// What the worker needs to perform the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateJob {
    pub url: String,
    pub version: String,
    pub md5sum: String,
}

/// Parse a directive payload and enforce field presence.
pub fn parse_directive(payload: &str) -> Result<(UpdateJob, String), OtaError> {
    let raw: UpdateDirective =
        serde_json::from_str(payload).map_err(|_| OtaError::MalformedDirective)?;
    let url = raw.url.ok_or(OtaError::MissingField("url"))?;
    let version = raw.version.ok_or(OtaError::MissingField("version"))?;
    let md5sum = raw.md5sum.ok_or(OtaError::MissingField("md5sum"))?;
    let signature = raw.signature.ok_or(OtaError::MissingField("signature"))?;
    Ok((
        UpdateJob {
            url,
            version,
            md5sum,
        },
        signature,
    ))
}

/// Verify the directive's Ed25519 signature over `url || md5sum`.
///
/// The base64 signature must decode to exactly 64 bytes.
pub fn verify_signature(job: &UpdateJob, signature_b64: &str, public_key: &[u8; 32]) -> bool {
    let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
        warn!("ota: signature is not valid base64");
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        warn!("ota: signature length {} != 64", sig_bytes.len());
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        warn!("ota: compiled-in public key is not a valid Ed25519 key");
        return false;
    };

    let mut message = Vec::with_capacity(job.url.len() + job.md5sum.len());
    message.extend_from_slice(job.url.as_bytes());
    message.extend_from_slice(job.md5sum.as_bytes());

    key.verify_strict(&message, &Signature::from_bytes(&sig_array))
        .is_ok()
}

// ── Transfer port ─────────────────────────────────────────────

/// The blocking download+install primitive, run on the worker thread.
pub trait Fetcher: Send + 'static {
    fn fetch_and_install(&mut self, job: &UpdateJob) -> Result<(), OtaError>;
}

// ── Engine ────────────────────────────────────────────────────

pub struct OtaEngine {
    public_key: Option<[u8; 32]>,
}

impl OtaEngine {
    /// Engine keyed with the build-time `IDENTITYLABS_PUB_KEY`. Without a
    /// key every directive fails verification, which is the correct
    /// behaviour for unkeyed dev builds.
    pub fn from_build_key() -> Self {
        Self {
            public_key: crate::config::ota_public_key(),
        }
    }

    pub fn with_key(public_key: [u8; 32]) -> Self {
        Self {
            public_key: Some(public_key),
        }
    }

    /// Validate a directive and, if sound, run the transfer off-loop.
    /// Returns `true` only after a fully installed image; the caller is
    /// then expected to reboot.
    pub fn process_update<F: Fetcher>(&self, payload: &str, wifi_up: bool, fetcher: F) -> bool {
        self.process_update_with_deadline(
            payload,
            wifi_up,
            fetcher,
            Duration::from_secs(OTA_INSTALL_TIMEOUT_SECS),
        )
    }

    pub fn process_update_with_deadline<F: Fetcher>(
        &self,
        payload: &str,
        wifi_up: bool,
        fetcher: F,
        deadline: Duration,
    ) -> bool {
        let (job, signature) = match parse_directive(payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("ota: rejected directive: {err}");
                return false;
            }
        };
        info!("ota: directive for version {} from {}", job.version, job.url);
        log::debug!("ota: signature (base64): {}", signature);

        let Some(public_key) = &self.public_key else {
            warn!("ota: no public key compiled in, refusing update");
            return false;
        };
        if !verify_signature(&job, &signature, public_key) {
            warn!("ota: {}", OtaError::BadSignature);
            return false;
        }
        info!("ota: signature verified");

        if !wifi_up {
            warn!("ota: {}", OtaError::WifiDown);
            return false;
        }

        match run_worker(job, fetcher, deadline) {
            Ok(()) => {
                info!("ota: firmware installed");
                true
            }
            Err(err) => {
                warn!("ota: {err}");
                false
            }
        }
    }
}

/// Run the fetcher on a dedicated high-stack worker and wait for its
/// verdict. On deadline the detached worker is abandoned; the partition
/// writer guarantees a torn download never becomes bootable.
fn run_worker<F: Fetcher>(
    job: UpdateJob,
    mut fetcher: F,
    deadline: Duration,
) -> Result<(), OtaError> {
    let (done_tx, done_rx) = mpsc::sync_channel::<Result<(), OtaError>>(1);

    // The worker shares a core with the WiFi stack so flash writes do not
    // contend with network interrupts on the other core.
    #[cfg(target_os = "espidf")]
    let _ = esp_idf_hal::task::thread::ThreadSpawnConfiguration {
        stack_size: WORKER_STACK_BYTES,
        pin_to_core: Some(esp_idf_hal::cpu::Core::Core1),
        ..Default::default()
    }
    .set();

    let spawned = thread::Builder::new()
        .name("ota-install".into())
        .stack_size(WORKER_STACK_BYTES)
        .spawn(move || {
            let result = fetcher.fetch_and_install(&job);
            let _ = done_tx.send(result);
        });

    #[cfg(target_os = "espidf")]
    let _ = esp_idf_hal::task::thread::ThreadSpawnConfiguration::default().set();

    if spawned.is_err() {
        return Err(OtaError::SpawnFailed);
    }

    match done_rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(_) => Err(OtaError::Timeout),
    }
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF transfer backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub use http_fetcher::HttpFetcher;

#[cfg(target_os = "espidf")]
mod http_fetcher {
    use std::time::{Duration, Instant};

    use embedded_svc::http::client::Client as HttpClient;
    use embedded_svc::http::{Method, Status as _};
    use embedded_svc::io::Read as _;
    use esp_idf_svc::http::client::{
        Configuration as HttpConfiguration, EspHttpConnection, FollowRedirectsPolicy,
    };
    use log::{info, warn};
    use md5::{Digest as _, Md5};

    use super::{Fetcher, OtaError, UpdateJob};

    const DOWNLOAD_CHUNK: usize = 4096;
    const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

    /// Streams the image over HTTP(S) into the inactive OTA partition.
    ///
    /// TLS runs without certificate validation: the Ed25519 signature
    /// over `url || md5sum` plus the MD5 check below is the trust anchor
    /// for image integrity.
    pub struct HttpFetcher;

    impl HttpFetcher {
        fn client() -> Result<HttpClient<EspHttpConnection>, OtaError> {
            let conf = HttpConfiguration {
                timeout: Some(Duration::from_secs(30)),
                follow_redirects_policy: FollowRedirectsPolicy::FollowAll,
                crt_bundle_attach: None,
                ..Default::default()
            };
            EspHttpConnection::new(&conf)
                .map(HttpClient::wrap)
                .map_err(|err| {
                    warn!("ota: http client init failed: {err}");
                    OtaError::HttpFailed
                })
        }
    }

    impl Fetcher for HttpFetcher {
        fn fetch_and_install(&mut self, job: &UpdateJob) -> Result<(), OtaError> {
            // Probing HEAD first: the status code is the cheapest
            // diagnostic when a redirect chain or DNS entry is broken.
            {
                let mut probe = Self::client()?;
                match probe
                    .request(Method::Head, &job.url, &[])
                    .and_then(|req| req.submit())
                {
                    Ok(response) => info!("ota: HEAD probe -> HTTP {}", response.status()),
                    Err(err) => warn!("ota: HEAD probe failed: {err}"),
                }
            }

            // Fresh client for the transfer; no connection reuse.
            let mut client = Self::client()?;
            let request = client
                .request(Method::Get, &job.url, &[("x-MD5", job.md5sum.as_str())])
                .map_err(|err| {
                    warn!("ota: request build failed: {err}");
                    OtaError::HttpFailed
                })?;
            let mut response = request.submit().map_err(|err| {
                warn!("ota: download request failed: {err}");
                OtaError::HttpFailed
            })?;
            let status = response.status();
            if !(200..300).contains(&status) {
                warn!("ota: download returned HTTP {status}");
                return Err(OtaError::HttpFailed);
            }

            let mut update = esp_ota::OtaUpdate::begin().map_err(|err| {
                warn!("ota: partition begin failed: {err:?}");
                OtaError::PartitionWriteFailed
            })?;

            let mut hasher = Md5::new();
            let mut chunk = [0u8; DOWNLOAD_CHUNK];
            let mut written: usize = 0;
            let mut last_progress = Instant::now();

            loop {
                let read = response.read(&mut chunk).map_err(|err| {
                    warn!("ota: stream read failed: {err:?}");
                    OtaError::HttpFailed
                })?;
                if read == 0 {
                    break;
                }
                update.write(&chunk[..read]).map_err(|err| {
                    warn!("ota: partition write failed: {err:?}");
                    OtaError::PartitionWriteFailed
                })?;
                hasher.update(&chunk[..read]);
                written += read;

                if last_progress.elapsed() >= PROGRESS_INTERVAL {
                    info!("ota: {} bytes written", written);
                    last_progress = Instant::now();
                }
            }
            if written == 0 {
                warn!("ota: download body was empty");
                return Err(OtaError::HttpFailed);
            }

            let digest = hasher.finalize();
            let mut digest_hex = String::with_capacity(32);
            for byte in digest {
                use core::fmt::Write as _;
                let _ = write!(&mut digest_hex, "{byte:02x}");
            }
            if !digest_hex.eq_ignore_ascii_case(job.md5sum.trim()) {
                warn!(
                    "ota: MD5 mismatch (expected {}, got {digest_hex})",
                    job.md5sum
                );
                return Err(OtaError::Md5Mismatch);
            }

            let completed = update.finalize().map_err(|err| {
                warn!("ota: finalize failed: {err:?}");
                OtaError::PartitionWriteFailed
            })?;
            completed.set_as_boot_partition().map_err(|err| {
                warn!("ota: set boot partition failed: {err:?}");
                OtaError::PartitionWriteFailed
            })?;

            info!("ota: image installed ({} bytes, md5 {})", written, digest_hex);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer as _, SigningKey};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
        result: Result<(), OtaError>,
        delay: Option<Duration>,
    }

    impl Fetcher for CountingFetcher {
        fn fetch_and_install(&mut self, _job: &UpdateJob) -> Result<(), OtaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.result
        }
    }

    fn fetcher(calls: &Arc<AtomicUsize>, result: Result<(), OtaError>) -> CountingFetcher {
        CountingFetcher {
            calls: calls.clone(),
            result,
            delay: None,
        }
    }

    fn signed_directive(key: &SigningKey, url: &str, md5: &str) -> String {
        let message = format!("{url}{md5}");
        let signature = key.sign(message.as_bytes());
        let sig_b64 = BASE64.encode(signature.to_bytes());
        format!(
            r#"{{"url":"{url}","version":"1.2.3","md5sum":"{md5}","signature":"{sig_b64}"}}"#
        )
    }

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn parse_accepts_full_and_short_field_names() {
        let (job, sig) = parse_directive(
            r#"{"url":"http://x/y.bin","version":"1.0","md5sum":"abc","signature":"zzz"}"#,
        )
        .unwrap();
        assert_eq!(job.url, "http://x/y.bin");
        assert_eq!(sig, "zzz");

        let (job, _) =
            parse_directive(r#"{"u":"http://x/y.bin","v":"1.0","m":"abc","s":"zzz"}"#).unwrap();
        assert_eq!(job.version, "1.0");
        assert_eq!(job.md5sum, "abc");
    }

    #[test]
    fn parse_rejects_missing_fields_and_bad_json() {
        assert_eq!(
            parse_directive(r#"{"url":"x","version":"1","md5sum":"m"}"#),
            Err(OtaError::MissingField("signature"))
        );
        assert_eq!(
            parse_directive(r#"{"v":"1","m":"m","s":"s"}"#),
            Err(OtaError::MissingField("url"))
        );
        assert_eq!(parse_directive("nope"), Err(OtaError::MalformedDirective));
    }

    #[test]
    fn good_signature_verifies() {
        let key = test_key();
        let payload = signed_directive(&key, "https://x/y.bin", "d41d8cd98f");
        let (job, sig) = parse_directive(&payload).unwrap();
        assert!(verify_signature(&job, &sig, key.verifying_key().as_bytes()));
    }

    #[test]
    fn tampered_message_or_signature_fails() {
        let key = test_key();
        let payload = signed_directive(&key, "https://x/y.bin", "d41d8cd98f");
        let (mut job, sig) = parse_directive(&payload).unwrap();

        let pubkey = *key.verifying_key().as_bytes();
        job.url = "https://evil/y.bin".to_owned();
        assert!(!verify_signature(&job, &sig, &pubkey));

        let (job, _) = parse_directive(&payload).unwrap();
        let wrong_sig = BASE64.encode([0u8; 64]);
        assert!(!verify_signature(&job, &wrong_sig, &pubkey));
        assert!(!verify_signature(&job, "not base64 at all!", &pubkey));
        // 63 bytes decodes fine but is not a signature.
        let short = BASE64.encode([1u8; 63]);
        assert!(!verify_signature(&job, &short, &pubkey));
    }

    #[test]
    fn bad_signature_never_reaches_the_fetcher() {
        let key = test_key();
        let mut payload = signed_directive(&key, "https://x/y.bin", "abc");
        payload = payload.replace("https://x/y.bin", "https://x/z.bin");

        let calls = Arc::new(AtomicUsize::new(0));
        let engine = OtaEngine::with_key(*key.verifying_key().as_bytes());
        assert!(!engine.process_update(&payload, true, fetcher(&calls, Ok(()))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wifi_guard_blocks_the_transfer() {
        let key = test_key();
        let payload = signed_directive(&key, "https://x/y.bin", "abc");
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = OtaEngine::with_key(*key.verifying_key().as_bytes());
        assert!(!engine.process_update(&payload, false, fetcher(&calls, Ok(()))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn valid_update_runs_the_worker() {
        let key = test_key();
        let payload = signed_directive(&key, "https://x/y.bin", "abc");
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = OtaEngine::with_key(*key.verifying_key().as_bytes());
        assert!(engine.process_update(&payload, true, fetcher(&calls, Ok(()))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fetcher_failure_surfaces_as_false() {
        let key = test_key();
        let payload = signed_directive(&key, "https://x/y.bin", "abc");
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = OtaEngine::with_key(*key.verifying_key().as_bytes());
        assert!(!engine.process_update(&payload, true, fetcher(&calls, Err(OtaError::Md5Mismatch))));
    }

    #[test]
    fn deadline_abandons_a_hung_worker() {
        let key = test_key();
        let payload = signed_directive(&key, "https://x/y.bin", "abc");
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = CountingFetcher {
            calls: calls.clone(),
            result: Ok(()),
            delay: Some(Duration::from_millis(500)),
        };
        let engine = OtaEngine::with_key(*key.verifying_key().as_bytes());
        let started = std::time::Instant::now();
        assert!(!engine.process_update_with_deadline(
            &payload,
            true,
            slow,
            Duration::from_millis(50)
        ));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn engine_without_key_refuses_everything() {
        let key = test_key();
        let payload = signed_directive(&key, "https://x/y.bin", "abc");
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = OtaEngine {
            public_key: None,
        };
        assert!(!engine.process_update(&payload, true, fetcher(&calls, Ok(()))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
