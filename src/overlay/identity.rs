//! Overlay identity — SSH key loading, fingerprinting, challenge
//! signing/verification, and the deterministic self-signed certificate
//! derived from that key material.
//!
//! The certificate verifier below is modeled directly on the teacher's
//! `NoVerify` (`CLI/src/main.rs`): same `ServerCertVerifier` shape, but
//! instead of accepting every certificate it checks the presented
//! certificate's `SubjectPublicKeyInfo` against the fingerprint recorded
//! for the peer we dialed (or, for inbound connections, defers the check
//! to the application-level challenge-response handshake).

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use ssh_key::{PrivateKey, PublicKey};

use crate::error::{Result, TlscopeError};

/// SHA-256 fingerprint of an SSH public key's raw 32-byte ed25519 point, in
/// `SHA256:<base64>` form. Deliberately hashes the raw key rather than the
/// SSH wire encoding (`"ssh-ed25519"` + length prefixes) that `ssh-keygen
/// -lf` uses, so it lands on the same bytes `spki_fingerprint` extracts
/// from the peer's TLS certificate — the two need to agree for
/// [`PinnedFingerprintVerifier`] to ever match a genuine peer.
pub fn fingerprint(key: &PublicKey) -> String {
    let raw = key.key_data().ed25519().map(|k| k.0).unwrap_or([0u8; 32]);
    fingerprint_raw(&raw)
}

fn fingerprint_raw(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD_NO_PAD, digest);
    format!("SHA256:{b64}")
}

pub struct LocalIdentity {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
    pub fingerprint: String,
    pub certified_key: rcgen::CertifiedKey<rcgen::KeyPair>,
}

/// Load the configured SSH private key, deriving the matching self-signed
/// certificate used for the TLS overlay.
pub fn load_identity(path: &std::path::Path, username: &str) -> Result<LocalIdentity> {
    let private_key = PrivateKey::read_openssh_file(path).map_err(|source| TlscopeError::SshKeyLoad {
        path: path.display().to_string(),
        source,
    })?;
    let public_key = private_key.public_key().clone();
    let fp = fingerprint(&public_key);
    let certified_key = self_signed_cert(&private_key, username)?;

    Ok(LocalIdentity {
        private_key,
        public_key,
        fingerprint: fp,
        certified_key,
    })
}

/// Build an X.509 certificate whose keypair is derived from the SSH key's
/// raw bytes (ed25519 only — the only variant TLScope accepts) so the
/// same identity shows up on both the SSH and TLS sides, subject =
/// username as called for.
fn self_signed_cert(private_key: &PrivateKey, username: &str) -> Result<rcgen::CertifiedKey<rcgen::KeyPair>> {
    let ed25519 = private_key
        .key_data()
        .ed25519()
        .ok_or_else(|| TlscopeError::Config("only ed25519 SSH keys are supported".into()))?;

    let pkcs8 = ed25519_pkcs8_der(ed25519.private.as_ref(), ed25519.public.0.as_ref());
    let key_pair = rcgen::KeyPair::from_der(&pkcs8)
        .map_err(|e| TlscopeError::Config(format!("rcgen key derivation failed: {e}")))?;

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| TlscopeError::Config(format!("rcgen params failed: {e}")))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, username);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlscopeError::Config(format!("self-signed cert generation failed: {e}")))?;

    Ok(rcgen::CertifiedKey { cert, key_pair })
}

/// Wrap raw ed25519 seed+public bytes in a PKCS#8 v2 DER envelope, the
/// format `rcgen`/`ring` expect for ed25519 key material.
fn ed25519_pkcs8_der(seed: &[u8], public: &[u8]) -> Vec<u8> {
    // RFC 8410 OneAsymmetricKey, version 1 (v2): version INTEGER, the
    // ed25519 AlgorithmIdentifier, the 32-byte seed wrapped twice in an
    // OCTET STRING (CurvePrivateKey), and the public key as the [1]
    // context-tagged BIT STRING attribute.
    const VERSION_AND_ALG: [u8; 10] = [
        0x02, 0x01, 0x01, // INTEGER version = 1
        0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, // SEQUENCE { OID ed25519 }
    ];

    let mut private_key_field = vec![0x04, 0x22, 0x04, 0x20];
    private_key_field.extend_from_slice(seed);

    let mut public_key_field = vec![0xa1, 0x23, 0x03, 0x21, 0x00];
    public_key_field.extend_from_slice(public);

    let content_len = VERSION_AND_ALG.len() + private_key_field.len() + public_key_field.len();
    let mut der = Vec::with_capacity(2 + content_len);
    der.push(0x30);
    der.push(content_len as u8);
    der.extend_from_slice(&VERSION_AND_ALG);
    der.extend_from_slice(&private_key_field);
    der.extend_from_slice(&public_key_field);
    der
}

/// Certificate verifier bound to a single expected SSH-key fingerprint.
/// Used on the client side when dialing a peer whose fingerprint we
/// already learned via discovery.
#[derive(Debug)]
pub struct PinnedFingerprintVerifier {
    pub expected_fingerprint: String,
}

impl ServerCertVerifier for PinnedFingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match spki_fingerprint(end_entity) {
            Some(fp) if fp == self.expected_fingerprint => Ok(ServerCertVerified::assertion()),
            _ => Err(rustls::Error::General(
                "certificate public key does not match expected SSH fingerprint".into(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

/// Extract the certificate's SubjectPublicKeyInfo and fingerprint it the
/// same way an SSH public key is fingerprinted, so the two can be
/// compared directly.
pub fn spki_fingerprint(cert_der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref()).ok()?;
    let spki_raw = cert.public_key().raw;
    let digest = Sha256::digest(spki_raw);
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD_NO_PAD, digest);
    Some(format!("SHA256:{b64}"))
}

const SIGNATURE_NAMESPACE: &str = "tlscope-handshake";

/// Sign a challenge string with the local SSH private key, returning the
/// PEM-armored `SshSig` ("SSH SIGNATURE" block) for wire transport — the
/// same format `ssh-keygen -Y sign` produces.
pub fn sign_challenge(private_key: &PrivateKey, challenge: &str) -> Result<String> {
    let sig = private_key
        .sign(SIGNATURE_NAMESPACE, ssh_key::HashAlg::Sha256, challenge.as_bytes())
        .map_err(|e| TlscopeError::Config(format!("challenge signing failed: {e}")))?;
    sig.to_pem(ssh_key::LineEnding::LF)
        .map_err(|e| TlscopeError::Config(format!("signature encoding failed: {e}")))
}

/// Verify a PEM-armored signature against a challenge and the claimed
/// public key.
pub fn verify_challenge(public_key: &PublicKey, challenge: &str, signature_pem: &str) -> bool {
    use ssh_key::SshSig;
    let Ok(sig) = SshSig::from_pem(signature_pem) else {
        return false;
    };
    if sig.public_key() != &ssh_key::public::KeyData::from(public_key.key_data().clone()) {
        return false;
    }
    public_key
        .verify(SIGNATURE_NAMESPACE, challenge.as_bytes(), &sig)
        .is_ok()
}

/// A fresh random challenge string for the handshake, hex-encoded.
pub fn random_challenge() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn arc_verifier(expected_fingerprint: String) -> Arc<dyn ServerCertVerifier> {
    Arc::new(PinnedFingerprintVerifier { expected_fingerprint })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_challenge_is_64_hex_chars() {
        let c = random_challenge();
        assert_eq!(c.len(), 64);
        assert!(c.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_challenges_are_distinct() {
        assert_ne!(random_challenge(), random_challenge());
    }

    #[test]
    fn pkcs8_der_is_v2_with_context_tagged_public_key() {
        let seed = [7u8; 32];
        let public = [9u8; 32];
        let der = ed25519_pkcs8_der(&seed, &public);

        assert_eq!(der[0], 0x30);
        assert_eq!(der[1] as usize, der.len() - 2);
        assert_eq!(&der[2..5], &[0x02, 0x01, 0x01]); // version = 1 (v2)
        assert_eq!(&der[5..12], &[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
        assert_eq!(&der[12..16], &[0x04, 0x22, 0x04, 0x20]);
        assert_eq!(&der[16..48], &seed);
        assert_eq!(&der[48..53], &[0xa1, 0x23, 0x03, 0x21, 0x00]);
        assert_eq!(&der[53..85], &public);
        assert_eq!(der.len(), 85);
    }

    #[test]
    fn fingerprint_raw_is_deterministic_and_format_matches_ssh_keygen_style() {
        let a = fingerprint_raw(&[3u8; 32]);
        let b = fingerprint_raw(&[3u8; 32]);
        let c = fingerprint_raw(&[4u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("SHA256:"));
        assert!(!a.ends_with('='));
    }
}
