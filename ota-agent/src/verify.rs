// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Final signature check of a downloaded image.

use crate::{error::VerifyError, job::SignatureAlgorithm};
use p256::{
    ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey},
    pkcs8::DecodePublicKey,
};
use sha2::{Digest, Sha256};

/// Verification result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum VerificationResult {
    // Values differ in many bits so a single glitch cannot turn one into the other.
    Valid = 0xcafebabe,
    Invalid = 0xdeadbeef,
}

/// Trusted key the images are signed with, as an uncompressed SEC1 point.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    sec1: [u8; 65],
}

impl PublicKey {
    /// Key from a PEM encoded SubjectPublicKeyInfo.
    pub fn from_pem(pem: &str) -> Result<Self, VerifyError> {
        let key = VerifyingKey::from_public_key_pem(pem).map_err(|_| VerifyError::InvalidKey)?;
        Ok(Self::from(&key))
    }

    /// Key from a compressed or uncompressed SEC1 point.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, VerifyError> {
        let key = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| VerifyError::InvalidKey)?;
        Ok(Self::from(&key))
    }

    pub fn as_sec1_bytes(&self) -> &[u8; 65] {
        &self.sec1
    }
}

impl From<&VerifyingKey> for PublicKey {
    fn from(key: &VerifyingKey) -> Self {
        let mut sec1 = [0; 65];
        sec1.copy_from_slice(key.to_encoded_point(false).as_bytes());
        Self { sec1 }
    }
}

impl core::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "PublicKey(")?;
        for b in &self.sec1[1..9] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// ECDSA P-256 verification over a SHA-256 digest.
pub trait EcdsaP256Verify {
    fn verify_ecdsa(
        &self,
        digest: [u8; 32],
        signature: [u8; 64],
        pubkey: &PublicKey,
    ) -> VerificationResult;
}

/// Software implementation on top of the `p256` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct P256Verifier;

impl EcdsaP256Verify for P256Verifier {
    fn verify_ecdsa(
        &self,
        digest: [u8; 32],
        signature: [u8; 64],
        pubkey: &PublicKey,
    ) -> VerificationResult {
        let Ok(key) = VerifyingKey::from_sec1_bytes(pubkey.as_sec1_bytes()) else {
            return VerificationResult::Invalid;
        };
        let Ok(signature) = Signature::from_slice(&signature) else {
            return VerificationResult::Invalid;
        };
        match key.verify_prehash(&digest, &signature) {
            Ok(()) => VerificationResult::Valid,
            Err(_) => VerificationResult::Invalid,
        }
    }
}

/// Proof that an image passed [`finalize`]. Only `finalize` creates one and
/// activation requires it.
#[derive(Debug)]
pub struct Verified {
    digest: [u8; 32],
}

impl Verified {
    /// SHA-256 of the verified image.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }
}

/// Decode a signature given either as DER or as raw `r || s`.
pub fn decode_signature(bytes: &[u8]) -> Result<[u8; 64], VerifyError> {
    let signature = if bytes.len() == 64 {
        Signature::from_slice(bytes)
    } else {
        Signature::from_der(bytes)
    }
    .map_err(|_| VerifyError::MalformedSignature)?;
    let mut raw = [0; 64];
    raw.copy_from_slice(&signature.to_bytes());
    Ok(raw)
}

/// Check `signature` over the image hashed into `digest` against `pubkey`.
///
/// Once the inputs are decoded, the outcome is decided only after the
/// verification ran to completion, with a control flow counter guarding the
/// path to success.
pub fn finalize(
    digest: Sha256,
    algorithm: SignatureAlgorithm,
    signature: &[u8],
    pubkey: &PublicKey,
    verifier: &impl EcdsaP256Verify,
) -> Result<Verified, VerifyError> {
    const CF1: u32 = 3;
    const CF2: u32 = 5;
    const CF3: u32 = 7;
    const CF4: u32 = 11;
    let mut control_flow_integrity_counter = 0;

    if algorithm != SignatureAlgorithm::EcdsaP256Sha256 {
        return Err(VerifyError::UnsupportedAlgorithm);
    }
    let signature = decode_signature(signature)?;
    let hash: [u8; 32] = digest.finalize().into();
    control_flow_integrity_counter += CF1;

    let result = verifier.verify_ecdsa(hash, signature, pubkey);
    control_flow_integrity_counter += CF2;

    let valid = core::hint::black_box(result == VerificationResult::Valid);
    if valid {
        control_flow_integrity_counter += CF3;
    }
    if core::hint::black_box(result as u32) == VerificationResult::Valid as u32 {
        control_flow_integrity_counter += CF4;
    }
    let cfi_counter_ptr = &control_flow_integrity_counter as *const u32;
    if valid && unsafe { cfi_counter_ptr.read_volatile() } == CF1 + CF2 + CF3 + CF4 {
        return Ok(Verified { digest: hash });
    }
    Err(VerifyError::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::{
        ecdsa::{signature::hazmat::PrehashSigner, SigningKey},
        pkcs8::{EncodePublicKey, LineEnding},
    };

    fn signing_key() -> SigningKey {
        SigningKey::from_slice(&[0x42; 32]).unwrap()
    }

    fn sign(data: &[u8]) -> alloc::vec::Vec<u8> {
        let digest = Sha256::digest(data);
        let signature: Signature = signing_key().sign_prehash(&digest).unwrap();
        signature.to_der().as_bytes().to_vec()
    }

    fn pubkey() -> PublicKey {
        PublicKey::from(signing_key().verifying_key())
    }

    fn hashed(data: &[u8]) -> Sha256 {
        let mut digest = Sha256::new();
        digest.update(data);
        digest
    }

    #[test]
    fn valid_signature() {
        let image = b"firmware image";
        let verified = finalize(
            hashed(image),
            SignatureAlgorithm::EcdsaP256Sha256,
            &sign(image),
            &pubkey(),
            &P256Verifier,
        )
        .unwrap();
        assert_eq!(verified.digest()[..], Sha256::digest(image)[..]);
    }

    #[test]
    fn signature_over_other_data() {
        let result = finalize(
            hashed(b"firmware image"),
            SignatureAlgorithm::EcdsaP256Sha256,
            &sign(b"other image"),
            &pubkey(),
            &P256Verifier,
        );
        assert_eq!(result.err(), Some(VerifyError::SignatureMismatch));
    }

    #[test]
    fn wrong_key() {
        let other = SigningKey::from_slice(&[0x17; 32]).unwrap();
        let result = finalize(
            hashed(b"firmware image"),
            SignatureAlgorithm::EcdsaP256Sha256,
            &sign(b"firmware image"),
            &PublicKey::from(other.verifying_key()),
            &P256Verifier,
        );
        assert_eq!(result.err(), Some(VerifyError::SignatureMismatch));
    }

    #[test]
    fn unsupported_and_malformed() {
        let result = finalize(
            hashed(b"x"),
            SignatureAlgorithm::RsaSha256,
            &[0; 256],
            &pubkey(),
            &P256Verifier,
        );
        assert_eq!(result.err(), Some(VerifyError::UnsupportedAlgorithm));
        let result = finalize(
            hashed(b"x"),
            SignatureAlgorithm::EcdsaP256Sha256,
            &[0x30, 0x01],
            &pubkey(),
            &P256Verifier,
        );
        assert_eq!(result.err(), Some(VerifyError::MalformedSignature));
    }

    /// A verifier answering with anything but the valid pattern is rejected.
    #[test]
    fn glitched_verifier_result() {
        struct AlwaysInvalid;
        impl EcdsaP256Verify for AlwaysInvalid {
            fn verify_ecdsa(&self, _: [u8; 32], _: [u8; 64], _: &PublicKey) -> VerificationResult {
                VerificationResult::Invalid
            }
        }
        let image = b"firmware image";
        let result = finalize(
            hashed(image),
            SignatureAlgorithm::EcdsaP256Sha256,
            &sign(image),
            &pubkey(),
            &AlwaysInvalid,
        );
        assert_eq!(result.err(), Some(VerifyError::SignatureMismatch));
    }

    #[test]
    fn key_encodings() {
        let pem = signing_key()
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let from_pem = PublicKey::from_pem(&pem).unwrap();
        assert_eq!(from_pem, pubkey());
        let compressed = signing_key().verifying_key().to_encoded_point(true);
        assert_eq!(
            PublicKey::from_sec1_bytes(compressed.as_bytes()).unwrap(),
            pubkey()
        );
        assert_eq!(
            PublicKey::from_pem("-----BEGIN PUBLIC KEY-----\n-----END PUBLIC KEY-----\n"),
            Err(VerifyError::InvalidKey)
        );
        let raw = decode_signature(&sign(b"x")).unwrap();
        assert_eq!(decode_signature(&raw).unwrap(), raw);
    }
}
