// Copyright 2022 The Ledgerd Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Minimal field-tagged certificates.
//!
//! The certificate grammar proper is an external concern; this module is the
//! collaborator interface the core consumes: field lookup by tag, signature
//! production, attestation against a public key, and emit-bytes. A
//! certificate is a flat sequence of `<tag:u16 BE><len:u16 BE><value>`
//! fields; the signer-id and signature fields come last, and the signature
//! (ed25519) covers every byte that precedes the signature field.

use byteorder::{BigEndian, ByteOrder};
use sodiumoxide::crypto::sign::ed25519;
use thiserror::Error;
use uuid::Uuid;

/// Certificate format version carried in every certificate.
pub const CERT_VERSION: u32 = 0x0001_0000;

/// Identifier of the one crypto suite the fleet speaks.
pub const CRYPTO_SUITE: u16 = 0x0001;

/// Certificate type of a client-submitted transaction.
pub const CERT_TYPE_TRANSACTION: Uuid = Uuid::from_bytes([
    0x52, 0xa7, 0xf0, 0xfb, 0x8a, 0x6b, 0x4d, 0x03, 0x86, 0xa5, 0x7f, 0xec, 0xa3, 0xb2, 0x3e, 0x89,
]);

/// Certificate type of a canonized transaction block.
pub const CERT_TYPE_TRANSACTION_BLOCK: Uuid = Uuid::from_bytes([
    0x73, 0x5e, 0xb3, 0x8c, 0xf5, 0x8f, 0x44, 0x5f, 0x94, 0x47, 0xcd, 0xaa, 0x27, 0x1d, 0x74, 0x05,
]);

/// Certificate type of a public entity record.
pub const CERT_TYPE_PUBLIC_ENTITY: Uuid = Uuid::from_bytes([
    0x94, 0x4d, 0x3a, 0x59, 0x98, 0x46, 0x45, 0xc2, 0x8b, 0x5d, 0x5e, 0x7c, 0xcb, 0x5a, 0x4e, 0xd5,
]);

/// Field tags.
///
/// Field semantics are external; the core references them symbolically.
pub mod field {
    /// Certificate format version (u32).
    pub const CERT_VERSION: u16 = 0x0001;
    /// Signing timestamp, seconds since the epoch (u64).
    pub const VALID_FROM: u16 = 0x0010;
    /// Crypto suite id (u16).
    pub const CRYPTO_SUITE: u16 = 0x0020;
    /// Certificate type (uuid).
    pub const CERT_TYPE: u16 = 0x0030;
    /// Signer entity id (uuid).
    pub const SIGNER_ID: u16 = 0x0050;
    /// Detached ed25519 signature over all preceding bytes.
    pub const SIGNATURE: u16 = 0x0051;
    /// Transaction id (uuid).
    pub const TRANSACTION_ID: u16 = 0x0101;
    /// Previous transaction id in the artifact chain (uuid).
    pub const PREV_TRANSACTION_ID: u16 = 0x0102;
    /// Artifact id (uuid).
    pub const ARTIFACT_ID: u16 = 0x0103;
    /// Block id (uuid).
    pub const BLOCK_ID: u16 = 0x0201;
    /// Previous block id (uuid).
    pub const PREV_BLOCK_ID: u16 = 0x0202;
    /// Signature of the previous block certificate.
    pub const PREV_BLOCK_SIGNATURE: u16 = 0x0203;
    /// Block height (u64).
    pub const BLOCK_HEIGHT: u16 = 0x0204;
    /// A wrapped transaction certificate contained in a block.
    pub const WRAPPED_TRANSACTION: u16 = 0x0210;
    /// Entity id of a public-entity certificate (uuid).
    pub const ENTITY_ID: u16 = 0x0301;
    /// Raw verification key of a public entity.
    pub const ENTITY_PUBLIC_KEY: u16 = 0x0302;
    /// A (subject, verb, object) grant: three concatenated uuids.
    pub const ENTITY_CAP_TRIPLE: u16 = 0x0303;
}

const FIELD_HEADER_LEN: usize = 4;

/// Certificate errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertError {
    /// A field header or value ran past the end of the buffer.
    #[error("certificate is truncated")]
    Truncated,
    /// A required field is absent.
    #[error("required field {0:#06x} is missing")]
    MissingField(u16),
    /// A field value has the wrong width for its type.
    #[error("field {0:#06x} has an invalid size")]
    BadFieldSize(u16),
    /// A field value exceeds the per-field width limit.
    #[error("field {0:#06x} value is too large")]
    FieldTooLarge(u16),
    /// The signature field is absent.
    #[error("certificate is unsigned")]
    Unsigned,
    /// Signature verification failed.
    #[error("certificate signature does not verify")]
    BadSignature,
}

/// Incremental certificate builder.
///
/// Fields are appended in call order; [`sign`](Self::sign) appends the
/// signer-id and signature fields and emits the final bytes.
#[derive(Debug, Default)]
pub struct CertificateBuilder {
    buf: Vec<u8>,
}

impl CertificateBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a u16 field.
    pub fn add_u16(&mut self, tag: u16, value: u16) -> &mut Self {
        let mut raw = [0_u8; 2];
        BigEndian::write_u16(&mut raw, value);
        self.add_bytes(tag, &raw)
    }

    /// Appends a u32 field.
    pub fn add_u32(&mut self, tag: u16, value: u32) -> &mut Self {
        let mut raw = [0_u8; 4];
        BigEndian::write_u32(&mut raw, value);
        self.add_bytes(tag, &raw)
    }

    /// Appends a u64 field.
    pub fn add_u64(&mut self, tag: u16, value: u64) -> &mut Self {
        let mut raw = [0_u8; 8];
        BigEndian::write_u64(&mut raw, value);
        self.add_bytes(tag, &raw)
    }

    /// Appends a uuid field.
    pub fn add_uuid(&mut self, tag: u16, value: &Uuid) -> &mut Self {
        self.add_bytes(tag, value.as_bytes())
    }

    /// Appends an opaque field.
    ///
    /// # Panics
    ///
    /// Panics if `value` exceeds the 16-bit field width; callers size wrapped
    /// certificates below that bound.
    pub fn add_bytes(&mut self, tag: u16, value: &[u8]) -> &mut Self {
        assert!(value.len() <= u16::max_value() as usize);
        let mut header = [0_u8; FIELD_HEADER_LEN];
        BigEndian::write_u16(&mut header[0..2], tag);
        BigEndian::write_u16(&mut header[2..4], value.len() as u16);
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(value);
        self
    }

    /// Appends the signer id, signs every byte so far, appends the signature
    /// and emits the certificate.
    pub fn sign(mut self, signer_id: &Uuid, key: &ed25519::SecretKey) -> Vec<u8> {
        self.add_uuid(field::SIGNER_ID, signer_id);
        let signature = ed25519::sign_detached(&self.buf, key);
        self.add_bytes(field::SIGNATURE, signature.as_ref());
        self.buf
    }

    /// Emits the certificate without signing. Used by tests that need a
    /// deliberately unsigned certificate.
    pub fn emit_unsigned(self) -> Vec<u8> {
        self.buf
    }
}

/// A zero-copy parsed view over certificate bytes.
#[derive(Debug, Clone, Copy)]
pub struct Certificate<'a> {
    bytes: &'a [u8],
}

impl<'a> Certificate<'a> {
    /// Parses `bytes`, validating the TLV structure.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, CertError> {
        let mut offset = 0;
        while offset < bytes.len() {
            if bytes.len() - offset < FIELD_HEADER_LEN {
                return Err(CertError::Truncated);
            }
            let len = BigEndian::read_u16(&bytes[offset + 2..offset + 4]) as usize;
            offset += FIELD_HEADER_LEN;
            if bytes.len() - offset < len {
                return Err(CertError::Truncated);
            }
            offset += len;
        }
        Ok(Self { bytes })
    }

    /// The raw certificate bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Iterates over `(tag, value)` pairs in field order.
    pub fn fields(&self) -> impl Iterator<Item = (u16, &'a [u8])> {
        FieldIter {
            bytes: self.bytes,
            offset: 0,
        }
    }

    /// The first field with the given tag.
    pub fn find(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields().find(|(t, _)| *t == tag).map(|(_, v)| v)
    }

    /// All fields with the given tag, in certificate order.
    pub fn find_all(&self, tag: u16) -> Vec<&'a [u8]> {
        self.fields()
            .filter(|(t, _)| *t == tag)
            .map(|(_, v)| v)
            .collect()
    }

    /// A required uuid field.
    pub fn get_uuid(&self, tag: u16) -> Result<Uuid, CertError> {
        let raw = self.find(tag).ok_or(CertError::MissingField(tag))?;
        Uuid::from_slice(raw).map_err(|_| CertError::BadFieldSize(tag))
    }

    /// A required u64 field.
    pub fn get_u64(&self, tag: u16) -> Result<u64, CertError> {
        let raw = self.find(tag).ok_or(CertError::MissingField(tag))?;
        if raw.len() != 8 {
            return Err(CertError::BadFieldSize(tag));
        }
        Ok(BigEndian::read_u64(raw))
    }

    /// A required u32 field.
    pub fn get_u32(&self, tag: u16) -> Result<u32, CertError> {
        let raw = self.find(tag).ok_or(CertError::MissingField(tag))?;
        if raw.len() != 4 {
            return Err(CertError::BadFieldSize(tag));
        }
        Ok(BigEndian::read_u32(raw))
    }

    /// The signer entity id.
    pub fn signer_id(&self) -> Result<Uuid, CertError> {
        self.get_uuid(field::SIGNER_ID)
    }

    /// Attests the certificate against `key`: the signature field must be
    /// present and must verify over every byte preceding it.
    pub fn attest(&self, key: &ed25519::PublicKey) -> Result<(), CertError> {
        let mut offset = 0;
        let mut signed_up_to = None;
        for (tag, value) in self.fields() {
            if tag == field::SIGNATURE {
                signed_up_to = Some((offset, value));
                break;
            }
            offset += FIELD_HEADER_LEN + value.len();
        }

        let (signed_len, raw_sig) = signed_up_to.ok_or(CertError::Unsigned)?;
        let signature = ed25519::Signature::from_slice(raw_sig)
            .ok_or(CertError::BadFieldSize(field::SIGNATURE))?;
        if ed25519::verify_detached(&signature, &self.bytes[..signed_len], key) {
            Ok(())
        } else {
            Err(CertError::BadSignature)
        }
    }
}

struct FieldIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        // Structure was validated at parse time.
        let tag = BigEndian::read_u16(&self.bytes[self.offset..self.offset + 2]);
        let len = BigEndian::read_u16(&self.bytes[self.offset + 2..self.offset + 4]) as usize;
        let start = self.offset + FIELD_HEADER_LEN;
        self.offset = start + len;
        Some((tag, &self.bytes[start..start + len]))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn keypair() -> (ed25519::PublicKey, ed25519::SecretKey) {
        sodiumoxide::init().ok();
        ed25519::gen_keypair()
    }

    fn sample_txn_cert(key: &ed25519::SecretKey, signer: &Uuid) -> Vec<u8> {
        let mut builder = CertificateBuilder::new();
        builder
            .add_u32(field::CERT_VERSION, CERT_VERSION)
            .add_u64(field::VALID_FROM, 1_650_000_000)
            .add_u16(field::CRYPTO_SUITE, CRYPTO_SUITE)
            .add_uuid(field::CERT_TYPE, &CERT_TYPE_TRANSACTION)
            .add_uuid(field::TRANSACTION_ID, &Uuid::from_bytes([0xb8; 16]))
            .add_uuid(field::PREV_TRANSACTION_ID, &Uuid::nil())
            .add_uuid(field::ARTIFACT_ID, &Uuid::from_bytes([0xf2; 16]));
        builder.sign(signer, key)
    }

    #[test]
    fn build_parse_round_trip() {
        let (_, sk) = keypair();
        let signer = Uuid::from_bytes([0x11; 16]);
        let bytes = sample_txn_cert(&sk, &signer);

        let cert = Certificate::parse(&bytes).unwrap();
        assert_eq!(cert.get_u32(field::CERT_VERSION).unwrap(), CERT_VERSION);
        assert_eq!(
            cert.get_uuid(field::CERT_TYPE).unwrap(),
            CERT_TYPE_TRANSACTION
        );
        assert_eq!(
            cert.get_uuid(field::TRANSACTION_ID).unwrap(),
            Uuid::from_bytes([0xb8; 16])
        );
        assert_eq!(cert.signer_id().unwrap(), signer);
    }

    #[test]
    fn attest_accepts_valid_signature() {
        let (pk, sk) = keypair();
        let bytes = sample_txn_cert(&sk, &Uuid::from_bytes([0x11; 16]));
        let cert = Certificate::parse(&bytes).unwrap();
        assert_eq!(cert.attest(&pk), Ok(()));
    }

    #[test]
    fn attest_rejects_tampered_field() {
        let (pk, sk) = keypair();
        let mut bytes = sample_txn_cert(&sk, &Uuid::from_bytes([0x11; 16]));
        // Flip a byte inside the transaction id value.
        bytes[55] ^= 0x01;
        let cert = Certificate::parse(&bytes).unwrap();
        assert_eq!(cert.attest(&pk), Err(CertError::BadSignature));
    }

    #[test]
    fn attest_rejects_wrong_key() {
        let (_, sk) = keypair();
        let (other_pk, _) = keypair();
        let bytes = sample_txn_cert(&sk, &Uuid::from_bytes([0x11; 16]));
        let cert = Certificate::parse(&bytes).unwrap();
        assert_eq!(cert.attest(&other_pk), Err(CertError::BadSignature));
    }

    #[test]
    fn unsigned_certificate_is_rejected() {
        let mut builder = CertificateBuilder::new();
        builder.add_u32(field::CERT_VERSION, CERT_VERSION);
        let bytes = builder.emit_unsigned();
        let cert = Certificate::parse(&bytes).unwrap();
        let (pk, _) = keypair();
        assert_eq!(cert.attest(&pk), Err(CertError::Unsigned));
    }

    #[test]
    fn truncated_certificate_is_rejected() {
        let (_, sk) = keypair();
        let bytes = sample_txn_cert(&sk, &Uuid::from_bytes([0x11; 16]));
        match Certificate::parse(&bytes[..bytes.len() - 3]) {
            Err(CertError::Truncated) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn wrapped_transactions_preserve_order() {
        let (_, sk) = keypair();
        let signer = Uuid::from_bytes([0x22; 16]);
        let mut builder = CertificateBuilder::new();
        builder
            .add_uuid(field::CERT_TYPE, &CERT_TYPE_TRANSACTION_BLOCK)
            .add_bytes(field::WRAPPED_TRANSACTION, b"first")
            .add_bytes(field::WRAPPED_TRANSACTION, b"second");
        let bytes = builder.sign(&signer, &sk);

        let cert = Certificate::parse(&bytes).unwrap();
        let wrapped = cert.find_all(field::WRAPPED_TRANSACTION);
        assert_eq!(wrapped, vec![&b"first"[..], &b"second"[..]]);
    }
}
