//! `tls-server-end-point` channel binding data.
//!
//! <https://www.rfc-editor.org/rfc/rfc5929#section-4.1>
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

/// Hash function selected from a certificate signature algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndPointHash {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

const RSA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01];
const ECDSA_SHA2: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03];
const ECDSA_SHA1: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x01];
const DSA_SHA1: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x38, 0x04, 0x03];

impl EndPointHash {
    /// Map a signature algorithm object identifier (DER content bytes).
    ///
    /// MD5 and SHA-1 are replaced with SHA-256.
    fn from_oid(oid: &[u8]) -> Option<Self> {
        if oid == ECDSA_SHA1 || oid == DSA_SHA1 {
            return Some(Self::Sha256);
        }
        if let Some(&[last]) = oid.strip_prefix(RSA) {
            return match last {
                // md2, md4, md5, sha1
                0x02..=0x05 => Some(Self::Sha256),
                0x0b => Some(Self::Sha256),
                0x0c => Some(Self::Sha384),
                0x0d => Some(Self::Sha512),
                0x0e => Some(Self::Sha224),
                _ => None,
            };
        }
        if let Some(&[last]) = oid.strip_prefix(ECDSA_SHA2) {
            return match last {
                0x01 => Some(Self::Sha224),
                0x02 => Some(Self::Sha256),
                0x03 => Some(Self::Sha384),
                0x04 => Some(Self::Sha512),
                _ => None,
            };
        }
        None
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha224 => Sha224::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Hash `der` with the hash function of its own signature algorithm.
///
/// Returns `None` when the certificate cannot be parsed, or its algorithm is not
/// tied to a single known hash function.
pub(crate) fn end_point_hash(der: &[u8]) -> Option<Vec<u8>> {
    let hash = signature_hash(der)?;
    Some(hash.digest(der))
}

/// ```text
/// Certificate ::= SEQUENCE {
///     tbsCertificate       TBSCertificate,
///     signatureAlgorithm   AlgorithmIdentifier,
///     signatureValue       BIT STRING }
///
/// AlgorithmIdentifier ::= SEQUENCE {
///     algorithm            OBJECT IDENTIFIER,
///     parameters           ANY DEFINED BY algorithm OPTIONAL }
/// ```
pub(crate) fn signature_hash(der: &[u8]) -> Option<EndPointHash> {
    let (certificate, _) = element(der, SEQUENCE)?;
    let (_tbs, rest) = element(certificate, SEQUENCE)?;
    let (algorithm, _) = element(rest, SEQUENCE)?;
    let (oid, _) = element(algorithm, OBJECT_IDENTIFIER)?;
    EndPointHash::from_oid(oid)
}

const SEQUENCE: u8 = 0x30;
const OBJECT_IDENTIFIER: u8 = 0x06;

/// Split one DER element with `tag` off `input`, returning its contents and the remainder.
fn element(input: &[u8], tag: u8) -> Option<(&[u8], &[u8])> {
    let (&found, input) = input.split_first()?;
    if found != tag {
        return None;
    }
    let (&first, mut input) = input.split_first()?;
    let len = if first < 0x80 {
        first as usize
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || input.len() < n {
            return None;
        }
        let (bytes, rest) = input.split_at(n);
        input = rest;
        bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
    };
    if input.len() < len {
        return None;
    }
    Some(input.split_at(len))
}
