// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Digest algorithms shared by every signature format.

use {
    crate::error::CodesignError,
    bcder::{ConstOid, Oid},
    bytes::Bytes,
    std::{
        fmt::{Display, Formatter},
        str::FromStr,
    },
};

/// SHA-1 digest algorithm.
///
/// 1.3.14.3.2.26
pub const OID_SHA1: ConstOid = Oid(&[43, 14, 3, 2, 26]);

/// SHA-256 digest algorithm.
///
/// 2.16.840.1.101.3.4.2.1
pub const OID_SHA256: ConstOid = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 1]);

/// SHA-384 digest algorithm.
///
/// 2.16.840.1.101.3.4.2.2
pub const OID_SHA384: ConstOid = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 2]);

/// SHA-512 digest algorithm.
///
/// 2.16.840.1.101.3.4.2.3
pub const OID_SHA512: ConstOid = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 3]);

/// A hash function used to digest signed content.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        })
    }
}

impl FromStr for DigestAlgorithm {
    type Err = CodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha384" | "sha-384" => Ok(Self::Sha384),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(CodesignError::DigestUnknownAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<&Oid> for DigestAlgorithm {
    type Error = CodesignError;

    fn try_from(v: &Oid) -> Result<Self, Self::Error> {
        if v == &OID_SHA1 {
            Ok(Self::Sha1)
        } else if v == &OID_SHA256 {
            Ok(Self::Sha256)
        } else if v == &OID_SHA384 {
            Ok(Self::Sha384)
        } else if v == &OID_SHA512 {
            Ok(Self::Sha512)
        } else {
            Err(CodesignError::DigestUnknownAlgorithm(format!("{}", v)))
        }
    }
}

impl From<DigestAlgorithm> for Oid {
    fn from(alg: DigestAlgorithm) -> Self {
        Oid(Bytes::copy_from_slice(alg.as_oid().as_ref()))
    }
}

impl DigestAlgorithm {
    /// All known algorithms, weakest first.
    pub fn all() -> &'static [Self] {
        &[Self::Sha1, Self::Sha256, Self::Sha384, Self::Sha512]
    }

    /// The OID identifying this algorithm in ASN.1 structures.
    pub fn as_oid(&self) -> ConstOid {
        match self {
            Self::Sha1 => OID_SHA1,
            Self::Sha256 => OID_SHA256,
            Self::Sha384 => OID_SHA384,
            Self::Sha512 => OID_SHA512,
        }
    }

    /// Length in bytes of digests produced by this algorithm.
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Obtain an incremental hasher.
    pub fn as_hasher(&self) -> ring::digest::Context {
        ring::digest::Context::new(match self {
            Self::Sha1 => &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &ring::digest::SHA256,
            Self::Sha384 => &ring::digest::SHA384,
            Self::Sha512 => &ring::digest::SHA512,
        })
    }

    /// Digest a single buffer.
    pub fn digest_data(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.as_hasher();
        hasher.update(data);
        hasher.finish().as_ref().to_vec()
    }

    /// The `hashType` value recorded in Mach-O CodeDirectory headers.
    pub fn macho_hash_type(&self) -> u8 {
        match self {
            Self::Sha1 => 1,
            Self::Sha256 => 2,
            Self::Sha384 => 4,
            Self::Sha512 => 5,
        }
    }

    /// Resolve a CodeDirectory `hashType` value.
    pub fn from_macho_hash_type(v: u8) -> Result<Self, CodesignError> {
        match v {
            1 => Ok(Self::Sha1),
            2 => Ok(Self::Sha256),
            3 => Err(CodesignError::Unsupported("truncated SHA-256 code directories")),
            4 => Ok(Self::Sha384),
            5 => Ok(Self::Sha512),
            _ => Err(CodesignError::DigestUnknownAlgorithm(format!(
                "code directory hash type {}",
                v
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digests() {
        assert_eq!(
            hex::encode(DigestAlgorithm::Sha1.digest_data(b"")),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(
            hex::encode(DigestAlgorithm::Sha256.digest_data(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        for alg in DigestAlgorithm::all() {
            assert_eq!(alg.digest_data(b"abc").len(), alg.digest_len());
        }
    }

    #[test]
    fn oid_mapping() {
        for alg in DigestAlgorithm::all() {
            let oid = Oid::from(*alg);
            assert_eq!(DigestAlgorithm::try_from(&oid).unwrap(), *alg);
            assert_eq!(
                DigestAlgorithm::from_macho_hash_type(alg.macho_hash_type()).unwrap(),
                *alg
            );
            assert_eq!(
                DigestAlgorithm::from_str(&alg.to_string()).unwrap(),
                *alg
            );
        }

        assert!(DigestAlgorithm::from_macho_hash_type(3).is_err());
        assert!(DigestAlgorithm::from_str("md5").is_err());
    }
}
