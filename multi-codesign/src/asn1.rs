// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ASN.1 types carried inside signature envelopes.
//!
//! Authenticode and script signatures encapsulate an `SpcIndirectDataContent`
//! structure describing what was signed and its digest. Mach-O signatures
//! carry CodeDirectory digests in a signed attribute instead.

use {
    crate::{digest::DigestAlgorithm, error::CodesignError},
    bcder::{
        decode::{Constructed, DecodeError, Source},
        encode::{self, PrimitiveContent, Values},
        BitString, Captured, ConstOid, Mode, OctetString, Oid, Tag,
    },
    bytes::Bytes,
    cryptographic_message_syntax::{asn1::rfc5652, SignedData},
};

/// Microsoft `SPC_INDIRECT_DATA_OBJID`.
///
/// 1.3.6.1.4.1.311.2.1.4
pub const OID_SPC_INDIRECT_DATA: ConstOid = Oid(&[43, 6, 1, 4, 1, 130, 55, 2, 1, 4]);

/// Microsoft `SPC_STATEMENT_TYPE_OBJID`.
///
/// 1.3.6.1.4.1.311.2.1.11
pub const OID_SPC_STATEMENT_TYPE: ConstOid = Oid(&[43, 6, 1, 4, 1, 130, 55, 2, 1, 11]);

/// Microsoft `SPC_SP_OPUS_INFO_OBJID`.
///
/// 1.3.6.1.4.1.311.2.1.12
pub const OID_SPC_SP_OPUS_INFO: ConstOid = Oid(&[43, 6, 1, 4, 1, 130, 55, 2, 1, 12]);

/// Microsoft `SPC_PE_IMAGE_DATA_OBJID`.
///
/// 1.3.6.1.4.1.311.2.1.15
pub const OID_SPC_PE_IMAGE_DATA: ConstOid = Oid(&[43, 6, 1, 4, 1, 130, 55, 2, 1, 15]);

/// Microsoft `SPC_INDIVIDUAL_SP_KEY_PURPOSE_OBJID`.
///
/// 1.3.6.1.4.1.311.2.1.21
pub const OID_SPC_INDIVIDUAL_SP_KEY_PURPOSE: ConstOid =
    Oid(&[43, 6, 1, 4, 1, 130, 55, 2, 1, 21]);

/// Microsoft `SPC_SIPINFO_OBJID`, used for script content.
///
/// 1.3.6.1.4.1.311.2.1.30
pub const OID_SPC_SIPINFO: ConstOid = Oid(&[43, 6, 1, 4, 1, 130, 55, 2, 1, 30]);

/// Apple signed attribute holding a plist of CodeDirectory hashes.
///
/// 1.2.840.113635.100.9.1
pub const OID_CD_DIGESTS_PLIST: ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 9, 1]);

/// Apple signed attribute holding typed CodeDirectory digests.
///
/// 1.2.840.113635.100.9.2
pub const OID_CD_DIGESTS: ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 9, 2]);

/// Parameters of an algorithm identifier.
///
/// DER encoders disagree on whether hash algorithm identifiers carry an
/// explicit `NULL` or nothing. Both are accepted and preserved.
#[derive(Clone, Debug)]
pub enum AlgorithmParameters {
    Absent,
    Null,
    Other(Captured),
}

impl PartialEq for AlgorithmParameters {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Absent, Self::Absent) | (Self::Null, Self::Null) => true,
            (Self::Other(a), Self::Other(b)) => a.as_slice() == b.as_slice(),
            _ => false,
        }
    }
}

impl Eq for AlgorithmParameters {}

/// ```ASN.1
/// AlgorithmIdentifier ::= SEQUENCE {
///   algorithm OBJECT IDENTIFIER,
///   parameters ANY DEFINED BY algorithm OPTIONAL }
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DigestAlgorithmIdentifier {
    pub algorithm: Oid,
    pub parameters: AlgorithmParameters,
}

impl From<DigestAlgorithm> for DigestAlgorithmIdentifier {
    fn from(alg: DigestAlgorithm) -> Self {
        Self {
            algorithm: alg.into(),
            parameters: AlgorithmParameters::Null,
        }
    }
}

impl DigestAlgorithmIdentifier {
    pub fn take_from<S: Source>(cons: &mut Constructed<S>) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let algorithm = Oid::take_from(cons)?;

            let null = cons.take_opt_primitive_if(Tag::NULL, |prim| {
                prim.take_all()?;
                Ok(())
            })?;

            let parameters = if null.is_some() {
                AlgorithmParameters::Null
            } else {
                let captured = cons.capture_all()?;
                if captured.as_slice().is_empty() {
                    AlgorithmParameters::Absent
                } else {
                    AlgorithmParameters::Other(captured)
                }
            };

            Ok(Self {
                algorithm,
                parameters,
            })
        })
    }

    pub fn encode_ref(&self) -> impl Values + '_ {
        encode::sequence((
            self.algorithm.encode_ref(),
            match &self.parameters {
                AlgorithmParameters::Null => Some(().encode_as(Tag::NULL)),
                _ => None,
            },
            match &self.parameters {
                AlgorithmParameters::Other(captured) => Some(captured),
                _ => None,
            },
        ))
    }

    /// Resolve the digest algorithm this identifier names.
    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm, CodesignError> {
        DigestAlgorithm::try_from(&self.algorithm)
    }
}

/// ```ASN.1
/// DigestInfo ::= SEQUENCE {
///   digestAlgorithm AlgorithmIdentifier,
///   digest OCTET STRING }
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DigestInfo {
    pub algorithm: DigestAlgorithmIdentifier,
    pub digest: OctetString,
}

impl DigestInfo {
    pub fn new(algorithm: DigestAlgorithm, digest: &[u8]) -> Self {
        Self {
            algorithm: algorithm.into(),
            digest: OctetString::new(Bytes::copy_from_slice(digest)),
        }
    }

    pub fn take_from<S: Source>(cons: &mut Constructed<S>) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let algorithm = DigestAlgorithmIdentifier::take_from(cons)?;
            let digest = OctetString::take_from(cons)?;

            Ok(Self { algorithm, digest })
        })
    }

    pub fn encode_ref(&self) -> impl Values + '_ {
        encode::sequence((self.algorithm.encode_ref(), self.digest.encode_ref()))
    }

    pub fn digest_bytes(&self) -> Vec<u8> {
        self.digest.to_bytes().to_vec()
    }
}

/// ```ASN.1
/// SpcAttributeTypeAndOptionalValue ::= SEQUENCE {
///   type ObjectID,
///   value [0] EXPLICIT ANY OPTIONAL }
/// ```
///
/// In practice `value` is encoded without the context tag, directly
/// following the type.
#[derive(Clone, Debug)]
pub struct SpcAttributeTypeAndOptionalValue {
    pub typ: Oid,
    pub value: Option<Captured>,
}

impl PartialEq for SpcAttributeTypeAndOptionalValue {
    fn eq(&self, other: &Self) -> bool {
        self.typ == other.typ
            && self.value.as_ref().map(|v| v.as_slice())
                == other.value.as_ref().map(|v| v.as_slice())
    }
}

impl Eq for SpcAttributeTypeAndOptionalValue {}

impl SpcAttributeTypeAndOptionalValue {
    pub fn take_from<S: Source>(cons: &mut Constructed<S>) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let typ = Oid::take_from(cons)?;
            let captured = cons.capture_all()?;

            let value = if captured.as_slice().is_empty() {
                None
            } else {
                Some(captured)
            };

            Ok(Self { typ, value })
        })
    }

    pub fn encode_ref(&self) -> impl Values + '_ {
        encode::sequence((self.typ.encode_ref(), self.value.as_ref()))
    }
}

/// ```ASN.1
/// SpcIndirectDataContent ::= SEQUENCE {
///   data SpcAttributeTypeAndOptionalValue,
///   messageDigest DigestInfo }
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpcIndirectDataContent {
    pub data: SpcAttributeTypeAndOptionalValue,
    pub message_digest: DigestInfo,
}

impl SpcIndirectDataContent {
    /// Indirect data describing a PE image digest.
    pub fn pe_image(algorithm: DigestAlgorithm, digest: &[u8]) -> Self {
        Self {
            data: SpcAttributeTypeAndOptionalValue {
                typ: Oid(Bytes::copy_from_slice(OID_SPC_PE_IMAGE_DATA.as_ref())),
                value: Some(pe_image_data_obsolete()),
            },
            message_digest: DigestInfo::new(algorithm, digest),
        }
    }

    /// Indirect data describing a script content digest.
    pub fn script(algorithm: DigestAlgorithm, digest: &[u8]) -> Self {
        Self {
            data: SpcAttributeTypeAndOptionalValue {
                typ: Oid(Bytes::copy_from_slice(OID_SPC_SIPINFO.as_ref())),
                value: None,
            },
            message_digest: DigestInfo::new(algorithm, digest),
        }
    }

    pub fn take_from<S: Source>(cons: &mut Constructed<S>) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let data = SpcAttributeTypeAndOptionalValue::take_from(cons)?;
            let message_digest = DigestInfo::take_from(cons)?;

            Ok(Self {
                data,
                message_digest,
            })
        })
    }

    pub fn encode_ref(&self) -> impl Values + '_ {
        encode::sequence((self.data.encode_ref(), self.message_digest.encode_ref()))
    }

    /// Parse from DER (or BER) bytes.
    pub fn from_der(data: &[u8]) -> Result<Self, CodesignError> {
        Constructed::decode(data, Mode::Ber, |cons| Self::take_from(cons))
            .map_err(|e| CodesignError::Asn1Decode(format!("{}", e)))
    }

    /// Serialize to DER.
    pub fn to_der(&self) -> Result<Vec<u8>, CodesignError> {
        let mut der = Vec::new();
        self.encode_ref().write_encoded(Mode::Der, &mut der)?;

        Ok(der)
    }

    /// Resolve the digest algorithm and digest recorded in this content.
    pub fn digest(&self) -> Result<(DigestAlgorithm, Vec<u8>), CodesignError> {
        Ok((
            self.message_digest.algorithm.digest_algorithm()?,
            self.message_digest.digest_bytes(),
        ))
    }
}

/// The `SpcPeImageData` value conventionally embedded by signing tools.
///
/// ```ASN.1
/// SpcPeImageData ::= SEQUENCE {
///   flags SpcPeImageFlags DEFAULT { includeResources },
///   file [0] EXPLICIT SpcLink OPTIONAL }
/// ```
///
/// The flags are an empty bit string and the link is the file choice
/// holding the BMP string `<<<Obsolete>>>`.
pub fn pe_image_data_obsolete() -> Captured {
    let unicode = "<<<Obsolete>>>"
        .encode_utf16()
        .flat_map(|c| c.to_be_bytes())
        .collect::<Vec<_>>();
    let unicode = OctetString::new(Bytes::from(unicode));
    let flags = BitString::new(0, Bytes::new());

    Captured::from_values(
        Mode::Der,
        encode::sequence((
            flags.encode_ref(),
            encode::sequence_as(
                Tag::CTX_0,
                encode::sequence_as(Tag::CTX_2, unicode.encode_ref_as(Tag::CTX_0)),
            ),
        )),
    )
}

/// Value of the `SpcSpOpusInfo` signed attribute: a sequence with no
/// program name and no link.
pub fn sp_opus_info_empty() -> Captured {
    Captured::from_values(Mode::Der, encode::sequence(encode::Nothing))
}

/// Value of the `SpcStatementType` signed attribute asserting individual
/// code signing.
pub fn statement_type_individual() -> Captured {
    Captured::from_values(
        Mode::Der,
        encode::sequence(
            Oid(Bytes::copy_from_slice(
                OID_SPC_INDIVIDUAL_SP_KEY_PURPOSE.as_ref(),
            ))
            .encode(),
        ),
    )
}

/// A digest of a CodeDirectory tagged with its algorithm.
///
/// This is the value of the [OID_CD_DIGESTS] signed attribute:
///
/// ```ASN.1
/// CodeDirectoryHash ::= SEQUENCE {
///   digestAlgorithm OBJECT IDENTIFIER,
///   digest OCTET STRING }
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodeDirectoryHash {
    pub algorithm: Oid,
    pub digest: OctetString,
}

impl CodeDirectoryHash {
    pub fn new(algorithm: DigestAlgorithm, digest: &[u8]) -> Self {
        Self {
            algorithm: algorithm.into(),
            digest: OctetString::new(Bytes::copy_from_slice(digest)),
        }
    }

    pub fn take_from<S: Source>(cons: &mut Constructed<S>) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let algorithm = Oid::take_from(cons)?;
            let digest = OctetString::take_from(cons)?;

            Ok(Self { algorithm, digest })
        })
    }

    pub fn encode_ref(&self) -> impl Values + '_ {
        encode::sequence((self.algorithm.encode_ref(), self.digest.encode_ref()))
    }

    pub fn to_captured(&self) -> Captured {
        Captured::from_values(Mode::Der, self.encode_ref())
    }

    pub fn from_der(data: &[u8]) -> Result<Self, CodesignError> {
        Constructed::decode(data, Mode::Ber, |cons| Self::take_from(cons))
            .map_err(|e| CodesignError::Asn1Decode(format!("{}", e)))
    }

    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm, CodesignError> {
        DigestAlgorithm::try_from(&self.algorithm)
    }

    pub fn digest_bytes(&self) -> Vec<u8> {
        self.digest.to_bytes().to_vec()
    }
}

/// Bytes an Authenticode message digest covers.
///
/// That is the content octets of the encapsulated SEQUENCE, without its tag
/// and length.
pub fn authenticode_digested_content(content: &[u8]) -> Result<Vec<u8>, CodesignError> {
    Constructed::decode(content, Mode::Ber, |cons| {
        cons.take_sequence(|cons| cons.capture_all())
    })
    .map(|captured| captured.as_slice().to_vec())
    .map_err(|e| CodesignError::Asn1Decode(format!("{}", e)))
}

/// CMS `SignedData` as laid out by Authenticode.
///
/// ```ASN.1
/// EncapsulatedContentInfo ::= SEQUENCE {
///   eContentType ContentType,
///   eContent [0] EXPLICIT ANY DEFINED BY eContentType OPTIONAL }
/// ```
///
/// Authenticode places `SpcIndirectDataContent` directly inside the context
/// tag where RFC 5652 has an OCTET STRING. The remaining fields are shared
/// with [rfc5652::SignedData], whose `content_info.content` is always `None`
/// here. The encapsulated value lives in `content`.
#[derive(Clone, Debug)]
pub struct AuthenticodeSignedData {
    pub signed_data: rfc5652::SignedData,
    pub content: Option<Captured>,
}

impl AuthenticodeSignedData {
    /// Decode a BER encoded `ContentInfo` holding signed data.
    pub fn decode_ber(data: &[u8]) -> Result<Self, CodesignError> {
        Constructed::decode(data, Mode::Ber, |cons| Self::decode(cons))
            .map_err(|e| CodesignError::Asn1Decode(format!("{}", e)))
    }

    pub fn decode<S: Source>(cons: &mut Constructed<S>) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let oid = Oid::take_from(cons)?;

            if oid != rfc5652::OID_ID_SIGNED_DATA {
                return Err(cons.content_err("content info is not signed data"));
            }

            cons.take_constructed_if(Tag::CTX_0, Self::take_from)
        })
    }

    pub fn take_from<S: Source>(cons: &mut Constructed<S>) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let version = rfc5652::CmsVersion::take_from(cons)?;
            let digest_algorithms = rfc5652::DigestAlgorithmIdentifiers::take_from(cons)?;
            let (content_type, content) = cons.take_sequence(|cons| {
                let content_type = Oid::take_from(cons)?;
                let content = cons.take_opt_constructed_if(Tag::CTX_0, |cons| cons.capture_all())?;

                Ok((content_type, content))
            })?;
            let certificates = cons.take_opt_constructed_if(Tag::CTX_0, |cons| {
                rfc5652::CertificateSet::take_from(cons)
            })?;
            let crls = cons.take_opt_constructed_if(Tag::CTX_1, |cons| {
                rfc5652::RevocationInfoChoices::take_from(cons)
            })?;
            let signer_infos = rfc5652::SignerInfos::take_from(cons)?;

            Ok(Self {
                signed_data: rfc5652::SignedData {
                    version,
                    digest_algorithms,
                    content_info: rfc5652::EncapsulatedContentInfo {
                        content_type,
                        content: None,
                    },
                    certificates,
                    crls,
                    signer_infos,
                },
                content,
            })
        })
    }

    pub fn encode_ref(&self) -> impl Values + '_ {
        let sd = &self.signed_data;

        encode::sequence((
            rfc5652::OID_ID_SIGNED_DATA.encode_ref(),
            encode::sequence_as(
                Tag::CTX_0,
                encode::sequence((
                    sd.version.encode(),
                    sd.digest_algorithms.encode_ref(),
                    encode::sequence((
                        sd.content_info.content_type.encode_ref(),
                        self.content
                            .as_ref()
                            .map(|content| encode::sequence_as(Tag::CTX_0, content)),
                    )),
                    sd.certificates
                        .as_ref()
                        .map(|certs| certs.encode_ref_as(Tag::CTX_0)),
                    sd.signer_infos.encode_ref(),
                )),
            ),
        ))
    }

    /// Encapsulate `content` in a detached envelope.
    ///
    /// `envelope` must carry no content of its own. `content` is a single DER
    /// value.
    pub fn from_detached(envelope: &[u8], content: &[u8]) -> Result<Self, CodesignError> {
        let mut sd = Self::decode_ber(envelope)?;

        if sd.content.is_some() {
            return Err(CodesignError::EnvelopeMalformed(
                "envelope already encapsulates content",
            ));
        }

        sd.content = Some(
            Constructed::decode(content, Mode::Der, |cons| cons.capture_all())
                .map_err(|e| CodesignError::Asn1Decode(format!("{}", e)))?,
        );

        Ok(sd)
    }

    /// Serialize to DER.
    pub fn to_der(&self) -> Result<Vec<u8>, CodesignError> {
        let mut der = Vec::new();
        self.encode_ref().write_encoded(Mode::Der, &mut der)?;

        Ok(der)
    }

    /// Convert to the high-level CMS type.
    ///
    /// The encapsulated value becomes the signed content, so
    /// `SignedData::signed_content()` yields its full DER encoding.
    pub fn to_signed_data(&self) -> Result<SignedData, CodesignError> {
        let mut raw = self.signed_data.clone();
        raw.content_info.content = self
            .content
            .as_ref()
            .map(|content| OctetString::new(Bytes::copy_from_slice(content.as_slice())));

        Ok(SignedData::try_from(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_algorithm_identifier_parameters() {
        // SEQUENCE { OID sha256, NULL }
        let with_null = hex::decode("300d06096086480165030402010500").unwrap();
        // SEQUENCE { OID sha256 }
        let without = hex::decode("300b0609608648016503040201").unwrap();

        for (data, expected) in [
            (&with_null, AlgorithmParameters::Null),
            (&without, AlgorithmParameters::Absent),
        ] {
            let ident = Constructed::decode(data.as_slice(), Mode::Der, |cons| {
                DigestAlgorithmIdentifier::take_from(cons)
            })
            .unwrap();
            assert_eq!(ident.parameters, expected);
            assert_eq!(ident.digest_algorithm().unwrap(), DigestAlgorithm::Sha256);

            let mut encoded = Vec::new();
            ident
                .encode_ref()
                .write_encoded(Mode::Der, &mut encoded)
                .unwrap();
            assert_eq!(&encoded, data);
        }
    }

    #[test]
    fn indirect_data_pe_image() {
        let digest = DigestAlgorithm::Sha256.digest_data(b"image");
        let content = SpcIndirectDataContent::pe_image(DigestAlgorithm::Sha256, &digest);
        let der = content.to_der().unwrap();

        let parsed = SpcIndirectDataContent::from_der(&der).unwrap();
        assert_eq!(parsed, content);
        assert_eq!(parsed.data.typ, OID_SPC_PE_IMAGE_DATA);
        assert_eq!(parsed.digest().unwrap(), (DigestAlgorithm::Sha256, digest));

        // The obsolete link is BMP encoded.
        let value = parsed.data.value.unwrap();
        let needle = [0u8, b'<', 0, b'<', 0, b'<', 0, b'O'];
        assert!(value
            .as_slice()
            .windows(needle.len())
            .any(|w| w == needle));
    }

    #[test]
    fn indirect_data_script_has_no_value() {
        let digest = DigestAlgorithm::Sha1.digest_data(b"script");
        let content = SpcIndirectDataContent::script(DigestAlgorithm::Sha1, &digest);
        let der = content.to_der().unwrap();

        let parsed = SpcIndirectDataContent::from_der(&der).unwrap();
        assert_eq!(parsed.data.typ, OID_SPC_SIPINFO);
        assert!(parsed.data.value.is_none());
        assert_eq!(parsed.message_digest.digest_bytes(), digest);
    }

    #[test]
    fn fixed_attribute_values() {
        assert_eq!(sp_opus_info_empty().as_slice(), &[0x30, 0x00]);
        assert_eq!(
            hex::encode(statement_type_individual().as_slice()),
            "300c060a2b060104018237020115"
        );
    }

    #[test]
    fn authenticode_digest_skips_sequence_header() {
        assert_eq!(
            authenticode_digested_content(&[0x30, 0x03, 0x02, 0x01, 0x07]).unwrap(),
            vec![0x02, 0x01, 0x07]
        );

        let digest = DigestAlgorithm::Sha512.digest_data(b"image");
        let der = SpcIndirectDataContent::pe_image(DigestAlgorithm::Sha512, &digest)
            .to_der()
            .unwrap();
        // 136 content bytes need a long form length.
        assert_eq!(&der[0..3], &[0x30, 0x81, 0x88]);
        assert_eq!(authenticode_digested_content(&der).unwrap(), der[3..].to_vec());

        assert!(authenticode_digested_content(&[0x04, 0x01, 0x00]).is_err());
    }

    #[test]
    fn code_directory_hash_attribute() {
        let digest = DigestAlgorithm::Sha256.digest_data(b"cd");
        let value = CodeDirectoryHash::new(DigestAlgorithm::Sha256, &digest);
        let captured = value.to_captured();

        let parsed = CodeDirectoryHash::from_der(captured.as_slice()).unwrap();
        assert_eq!(parsed.digest_algorithm().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!(parsed.digest_bytes(), digest);
    }
}
