// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::digest::DigestAlgorithm, cryptographic_message_syntax::CmsError, thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Broad classification of a [CodesignError].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Input data is structurally invalid or truncated.
    Malformed,
    /// Input is well formed but the requested operation is not allowed on it.
    Policy,
    /// A feature or variant of the input is not handled.
    Unsupported,
    /// A caller-supplied argument is invalid.
    InvalidInput,
    /// A dependency (I/O, cryptography, time-stamp server) reported failure.
    External,
}

/// Unified error type for code signing operations.
#[derive(Debug, Error)]
pub enum CodesignError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("error serializing plist to XML: {0}")]
    PlistSerializeXml(#[from] plist::Error),

    #[error("ASN.1 decode error: {0}")]
    Asn1Decode(String),

    #[error("time-stamp server error: {0}")]
    TimeStamp(String),

    #[error("certificate chain rejected: {0}")]
    CertificateChain(String),

    #[error("bad URL: {0}")]
    BadUrl(#[from] reqwest::Error),

    #[error("data truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("bad magic in {0}")]
    BadMagic(&'static str),

    #[error("invalid Mach-O binary: {0}")]
    InvalidMachO(String),

    #[error("Mach-O binary has no __TEXT segment")]
    MissingTextSegment,

    #[error("Mach-O binary has no __LINKEDIT segment")]
    MissingLinkeditSegment,

    #[error("__LINKEDIT segment does not end at the end of the file")]
    LinkeditNotAtEnd,

    #[error("invalid PE image: {0}")]
    InvalidPe(String),

    #[error("malformed identifier string in code directory")]
    CodeDirectoryMalformedIdentifier,

    #[error("malformed team name string in code directory")]
    CodeDirectoryMalformedTeam,

    #[error("code directory is malformed: {0}")]
    CodeDirectoryMalformed(&'static str),

    #[error("SuperBlob data is malformed")]
    SuperblobMalformed,

    #[error("unknown code requirement opcode: {0}")]
    RequirementUnknownOpcode(u32),

    #[error("unknown code requirement match expression: {0}")]
    RequirementUnknownMatchExpression(u32),

    #[error("code requirement data is malformed: {0}")]
    RequirementMalformed(&'static str),

    #[error("requirement expression encoded to {written} bytes but {computed} were computed")]
    RequirementSizeMismatch { computed: usize, written: usize },

    #[error("malformed signature block at offset {offset}: {message}")]
    MalformedSignatureBlock { offset: usize, message: &'static str },

    #[error("{0} bytes of unexpected data after signature block")]
    TrailingData(usize),

    #[error("signature envelope is malformed: {0}")]
    EnvelopeMalformed(&'static str),

    #[error("text encoding error: {0}")]
    TextEncoding(&'static str),

    #[error("content is already signed")]
    AlreadySigned,

    #[error("content is not signed")]
    NotSigned,

    #[error("requested digest {requested} does not match recorded digest type {recorded}")]
    DigestMismatch {
        requested: DigestAlgorithm,
        recorded: String,
    },

    #[error("digest algorithm {0} is not usable for {1} signatures")]
    DigestNotAllowed(DigestAlgorithm, &'static str),

    #[error("signature was created for a different file layout")]
    SignatureLayoutMismatch,

    #[error("signature data ({actual} bytes) exceeds reserved space ({reserved} bytes)")]
    SignatureDataTooLarge { actual: usize, reserved: usize },

    #[error("signature does not belong to this content type")]
    SignatureKindMismatch,

    #[error("no signing identifier could be determined")]
    NoIdentifier,

    #[error("no signature handler recognizes this content")]
    UnrecognizedContent,

    #[error("insufficient room to write code signature load command")]
    LoadCommandNoRoom,

    #[error("universal Mach-O binaries must be thinned before signing")]
    UniversalBinary,

    #[error("unknown digest algorithm: {0}")]
    DigestUnknownAlgorithm(String),

    #[error("unknown code signature flag: {0}")]
    CodeSignatureUnknownFlag(String),

    #[error("unknown executable segment flag: {0}")]
    ExecutableSegmentUnknownFlag(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl CodesignError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_)
            | Self::Cms(_)
            | Self::X509(_)
            | Self::PlistSerializeXml(_)
            | Self::TimeStamp(_)
            | Self::CertificateChain(_) => ErrorKind::External,

            Self::BadUrl(_) => ErrorKind::InvalidInput,

            Self::Scroll(_)
            | Self::Base64(_)
            | Self::Asn1Decode(_)
            | Self::Truncated { .. }
            | Self::BadMagic(_)
            | Self::InvalidMachO(_)
            | Self::MissingTextSegment
            | Self::MissingLinkeditSegment
            | Self::InvalidPe(_)
            | Self::CodeDirectoryMalformedIdentifier
            | Self::CodeDirectoryMalformedTeam
            | Self::CodeDirectoryMalformed(_)
            | Self::SuperblobMalformed
            | Self::RequirementUnknownOpcode(_)
            | Self::RequirementUnknownMatchExpression(_)
            | Self::RequirementMalformed(_)
            | Self::RequirementSizeMismatch { .. }
            | Self::MalformedSignatureBlock { .. }
            | Self::TrailingData(_)
            | Self::EnvelopeMalformed(_)
            | Self::TextEncoding(_) => ErrorKind::Malformed,

            Self::AlreadySigned
            | Self::NotSigned
            | Self::DigestMismatch { .. }
            | Self::DigestNotAllowed(..)
            | Self::SignatureLayoutMismatch
            | Self::SignatureDataTooLarge { .. }
            | Self::SignatureKindMismatch
            | Self::NoIdentifier
            | Self::LoadCommandNoRoom
            | Self::LinkeditNotAtEnd => ErrorKind::Policy,

            Self::UnrecognizedContent
            | Self::UniversalBinary
            | Self::DigestUnknownAlgorithm(_)
            | Self::CodeSignatureUnknownFlag(_)
            | Self::ExecutableSegmentUnknownFlag(_)
            | Self::Unsupported(_) => ErrorKind::Unsupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert_eq!(CodesignError::AlreadySigned.kind(), ErrorKind::Policy);
        assert_eq!(CodesignError::UniversalBinary.kind(), ErrorKind::Unsupported);
        assert_eq!(
            CodesignError::Truncated {
                offset: 4,
                needed: 8
            }
            .kind(),
            ErrorKind::Malformed
        );
        assert_eq!(
            CodesignError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom")).kind(),
            ErrorKind::External
        );
    }

    #[test]
    fn bad_time_stamp_url_is_invalid_input() {
        let mut options = crate::signing::SignatureOptions::default();
        let err = options.set_time_stamp_url("not a url").unwrap_err();

        assert!(matches!(err, CodesignError::BadUrl(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
