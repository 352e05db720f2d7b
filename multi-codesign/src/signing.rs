// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing material, signing options and CMS envelope construction.
//!
//! Every format ends up embedding a CMS `SignedData` envelope. This module
//! holds what is common to producing one: the signing key and certificate
//! chain ([SigningCertificate]), the knobs influencing a signing operation
//! ([SignatureOptions]) and the result of signature creation ([Signature]).

use {
    crate::{
        asn1::{authenticode_digested_content, AuthenticodeSignedData},
        code_directory::{CodeSignatureFlags, ExecutableSegmentFlags},
        digest::DigestAlgorithm,
        error::CodesignError,
        macho::MachOSignaturePayload,
    },
    bcder::Oid,
    cryptographic_message_syntax::{SignedData, SignedDataBuilder, SignerBuilder},
    log::{info, warn},
    reqwest::{IntoUrl, Url},
    x509_certificate::{rfc5652::AttributeValue, CapturedX509Certificate, KeyInfoSigner},
};

bitflags::bitflags! {
    /// Problems reported by a certificate chain builder.
    pub struct ChainStatus: u32 {
        /// A certificate is outside its validity period.
        const NOT_TIME_VALID = 0x0001;
        /// A certificate was revoked.
        const REVOKED = 0x0004;
        /// A certificate signature did not verify.
        const NOT_SIGNATURE_VALID = 0x0008;
        /// A certificate is not valid for code signing.
        const NOT_VALID_FOR_USAGE = 0x0010;
        /// The chain terminates in an untrusted root.
        const UNTRUSTED_ROOT = 0x0020;
        /// Revocation status could not be determined.
        const REVOCATION_STATUS_UNKNOWN = 0x0040;
        /// A certificate carries an extension the builder does not support.
        const UNSUPPORTED_EXTENSION = 0x0100;
        /// A certificate carries a critical extension the builder does not know.
        const UNKNOWN_CRITICAL_EXTENSION = 0x8000;
        /// The chain could not be built to a root.
        const PARTIAL_CHAIN = 0x10000;
    }
}

impl ChainStatus {
    /// Conditions that don't invalidate a chain whose leaf is self-signed.
    pub fn tolerated_for_self_signed() -> Self {
        Self::UNSUPPORTED_EXTENSION | Self::UNKNOWN_CRITICAL_EXTENSION
    }
}

/// Capability building and validating a certificate chain.
///
/// Chain validation is delegated to the caller. When a builder is registered
/// in [SignatureOptions], it is consulted before any envelope is created.
pub trait CertificateChainBuilder {
    /// Build a chain for `leaf` using `intermediates` and report problems.
    fn build_chain(
        &self,
        leaf: &CapturedX509Certificate,
        intermediates: &[CapturedX509Certificate],
    ) -> Result<ChainStatus, CodesignError>;
}

/// A signing key paired with its certificate and issuing chain.
pub struct SigningCertificate<'key> {
    key: &'key dyn KeyInfoSigner,
    certificate: CapturedX509Certificate,
    chain: Vec<CapturedX509Certificate>,
}

impl<'key> SigningCertificate<'key> {
    /// Construct from a key and its public certificate.
    pub fn new(key: &'key dyn KeyInfoSigner, certificate: CapturedX509Certificate) -> Self {
        Self {
            key,
            certificate,
            chain: vec![],
        }
    }

    /// Add an issuing certificate. Certificates should be added leaf to root.
    pub fn chain_certificate(&mut self, cert: CapturedX509Certificate) {
        self.chain.push(cert);
    }

    /// The signing key.
    pub fn key(&self) -> &'key dyn KeyInfoSigner {
        self.key
    }

    /// The signing certificate.
    pub fn certificate(&self) -> &CapturedX509Certificate {
        &self.certificate
    }

    /// Issuing certificates registered on this instance.
    pub fn chain(&self) -> &[CapturedX509Certificate] {
        &self.chain
    }

    /// Full chain, leaf first, including extra certificates from `options`.
    pub fn full_chain<'a>(
        &'a self,
        options: &'a SignatureOptions,
    ) -> Vec<&'a CapturedX509Certificate> {
        std::iter::once(&self.certificate)
            .chain(self.chain.iter())
            .chain(options.certificate_chain().iter())
            .collect()
    }

    /// Run the registered chain builder, if any.
    pub fn check_chain(&self, options: &SignatureOptions) -> Result<(), CodesignError> {
        let builder = match options.chain_builder() {
            Some(builder) => builder,
            None => return Ok(()),
        };

        let intermediates = self
            .chain
            .iter()
            .chain(options.certificate_chain().iter())
            .cloned()
            .collect::<Vec<_>>();

        let mut status = builder.build_chain(&self.certificate, &intermediates)?;

        if self.certificate.subject_is_issuer() {
            status.remove(ChainStatus::tolerated_for_self_signed());
        }

        if status.is_empty() {
            Ok(())
        } else {
            Err(CodesignError::CertificateChain(format!("{:?}", status)))
        }
    }

    /// Produce a DER encoded CMS envelope.
    ///
    /// The signer always digests the content as detached content. For
    /// Authenticode the content is then placed in the envelope.
    pub(crate) fn create_envelope(
        &self,
        options: &SignatureOptions,
        request: EnvelopeRequest,
    ) -> Result<Vec<u8>, CodesignError> {
        self.check_chain(options)?;

        let digested = match request.encapsulation {
            Encapsulation::Detached => request.content.clone(),
            Encapsulation::Authenticode => authenticode_digested_content(&request.content)?,
        };

        let mut signer = SignerBuilder::new(self.key, self.certificate.clone())
            .content_type(request.content_type.clone())
            .message_id_content(digested);

        for (typ, values) in request.attributes {
            signer = signer.signed_attribute(typ, values);
        }

        if let Some(url) = options.time_stamp_url() {
            info!("using time-stamp server {}", url);
            signer = signer
                .time_stamp_url(url.clone())
                .map_err(|e| CodesignError::TimeStamp(e.to_string()))?;
        }

        let der = SignedDataBuilder::default()
            .content_type(request.content_type)
            .certificates(
                self.chain
                    .iter()
                    .chain(options.certificate_chain().iter())
                    .cloned(),
            )
            .signer(signer)
            .build_der()?;

        match request.encapsulation {
            Encapsulation::Detached => Ok(der),
            Encapsulation::Authenticode => {
                AuthenticodeSignedData::from_detached(&der, &request.content)?.to_der()
            }
        }
    }
}

/// Where envelope content goes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Encapsulation {
    /// Content stays outside the envelope. The message digest covers all of it.
    Detached,
    /// Content is a DER value placed under `eContent [0] EXPLICIT`. The
    /// message digest covers its content octets.
    Authenticode,
}

/// What a format asks to be placed in an envelope.
pub(crate) struct EnvelopeRequest {
    pub content_type: Oid,
    /// Content vouched for by the message digest attribute.
    pub content: Vec<u8>,
    pub encapsulation: Encapsulation,
    /// Extra signed attributes.
    pub attributes: Vec<(Oid, Vec<AttributeValue>)>,
}

/// Verify every signer of an envelope.
///
/// `detached_content` is required when the envelope does not encapsulate
/// its content.
pub(crate) fn verify_envelope_signers(
    signed_data: &SignedData,
    detached_content: Option<&[u8]>,
) -> bool {
    let mut seen = false;

    for signer in signed_data.signers() {
        seen = true;

        if let Err(e) = signer.verify_signature_with_signed_data(signed_data) {
            warn!("CMS signature verification failed: {}", e);
            return false;
        }

        let digest_result = match detached_content {
            Some(content) => signer.verify_message_digest_with_content(content),
            None => signer.verify_message_digest_with_signed_data(signed_data),
        };

        if let Err(e) = digest_result {
            warn!("CMS message digest verification failed: {}", e);
            return false;
        }
    }

    seen
}

/// Settings influencing signature creation.
pub struct SignatureOptions {
    digest: DigestAlgorithm,
    identifier: Option<String>,
    team_id: Option<String>,
    code_signature_flags: CodeSignatureFlags,
    executable_segment_flags: Option<ExecutableSegmentFlags>,
    page_size: u32,
    time_stamp_url: Option<Url>,
    certificates: Vec<CapturedX509Certificate>,
    chain_builder: Option<Box<dyn CertificateChainBuilder>>,
}

impl Default for SignatureOptions {
    fn default() -> Self {
        Self {
            digest: DigestAlgorithm::Sha256,
            identifier: None,
            team_id: None,
            code_signature_flags: CodeSignatureFlags::empty(),
            executable_segment_flags: None,
            page_size: 4096,
            time_stamp_url: None,
            certificates: vec![],
            chain_builder: None,
        }
    }
}

impl SignatureOptions {
    /// Obtain the digest algorithm to use.
    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    /// Set the content digest algorithm.
    ///
    /// The default is SHA-256. Not every format accepts every algorithm.
    pub fn set_digest(&mut self, digest: DigestAlgorithm) {
        self.digest = digest;
    }

    /// The signing identifier for Mach-O signatures.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Set the signing identifier for Mach-O signatures.
    ///
    /// When unset, the file stem of the signed file's name is used.
    pub fn set_identifier(&mut self, value: impl ToString) {
        self.identifier = Some(value.to_string());
    }

    /// The team identifier for Mach-O signatures.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    /// Set the team identifier.
    ///
    /// When unset and the signing certificate is an Apple developer
    /// certificate, the team is read from the certificate.
    pub fn set_team_id(&mut self, value: impl ToString) {
        self.team_id = Some(value.to_string());
    }

    pub fn code_signature_flags(&self) -> CodeSignatureFlags {
        self.code_signature_flags
    }

    /// Set the flags recorded in Mach-O CodeDirectories.
    pub fn set_code_signature_flags(&mut self, flags: CodeSignatureFlags) {
        self.code_signature_flags = flags;
    }

    pub fn executable_segment_flags(&self) -> Option<ExecutableSegmentFlags> {
        self.executable_segment_flags
    }

    /// Set the executable segment flags.
    ///
    /// When unset, main executables get [ExecutableSegmentFlags::MAIN_BINARY].
    pub fn set_executable_segment_flags(&mut self, flags: ExecutableSegmentFlags) {
        self.executable_segment_flags = Some(flags);
    }

    /// Page size used for Mach-O code digests.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Set the Mach-O code page size. Must be a power of two of at least 512.
    pub fn set_page_size(&mut self, size: u32) -> Result<(), CodesignError> {
        if !size.is_power_of_two() || size < 512 {
            return Err(CodesignError::Unsupported("page size must be a power of two >= 512"));
        }

        self.page_size = size;

        Ok(())
    }

    /// Obtain the Time-Stamp Protocol server URL.
    pub fn time_stamp_url(&self) -> Option<&Url> {
        self.time_stamp_url.as_ref()
    }

    /// Set the Time-Stamp Protocol server URL to use to generate a Time-Stamp Token.
    ///
    /// When set, the server is contacted during envelope creation and the
    /// token is embedded as an unsigned attribute.
    pub fn set_time_stamp_url(&mut self, url: impl IntoUrl) -> Result<(), CodesignError> {
        self.time_stamp_url = Some(url.into_url()?);

        Ok(())
    }

    /// Extra certificates to embed in envelopes.
    pub fn certificate_chain(&self) -> &[CapturedX509Certificate] {
        &self.certificates
    }

    /// Add a certificate to embed in envelopes.
    pub fn chain_certificate(&mut self, cert: CapturedX509Certificate) {
        self.certificates.push(cert);
    }

    /// Add a DER encoded certificate to embed in envelopes.
    pub fn chain_certificate_der(&mut self, data: impl AsRef<[u8]>) -> Result<(), CodesignError> {
        self.chain_certificate(CapturedX509Certificate::from_der(data.as_ref())?);

        Ok(())
    }

    pub fn chain_builder(&self) -> Option<&dyn CertificateChainBuilder> {
        self.chain_builder.as_deref()
    }

    /// Register a chain builder consulted before signing.
    pub fn set_chain_builder(&mut self, builder: Box<dyn CertificateChainBuilder>) {
        self.chain_builder = Some(builder);
    }
}

/// Format specific data carried alongside an envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SignaturePayload {
    /// PE and script signatures need nothing beyond the envelope.
    None,
    /// The blobs and planned layout for a Mach-O SuperBlob.
    MachO(MachOSignaturePayload),
}

/// A created signature waiting to be written.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Signature {
    /// DER encoded CMS `SignedData`.
    pub envelope: Vec<u8>,
    pub payload: SignaturePayload,
}

impl Signature {
    /// Decode the envelope.
    pub fn signed_data(&self) -> Result<SignedData, CodesignError> {
        match self.payload {
            SignaturePayload::MachO(_) => Ok(SignedData::parse_ber(&self.envelope)?),
            SignaturePayload::None => {
                AuthenticodeSignedData::decode_ber(&self.envelope)?.to_signed_data()
            }
        }
    }
}
