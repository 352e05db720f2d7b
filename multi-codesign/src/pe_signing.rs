// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authenticode signing of PE images.

use {
    crate::{
        allocation::Allocation,
        asn1::{
            authenticode_digested_content, sp_opus_info_empty, statement_type_individual,
            AuthenticodeSignedData, SpcIndirectDataContent, OID_SPC_INDIRECT_DATA,
            OID_SPC_PE_IMAGE_DATA, OID_SPC_SP_OPUS_INFO, OID_SPC_STATEMENT_TYPE,
        },
        digest::DigestAlgorithm,
        error::CodesignError,
        pe::{
            align8, PeContext, WIN_CERTIFICATE_HEADER_SIZE, WIN_CERT_REVISION_2_0,
            WIN_CERT_TYPE_PKCS_SIGNED_DATA,
        },
        signing::{
            verify_envelope_signers, Encapsulation, EnvelopeRequest, Signature,
            SignatureOptions, SignaturePayload, SigningCertificate,
        },
    },
    bcder::Oid,
    bytes::Bytes,
    cryptographic_message_syntax::SignedData,
    log::{info, warn},
    scroll::Pwrite,
    x509_certificate::rfc5652::AttributeValue,
};

/// The two signed attributes every Authenticode signer carries.
pub(crate) fn authenticode_attributes() -> Vec<(Oid, Vec<AttributeValue>)> {
    vec![
        (
            Oid(Bytes::copy_from_slice(OID_SPC_SP_OPUS_INFO.as_ref())),
            vec![AttributeValue::new(sp_opus_info_empty())],
        ),
        (
            Oid(Bytes::copy_from_slice(OID_SPC_STATEMENT_TYPE.as_ref())),
            vec![AttributeValue::new(statement_type_individual())],
        ),
    ]
}

/// Decode the indirect data content of an Authenticode envelope.
pub(crate) fn indirect_data(signed_data: &SignedData) -> Option<SpcIndirectDataContent> {
    let content = signed_data.signed_content()?;

    match SpcIndirectDataContent::from_der(content) {
        Ok(indirect) => Some(indirect),
        Err(e) => {
            warn!("signed content is not indirect data: {}", e);
            None
        }
    }
}

/// Decode an Authenticode envelope.
pub(crate) fn parse_authenticode_envelope(der: &[u8]) -> Result<SignedData, CodesignError> {
    AuthenticodeSignedData::decode_ber(der)?.to_signed_data()
}

/// Verify every signer of an Authenticode envelope against its content.
pub(crate) fn verify_authenticode_signers(signed_data: &SignedData) -> Result<bool, CodesignError> {
    let content = match signed_data.signed_content() {
        Some(content) => content,
        None => {
            warn!("Authenticode envelope has no content");
            return Ok(false);
        }
    };

    Ok(verify_envelope_signers(
        signed_data,
        Some(&authenticode_digested_content(content)?),
    ))
}

/// Signature operations on PE images.
pub struct PeHandler;

impl PeHandler {
    /// Compute the Authenticode digest.
    pub fn compute_hash(
        data: &[u8],
        ctx: &PeContext,
        digest: DigestAlgorithm,
    ) -> Result<Vec<u8>, CodesignError> {
        ctx.authenticode_digest(data, digest)
    }

    /// Decode the embedded envelope.
    pub fn get_signature(data: &[u8], ctx: &PeContext) -> Result<Option<SignedData>, CodesignError> {
        ctx.signature_data(data)?
            .map(parse_authenticode_envelope)
            .transpose()
    }

    /// Create an Authenticode signature for an unsigned image.
    pub fn create_signature(
        data: &[u8],
        ctx: &PeContext,
        signer: &SigningCertificate,
        options: &SignatureOptions,
    ) -> Result<Signature, CodesignError> {
        if ctx.is_signed() {
            return Err(CodesignError::AlreadySigned);
        }
        if ctx.security_entry_offset.is_none() {
            return Err(CodesignError::InvalidPe(
                "image has no security directory entry".into(),
            ));
        }

        let digest = options.digest();
        let image_digest = ctx.authenticode_digest(data, digest)?;
        info!(
            "signing PE image with {} digest {}",
            digest,
            hex::encode(&image_digest)
        );

        let content = SpcIndirectDataContent::pe_image(digest, &image_digest).to_der()?;

        let envelope = signer.create_envelope(
            options,
            EnvelopeRequest {
                content_type: Oid(Bytes::copy_from_slice(OID_SPC_INDIRECT_DATA.as_ref())),
                content,
                encapsulation: Encapsulation::Authenticode,
                attributes: authenticode_attributes(),
            },
        )?;

        Ok(Signature {
            envelope,
            payload: SignaturePayload::None,
        })
    }

    /// Append the signature as an attribute certificate table.
    pub fn write_signature(
        alloc: &mut dyn Allocation,
        ctx: &PeContext,
        signature: &Signature,
    ) -> Result<(), CodesignError> {
        if signature.payload != SignaturePayload::None {
            return Err(CodesignError::SignatureKindMismatch);
        }
        if ctx.is_signed() {
            return Err(CodesignError::AlreadySigned);
        }
        let entry = ctx
            .security_entry_offset
            .ok_or_else(|| CodesignError::InvalidPe("image has no security directory entry".into()))?;

        let certificate_offset = align8(alloc.len());
        let certificate_length = WIN_CERTIFICATE_HEADER_SIZE + signature.envelope.len();
        let table_size = align8(certificate_length);

        if certificate_offset + table_size > u32::MAX as usize {
            return Err(CodesignError::Unsupported("signed images larger than 4 GiB"));
        }

        let span = alloc.span_mut();
        span.pwrite_with(certificate_offset as u32, entry, scroll::LE)?;
        span.pwrite_with(table_size as u32, entry + 4, scroll::LE)?;

        alloc.resize(certificate_offset + table_size)?;

        let table = &mut alloc.span_mut()[certificate_offset..];
        table.pwrite_with(certificate_length as u32, 0, scroll::LE)?;
        table.pwrite_with(WIN_CERT_REVISION_2_0, 4, scroll::LE)?;
        table.pwrite_with(WIN_CERT_TYPE_PKCS_SIGNED_DATA, 6, scroll::LE)?;
        table[WIN_CERTIFICATE_HEADER_SIZE..certificate_length].copy_from_slice(&signature.envelope);

        info!(
            "wrote {} byte certificate table at offset {}",
            table_size, certificate_offset
        );

        Ok(())
    }

    /// Verify the envelope against the image's current content.
    pub fn verify(
        data: &[u8],
        ctx: &PeContext,
        signed_data: &SignedData,
    ) -> Result<bool, CodesignError> {
        let indirect = match indirect_data(signed_data) {
            Some(indirect) => indirect,
            None => return Ok(false),
        };

        if indirect.data.typ.as_ref() != OID_SPC_PE_IMAGE_DATA.as_ref() {
            warn!("indirect data does not describe a PE image");
            return Ok(false);
        }

        let (digest, expected) = indirect.digest()?;
        let actual = ctx.authenticode_digest(data, digest)?;

        if actual != expected {
            warn!(
                "image digest mismatch: recorded {}, computed {}",
                hex::encode(&expected),
                hex::encode(&actual)
            );
            return Ok(false);
        }

        verify_authenticode_signers(signed_data)
    }

    /// Remove the certificate table.
    ///
    /// The table and the directory entry are zeroed. The checksum is left as
    /// is. With `truncate`, the image is cut at the table offset only when the
    /// table is the last thing in the file, so overlay data following it
    /// survives.
    pub fn remove_signature(
        alloc: &mut dyn Allocation,
        ctx: &PeContext,
        truncate: bool,
    ) -> Result<bool, CodesignError> {
        let entry = match ctx.security_entry_offset {
            Some(entry) if ctx.is_signed() => entry,
            _ => return Ok(false),
        };

        let start = ctx.security_virtual_address as usize;
        let end = start + ctx.security_size as usize;
        let len = alloc.len();

        if end > len {
            return Err(CodesignError::InvalidPe(
                "certificate table extends beyond the image".into(),
            ));
        }

        let span = alloc.span_mut();
        span[start..end].fill(0);
        span[entry..entry + 8].fill(0);

        if truncate {
            if end == len {
                alloc.resize(start)?;
            } else {
                warn!(
                    "certificate table is followed by {} bytes of overlay; not truncating",
                    len - end
                );
            }
        }

        info!("removed {} byte certificate table", end - start);

        Ok(true)
    }
}
