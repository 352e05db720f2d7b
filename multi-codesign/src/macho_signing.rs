// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing Mach-O binaries.
//!
//! A Mach-O signature is a SuperBlob appended to `__LINKEDIT`. It holds a
//! CodeDirectory with digests of every code page and of the other blobs, a
//! requirement set and a CMS envelope whose signed content is the
//! CodeDirectory. The digest identifying the signed code, the cdhash, is
//! the digest of the CodeDirectory blob.
//!
//! Page digests cover the file as it looks after signing, with the load
//! commands and `__LINKEDIT` already grown. So digests are computed over a
//! patched copy of the headers before any byte of the real file is
//! touched.

use {
    crate::{
        allocation::Allocation,
        asn1::{CodeDirectoryHash, OID_CD_DIGESTS, OID_CD_DIGESTS_PLIST},
        code_directory::{CodeDirectory, CodeDirectoryLayout, ExecutableSegmentFlags},
        digest::DigestAlgorithm,
        embedded_signature::{
            create_superblob, Blob, BlobWrapper, CodeSigningSlot, EmbeddedSignature,
            BLOB_HEADER_SIZE, BLOB_INDEX_SIZE, SUPERBLOB_HEADER_SIZE,
        },
        error::CodesignError,
        macho::{
            align_to, MachOContext, MachOSignaturePayload, SignatureLayout,
            LINKEDIT_DATA_COMMAND_SIZE, MH_EXECUTE, SIGNATURE_ALIGNMENT,
        },
        policy::{certificate_team_id, designated_requirement_set, has_apple_developer_extension},
        signing::{
            verify_envelope_signers, Encapsulation, EnvelopeRequest, Signature,
            SignatureOptions, SignaturePayload, SigningCertificate,
        },
    },
    bcder::{Captured, Mode, OctetString, Oid},
    bytes::Bytes,
    cryptographic_message_syntax::{asn1::rfc5652::OID_ID_DATA, SignedData},
    log::{debug, info, warn},
    std::borrow::Cow,
    x509_certificate::rfc5652::AttributeValue,
};

/// Header size of the CodeDirectory version we emit.
const CODE_DIRECTORY_HEADER_SIZE: usize = 88;

/// Special slots present in emitted CodeDirectories: Info and Requirements.
const EMITTED_SPECIAL_SLOTS: usize = 2;

/// Room for the CMS structure around signer certificates.
const CMS_OVERHEAD: usize = 4096;

/// Extra room for a time-stamp token.
const TIME_STAMP_TOKEN_SIZE: usize = 8192;

/// Digest a CodeDirectory as it would be with the given code page digests.
///
/// The special slot table is rebuilt from `special_digest`, which returns
/// the digest of a slot's blob or `None` for an absent slot (written as
/// zeros). Bytes outside the hash tables are taken from `cd` as is.
pub fn reconstruct_cdhash(
    cd: &[u8],
    layout: &CodeDirectoryLayout,
    digest: DigestAlgorithm,
    special_digest: impl Fn(CodeSigningSlot) -> Option<Vec<u8>>,
    page_digests: impl Iterator<Item = Vec<u8>>,
) -> Result<Vec<u8>, CodesignError> {
    let mut hasher = digest.as_hasher();
    let zeros = vec![0u8; layout.hash_size];

    hasher.update(&cd[..layout.special_slots_offset()]);

    for slot in (1..=layout.n_special_slots as u32).rev() {
        match special_digest(CodeSigningSlot::from(slot)) {
            Some(d) => hasher.update(&d),
            None => hasher.update(&zeros),
        }
    }

    let mut pages = 0;
    for d in page_digests {
        hasher.update(&d);
        pages += 1;
    }

    if pages != layout.n_code_slots {
        return Err(CodesignError::CodeDirectoryMalformed(
            "code slot count does not match code limit",
        ));
    }

    hasher.update(&cd[layout.hashes_end_offset()..layout.length]);

    Ok(hasher.finish().as_ref().to_vec())
}

/// Bytes of `[start, end)` of the signed file image.
///
/// The image is the patched `header` copy, then the original `data`, then
/// zeros.
fn image_range<'a>(header: &'a [u8], data: &'a [u8], start: usize, end: usize) -> Cow<'a, [u8]> {
    if end <= header.len() {
        Cow::Borrowed(&header[start..end])
    } else if start >= header.len() && end <= data.len() {
        Cow::Borrowed(&data[start..end])
    } else {
        let mut page = Vec::with_capacity(end - start);

        if start < header.len() {
            page.extend_from_slice(&header[start..header.len()]);
        }
        let data_start = start.max(header.len());
        if data_start < data.len() {
            page.extend_from_slice(&data[data_start..end.min(data.len())]);
        }
        page.resize(end - start, 0);

        Cow::Owned(page)
    }
}

/// Estimate the SuperBlob size for a signature.
fn estimate_signature_size(
    cd_size: usize,
    requirements_size: usize,
    certificates: &[usize],
    time_stamp: bool,
) -> usize {
    let mut size = SUPERBLOB_HEADER_SIZE + 3 * BLOB_INDEX_SIZE;
    size += cd_size + requirements_size;
    size += BLOB_HEADER_SIZE + CMS_OVERHEAD + certificates.iter().sum::<usize>();

    if time_stamp {
        size += TIME_STAMP_TOKEN_SIZE;
    }

    align_to(size, 1024)
}

fn cdhashes_plist(cdhash: &[u8]) -> Result<Vec<u8>, CodesignError> {
    let mut dict = plist::Dictionary::new();
    dict.insert(
        "cdhashes".to_string(),
        plist::Value::Array(vec![plist::Value::Data(
            cdhash[..cdhash.len().min(20)].to_vec(),
        )]),
    );

    let mut xml = vec![];
    plist::Value::Dictionary(dict).to_writer_xml(&mut xml)?;

    Ok(xml)
}

/// Signature operations on Mach-O binaries.
pub struct MachOHandler;

impl MachOHandler {
    /// Compute the cdhash of the binary's current content.
    ///
    /// The binary must be signed: the digest is defined by its
    /// CodeDirectory.
    pub fn compute_hash(
        data: &[u8],
        ctx: &MachOContext,
        digest: DigestAlgorithm,
    ) -> Result<Vec<u8>, CodesignError> {
        let signature = ctx
            .embedded_signature(data)?
            .ok_or(CodesignError::NotSigned)?;

        Self::compute_hash_with_signature(data, &signature, digest)
    }

    fn compute_hash_with_signature(
        data: &[u8],
        signature: &EmbeddedSignature,
        digest: DigestAlgorithm,
    ) -> Result<Vec<u8>, CodesignError> {
        let cd = signature
            .code_directory_data()?
            .ok_or(CodesignError::SuperblobMalformed)?;
        let layout = CodeDirectoryLayout::from_blob_bytes(cd)?;

        match layout.digest_algorithm() {
            Ok(recorded) if recorded == digest => {}
            Ok(recorded) => {
                return Err(CodesignError::DigestMismatch {
                    requested: digest,
                    recorded: recorded.to_string(),
                })
            }
            Err(_) => {
                return Err(CodesignError::DigestMismatch {
                    requested: digest,
                    recorded: format!("hash type {}", layout.hash_type),
                })
            }
        }

        if layout.scatter_offset.is_some() {
            return Err(CodesignError::Unsupported("scatter vectors"));
        }

        let code_limit = layout.code_limit as usize;
        if code_limit > data.len() {
            return Err(CodesignError::Truncated {
                offset: data.len(),
                needed: code_limit - data.len(),
            });
        }

        let page_size = layout.page_size.unwrap_or(code_limit).max(1);

        reconstruct_cdhash(
            cd,
            &layout,
            digest,
            |slot| {
                signature
                    .find_slot(slot)
                    .map(|entry| entry.digest_with(digest))
            },
            data[..code_limit]
                .chunks(page_size)
                .map(|page| digest.digest_data(page)),
        )
    }

    /// Create a signature for an unsigned binary.
    pub fn create_signature(
        data: &[u8],
        ctx: &MachOContext,
        signer: &SigningCertificate,
        options: &SignatureOptions,
        identifier: &str,
    ) -> Result<Signature, CodesignError> {
        let digest = options.digest();
        if digest == DigestAlgorithm::Sha512 {
            return Err(CodesignError::DigestNotAllowed(digest, "Mach-O"));
        }

        if ctx.is_signed() {
            return Err(CodesignError::AlreadySigned);
        }

        let chain = signer.full_chain(options);

        let team_id = match options.team_id() {
            Some(team) => Some(team.to_string()),
            None if has_apple_developer_extension(signer.certificate()) => {
                certificate_team_id(signer.certificate())?
            }
            None => None,
        };

        let requirements =
            designated_requirement_set(identifier, &chain, team_id.as_deref())?.to_blob_bytes()?;

        let page_size = options.page_size() as usize;
        let code_limit = align_to(data.len(), SIGNATURE_ALIGNMENT);
        let n_code_slots = (code_limit + page_size - 1) / page_size;

        let cd_size = CodeDirectory::size_for(
            CODE_DIRECTORY_HEADER_SIZE,
            identifier,
            team_id.as_deref(),
            digest,
            EMITTED_SPECIAL_SLOTS,
            n_code_slots,
        );
        let certificate_sizes = chain
            .iter()
            .map(|c| c.constructed_data().len())
            .collect::<Vec<_>>();
        let reserved = estimate_signature_size(
            cd_size,
            requirements.len(),
            &certificate_sizes,
            options.time_stamp_url().is_some(),
        );

        let layout = ctx.plan_signature(reserved)?;
        debug!(
            "planned signature at offset {} with {} reserved bytes",
            layout.data_offset, layout.reserved_size
        );

        let page_digests = Self::patched_page_digests(data, ctx, &layout, page_size, digest)?;

        let mut cd = CodeDirectory::new(identifier, digest);
        cd.flags = options.code_signature_flags();
        cd.code_limit = u32::try_from(layout.data_offset)
            .map_err(|_| CodesignError::Unsupported("code limit beyond 4 GiB"))?;
        cd.page_size = options.page_size();
        cd.team_id = team_id;
        cd.exec_seg_base = Some(ctx.text.fileoff);
        cd.exec_seg_limit = Some(ctx.text.filesize);
        cd.exec_seg_flags = Some(match options.executable_segment_flags() {
            Some(flags) => flags,
            None if ctx.file_type == MH_EXECUTE => ExecutableSegmentFlags::MAIN_BINARY,
            None => ExecutableSegmentFlags::empty(),
        });
        cd.special_hashes.insert(
            CodeSigningSlot::RequirementSet,
            digest.digest_data(&requirements),
        );
        cd.code_hashes = page_digests;

        let code_directory = cd.to_blob_bytes()?;
        let cdhash = digest.digest_data(&code_directory);
        info!(
            "signing {} with cdhash {}",
            identifier,
            hex::encode(&cdhash)
        );

        let plist = OctetString::new(Bytes::from(cdhashes_plist(&cdhash)?));

        let envelope = signer.create_envelope(
            options,
            EnvelopeRequest {
                content_type: Oid(Bytes::copy_from_slice(OID_ID_DATA.as_ref())),
                content: code_directory.clone(),
                encapsulation: Encapsulation::Detached,
                attributes: vec![
                    (
                        Oid(Bytes::copy_from_slice(OID_CD_DIGESTS.as_ref())),
                        vec![AttributeValue::new(
                            CodeDirectoryHash::new(digest, &cdhash).to_captured(),
                        )],
                    ),
                    (
                        Oid(Bytes::copy_from_slice(OID_CD_DIGESTS_PLIST.as_ref())),
                        vec![AttributeValue::new(Captured::from_values(
                            Mode::Der,
                            plist.encode_ref(),
                        ))],
                    ),
                ],
            },
        )?;

        Ok(Signature {
            envelope,
            payload: SignaturePayload::MachO(MachOSignaturePayload {
                requirements,
                code_directory,
                layout,
            }),
        })
    }

    /// Page digests of the file as it will be after signing.
    fn patched_page_digests(
        data: &[u8],
        ctx: &MachOContext,
        layout: &SignatureLayout,
        page_size: usize,
        digest: DigestAlgorithm,
    ) -> Result<Vec<Vec<u8>>, CodesignError> {
        let header_len = align_to(
            layout.command_offset + LINKEDIT_DATA_COMMAND_SIZE,
            page_size,
        )
        .min(data.len());

        let mut header = data[..header_len].to_vec();
        ctx.apply_signature_layout(&mut header, layout)?;

        let code_limit = layout.data_offset;

        Ok((0..code_limit)
            .step_by(page_size)
            .map(|start| {
                let end = (start + page_size).min(code_limit);
                digest.digest_data(&image_range(&header, data, start, end))
            })
            .collect())
    }

    /// Embed a created signature.
    pub fn write_signature(
        alloc: &mut dyn Allocation,
        ctx: &MachOContext,
        signature: &Signature,
    ) -> Result<(), CodesignError> {
        let payload = match &signature.payload {
            SignaturePayload::MachO(payload) => payload,
            _ => return Err(CodesignError::SignatureKindMismatch),
        };

        let layout = ctx.plan_signature(payload.layout.reserved_size)?;
        if layout != payload.layout {
            return Err(CodesignError::SignatureLayoutMismatch);
        }

        let wrapper = BlobWrapper {
            data: signature.envelope.clone(),
        }
        .to_blob_bytes()?;

        let superblob = create_superblob(&[
            (CodeSigningSlot::CodeDirectory, payload.code_directory.clone()),
            (CodeSigningSlot::RequirementSet, payload.requirements.clone()),
            (CodeSigningSlot::Signature, wrapper),
        ])?;

        if superblob.len() > layout.reserved_size {
            return Err(CodesignError::SignatureDataTooLarge {
                actual: superblob.len(),
                reserved: layout.reserved_size,
            });
        }

        ctx.apply_signature_layout(alloc.span_mut(), &layout)?;
        alloc.resize(layout.signature_end())?;
        alloc.span_mut()[layout.data_offset..layout.data_offset + superblob.len()]
            .copy_from_slice(&superblob);

        info!(
            "wrote {} byte signature at offset {}",
            superblob.len(),
            layout.data_offset
        );

        Ok(())
    }

    /// Verify the embedded signature against the binary's content.
    ///
    /// Digest and CMS signature mismatches yield `false`.
    pub fn verify(
        data: &[u8],
        ctx: &MachOContext,
        signed_data: &SignedData,
    ) -> Result<bool, CodesignError> {
        let signature = match ctx.embedded_signature(data)? {
            Some(signature) => signature,
            None => return Ok(false),
        };
        let cd = match signature.code_directory_data()? {
            Some(cd) => cd,
            None => return Ok(false),
        };

        let mut recorded = None;
        for signer in signed_data.signers() {
            if let Some(attributes) = signer.signed_attributes() {
                for attribute in attributes.attributes().iter() {
                    if attribute.typ.as_ref() != OID_CD_DIGESTS.as_ref() {
                        continue;
                    }
                    if let Some(value) = attribute.values.first() {
                        recorded = Some(CodeDirectoryHash::from_der(value.as_slice())?);
                    }
                }
            }
        }

        let (digest, expected) = match recorded {
            Some(hash) => (hash.digest_algorithm()?, hash.digest_bytes()),
            None => {
                let layout = CodeDirectoryLayout::from_blob_bytes(cd)?;
                let digest = layout.digest_algorithm()?;
                (digest, digest.digest_data(cd))
            }
        };

        let actual = match Self::compute_hash_with_signature(data, &signature, digest) {
            Ok(hash) => hash,
            Err(CodesignError::DigestMismatch { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        if actual != expected {
            warn!(
                "cdhash mismatch: recorded {}, computed {}",
                hex::encode(&expected),
                hex::encode(&actual)
            );
            return Ok(false);
        }

        Ok(verify_envelope_signers(signed_data, Some(cd)))
    }

    /// Remove the signature.
    ///
    /// Returns `false` when there was no signature. With `truncate` the
    /// signature data is cut from the end of the file; otherwise it is
    /// zeroed in place.
    pub fn remove_signature(
        alloc: &mut dyn Allocation,
        ctx: &MachOContext,
        truncate: bool,
    ) -> Result<bool, CodesignError> {
        let trailing = match ctx.remove_signature_command(alloc.span_mut())? {
            Some(trailing) => trailing,
            None => return Ok(false),
        };

        if truncate {
            let len = alloc.len() - trailing;
            alloc.resize(len)?;
        }

        info!("removed {} bytes of signature data", trailing);

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{allocation::MemoryAllocation, code_directory::paged_digests, testutil::*},
    };

    fn sign(
        data: Vec<u8>,
        options: &SignatureOptions,
    ) -> Result<(MemoryAllocation, Signature), CodesignError> {
        let (cert, key) = self_signed_certificate("Mach-O Signer", None);
        let signer = SigningCertificate::new(&key, cert);

        let ctx = MachOContext::parse(&data)?;
        let signature = MachOHandler::create_signature(&data, &ctx, &signer, options, "tool")?;

        let mut alloc = MemoryAllocation::new(data);
        MachOHandler::write_signature(&mut alloc, &ctx, &signature)?;

        Ok((alloc, signature))
    }

    #[test]
    fn three_page_code_directory() -> Result<(), CodesignError> {
        let original = macho_fixture(3 * 4096, false);
        let (alloc, signature) = sign(original, &SignatureOptions::default())?;
        let data = alloc.span();

        let payload = match &signature.payload {
            SignaturePayload::MachO(payload) => payload,
            _ => panic!("expected Mach-O payload"),
        };

        let ctx = MachOContext::parse(data)?;
        let embedded = ctx.embedded_signature(data)?.unwrap();
        let cd = embedded.code_directory()?.unwrap();

        assert_eq!(cd.identifier, "tool");
        assert_eq!(cd.code_limit as usize, payload.layout.data_offset);
        assert_eq!(cd.code_hashes.len(), 3);
        assert_eq!(
            cd.code_hashes,
            paged_digests(&data[..payload.layout.data_offset], DigestAlgorithm::Sha256, 4096)
        );
        assert_eq!(
            cd.special_hashes.get(&CodeSigningSlot::RequirementSet),
            Some(&DigestAlgorithm::Sha256.digest_data(&payload.requirements))
        );
        assert!(!cd.special_hashes.contains_key(&CodeSigningSlot::Info));
        // Slot 1 (Info) is zero filled and slot 2 holds the requirements, so
        // the hash array is 2 special slots followed by 3 code slots.
        assert_eq!(cd.n_special_slots(), 2);
        assert_eq!(cd.special_hashes.len() + cd.code_hashes.len(), 4);
        assert_eq!(
            cd.exec_seg_flags,
            Some(ExecutableSegmentFlags::MAIN_BINARY)
        );

        let requirements = embedded.code_requirements()?.unwrap();
        assert_eq!(requirements.len(), 1);

        Ok(())
    }

    #[test]
    fn hash_and_verify() -> Result<(), CodesignError> {
        let (mut alloc, signature) = sign(macho_fixture(2 * 4096, false), &SignatureOptions::default())?;
        let payload = match &signature.payload {
            SignaturePayload::MachO(payload) => payload.clone(),
            _ => panic!("expected Mach-O payload"),
        };

        let ctx = MachOContext::parse(alloc.span())?;
        let hash = MachOHandler::compute_hash(alloc.span(), &ctx, DigestAlgorithm::Sha256)?;
        assert_eq!(hash.len(), 32);
        assert_eq!(
            hash,
            DigestAlgorithm::Sha256.digest_data(&payload.code_directory)
        );

        assert!(matches!(
            MachOHandler::compute_hash(alloc.span(), &ctx, DigestAlgorithm::Sha1),
            Err(CodesignError::DigestMismatch { .. })
        ));

        let sd = signature.signed_data()?;
        assert!(MachOHandler::verify(alloc.span(), &ctx, &sd)?);

        // Flip a byte of signed code.
        alloc.span_mut()[4096 + 100] ^= 0xff;
        let ctx = MachOContext::parse(alloc.span())?;
        assert!(!MachOHandler::verify(alloc.span(), &ctx, &sd)?);

        Ok(())
    }

    #[test]
    fn remove_restores_original() -> Result<(), CodesignError> {
        let original = macho_fixture(3 * 4096, false);
        let (mut alloc, _) = sign(original.clone(), &SignatureOptions::default())?;

        let ctx = MachOContext::parse(alloc.span())?;
        assert!(ctx.is_signed());
        assert!(MachOHandler::remove_signature(&mut alloc, &ctx, true)?);
        assert_eq!(alloc.span(), original.as_slice());

        let ctx = MachOContext::parse(alloc.span())?;
        assert!(!MachOHandler::remove_signature(&mut alloc, &ctx, true)?);
        assert!(matches!(
            MachOHandler::compute_hash(alloc.span(), &ctx, DigestAlgorithm::Sha256),
            Err(CodesignError::NotSigned)
        ));

        Ok(())
    }

    #[test]
    fn big_endian_32_bit() -> Result<(), CodesignError> {
        let mut options = SignatureOptions::default();
        options.set_digest(DigestAlgorithm::Sha1);

        let (alloc, signature) = sign(macho_fixture(4096, true), &options)?;
        let ctx = MachOContext::parse(alloc.span())?;

        assert!(ctx.is_signed());
        assert_eq!(
            MachOHandler::compute_hash(alloc.span(), &ctx, DigestAlgorithm::Sha1)?.len(),
            20
        );
        assert!(MachOHandler::verify(
            alloc.span(),
            &ctx,
            &signature.signed_data()?
        )?);

        Ok(())
    }

    #[test]
    fn rejects_sha512_and_stale_layouts() -> Result<(), CodesignError> {
        let (cert, key) = self_signed_certificate("Mach-O Signer", None);
        let signer = SigningCertificate::new(&key, cert);

        let data = macho_fixture(4096, false);
        let ctx = MachOContext::parse(&data)?;

        let mut options = SignatureOptions::default();
        options.set_digest(DigestAlgorithm::Sha512);
        assert!(matches!(
            MachOHandler::create_signature(&data, &ctx, &signer, &options, "tool"),
            Err(CodesignError::DigestNotAllowed(..))
        ));

        let signature = MachOHandler::create_signature(
            &data,
            &ctx,
            &signer,
            &SignatureOptions::default(),
            "tool",
        )?;

        let grown = macho_fixture(2 * 4096, false);
        let grown_ctx = MachOContext::parse(&grown)?;
        let mut alloc = MemoryAllocation::new(grown);
        assert!(matches!(
            MachOHandler::write_signature(&mut alloc, &grown_ctx, &signature),
            Err(CodesignError::SignatureLayoutMismatch)
        ));

        Ok(())
    }

    #[test]
    fn image_range_composition() {
        let header = vec![1u8; 8];
        let data = vec![2u8; 12];

        assert_eq!(image_range(&header, &data, 0, 4).as_ref(), &[1u8; 4]);
        assert_eq!(image_range(&header, &data, 8, 12).as_ref(), &[2u8; 4]);
        assert_eq!(
            image_range(&header, &data, 6, 16).as_ref(),
            &[1, 1, 2, 2, 2, 2, 0, 0, 0, 0][..]
        );
    }
}
