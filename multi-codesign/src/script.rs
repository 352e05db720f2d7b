// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signature blocks in text scripts.
//!
//! A signed script ends with a comment block holding the base64 encoded
//! CMS envelope:
//!
//! ```text
//! \r\n# SIG # Begin signature block\r\n
//! # MIIF...(64 columns)\r\n
//! # ...\r\n
//! # SIG # End signature block\r\n
//! ```
//!
//! The block is written in the script's own encoding. The signed digest
//! covers the text before the block, always as UTF-16LE without BOM.

use {
    crate::{
        allocation::Allocation,
        asn1::{SpcIndirectDataContent, OID_SPC_INDIRECT_DATA, OID_SPC_SIPINFO},
        digest::DigestAlgorithm,
        error::CodesignError,
        pe_signing::{
            authenticode_attributes, indirect_data, parse_authenticode_envelope,
            verify_authenticode_signers,
        },
        signing::{
            Encapsulation, EnvelopeRequest, Signature, SignatureOptions, SignaturePayload,
            SigningCertificate,
        },
    },
    bcder::Oid,
    bytes::Bytes,
    cryptographic_message_syntax::SignedData,
    log::{info, warn},
};

pub const SIGNATURE_BLOCK_HEADER: &str = "\r\n# SIG # Begin signature block\r\n";
pub const SIGNATURE_BLOCK_FOOTER: &str = "# SIG # End signature block\r\n";

const LINE_PREFIX: &str = "# ";
const LINE_END: &str = "\r\n";
const LINE_WIDTH: usize = 64;

/// Encoding of a script file, detected from its byte order mark.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TextEncoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
}

impl TextEncoding {
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&[0xef, 0xbb, 0xbf]) {
            Self::Utf8Bom
        } else if data.starts_with(&[0xff, 0xfe]) {
            Self::Utf16Le
        } else if data.starts_with(&[0xfe, 0xff]) {
            Self::Utf16Be
        } else {
            Self::Utf8
        }
    }

    /// Length of the byte order mark.
    pub fn bom_len(&self) -> usize {
        match self {
            Self::Utf8 => 0,
            Self::Utf8Bom => 3,
            Self::Utf16Le | Self::Utf16Be => 2,
        }
    }

    /// Size of a code unit.
    pub fn unit_size(&self) -> usize {
        match self {
            Self::Utf8 | Self::Utf8Bom => 1,
            Self::Utf16Le | Self::Utf16Be => 2,
        }
    }

    /// Encode text, without byte order mark.
    pub fn encode(&self, s: &str) -> Vec<u8> {
        match self {
            Self::Utf8 | Self::Utf8Bom => s.as_bytes().to_vec(),
            Self::Utf16Le => s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect(),
            Self::Utf16Be => s.encode_utf16().flat_map(|c| c.to_be_bytes()).collect(),
        }
    }

    /// Decode text that has no byte order mark.
    pub fn decode(&self, data: &[u8]) -> Result<String, CodesignError> {
        match self {
            Self::Utf8 | Self::Utf8Bom => std::str::from_utf8(data)
                .map(|s| s.to_string())
                .map_err(|_| CodesignError::TextEncoding("invalid UTF-8")),
            Self::Utf16Le | Self::Utf16Be => {
                if data.len() % 2 != 0 {
                    return Err(CodesignError::TextEncoding("odd length UTF-16 data"));
                }

                let units = data
                    .chunks_exact(2)
                    .map(|c| {
                        let pair = [c[0], c[1]];
                        if *self == Self::Utf16Le {
                            u16::from_le_bytes(pair)
                        } else {
                            u16::from_be_bytes(pair)
                        }
                    })
                    .collect::<Vec<_>>();

                String::from_utf16(&units).map_err(|_| CodesignError::TextEncoding("invalid UTF-16"))
            }
        }
    }
}

/// Find `needle` at a position `start + n * unit`.
fn find_aligned(
    haystack: &[u8],
    needle: &[u8],
    start: usize,
    unit: usize,
    last: bool,
) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }

    let mut positions = (start..=haystack.len() - needle.len())
        .step_by(unit)
        .filter(|pos| &haystack[*pos..*pos + needle.len()] == needle);

    if last {
        positions.last()
    } else {
        positions.next()
    }
}

/// Decode the payload lines of a signature block.
fn decode_payload(text: &str, block_offset: usize) -> Result<Vec<u8>, CodesignError> {
    let malformed = |message| CodesignError::MalformedSignatureBlock {
        offset: block_offset,
        message,
    };

    let mut encoded = String::with_capacity(text.len());
    let mut rest = text;
    let mut saw_short_line = false;

    while !rest.is_empty() {
        let line_end = rest
            .find(LINE_END)
            .ok_or_else(|| malformed("payload line without CRLF"))?;
        let body = rest[..line_end]
            .strip_prefix(LINE_PREFIX)
            .ok_or_else(|| malformed("payload line without comment prefix"))?;

        if body.is_empty() || body.len() > LINE_WIDTH {
            return Err(malformed("payload line has invalid width"));
        }
        if body.contains(|c| c == '\r' || c == '\n') {
            return Err(malformed("stray newline in payload line"));
        }
        if saw_short_line {
            return Err(malformed("short payload line before end of block"));
        }

        saw_short_line = body.len() < LINE_WIDTH;
        encoded.push_str(body);
        rest = &rest[line_end + LINE_END.len()..];
    }

    if encoded.is_empty() {
        return Err(malformed("empty signature block"));
    }

    Ok(base64::decode(&encoded)?)
}

/// Render a signature block for an envelope.
fn encode_block(envelope: &[u8]) -> String {
    let encoded = base64::encode(envelope);

    let mut block = String::from(SIGNATURE_BLOCK_HEADER);
    for line in encoded.as_bytes().chunks(LINE_WIDTH) {
        block.push_str(LINE_PREFIX);
        // base64 output is ASCII.
        block.push_str(&String::from_utf8_lossy(line));
        block.push_str(LINE_END);
    }
    block.push_str(SIGNATURE_BLOCK_FOOTER);

    block
}

/// Location of a signature block in a script.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScriptContext {
    pub encoding: TextEncoding,
    /// Offset of the block header.
    pub header_offset: Option<usize>,
    /// Offset of the block footer.
    pub footer_offset: Option<usize>,
    pub file_len: usize,
}

impl ScriptContext {
    pub fn parse(data: &[u8]) -> Result<Self, CodesignError> {
        let encoding = TextEncoding::detect(data);
        let unit = encoding.unit_size();

        let header = encoding.encode(SIGNATURE_BLOCK_HEADER);
        let header_offset = find_aligned(data, &header, encoding.bom_len(), unit, false);

        let footer_offset = match header_offset {
            Some(header_offset) => {
                let footer = encoding.encode(SIGNATURE_BLOCK_FOOTER);
                let footer_offset =
                    find_aligned(data, &footer, header_offset + header.len(), unit, true)
                        .ok_or(CodesignError::MalformedSignatureBlock {
                            offset: header_offset,
                            message: "signature block has no end marker",
                        })?;

                let end = footer_offset + footer.len();
                if end < data.len() {
                    return Err(CodesignError::TrailingData(data.len() - end));
                }

                Some(footer_offset)
            }
            None => None,
        };

        Ok(Self {
            encoding,
            header_offset,
            footer_offset,
            file_len: data.len(),
        })
    }

    pub fn is_signed(&self) -> bool {
        self.header_offset.is_some()
    }

    /// The signed text: everything before the block, without BOM.
    pub fn signed_text<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let end = self.header_offset.unwrap_or(data.len());

        &data[self.encoding.bom_len().min(end)..end]
    }

    /// Compute the script digest.
    pub fn digest(&self, data: &[u8], digest: DigestAlgorithm) -> Result<Vec<u8>, CodesignError> {
        let text = self.signed_text(data);

        Ok(match self.encoding {
            TextEncoding::Utf8 | TextEncoding::Utf8Bom => {
                let utf16 = TextEncoding::Utf16Le.encode(&self.encoding.decode(text)?);
                digest.digest_data(&utf16)
            }
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => digest.digest_data(text),
        })
    }

    /// The decoded envelope bytes of the signature block.
    pub fn signature_data(&self, data: &[u8]) -> Result<Option<Vec<u8>>, CodesignError> {
        let (header_offset, footer_offset) = match (self.header_offset, self.footer_offset) {
            (Some(h), Some(f)) => (h, f),
            _ => return Ok(None),
        };

        let payload_start = header_offset + self.encoding.encode(SIGNATURE_BLOCK_HEADER).len();
        let text = self
            .encoding
            .decode(&data[payload_start..footer_offset])?;

        decode_payload(&text, header_offset).map(Some)
    }
}

/// Signature operations on text scripts.
pub struct ScriptHandler;

impl ScriptHandler {
    pub fn compute_hash(
        data: &[u8],
        ctx: &ScriptContext,
        digest: DigestAlgorithm,
    ) -> Result<Vec<u8>, CodesignError> {
        ctx.digest(data, digest)
    }

    pub fn get_signature(
        data: &[u8],
        ctx: &ScriptContext,
    ) -> Result<Option<SignedData>, CodesignError> {
        ctx.signature_data(data)?
            .map(|der| parse_authenticode_envelope(&der))
            .transpose()
    }

    pub fn create_signature(
        data: &[u8],
        ctx: &ScriptContext,
        signer: &SigningCertificate,
        options: &SignatureOptions,
    ) -> Result<Signature, CodesignError> {
        if ctx.is_signed() {
            return Err(CodesignError::AlreadySigned);
        }

        let digest = options.digest();
        let text_digest = ctx.digest(data, digest)?;
        info!(
            "signing script with {} digest {}",
            digest,
            hex::encode(&text_digest)
        );

        let envelope = signer.create_envelope(
            options,
            EnvelopeRequest {
                content_type: Oid(Bytes::copy_from_slice(OID_SPC_INDIRECT_DATA.as_ref())),
                content: SpcIndirectDataContent::script(digest, &text_digest).to_der()?,
                encapsulation: Encapsulation::Authenticode,
                attributes: authenticode_attributes(),
            },
        )?;

        Ok(Signature {
            envelope,
            payload: SignaturePayload::None,
        })
    }

    /// Append the signature block.
    pub fn write_signature(
        alloc: &mut dyn Allocation,
        ctx: &ScriptContext,
        signature: &Signature,
    ) -> Result<(), CodesignError> {
        if signature.payload != SignaturePayload::None {
            return Err(CodesignError::SignatureKindMismatch);
        }
        if ctx.is_signed() {
            return Err(CodesignError::AlreadySigned);
        }

        let block = ctx.encoding.encode(&encode_block(&signature.envelope));
        let start = alloc.len();

        alloc.resize(start + block.len())?;
        alloc.span_mut()[start..].copy_from_slice(&block);

        info!("appended {} byte signature block", block.len());

        Ok(())
    }

    pub fn verify(
        data: &[u8],
        ctx: &ScriptContext,
        signed_data: &SignedData,
    ) -> Result<bool, CodesignError> {
        let indirect = match indirect_data(signed_data) {
            Some(indirect) => indirect,
            None => return Ok(false),
        };

        if indirect.data.typ.as_ref() != OID_SPC_SIPINFO.as_ref() {
            warn!("indirect data does not describe a script");
            return Ok(false);
        }

        let (digest, expected) = indirect.digest()?;
        if ctx.digest(data, digest)? != expected {
            warn!("script digest mismatch");
            return Ok(false);
        }

        verify_authenticode_signers(signed_data)
    }

    /// Remove the signature block.
    ///
    /// Text has no layout to preserve, so the block is always cut and
    /// `truncate` has no effect.
    pub fn remove_signature(
        alloc: &mut dyn Allocation,
        ctx: &ScriptContext,
        _truncate: bool,
    ) -> Result<bool, CodesignError> {
        match ctx.header_offset {
            Some(offset) => {
                info!("removing {} byte signature block", alloc.len() - offset);
                alloc.resize(offset)?;

                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{allocation::MemoryAllocation, testutil::*},
    };

    const SCRIPT: &str = "Write-Host \"hello\"\r\n";

    fn sign(data: Vec<u8>) -> Result<MemoryAllocation, CodesignError> {
        let (cert, key) = self_signed_certificate("Script Signer", None);
        let signer = SigningCertificate::new(&key, cert);

        let ctx = ScriptContext::parse(&data)?;
        let signature =
            ScriptHandler::create_signature(&data, &ctx, &signer, &SignatureOptions::default())?;

        let mut alloc = MemoryAllocation::new(data);
        ScriptHandler::write_signature(&mut alloc, &ctx, &signature)?;

        Ok(alloc)
    }

    #[test]
    fn encoding_detection() {
        assert_eq!(TextEncoding::detect(b"abc"), TextEncoding::Utf8);
        assert_eq!(TextEncoding::detect(b"\xef\xbb\xbfabc"), TextEncoding::Utf8Bom);
        assert_eq!(TextEncoding::detect(b"\xff\xfea\0"), TextEncoding::Utf16Le);
        assert_eq!(TextEncoding::detect(b"\xfe\xff\0a"), TextEncoding::Utf16Be);
    }

    #[test]
    fn utf8_and_utf16_digests_agree() -> Result<(), CodesignError> {
        let utf8 = SCRIPT.as_bytes().to_vec();
        let mut utf8_bom = vec![0xef, 0xbb, 0xbf];
        utf8_bom.extend_from_slice(SCRIPT.as_bytes());
        let utf16 = utf16le_with_bom(SCRIPT);

        let digest = |data: &[u8]| {
            ScriptContext::parse(data).and_then(|ctx| ctx.digest(data, DigestAlgorithm::Sha256))
        };

        let expected = digest(&utf8)?;
        assert_eq!(digest(&utf8_bom)?, expected);
        assert_eq!(digest(&utf16)?, expected);

        Ok(())
    }

    #[test]
    fn round_trip() -> Result<(), CodesignError> {
        for original in [SCRIPT.as_bytes().to_vec(), utf16le_with_bom(SCRIPT)] {
            let mut alloc = sign(original.clone())?;

            let ctx = ScriptContext::parse(alloc.span())?;
            assert!(ctx.is_signed());
            assert_eq!(ctx.header_offset, Some(original.len()));

            let sd = ScriptHandler::get_signature(alloc.span(), &ctx)?.unwrap();
            assert!(ScriptHandler::verify(alloc.span(), &ctx, &sd)?);

            assert!(ScriptHandler::remove_signature(&mut alloc, &ctx, true)?);
            assert_eq!(alloc.span(), original.as_slice());
        }

        Ok(())
    }

    #[test]
    fn block_layout() -> Result<(), CodesignError> {
        let alloc = sign(SCRIPT.as_bytes().to_vec())?;
        let text = std::str::from_utf8(alloc.span()).unwrap();

        let block = &text[SCRIPT.len()..];
        assert!(block.starts_with(SIGNATURE_BLOCK_HEADER));
        assert!(block.ends_with(SIGNATURE_BLOCK_FOOTER));

        let lines = block[SIGNATURE_BLOCK_HEADER.len()..block.len() - SIGNATURE_BLOCK_FOOTER.len()]
            .split_terminator("\r\n")
            .collect::<Vec<_>>();
        assert!(lines.len() > 1);
        for line in &lines[..lines.len() - 1] {
            assert_eq!(line.len(), 2 + 64);
            assert!(line.starts_with("# "));
        }

        Ok(())
    }

    #[test]
    fn tampering_invalidates() -> Result<(), CodesignError> {
        let mut alloc = sign(SCRIPT.as_bytes().to_vec())?;
        alloc.span_mut()[1] = b'X';

        let ctx = ScriptContext::parse(alloc.span())?;
        let sd = ScriptHandler::get_signature(alloc.span(), &ctx)?.unwrap();
        assert!(!ScriptHandler::verify(alloc.span(), &ctx, &sd)?);

        Ok(())
    }

    #[test]
    fn malformed_blocks() -> Result<(), CodesignError> {
        let header_only = format!("{}{}# AAAA\r\n", SCRIPT, SIGNATURE_BLOCK_HEADER);
        assert!(matches!(
            ScriptContext::parse(header_only.as_bytes()),
            Err(CodesignError::MalformedSignatureBlock { .. })
        ));

        let trailing = format!(
            "{}{}# AAAA\r\n{}junk",
            SCRIPT, SIGNATURE_BLOCK_HEADER, SIGNATURE_BLOCK_FOOTER
        );
        assert!(matches!(
            ScriptContext::parse(trailing.as_bytes()),
            Err(CodesignError::TrailingData(4))
        ));

        let bad_prefix = format!(
            "{}{}#AAAA\r\n{}",
            SCRIPT, SIGNATURE_BLOCK_HEADER, SIGNATURE_BLOCK_FOOTER
        );
        let ctx = ScriptContext::parse(bad_prefix.as_bytes())?;
        assert!(matches!(
            ctx.signature_data(bad_prefix.as_bytes()),
            Err(CodesignError::MalformedSignatureBlock { .. })
        ));

        let short_then_long = format!(
            "{}{}# AAAA\r\n# {}\r\n{}",
            SCRIPT,
            SIGNATURE_BLOCK_HEADER,
            "A".repeat(64),
            SIGNATURE_BLOCK_FOOTER
        );
        let ctx = ScriptContext::parse(short_then_long.as_bytes())?;
        assert!(matches!(
            ctx.signature_data(short_then_long.as_bytes()),
            Err(CodesignError::MalformedSignatureBlock { .. })
        ));

        let bad_alphabet = format!(
            "{}{}# AA*A\r\n{}",
            SCRIPT, SIGNATURE_BLOCK_HEADER, SIGNATURE_BLOCK_FOOTER
        );
        let ctx = ScriptContext::parse(bad_alphabet.as_bytes())?;
        assert!(matches!(
            ctx.signature_data(bad_alphabet.as_bytes()),
            Err(CodesignError::Base64(_))
        ));

        let unsigned = ScriptContext::parse(SCRIPT.as_bytes())?;
        assert!(!unsigned.is_signed());
        assert_eq!(unsigned.signature_data(SCRIPT.as_bytes())?, None);

        Ok(())
    }
}
