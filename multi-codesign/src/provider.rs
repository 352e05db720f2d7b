// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Format-independent signing sessions.

use {
    crate::{
        allocation::{Allocation, FileAllocation, MemoryAllocation},
        digest::DigestAlgorithm,
        error::CodesignError,
        macho::{is_macho_magic, MachOContext},
        macho_signing::MachOHandler,
        pe::{is_pe_magic, PeContext},
        pe_signing::PeHandler,
        script::{ScriptContext, ScriptHandler},
        signing::{Signature, SignatureOptions, SigningCertificate},
    },
    cryptographic_message_syntax::SignedData,
    log::{debug, info},
    std::path::Path,
};

/// File extensions accepted for PE images.
pub const PE_EXTENSIONS: &[&str] = &["exe", "dll", "sys", "efi", "scr", "ocx", "cpl", "drv", "mui"];

/// File extensions accepted for scripts.
pub const SCRIPT_EXTENSIONS: &[&str] = &["ps1", "psm1", "psd1", "ps1xml", "psc1", "cdxml"];

/// The content formats a session can handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerKind {
    MachO,
    Pe,
    Script,
}

impl HandlerKind {
    /// All handlers, in probing order.
    pub fn all() -> &'static [Self] {
        &[Self::MachO, Self::Pe, Self::Script]
    }

    fn minimum_size(&self) -> usize {
        match self {
            Self::MachO => 28,
            Self::Pe => 64,
            Self::Script => 0,
        }
    }

    /// Extensions a named file must have, if restricted.
    pub fn allowed_extensions(&self) -> Option<&'static [&'static str]> {
        match self {
            Self::MachO => None,
            Self::Pe => Some(PE_EXTENSIONS),
            Self::Script => Some(SCRIPT_EXTENSIONS),
        }
    }

    fn matches_magic(&self, data: &[u8]) -> bool {
        match self {
            Self::MachO => is_macho_magic(data),
            Self::Pe => is_pe_magic(data),
            Self::Script => true,
        }
    }

    /// Whether this handler accepts the content.
    pub fn matches_content(&self, data: &[u8], name: Option<&str>) -> bool {
        if data.len() < self.minimum_size() || !self.matches_magic(data) {
            return false;
        }

        match (name, self.allowed_extensions()) {
            (Some(name), Some(allowed)) => Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(e)))
                .unwrap_or(false),
            _ => true,
        }
    }

    /// Select the first handler accepting the content.
    pub fn detect(data: &[u8], name: Option<&str>) -> Result<Self, CodesignError> {
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.matches_content(data, name))
            .ok_or(CodesignError::UnrecognizedContent)
    }
}

/// Parsed layout of the session content.
enum Context {
    MachO(MachOContext),
    Pe(PeContext),
    Script(ScriptContext),
}

impl Context {
    fn is_signed(&self) -> bool {
        match self {
            Self::MachO(ctx) => ctx.is_signed(),
            Self::Pe(ctx) => ctx.is_signed(),
            Self::Script(ctx) => ctx.is_signed(),
        }
    }
}

/// A signing session over one piece of content.
///
/// The content's layout is parsed again on every call, so a session always
/// acts on its current bytes.
pub struct SigningProvider {
    alloc: Box<dyn Allocation + Send>,
    handler: HandlerKind,
    name: Option<String>,
}

impl SigningProvider {
    fn new(
        alloc: Box<dyn Allocation + Send>,
        handler: Option<HandlerKind>,
        name: Option<String>,
    ) -> Result<Self, CodesignError> {
        let handler = match handler {
            Some(handler) => handler,
            None => HandlerKind::detect(alloc.span(), name.as_deref())?,
        };

        info!(
            "using {:?} handler for {}",
            handler,
            name.as_deref().unwrap_or("<memory>")
        );

        Ok(Self {
            alloc,
            handler,
            name,
        })
    }

    /// Start a session over in-memory content.
    ///
    /// `name` is the content's file name, used for handler selection and as
    /// a default signing identifier.
    pub fn from_data(
        data: Vec<u8>,
        handler: Option<HandlerKind>,
        name: Option<&str>,
    ) -> Result<Self, CodesignError> {
        Self::new(
            Box::new(MemoryAllocation::new(data)),
            handler,
            name.map(|s| s.to_string()),
        )
    }

    /// Start a session over a file. Changes are written by [Self::flush].
    pub fn from_file(
        path: impl AsRef<Path>,
        handler: Option<HandlerKind>,
    ) -> Result<Self, CodesignError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string());

        Self::new(Box::new(FileAllocation::open(path)?), handler, name)
    }

    pub fn handler(&self) -> HandlerKind {
        self.handler
    }

    fn context(&self) -> Result<Context, CodesignError> {
        let data = self.alloc.span();

        Ok(match self.handler {
            HandlerKind::MachO => Context::MachO(MachOContext::parse(data)?),
            HandlerKind::Pe => Context::Pe(PeContext::parse(data)?),
            HandlerKind::Script => Context::Script(ScriptContext::parse(data)?),
        })
    }

    /// Whether the content carries a signature.
    pub fn has_signature(&self) -> Result<bool, CodesignError> {
        Ok(self.context()?.is_signed())
    }

    /// Decode the embedded CMS envelope.
    pub fn get_signature(&self) -> Result<Option<SignedData>, CodesignError> {
        let data = self.alloc.span();

        match self.context()? {
            Context::MachO(ctx) => Ok(ctx
                .embedded_signature(data)?
                .map(|sig| sig.signed_data())
                .transpose()?
                .flatten()),
            Context::Pe(ctx) => PeHandler::get_signature(data, &ctx),
            Context::Script(ctx) => ScriptHandler::get_signature(data, &ctx),
        }
    }

    /// Check an envelope against the current content.
    ///
    /// The digest recorded in the envelope must match the content's digest
    /// and every CMS signer must verify.
    pub fn has_valid_signature(&self, signed_data: &SignedData) -> Result<bool, CodesignError> {
        let data = self.alloc.span();

        let valid = match self.context()? {
            Context::MachO(ctx) => MachOHandler::verify(data, &ctx, signed_data)?,
            Context::Pe(ctx) => PeHandler::verify(data, &ctx, signed_data)?,
            Context::Script(ctx) => ScriptHandler::verify(data, &ctx, signed_data)?,
        };

        debug!("signature valid: {}", valid);

        Ok(valid)
    }

    /// Compute the format-defined content digest.
    pub fn compute_hash(&self, digest: DigestAlgorithm) -> Result<Vec<u8>, CodesignError> {
        let data = self.alloc.span();

        match self.context()? {
            Context::MachO(ctx) => MachOHandler::compute_hash(data, &ctx, digest),
            Context::Pe(ctx) => PeHandler::compute_hash(data, &ctx, digest),
            Context::Script(ctx) => ScriptHandler::compute_hash(data, &ctx, digest),
        }
    }

    /// Remove an existing signature.
    ///
    /// Returns `false` if the content was not signed. With `truncate` the
    /// signature bytes are cut from the end of the content.
    pub fn try_remove_signature(&mut self, truncate: bool) -> Result<bool, CodesignError> {
        let ctx = self.context()?;
        let alloc = self.alloc.as_mut();

        match ctx {
            Context::MachO(ctx) => MachOHandler::remove_signature(alloc, &ctx, truncate),
            Context::Pe(ctx) => PeHandler::remove_signature(alloc, &ctx, truncate),
            Context::Script(ctx) => ScriptHandler::remove_signature(alloc, &ctx, truncate),
        }
    }

    /// The Mach-O signing identifier: the configured one, else the file stem.
    fn identifier(&self, options: &SignatureOptions) -> Result<String, CodesignError> {
        if let Some(identifier) = options.identifier() {
            return Ok(identifier.to_string());
        }

        self.name
            .as_deref()
            .and_then(|name| Path::new(name).file_stem())
            .map(|stem| stem.to_string_lossy().to_string())
            .ok_or(CodesignError::NoIdentifier)
    }

    /// Create a signature for the unsigned content.
    pub fn create_signature(
        &self,
        signer: &SigningCertificate,
        options: &SignatureOptions,
    ) -> Result<Signature, CodesignError> {
        let ctx = self.context()?;
        if ctx.is_signed() {
            return Err(CodesignError::AlreadySigned);
        }

        let data = self.alloc.span();

        match ctx {
            Context::MachO(ctx) => MachOHandler::create_signature(
                data,
                &ctx,
                signer,
                options,
                &self.identifier(options)?,
            ),
            Context::Pe(ctx) => PeHandler::create_signature(data, &ctx, signer, options),
            Context::Script(ctx) => ScriptHandler::create_signature(data, &ctx, signer, options),
        }
    }

    /// Embed a signature produced by [Self::create_signature].
    pub fn write_signature(&mut self, signature: Signature) -> Result<(), CodesignError> {
        let ctx = self.context()?;
        if ctx.is_signed() {
            return Err(CodesignError::AlreadySigned);
        }

        let alloc = self.alloc.as_mut();

        match ctx {
            Context::MachO(ctx) => MachOHandler::write_signature(alloc, &ctx, &signature),
            Context::Pe(ctx) => PeHandler::write_signature(alloc, &ctx, &signature),
            Context::Script(ctx) => ScriptHandler::write_signature(alloc, &ctx, &signature),
        }
    }

    /// The current content.
    pub fn data(&self) -> &[u8] {
        self.alloc.span()
    }

    /// Surrender the current content.
    pub fn into_bytes(self) -> Vec<u8> {
        self.alloc.span().to_vec()
    }

    /// Persist changes to file-backed content.
    pub fn flush(&mut self) -> Result<(), CodesignError> {
        self.alloc.flush()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::*};

    fn assert_send<T: Send>() {}

    #[test]
    fn provider_is_send() {
        assert_send::<SigningProvider>();
    }

    #[test]
    fn handler_detection() {
        let macho = macho_fixture(4096, false);
        let pe = pe_fixture(&[], false);

        assert_eq!(HandlerKind::detect(&macho, None).ok(), Some(HandlerKind::MachO));
        assert_eq!(
            HandlerKind::detect(&macho, Some("tool")).ok(),
            Some(HandlerKind::MachO)
        );
        assert_eq!(HandlerKind::detect(&pe, None).ok(), Some(HandlerKind::Pe));
        assert_eq!(
            HandlerKind::detect(&pe, Some("driver.SYS")).ok(),
            Some(HandlerKind::Pe)
        );
        assert_eq!(
            HandlerKind::detect(b"Get-Date\r\n", Some("x.ps1")).ok(),
            Some(HandlerKind::Script)
        );
        assert_eq!(
            HandlerKind::detect(b"Get-Date\r\n", None).ok(),
            Some(HandlerKind::Script)
        );
        assert!(matches!(
            HandlerKind::detect(&pe, Some("image.txt")),
            Err(CodesignError::UnrecognizedContent)
        ));
        assert!(matches!(
            HandlerKind::detect(b"echo hi\n", Some("run.sh")),
            Err(CodesignError::UnrecognizedContent)
        ));
    }

    fn lifecycle(data: Vec<u8>, name: Option<&str>, options: &SignatureOptions) -> Result<(), CodesignError> {
        let (cert, key) = self_signed_certificate("Provider Signer", None);
        let signer = SigningCertificate::new(&key, cert);

        let mut provider = SigningProvider::from_data(data.clone(), None, name)?;
        assert!(!provider.has_signature()?);
        assert!(provider.get_signature()?.is_none());
        assert!(!provider.try_remove_signature(true)?);

        let signature = provider.create_signature(&signer, options)?;
        let envelope = signature.signed_data()?;
        provider.write_signature(signature)?;

        assert!(provider.has_signature()?);
        let embedded = provider.get_signature()?.unwrap();
        assert!(provider.has_valid_signature(&embedded)?);
        assert!(provider.has_valid_signature(&envelope)?);

        assert!(matches!(
            provider.create_signature(&signer, options),
            Err(CodesignError::AlreadySigned)
        ));

        assert!(provider.try_remove_signature(true)?);
        assert!(!provider.has_signature()?);
        assert_eq!(provider.into_bytes(), data);

        Ok(())
    }

    #[test]
    fn lifecycle_all_formats() -> Result<(), CodesignError> {
        let options = SignatureOptions::default();

        lifecycle(macho_fixture(3 * 4096, false), Some("tool"), &options)?;
        lifecycle(pe_fixture(&[b"text section"], true), Some("app.exe"), &options)?;
        lifecycle(b"Get-Date\r\n".to_vec(), Some("date.ps1"), &options)?;
        lifecycle(utf16le_with_bom("Get-Date\r\n"), None, &options)?;

        let mut options = SignatureOptions::default();
        options.set_identifier("com.example.tool");
        lifecycle(macho_fixture(4096, true), None, &options)?;

        Ok(())
    }

    #[test]
    fn macho_identifier_and_hash() -> Result<(), CodesignError> {
        let (cert, key) = apple_developer_certificate("Developer", "TEAM123456");
        let signer = SigningCertificate::new(&key, cert);

        let provider = SigningProvider::from_data(macho_fixture(4096, false), None, None)?;
        assert!(matches!(
            provider.create_signature(&signer, &SignatureOptions::default()),
            Err(CodesignError::NoIdentifier)
        ));
        assert!(matches!(
            provider.compute_hash(DigestAlgorithm::Sha256),
            Err(CodesignError::NotSigned)
        ));

        let mut provider =
            SigningProvider::from_data(macho_fixture(4096, false), None, Some("tool.bin"))?;
        let signature = provider.create_signature(&signer, &SignatureOptions::default())?;
        provider.write_signature(signature)?;

        let ctx = MachOContext::parse(provider.data())?;
        let embedded = ctx.embedded_signature(provider.data())?.unwrap();
        let cd = embedded.code_directory()?.unwrap();
        assert_eq!(cd.identifier, "tool");
        assert_eq!(cd.team_id.as_deref(), Some("TEAM123456"));

        let requirements = embedded.code_requirements()?.unwrap();
        assert!(requirements.to_string().contains("anchor apple generic"));

        assert_eq!(
            provider.compute_hash(DigestAlgorithm::Sha256)?,
            DigestAlgorithm::Sha256.digest_data(embedded.code_directory_data()?.unwrap())
        );

        Ok(())
    }

    #[test]
    fn digest_lengths() -> Result<(), CodesignError> {
        let provider = SigningProvider::from_data(pe_fixture(&[b"abc"], false), None, None)?;

        for (digest, len) in [
            (DigestAlgorithm::Sha1, 20),
            (DigestAlgorithm::Sha256, 32),
            (DigestAlgorithm::Sha384, 48),
            (DigestAlgorithm::Sha512, 64),
        ] {
            let hash = provider.compute_hash(digest)?;
            assert_eq!(hash.len(), len);
            assert_eq!(hash, provider.compute_hash(digest)?);
        }

        Ok(())
    }

    #[test]
    fn file_backed_session() -> Result<(), CodesignError> {
        let (cert, key) = self_signed_certificate("File Signer", None);
        let signer = SigningCertificate::new(&key, cert);

        let temp = tempfile::Builder::new().suffix(".ps1").tempfile()?;
        std::fs::write(temp.path(), b"Get-ChildItem\r\n")?;

        let mut provider = SigningProvider::from_file(temp.path(), None)?;
        assert_eq!(provider.handler(), HandlerKind::Script);

        let signature = provider.create_signature(&signer, &SignatureOptions::default())?;
        provider.write_signature(signature)?;
        provider.flush()?;

        let reopened = SigningProvider::from_file(temp.path(), None)?;
        assert!(reopened.has_signature()?);
        let sd = reopened.get_signature()?.unwrap();
        assert!(reopened.has_valid_signature(&sd)?);

        Ok(())
    }
}
