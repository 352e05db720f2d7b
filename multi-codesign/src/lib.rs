// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing for Mach-O, PE and script files.
//!
//! This crate creates, embeds, verifies and removes code signatures across
//! three file families:
//!
//! * Mach-O binaries (thin, 32 or 64 bit, either byte order). Signatures are
//!   an embedded SuperBlob holding a CodeDirectory, a requirement set and a
//!   CMS envelope, referenced by an `LC_CODE_SIGNATURE` load command.
//! * PE images (executables, libraries, drivers). Signatures are Authenticode
//!   CMS envelopes stored in the attribute certificate table referenced by the
//!   security data directory.
//! * Text scripts. Signatures are base64 encoded CMS envelopes in a commented
//!   `# SIG # Begin signature block` trailer.
//!
//! # Getting Started
//!
//! The [SigningProvider] type is the entry point. Construct one from a path
//! or from in-memory bytes and it selects the handler that understands the
//! content. From there you can query [SigningProvider::has_signature()],
//! [SigningProvider::has_valid_signature()], compute the content digest,
//! create a [Signature] with a [SigningCertificate] and [SignatureOptions],
//! write it and remove it.
//!
//! Lower level access to the data structures is available too: see
//! [CodeDirectory], [EmbeddedSignature], [RequirementExpression],
//! [MachOContext], [PeContext] and [ScriptContext].
//!
//! # Limitations
//!
//! * Universal (fat) Mach-O binaries must be thinned first.
//! * Only a designated requirement is emitted and no entitlements, resources
//!   or alternate CodeDirectories are produced.
//! * Certificate trust evaluation is out of scope: validity checks confirm
//!   that the embedded digest matches the content and that the CMS signature
//!   verifies against the embedded signer certificate.

mod allocation;
pub use allocation::*;
pub mod asn1;
mod code_directory;
pub use code_directory::*;
pub mod code_requirement;
pub use code_requirement::*;
mod digest;
pub use digest::*;
pub mod embedded_signature;
pub use embedded_signature::*;
mod error;
pub use error::*;
mod macho;
pub use macho::*;
mod macho_signing;
pub use macho_signing::*;
mod pe;
pub use pe::*;
mod pe_signing;
pub use pe_signing::*;
mod policy;
pub use policy::*;
mod provider;
pub use provider::*;
mod script;
pub use script::*;
mod signing;
pub use signing::*;
#[cfg(test)]
mod testutil;
