// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trust policies engraved into Mach-O signatures.
//!
//! Every signature we produce carries a designated requirement: the
//! expression a verifier evaluates to decide whether a future version of the
//! code comes from the same signer. Certificates issued by Apple to
//! developers carry extensions under `1.2.840.113635.100.6.1` and identify
//! the team in the subject OU, which lets the requirement pin the team
//! rather than a specific certificate. For any other certificate the
//! requirement pins the digest of the root certificate.

use {
    crate::{
        code_requirement::{
            MatchOperation, RequirementExpression, RequirementNode, RequirementSet,
            RequirementType,
        },
        digest::DigestAlgorithm,
        error::CodesignError,
    },
    bcder::{ConstOid, Oid},
    x509_certificate::{rfc4519::OID_ORGANIZATIONAL_UNIT_NAME, CapturedX509Certificate},
};

/// Prefix of certificate extensions Apple places on developer certificates.
///
/// 1.2.840.113635.100.6.1
pub const OID_APPLE_DEVELOPER_EXTENSION_PREFIX: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 99, 100, 6, 1]);

/// Whether a certificate carries an extension under the Apple developer arc.
pub fn has_apple_developer_extension(cert: &CapturedX509Certificate) -> bool {
    let prefix = OID_APPLE_DEVELOPER_EXTENSION_PREFIX.as_ref();
    let tbs: &x509_certificate::rfc5280::Certificate = cert.as_ref();

    tbs.iter_extensions().any(|ext| {
        let id = ext.id.as_ref();
        id.len() > prefix.len() && id.starts_with(prefix)
    })
}

/// The team identifier recorded in a certificate's subject OU, if any.
pub fn certificate_team_id(cert: &CapturedX509Certificate) -> Result<Option<String>, CodesignError> {
    cert.subject_name()
        .find_first_attribute_string(Oid(OID_ORGANIZATIONAL_UNIT_NAME.as_ref().into()))
        .map_err(|e| CodesignError::Asn1Decode(format!("{}", e)))
}

/// Build the designated requirement for signed code.
///
/// `chain` is ordered leaf first; its last element is the root. When the leaf
/// is an Apple developer certificate the expression is
/// `identifier X and anchor apple generic and certificate leaf[subject.OU] = TEAM`.
/// Otherwise it is `identifier X and certificate root = H"<sha1 of root>"`.
///
/// `team_id` overrides the team read from the leaf certificate.
pub fn designated_requirement(
    identifier: &str,
    chain: &[&CapturedX509Certificate],
    team_id: Option<&str>,
) -> Result<RequirementExpression, CodesignError> {
    let leaf = chain
        .first()
        .ok_or(CodesignError::CertificateChain("empty certificate chain".into()))?;
    let root = chain.last().unwrap_or(leaf);

    let mut builder = RequirementExpression::builder();
    let ident = builder.push(RequirementNode::Identifier(identifier.to_string()))?;

    let trust = if has_apple_developer_extension(leaf) {
        let team = match team_id {
            Some(team) => Some(team.to_string()),
            None => certificate_team_id(leaf)?,
        };

        let anchor = builder.push(RequirementNode::AnchorAppleGeneric)?;

        match team {
            Some(team) => {
                let ident_anchor = builder.and(ident, anchor)?;
                let ou = builder.push(RequirementNode::CertificateField(
                    0,
                    "subject.OU".to_string(),
                    MatchOperation::Equal(team.into()),
                ))?;

                let root_node = builder.and(ident_anchor, ou)?;

                return builder.build(root_node);
            }
            None => anchor,
        }
    } else {
        let digest = DigestAlgorithm::Sha1.digest_data(root.constructed_data());

        builder.push(RequirementNode::AnchorCertificateHash(-1, digest))?
    };

    let root_node = builder.and(ident, trust)?;
    builder.build(root_node)
}

/// A requirement set holding only the designated requirement.
pub fn designated_requirement_set(
    identifier: &str,
    chain: &[&CapturedX509Certificate],
    team_id: Option<&str>,
) -> Result<RequirementSet, CodesignError> {
    let mut set = RequirementSet::default();
    set.set(
        RequirementType::Designated,
        designated_requirement(identifier, chain, team_id)?,
    );

    Ok(set)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::*};

    #[test]
    fn self_signed_pins_root_digest() -> Result<(), CodesignError> {
        let (cert, _key) = self_signed_certificate("Test Signer", None);
        assert!(!has_apple_developer_extension(&cert));

        let expr = designated_requirement("com.example.tool", &[&cert], None)?;
        assert_eq!(
            expr.to_string(),
            format!(
                "identifier \"com.example.tool\" and certificate root = H\"{}\"",
                hex::encode(DigestAlgorithm::Sha1.digest_data(cert.constructed_data()))
            )
        );

        Ok(())
    }

    #[test]
    fn apple_developer_pins_team() -> Result<(), CodesignError> {
        let (cert, _key) = apple_developer_certificate("Developer", "TEAM123456");
        assert!(has_apple_developer_extension(&cert));
        assert_eq!(certificate_team_id(&cert)?.as_deref(), Some("TEAM123456"));

        let expr = designated_requirement("com.example.tool", &[&cert], None)?;
        assert_eq!(
            expr.to_string(),
            "identifier \"com.example.tool\" and anchor apple generic and \
             certificate leaf[subject.OU] = \"TEAM123456\""
        );

        let expr = designated_requirement("x", &[&cert], Some("OTHER"))?;
        assert!(expr.to_string().ends_with("= \"OTHER\""));

        let set = designated_requirement_set("x", &[&cert], None)?;
        assert_eq!(set.len(), 1);
        assert!(set.get(RequirementType::Designated).is_some());

        Ok(())
    }

    #[test]
    fn empty_chain() {
        assert!(matches!(
            designated_requirement("x", &[], None),
            Err(CodesignError::CertificateChain(_))
        ));
    }
}
