use std::time::Duration;

use bon::Builder;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::referenced::OwnedToRef,
    ext::pkix::{BasicConstraints, KeyUsage, KeyUsages, SubjectKeyIdentifier},
    name::Name,
    serial_number::SerialNumber,
    spki::{EncodePublicKey, SubjectPublicKeyInfoOwned},
    time::Validity,
};

use super::CertificateAuthority;
use crate::{
    CertificatePair,
    ca::{DEFAULT_CA_VALIDITY, WEBHOOK_CA_SUBJECT},
    keys::CertificateKeypair,
};

/// Defines all error variants which can occur when creating a CA
#[derive(Debug, Snafu)]
pub enum CreateCertificateAuthorityError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("failed to parse validity"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to parse {subject:?} as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to create signing key pair"))]
    CreateSigningKeyPair { source: E },

    #[snafu(display("failed to encode the public key as SPKI"))]
    EncodeSubjectPublicKeyInfo { source: x509_cert::spki::Error },

    #[snafu(display("failed to derive the SubjectKeyIdentifier from the public key"))]
    DeriveSubjectKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },
}

/// This builder builds certificate authorities of type [`CertificateAuthority`].
///
/// It has default values for everything:
///
/// - A default validity of [`DEFAULT_CA_VALIDITY`]
/// - A default subject of [`WEBHOOK_CA_SUBJECT`]
/// - A randomly generated 64 bit serial number
/// - In case no `signing_key_pair` was provided, a fresh keypair will be
///   created. The algorithm is chosen by the generic [`CertificateKeypair`]
///   type of this struct.
///
/// The CA is self-signed. Its extensions are set explicitly instead of using
/// a builder profile: BasicConstraints (critical, `CA=true`), KeyUsage
/// (critical, `keyCertSign` and `digitalSignature`) and a SubjectKeyIdentifier
/// holding the SHA-1 hash of the public key.
///
/// ```no_run
/// use mutator_certs::ca::CertificateAuthority;
///
/// let ca = CertificateAuthority::builder_with_rsa()
///     .build()
///     .expect("failed to build CA");
/// ```
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct CertificateAuthorityBuilder<'a, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// Subject of the certificate authority, usually starts with `CN=`.
    #[builder(default = WEBHOOK_CA_SUBJECT)]
    subject: &'a str,

    /// Validity/lifetime of the certificate.
    ///
    /// If not specified the default of [`DEFAULT_CA_VALIDITY`] will be used.
    #[builder(default = DEFAULT_CA_VALIDITY)]
    validity: Duration,

    /// Cryptographic keypair used to sign leaf certificates.
    ///
    /// If not specified a random keypair will be generated.
    signing_key_pair: Option<SKP>,
}

impl<SKP, S> CertificateAuthorityBuilderBuilder<'_, SKP, S>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
    S: certificate_authority_builder_builder::IsComplete,
{
    /// Convenience function to avoid calling `builder().finish_builder().build()`
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        self.finish_builder().build()
    }
}

impl<SKP> CertificateAuthorityBuilder<'_, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[instrument(
        name = "build_certificate_authority",
        skip(self),
        fields(subject = self.subject),
    )]
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        let validity = Validity::from_now(self.validity).context(ParseValiditySnafu)?;
        let subject: Name = self.subject.parse().context(ParseSubjectSnafu {
            subject: self.subject,
        })?;
        let signing_key_pair = match self.signing_key_pair {
            Some(signing_key_pair) => signing_key_pair,
            None => SKP::new().context(CreateSigningKeyPairSnafu)?,
        };

        let serial_number = SerialNumber::from(rand::random::<u64>());

        let spki = SubjectPublicKeyInfoOwned::from_key(signing_key_pair.verifying_key())
            .context(EncodeSubjectPublicKeyInfoSnafu)?;
        let ski = SubjectKeyIdentifier::try_from(spki.owned_to_ref())
            .context(DeriveSubjectKeyIdentifierSnafu)?;

        debug!(
            ca.subject = %subject,
            ca.not_after = %validity.not_after,
            ca.not_before = %validity.not_before,
            ca.serial = %serial_number,
            ca.public_key.algorithm = SKP::algorithm_name(),
            ca.public_key.size = SKP::key_size(),
            "creating certificate authority"
        );
        let signer = signing_key_pair.signing_key();
        let mut builder = CertificateBuilder::new(
            Profile::Manual { issuer: None },
            serial_number,
            validity,
            subject,
            spki,
            signer,
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: true,
                path_len_constraint: None,
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&KeyUsage(
                KeyUsages::KeyCertSign | KeyUsages::DigitalSignature,
            ))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&ski)
            .context(AddCertificateExtensionSnafu)?;

        let certificate = builder
            .build::<SKP::Signature>()
            .context(BuildCertificateSnafu)?;

        Ok(CertificateAuthority {
            certificate_pair: CertificatePair {
                certificate,
                key_pair: signing_key_pair,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use const_oid::db::rfc5280::{
        ID_CE_BASIC_CONSTRAINTS, ID_CE_KEY_USAGE, ID_CE_SUBJECT_KEY_IDENTIFIER,
    };
    use x509_cert::{certificate::TbsCertificateInner, der::Decode};

    use super::*;
    use crate::keys::rsa;

    #[test]
    fn minimal_ca() {
        let ca = CertificateAuthority::builder_with_rsa()
            .build()
            .expect("failed to build CA");

        let tbs = &ca.ca_cert().tbs_certificate;
        assert_ca_cert_attributes(tbs, WEBHOOK_CA_SUBJECT, DEFAULT_CA_VALIDITY);
        assert_eq!(tbs.issuer, tbs.subject, "CA must be self-signed");
    }

    #[test]
    fn customized_ca() {
        let ca = CertificateAuthority::builder()
            .subject("CN=Test")
            .signing_key_pair(rsa::SigningKey::new().unwrap())
            .validity(Duration::from_secs(13 * 24 * 60 * 60))
            .build()
            .expect("failed to build CA");

        assert_ca_cert_attributes(
            &ca.ca_cert().tbs_certificate,
            "CN=Test",
            Duration::from_secs(13 * 24 * 60 * 60),
        );
    }

    #[test]
    fn ca_extensions() {
        let ca = CertificateAuthority::builder_with_rsa()
            .build()
            .expect("failed to build CA");
        let extensions = ca
            .ca_cert()
            .tbs_certificate
            .extensions
            .as_ref()
            .expect("CA had no extensions");

        let basic_constraints = extensions
            .iter()
            .find(|ext| ext.extn_id == ID_CE_BASIC_CONSTRAINTS)
            .expect("CA had no BasicConstraints extension");
        assert!(basic_constraints.critical);
        let basic_constraints =
            BasicConstraints::from_der(basic_constraints.extn_value.as_bytes()).unwrap();
        assert!(basic_constraints.ca);

        let key_usage = extensions
            .iter()
            .find(|ext| ext.extn_id == ID_CE_KEY_USAGE)
            .expect("CA had no KeyUsage extension");
        let key_usage = KeyUsage::from_der(key_usage.extn_value.as_bytes()).unwrap();
        assert!(key_usage.key_cert_sign());
        assert!(key_usage.digital_signature());
        assert!(!key_usage.crl_sign());

        assert!(
            extensions
                .iter()
                .any(|ext| ext.extn_id == ID_CE_SUBJECT_KEY_IDENTIFIER)
        );
    }

    #[test]
    fn invalid_subject() {
        let err = CertificateAuthority::builder_with_rsa()
            .subject("not a distinguished name")
            .build()
            .expect_err("CA creation must fail");

        assert!(matches!(
            err,
            CreateCertificateAuthorityError::ParseSubject { .. }
        ));
    }

    fn assert_ca_cert_attributes(ca_cert: &TbsCertificateInner, subject: &str, validity: Duration) {
        assert_eq!(ca_cert.subject, subject.parse().unwrap());

        let not_before = ca_cert.validity.not_before.to_system_time();
        let not_after = ca_cert.validity.not_after.to_system_time();
        assert_eq!(
            not_after
                .duration_since(not_before)
                .expect("Failed to calculate duration between notBefore and notAfter"),
            validity
        );
    }
}
