use std::time::{Duration, SystemTime};

use bon::Builder;
use const_oid::db::rfc5280::ID_KP_SERVER_AUTH;
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, Profile},
    der::{asn1::Ia5String, referenced::OwnedToRef},
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
        SubjectAltName, name::GeneralName,
    },
    name::Name,
    serial_number::SerialNumber,
    spki::{EncodePublicKey, SubjectPublicKeyInfoOwned},
    time::{Time, Validity},
};

use crate::{
    CertificatePair,
    ca::CertificateAuthority,
    keys::CertificateKeypair,
};

/// Defines all error variants which can occur when creating a certificate
#[derive(Debug, Snafu)]
pub enum CreateCertificateError<E>
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

    #[snafu(display("failed to create key pair"))]
    CreateKeyPair { source: E },

    #[snafu(display("failed to encode the public key as SPKI"))]
    EncodeSubjectPublicKeyInfo { source: x509_cert::spki::Error },

    #[snafu(display("failed to derive the AuthorityKeyIdentifier from the CA public key"))]
    DeriveAuthorityKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display(
        "failed to parse subject alternative DNS name {subject_alternative_dns_name:?} as a Ia5 string"
    ))]
    ParseSubjectAlternativeDnsName {
        subject_alternative_dns_name: String,
        source: x509_cert::der::Error,
    },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },

    #[snafu(display(
        "the generated certificate would outlive the CA, subject {subject:?}, \
        CA notAfter {ca_not_after:?}, cert notAfter {cert_not_after:?}"
    ))]
    CertOutlivesCa {
        subject: String,
        ca_not_after: SystemTime,
        cert_not_after: SystemTime,
    },
}

/// This builder builds TLS server certificates of type [`CertificatePair`],
/// signed by a [`CertificateAuthority`].
///
/// The certificate is restricted to server authentication: KeyUsage only
/// carries `digitalSignature`, ExtendedKeyUsage only carries
/// [`ID_KP_SERVER_AUTH`] and BasicConstraints marks it as a non-CA
/// certificate. The AuthorityKeyIdentifier points at the signing CA.
///
/// Defaults:
///
/// - Valid from now until the CA expires
/// - A randomly generated 64 bit serial number
/// - In case no `key_pair` was provided, a fresh keypair will be created.
///
/// ```no_run
/// use mutator_certs::{ca::CertificateAuthority, CertificatePair};
///
/// let ca = CertificateAuthority::builder_with_rsa()
///     .build()
///     .expect("failed to build CA");
///
/// let certificate = CertificatePair::builder()
///     .subject("CN=webhook-server.webhook-demo.svc")
///     .subject_alternative_dns_names(&["webhook-server.webhook-demo.svc"])
///     .signed_by(&ca)
///     .build()
///     .expect("failed to build certificate");
/// ```
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct CertificateBuilder<'a, KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// Required subject of the certificate, usually starts with `CN=`.
    subject: &'a str,

    /// Optional list of subject alternative name DNS entries
    /// that are added to the certificate.
    #[builder(default)]
    subject_alternative_dns_names: &'a [&'a str],

    /// Validity/lifetime of the certificate.
    ///
    /// If not specified the certificate expires together with the CA.
    validity: Option<Duration>,

    /// Cryptographic keypair bound to the certificate.
    ///
    /// If not specified a random keypair will be generated.
    key_pair: Option<KP>,

    /// Mandatorily sign the certificate using the provided [`CertificateAuthority`].
    signed_by: &'a CertificateAuthority<KP>,
}

impl<KP, S> CertificateBuilderBuilder<'_, KP, S>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
    S: certificate_builder_builder::IsComplete,
{
    /// Convenience function to avoid calling `builder().finish_builder().build()`
    pub fn build(self) -> Result<CertificatePair<KP>, CreateCertificateError<KP::Error>> {
        self.finish_builder().build()
    }
}

impl<SKP> CertificateBuilder<'_, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[instrument(
        name = "build_certificate",
        skip(self),
        fields(subject = self.subject),
    )]
    pub fn build(self) -> Result<CertificatePair<SKP>, CreateCertificateError<SKP::Error>> {
        let validity = match self.validity {
            Some(validity) => Validity::from_now(validity).context(ParseValiditySnafu)?,
            None => Validity {
                not_before: Time::try_from(SystemTime::now()).context(ParseValiditySnafu)?,
                not_after: self.signed_by.ca_cert().tbs_certificate.validity.not_after,
            },
        };
        let subject: Name = self.subject.parse().context(ParseSubjectSnafu {
            subject: self.subject,
        })?;

        let ca_not_after = self
            .signed_by
            .ca_cert()
            .tbs_certificate
            .validity
            .not_after
            .to_system_time();
        let cert_not_after = validity.not_after.to_system_time();
        ensure!(ca_not_after >= cert_not_after, CertOutlivesCaSnafu {
            subject: self.subject,
            ca_not_after,
            cert_not_after,
        });

        let key_pair = match self.key_pair {
            Some(key_pair) => key_pair,
            None => SKP::new().context(CreateKeyPairSnafu)?,
        };

        let serial_number = SerialNumber::from(rand::random::<u64>());

        let spki = SubjectPublicKeyInfoOwned::from_key(key_pair.verifying_key())
            .context(EncodeSubjectPublicKeyInfoSnafu)?;
        let aki = AuthorityKeyIdentifier::try_from(
            self.signed_by
                .ca_cert()
                .tbs_certificate
                .subject_public_key_info
                .owned_to_ref(),
        )
        .context(DeriveAuthorityKeyIdentifierSnafu)?;

        let sans = self
            .subject_alternative_dns_names
            .iter()
            .map(|dns_name| {
                Ok(GeneralName::DnsName(Ia5String::new(dns_name).with_context(
                    |_| ParseSubjectAlternativeDnsNameSnafu {
                        subject_alternative_dns_name: dns_name.to_string(),
                    },
                )?))
            })
            .collect::<Result<Vec<_>, CreateCertificateError<SKP::Error>>>()?;

        debug!(
            certificate.subject = %subject,
            certificate.not_after = %validity.not_after,
            certificate.not_before = %validity.not_before,
            certificate.serial = %serial_number,
            certificate.san.dns_names = ?self.subject_alternative_dns_names,
            certificate.signed_by.issuer = %self.signed_by.subject_name(),
            certificate.public_key.algorithm = SKP::algorithm_name(),
            certificate.public_key.size = SKP::key_size(),
            "creating and signing certificate"
        );
        let signing_key = self.signed_by.signing_key();
        let mut builder = x509_cert::builder::CertificateBuilder::new(
            Profile::Manual {
                issuer: Some(self.signed_by.subject_name().clone()),
            },
            serial_number,
            validity,
            subject,
            spki,
            signing_key,
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: false,
                path_len_constraint: None,
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&KeyUsage(KeyUsages::DigitalSignature.into()))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&ExtendedKeyUsage(vec![ID_KP_SERVER_AUTH]))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&aki)
            .context(AddCertificateExtensionSnafu)?;

        if !sans.is_empty() {
            builder
                .add_extension(&SubjectAltName(sans))
                .context(AddCertificateExtensionSnafu)?;
        }

        let certificate = builder
            .build::<SKP::Signature>()
            .context(BuildCertificateSnafu)?;

        Ok(CertificatePair {
            certificate,
            key_pair,
        })
    }
}
