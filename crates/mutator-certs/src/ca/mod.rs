//! Contains types and functions to generate and sign certificate authorities
//! (CAs) and certificates.
use std::fmt::Debug;

use x509_cert::{Certificate, name::Name, spki::EncodePublicKey};

use crate::{
    CertificatePair,
    keys::{CertificateKeypair, rsa},
};

mod ca_builder;
mod consts;
pub use ca_builder::*;
pub use consts::*;

/// A self-signed certificate authority (CA) which is used to sign the
/// webhook serving certificate.
///
/// Use [`CertificateAuthorityBuilder`] to create new certificates.
#[derive(Debug)]
pub struct CertificateAuthority<SK>
where
    SK: CertificateKeypair,
    <SK::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    certificate_pair: CertificatePair<SK>,
}

impl<SK> CertificateAuthority<SK>
where
    SK: CertificateKeypair,
    <SK::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    pub fn new(certificate_pair: CertificatePair<SK>) -> Self {
        Self { certificate_pair }
    }

    /// Use this function in combination with [`CertificateAuthorityBuilder`] to create new CAs.
    pub fn builder() -> CertificateAuthorityBuilderBuilder<'static, SK> {
        CertificateAuthorityBuilder::start_builder()
    }

    pub fn signing_key(&self) -> &SK::SigningKey {
        self.certificate_pair.key_pair().signing_key()
    }

    pub fn verifying_key(&self) -> SK::VerifyingKey {
        self.certificate_pair.key_pair().verifying_key()
    }

    pub fn ca_cert(&self) -> &Certificate {
        self.certificate_pair.certificate()
    }

    pub fn certificate_pair(&self) -> &CertificatePair<SK> {
        &self.certificate_pair
    }

    /// The subject of the CA, which is the issuer of every certificate it signs.
    pub fn subject_name(&self) -> &Name {
        &self.ca_cert().tbs_certificate.subject
    }
}

impl CertificateAuthority<rsa::SigningKey> {
    /// Same as [`Self::builder`], but enforces the RSA algorithm for key creation.
    pub fn builder_with_rsa() -> CertificateAuthorityBuilderBuilder<'static, rsa::SigningKey> {
        Self::builder()
    }
}
