//! This crate provides types, traits and functions to bootstrap the X.509
//! trust material of the admission webhook. It creates a self-signed
//! certificate authority (CA), signs a TLS server certificate for the
//! webhook service with it and persists both as PEM files.
//!
//! The CA certificate doubles as the `caBundle` of the webhook registration,
//! which is how the API server learns to trust the serving certificate.
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
//! - <https://kubernetes.io/docs/reference/access-authn-authz/extensible-admission-controllers/>
use rsa::pkcs8::EncodePrivateKey;
use snafu::{ResultExt, Snafu};
use x509_cert::{
    Certificate,
    der::EncodePem,
    spki::EncodePublicKey,
};
use zeroize::Zeroizing;

use crate::{
    ca::PEM_LINE_ENDING,
    cert_builder::{CertificateBuilder, CertificateBuilderBuilder},
    keys::CertificateKeypair,
};

pub mod bundle;
pub mod ca;
pub mod cert_builder;
pub mod keys;

pub use bundle::*;

/// Error variants which can be encountered when encoding a [`CertificatePair`].
#[derive(Debug, Snafu)]
pub enum CertificatePairError {
    #[snafu(display("failed to serialize certificate as PEM"))]
    SerializeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to serialize private key as PKCS8 PEM"))]
    SerializePrivateKey { source: rsa::pkcs8::Error },
}

/// Contains the certificate and the signing / embedded key pair.
///
/// A [`CertificateAuthority`](crate::ca::CertificateAuthority) uses this struct
/// internally to store the signing key pair which is used to sign the CA
/// itself (self-signed) and the server certificate. The server certificate
/// on the other hand uses this to store the bound keypair.
#[derive(Debug)]
pub struct CertificatePair<S>
where
    S: CertificateKeypair,
    <S::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    certificate: Certificate,
    key_pair: S,
}

impl<S> CertificatePair<S>
where
    S: CertificateKeypair,
    <S::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// Use this function in combination with [`CertificateBuilder`] to create
    /// new certificates signed by a CA.
    pub fn builder<'a>() -> CertificateBuilderBuilder<'a, S> {
        CertificateBuilder::start_builder()
    }

    /// Returns a reference to the [`Certificate`].
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Returns a reference to the (signing) key pair.
    pub fn key_pair(&self) -> &S {
        &self.key_pair
    }

    /// Encodes the certificate as PEM (`CERTIFICATE` block).
    pub fn certificate_pem(&self) -> Result<String, CertificatePairError> {
        self.certificate
            .to_pem(PEM_LINE_ENDING)
            .context(SerializeCertificateSnafu)
    }

    /// Encodes the private key as PKCS#8 PEM (`PRIVATE KEY` block).
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, CertificatePairError> {
        self.key_pair
            .signing_key()
            .to_pkcs8_pem(PEM_LINE_ENDING)
            .context(SerializePrivateKeySnafu)
    }
}
