//! Abstraction layer around the [`rsa`] crate. This module provides types
//! which abstract away the generation of RSA keys used for signing the CA
//! and the serving certificate.
use rand_core::{CryptoRngCore, OsRng};
use rsa::RsaPrivateKey;
use signature::Keypair;
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::keys::CertificateKeypair;

#[cfg(not(test))]
const KEY_SIZE: usize = 2048;

#[cfg(test)]
const KEY_SIZE: usize = 512;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("failed to create RSA key"))]
    CreateKey { source: rsa::Error },
}

#[derive(Debug)]
pub struct SigningKey(rsa::pkcs1v15::SigningKey<sha2::Sha256>);

impl CertificateKeypair for SigningKey {
    type Error = Error;
    type Signature = rsa::pkcs1v15::Signature;
    type SigningKey = rsa::pkcs1v15::SigningKey<sha2::Sha256>;
    type VerifyingKey = rsa::pkcs1v15::VerifyingKey<sha2::Sha256>;

    /// Generates a new RSA key with the default random-number generator
    /// [`OsRng`].
    ///
    /// Generating a 2048 bit key usually takes a few hundred milliseconds,
    /// so callers on an async runtime should do this on a blocking thread.
    #[instrument(name = "create_rsa_signing_key")]
    fn new() -> Result<Self> {
        let mut csprng = OsRng;
        Self::new_with_rng(&mut csprng)
    }

    #[instrument(name = "create_rsa_signing_key_custom_rng", skip_all)]
    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self>
    where
        Rng: CryptoRngCore + ?Sized,
    {
        let private_key = RsaPrivateKey::new(rng, KEY_SIZE).context(CreateKeySnafu)?;
        let signing_key = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(private_key);

        Ok(Self(signing_key))
    }

    fn signing_key(&self) -> &Self::SigningKey {
        &self.0
    }

    fn verifying_key(&self) -> Self::VerifyingKey {
        self.0.verifying_key()
    }

    fn algorithm_name() -> &'static str {
        "rsa"
    }

    fn key_size() -> usize {
        KEY_SIZE
    }
}
