//! Contains primitives to create private keys, which are used to sign the
//! webhook CA and bind to the serving certificate.
//!
//! Only RSA is supported. API servers and most TLS clients accept
//! PKCS#1 v1.5 signatures with SHA-256 without any further configuration.
//!
//! ```no_run
//! use mutator_certs::keys::{rsa::SigningKey, CertificateKeypair};
//! let key = SigningKey::new().unwrap();
//! ```
//!
//! The [`rsa`] crate is affected by the Marvin timing attack, see
//! <https://rustsec.org/advisories/RUSTSEC-2023-0071.html>. Keys generated
//! here are only used for signing, never for decryption.
use std::fmt::Debug;

use rand_core::CryptoRngCore;
use ::rsa::pkcs8::EncodePrivateKey;
use signature::{Keypair, Signer};
use x509_cert::spki::{EncodePublicKey, SignatureAlgorithmIdentifier, SignatureBitStringEncoding};

pub mod rsa;

pub trait CertificateKeypair
where
    <Self::SigningKey as Keypair>::VerifyingKey: EncodePublicKey,
    Self: Debug + Sized,
{
    type SigningKey: SignatureAlgorithmIdentifier
        + Keypair
        + Signer<Self::Signature>
        + EncodePrivateKey;
    type Signature: SignatureBitStringEncoding;
    type VerifyingKey: EncodePublicKey;

    type Error: std::error::Error + 'static;

    /// Generates a new key with the default random-number generator [`rand_core::OsRng`].
    fn new() -> Result<Self, Self::Error>;

    /// Generates a new key with a custom random-number generator.
    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self, Self::Error>
    where
        Rng: CryptoRngCore + ?Sized;

    /// Returns the signing (private) key half of the keypair.
    fn signing_key(&self) -> &Self::SigningKey;

    /// Returns the verifying (public) half of the keypair.
    fn verifying_key(&self) -> Self::VerifyingKey;

    /// The name of the algorithm, for example `rsa`.
    fn algorithm_name() -> &'static str;

    /// The key length in bits
    fn key_size() -> usize;
}
