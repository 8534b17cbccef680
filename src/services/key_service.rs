use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{HashAlg, LineEnding};
use russh::keys::{decode_secret_key, PrivateKey, PublicKey};

use crate::utils::error::{MoleError, Result};

/// Generated key size. The old deployments used 1024-bit keys, which is
/// why the loader still accepts them; new keys are never that small.
pub const RSA_KEY_BITS: usize = 2048;

/// Generate a fresh RSA key pair, returning `(public, private)` with the
/// public side in authorized_keys wire form and the private side in PEM.
pub fn generate_keypair() -> Result<(String, String)> {
    let keypair = RsaKeypair::random(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| MoleError::KeyGeneration(format!("failed to generate RSA key: {}", e)))?;

    let comment = format!(
        "{}@{}",
        whoami::username(),
        whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string())
    );

    let private = PrivateKey::new(KeypairData::Rsa(keypair), comment)
        .map_err(|e| MoleError::KeyGeneration(format!("failed to assemble key: {}", e)))?;

    let private_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| MoleError::KeyGeneration(format!("failed to encode private key: {}", e)))?
        .to_string();

    let public_line = private
        .public_key()
        .to_openssh()
        .map_err(|e| MoleError::KeyGeneration(format!("failed to encode public key: {}", e)))?;

    Ok((public_line, private_pem))
}

/// Parse a private key PEM. Accepts OpenSSH, PKCS#8 and legacy PKCS#1
/// encodings.
pub fn parse_private_key(pem: &str) -> Result<PrivateKey> {
    decode_secret_key(pem, None)
        .map_err(|e| MoleError::KeyParse(format!("failed to parse private key: {}", e)))
}

/// Parse one authorized_keys line into a public key.
pub fn parse_public_key(line: &str) -> Result<PublicKey> {
    PublicKey::from_openssh(line.trim())
        .map_err(|e| MoleError::KeyParse(format!("failed to parse public key: {}", e)))
}

/// SHA256 fingerprint for log messages
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}
