//! Key management
//!
//! secp256k1 keypairs with keccak-derived 20-byte addresses. Key files live
//! under a `keys/` directory: the private key is written 0600, the address
//! 0644.

use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::validation::address_of;

pub const PRIVATE_KEY_FILE: &str = "poai_private_key.txt";
pub const ADDRESS_FILE: &str = "poai_address.txt";

pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    /// Restore a keypair from its hex-encoded private key
    pub fn from_hex(private_hex: &str) -> Result<Self, String> {
        let bytes = hex::decode(private_hex).map_err(|e| e.to_string())?;
        let signing = SigningKey::from_slice(&bytes).map_err(|e| e.to_string())?;
        Ok(Self { signing })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        use k256::elliptic_curve::sec1::ToEncodedPoint;
        hex::encode(self.signing.verifying_key().to_encoded_point(false).as_bytes())
    }

    /// 20-byte account address
    pub fn address(&self) -> Vec<u8> {
        address_of(self.signing.verifying_key())
    }

    pub fn address_hex(&self) -> String {
        hex::encode(self.address())
    }
}

/// Write the key files under `<output_dir>/keys/` and return their paths
/// (private key first).
pub fn save_key_files(output_dir: &Path, keypair: &Keypair) -> io::Result<(PathBuf, PathBuf)> {
    let keys_dir = output_dir.join("keys");
    fs::create_dir_all(&keys_dir)?;

    let key_path = keys_dir.join(PRIVATE_KEY_FILE);
    fs::write(&key_path, keypair.private_key_hex())?;
    let addr_path = keys_dir.join(ADDRESS_FILE);
    fs::write(&addr_path, keypair.address_hex())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        fs::set_permissions(&addr_path, fs::Permissions::from_mode(0o644))?;
    }

    Ok((key_path, addr_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_address_is_20_bytes() {
        let keypair = Keypair::generate();
        assert_eq!(keypair.address().len(), 20);
    }

    #[test]
    fn test_hex_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_hex(&keypair.private_key_hex()).unwrap();
        assert_eq!(restored.address(), keypair.address());
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(Keypair::from_hex("zz").is_err());
        assert!(Keypair::from_hex("abcd").is_err());
    }

    #[test]
    fn test_key_files_written_with_modes() {
        let dir = TempDir::new().unwrap();
        let keypair = Keypair::generate();
        let (key_path, addr_path) = save_key_files(dir.path(), &keypair).unwrap();

        assert_eq!(
            fs::read_to_string(&key_path).unwrap(),
            keypair.private_key_hex()
        );
        assert_eq!(
            fs::read_to_string(&addr_path).unwrap(),
            keypair.address_hex()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let mode = fs::metadata(&addr_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }
}
