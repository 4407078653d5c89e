//! secp256k1 signing and the pay-to-pubkey script verifier

use crate::blockchain::Hash256;
use crate::error::ChainError;
use crate::utxo::validation::{ScriptCheck, ScriptError, ScriptVerifier};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};

/// Shared context; building one per verification is expensive.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::Crypto(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::Crypto(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    /// The locking script that pays to this key: its compressed encoding.
    pub fn locking_script(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// Compact ECDSA signature over an already computed 32-byte digest.
    pub fn sign_digest(&self, digest: &Hash256) -> [u8; COMPACT_SIGNATURE_SIZE] {
        let message = Message::from_digest(*digest);
        SECP256K1_CONTEXT
            .sign_ecdsa(&message, &self.secret_key)
            .serialize_compact()
    }
}

/// Verify a compact signature over `digest` against a compressed public key.
pub fn verify_signature(
    public_key_bytes: &[u8],
    digest: &Hash256,
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::Crypto(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::Crypto(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::Crypto(format!("Invalid public key: {}", e)))?;
    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::Crypto(format!("Invalid signature: {}", e)))?;
    let message = Message::from_digest(*digest);

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::Crypto("Signature verification failed".to_string()))
}

/// Pay-to-pubkey: the locking script is a compressed public key and the
/// unlocking script a compact signature over the input's signature hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct P2pkVerifier;

impl ScriptVerifier for P2pkVerifier {
    fn verify(&self, check: &ScriptCheck) -> Result<(), ScriptError> {
        let input = check
            .tx
            .inputs
            .get(check.input_index)
            .ok_or(ScriptError::MissingInput(check.input_index))?;
        let digest = check
            .tx
            .signature_hash(check.input_index, &check.locking_script, check.value);

        verify_signature(&check.locking_script, &digest, &input.unlocking_script).map_err(|e| {
            ScriptError::Rejected {
                input_index: check.input_index,
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, Transaction, TxIn, TxOut};
    use std::sync::Arc;

    fn signed_spend(keypair: &KeyPair, value: u64) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: OutPoint::new([7; 32], 0),
                unlocking_script: vec![],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value: value - 1,
                locking_script: vec![0x51],
            }],
            lock_time: 0,
        };
        let digest = tx.signature_hash(0, &keypair.locking_script(), value);
        tx.inputs[0].unlocking_script = keypair.sign_digest(&digest).to_vec();
        tx
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate();
        let digest = [3u8; 32];
        let signature = keypair.sign_digest(&digest);

        assert!(verify_signature(&keypair.locking_script(), &digest, &signature).is_ok());
        let result = verify_signature(&keypair.locking_script(), &[4u8; 32], &signature);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Cryptographic error: Signature verification failed"
        );
    }

    #[test]
    fn test_invalid_key_or_sig_length_check() {
        let keypair = KeyPair::generate();
        let digest = [1u8; 32];
        let signature = keypair.sign_digest(&digest);
        let pubkey = keypair.locking_script();

        let result = verify_signature(&pubkey[1..], &digest, &signature);
        assert!(result.unwrap_err().to_string().contains("Public key must be exactly"));

        let result = verify_signature(&pubkey, &digest, &signature[1..]);
        assert!(result.unwrap_err().to_string().contains("Signature must be exactly"));
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let result = KeyPair::from_secret_bytes(&[0u8; SECRET_KEY_SIZE - 1]);
        assert!(result.unwrap_err().to_string().contains("Secret key must be"));
    }

    #[test]
    fn test_p2pk_verifier_accepts_valid_spend() {
        let keypair = KeyPair::generate();
        let tx = Arc::new(signed_spend(&keypair, 50));
        let check = ScriptCheck {
            tx,
            input_index: 0,
            locking_script: keypair.locking_script(),
            value: 50,
        };
        assert!(P2pkVerifier.verify(&check).is_ok());
    }

    #[test]
    fn test_p2pk_verifier_rejects_wrong_value_or_key() {
        let keypair = KeyPair::generate();
        let other = KeyPair::generate();
        let tx = Arc::new(signed_spend(&keypair, 50));

        let wrong_value = ScriptCheck {
            tx: tx.clone(),
            input_index: 0,
            locking_script: keypair.locking_script(),
            value: 51,
        };
        assert!(matches!(
            P2pkVerifier.verify(&wrong_value),
            Err(ScriptError::Rejected { input_index: 0, .. })
        ));

        let wrong_key = ScriptCheck {
            tx: tx.clone(),
            input_index: 0,
            locking_script: other.locking_script(),
            value: 50,
        };
        assert!(P2pkVerifier.verify(&wrong_key).is_err());

        let out_of_range = ScriptCheck {
            tx,
            input_index: 3,
            locking_script: keypair.locking_script(),
            value: 50,
        };
        assert_eq!(
            P2pkVerifier.verify(&out_of_range),
            Err(ScriptError::MissingInput(3))
        );
    }
}
