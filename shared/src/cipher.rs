use crate::StoreError;

/// Field-level encryption for personal data persisted with orders and addresses.
pub trait FieldCipher: Send + Sync {
    fn encrypt(&self, value: &str) -> Result<String, StoreError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, StoreError>;
}

/// Stores values as given. Used where encryption is handled below the database layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl FieldCipher for PlaintextCipher {
    fn encrypt(&self, value: &str) -> Result<String, StoreError> {
        Ok(value.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, StoreError> {
        Ok(ciphertext.to_string())
    }
}
