//! Column-wise encryption decorator.
//!
//! Columns flagged [`SecurityFlag::Encrypt`] are reversibly encrypted,
//! [`SecurityFlag::OneWayHash`] columns are hashed and [`SecurityFlag::Hide`]
//! columns are blanked. The schema keeps the logical data type; protected
//! values travel as hex strings.

use crate::core::transform::{Capabilities, Transform, TransformStats};
use crate::domain::model::{DataType, Row, Value};
use crate::domain::query::{Filter, SelectQuery, Sort};
use crate::domain::schema::{Column, Schema, SecurityFlag};
use crate::utils::error::{EtlError, Result};
use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const ENCRYPTED_PREFIX: &str = "enc:";
const KEY_CONTEXT: &[u8] = b"flow-etl value encryption";
/// GCM-SIV stays safe under a repeated nonce and then only reveals equality.
const NONCE: [u8; 12] = [0; 12];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    EncryptValues,
    DecryptValues,
}

/// AES-256-GCM-SIV for reversible values and keyed SHA-256 for hashes.
///
/// Encryption is deterministic, so equal values encrypt equally and encrypted
/// natural keys still match. Tampered values or a wrong key fail to decrypt.
#[derive(Clone)]
pub struct ValueCipher {
    aead: Aes256GcmSiv,
    hash_key: Vec<u8>,
}

impl std::fmt::Debug for ValueCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCipher").finish_non_exhaustive()
    }
}

impl ValueCipher {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        let derived = Sha256::new()
            .chain_update(KEY_CONTEXT)
            .chain_update(key.as_ref())
            .finalize();
        Self {
            aead: Aes256GcmSiv::new(&derived),
            hash_key: key.as_ref().to_vec(),
        }
    }

    pub fn encrypt(&self, column: &str, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&NONCE), value.to_string().as_bytes())
            .map_err(|e| EtlError::Function {
                transform: "encryption".to_string(),
                function: "encrypt".to_string(),
                message: format!("cannot encrypt '{}': {}", column, e),
            })?;
        Ok(Value::String(format!("{}{}", ENCRYPTED_PREFIX, hex::encode(sealed))))
    }

    /// Reverses [`ValueCipher::encrypt`], parsing the plaintext as `data_type`.
    pub fn decrypt(&self, column: &str, value: &Value, data_type: DataType) -> Result<Value> {
        let text = match value {
            Value::Null => return Ok(Value::Null),
            Value::String(s) => s,
            other => return Ok(other.clone()),
        };
        let fail = |reason: &str| EtlError::Conversion {
            column: column.to_string(),
            value: text.clone(),
            data_type: data_type.as_str().to_string(),
            reason: reason.to_string(),
        };
        let encoded = text
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or_else(|| fail("value is not encrypted"))?;
        let sealed = hex::decode(encoded).map_err(|e| fail(&e.to_string()))?;
        let data = self
            .aead
            .decrypt(Nonce::from_slice(&NONCE), sealed.as_ref())
            .map_err(|_| fail("wrong key or corrupt value"))?;
        let plain = String::from_utf8(data).map_err(|_| fail("decrypted value is not text"))?;
        data_type.parse(column, &plain)
    }

    pub fn hash(&self, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        let mut hasher = Sha256::new();
        hasher.update(&self.hash_key);
        hasher.update(value.to_string().as_bytes());
        Value::String(hex::encode(hasher.finalize()))
    }

    /// Applies a column's security flag to one of its values.
    pub fn protect(&self, column: &Column, value: &Value) -> Result<Value> {
        Ok(match column.security_flag {
            SecurityFlag::None => value.clone(),
            SecurityFlag::Encrypt => self.encrypt(&column.name, value)?,
            SecurityFlag::OneWayHash => self.hash(value),
            SecurityFlag::Hide => Value::Null,
        })
    }
}

pub struct EncryptTransform {
    inner: Box<dyn Transform>,
    method: EncryptionMethod,
    cipher: Arc<ValueCipher>,
    flags: Vec<SecurityFlag>,
}

impl EncryptTransform {
    pub fn new(inner: Box<dyn Transform>, method: EncryptionMethod, cipher: Arc<ValueCipher>) -> Self {
        Self {
            inner,
            method,
            cipher,
            flags: Vec::new(),
        }
    }

    fn apply(&self, mut row: Row) -> Result<Row> {
        let schema = self.inner.schema();
        for (ordinal, flag) in self.flags.iter().enumerate() {
            if *flag == SecurityFlag::None {
                continue;
            }
            let column = &schema.columns[ordinal];
            row[ordinal] = match (self.method, flag) {
                (_, SecurityFlag::Hide) => Value::Null,
                (EncryptionMethod::EncryptValues, _) => self.cipher.protect(column, &row[ordinal])?,
                (EncryptionMethod::DecryptValues, SecurityFlag::Encrypt) => {
                    self.cipher.decrypt(&column.name, &row[ordinal], column.data_type)?
                }
                // Hashes cannot be reversed.
                (EncryptionMethod::DecryptValues, _) => row[ordinal].clone(),
            };
        }
        Ok(row)
    }
}

#[async_trait]
impl Transform for EncryptTransform {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn sort_fields(&self) -> Vec<Sort> {
        // Protected columns no longer sort like their plaintext.
        let schema = self.inner.schema();
        self.inner
            .sort_fields()
            .into_iter()
            .take_while(|s| {
                schema
                    .column(&s.column)
                    .map(|c| c.security_flag == SecurityFlag::None)
                    .unwrap_or(false)
            })
            .collect()
    }

    async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        self.inner.open(audit_key, query, cancel).await?;
        self.flags = self
            .inner
            .schema()
            .columns
            .iter()
            .map(|c| c.security_flag)
            .collect();
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        match self.inner.read_record(cancel).await? {
            Some(row) => Ok(Some(self.apply(row)?)),
            None => Ok(None),
        }
    }

    async fn lookup_row_direct(&mut self, filters: &[Filter], cancel: &CancellationToken) -> Result<Vec<Row>> {
        let rows = self.inner.lookup_row_direct(filters, cancel).await?;
        rows.into_iter().map(|row| self.apply(row)).collect()
    }

    fn stats(&self) -> TransformStats {
        TransformStats::default()
    }

    fn primary(&self) -> Option<&dyn Transform> {
        Some(self.inner.as_ref())
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::{CachePolicy, CachedTransform};
    use crate::core::transforms::memory::MemoryTransform;
    use crate::domain::schema::Column;

    fn people() -> MemoryTransform {
        let schema = Schema::new(
            "people",
            vec![
                Column::new("id", DataType::Int),
                Column::new("salary", DataType::Int).with_security(SecurityFlag::Encrypt),
                Column::new("email", DataType::String).with_security(SecurityFlag::OneWayHash),
                Column::new("notes", DataType::String).with_security(SecurityFlag::Hide),
            ],
        );
        MemoryTransform::new(
            schema,
            vec![vec![1.into(), 5000.into(), "a@x.io".into(), "secret".into()]],
        )
    }

    #[test]
    fn test_cipher_round_trip_and_determinism() {
        let cipher = ValueCipher::new("k1");
        let encrypted = cipher.encrypt("salary", &Value::Int(5000)).unwrap();
        assert_ne!(encrypted, Value::Int(5000));
        assert_eq!(cipher.encrypt("salary", &Value::Int(5000)).unwrap(), encrypted);
        assert_ne!(cipher.encrypt("salary", &Value::Int(5001)).unwrap(), encrypted);
        assert_eq!(
            cipher.decrypt("salary", &encrypted, DataType::Int).unwrap(),
            Value::Int(5000)
        );
        assert!(ValueCipher::new("k2")
            .decrypt("salary", &encrypted, DataType::Int)
            .is_err());
        assert_eq!(cipher.hash(&Value::Null), Value::Null);
    }

    #[test]
    fn test_tampered_value_fails_to_decrypt() {
        let cipher = ValueCipher::new("k1");
        let Value::String(encrypted) = cipher.encrypt("salary", &Value::Int(5000)).unwrap() else {
            panic!("encrypted values are strings");
        };
        let last = encrypted.chars().last().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        let tampered = format!("{}{}", &encrypted[..encrypted.len() - 1], flipped);
        let err = cipher
            .decrypt("salary", &Value::String(tampered), DataType::Int)
            .unwrap_err();
        assert!(matches!(err, EtlError::Conversion { .. }));
    }

    #[tokio::test]
    async fn test_encrypts_before_rows_are_cached() {
        let cancel = CancellationToken::new();
        let cipher = Arc::new(ValueCipher::new("key"));
        let encrypt = EncryptTransform::new(
            Box::new(people()),
            EncryptionMethod::EncryptValues,
            cipher.clone(),
        );
        let mut cached = CachedTransform::new(Box::new(encrypt), CachePolicy::OnDemandCache);
        cached.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        let row = cached.read_record(&cancel).await.unwrap().unwrap();

        assert_eq!(row[0], Value::Int(1));
        assert_eq!(row[1], cipher.encrypt("salary", &Value::Int(5000)).unwrap());
        assert_eq!(row[2], cipher.hash(&Value::from("a@x.io")));
        assert_eq!(row[3], Value::Null);
        assert_eq!(cached.cached_rows()[0], row);

        let schema = cached.schema().clone();
        let mut decrypt = EncryptTransform::new(
            Box::new(MemoryTransform::new(schema, vec![row])),
            EncryptionMethod::DecryptValues,
            cipher,
        );
        decrypt.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        let plain = decrypt.read_record(&cancel).await.unwrap().unwrap();
        assert_eq!(plain[1], Value::Int(5000));
    }
}
