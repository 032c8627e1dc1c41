//! Gateway-A: encrypted webhooks.
//!
//! Deliveries arrive either wrapped as `{"body": "<ciphertext>"}`, as a bare
//! ciphertext string, or as the plaintext JSON itself. Ciphertext is hex
//! (either case) or base64. Decryption tries the current cipher
//! configuration first and falls back to the legacy one.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyInit, KeyIvInit};
use aes::{Aes128, Aes256};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use super::{amount_field, parse_json, required_field, string_field, CodecError, StatusTable};
use crate::domain::{EventSource, Provider, ProviderEvent};

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;

pub const STATUS_TABLE: StatusTable = StatusTable {
    provider: Provider::GatewayA,
    completed: &["TXN"],
    failed: &["ERR", "FAL", "REF", "FAIL"],
    pending: &["PND", "PENDING", "INP"],
};

/// Cipher configurations in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherConfig {
    /// AES-256-CBC, key = SHA-256(merchant key), IV prefixed to the ciphertext.
    Aes256Cbc,
    /// AES-128-ECB, key = first 16 bytes of the merchant key.
    LegacyAes128Ecb,
}

impl CipherConfig {
    const ATTEMPT_ORDER: [CipherConfig; 2] = [CipherConfig::Aes256Cbc, CipherConfig::LegacyAes128Ecb];

    fn name(&self) -> &'static str {
        match self {
            CipherConfig::Aes256Cbc => "aes-256-cbc",
            CipherConfig::LegacyAes128Ecb => "legacy-aes-128-ecb",
        }
    }

    fn decrypt(&self, merchant_key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, &'static str> {
        match self {
            CipherConfig::Aes256Cbc => {
                if ciphertext.len() < 2 * BLOCK_SIZE || ciphertext.len() % BLOCK_SIZE != 0 {
                    return Err("ciphertext length is not IV plus whole blocks");
                }
                let (iv, body) = ciphertext.split_at(BLOCK_SIZE);
                let key = Sha256::digest(merchant_key.as_bytes());
                Aes256CbcDec::new_from_slices(key.as_slice(), iv)
                    .map_err(|_| "invalid key or IV length")?
                    .decrypt_padded_vec_mut::<Pkcs7>(body)
                    .map_err(|_| "bad padding")
            }
            CipherConfig::LegacyAes128Ecb => {
                let key = merchant_key.as_bytes();
                if key.len() < BLOCK_SIZE {
                    return Err("merchant key shorter than 16 bytes");
                }
                if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
                    return Err("ciphertext length is not whole blocks");
                }
                Aes128EcbDec::new_from_slice(&key[..BLOCK_SIZE])
                    .map_err(|_| "invalid key length")?
                    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| "bad padding")
            }
        }
    }
}

enum Envelope {
    Plain(Value),
    Encrypted(String),
}

#[derive(Clone)]
pub struct EncryptedCodec {
    merchant_key: String,
}

impl fmt::Debug for EncryptedCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedCodec").field("merchant_key", &"****").finish()
    }
}

impl EncryptedCodec {
    pub fn new(merchant_key: impl Into<String>) -> Self {
        Self {
            merchant_key: merchant_key.into(),
        }
    }

    pub fn decode(&self, body: &[u8]) -> Result<ProviderEvent, CodecError> {
        let payload = match unwrap_envelope(body)? {
            Envelope::Plain(payload) => payload,
            Envelope::Encrypted(text) => {
                let ciphertext = normalize_ciphertext(&text)?;
                let plaintext = self.decrypt(&ciphertext)?;
                parse_json(&plaintext)?
            }
        };
        to_event(payload)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        for (attempt, config) in CipherConfig::ATTEMPT_ORDER.iter().enumerate() {
            match config.decrypt(&self.merchant_key, ciphertext) {
                Ok(plaintext) if looks_like_json_object(&plaintext) => {
                    if attempt > 0 {
                        tracing::info!(
                            provider = %Provider::GatewayA,
                            cipher = config.name(),
                            "Payload decrypted with fallback cipher"
                        );
                    }
                    return Ok(plaintext);
                }
                Ok(_) => {
                    tracing::debug!(
                        provider = %Provider::GatewayA,
                        cipher = config.name(),
                        "Cipher attempt produced non-JSON plaintext"
                    );
                }
                Err(reason) => {
                    tracing::debug!(
                        provider = %Provider::GatewayA,
                        cipher = config.name(),
                        reason,
                        "Cipher attempt failed"
                    );
                }
            }
        }

        let attempts = CipherConfig::ATTEMPT_ORDER.len();
        tracing::warn!(
            provider = %Provider::GatewayA,
            attempts,
            ciphertext_len = ciphertext.len(),
            "All cipher attempts failed"
        );
        Err(CodecError::Undecryptable { attempts })
    }
}

fn unwrap_envelope(body: &[u8]) -> Result<Envelope, CodecError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(mut map)) => match map.remove("body") {
            Some(Value::String(ciphertext)) => Ok(Envelope::Encrypted(ciphertext)),
            Some(_) => Err(CodecError::MalformedPayload(
                "`body` envelope field is not a string".to_string(),
            )),
            None => Ok(Envelope::Plain(Value::Object(map))),
        },
        Ok(Value::String(ciphertext)) => Ok(Envelope::Encrypted(ciphertext)),
        Ok(_) => Err(CodecError::MalformedPayload(
            "expected a JSON object or ciphertext string".to_string(),
        )),
        Err(_) => {
            let text = std::str::from_utf8(body)
                .map_err(|_| CodecError::MalformedCiphertext("body is not UTF-8".to_string()))?;
            Ok(Envelope::Encrypted(text.to_string()))
        }
    }
}

/// Hex (upper or lower case) or standard base64, whitespace ignored.
fn normalize_ciphertext(text: &str) -> Result<Vec<u8>, CodecError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(CodecError::MalformedCiphertext("empty ciphertext".to_string()));
    }

    if compact.len() % 2 == 0 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
        return hex::decode(compact.to_ascii_lowercase())
            .map_err(|e| CodecError::MalformedCiphertext(e.to_string()));
    }

    STANDARD
        .decode(compact.as_bytes())
        .map_err(|_| CodecError::MalformedCiphertext("neither hex nor base64".to_string()))
}

fn looks_like_json_object(plaintext: &[u8]) -> bool {
    std::str::from_utf8(plaintext)
        .map(|text| text.trim_start().starts_with('{'))
        .unwrap_or(false)
}

fn to_event(payload: Value) -> Result<ProviderEvent, CodecError> {
    let order_id = required_field(&payload, &["merchantTranId", "merchantTranID"], "merchantTranId")?;
    let raw_status_code = string_field(&payload, &["TxnStatus", "txnStatus"]).unwrap_or_default();
    let canonical_status = STATUS_TABLE.map(&raw_status_code, &order_id);

    Ok(ProviderEvent {
        provider: Provider::GatewayA,
        provider_payment_id: string_field(&payload, &["txnId", "TxnId", "OriginalBankRRN"]),
        settlement_reference: string_field(&payload, &["BankRRN", "bankRRN"]),
        amount: amount_field(&payload, &["PayerAmount", "amount"]),
        message: string_field(&payload, &["ResponseMessage", "message"]),
        order_id,
        raw_status_code,
        canonical_status,
        source: EventSource::Webhook,
        raw_payload: payload,
    })
}
