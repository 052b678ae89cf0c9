use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

use crate::notification::{GatewayKind, Notification};

type HmacSha256 = Hmac<Sha256>;

/// `hex(sha512(order_id + status_code + gross_amount + server_key))`
pub fn midtrans_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn hmac_signature(body: &[u8], secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a notification against the shared secret. `header_signature` is the
/// `X-Signature` value for gateways that sign the raw body.
pub fn verify(
    notification: &Notification,
    body: &[u8],
    header_signature: Option<&str>,
    secret: &str,
) -> bool {
    if secret.is_empty() {
        return false;
    }
    match notification.gateway {
        GatewayKind::Midtrans => {
            let (Some(status_code), Some(given)) = (
                notification.status_code.as_deref(),
                notification.signature_key.as_deref(),
            ) else {
                return false;
            };
            let mut hasher = Sha512::new();
            hasher.update(notification.order_reference.as_bytes());
            hasher.update(status_code.as_bytes());
            hasher.update(notification.gross_amount.as_bytes());
            hasher.update(secret.as_bytes());
            digest_matches(&hasher.finalize(), given)
        }
        GatewayKind::Generic => {
            let Some(given) = header_signature else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            digest_matches(&mac.finalize().into_bytes(), given)
        }
    }
}

/// Compares a computed digest with a hex-encoded one in constant time. Both sides
/// are re-keyed with HMAC so the comparison goes through `Mac::verify_slice`.
fn digest_matches(expected: &[u8], given_hex: &str) -> bool {
    let Ok(given) = hex::decode(given_hex.trim()) else {
        return false;
    };
    if given.len() != expected.len() {
        return false;
    }
    let (Ok(mut ours), Ok(mut theirs)) = (
        HmacSha256::new_from_slice(COMPARE_KEY),
        HmacSha256::new_from_slice(COMPARE_KEY),
    ) else {
        return false;
    };
    ours.update(expected);
    theirs.update(&given);
    ours.verify_slice(&theirs.finalize().into_bytes()).is_ok()
}

const COMPARE_KEY: &[u8] = b"payment-signature-compare";
