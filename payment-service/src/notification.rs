//! Inbound gateway notifications, validated into typed values at the boundary.

use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::Value;
use shared::DomainError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    /// Snap-style gateway: SHA-512 `signature_key` carried in the body.
    Midtrans,
    /// HMAC-SHA256 of the raw body in the `X-Signature` header.
    Generic,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Midtrans => "midtrans",
            GatewayKind::Generic => "generic",
        }
    }
}

impl FromStr for GatewayKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "midtrans" => Ok(GatewayKind::Midtrans),
            "generic" => Ok(GatewayKind::Generic),
            other => Err(DomainError::InvalidRequest(format!("unknown gateway '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Capture,
    Settlement,
    Pending,
    Deny,
    Cancel,
    Expire,
    Failure,
    Refund,
    PartialRefund,
    Authorize,
}

impl GatewayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Capture => "capture",
            GatewayStatus::Settlement => "settlement",
            GatewayStatus::Pending => "pending",
            GatewayStatus::Deny => "deny",
            GatewayStatus::Cancel => "cancel",
            GatewayStatus::Expire => "expire",
            GatewayStatus::Failure => "failure",
            GatewayStatus::Refund => "refund",
            GatewayStatus::PartialRefund => "partial_refund",
            GatewayStatus::Authorize => "authorize",
        }
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "capture" => GatewayStatus::Capture,
            "settlement" | "success" => GatewayStatus::Settlement,
            "pending" => GatewayStatus::Pending,
            "deny" => GatewayStatus::Deny,
            "cancel" => GatewayStatus::Cancel,
            "expire" => GatewayStatus::Expire,
            "failure" => GatewayStatus::Failure,
            "refund" => GatewayStatus::Refund,
            "partial_refund" => GatewayStatus::PartialRefund,
            "authorize" => GatewayStatus::Authorize,
            other => {
                return Err(DomainError::InvalidRequest(format!(
                    "unknown transaction status '{other}'"
                )))
            }
        })
    }
}

/// What the webhook processor does with a verified notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentAction {
    /// Convert reservations and move the order to PAID.
    Settle,
    /// Give the reservations back and leave the order PENDING for a retry.
    Release,
    /// Audit only.
    Record,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub gateway: GatewayKind,
    pub transaction_id: String,
    /// Our order reference, echoed back by the gateway.
    pub order_reference: String,
    /// Amount exactly as the gateway sent it; signatures are computed over this text.
    pub gross_amount: String,
    pub amount: BigDecimal,
    pub status: GatewayStatus,
    pub status_code: Option<String>,
    pub fraud_status: Option<String>,
    pub payment_type: Option<String>,
    pub signature_key: Option<String>,
    pub raw: Value,
}

impl Notification {
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.transaction_id, self.status)
    }

    pub fn action(&self) -> PaymentAction {
        match self.status {
            GatewayStatus::Settlement => PaymentAction::Settle,
            GatewayStatus::Capture => match self.fraud_status.as_deref() {
                None | Some("accept") => PaymentAction::Settle,
                Some("deny") => PaymentAction::Release,
                Some(_) => PaymentAction::Record,
            },
            GatewayStatus::Deny
            | GatewayStatus::Cancel
            | GatewayStatus::Expire
            | GatewayStatus::Failure => PaymentAction::Release,
            GatewayStatus::Pending
            | GatewayStatus::Authorize
            | GatewayStatus::Refund
            | GatewayStatus::PartialRefund => PaymentAction::Record,
        }
    }

    pub fn parse(gateway: GatewayKind, body: &[u8]) -> Result<Self, DomainError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| DomainError::InvalidRequest(format!("malformed notification: {e}")))?;
        match gateway {
            GatewayKind::Midtrans => Self::from_midtrans(raw),
            GatewayKind::Generic => Self::from_generic(raw),
        }
    }

    fn from_midtrans(raw: Value) -> Result<Self, DomainError> {
        let wire: MidtransNotification = serde_json::from_value(raw.clone())
            .map_err(|e| DomainError::InvalidRequest(format!("malformed notification: {e}")))?;
        Ok(Self {
            gateway: GatewayKind::Midtrans,
            amount: parse_amount(&wire.gross_amount)?,
            status: wire.transaction_status.parse()?,
            transaction_id: wire.transaction_id,
            order_reference: wire.order_id,
            gross_amount: wire.gross_amount,
            status_code: Some(wire.status_code),
            fraud_status: wire.fraud_status,
            payment_type: wire.payment_type,
            signature_key: Some(wire.signature_key),
            raw,
        })
    }

    fn from_generic(raw: Value) -> Result<Self, DomainError> {
        let wire: GenericNotification = serde_json::from_value(raw.clone())
            .map_err(|e| DomainError::InvalidRequest(format!("malformed notification: {e}")))?;
        let gross_amount = match wire.amount {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(DomainError::InvalidRequest(format!(
                    "amount must be a number or string, got {other}"
                )))
            }
        };
        Ok(Self {
            gateway: GatewayKind::Generic,
            amount: parse_amount(&gross_amount)?,
            status: wire.status.parse()?,
            transaction_id: wire.transaction_id,
            order_reference: wire.order_reference,
            gross_amount,
            status_code: None,
            fraud_status: wire.fraud_status,
            payment_type: wire.payment_type,
            signature_key: None,
            raw,
        })
    }
}

fn parse_amount(text: &str) -> Result<BigDecimal, DomainError> {
    BigDecimal::from_str(text.trim())
        .map_err(|_| DomainError::InvalidRequest(format!("invalid amount '{text}'")))
}

#[derive(Debug, Deserialize)]
struct MidtransNotification {
    transaction_id: String,
    order_id: String,
    gross_amount: String,
    transaction_status: String,
    status_code: String,
    signature_key: String,
    fraud_status: Option<String>,
    payment_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenericNotification {
    transaction_id: String,
    order_reference: String,
    amount: Value,
    status: String,
    fraud_status: Option<String>,
    payment_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn midtrans(status: &str, fraud: Option<&str>) -> Notification {
        let mut body = json!({
            "transaction_id": "9aed5972-5b6a-401e-894b-a32c91ed1a3a",
            "order_id": "GO-7KQ2M9XD4P",
            "gross_amount": "150000.00",
            "transaction_status": status,
            "status_code": "200",
            "signature_key": "abc",
            "payment_type": "qris",
        });
        if let Some(fraud) = fraud {
            body["fraud_status"] = json!(fraud);
        }
        Notification::parse(GatewayKind::Midtrans, body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn parses_midtrans_body() {
        let n = midtrans("settlement", None);

        assert_eq!(n.order_reference, "GO-7KQ2M9XD4P");
        assert_eq!(n.amount, BigDecimal::from(150000));
        assert_eq!(n.gross_amount, "150000.00");
        assert_eq!(n.status, GatewayStatus::Settlement);
        assert_eq!(
            n.idempotency_key(),
            "9aed5972-5b6a-401e-894b-a32c91ed1a3a:settlement"
        );
    }

    #[test]
    fn capture_depends_on_fraud_status() {
        assert_eq!(midtrans("capture", None).action(), PaymentAction::Settle);
        assert_eq!(midtrans("capture", Some("accept")).action(), PaymentAction::Settle);
        assert_eq!(midtrans("capture", Some("challenge")).action(), PaymentAction::Record);
        assert_eq!(midtrans("capture", Some("deny")).action(), PaymentAction::Release);
    }

    #[test]
    fn status_actions() {
        for status in ["deny", "cancel", "expire", "failure"] {
            assert_eq!(midtrans(status, None).action(), PaymentAction::Release);
        }
        for status in ["pending", "authorize", "refund", "partial_refund"] {
            assert_eq!(midtrans(status, None).action(), PaymentAction::Record);
        }
    }

    #[test]
    fn generic_accepts_numeric_amount() {
        let body = json!({
            "transaction_id": "tx-1",
            "order_reference": "GO-7KQ2M9XD4P",
            "amount": 150000,
            "status": "success",
        });
        let n = Notification::parse(GatewayKind::Generic, body.to_string().as_bytes()).unwrap();

        assert_eq!(n.status, GatewayStatus::Settlement);
        assert_eq!(n.gross_amount, "150000");
    }

    #[test]
    fn rejects_unknown_status_and_garbage() {
        let body = json!({
            "transaction_id": "tx-1",
            "order_reference": "GO-7KQ2M9XD4P",
            "amount": "1",
            "status": "teleported",
        });
        assert!(matches!(
            Notification::parse(GatewayKind::Generic, body.to_string().as_bytes()),
            Err(DomainError::InvalidRequest(_))
        ));
        assert!(matches!(
            Notification::parse(GatewayKind::Midtrans, b"not json"),
            Err(DomainError::InvalidRequest(_))
        ));
        assert!("paypal".parse::<GatewayKind>().is_err());
    }
}
