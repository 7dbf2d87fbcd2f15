use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tollgate_core::BusinessId;

use crate::StoreError;

/// Generates `as_str`, `Display` and `FromStr` for enums persisted as text
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StoreError::Corrupt(format!(
                        "unknown {} value '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

/// Upstream vendor family; each is a fixed compiled-in client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// OpenAI-compatible chat completions over JSON/SSE
    OpenAi,
    /// Binary-framed speech service (synthesis and recognition)
    Speech,
}

text_enum!(Provider { OpenAi => "openai", Speech => "speech" });

/// Metered capability a call consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    ChatCompletion,
    TextToSpeech,
    SpeechToText,
}

text_enum!(Service {
    ChatCompletion => "chat_completion",
    TextToSpeech => "text_to_speech",
    SpeechToText => "speech_to_text",
});

/// Ledger row lifecycle
///
/// `Pending -> Processing -> Completed | Failed`, and `Failed -> Pending` on reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum!(TransactionStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

/// Ledger row category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Metered API consumption, debited by settlement
    ApiCall,
    /// Wallet credit; written outside the gateway and never settled here
    TopUp,
}

text_enum!(TransactionKind { ApiCall => "API_CALL", TopUp => "TOP_UP" });

/// State of the per-call summary row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// Stream opened, outcome not yet known
    Started,
    Succeeded,
    Failed,
}

text_enum!(CallStatus {
    Started => "STARTED",
    Succeeded => "SUCCEEDED",
    Failed => "FAILED",
});

/// Ledger entry settled against a wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub business_id: BusinessId,
    pub kind: TransactionKind,
    pub wallet_id: i64,
    pub user_id: i64,
    pub api_key_id: i64,
    /// Six fractional digits
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Summary of one proxied call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCallRecord {
    pub business_id: BusinessId,
    pub user_id: i64,
    pub wallet_id: i64,
    pub api_key_id: i64,
    pub provider: Provider,
    pub service: Service,
    pub model: Option<String>,
    /// Upstream that served the final attempt
    pub upstream_id: Option<i64>,
    pub status: CallStatus,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub external_trace_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub cost: Decimal,
    pub no_charge: bool,
}

/// Failure reported by one upstream attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamFailure {
    /// Zero-based attempt index
    pub attempt: u32,
    pub upstream_id: Option<i64>,
    pub message: String,
}

/// Payload snapshots and diagnostics of one call
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCallDetail {
    pub business_id: BusinessId,
    pub request_body: String,
    pub response_body: String,
    /// Text extracted from the response, used for token accounting
    pub response_text: String,
    pub billing_summary: serde_json::Value,
    pub internal_errors: Vec<String>,
    pub upstream_errors: Vec<UpstreamFailure>,
}

/// Final records of one call, persisted atomically
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub transaction: Transaction,
    pub record: ApiCallRecord,
    pub detail: ApiCallDetail,
}

/// Prepaid balance shared by a group of members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    pub id: i64,
    pub balance: Decimal,
    /// Optimistic-lock token, bumped on every balance change
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub user_id: i64,
    pub wallet_id: i64,
    /// Hex SHA-256 of the full key
    pub key_hash: String,
    pub active: bool,
}

/// Credentialed upstream endpoint
#[derive(Debug, Clone)]
pub struct UpstreamEndpoint {
    pub id: i64,
    pub provider: Provider,
    pub base_url: String,
    pub api_key: SecretString,
    /// Relative selection weight; zero disables the endpoint
    pub weight: u32,
}

/// Active price for one model and service
///
/// Units depend on the service: per million tokens for chat, per million
/// UTF-8 bytes for speech synthesis, per hour of audio for recognition.
/// `output_price` is only meaningful for chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model: String,
    pub service: Service,
    pub input_price: Decimal,
    pub output_price: Decimal,
}

/// One wallet's share of a settlement batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSettlement {
    pub wallet_id: i64,
    /// Version read before the decrement
    pub expected_version: i64,
    pub total: Decimal,
    /// Per-member sums, credited to each member's used-credit counter
    pub member_totals: Vec<(i64, Decimal)>,
    pub business_ids: Vec<BusinessId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_is_stable() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Processing,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
        }
        assert_eq!(TransactionStatus::Processing.to_string(), "PROCESSING");
    }

    #[test]
    fn unknown_text_is_corrupt() {
        assert!(matches!("anthropic".parse::<Provider>(), Err(StoreError::Corrupt(_))));
    }
}
