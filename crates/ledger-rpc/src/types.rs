//! Wire types for the ledger node's action API
//!
//! Requests are JSON objects tagged by `action`. Amounts travel as decimal
//! strings in the ledger's smallest unit.

use crate::error::LedgerError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Kind of a signed block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Send,
    Receive,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Send => "send",
            BlockKind::Receive => "receive",
        }
    }
}

/// A block signed by the ledger node but not yet published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedBlock {
    /// Hash the block will have once processed
    pub hash: String,
    /// Opaque signed payload, handed back verbatim to `process`
    pub payload: String,
}

/// Balance of one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct AccountBalance {
    #[serde(deserialize_with = "amount::deserialize")]
    pub balance: u128,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub pending: u128,
}

/// Request body, tagged by the `action` field
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LedgerRequest<'a> {
    AccountCreate {
        wallet: &'a str,
    },
    AccountList {
        wallet: &'a str,
    },
    AccountHistory {
        account: &'a str,
        count: String,
    },
    AccountBalance {
        account: &'a str,
    },
    WalletBalances {
        wallet: &'a str,
    },
    BlockCreate {
        #[serde(rename = "type")]
        kind: BlockKind,
        wallet: &'a str,
        account: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        balance: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        amount: Option<String>,
        previous: &'a str,
    },
    Process {
        block: &'a str,
    },
    Send {
        wallet: &'a str,
        source: &'a str,
        destination: &'a str,
        amount: String,
    },
    Receive {
        wallet: &'a str,
        account: &'a str,
        block: &'a str,
    },
    Pending {
        account: &'a str,
        count: String,
    },
}

impl LedgerRequest<'_> {
    /// The `action` tag, for error reporting
    pub fn action(&self) -> &'static str {
        match self {
            LedgerRequest::AccountCreate { .. } => "account_create",
            LedgerRequest::AccountList { .. } => "account_list",
            LedgerRequest::AccountHistory { .. } => "account_history",
            LedgerRequest::AccountBalance { .. } => "account_balance",
            LedgerRequest::WalletBalances { .. } => "wallet_balances",
            LedgerRequest::BlockCreate { .. } => "block_create",
            LedgerRequest::Process { .. } => "process",
            LedgerRequest::Send { .. } => "send",
            LedgerRequest::Receive { .. } => "receive",
            LedgerRequest::Pending { .. } => "pending",
        }
    }
}

// ============ Responses ============

#[derive(Debug, Deserialize)]
pub struct AccountCreateResponse {
    pub account: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountListResponse {
    #[serde(default, deserialize_with = "list_or_empty")]
    pub accounts: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryEntry {
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountHistoryResponse {
    #[serde(default, deserialize_with = "list_or_empty")]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WalletBalancesResponse {
    #[serde(default)]
    pub balances: HashMap<String, AccountBalance>,
}

#[derive(Debug, Deserialize)]
pub struct BlockCreateResponse {
    pub hash: String,
    /// Legacy nodes return the block as a JSON string, newer ones as an object
    pub block: Value,
}

impl BlockCreateResponse {
    pub fn into_created(self) -> CreatedBlock {
        let payload = match self.block {
            Value::String(s) => s,
            other => other.to_string(),
        };
        CreatedBlock {
            hash: self.hash,
            payload,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HashResponse {
    #[serde(alias = "block")]
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct PendingResponse {
    #[serde(default, deserialize_with = "list_or_empty")]
    pub blocks: Vec<String>,
}

/// Decode a raw response, surfacing a non-empty `error` field as a ledger error
pub fn decode_response<T: serde::de::DeserializeOwned>(
    action: &'static str,
    value: Value,
) -> Result<T, LedgerError> {
    if let Some(error) = value.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if !message.is_empty() {
            return Err(LedgerError::ledger(action, message));
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// The node encodes an empty list as `""`
fn list_or_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrEmpty<T> {
        List(Vec<T>),
        Empty(String),
    }

    match ListOrEmpty::deserialize(deserializer)? {
        ListOrEmpty::List(items) => Ok(items),
        ListOrEmpty::Empty(s) if s.is_empty() => Ok(Vec::new()),
        ListOrEmpty::Empty(s) => Err(serde::de::Error::custom(format!(
            "expected list, got {:?}",
            s
        ))),
    }
}

/// Decimal-string amounts
pub mod amount {
    use crate::error::LedgerError;
    use serde::{Deserialize, Deserializer};

    pub fn parse(s: &str) -> Result<u128, LedgerError> {
        if s.is_empty() {
            return Ok(0);
        }
        s.parse::<u128>()
            .map_err(|_| LedgerError::InvalidAmount(s.to_string()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_is_tagged_by_action() {
        let request = LedgerRequest::BlockCreate {
            kind: BlockKind::Send,
            wallet: "W",
            account: "a",
            destination: Some("b"),
            source: None,
            balance: Some("10".to_string()),
            amount: Some("1".to_string()),
            previous: "H",
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["action"], "block_create");
        assert_eq!(value["type"], "send");
        assert_eq!(value["balance"], "10");
        assert!(value.get("source").is_none());
        assert_eq!(request.action(), "block_create");
    }

    #[test]
    fn test_error_field_is_fatal() {
        let result: Result<HashResponse, _> =
            decode_response("process", json!({ "error": "Fork" }));
        match result {
            Err(LedgerError::Ledger { action, message }) => {
                assert_eq!(action, "process");
                assert_eq!(message, "Fork");
            }
            other => panic!("unexpected {:?}", other),
        }

        let ok: HashResponse =
            decode_response("process", json!({ "hash": "AB", "error": "" })).unwrap();
        assert_eq!(ok.hash, "AB");
    }

    #[test]
    fn test_empty_history_is_empty_string() {
        let resp: AccountHistoryResponse =
            decode_response("account_history", json!({ "history": "" })).unwrap();
        assert!(resp.history.is_empty());
    }

    #[test]
    fn test_wallet_balances_parse_raw_amounts() {
        let resp: WalletBalancesResponse = decode_response(
            "wallet_balances",
            json!({
                "balances": {
                    "acc": {
                        "balance": "340282366920938463463374607431768211455",
                        "pending": "0"
                    }
                }
            }),
        )
        .unwrap();
        assert_eq!(resp.balances["acc"].balance, u128::MAX);
    }

    #[test]
    fn test_block_object_payload_is_stringified() {
        let resp: BlockCreateResponse = decode_response(
            "block_create",
            json!({ "hash": "H", "block": { "type": "send" } }),
        )
        .unwrap();
        let created = resp.into_created();
        assert_eq!(created.payload, r#"{"type":"send"}"#);
    }
}
