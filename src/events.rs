use near_sdk::json_types::U64;
use near_sdk::serde::Serialize;
use near_sdk::{env, serde_json, AccountId};

use crate::asset::{Asset, Transfer};

pub const EVENT_STANDARD: &str = "p2p_escrow";
pub const EVENT_VERSION: &str = "1.0.0";

/// Lifecycle events, logged in NEP-297 `EVENT_JSON:` format.
#[derive(Serialize)]
#[serde(crate = "near_sdk::serde")]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EscrowEvent {
    Initialized {
        duration_sec: u64,
        expected_payment: Asset,
    },
    Deposited {
        index: u32,
        depositor: AccountId,
        asset: Asset,
        expires_at: U64,
    },
    SwapExecuted {
        payer: AccountId,
        first_depositor: AccountId,
        transfers: Vec<Transfer>,
    },
    Refunded {
        transfers: Vec<Transfer>,
    },
    TransferFailed {
        transfer: Transfer,
    },
    TransfersRetried {
        transfers: Vec<Transfer>,
    },
    /// A balance reading was not applied; nothing changed.
    SettleSkipped {
        asset_id: AccountId,
        reason: String,
    },
    /// Pushed tokens handed back to the token contract, which refunds the sender.
    TransferReturned {
        sender_id: AccountId,
        asset: Asset,
    },
}

#[derive(Serialize)]
#[serde(crate = "near_sdk::serde")]
struct EventLog<'a> {
    standard: &'static str,
    version: &'static str,
    #[serde(flatten)]
    event: &'a EscrowEvent,
}

impl EscrowEvent {
    pub fn emit(&self) {
        let log = EventLog {
            standard: EVENT_STANDARD,
            version: EVENT_VERSION,
            event: self,
        };
        match serde_json::to_string(&log) {
            Ok(json) => env::log_str(&format!("EVENT_JSON:{json}")),
            Err(err) => env::log_str(&format!("ESCROW_EVENT_UNSERIALIZABLE: {err}")),
        }
    }
}
