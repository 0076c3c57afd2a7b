use near_sdk::json_types::U128;
use near_sdk::store::{LookupMap, Vector};
use near_sdk::{near, AccountId};

use crate::asset::{Asset, Transfer};
use crate::error::EscrowError;

/// Upper bound on locked deposits. Every settlement leg costs about 25 Tgas
/// (static gas, action fees and the resolution callback's arguments), so a swap
/// of this many deposits plus the payment leg stays well inside 300 Tgas.
pub const MAX_DEPOSITS: u32 = 8;

/// An asset locked by one party. Never modified after it is recorded.
#[near(serializers = [json, borsh])]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deposit {
    pub depositor: AccountId,
    pub asset: Asset,
}

/// Balance queries in flight for one FT contract.
#[near(serializers = [borsh])]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingSettle {
    pub queries: u32,
    // A push for this token arrived while a query was in flight
    pub contested: bool,
}

#[near(serializers = [borsh])]
pub struct DepositLedger {
    // Append-only, in arrival order
    pub deposits: Vector<Deposit>,
    // FT contract -> own balance already accounted for
    pub high_water_marks: LookupMap<AccountId, U128>,
    pub pending_settles: LookupMap<AccountId, PendingSettle>,
}

impl DepositLedger {
    pub fn new() -> Self {
        Self {
            deposits: Vector::new(b"d"),
            high_water_marks: LookupMap::new(b"h"),
            pending_settles: LookupMap::new(b"s"),
        }
    }

    pub fn page(&self, from_index: u32, limit: u32) -> Vec<Deposit> {
        self.deposits
            .iter()
            .skip(usize::try_from(from_index).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

impl Default for DepositLedger {
    fn default() -> Self {
        Self::new()
    }
}

pub trait HasDeposits {
    fn is_empty(&self) -> bool;
    fn len(&self) -> u32;
    fn deposit(&self, index: u32) -> Option<Deposit>;
    fn record(&mut self, deposit: Deposit) -> Result<u32, EscrowError>;
    fn high_water_mark(&self, contract_id: &AccountId) -> u128;
    fn raise_high_water_mark(&mut self, contract_id: &AccountId, amount: U128);
    fn unreconciled(
        &self,
        contract_id: &AccountId,
        current_balance: u128,
    ) -> Result<u128, EscrowError>;
    fn begin_settle(&mut self, contract_id: &AccountId);
    fn is_settling(&self, contract_id: &AccountId) -> bool;
    fn contest_settle(&mut self, contract_id: &AccountId);
    fn finish_settle(&mut self, contract_id: &AccountId) -> bool;
    fn swap_transfers(&self, payer: &AccountId) -> Vec<Transfer>;
    fn refund_transfers(&self) -> Vec<Transfer>;
}

impl HasDeposits for DepositLedger {
    fn is_empty(&self) -> bool {
        self.deposits.is_empty()
    }

    fn len(&self) -> u32 {
        self.deposits.len()
    }

    fn deposit(&self, index: u32) -> Option<Deposit> {
        self.deposits.get(index).cloned()
    }

    fn record(&mut self, deposit: Deposit) -> Result<u32, EscrowError> {
        let index = self.deposits.len();
        if index >= MAX_DEPOSITS {
            return Err(EscrowError::TooManyDeposits(MAX_DEPOSITS));
        }
        self.deposits.push(deposit);
        Ok(index)
    }

    fn high_water_mark(&self, contract_id: &AccountId) -> u128 {
        self.high_water_marks
            .get(contract_id)
            .map(|mark| mark.0)
            .unwrap_or(0)
    }

    /// Accounts for tokens that arrived together with a receiver notification.
    fn raise_high_water_mark(&mut self, contract_id: &AccountId, amount: U128) {
        let mark = self.high_water_mark(contract_id).saturating_add(amount.0);
        self.high_water_marks.insert(contract_id.clone(), U128(mark));
    }

    /// Balance growth since the last reconciliation. The caller raises the mark
    /// by the returned amount once it has been credited.
    fn unreconciled(
        &self,
        contract_id: &AccountId,
        current_balance: u128,
    ) -> Result<u128, EscrowError> {
        let mark = self.high_water_mark(contract_id);
        if current_balance <= mark {
            return Err(EscrowError::NothingToProcess);
        }
        Ok(current_balance - mark)
    }

    fn begin_settle(&mut self, contract_id: &AccountId) {
        let mut pending = self.pending_settles.get(contract_id).copied().unwrap_or_default();
        pending.queries = pending.queries.saturating_add(1);
        self.pending_settles.insert(contract_id.clone(), pending);
    }

    fn is_settling(&self, contract_id: &AccountId) -> bool {
        self.pending_settles.contains_key(contract_id)
    }

    fn contest_settle(&mut self, contract_id: &AccountId) {
        if let Some(pending) = self.pending_settles.get_mut(contract_id) {
            pending.contested = true;
        }
    }

    /// Closes one balance query and reports whether its reading is contested.
    /// The flag stays raised until every overlapping query has finished.
    fn finish_settle(&mut self, contract_id: &AccountId) -> bool {
        let Some(pending) = self.pending_settles.get_mut(contract_id) else {
            return false;
        };
        let contested = pending.contested;
        pending.queries = pending.queries.saturating_sub(1);
        if pending.queries == 0 {
            self.pending_settles.remove(contract_id);
        }
        contested
    }

    fn swap_transfers(&self, payer: &AccountId) -> Vec<Transfer> {
        self.deposits
            .iter()
            .map(|deposit| Transfer::new(payer.clone(), deposit.asset.clone()))
            .collect()
    }

    fn refund_transfers(&self) -> Vec<Transfer> {
        self.deposits
            .iter()
            .map(|deposit| Transfer::new(deposit.depositor.clone(), deposit.asset.clone()))
            .collect()
    }
}
