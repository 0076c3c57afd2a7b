use near_contract_standards::fungible_token::receiver::FungibleTokenReceiver;
use near_contract_standards::non_fungible_token::core::NonFungibleTokenReceiver;
use near_contract_standards::non_fungible_token::TokenId;
use near_sdk::json_types::{U128, U64};
use near_sdk::store::Vector;
use near_sdk::{
    env, ext_contract, near, AccountId, FunctionError, Gas, Promise, PromiseError,
    PromiseOrValue,
};

pub mod asset;
pub mod deposit;
pub mod error;
pub mod events;
pub mod timelock;

pub use asset::{Asset, AssetKind, Transfer};
pub use deposit::{Deposit, DepositLedger, HasDeposits, MAX_DEPOSITS};
pub use error::EscrowError;
use events::EscrowEvent;
use timelock::Timelock;

const GAS_FOR_RESOLVE: Gas = Gas::from_tgas(10);
const GAS_FOR_BALANCE_QUERY: Gas = Gas::from_tgas(5);
/// Measured cost of one settlement leg, action fees included.
const GAS_PER_SETTLEMENT_LEG: u64 = 25;
/// Reserved so the balance callback can always run a full swap: one leg per
/// deposit plus the payment leg.
const GAS_FOR_BALANCE_CALLBACK: Gas =
    Gas::from_tgas(30 + GAS_PER_SETTLEMENT_LEG * (MAX_DEPOSITS as u64 + 1));

// External contract interfaces
#[ext_contract(ext_fungible_token)]
pub trait FungibleToken {
    fn ft_transfer(&mut self, receiver_id: AccountId, amount: U128, memo: Option<String>);
    fn ft_balance_of(&self, account_id: AccountId) -> U128;
}

#[ext_contract(ext_non_fungible_token)]
pub trait NonFungibleToken {
    fn nft_transfer(
        &mut self,
        receiver_id: AccountId,
        token_id: TokenId,
        approval_id: Option<u64>,
        memo: Option<String>,
    );
}

#[ext_contract(ext_multi_token)]
pub trait MultiToken {
    fn mt_transfer(
        &mut self,
        receiver_id: AccountId,
        token_id: TokenId,
        amount: U128,
        approval: Option<(AccountId, u64)>,
        memo: Option<String>,
    );
}

#[ext_contract(ext_self)]
pub trait SelfCallbacks {
    fn on_balance_observed(&mut self, asset_id: AccountId, credit_to: AccountId, payer: AccountId);
    fn on_transfers_resolved(&mut self, legs: Vec<Transfer>);
}

/// Write-once payment parameters of an escrow.
#[near(serializers = [json, borsh])]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscrowConfig {
    pub duration_sec: u64,
    pub expected_payment: Asset,
}

#[near(contract_state)]
pub struct Contract {
    // None until `initialize`
    pub config: Option<EscrowConfig>,
    pub completed: bool,
    pub timelock: Timelock,
    pub first_depositor: Option<AccountId>,
    pub ledger: DepositLedger,
    // Settlement legs whose cross-contract transfer failed, waiting for a retry
    pub failed_transfers: Vector<Transfer>,
}

impl Default for Contract {
    fn default() -> Self {
        Self {
            config: None,
            completed: false,
            timelock: Timelock::default(),
            first_depositor: None,
            ledger: DepositLedger::new(),
            failed_transfers: Vector::new(b"f"),
        }
    }
}

#[near]
impl Contract {
    /// Fixes the expected payment and the time lock. Can only ever succeed once.
    #[handle_result]
    pub fn initialize(
        &mut self,
        duration: u64,
        expected_asset_kind: AssetKind,
        expected_asset_id: Option<AccountId>,
        expected_item_id: Option<TokenId>,
        expected_quantity: U128,
    ) -> Result<(), EscrowError> {
        if self.config.is_some() {
            return Err(EscrowError::AlreadyInitialized);
        }
        if duration == 0 {
            return Err(EscrowError::InvalidConfiguration("duration must be positive"));
        }
        let expected_payment = Asset::from_parts(
            expected_asset_kind,
            expected_asset_id,
            expected_item_id,
            expected_quantity,
        )?;

        EscrowEvent::Initialized {
            duration_sec: duration,
            expected_payment: expected_payment.clone(),
        }
        .emit();
        self.config = Some(EscrowConfig {
            duration_sec: duration,
            expected_payment,
        });
        Ok(())
    }

    /// Native NEAR intake. The attached deposit is either the payment or a new deposit.
    #[payable]
    #[handle_result]
    pub fn deposit_native(&mut self) -> Result<(), EscrowError> {
        self.ensure_active()?;
        let amount = env::attached_deposit();
        if amount.is_zero() {
            return Err(EscrowError::NothingToProcess);
        }
        let sender = env::predecessor_account_id();
        self.accept(Asset::Native { amount }, sender.clone(), sender)
    }

    /// NEP-245 receiver. Only single-token transfers are accepted.
    pub fn mt_on_transfer(
        &mut self,
        sender_id: AccountId,
        previous_owner_ids: Vec<AccountId>,
        token_ids: Vec<TokenId>,
        amounts: Vec<U128>,
        msg: String,
    ) -> PromiseOrValue<Vec<U128>> {
        let _ = (sender_id, msg);
        let contract_id = env::predecessor_account_id();

        self.receive_multi_token(contract_id, previous_owner_ids, token_ids, amounts)
            .unwrap_or_else(|err| err.panic());

        PromiseOrValue::Value(vec![U128(0)])
    }

    /// Reconciles NEP-141 tokens sent with a plain `ft_transfer`, which leaves no
    /// notification. Whatever the escrow's balance grew by since the last
    /// reconciliation is credited to `credit_to` as one deposit, or, when it is
    /// exactly the expected payment, settles the swap with the caller as payer.
    ///
    /// Until the reading is applied, tokens pushed for `asset_id` are handed back.
    #[handle_result]
    pub fn settle(
        &mut self,
        asset_id: AccountId,
        credit_to: AccountId,
    ) -> Result<Promise, EscrowError> {
        self.ensure_active()?;
        let payer = env::predecessor_account_id();
        self.ledger.begin_settle(&asset_id);

        Ok(ext_fungible_token::ext(asset_id.clone())
            .with_static_gas(GAS_FOR_BALANCE_QUERY)
            .with_unused_gas_weight(0)
            .ft_balance_of(env::current_account_id())
            .then(
                ext_self::ext(env::current_account_id())
                    .with_static_gas(GAS_FOR_BALANCE_CALLBACK)
                    .on_balance_observed(asset_id, credit_to, payer),
            ))
    }

    /// Returns every locked deposit to whoever deposited it. Anyone may call this
    /// once the time lock has elapsed.
    #[handle_result]
    pub fn withdraw_expired(&mut self) -> Result<Promise, EscrowError> {
        self.ensure_active()?;
        if self.ledger.is_empty() {
            return Err(EscrowError::NoAssetsDeposited);
        }
        self.timelock.assert_expired(env::block_timestamp())?;

        let legs = self.ledger.refund_transfers();
        ensure_spendable(&legs)?;

        self.completed = true;
        EscrowEvent::Refunded {
            transfers: legs.clone(),
        }
        .emit();
        dispatch(legs)
    }

    /// Re-issues settlement legs whose transfer failed. Recipients never change.
    #[handle_result]
    pub fn retry_failed_transfers(&mut self) -> Result<Promise, EscrowError> {
        if self.failed_transfers.is_empty() {
            return Err(EscrowError::NothingToProcess);
        }
        let legs: Vec<Transfer> = self.failed_transfers.iter().cloned().collect();
        ensure_spendable(&legs)?;

        self.failed_transfers.clear();
        EscrowEvent::TransfersRetried {
            transfers: legs.clone(),
        }
        .emit();
        dispatch(legs)
    }

    // --- PRIVATE CALLBACKS ---
    /// Never aborts: the in-flight marker must be cleared whatever the outcome.
    /// Returns whether the reading was applied.
    #[private]
    pub fn on_balance_observed(
        &mut self,
        #[callback_result] balance: Result<U128, PromiseError>,
        asset_id: AccountId,
        credit_to: AccountId,
        payer: AccountId,
    ) -> bool {
        let contested = self.ledger.finish_settle(&asset_id);
        let applied = balance
            .map_err(|_| EscrowError::BalanceUnavailable)
            .and_then(|balance| {
                if contested {
                    return Err(EscrowError::BalanceContested);
                }
                self.apply_observed_balance(asset_id.clone(), balance, credit_to, payer)
            });

        match applied {
            Ok(()) => true,
            Err(err) => {
                EscrowEvent::SettleSkipped {
                    asset_id,
                    reason: err.to_string(),
                }
                .emit();
                false
            }
        }
    }

    #[private]
    pub fn on_transfers_resolved(&mut self, legs: Vec<Transfer>) {
        // Transfers return no payload, so nothing is read back.
        let outcomes: Vec<bool> = (0..env::promise_results_count())
            .map(|index| {
                !matches!(
                    env::promise_result_checked(index, 0),
                    Err(PromiseError::Failed)
                )
            })
            .collect();
        self.park_failed_transfers(legs, &outcomes);
    }

    // --- VIEWS ---
    pub fn get_config(&self) -> Option<EscrowConfig> {
        self.config.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn get_expires_at(&self) -> U64 {
        U64(self.timelock.expires_at)
    }

    pub fn get_first_depositor(&self) -> Option<AccountId> {
        self.first_depositor.clone()
    }

    pub fn get_deposit_count(&self) -> u32 {
        self.ledger.len()
    }

    pub fn get_deposit(&self, index: u32) -> Option<Deposit> {
        self.ledger.deposit(index)
    }

    pub fn get_deposits(&self, from_index: Option<u32>, limit: Option<u32>) -> Vec<Deposit> {
        self.ledger
            .page(from_index.unwrap_or(0), limit.unwrap_or(MAX_DEPOSITS))
    }

    pub fn get_high_water_mark(&self, asset_id: AccountId) -> U128 {
        U128(self.ledger.high_water_mark(&asset_id))
    }

    pub fn is_settling(&self, asset_id: AccountId) -> bool {
        self.ledger.is_settling(&asset_id)
    }

    pub fn get_failed_transfers(&self) -> Vec<Transfer> {
        self.failed_transfers.iter().cloned().collect()
    }
}

#[near]
impl FungibleTokenReceiver for Contract {
    /// NEP-141 receiver. Returns the unused amount: `0` when the tokens are
    /// kept, all of them while a `settle` for this token is in flight.
    fn ft_on_transfer(
        &mut self,
        sender_id: AccountId,
        amount: U128,
        msg: String,
    ) -> PromiseOrValue<U128> {
        let _ = msg;
        let contract_id = env::predecessor_account_id();

        let unused = self
            .receive_fungible(contract_id, sender_id, amount)
            .unwrap_or_else(|err| err.panic());

        PromiseOrValue::Value(unused)
    }
}

#[near]
impl NonFungibleTokenReceiver for Contract {
    /// NEP-171 receiver. Returns `false` to keep the token.
    fn nft_on_transfer(
        &mut self,
        sender_id: AccountId,
        previous_owner_id: AccountId,
        token_id: TokenId,
        msg: String,
    ) -> PromiseOrValue<bool> {
        let _ = (sender_id, msg);
        let contract_id = env::predecessor_account_id();

        self.accept(
            Asset::Nft {
                contract_id,
                token_id,
            },
            previous_owner_id.clone(),
            previous_owner_id,
        )
        .unwrap_or_else(|err| err.panic());

        PromiseOrValue::Value(false)
    }
}

impl Contract {
    fn ensure_active(&self) -> Result<&EscrowConfig, EscrowError> {
        let config = self.config.as_ref().ok_or(EscrowError::NotInitialized)?;
        if self.completed {
            return Err(EscrowError::EscrowAlreadyCompleted);
        }
        Ok(config)
    }

    fn receive_fungible(
        &mut self,
        contract_id: AccountId,
        sender_id: AccountId,
        amount: U128,
    ) -> Result<U128, EscrowError> {
        self.ensure_active()?;
        let asset = Asset::Ft {
            contract_id: contract_id.clone(),
            amount,
        };

        // The in-flight balance reading may or may not include these tokens.
        if self.ledger.is_settling(&contract_id) {
            self.ledger.contest_settle(&contract_id);
            EscrowEvent::TransferReturned { sender_id, asset }.emit();
            return Ok(amount);
        }

        // These tokens must not show up again as a `settle` delta.
        self.ledger.raise_high_water_mark(&contract_id, amount);
        self.accept(asset, sender_id.clone(), sender_id)?;
        Ok(U128(0))
    }

    fn apply_observed_balance(
        &mut self,
        asset_id: AccountId,
        balance: U128,
        credit_to: AccountId,
        payer: AccountId,
    ) -> Result<(), EscrowError> {
        // State may have moved on while the balance query was in flight.
        self.ensure_active()?;
        let delta = self.ledger.unreconciled(&asset_id, balance.0)?;

        self.accept(
            Asset::Ft {
                contract_id: asset_id.clone(),
                amount: U128(delta),
            },
            credit_to,
            payer,
        )?;
        self.ledger.raise_high_water_mark(&asset_id, U128(delta));
        Ok(())
    }

    fn receive_multi_token(
        &mut self,
        contract_id: AccountId,
        previous_owner_ids: Vec<AccountId>,
        token_ids: Vec<TokenId>,
        amounts: Vec<U128>,
    ) -> Result<(), EscrowError> {
        let (Some(owner_id), Some(token_id), Some(amount)) = (
            single(previous_owner_ids),
            single(token_ids),
            single(amounts),
        ) else {
            return Err(EscrowError::BatchTransferUnsupported);
        };
        self.accept(
            Asset::Mt {
                contract_id,
                token_id,
                amount,
            },
            owner_id.clone(),
            owner_id,
        )
    }

    /// Classifies an incoming asset as the awaited payment or as another deposit.
    /// `depositor` is credited on the deposit path, `payer` receives the locked
    /// assets on the swap path.
    fn accept(
        &mut self,
        incoming: Asset,
        depositor: AccountId,
        payer: AccountId,
    ) -> Result<(), EscrowError> {
        let now = env::block_timestamp();
        let config = self.ensure_active()?;

        let is_payment = !self.ledger.is_empty()
            && !self.timelock.is_expired(now)
            && config.expected_payment == incoming;

        if is_payment {
            self.execute_swap(payer)
        } else {
            self.record_deposit(incoming, depositor, now)
        }
    }

    fn record_deposit(
        &mut self,
        asset: Asset,
        depositor: AccountId,
        now: u64,
    ) -> Result<(), EscrowError> {
        let duration_sec = self.ensure_active()?.duration_sec;
        let is_first = self.ledger.is_empty();

        let index = self.ledger.record(Deposit {
            depositor: depositor.clone(),
            asset: asset.clone(),
        })?;
        if is_first {
            self.timelock.start(now, duration_sec);
            self.first_depositor = Some(depositor.clone());
        }

        EscrowEvent::Deposited {
            index,
            depositor,
            asset,
            expires_at: U64(self.timelock.expires_at),
        }
        .emit();
        Ok(())
    }

    /// Pays the first depositor and hands every locked deposit to `payer`.
    /// `completed` is set before any transfer is issued.
    fn execute_swap(&mut self, payer: AccountId) -> Result<(), EscrowError> {
        let payment = self.ensure_active()?.expected_payment.clone();
        let first_depositor = match (&self.first_depositor, self.ledger.is_empty()) {
            (Some(first_depositor), false) => first_depositor.clone(),
            _ => return Err(EscrowError::NoAssetsDeposited),
        };

        let mut legs = vec![Transfer::new(first_depositor.clone(), payment)];
        legs.extend(self.ledger.swap_transfers(&payer));
        ensure_spendable(&legs)?;

        self.completed = true;
        EscrowEvent::SwapExecuted {
            payer,
            first_depositor,
            transfers: legs.clone(),
        }
        .emit();
        // Not returned to the caller; receivers must answer with their
        // acknowledgement value.
        dispatch(legs).map(|_| ())
    }

    fn park_failed_transfers(&mut self, legs: Vec<Transfer>, outcomes: &[bool]) -> u32 {
        let mut failed = 0;
        for (index, leg) in legs.into_iter().enumerate() {
            if outcomes.get(index).copied().unwrap_or(false) {
                continue;
            }
            EscrowEvent::TransferFailed {
                transfer: leg.clone(),
            }
            .emit();
            self.failed_transfers.push(leg);
            failed += 1;
        }
        failed
    }
}

/// Issues all legs as one joint promise and resolves them together.
fn dispatch(legs: Vec<Transfer>) -> Result<Promise, EscrowError> {
    let transfers = legs
        .iter()
        .cloned()
        .map(Transfer::into_promise)
        .reduce(Promise::and)
        .ok_or(EscrowError::NoAssetsDeposited)?;

    Ok(transfers.then(
        ext_self::ext(env::current_account_id())
            .with_static_gas(GAS_FOR_RESOLVE)
            .on_transfers_resolved(legs),
    ))
}

/// Native NEAR needed by `legs` must be available outside of storage staking,
/// otherwise the call fails before anything changes.
fn ensure_spendable(legs: &[Transfer]) -> Result<(), EscrowError> {
    let required = legs
        .iter()
        .map(Transfer::native_cost)
        .fold(0u128, u128::saturating_add);
    let staked_for_storage = env::storage_byte_cost()
        .saturating_mul(u128::from(env::storage_usage()))
        .as_yoctonear();
    let available = env::account_balance()
        .as_yoctonear()
        .saturating_sub(staked_for_storage);

    if required > available {
        return Err(EscrowError::TransferFailed(format!(
            "settlement needs {required} yoctoNEAR but only {available} is spendable"
        )));
    }
    Ok(())
}

fn single<T>(mut items: Vec<T>) -> Option<T> {
    if items.len() == 1 {
        items.pop()
    } else {
        None
    }
}
