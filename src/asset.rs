use near_contract_standards::non_fungible_token::TokenId;
use near_sdk::json_types::U128;
use near_sdk::{near, AccountId, Gas, NearToken, Promise};

use crate::error::EscrowError;
use crate::{ext_fungible_token, ext_multi_token, ext_non_fungible_token};

pub const ONE_YOCTO: NearToken = NearToken::from_yoctonear(1);
pub const GAS_FOR_TRANSFER: Gas = Gas::from_tgas(10);

const TRANSFER_MEMO: &str = "p2p escrow settlement";

/// Payload-free tag used when configuring an escrow.
#[near(serializers = [json, borsh])]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetKind {
    Nft,
    Mt,
    Ft,
    Native,
}

/// A concrete amount of something the escrow can hold.
///
/// Each variant carries only the fields that identify that kind of asset, so
/// two assets are the "same payment" exactly when they compare equal.
#[near(serializers = [json, borsh])]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Asset {
    /// NEP-171 token
    Nft {
        contract_id: AccountId,
        token_id: TokenId,
    },
    /// NEP-245 token
    Mt {
        contract_id: AccountId,
        token_id: TokenId,
        amount: U128,
    },
    /// NEP-141 token
    Ft { contract_id: AccountId, amount: U128 },
    Native { amount: NearToken },
}

impl Asset {
    /// Builds the expected payment from the flat `initialize` arguments.
    pub fn from_parts(
        kind: AssetKind,
        contract_id: Option<AccountId>,
        item_id: Option<TokenId>,
        quantity: U128,
    ) -> Result<Self, EscrowError> {
        let require_contract = |contract_id: Option<AccountId>| {
            contract_id.ok_or(EscrowError::InvalidConfiguration(
                "expected_asset_id is required for token payments",
            ))
        };
        let require_item = |item_id: Option<TokenId>| {
            item_id.ok_or(EscrowError::InvalidConfiguration(
                "expected_item_id is required for NFT and MT payments",
            ))
        };
        let require_quantity = |quantity: U128| {
            if quantity.0 == 0 {
                Err(EscrowError::InvalidConfiguration(
                    "expected_quantity must be positive",
                ))
            } else {
                Ok(quantity)
            }
        };

        match kind {
            AssetKind::Nft => Ok(Asset::Nft {
                contract_id: require_contract(contract_id)?,
                token_id: require_item(item_id)?,
            }),
            AssetKind::Mt => Ok(Asset::Mt {
                contract_id: require_contract(contract_id)?,
                token_id: require_item(item_id)?,
                amount: require_quantity(quantity)?,
            }),
            AssetKind::Ft => Ok(Asset::Ft {
                contract_id: require_contract(contract_id)?,
                amount: require_quantity(quantity)?,
            }),
            AssetKind::Native => {
                if contract_id.is_some() {
                    return Err(EscrowError::InvalidConfiguration(
                        "native payments take no expected_asset_id",
                    ));
                }
                let amount = require_quantity(quantity)?;
                Ok(Asset::Native {
                    amount: NearToken::from_yoctonear(amount.0),
                })
            }
        }
    }

    pub fn kind(&self) -> AssetKind {
        match self {
            Asset::Nft { .. } => AssetKind::Nft,
            Asset::Mt { .. } => AssetKind::Mt,
            Asset::Ft { .. } => AssetKind::Ft,
            Asset::Native { .. } => AssetKind::Native,
        }
    }
}

/// One outbound leg of a swap or refund.
#[near(serializers = [json, borsh])]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub receiver_id: AccountId,
    pub asset: Asset,
}

impl Transfer {
    pub fn new(receiver_id: AccountId, asset: Asset) -> Self {
        Self { receiver_id, asset }
    }

    /// Native NEAR this leg spends from the escrow account, including the
    /// yoctoNEAR every token standard requires on a transfer call.
    pub fn native_cost(&self) -> u128 {
        match &self.asset {
            Asset::Native { amount } => amount.as_yoctonear(),
            _ => ONE_YOCTO.as_yoctonear(),
        }
    }

    pub fn into_promise(self) -> Promise {
        let Transfer { receiver_id, asset } = self;
        let memo = Some(TRANSFER_MEMO.to_string());

        match asset {
            Asset::Native { amount } => Promise::new(receiver_id).transfer(amount),
            Asset::Ft {
                contract_id,
                amount,
            } => ext_fungible_token::ext(contract_id)
                .with_attached_deposit(ONE_YOCTO)
                .with_static_gas(GAS_FOR_TRANSFER)
                .ft_transfer(receiver_id, amount, memo),
            Asset::Nft {
                contract_id,
                token_id,
            } => ext_non_fungible_token::ext(contract_id)
                .with_attached_deposit(ONE_YOCTO)
                .with_static_gas(GAS_FOR_TRANSFER)
                .nft_transfer(receiver_id, token_id, None, memo),
            Asset::Mt {
                contract_id,
                token_id,
                amount,
            } => ext_multi_token::ext(contract_id)
                .with_attached_deposit(ONE_YOCTO)
                .with_static_gas(GAS_FOR_TRANSFER)
                .mt_transfer(receiver_id, token_id, amount, None, memo),
        }
    }
}
