use near_sdk::json_types::{Base64VecU8, U128};
use near_sdk::serde::Serialize;
use near_sdk::store::{LazyOption, Vector};
use near_sdk::{
    env, near, serde_json, AccountId, FunctionError, Gas, NearToken, Promise, PromiseError,
};
use thiserror::Error;

const GAS_FOR_INITIALIZE: Gas = Gas::from_tgas(20);
const GAS_FOR_CREATE_CALLBACK: Gas = Gas::from_tgas(10);
/// Room for an instance's own state on top of its code.
const INSTANCE_STATE_BYTES: u128 = 10_000;

const EVENT_STANDARD: &str = "p2p_escrow_factory";
const EVENT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Error, FunctionError)]
pub enum FactoryError {
    #[error("InvalidId: no escrow instance with id {0}")]
    InvalidId(u64),
    #[error("InsufficientDeposit: attach at least {0} yoctoNEAR to cover instance storage")]
    InsufficientDeposit(u128),
    #[error("InvalidAccountId: {0} is not a valid sub-account name")]
    InvalidAccountId(String),
    #[error("MissingEscrowCode: factory holds no escrow code")]
    MissingEscrowCode,
}

/// Mirrors the escrow's `AssetKind` on the wire.
#[near(serializers = [json, borsh])]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetKind {
    Nft,
    Mt,
    Ft,
    Native,
}

/// Arguments of the escrow's `initialize`, passed through unchanged.
#[near(serializers = [json, borsh])]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscrowParams {
    pub duration: u64,
    pub expected_asset_kind: AssetKind,
    pub expected_asset_id: Option<AccountId>,
    pub expected_item_id: Option<String>,
    pub expected_quantity: U128,
}

#[derive(Serialize)]
#[serde(crate = "near_sdk::serde")]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum FactoryEvent {
    InstanceCreated {
        id: u64,
        account_id: AccountId,
        creator: AccountId,
        params: EscrowParams,
    },
    InstanceCreationFailed {
        account_id: AccountId,
        creator: AccountId,
        refund: U128,
    },
}

#[derive(Serialize)]
#[serde(crate = "near_sdk::serde")]
struct EventLog<'a> {
    standard: &'static str,
    version: &'static str,
    #[serde(flatten)]
    event: &'a FactoryEvent,
}

impl FactoryEvent {
    pub fn emit(&self) {
        let log = EventLog {
            standard: EVENT_STANDARD,
            version: EVENT_VERSION,
            event: self,
        };
        match serde_json::to_string(&log) {
            Ok(json) => env::log_str(&format!("EVENT_JSON:{json}")),
            Err(err) => env::log_str(&format!("FACTORY_EVENT_UNSERIALIZABLE: {err}")),
        }
    }
}

#[near(contract_state)]
pub struct Factory {
    // Escrow wasm, written once by `new`
    pub escrow_code: LazyOption<Vec<u8>>,
    // Instance id -> account, in creation order
    pub instances: Vector<AccountId>,
    // Names sub-accounts; also counts creations that failed
    pub next_nonce: u64,
}

impl Default for Factory {
    fn default() -> Self {
        Self {
            escrow_code: LazyOption::new(b"c", None),
            instances: Vector::new(b"i"),
            next_nonce: 0,
        }
    }
}

#[near]
impl Factory {
    #[init]
    pub fn new(escrow_code: Base64VecU8) -> Self {
        Self {
            escrow_code: LazyOption::new(b"c", Some(escrow_code.into())),
            instances: Vector::new(b"i"),
            next_nonce: 0,
        }
    }

    /// Deploys a new escrow as a sub-account and initializes it in the same batch.
    ///
    /// The attached deposit funds the instance's storage. The instance gets no
    /// access keys, so nobody can redeploy or drain it afterwards.
    #[payable]
    #[handle_result]
    pub fn create_instance(
        &mut self,
        duration: u64,
        expected_asset_kind: AssetKind,
        expected_asset_id: Option<AccountId>,
        expected_item_id: Option<String>,
        expected_quantity: U128,
    ) -> Result<Promise, FactoryError> {
        let code = self
            .escrow_code
            .get()
            .clone()
            .ok_or(FactoryError::MissingEscrowCode)?;

        let attached = env::attached_deposit();
        let required = required_deposit(code.len());
        if attached < required {
            return Err(FactoryError::InsufficientDeposit(required.as_yoctonear()));
        }

        let account_id = self.instance_account_id(self.next_nonce)?;
        self.next_nonce += 1;

        let params = EscrowParams {
            duration,
            expected_asset_kind,
            expected_asset_id,
            expected_item_id,
            expected_quantity,
        };
        let init_args = serde_json::json!(params).to_string().into_bytes();

        let creator = env::predecessor_account_id();
        Ok(Promise::new(account_id.clone())
            .create_account()
            .transfer(attached)
            .deploy_contract(code)
            .function_call(
                "initialize".to_string(),
                init_args,
                NearToken::from_yoctonear(0),
                GAS_FOR_INITIALIZE,
            )
            .then(
                Self::ext(env::current_account_id())
                    .with_static_gas(GAS_FOR_CREATE_CALLBACK)
                    .on_instance_created(account_id, creator, params, attached),
            ))
    }

    #[private]
    pub fn on_instance_created(
        &mut self,
        #[callback_result] result: Result<(), PromiseError>,
        account_id: AccountId,
        creator: AccountId,
        params: EscrowParams,
        attached: NearToken,
    ) -> Option<AccountId> {
        if result.is_err() {
            // The batch rolled back, so the deposit came back to the factory.
            FactoryEvent::InstanceCreationFailed {
                account_id,
                creator: creator.clone(),
                refund: U128(attached.as_yoctonear()),
            }
            .emit();
            Promise::new(creator).transfer(attached);
            return None;
        }

        let id = u64::from(self.instances.len());
        self.instances.push(account_id.clone());
        FactoryEvent::InstanceCreated {
            id,
            account_id: account_id.clone(),
            creator,
            params,
        }
        .emit();
        Some(account_id)
    }

    // --- VIEWS ---
    #[handle_result]
    pub fn get_instance(&self, id: u64) -> Result<AccountId, FactoryError> {
        u32::try_from(id)
            .ok()
            .and_then(|index| self.instances.get(index))
            .cloned()
            .ok_or(FactoryError::InvalidId(id))
    }

    pub fn get_instance_count(&self) -> u64 {
        u64::from(self.instances.len())
    }

    pub fn get_instances(&self, from_index: Option<u64>, limit: Option<u64>) -> Vec<AccountId> {
        self.instances
            .iter()
            .skip(usize::try_from(from_index.unwrap_or(0)).unwrap_or(usize::MAX))
            .take(usize::try_from(limit.unwrap_or(u64::MAX)).unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn get_required_deposit(&self) -> U128 {
        let code_len = self.escrow_code.get().as_ref().map_or(0, Vec::len);
        U128(required_deposit(code_len).as_yoctonear())
    }
}

impl Factory {
    fn instance_account_id(&self, nonce: u64) -> Result<AccountId, FactoryError> {
        let name = format!("escrow{nonce}.{}", env::current_account_id());
        name.parse().map_err(|_| FactoryError::InvalidAccountId(name))
    }
}

fn required_deposit(code_len: usize) -> NearToken {
    let bytes = (code_len as u128).saturating_add(INSTANCE_STATE_BYTES);
    env::storage_byte_cost().saturating_mul(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use near_sdk::serde_json::Value;
    use near_sdk::test_utils::{accounts, get_logs, VMContextBuilder};
    use near_sdk::testing_env;

    fn factory_id() -> AccountId {
        "factory.near".parse().unwrap()
    }

    fn set_context(predecessor: AccountId, attached: NearToken) {
        let mut builder = VMContextBuilder::new();
        builder
            .current_account_id(factory_id())
            .predecessor_account_id(predecessor)
            .attached_deposit(attached)
            .account_balance(NearToken::from_near(1_000));
        testing_env!(builder.build());
    }

    fn factory() -> Factory {
        set_context(accounts(0), NearToken::from_yoctonear(0));
        Factory::new(Base64VecU8::from(vec![0u8; 1_000]))
    }

    fn params() -> EscrowParams {
        EscrowParams {
            duration: 86_400,
            expected_asset_kind: AssetKind::Ft,
            expected_asset_id: Some("ft.near".parse().unwrap()),
            expected_item_id: None,
            expected_quantity: U128(100),
        }
    }

    fn create(factory: &mut Factory, attached: NearToken) -> Result<(), FactoryError> {
        set_context(accounts(1), attached);
        let EscrowParams {
            duration,
            expected_asset_kind,
            expected_asset_id,
            expected_item_id,
            expected_quantity,
        } = params();
        factory
            .create_instance(
                duration,
                expected_asset_kind,
                expected_asset_id,
                expected_item_id,
                expected_quantity,
            )
            .map(|_| ())
    }

    fn factory_events(name: &str) -> Vec<Value> {
        get_logs()
            .iter()
            .filter_map(|log| log.strip_prefix("EVENT_JSON:"))
            .filter_map(|json| serde_json::from_str::<Value>(json).ok())
            .filter(|event| event["event"] == name)
            .collect()
    }

    #[test]
    fn requires_deposit_for_instance_storage() {
        let mut factory = factory();
        let required = factory.get_required_deposit();
        assert_eq!(
            create(&mut factory, NearToken::from_yoctonear(required.0 - 1)),
            Err(FactoryError::InsufficientDeposit(required.0))
        );
        assert_eq!(factory.next_nonce, 0);
    }

    #[test]
    fn instances_are_recorded_only_once_created() {
        let mut factory = factory();
        create(&mut factory, NearToken::from_near(1)).unwrap();
        assert_eq!(factory.next_nonce, 1);
        assert_eq!(factory.get_instance_count(), 0);

        let account_id: AccountId = "escrow0.factory.near".parse().unwrap();
        set_context(factory_id(), NearToken::from_yoctonear(0));
        let created = factory.on_instance_created(
            Ok(()),
            account_id.clone(),
            accounts(1),
            params(),
            NearToken::from_near(1),
        );

        assert_eq!(created, Some(account_id.clone()));
        assert_eq!(factory.get_instance_count(), 1);
        assert_eq!(factory.get_instance(0), Ok(account_id.clone()));
        let events = factory_events("instance_created");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["standard"], EVENT_STANDARD);
        assert_eq!(events[0]["data"]["id"], 0);
        assert_eq!(events[0]["data"]["creator"], accounts(1).as_str());
        assert_eq!(events[0]["data"]["params"]["expected_quantity"], "100");
        assert_eq!(factory.get_instances(None, None), vec![account_id]);
    }

    #[test]
    fn failed_creation_is_not_recorded() {
        let mut factory = factory();
        create(&mut factory, NearToken::from_near(1)).unwrap();

        set_context(factory_id(), NearToken::from_yoctonear(0));
        let created = factory.on_instance_created(
            Err(PromiseError::Failed),
            "escrow0.factory.near".parse().unwrap(),
            accounts(1),
            params(),
            NearToken::from_near(1),
        );

        assert_eq!(created, None);
        assert_eq!(factory.get_instance_count(), 0);
        assert_eq!(factory_events("instance_creation_failed").len(), 1);

        // the next instance gets a fresh name
        create(&mut factory, NearToken::from_near(1)).unwrap();
        assert_eq!(factory.next_nonce, 2);
    }

    #[test]
    fn lookup_out_of_range_fails() {
        let factory = factory();
        assert_eq!(factory.get_instance(0), Err(FactoryError::InvalidId(0)));
        assert_eq!(
            factory.get_instance(u64::MAX),
            Err(FactoryError::InvalidId(u64::MAX))
        );
    }

    #[test]
    fn paging_past_the_end_returns_nothing() {
        let mut factory = factory();
        let account_id: AccountId = "escrow0.factory.near".parse().unwrap();
        set_context(factory_id(), NearToken::from_yoctonear(0));
        factory.on_instance_created(
            Ok(()),
            account_id.clone(),
            accounts(1),
            params(),
            NearToken::from_near(1),
        );

        assert_eq!(factory.get_instances(Some(0), Some(1)), vec![account_id]);
        assert!(factory.get_instances(Some(1), None).is_empty());
        assert!(factory.get_instances(Some(1 << 32), None).is_empty());
        assert!(factory.get_instances(Some(u64::MAX), Some(u64::MAX)).is_empty());
    }

    #[test]
    fn sub_account_names_follow_the_nonce() {
        let factory = factory();
        assert_eq!(
            factory.instance_account_id(7),
            Ok("escrow7.factory.near".parse().unwrap())
        );
    }
}
