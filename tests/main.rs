use anyhow::Result;
use base64::Engine;
use near_workspaces::network::Sandbox;
use near_workspaces::types::NearToken;
use near_workspaces::{Account, AccountId, Contract, Worker};
use serde_json::{json, Value};

// These run against a local sandbox and build both contracts with cargo-near:
// cargo test -- --ignored

const DURATION_SEC: u64 = 5;

/// Helper function to set up the testing environment.
/// This will:
/// 1. Initialize a sandbox environment.
/// 2. Deploy an escrow that expects 5 NEAR as payment.
/// 3. Create accounts for the depositor (maker) and the payer (taker).
async fn setup() -> Result<(Worker<Sandbox>, Contract, Account, Account)> {
    let worker = near_workspaces::sandbox().await?;
    let escrow_wasm = near_workspaces::compile_project("./").await?;
    let escrow = worker.dev_deploy(&escrow_wasm).await?;

    escrow
        .call("initialize")
        .args_json(json!({
            "duration": DURATION_SEC,
            "expected_asset_kind": "Native",
            "expected_asset_id": null,
            "expected_item_id": null,
            "expected_quantity": NearToken::from_near(5).as_yoctonear().to_string(),
        }))
        .transact()
        .await?
        .into_result()?;

    let maker = worker.dev_create_account().await?;
    let taker = worker.dev_create_account().await?;
    Ok((worker, escrow, maker, taker))
}

async fn deposit_native(account: &Account, escrow: &Contract, amount: NearToken) -> Result<()> {
    account
        .call(escrow.id(), "deposit_native")
        .deposit(amount)
        .max_gas()
        .transact()
        .await?
        .into_result()?;
    Ok(())
}

async fn balance(worker: &Worker<Sandbox>, account_id: &AccountId) -> Result<NearToken> {
    Ok(worker.view_account(account_id).await?.balance)
}

#[tokio::test]
#[ignore = "needs near-sandbox and cargo-near"]
async fn test_native_payment_settles_swap() -> Result<()> {
    let (worker, escrow, maker, taker) = setup().await?;

    deposit_native(&maker, &escrow, NearToken::from_near(2)).await?;
    let deposit_count: u32 = escrow.view("get_deposit_count").await?.json()?;
    assert_eq!(deposit_count, 1);

    let maker_before = balance(&worker, maker.id()).await?;
    deposit_native(&taker, &escrow, NearToken::from_near(5)).await?;

    let completed: bool = escrow.view("is_completed").await?.json()?;
    assert!(completed);

    // maker receives the 5 NEAR payment
    let maker_after = balance(&worker, maker.id()).await?;
    assert_eq!(
        maker_after.as_yoctonear() - maker_before.as_yoctonear(),
        NearToken::from_near(5).as_yoctonear()
    );

    // anything else is now refused
    let late = maker
        .call(escrow.id(), "deposit_native")
        .deposit(NearToken::from_near(1))
        .max_gas()
        .transact()
        .await?;
    assert!(late.is_failure());

    Ok(())
}

#[tokio::test]
#[ignore = "needs near-sandbox and cargo-near"]
async fn test_expired_escrow_refunds_each_depositor() -> Result<()> {
    let (worker, escrow, maker, taker) = setup().await?;

    deposit_native(&maker, &escrow, NearToken::from_near(2)).await?;
    // wrong amount, recorded as a second deposit
    deposit_native(&taker, &escrow, NearToken::from_near(4)).await?;

    let early = taker
        .call(escrow.id(), "withdraw_expired")
        .max_gas()
        .transact()
        .await?;
    assert!(early.is_failure());

    worker.fast_forward(100).await?;

    let maker_before = balance(&worker, maker.id()).await?;
    let taker_before = balance(&worker, taker.id()).await?;

    let outsider = worker.dev_create_account().await?;
    outsider
        .call(escrow.id(), "withdraw_expired")
        .max_gas()
        .transact()
        .await?
        .into_result()?;

    let maker_after = balance(&worker, maker.id()).await?;
    let taker_after = balance(&worker, taker.id()).await?;
    assert_eq!(
        maker_after.as_yoctonear() - maker_before.as_yoctonear(),
        NearToken::from_near(2).as_yoctonear()
    );
    assert_eq!(
        taker_after.as_yoctonear() - taker_before.as_yoctonear(),
        NearToken::from_near(4).as_yoctonear()
    );

    let failed: Vec<Value> = escrow.view("get_failed_transfers").await?.json()?;
    assert!(failed.is_empty());

    Ok(())
}

#[tokio::test]
#[ignore = "needs near-sandbox and cargo-near"]
async fn test_factory_creates_initialized_instances() -> Result<()> {
    let worker = near_workspaces::sandbox().await?;
    let escrow_wasm = near_workspaces::compile_project("./").await?;
    let factory_wasm = near_workspaces::compile_project("./factory").await?;

    let factory = worker.dev_deploy(&factory_wasm).await?;
    factory
        .call("new")
        .args_json(json!({
            "escrow_code": base64::engine::general_purpose::STANDARD.encode(&escrow_wasm),
        }))
        .max_gas()
        .transact()
        .await?
        .into_result()?;

    let required: String = factory.view("get_required_deposit").await?.json()?;
    let creator = worker.dev_create_account().await?;

    let result = creator
        .call(factory.id(), "create_instance")
        .args_json(json!({
            "duration": 86_400,
            "expected_asset_kind": "Ft",
            "expected_asset_id": "token.test.near",
            "expected_item_id": null,
            "expected_quantity": "100",
        }))
        .deposit(NearToken::from_yoctonear(required.parse()?))
        .max_gas()
        .transact()
        .await?
        .into_result()?;
    let instance: Option<AccountId> = result.json()?;
    let instance = instance.expect("instance should have been created");

    let count: u64 = factory.view("get_instance_count").await?.json()?;
    assert_eq!(count, 1);
    let recorded: AccountId = factory
        .view("get_instance")
        .args_json(json!({ "id": 0 }))
        .await?
        .json()?;
    assert_eq!(recorded, instance);

    let config: Value = worker
        .view(&instance, "get_config")
        .await?
        .json()?;
    assert_eq!(config["duration_sec"], 86_400);
    assert_eq!(
        config["expected_payment"]["Ft"]["contract_id"],
        "token.test.near"
    );

    let missing = factory
        .view("get_instance")
        .args_json(json!({ "id": 1 }))
        .await;
    assert!(missing.is_err());

    // an instance cannot be configured twice
    let again = creator
        .call(&instance, "initialize")
        .args_json(json!({
            "duration": 1,
            "expected_asset_kind": "Native",
            "expected_asset_id": null,
            "expected_item_id": null,
            "expected_quantity": "1",
        }))
        .transact()
        .await?;
    assert!(again.is_failure());

    Ok(())
}
