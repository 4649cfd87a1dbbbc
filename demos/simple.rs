//! Issues a one-time code, redeems a gift code and checks a password, all
//! over one in-memory store.
//!
//! Run with: RUST_LOG=debug cargo run --example simple

use credential_core::storage::MemoryStore;
use credential_core::{
    ActivityConfig, ActivityLogger, CredentialError, OneTimeCodeService, RedeemCodeService,
    UserConfig, UserService, current_timestamp_millis,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing so the services' logs are visible
    tracing_subscriber::fmt::init();

    let store = Arc::new(MemoryStore::new());

    // One-time codes
    let codes = OneTimeCodeService::builder()
        .with_store(Arc::clone(&store))
        .with_ttl_limit(Duration::from_secs(300))
        .build_and_init()
        .await?;
    let code = codes.create_code("alice@example.com", "password_reset").await?;
    println!("Issued one-time code: {code}");

    if codes.consume_code("alice@example.com", "password_reset", &code).await? {
        println!("✅ Code consumed");
    }
    if !codes.consume_code("alice@example.com", "password_reset", &code).await? {
        println!("✅ Correctly rejected a second use of the same code");
    }

    // Accounts
    let users = UserService::new_and_init(Arc::clone(&store), UserConfig::default()).await?;
    users.create_user("alice", "alice@example.com", "hunter2", false).await?;
    println!(
        "Password check: right={}, wrong={}",
        users.verify_user_password("alice", "hunter2").await?,
        users.verify_user_password("alice", "hunter3").await?
    );
    match users.create_user("alice", "other@example.com", "pw", false).await {
        Err(CredentialError::DuplicateKey(_)) => println!("✅ Duplicate account rejected"),
        other => println!("❌ Unexpected result for a duplicate account: {other:?}"),
    }

    // Redeem codes, audited in the activity log
    let redeem = RedeemCodeService::new_and_init(Arc::clone(&store)).await?;
    let logger = ActivityLogger::new_and_init(Arc::clone(&store), ActivityConfig::default()).await?;

    redeem.create_code("GIFT-0001", "premium_month", "admin").await?;
    if redeem.start_processing_code("GIFT-0001", json!({"user": "alice"})).await? {
        redeem.mark_processing_done("GIFT-0001", json!({"granted": true})).await?;
        logger
            .log_activity("alice", "redeem", Some(json!({"code": "GIFT-0001"})))
            .await?;
    }
    if let Some(record) = redeem.get_code("GIFT-0001").await? {
        println!("Redeem code {} is now {:?}", record.code, record.status);
    }

    let logs = logger.fetch_logs(current_timestamp_millis()?, "1h").await?;
    println!("Activity entries in the last hour: {}", logs.len());

    Ok(())
}
