//! Account and API key repository.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Account, ApiKey, NewAccount, NewApiKey};
use crate::schema::{accounts, api_keys};

pub const KEY_PREFIX: &str = "rslive_v1_";
const KEY_RANDOM_BYTES: usize = 24;
const LABEL_MAX_CHARS: usize = 30;
const INDICATOR_EDGE_CHARS: usize = 5;

/// Default subscription balance for a plan.
pub fn plan_default_tokens(plan_name: &str) -> i64 {
    match plan_name {
        "Free" => 1_000,
        "Pro" => 50_000,
        "Enterprise" => 500_000,
        _ => 1_000,
    }
}

/// SHA-256 of the plaintext key, hex-encoded. The plaintext itself is never
/// stored.
pub fn hash_key(plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn create_account(
    conn: &mut SqliteConnection,
    email: &str,
    plan_name: Option<&str>,
    token_remaining: Option<i64>,
    topup_remaining: Option<i64>,
) -> QueryResult<Account> {
    let plan = plan_name.unwrap_or("Free");
    let now = Utc::now().naive_utc();
    let new_account = NewAccount {
        id: Uuid::new_v4().to_string(),
        email: email.to_string(),
        plan_name: plan.to_string(),
        token_remaining: token_remaining.unwrap_or_else(|| plan_default_tokens(plan)),
        topup_remaining: topup_remaining.unwrap_or(0),
        status: 1,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(accounts::table)
        .values(&new_account)
        .get_result(conn)
}

pub fn get_account(conn: &mut SqliteConnection, id: &str) -> QueryResult<Option<Account>> {
    accounts::table.find(id).first(conn).optional()
}

/// A freshly minted API key. The plaintext exists only in this value; after
/// it is shown to the caller, validation works from the hash alone.
#[derive(Debug)]
pub struct CreatedApiKey {
    pub key: ApiKey,
    pub plaintext: String,
}

pub fn create_api_key(
    conn: &mut SqliteConnection,
    account_id: &str,
    label: &str,
    expires_at: Option<NaiveDateTime>,
) -> QueryResult<CreatedApiKey> {
    let mut random = [0u8; KEY_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut random);
    let plaintext = format!("{KEY_PREFIX}{}", hex::encode(random));

    let new_key = NewApiKey {
        key_hash: hash_key(&plaintext),
        account_id: account_id.to_string(),
        key_indicator: key_indicator(&plaintext),
        label: label.trim().chars().take(LABEL_MAX_CHARS).collect(),
        created_at: Utc::now().naive_utc(),
        expires_at,
    };
    let key: ApiKey = diesel::insert_into(api_keys::table)
        .values(&new_key)
        .get_result(conn)?;

    Ok(CreatedApiKey { key, plaintext })
}

/// Short prefix+suffix form shown in dashboards instead of the key itself.
fn key_indicator(plaintext: &str) -> String {
    // Keys are ASCII (fixed prefix plus hex), so byte slicing is safe.
    format!(
        "{}...{}",
        &plaintext[..INDICATOR_EDGE_CHARS],
        &plaintext[plaintext.len() - INDICATOR_EDGE_CHARS..]
    )
}

/// Looks up an active key by the hash of the presented plaintext. A key is
/// active while its expiry is null or strictly in the future.
pub fn validate_api_key(
    conn: &mut SqliteConnection,
    plain: &str,
) -> QueryResult<Option<ApiKey>> {
    let now = Utc::now().naive_utc();
    api_keys::table
        .filter(api_keys::key_hash.eq(hash_key(plain)))
        .filter(
            api_keys::expires_at
                .is_null()
                .or(api_keys::expires_at.gt(now)),
        )
        .first(conn)
        .optional()
}

/// Expires a key immediately. Returns whether a row was affected.
pub fn revoke_api_key(conn: &mut SqliteConnection, key_hash: &str) -> QueryResult<bool> {
    let affected = diesel::update(api_keys::table.find(key_hash))
        .set(api_keys::expires_at.eq(Utc::now().naive_utc()))
        .execute(conn)?;
    Ok(affected > 0)
}

/// Combined balance, or zero when the account does not exist.
pub fn get_credits(conn: &mut SqliteConnection, account_id: &str) -> QueryResult<i64> {
    let balances: Option<(i64, i64)> = accounts::table
        .find(account_id)
        .select((accounts::token_remaining, accounts::topup_remaining))
        .first(conn)
        .optional()?;
    Ok(balances.map(|(token, topup)| token + topup).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_create_account_plan_defaults() {
        let pool = db::test_pool();
        let mut conn = pool.get().unwrap();

        let free = create_account(&mut conn, "free@example.com", None, None, None).unwrap();
        assert_eq!(free.plan_name, "Free");
        assert_eq!(free.token_remaining, 1_000);
        assert_eq!(free.topup_remaining, 0);
        assert_eq!(free.status, 1);

        let pro = create_account(&mut conn, "pro@example.com", Some("Pro"), None, None).unwrap();
        assert_eq!(pro.token_remaining, 50_000);

        let ent =
            create_account(&mut conn, "ent@example.com", Some("Enterprise"), None, None).unwrap();
        assert_eq!(ent.token_remaining, 500_000);

        let custom =
            create_account(&mut conn, "c@example.com", Some("Startup"), Some(77), Some(5))
                .unwrap();
        assert_eq!(custom.token_remaining, 77);
        assert_eq!(custom.topup_remaining, 5);
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let pool = db::test_pool();
        let mut conn = pool.get().unwrap();

        create_account(&mut conn, "dup@example.com", None, None, None).unwrap();
        assert!(create_account(&mut conn, "dup@example.com", None, None, None).is_err());
    }

    #[test]
    fn test_api_key_shape_and_validation() {
        let pool = db::test_pool();
        let mut conn = pool.get().unwrap();
        let account = create_account(&mut conn, "keys@example.com", None, None, None).unwrap();

        let created = create_api_key(&mut conn, &account.id, "laptop", None).unwrap();
        assert!(created.plaintext.starts_with(KEY_PREFIX));
        assert_eq!(created.plaintext.len(), KEY_PREFIX.len() + KEY_RANDOM_BYTES * 2);
        assert_eq!(created.key.key_hash, hash_key(&created.plaintext));
        assert_eq!(created.key.key_hash.len(), 64);
        assert!(created.key.key_indicator.starts_with("rsliv"));
        assert!(created.key.key_indicator.contains("..."));

        let found = validate_api_key(&mut conn, &created.plaintext).unwrap();
        assert_eq!(found.unwrap().account_id, account.id);

        assert!(validate_api_key(&mut conn, "rslive_v1_not_a_real_key")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_label_truncated_to_thirty_chars() {
        let pool = db::test_pool();
        let mut conn = pool.get().unwrap();
        let account = create_account(&mut conn, "label@example.com", None, None, None).unwrap();

        let long_label = "x".repeat(48);
        let created = create_api_key(&mut conn, &account.id, &long_label, None).unwrap();
        assert_eq!(created.key.label.chars().count(), 30);
    }

    #[test]
    fn test_revoked_key_no_longer_validates() {
        let pool = db::test_pool();
        let mut conn = pool.get().unwrap();
        let account = create_account(&mut conn, "revoke@example.com", None, None, None).unwrap();
        let created = create_api_key(&mut conn, &account.id, "ci", None).unwrap();

        assert!(revoke_api_key(&mut conn, &created.key.key_hash).unwrap());
        assert!(validate_api_key(&mut conn, &created.plaintext)
            .unwrap()
            .is_none());

        assert!(!revoke_api_key(&mut conn, "deadbeef").unwrap());
    }

    #[test]
    fn test_expired_key_is_inactive() {
        let pool = db::test_pool();
        let mut conn = pool.get().unwrap();
        let account = create_account(&mut conn, "exp@example.com", None, None, None).unwrap();

        let past = Utc::now().naive_utc() - chrono::Duration::hours(1);
        let created = create_api_key(&mut conn, &account.id, "old", Some(past)).unwrap();
        assert!(validate_api_key(&mut conn, &created.plaintext)
            .unwrap()
            .is_none());

        let future = Utc::now().naive_utc() + chrono::Duration::hours(1);
        let created = create_api_key(&mut conn, &account.id, "fresh", Some(future)).unwrap();
        assert!(validate_api_key(&mut conn, &created.plaintext)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_get_credits_sums_balances_and_defaults_to_zero() {
        let pool = db::test_pool();
        let mut conn = pool.get().unwrap();
        let account =
            create_account(&mut conn, "cr@example.com", None, Some(900), Some(100)).unwrap();

        assert_eq!(get_credits(&mut conn, &account.id).unwrap(), 1_000);
        assert_eq!(get_credits(&mut conn, "missing-account").unwrap(), 0);
    }
}
