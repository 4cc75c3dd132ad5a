//! Session blob repository.
//!
//! Rows are keyed `(account_id, session_id, kind)` where `SESSION` holds the
//! upstream-compatible session-update payload and `CONV` holds accumulated
//! speaker-tagged conversation text. Either kind may exist without the
//! other.

use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel::upsert::excluded;

use crate::models::NewSessionRow;
use crate::repo::accounts::hash_key;
use crate::schema::{accounts, api_keys, sessions};

pub const KIND_SESSION: &str = "SESSION";
pub const KIND_CONV: &str = "CONV";

/// One row of the authenticated load join. `kind`/`data` are `None` when
/// the key is valid but the session has no stored rows yet.
#[derive(Debug, Clone)]
pub struct SessionHit {
    pub account_id: String,
    pub token_remaining: i64,
    pub topup_remaining: i64,
    pub kind: Option<String>,
    pub data: Option<String>,
}

/// Authenticates by hashed key and loads the session's rows in one query.
///
/// The sessions side is a LEFT JOIN on purpose: a valid key with no stored
/// session must still come back with the account's credit columns. Zero
/// rows therefore always means the key itself is invalid or expired.
pub fn load_session_by_key_and_id(
    conn: &mut SqliteConnection,
    api_key_plain: &str,
    session_id: &str,
) -> QueryResult<Vec<SessionHit>> {
    let now = Utc::now().naive_utc();
    let rows: Vec<(String, i64, i64, Option<String>, Option<String>)> = api_keys::table
        .inner_join(accounts::table)
        .left_join(
            sessions::table.on(sessions::account_id
                .eq(accounts::id)
                .and(sessions::session_id.eq(session_id))),
        )
        .filter(api_keys::key_hash.eq(hash_key(api_key_plain)))
        .filter(
            api_keys::expires_at
                .is_null()
                .or(api_keys::expires_at.gt(now)),
        )
        .select((
            accounts::id,
            accounts::token_remaining,
            accounts::topup_remaining,
            sessions::kind.nullable(),
            sessions::data.nullable(),
        ))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(
            |(account_id, token_remaining, topup_remaining, kind, data)| SessionHit {
                account_id,
                token_remaining,
                topup_remaining,
                kind,
                data,
            },
        )
        .collect())
}

/// Stores or replaces the SESSION row.
pub fn upsert_session(
    conn: &mut SqliteConnection,
    account_id: &str,
    session_id: &str,
    session_data: &str,
) -> QueryResult<usize> {
    diesel::insert_into(sessions::table)
        .values(&NewSessionRow {
            account_id,
            session_id,
            kind: KIND_SESSION,
            data: session_data,
            created_at: Utc::now().naive_utc(),
        })
        .on_conflict((
            sessions::account_id,
            sessions::session_id,
            sessions::kind,
        ))
        .do_update()
        .set(sessions::data.eq(excluded(sessions::data)))
        .execute(conn)
}

/// Appends to the CONV row, creating it when absent.
pub fn append_conversation(
    conn: &mut SqliteConnection,
    account_id: &str,
    session_id: &str,
    conversation_data: &str,
) -> QueryResult<usize> {
    diesel::insert_into(sessions::table)
        .values(&NewSessionRow {
            account_id,
            session_id,
            kind: KIND_CONV,
            data: conversation_data,
            created_at: Utc::now().naive_utc(),
        })
        .on_conflict((
            sessions::account_id,
            sessions::session_id,
            sessions::kind,
        ))
        .do_update()
        .set(sessions::data.eq(sessions::data.concat(excluded(sessions::data))))
        .execute(conn)
}

/// Replaces the CONV row's content (post-summarization). Returns the number
/// of rows touched; zero means the row disappeared in the meantime.
pub fn overwrite_conversation(
    conn: &mut SqliteConnection,
    account_id: &str,
    session_id: &str,
    content: &str,
) -> QueryResult<usize> {
    diesel::update(sessions::table.find((account_id, session_id, KIND_CONV)))
        .set(sessions::data.eq(content))
        .execute(conn)
}
