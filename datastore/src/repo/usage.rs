//! Usage event log with atomic cascading credit deduction.

use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::models::NewUsageMetric;
use crate::schema::{accounts, usage_metrics};

/// Account balances after a debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebitOutcome {
    pub topup_remaining: i64,
    pub token_remaining: i64,
}

/// Records one usage event and debits the owning account in a single
/// transaction. The top-up balance drains to zero first; the remainder
/// comes out of the subscription balance, which may go negative. Any
/// failure rolls back both writes.
pub fn insert_usage(
    conn: &mut SqliteConnection,
    account_id: &str,
    session_id: &str,
    provider: &str,
    input_tokens: i64,
    output_tokens: i64,
) -> QueryResult<DebitOutcome> {
    conn.transaction(|conn| {
        let (mut topup, mut token): (i64, i64) = accounts::table
            .find(account_id)
            .select((accounts::topup_remaining, accounts::token_remaining))
            .first(conn)?;

        let mut remaining = input_tokens + output_tokens;
        if topup >= remaining {
            topup -= remaining;
            remaining = 0;
        } else {
            remaining -= topup;
            topup = 0;
        }
        if remaining > 0 {
            token -= remaining;
        }

        let now = Utc::now().naive_utc();
        diesel::insert_into(usage_metrics::table)
            .values(&NewUsageMetric {
                account_id,
                session_id,
                provider,
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
                created_at: now,
            })
            .execute(conn)?;

        diesel::update(accounts::table.find(account_id))
            .set((
                accounts::topup_remaining.eq(topup),
                accounts::token_remaining.eq(token),
                accounts::updated_at.eq(now),
            ))
            .execute(conn)?;

        Ok(DebitOutcome {
            topup_remaining: topup,
            token_remaining: token,
        })
    })
}
