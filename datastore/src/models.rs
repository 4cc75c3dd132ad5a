use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::accounts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Account {
    pub id: String,
    pub email: String,
    pub plan_name: String,
    pub token_remaining: i64,
    pub topup_remaining: i64,
    pub status: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::accounts)]
pub struct NewAccount {
    pub id: String,
    pub email: String,
    pub plan_name: String,
    pub token_remaining: i64,
    pub topup_remaining: i64,
    pub status: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::api_keys)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ApiKey {
    pub key_hash: String,
    pub account_id: String,
    pub key_indicator: String,
    pub label: String,
    pub created_at: NaiveDateTime,
    pub expires_at: Option<NaiveDateTime>,
    pub last_used_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::api_keys)]
pub struct NewApiKey {
    pub key_hash: String,
    pub account_id: String,
    pub key_indicator: String,
    pub label: String,
    pub created_at: NaiveDateTime,
    pub expires_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::sessions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SessionRow {
    pub account_id: String,
    pub session_id: String,
    pub kind: String,
    pub data: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::sessions)]
pub struct NewSessionRow<'a> {
    pub account_id: &'a str,
    pub session_id: &'a str,
    pub kind: &'a str,
    pub data: &'a str,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::usage_metrics)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UsageMetric {
    pub id: i64,
    pub account_id: String,
    pub session_id: String,
    pub provider: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::usage_metrics)]
pub struct NewUsageMetric<'a> {
    pub account_id: &'a str,
    pub session_id: &'a str,
    pub provider: &'a str,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub created_at: NaiveDateTime,
}
