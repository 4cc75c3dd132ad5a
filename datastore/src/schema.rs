diesel::table! {
    accounts (id) {
        id -> Text,
        email -> Text,
        plan_name -> Text,
        token_remaining -> BigInt,
        topup_remaining -> BigInt,
        status -> Integer,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    api_keys (key_hash) {
        key_hash -> Text,
        account_id -> Text,
        key_indicator -> Text,
        label -> Text,
        created_at -> Timestamp,
        expires_at -> Nullable<Timestamp>,
        last_used_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    sessions (account_id, session_id, kind) {
        account_id -> Text,
        session_id -> Text,
        kind -> Text,
        data -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    usage_metrics (id) {
        id -> BigInt,
        account_id -> Text,
        session_id -> Text,
        provider -> Text,
        input_tokens -> BigInt,
        output_tokens -> BigInt,
        total_tokens -> BigInt,
        created_at -> Timestamp,
    }
}

diesel::joinable!(api_keys -> accounts (account_id));

diesel::allow_tables_to_appear_in_same_query!(accounts, api_keys, sessions, usage_metrics);
