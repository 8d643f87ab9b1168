diesel::table! {
    blocks (height) {
        height -> Int8,
        block_hash -> Text,
        timestamp -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    block_transactions (tx_hash) {
        tx_hash -> Text,
        height -> Int8,
        payload -> Nullable<Text>,
    }
}

diesel::table! {
    gap_ranges (gap_id) {
        gap_id -> Int8,
        start_height -> Int8,
        end_height -> Int8,
        status -> Text,
        attempts -> Int4,
        next_retry_at -> Nullable<Int8>,
        last_error -> Nullable<Text>,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(block_transactions -> blocks (height));

diesel::allow_tables_to_appear_in_same_query!(blocks, block_transactions, gap_ranges);
