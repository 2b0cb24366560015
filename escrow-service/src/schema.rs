diesel::table! {
    users (id) {
        id -> Uuid,
        role -> Varchar,
        display_name -> Varchar,
        phone -> Nullable<Varchar>,
        email -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        buyer_id -> Uuid,
        seller_id -> Uuid,
        item_description -> Text,
        amount -> Numeric,
        currency -> Varchar,
        status -> Varchar,
        payment_method -> Varchar,
        proof_of_delivery -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    transactions (id) {
        id -> Uuid,
        order_id -> Uuid,
        user_id -> Nullable<Uuid>,
        provider -> Varchar,
        correlation_ref -> Varchar,
        provider_tx_id -> Nullable<Varchar>,
        kind -> Varchar,
        amount -> Numeric,
        status -> Varchar,
        description -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_events (id) {
        id -> Uuid,
        order_id -> Uuid,
        from_status -> Nullable<Varchar>,
        to_status -> Varchar,
        actor_id -> Nullable<Uuid>,
        actor_role -> Varchar,
        reason -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(transactions -> orders (order_id));
diesel::joinable!(order_events -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    orders,
    transactions,
    order_events,
    outbox_events,
);
