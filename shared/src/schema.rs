diesel::table! {
    products (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        name -> Varchar,
        sku -> Varchar,
        price -> Numeric,
        total_quantity -> Int4,
        is_active -> Bool,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        reference -> Varchar,
        status -> Varchar,
        subtotal -> Numeric,
        delivery_fee -> Numeric,
        total -> Numeric,
        customer_name -> Varchar,
        customer_phone -> Varchar,
        delivery_type -> Varchar,
        table_number -> Nullable<Varchar>,
        notes -> Nullable<Text>,
        staff_notes -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        paid_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        cancelled_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        position -> Int4,
        product_id -> Uuid,
        product_name -> Varchar,
        sku -> Varchar,
        quantity -> Int4,
        unit_price -> Numeric,
        total_price -> Numeric,
    }
}

diesel::table! {
    inventory_reservations (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        order_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
        expires_at -> Timestamptz,
        released_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    payment_transactions (id) {
        id -> Uuid,
        order_id -> Uuid,
        gateway -> Varchar,
        external_transaction_id -> Nullable<Varchar>,
        external_order_id -> Varchar,
        amount -> Numeric,
        payment_type -> Nullable<Varchar>,
        transaction_status -> Varchar,
        fraud_status -> Nullable<Varchar>,
        raw_payload -> Jsonb,
        signature_verified -> Bool,
        idempotency_key -> Varchar,
        outcome -> Varchar,
        created_at -> Timestamptz,
        notification_received_at -> Nullable<Timestamptz>,
        settled_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    delivery_addresses (id) {
        id -> Uuid,
        order_id -> Uuid,
        address_text -> Text,
        latitude -> Float8,
        longitude -> Float8,
        serviceable -> Bool,
        zone -> Nullable<Varchar>,
        fee -> Numeric,
        distance_km -> Nullable<Float8>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    reconciliation_cases (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        order_id -> Uuid,
        payment_transaction_id -> Nullable<Uuid>,
        reason -> Varchar,
        details -> Jsonb,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Nullable<Bool>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(inventory_reservations -> orders (order_id));
diesel::joinable!(payment_transactions -> orders (order_id));
diesel::joinable!(delivery_addresses -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    orders,
    order_items,
    inventory_reservations,
    payment_transactions,
    delivery_addresses,
    reconciliation_cases,
    outbox_events,
);
