diesel::table! {
    orders (id) {
        id -> Uuid,
        courier_id -> Nullable<Uuid>,
        customer_phone_number -> Varchar,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    order_validations (order_id) {
        order_id -> Uuid,
        courier_validated_at -> Nullable<Timestamptz>,
        courier_error -> Nullable<Text>,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(order_validations -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(orders, order_validations);
