diesel::table! {
    couriers (id) {
        id -> Uuid,
        firstname -> Varchar,
        is_available -> Bool,
    }
}

diesel::table! {
    order_assignments (order_id) {
        order_id -> Uuid,
        courier_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(order_assignments -> couriers (courier_id));

diesel::allow_tables_to_appear_in_same_query!(couriers, order_assignments);
