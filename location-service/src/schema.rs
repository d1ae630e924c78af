diesel::table! {
    courier_latest_cord (courier_id, created_at) {
        courier_id -> Uuid,
        latitude -> Float8,
        longitude -> Float8,
        created_at -> Timestamptz,
    }
}
