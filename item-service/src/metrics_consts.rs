pub const ITEMS_PUBLISHED: &str = "item_service_items_published_total";
pub const ITEMS_CREATED: &str = "item_service_items_created_total";
pub const ITEM_REQUESTS_REJECTED: &str = "item_service_requests_rejected_total";
pub const HTTP_REQUESTS: &str = "item_service_http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "item_service_http_request_duration_seconds";
