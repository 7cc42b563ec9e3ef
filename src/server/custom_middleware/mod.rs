pub mod api_metrics_layer;
pub mod logging_layer;
pub mod timeout_layer;
