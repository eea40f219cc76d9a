pub mod api;
pub mod app;
pub mod config;
pub mod item;
pub mod metrics;
pub mod metrics_consts;
pub mod publisher;
pub mod rpc;
pub mod store;
pub mod subscriber;
pub mod telemetry;

#[allow(trivial_casts, trivial_numeric_casts, clippy::all)]
pub mod proto {
    tonic::include_proto!("item.v1");
}

#[cfg(test)]
mod test_utils;
