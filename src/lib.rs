pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod grpc;
pub mod http;
pub mod jobs;
pub mod logs;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("labqueue");
}
