pub mod auth;
pub mod convert;
pub mod server;
pub mod worker_service;

pub use auth::TokenCheck;
pub use server::GrpcServer;
pub use worker_service::WorkerServiceImpl;
