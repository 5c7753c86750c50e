//! gRPC transport clients for the REAPI services this crate uses

pub mod bytestream;
pub mod cas;
pub mod channel;

pub use bytestream::ByteStreamClient;
pub use cas::CasClient;
pub use channel::{AuthInterceptor, GrpcChannel};
