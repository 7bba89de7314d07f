#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod config;
pub mod envelope;
pub mod key_management;
pub mod output;
pub mod service;
pub mod types;


pub use config::ShroudConfidentialConfig;
pub use envelope::build_request;
pub use key_management::{derive_shared_secret, generate_keypair, SharedSecret, X25519KeyPair};
pub use service::{
    ComputationSubmitter, ConfidentialClient, ConfidentialClientError, PreparedRequest,
};
pub use types::{ComputationRequest, DecryptedResult, RequestState};
