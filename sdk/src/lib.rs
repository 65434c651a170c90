pub mod service;

pub use service::{Acknowledgement, CacheScope, MnemoService, ServiceError};
