mod backend;
mod base_url;
mod error;
mod retry;

pub use backend::{
    create_backend, create_backend_from_profile, BackendOptions, GeminiBackend,
    OpenAiCompatibleBackend,
};
pub use base_url::normalize_base_url;
pub use error::AdapterError;
pub use retry::{call_with_retry, RetryConfig};

pub use drama_core::{CancelToken, Config, ConfigStore, GenerationConfig, LlmConfig};
