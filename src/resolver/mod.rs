//! Resolution of search terms and videos through the external media helper

pub mod cache;
pub mod credentials;
pub mod extractor;
pub mod helper;
pub mod search;

pub use cache::{CacheStats, TtlCache};
pub use credentials::{is_credential_invalid, CredentialState, CredentialedHelper};
pub use extractor::{ExtractorConfig, StreamExtractor};
pub use helper::{HelperError, HelperInvocation, HelperOutput, MediaHelper, ProcessHelper};
pub use search::{SearchConfig, SearchResolver};
