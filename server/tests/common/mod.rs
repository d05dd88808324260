#![allow(dead_code)]

pub mod mock_validator;
pub mod test_environment;

pub use mock_validator::MockTokenValidator;
pub use test_environment::{TestClient, TestEnvironment};

/// Macro to wrap test bodies with a timeout to prevent hanging tests
#[macro_export]
macro_rules! timeout_test {
    ($duration:expr, $body:expr) => {
        tokio::time::timeout($duration, $body)
            .await
            .map_err(|_| anyhow::anyhow!("Test timed out after {:?}", $duration))?
    };
}
