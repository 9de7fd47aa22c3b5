use crate::container::Container;
use crate::options::{self, ContainerOption};
use std::time::Duration;
use testbed_shared_types::Result;

/// Redis. No per-test databases; tests share the instance.
#[derive(Debug, Clone)]
pub struct Redis {
    image: String,
}

impl Redis {
    pub const DEFAULT_IMAGE: &'static str = "redis:7-alpine";
    pub const PORT: &'static str = "6379";
    pub const READY_LOG: &'static str = "Ready to accept connections";

    pub fn new() -> Self {
        Self {
            image: Self::DEFAULT_IMAGE.to_string(),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn default_options(&self) -> ContainerOption {
        options::options([
            options::port(Self::PORT),
            options::wait_for_log(Self::READY_LOG, Duration::from_secs(10)),
        ])
    }

    /// `redis://host:port` for a container started with [`Redis::default_options`].
    pub async fn url(container: &Container) -> Result<String> {
        Ok(format!("redis://{}", container.endpoint(Self::PORT).await?))
    }
}

impl Default for Redis {
    fn default() -> Self {
        Self::new()
    }
}
