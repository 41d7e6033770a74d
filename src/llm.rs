//! LLM provider descriptors, the completion client, and the fallback chain.

pub mod chain;
pub mod client;
pub mod diagnostics;
pub mod params;
pub mod provider;
pub mod routing;
pub mod vision;

pub use chain::ProviderChain;
pub use client::{OpenAiCompatibleClient, ProviderClient};
pub use provider::{ProviderDescriptor, ProviderSet};
pub use routing::RetryPolicy;
