// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{ModelError, ModelRequest, ResponseUpdate};

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseUpdate, ModelError>> + Send>>;

/// The consumed model seam.  Wire-level clients live outside this workspace;
/// the runtime only ever sees this trait.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for diagnostics.
    fn name(&self) -> &str;

    /// Model identifier as reported to observers.
    fn model_name(&self) -> &str;

    /// Send a request and return a streaming response.
    ///
    /// Implementations must observe `cancel`: a canceled token terminates the
    /// stream with [`ModelError::Canceled`] at the next yield point.
    async fn generate_streaming(
        &self,
        req: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ModelError>;
}
