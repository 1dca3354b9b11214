use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::pipeline::ModelRepository;
use crate::Settings;

/// Builds a model repository from pretrained weights.
pub trait Loader {
    type Repository: ModelRepository;

    fn load(settings: &Settings, api: Api) -> impl Future<Output = Result<Self::Repository>>
    where
        Self: Sized;
}
