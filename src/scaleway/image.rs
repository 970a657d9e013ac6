//! Image resolution for new machines.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use crate::error::DriverError;

use super::ScalewayBackend;
use super::error::{self, Target};

/// Label, architecture and scope used to pick an image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct ImageQuery<'a> {
    pub(super) label: &'a str,
    pub(super) arch: &'a str,
    pub(super) zone: &'a str,
    pub(super) project_id: &'a str,
    pub(super) organisation_id: Option<&'a str>,
}

impl ImageQuery<'_> {
    fn not_found(&self) -> DriverError {
        DriverError::Configuration(format!(
            "image '{}' (arch {}) not found in zone {}",
            self.label, self.arch, self.zone
        ))
    }
}

impl ScalewayBackend {
    /// Prefers project images and falls back to public ones.
    pub(super) async fn resolve_image_id(
        &self,
        query: &ImageQuery<'_>,
    ) -> Result<String, DriverError> {
        let lookup_failed = |err: scaleway_rs::ScalewayError| {
            error::from_sdk(&err, Target::new("image", query.label))
        };
        self.resolve_image_id_with(
            query,
            || async {
                let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), query.zone)
                    .public(true)
                    .project(query.project_id)
                    .name(query.label)
                    .arch(query.arch);
                if let Some(org) = query.organisation_id {
                    scoped = scoped.organization(org);
                }
                scoped.run_async().await.map_err(lookup_failed)
            },
            || async {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), query.zone)
                    .public(true)
                    .name(query.label)
                    .arch(query.arch)
                    .run_async()
                    .await
                    .map_err(lookup_failed)
            },
        )
        .await
    }

    pub(super) async fn resolve_image_id_with<FutA, FutB, FetchA, FetchB>(
        &self,
        query: &ImageQuery<'_>,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<String, DriverError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, DriverError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, DriverError>>,
    {
        let project_images = filter_images(project_fetch().await?, query);
        let candidates = if project_images.is_empty() {
            filter_images(public_fetch().await?, query)
        } else {
            project_images
        };
        select_newest(candidates).ok_or_else(|| query.not_found())
    }
}

fn filter_images(images: Vec<ScalewayImage>, query: &ImageQuery<'_>) -> Vec<ScalewayImage> {
    images
        .into_iter()
        .filter(|image| image.arch == query.arch)
        .filter(|image| image.state == "available")
        .collect()
}

fn select_newest(mut candidates: Vec<ScalewayImage>) -> Option<String> {
    candidates.sort_by(|lhs, rhs| rhs.creation_date.cmp(&lhs.creation_date));
    candidates.into_iter().next().map(|image| image.id)
}
