//! Kafka Connect clusters built on OpenShift with Source-to-Image
//!
//! The builder image is imported into a source ImageStream, a BuildConfig
//! layers user plugins on top of it into the target ImageStream, and a
//! DeploymentConfig rolls workers out whenever the target image changes.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;
use serde_json::json;

use kestrel_common::{AssemblyType, Result};

use super::connect::{self, connect_name, metrics_name};
use super::{metrics_config_map, to_dynamic, AssemblyModel, AssemblyModelBuilder, DesiredResource};
use crate::config::DefaultImages;
use crate::resource::ResourceKind;

const TARGET_TAG: &str = "latest";

/// Name of the ImageStream holding the builder image
pub fn source_image_stream_name(cluster: &str) -> String {
    format!("{}-connect-source", cluster)
}

/// Builds Kafka Connect S2I cluster resources
pub struct ConnectS2IModelBuilder {
    images: DefaultImages,
}

impl ConnectS2IModelBuilder {
    /// Builder using `images` when the configuration names none
    pub fn new(images: DefaultImages) -> Self {
        Self { images }
    }

    fn source_tag(model: &AssemblyModel) -> &str {
        model.source_image_tag.as_deref().unwrap_or(TARGET_TAG)
    }

    fn source_image_stream(&self, model: &AssemblyModel) -> Result<DynamicObject> {
        let name = source_image_stream_name(&model.cluster);
        to_dynamic(json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "ImageStream",
            "metadata": model.metadata(&name),
            "spec": {
                "lookupPolicy": { "local": false },
                "tags": [{
                    "name": Self::source_tag(model),
                    "from": { "kind": "DockerImage", "name": model.image },
                    "importPolicy": { "scheduled": true },
                    "referencePolicy": { "type": "Source" },
                }],
            },
        }))
    }

    fn target_image_stream(&self, model: &AssemblyModel) -> Result<DynamicObject> {
        let name = connect_name(&model.cluster);
        to_dynamic(json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "ImageStream",
            "metadata": model.metadata(&name),
            "spec": { "lookupPolicy": { "local": true } },
        }))
    }

    fn build_config(&self, model: &AssemblyModel) -> Result<DynamicObject> {
        let name = connect_name(&model.cluster);
        to_dynamic(json!({
            "apiVersion": "build.openshift.io/v1",
            "kind": "BuildConfig",
            "metadata": model.metadata(&name),
            "spec": {
                "runPolicy": "Serial",
                "source": { "type": "Binary", "binary": {} },
                "strategy": {
                    "type": "Source",
                    "sourceStrategy": {
                        "from": {
                            "kind": "ImageStreamTag",
                            "name": format!(
                                "{}:{}",
                                source_image_stream_name(&model.cluster),
                                Self::source_tag(model)
                            ),
                        },
                    },
                },
                "output": {
                    "to": {
                        "kind": "ImageStreamTag",
                        "name": format!("{}:{}", name, TARGET_TAG),
                    },
                },
                "triggers": [
                    { "type": "ConfigChange" },
                    { "type": "ImageChange", "imageChange": {} },
                ],
            },
        }))
    }

    fn deployment_config(&self, model: &AssemblyModel) -> Result<DynamicObject> {
        let name = connect_name(&model.cluster);
        let image = format!("{}:{}", name, TARGET_TAG);
        to_dynamic(json!({
            "apiVersion": "apps.openshift.io/v1",
            "kind": "DeploymentConfig",
            "metadata": model.metadata(&name),
            "spec": {
                "replicas": model.replicas,
                "selector": connect::selector(model).to_map(),
                "template": connect::pod_template(model, &image),
                "triggers": [
                    { "type": "ConfigChange" },
                    {
                        "type": "ImageChange",
                        "imageChangeParams": {
                            "automatic": true,
                            "containerNames": ["kafka-connect"],
                            "from": { "kind": "ImageStreamTag", "name": image },
                        },
                    },
                ],
            },
        }))
    }
}

impl AssemblyModelBuilder for ConnectS2IModelBuilder {
    fn assembly_type(&self) -> AssemblyType {
        AssemblyType::ConnectS2I
    }

    fn workload(&self, cluster: &str) -> (ResourceKind, String) {
        (ResourceKind::DeploymentConfig, connect_name(cluster))
    }

    fn from_config(&self, config: &ConfigMap) -> Result<AssemblyModel> {
        connect::parse(config, AssemblyType::ConnectS2I, &self.images.connect_s2i)
    }

    fn from_live_resource(
        &self,
        namespace: &str,
        cluster: &str,
        workload: &DynamicObject,
    ) -> Result<AssemblyModel> {
        // Workers run the built image; the builder image is not recoverable
        let model = connect::parse_live(namespace, cluster, AssemblyType::ConnectS2I, workload)?;
        Ok(AssemblyModel {
            image: self.images.connect_s2i.clone(),
            source_image_tag: Some(TARGET_TAG.to_string()),
            ..model
        })
    }

    fn generate_desired(&self, model: &AssemblyModel) -> Result<Vec<DesiredResource>> {
        let cluster = &model.cluster;
        let name = connect_name(cluster);
        Ok(vec![
            DesiredResource::present(ResourceKind::Service, &name, connect::service(model)?),
            metrics_config_map(model, &metrics_name(cluster))?,
            DesiredResource::present(
                ResourceKind::ImageStream,
                source_image_stream_name(cluster),
                self.source_image_stream(model)?,
            ),
            DesiredResource::present(
                ResourceKind::ImageStream,
                &name,
                self.target_image_stream(model)?,
            ),
            DesiredResource::present(ResourceKind::BuildConfig, &name, self.build_config(model)?),
            DesiredResource::present(
                ResourceKind::DeploymentConfig,
                &name,
                self.deployment_config(model)?,
            ),
        ])
    }

    fn managed_resources(&self, cluster: &str) -> Vec<(ResourceKind, String)> {
        vec![
            (ResourceKind::Service, connect_name(cluster)),
            (ResourceKind::ConfigMap, metrics_name(cluster)),
            (ResourceKind::BuildConfig, connect_name(cluster)),
            (ResourceKind::ImageStream, source_image_stream_name(cluster)),
            (ResourceKind::ImageStream, connect_name(cluster)),
            (ResourceKind::DeploymentConfig, connect_name(cluster)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kestrel_common::Labels;

    fn config(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                namespace: Some("test".to_string()),
                labels: Some(
                    Labels::for_type(AssemblyType::ConnectS2I)
                        .with_kind()
                        .to_map(),
                ),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn builder() -> ConnectS2IModelBuilder {
        ConnectS2IModelBuilder::new(DefaultImages::default())
    }

    #[test]
    fn generates_build_pipeline() {
        let model = builder()
            .from_config(&config(&[(connect::keys::S2I_SOURCE_TAG, "1.0")]))
            .expect("valid");
        let desired = builder().generate_desired(&model).expect("generated");
        let names: Vec<(ResourceKind, &str)> =
            desired.iter().map(|d| (d.kind, d.name.as_str())).collect();
        assert_eq!(
            names,
            vec![
                (ResourceKind::Service, "foo-connect"),
                (ResourceKind::ConfigMap, "foo-connect-metrics-config"),
                (ResourceKind::ImageStream, "foo-connect-source"),
                (ResourceKind::ImageStream, "foo-connect"),
                (ResourceKind::BuildConfig, "foo-connect"),
                (ResourceKind::DeploymentConfig, "foo-connect"),
            ]
        );

        let build = desired[4].object.as_ref().expect("build config");
        assert_eq!(
            build.data["spec"]["strategy"]["sourceStrategy"]["from"]["name"],
            json!("foo-connect-source:1.0")
        );
        let source = desired[2].object.as_ref().expect("source stream");
        assert_eq!(
            source.data["spec"]["tags"][0]["from"]["name"],
            json!("kestrel/kafka-connect-s2i:latest")
        );
    }

    #[test]
    fn source_tag_defaults_to_latest() {
        let model = builder().from_config(&config(&[])).expect("valid");
        assert_eq!(model.source_image_tag.as_deref(), Some("latest"));
    }

    #[test]
    fn managed_resources_cover_every_kind() {
        let managed = builder().managed_resources("foo");
        assert_eq!(managed.len(), 6);
        assert!(managed.contains(&(ResourceKind::ImageStream, "foo-connect-source".to_string())));
        assert!(managed.contains(&(ResourceKind::BuildConfig, "foo-connect".to_string())));
    }

    #[test]
    fn workload_is_deleted_last() {
        let managed = builder().managed_resources("foo");
        assert_eq!(managed.last(), Some(&builder().workload("foo")));
    }
}
