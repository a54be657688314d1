use prometheus_client::{encoding::EncodeLabelSet, metrics::info::Info, registry::Registry};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct InfoLabels {
    service_name: String,
    version: String,
    build: String,
    instance_id: String,
}

impl From<crate::Info> for InfoLabels {
    fn from(info: crate::Info) -> Self {
        Self {
            service_name: info.service_name,
            version: info.version,
            build: info.build,
            instance_id: info.instance_id,
        }
    }
}

/// Process level metrics
pub struct Metrics;

impl Metrics {
    /// Register and construct Metrics
    pub fn register(info: crate::Info, registry: &mut Registry) -> Self {
        let sub_registry = registry.sub_registry_with_prefix("passport_one");

        let info: Info<InfoLabels> = Info::new(info.into());
        sub_registry.register("build", "Information about the passport one process", info);

        Self
    }
}
