//! Service body builder.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::object::{ObjectMeta, Resource};

/// Everything needed to render a Service the agent owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Expose through a load balancer instead of a cluster IP.
    pub external: bool,
    /// Service port to target port.
    pub ports: BTreeMap<u16, u16>,
    /// Pod labels the service routes to.
    pub selectors: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16, target_port: u16) -> Self {
        self.ports.insert(port, target_port);
        self
    }

    pub fn with_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selectors.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    pub fn service_type(&self) -> &'static str {
        if self.external {
            "LoadBalancer"
        } else {
            "ClusterIP"
        }
    }

    /// Render the Service object.
    pub fn to_resource(&self) -> Resource {
        let ports: Vec<Value> = self
            .ports
            .iter()
            .map(|(port, target_port)| {
                json!({
                    "name": format!("tcp-{port}"),
                    "protocol": "TCP",
                    "port": port,
                    "targetPort": target_port,
                })
            })
            .collect();

        let mut resource = Resource::new("v1", "Service", self.name.clone(), self.namespace.clone());
        resource.metadata = ObjectMeta {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            ..resource.metadata
        };
        resource.body.insert(
            "spec".to_string(),
            json!({
                "type": self.service_type(),
                "selector": self.selectors,
                "ports": ports,
            }),
        );
        resource
    }
}
