//! The annotation vocabulary recognized on Service objects.
//!
//! Missing keys are signalled as `None` (or the documented default for the
//! enum-valued keys); present-but-malformed values are reported as
//! [`AnnotationError::InvalidContent`] naming the key and the offending
//! value. Enum-valued keys are lenient: a value outside the recognized set
//! falls back to the default.

use log::debug;
use std::collections::BTreeMap as Map;

/// Selects the load-balancer class. Only services carrying
/// `CLASS_KEY: CLASS_VALUE` are handled by this controller.
pub const CLASS_KEY: &str = "kubernetes.io/loadbalancer-class";
pub const CLASS_VALUE: &str = "loadbalancer-lbex";

pub const ALGORITHM_KEY: &str = "loadbalancer.lbex/algorithm";
pub const METHOD_KEY: &str = "loadbalancer.lbex/method";
pub const HOST_KEY: &str = "loadbalancer.lbex/host";
pub const RESOLVER_KEY: &str = "loadbalancer.lbex/resolver";
pub const UPSTREAM_TYPE_KEY: &str = "loadbalancer.lbex/upstream-type";
pub const NODE_SET_KEY: &str = "loadbalancer.lbex/node-set";
pub const NODE_ADDRESS_TYPE_KEY: &str = "loadbalancer.lbex/node-address-type";
pub const IP_PASSTHROUGH_KEY: &str = "loadbalancer.lbex/ip-passthrough";
pub const SERVICE_POOL_KEY: &str = "loadbalancer.lbex/service-pool";

/// Listener ports are declared per service port as `port.<name>`.
pub const PORT_KEY_BASE: &str = "loadbalancer.lbex/port.";

/// Stand-in port name for the single unnamed port a service may have.
pub const UNNAMED_PORT: &str = "unnamed";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("annotation {key} does not contain a valid value ({value})")]
    InvalidContent { key: String, value: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConn,
    LeastTime,
}

/// Latency measurement for [`Algorithm::LeastTime`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub enum Method {
    #[default]
    Connect,
    FirstByte,
    LastByte,
}

impl Method {
    pub fn directive(&self) -> &'static str {
        match self {
            Method::Connect => "connect",
            Method::FirstByte => "first_byte",
            Method::LastByte => "last_byte",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub enum UpstreamType {
    #[default]
    Node,
    Pod,
    ClusterIP,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub enum NodeSet {
    /// Only nodes hosting at least one endpoint of the service.
    #[default]
    Host,
    /// Every schedulable node in the inventory.
    All,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub enum AddressType {
    #[default]
    Internal,
    External,
}

impl AddressType {
    pub fn is_external(&self) -> bool {
        matches!(self, AddressType::External)
    }
}

/// Read-only view over an object's annotation map.
#[derive(Clone, Copy)]
pub struct Annotations<'a>(&'a Map<String, String>);

impl<'a> Annotations<'a> {
    pub fn new(map: &'a Map<String, String>) -> Self {
        Self(map)
    }

    pub fn is_lbex_class(&self) -> bool {
        self.get(CLASS_KEY) == Some(CLASS_VALUE)
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).map(|v| v.as_str())
    }

    pub fn string(&self, key: &str) -> Option<&'a str> {
        self.get(key)
    }

    pub fn int(&self, key: &str) -> Result<Option<i32>, AnnotationError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value.parse() {
            Ok(n) => Ok(Some(n)),
            Err(_) => Err(AnnotationError::InvalidContent {
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>, AnnotationError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value.parse() {
            Ok(b) => Ok(Some(b)),
            Err(_) => Err(AnnotationError::InvalidContent {
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    fn enum_value<T: Default>(&self, key: &str, parse: fn(&str) -> Option<T>) -> T {
        match self.get(key) {
            None => T::default(),
            Some(value) => parse(value).unwrap_or_else(|| {
                debug!("annotation {key}: unrecognized value {value:?}, using default");
                T::default()
            }),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.enum_value(ALGORITHM_KEY, |v| match v {
            "round-robin" => Some(Algorithm::RoundRobin),
            "least-conn" => Some(Algorithm::LeastConn),
            "least-time" => Some(Algorithm::LeastTime),
            _ => None,
        })
    }

    pub fn method(&self) -> Method {
        self.enum_value(METHOD_KEY, |v| match v {
            "connect" => Some(Method::Connect),
            "first_byte" => Some(Method::FirstByte),
            "last_byte" => Some(Method::LastByte),
            _ => None,
        })
    }

    pub fn upstream_type(&self) -> UpstreamType {
        self.enum_value(UPSTREAM_TYPE_KEY, |v| match v {
            "node" => Some(UpstreamType::Node),
            "pod" => Some(UpstreamType::Pod),
            "cluster-ip" => Some(UpstreamType::ClusterIP),
            _ => None,
        })
    }

    pub fn node_set(&self) -> NodeSet {
        self.enum_value(NODE_SET_KEY, |v| match v {
            "host" => Some(NodeSet::Host),
            "all" => Some(NodeSet::All),
            _ => None,
        })
    }

    pub fn node_address_type(&self) -> AddressType {
        self.enum_value(NODE_ADDRESS_TYPE_KEY, |v| match v {
            "internal" => Some(AddressType::Internal),
            "external" => Some(AddressType::External),
            _ => None,
        })
    }

    pub fn resolver(&self) -> Option<&'a str> {
        self.get(RESOLVER_KEY)
    }

    pub fn host(&self) -> Option<&'a str> {
        self.get(HOST_KEY)
    }

    pub fn service_pool(&self) -> Option<&'a str> {
        self.get(SERVICE_POOL_KEY)
    }

    pub fn ip_passthrough(&self) -> Result<bool, AnnotationError> {
        Ok(self.bool(IP_PASSTHROUGH_KEY)?.unwrap_or(false))
    }

    /// The declared listener port for a service port. `port_name` must
    /// already be the [`UNNAMED_PORT`] sentinel for unnamed ports.
    pub fn listen_port(&self, port_name: &str) -> Result<Option<i32>, AnnotationError> {
        self.int(&format!("{PORT_KEY_BASE}{port_name}"))
    }
}
