//! Virtual machine instance records and per-request channel types.
//!
//! [`VirtualMachineInstance`] mirrors the subset of the KubeVirt JSON encoding
//! the tunnel reads. Unknown fields are ignored so records fetched from a full
//! cluster API deserialize without loss of the parts we care about.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase reported by a running instance.
pub const PHASE_RUNNING: &str = "Running";

/// A virtual machine instance as stored in cluster state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineInstance {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(default)]
    pub domain: DomainSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    #[serde(default)]
    pub devices: Devices,
}

/// Device attachment flags. `None` means the field was absent from the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Devices {
    #[serde(
        rename = "autoattachVSOCK",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub autoattach_vsock: Option<bool>,
    #[serde(
        rename = "autoattachSerialConsole",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub autoattach_serial_console: Option<bool>,
    #[serde(
        rename = "autoattachGraphicsDevice",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub autoattach_graphics_device: Option<bool>,
}

/// Node-populated status fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(rename = "nodeName", default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    /// Context identifier assigned to the instance's VSOCK device.
    #[serde(rename = "VSOCKCID", default, skip_serializing_if = "Option::is_none")]
    pub vsock_cid: Option<u32>,
}

impl VirtualMachineInstance {
    /// Build a minimal record, mostly useful for tests and seeded stores.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                uid: None,
            },
            ..Self::default()
        }
    }

    pub fn instance_ref(&self) -> InstanceRef {
        InstanceRef::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == PHASE_RUNNING
    }

    /// Phase for error messages; an empty phase reads as `Pending`.
    pub fn phase(&self) -> &str {
        if self.status.phase.is_empty() {
            "Pending"
        } else {
            &self.status.phase
        }
    }
}

/// Namespace-qualified instance identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceRef {
    pub namespace: String,
    pub name: String,
}

impl InstanceRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Channel kinds the gateway can tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Vsock,
    Console,
    Vnc,
}

impl ChannelKind {
    /// Path segment used in both the public subresource URL and the agent call.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vsock => "vsock",
            Self::Console => "console",
            Self::Vnc => "vnc",
        }
    }

    /// Name of the active-connection gauge for this kind.
    #[must_use]
    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::Vsock => "kubevirt_vmi_vsock_active_connections",
            Self::Console => "kubevirt_vmi_console_active_connections",
            Self::Vnc => "kubevirt_vmi_vnc_active_connections",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel-specific request parameters, parsed from the query string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelParams {
    /// Target port inside the guest (VSOCK only).
    pub port: Option<u32>,
    /// Ask the agent to wrap the guest stream in TLS (VSOCK only).
    pub tls: bool,
}

/// One inbound tunnel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub instance: InstanceRef,
    pub kind: ChannelKind,
    pub params: ChannelParams,
}

impl ChannelRequest {
    pub fn new(namespace: &str, name: &str, kind: ChannelKind, params: ChannelParams) -> Self {
        Self {
            instance: InstanceRef::new(namespace, name),
            kind,
            params,
        }
    }
}
