//! Per-kind channel capabilities.
//!
//! Each [`DeviceChannel`] knows whether its device is attached to an instance
//! and which parameters the node agent needs to resolve it. The streamer
//! holds one generic pipeline and dispatches to these.

use std::collections::HashMap;

use crate::agent::DialError;
use crate::error::Rejection;
use crate::model::{ChannelKind, ChannelParams, VirtualMachineInstance};

/// What the node agent is asked to resolve: the channel kind plus its query
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub kind: ChannelKind,
    pub query: Vec<(&'static str, String)>,
}

impl DialTarget {
    fn bare(kind: ChannelKind) -> Self {
        Self {
            kind,
            query: Vec::new(),
        }
    }
}

/// Capability interface for one channel kind.
pub trait DeviceChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Decide whether the channel is usable on `vmi`. Never touches the network.
    fn validate(
        &self,
        vmi: &VirtualMachineInstance,
        params: &ChannelParams,
    ) -> Result<(), Rejection>;

    /// Parameters for the node agent's resolve call.
    fn dial_target(
        &self,
        vmi: &VirtualMachineInstance,
        params: &ChannelParams,
    ) -> Result<DialTarget, DialError>;
}

/// Socket-style guest/host channel.
pub struct VsockChannel;

impl DeviceChannel for VsockChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Vsock
    }

    fn validate(
        &self,
        vmi: &VirtualMachineInstance,
        params: &ChannelParams,
    ) -> Result<(), Rejection> {
        if vmi.spec.domain.devices.autoattach_vsock != Some(true) {
            return Err(Rejection::not_attached("VSOCK is not attached."));
        }
        if params.port.is_none() {
            return Err(Rejection::invalid_parameter("port must be specified"));
        }
        Ok(())
    }

    fn dial_target(
        &self,
        vmi: &VirtualMachineInstance,
        params: &ChannelParams,
    ) -> Result<DialTarget, DialError> {
        let cid = vmi
            .status
            .vsock_cid
            .ok_or_else(|| DialError::Unresolvable("instance has no VSOCK CID assigned".into()))?;
        let port = params
            .port
            .ok_or_else(|| DialError::Unresolvable("no target port".into()))?;
        Ok(DialTarget {
            kind: ChannelKind::Vsock,
            query: vec![
                ("cid", cid.to_string()),
                ("port", port.to_string()),
                ("tls", params.tls.to_string()),
            ],
        })
    }
}

/// Serial console.
pub struct ConsoleChannel;

impl DeviceChannel for ConsoleChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Console
    }

    fn validate(&self, vmi: &VirtualMachineInstance, _: &ChannelParams) -> Result<(), Rejection> {
        // Consoles are attached unless explicitly disabled.
        if vmi.spec.domain.devices.autoattach_serial_console == Some(false) {
            return Err(Rejection::not_attached("No serial consoles are present."));
        }
        Ok(())
    }

    fn dial_target(
        &self,
        _: &VirtualMachineInstance,
        _: &ChannelParams,
    ) -> Result<DialTarget, DialError> {
        Ok(DialTarget::bare(ChannelKind::Console))
    }
}

/// Graphical display.
pub struct VncChannel;

impl DeviceChannel for VncChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Vnc
    }

    fn validate(&self, vmi: &VirtualMachineInstance, _: &ChannelParams) -> Result<(), Rejection> {
        if vmi.spec.domain.devices.autoattach_graphics_device == Some(false) {
            return Err(Rejection::not_attached("No graphics devices are present."));
        }
        Ok(())
    }

    fn dial_target(
        &self,
        _: &VirtualMachineInstance,
        _: &ChannelParams,
    ) -> Result<DialTarget, DialError> {
        Ok(DialTarget::bare(ChannelKind::Vnc))
    }
}

/// Static capability for `kind`.
#[must_use]
pub fn for_kind(kind: ChannelKind) -> &'static dyn DeviceChannel {
    match kind {
        ChannelKind::Vsock => &VsockChannel,
        ChannelKind::Console => &ConsoleChannel,
        ChannelKind::Vnc => &VncChannel,
    }
}

/// Shared check run after the per-kind validation.
pub fn require_running(vmi: &VirtualMachineInstance) -> Result<(), Rejection> {
    if vmi.is_running() {
        return Ok(());
    }
    Err(Rejection::not_running(format!(
        "Unable to connect to VirtualMachineInstance because phase is {} instead of Running",
        vmi.phase()
    )))
}

/// Parse the raw query string parameters of a subresource request.
///
/// Unknown keys are ignored. `port` must be an unsigned 32-bit integer and
/// `tls` a boolean when present.
pub fn parse_params(query: &HashMap<String, String>) -> Result<ChannelParams, Rejection> {
    let port = match query.get("port").map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
            Rejection::invalid_parameter(format!("port parameter is invalid: {raw:?}"))
        })?),
    };
    let tls = match query.get("tls").map(String::as_str) {
        None | Some("") => false,
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            Rejection::invalid_parameter(format!("tls parameter is invalid: {raw:?}"))
        })?,
    };
    Ok(ChannelParams { port, tls })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionKind;

    fn running(vsock: Option<bool>) -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance::new("ns", "vm");
        vmi.spec.domain.devices.autoattach_vsock = vsock;
        vmi.status.phase = "Running".into();
        vmi.status.node_name = Some("node01".into());
        vmi.status.vsock_cid = Some(3);
        vmi
    }

    fn port(p: u32) -> ChannelParams {
        ChannelParams {
            port: Some(p),
            tls: false,
        }
    }

    #[test]
    fn test_vsock_requires_flag() {
        for flag in [None, Some(false)] {
            let err = VsockChannel.validate(&running(flag), &port(8888)).unwrap_err();
            assert_eq!(err.kind, RejectionKind::NotAttached);
            assert_eq!(err.message, "VSOCK is not attached.");
        }
        assert!(VsockChannel.validate(&running(Some(true)), &port(8888)).is_ok());
    }

    #[test]
    fn test_vsock_requires_port() {
        let err = VsockChannel
            .validate(&running(Some(true)), &ChannelParams::default())
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::InvalidParameter);
    }

    #[test]
    fn test_vsock_dial_target() {
        let target = VsockChannel
            .dial_target(&running(Some(true)), &port(8888))
            .unwrap();
        assert_eq!(target.kind, ChannelKind::Vsock);
        assert_eq!(
            target.query,
            vec![
                ("cid", "3".to_string()),
                ("port", "8888".to_string()),
                ("tls", "false".to_string()),
            ]
        );

        let mut no_cid = running(Some(true));
        no_cid.status.vsock_cid = None;
        assert!(matches!(
            VsockChannel.dial_target(&no_cid, &port(8888)),
            Err(DialError::Unresolvable(_))
        ));
    }

    #[test]
    fn test_console_and_vnc_default_to_attached() {
        let vmi = running(None);
        assert!(ConsoleChannel.validate(&vmi, &ChannelParams::default()).is_ok());
        assert!(VncChannel.validate(&vmi, &ChannelParams::default()).is_ok());

        let mut off = running(None);
        off.spec.domain.devices.autoattach_serial_console = Some(false);
        off.spec.domain.devices.autoattach_graphics_device = Some(false);
        assert_eq!(
            ConsoleChannel
                .validate(&off, &ChannelParams::default())
                .unwrap_err()
                .message,
            "No serial consoles are present."
        );
        assert_eq!(
            VncChannel
                .validate(&off, &ChannelParams::default())
                .unwrap_err()
                .message,
            "No graphics devices are present."
        );
    }

    #[test]
    fn test_require_running() {
        let mut vmi = running(Some(true));
        assert!(require_running(&vmi).is_ok());
        vmi.status.phase = "Scheduling".into();
        let err = require_running(&vmi).unwrap_err();
        assert_eq!(err.kind, RejectionKind::NotRunning);
        assert!(err.message.contains("phase is Scheduling"));
    }

    #[test]
    fn test_parse_params() {
        let mut query = HashMap::new();
        assert_eq!(parse_params(&query).unwrap(), ChannelParams::default());

        query.insert("port".to_string(), "8888".to_string());
        query.insert("tls".to_string(), "true".to_string());
        assert_eq!(
            parse_params(&query).unwrap(),
            ChannelParams {
                port: Some(8888),
                tls: true
            }
        );

        query.insert("port".to_string(), "-1".to_string());
        let err = parse_params(&query).unwrap_err();
        assert_eq!(err.kind, RejectionKind::InvalidParameter);
    }

    #[test]
    fn test_for_kind() {
        for kind in [ChannelKind::Vsock, ChannelKind::Console, ChannelKind::Vnc] {
            assert_eq!(for_kind(kind).kind(), kind);
        }
    }
}
