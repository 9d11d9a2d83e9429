//! Reverse port forwarding for host-side test servers.
//!
//! Some tests talk to servers running on the host (an HTTP/2 server, a node
//! script-execution server). Their ports arrive as environment variables; each
//! one is made reachable from the device under the same port number.

use crate::device::DeviceSession;
use crate::error::{Error, Result};
use crate::remote::env::Environment;
use log::{debug, info};
use std::collections::BTreeSet;

/// Environment variables naming host ports the device must reach.
pub const FORWARDED_PORT_VARS: &[&str] = &["MOZHTTP2_PORT", "MOZNODE_EXEC_PORT"];

/// Tracks which ports have been reversed in this session.
///
/// adb errors when a forward is requested twice, so every port is set up at
/// most once.
#[derive(Debug, Default)]
pub struct PortForwardingManager {
    forwarded: BTreeSet<u16>,
}

impl PortForwardingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reverses every known port present in `env`. Returns the ports newly
    /// forwarded by this call.
    pub fn setup(&mut self, session: &DeviceSession, env: &Environment) -> Result<Vec<u16>> {
        let mut added = Vec::new();
        for var in FORWARDED_PORT_VARS {
            let Some(value) = env.get(var) else {
                continue;
            };
            let port: u16 = value.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be a TCP port number, got '{}'", var, value))
            })?;

            if self.forwarded.contains(&port) {
                debug!("Port {} is already reversed, skipping", port);
                continue;
            }

            let endpoint = format!("tcp:{}", port);
            session.reverse(&endpoint, &endpoint)?;
            self.forwarded.insert(port);
            info!("reversed {} connection for port {}", var, endpoint);
            added.push(port);
        }
        Ok(added)
    }

    pub fn is_forwarded(&self, port: u16) -> bool {
        self.forwarded.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ScriptedDevice;
    use crate::remote::env::EnvironmentBuilder;
    use std::rc::Rc;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let mut builder = EnvironmentBuilder::new();
        builder.extend(vars.iter().copied());
        builder.finalize()
    }

    #[test]
    fn test_forwards_present_ports() {
        let device = Rc::new(ScriptedDevice::new());
        let session = DeviceSession::new(Box::new(device.clone()), "/r");
        let mut ports = PortForwardingManager::new();

        let added = ports
            .setup(&session, &env(&[("MOZHTTP2_PORT", "8443"), ("MOZNODE_EXEC_PORT", "9999")]))
            .unwrap();

        assert_eq!(added, vec![8443, 9999]);
        assert_eq!(
            device.reversed(),
            vec![
                ("tcp:8443".to_string(), "tcp:8443".to_string()),
                ("tcp:9999".to_string(), "tcp:9999".to_string()),
            ]
        );
    }

    #[test]
    fn test_second_setup_is_skipped() {
        let device = Rc::new(ScriptedDevice::new());
        let session = DeviceSession::new(Box::new(device.clone()), "/r");
        let mut ports = PortForwardingManager::new();
        let env = env(&[("MOZHTTP2_PORT", "8443")]);

        ports.setup(&session, &env).unwrap();
        let added = ports.setup(&session, &env).unwrap();

        assert!(added.is_empty());
        assert!(ports.is_forwarded(8443));
        assert_eq!(device.reversed().len(), 1);
    }

    #[test]
    fn test_absent_ports_and_invalid_values() {
        let device = Rc::new(ScriptedDevice::new());
        let session = DeviceSession::new(Box::new(device.clone()), "/r");
        let mut ports = PortForwardingManager::new();

        assert!(ports.setup(&session, &env(&[("OTHER", "1")])).unwrap().is_empty());
        let err = ports
            .setup(&session, &env(&[("MOZNODE_EXEC_PORT", "http")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(device.reversed().is_empty());
    }
}
