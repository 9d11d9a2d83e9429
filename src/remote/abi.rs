//! Selection of the CPU ABI used for native libraries and the test process.

use crate::device::{DeviceSession, PROP_CPU_ABI, PROP_CPU_ABILIST};
use crate::error::{Error, Result};
use crate::remote::archive::{PackageArchive, NATIVE_LIB_PREFIX};
use log::{debug, info, warn};
use std::fmt;

/// The ABI chosen for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAbi(String);

impl SelectedAbi {
    pub fn new(abi: impl Into<String>) -> Self {
        Self(abi.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SelectedAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Picks an ABI from the device's candidates and the package's libraries.
///
/// Candidates are the primary ABI followed by the ABI-list entries. The
/// first candidate with at least one `lib/<candidate>/` entry wins. If none
/// matches, the ABI segment of the first native-library entry is used, and
/// with no native libraries at all the primary ABI stands.
pub fn choose_abi(primary: &str, abilist: Option<&str>, native_libs: &[String]) -> String {
    let mut candidates = vec![primary.to_string()];
    if let Some(list) = abilist {
        candidates.extend(
            list.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        );
    }
    debug!("ABI candidates: {:?}", candidates);

    for candidate in &candidates {
        let prefix = format!("{}{}/", NATIVE_LIB_PREFIX, candidate);
        if native_libs.iter().any(|n| n.starts_with(&prefix)) {
            return candidate.clone();
        }
    }

    info!("No device ABI matches the package's native libraries");
    match native_libs.first().and_then(|n| n.split('/').nth(1)) {
        Some(abi) if !abi.is_empty() => {
            warn!("Device CPU ABI not found in package, using ABI {} from package", abi);
            abi.to_string()
        }
        _ => primary.to_string(),
    }
}

/// Determines the session ABI by querying the device.
///
/// The primary ABI property is required; without it the harness cannot find
/// its preferences and crashes, so an empty answer after the retry budget is
/// fatal. The ABI list is only consulted when a package is deployed and may
/// stay empty.
pub fn select_abi(session: &DeviceSession, package: Option<&dyn PackageArchive>) -> Result<SelectedAbi> {
    let primary = session.require_property(PROP_CPU_ABI).map_err(|e| match e {
        Error::PropertyUnavailable(name) => {
            Error::Provisioning(format!("failed to get {} from device", name))
        }
        other => other,
    })?;

    let abi = match package {
        Some(package) => {
            let abilist = session.read_property(PROP_CPU_ABILIST)?;
            let native_libs = package.native_libraries();
            debug!("Package native libraries: {:?}", native_libs);
            choose_abi(&primary, abilist.as_deref(), &native_libs)
        }
        None => primary,
    };

    info!("Using abi {}.", abi);
    Ok(SelectedAbi::new(abi))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn libs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_primary_abi_wins_when_present() {
        let native = libs(&["lib/armeabi-v7a/libxul.so", "lib/arm64-v8a/libxul.so"]);
        assert_eq!(
            choose_abi("arm64-v8a", Some("arm64-v8a,armeabi-v7a"), &native),
            "arm64-v8a"
        );
    }

    #[test]
    fn test_first_matching_list_entry() {
        let native = libs(&["lib/armeabi-v7a/libxul.so"]);
        assert_eq!(
            choose_abi("arm64-v8a", Some("arm64-v8a,armeabi-v7a"), &native),
            "armeabi-v7a"
        );
    }

    #[test]
    fn test_list_order_decides_between_matches() {
        let native = libs(&["lib/x86/liba.so", "lib/armeabi-v7a/liba.so"]);
        assert_eq!(choose_abi("mips", Some("armeabi-v7a,x86"), &native), "armeabi-v7a");
        assert_eq!(choose_abi("mips", Some("x86,armeabi-v7a"), &native), "x86");
    }

    #[test]
    fn test_fallback_to_first_library_abi() {
        let native = libs(&["lib/x86_64/libxul.so", "lib/x86/libxul.so"]);
        assert_eq!(choose_abi("arm64-v8a", None, &native), "x86_64");
    }

    #[test]
    fn test_prefix_requires_full_segment() {
        // "arm64" must not match "lib/arm64-v8a/"
        let native = libs(&["lib/arm64-v8a/libxul.so"]);
        assert_eq!(choose_abi("arm64", Some(""), &native), "arm64-v8a");
    }

    #[test]
    fn test_no_libraries_keeps_primary() {
        assert_eq!(choose_abi("x86_64", Some("x86_64,x86"), &[]), "x86_64");
    }
}
