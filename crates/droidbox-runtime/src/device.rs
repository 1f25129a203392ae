//! Device identity and resource limit descriptions.
//!
//! A [`DeviceProfile`] describes what the sandboxed Android build should
//! report about itself (manufacturer, model, fingerprint, identifiers) and
//! the display geometry. The profile expands into the environment variables
//! the sandbox image consumes at boot, including `ro.*` system properties
//! that flow into the Android property space.

use std::collections::{BTreeMap, HashMap};

use droidbox_error::CommonError;
use serde::{Deserialize, Serialize};

/// CPU quota denominator, in microseconds per scheduling period.
pub const CPU_PERIOD: i64 = 100_000;

/// The hardware identity a sandbox presents to apps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub manufacturer: String,
    pub model: String,
    /// Android release string reported by the build, e.g. `"13"`.
    pub android_version: String,
    pub api_level: u32,
    pub hardware: String,
    pub platform: String,
    pub build_fingerprint: String,
    pub android_id: String,
    pub imei: String,
    pub serial_number: String,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub fps: u32,
    /// Extra `ro.*` properties merged over the computed set.
    pub system_properties: HashMap<String, String>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            manufacturer: "Google".to_string(),
            model: "Pixel 7".to_string(),
            android_version: "13".to_string(),
            api_level: 33,
            hardware: "slider".to_string(),
            platform: "gs201".to_string(),
            build_fingerprint: String::new(),
            android_id: String::new(),
            imei: String::new(),
            serial_number: String::new(),
            width: 1080,
            height: 1920,
            dpi: 320,
            fps: 30,
            system_properties: HashMap::new(),
        }
    }
}

impl DeviceProfile {
    /// Computes the `ro.*` property set for this identity.
    ///
    /// Custom entries from `system_properties` override computed ones.
    #[must_use]
    pub fn system_properties(&self) -> BTreeMap<String, String> {
        let brand = self.manufacturer.to_lowercase();
        let device = self.model.to_lowercase().replace(' ', "_");

        let mut props = BTreeMap::new();
        props.insert("ro.product.manufacturer".into(), self.manufacturer.clone());
        props.insert("ro.product.brand".into(), brand);
        props.insert("ro.product.model".into(), self.model.clone());
        props.insert("ro.product.device".into(), device.clone());
        props.insert("ro.product.name".into(), device);
        props.insert(
            "ro.build.version.release".into(),
            self.android_version.clone(),
        );
        props.insert("ro.build.version.sdk".into(), self.api_level.to_string());
        props.insert("ro.hardware".into(), self.hardware.clone());
        props.insert("ro.board.platform".into(), self.platform.clone());
        if !self.build_fingerprint.is_empty() {
            props.insert("ro.build.fingerprint".into(), self.build_fingerprint.clone());
        }

        // Production-build posture so the sandbox does not look rooted.
        props.insert("ro.secure".into(), "1".into());
        props.insert("ro.debuggable".into(), "0".into());
        props.insert("ro.build.type".into(), "user".into());
        props.insert("ro.build.tags".into(), "release-keys".into());
        props.insert("ro.boot.veritymode".into(), "enforcing".into());
        props.insert("ro.boot.flash.locked".into(), "1".into());
        props.insert("ro.boot.verifiedbootstate".into(), "green".into());
        props.insert("ro.oem_unlock_supported".into(), "0".into());

        props.extend(
            self.system_properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        props
    }

    /// Expands the profile into the sandbox image's boot environment.
    #[must_use]
    pub fn build_environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("REDROID_WIDTH".into(), self.width.to_string());
        env.insert("REDROID_HEIGHT".into(), self.height.to_string());
        env.insert("REDROID_DPI".into(), self.dpi.to_string());
        env.insert("REDROID_FPS".into(), self.fps.to_string());
        env.insert("REDROID_GPU_MODE".into(), "guest".into());

        for (key, value) in self.system_properties() {
            env.insert(key, value);
        }

        if !self.android_id.is_empty() {
            env.insert("ANDROID_ID".into(), self.android_id.clone());
        }
        if !self.imei.is_empty() {
            env.insert("IMEI".into(), self.imei.clone());
        }
        if !self.serial_number.is_empty() {
            env.insert("SERIAL_NUMBER".into(), self.serial_number.clone());
        }
        env
    }
}

/// Compute and storage ceilings for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpus: f64,
    pub memory: String,
    pub storage: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 2.0,
            memory: "4G".to_string(),
            storage: "8G".to_string(),
        }
    }
}

impl ResourceLimits {
    /// Memory ceiling in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Config`] when the memory string is malformed.
    pub fn memory_bytes(&self) -> Result<u64, CommonError> {
        parse_memory_limit(&self.memory)
    }

    /// CPU quota in microseconds per [`CPU_PERIOD`].
    #[must_use]
    pub fn cpu_quota(&self) -> i64 {
        cpu_quota(self.cpus)
    }
}

/// Parses a memory limit string like `"4G"`, `"512M"`, or a plain byte count.
///
/// # Errors
///
/// Returns [`CommonError::Config`] for empty strings, unknown suffixes, or
/// non-numeric magnitudes.
pub fn parse_memory_limit(limit: &str) -> Result<u64, CommonError> {
    let trimmed = limit.trim();
    if trimmed.is_empty() {
        return Err(CommonError::config("empty memory limit"));
    }
    let (magnitude, multiplier) = match trimmed.chars().last() {
        Some('K' | 'k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M' | 'm') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        _ => {
            return Err(CommonError::config(format!(
                "unrecognized memory limit: {trimmed}"
            )))
        }
    };
    let value: u64 = magnitude
        .parse()
        .map_err(|_| CommonError::config(format!("unrecognized memory limit: {trimmed}")))?;
    Ok(value * multiplier)
}

/// Converts a fractional CPU count into a quota over [`CPU_PERIOD`].
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn cpu_quota(cpus: f64) -> i64 {
    #[allow(clippy::cast_precision_loss)]
    let quota = cpus * CPU_PERIOD as f64;
    quota as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_matches_pixel_7() {
        let profile = DeviceProfile::default();
        let props = profile.system_properties();
        assert_eq!(props["ro.product.manufacturer"], "Google");
        assert_eq!(props["ro.product.brand"], "google");
        assert_eq!(props["ro.product.model"], "Pixel 7");
        assert_eq!(props["ro.product.device"], "pixel_7");
        assert_eq!(props["ro.build.version.release"], "13");
        assert_eq!(props["ro.build.version.sdk"], "33");
        assert_eq!(props["ro.hardware"], "slider");
        assert_eq!(props["ro.board.platform"], "gs201");
    }

    #[test]
    fn production_posture_is_always_present() {
        let props = DeviceProfile::default().system_properties();
        assert_eq!(props["ro.secure"], "1");
        assert_eq!(props["ro.debuggable"], "0");
        assert_eq!(props["ro.build.type"], "user");
        assert_eq!(props["ro.build.tags"], "release-keys");
        assert_eq!(props["ro.boot.verifiedbootstate"], "green");
        assert_eq!(props["ro.oem_unlock_supported"], "0");
    }

    #[test]
    fn custom_properties_override_computed() {
        let mut profile = DeviceProfile::default();
        profile
            .system_properties
            .insert("ro.product.brand".into(), "samsung".into());
        profile
            .system_properties
            .insert("ro.custom.flag".into(), "on".into());
        let props = profile.system_properties();
        assert_eq!(props["ro.product.brand"], "samsung");
        assert_eq!(props["ro.custom.flag"], "on");
    }

    #[test]
    fn environment_includes_display_and_identifiers() {
        let profile = DeviceProfile {
            android_id: "a1b2c3d4e5f60718".to_string(),
            imei: "357240051111110".to_string(),
            ..DeviceProfile::default()
        };
        let env = profile.build_environment();
        assert_eq!(env["REDROID_WIDTH"], "1080");
        assert_eq!(env["REDROID_HEIGHT"], "1920");
        assert_eq!(env["REDROID_DPI"], "320");
        assert_eq!(env["REDROID_FPS"], "30");
        assert_eq!(env["REDROID_GPU_MODE"], "guest");
        assert_eq!(env["ro.product.model"], "Pixel 7");
        assert_eq!(env["ANDROID_ID"], "a1b2c3d4e5f60718");
        assert_eq!(env["IMEI"], "357240051111110");
        assert!(!env.contains_key("SERIAL_NUMBER"));
    }

    #[test]
    fn empty_fingerprint_is_omitted() {
        let props = DeviceProfile::default().system_properties();
        assert!(!props.contains_key("ro.build.fingerprint"));
    }

    #[test]
    fn memory_limits_parse() {
        assert_eq!(parse_memory_limit("4G").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256k").unwrap(), 256 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1_048_576);
    }

    #[test]
    fn malformed_memory_limit_is_config_error() {
        for bad in ["", "four gigs", "G", "12T"] {
            let err = parse_memory_limit(bad).unwrap_err();
            assert!(
                matches!(err, CommonError::Config(_)),
                "{bad:?} should be a config error"
            );
        }
    }

    #[test]
    fn cpu_quota_scales_with_period() {
        assert_eq!(cpu_quota(2.0), 200_000);
        assert_eq!(cpu_quota(0.5), 50_000);
        assert_eq!(ResourceLimits::default().cpu_quota(), 200_000);
    }
}
