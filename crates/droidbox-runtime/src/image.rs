//! Android version to sandbox image mapping.

use droidbox_error::CommonError;

/// Android major versions this build can provision.
pub const SUPPORTED_VERSIONS: [&str; 4] = ["11", "12", "13", "14"];

/// Resolves an Android major version to its sandbox image reference.
///
/// # Errors
///
/// Returns [`CommonError::Unsupported`] for versions outside
/// [`SUPPORTED_VERSIONS`].
pub fn image_for_version(version: &str) -> Result<&'static str, CommonError> {
    match version {
        "11" => Ok("redroid/redroid:11.0.0-latest"),
        "12" => Ok("redroid/redroid:12.0.0-latest"),
        "13" => Ok("redroid/redroid:13.0.0-latest"),
        "14" => Ok("redroid/redroid:14.0.0-latest"),
        other => Err(CommonError::unsupported(format!(
            "android {other} (supported: {})",
            SUPPORTED_VERSIONS.join(", ")
        ))),
    }
}
