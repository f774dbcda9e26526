//! Elevated-privilege detection.

/// Whether the current process runs with administrator / root rights.
///
/// Writing the Windows proxy keys does not strictly need elevation, but some
/// locked-down machines refuse registry writes without it, so front ends use
/// this to warn early.
#[cfg(windows)]
pub async fn is_elevated() -> bool {
    use std::process::Stdio;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    // `net session` only succeeds for administrators.
    tokio::process::Command::new("net")
        .arg("session")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(unix)]
pub async fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(any(unix, windows)))]
pub async fn is_elevated() -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matches_effective_uid() {
        assert_eq!(is_elevated().await, nix::unistd::geteuid().as_raw() == 0);
    }
}
