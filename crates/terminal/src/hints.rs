//! Install hints for the external multiplexer binary.

fn install_command_for_linux(
    has_debian: bool,
    has_redhat: bool,
    has_arch: bool,
    has_alpine: bool,
) -> &'static str {
    if has_debian {
        return "sudo apt install tmux";
    }
    if has_redhat {
        return "sudo dnf install tmux";
    }
    if has_arch {
        return "sudo pacman -S tmux";
    }
    if has_alpine {
        return "sudo apk add tmux";
    }
    "install tmux using your package manager"
}

/// Suggested install command for the host OS, when one is known.
pub fn tmux_install_hint() -> Option<&'static str> {
    if cfg!(windows) {
        return None;
    }
    if cfg!(target_os = "macos") {
        return Some("brew install tmux");
    }
    if cfg!(target_os = "linux") {
        return Some(install_command_for_linux(
            std::path::Path::new("/etc/debian_version").exists(),
            std::path::Path::new("/etc/redhat-release").exists(),
            std::path::Path::new("/etc/arch-release").exists(),
            std::path::Path::new("/etc/alpine-release").exists(),
        ));
    }
    Some("install tmux using your package manager")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_hint_prefers_debian() {
        assert_eq!(
            install_command_for_linux(true, true, false, false),
            "sudo apt install tmux"
        );
        assert_eq!(
            install_command_for_linux(false, true, false, false),
            "sudo dnf install tmux"
        );
        assert_eq!(
            install_command_for_linux(false, false, true, false),
            "sudo pacman -S tmux"
        );
        assert_eq!(
            install_command_for_linux(false, false, false, true),
            "sudo apk add tmux"
        );
        assert_eq!(
            install_command_for_linux(false, false, false, false),
            "install tmux using your package manager"
        );
    }
}
